//! Output tree (abstract binary tree) and the per-run node arena that builds it.
//!
//! Threads produce nodes out of order: a sized container is emitted into its parent
//! before its own content has been parsed. Nodes are therefore allocated in an arena
//! and linked by index; the finished tree is materialized once the scheduler drains.

use crate::ast::NodeId;
use crate::offset::Offset;
use crate::value::Value;

/// Index of a node inside one run's arena; doubles as the output node id.
pub type Slot = usize;

#[derive(Debug, Clone, PartialEq)]
pub struct AbtNode {
    pub id: usize,
    pub start: Offset,
    pub end: Offset,
    /// Display name: the label, then `: value` and ` (error)` suffixes.
    pub name: String,
    /// The instruction's ref, or `kind@id` when it has none.
    pub label: String,
    pub value: Option<Value>,
    pub error: Option<String>,
    pub children: Vec<AbtNode>,
    /// Grammar instruction this node was produced by.
    pub origin: NodeId,
}

impl AbtNode {
    /// Depth-first search by label (the name without value or error suffixes).
    pub fn find(&self, label: &str) -> Option<&AbtNode> {
        if self.label() == label {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(label))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len_bits(&self) -> i64 {
        self.end.to_bits() - self.start.to_bits()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AbtRoot {
    pub start: Offset,
    pub end: Offset,
    pub children: Vec<AbtNode>,
    /// Errors of every reporting thread, in the order they were recorded.
    pub errors: Vec<String>,
}

impl AbtRoot {
    pub fn find(&self, label: &str) -> Option<&AbtNode> {
        self.children.iter().find_map(|c| c.find(label))
    }

    /// Every node, depth-first.
    pub fn nodes(&self) -> Vec<&AbtNode> {
        fn collect<'a>(list: &'a [AbtNode], out: &mut Vec<&'a AbtNode>) {
            for n in list {
                out.push(n);
                collect(&n.children, out);
            }
        }
        let mut out = Vec::new();
        collect(&self.children, &mut out);
        out
    }
}

#[derive(Debug)]
struct Draft {
    start: Offset,
    end: Offset,
    name: String,
    label: String,
    value: Option<Value>,
    error: Option<String>,
    children: Vec<Slot>,
    origin: NodeId,
}

/// Where a thread delivers finished nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sink {
    Root,
    Children(Slot),
    /// Output of speculative repeat probes.
    Discard,
}

/// Per-run node arena; ids are sequential within one run.
#[derive(Debug, Default)]
pub struct NodeArena {
    drafts: Vec<Draft>,
    roots: Vec<Slot>,
}

impl NodeArena {
    pub fn new() -> Self {
        NodeArena::default()
    }

    pub fn alloc(&mut self, origin: NodeId, start: Offset, label: String) -> Slot {
        self.drafts.push(Draft {
            start,
            end: start,
            name: label.clone(),
            label,
            value: None,
            error: None,
            children: Vec::new(),
            origin,
        });
        self.drafts.len() - 1
    }

    pub fn set_end(&mut self, slot: Slot, end: Offset) {
        self.drafts[slot].end = end;
    }

    pub fn set_value(&mut self, slot: Slot, value: Value) {
        let d = &mut self.drafts[slot];
        d.name = format!("{}: {}", d.name, value);
        d.value = Some(value);
    }

    /// Appends the error to the node name and keeps the first one structured.
    pub fn annotate_error(&mut self, slot: Slot, message: &str) {
        let d = &mut self.drafts[slot];
        d.name = format!("{} ({})", d.name, message);
        if d.error.is_none() {
            d.error = Some(message.to_string());
        }
    }

    pub fn emit(&mut self, sink: Sink, slot: Slot) {
        match sink {
            Sink::Root => self.roots.push(slot),
            Sink::Children(parent) => self.drafts[parent].children.push(slot),
            Sink::Discard => {}
        }
    }

    pub fn len(&self) -> usize {
        self.drafts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }

    fn build(&self, slot: Slot) -> AbtNode {
        let d = &self.drafts[slot];
        AbtNode {
            id: slot,
            start: d.start,
            end: d.end,
            name: d.name.clone(),
            label: d.label.clone(),
            value: d.value.clone(),
            error: d.error.clone(),
            children: d.children.iter().map(|c| self.build(*c)).collect(),
            origin: d.origin,
        }
    }

    pub fn finish(&self, start: Offset, end: Offset, errors: Vec<String>) -> AbtRoot {
        AbtRoot {
            start,
            end,
            children: self.roots.iter().map(|s| self.build(*s)).collect(),
            errors,
        }
    }
}
