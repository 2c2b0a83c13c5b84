//! Hierarchical variable namespaces with deferred resolution.
//!
//! Every container and repeat in a grammar introduces a [`Scope`]; `if` blocks share
//! their parent's. Variables live in a scope under a *qualified* key,
//! `context + "." + name`, where the context is the requesting thread's path. A
//! variable that is not yet known can still be requested: the caller's listener is
//! parked in the scope's pending table and handed back, in registration order, by
//! [`ScopeTree::provide_variable`] once a value arrives.
//!
//! Listeners are plain data (`K`), not closures; whoever owns the tree decides how to
//! resume them.
//!
//! Repeat scopes are *iterated*: each iteration appends a segment to the context, so
//! the same field can be published once per iteration. Climbing out of such a scope
//! with `..` drops that segment again.

use crate::ast::{Grammar, Instruction, InstructionKind, NodeId};
use std::collections::{BTreeMap, HashMap};

pub type ScopeId = usize;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScopeError {
    #[error("Variable already defined: {0}")]
    Redefined(String),
    #[error("Remote variable is not assignable: {0}")]
    RemoteAssignment(String),
    #[error("Scope has no parent: {0}")]
    NoParent(String),
    #[error("Cannot resolve path: {0}")]
    UnknownPath(String),
}

/// Outcome of [`ScopeTree::resolve_variable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Already provided; the listener was not stored.
    Ready(i64),
    /// Parked until the variable is provided.
    Pending,
}

#[derive(Debug)]
pub struct Scope<K> {
    name: String,
    parent: Option<ScopeId>,
    iterated: bool,
    children: HashMap<String, ScopeId>,
    variables: HashMap<String, i64>,
    pending: HashMap<String, Vec<(u64, K)>>,
}

impl<K> Scope<K> {
    fn new(name: &str, parent: Option<ScopeId>, iterated: bool) -> Self {
        Scope {
            name: name.to_string(),
            parent,
            iterated,
            children: HashMap::new(),
            variables: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<ScopeId> {
        self.parent
    }

    pub fn is_iterated(&self) -> bool {
        self.iterated
    }

    pub fn child(&self, name: &str) -> Option<ScopeId> {
        self.children.get(name).copied()
    }
}

fn qualify(context: &str, name: &str) -> String {
    format!("{}.{}", context, name)
}

/// Arena of scopes plus the instruction → scope side table.
#[derive(Debug)]
pub struct ScopeTree<K> {
    scopes: Vec<Scope<K>>,
    owners: HashMap<NodeId, ScopeId>,
    introduced: HashMap<NodeId, ScopeId>,
    /// Every parked listener by registration sequence, for the drain.
    order: BTreeMap<u64, (ScopeId, String)>,
    next_seq: u64,
}

impl<K> Default for ScopeTree<K> {
    fn default() -> Self {
        ScopeTree::new()
    }
}

impl<K> ScopeTree<K> {
    /// A tree holding only the root scope.
    pub fn new() -> Self {
        ScopeTree {
            scopes: vec![Scope::new("", None, false)],
            owners: HashMap::new(),
            introduced: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Builds the tree for a grammar: containers and repeats get a child scope named
    /// after their reference (or `#<id>`), `if` blocks reuse the enclosing scope.
    pub fn from_grammar(grammar: &Grammar) -> Self {
        let mut tree = ScopeTree::new();
        let root = tree.root();
        tree.assign(grammar.instructions(), root);
        tree
    }

    fn assign(&mut self, list: &[Instruction], scope: ScopeId) {
        for ins in list {
            self.owners.insert(ins.id, scope);
            let name = ins
                .reference
                .clone()
                .unwrap_or_else(|| format!("#{}", ins.id));
            match &ins.kind {
                InstructionKind::Container { content, .. } => {
                    let inner = self.add_child(scope, &name, false);
                    self.introduced.insert(ins.id, inner);
                    self.assign(content, inner);
                }
                InstructionKind::Repeat { until, body } => {
                    let inner = self.add_child(scope, &name, true);
                    self.introduced.insert(ins.id, inner);
                    self.assign(until, inner);
                    self.assign(body, inner);
                }
                InstructionKind::If { then, .. } => self.assign(then, scope),
                InstructionKind::Fixed { .. } | InstructionKind::Trailer => {}
            }
        }
    }

    pub fn root(&self) -> ScopeId {
        0
    }

    pub fn get(&self, id: ScopeId) -> &Scope<K> {
        &self.scopes[id]
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Returns the existing child called `name`, or creates it.
    pub fn add_child(&mut self, parent: ScopeId, name: &str, iterated: bool) -> ScopeId {
        if let Some(existing) = self.scopes[parent].child(name) {
            return existing;
        }
        let id = self.scopes.len();
        self.scopes.push(Scope::new(name, Some(parent), iterated));
        self.scopes[parent].children.insert(name.to_string(), id);
        id
    }

    /// Scope an instruction publishes into and resolves its expressions in.
    pub fn scope_of(&self, id: NodeId) -> Option<ScopeId> {
        self.owners.get(&id).copied()
    }

    /// Scope a container or repeat introduces for its content.
    pub fn introduced_by(&self, id: NodeId) -> Option<ScopeId> {
        self.introduced.get(&id).copied()
    }

    pub fn value(&self, scope: ScopeId, context: &str, name: &str) -> Option<i64> {
        self.scopes[scope]
            .variables
            .get(&qualify(context, name))
            .copied()
    }

    /// Stores a variable and hands back every listener that was waiting on it,
    /// in registration order.
    pub fn provide_variable(
        &mut self,
        scope: ScopeId,
        context: &str,
        name: &str,
        value: i64,
    ) -> Result<Vec<K>, ScopeError> {
        if name.contains('/') {
            return Err(ScopeError::RemoteAssignment(name.to_string()));
        }
        let key = qualify(context, name);
        let s = &mut self.scopes[scope];
        if s.variables.contains_key(&key) {
            return Err(ScopeError::Redefined(key));
        }
        s.variables.insert(key.clone(), value);
        let waiting = s.pending.remove(&key).unwrap_or_default();
        Ok(waiting
            .into_iter()
            .map(|(seq, k)| {
                self.order.remove(&seq);
                k
            })
            .collect())
    }

    /// Looks up `path` (segments split on `/`) starting at `scope`.
    pub fn resolve_variable(
        &mut self,
        scope: ScopeId,
        context: &str,
        path: &str,
        listener: K,
    ) -> Result<Lookup, ScopeError> {
        let (target, context) = self.walk(scope, context, path)?;
        let name = path.rsplit('/').next().unwrap_or(path);
        let key = qualify(&context, name);
        let s = &mut self.scopes[target];
        if let Some(v) = s.variables.get(&key) {
            return Ok(Lookup::Ready(*v));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        s.pending.entry(key.clone()).or_default().push((seq, listener));
        self.order.insert(seq, (target, key));
        Ok(Lookup::Pending)
    }

    fn walk(&self, mut scope: ScopeId, context: &str, path: &str) -> Result<(ScopeId, String), ScopeError> {
        let mut context = context.to_string();
        let segments: Vec<&str> = path.split('/').collect();
        let (_, hops) = segments
            .split_last()
            .ok_or_else(|| ScopeError::UnknownPath(path.to_string()))?;
        for seg in hops {
            let current = &self.scopes[scope];
            if *seg == ".." {
                let parent = current
                    .parent
                    .ok_or_else(|| ScopeError::NoParent(path.to_string()))?;
                if current.iterated {
                    if let Some((outer, _)) = context.rsplit_once('/') {
                        context = outer.to_string();
                    }
                }
                scope = parent;
            } else {
                scope = current
                    .child(seg)
                    .ok_or_else(|| ScopeError::UnknownPath(path.to_string()))?;
            }
        }
        Ok((scope, context))
    }

    pub fn has_pending(&self) -> bool {
        !self.order.is_empty()
    }

    /// Number of parked listeners across all scopes.
    pub fn pending_count(&self) -> usize {
        self.order.len()
    }

    /// Removes and returns the most recently registered listener still parked
    /// anywhere, together with the qualified key it waits on.
    pub fn take_newest_pending(&mut self) -> Option<(String, K)> {
        let (_, (id, key)) = self.order.pop_last()?;
        let pending = &mut self.scopes[id].pending;
        // The globally newest entry is also the newest for its key.
        let list = pending.get_mut(&key)?;
        let (_, listener) = list.pop()?;
        if list.is_empty() {
            pending.remove(&key);
        }
        Some((key, listener))
    }
}
