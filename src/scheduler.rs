//! The cooperative scheduler that turns a grammar and a byte buffer into an [`AbtRoot`].
//!
//! ## Model
//!
//! Parsing is split into [`Thread`]s: one root thread over the top-level
//! instructions, plus one thread per container body, `if` branch, and repeat
//! iteration (a speculative *probe* over `until` and a *body* over `do`). Threads sit
//! in a FIFO work queue; the scheduler pops one, executes a single instruction, and
//! requeues it unless it is now blocked or finished.
//!
//! A thread blocks only on a variable that has not been published yet: a size or
//! condition expression referring to a later field, or an unsized container waiting
//! for its content to report where it ended. The blocked request is parked in the
//! [`ScopeTree`] as an enum-tagged [`Continuation`] and resumed synchronously when
//! the variable is provided.
//!
//! When the queue drains while requests are still parked, the most recent one is
//! resumed with "no value" and the queue is run again, until nothing is parked. Each
//! such request becomes an explicit error node instead of a hang.
//!
//! ## Failure policy
//!
//! Per-field problems (unresolvable size, decode failure, constraint violation, end
//! of input) decorate the tree and are listed in [`AbtRoot::errors`]; parsing
//! continues elsewhere. Repeat probes and everything forked from them are speculative:
//! their failures only steer the loop and are never listed. A field whose size cannot
//! be resolved stops its thread. Broken
//! invariants (redefined variable, unknown scope path, unknown codec, trailer in a
//! live grammar) abort the whole parse with a [`ParseError`].

use crate::abt::{AbtRoot, NodeArena, Sink, Slot};
use crate::ast::{Grammar, Instruction, InstructionKind, NodeId, Size, SizeValue};
use crate::codec::{CodecError, CodecLibrary, CustomCodec};
use crate::expr::Expression;
use crate::offset::Offset;
use crate::scope::{Lookup, ScopeError, ScopeId, ScopeTree};
use crate::thread::{Step, Thread, ThreadError, ThreadId};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace};

const ROOT_CONTEXT: &str = "root";

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Scope: {0}")]
    Scope(#[from] ScopeError),
    #[error("Codec: {0}")]
    Codec(#[from] CodecError),
    #[error("Thread: {0}")]
    Thread(#[from] ThreadError),
    #[error("Grammar: {0}")]
    Grammar(String),
    #[error("Step limit of {0} exceeded")]
    StepLimit(usize),
}

/// Parse window and safety limits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParserConfig {
    /// Where the root thread starts.
    pub start: Offset,
    /// Upper bound for the root thread; clamped to the buffer length.
    pub end: Option<Offset>,
    /// Maximum number of executed scheduler steps before giving up.
    pub max_steps: Option<usize>,
}

impl ParserConfig {
    pub fn with_start(mut self, start: Offset) -> Self {
        self.start = start;
        self
    }

    pub fn with_end(mut self, end: Offset) -> Self {
        self.end = Some(end);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }
}

/// Name of the synthetic variable a container publishes when its content finishes.
pub fn container_end_variable(id: NodeId) -> String {
    format!("system.container@{}.end", id)
}

/// A grammar bound to a codec library, ready to parse buffers.
pub struct Parser<'g> {
    grammar: &'g Grammar,
    library: CodecLibrary,
    config: ParserConfig,
}

impl<'g> Parser<'g> {
    /// Uses the built-in codec library plus the grammar's own codecs.
    pub fn new(grammar: &'g Grammar) -> Result<Self, ParseError> {
        Parser::with_library(grammar, CodecLibrary::new())
    }

    /// Registers the grammar's codecs into `library` and checks every codec reference.
    pub fn with_library(grammar: &'g Grammar, mut library: CodecLibrary) -> Result<Self, ParseError> {
        for def in grammar.codecs() {
            library.register_codec(&def.name, Box::new(CustomCodec::compile(&def.source)?))?;
        }
        let mut problem: Option<ParseError> = None;
        grammar.walk(|ins| {
            if problem.is_some() {
                return;
            }
            match &ins.kind {
                InstructionKind::Fixed { codec: Some(name), .. } if !library.contains(name) => {
                    problem = Some(ParseError::Codec(CodecError::Unknown(name.clone())));
                }
                InstructionKind::Trailer => {
                    problem = Some(ParseError::Grammar(format!(
                        "trailer instruction {} in a live grammar",
                        ins.id
                    )));
                }
                _ => {}
            }
        });
        if let Some(e) = problem {
            return Err(e);
        }
        Ok(Parser {
            grammar,
            library,
            config: ParserConfig::default(),
        })
    }

    pub fn with_config(mut self, config: ParserConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    pub fn library(&self) -> &CodecLibrary {
        &self.library
    }

    /// Codec names known to this parser, for display.
    pub fn codec_names(&self) -> Vec<String> {
        self.library.names()
    }

    /// Runs the scheduler over `data`. Every call is an independent run.
    pub fn parse(&self, data: &[u8]) -> Result<AbtRoot, ParseError> {
        Run::new(self.grammar, &self.library, &self.config, data).run()
    }
}

/// Listener attached to a thread's error or finalize event.
#[derive(Debug, Clone, Copy)]
enum Hook {
    /// Error: forward to the parent thread.
    Propagate(ThreadId),
    /// Error on a repeat probe: the loop continues.
    ProbeFailed(usize),
    /// Finalize of a repeat probe: the loop terminates.
    ProbeFinished(usize),
    /// Finalize of a repeat body: re-run the repeat.
    BodyFinished(usize),
    /// Finalize of a container body: publish where it ended.
    PublishEnd { scope: ScopeId, node: NodeId },
    /// Finalize of an `if` branch: continue the outer thread there.
    ResumeAt(ThreadId),
}

/// A request parked in the scope tree.
#[derive(Debug, Clone, Copy)]
enum Continuation<'g> {
    Expression(usize),
    ContainerEnd {
        thread: ThreadId,
        instruction: &'g Instruction,
        slot: Slot,
    },
}

/// What to do with a resolved expression.
#[derive(Debug, Clone, Copy)]
enum Target<'g> {
    FixedSize {
        thread: ThreadId,
        instruction: &'g Instruction,
    },
    ContainerSize {
        thread: ThreadId,
        instruction: &'g Instruction,
    },
    Condition {
        thread: ThreadId,
        instruction: &'g Instruction,
    },
}

/// An expression whose variables are being bound one at a time.
struct Request<'g> {
    scope: ScopeId,
    context: String,
    expression: &'g Expression,
    bindings: HashMap<String, i64>,
    next: usize,
    target: Target<'g>,
}

struct RepeatFrame<'g> {
    outer: ThreadId,
    instruction: &'g Instruction,
    probe: ThreadId,
    body: ThreadId,
    start: Offset,
    /// Set once the probe outcome was acted on; later probe events are ignored.
    handled: bool,
}

/// State of one scheduler run.
struct Run<'g> {
    library: &'g CodecLibrary,
    config: &'g ParserConfig,
    data: &'g [u8],
    root: &'g [Instruction],
    scopes: ScopeTree<Continuation<'g>>,
    threads: Vec<Thread<'g, Hook>>,
    queue: VecDeque<ThreadId>,
    nodes: NodeArena,
    requests: Vec<Option<Request<'g>>>,
    repeats: Vec<RepeatFrame<'g>>,
    iterations: HashMap<(ThreadId, NodeId), usize>,
    errors: Vec<String>,
    steps: usize,
}

impl<'g> Run<'g> {
    fn new(grammar: &'g Grammar, library: &'g CodecLibrary, config: &'g ParserConfig, data: &'g [u8]) -> Self {
        Run {
            library,
            config,
            data,
            root: grammar.instructions(),
            scopes: ScopeTree::from_grammar(grammar),
            threads: Vec::new(),
            queue: VecDeque::new(),
            nodes: NodeArena::new(),
            requests: Vec::new(),
            repeats: Vec::new(),
            iterations: HashMap::new(),
            errors: Vec::new(),
            steps: 0,
        }
    }

    fn run(mut self) -> Result<AbtRoot, ParseError> {
        let data_end = Offset::from_bytes(self.data.len() as i64);
        let limit = self.config.end.map_or(data_end, |e| e.min(data_end));
        let start = self.config.start;
        self.threads
            .push(Thread::new(0, ROOT_CONTEXT, self.root, start, limit, Sink::Root));
        self.queue.push_back(0);

        loop {
            while let Some(tid) = self.queue.pop_front() {
                self.tick()?;
                self.execute(tid)?;
            }
            match self.scopes.take_newest_pending() {
                Some((key, parked)) => {
                    debug!(variable = %key, "unresolved at drain, resuming without value");
                    self.resume(parked, None)?;
                }
                None => break,
            }
        }

        let end = self.threads[0].offset();
        debug!(
            threads = self.threads.len(),
            nodes = self.nodes.len(),
            errors = self.errors.len(),
            steps = self.steps,
            "parse finished"
        );
        Ok(self.nodes.finish(start, end, self.errors))
    }

    fn tick(&mut self) -> Result<(), ParseError> {
        self.steps += 1;
        match self.config.max_steps {
            Some(max) if self.steps > max => Err(ParseError::StepLimit(max)),
            _ => Ok(()),
        }
    }

    fn execute(&mut self, tid: ThreadId) -> Result<(), ParseError> {
        if self.under_cancelled(tid) {
            // Work forked by an abandoned probe: drop it without running its hooks.
            trace!(thread = tid, "ancestor cancelled");
            self.threads[tid].abort();
            return Ok(());
        }
        match self.threads[tid].step()? {
            Step::Cancelled => Ok(()),
            Step::Exhausted => self.finalize(tid),
            Step::EndOfInput => {
                self.add_error(tid, "EOF reached")?;
                self.finalize(tid)
            }
            Step::Run(ins) => {
                trace!(
                    thread = tid,
                    node = ins.id,
                    kind = ins.kind_name(),
                    offset = %self.threads[tid].offset(),
                    "dispatch"
                );
                self.dispatch(tid, ins)
            }
        }
    }

    fn dispatch(&mut self, tid: ThreadId, ins: &'g Instruction) -> Result<(), ParseError> {
        match &ins.kind {
            InstructionKind::Fixed { size, .. } => match &size.value {
                SizeValue::Literal(n) => self.finish_fixed(tid, ins, Ok(*n)),
                SizeValue::Expr(e) => {
                    self.request_expression(tid, ins, e, Target::FixedSize { thread: tid, instruction: ins })
                }
            },
            InstructionKind::Container { size: Some(size), .. } => match &size.value {
                SizeValue::Literal(n) => self.open_sized_container(tid, ins, Ok(*n)),
                SizeValue::Expr(e) => self.request_expression(
                    tid,
                    ins,
                    e,
                    Target::ContainerSize { thread: tid, instruction: ins },
                ),
            },
            InstructionKind::Container { size: None, content } => {
                self.open_unsized_container(tid, ins, content)
            }
            InstructionKind::Repeat { until, body } => self.start_repeat(tid, ins, until, body),
            InstructionKind::If { condition, .. } => self.request_expression(
                tid,
                ins,
                condition,
                Target::Condition { thread: tid, instruction: ins },
            ),
            InstructionKind::Trailer => Err(ParseError::Grammar(format!(
                "trailer instruction {} reached the scheduler",
                ins.id
            ))),
        }
    }

    // ---- threads ----

    fn fork(
        &mut self,
        parent: ThreadId,
        subcontext: Option<&str>,
        instructions: &'g [Instruction],
        sink: Option<Sink>,
    ) -> ThreadId {
        let id = self.threads.len();
        let thread = self.threads[parent].fork(id, subcontext, instructions, sink);
        trace!(parent, thread = id, context = thread.context(), "fork");
        self.threads.push(thread);
        id
    }

    fn under_cancelled(&self, tid: ThreadId) -> bool {
        let mut current = self.threads[tid].parent();
        while let Some(p) = current {
            if self.threads[p].is_cancelled() {
                return true;
            }
            current = self.threads[p].parent();
        }
        false
    }

    fn requeue(&mut self, tid: ThreadId) {
        if !self.threads[tid].is_complete() {
            self.queue.push_back(tid);
        }
    }

    fn add_error(&mut self, tid: ThreadId, message: &str) -> Result<(), ParseError> {
        self.record_error(tid, message, true)
    }

    fn record_error(&mut self, tid: ThreadId, message: &str, origin: bool) -> Result<(), ParseError> {
        let reporting = self.threads[tid].is_reporting();
        let Some(hooks) = self.threads[tid].add_error(message) else {
            return Ok(());
        };
        if origin && reporting {
            debug!(thread = tid, error = message, "thread error");
            self.errors.push(message.to_string());
        }
        for hook in hooks {
            match hook {
                Hook::Propagate(parent) => self.record_error(parent, message, false)?,
                Hook::ProbeFailed(frame) => self.probe_failed(frame)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn finalize(&mut self, tid: ThreadId) -> Result<(), ParseError> {
        trace!(thread = tid, offset = %self.threads[tid].offset(), "finalize");
        let hooks = self.threads[tid].finalize();
        self.run_finalize_hooks(tid, hooks)
    }

    fn abort(&mut self, tid: ThreadId) -> Result<(), ParseError> {
        trace!(thread = tid, "abort");
        let hooks = self.threads[tid].abort();
        self.run_finalize_hooks(tid, hooks)
    }

    fn run_finalize_hooks(&mut self, finished: ThreadId, hooks: Vec<Hook>) -> Result<(), ParseError> {
        for hook in hooks {
            match hook {
                Hook::ProbeFinished(frame) => self.probe_finished(frame)?,
                Hook::BodyFinished(frame) => self.body_finished(frame)?,
                Hook::PublishEnd { scope, node } => {
                    let end = self.threads[finished].offset();
                    let context = self.threads[finished].context().to_string();
                    self.provide(scope, &context, &container_end_variable(node), end.to_bits())?;
                }
                Hook::ResumeAt(outer) => {
                    let end = self.threads[finished].offset();
                    self.threads[outer].move_to(end);
                    self.requeue(outer);
                }
                Hook::Propagate(_) | Hook::ProbeFailed(_) => {}
            }
        }
        Ok(())
    }

    // ---- variables ----

    fn scope_of(&self, ins: &Instruction) -> Result<ScopeId, ParseError> {
        self.scopes
            .scope_of(ins.id)
            .ok_or_else(|| ParseError::Grammar(format!("instruction {} has no scope", ins.id)))
    }

    fn provide(&mut self, scope: ScopeId, context: &str, name: &str, value: i64) -> Result<(), ParseError> {
        debug!(scope, context, name, value, "variable provided");
        for parked in self.scopes.provide_variable(scope, context, name, value)? {
            self.resume(parked, Some(value))?;
        }
        Ok(())
    }

    fn export(&mut self, tid: ThreadId, ins: &Instruction, value: i64) -> Result<(), ParseError> {
        if let Some(name) = &ins.reference {
            let scope = self.scope_of(ins)?;
            let context = self.threads[tid].context().to_string();
            self.provide(scope, &context, name, value)?;
        }
        Ok(())
    }

    fn resume(&mut self, parked: Continuation<'g>, value: Option<i64>) -> Result<(), ParseError> {
        match parked {
            Continuation::Expression(id) => self.bind_request(id, value),
            Continuation::ContainerEnd {
                thread,
                instruction,
                slot,
            } => self.close_unsized_container(thread, instruction, slot, value),
        }
    }

    fn request_expression(
        &mut self,
        tid: ThreadId,
        ins: &'g Instruction,
        expression: &'g Expression,
        target: Target<'g>,
    ) -> Result<(), ParseError> {
        let scope = self.scope_of(ins)?;
        let id = self.requests.len();
        self.requests.push(Some(Request {
            scope,
            context: self.threads[tid].context().to_string(),
            expression,
            bindings: HashMap::new(),
            next: 0,
            target,
        }));
        self.continue_request(id)
    }

    /// Binds variables in order until one is missing (parks) or all are bound (computes).
    fn continue_request(&mut self, id: usize) -> Result<(), ParseError> {
        loop {
            let Some(req) = self.requests[id].as_ref() else {
                return Ok(());
            };
            let expression = req.expression;
            let variables = expression.variables();
            let Some(var) = variables.get(req.next) else {
                let Some(req) = self.requests[id].take() else {
                    return Ok(());
                };
                let result = expression.compute(&req.bindings).map_err(|e| e.to_string());
                return self.deliver(req.target, result);
            };
            let (scope, context) = (req.scope, req.context.clone());
            match self
                .scopes
                .resolve_variable(scope, &context, &var.name, Continuation::Expression(id))?
            {
                Lookup::Ready(value) => {
                    if let Some(req) = self.requests[id].as_mut() {
                        req.bindings.insert(var.name.clone(), value);
                        req.next += 1;
                    }
                }
                Lookup::Pending => {
                    trace!(request = id, variable = %var.name, "waiting for variable");
                    return Ok(());
                }
            }
        }
    }

    fn bind_request(&mut self, id: usize, value: Option<i64>) -> Result<(), ParseError> {
        let Some(req) = self.requests[id].as_mut() else {
            return Ok(());
        };
        let expression = req.expression;
        let variables = expression.variables();
        let name = variables
            .get(req.next)
            .map(|v| v.name.clone())
            .unwrap_or_default();
        match value {
            Some(v) => {
                req.bindings.insert(name, v);
                req.next += 1;
                self.continue_request(id)
            }
            None => {
                let Some(req) = self.requests[id].take() else {
                    return Ok(());
                };
                self.deliver(req.target, Err(format!("{} is unresolved", name)))
            }
        }
    }

    fn deliver(&mut self, target: Target<'g>, result: Result<i64, String>) -> Result<(), ParseError> {
        match target {
            Target::FixedSize { thread, instruction } => self.finish_fixed(thread, instruction, result),
            Target::ContainerSize { thread, instruction } => {
                self.open_sized_container(thread, instruction, result)
            }
            Target::Condition { thread, instruction } => self.finish_if(thread, instruction, result),
        }
    }

    // ---- instructions ----

    /// Emits an empty error node at the thread's cursor and stops the thread.
    fn fail_branch(&mut self, tid: ThreadId, ins: &Instruction, message: &str) -> Result<(), ParseError> {
        let start = self.threads[tid].offset();
        let slot = self.nodes.alloc(ins.id, start, ins.label());
        self.nodes.annotate_error(slot, message);
        self.nodes.emit(self.threads[tid].sink(), slot);
        self.add_error(tid, &format!("{}: {}", ins.label(), message))?;
        self.finalize(tid)
    }

    fn sized_end(start: Offset, size: &Size, amount: Result<i64, String>) -> Result<Offset, String> {
        let amount = amount?;
        if amount < 0 {
            return Err(format!("negative size {}", amount));
        }
        let (bytes, bits) = size.delta(amount);
        bytes
            .checked_mul(8)
            .and_then(|b| b.checked_add(bits))
            .and_then(|delta| start.to_bits().checked_add(delta))
            .map(Offset::from_bits)
            .ok_or_else(|| format!("size {} overflows", amount))
    }

    fn finish_fixed(&mut self, tid: ThreadId, ins: &'g Instruction, amount: Result<i64, String>) -> Result<(), ParseError> {
        let InstructionKind::Fixed {
            size,
            codec,
            constraints,
        } = &ins.kind
        else {
            return Ok(());
        };
        let start = self.threads[tid].offset();
        let end = match Self::sized_end(start, size, amount) {
            Ok(end) => end,
            Err(detail) => {
                return self.fail_branch(tid, ins, &format!("cannot resolve size: {}", detail));
            }
        };

        let data = self.data;
        let len = data.len() as i64;
        let lo = start.byte().clamp(0, len);
        let hi = end.ceil_byte().clamp(lo, len);
        let bytes = &data[lo as usize..hi as usize];

        let mut failures = Vec::new();
        if end.ceil_byte() > len {
            failures.push("field extends past end of input".to_string());
        }
        for constraint in constraints {
            if let Err(m) = constraint.check(bytes) {
                failures.push(m);
            }
        }
        let mut decoded = None;
        if let Some(c) = self.library.resolve(codec.as_deref())? {
            match c.decode(bytes) {
                Ok(v) => decoded = Some(v),
                Err(e) => failures.push(e.to_string()),
            }
        }

        let slot = self.nodes.alloc(ins.id, start, ins.label());
        self.nodes.set_end(slot, end);
        let number = decoded.as_ref().and_then(|v| v.as_i64());
        if let Some(v) = decoded {
            self.nodes.set_value(slot, v);
        }
        for m in &failures {
            self.nodes.annotate_error(slot, m);
        }
        self.nodes.emit(self.threads[tid].sink(), slot);

        if let Some(n) = number {
            self.export(tid, ins, n)?;
        }
        for m in &failures {
            self.add_error(tid, &format!("{}: {}", ins.label(), m))?;
        }
        self.threads[tid].move_to(end);
        self.requeue(tid);
        Ok(())
    }

    fn open_sized_container(
        &mut self,
        tid: ThreadId,
        ins: &'g Instruction,
        amount: Result<i64, String>,
    ) -> Result<(), ParseError> {
        let InstructionKind::Container {
            size: Some(size),
            content,
        } = &ins.kind
        else {
            return Ok(());
        };
        let start = self.threads[tid].offset();
        let end = match Self::sized_end(start, size, amount) {
            Ok(end) => end,
            Err(detail) => {
                return self.fail_branch(tid, ins, &format!("cannot resolve size: {}", detail));
            }
        };

        let slot = self.nodes.alloc(ins.id, start, ins.label());
        self.nodes.set_end(slot, end);
        let child = self.spawn_container_body(tid, ins, content, slot)?;
        let limit = self.threads[tid].limit().min(end);
        self.threads[child].set_limit(limit);
        self.queue.push_back(child);

        self.nodes.emit(self.threads[tid].sink(), slot);
        self.export(tid, ins, (end.to_bits() - start.to_bits()) / 8)?;
        self.threads[tid].move_to(end);
        self.requeue(tid);
        Ok(())
    }

    fn open_unsized_container(
        &mut self,
        tid: ThreadId,
        ins: &'g Instruction,
        content: &'g [Instruction],
    ) -> Result<(), ParseError> {
        let start = self.threads[tid].offset();
        let slot = self.nodes.alloc(ins.id, start, ins.label());
        let child = self.spawn_container_body(tid, ins, content, slot)?;
        self.queue.push_back(child);

        let scope = self.scope_of(ins)?;
        let context = self.threads[tid].context().to_string();
        let parked = Continuation::ContainerEnd {
            thread: tid,
            instruction: ins,
            slot,
        };
        match self
            .scopes
            .resolve_variable(scope, &context, &container_end_variable(ins.id), parked)?
        {
            Lookup::Ready(bits) => self.close_unsized_container(tid, ins, slot, Some(bits)),
            Lookup::Pending => Ok(()),
        }
    }

    fn spawn_container_body(
        &mut self,
        tid: ThreadId,
        ins: &Instruction,
        content: &'g [Instruction],
        slot: Slot,
    ) -> Result<ThreadId, ParseError> {
        let scope = self.scope_of(ins)?;
        let child = self.fork(tid, None, content, Some(Sink::Children(slot)));
        self.threads[child].on_error(Hook::Propagate(tid));
        self.threads[child].on_finalized(Hook::PublishEnd { scope, node: ins.id });
        Ok(child)
    }

    fn close_unsized_container(
        &mut self,
        tid: ThreadId,
        ins: &'g Instruction,
        slot: Slot,
        end_bits: Option<i64>,
    ) -> Result<(), ParseError> {
        let Some(bits) = end_bits else {
            self.nodes.annotate_error(slot, "cannot resolve container end");
            self.nodes.emit(self.threads[tid].sink(), slot);
            self.add_error(tid, &format!("{}: cannot resolve container end", ins.label()))?;
            return self.finalize(tid);
        };
        let start = self.threads[tid].offset();
        let end = Offset::from_bits(bits);
        self.nodes.set_end(slot, end);
        self.nodes.emit(self.threads[tid].sink(), slot);
        self.export(tid, ins, (end.to_bits() - start.to_bits()) / 8)?;
        self.threads[tid].move_to(end);
        self.requeue(tid);
        Ok(())
    }

    fn start_repeat(
        &mut self,
        tid: ThreadId,
        ins: &'g Instruction,
        until: &'g [Instruction],
        body: &'g [Instruction],
    ) -> Result<(), ParseError> {
        let scope = self
            .scopes
            .introduced_by(ins.id)
            .ok_or_else(|| ParseError::Grammar(format!("repeat {} has no scope", ins.id)))?;
        let name = self.scopes.get(scope).name().to_string();
        let iteration = *self.iterations.entry((tid, ins.id)).or_insert(0);

        let frame = self.repeats.len();
        let probe_context = format!("{}[{}]?", name, iteration);
        let body_context = format!("{}[{}]", name, iteration);
        let probe = self.fork(tid, Some(probe_context.as_str()), until, Some(Sink::Discard));
        self.threads[probe].set_reporting(false);
        let body = self.fork(tid, Some(body_context.as_str()), body, None);
        self.threads[probe].on_error(Hook::ProbeFailed(frame));
        self.threads[probe].on_finalized(Hook::ProbeFinished(frame));
        self.threads[body].on_error(Hook::Propagate(tid));
        self.threads[body].on_finalized(Hook::BodyFinished(frame));
        self.repeats.push(RepeatFrame {
            outer: tid,
            instruction: ins,
            probe,
            body,
            start: self.threads[tid].offset(),
            handled: false,
        });
        trace!(thread = tid, node = ins.id, iteration, "probe repeat");
        self.queue.push_back(probe);
        Ok(())
    }

    fn probe_failed(&mut self, frame: usize) -> Result<(), ParseError> {
        if self.repeats[frame].handled {
            return Ok(());
        }
        self.repeats[frame].handled = true;
        let (probe, body) = (self.repeats[frame].probe, self.repeats[frame].body);
        self.abort(probe)?;
        self.queue.push_back(body);
        Ok(())
    }

    fn probe_finished(&mut self, frame: usize) -> Result<(), ParseError> {
        if self.repeats[frame].handled {
            return Ok(());
        }
        self.repeats[frame].handled = true;
        let end = self.threads[self.repeats[frame].probe].offset();
        self.leave_repeat(frame, end)
    }

    fn body_finished(&mut self, frame: usize) -> Result<(), ParseError> {
        let RepeatFrame {
            outer,
            instruction,
            body,
            start,
            ..
        } = self.repeats[frame];
        let end = self.threads[body].offset();
        if end <= start {
            self.add_error(outer, &format!("{}: repeat made no progress", instruction.label()))?;
            return self.leave_repeat(frame, start);
        }
        if let Some(count) = self.iterations.get_mut(&(outer, instruction.id)) {
            *count += 1;
        }
        debug!(thread = outer, node = instruction.id, offset = %end, "repeat iteration done");
        self.threads[outer].step_back();
        self.threads[outer].move_to(end);
        self.requeue(outer);
        Ok(())
    }

    fn leave_repeat(&mut self, frame: usize, at: Offset) -> Result<(), ParseError> {
        let RepeatFrame { outer, instruction, .. } = self.repeats[frame];
        let count = self
            .iterations
            .remove(&(outer, instruction.id))
            .unwrap_or(0);
        debug!(thread = outer, node = instruction.id, iterations = count, offset = %at, "repeat done");
        self.threads[outer].move_to(at);
        self.export(outer, instruction, count as i64)?;
        self.requeue(outer);
        Ok(())
    }

    fn finish_if(&mut self, tid: ThreadId, ins: &'g Instruction, result: Result<i64, String>) -> Result<(), ParseError> {
        let InstructionKind::If { then, .. } = &ins.kind else {
            return Ok(());
        };
        let value = match result {
            Ok(v) => v,
            Err(detail) => {
                return self.fail_branch(tid, ins, &format!("cannot resolve condition: {}", detail));
            }
        };
        self.export(tid, ins, value)?;
        if value != 0 && !then.is_empty() {
            let branch = self.fork(tid, None, then, None);
            self.threads[branch].on_error(Hook::Propagate(tid));
            self.threads[branch].on_finalized(Hook::ResumeAt(tid));
            self.queue.push_back(branch);
        } else {
            self.requeue(tid);
        }
        Ok(())
    }
}
