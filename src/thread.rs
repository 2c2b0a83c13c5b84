//! Resumable parsing continuations.
//!
//! A [`Thread`] is a cursor over the input plus an instruction pointer into one
//! instruction list. It is not an OS thread: the scheduler steps threads one
//! instruction at a time from a single work queue. Listener hooks (`H`) are plain
//! data the scheduler attaches and later interprets.

use crate::abt::Sink;
use crate::ast::Instruction;
use crate::offset::Offset;

pub type ThreadId = usize;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ThreadError {
    #[error("Thread {0} stepped after completion")]
    Completed(ThreadId),
}

/// Result of [`Thread::step`].
#[derive(Debug, Clone, Copy)]
pub enum Step<'g> {
    Run(&'g Instruction),
    /// No instructions left; the thread should be finalized.
    Exhausted,
    /// The cursor reached the limit with instructions left ("EOF reached").
    EndOfInput,
    /// Cancelled by [`Thread::abort`]; nothing to do.
    Cancelled,
}

#[derive(Debug)]
pub struct Thread<'g, H> {
    id: ThreadId,
    parent: Option<ThreadId>,
    context: String,
    offset: Offset,
    limit: Offset,
    instructions: &'g [Instruction],
    program_counter: usize,
    complete: bool,
    cancelled: bool,
    errors: Vec<String>,
    sink: Sink,
    /// Cleared for speculative work; inherited by forks.
    reporting: bool,
    on_error: Vec<H>,
    on_finalized: Vec<H>,
}

impl<'g, H: Clone> Thread<'g, H> {
    pub fn new(
        id: ThreadId,
        context: &str,
        instructions: &'g [Instruction],
        offset: Offset,
        limit: Offset,
        sink: Sink,
    ) -> Self {
        Thread {
            id,
            parent: None,
            context: context.to_string(),
            offset,
            limit,
            instructions,
            program_counter: 0,
            complete: false,
            cancelled: false,
            errors: Vec::new(),
            sink,
            reporting: true,
            on_error: Vec::new(),
            on_finalized: Vec::new(),
        }
    }

    /// A new, independent thread starting at this thread's cursor and limit.
    ///
    /// The context is extended with `/subcontext` when given; the sink defaults to
    /// this thread's. The fork remembers this thread as its parent and inherits
    /// whether it reports errors.
    pub fn fork(
        &self,
        id: ThreadId,
        subcontext: Option<&str>,
        instructions: &'g [Instruction],
        sink: Option<Sink>,
    ) -> Self {
        let context = match subcontext {
            Some(sub) => format!("{}/{}", self.context, sub),
            None => self.context.clone(),
        };
        let mut thread = Thread::new(
            id,
            &context,
            instructions,
            self.offset,
            self.limit,
            sink.unwrap_or(self.sink),
        );
        thread.parent = Some(self.id);
        thread.reporting = self.reporting;
        thread
    }

    pub fn step(&mut self) -> Result<Step<'g>, ThreadError> {
        if self.cancelled {
            return Ok(Step::Cancelled);
        }
        if self.complete {
            return Err(ThreadError::Completed(self.id));
        }
        let Some(ins) = self.instructions.get(self.program_counter) else {
            return Ok(Step::Exhausted);
        };
        if self.limit <= self.offset {
            return Ok(Step::EndOfInput);
        }
        self.program_counter += 1;
        Ok(Step::Run(ins))
    }

    /// Rewinds one instruction so the previous one runs again.
    pub fn step_back(&mut self) {
        self.program_counter = self.program_counter.saturating_sub(1);
    }

    pub fn move_to(&mut self, offset: Offset) {
        self.offset = offset;
    }

    pub fn move_by(&mut self, bytes: i64, bits: i64) {
        self.offset = self.offset.add(bytes, bits);
    }

    pub fn set_limit(&mut self, limit: Offset) {
        self.limit = limit;
    }

    /// Whether errors recorded here belong in the parse result.
    pub fn set_reporting(&mut self, reporting: bool) {
        self.reporting = reporting;
    }

    pub fn on_error(&mut self, hook: H) {
        self.on_error.push(hook);
    }

    pub fn on_finalized(&mut self, hook: H) {
        self.on_finalized.push(hook);
    }

    /// Records an error; returns the hooks to notify, or `None` once complete.
    pub fn add_error(&mut self, message: &str) -> Option<Vec<H>> {
        if self.complete {
            return None;
        }
        self.errors.push(message.to_string());
        Some(self.on_error.clone())
    }

    /// Marks the thread complete and hands back its finalize hooks (once).
    pub fn finalize(&mut self) -> Vec<H> {
        if self.complete {
            return Vec::new();
        }
        self.complete = true;
        self.on_error.clear();
        std::mem::take(&mut self.on_finalized)
    }

    /// Forcibly finalizes the thread from outside.
    pub fn abort(&mut self) -> Vec<H> {
        self.cancelled = true;
        self.finalize()
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn parent(&self) -> Option<ThreadId> {
        self.parent
    }

    pub fn is_reporting(&self) -> bool {
        self.reporting
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn offset(&self) -> Offset {
        self.offset
    }

    pub fn limit(&self) -> Offset {
        self.limit
    }

    pub fn sink(&self) -> Sink {
        self.sink
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Grammar, Size};

    fn two_fields() -> Grammar {
        Grammar::new(
            vec![
                Instruction::fixed(Size::bytes(1)),
                Instruction::fixed(Size::bytes(1)),
            ],
            Vec::new(),
        )
    }

    #[test]
    fn steps_until_exhausted() {
        let g = two_fields();
        let mut t: Thread<'_, u8> =
            Thread::new(0, "root", g.instructions(), Offset::ZERO, Offset::from_bytes(8), Sink::Root);
        assert!(matches!(t.step(), Ok(Step::Run(i)) if i.id == 0));
        t.step_back();
        assert!(matches!(t.step(), Ok(Step::Run(i)) if i.id == 0));
        assert!(matches!(t.step(), Ok(Step::Run(i)) if i.id == 1));
        assert!(matches!(t.step(), Ok(Step::Exhausted)));
        t.finalize();
        assert_eq!(t.step().unwrap_err(), ThreadError::Completed(0));
    }

    #[test]
    fn limit_reached_with_work_left_is_end_of_input() {
        let g = two_fields();
        let mut t: Thread<'_, u8> =
            Thread::new(0, "root", g.instructions(), Offset::ZERO, Offset::from_bytes(1), Sink::Root);
        assert!(matches!(t.step(), Ok(Step::Run(_))));
        t.move_by(1, 0);
        assert!(matches!(t.step(), Ok(Step::EndOfInput)));
    }

    #[test]
    fn forks_are_independent() {
        let g = two_fields();
        let mut parent: Thread<'_, u8> =
            Thread::new(0, "root", g.instructions(), Offset::from_bytes(2), Offset::from_bytes(8), Sink::Root);
        let mut child = parent.fork(1, Some("items[0]"), &g.instructions()[1..], None);
        assert_eq!(child.context(), "root/items[0]");
        assert_eq!(child.offset(), Offset::from_bytes(2));
        assert_eq!(child.sink(), Sink::Root);
        child.move_by(3, 0);
        parent.move_by(1, 4);
        assert_eq!(child.offset(), Offset::from_bytes(5));
        assert_eq!(parent.offset(), Offset::new(3, 4));
        assert_eq!(parent.fork(2, None, &[], Some(Sink::Discard)).context(), "root");
    }

    #[test]
    fn forks_inherit_parent_and_reporting() {
        let g = two_fields();
        let mut probe: Thread<'_, u8> =
            Thread::new(3, "root", g.instructions(), Offset::ZERO, Offset::from_bytes(8), Sink::Discard);
        assert!(probe.is_reporting());
        assert_eq!(probe.parent(), None);
        probe.set_reporting(false);
        let nested = probe.fork(4, None, g.instructions(), Some(Sink::Children(0)));
        assert_eq!(nested.parent(), Some(3));
        assert!(!nested.is_reporting());
        assert!(!nested.fork(5, None, &[], None).is_reporting());
    }

    #[test]
    fn errors_and_hooks_stop_after_completion() {
        let g = two_fields();
        let mut t: Thread<'_, u8> =
            Thread::new(0, "root", g.instructions(), Offset::ZERO, Offset::from_bytes(8), Sink::Root);
        t.on_error(7);
        t.on_finalized(9);
        assert_eq!(t.add_error("bad"), Some(vec![7]));
        assert_eq!(t.abort(), vec![9]);
        assert!(t.is_cancelled());
        assert_eq!(t.add_error("late"), None);
        assert_eq!(t.errors(), ["bad".to_string()]);
        assert!(t.finalize().is_empty());
        assert!(matches!(t.step(), Ok(Step::Cancelled)));
    }
}
