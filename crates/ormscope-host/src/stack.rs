use std::sync::Arc;

use parking_lot::Mutex;

/// What kind of source a unit of evaluated code came from.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum UnitKind {
    Bootstrap,
    Script,
    Interactive,
    /// Framework code with no user-visible source.
    Internal,
}

/// Identity of one evaluated source unit. Every evaluation gets a fresh id.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UnitId(pub u64);

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CallFrame {
    pub unit: UnitId,
    pub kind: UnitKind,
    /// `<module>` for top-level code, otherwise the function name.
    pub function: String,
    /// 1-based line inside the unit's source; 0 before the first statement.
    pub line: usize,
}

/// Live call stack of an interpreter. Cloning yields another handle to the
/// same stack.
#[derive(Debug, Clone, Default)]
pub struct CallStack {
    frames: Arc<Mutex<Vec<CallFrame>>>,
}

impl CallStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames ordered outermost first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CallFrame> {
        self.frames.lock().clone()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.lock().len()
    }

    /// Push a frame that is popped when the returned guard drops.
    #[must_use]
    pub fn enter(&self, frame: CallFrame) -> FrameGuard {
        let mut frames = self.frames.lock();
        frames.push(frame);
        FrameGuard {
            stack: self.clone(),
            depth: frames.len(),
        }
    }

    pub(crate) fn set_line(&self, line: usize) {
        if let Some(top) = self.frames.lock().last_mut() {
            top.line = line;
        }
    }

    pub(crate) fn current_line(&self) -> Option<usize> {
        self.frames
            .lock()
            .last()
            .map(|frame| frame.line)
            .filter(|line| *line > 0)
    }
}

#[derive(Debug)]
pub struct FrameGuard {
    stack: CallStack,
    depth: usize,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        self.stack.frames.lock().truncate(self.depth.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::{CallFrame, CallStack, UnitId, UnitKind};

    fn frame(unit: u64, line: usize) -> CallFrame {
        CallFrame {
            unit: UnitId(unit),
            kind: UnitKind::Script,
            function: "<module>".to_string(),
            line,
        }
    }

    #[test]
    fn guards_pop_frames_in_lifo_order() {
        let stack = CallStack::new();
        let outer = stack.enter(frame(1, 1));
        {
            let _inner = stack.enter(frame(2, 4));
            stack.set_line(5);
            assert_eq!(stack.depth(), 2);
            assert_eq!(stack.current_line(), Some(5));
        }
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.snapshot()[0].line, 1);
        drop(outer);
        assert_eq!(stack.depth(), 0);
    }
}
