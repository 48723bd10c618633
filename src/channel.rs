use std::cell::RefCell;
use std::rc::Rc;

use tracing::error;

/// Where human-readable script fault reports go. One line per fault.
pub trait ErrorChannel {
    fn msg(&self, line: &str);
}

/// Default channel: forward to the log.
pub struct LogChannel;

impl ErrorChannel for LogChannel {
    fn msg(&self, line: &str) {
        error!(target: "script_errors", "{line}");
    }
}

/// Buffering channel for tests and in-game consoles.
#[derive(Default)]
pub struct BufferChannel {
    lines: Rc<RefCell<Vec<String>>>,
}

impl BufferChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> Rc<RefCell<Vec<String>>> {
        self.lines.clone()
    }
}

impl ErrorChannel for BufferChannel {
    fn msg(&self, line: &str) {
        self.lines.borrow_mut().push(line.to_string());
    }
}
