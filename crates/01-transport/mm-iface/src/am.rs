use std::fmt;

/// Number of distinct active-message tags.
pub const AM_ID_MAX: usize = 256;

/// What a handler did with the message it was shown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AmStatus {
    /// Consumed in place; the slot may be reused.
    Handled,
    /// The payload must outlive the slot and is copied into a descriptor.
    WantsCopy,
}

pub type AmCallback = Box<dyn FnMut(&[u8]) -> AmStatus + Send>;

/// Handler registered for one tag.
pub enum AmHandler {
    /// Runs inline on the polling thread with a view into the slot.
    Callback(AmCallback),
    /// Always copies the payload onto the interface's deferred queue.
    Defer,
    /// Default for unregistered tags: logs and drops the message.
    Stub,
}

impl AmHandler {
    pub fn callback<F>(f: F) -> Self
    where
        F: FnMut(&[u8]) -> AmStatus + Send + 'static,
    {
        AmHandler::Callback(Box::new(f))
    }

    fn invoke(&mut self, tag: u8, payload: &[u8]) -> AmStatus {
        match self {
            AmHandler::Callback(cb) => cb(payload),
            AmHandler::Defer => AmStatus::WantsCopy,
            AmHandler::Stub => {
                tracing::warn!(tag, len = payload.len(), "no handler for active message, dropping");
                AmStatus::Handled
            }
        }
    }
}

impl fmt::Debug for AmHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmHandler::Callback(_) => f.write_str("Callback(..)"),
            AmHandler::Defer => f.write_str("Defer"),
            AmHandler::Stub => f.write_str("Stub"),
        }
    }
}

pub(crate) struct AmTable {
    handlers: Vec<AmHandler>,
}

impl AmTable {
    pub(crate) fn new() -> Self {
        Self {
            handlers: (0..AM_ID_MAX).map(|_| AmHandler::Stub).collect(),
        }
    }

    pub(crate) fn set(&mut self, tag: u8, handler: AmHandler) -> AmHandler {
        std::mem::replace(&mut self.handlers[tag as usize], handler)
    }

    pub(crate) fn dispatch(&mut self, tag: u8, payload: &[u8]) -> AmStatus {
        self.handlers[tag as usize].invoke(tag, payload)
    }
}
