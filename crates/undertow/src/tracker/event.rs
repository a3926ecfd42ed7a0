use speedy::{Readable, Writable};

/// Event field of an announce request.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Writable, Readable)]
pub enum Event {
    #[default]
    None = 0,
    Completed = 1,
    Started = 2,
    Stopped = 3,
}
