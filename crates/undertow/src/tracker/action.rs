use speedy::{Readable, Writable};

/// Action field of every tracker packet.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Writable, Readable)]
pub enum Action {
    Connect = 0,
    #[default]
    Announce = 1,
    Scrape = 2,
    Error = 3,
}
