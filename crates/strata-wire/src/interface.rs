//! Interface descriptors
//!
//! An interface is a static, immutable table of request and event
//! signatures. The callables that serve requests live in a
//! [`DispatchTable`](crate::dispatch::DispatchTable) on whichever side
//! implements the interface.

use std::fmt;

/// One request or event: its name and argument type-tag string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageDesc {
    pub name: &'static str,
    pub signature: &'static str,
}

impl MessageDesc {
    pub const fn new(name: &'static str, signature: &'static str) -> Self {
        Self { name, signature }
    }
}

/// Named, versioned set of requests and events.
pub struct Interface {
    pub name: &'static str,
    pub version: u32,
    pub requests: &'static [MessageDesc],
    pub events: &'static [MessageDesc],
}

impl Interface {
    pub fn request(&self, opcode: u16) -> Option<&'static MessageDesc> {
        self.requests.get(opcode as usize)
    }

    pub fn event(&self, opcode: u16) -> Option<&'static MessageDesc> {
        self.events.get(opcode as usize)
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}

impl PartialEq for Interface {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other) || (self.name == other.name && self.version == other.version)
    }
}

impl Eq for Interface {}
