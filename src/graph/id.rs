//! Identity types for the dispatch graph.
//!
//! Every output thing, filter and scheduled entity carries a [`ThingId`].
//! Connections remember the identity of the input they feed so that a
//! disconnect matches by value, even after tracing has replaced the stored
//! handler wrappers.

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THING_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique identity of a thing in the graph.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThingId(pub u64);

impl ThingId {
    /// Allocate a fresh id
    pub fn next() -> Self {
        ThingId(NEXT_THING_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for ThingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThingId({})", self.0)
    }
}

impl fmt::Display for ThingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of an input thing, taken from the address of its shared
/// allocation. A `Disconnect` token keeps a weak handle to the input, so the
/// address stays unique for as long as the token can match it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputKey(usize);

impl InputKey {
    pub fn of<I: ?Sized>(input: &Rc<I>) -> Self {
        InputKey(Rc::as_ptr(input) as *const () as usize)
    }
}

impl fmt::Debug for InputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InputKey(0x{:x})", self.0)
    }
}
