//! Identifiers for spans and execution contexts.
//!
//! - [`SpanId`]: identifies a span within a process.
//! - [`ExecutionContextId`]: identifies the thread of control a call chain runs on.

use core::fmt;
use core::str::FromStr;
use core::sync::atomic::{AtomicU64, Ordering};

/// A process-unique id for a span.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SpanId(pub u64);

impl SpanId {
    /// Creates a new non-zero [`SpanId`].
    #[inline]
    pub fn next_id() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        SpanId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for SpanId {
    type Err = core::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(SpanId)
    }
}

/// The execution context a call chain correlates across: the current thread.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ExecutionContextId(std::thread::ThreadId);

impl ExecutionContextId {
    /// The execution context of the caller.
    pub fn current() -> Self {
        Self(std::thread::current().id())
    }
}
