//! The thread model consumed by shmalloc.
//!
//! shmalloc makes no scheduling decision; it only requires a way to back off while spinning.

/// ThreadId
///
/// Diagnostic identifier of the calling thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    /// The null identifier, for thread models without identification.
    pub const NULL: ThreadId = ThreadId(u64::MAX);

    /// Creates a ThreadId.
    pub const fn new(value: u64) -> Self { Self(value) }

    /// Retrieves the value.
    pub const fn value(&self) -> u64 { self.0 }

    /// Returns whether this is the null identifier.
    pub const fn is_null(&self) -> bool { self.0 == u64::MAX }
}

/// ThreadModel
pub trait ThreadModel: Send + Sync {
    /// Yields the remainder of the time-slice of the calling thread.
    fn yield_now(&self);

    /// Suspends the calling thread for approximately `us` micro-seconds.
    fn sleep_for_us(&self, us: u64);

    /// Returns the identifier of the calling thread.
    fn current_thread_id(&self) -> ThreadId;
}

/// NoOpThreadModel
///
/// The thread model of device contexts: there is nothing to yield to.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpThreadModel;

impl ThreadModel for NoOpThreadModel {
    fn yield_now(&self) {}

    fn sleep_for_us(&self, _: u64) {}

    fn current_thread_id(&self) -> ThreadId { ThreadId::NULL }
}
