//! Scheduler subsystem
//!
//! Kernel half of the guaranteed-share scheduler: the process table, the
//! ready queues and the dispatcher that owns them. Priorities and quanta are
//! decided by the user-space policy server and arrive as protocol responses.

pub mod core;
pub mod events;
pub mod process;
pub mod protocol;

use gsched_abi::SchedConfig;
use spin::{Mutex, MutexGuard, Once};

pub use self::core::{Dispatcher, ReadyQueueSet, SchedError, SchedResult, SchedulerStats, SpawnParams};
pub use process::{BlockReason, IpcKind, MiscFlags, PrivId, ProcessControlBlock, RuntimeFlags, Transition};
pub use protocol::{DiscardReason, ResponseOutcome};

/// Dispatcher behind a spin lock: one mutator at a time across CPUs
pub struct SharedDispatcher {
    inner: Mutex<Dispatcher>,
}

impl SharedDispatcher {
    pub fn new(config: SchedConfig) -> SchedResult<Self> {
        Ok(Self { inner: Mutex::new(Dispatcher::new(config)?) })
    }

    pub fn lock(&self) -> MutexGuard<'_, Dispatcher> {
        self.inner.lock()
    }

    /// Run `f` with the dispatcher locked
    pub fn with<R>(&self, f: impl FnOnce(&mut Dispatcher) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut *guard)
    }

    /// Lock only if nobody holds it (timer interrupt path)
    pub fn try_with<R>(&self, f: impl FnOnce(&mut Dispatcher) -> R) -> Option<R> {
        self.inner.try_lock().map(|mut guard| f(&mut *guard))
    }
}

/// Global dispatcher
pub static DISPATCHER: Once<SharedDispatcher> = Once::new();

/// Initialize the global dispatcher. Later calls keep the first instance.
pub fn init(config: SchedConfig) -> SchedResult<&'static SharedDispatcher> {
    if let Some(shared) = DISPATCHER.get() {
        return Ok(shared);
    }
    let shared = SharedDispatcher::new(config)?;
    Ok(DISPATCHER.call_once(|| shared))
}

/// Global dispatcher, if initialized
pub fn dispatcher() -> Option<&'static SharedDispatcher> {
    DISPATCHER.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gsched_abi::PriorityBounds;

    #[test]
    fn test_shared_dispatcher() {
        let shared = SharedDispatcher::new(SchedConfig::DEFAULT.with_max_processes(4)).unwrap();
        let pid = shared
            .with(|d| d.spawn(SpawnParams::new("init", PrivId(0), PriorityBounds::new(0, 7))))
            .unwrap();
        let guard = shared.lock();
        assert_eq!(guard.current(), Some(pid));
        // held: the interrupt path backs off
        assert!(shared.try_with(|d| d.tick()).is_none());
        drop(guard);
        assert!(shared.try_with(|d| d.tick()).is_some());
    }

    #[test]
    fn test_global_init_keeps_first() {
        let first = init(SchedConfig::DEFAULT).unwrap();
        let second = init(SchedConfig::DEFAULT.with_queues(8)).unwrap();
        assert!(::core::ptr::eq(first, second));
        assert_eq!(dispatcher().map(|d| d.lock().config().queues), Some(16));
    }
}
