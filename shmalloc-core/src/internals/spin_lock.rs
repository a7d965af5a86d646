//! A lock living within a shared region.

use core::{
    hint,
    sync::atomic::{AtomicU32, Ordering},
};

use crate::ThreadModel;

//  Number of spins before yielding to the thread model.
const SPINS_BEFORE_YIELD: usize = 64;

#[repr(C)]
pub(crate) struct SpinLock {
    state: AtomicU32,
    _padding: u32,
}

impl SpinLock {
    const UNLOCKED: u32 = 0;
    const LOCKED: u32 = 1;

    pub(crate) fn init(&self) { self.state.store(Self::UNLOCKED, Ordering::Release) }

    //  Acquires the lock, spinning then yielding through `thread_model` while it is held.
    pub(crate) fn lock<'a>(&'a self, thread_model: &dyn ThreadModel) -> SpinLockGuard<'a> {
        loop {
            let acquired = self.state
                .compare_exchange_weak(Self::UNLOCKED, Self::LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok();

            if acquired {
                return SpinLockGuard(self);
            }

            for _ in 0..SPINS_BEFORE_YIELD {
                if self.state.load(Ordering::Relaxed) == Self::UNLOCKED {
                    break;
                }

                hint::spin_loop();
            }

            if self.state.load(Ordering::Relaxed) != Self::UNLOCKED {
                thread_model.yield_now();
            }
        }
    }
}

pub(crate) struct SpinLockGuard<'a>(&'a SpinLock);

impl<'a> Drop for SpinLockGuard<'a> {
    fn drop(&mut self) { self.0.state.store(SpinLock::UNLOCKED, Ordering::Release) }
}

#[cfg(test)]
mod tests {

use std::{cell::UnsafeCell, sync::Arc, thread};

use crate::{NoOpThreadModel, ThreadId};

use super::*;

struct Counted(SpinLock, UnsafeCell<u64>);

unsafe impl Sync for Counted {}

#[test]
fn spin_lock_guard_releases() {
    let lock = SpinLock { state: AtomicU32::new(0), _padding: 0 };

    drop(lock.lock(&NoOpThreadModel));
    drop(lock.lock(&NoOpThreadModel));

    assert_eq!(SpinLock::UNLOCKED, lock.state.load(Ordering::Relaxed));
}

#[test]
fn spin_lock_excludes() {
    struct Yielding;

    impl ThreadModel for Yielding {
        fn yield_now(&self) { thread::yield_now() }

        fn sleep_for_us(&self, _: u64) {}

        fn current_thread_id(&self) -> ThreadId { ThreadId::NULL }
    }

    let counted = Arc::new(Counted(SpinLock { state: AtomicU32::new(0), _padding: 0 }, UnsafeCell::new(0)));

    let handles: Vec<_> = (0..4).map(|_| {
        let counted = counted.clone();

        thread::spawn(move || {
            for _ in 0..1_000 {
                let _guard = counted.0.lock(&Yielding);

                //  Safety:
                //  -   Exclusive access is guaranteed by the lock.
                unsafe { *counted.1.get() += 1 };
            }
        })
    }).collect();

    for handle in handles {
        handle.join().unwrap();
    }

    //  Safety:
    //  -   All threads are joined.
    assert_eq!(4_000, unsafe { *counted.1.get() });
}

}
