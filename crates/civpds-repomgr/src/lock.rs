//! Reference-counted per-actor write locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use civpds_types::Uid;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    refs: usize,
}

/// One async mutex per actor, created on first use and dropped when the
/// last holder or waiter releases it.
#[derive(Default)]
pub struct ActorLocks {
    slots: Arc<Mutex<HashMap<Uid, Slot>>>,
}

/// Held while an actor's repository is being mutated.
///
/// Field order matters: the mutex guard is released before the slot
/// reference is returned.
pub struct ActorGuard {
    _guard: OwnedMutexGuard<()>,
    _slot: SlotRef,
}

struct SlotRef {
    actor: Uid,
    slots: Arc<Mutex<HashMap<Uid, Slot>>>,
}

impl Drop for SlotRef {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().expect("lock poisoned");
        if let Some(slot) = slots.get_mut(&self.actor) {
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(&self.actor);
            }
        }
    }
}

impl ActorLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `actor`.
    pub async fn lock(&self, actor: Uid) -> ActorGuard {
        let mutex = {
            let mut slots = self.slots.lock().expect("lock poisoned");
            let slot = slots.entry(actor).or_insert_with(|| Slot {
                mutex: Arc::new(AsyncMutex::new(())),
                refs: 0,
            });
            slot.refs += 1;
            slot.mutex.clone()
        };
        // Registered before awaiting so a cancelled wait still releases its ref.
        let slot = SlotRef {
            actor,
            slots: self.slots.clone(),
        };
        let guard = mutex.lock_owned().await;
        ActorGuard {
            _guard: guard,
            _slot: slot,
        }
    }

    /// Number of actors with a holder or waiter.
    pub fn len(&self) -> usize {
        self.slots.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn entry_removed_after_last_release() {
        let locks = ActorLocks::new();
        {
            let _a = locks.lock(Uid::new(1)).await;
            let _b = locks.lock(Uid::new(2)).await;
            assert_eq!(locks.len(), 2);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_actor_is_serialized() {
        let locks = Arc::new(ActorLocks::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let (locks, active, max) = (locks.clone(), active.clone(), max.clone());
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock(Uid::new(7)).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn different_actors_do_not_block() {
        let locks = ActorLocks::new();
        let _a = locks.lock(Uid::new(1)).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(Uid::new(2))).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn cancelled_wait_releases_ref() {
        let locks = ActorLocks::new();
        let held = locks.lock(Uid::new(1)).await;
        let waited = tokio::time::timeout(Duration::from_millis(10), locks.lock(Uid::new(1))).await;
        assert!(waited.is_err());
        drop(held);
        assert!(locks.is_empty());
    }
}
