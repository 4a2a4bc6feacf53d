//! Per-group logical locks.
//!
//! One mutex per local group reference. Passes over different groups never
//! contend; two passes over the same group run one after the other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

use crate::models::LocalReference;

/// Registry of group locks. Cloning shares the registry.
#[derive(Debug, Clone, Default)]
pub struct GroupLocks {
    locks: Arc<Mutex<HashMap<LocalReference, Arc<Mutex<()>>>>>,
}

impl GroupLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock guarding `group`, created on first use.
    pub fn handle(&self, group: &LocalReference) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| {
            warn!("group lock registry was poisoned, recovering");
            poisoned.into_inner()
        });
        Arc::clone(locks.entry(group.clone()).or_default())
    }
}

/// Lock `handle`, recovering from poisoning.
pub fn acquire(handle: &Mutex<()>) -> MutexGuard<'_, ()> {
    handle.lock().unwrap_or_else(|poisoned| {
        warn!("group lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_same_group_shares_lock() {
        let locks = GroupLocks::new();
        let staff = LocalReference::new("xwiki", "XWiki", "Staff");
        let sales = LocalReference::new("xwiki", "XWiki", "Sales");
        assert!(Arc::ptr_eq(&locks.handle(&staff), &locks.clone().handle(&staff)));
        assert!(!Arc::ptr_eq(&locks.handle(&staff), &locks.handle(&sales)));
    }

    #[test]
    fn test_same_group_is_serialized() {
        let locks = GroupLocks::new();
        let group = LocalReference::new("xwiki", "XWiki", "Staff");
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let locks = locks.clone();
                let group = group.clone();
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    let handle = locks.handle(&group);
                    let _guard = acquire(&handle);
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_different_groups_do_not_block() {
        let locks = GroupLocks::new();
        let staff = locks.handle(&LocalReference::new("xwiki", "XWiki", "Staff"));
        let _held = acquire(&staff);
        let sales = locks.handle(&LocalReference::new("xwiki", "XWiki", "Sales"));
        assert!(sales.try_lock().is_ok());
    }
}
