//! Mutual exclusion over live backup targets.
//!
//! A full backup or restore touches everything and takes the global lock
//! exclusively. Instance and database operations share the global lock and
//! hold their own key exclusively, so work on different targets proceeds in
//! parallel while two operations on the same target never interleave.

use crate::backup::model::BackupTarget;
use std::collections::HashSet;
use std::sync::{Condvar, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

static DATABASE_KEY: &str = "database";

#[derive(Debug, Default)]
pub struct TargetLocks {
    global: RwLock<()>,
    busy: Mutex<HashSet<String>>,
    released: Condvar,
}

#[derive(Debug)]
enum GlobalGuard<'a> {
    Shared(#[allow(dead_code)] RwLockReadGuard<'a, ()>),
    Exclusive(#[allow(dead_code)] RwLockWriteGuard<'a, ()>),
}

/// Held for as long as the target must not be touched by anyone else.
#[derive(Debug)]
pub struct TargetGuard<'a> {
    locks: &'a TargetLocks,
    key: Option<String>,
    _global: GlobalGuard<'a>,
}

impl TargetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, target: &BackupTarget) -> TargetGuard<'_> {
        let key = match target {
            BackupTarget::Full => {
                let global = self.global.write().unwrap_or_else(PoisonError::into_inner);
                return TargetGuard {
                    locks: self,
                    key: None,
                    _global: GlobalGuard::Exclusive(global),
                };
            }
            BackupTarget::Instance(id) => format!("instance:{id}"),
            BackupTarget::Database => DATABASE_KEY.to_string(),
        };

        let global = self.global.read().unwrap_or_else(PoisonError::into_inner);
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        while busy.contains(&key) {
            busy = self
                .released
                .wait(busy)
                .unwrap_or_else(PoisonError::into_inner);
        }
        busy.insert(key.clone());

        TargetGuard {
            locks: self,
            key: Some(key),
            _global: GlobalGuard::Shared(global),
        }
    }
}

impl Drop for TargetGuard<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let mut busy = self.locks.busy.lock().unwrap_or_else(PoisonError::into_inner);
            busy.remove(&key);
            self.locks.released.notify_all();
        }
    }
}
