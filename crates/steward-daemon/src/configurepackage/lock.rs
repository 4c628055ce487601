//! Per-package mutual exclusion.
//!
//! One mutex guards one map of package name to in-progress action; there is
//! never a mutex per package. The agent is a singleton on the host, so the
//! lock does not need to reach across processes.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::PackageError;

/// Process-wide registry of in-progress package actions.
#[derive(Debug, Default)]
pub struct PackageLockSet {
    held: Mutex<HashMap<String, String>>,
}

impl PackageLockSet {
    /// Creates an empty lock set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims `name` for `action`.
    ///
    /// The returned guard releases the claim when dropped, which covers
    /// every exit path of the caller.
    ///
    /// # Errors
    ///
    /// Returns [`PackageError::AlreadyLocked`] naming the in-progress
    /// action when any action already holds the package.
    pub fn lock(&self, name: &str, action: &str) -> Result<PackageLockGuard<'_>, PackageError> {
        let mut held = self.held();
        if let Some(current) = held.get(name) {
            return Err(PackageError::AlreadyLocked {
                name: name.to_string(),
                action: current.clone(),
            });
        }
        held.insert(name.to_string(), action.to_string());
        Ok(PackageLockGuard {
            set: self,
            name: name.to_string(),
        })
    }

    /// Action currently holding `name`, if any.
    #[must_use]
    pub fn action_in_progress(&self, name: &str) -> Option<String> {
        self.held().get(name).cloned()
    }

    fn unlock(&self, name: &str) {
        self.held().remove(name);
    }
}

/// Releases a package claim on drop.
#[derive(Debug)]
pub struct PackageLockGuard<'a> {
    set: &'a PackageLockSet,
    name: String,
}

impl Drop for PackageLockGuard<'_> {
    fn drop(&mut self) {
        self.set.unlock(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_refuses_second_action_even_a_different_one() {
        let locks = PackageLockSet::new();
        let _guard = locks.lock("Foo", "Install").unwrap();

        let err = locks.lock("Foo", "Uninstall").unwrap_err();
        assert!(err
            .to_string()
            .contains(r#"Package "Foo" is already in the process of action "Install""#));
    }

    #[test]
    fn unlock_on_drop_allows_relocking() {
        let locks = PackageLockSet::new();
        {
            let _guard = locks.lock("Bar", "Install").unwrap();
            assert_eq!(locks.action_in_progress("Bar").as_deref(), Some("Install"));
        }
        assert!(locks.action_in_progress("Bar").is_none());

        let _guard = locks.lock("Bar", "Uninstall").unwrap();
        assert_eq!(locks.action_in_progress("Bar").as_deref(), Some("Uninstall"));
    }

    #[test]
    fn distinct_packages_lock_independently() {
        let locks = PackageLockSet::new();
        let _foo = locks.lock("Foo", "Install").unwrap();
        let _bar = locks.lock("Bar", "Uninstall").unwrap();
        assert!(locks.action_in_progress("Foo").is_some());
        assert!(locks.action_in_progress("Bar").is_some());
    }

    #[test]
    fn lock_held_across_threads_blocks_the_other_thread() {
        use std::sync::mpsc::channel;
        use std::sync::Arc;

        let locks = Arc::new(PackageLockSet::new());
        let (held_tx, held_rx) = channel();
        let (release_tx, release_rx) = channel::<()>();

        let remote = Arc::clone(&locks);
        let handle = std::thread::spawn(move || {
            let _guard = remote.lock("Foobar", "Install").unwrap();
            held_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });

        held_rx.recv().unwrap();
        assert!(locks.lock("Foobar", "Install").is_err());
        release_tx.send(()).unwrap();
        handle.join().unwrap();

        assert!(locks.lock("Foobar", "Install").is_ok());
    }
}
