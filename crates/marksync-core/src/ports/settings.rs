//! Settings store port
//!
//! Two persisted flags drive the manager: whether cloud synchronization is
//! enabled, and whether the initial synchronization for the current enable
//! has completed. Stores publish the enabled flag through a
//! [`tokio::sync::watch`] channel so the manager can follow external
//! changes.

use std::sync::Mutex;

use tokio::sync::watch;

/// Port trait for persisted synchronization settings
pub trait ISettingsStore: Send + Sync {
    fn is_cloud_sync_enabled(&self) -> bool;

    /// Persists the enabled flag and notifies subscribers
    ///
    /// # Errors
    /// Returns an error if the setting cannot be persisted
    fn set_cloud_sync_enabled(&self, enabled: bool) -> anyhow::Result<()>;

    fn initial_synchronization_completed(&self) -> bool;

    /// Persists the initial synchronization flag
    fn set_initial_synchronization_completed(&self, completed: bool) -> anyhow::Result<()>;

    /// Subscribes to changes of the enabled flag
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Settings kept in memory only
///
/// Used by embedders that persist settings elsewhere, and by tests.
#[derive(Debug)]
pub struct InMemorySettingsStore {
    enabled: watch::Sender<bool>,
    initial_synchronization_completed: Mutex<bool>,
}

impl InMemorySettingsStore {
    pub fn new(enabled: bool) -> Self {
        let (enabled, _) = watch::channel(enabled);
        Self {
            enabled,
            initial_synchronization_completed: Mutex::new(false),
        }
    }
}

impl Default for InMemorySettingsStore {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ISettingsStore for InMemorySettingsStore {
    fn is_cloud_sync_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    fn set_cloud_sync_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        self.enabled.send_replace(enabled);
        Ok(())
    }

    fn initial_synchronization_completed(&self) -> bool {
        self.initial_synchronization_completed
            .lock()
            .map(|flag| *flag)
            .unwrap_or(false)
    }

    fn set_initial_synchronization_completed(&self, completed: bool) -> anyhow::Result<()> {
        let mut flag = self
            .initial_synchronization_completed
            .lock()
            .map_err(|_| anyhow::anyhow!("settings lock poisoned"))?;
        *flag = completed;
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.enabled.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_store_flags() {
        let store = InMemorySettingsStore::new(false);
        assert!(!store.is_cloud_sync_enabled());
        assert!(!store.initial_synchronization_completed());

        store.set_cloud_sync_enabled(true).unwrap();
        store.set_initial_synchronization_completed(true).unwrap();
        assert!(store.is_cloud_sync_enabled());
        assert!(store.initial_synchronization_completed());
    }

    #[test]
    fn test_subscribers_see_changes() {
        let store = InMemorySettingsStore::new(false);
        let mut rx = store.subscribe();
        assert!(!*rx.borrow());

        store.set_cloud_sync_enabled(true).unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
    }
}
