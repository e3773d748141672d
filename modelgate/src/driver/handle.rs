use super::StorageDriver;
use crate::error::{ModelGateError, Result};
use parking_lot::RwLock;
use std::sync::Arc;

/// Shared slot holding the active driver. The database owns the slot; models
/// keep a clone and borrow the driver for one call at a time.
#[derive(Clone, Default)]
pub struct DriverHandle {
    slot: Arc<RwLock<Option<Arc<dyn StorageDriver>>>>,
}

impl DriverHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a driver, returning the one it replaces.
    pub fn attach(&self, driver: Arc<dyn StorageDriver>) -> Option<Arc<dyn StorageDriver>> {
        self.slot.write().replace(driver)
    }

    pub fn detach(&self) -> Option<Arc<dyn StorageDriver>> {
        self.slot.write().take()
    }

    pub fn is_attached(&self) -> bool {
        self.slot.read().is_some()
    }

    /// The current driver, or `NotConnected`.
    pub fn driver(&self) -> Result<Arc<dyn StorageDriver>> {
        self.slot.read().clone().ok_or(ModelGateError::NotConnected)
    }
}

impl std::fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverHandle")
            .field("attached", &self.is_attached())
            .finish()
    }
}
