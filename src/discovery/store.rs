//! Canonical asset inventory with snapshot reads.

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{AssetDiscoveryEngine, Inventory, InventoryDelta};
use crate::core::Result;

/// Holds the current inventory snapshot.
///
/// Readers get an `Arc` to an immutable snapshot that stays consistent for
/// as long as they hold it. Only one re-scan runs at a time; a finished
/// re-scan swaps in a new snapshot without touching the old one.
#[derive(Debug)]
pub struct AssetStore {
    current: RwLock<Arc<Inventory>>,
    writer: Mutex<()>,
}

impl AssetStore {
    /// Create a store seeded with an existing inventory.
    pub fn new(initial: Inventory) -> Self {
        Self { current: RwLock::new(Arc::new(initial)), writer: Mutex::new(()) }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<Inventory> {
        self.current.read().clone()
    }

    /// Re-scan `root` and publish the result.
    ///
    /// Blocks while another re-scan holds the writer slot. Returns the new
    /// snapshot together with its delta against the one it replaced.
    pub fn rescan(
        &self,
        engine: &AssetDiscoveryEngine,
        root: &Path,
    ) -> Result<(Arc<Inventory>, InventoryDelta)> {
        let _writer = self.writer.lock();

        let fresh = Arc::new(engine.discover(root)?);
        let previous = {
            let mut current = self.current.write();
            std::mem::replace(&mut *current, Arc::clone(&fresh))
        };

        let delta = fresh.diff(&previous);
        tracing::debug!(
            added = delta.added.len(),
            removed = delta.removed.len(),
            changed = delta.changed.len(),
            "Inventory snapshot replaced"
        );

        Ok((fresh, delta))
    }
}

impl Default for AssetStore {
    fn default() -> Self {
        Self::new(Inventory::empty(""))
    }
}
