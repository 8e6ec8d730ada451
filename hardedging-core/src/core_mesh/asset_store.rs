//! Assets this node can serve. Records are immutable: the first seed of an
//! id wins and later seeds of the same id are ignored.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::errors::{MeshError, MeshResult};
use super::types::AssetRecord;

pub struct AssetStore {
    assets: HashMap<String, Arc<AssetRecord>>,
    max_asset_size: usize,
}

impl AssetStore {
    pub fn new(max_asset_size: usize) -> Self {
        AssetStore { assets: HashMap::new(), max_asset_size }
    }

    /// Returns `Ok(true)` when the record was added, `Ok(false)` when the id already existed
    pub fn seed(&mut self, record: AssetRecord) -> MeshResult<bool> {
        if record.len() > self.max_asset_size {
            return Err(MeshError::AssetTooLarge {
                asset_id: record.id,
                size: record.bytes.len(),
                limit: self.max_asset_size,
            });
        }
        if self.assets.contains_key(&record.id) {
            debug!(asset_id = %record.id, "Asset already seeded, keeping first record");
            return Ok(false);
        }
        debug!(asset_id = %record.id, bytes = record.len(), "Asset seeded");
        self.assets.insert(record.id.clone(), Arc::new(record));
        Ok(true)
    }

    pub fn get(&self, asset_id: &str) -> Option<Arc<AssetRecord>> {
        self.assets.get(asset_id).cloned()
    }

    pub fn contains(&self, asset_id: &str) -> bool {
        self.assets.contains_key(asset_id)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn max_asset_size(&self) -> usize {
        self.max_asset_size
    }
}
