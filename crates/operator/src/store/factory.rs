use std::sync::Arc;

use crate::store::{AlertStore, AlertStoreConfig, MemoryStore, ReplicatedStore, StoreBackend};

pub fn create_store(config: &AlertStoreConfig) -> crate::Result<Arc<dyn AlertStore>> {
    config.validate().map_err(crate::Error::Config)?;

    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new(config.size))),
        StoreBackend::Memberlist => Ok(Arc::new(ReplicatedStore::new(
            config.cluster.clone(),
            config.size,
        ))),
    }
}
