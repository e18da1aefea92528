use serde::{Deserialize, Serialize};

use crate::cluster::ClusterConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Memberlist,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "memberlist" => Ok(StoreBackend::Memberlist),
            other => Err(format!("unknown alert store type {:?}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertStoreConfig {
    pub backend: StoreBackend,
    /// Maximum number of records kept.
    pub size: usize,
    pub cluster: ClusterConfig,
}

impl Default for AlertStoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            size: 10,
            cluster: ClusterConfig::default(),
        }
    }
}

impl AlertStoreConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.size == 0 {
            return Err("Alert store size must be greater than zero".to_string());
        }
        Ok(())
    }
}
