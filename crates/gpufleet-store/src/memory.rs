//! Store facade and the in-memory store

use gpufleet_core::{
    ComputeNode, FleetError, FleetResult, Workload, WorkloadImage, WorkloadSpec,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::repository::{MemoryRepository, Repository};

/// Access to every record kind
pub trait FleetStore: Send + Sync {
    /// Compute nodes
    fn nodes(&self) -> &dyn Repository<ComputeNode>;
    /// Workload specs
    fn specs(&self) -> &dyn Repository<WorkloadSpec>;
    /// Workload images
    fn images(&self) -> &dyn Repository<WorkloadImage>;
    /// Workloads
    fn workloads(&self) -> &dyn Repository<Workload>;
}

/// Initial records loaded at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedFile {
    /// Compute nodes
    pub nodes: Vec<ComputeNode>,
    /// Workload specs
    pub specs: Vec<WorkloadSpec>,
    /// Workload images
    pub images: Vec<WorkloadImage>,
    /// Workloads
    pub workloads: Vec<Workload>,
}

/// Store keeping all records in process memory
#[derive(Default)]
pub struct MemoryStore {
    nodes: MemoryRepository<ComputeNode>,
    specs: MemoryRepository<WorkloadSpec>,
    images: MemoryRepository<WorkloadImage>,
    workloads: MemoryRepository<Workload>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store from a TOML seed file
    pub async fn from_seed(path: &Path) -> FleetResult<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            FleetError::Config(format!("Failed to read seed file {}: {}", path.display(), e))
        })?;
        let seed: SeedFile = toml::from_str(&content)?;
        let store = Self::new();
        store.load(seed).await?;
        info!(path = %path.display(), "Loaded seed records");
        Ok(store)
    }

    /// Insert every record of a seed
    pub async fn load(&self, seed: SeedFile) -> FleetResult<()> {
        let counts = (
            seed.nodes.len(),
            seed.specs.len(),
            seed.images.len(),
            seed.workloads.len(),
        );
        for node in seed.nodes {
            self.nodes.create(node).await?;
        }
        for spec in seed.specs {
            self.specs.create(spec).await?;
        }
        for image in seed.images {
            self.images.create(image).await?;
        }
        for workload in seed.workloads {
            self.workloads.create(workload).await?;
        }
        info!(
            nodes = counts.0,
            specs = counts.1,
            images = counts.2,
            workloads = counts.3,
            "Seeded store"
        );
        Ok(())
    }
}

impl FleetStore for MemoryStore {
    fn nodes(&self) -> &dyn Repository<ComputeNode> {
        &self.nodes
    }

    fn specs(&self) -> &dyn Repository<WorkloadSpec> {
        &self.specs
    }

    fn images(&self) -> &dyn Repository<WorkloadImage> {
        &self.images
    }

    fn workloads(&self) -> &dyn Repository<Workload> {
        &self.workloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{NodeFilter, SpecFilter};
    use gpufleet_core::WorkloadStatus;

    const SEED: &str = r#"
[[nodes]]
id = 1
name = "gpu-a"
engine_address = "tcp://10.0.0.5:2376"
use_tls = false
gpu_name = "A100-40G"
gpu_count = 2
gpu_memory_per_card_gb = 40

[[nodes]]
id = 2
name = "gpu-b"
listed = false

[[specs]]
id = 1
name = "a100-single"
gpu_count = 1
gpu_memory_gb = 40

[[images]]
id = 1
name = "pytorch"
address = "registry.local/pytorch:2.3"

[[workloads]]
id = 1
image_id = 1
spec_id = 1
node_id = 1
owner_id = 7
container_id = "abc123"
status = "running"
"#;

    #[tokio::test]
    async fn test_from_seed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.toml");
        std::fs::write(&path, SEED).unwrap();

        let store = MemoryStore::from_seed(&path).await.unwrap();
        let listed = store
            .nodes()
            .list(&NodeFilter {
                listed: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "gpu-a");
        assert!(!listed[0].use_tls);

        assert_eq!(store.specs().list(&SpecFilter::default()).await.unwrap().len(), 1);
        let workload = store.workloads().get(1).await.unwrap();
        assert_eq!(workload.status, WorkloadStatus::Running);

        let next = store.workloads().create(Workload::default()).await.unwrap();
        assert_eq!(next.id, 2);
    }

    #[tokio::test]
    async fn test_missing_seed_file() {
        let err = MemoryStore::from_seed(Path::new("/nonexistent/seed.toml"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FleetError::Config(_)));
    }
}
