//! Capacity scheduler
//!
//! Every request replays the workloads currently placed on each listed node
//! from the store and checks the spec against what is left. Nothing is
//! reserved between a candidate query and the placement that follows.

use gpufleet_core::{
    ComputeNode, FleetError, FleetResult, RecordId, WorkloadImage, WorkloadSpec,
};
use gpufleet_store::{FleetStore, NodeFilter, WorkloadFilter};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::placement::{
    evaluate, partition_enabled, NodeCandidate, NodeUsage, PackFirstStrategy, PlacementStrategy,
};

/// Finds nodes able to host a workload spec
pub struct CapacityScheduler {
    store: Arc<dyn FleetStore>,
    strategy: Arc<dyn PlacementStrategy>,
}

impl CapacityScheduler {
    /// Create a scheduler using the pack-first strategy
    pub fn new(store: Arc<dyn FleetStore>) -> Self {
        Self::with_strategy(store, Arc::new(PackFirstStrategy))
    }

    /// Create a scheduler with a custom placement strategy
    pub fn with_strategy(store: Arc<dyn FleetStore>, strategy: Arc<dyn PlacementStrategy>) -> Self {
        Self { store, strategy }
    }

    /// Candidate nodes for a spec by id, ordered by node id.
    ///
    /// Without an image the spec's own partitioning flag decides how GPU
    /// memory is claimed.
    pub async fn find_candidates(
        &self,
        spec_id: RecordId,
        image_id: Option<RecordId>,
    ) -> FleetResult<Vec<NodeCandidate>> {
        let spec = self.store.specs().get(spec_id).await?;
        let image = match image_id {
            Some(id) => Some(self.store.images().get(id).await?),
            None => None,
        };
        self.find_candidates_for(&spec, image.as_ref()).await
    }

    /// Check that `node` can still host `spec` running `image`
    pub async fn check_node(
        &self,
        node: &ComputeNode,
        spec: &WorkloadSpec,
        image: &WorkloadImage,
    ) -> FleetResult<NodeCandidate> {
        let usage = self.node_usage(std::slice::from_ref(node)).await?;
        let partitioned = partition_enabled(spec, Some(image));
        usage
            .get(&node.id)
            .and_then(|used| evaluate(node, used, spec, partitioned, self.strategy.as_ref()))
            .ok_or_else(|| {
                FleetError::InvalidRequest(format!(
                    "node {} has no capacity for spec {} with image {}",
                    node.id, spec.id, image.id
                ))
            })
    }

    /// Candidate nodes for a spec, optionally narrowed by the image to run.
    ///
    /// An empty result means no capacity, not an error.
    pub async fn find_candidates_for(
        &self,
        spec: &WorkloadSpec,
        image: Option<&WorkloadImage>,
    ) -> FleetResult<Vec<NodeCandidate>> {
        let nodes = self
            .store
            .nodes()
            .list(&NodeFilter {
                listed: Some(true),
                ..Default::default()
            })
            .await?;
        let usage = self.node_usage(&nodes).await?;
        let partitioned = partition_enabled(spec, image);

        let mut candidates: Vec<NodeCandidate> = nodes
            .iter()
            .filter_map(|node| {
                let used = usage.get(&node.id)?;
                let candidate = evaluate(node, used, spec, partitioned, self.strategy.as_ref());
                if candidate.is_none() {
                    debug!(node_id = node.id, spec_id = spec.id, "Node cannot host spec");
                }
                candidate
            })
            .collect();
        candidates.sort_by_key(|c| c.node_id);

        info!(
            spec_id = spec.id,
            nodes = nodes.len(),
            candidates = candidates.len(),
            partitioned,
            "Computed candidate nodes"
        );
        Ok(candidates)
    }

    /// Replay every workload holding capacity onto its node.
    ///
    /// Workloads on nodes outside `nodes`, or whose spec is gone, are skipped.
    pub async fn node_usage(
        &self,
        nodes: &[ComputeNode],
    ) -> FleetResult<HashMap<RecordId, NodeUsage>> {
        let mut usage: HashMap<RecordId, NodeUsage> =
            nodes.iter().map(|n| (n.id, NodeUsage::new(n))).collect();
        let mut specs: HashMap<RecordId, Option<WorkloadSpec>> = HashMap::new();
        let mut images: HashMap<RecordId, Option<WorkloadImage>> = HashMap::new();

        let workloads = self.store.workloads().list(&WorkloadFilter::default()).await?;
        for workload in workloads.iter().filter(|w| w.holds_capacity()) {
            let Some(node_usage) = usage.get_mut(&workload.node_id) else {
                continue;
            };
            if !specs.contains_key(&workload.spec_id) {
                let spec = self.store.specs().find(workload.spec_id).await?;
                specs.insert(workload.spec_id, spec);
            }
            if !images.contains_key(&workload.image_id) {
                let image = self.store.images().find(workload.image_id).await?;
                images.insert(workload.image_id, image);
            }
            let Some(Some(spec)) = specs.get(&workload.spec_id) else {
                warn!(
                    workload_id = workload.id,
                    spec_id = workload.spec_id,
                    "Workload references a missing spec, ignoring its usage"
                );
                continue;
            };
            let image = images.get(&workload.image_id).and_then(Option::as_ref);
            node_usage.add(spec, partition_enabled(spec, image), self.strategy.as_ref());
        }
        Ok(usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpufleet_core::{FleetError, Workload, WorkloadStatus};
    use gpufleet_store::MemoryStore;

    fn node(id: RecordId, gpu_count: u64) -> ComputeNode {
        ComputeNode {
            id,
            name: format!("gpu-{}", id),
            cpu_cores: 64,
            memory_gb: 512,
            system_disk_gb: 1000,
            data_disk_gb: 4000,
            gpu_name: Some("A100-40G".to_string()),
            gpu_count,
            gpu_memory_per_card_gb: 40,
            ..Default::default()
        }
    }

    fn spec(id: RecordId, gpu_count: u64, gpu_memory_gb: u64, split: bool) -> WorkloadSpec {
        WorkloadSpec {
            id,
            name: format!("spec-{}", id),
            gpu_count,
            gpu_memory_gb,
            cpu_cores: 4,
            memory_gb: 32,
            system_disk_gb: 50,
            data_disk_gb: 100,
            supports_memory_split: split,
            ..Default::default()
        }
    }

    fn image(id: RecordId, split: bool) -> WorkloadImage {
        WorkloadImage {
            id,
            name: format!("image-{}", id),
            address: "registry.local/cuda:12".to_string(),
            supports_memory_split: split,
            ..Default::default()
        }
    }

    async fn place(store: &MemoryStore, node_id: RecordId, spec_id: RecordId, image_id: RecordId) {
        store
            .workloads()
            .create(Workload {
                node_id,
                spec_id,
                image_id,
                container_id: Some("c".to_string()),
                status: WorkloadStatus::Running,
                ..Default::default()
            })
            .await
            .unwrap();
    }

    async fn setup() -> (Arc<MemoryStore>, CapacityScheduler) {
        let store = Arc::new(MemoryStore::new());
        store.specs().create(spec(1, 1, 40, false)).await.unwrap();
        store.specs().create(spec(2, 2, 20, true)).await.unwrap();
        store.specs().create(spec(3, 1, 5, true)).await.unwrap();
        store.images().create(image(1, false)).await.unwrap();
        store.images().create(image(2, true)).await.unwrap();
        let scheduler = CapacityScheduler::new(store.clone());
        (store, scheduler)
    }

    #[tokio::test]
    async fn test_whole_cards_exhaust_node() {
        let (store, scheduler) = setup().await;
        store.nodes().create(node(1, 2)).await.unwrap();

        place(&store, 1, 1, 1).await;
        let candidates = scheduler.find_candidates(1, None).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].available_gpus, 1);
        assert_eq!(candidates[0].available_gpu_memory_gb, 40);

        place(&store, 1, 1, 1).await;
        assert!(scheduler.find_candidates(1, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partitioned_request_packs_used_card() {
        let (store, scheduler) = setup().await;
        let gpu_node = node(1, 2);
        store.nodes().create(gpu_node.clone()).await.unwrap();
        place(&store, 1, 3, 2).await;

        let usage = scheduler.node_usage(&[gpu_node.clone()]).await.unwrap();
        assert_eq!(usage[&1].cards.usage(), &[5, 0]);

        let request = store.specs().get(2).await.unwrap();
        let candidates = scheduler
            .find_candidates_for(&request, Some(&image(2, true)))
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].available_gpus, 2);

        place(&store, 1, 2, 2).await;
        let usage = scheduler.node_usage(&[gpu_node]).await.unwrap();
        assert_eq!(usage[&1].cards.usage(), &[15, 10]);
        assert_eq!(usage[&1].cards.max_headroom(), 30);
    }

    #[tokio::test]
    async fn test_split_image_off_means_whole_cards() {
        let (store, scheduler) = setup().await;
        store.nodes().create(node(1, 2)).await.unwrap();
        place(&store, 1, 3, 2).await;

        let request = store.specs().get(2).await.unwrap();
        assert!(scheduler
            .find_candidates_for(&request, Some(&image(1, false)))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_image_narrows_candidate_query() {
        let (store, scheduler) = setup().await;
        store.nodes().create(node(1, 1)).await.unwrap();
        place(&store, 1, 3, 2).await;

        assert_eq!(scheduler.find_candidates(2, None).await.unwrap().len(), 0);
        assert_eq!(scheduler.find_candidates(3, None).await.unwrap().len(), 1);
        assert_eq!(scheduler.find_candidates(3, Some(2)).await.unwrap().len(), 1);
        assert!(scheduler.find_candidates(3, Some(1)).await.unwrap().is_empty());
        assert!(matches!(
            scheduler.find_candidates(3, Some(9)).await,
            Err(FleetError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_check_node_uses_image_flag() {
        let (store, scheduler) = setup().await;
        let gpu_node = node(1, 1);
        store.nodes().create(gpu_node.clone()).await.unwrap();
        place(&store, 1, 3, 2).await;

        let request = store.specs().get(3).await.unwrap();
        let fit = scheduler
            .check_node(&gpu_node, &request, &image(2, true))
            .await
            .unwrap();
        assert_eq!(fit.available_gpu_memory_gb, 35);
        assert!(matches!(
            scheduler.check_node(&gpu_node, &request, &image(1, false)).await,
            Err(FleetError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_replay_skips_failed_and_deleted() {
        let (store, scheduler) = setup().await;
        store.nodes().create(node(1, 1)).await.unwrap();

        let failed = Workload {
            node_id: 1,
            spec_id: 1,
            image_id: 1,
            status: WorkloadStatus::Failed,
            ..Default::default()
        };
        store.workloads().create(failed).await.unwrap();
        place(&store, 1, 1, 1).await;
        assert!(scheduler.find_candidates(1, None).await.unwrap().is_empty());

        let ids: Vec<RecordId> = store
            .workloads()
            .list(&WorkloadFilter::default())
            .await
            .unwrap()
            .iter()
            .map(|w| w.id)
            .collect();
        store.workloads().delete(&ids).await.unwrap();
        assert_eq!(scheduler.find_candidates(1, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unlisted_nodes_and_ordering() {
        let (store, scheduler) = setup().await;
        store.nodes().create(node(3, 1)).await.unwrap();
        store.nodes().create(node(1, 1)).await.unwrap();
        store
            .nodes()
            .create(ComputeNode {
                listed: false,
                ..node(2, 4)
            })
            .await
            .unwrap();

        let ids: Vec<RecordId> = scheduler
            .find_candidates(1, None)
            .await
            .unwrap()
            .iter()
            .map(|c| c.node_id)
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_candidacy_is_monotonic() {
        let (store, scheduler) = setup().await;
        store.nodes().create(node(1, 4)).await.unwrap();

        let mut previous = scheduler.find_candidates(3, None).await.unwrap();
        for spec_id in [3, 2, 1, 3, 2, 1, 2, 3, 3] {
            place(&store, 1, spec_id, 2).await;
            let current = scheduler.find_candidates(3, None).await.unwrap();
            assert!(current.len() <= previous.len());
            if let (Some(before), Some(after)) = (previous.first(), current.first()) {
                assert!(after.available_gpus <= before.available_gpus);
                assert!(after.available_cpu <= before.available_cpu);
                assert!(after.available_gpu_memory_gb <= before.available_gpu_memory_gb);
            }
            previous = current;
        }
    }

    #[tokio::test]
    async fn test_unknown_spec() {
        let (_store, scheduler) = setup().await;
        assert!(matches!(
            scheduler.find_candidates(99, None).await,
            Err(FleetError::NotFound(_))
        ));
    }
}
