//! Workload service
//!
//! Orchestrates the store, the container driver, telemetry and the capacity
//! scheduler on behalf of a principal. A record is only advanced after the
//! remote call it depends on has succeeded.

use chrono::Utc;
use gpufleet_core::{
    CatalogOptions, ComputeNode, FleetError, FleetResult, ImageOption, NodeConnectivity,
    NodeOption, Principal, RecordId, SpecOption, Workload, WorkloadStatus,
};
use gpufleet_runtime::{container_name, ContainerDriver, ContainerEngine, EngineConnector};
use gpufleet_store::{
    FleetStore, ImageFilter, NodeFilter, NodePatch, Page, Paged, SpecFilter, WorkloadFilter,
    WorkloadPatch,
};
use gpufleet_telemetry::{ContainerStats, TelemetryCollector};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::placement::NodeCandidate;
use crate::scheduler::CapacityScheduler;

/// Request to create a workload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateWorkload {
    /// Requested unit name
    #[serde(default)]
    pub name: Option<String>,
    /// Image to run
    pub image_id: RecordId,
    /// Sizing spec
    pub spec_id: RecordId,
    /// Target node
    pub node_id: RecordId,
    /// Free-form note
    #[serde(default)]
    pub remark: Option<String>,
}

/// Outcome of a liveness probe against a node's engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTest {
    /// Whether the engine answered
    pub ok: bool,
    /// Probe message
    pub message: String,
}

/// Workload orchestration over the base components
pub struct WorkloadService {
    store: Arc<dyn FleetStore>,
    connector: Arc<dyn EngineConnector>,
    driver: Arc<ContainerDriver>,
    telemetry: Arc<TelemetryCollector>,
    scheduler: CapacityScheduler,
}

impl WorkloadService {
    /// Create a service
    pub fn new(
        store: Arc<dyn FleetStore>,
        connector: Arc<dyn EngineConnector>,
        driver: Arc<ContainerDriver>,
        telemetry: Arc<TelemetryCollector>,
    ) -> Self {
        let scheduler = CapacityScheduler::new(store.clone());
        Self {
            store,
            connector,
            driver,
            telemetry,
            scheduler,
        }
    }

    /// Backing store
    pub fn store(&self) -> &Arc<dyn FleetStore> {
        &self.store
    }

    /// Container driver
    pub fn driver(&self) -> &Arc<ContainerDriver> {
        &self.driver
    }

    /// Capacity scheduler
    pub fn scheduler(&self) -> &CapacityScheduler {
        &self.scheduler
    }

    /// Nodes able to host a spec, optionally run with a given image
    pub async fn candidates(
        &self,
        spec_id: RecordId,
        image_id: Option<RecordId>,
    ) -> FleetResult<Vec<NodeCandidate>> {
        self.scheduler.find_candidates(spec_id, image_id).await
    }

    /// Create a workload and provision its execution unit
    pub async fn create(
        &self,
        principal: &Principal,
        request: CreateWorkload,
    ) -> FleetResult<Workload> {
        let image = self.store.images().get(request.image_id).await?;
        let spec = self.store.specs().get(request.spec_id).await?;
        let node = self.store.nodes().get(request.node_id).await?;
        if !node.listed {
            return Err(FleetError::InvalidRequest(format!(
                "node {} is not available for placement",
                node.id
            )));
        }
        self.scheduler.check_node(&node, &spec, &image).await?;

        let record = self
            .store
            .workloads()
            .create(Workload {
                name: request.name.clone(),
                image_id: image.id,
                spec_id: spec.id,
                node_id: node.id,
                owner_id: principal.user_id,
                status: WorkloadStatus::Creating,
                remark: request.remark.unwrap_or_default(),
                ..Default::default()
            })
            .await?;

        let name = container_name(request.name.as_deref(), record.id, Utc::now().timestamp());
        info!(
            workload_id = record.id,
            node_id = node.id,
            spec_id = spec.id,
            container = %name,
            "Provisioning workload"
        );

        match self.driver.provision(&node, &spec, &image, &name).await {
            Ok(unit) => {
                let patch = WorkloadPatch {
                    status: Some(WorkloadStatus::Running),
                    container_id: Some(unit.container_id),
                    container_name: Some(unit.container_name),
                    ..Default::default()
                };
                self.store.workloads().update(record.id, patch).await
            }
            Err(e) => {
                warn!(workload_id = record.id, error = %e, "Provisioning failed");
                self.store
                    .workloads()
                    .update(record.id, WorkloadPatch::status(WorkloadStatus::Failed))
                    .await?;
                Err(match e {
                    FleetError::ProvisionFailure(_) => e,
                    other => FleetError::ProvisionFailure(other.to_string()),
                })
            }
        }
    }

    /// Tear down a workload's unit and soft-delete its record.
    ///
    /// Teardown failures are logged; the record is removed regardless.
    pub async fn delete(&self, principal: &Principal, id: RecordId) -> FleetResult<()> {
        let workload = self.owned(principal, id).await?;

        if let Some(unit_id) = workload.unit_id() {
            match self.store.nodes().find(workload.node_id).await? {
                Some(node) => {
                    if let Err(e) = self
                        .driver
                        .teardown(&node, unit_id, workload.container_name.as_deref())
                        .await
                    {
                        warn!(workload_id = id, error = %e, "Teardown failed, removing record anyway");
                    }
                }
                None => warn!(
                    workload_id = id,
                    node_id = workload.node_id,
                    "Node is gone, skipping teardown"
                ),
            }
        }

        self.store
            .workloads()
            .update(id, WorkloadPatch::status(WorkloadStatus::Removed))
            .await?;
        self.store.workloads().delete(&[id]).await?;
        info!(workload_id = id, "Workload deleted");
        Ok(())
    }

    /// Delete several workloads, returning the ids removed.
    ///
    /// Other failures are skipped, but a permission failure aborts the batch.
    pub async fn delete_many(
        &self,
        principal: &Principal,
        ids: &[RecordId],
    ) -> FleetResult<Vec<RecordId>> {
        let mut deleted = Vec::with_capacity(ids.len());
        for id in ids {
            match self.delete(principal, *id).await {
                Ok(()) => deleted.push(*id),
                Err(e @ FleetError::PermissionDenied(_)) => return Err(e),
                Err(e) => warn!(workload_id = id, error = %e, "Skipping workload in batch delete"),
            }
        }
        Ok(deleted)
    }

    /// Start a workload's unit
    pub async fn start(&self, principal: &Principal, id: RecordId) -> FleetResult<Workload> {
        let (workload, node) = self.owned_unit(principal, id).await?;
        self.driver.start(&node, unit(&workload)?).await?;
        self.set_status(id, WorkloadStatus::Running).await
    }

    /// Stop a workload's unit
    pub async fn stop(&self, principal: &Principal, id: RecordId) -> FleetResult<Workload> {
        let (workload, node) = self.owned_unit(principal, id).await?;
        self.driver.stop(&node, unit(&workload)?).await?;
        self.set_status(id, WorkloadStatus::Stopped).await
    }

    /// Restart a workload's unit
    pub async fn restart(&self, principal: &Principal, id: RecordId) -> FleetResult<Workload> {
        let (workload, node) = self.owned_unit(principal, id).await?;
        self.driver.restart(&node, unit(&workload)?).await?;
        self.set_status(id, WorkloadStatus::Running).await
    }

    /// Refresh the stored status from the engine; a failed query stores `unknown`
    pub async fn sync_status(&self, id: RecordId) -> FleetResult<WorkloadStatus> {
        let workload = self.store.workloads().get(id).await?;
        let Some(unit_id) = workload.unit_id() else {
            return Ok(workload.status);
        };
        let node = self.store.nodes().get(workload.node_id).await?;

        let status = match self.driver.status(&node, unit_id).await {
            Ok(state) => WorkloadStatus::from_engine_state(&state),
            Err(e) => {
                debug!(workload_id = id, error = %e, "Status query failed");
                WorkloadStatus::Unknown
            }
        };
        if status != workload.status {
            self.set_status(id, status).await?;
        }
        Ok(status)
    }

    /// Live usage of a workload's unit
    pub async fn stats(&self, id: RecordId) -> FleetResult<ContainerStats> {
        let workload = self.store.workloads().get(id).await?;
        let node = self.store.nodes().get(workload.node_id).await?;
        self.telemetry.get_stats(&node, unit(&workload)?).await
    }

    /// Recent output of a workload's unit
    pub async fn logs(&self, id: RecordId, tail: Option<u64>) -> FleetResult<String> {
        let workload = self.store.workloads().get(id).await?;
        let node = self.store.nodes().get(workload.node_id).await?;
        self.driver.logs(&node, unit(&workload)?, tail).await
    }

    /// A workload by id
    pub async fn get(&self, id: RecordId) -> FleetResult<Workload> {
        self.store.workloads().get(id).await
    }

    /// Workloads visible to a principal; non-admins only see their own
    pub async fn list(
        &self,
        principal: &Principal,
        mut filter: WorkloadFilter,
        page: Page,
    ) -> FleetResult<Paged<Workload>> {
        if !principal.is_admin {
            filter.owner_id = Some(principal.user_id);
        }
        self.store.workloads().find_many(&filter, page).await
    }

    /// Engine and unit id for an interactive session on a workload
    pub async fn session_target(
        &self,
        principal: &Principal,
        id: RecordId,
    ) -> FleetResult<(Arc<dyn ContainerEngine>, String)> {
        let (workload, node) = self.owned_unit(principal, id).await?;
        let unit_id = unit(&workload)?.to_string();
        let engine = self.driver.engine(&node).await?;
        Ok((engine, unit_id))
    }

    /// Selection lists for building a create request
    pub async fn catalog(&self) -> FleetResult<CatalogOptions> {
        let listed = Some(true);
        let images = self
            .store
            .images()
            .list(&ImageFilter { listed })
            .await?;
        let nodes = self.store.nodes().list(&NodeFilter::default()).await?;
        let specs = self.store.specs().list(&SpecFilter { listed }).await?;
        Ok(CatalogOptions {
            images: images.iter().map(ImageOption::from).collect(),
            nodes: nodes.iter().map(NodeOption::from).collect(),
            specs: specs.iter().map(SpecOption::from).collect(),
        })
    }

    /// Compute nodes matching a filter
    pub async fn nodes(&self, filter: &NodeFilter) -> FleetResult<Vec<ComputeNode>> {
        self.store.nodes().list(filter).await
    }

    /// Probe and store a new node
    pub async fn register_node(&self, mut node: ComputeNode) -> FleetResult<ComputeNode> {
        node.id = 0;
        node.connectivity = self.probe(&node).await.connectivity();
        let node = self.store.nodes().create(node).await?;
        info!(node_id = node.id, name = %node.name, connectivity = %node.connectivity, "Node registered");
        Ok(node)
    }

    /// Probe and overwrite an existing node
    pub async fn update_node(&self, id: RecordId, mut node: ComputeNode) -> FleetResult<ComputeNode> {
        let existing = self.store.nodes().get(id).await?;
        node.id = existing.id;
        node.created_at = existing.created_at;
        node.connectivity = self.probe(&node).await.connectivity();
        let node = self.store.nodes().replace(node).await?;
        info!(node_id = node.id, connectivity = %node.connectivity, "Node updated");
        Ok(node)
    }

    /// Probe a stored node and persist the outcome
    pub async fn test_node(&self, id: RecordId) -> FleetResult<NodeTest> {
        let node = self.store.nodes().get(id).await?;
        let result = self.probe(&node).await;
        self.store
            .nodes()
            .update(
                id,
                NodePatch {
                    connectivity: Some(result.connectivity()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(result)
    }

    async fn probe(&self, node: &ComputeNode) -> NodeTest {
        let (ok, message) = self.connector.test_connection(node).await;
        if !ok {
            warn!(node = %node.name, message = %message, "Node liveness probe failed");
        }
        NodeTest { ok, message }
    }

    async fn owned(&self, principal: &Principal, id: RecordId) -> FleetResult<Workload> {
        let workload = self.store.workloads().get(id).await?;
        if !principal.can_manage(&workload) {
            return Err(FleetError::PermissionDenied(format!(
                "user {} may not manage workload {}",
                principal.user_id, id
            )));
        }
        Ok(workload)
    }

    async fn owned_unit(
        &self,
        principal: &Principal,
        id: RecordId,
    ) -> FleetResult<(Workload, ComputeNode)> {
        let workload = self.owned(principal, id).await?;
        unit(&workload)?;
        let node = self.store.nodes().get(workload.node_id).await?;
        Ok((workload, node))
    }

    async fn set_status(&self, id: RecordId, status: WorkloadStatus) -> FleetResult<Workload> {
        self.store
            .workloads()
            .update(id, WorkloadPatch::status(status))
            .await
    }
}

impl NodeTest {
    /// Connectivity recorded for this outcome
    pub fn connectivity(&self) -> NodeConnectivity {
        if self.ok {
            NodeConnectivity::Connected
        } else {
            NodeConnectivity::Failed
        }
    }
}

fn unit(workload: &Workload) -> FleetResult<&str> {
    workload.unit_id().ok_or_else(|| {
        FleetError::InvalidRequest(format!("workload {} has no execution unit", workload.id))
    })
}
