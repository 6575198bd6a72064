//! Record kinds, filters and patches

use chrono::{DateTime, Utc};
use gpufleet_core::{
    ComputeNode, NodeConnectivity, RecordId, Workload, WorkloadImage, WorkloadSpec, WorkloadStatus,
};
use serde::{Deserialize, Serialize};

/// A persisted record kind
pub trait Record: Clone + Send + Sync + 'static {
    /// Query filter for this kind
    type Filter: Default + Send + Sync;
    /// Partial field update for this kind
    type Patch: Send + Sync;

    /// Kind name used in error messages
    const KIND: &'static str;

    /// Record identifier
    fn id(&self) -> RecordId;
    /// Assign the record identifier
    fn set_id(&mut self, id: RecordId);
    /// Set creation and update timestamps
    fn stamp_created(&mut self, now: DateTime<Utc>);
    /// Set the update timestamp
    fn touch(&mut self, now: DateTime<Utc>);
    /// Soft-delete marker
    fn deleted_at(&self) -> Option<DateTime<Utc>>;
    /// Stamp the soft-delete marker
    fn mark_deleted(&mut self, now: DateTime<Utc>);
    /// Whether the record passes the filter
    fn matches(&self, filter: &Self::Filter) -> bool;
    /// Apply a partial update
    fn apply(&mut self, patch: Self::Patch);

    /// Whether the record has been soft-deleted
    fn is_deleted(&self) -> bool {
        self.deleted_at().is_some()
    }
}

macro_rules! record_bookkeeping {
    () => {
        fn id(&self) -> RecordId {
            self.id
        }

        fn set_id(&mut self, id: RecordId) {
            self.id = id;
        }

        fn stamp_created(&mut self, now: DateTime<Utc>) {
            self.created_at = now;
            self.updated_at = now;
        }

        fn touch(&mut self, now: DateTime<Utc>) {
            self.updated_at = now;
        }

        fn deleted_at(&self) -> Option<DateTime<Utc>> {
            self.deleted_at
        }

        fn mark_deleted(&mut self, now: DateTime<Utc>) {
            self.deleted_at = Some(now);
            self.updated_at = now;
        }
    };
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Node query filter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeFilter {
    /// Name substring
    pub name: Option<String>,
    /// Region substring
    pub region: Option<String>,
    /// GPU model substring
    pub gpu_name: Option<String>,
    /// Catalog flag
    pub listed: Option<bool>,
}

/// Node field update
#[derive(Debug, Clone, Default)]
pub struct NodePatch {
    /// New connectivity status
    pub connectivity: Option<NodeConnectivity>,
    /// New catalog flag
    pub listed: Option<bool>,
    /// New note
    pub remark: Option<String>,
}

impl Record for ComputeNode {
    type Filter = NodeFilter;
    type Patch = NodePatch;

    const KIND: &'static str = "node";

    record_bookkeeping!();

    fn matches(&self, filter: &NodeFilter) -> bool {
        if let Some(name) = &filter.name {
            if !contains_ci(&self.name, name) {
                return false;
            }
        }
        if let Some(region) = &filter.region {
            if !contains_ci(&self.region, region) {
                return false;
            }
        }
        if let Some(gpu) = &filter.gpu_name {
            match &self.gpu_name {
                Some(own) if contains_ci(own, gpu) => {}
                _ => return false,
            }
        }
        filter.listed.map_or(true, |listed| self.listed == listed)
    }

    fn apply(&mut self, patch: NodePatch) {
        if let Some(connectivity) = patch.connectivity {
            self.connectivity = connectivity;
        }
        if let Some(listed) = patch.listed {
            self.listed = listed;
        }
        if let Some(remark) = patch.remark {
            self.remark = remark;
        }
    }
}

/// Spec query filter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecFilter {
    /// Catalog flag
    pub listed: Option<bool>,
}

/// Spec field update
#[derive(Debug, Clone, Default)]
pub struct SpecPatch {
    /// New catalog flag
    pub listed: Option<bool>,
    /// New hourly price
    pub price_per_hour: Option<f64>,
}

impl Record for WorkloadSpec {
    type Filter = SpecFilter;
    type Patch = SpecPatch;

    const KIND: &'static str = "spec";

    record_bookkeeping!();

    fn matches(&self, filter: &SpecFilter) -> bool {
        filter.listed.map_or(true, |listed| self.listed == listed)
    }

    fn apply(&mut self, patch: SpecPatch) {
        if let Some(listed) = patch.listed {
            self.listed = listed;
        }
        if let Some(price) = patch.price_per_hour {
            self.price_per_hour = price;
        }
    }
}

/// Image query filter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageFilter {
    /// Catalog flag
    pub listed: Option<bool>,
}

/// Image field update
#[derive(Debug, Clone, Default)]
pub struct ImagePatch {
    /// New catalog flag
    pub listed: Option<bool>,
}

impl Record for WorkloadImage {
    type Filter = ImageFilter;
    type Patch = ImagePatch;

    const KIND: &'static str = "image";

    record_bookkeeping!();

    fn matches(&self, filter: &ImageFilter) -> bool {
        filter.listed.map_or(true, |listed| self.listed == listed)
    }

    fn apply(&mut self, patch: ImagePatch) {
        if let Some(listed) = patch.listed {
            self.listed = listed;
        }
    }
}

/// Workload query filter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkloadFilter {
    /// Owning principal
    pub owner_id: Option<RecordId>,
    /// Hosting node
    pub node_id: Option<RecordId>,
    /// Sizing spec
    pub spec_id: Option<RecordId>,
    /// Image
    pub image_id: Option<RecordId>,
    /// Lifecycle status
    pub status: Option<WorkloadStatus>,
    /// Substring of the name or container id
    pub search: Option<String>,
    /// Only workloads with (or without) an execution unit
    pub has_unit: Option<bool>,
}

impl WorkloadFilter {
    /// Workloads placed on one node
    pub fn on_node(node_id: RecordId) -> Self {
        Self {
            node_id: Some(node_id),
            ..Default::default()
        }
    }
}

/// Workload field update
#[derive(Debug, Clone, Default)]
pub struct WorkloadPatch {
    /// New lifecycle status
    pub status: Option<WorkloadStatus>,
    /// Execution unit id
    pub container_id: Option<String>,
    /// Execution unit name
    pub container_name: Option<String>,
    /// New note
    pub remark: Option<String>,
}

impl WorkloadPatch {
    /// Only change the status
    pub fn status(status: WorkloadStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

impl Record for Workload {
    type Filter = WorkloadFilter;
    type Patch = WorkloadPatch;

    const KIND: &'static str = "workload";

    record_bookkeeping!();

    fn matches(&self, filter: &WorkloadFilter) -> bool {
        if filter.owner_id.is_some_and(|id| id != self.owner_id)
            || filter.node_id.is_some_and(|id| id != self.node_id)
            || filter.spec_id.is_some_and(|id| id != self.spec_id)
            || filter.image_id.is_some_and(|id| id != self.image_id)
            || filter.status.is_some_and(|s| s != self.status)
        {
            return false;
        }
        if let Some(has_unit) = filter.has_unit {
            if self.unit_id().is_some() != has_unit {
                return false;
            }
        }
        if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
            let in_name = self.name.as_deref().is_some_and(|n| contains_ci(n, search));
            let in_unit = self
                .container_id
                .as_deref()
                .is_some_and(|c| contains_ci(c, search));
            if !in_name && !in_unit {
                return false;
            }
        }
        true
    }

    fn apply(&mut self, patch: WorkloadPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(id) = patch.container_id {
            self.container_id = Some(id);
        }
        if let Some(name) = patch.container_name {
            self.container_name = Some(name);
        }
        if let Some(remark) = patch.remark {
            self.remark = remark;
        }
    }
}
