//! Typed catalog projections used to populate selection lists

use serde::{Deserialize, Serialize};

use crate::model::{ComputeNode, RecordId, WorkloadImage, WorkloadSpec};

/// A listed image as offered to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageOption {
    /// Image name
    pub label: String,
    /// Image record id
    pub value: RecordId,
    /// Whether the image supports GPU memory partitioning
    pub supports_memory_split: bool,
}

impl From<&WorkloadImage> for ImageOption {
    fn from(image: &WorkloadImage) -> Self {
        Self {
            label: image.name.clone(),
            value: image.id,
            supports_memory_split: image.supports_memory_split,
        }
    }
}

/// A node entry used for filtering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOption {
    /// Node name
    pub label: String,
    /// Node record id
    pub value: RecordId,
}

impl From<&ComputeNode> for NodeOption {
    fn from(node: &ComputeNode) -> Self {
        Self {
            label: node.name.clone(),
            value: node.id,
        }
    }
}

/// A listed spec with its display label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecOption {
    /// Spec record id
    pub value: RecordId,
    /// Display label, see [`format_spec_label`]
    pub label: String,
    /// Spec name
    pub name: String,
    /// Required GPU model
    pub gpu_model: Option<String>,
    /// GPU cards requested
    pub gpu_count: u64,
    /// Total GPU memory in GB
    pub gpu_memory_gb: u64,
    /// CPU cores
    pub cpu_cores: u64,
    /// Memory in GB
    pub memory_gb: u64,
    /// System disk in GB
    pub system_disk_gb: u64,
    /// Data disk in GB
    pub data_disk_gb: u64,
    /// Hourly price
    pub price_per_hour: f64,
    /// Whether GPU memory may be split
    pub supports_memory_split: bool,
}

impl From<&WorkloadSpec> for SpecOption {
    fn from(spec: &WorkloadSpec) -> Self {
        Self {
            value: spec.id,
            label: format_spec_label(spec),
            name: spec.name.clone(),
            gpu_model: spec.gpu_model.clone(),
            gpu_count: spec.gpu_count,
            gpu_memory_gb: spec.gpu_memory_gb,
            cpu_cores: spec.cpu_cores,
            memory_gb: spec.memory_gb,
            system_disk_gb: spec.system_disk_gb,
            data_disk_gb: spec.data_disk_gb,
            price_per_hour: spec.price_per_hour,
            supports_memory_split: spec.supports_memory_split,
        }
    }
}

/// All selection lists in one response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogOptions {
    /// Listed images
    pub images: Vec<ImageOption>,
    /// Every node that is not deleted
    pub nodes: Vec<NodeOption>,
    /// Listed specs
    pub specs: Vec<SpecOption>,
}

/// Render a spec as `name | model x count | 8C | 32G RAM | sys 100G | data 500G`.
///
/// Segments whose value is absent or zero are omitted.
pub fn format_spec_label(spec: &WorkloadSpec) -> String {
    let mut label = spec.name.clone();
    if let Some(model) = spec.gpu_model.as_deref().filter(|m| !m.is_empty()) {
        label.push_str(" | ");
        label.push_str(model);
        if spec.gpu_count > 0 {
            label.push_str(&format!(" x {}", spec.gpu_count));
        }
    }
    if spec.cpu_cores > 0 {
        label.push_str(&format!(" | {}C", spec.cpu_cores));
    }
    if spec.memory_gb > 0 {
        label.push_str(&format!(" | {}G RAM", spec.memory_gb));
    }
    if spec.system_disk_gb > 0 {
        label.push_str(&format!(" | sys {}G", spec.system_disk_gb));
    }
    if spec.data_disk_gb > 0 {
        label.push_str(&format!(" | data {}G", spec.data_disk_gb));
    }
    label
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_label() {
        let spec = WorkloadSpec {
            name: "a100-single".to_string(),
            gpu_model: Some("A100-40G".to_string()),
            gpu_count: 1,
            cpu_cores: 8,
            memory_gb: 32,
            system_disk_gb: 100,
            data_disk_gb: 500,
            ..Default::default()
        };
        assert_eq!(
            format_spec_label(&spec),
            "a100-single | A100-40G x 1 | 8C | 32G RAM | sys 100G | data 500G"
        );
    }

    #[test]
    fn test_label_omits_empty_segments() {
        let spec = WorkloadSpec {
            name: "cpu-small".to_string(),
            cpu_cores: 2,
            memory_gb: 4,
            ..Default::default()
        };
        assert_eq!(format_spec_label(&spec), "cpu-small | 2C | 4G RAM");

        let spec = WorkloadSpec {
            name: "any-gpu".to_string(),
            gpu_model: Some("T4".to_string()),
            ..Default::default()
        };
        assert_eq!(format_spec_label(&spec), "any-gpu | T4");
    }

    #[test]
    fn test_spec_option_projection() {
        let spec = WorkloadSpec {
            id: 3,
            name: "split".to_string(),
            gpu_memory_gb: 20,
            supports_memory_split: true,
            price_per_hour: 1.5,
            ..Default::default()
        };
        let option = SpecOption::from(&spec);
        assert_eq!(option.value, 3);
        assert_eq!(option.label, "split");
        assert!(option.supports_memory_split);
        assert_eq!(option.gpu_memory_gb, 20);
    }
}
