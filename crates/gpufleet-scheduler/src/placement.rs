//! Placement decisions: which cards a claim lands on and whether a node fits

use gpufleet_core::{ComputeNode, RecordId, WorkloadImage, WorkloadSpec};
use serde::{Deserialize, Serialize};

use crate::gpu_allocator::{CardClaim, CardLedger};

/// Strategy for choosing the card of the next slice of a claim
pub trait PlacementStrategy: Send + Sync {
    /// Pick a card not in `chosen`, or `None` when no card fits
    fn pick_card(&self, ledger: &CardLedger, claim: &CardClaim, chosen: &[usize]) -> Option<usize>;
}

/// Packs partitioned slices onto partially used cards before opening new ones.
///
/// Among partially used cards the one with the least headroom that still fits
/// wins, ties going to the lowest index. Whole-card claims take the lowest
/// untouched cards.
pub struct PackFirstStrategy;

impl PlacementStrategy for PackFirstStrategy {
    fn pick_card(&self, ledger: &CardLedger, claim: &CardClaim, chosen: &[usize]) -> Option<usize> {
        let mut open = (0..ledger.card_count()).filter(|card| !chosen.contains(card));
        match claim {
            CardClaim::Whole { .. } => open.find(|card| ledger.is_unused(*card)),
            CardClaim::Partitioned { slice_gb, .. } => {
                let open: Vec<usize> = open.collect();
                open.iter()
                    .copied()
                    .filter(|card| !ledger.is_unused(*card) && ledger.headroom(*card) >= *slice_gb)
                    .min_by_key(|card| (ledger.headroom(*card), *card))
                    .or_else(|| {
                        open.iter().copied().find(|card| {
                            ledger.is_unused(*card) && ledger.per_card_gb() >= *slice_gb
                        })
                    })
            }
        }
    }
}

/// Whether a workload of `spec` running `image` gets partitioned GPU memory
pub fn partition_enabled(spec: &WorkloadSpec, image: Option<&WorkloadImage>) -> bool {
    spec.supports_memory_split && image.map_or(true, |i| i.supports_memory_split)
}

/// Resources already committed on a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeUsage {
    /// CPU cores committed
    pub cpu_cores: u64,
    /// Memory committed in GB
    pub memory_gb: u64,
    /// System disk committed in GB
    pub system_disk_gb: u64,
    /// Data disk committed in GB
    pub data_disk_gb: u64,
    /// Per-card GPU memory
    pub cards: CardLedger,
}

impl NodeUsage {
    /// Usage of a node with nothing placed
    pub fn new(node: &ComputeNode) -> Self {
        Self {
            cpu_cores: 0,
            memory_gb: 0,
            system_disk_gb: 0,
            data_disk_gb: 0,
            cards: CardLedger::new(node.gpu_count, node.gpu_memory_per_card_gb),
        }
    }

    /// Account for one existing workload
    pub fn add(&mut self, spec: &WorkloadSpec, partitioned: bool, strategy: &dyn PlacementStrategy) {
        self.cpu_cores += spec.cpu_cores;
        self.memory_gb += spec.memory_gb;
        self.system_disk_gb += spec.system_disk_gb;
        self.data_disk_gb += spec.data_disk_gb;
        if let Some(claim) = CardClaim::new(
            spec.gpu_count,
            spec.gpu_memory_gb,
            partitioned,
            self.cards.per_card_gb(),
        ) {
            self.cards.replay(&claim, strategy);
        }
    }
}

/// A node able to host a spec, with what remains free on it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCandidate {
    /// Node id
    pub node_id: RecordId,
    /// Node name
    pub name: String,
    /// Region label
    pub region: String,
    /// GPU model name
    pub gpu_name: Option<String>,
    /// Cards on the node
    pub gpu_count: u64,
    /// Cards a placement of this spec could still use
    pub available_gpus: u64,
    /// CPU cores on the node
    pub cpu_cores: u64,
    /// Free CPU cores
    pub available_cpu: u64,
    /// Memory on the node in GB
    pub memory_gb: u64,
    /// Free memory in GB
    pub available_memory_gb: u64,
    /// System disk on the node in GB
    pub system_disk_gb: u64,
    /// Free system disk in GB
    pub available_system_disk_gb: u64,
    /// Data disk on the node in GB
    pub data_disk_gb: u64,
    /// Free data disk in GB
    pub available_data_disk_gb: u64,
    /// Largest free GPU memory on a single card in GB
    pub available_gpu_memory_gb: u64,
    /// Public address
    pub public_ip: String,
    /// Hourly price of the spec
    pub price_per_hour: f64,
}

fn remaining(total: u64, used: u64, required: u64) -> Option<u64> {
    total.checked_sub(used).filter(|free| *free >= required)
}

/// Check a node against a spec on top of its current usage.
///
/// The GPU claim is simulated on a copy of the ledger; `usage` is untouched.
pub fn evaluate(
    node: &ComputeNode,
    usage: &NodeUsage,
    spec: &WorkloadSpec,
    partitioned: bool,
    strategy: &dyn PlacementStrategy,
) -> Option<NodeCandidate> {
    let needs_gpu = spec.requires_gpu();
    if needs_gpu {
        if let (Some(wanted), Some(offered)) = (&spec.gpu_model, &node.gpu_name) {
            if wanted != offered {
                return None;
            }
        }
    }

    let available_cpu = remaining(node.cpu_cores, usage.cpu_cores, spec.cpu_cores)?;
    let available_memory_gb = remaining(node.memory_gb, usage.memory_gb, spec.memory_gb)?;
    let available_system_disk_gb =
        remaining(node.system_disk_gb, usage.system_disk_gb, spec.system_disk_gb)?;
    let available_data_disk_gb =
        remaining(node.data_disk_gb, usage.data_disk_gb, spec.data_disk_gb)?;

    let mut available_gpus = 0;
    if let Some(claim) = needs_gpu
        .then(|| {
            CardClaim::new(
                spec.gpu_count,
                spec.gpu_memory_gb,
                partitioned,
                node.gpu_memory_per_card_gb,
            )
        })
        .flatten()
    {
        usage.cards.clone().allocate(&claim, strategy)?;
        available_gpus = match claim {
            CardClaim::Partitioned { slice_gb, .. } => usage.cards.cards_with_headroom(slice_gb),
            CardClaim::Whole { .. } => usage.cards.unused_cards(),
        };
        if available_gpus < spec.gpu_count {
            return None;
        }
    }

    let available_gpu_memory_gb = if usage.cards.card_count() == 0 {
        node.gpu_memory_per_card_gb
    } else {
        usage.cards.max_headroom()
    };

    Some(NodeCandidate {
        node_id: node.id,
        name: node.name.clone(),
        region: node.region.clone(),
        gpu_name: node.gpu_name.clone(),
        gpu_count: node.gpu_count,
        available_gpus,
        cpu_cores: node.cpu_cores,
        available_cpu,
        memory_gb: node.memory_gb,
        available_memory_gb,
        system_disk_gb: node.system_disk_gb,
        available_system_disk_gb,
        data_disk_gb: node.data_disk_gb,
        available_data_disk_gb,
        available_gpu_memory_gb,
        public_ip: node.public_ip.clone(),
        price_per_hour: spec.price_per_hour,
    })
}
