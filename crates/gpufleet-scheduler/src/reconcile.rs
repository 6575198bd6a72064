//! Periodic reconciliation of node connectivity and workload status
//!
//! Each pass walks its records sequentially with a small pause between
//! items. A pass that is triggered while the previous one is still running
//! is skipped.

use gpufleet_core::{FleetResult, NodeConnectivity, ReconcileConfig, WorkloadStatus};
use gpufleet_store::{NodeFilter, NodePatch, WorkloadFilter, WorkloadPatch};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::service::WorkloadService;

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Records examined
    pub checked: usize,
    /// Records whose stored state changed
    pub changed: usize,
    /// Records that could not be examined
    pub failed: usize,
    /// The pass did not run because another one was in flight
    pub skipped: bool,
}

/// Re-derives node connectivity and workload status from the engines
pub struct ReconciliationLoop {
    service: Arc<WorkloadService>,
    config: ReconcileConfig,
    nodes_running: Mutex<()>,
    workloads_running: Mutex<()>,
}

impl ReconciliationLoop {
    /// Create a loop over the service's records
    pub fn new(service: Arc<WorkloadService>, config: ReconcileConfig) -> Self {
        Self {
            service,
            config,
            nodes_running: Mutex::new(()),
            workloads_running: Mutex::new(()),
        }
    }

    fn pacing(&self) -> Duration {
        Duration::from_millis(self.config.pacing_ms)
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.config.probe_timeout_secs)
    }

    /// Probe every node and persist connectivity changes
    pub async fn recheck_nodes(&self) -> FleetResult<ReconcileReport> {
        let Ok(_guard) = self.nodes_running.try_lock() else {
            debug!("Node recheck already running, skipping");
            return Ok(ReconcileReport {
                skipped: true,
                ..Default::default()
            });
        };

        let nodes = self.service.nodes(&NodeFilter::default()).await?;
        let mut report = ReconcileReport::default();
        for (i, node) in nodes.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.pacing()).await;
            }
            report.checked += 1;
            match timeout(self.probe_timeout(), self.service.test_node(node.id)).await {
                Ok(Ok(result)) => {
                    if result.connectivity() != node.connectivity {
                        info!(
                            node_id = node.id,
                            from = %node.connectivity,
                            to = %result.connectivity(),
                            "Node connectivity changed"
                        );
                        report.changed += 1;
                    }
                }
                Ok(Err(e)) => {
                    warn!(node_id = node.id, error = %e, "Node recheck failed");
                    report.failed += 1;
                }
                Err(_) => {
                    warn!(node_id = node.id, "Node probe timed out");
                    if node.connectivity != NodeConnectivity::Failed {
                        self.service
                            .store()
                            .nodes()
                            .update(
                                node.id,
                                NodePatch {
                                    connectivity: Some(NodeConnectivity::Failed),
                                    ..Default::default()
                                },
                            )
                            .await?;
                        report.changed += 1;
                    }
                }
            }
        }
        debug!(?report, "Node recheck finished");
        Ok(report)
    }

    /// Query every live workload's unit and persist status changes
    pub async fn resync_workloads(&self) -> FleetResult<ReconcileReport> {
        let Ok(_guard) = self.workloads_running.try_lock() else {
            debug!("Workload resync already running, skipping");
            return Ok(ReconcileReport {
                skipped: true,
                ..Default::default()
            });
        };

        let filter = WorkloadFilter {
            has_unit: Some(true),
            ..Default::default()
        };
        let workloads = self.service.store().workloads().list(&filter).await?;
        let mut report = ReconcileReport::default();
        for (i, workload) in workloads
            .iter()
            .filter(|w| w.holds_capacity())
            .enumerate()
        {
            if i > 0 {
                tokio::time::sleep(self.pacing()).await;
            }
            report.checked += 1;
            let status = match timeout(self.probe_timeout(), self.service.sync_status(workload.id))
                .await
            {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    warn!(workload_id = workload.id, error = %e, "Workload resync failed");
                    report.failed += 1;
                    continue;
                }
                Err(_) => {
                    warn!(workload_id = workload.id, "Status query timed out");
                    self.service
                        .store()
                        .workloads()
                        .update(workload.id, WorkloadPatch::status(WorkloadStatus::Unknown))
                        .await?;
                    WorkloadStatus::Unknown
                }
            };
            if status != workload.status {
                debug!(
                    workload_id = workload.id,
                    from = %workload.status,
                    to = %status,
                    "Workload status corrected"
                );
                report.changed += 1;
            }
        }
        debug!(?report, "Workload resync finished");
        Ok(report)
    }

    /// Trigger both passes on their intervals until cancelled.
    ///
    /// Passes run as separate tasks so a slow node scan never delays status
    /// resyncs; an overdue tick is skipped rather than bunched.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut nodes_tick = interval(Duration::from_secs(self.config.node_interval_secs.max(1)));
        let mut workloads_tick =
            interval(Duration::from_secs(self.config.workload_interval_secs.max(1)));
        nodes_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        workloads_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            node_interval_secs = self.config.node_interval_secs,
            workload_interval_secs = self.config.workload_interval_secs,
            "Reconciliation loop started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = nodes_tick.tick() => {
                    let this = self.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            result = this.recheck_nodes() => {
                                if let Err(e) = result {
                                    warn!(error = %e, "Node recheck aborted");
                                }
                            }
                        }
                    });
                }
                _ = workloads_tick.tick() => {
                    let this = self.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            result = this.resync_workloads() => {
                                if let Err(e) = result {
                                    warn!(error = %e, "Workload resync aborted");
                                }
                            }
                        }
                    });
                }
            }
        }
        info!("Reconciliation loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpufleet_core::{ComputeNode, EngineConfig, TelemetryConfig, Workload};
    use gpufleet_runtime::fake::FakeConnector;
    use gpufleet_runtime::{ContainerCreate, ContainerDriver};
    use gpufleet_store::{FleetStore, MemoryStore};
    use gpufleet_telemetry::TelemetryCollector;

    const ADDR: &str = "tcp://10.0.0.5:2376";

    async fn setup() -> (Arc<MemoryStore>, Arc<FakeConnector>, ReconciliationLoop) {
        let store = Arc::new(MemoryStore::new());
        store
            .nodes()
            .create(ComputeNode {
                id: 1,
                name: "gpu-a".to_string(),
                engine_address: ADDR.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .nodes()
            .create(ComputeNode {
                id: 2,
                name: "broken".to_string(),
                connectivity: NodeConnectivity::Connected,
                ..Default::default()
            })
            .await
            .unwrap();

        let connector = Arc::new(FakeConnector::new());
        let driver = Arc::new(ContainerDriver::new(connector.clone(), EngineConfig::default()));
        let telemetry = Arc::new(TelemetryCollector::new(
            connector.clone(),
            &TelemetryConfig::default(),
            Duration::from_secs(1),
        ));
        let service = Arc::new(WorkloadService::new(
            store.clone(),
            connector.clone(),
            driver,
            telemetry,
        ));
        let config = ReconcileConfig {
            pacing_ms: 1,
            probe_timeout_secs: 1,
            ..Default::default()
        };
        (store, connector, ReconciliationLoop::new(service, config))
    }

    async fn place(store: &MemoryStore, unit: &str, status: WorkloadStatus) -> u64 {
        store
            .workloads()
            .create(Workload {
                node_id: 1,
                spec_id: 1,
                image_id: 1,
                container_id: Some(unit.to_string()),
                status,
                ..Default::default()
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_recheck_nodes() {
        let (store, _connector, reconcile) = setup().await;

        let report = reconcile.recheck_nodes().await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.changed, 2);
        assert_eq!(
            store.nodes().get(1).await.unwrap().connectivity,
            NodeConnectivity::Connected
        );
        assert_eq!(
            store.nodes().get(2).await.unwrap().connectivity,
            NodeConnectivity::Failed
        );

        let again = reconcile.recheck_nodes().await.unwrap();
        assert_eq!(again.changed, 0);
    }

    #[tokio::test]
    async fn test_resync_workloads() {
        let (store, connector, reconcile) = setup().await;
        let engine = connector.engine(ADDR);
        engine.add_container("c1", "ws-1", ContainerCreate::default(), "exited");
        engine.add_container("c2", "ws-2", ContainerCreate::default(), "running");

        let stopped = place(&store, "c1", WorkloadStatus::Running).await;
        let running = place(&store, "c2", WorkloadStatus::Running).await;
        let vanished = place(&store, "c3", WorkloadStatus::Running).await;
        place(&store, "c4", WorkloadStatus::Failed).await;

        let report = reconcile.resync_workloads().await.unwrap();
        assert_eq!(report.checked, 3);
        assert_eq!(report.changed, 2);

        let status = |id| {
            let store = store.clone();
            async move { store.workloads().get(id).await.unwrap().status }
        };
        assert_eq!(status(stopped).await, WorkloadStatus::Stopped);
        assert_eq!(status(running).await, WorkloadStatus::Running);
        assert_eq!(status(vanished).await, WorkloadStatus::Unknown);
    }

    #[tokio::test]
    async fn test_overlapping_pass_is_skipped() {
        let (_store, _connector, reconcile) = setup().await;
        let _held = reconcile.workloads_running.lock().await;

        let report = reconcile.resync_workloads().await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.checked, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (store, _connector, reconcile) = setup().await;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(reconcile).run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(
            store.nodes().get(1).await.unwrap().connectivity,
            NodeConnectivity::Connected
        );
    }
}
