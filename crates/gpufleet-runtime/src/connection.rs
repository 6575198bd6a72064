//! Per-node engine connections

use async_trait::async_trait;
use gpufleet_core::{ComputeNode, EngineConfig, FleetError, FleetResult};
use reqwest::{Certificate, Client, Identity};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::docker::DockerEngine;
use crate::traits::{ContainerEngine, EngineConnector};

/// Resolve a node's engine address into an HTTP base URL
pub fn engine_base_url(address: &str, use_tls: bool) -> FleetResult<String> {
    let address = address.trim().trim_end_matches('/');
    if address.is_empty() {
        return Err(FleetError::ConfigIncomplete(
            "engine address is empty".to_string(),
        ));
    }
    if address.starts_with("unix://") || address.starts_with("npipe://") {
        return Err(FleetError::ConfigIncomplete(format!(
            "local engine socket {} cannot be reached remotely",
            address
        )));
    }
    if address.starts_with("http://") || address.starts_with("https://") {
        return Ok(address.to_string());
    }
    let host = address.strip_prefix("tcp://").unwrap_or(address);
    let scheme = if use_tls { "https" } else { "http" };
    Ok(format!("{}://{}", scheme, host))
}

/// TLS material of a node, all three pieces required
pub struct TlsMaterial<'a> {
    /// CA bundle
    pub ca_cert: &'a str,
    /// Client certificate
    pub client_cert: &'a str,
    /// Client private key
    pub client_key: &'a str,
}

impl<'a> TlsMaterial<'a> {
    /// Collect the node's TLS material or fail with ConfigIncomplete
    pub fn from_node(node: &'a ComputeNode) -> FleetResult<Self> {
        fn present<'n>(value: &'n Option<String>, what: &str, node: &str) -> FleetResult<&'n str> {
            value
                .as_deref()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| {
                    FleetError::ConfigIncomplete(format!("node {} is missing its {}", node, what))
                })
        }
        Ok(Self {
            ca_cert: present(&node.ca_cert, "CA certificate", &node.name)?,
            client_cert: present(&node.client_cert, "client certificate", &node.name)?,
            client_key: present(&node.client_key, "client key", &node.name)?,
        })
    }
}

/// Builds engine handles from node records
pub struct ConnectionManager {
    config: EngineConfig,
}

impl ConnectionManager {
    /// Create a connection manager
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Engine settings in use
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn build_client(&self, node: &ComputeNode) -> FleetResult<Client> {
        let mut builder = Client::builder().connect_timeout(self.config.connect_timeout());
        if node.use_tls {
            let tls = TlsMaterial::from_node(node)?;
            let ca = Certificate::from_pem(tls.ca_cert.as_bytes())
                .map_err(|e| FleetError::Config(format!("invalid CA certificate: {}", e)))?;
            let pem = format!("{}\n{}", tls.client_cert.trim(), tls.client_key.trim());
            let identity = Identity::from_pem(pem.as_bytes())
                .map_err(|e| FleetError::Config(format!("invalid client identity: {}", e)))?;
            builder = builder
                .use_rustls_tls()
                .tls_built_in_root_certs(false)
                .add_root_certificate(ca)
                .identity(identity);
        }
        builder
            .build()
            .map_err(|e| FleetError::Connection(format!("failed to build engine client: {}", e)))
    }

    /// Build a Docker Engine handle for the node
    pub fn open_docker(&self, node: &ComputeNode) -> FleetResult<DockerEngine> {
        let base_url = engine_base_url(&node.engine_address, node.use_tls)?;
        let client = self.build_client(node)?;
        debug!(node_id = node.id, url = %base_url, tls = node.use_tls, "Opened engine handle");
        Ok(DockerEngine::new(
            node.engine_address.clone(),
            base_url,
            client,
            self.config.http_timeout(),
        ))
    }
}

#[async_trait]
impl EngineConnector for ConnectionManager {
    async fn open(&self, node: &ComputeNode) -> FleetResult<Arc<dyn ContainerEngine>> {
        Ok(Arc::new(self.open_docker(node)?))
    }

    async fn test_connection(&self, node: &ComputeNode) -> (bool, String) {
        let engine = match self.open_docker(node) {
            Ok(engine) => engine,
            Err(e) => {
                warn!(node_id = node.id, error = %e, "Cannot open engine handle");
                return (false, e.to_string());
            }
        };
        match tokio::time::timeout(self.config.probe_timeout(), engine.ping()).await {
            Ok(Ok(())) => {
                info!(node_id = node.id, "Engine reachable");
                (true, "connected".to_string())
            }
            Ok(Err(e)) => {
                warn!(node_id = node.id, error = %e, "Engine probe failed");
                (false, e.to_string())
            }
            Err(_) => {
                warn!(node_id = node.id, "Engine probe timed out");
                (
                    false,
                    format!(
                        "engine did not answer within {}s",
                        self.config.probe_timeout_secs
                    ),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_base_url() {
        assert_eq!(
            engine_base_url("tcp://10.0.0.5:2376", true).unwrap(),
            "https://10.0.0.5:2376"
        );
        assert_eq!(
            engine_base_url("tcp://10.0.0.5:2375/", false).unwrap(),
            "http://10.0.0.5:2375"
        );
        assert_eq!(
            engine_base_url("10.0.0.5:2375", false).unwrap(),
            "http://10.0.0.5:2375"
        );
        assert_eq!(
            engine_base_url("https://docker.internal:2376", false).unwrap(),
            "https://docker.internal:2376"
        );
        assert!(matches!(
            engine_base_url("unix:///var/run/docker.sock", false),
            Err(FleetError::ConfigIncomplete(_))
        ));
        assert!(matches!(
            engine_base_url("  ", true),
            Err(FleetError::ConfigIncomplete(_))
        ));
    }

    #[test]
    fn test_tls_material_required() {
        let mut node = ComputeNode {
            name: "gpu-a".to_string(),
            engine_address: "tcp://10.0.0.5:2376".to_string(),
            use_tls: true,
            ca_cert: Some("ca".to_string()),
            client_cert: Some("cert".to_string()),
            ..Default::default()
        };
        let err = TlsMaterial::from_node(&node).err().unwrap();
        assert!(matches!(err, FleetError::ConfigIncomplete(ref m) if m.contains("client key")));

        node.client_key = Some("   ".to_string());
        assert!(TlsMaterial::from_node(&node).is_err());

        node.client_key = Some("key".to_string());
        let tls = TlsMaterial::from_node(&node).unwrap();
        assert_eq!(tls.client_key, "key");
    }

    #[test]
    fn test_open_rejects_incomplete_tls() {
        let manager = ConnectionManager::new(EngineConfig::default());
        let node = ComputeNode {
            name: "gpu-a".to_string(),
            engine_address: "tcp://10.0.0.5:2376".to_string(),
            use_tls: true,
            ..Default::default()
        };
        assert!(matches!(
            manager.open_docker(&node).err().unwrap(),
            FleetError::ConfigIncomplete(_)
        ));
    }

    #[test]
    fn test_open_plaintext() {
        let manager = ConnectionManager::new(EngineConfig::default());
        let node = ComputeNode {
            name: "gpu-a".to_string(),
            engine_address: "tcp://127.0.0.1:2375".to_string(),
            use_tls: false,
            ..Default::default()
        };
        let engine = manager.open_docker(&node).unwrap();
        assert_eq!(engine.endpoint(), "tcp://127.0.0.1:2375");
    }

    #[tokio::test]
    async fn test_connection_reports_failure() {
        let manager = ConnectionManager::new(EngineConfig {
            probe_timeout_secs: 1,
            connect_timeout_secs: 1,
            ..Default::default()
        });
        let node = ComputeNode {
            name: "gpu-a".to_string(),
            engine_address: "unix:///var/run/docker.sock".to_string(),
            use_tls: false,
            ..Default::default()
        };
        let (ok, message) = manager.test_connection(&node).await;
        assert!(!ok);
        assert!(message.contains("Configuration incomplete"));
    }
}
