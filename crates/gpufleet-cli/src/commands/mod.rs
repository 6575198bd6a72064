//! CLI commands implementation

use anyhow::Result;
use gpufleet_core::{CatalogOptions, NodeConnectivity, Principal, RecordId, Workload};
use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};

/// API client for communicating with the daemon
pub struct ApiClient {
    base_url: String,
    principal: Principal,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str, principal: Principal) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            principal,
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// A request carrying the caller headers
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header("x-fleet-user", self.principal.user_id.to_string())
            .header("x-fleet-admin", self.principal.is_admin.to_string())
    }
}

/// Fail with the server's message on a non-success response
async fn check(response: Response, action: &str) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let error = response.text().await?;
    anyhow::bail!("Failed to {} ({}): {}", action, status, error)
}

/// Candidate node from API
#[derive(Debug, Deserialize)]
pub struct CandidateResponse {
    pub node_id: RecordId,
    pub name: String,
    #[serde(default)]
    pub region: String,
    pub gpu_name: Option<String>,
    pub gpu_count: u64,
    pub available_gpus: u64,
    pub available_cpu: u64,
    pub available_memory_gb: u64,
    pub available_gpu_memory_gb: u64,
    #[serde(default)]
    pub price_per_hour: f64,
}

/// One page of workloads
#[derive(Debug, Deserialize)]
pub struct WorkloadPage {
    pub items: Vec<Workload>,
    pub total: u64,
}

/// Node response from API
#[derive(Debug, Deserialize)]
pub struct NodeResponse {
    pub id: RecordId,
    pub name: String,
    pub region: String,
    pub engine_address: String,
    pub gpu_name: Option<String>,
    pub gpu_count: u64,
    pub gpu_memory_per_card_gb: u64,
    pub listed: bool,
    pub connectivity: NodeConnectivity,
}

/// Unit usage from API
#[derive(Debug, Deserialize)]
pub struct StatsResponse {
    pub cpu_usage_percent: f64,
    pub cpu_usage_percent_raw: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_usage_percent: f64,
    pub pids: u64,
    pub gpu_memory_size_gb: f64,
    pub gpu_memory_usage_rate: f64,
}

/// Node probe result
#[derive(Debug, Deserialize)]
pub struct NodeTestResponse {
    pub ok: bool,
    pub message: String,
}

/// Render a byte count with a binary unit
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}B", bytes)
    } else {
        format!("{:.1}{}", value, UNITS[unit])
    }
}

fn or_dash(value: Option<&str>) -> &str {
    value.filter(|v| !v.is_empty()).unwrap_or("-")
}

/// Show nodes able to host a spec
pub async fn candidates(client: &ApiClient, spec: RecordId, image: Option<RecordId>) -> Result<()> {
    let mut request = client.request(Method::GET, &format!("/api/v1/specs/{}/candidates", spec));
    if let Some(image) = image {
        request = request.query(&[("image_id", image)]);
    }
    let response = request
        .send()
        .await?;
    let candidates: Vec<CandidateResponse> =
        check(response, "query candidates").await?.json().await?;

    if candidates.is_empty() {
        println!("No node can host spec {}", spec);
        return Ok(());
    }
    println!(
        "{:<6} {:<20} {:<12} {:<16} {:<8} {:<8} {:<10} {:<10} {:<8}",
        "ID", "NAME", "REGION", "GPU", "GPUS", "CPU", "MEM(G)", "GPU MEM", "PRICE"
    );
    println!("{}", "-".repeat(104));
    for c in candidates {
        println!(
            "{:<6} {:<20} {:<12} {:<16} {:<8} {:<8} {:<10} {:<10} {:<8.2}",
            c.node_id,
            c.name,
            or_dash(Some(&c.region)),
            or_dash(c.gpu_name.as_deref()),
            format!("{}/{}", c.available_gpus, c.gpu_count),
            c.available_cpu,
            c.available_memory_gb,
            format!("{}G", c.available_gpu_memory_gb),
            c.price_per_hour
        );
    }
    Ok(())
}

/// Create a workload
pub async fn create(
    client: &ApiClient,
    image: RecordId,
    spec: RecordId,
    node: RecordId,
    name: Option<String>,
    remark: Option<String>,
) -> Result<()> {
    #[derive(Serialize)]
    struct CreateRequest {
        name: Option<String>,
        image_id: RecordId,
        spec_id: RecordId,
        node_id: RecordId,
        remark: Option<String>,
    }

    let req = CreateRequest {
        name,
        image_id: image,
        spec_id: spec,
        node_id: node,
        remark,
    };
    let response = client
        .request(Method::POST, "/api/v1/workloads")
        .json(&req)
        .send()
        .await?;
    let workload: Workload = check(response, "create workload").await?.json().await?;

    println!("Workload {} created", workload.id);
    println!("  Container: {}", or_dash(workload.container_name.as_deref()));
    println!("  Node: {}", workload.node_id);
    println!("  Status: {}", workload.status);
    Ok(())
}

/// List workloads
pub async fn ps(client: &ApiClient, page: u64, page_size: u64) -> Result<()> {
    let response = client
        .request(Method::GET, "/api/v1/workloads")
        .query(&[("page", page), ("page_size", page_size)])
        .send()
        .await?;
    let page: WorkloadPage = check(response, "list workloads").await?.json().await?;

    if page.items.is_empty() {
        println!("No workloads found");
        return Ok(());
    }
    println!(
        "{:<6} {:<36} {:<6} {:<6} {:<6} {:<12}",
        "ID", "CONTAINER", "NODE", "SPEC", "OWNER", "STATUS"
    );
    println!("{}", "-".repeat(78));
    for w in &page.items {
        println!(
            "{:<6} {:<36} {:<6} {:<6} {:<6} {:<12}",
            w.id,
            or_dash(w.container_name.as_deref()),
            w.node_id,
            w.spec_id,
            w.owner_id,
            w.status.to_string()
        );
    }
    println!("\n{} of {} workloads", page.items.len(), page.total);
    Ok(())
}

/// Delete workloads
pub async fn rm(client: &ApiClient, ids: Vec<RecordId>) -> Result<()> {
    #[derive(Serialize)]
    struct DeleteRequest {
        ids: Vec<RecordId>,
    }
    #[derive(Deserialize)]
    struct DeleteResponse {
        deleted: Vec<RecordId>,
    }

    let response = client
        .request(Method::DELETE, "/api/v1/workloads")
        .json(&DeleteRequest { ids: ids.clone() })
        .send()
        .await?;
    let result: DeleteResponse = check(response, "delete workloads").await?.json().await?;

    for id in &ids {
        if result.deleted.contains(id) {
            println!("Workload {} deleted", id);
        } else {
            eprintln!("Workload {} was not deleted", id);
        }
    }
    Ok(())
}

/// Start, stop or restart a workload
pub async fn lifecycle(client: &ApiClient, id: RecordId, action: &str) -> Result<()> {
    let response = client
        .request(Method::POST, &format!("/api/v1/workloads/{}/{}", id, action))
        .send()
        .await?;
    let workload: Workload = check(response, &format!("{} workload", action))
        .await?
        .json()
        .await?;
    println!("Workload {} is {}", workload.id, workload.status);
    Ok(())
}

/// Show live usage of a workload
pub async fn stats(client: &ApiClient, id: RecordId) -> Result<()> {
    let response = client
        .request(Method::GET, &format!("/api/v1/workloads/{}/stats", id))
        .send()
        .await?;
    let stats: StatsResponse = check(response, "read stats").await?.json().await?;

    println!("Workload {}", id);
    println!(
        "  CPU: {:.1}% ({:.1}% of one core)",
        stats.cpu_usage_percent, stats.cpu_usage_percent_raw
    );
    println!(
        "  Memory: {} / {} ({:.1}%)",
        format_bytes(stats.memory_usage),
        format_bytes(stats.memory_limit),
        stats.memory_usage_percent
    );
    println!("  PIDs: {}", stats.pids);
    println!(
        "  GPU memory: {:.1}G ({:.1}% used)",
        stats.gpu_memory_size_gb, stats.gpu_memory_usage_rate
    );
    Ok(())
}

/// Print workload output
pub async fn logs(client: &ApiClient, id: RecordId, tail: Option<u64>) -> Result<()> {
    let mut request = client.request(Method::GET, &format!("/api/v1/workloads/{}/logs", id));
    if let Some(tail) = tail {
        request = request.query(&[("tail", tail)]);
    }
    let text = check(request.send().await?, "read logs").await?.text().await?;
    print!("{}", text);
    Ok(())
}

/// List compute nodes
pub async fn nodes(client: &ApiClient) -> Result<()> {
    let response = client.request(Method::GET, "/api/v1/nodes").send().await?;
    let nodes: Vec<NodeResponse> = check(response, "list nodes").await?.json().await?;

    if nodes.is_empty() {
        println!("No nodes registered");
        return Ok(());
    }
    println!(
        "{:<6} {:<20} {:<12} {:<28} {:<20} {:<8} {:<10}",
        "ID", "NAME", "REGION", "ENGINE", "GPU", "LISTED", "STATUS"
    );
    println!("{}", "-".repeat(110));
    for n in nodes {
        let gpu = match n.gpu_name.as_deref() {
            Some(name) if n.gpu_count > 0 => {
                format!("{} x{} ({}G)", name, n.gpu_count, n.gpu_memory_per_card_gb)
            }
            _ => "-".to_string(),
        };
        println!(
            "{:<6} {:<20} {:<12} {:<28} {:<20} {:<8} {:<10}",
            n.id,
            n.name,
            or_dash(Some(&n.region)),
            n.engine_address,
            gpu,
            n.listed,
            n.connectivity.to_string()
        );
    }
    Ok(())
}

/// Probe a node's engine
pub async fn test_node(client: &ApiClient, id: RecordId) -> Result<()> {
    let response = client
        .request(Method::POST, &format!("/api/v1/nodes/{}/test", id))
        .send()
        .await?;
    let result: NodeTestResponse = check(response, "test node").await?.json().await?;
    if result.ok {
        println!("Node {} is reachable: {}", id, result.message);
    } else {
        println!("Node {} is unreachable: {}", id, result.message);
    }
    Ok(())
}

/// Show the placement catalog
pub async fn catalog(client: &ApiClient) -> Result<()> {
    let response = client.request(Method::GET, "/api/v1/catalog").send().await?;
    let catalog: CatalogOptions = check(response, "read catalog").await?.json().await?;

    println!("Images:");
    for image in &catalog.images {
        let split = if image.supports_memory_split {
            " (memory split)"
        } else {
            ""
        };
        println!("  [{}] {}{}", image.value, image.label, split);
    }
    println!("\nNodes:");
    for node in &catalog.nodes {
        println!("  [{}] {}", node.value, node.label);
    }
    println!("\nSpecs:");
    for spec in &catalog.specs {
        println!("  [{}] {}  {:.2}/h", spec.value, spec.label, spec.price_per_hour);
    }
    Ok(())
}
