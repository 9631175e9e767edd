// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Hetzner Cloud compute API client.

use crate::constants::ports;
use crate::error::{Result, TugboatError};
use crate::retry::{retry_transient, RetryConfig};
use crate::types::ServerState;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use url::Url;

#[cfg(test)]
use mockall::automock;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub status: ServerState,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoadBalancer {
    pub id: i64,
    pub public_ip: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    pub id: i64,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CreateServerRequest {
    pub name: String,
    pub server_type: String,
    pub image_id: i64,
    pub location: String,
    pub labels: BTreeMap<String, String>,
    pub network_id: Option<i64>,
    pub firewall_id: Option<i64>,
    pub placement_group_id: Option<i64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NetworkRequest {
    pub name: String,
    pub ip_range: String,
    pub subnet_range: String,
    pub network_zone: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoadBalancerRequest {
    pub name: String,
    pub location: String,
    pub network_id: i64,
    /// Label selector of the servers to target
    pub target_selector: String,
    pub labels: BTreeMap<String, String>,
}

/// Cloud provider compute API. Every `ensure_*` call is get-or-create.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn get_server_by_name(&self, name: &str) -> Result<Option<Server>>;

    async fn get_servers_by_label(&self, selector: &str) -> Result<Vec<Server>>;

    async fn create_server(&self, request: &CreateServerRequest) -> Result<Server>;

    async fn delete_server(&self, id: i64) -> Result<()>;

    /// Newest snapshot matching the label selector
    async fn find_image_by_label(&self, selector: &str) -> Result<Option<Image>>;

    async fn ensure_network(&self, request: &NetworkRequest) -> Result<i64>;

    async fn ensure_firewall(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<i64>;

    async fn ensure_load_balancer(&self, request: &LoadBalancerRequest) -> Result<LoadBalancer>;

    async fn ensure_placement_group(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<i64>;

    async fn delete_network(&self, id: i64) -> Result<()>;

    async fn delete_firewall(&self, id: i64) -> Result<()>;

    async fn delete_load_balancer(&self, id: i64) -> Result<()>;

    async fn delete_placement_group(&self, id: i64) -> Result<()>;
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    code: String,
    message: String,
}

#[derive(Deserialize)]
struct RawServer {
    id: i64,
    name: String,
    #[serde(default)]
    status: ServerState,
    #[serde(default)]
    public_net: Option<RawPublicNet>,
    #[serde(default)]
    private_net: Vec<RawPrivateNet>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct RawPublicNet {
    ipv4: Option<RawIp>,
}

#[derive(Deserialize)]
struct RawIp {
    ip: String,
}

#[derive(Deserialize)]
struct RawPrivateNet {
    ip: String,
}

impl From<RawServer> for Server {
    fn from(raw: RawServer) -> Self {
        Server {
            id: raw.id,
            name: raw.name,
            status: raw.status,
            public_ip: raw.public_net.and_then(|n| n.ipv4).map(|ip| ip.ip),
            private_ip: raw.private_net.into_iter().next().map(|n| n.ip),
            labels: raw.labels,
        }
    }
}

#[derive(Deserialize)]
struct RawLoadBalancer {
    id: i64,
    #[serde(default)]
    public_net: Option<RawPublicNet>,
}

impl From<RawLoadBalancer> for LoadBalancer {
    fn from(raw: RawLoadBalancer) -> Self {
        LoadBalancer {
            id: raw.id,
            public_ip: raw.public_net.and_then(|n| n.ipv4).map(|ip| ip.ip),
        }
    }
}

#[derive(Deserialize)]
struct RawImage {
    id: i64,
    #[serde(default)]
    description: String,
    #[serde(default)]
    created: String,
}

#[derive(Deserialize)]
struct IdOnly {
    id: i64,
}

/// Hetzner Cloud REST client
pub struct HcloudClient {
    http: reqwest::Client,
    endpoint: Url,
    token: String,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl HcloudClient {
    pub fn new(endpoint: Url, token: String, cancel: CancellationToken) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("tugboat/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            endpoint,
            token,
            retry: RetryConfig::default(),
            cancel,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint.as_str().trim_end_matches('/'), path)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Option<T>> {
        let operation = format!("{} /{}", method, path);
        retry_transient(&self.retry, &operation, &self.cancel, || async {
            let mut req = self
                .http
                .request(method.clone(), self.url(path))
                .bearer_auth(&self.token)
                .query(query);
            if let Some(body) = body {
                req = req.json(body);
            }

            let resp = req.send().await?;
            let status = resp.status();
            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let text = resp.text().await?;
            if !status.is_success() {
                return Err(api_error(status.as_u16(), &text));
            }
            if text.trim().is_empty() {
                return Ok(Some(serde_json::from_value(Value::Null)?));
            }
            Ok(Some(serde_json::from_str(&text)?))
        })
        .await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<Option<T>> {
        self.request(Method::GET, path, query, None).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        self.request(Method::POST, path, &[], Some(body))
            .await?
            .ok_or_else(|| not_found(path))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        // Already gone counts as deleted
        let _: Option<Value> = self.request(Method::DELETE, path, &[], None).await?;
        Ok(())
    }

    /// Id of the first resource named `name` in a list endpoint, if any
    async fn find_id_by_name(&self, collection: &str, name: &str) -> Result<Option<i64>> {
        let list: Option<BTreeMap<String, Value>> = self.get(collection, &[("name", name)]).await?;
        let id = list
            .and_then(|mut l| l.remove(collection))
            .and_then(|v| serde_json::from_value::<Vec<IdOnly>>(v).ok())
            .and_then(|items| items.into_iter().next())
            .map(|item| item.id);
        Ok(id)
    }
}

fn api_error(status: u16, body: &str) -> TugboatError {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => TugboatError::CloudApiError {
            status,
            code: parsed.error.code,
            message: parsed.error.message,
        },
        Err(_) => TugboatError::CloudApiError {
            status,
            code: "unknown".to_string(),
            message: body.to_string(),
        },
    }
}

fn not_found(path: &str) -> TugboatError {
    TugboatError::CloudApiError {
        status: 404,
        code: "not_found".to_string(),
        message: format!("/{} returned not found", path),
    }
}

/// Servers are placed behind the firewall and attached to the private network
pub fn create_server_body(request: &CreateServerRequest) -> Value {
    let mut body = json!({
        "name": request.name,
        "server_type": request.server_type,
        "image": request.image_id.to_string(),
        "location": request.location,
        "labels": request.labels,
        "start_after_create": true,
    });
    if let Some(network) = request.network_id {
        body["networks"] = json!([network]);
    }
    if let Some(firewall) = request.firewall_id {
        body["firewalls"] = json!([{ "firewall": firewall }]);
    }
    if let Some(group) = request.placement_group_id {
        body["placement_group"] = json!(group);
    }
    body
}

/// Inbound Kubernetes and Talos API; everything else stays closed
pub fn firewall_rules() -> Value {
    let rule = |port: u16, description: &str| {
        json!({
            "direction": "in",
            "protocol": "tcp",
            "port": port.to_string(),
            "source_ips": ["0.0.0.0/0", "::/0"],
            "description": description,
        })
    };
    json!([
        rule(ports::KUBE_API, "kubernetes api"),
        rule(ports::TALOS_API, "talos api"),
    ])
}

pub fn load_balancer_body(request: &LoadBalancerRequest) -> Value {
    let service = |port: u16| {
        json!({ "protocol": "tcp", "listen_port": port, "destination_port": port })
    };
    json!({
        "name": request.name,
        "load_balancer_type": "lb11",
        "location": request.location,
        "labels": request.labels,
        "network": request.network_id,
        "services": [service(ports::KUBE_API), service(ports::TALOS_API)],
        "targets": [{
            "type": "label_selector",
            "label_selector": { "selector": request.target_selector },
            "use_private_ip": true,
        }],
    })
}

#[derive(Deserialize)]
struct ServerList {
    servers: Vec<RawServer>,
    #[serde(default)]
    meta: ListMeta,
}

#[derive(Deserialize, Default)]
struct ListMeta {
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Deserialize)]
struct Pagination {
    next_page: Option<u32>,
}

impl ListMeta {
    fn next_page(&self) -> Option<u32> {
        self.pagination.as_ref().and_then(|p| p.next_page)
    }
}

/// Largest page the API hands out
const PAGE_SIZE: u32 = 50;

/// Fetch pages starting at 1 until no next page is announced. `fetch`
/// returns the items of a page and the next page number; a missing list
/// ends the walk.
async fn collect_pages<T, F, Fut>(mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<(Vec<T>, Option<u32>)>>>,
{
    let mut items = Vec::new();
    let mut page = 1;
    while let Some((batch, next)) = fetch(page).await? {
        items.extend(batch);
        match next {
            Some(next) if next > page => page = next,
            _ => break,
        }
    }
    Ok(items)
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: RawServer,
}

#[derive(Deserialize)]
struct ImageList {
    images: Vec<RawImage>,
}

#[derive(Deserialize)]
struct LoadBalancerList {
    load_balancers: Vec<RawLoadBalancer>,
}

#[derive(Deserialize)]
struct LoadBalancerEnvelope {
    load_balancer: RawLoadBalancer,
}

#[derive(Deserialize)]
struct NetworkEnvelope {
    network: IdOnly,
}

#[async_trait]
impl CloudProvider for HcloudClient {
    #[instrument(skip(self))]
    async fn get_server_by_name(&self, name: &str) -> Result<Option<Server>> {
        let list: Option<ServerList> = self.get("servers", &[("name", name)]).await?;
        Ok(list.and_then(|l| l.servers.into_iter().next()).map(Server::from))
    }

    #[instrument(skip(self))]
    async fn get_servers_by_label(&self, selector: &str) -> Result<Vec<Server>> {
        let per_page = PAGE_SIZE.to_string();
        let per_page = per_page.as_str();
        let servers = collect_pages(move |page| async move {
            let page = page.to_string();
            let list: Option<ServerList> = self
                .get(
                    "servers",
                    &[
                        ("label_selector", selector),
                        ("per_page", per_page),
                        ("page", page.as_str()),
                    ],
                )
                .await?;
            Ok(list.map(|l| {
                let next = l.meta.next_page();
                (l.servers, next)
            }))
        })
        .await?;
        debug!("Found {} servers matching {}", servers.len(), selector);
        Ok(servers.into_iter().map(Server::from).collect())
    }

    #[instrument(skip(self, request), fields(server = %request.name))]
    async fn create_server(&self, request: &CreateServerRequest) -> Result<Server> {
        info!("Creating server {}", request.name);
        let created: ServerEnvelope = self.post("servers", &create_server_body(request)).await?;
        Ok(created.server.into())
    }

    #[instrument(skip(self))]
    async fn delete_server(&self, id: i64) -> Result<()> {
        info!("Deleting server {}", id);
        self.delete(&format!("servers/{}", id)).await
    }

    #[instrument(skip(self))]
    async fn find_image_by_label(&self, selector: &str) -> Result<Option<Image>> {
        let list: Option<ImageList> = self
            .get("images", &[("type", "snapshot"), ("label_selector", selector)])
            .await?;
        Ok(newest_image(list.map(|l| l.images).unwrap_or_default()))
    }

    #[instrument(skip(self, request), fields(network = %request.name))]
    async fn ensure_network(&self, request: &NetworkRequest) -> Result<i64> {
        if let Some(id) = self.find_id_by_name("networks", &request.name).await? {
            debug!("Network {} already exists ({})", request.name, id);
            return Ok(id);
        }
        info!("Creating network {}", request.name);
        let body = json!({
            "name": request.name,
            "ip_range": request.ip_range,
            "labels": request.labels,
            "subnets": [{
                "type": "cloud",
                "ip_range": request.subnet_range,
                "network_zone": request.network_zone,
            }],
        });
        let created: NetworkEnvelope = self.post("networks", &body).await?;
        Ok(created.network.id)
    }

    #[instrument(skip(self, labels))]
    async fn ensure_firewall(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<i64> {
        if let Some(id) = self.find_id_by_name("firewalls", name).await? {
            debug!("Firewall {} already exists ({})", name, id);
            return Ok(id);
        }
        info!("Creating firewall {}", name);
        let body = json!({ "name": name, "labels": labels, "rules": firewall_rules() });
        // Response carries both `firewall` and `actions`
        let created: BTreeMap<String, Value> = self.post("firewalls", &body).await?;
        created
            .get("firewall")
            .and_then(|f| f.get("id"))
            .and_then(Value::as_i64)
            .ok_or_else(|| not_found("firewalls"))
    }

    #[instrument(skip(self, request), fields(load_balancer = %request.name))]
    async fn ensure_load_balancer(&self, request: &LoadBalancerRequest) -> Result<LoadBalancer> {
        let existing: Option<LoadBalancerList> = self
            .get("load_balancers", &[("name", request.name.as_str())])
            .await?;
        if let Some(lb) = existing.and_then(|l| l.load_balancers.into_iter().next()) {
            debug!("Load balancer {} already exists ({})", request.name, lb.id);
            return Ok(lb.into());
        }
        info!("Creating load balancer {}", request.name);
        let created: LoadBalancerEnvelope =
            self.post("load_balancers", &load_balancer_body(request)).await?;
        Ok(created.load_balancer.into())
    }

    #[instrument(skip(self, labels))]
    async fn ensure_placement_group(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<i64> {
        if let Some(id) = self.find_id_by_name("placement_groups", name).await? {
            return Ok(id);
        }
        info!("Creating placement group {}", name);
        let body = json!({ "name": name, "type": "spread", "labels": labels });
        let created: BTreeMap<String, Value> = self.post("placement_groups", &body).await?;
        created
            .get("placement_group")
            .and_then(|g| g.get("id"))
            .and_then(Value::as_i64)
            .ok_or_else(|| not_found("placement_groups"))
    }

    async fn delete_network(&self, id: i64) -> Result<()> {
        self.delete(&format!("networks/{}", id)).await
    }

    async fn delete_firewall(&self, id: i64) -> Result<()> {
        self.delete(&format!("firewalls/{}", id)).await
    }

    async fn delete_load_balancer(&self, id: i64) -> Result<()> {
        self.delete(&format!("load_balancers/{}", id)).await
    }

    async fn delete_placement_group(&self, id: i64) -> Result<()> {
        self.delete(&format!("placement_groups/{}", id)).await
    }
}

/// RFC 3339 timestamps sort lexicographically
fn newest_image(mut images: Vec<RawImage>) -> Option<Image> {
    images.sort_by(|a, b| b.created.cmp(&a.created));
    images.into_iter().next().map(|i| Image {
        id: i.id,
        description: i.description,
    })
}
