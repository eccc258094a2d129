//! TensorDock v2 API client
//!
//! JSON:API style envelopes, bearer token auth. The API is not fully
//! consistent between endpoints (`data.locations` vs `locations`, list items
//! with or without `attributes`), so responses are read leniently.

use crate::catalog::{GpuOffer, Location};
use crate::config::DEFAULT_API_URL;
use crate::error::{OrchestratorError, Result};
use crate::instance::{
    GpuAllocation, Instance, InstanceStatus, PortMapping, ProvisioningRequest, REMOTE_SHELL_PORT,
    ResourceSnapshot,
};
use crate::provider::GpuMarketplace;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for API requests
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// TensorDock marketplace client
#[derive(Clone)]
pub struct TensorDockClient {
    client: Client,
    base_url: String,
    token: String,
}

impl TensorDockClient {
    /// Create a client for the public API
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: DEFAULT_API_URL.to_string(),
            token: token.into(),
        })
    }

    /// Point at a different API root
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let url = self.url(path);
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .send()
            .await?;

        handle_response(response).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let url = self.url(path);
        debug!(url = %url, "POST request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await?;

        handle_response(response).await
    }
}

/// Status check plus embedded error detection; returns the parsed body
async fn handle_response(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let text = response.text().await?;

    if !status.is_success() {
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| embedded_error(&v))
            .unwrap_or(text);
        return Err(OrchestratorError::api(status.as_u16(), message));
    }

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }

    let value: Value = serde_json::from_str(&text).map_err(|e| {
        warn!(error = %e, body = %text, "Failed to parse response");
        OrchestratorError::Json(e)
    })?;

    if let Some(message) = embedded_error(&value) {
        return Err(OrchestratorError::api(status.as_u16(), message));
    }

    Ok(value)
}

/// Error carried inside an otherwise successful envelope
fn embedded_error(value: &Value) -> Option<String> {
    match value.get("error") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => {}
        Some(Value::String(s)) => return Some(s.clone()),
        Some(other) => return Some(other.to_string()),
    }

    let errors = value.get("errors")?.as_array()?;
    if errors.is_empty() {
        return None;
    }
    let messages: Vec<String> = errors
        .iter()
        .map(|e| {
            ["detail", "message", "title"]
                .iter()
                .find_map(|k| e.get(*k).and_then(Value::as_str))
                .map(str::to_string)
                .unwrap_or_else(|| e.to_string())
        })
        .collect();
    Some(messages.join("; "))
}

#[derive(Debug, Deserialize)]
struct ApiLocation {
    id: String,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    gpus: Vec<ApiGpu>,
}

#[derive(Debug, Deserialize)]
struct ApiGpu {
    #[serde(default, rename = "v0Name")]
    v0_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "displayName")]
    display_name: Option<String>,
    #[serde(default)]
    max_count: u32,
    #[serde(default)]
    price_per_hr: Option<f64>,
    #[serde(default)]
    price_per_hour: Option<f64>,
    #[serde(default)]
    network_features: Option<ApiNetworkFeatures>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiNetworkFeatures {
    #[serde(default)]
    port_forwarding_available: bool,
}

impl From<ApiLocation> for Location {
    fn from(api: ApiLocation) -> Self {
        let name = format!(
            "{}, {}",
            api.city.as_deref().unwrap_or("Unknown"),
            api.country.as_deref().unwrap_or("Unknown")
        );
        let gpus = api
            .gpus
            .into_iter()
            .filter_map(|g| {
                let model = g.v0_name.or(g.name)?;
                Some(GpuOffer {
                    model,
                    display_name: g.display_name,
                    max_count: g.max_count,
                    price_per_hour: g.price_per_hr.or(g.price_per_hour),
                    port_forwarding: g
                        .network_features
                        .is_some_and(|n| n.port_forwarding_available),
                })
            })
            .collect();

        Location {
            id: api.id,
            name,
            gpus,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ApiInstanceAttributes {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "ipAddress")]
    ip_address: Option<String>,
    #[serde(default)]
    port_forwards: Vec<ApiPortForward>,
    #[serde(default)]
    ssh_port: Option<u16>,
    #[serde(default)]
    resources: Option<ApiResources>,
    #[serde(default)]
    created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiPortForward {
    internal_port: u16,
    external_port: u16,
}

#[derive(Debug, Deserialize)]
struct ApiResources {
    #[serde(default)]
    vcpu_count: u32,
    #[serde(default)]
    ram_gb: u32,
    #[serde(default)]
    storage_gb: u32,
    #[serde(default)]
    gpus: BTreeMap<String, ApiGpuCount>,
}

#[derive(Debug, Deserialize)]
struct ApiGpuCount {
    #[serde(default)]
    count: u32,
}

/// Read one instance from `{id, attributes:{..}}` or a flat record
fn parse_instance(value: &Value) -> Result<Instance> {
    let id = match value.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    let attributes: ApiInstanceAttributes = match value.get("attributes") {
        Some(attrs) => serde_json::from_value(attrs.clone())?,
        None => serde_json::from_value(value.clone())?,
    };

    let mut port_forwards: Vec<PortMapping> = attributes
        .port_forwards
        .iter()
        .map(|p| PortMapping {
            internal_port: p.internal_port,
            external_port: p.external_port,
        })
        .collect();
    if !port_forwards.iter().any(|p| p.internal_port == REMOTE_SHELL_PORT) {
        if let Some(ssh_port) = attributes.ssh_port {
            port_forwards.push(PortMapping {
                internal_port: REMOTE_SHELL_PORT,
                external_port: ssh_port,
            });
        }
    }

    let resources = attributes.resources.map(|r| ResourceSnapshot {
        vcpu_count: r.vcpu_count,
        ram_gb: r.ram_gb,
        storage_gb: r.storage_gb,
        gpus: r
            .gpus
            .into_iter()
            .map(|(model, g)| GpuAllocation { model, count: g.count })
            .collect(),
    });

    Ok(Instance {
        id,
        name: attributes.name.unwrap_or_default(),
        status: InstanceStatus::from_provider(attributes.status.as_deref().unwrap_or_default()),
        ip_address: attributes.ip_address.filter(|a| !a.is_empty()),
        port_forwards,
        resources,
        created_at: attributes.created_at,
    })
}

/// JSON:API creation envelope for a request at `location_id`
pub(crate) fn creation_payload(request: &ProvisioningRequest, location_id: &str) -> Value {
    let mut gpus = Map::new();
    gpus.insert(
        request.accelerator_model.clone(),
        json!({ "count": request.accelerator_count }),
    );

    let port_forwards: Vec<Value> = request
        .exposures
        .iter()
        .map(|e| match e.external_port {
            Some(external) => json!({ "internal_port": e.internal_port, "external_port": external }),
            None => json!({ "internal_port": e.internal_port }),
        })
        .collect();

    let mut attributes = json!({
        "name": request.name,
        "type": "virtualmachine",
        "image": request.image,
        "resources": {
            "vcpu_count": request.vcpus,
            "ram_gb": request.ram_gb,
            "storage_gb": request.storage_gb,
            "gpus": gpus,
        },
        "location_id": location_id,
        "useDedicatedIp": false,
        "port_forwards": port_forwards,
    });
    if let (Some(key), Some(obj)) = (&request.ssh_public_key, attributes.as_object_mut()) {
        obj.insert("ssh_key".to_string(), Value::String(key.clone()));
    }

    json!({ "data": { "type": "virtualmachine", "attributes": attributes } })
}

#[async_trait]
impl GpuMarketplace for TensorDockClient {
    async fn list_locations(&self) -> Result<Vec<Location>> {
        let body = self.get("locations").await?;
        let locations = body
            .get("data")
            .and_then(|d| d.get("locations"))
            .or_else(|| body.get("locations"))
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));

        let locations: Vec<ApiLocation> = serde_json::from_value(locations)?;
        debug!(count = locations.len(), "Fetched locations");
        Ok(locations.into_iter().map(Location::from).collect())
    }

    async fn create_instance(
        &self,
        request: &ProvisioningRequest,
        location_id: &str,
    ) -> Result<Instance> {
        let body = self
            .post("instances", &creation_payload(request, location_id))
            .await?;
        let instance = parse_instance(body.get("data").unwrap_or(&body))?;
        info!(instance_id = %instance.id, status = %instance.status, "Instance accepted by provider");
        Ok(instance)
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Instance> {
        let body = self.get(&format!("instances/{}", instance_id)).await?;
        let mut instance = parse_instance(body.get("data").unwrap_or(&body))?;
        if instance.id.is_empty() {
            instance.id = instance_id.to_string();
        }
        Ok(instance)
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        let body = self.get("instances").await?;
        let items = match body.get("data") {
            Some(Value::Array(items)) => items.clone(),
            Some(data) => data
                .get("instances")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            None => body
                .get("instances")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        };

        items.iter().map(parse_instance).collect()
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        let url = self.url(&format!("instances/{}", instance_id));
        debug!(url = %url, "DELETE request");

        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::NO_CONTENT {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(OrchestratorError::api(status.as_u16(), text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::PortExposure;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> TensorDockClient {
        TensorDockClient::new("test-token")
            .unwrap()
            .with_base_url(server.uri())
    }

    #[tokio::test]
    async fn test_list_locations_nested_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/locations"))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "locations": [{
                    "id": "loc-a",
                    "city": "Chubbuck",
                    "country": "United States",
                    "gpus": [{
                        "v0Name": "geforcertx4090-pcie-24gb",
                        "displayName": "NVIDIA GeForce RTX 4090 PCIe 24GB",
                        "max_count": 3,
                        "price_per_hr": 0.37,
                        "network_features": { "dedicated_ip_available": true, "port_forwarding_available": true }
                    }]
                }]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let locations = client(&server).await.list_locations().await.unwrap();

        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].name, "Chubbuck, United States");
        let gpu = &locations[0].gpus[0];
        assert_eq!(gpu.model, "geforcertx4090-pcie-24gb");
        assert_eq!(gpu.max_count, 3);
        assert_eq!(gpu.price_per_hour, Some(0.37));
        assert!(gpu.port_forwarding);
        assert!(gpu.matches("rtx 4090"));
    }

    #[tokio::test]
    async fn test_list_locations_flat_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/locations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "locations": [{
                    "id": "loc-b",
                    "city": "Orlando",
                    "country": "United States",
                    "gpus": [{ "name": "rtx3090-pcie-24gb", "max_count": 0, "price_per_hour": 0.2 }]
                }]
            })))
            .mount(&server)
            .await;

        let locations = client(&server).await.list_locations().await.unwrap();

        let gpu = &locations[0].gpus[0];
        assert_eq!(gpu.model, "rtx3090-pcie-24gb");
        assert!(!gpu.is_available());
        assert!(!gpu.port_forwarding);
    }

    #[tokio::test]
    async fn test_non_success_status_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/locations"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid token"))
            .mount(&server)
            .await;

        let err = client(&server).await.list_locations().await.unwrap_err();

        match err {
            OrchestratorError::Api { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "invalid token");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_embedded_error_in_success_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/instances"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": [{ "detail": "No available GPUs of type geforcertx4090-pcie-24gb" }]
            })))
            .mount(&server)
            .await;

        let request = ProvisioningRequest::new("geforcertx4090-pcie-24gb");
        let err = client(&server)
            .await
            .create_instance(&request, "loc-a")
            .await
            .unwrap_err();

        match err {
            OrchestratorError::Api { status, message } => {
                assert_eq!(status, 200);
                assert!(message.contains("No available GPUs"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_create_instance_posts_jsonapi_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/instances"))
            .and(body_partial_json(json!({
                "data": {
                    "type": "virtualmachine",
                    "attributes": {
                        "name": "ComfyUI-1700000000",
                        "image": "ubuntu2404",
                        "location_id": "loc-a",
                        "useDedicatedIp": false,
                        "resources": {
                            "vcpu_count": 8,
                            "ram_gb": 32,
                            "storage_gb": 200,
                            "gpus": { "geforcertx4090-pcie-24gb": { "count": 1 } }
                        }
                    }
                }
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "data": {
                    "type": "virtualmachine",
                    "id": "0b7e-41c2",
                    "attributes": { "name": "ComfyUI-1700000000", "status": "creating" }
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = ProvisioningRequest::new("geforcertx4090-pcie-24gb")
            .with_name("ComfyUI-1700000000")
            .with_ssh_public_key("ssh-ed25519 AAAA op@laptop");
        let instance = client(&server)
            .await
            .create_instance(&request, "loc-a")
            .await
            .unwrap();

        assert_eq!(instance.id, "0b7e-41c2");
        assert_eq!(instance.status, InstanceStatus::Creating);
    }

    #[tokio::test]
    async fn test_get_instance_port_forwards() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/instances/vm-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "id": "vm-1",
                    "attributes": {
                        "name": "ComfyUI-1",
                        "status": "running",
                        "ip_address": "203.0.113.7",
                        "port_forwards": [
                            { "internal_port": 22, "external_port": 20022 },
                            { "internal_port": 8188, "external_port": 28188 }
                        ],
                        "resources": {
                            "vcpu_count": 8, "ram_gb": 32, "storage_gb": 200,
                            "gpus": { "geforcertx4090-pcie-24gb": { "count": 1 } }
                        }
                    }
                }
            })))
            .mount(&server)
            .await;

        let instance = client(&server).await.get_instance("vm-1").await.unwrap();

        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(instance.external_port(8188), Some(28188));
        assert_eq!(
            instance.connection_endpoint(22).map(|e| e.to_string()),
            Some("203.0.113.7:20022".to_string())
        );
        assert_eq!(
            instance.resources.as_ref().map(|r| r.gpu_summary()),
            Some("1x geforcertx4090-pcie-24gb".to_string())
        );
    }

    #[tokio::test]
    async fn test_get_instance_ssh_port_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/instances/vm-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "attributes": { "status": "running", "ip_address": "198.51.100.4", "ssh_port": 40022 } }
            })))
            .mount(&server)
            .await;

        let instance = client(&server).await.get_instance("vm-2").await.unwrap();

        assert_eq!(instance.id, "vm-2");
        assert_eq!(instance.external_port(22), Some(40022));
    }

    #[tokio::test]
    async fn test_list_instances_both_shapes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/instances"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "instances": [
                    { "id": "vm-1", "name": "ComfyUI-1", "status": "running" },
                    { "id": "vm-2", "name": "ComfyUI-2", "status": "stopped" }
                ]}
            })))
            .mount(&server)
            .await;

        let instances = client(&server).await.list_instances().await.unwrap();
        let ids: Vec<_> = instances.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["vm-1", "vm-2"]);
        assert_eq!(instances[1].status, InstanceStatus::Terminated);

        let list = json!({ "data": [{ "id": "vm-3", "attributes": { "name": "x", "status": "creating" } }] });
        let data = list["data"].as_array().unwrap();
        assert_eq!(parse_instance(&data[0]).unwrap().status, InstanceStatus::Creating);
    }

    #[tokio::test]
    async fn test_delete_instance_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/instances/vm-1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/instances/vm-2"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        let client = client(&server).await;
        assert!(client.delete_instance("vm-1").await.is_ok());
        assert!(matches!(
            client.delete_instance("vm-2").await,
            Err(OrchestratorError::Api { status: 404, .. })
        ));
    }

    #[test]
    fn test_creation_payload_port_forwards_and_key() {
        let request = ProvisioningRequest::new("rtx4090").with_exposures(vec![
            PortExposure::new(22),
            PortExposure::new(8188).with_external_port(28188),
        ]);

        let payload = creation_payload(&request, "loc-a");
        let attrs = &payload["data"]["attributes"];

        assert_eq!(attrs["port_forwards"][0], json!({ "internal_port": 22 }));
        assert_eq!(
            attrs["port_forwards"][1],
            json!({ "internal_port": 8188, "external_port": 28188 })
        );
        assert!(attrs.get("ssh_key").is_none());

        let payload = creation_payload(&request.with_ssh_public_key("ssh-ed25519 AAAA"), "loc-a");
        assert_eq!(payload["data"]["attributes"]["ssh_key"], "ssh-ed25519 AAAA");
    }

    #[test]
    fn test_embedded_error_shapes() {
        assert_eq!(embedded_error(&json!({"error": "bad"})).as_deref(), Some("bad"));
        assert_eq!(embedded_error(&json!({"error": null, "data": {}})), None);
        assert_eq!(embedded_error(&json!({"errors": []})), None);
        assert_eq!(
            embedded_error(&json!({"errors": [{"title": "a"}, {"message": "b"}]})).as_deref(),
            Some("a; b")
        );
    }
}
