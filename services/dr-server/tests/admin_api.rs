//! Admin and agent-sync API integration tests.
//!
//! Runs the router on a loopback listener backed by the in-memory store and
//! drives it over HTTP.

use std::sync::Arc;
use std::time::Duration;

use dynroute_events::{AgentNotification, AGENT_TYPE_DYNAMIC_ROUTING};
use dynroute_id::{NetworkId, TenantId};
use dynroute_server::{
    api,
    networks::StaticNetworkDirectory,
    notifier::{Notifier, RecordingTransport},
    scheduler::{FleetScheduler, SchedulerPolicy},
    state::AppState,
    store::MemoryStore,
};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;

struct ApiHarness {
    base_url: String,
    client: reqwest::Client,
    transport: Arc<RecordingTransport>,
    network_id: NetworkId,
}

impl ApiHarness {
    async fn new() -> Self {
        Self::with_policy(SchedulerPolicy::default()).await
    }

    async fn with_policy(policy: SchedulerPolicy) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info,dynroute_server=debug".into()),
            )
            .with_test_writer()
            .try_init();

        let network_id = NetworkId::new();
        let networks = StaticNetworkDirectory::new()
            .with_network(network_id, vec!["10.20.0.0/24".parse().unwrap()]);

        let transport = Arc::new(RecordingTransport::new());
        let scheduler = FleetScheduler::new(
            Arc::new(MemoryStore::new()),
            Notifier::new(transport.clone()),
            policy,
            Arc::new(networks),
        );
        let app = api::create_router(AppState::new(scheduler));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            transport,
            network_id,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let response = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn put(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let response = self
            .client
            .put(self.url(path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let response = self.client.get(self.url(path)).send().await.unwrap();
        let status = response.status();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn delete(&self, path: &str) -> StatusCode {
        self.client
            .delete(self.url(path))
            .send()
            .await
            .unwrap()
            .status()
    }

    async fn report(&self, host: &str) -> String {
        let (status, body) = self
            .post(
                "/v1/agent-sync/report-state",
                json!({
                    "agent_type": AGENT_TYPE_DYNAMIC_ROUTING,
                    "binary": "dr-agent",
                    "host": host,
                    "topic": "dr_agent",
                    "configurations": {"local_as": 12345},
                    "start_flag": true,
                }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "report failed: {body}");
        body["agent_id"].as_str().unwrap().to_string()
    }

    async fn create_peer(&self, address: &str) -> String {
        let (status, body) = self
            .post(
                "/v1/routingpeers",
                json!({
                    "tenant_id": TenantId::new().to_string(),
                    "peer_address": address,
                    "remote_as": 65001,
                    "secret": "s3cret",
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "create peer failed: {body}");
        body["id"].as_str().unwrap().to_string()
    }

    async fn create_instance(&self, routes: &[&str]) -> String {
        let (status, body) = self
            .post(
                "/v1/routinginstances",
                json!({
                    "tenant_id": TenantId::new().to_string(),
                    "nexthop": "192.0.2.254",
                    "advertise": true,
                    "advertise_routes": routes,
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "create instance failed: {body}");
        body["id"].as_str().unwrap().to_string()
    }
}

#[tokio::test]
async fn test_health_endpoints() {
    let h = ApiHarness::new().await;
    for path in ["/healthz", "/readyz", "/livez"] {
        let response = h.client.get(h.url(path)).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{path}");
    }
}

#[tokio::test]
async fn test_peer_crud_never_echoes_secret() {
    let h = ApiHarness::new().await;
    let peer_id = h.create_peer("192.0.2.1").await;

    let (status, body) = h.get(&format!("/v1/routingpeers/{peer_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["peer_address"], "192.0.2.1");
    assert_eq!(body["has_secret"], true);
    assert!(body.get("secret").is_none());

    let (status, body) = h
        .put(
            &format!("/v1/routingpeers/{peer_id}"),
            json!({"remote_as": 65002}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["remote_as"], 65002);

    let (_, body) = h.get("/v1/routingpeers").await;
    assert_eq!(body["items"].as_array().unwrap().len(), 1);

    assert_eq!(
        h.delete(&format!("/v1/routingpeers/{peer_id}")).await,
        StatusCode::NO_CONTENT
    );
    let (status, body) = h.get(&format!("/v1/routingpeers/{peer_id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "routing_peer_not_found");
}

#[tokio::test]
async fn test_peer_secret_can_be_removed_and_set() {
    let h = ApiHarness::new().await;
    let peer_id = h.create_peer("192.0.2.2").await;
    let uri = format!("/v1/routingpeers/{peer_id}");

    let (status, body) = h.put(&uri, json!({"secret": ""})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["has_secret"], false);

    let (_, body) = h.put(&uri, json!({"secret": "n3w"})).await;
    assert_eq!(body["has_secret"], true);

    // Absent field leaves the secret alone.
    let (_, body) = h.put(&uri, json!({"remote_as": 65003})).await;
    assert_eq!(body["has_secret"], true);

    let (_, body) = h.put(&uri, json!({"secret": null})).await;
    assert_eq!(body["has_secret"], false);

    let (_, body) = h.get(&uri).await;
    assert_eq!(body["has_secret"], false);
    assert_eq!(body["remote_as"], 65003);
}

#[tokio::test]
async fn test_instance_nexthop_can_be_cleared() {
    let h = ApiHarness::new().await;
    let instance_id = h.create_instance(&["10.0.0.0/24"]).await;
    let uri = format!("/v1/routinginstances/{instance_id}");

    let (_, body) = h.put(&uri, json!({"advertise": true})).await;
    assert_eq!(body["nexthop"], "192.0.2.254");

    let (status, body) = h.put(&uri, json!({"nexthop": null})).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.get("nexthop").is_none());

    let (_, body) = h.get(&uri).await;
    assert!(body.get("nexthop").is_none());
    assert_eq!(body["advertise_routes"], json!(["10.0.0.0/24"]));
}

#[tokio::test]
async fn test_duplicate_peer_address_is_conflict() {
    let h = ApiHarness::new().await;
    h.create_peer("2001:db8::1").await;

    let (status, body) = h
        .post(
            "/v1/routingpeers",
            json!({
                "tenant_id": TenantId::new().to_string(),
                "peer_address": "2001:db8::1",
                "remote_as": 65001,
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "peer_address_in_use");
}

#[tokio::test]
async fn test_invalid_peer_lists_field_errors() {
    let h = ApiHarness::new().await;
    let (status, body) = h
        .post(
            "/v1/routingpeers",
            json!({
                "tenant_id": TenantId::new().to_string(),
                "peer_address": "192.0.2.300",
                "remote_as": 0,
            }),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_failed");
    let fields: Vec<&str> = body["details"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["field"].as_str().unwrap())
        .collect();
    assert_eq!(fields, vec!["peer_address", "remote_as"]);
}

#[tokio::test]
async fn test_agent_sync_schedules_peers() {
    let h = ApiHarness::new().await;
    let agent_id = h.report("host-a").await;
    let peer_id = h.create_peer("192.0.2.1").await;

    let (status, body) = h
        .post("/v1/agent-sync/routingpeers", json!({"host": "host-a"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    let peers = body["routing_peers"].as_array().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0]["id"], peer_id.as_str());
    // Agents need the session secret.
    assert_eq!(peers[0]["secret"], "s3cret");

    let (_, body) = h.get(&format!("/v1/routingpeers/{peer_id}/agents")).await;
    assert_eq!(body["items"][0]["id"], agent_id.as_str());
    assert_eq!(body["items"][0]["alive"], true);
}

#[tokio::test]
async fn test_sync_with_empty_host_is_rejected() {
    let h = ApiHarness::new().await;
    let (status, body) = h
        .post("/v1/agent-sync/routingpeers", json!({"host": "  "}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"][0]["field"], "host");
}

#[tokio::test]
async fn test_explicit_bind_and_unbind() {
    let policy = SchedulerPolicy {
        auto_schedule: false,
        ..Default::default()
    };
    let h = ApiHarness::with_policy(policy).await;
    let agent_id = h.report("host-a").await;
    let peer_id = h.create_peer("192.0.2.1").await;

    let path = format!("/v1/agents/{agent_id}/routingpeers");
    let (status, _) = h.post(&path, json!({"routingpeer_id": peer_id})).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = h.post(&path, json!({"routingpeer_id": peer_id})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "routing_peer_already_hosted");

    let (_, body) = h.get(&path).await;
    assert_eq!(body["items"][0]["id"], peer_id.as_str());

    assert_eq!(
        h.delete(&format!("{path}/{peer_id}")).await,
        StatusCode::NO_CONTENT
    );
    assert_eq!(
        h.delete(&format!("{path}/{peer_id}")).await,
        StatusCode::NOT_FOUND
    );

    let sent = h.transport.wait_for(2, Duration::from_secs(2)).await;
    let methods: Vec<&str> = sent.iter().map(|(_, n)| n.method()).collect();
    assert_eq!(methods, vec!["add_routingpeer", "remove_routingpeer"]);
}

#[tokio::test]
async fn test_bind_to_disabled_agent_is_invalid() {
    let h = ApiHarness::new().await;
    let agent_id = h.report("host-a").await;
    let peer_id = h.create_peer("192.0.2.1").await;

    let (status, body) = h
        .put(
            &format!("/v1/agents/{agent_id}"),
            json!({"admin_state_up": false}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["admin_state_up"], false);

    let (status, body) = h
        .post(
            &format!("/v1/agents/{agent_id}/routingpeers"),
            json!({"routingpeer_id": peer_id}),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "invalid_agent");
}

#[tokio::test]
async fn test_instance_exclusivity_over_http() {
    let h = ApiHarness::new().await;
    let agent_id = h.report("host-a").await;
    let first = h.create_instance(&[]).await;
    let second = h.create_instance(&[]).await;

    let (status, _) = h
        .post(
            &format!("/v1/routinginstances/{first}/agents"),
            json!({"agent_id": agent_id}),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = h
        .post(
            &format!("/v1/routinginstances/{second}/agents"),
            json!({"agent_id": agent_id}),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "agent_hosts_routing_instance");

    let (_, body) = h.get(&format!("/v1/agents/{agent_id}/routinginstances")).await;
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
    assert_eq!(body["items"][0]["id"], first.as_str());
}

#[tokio::test]
async fn test_advertise_networks_sync() {
    let h = ApiHarness::new().await;
    h.report("host-a").await;
    let instance_id = h.create_instance(&["172.16.0.0/16"]).await;

    let (status, _) = h
        .post(
            &format!("/v1/routinginstances/{instance_id}/networks"),
            json!({"network_id": h.network_id.to_string()}),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = h
        .post("/v1/agent-sync/advertisenetworks", json!({"host": "host-a"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    let cidrs: Vec<&str> = body["networks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["cidr"].as_str().unwrap())
        .collect();
    assert_eq!(cidrs, vec!["10.20.0.0/24", "172.16.0.0/16"]);
    assert_eq!(body["networks"][0]["next_hop"], "192.0.2.254");
}

#[tokio::test]
async fn test_instance_update_notifies_hosts() {
    let h = ApiHarness::new().await;
    h.report("host-a").await;
    let instance_id = h.create_instance(&["10.0.0.0/24"]).await;

    // Sync binds the instance to the agent.
    h.post("/v1/agent-sync/advertisenetworks", json!({"host": "host-a"}))
        .await;

    let (status, body) = h
        .put(
            &format!("/v1/routinginstances/{instance_id}"),
            json!({"advertise_routes": ["10.1.0.0/24", "10.1.0.0/24"]}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["advertise_routes"], json!(["10.1.0.0/24"]));

    let sent = h.transport.wait_for(1, Duration::from_secs(2)).await;
    assert!(sent.iter().any(|(host, n)| host == "host-a"
        && matches!(n, AgentNotification::AddRoutinginstance(r) if r.routing_instance_id.to_string() == instance_id)));
}

#[tokio::test]
async fn test_report_state_unsupported() {
    let policy = SchedulerPolicy {
        state_reporting: false,
        ..Default::default()
    };
    let h = ApiHarness::with_policy(policy).await;
    let (status, body) = h
        .post(
            "/v1/agent-sync/report-state",
            json!({
                "agent_type": AGENT_TYPE_DYNAMIC_ROUTING,
                "binary": "dr-agent",
                "host": "host-a",
                "topic": "dr_agent",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(body["code"], "state_reporting_unsupported");
}
