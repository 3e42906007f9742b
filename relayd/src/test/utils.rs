use std::time::Duration;

use axum_test::TestServer;
use relay::DeliverySwitch;

use crate::api::models::tenants::TenantCreateResponse;
use crate::{Backends, Config, build_router, build_state};

pub const ADMIN_KEY: &str = "test-admin-key";

/// In-memory config with operator routes enabled and plain-http targets allowed.
pub fn create_test_config() -> Config {
    let mut config = Config::default();
    config.admin_api_key = Some(ADMIN_KEY.to_string());
    config.allow_insecure_urls = true;
    config.worker.poll_interval = Duration::from_millis(20);
    config
}

/// Router over in-memory backends with no background tasks. The returned backends
/// share state with the server.
pub fn create_test_server(config: Config) -> (TestServer, Backends) {
    let backends = Backends::in_memory(&config);
    let switch = DeliverySwitch::new(config.delivery.enabled);
    let state = build_state(config, &backends, switch).expect("Failed to build state");
    let server = TestServer::new(build_router(state)).expect("Failed to create test server");
    (server, backends)
}

pub fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

pub async fn create_test_tenant(server: &TestServer, tenant_id: &str, target_url: &str) -> TenantCreateResponse {
    let response = server
        .post("/v1/tenants")
        .add_header("authorization", bearer(ADMIN_KEY))
        .json(&serde_json::json!({
            "tenant_id": tenant_id,
            "target_url": target_url,
        }))
        .await;
    assert_eq!(response.status_code(), 201, "Failed to create tenant: {}", response.text());
    response.json()
}
