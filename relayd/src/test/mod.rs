pub mod utils;

use std::time::Duration;

use axum::body::Bytes;
use relay::{DeliveryOutcome, Event, EventId, EventPage, EventStatus, QueueMessage, TenantId};
use serde_json::json;
use utils::{ADMIN_KEY, bearer, create_test_config, create_test_server, create_test_tenant};

use crate::Application;
use crate::api::models::events::EventCreateResponse;
use crate::api::models::tenants::TenantResponse;

/// End-to-end: operator creates a tenant, the tenant ingests an event, the worker
/// delivers it signed to the tenant's endpoint.
#[test_log::test(tokio::test)]
async fn test_e2e_ingest_and_deliver() {
    let receiver = wiremock::MockServer::start().await;
    wiremock::Mock::given(wiremock::matchers::method("POST"))
        .and(wiremock::matchers::path("/webhook"))
        .respond_with(wiremock::ResponseTemplate::new(200))
        .expect(1)
        .mount(&receiver)
        .await;

    let app = Application::new(create_test_config())
        .await
        .expect("Failed to create application");
    let (server, bg_services) = app.into_test_server();

    let tenant = create_test_tenant(&server, "acme", &format!("{}/webhook", receiver.uri())).await;
    assert_eq!(tenant.api_key, "tenant_acme_key");
    assert!(tenant.webhook_secret.starts_with("whsec_"));

    let created = server
        .post("/v1/events")
        .add_header("authorization", bearer(&tenant.api_key))
        .json(&json!({"event": "user.signup", "user_id": "123"}))
        .await;
    assert_eq!(created.status_code(), 201);
    let created: EventCreateResponse = created.json();
    assert_eq!(created.status, EventStatus::Pending);
    assert!(created.event_id.as_str().starts_with("evt_"));

    let mut delivered = None;
    for _ in 0..250 {
        let event: Event = server
            .get(&format!("/v1/events/{}", created.event_id))
            .add_header("authorization", bearer(&tenant.api_key))
            .await
            .json();
        if event.status == EventStatus::Delivered {
            delivered = Some(event);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let delivered = delivered.expect("event was not delivered");
    assert_eq!(delivered.attempts, 1);
    assert!(delivered.error_message.is_none());

    let requests = receiver.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let signature = requests[0]
        .headers
        .get("Stripe-Signature")
        .and_then(|v| v.to_str().ok())
        .expect("signature header");
    assert!(relay::signing::verify(
        &tenant.webhook_secret,
        &requests[0].body,
        signature,
        Some(Duration::from_secs(300)),
    ));

    bg_services.shutdown().await;
}

#[tokio::test]
async fn test_create_tenant_requires_admin_key() {
    let (server, _) = create_test_server(create_test_config());
    let body = json!({"tenant_id": "acme", "target_url": "https://example.com/webhook"});

    let response = server.post("/v1/tenants").json(&body).await;
    assert_eq!(response.status_code(), 401);

    let response = server
        .post("/v1/tenants")
        .add_header("authorization", bearer("wrong-key"))
        .json(&body)
        .await;
    assert_eq!(response.status_code(), 401);

    let response = server
        .post("/v1/tenants")
        .add_header("authorization", bearer(ADMIN_KEY))
        .json(&body)
        .await;
    assert_eq!(response.status_code(), 201);

    // Same tenant again
    let response = server
        .post("/v1/tenants")
        .add_header("authorization", bearer(ADMIN_KEY))
        .json(&body)
        .await;
    assert_eq!(response.status_code(), 409);
}

#[tokio::test]
async fn test_api_key_clash_leaves_tenant_creatable() {
    let (server, backends) = create_test_server(create_test_config());
    let create = |tenant_id: &str, api_key: &str| {
        server
            .post("/v1/tenants")
            .add_header("authorization", bearer(ADMIN_KEY))
            .json(&json!({
                "tenant_id": tenant_id,
                "target_url": format!("https://{tenant_id}.example/webhook"),
                "api_key": api_key,
            }))
    };

    assert_eq!(create("acme", "shared").await.status_code(), 201);

    let response = create("globex", "shared").await;
    assert_eq!(response.status_code(), 409);
    assert!(
        backends.tenant_configs.get_config(&TenantId::from("globex")).await.unwrap().is_none(),
        "rejected tenant kept its webhook config"
    );

    let response = create("globex", "globex-key").await;
    assert_eq!(response.status_code(), 201, "{}", response.text());

    let response = server
        .get("/v1/tenants/me")
        .add_header("authorization", bearer("globex-key"))
        .await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<TenantResponse>().tenant_id, TenantId::from("globex"));

    // The clashing key still belongs to its first owner
    let response = server
        .get("/v1/tenants/me")
        .add_header("authorization", bearer("shared"))
        .await;
    assert_eq!(response.json::<TenantResponse>().tenant_id, TenantId::from("acme"));
}

#[tokio::test]
async fn test_create_tenant_validates_input() {
    let mut config = create_test_config();
    config.allow_insecure_urls = false;
    let (server, _) = create_test_server(config);

    for body in [
        json!({"tenant_id": "acme", "target_url": "http://example.com/webhook"}),
        json!({"tenant_id": "acme", "target_url": "not a url"}),
        json!({"tenant_id": "bad tenant", "target_url": "https://example.com/webhook"}),
        json!({"tenant_id": "acme", "target_url": "https://example.com/webhook", "webhook_secret": ""}),
    ] {
        let response = server
            .post("/v1/tenants")
            .add_header("authorization", bearer(ADMIN_KEY))
            .json(&body)
            .await;
        assert_eq!(response.status_code(), 400, "accepted {body}");
    }
}

#[tokio::test]
async fn test_operator_routes_disabled_without_admin_key() {
    let mut config = create_test_config();
    config.admin_api_key = None;
    let (server, _) = create_test_server(config);

    let response = server
        .get("/v1/admin/delivery")
        .add_header("authorization", bearer(ADMIN_KEY))
        .await;
    assert_eq!(response.status_code(), 401);
    assert_eq!(response.json::<serde_json::Value>()["error"], "Operator routes are disabled");
}

#[tokio::test]
async fn test_ingest_requires_valid_api_key() {
    let (server, _) = create_test_server(create_test_config());
    create_test_tenant(&server, "acme", "https://example.com/webhook").await;

    let response = server.post("/v1/events").json(&json!({"event": "x"})).await;
    assert_eq!(response.status_code(), 401);

    let response = server
        .post("/v1/events")
        .add_header("authorization", bearer("tenant_nobody_key"))
        .json(&json!({"event": "x"}))
        .await;
    assert_eq!(response.status_code(), 401);
    assert_eq!(response.json::<serde_json::Value>()["error"], "Invalid API key");
}

#[tokio::test]
async fn test_ingest_rejects_non_object_payload() {
    let (server, backends) = create_test_server(create_test_config());
    let tenant = create_test_tenant(&server, "acme", "https://example.com/webhook").await;

    let response = server
        .post("/v1/events")
        .add_header("authorization", bearer(&tenant.api_key))
        .json(&json!([1, 2, 3]))
        .await;
    assert_eq!(response.status_code(), 400);
    assert_eq!(backends.queue.depth().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_ingest_stores_target_url_snapshot_and_enqueues() {
    let (server, backends) = create_test_server(create_test_config());
    let tenant = create_test_tenant(&server, "acme", "https://example.com/webhook").await;

    let created: EventCreateResponse = server
        .post("/v1/events")
        .add_header("authorization", bearer(&tenant.api_key))
        .json(&json!({"event": "user.signup"}))
        .await
        .json();

    let event = backends
        .events
        .get(&TenantId::from("acme"), &created.event_id)
        .await
        .unwrap();
    assert_eq!(event.target_url, "https://example.com/webhook");
    assert_eq!(event.attempts, 0);

    let messages = backends.queue.receive(10).await.unwrap();
    assert_eq!(messages.len(), 1);
    let message = QueueMessage::from_body(&messages[0].body).unwrap();
    assert_eq!(message.event_id, created.event_id);
    assert_eq!(message.tenant_id.as_str(), "acme");
}

#[tokio::test]
async fn test_list_and_get_events_are_tenant_scoped() {
    let (server, _) = create_test_server(create_test_config());
    let acme = create_test_tenant(&server, "acme", "https://acme.example.com/webhook").await;
    let globex = create_test_tenant(&server, "globex", "https://globex.example.com/webhook").await;

    let mut acme_events = Vec::new();
    for i in 0..3 {
        let created: EventCreateResponse = server
            .post("/v1/events")
            .add_header("authorization", bearer(&acme.api_key))
            .json(&json!({"sequence": i}))
            .await
            .json();
        acme_events.push(created.event_id);
    }

    let page: EventPage = server
        .get("/v1/events")
        .add_query_param("limit", 2)
        .add_header("authorization", bearer(&acme.api_key))
        .await
        .json();
    assert_eq!(page.events.len(), 2);
    let cursor = page.next_cursor.expect("second page");

    let rest: EventPage = server
        .get("/v1/events")
        .add_query_param("limit", 2)
        .add_query_param("cursor", &cursor)
        .add_header("authorization", bearer(&acme.api_key))
        .await
        .json();
    assert_eq!(rest.events.len(), 1);
    assert!(rest.next_cursor.is_none());

    let mut listed: Vec<EventId> = page.events.into_iter().chain(rest.events).map(|e| e.event_id).collect();
    listed.sort();
    acme_events.sort();
    assert_eq!(listed, acme_events);

    // globex sees nothing of acme's
    let page: EventPage = server
        .get("/v1/events")
        .add_header("authorization", bearer(&globex.api_key))
        .await
        .json();
    assert!(page.events.is_empty());

    let response = server
        .get(&format!("/v1/events/{}", acme_events[0]))
        .add_header("authorization", bearer(&globex.api_key))
        .await;
    assert_eq!(response.status_code(), 404);

    let response = server
        .post(&format!("/v1/events/{}/retry", acme_events[0]))
        .add_header("authorization", bearer(&globex.api_key))
        .await;
    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn test_list_rejects_bad_filters() {
    let (server, _) = create_test_server(create_test_config());
    let tenant = create_test_tenant(&server, "acme", "https://example.com/webhook").await;

    let response = server
        .get("/v1/events")
        .add_query_param("status", "LOST")
        .add_header("authorization", bearer(&tenant.api_key))
        .await;
    assert_eq!(response.status_code(), 400);

    let response = server
        .get("/v1/events")
        .add_query_param("cursor", "!!not-a-cursor!!")
        .add_header("authorization", bearer(&tenant.api_key))
        .await;
    assert_eq!(response.status_code(), 400);
}

#[tokio::test]
async fn test_retry_only_failed_events() {
    let (server, backends) = create_test_server(create_test_config());
    let tenant = create_test_tenant(&server, "acme", "https://example.com/webhook").await;
    let tenant_id = TenantId::from("acme");

    let created: EventCreateResponse = server
        .post("/v1/events")
        .add_header("authorization", bearer(&tenant.api_key))
        .json(&json!({"event": "invoice.paid"}))
        .await
        .json();
    let retry_path = format!("/v1/events/{}/retry", created.event_id);

    // Still PENDING
    let response = server
        .post(&retry_path)
        .add_header("authorization", bearer(&tenant.api_key))
        .await;
    assert_eq!(response.status_code(), 409);

    backends
        .events
        .record_outcome(
            &tenant_id,
            &created.event_id,
            &DeliveryOutcome::failed(Some(503), "HTTP 503"),
        )
        .await
        .unwrap();

    let response = server
        .post(&retry_path)
        .add_header("authorization", bearer(&tenant.api_key))
        .await;
    assert_eq!(response.status_code(), 202);
    let event: Event = response.json();
    assert_eq!(event.status, EventStatus::Pending);
    assert_eq!(event.attempts, 1);
    assert!(event.error_message.is_none());

    // One message from ingestion, one from the retry
    assert_eq!(backends.queue.depth().await.unwrap().total(), 2);

    let response = server
        .post(&retry_path)
        .add_header("authorization", bearer(&tenant.api_key))
        .await;
    assert_eq!(response.status_code(), 409);
}

#[tokio::test]
async fn test_tenant_self_service() {
    let (server, _) = create_test_server(create_test_config());
    let tenant = create_test_tenant(&server, "acme", "https://example.com/webhook").await;

    let me = server
        .get("/v1/tenants/me")
        .add_header("authorization", bearer(&tenant.api_key))
        .await;
    assert_eq!(me.status_code(), 200);
    let body: serde_json::Value = me.json();
    assert_eq!(body["target_url"], "https://example.com/webhook");
    assert!(body.get("webhook_secret").is_none());

    // URL change alone does not reveal the secret
    let updated: TenantResponse = server
        .patch("/v1/tenants/me")
        .add_header("authorization", bearer(&tenant.api_key))
        .json(&json!({"target_url": "https://example.com/v2/webhook"}))
        .await
        .json();
    assert_eq!(updated.target_url, "https://example.com/v2/webhook");
    assert!(updated.webhook_secret.is_none());

    let rotated: TenantResponse = server
        .patch("/v1/tenants/me")
        .add_header("authorization", bearer(&tenant.api_key))
        .json(&json!({"rotate_secret": true}))
        .await
        .json();
    let new_secret = rotated.webhook_secret.expect("rotated secret is returned");
    assert!(new_secret.starts_with("whsec_"));
    assert_ne!(new_secret, tenant.webhook_secret);

    let response = server
        .patch("/v1/tenants/me")
        .add_header("authorization", bearer(&tenant.api_key))
        .json(&json!({}))
        .await;
    assert_eq!(response.status_code(), 400);
}

#[tokio::test]
async fn test_receiver_verifies_signatures() {
    let (server, _) = create_test_server(create_test_config());
    let tenant = create_test_tenant(&server, "acme", "https://example.com/webhook").await;
    let body = br#"{"event":"user.signup","user_id":"123"}"#.to_vec();
    let signature = relay::signing::sign_now(&tenant.webhook_secret, &body);

    let response = server
        .post("/receiver/acme/webhook")
        .add_header("Stripe-Signature", signature.clone())
        .bytes(Bytes::from(body.clone()))
        .await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<serde_json::Value>()["status"], "received");

    let response = server.post("/receiver/acme/webhook").bytes(Bytes::from(body.clone())).await;
    assert_eq!(response.status_code(), 401);

    let forged = relay::signing::sign_now("whsec_wrong", &body);
    let response = server
        .post("/receiver/acme/webhook")
        .add_header("Stripe-Signature", forged)
        .bytes(Bytes::from(body.clone()))
        .await;
    assert_eq!(response.status_code(), 401);

    // Body altered after signing
    let response = server
        .post("/receiver/acme/webhook")
        .add_header("Stripe-Signature", signature.clone())
        .bytes(Bytes::from_static(br#"{"event":"user.signup","user_id":"999"}"#))
        .await;
    assert_eq!(response.status_code(), 401);

    let stale = relay::signing::sign(&tenant.webhook_secret, &body, chrono::Utc::now().timestamp() - 3600);
    let response = server
        .post("/receiver/acme/webhook")
        .add_header("Stripe-Signature", stale)
        .bytes(Bytes::from(body.clone()))
        .await;
    assert_eq!(response.status_code(), 401);

    let response = server
        .post("/receiver/globex/webhook")
        .add_header("Stripe-Signature", signature)
        .bytes(Bytes::from(body))
        .await;
    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn test_delivery_switch() {
    let (server, _) = create_test_server(create_test_config());
    let tenant = create_test_tenant(&server, "acme", "https://example.com/webhook").await;

    let state: serde_json::Value = server
        .get("/v1/admin/delivery")
        .add_header("authorization", bearer(ADMIN_KEY))
        .await
        .json();
    assert_eq!(state["enabled"], true);

    let response = server
        .put("/v1/admin/delivery")
        .add_header("authorization", bearer(ADMIN_KEY))
        .json(&json!({"enabled": false}))
        .await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<serde_json::Value>()["enabled"], false);

    let response = server
        .post("/v1/events")
        .add_header("authorization", bearer(&tenant.api_key))
        .json(&json!({"event": "x"}))
        .await;
    assert_eq!(response.status_code(), 503);

    let body = b"{}".to_vec();
    let response = server
        .post("/receiver/acme/webhook")
        .add_header("Stripe-Signature", relay::signing::sign_now(&tenant.webhook_secret, &body))
        .bytes(Bytes::from(body))
        .await;
    assert_eq!(response.status_code(), 503);

    let health: serde_json::Value = server.get("/healthz").await.json();
    assert_eq!(health["delivery_enabled"], false);

    server
        .put("/v1/admin/delivery")
        .add_header("authorization", bearer(ADMIN_KEY))
        .json(&json!({"enabled": true}))
        .await;
    let response = server
        .post("/v1/events")
        .add_header("authorization", bearer(&tenant.api_key))
        .json(&json!({"event": "x"}))
        .await;
    assert_eq!(response.status_code(), 201);
}

#[tokio::test]
async fn test_requeue_dead_letters() {
    let (server, backends) = create_test_server(create_test_config());
    for i in 0..3 {
        let message = QueueMessage::new(TenantId::from("acme"), EventId::from(format!("evt_{i:012x}")));
        backends.dead_letters.send(&message.to_body().unwrap()).await.unwrap();
    }
    backends.dead_letters.send("not json").await.unwrap();

    let response = server
        .post("/v1/admin/dead-letters/requeue")
        .add_header("authorization", bearer(ADMIN_KEY))
        .json(&json!({"max_messages": 10}))
        .await;
    assert_eq!(response.status_code(), 200);
    let report: serde_json::Value = response.json();
    assert_eq!(report["requeued"], 3);
    assert_eq!(report["failed"], 1);

    assert_eq!(backends.queue.depth().await.unwrap().total(), 3);
    // The invalid body stays put
    assert_eq!(backends.dead_letters.depth().await.unwrap().total(), 1);
}

#[tokio::test]
async fn test_healthz() {
    let (server, _) = create_test_server(create_test_config());

    let response = server.get("/healthz").await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<serde_json::Value>()["status"], "healthy");
}

#[tokio::test]
async fn test_metrics_route_follows_config() {
    let (server, _) = create_test_server(create_test_config());
    assert_eq!(server.get("/internal/metrics").await.status_code(), 404);

    let mut config = create_test_config();
    config.enable_metrics = true;
    let (server, _) = create_test_server(config);
    let response = server.get("/internal/metrics").await;
    assert_eq!(response.status_code(), 200);
}

#[tokio::test]
async fn test_receiver_can_be_disabled() {
    let mut config = create_test_config();
    config.receiver.enabled = false;
    let (server, _) = create_test_server(config);

    let response = server.post("/receiver/acme/webhook").bytes(Bytes::from_static(b"{}")).await;
    assert_eq!(response.status_code(), 404);
}
