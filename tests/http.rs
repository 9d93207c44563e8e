//! Route-level tests. The pool never connects, so every case here is decided
//! before the database is touched.

use std::{collections::HashMap, sync::Arc, time::Duration as StdDuration};

use actix_web::{http::header, test, web, App};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use diesel::{r2d2::ConnectionManager, PgConnection};
use serde_json::{json, Value};
use uuid::Uuid;

use membership::{
    auth::TokenSigner,
    config::Config,
    db::DbPool,
    models::Role,
    payments::{webhook, CheckoutRequest, CheckoutSession, PaymentError, PaymentProcessor, Refund},
    queue::QueueService,
    routes,
};

const JWT_SECRET: &str = "http-test-secret-0123456789";
const WEBHOOK_SECRET: &str = "whsec_http_test";

struct FakeProcessor {
    session: CheckoutSession,
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    async fn create_checkout(&self, _request: &CheckoutRequest) -> Result<CheckoutSession, PaymentError> {
        Ok(self.session.clone())
    }

    async fn retrieve_checkout(&self, _session_id: &str) -> Result<CheckoutSession, PaymentError> {
        Ok(self.session.clone())
    }

    async fn refund(&self, _payment_intent_id: &str, amount_cents: i64) -> Result<Refund, PaymentError> {
        Ok(Refund { id: "re_test".to_string(), status: Some("succeeded".to_string()), amount: Some(amount_cents) })
    }
}

fn unpaid_session(owner: Uuid) -> CheckoutSession {
    CheckoutSession {
        id: "cs_test_1".to_string(),
        url: Some("https://checkout.test/cs_test_1".to_string()),
        payment_status: "unpaid".to_string(),
        amount_total: Some(2_900),
        currency: Some("usd".to_string()),
        customer: None,
        payment_intent: None,
        metadata: HashMap::from([
            ("kind".to_string(), "membership".to_string()),
            ("user_id".to_string(), owner.to_string()),
            ("tier".to_string(), "foundation".to_string()),
        ]),
    }
}

fn config() -> Config {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("DATABASE_URL", "postgres://nobody@127.0.0.1:1/none"),
        ("JWT_SECRET", JWT_SECRET),
        ("PAYMENT_WEBHOOK_SECRET", WEBHOOK_SECRET),
        ("UPLOAD_DIR", "target/test-uploads"),
    ]);
    Config::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap()
}

fn lazy_pool(config: &Config) -> DbPool {
    r2d2::Pool::builder()
        .connection_timeout(StdDuration::from_millis(200))
        .build_unchecked(ConnectionManager::<PgConnection>::new(&config.database_url))
}

fn signer() -> TokenSigner {
    TokenSigner::new(JWT_SECRET, Duration::hours(1))
}

fn bearer(user_id: Uuid, role: Role) -> (header::HeaderName, String) {
    let token = signer().issue(user_id, role, Utc::now()).unwrap();
    (header::AUTHORIZATION, format!("Bearer {}", token))
}

macro_rules! app {
    ($processor:expr) => {{
        let config = config();
        let pool = lazy_pool(&config);
        let processor: Arc<dyn PaymentProcessor> = Arc::new($processor);
        test::init_service(
            App::new()
                .app_data(web::Data::new(QueueService::new(pool.clone(), config.amqp.clone())))
                .app_data(web::Data::new(pool))
                .app_data(web::Data::new(signer()))
                .app_data(web::Data::from(processor))
                .app_data(web::Data::new(config))
                .configure(routes::configure),
        )
        .await
    }};
}

fn fake() -> FakeProcessor {
    FakeProcessor { session: unpaid_session(Uuid::new_v4()) }
}

#[actix_web::test]
async fn tiers_are_listed_in_the_envelope() {
    let app = app!(fake());
    let req = test::TestRequest::get().uri("/api/payments/tiers").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;

    assert_eq!(body["error"], Value::Null);
    let tiers = body["data"].as_array().unwrap();
    assert_eq!(tiers.len(), 3);
    assert_eq!(tiers[0]["tier"], "foundation");
    assert_eq!(tiers[0]["price_cents"], 2_900);
    assert_eq!(tiers[2]["interval"], "year");
}

#[actix_web::test]
async fn member_routes_require_a_token() {
    let app = app!(fake());
    let req = test::TestRequest::get().uri("/api/users/me").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["data"], Value::Null);
    assert_eq!(body["error"], "Authentication required");
}

#[actix_web::test]
async fn tampered_token_is_rejected() {
    let app = app!(fake());
    let (name, value) = bearer(Uuid::new_v4(), Role::Member);
    let req = test::TestRequest::get()
        .uri("/api/auth/me")
        .insert_header((name, format!("{}x", value)))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
}

#[actix_web::test]
async fn admin_routes_reject_members() {
    let app = app!(fake());
    for uri in ["/api/admin/users", "/api/stats/overview", "/api/admin/payments"] {
        let req = test::TestRequest::get()
            .uri(uri)
            .insert_header(bearer(Uuid::new_v4(), Role::Member))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 403, "{}", uri);
    }
}

#[actix_web::test]
async fn signup_validation_happens_before_storage() {
    let app = app!(fake());
    let req = test::TestRequest::post()
        .uri("/api/auth/signup")
        .set_json(json!({
            "email": "not-an-email",
            "password": "long enough password",
            "first_name": "Ada",
            "last_name": "Lovelace"
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "A valid email address is required");
}

#[actix_web::test]
async fn json_errors_keep_the_envelope() {
    let app = app!(fake());

    let req = test::TestRequest::post()
        .uri("/api/auth/login")
        .insert_header((header::CONTENT_TYPE, "application/json"))
        .set_payload("{\"email\": ")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["data"], Value::Null);
    assert!(body["error"].is_string());

    let req = test::TestRequest::post()
        .uri("/api/auth/login")
        .insert_header((header::CONTENT_TYPE, "text/plain"))
        .set_payload("email=a@b.c")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 415);
}

#[actix_web::test]
async fn unknown_tier_is_a_bad_request() {
    let app = app!(fake());
    let req = test::TestRequest::post()
        .uri("/api/payments/membership/checkout")
        .insert_header(bearer(Uuid::new_v4(), Role::Member))
        .set_json(json!({ "tier": "platinum" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_web::test]
async fn short_new_password_is_rejected() {
    let app = app!(fake());
    let req = test::TestRequest::put()
        .uri("/api/users/me/password")
        .insert_header(bearer(Uuid::new_v4(), Role::Member))
        .set_json(json!({ "current_password": "whatever123", "new_password": "short" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_web::test]
async fn webhook_requires_a_valid_signature() {
    let app = app!(fake());
    let payload = json!({ "id": "evt_1", "type": "checkout.session.completed", "data": { "object": {} } }).to_string();

    let req = test::TestRequest::post()
        .uri("/api/payments/webhook")
        .set_payload(payload.clone())
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    let forged = webhook::sign(payload.as_bytes(), "whsec_other", Utc::now().timestamp()).unwrap();
    let req = test::TestRequest::post()
        .uri("/api/payments/webhook")
        .insert_header((webhook::SIGNATURE_HEADER, forged))
        .set_payload(payload)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert!(body["error"].as_str().unwrap().starts_with("Webhook rejected"));
}

#[actix_web::test]
async fn unrelated_webhook_events_are_acknowledged() {
    let app = app!(fake());
    let payload = json!({ "id": "evt_2", "type": "customer.created", "data": { "object": {} } }).to_string();
    let signature = webhook::sign(payload.as_bytes(), WEBHOOK_SECRET, Utc::now().timestamp()).unwrap();

    let req = test::TestRequest::post()
        .uri("/api/payments/webhook")
        .insert_header((webhook::SIGNATURE_HEADER, signature))
        .set_payload(payload)
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["data"]["received"], true);
    assert_eq!(body["data"]["fulfilled"], false);
}

#[actix_web::test]
async fn verify_checks_ownership_and_payment() {
    let owner = Uuid::new_v4();
    let app = app!(FakeProcessor { session: unpaid_session(owner) });

    let req = test::TestRequest::post()
        .uri("/api/payments/verify")
        .insert_header(bearer(Uuid::new_v4(), Role::Member))
        .set_json(json!({ "session_id": "cs_test_1" }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 403);

    let req = test::TestRequest::post()
        .uri("/api/payments/verify")
        .insert_header(bearer(owner, Role::Member))
        .set_json(json!({ "session_id": "cs_test_1" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "Payment has not been completed");
}

#[actix_web::test]
async fn unknown_routes_and_bad_ids_are_not_found() {
    let app = app!(fake());

    let req = test::TestRequest::get().uri("/api/nowhere").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "Not found");

    let req = test::TestRequest::get()
        .uri("/api/events/not-a-uuid/attendees")
        .insert_header(bearer(Uuid::new_v4(), Role::Admin))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);
}
