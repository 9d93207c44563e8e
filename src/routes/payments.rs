use actix_web::{get, post, web, HttpRequest, HttpResponse};
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::actions::{
    self,
    payments::{META_EVENT, META_KIND, META_REGISTRATION, META_TIER, META_USER},
};
use crate::auth::AuthUser;
use crate::config::Config;
use crate::db::DbPool;
use crate::envelope;
use crate::error::{ApiError, ApiResult};
use crate::models::{
    CheckoutResponse, Fulfillment, MembershipCheckoutRequest, MembershipTier, PaymentKind, TierPlan,
    VerifyPaymentRequest,
};
use crate::payments::{
    webhook::{self, WebhookEvent},
    CheckoutRequest, CheckoutSession, PaymentProcessor,
};
use crate::queue::{Notification, QueueService};

use super::{events::confirmed, notify};

fn success_url(config: &Config) -> String {
    format!("{}/payments/success?session_id={{CHECKOUT_SESSION_ID}}", config.payments.frontend_url)
}

fn cancel_url(config: &Config) -> String {
    format!("{}/payments/cancelled", config.payments.frontend_url)
}

fn announce(queue: &web::Data<QueueService>, fulfillment: &Fulfillment) {
    let notification = match fulfillment {
        Fulfillment::Membership { user } => Some(Notification::MembershipActivated {
            user_id: user.id,
            tier: user.membership_tier,
            expires_at: user.membership_expires_at,
        }),
        Fulfillment::EventRegistration { registration } => confirmed(registration),
        Fulfillment::AlreadyProcessed { .. } => None,
    };
    notify(queue, notification.into_iter().collect(), Vec::new());
}

async fn fulfill(pool: &web::Data<DbPool>, session: CheckoutSession) -> ApiResult<Fulfillment> {
    let pool = pool.clone();
    let fulfillment = web::block(move || {
        let mut conn = pool.get()?;
        actions::payments::fulfill(&mut conn, &session, Utc::now())
    })
    .await??;
    Ok(fulfillment)
}

#[get("/tiers")]
async fn tiers() -> HttpResponse {
    let plans: Vec<TierPlan> = MembershipTier::ALL.iter().copied().map(TierPlan::from).collect();
    envelope::ok(plans)
}

#[post("/membership/checkout")]
async fn membership_checkout(
    pool: web::Data<DbPool>,
    config: web::Data<Config>,
    processor: web::Data<dyn PaymentProcessor>,
    auth: AuthUser,
    form: web::Json<MembershipCheckoutRequest>,
) -> Result<HttpResponse, ApiError> {
    let tier = form.tier;
    let user = web::block(move || {
        let mut conn = pool.get()?;
        actions::users::get_user(&mut conn, auth.id)
    })
    .await??;

    let request = CheckoutRequest {
        product_name: format!("{} membership", tier.display_name()),
        amount_cents: i64::from(tier.price_cents()),
        currency: "usd".to_string(),
        customer_email: user.email,
        success_url: success_url(&config),
        cancel_url: cancel_url(&config),
        metadata: vec![
            (META_KIND.to_string(), PaymentKind::Membership.to_string()),
            (META_USER.to_string(), user.id.to_string()),
            (META_TIER.to_string(), tier.to_string()),
        ],
    };
    let session = processor.create_checkout(&request).await?;

    log::info!("Created membership checkout {} for user {} ({})", session.id, user.id, tier);
    Ok(envelope::created(CheckoutResponse { session_id: session.id, url: session.url }))
}

#[post("/membership/cancel")]
async fn cancel_membership(pool: web::Data<DbPool>, auth: AuthUser) -> Result<HttpResponse, ApiError> {
    let user = web::block(move || {
        let mut conn = pool.get()?;
        actions::users::cancel_membership(&mut conn, auth.id, Utc::now())
    })
    .await??;

    Ok(envelope::ok(user))
}

#[post("/events/{id}/checkout")]
async fn event_checkout(
    pool: web::Data<DbPool>,
    config: web::Data<Config>,
    processor: web::Data<dyn PaymentProcessor>,
    auth: AuthUser,
    event_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let event_id = event_id.into_inner();
    let prepare_pool = pool.clone();
    let (event, registration, user) = web::block(move || {
        let mut conn = prepare_pool.get()?;
        actions::payments::prepare_event_checkout(&mut conn, event_id, auth.id)
    })
    .await??;

    let request = CheckoutRequest {
        product_name: event.title.clone(),
        amount_cents: i64::from(event.price_cents),
        currency: event.currency.clone(),
        customer_email: user.email,
        success_url: success_url(&config),
        cancel_url: cancel_url(&config),
        metadata: vec![
            (META_KIND.to_string(), PaymentKind::EventRegistration.to_string()),
            (META_USER.to_string(), user.id.to_string()),
            (META_EVENT.to_string(), event.id.to_string()),
            (META_REGISTRATION.to_string(), registration.id.to_string()),
        ],
    };
    let session = processor.create_checkout(&request).await?;

    let session_id = session.id.clone();
    web::block(move || {
        let mut conn = pool.get()?;
        actions::payments::attach_session(&mut conn, registration.id, &session_id, Utc::now())
    })
    .await??;

    log::info!("Created event checkout {} for registration {}", session.id, registration.id);
    Ok(envelope::created(CheckoutResponse { session_id: session.id, url: session.url }))
}

#[derive(Debug, Serialize)]
struct WebhookAck {
    received: bool,
    fulfilled: bool,
}

#[post("/webhook")]
async fn payment_webhook(
    pool: web::Data<DbPool>,
    config: web::Data<Config>,
    queue: web::Data<QueueService>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    let secret = config
        .payments
        .webhook_secret
        .as_deref()
        .ok_or_else(|| ApiError::ServiceUnavailable("Payment webhooks are not configured".to_string()))?;
    let signature = req
        .headers()
        .get(webhook::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_request("Missing webhook signature"))?;

    webhook::verify(&body, signature, secret, Utc::now().timestamp())?;
    let event = WebhookEvent::parse(&body)?;

    let Some(session) = event.paid_checkout()? else {
        log::debug!("Acknowledged webhook {} ({})", event.id, event.kind);
        return Ok(envelope::ok(WebhookAck { received: true, fulfilled: false }));
    };

    let fulfillment = fulfill(&pool, session).await?;
    announce(&queue, &fulfillment);
    log::info!("Webhook {} fulfilled checkout", event.id);
    Ok(envelope::ok(WebhookAck { received: true, fulfilled: true }))
}

#[post("/verify")]
async fn verify(
    pool: web::Data<DbPool>,
    processor: web::Data<dyn PaymentProcessor>,
    queue: web::Data<QueueService>,
    auth: AuthUser,
    form: web::Json<VerifyPaymentRequest>,
) -> Result<HttpResponse, ApiError> {
    let session = processor.retrieve_checkout(&form.session_id).await?;
    let owner = session.metadata.get(META_USER).and_then(|id| Uuid::parse_str(id).ok());
    if owner != Some(auth.id) && !auth.is_admin() {
        return Err(ApiError::forbidden("This checkout session belongs to another user"));
    }
    if !session.is_paid() {
        return Err(ApiError::bad_request("Payment has not been completed"));
    }

    let fulfillment = fulfill(&pool, session).await?;
    announce(&queue, &fulfillment);
    Ok(envelope::ok(fulfillment))
}

#[get("/history")]
async fn history(pool: web::Data<DbPool>, auth: AuthUser) -> Result<HttpResponse, ApiError> {
    let rows = web::block(move || {
        let mut conn = pool.get()?;
        actions::payments::history(&mut conn, auth.id)
    })
    .await??;

    Ok(envelope::ok(rows))
}
