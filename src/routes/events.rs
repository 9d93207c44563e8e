use actix_multipart::Multipart;
use actix_web::{delete, get, patch, post, web, HttpResponse};
use chrono::Utc;
use uuid::Uuid;

use crate::actions;
use crate::auth::{AdminUser, AuthUser};
use crate::config::Config;
use crate::db::DbPool;
use crate::envelope;
use crate::error::{ApiError, ApiResult};
use crate::models::{
    CheckInRequest, CreateEventRequest, EventFilter, EventRegistration, RefundPlan, RegisterOutcome,
    RegistrationStatus, UpdateEventRequest,
};
use crate::payments::PaymentProcessor;
use crate::queue::{Notification, QueueService};
use crate::uploads::{self, UploadKind};

use super::notify;

pub(crate) fn confirmed(registration: &EventRegistration) -> Option<Notification> {
    (registration.status == RegistrationStatus::Registered).then(|| Notification::RegistrationConfirmed {
        user_id: registration.user_id,
        event_id: registration.event_id,
        registration_id: registration.id,
        confirmation_code: registration.confirmation_code.clone(),
    })
}

/// Issues the refund with the processor, then records it locally.
pub(crate) async fn issue_refund(
    pool: &web::Data<DbPool>,
    processor: &dyn PaymentProcessor,
    queue: &web::Data<QueueService>,
    plan: RefundPlan,
) -> ApiResult<EventRegistration> {
    let intent = plan
        .payment_intent_id
        .clone()
        .ok_or_else(|| ApiError::bad_request("Payment reference is missing; the refund cannot be issued"))?;
    let issued = processor.refund(&intent, i64::from(plan.amount_cents)).await?;

    let pool = pool.clone();
    let recorded = plan.clone();
    let transition = web::block(move || {
        let mut conn = pool.get()?;
        actions::registrations::complete_refund(&mut conn, &recorded, &issued.id, Utc::now())
    })
    .await??;

    notify(
        queue,
        vec![Notification::RefundIssued {
            user_id: plan.user_id,
            event_id: plan.event_id,
            registration_id: plan.registration_id,
            amount_cents: plan.amount_cents,
            currency: plan.currency,
        }],
        transition.offers,
    );
    Ok(transition.value)
}

#[get("")]
async fn list_events(
    pool: web::Data<DbPool>,
    auth: Option<AuthUser>,
    filter: web::Query<EventFilter>,
) -> Result<HttpResponse, ApiError> {
    let is_admin = auth.map_or(false, |a| a.is_admin());
    let events = web::block(move || {
        let mut conn = pool.get()?;
        actions::events::list(&mut conn, &filter, is_admin, Utc::now())
    })
    .await??;

    Ok(envelope::ok(events))
}

#[get("/{id_or_slug}")]
async fn get_event(
    pool: web::Data<DbPool>,
    auth: Option<AuthUser>,
    id_or_slug: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let is_admin = auth.map_or(false, |a| a.is_admin());
    let event = web::block(move || {
        let mut conn = pool.get()?;
        actions::events::get(&mut conn, &id_or_slug, is_admin, Utc::now())
    })
    .await??;

    Ok(envelope::ok(event))
}

#[post("")]
async fn create_event(
    pool: web::Data<DbPool>,
    admin: AdminUser,
    form: web::Json<CreateEventRequest>,
) -> Result<HttpResponse, ApiError> {
    let event = web::block(move || {
        let mut conn = pool.get()?;
        actions::events::create(&mut conn, form.into_inner(), admin.id(), Utc::now())
    })
    .await??;

    Ok(envelope::created(event))
}

#[patch("/{id}")]
async fn update_event(
    pool: web::Data<DbPool>,
    queue: web::Data<QueueService>,
    _admin: AdminUser,
    event_id: web::Path<Uuid>,
    form: web::Json<UpdateEventRequest>,
) -> Result<HttpResponse, ApiError> {
    let transition = web::block(move || {
        let mut conn = pool.get()?;
        actions::events::update(&mut conn, *event_id, form.into_inner(), Utc::now())
    })
    .await??;

    notify(&queue, Vec::new(), transition.offers);
    Ok(envelope::ok(transition.value))
}

#[post("/{id}/cancel")]
async fn cancel_event(
    pool: web::Data<DbPool>,
    _admin: AdminUser,
    event_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let event = web::block(move || {
        let mut conn = pool.get()?;
        actions::events::cancel(&mut conn, *event_id, Utc::now())
    })
    .await??;

    Ok(envelope::ok(event))
}

#[delete("/{id}")]
async fn delete_event(
    pool: web::Data<DbPool>,
    config: web::Data<Config>,
    _admin: AdminUser,
    event_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let removed = web::block(move || {
        let mut conn = pool.get()?;
        actions::events::delete(&mut conn, *event_id)
    })
    .await??;

    uploads::remove_stored(&config.upload_dir, removed.image).await;
    Ok(envelope::message("Event deleted"))
}

#[post("/{id}/image")]
async fn upload_image(
    pool: web::Data<DbPool>,
    config: web::Data<Config>,
    _admin: AdminUser,
    event_id: web::Path<Uuid>,
    payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let event_id = event_id.into_inner();
    let check_pool = pool.clone();
    web::block(move || {
        let mut conn = check_pool.get()?;
        actions::find_event(&mut conn, event_id)
    })
    .await??;

    let reference = uploads::save_image(payload, UploadKind::EventImage, &config.upload_dir).await?;
    let (event, previous) = web::block(move || {
        let mut conn = pool.get()?;
        actions::events::set_image(&mut conn, event_id, Some(reference), Utc::now())
    })
    .await??;

    uploads::remove_stored(&config.upload_dir, previous).await;
    Ok(envelope::ok(event))
}

#[get("/{id}/attendees")]
async fn attendees(
    pool: web::Data<DbPool>,
    _admin: AdminUser,
    event_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let rows = web::block(move || {
        let mut conn = pool.get()?;
        actions::registrations::attendees(&mut conn, *event_id)
    })
    .await??;

    Ok(envelope::ok(rows))
}

#[post("/{id}/check-in")]
async fn check_in(
    pool: web::Data<DbPool>,
    admin: AdminUser,
    event_id: web::Path<Uuid>,
    form: web::Json<CheckInRequest>,
) -> Result<HttpResponse, ApiError> {
    let registration = web::block(move || {
        let mut conn = pool.get()?;
        actions::registrations::check_in(&mut conn, *event_id, &form.confirmation_code, admin.id(), Utc::now())
    })
    .await??;

    Ok(envelope::ok(registration))
}

#[post("/{id}/register")]
async fn register(
    pool: web::Data<DbPool>,
    queue: web::Data<QueueService>,
    auth: AuthUser,
    event_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let transition = web::block(move || {
        let mut conn = pool.get()?;
        actions::registrations::register(&mut conn, *event_id, auth.id, Utc::now())
    })
    .await??;

    let notification = match &transition.value {
        RegisterOutcome::Registered { registration } => confirmed(registration),
        RegisterOutcome::Waitlisted { waitlist } => Some(Notification::WaitlistJoined {
            user_id: waitlist.user_id,
            event_id: waitlist.event_id,
            position: waitlist.position,
        }),
    };
    notify(&queue, notification.into_iter().collect(), transition.offers);

    Ok(match transition.value {
        outcome @ RegisterOutcome::Registered { .. } => envelope::created(outcome),
        outcome @ RegisterOutcome::Waitlisted { .. } => envelope::accepted(outcome),
    })
}

#[delete("/{id}/register")]
async fn cancel_registration(
    pool: web::Data<DbPool>,
    processor: web::Data<dyn PaymentProcessor>,
    queue: web::Data<QueueService>,
    auth: AuthUser,
    event_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let block_pool = pool.clone();
    let transition = web::block(move || {
        let mut conn = block_pool.get()?;
        actions::registrations::cancel(&mut conn, *event_id, auth.id, Utc::now())
    })
    .await??;

    let cancelled = transition.value.registration;
    notify(
        &queue,
        vec![Notification::RegistrationCancelled {
            user_id: cancelled.user_id,
            event_id: cancelled.event_id,
            registration_id: cancelled.id,
        }],
        transition.offers,
    );

    // The cancellation stands even when the refund cannot be issued.
    let registration = match transition.value.refund {
        Some(plan) => match issue_refund(&pool, processor.get_ref(), &queue, plan).await {
            Ok(refunded) => refunded,
            Err(e) => {
                log::error!("Refund for cancelled registration {} failed: {}", cancelled.id, e);
                cancelled
            }
        },
        None => cancelled,
    };
    Ok(envelope::ok(registration))
}

#[get("/{id}/registration")]
async fn my_registration(
    pool: web::Data<DbPool>,
    auth: AuthUser,
    event_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let registration = web::block(move || {
        let mut conn = pool.get()?;
        actions::registrations::registration_for(&mut conn, *event_id, auth.id)
    })
    .await??;

    Ok(envelope::ok(registration))
}

#[post("/{id}/refund")]
async fn refund(
    pool: web::Data<DbPool>,
    processor: web::Data<dyn PaymentProcessor>,
    queue: web::Data<QueueService>,
    auth: AuthUser,
    event_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let plan_pool = pool.clone();
    let plan = web::block(move || {
        let mut conn = plan_pool.get()?;
        actions::registrations::prepare_refund(&mut conn, *event_id, auth.id, Utc::now())
    })
    .await??;

    let registration = issue_refund(&pool, processor.get_ref(), &queue, plan).await?;
    Ok(envelope::ok(registration))
}
