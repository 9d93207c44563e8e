use actix_web::{delete, get, post, web, HttpResponse};
use chrono::Utc;
use uuid::Uuid;

use crate::actions;
use crate::auth::{AdminUser, AuthUser};
use crate::db::DbPool;
use crate::envelope;
use crate::error::ApiError;
use crate::models::PromoteRequest;
use crate::queue::{Notification, QueueService};

use super::{events::confirmed, notify};

#[post("/{id}/waitlist")]
async fn join(
    pool: web::Data<DbPool>,
    queue: web::Data<QueueService>,
    auth: AuthUser,
    event_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let transition = web::block(move || {
        let mut conn = pool.get()?;
        actions::waitlist::join(&mut conn, *event_id, auth.id, Utc::now())
    })
    .await??;

    let entry = transition.value;
    notify(
        &queue,
        vec![Notification::WaitlistJoined { user_id: entry.user_id, event_id: entry.event_id, position: entry.position }],
        transition.offers,
    );
    Ok(envelope::created(entry))
}

#[delete("/{id}/waitlist")]
async fn leave(
    pool: web::Data<DbPool>,
    queue: web::Data<QueueService>,
    auth: AuthUser,
    event_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let transition = web::block(move || {
        let mut conn = pool.get()?;
        actions::waitlist::leave(&mut conn, *event_id, auth.id, Utc::now())
    })
    .await??;

    notify(&queue, Vec::new(), transition.offers);
    Ok(envelope::message("Removed from the waitlist"))
}

#[get("/{id}/waitlist/position")]
async fn position(
    pool: web::Data<DbPool>,
    queue: web::Data<QueueService>,
    auth: AuthUser,
    event_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let transition = web::block(move || {
        let mut conn = pool.get()?;
        actions::waitlist::position(&mut conn, *event_id, auth.id, Utc::now())
    })
    .await??;

    notify(&queue, Vec::new(), transition.offers);
    Ok(envelope::ok(transition.value))
}

#[post("/{id}/waitlist/accept")]
async fn accept(
    pool: web::Data<DbPool>,
    queue: web::Data<QueueService>,
    auth: AuthUser,
    event_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let transition = web::block(move || {
        let mut conn = pool.get()?;
        actions::waitlist::accept(&mut conn, *event_id, auth.id, Utc::now())
    })
    .await??;

    let registration = transition.value;
    notify(&queue, confirmed(&registration).into_iter().collect(), transition.offers);
    Ok(envelope::created(registration))
}

#[post("/{id}/waitlist/decline")]
async fn decline(
    pool: web::Data<DbPool>,
    queue: web::Data<QueueService>,
    auth: AuthUser,
    event_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let transition = web::block(move || {
        let mut conn = pool.get()?;
        actions::waitlist::decline(&mut conn, *event_id, auth.id, Utc::now())
    })
    .await??;

    notify(&queue, Vec::new(), transition.offers);
    Ok(envelope::ok(transition.value))
}

#[get("/{id}/waitlist")]
async fn list(
    pool: web::Data<DbPool>,
    queue: web::Data<QueueService>,
    _admin: AdminUser,
    event_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let transition = web::block(move || {
        let mut conn = pool.get()?;
        actions::waitlist::list(&mut conn, *event_id, Utc::now())
    })
    .await??;

    notify(&queue, Vec::new(), transition.offers);
    Ok(envelope::ok(transition.value))
}

#[post("/{id}/waitlist/promote")]
async fn promote(
    pool: web::Data<DbPool>,
    queue: web::Data<QueueService>,
    _admin: AdminUser,
    event_id: web::Path<Uuid>,
    form: Option<web::Json<PromoteRequest>>,
) -> Result<HttpResponse, ApiError> {
    let target = form.and_then(|f| f.user_id);
    let transition = web::block(move || {
        let mut conn = pool.get()?;
        actions::waitlist::promote(&mut conn, *event_id, target, Utc::now())
    })
    .await??;

    let mut offers = transition.offers;
    offers.push(transition.value.clone());
    notify(&queue, Vec::new(), offers);
    Ok(envelope::ok(transition.value))
}
