use actix_web::{get, post, web, HttpResponse};
use chrono::Utc;
use uuid::Uuid;

use crate::actions;
use crate::auth::{AdminUser, AuthUser};
use crate::db::DbPool;
use crate::envelope;
use crate::error::ApiError;
use crate::models::SubmitFeedbackRequest;

#[post("/{id}/feedback")]
async fn submit(
    pool: web::Data<DbPool>,
    auth: AuthUser,
    event_id: web::Path<Uuid>,
    form: web::Json<SubmitFeedbackRequest>,
) -> Result<HttpResponse, ApiError> {
    let feedback = web::block(move || {
        let mut conn = pool.get()?;
        actions::feedback::submit(&mut conn, *event_id, auth.id, form.into_inner(), Utc::now())
    })
    .await??;

    Ok(envelope::created(feedback))
}

#[get("/{id}/feedback/mine")]
async fn mine(pool: web::Data<DbPool>, auth: AuthUser, event_id: web::Path<Uuid>) -> Result<HttpResponse, ApiError> {
    let feedback = web::block(move || {
        let mut conn = pool.get()?;
        actions::feedback::mine(&mut conn, *event_id, auth.id)
    })
    .await??;

    Ok(envelope::ok(feedback))
}

#[get("/{id}/feedback/summary")]
async fn summary(pool: web::Data<DbPool>, _auth: AuthUser, event_id: web::Path<Uuid>) -> Result<HttpResponse, ApiError> {
    let totals = web::block(move || {
        let mut conn = pool.get()?;
        actions::feedback::summary(&mut conn, *event_id)
    })
    .await??;

    Ok(envelope::ok(totals))
}

#[get("/{id}/feedback")]
async fn list(pool: web::Data<DbPool>, _admin: AdminUser, event_id: web::Path<Uuid>) -> Result<HttpResponse, ApiError> {
    let feedback = web::block(move || {
        let mut conn = pool.get()?;
        actions::feedback::list(&mut conn, *event_id)
    })
    .await??;

    Ok(envelope::ok(feedback))
}
