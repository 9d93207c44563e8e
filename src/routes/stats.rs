use actix_web::{get, web, HttpResponse};
use chrono::Utc;
use uuid::Uuid;

use crate::actions;
use crate::auth::AdminUser;
use crate::db::DbPool;
use crate::envelope;
use crate::error::ApiError;

#[get("/overview")]
async fn overview(pool: web::Data<DbPool>, _admin: AdminUser) -> Result<HttpResponse, ApiError> {
    let report = web::block(move || {
        let mut conn = pool.get()?;
        actions::stats::overview(&mut conn, Utc::now())
    })
    .await??;

    Ok(envelope::ok(report))
}

#[get("/events/{id}")]
async fn event_stats(
    pool: web::Data<DbPool>,
    _admin: AdminUser,
    event_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let stats = web::block(move || {
        let mut conn = pool.get()?;
        actions::stats::event_stats(&mut conn, *event_id)
    })
    .await??;

    Ok(envelope::ok(stats))
}
