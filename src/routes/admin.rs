use actix_multipart::Multipart;
use actix_web::{delete, get, patch, post, web, HttpResponse};
use chrono::Utc;
use uuid::Uuid;

use crate::actions;
use crate::auth::{password, AdminUser};
use crate::config::Config;
use crate::db::DbPool;
use crate::envelope;
use crate::error::ApiError;
use crate::models::{
    normalize_email, AdminCreateUserRequest, AdminUpdateUserRequest, MembershipStatus, NewUser, Page, Role,
    UserFilter,
};
use crate::payments::PaymentProcessor;
use crate::queue::QueueService;
use crate::uploads::{self, UploadKind};

use super::events::issue_refund;
use super::notify;

#[get("/users")]
async fn list_users(
    pool: web::Data<DbPool>,
    _admin: AdminUser,
    filter: web::Query<UserFilter>,
) -> Result<HttpResponse, ApiError> {
    let users = web::block(move || {
        let mut conn = pool.get()?;
        actions::users::list_users(&mut conn, &filter)
    })
    .await??;

    Ok(envelope::ok(users))
}

#[post("/users")]
async fn create_user(
    pool: web::Data<DbPool>,
    admin: AdminUser,
    form: web::Json<AdminCreateUserRequest>,
) -> Result<HttpResponse, ApiError> {
    let form = form.into_inner();
    form.validate()?;

    let user = web::block(move || {
        let now = Utc::now();
        let new_user = NewUser {
            id: Uuid::new_v4(),
            email: normalize_email(&form.email),
            password_hash: password::hash_password(&form.password)?,
            first_name: form.first_name.trim().to_string(),
            last_name: form.last_name.trim().to_string(),
            phone: None,
            company: None,
            job_title: None,
            role: form.role.unwrap_or(Role::Member),
            membership_tier: form.membership_tier,
            membership_status: form.membership_status.unwrap_or(MembershipStatus::Active),
            is_approved: form.is_approved.unwrap_or(true),
            created_at: now,
            updated_at: now,
        };
        let mut conn = pool.get()?;
        actions::users::create_user(&mut conn, &new_user)
    })
    .await??;

    log::info!("Admin {} created user {}", admin.id(), user.id);
    Ok(envelope::created(user))
}

#[get("/users/{id}")]
async fn get_user(
    pool: web::Data<DbPool>,
    _admin: AdminUser,
    user_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let user = web::block(move || {
        let mut conn = pool.get()?;
        actions::users::get_user(&mut conn, *user_id)
    })
    .await??;

    Ok(envelope::ok(user))
}

#[patch("/users/{id}")]
async fn update_user(
    pool: web::Data<DbPool>,
    _admin: AdminUser,
    user_id: web::Path<Uuid>,
    form: web::Json<AdminUpdateUserRequest>,
) -> Result<HttpResponse, ApiError> {
    let changes = form.into_inner().into_changeset(Utc::now())?;

    let user = web::block(move || {
        let mut conn = pool.get()?;
        actions::users::admin_update(&mut conn, *user_id, &changes)
    })
    .await??;

    Ok(envelope::ok(user))
}

#[post("/users/{id}/approve")]
async fn approve_user(
    pool: web::Data<DbPool>,
    _admin: AdminUser,
    user_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let user = web::block(move || {
        let mut conn = pool.get()?;
        actions::users::approve(&mut conn, *user_id, Utc::now())
    })
    .await??;

    Ok(envelope::ok(user))
}

#[post("/users/{id}/avatar")]
async fn upload_avatar(
    pool: web::Data<DbPool>,
    config: web::Data<Config>,
    _admin: AdminUser,
    user_id: web::Path<Uuid>,
    payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let user_id = user_id.into_inner();
    // Fail before writing a file for a user that does not exist.
    let check_pool = pool.clone();
    web::block(move || {
        let mut conn = check_pool.get()?;
        actions::users::get_user(&mut conn, user_id)
    })
    .await??;

    let reference = uploads::save_image(payload, UploadKind::Avatar, &config.upload_dir).await?;
    let (user, previous) = web::block(move || {
        let mut conn = pool.get()?;
        actions::users::set_avatar(&mut conn, user_id, Some(reference), Utc::now())
    })
    .await??;

    uploads::remove_stored(&config.upload_dir, previous).await;
    Ok(envelope::ok(user))
}

#[delete("/users/{id}/avatar")]
async fn delete_avatar(
    pool: web::Data<DbPool>,
    config: web::Data<Config>,
    _admin: AdminUser,
    user_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let (user, previous) = web::block(move || {
        let mut conn = pool.get()?;
        actions::users::set_avatar(&mut conn, *user_id, None, Utc::now())
    })
    .await??;

    uploads::remove_stored(&config.upload_dir, previous).await;
    Ok(envelope::ok(user))
}

#[delete("/users/{id}")]
async fn delete_user(
    pool: web::Data<DbPool>,
    config: web::Data<Config>,
    queue: web::Data<QueueService>,
    admin: AdminUser,
    user_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let user_id = user_id.into_inner();
    if user_id == admin.id() {
        return Err(ApiError::bad_request("You cannot delete your own account"));
    }

    let removed = web::block(move || {
        let mut conn = pool.get()?;
        actions::users::delete_user(&mut conn, user_id, Utc::now())
    })
    .await??;

    notify(&queue, Vec::new(), removed.offers);
    uploads::remove_stored(&config.upload_dir, removed.value.avatar).await;
    Ok(envelope::message("User deleted"))
}

#[get("/payments")]
async fn payments_ledger(
    pool: web::Data<DbPool>,
    _admin: AdminUser,
    page: web::Query<Page>,
) -> Result<HttpResponse, ApiError> {
    let ledger = web::block(move || {
        let mut conn = pool.get()?;
        actions::payments::ledger(&mut conn, &page)
    })
    .await??;

    Ok(envelope::ok(ledger))
}

#[post("/registrations/{id}/refund")]
async fn refund_registration(
    pool: web::Data<DbPool>,
    processor: web::Data<dyn PaymentProcessor>,
    queue: web::Data<QueueService>,
    admin: AdminUser,
    registration_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let plan_pool = pool.clone();
    let plan = web::block(move || {
        let mut conn = plan_pool.get()?;
        actions::registrations::prepare_admin_refund(&mut conn, *registration_id)
    })
    .await??;

    log::info!("Admin {} is refunding registration {}", admin.id(), plan.registration_id);
    let registration = issue_refund(&pool, processor.get_ref(), &queue, plan).await?;
    Ok(envelope::ok(registration))
}
