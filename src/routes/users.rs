use actix_multipart::Multipart;
use actix_web::{delete, get, patch, post, put, web, HttpResponse};
use chrono::Utc;

use crate::actions;
use crate::auth::{password, AuthUser};
use crate::config::Config;
use crate::db::DbPool;
use crate::envelope;
use crate::error::ApiError;
use crate::models::{validate_password, ChangePasswordRequest, UpdateProfileRequest};
use crate::uploads::{self, UploadKind};

#[get("/me")]
async fn get_me(pool: web::Data<DbPool>, auth: AuthUser) -> Result<HttpResponse, ApiError> {
    let user = web::block(move || {
        let mut conn = pool.get()?;
        actions::users::get_user(&mut conn, auth.id)
    })
    .await??;

    Ok(envelope::ok(user))
}

#[patch("/me")]
async fn update_me(
    pool: web::Data<DbPool>,
    auth: AuthUser,
    form: web::Json<UpdateProfileRequest>,
) -> Result<HttpResponse, ApiError> {
    let form = form.into_inner();
    form.validate()?;

    let user = web::block(move || {
        let mut conn = pool.get()?;
        actions::users::update_profile(&mut conn, auth.id, &form.into_changeset(Utc::now()))
    })
    .await??;

    Ok(envelope::ok(user))
}

#[put("/me/password")]
async fn change_password(
    pool: web::Data<DbPool>,
    auth: AuthUser,
    form: web::Json<ChangePasswordRequest>,
) -> Result<HttpResponse, ApiError> {
    let form = form.into_inner();
    validate_password(&form.new_password)?;

    web::block(move || {
        let mut conn = pool.get()?;
        let user = actions::users::get_user(&mut conn, auth.id)?;
        if !password::verify_password(&form.current_password, &user.password_hash) {
            return Err(ApiError::bad_request("Current password is incorrect"));
        }
        let hash = password::hash_password(&form.new_password)?;
        actions::users::set_password_hash(&mut conn, auth.id, &hash, Utc::now())
    })
    .await??;

    log::info!("User {} changed their password", auth.id);
    Ok(envelope::message("Password updated"))
}

#[post("/me/avatar")]
async fn upload_avatar(
    pool: web::Data<DbPool>,
    config: web::Data<Config>,
    auth: AuthUser,
    payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let reference = uploads::save_image(payload, UploadKind::Avatar, &config.upload_dir).await?;

    let (user, previous) = web::block(move || {
        let mut conn = pool.get()?;
        actions::users::set_avatar(&mut conn, auth.id, Some(reference), Utc::now())
    })
    .await??;

    uploads::remove_stored(&config.upload_dir, previous).await;
    Ok(envelope::ok(user))
}

#[delete("/me/avatar")]
async fn delete_avatar(
    pool: web::Data<DbPool>,
    config: web::Data<Config>,
    auth: AuthUser,
) -> Result<HttpResponse, ApiError> {
    let (user, previous) = web::block(move || {
        let mut conn = pool.get()?;
        actions::users::set_avatar(&mut conn, auth.id, None, Utc::now())
    })
    .await??;

    uploads::remove_stored(&config.upload_dir, previous).await;
    Ok(envelope::ok(user))
}

#[get("/me/registrations")]
async fn my_registrations(pool: web::Data<DbPool>, auth: AuthUser) -> Result<HttpResponse, ApiError> {
    let registrations = web::block(move || {
        let mut conn = pool.get()?;
        actions::registrations::for_user(&mut conn, auth.id, Utc::now())
    })
    .await??;

    Ok(envelope::ok(registrations))
}

#[get("/me/waitlist")]
async fn my_waitlist(pool: web::Data<DbPool>, auth: AuthUser) -> Result<HttpResponse, ApiError> {
    let entries = web::block(move || {
        let mut conn = pool.get()?;
        actions::waitlist::for_user(&mut conn, auth.id)
    })
    .await??;

    Ok(envelope::ok(entries))
}
