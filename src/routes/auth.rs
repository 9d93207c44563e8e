use actix_web::{get, post, web, HttpResponse};
use chrono::Utc;
use uuid::Uuid;

use crate::actions;
use crate::auth::{password, AuthUser, TokenSigner};
use crate::db::DbPool;
use crate::envelope;
use crate::error::{ApiError, ApiResult};
use crate::models::{
    normalize_email, AuthResponse, LoginRequest, MembershipStatus, NewUser, Role, SignupRequest, User,
};

fn session(signer: &TokenSigner, user: User) -> ApiResult<AuthResponse> {
    let token = signer.issue(user.id, user.role, Utc::now()).map_err(ApiError::internal)?;
    Ok(AuthResponse { token, user })
}

#[post("/signup")]
async fn signup(
    pool: web::Data<DbPool>,
    signer: web::Data<TokenSigner>,
    form: web::Json<SignupRequest>,
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
            phone: form.phone,
            company: form.company,
            job_title: form.job_title,
            role: Role::Member,
            membership_tier: None,
            membership_status: MembershipStatus::Pending,
            is_approved: false,
            created_at: now,
            updated_at: now,
        };
        let mut conn = pool.get()?;
        actions::users::create_user(&mut conn, &new_user)
    })
    .await??;

    Ok(envelope::created(session(&signer, user)?))
}

#[post("/login")]
async fn login(
    pool: web::Data<DbPool>,
    signer: web::Data<TokenSigner>,
    form: web::Json<LoginRequest>,
) -> Result<HttpResponse, ApiError> {
    let form = form.into_inner();

    let user = web::block(move || {
        let mut conn = pool.get()?;
        let user = actions::users::find_by_email(&mut conn, &normalize_email(&form.email))?
            .filter(|user| password::verify_password(&form.password, &user.password_hash))
            .ok_or_else(|| ApiError::Unauthorized("Invalid email or password".to_string()))?;
        if user.membership_status == MembershipStatus::Suspended {
            return Err(ApiError::forbidden("Your account has been suspended"));
        }
        actions::users::touch_login(&mut conn, user.id, Utc::now())
    })
    .await??;

    log::info!("User {} logged in", user.id);
    Ok(envelope::ok(session(&signer, user)?))
}

#[get("/me")]
async fn me(pool: web::Data<DbPool>, auth: AuthUser) -> Result<HttpResponse, ApiError> {
    let user = web::block(move || {
        let mut conn = pool.get()?;
        actions::users::get_user(&mut conn, auth.id)
    })
    .await??;

    Ok(envelope::ok(user))
}
