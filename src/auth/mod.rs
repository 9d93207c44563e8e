//! Session tokens, password hashing and the request extractors that guard
//! member and admin routes.

use std::future::{ready, Ready};

use actix_web::{dev::Payload, http::header, web, FromRequest, HttpRequest};
use chrono::Utc;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::Role;

pub mod password;
pub mod token;

pub use token::{Claims, TokenSigner};

/// The caller behind a valid bearer token.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub id: Uuid,
    pub role: Role,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// An authenticated caller with the admin role.
#[derive(Debug, Clone, Copy)]
pub struct AdminUser(pub AuthUser);

impl AdminUser {
    pub fn id(&self) -> Uuid {
        self.0.id
    }
}

fn bearer_token(req: &HttpRequest) -> Option<&str> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn authenticate(req: &HttpRequest) -> Result<AuthUser, ApiError> {
    let signer = req
        .app_data::<web::Data<TokenSigner>>()
        .ok_or_else(|| ApiError::internal("token signer is not registered"))?;
    let token = bearer_token(req).ok_or_else(|| ApiError::Unauthorized("Authentication required".to_string()))?;

    match signer.verify(token, Utc::now()) {
        Ok(claims) => Ok(AuthUser { id: claims.sub, role: claims.role }),
        Err(e) => {
            log::debug!("Rejected bearer token: {}", e);
            Err(ApiError::Unauthorized("Invalid or expired token".to_string()))
        }
    }
}

impl FromRequest for AuthUser {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(authenticate(req))
    }
}

impl FromRequest for AdminUser {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(authenticate(req).and_then(|user| {
            if user.is_admin() {
                Ok(AdminUser(user))
            } else {
                Err(ApiError::forbidden("Admin access required"))
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;
    use chrono::Duration;

    fn signer() -> TokenSigner {
        TokenSigner::new("test-secret-0123456789", Duration::hours(1))
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, "bearer abc.def.ghi"))
            .to_http_request();
        assert_eq!(bearer_token(&req), Some("abc.def.ghi"));

        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, "Basic Zm9vOmJhcg=="))
            .to_http_request();
        assert_eq!(bearer_token(&req), None);
    }

    #[actix_web::test]
    async fn members_are_not_admins() {
        let signer = signer();
        let token = signer.issue(Uuid::new_v4(), Role::Member, Utc::now()).unwrap();
        let req = TestRequest::default()
            .app_data(web::Data::new(signer))
            .insert_header((header::AUTHORIZATION, format!("Bearer {}", token)))
            .to_http_request();

        let user = AuthUser::extract(&req).await.unwrap();
        assert_eq!(user.role, Role::Member);

        let err = AdminUser::extract(&req).await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    #[actix_web::test]
    async fn missing_header_is_unauthorized() {
        let req = TestRequest::default().app_data(web::Data::new(signer())).to_http_request();
        let err = AuthUser::extract(&req).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }
}
