use chrono::{DateTime, Duration, Months, Utc};
use diesel::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::schema::users;

text_enum! {
    pub enum Role {
        Member => "member",
        Admin => "admin",
    }
}

text_enum! {
    pub enum MembershipTier {
        Foundation => "foundation",
        Growth => "growth",
        Enterprise => "enterprise",
    }
}

text_enum! {
    pub enum MembershipStatus {
        Pending => "pending",
        Active => "active",
        Expired => "expired",
        Cancelled => "cancelled",
        Suspended => "suspended",
    }
}

text_enum! {
    pub enum BillingInterval {
        Month => "month",
        Year => "year",
    }
}

impl MembershipTier {
    pub fn price_cents(&self) -> i32 {
        match self {
            MembershipTier::Foundation => 2_900,
            MembershipTier::Growth => 9_900,
            MembershipTier::Enterprise => 99_900,
        }
    }

    pub fn interval(&self) -> BillingInterval {
        match self {
            MembershipTier::Foundation | MembershipTier::Growth => BillingInterval::Month,
            MembershipTier::Enterprise => BillingInterval::Year,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            MembershipTier::Foundation => "Foundation",
            MembershipTier::Growth => "Growth",
            MembershipTier::Enterprise => "Enterprise",
        }
    }

    /// Expiry after paying for one more period.
    ///
    /// Time left on a still-running membership is carried over.
    pub fn extend_expiry(&self, current: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
        let base = match current {
            Some(exp) if exp > now => exp,
            _ => now,
        };
        let months = match self.interval() {
            BillingInterval::Month => Months::new(1),
            BillingInterval::Year => Months::new(12),
        };
        base.checked_add_months(months).unwrap_or(base + Duration::days(365))
    }
}

#[derive(Debug, Serialize)]
pub struct TierPlan {
    pub tier: MembershipTier,
    pub name: &'static str,
    pub price_cents: i32,
    pub currency: &'static str,
    pub interval: BillingInterval,
}

impl From<MembershipTier> for TierPlan {
    fn from(tier: MembershipTier) -> Self {
        Self {
            tier,
            name: tier.display_name(),
            price_cents: tier.price_cents(),
            currency: "usd",
            interval: tier.interval(),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub job_title: Option<String>,
    pub bio: Option<String>,
    pub avatar: Option<String>,
    pub role: Role,
    pub membership_tier: Option<MembershipTier>,
    pub membership_status: MembershipStatus,
    pub is_approved: bool,
    pub membership_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub payment_customer_id: Option<String>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn has_active_membership(&self, now: DateTime<Utc>) -> bool {
        self.membership_status == MembershipStatus::Active
            && self.membership_expires_at.map_or(true, |exp| exp > now)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub job_title: Option<String>,
    pub role: Role,
    pub membership_tier: Option<MembershipTier>,
    pub membership_status: MembershipStatus,
    pub is_approved: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = users)]
pub struct ProfileChangeset {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub job_title: Option<String>,
    pub bio: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = users)]
pub struct AdminUserChangeset {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Option<Role>,
    pub membership_tier: Option<MembershipTier>,
    pub membership_status: Option<MembershipStatus>,
    pub is_approved: Option<bool>,
    pub membership_expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

// Request models for API

#[derive(Debug, Clone, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub job_title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateProfileRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub job_title: Option<String>,
    pub bio: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminCreateUserRequest {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Option<Role>,
    pub membership_tier: Option<MembershipTier>,
    pub membership_status: Option<MembershipStatus>,
    pub is_approved: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminUpdateUserRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Option<Role>,
    pub membership_tier: Option<MembershipTier>,
    pub membership_status: Option<MembershipStatus>,
    pub is_approved: Option<bool>,
    pub membership_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserFilter {
    pub role: Option<Role>,
    pub tier: Option<MembershipTier>,
    pub status: Option<MembershipStatus>,
    pub approved: Option<bool>,
    pub search: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: User,
}

pub const MIN_PASSWORD_LEN: usize = 8;

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static email pattern"))
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn validate_email(email: &str) -> ApiResult<()> {
    if email.len() > 255 || !email_regex().is_match(email) {
        return Err(ApiError::bad_request("A valid email address is required"));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> ApiResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::bad_request(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

fn validate_name(value: &str, field: &str) -> ApiResult<()> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.chars().count() > 100 {
        return Err(ApiError::bad_request(format!("{} is required (max 100 characters)", field)));
    }
    Ok(())
}

impl SignupRequest {
    pub fn validate(&self) -> ApiResult<()> {
        validate_email(&normalize_email(&self.email))?;
        validate_password(&self.password)?;
        validate_name(&self.first_name, "first_name")?;
        validate_name(&self.last_name, "last_name")
    }
}

impl AdminCreateUserRequest {
    pub fn validate(&self) -> ApiResult<()> {
        validate_email(&normalize_email(&self.email))?;
        validate_password(&self.password)?;
        validate_name(&self.first_name, "first_name")?;
        validate_name(&self.last_name, "last_name")
    }
}

impl UpdateProfileRequest {
    pub fn validate(&self) -> ApiResult<()> {
        if let Some(name) = &self.first_name {
            validate_name(name, "first_name")?;
        }
        if let Some(name) = &self.last_name {
            validate_name(name, "last_name")?;
        }
        Ok(())
    }

    pub fn into_changeset(self, now: DateTime<Utc>) -> ProfileChangeset {
        ProfileChangeset {
            first_name: self.first_name.map(|s| s.trim().to_string()),
            last_name: self.last_name.map(|s| s.trim().to_string()),
            phone: self.phone,
            company: self.company,
            job_title: self.job_title,
            bio: self.bio,
            updated_at: now,
        }
    }
}

impl AdminUpdateUserRequest {
    pub fn into_changeset(self, now: DateTime<Utc>) -> ApiResult<AdminUserChangeset> {
        if let Some(name) = &self.first_name {
            validate_name(name, "first_name")?;
        }
        if let Some(name) = &self.last_name {
            validate_name(name, "last_name")?;
        }
        Ok(AdminUserChangeset {
            first_name: self.first_name,
            last_name: self.last_name,
            role: self.role,
            membership_tier: self.membership_tier,
            membership_status: self.membership_status,
            is_approved: self.is_approved,
            membership_expires_at: self.membership_expires_at,
            updated_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn signup(email: &str, password: &str) -> SignupRequest {
        SignupRequest {
            email: email.to_string(),
            password: password.to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            phone: None,
            company: None,
            job_title: None,
        }
    }

    #[test]
    fn signup_validation() {
        assert!(signup("ada@example.org", "correct horse").validate().is_ok());
        assert!(signup("  Ada@Example.org ", "correct horse").validate().is_ok());
        assert!(signup("not-an-email", "correct horse").validate().is_err());
        assert!(signup("ada@example.org", "short").validate().is_err());

        let mut blank = signup("ada@example.org", "correct horse");
        blank.last_name = "   ".to_string();
        assert!(blank.validate().is_err());
    }

    #[test]
    fn monthly_tier_extends_from_now_when_lapsed() {
        let now = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
        let expired = Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap();
        let next = MembershipTier::Foundation.extend_expiry(Some(expired), now);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap());
    }

    #[test]
    fn yearly_tier_carries_remaining_time() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let running = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let next = MembershipTier::Enterprise.extend_expiry(Some(running), now);
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn unknown_tier_is_rejected_by_deserialization() {
        let parsed: Result<MembershipTier, _> = serde_json::from_str("\"platinum\"");
        assert!(parsed.is_err());
        assert_eq!(MembershipTier::Growth.price_cents(), 9_900);
    }
}
