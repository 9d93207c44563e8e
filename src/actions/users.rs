use chrono::{DateTime, Utc};
use diesel::dsl::count_star;
use diesel::pg::Pg;
use diesel::prelude::*;
use uuid::Uuid;

use super::waitlist::{fill_free_seats, withdraw};
use super::{lock_event, Transition};
use crate::error::{ApiError, ApiResult};
use crate::models::{
    AdminUserChangeset, MembershipStatus, NewUser, Page, Paged, ProfileChangeset, RegistrationStatus, User,
    UserFilter, WaitlistStatus,
};
use crate::schema::{event_registrations, event_waitlist, users};

pub fn get_user(conn: &mut PgConnection, user_id: Uuid) -> ApiResult<User> {
    users::table
        .find(user_id)
        .select(User::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| ApiError::not_found("User not found"))
}

pub fn find_by_email(conn: &mut PgConnection, email: &str) -> ApiResult<Option<User>> {
    let user = users::table
        .filter(users::email.eq(email))
        .select(User::as_select())
        .first(conn)
        .optional()?;
    Ok(user)
}

pub fn create_user(conn: &mut PgConnection, new_user: &NewUser) -> ApiResult<User> {
    if find_by_email(conn, &new_user.email)?.is_some() {
        return Err(ApiError::conflict("Email is already registered"));
    }
    let user = diesel::insert_into(users::table)
        .values(new_user)
        .returning(User::as_returning())
        .get_result(conn)?;
    log::info!("Created user {} ({})", user.id, user.role);
    Ok(user)
}

pub fn touch_login(conn: &mut PgConnection, user_id: Uuid, now: DateTime<Utc>) -> ApiResult<User> {
    let user = diesel::update(users::table.find(user_id))
        .set(users::last_login_at.eq(Some(now)))
        .returning(User::as_returning())
        .get_result(conn)?;
    Ok(user)
}

pub fn update_profile(conn: &mut PgConnection, user_id: Uuid, changes: &ProfileChangeset) -> ApiResult<User> {
    let user = diesel::update(users::table.find(user_id))
        .set(changes)
        .returning(User::as_returning())
        .get_result(conn)?;
    Ok(user)
}

pub fn set_password_hash(
    conn: &mut PgConnection,
    user_id: Uuid,
    password_hash: &str,
    now: DateTime<Utc>,
) -> ApiResult<()> {
    diesel::update(users::table.find(user_id))
        .set((users::password_hash.eq(password_hash), users::updated_at.eq(now)))
        .execute(conn)?;
    Ok(())
}

/// Replaces the avatar reference. Returns the updated user and the previous
/// reference so the caller can delete the old file.
pub fn set_avatar(
    conn: &mut PgConnection,
    user_id: Uuid,
    avatar: Option<String>,
    now: DateTime<Utc>,
) -> ApiResult<(User, Option<String>)> {
    let previous = get_user(conn, user_id)?.avatar;
    let user = diesel::update(users::table.find(user_id))
        .set((users::avatar.eq(avatar), users::updated_at.eq(now)))
        .returning(User::as_returning())
        .get_result(conn)?;
    Ok((user, previous))
}

pub fn admin_update(conn: &mut PgConnection, user_id: Uuid, changes: &AdminUserChangeset) -> ApiResult<User> {
    get_user(conn, user_id)?;
    let user = diesel::update(users::table.find(user_id))
        .set(changes)
        .returning(User::as_returning())
        .get_result(conn)?;
    log::info!("Admin updated user {}", user_id);
    Ok(user)
}

/// Approves the account. A pending membership becomes active.
pub fn approve(conn: &mut PgConnection, user_id: Uuid, now: DateTime<Utc>) -> ApiResult<User> {
    let current = get_user(conn, user_id)?;
    let status = match current.membership_status {
        MembershipStatus::Pending => MembershipStatus::Active,
        other => other,
    };
    let user = diesel::update(users::table.find(user_id))
        .set((
            users::is_approved.eq(true),
            users::membership_status.eq(status),
            users::updated_at.eq(now),
        ))
        .returning(User::as_returning())
        .get_result(conn)?;
    log::info!("Approved user {}", user_id);
    Ok(user)
}

pub fn cancel_membership(conn: &mut PgConnection, user_id: Uuid, now: DateTime<Utc>) -> ApiResult<User> {
    let current = get_user(conn, user_id)?;
    if current.membership_status != MembershipStatus::Active {
        return Err(ApiError::bad_request("You have no active membership to cancel"));
    }
    let user = diesel::update(users::table.find(user_id))
        .set((
            users::membership_status.eq(MembershipStatus::Cancelled),
            users::updated_at.eq(now),
        ))
        .returning(User::as_returning())
        .get_result(conn)?;
    log::info!("User {} cancelled their membership", user_id);
    Ok(user)
}

/// Removes the user. Their waitlist rows leave the queue the same way a
/// member leaving would, and the seats they held are offered on. Feedback and
/// registrations go with the user row; ledger rows stay behind without an
/// owner.
pub fn delete_user(conn: &mut PgConnection, user_id: Uuid, now: DateTime<Utc>) -> ApiResult<Transition<User>> {
    conn.transaction(|conn| {
        let user = get_user(conn, user_id)?;

        let mut event_ids: Vec<Uuid> = event_registrations::table
            .filter(event_registrations::user_id.eq(user_id))
            .filter(event_registrations::status.eq_any(RegistrationStatus::LIVE))
            .select(event_registrations::event_id)
            .load(conn)?;
        event_ids.extend(
            event_waitlist::table
                .filter(event_waitlist::user_id.eq(user_id))
                .filter(event_waitlist::status.eq_any(WaitlistStatus::LIVE))
                .select(event_waitlist::event_id)
                .load::<Uuid>(conn)?,
        );
        event_ids.sort();
        event_ids.dedup();

        let mut touched = Vec::with_capacity(event_ids.len());
        for event_id in event_ids {
            let event = lock_event(conn, event_id)?;
            withdraw(conn, event_id, user_id, now)?;
            touched.push(event);
        }

        diesel::delete(users::table.find(user_id)).execute(conn)?;

        let mut offers = Vec::new();
        for event in &touched {
            offers.extend(fill_free_seats(conn, event, now)?);
        }
        log::info!("Deleted user {} ({} event(s) released)", user_id, touched.len());
        Ok(Transition::new(user, offers))
    })
}

fn filtered<'a>(filter: &UserFilter) -> users::BoxedQuery<'a, Pg> {
    let mut query = users::table.into_boxed();
    if let Some(role) = filter.role {
        query = query.filter(users::role.eq(role));
    }
    if let Some(tier) = filter.tier {
        query = query.filter(users::membership_tier.eq(tier));
    }
    if let Some(status) = filter.status {
        query = query.filter(users::membership_status.eq(status));
    }
    if let Some(approved) = filter.approved {
        query = query.filter(users::is_approved.eq(approved));
    }
    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = format!("%{}%", search);
        query = query.filter(
            users::email
                .ilike(pattern.clone())
                .or(users::first_name.ilike(pattern.clone()))
                .or(users::last_name.ilike(pattern.clone()))
                .or(users::company.ilike(pattern)),
        );
    }
    query
}

pub fn list_users(conn: &mut PgConnection, filter: &UserFilter) -> ApiResult<Paged<User>> {
    let page = Page { page: filter.page, limit: filter.limit };
    let total: i64 = filtered(filter).select(count_star()).first(conn)?;
    let items = filtered(filter)
        .order(users::created_at.desc())
        .limit(page.limit())
        .offset(page.offset())
        .select(User::as_select())
        .load(conn)?;
    Ok(Paged::new(items, total, &page))
}
