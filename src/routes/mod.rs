use actix_web::{error, web, HttpResponse};

use crate::envelope::Envelope;
use crate::models::WaitlistEntry;
use crate::queue::{Notification, QueueService};

pub mod admin;
pub mod auth;
pub mod events;
pub mod feedback;
pub mod payments;
pub mod stats;
pub mod users;
pub mod waitlist;

/// Registers every API route plus the extractor error handlers.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .app_data(query_config())
        .app_data(path_config())
        .service(
            web::scope("/api")
                .service(
                    web::scope("/auth")
                        .service(auth::signup)
                        .service(auth::login)
                        .service(auth::me),
                )
                .service(
                    web::scope("/users")
                        .service(users::get_me)
                        .service(users::update_me)
                        .service(users::change_password)
                        .service(users::upload_avatar)
                        .service(users::delete_avatar)
                        .service(users::my_registrations)
                        .service(users::my_waitlist),
                )
                .service(
                    web::scope("/admin")
                        .service(admin::list_users)
                        .service(admin::create_user)
                        .service(admin::get_user)
                        .service(admin::update_user)
                        .service(admin::approve_user)
                        .service(admin::upload_avatar)
                        .service(admin::delete_avatar)
                        .service(admin::delete_user)
                        .service(admin::payments_ledger)
                        .service(admin::refund_registration),
                )
                .service(
                    web::scope("/events")
                        .service(events::list_events)
                        .service(events::create_event)
                        .service(waitlist::position)
                        .service(waitlist::accept)
                        .service(waitlist::decline)
                        .service(waitlist::promote)
                        .service(waitlist::join)
                        .service(waitlist::leave)
                        .service(waitlist::list)
                        .service(feedback::mine)
                        .service(feedback::summary)
                        .service(feedback::submit)
                        .service(feedback::list)
                        .service(events::attendees)
                        .service(events::check_in)
                        .service(events::cancel_event)
                        .service(events::upload_image)
                        .service(events::register)
                        .service(events::cancel_registration)
                        .service(events::my_registration)
                        .service(events::refund)
                        .service(events::get_event)
                        .service(events::update_event)
                        .service(events::delete_event),
                )
                .service(
                    web::scope("/stats")
                        .service(stats::overview)
                        .service(stats::event_stats),
                )
                .service(
                    web::scope("/payments")
                        .service(payments::tiers)
                        .service(payments::membership_checkout)
                        .service(payments::cancel_membership)
                        .service(payments::event_checkout)
                        .service(payments::payment_webhook)
                        .service(payments::verify)
                        .service(payments::history),
                ),
        )
        .default_service(web::to(not_found));
}

async fn not_found() -> HttpResponse {
    HttpResponse::NotFound().json(Envelope::<()>::error("Not found"))
}

/// Malformed JSON bodies answer 400, a wrong content type 415. Both keep the envelope.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        let response = match &err {
            error::JsonPayloadError::ContentType => HttpResponse::UnsupportedMediaType()
                .json(Envelope::<()>::error("Content-Type must be application/json")),
            error::JsonPayloadError::Deserialize(e) => {
                HttpResponse::BadRequest().json(Envelope::<()>::error(e.to_string()))
            }
            other => HttpResponse::BadRequest().json(Envelope::<()>::error(other.to_string())),
        };
        error::InternalError::from_response(err, response).into()
    })
}

fn query_config() -> web::QueryConfig {
    web::QueryConfig::default().error_handler(|err, _req| {
        let response = HttpResponse::BadRequest().json(Envelope::<()>::error(err.to_string()));
        error::InternalError::from_response(err, response).into()
    })
}

fn path_config() -> web::PathConfig {
    web::PathConfig::default().error_handler(|err, _req| {
        let response = HttpResponse::NotFound().json(Envelope::<()>::error("Not found"));
        error::InternalError::from_response(err, response).into()
    })
}

/// Publishes notifications and announces new seat offers in the background.
pub(crate) fn notify(queue: &web::Data<QueueService>, notifications: Vec<Notification>, offers: Vec<WaitlistEntry>) {
    if notifications.is_empty() && offers.is_empty() {
        return;
    }
    let queue = queue.clone();
    tokio::spawn(async move {
        for notification in notifications {
            queue.publish(notification).await;
        }
        queue.announce_offers(&offers).await;
    });
}
