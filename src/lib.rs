//! Membership organization backend: accounts, events with capacity and
//! waitlists, check-in, feedback, statistics and paid memberships.

pub mod actions;
pub mod auth;
pub mod config;
pub mod db;
pub mod envelope;
pub mod error;
pub mod models;
pub mod payments;
pub mod queue;
pub mod routes;
pub mod schema;
pub mod uploads;
