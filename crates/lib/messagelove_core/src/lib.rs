//! # messagelove_core
//!
//! Core account-security logic for MessageLove: credentials, session tokens,
//! password resets, login lockout and Google sign-in.

pub mod auth;
pub mod clock;
pub mod migrate;
pub mod models;
pub mod tasks;
pub mod uuid;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
