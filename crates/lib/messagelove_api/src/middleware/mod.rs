//! Request middleware and extractors.

pub mod auth;
pub mod errors;
pub mod fingerprint;
