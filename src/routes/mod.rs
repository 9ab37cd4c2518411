//! HTTP route handlers.
//!
//! Each sub-module corresponds to an API endpoint group. All handlers except
//! [`health`] require authentication via [`crate::auth::require_auth`];
//! [`remotes`] does its own credential check because registration uses Basic
//! credentials rather than a bearer token.

pub mod events;
pub mod health;
pub mod info;
pub mod remotes;
pub mod sessions;
pub mod stream;
