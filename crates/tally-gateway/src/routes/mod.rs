//! HTTP route handlers.

pub mod health;
pub mod status;
pub mod webhook;
pub mod ws;
