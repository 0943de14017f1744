//! Command handlers

pub mod auth;
pub mod config;
pub mod pending;
pub mod status;
pub mod sync;
