//! Scribe - AI writing assistant for chat channels
//!
//! This library provides per-channel agents that answer chat messages by
//! streaming model output into message edits, the registry that owns
//! their lifecycle, and the HTTP control surface.

pub mod adapters;
pub mod agent;
pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod ui;

pub use error::{Error, Result};
