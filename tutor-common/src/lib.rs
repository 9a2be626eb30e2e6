//! # Tutor Common Library
//!
//! Shared code for the tutor backend services including:
//! - Error and result types
//! - Root folder resolution and TOML bootstrap configuration
//! - SQLite database initialization and runtime settings
//! - Event types and the broadcast EventBus
//! - Time helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
pub use events::{EventBus, TutorEvent};
