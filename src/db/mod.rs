//! Database module for SQLite operations.
//!
//! This module provides:
//! - Database initialization and migrations
//! - SQLite pragma configuration
//! - The bounded conflict-retry combinator used by every store mutation

pub mod migrations;
pub mod retry;

pub use migrations::init_db;
pub use retry::with_conflict_retry;
