#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Sprouttie shared infrastructure
//!
//! Database pool construction and schema migrations used by the API server.

pub mod db;

pub use db::{create_migration_pool, create_pool, run_migrations, DbError};
