//! Durable ticket store: Postgres models, pool management, and the guarded
//! query surface every state write flows through.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
