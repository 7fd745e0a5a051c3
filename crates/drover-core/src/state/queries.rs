//! Query helpers for engine-level progress tracking.
//!
//! These re-export and wrap the lower-level DB queries from
//! [`drover_db::queries::tickets`] for use in the scheduling layer.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use drover_db::models::Ticket;
pub use drover_db::queries::tickets::TicketCounts;

/// Get ticket counts by state across the store.
pub async fn count_by_state(pool: &PgPool) -> Result<TicketCounts> {
    drover_db::queries::tickets::count_by_state(pool).await
}

/// Diagnostic: tickets sitting in non-terminal, non-`ready` states with no
/// writes since `older_than`.
pub async fn list_stuck(pool: &PgPool, older_than: DateTime<Utc>) -> Result<Vec<Ticket>> {
    drover_db::queries::tickets::list_stuck(pool, older_than).await
}
