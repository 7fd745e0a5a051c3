//! The `drover stuck` command: diagnostic listing of tickets parked in
//! non-terminal, non-ready states with no recent writes.

use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;

use drover_core::state::queries;

pub async fn run(pool: &PgPool, minutes: i64) -> Result<()> {
    let older_than = Utc::now() - chrono::Duration::minutes(minutes);
    let stuck = queries::list_stuck(pool, older_than).await?;

    if stuck.is_empty() {
        println!("no tickets stuck for more than {minutes} minute(s)");
        return Ok(());
    }

    println!("{} ticket(s) stuck for more than {minutes} minute(s):", stuck.len());
    for ticket in &stuck {
        println!(
            "  {}  {:<12}  updated {}  assignee {}  {}",
            ticket.id,
            ticket.state.to_string(),
            ticket.updated_at.format("%Y-%m-%d %H:%M:%S"),
            ticket.assignee_id.as_deref().unwrap_or("-"),
            ticket.title,
        );
    }
    Ok(())
}
