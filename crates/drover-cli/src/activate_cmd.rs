//! The `drover activate` command: bulk-activate a build batch.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use drover_db::queries::tickets;

pub async fn run(pool: &PgPool, build_id: &str) -> Result<()> {
    let build_id: Uuid = build_id
        .parse()
        .with_context(|| format!("invalid build id: {build_id:?}"))?;

    let counts = tickets::activate_build(pool, build_id).await?;

    if counts.ready == 0 && counts.blocked == 0 {
        println!("build {build_id}: nothing to activate (already activated, or no draft tickets)");
        return Ok(());
    }

    println!(
        "build {build_id}: {} ready, {} blocked",
        counts.ready, counts.blocked
    );
    for ticket in tickets::list_for_build(pool, build_id).await? {
        println!("  {}  {:<8}  {}", ticket.id, ticket.state.to_string(), ticket.title);
    }
    Ok(())
}
