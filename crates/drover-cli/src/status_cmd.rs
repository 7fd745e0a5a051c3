//! The `drover status` command: ticket counts by state.

use anyhow::Result;
use sqlx::PgPool;

use drover_core::state::queries;

pub async fn run(pool: &PgPool) -> Result<()> {
    let counts = queries::count_by_state(pool).await?;

    println!("tickets by state:");
    println!("  draft         {}", counts.draft);
    println!("  blocked       {}", counts.blocked);
    println!("  ready         {}", counts.ready);
    println!("  assigned      {}", counts.assigned);
    println!("  in_progress   {}", counts.in_progress);
    println!("  verifying     {}", counts.verifying);
    println!("  in_review     {}", counts.in_review);
    println!("  needs_review  {}", counts.needs_review);
    println!("  on_hold       {}", counts.on_hold);
    println!("  done          {}", counts.done);
    println!("  cancelled     {}", counts.cancelled);
    println!("  total         {}", counts.total);

    if counts.needs_review > 0 || counts.on_hold > 0 {
        println!();
        println!(
            "{} ticket(s) waiting on a human; see `drover ticket show <id>` and `drover ticket replay/resume`",
            counts.needs_review + counts.on_hold
        );
    }
    Ok(())
}
