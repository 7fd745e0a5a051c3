use anyhow::{Context, Result, bail};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use tracing::info;

use crate::config::DbConfig;

/// Migrations embedded at compile time from `crates/drover-db/migrations/`.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Split a connection URL into the server root and the database name.
///
/// `postgresql://host:5432/drover` becomes
/// `("postgresql://host:5432", "drover")`. Returns `None` for URLs with
/// no database path.
fn split_database(url: &str) -> Option<(&str, &str)> {
    let (root, name) = url.rsplit_once('/')?;
    if name.is_empty() || !root.contains("://") {
        return None;
    }
    Some((root, name))
}

/// Create the engine's connection pool from the resolved config.
pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to connect to database at {}", config.database_url))?;
    Ok(pool)
}

/// Run all pending migrations against the pool.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .context("failed to run database migrations")?;
    info!("migrations applied successfully");
    Ok(())
}

/// Ensure the target database exists, creating it if necessary.
///
/// Issues `CREATE DATABASE` over a short-lived connection to the
/// `postgres` maintenance database on the same server.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<()> {
    let Some((server_root, db_name)) = split_database(&config.database_url) else {
        bail!(
            "cannot determine database name from URL {:?}",
            config.database_url
        );
    };

    let admin_url = format!("{server_root}/postgres");
    let mut admin = PgConnection::connect(&admin_url)
        .await
        .with_context(|| format!("failed to connect to maintenance database at {admin_url}"))?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(db_name)
            .fetch_one(&mut admin)
            .await
            .context("failed to query pg_database")?;

    if exists {
        info!(db = db_name, "database already exists");
    } else {
        // CREATE DATABASE cannot take a bound parameter; restrict the
        // identifier before formatting it in.
        if !db_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            bail!("database name {:?} contains invalid characters", db_name);
        }
        admin
            .execute(format!("CREATE DATABASE {db_name}").as_str())
            .await
            .with_context(|| format!("failed to create database {db_name}"))?;
        info!(db = db_name, "database created");
    }

    admin.close().await.ok();
    Ok(())
}

/// Return the row count for every user-defined table in the `public` schema.
///
/// Useful for the `drover db-init` success message.
pub async fn table_counts(pool: &PgPool) -> Result<Vec<(String, i64)>> {
    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT tablename::text \
         FROM pg_tables \
         WHERE schemaname = 'public' \
         ORDER BY tablename",
    )
    .fetch_all(pool)
    .await
    .context("failed to list tables")?;

    let mut counts = Vec::with_capacity(tables.len());
    for (table_name,) in &tables {
        // Table names come from pg_tables so they are safe identifiers.
        let query = format!("SELECT COUNT(*) FROM {table_name}");
        let count: (i64,) = sqlx::query_as(&query)
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to count rows in {table_name}"))?;
        counts.push((table_name.clone(), count.0));
    }
    Ok(counts)
}
