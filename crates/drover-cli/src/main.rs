mod activate_cmd;
mod config;
mod run_cmd;
mod status_cmd;
mod stuck_cmd;
mod ticket_cmds;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use drover_db::pool;

use config::{ConfigFile, DatabaseSection, DroverConfig};

#[derive(Parser)]
#[command(name = "drover", about = "Ticket execution engine: drives spec'd work items to pull requests")]
struct Cli {
    /// Database URL (overrides DROVER_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a drover config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/drover")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the drover database (creates it and runs migrations)
    DbInit,
    /// Run the engine: scheduler, reaper, sweep, and agent HTTP surface
    Run,
    /// Activate a build batch: draft tickets become ready or blocked
    Activate {
        /// Build ID whose draft tickets should be activated
        build_id: String,
    },
    /// Show ticket counts by state
    Status,
    /// List tickets stuck in intermediate states
    Stuck {
        /// Minimum minutes since the last write
        #[arg(long, default_value_t = 10)]
        minutes: i64,
    },
    /// Ticket inspection and human intervention
    Ticket {
        #[command(subcommand)]
        command: TicketCommands,
    },
}

#[derive(Subcommand)]
enum TicketCommands {
    /// Show a ticket with its artifacts and progress trace
    Show { ticket_id: String },
    /// Terminate a ticket (any non-terminal state)
    Cancel { ticket_id: String },
    /// Resume an on_hold ticket back to ready
    Resume { ticket_id: String },
    /// Route a needs_review ticket back to ready for another attempt
    Replay { ticket_id: String },
    /// Approve an in_review ticket to done
    Approve { ticket_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            let path = config::config_path();
            if path.exists() && !force {
                anyhow::bail!(
                    "config file already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            let file = ConfigFile {
                database: DatabaseSection { url: db_url },
                ..ConfigFile::default()
            };
            config::save_config(&file)?;
            println!("wrote {}", path.display());
            Ok(())
        }
        Commands::DbInit => {
            let config = DroverConfig::resolve(cli.database_url.as_deref())?;
            pool::ensure_database_exists(&config.db_config).await?;
            let pg = pool::create_pool(&config.db_config).await?;
            pool::run_migrations(&pg).await?;
            let counts = pool::table_counts(&pg).await?;
            println!("database initialized:");
            for (table, count) in counts {
                println!("  {table:<24} {count} rows");
            }
            pg.close().await;
            Ok(())
        }
        Commands::Run => {
            let config = DroverConfig::resolve(cli.database_url.as_deref())?;
            run_cmd::run(config).await
        }
        Commands::Activate { build_id } => {
            let pg = connect(cli.database_url.as_deref()).await?;
            let result = activate_cmd::run(&pg, &build_id).await;
            pg.close().await;
            result
        }
        Commands::Status => {
            let pg = connect(cli.database_url.as_deref()).await?;
            let result = status_cmd::run(&pg).await;
            pg.close().await;
            result
        }
        Commands::Stuck { minutes } => {
            let pg = connect(cli.database_url.as_deref()).await?;
            let result = stuck_cmd::run(&pg, minutes).await;
            pg.close().await;
            result
        }
        Commands::Ticket { command } => {
            let pg = connect(cli.database_url.as_deref()).await?;
            let result = match command {
                TicketCommands::Show { ticket_id } => ticket_cmds::show(&pg, &ticket_id).await,
                TicketCommands::Cancel { ticket_id } => ticket_cmds::cancel(&pg, &ticket_id).await,
                TicketCommands::Resume { ticket_id } => ticket_cmds::resume(&pg, &ticket_id).await,
                TicketCommands::Replay { ticket_id } => ticket_cmds::replay(&pg, &ticket_id).await,
                TicketCommands::Approve { ticket_id } => {
                    ticket_cmds::approve(&pg, &ticket_id).await
                }
            };
            pg.close().await;
            result
        }
    }
}

async fn connect(cli_db_url: Option<&str>) -> anyhow::Result<sqlx::PgPool> {
    let config = DroverConfig::resolve(cli_db_url)?;
    pool::create_pool(&config.db_config)
        .await
        .context("is the drover database initialized? (`drover db-init`)")
}
