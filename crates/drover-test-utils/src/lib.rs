//! Per-test Postgres databases for drover's integration suites.
//!
//! All tests in a binary share one server: an external one when
//! `DROVER_TEST_PG_URL` points at it (CI starts a container once via a
//! nextest setup script), otherwise a testcontainers Postgres started
//! lazily on first use. Each [`TestDb::create`] carves a fresh database
//! out of that server and applies the drover migrations, so every test
//! sees the full ticket schema and nothing from its neighbors.

use std::sync::atomic::{AtomicU64, Ordering};

use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// The shared server, resolved once per test binary.
enum PgServer {
    External {
        url: String,
    },
    /// The container handle is held so the server outlives every test.
    Owned {
        url: String,
        _container: ContainerAsync<Postgres>,
    },
}

impl PgServer {
    fn url(&self) -> &str {
        match self {
            Self::External { url } | Self::Owned { url, .. } => url,
        }
    }
}

static SERVER: OnceCell<PgServer> = OnceCell::const_new();

/// Distinguishes databases created by concurrent tests in one process.
static NEXT_DB: AtomicU64 = AtomicU64::new(0);

async fn server() -> &'static PgServer {
    SERVER
        .get_or_init(|| async {
            if let Ok(url) = std::env::var("DROVER_TEST_PG_URL") {
                return PgServer::External { url };
            }
            let container = Postgres::default()
                .with_tag("18")
                .start()
                .await
                .expect("failed to start PostgreSQL test container");
            let host = container.get_host().await.expect("container host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("container port");
            PgServer::Owned {
                url: format!("postgresql://postgres:postgres@{host}:{port}"),
                _container: container,
            }
        })
        .await
}

/// Short-lived connection to the server's `postgres` database, for
/// CREATE/DROP DATABASE statements.
async fn admin_connection() -> PgConnection {
    let url = format!("{}/postgres", server().await.url());
    PgConnection::connect(&url)
        .await
        .expect("failed to connect to the admin database")
}

/// A schema-migrated scratch database, dropped by [`TestDb::teardown`].
pub struct TestDb {
    pub pool: PgPool,
    name: String,
}

impl TestDb {
    /// Create a fresh database on the shared server and run the drover
    /// migrations against it.
    pub async fn create() -> Self {
        let name = format!(
            "drover_test_{}_{}",
            std::process::id(),
            NEXT_DB.fetch_add(1, Ordering::Relaxed)
        );

        let mut admin = admin_connection().await;
        admin
            .execute(format!("CREATE DATABASE {name}").as_str())
            .await
            .unwrap_or_else(|e| panic!("failed to create test database {name}: {e}"));
        admin.close().await.ok();

        let url = format!("{}/{name}", server().await.url());
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .unwrap_or_else(|e| panic!("failed to connect to test database {name}: {e}"));

        drover_db::pool::run_migrations(&pool)
            .await
            .expect("drover migrations should apply to a fresh database");

        Self { pool, name }
    }

    /// Close the pool and drop the database.
    ///
    /// `WITH (FORCE)` bounces any connection a test left behind (leaked
    /// pool clones, aborted background tasks), so teardown never hangs
    /// on stragglers.
    pub async fn teardown(self) {
        self.pool.close().await;
        let mut admin = admin_connection().await;
        let drop_stmt = format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", self.name);
        if let Err(e) = admin.execute(drop_stmt.as_str()).await {
            eprintln!("failed to drop test database {}: {e}", self.name);
        }
        admin.close().await.ok();
    }
}
