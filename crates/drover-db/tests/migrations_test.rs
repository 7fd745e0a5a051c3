//! Migration smoke tests: a fresh database gets the full schema.

use drover_test_utils::TestDb;

#[tokio::test]
async fn migrations_create_all_tables() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();

    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT tablename::text FROM pg_tables \
         WHERE schemaname = 'public' AND tablename != '_sqlx_migrations' \
         ORDER BY tablename",
    )
    .fetch_all(&pool)
    .await
    .expect("should list tables");

    let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "progress_log",
            "projects",
            "ticket_artifacts",
            "ticket_dependencies",
            "tickets",
        ]
    );

    db.teardown().await;
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();

    // Running the migrator again against the same database is a no-op.
    drover_db::pool::run_migrations(&pool)
        .await
        .expect("second run should succeed");

    db.teardown().await;
}

#[tokio::test]
async fn ticket_state_check_constraint_enforced() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();

    let project: (uuid::Uuid,) = sqlx::query_as(
        "INSERT INTO projects (tenant_id, name) VALUES (gen_random_uuid(), 'p') RETURNING id",
    )
    .fetch_one(&pool)
    .await
    .unwrap();

    let result = sqlx::query(
        "INSERT INTO tickets (tenant_id, project_id, title, state) \
         VALUES (gen_random_uuid(), $1, 't', 'limbo')",
    )
    .bind(project.0)
    .execute(&pool)
    .await;

    assert!(result.is_err(), "unknown state should violate the CHECK");

    db.teardown().await;
}
