//! Database query functions for the `projects` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Project;

/// Parameters for inserting a new project row.
#[derive(Debug, Clone)]
pub struct NewProject<'a> {
    pub tenant_id: Uuid,
    pub name: &'a str,
    pub repo_url: Option<&'a str>,
    pub base_branch: &'a str,
    pub settings: serde_json::Value,
}

/// Insert a new project row. Returns the inserted project with
/// server-generated defaults (id, created_at).
pub async fn insert_project(pool: &PgPool, new: &NewProject<'_>) -> Result<Project> {
    let project = sqlx::query_as::<_, Project>(
        "INSERT INTO projects (tenant_id, name, repo_url, base_branch, settings) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(new.tenant_id)
    .bind(new.name)
    .bind(new.repo_url)
    .bind(new.base_branch)
    .bind(&new.settings)
    .fetch_one(pool)
    .await
    .context("failed to insert project")?;

    Ok(project)
}

/// Fetch a single project by ID.
pub async fn get_project(pool: &PgPool, id: Uuid) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch project")?;

    Ok(project)
}

/// List all projects for a tenant, ordered by name.
pub async fn list_projects(pool: &PgPool, tenant_id: Uuid) -> Result<Vec<Project>> {
    let projects = sqlx::query_as::<_, Project>(
        "SELECT * FROM projects WHERE tenant_id = $1 ORDER BY name ASC",
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await
    .context("failed to list projects")?;

    Ok(projects)
}
