use anyhow::{Context, Result};
use tracing::info;

use super::Session;

pub async fn migrate(session: &Session) -> Result<()> {
    session
        .store
        .migrate()
        .await
        .context("Failed to apply migrations")?;
    session
        .store
        .health_check()
        .await
        .context("Store health check failed")?;

    let backend = session.store.backend().as_str();
    info!(backend, "schema up to date");
    session.emit(&serde_json::json!({ "backend": backend, "migrated": true }), |_| {
        println!("Schema up to date ({})", backend);
    })
}

pub async fn create_repo(session: &Session, owner: &str, name: &str) -> Result<()> {
    let repo = session
        .store
        .create_repository(&session.scope, owner, name)
        .await
        .with_context(|| format!("Failed to create repository {}/{}", owner, name))?;

    session.emit(&repo, |repo| {
        println!("Created repository {}/{} (id {})", repo.owner, repo.name, repo.id);
    })
}

pub async fn show_repo(session: &Session, id: i64) -> Result<()> {
    let repo = session
        .store
        .get_repository(&session.scope, id)
        .await
        .with_context(|| format!("Repository {} not available", id))?;

    session.emit(&repo, |repo| {
        println!("Repository {}/{}", repo.owner, repo.name);
        println!("  id: {}", repo.id);
        if let Some(tenant) = &repo.tenant_id {
            println!("  tenant: {}", tenant);
        }
        println!("  created: {}", repo.created_at.to_rfc3339());
    })
}

pub async fn delete_repo(session: &Session, id: i64) -> Result<()> {
    session
        .store
        .delete_repository(&session.scope, id)
        .await
        .with_context(|| format!("Failed to delete repository {}", id))?;

    session.emit(&serde_json::json!({ "deleted": id }), |_| {
        println!("Deleted repository {} and its derived data", id);
    })
}
