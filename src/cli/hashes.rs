use anyhow::{Context, Result};

use forge_index::index::objects::HashMapping;

use super::Session;

pub async fn map_hash(
    session: &Session,
    repo_id: i64,
    git_hash: &str,
    got_hash: &str,
    object_type: &str,
) -> Result<()> {
    let mapping = HashMapping::new(repo_id, git_hash, got_hash, object_type);
    session
        .store
        .set_hash_mapping(&session.scope, &mapping)
        .await
        .with_context(|| format!("Failed to map {} -> {}", git_hash, got_hash))?;

    session.emit(&mapping, |m| {
        println!("Mapped git {} <-> got {} ({})", m.git_hash, m.got_hash, m.object_type);
    })
}

pub async fn lookup_hash(session: &Session, repo_id: i64, hash: &str, from_got: bool) -> Result<()> {
    let (from, to) = if from_got { ("got", "git") } else { ("git", "got") };
    let found = if from_got {
        session.store.get_git_hash(&session.scope, repo_id, hash).await
    } else {
        session.store.get_got_hash(&session.scope, repo_id, hash).await
    }
    .with_context(|| format!("No {} hash recorded for {} {}", to, from, hash))?;

    session.emit(&serde_json::json!({ from: hash, to: &found }), |_| {
        println!("{}", found);
    })
}
