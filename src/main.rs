use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use forge_index::config::{Config, LoggingConfig};
use forge_index::queue::COMMIT_INDEX_JOB;

mod cli;

use cli::{OutputFormat, Session};

#[derive(Parser)]
#[command(name = "forge-index")]
#[command(author = "Forge Index Team")]
#[command(version)]
#[command(about = "Commit indexing queue and code-entity store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./forge-index.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Restrict every operation to one tenant
    #[arg(short, long, global = true)]
    tenant: Option<String>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,

    /// Manage repositories
    Repo {
        #[command(subcommand)]
        action: RepoAction,
    },

    /// Queue a commit for indexing
    Enqueue {
        repo: i64,
        commit: String,

        #[arg(long, default_value = COMMIT_INDEX_JOB)]
        job_type: String,

        /// Attempts before the job fails (defaults to queue.default_max_attempts)
        #[arg(long)]
        max_attempts: Option<i32>,
    },

    /// Show the latest indexing job for a commit
    Status { repo: i64, commit: String },

    /// Show queue statistics
    Stats,

    /// Search a commit's entity index
    Search {
        repo: i64,
        commit: String,
        query: String,

        #[arg(short, long)]
        kind: Option<String>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// List the symbols indexed for a commit
    Symbols {
        repo: i64,
        commit: String,

        #[arg(short, long)]
        kind: Option<String>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Find callers of a symbol (entity id or name)
    Callers {
        repo: i64,
        commit: String,
        symbol: String,
    },

    /// Find callees of a symbol (entity id or name)
    Callees {
        repo: i64,
        commit: String,
        symbol: String,
    },

    /// Record a git <-> got object hash pair
    MapHash {
        repo: i64,
        git_hash: String,
        got_hash: String,

        #[arg(long, default_value = "commit")]
        object_type: String,
    },

    /// Translate an object hash between schemes
    LookupHash {
        repo: i64,
        hash: String,

        /// Treat HASH as a got hash and print the git hash
        #[arg(long)]
        from_got: bool,
    },
}

#[derive(Subcommand)]
enum RepoAction {
    /// Create a repository
    Create { owner: String, name: String },

    /// Show a repository
    Show { id: i64 },

    /// Delete a repository and all derived data
    Delete { id: i64 },
}

fn init_logging(debug: bool, verbose: bool, logging: &LoggingConfig) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else if verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_env("FORGE_INDEX_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match logging.format.as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_logging(cli.debug, cli.verbose, &config.logging);

    debug!(backend = config.database.backend.as_str(), "forge-index starting");

    let session = Session::open(config, cli.tenant, cli.format).await?;

    match cli.command {
        Commands::Migrate => cli::repo::migrate(&session).await?,

        Commands::Repo { action } => match action {
            RepoAction::Create { owner, name } => {
                cli::repo::create_repo(&session, &owner, &name).await?
            }
            RepoAction::Show { id } => cli::repo::show_repo(&session, id).await?,
            RepoAction::Delete { id } => cli::repo::delete_repo(&session, id).await?,
        },

        Commands::Enqueue {
            repo,
            commit,
            job_type,
            max_attempts,
        } => cli::index::enqueue(&session, repo, &commit, &job_type, max_attempts).await?,

        Commands::Status { repo, commit } => {
            cli::stats::show_status(&session, repo, &commit).await?
        }

        Commands::Stats => cli::stats::show_stats(&session).await?,

        Commands::Search {
            repo,
            commit,
            query,
            kind,
            limit,
        } => {
            cli::query::search(&session, repo, &commit, &query, kind.as_deref(), limit).await?
        }

        Commands::Symbols {
            repo,
            commit,
            kind,
            limit,
        } => cli::query::symbols(&session, repo, &commit, kind.as_deref(), limit).await?,

        Commands::Callers {
            repo,
            commit,
            symbol,
        } => cli::query::navigate(&session, "callers", repo, &commit, &symbol).await?,

        Commands::Callees {
            repo,
            commit,
            symbol,
        } => cli::query::navigate(&session, "callees", repo, &commit, &symbol).await?,

        Commands::MapHash {
            repo,
            git_hash,
            got_hash,
            object_type,
        } => cli::hashes::map_hash(&session, repo, &git_hash, &got_hash, &object_type).await?,

        Commands::LookupHash {
            repo,
            hash,
            from_got,
        } => cli::hashes::lookup_hash(&session, repo, &hash, from_got).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "forge-index",
            "search",
            "7",
            "abc123",
            "Order",
            "--tenant",
            "acme",
            "--format",
            "json",
            "--limit",
            "5",
        ])
        .unwrap();
        assert_eq!(cli.tenant.as_deref(), Some("acme"));
        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Commands::Search { repo, limit, .. } => {
                assert_eq!(repo, 7);
                assert_eq!(limit, Some(5));
            }
            _ => panic!("expected search"),
        }
    }
}
