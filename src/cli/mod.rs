// CLI command implementations

pub mod hashes;
pub mod index;
pub mod query;
pub mod repo;
pub mod stats;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Serialize;
use std::sync::Arc;

use forge_index::config::Config;
use forge_index::store::{self, Store};
use forge_index::tenant::{TenantId, TenantScope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Everything a command needs: the opened store, the caller's tenant scope
/// and how to print.
pub struct Session {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub scope: TenantScope,
    pub format: OutputFormat,
}

impl Session {
    pub async fn open(config: Config, tenant: Option<String>, format: OutputFormat) -> Result<Self> {
        let scope = match tenant {
            Some(id) => TenantScope::tenant(TenantId::new(id).context("Invalid --tenant")?),
            None => TenantScope::unscoped(),
        };
        let store = store::open(&config)
            .await
            .with_context(|| format!("Failed to open {} store", config.database.backend.as_str()))?;

        Ok(Self {
            config,
            store,
            scope,
            format,
        })
    }

    /// Print `value` as JSON, or run `text` for human output.
    pub fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&T)) -> Result<()> {
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
            OutputFormat::Text => text(value),
        }
        Ok(())
    }
}
