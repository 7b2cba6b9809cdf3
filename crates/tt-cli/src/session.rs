//! The acting user and the database a command runs against.

use std::path::Path;

use anyhow::{Context, Result};
use tt_core::{Actor, UserId, WorkspaceId};
use tt_db::Database;

use crate::Config;

/// State shared by every subcommand.
pub struct Session {
    pub db: Database,
    pub config: Config,
    /// `--user`, falling back to the configured user.
    pub user: Option<UserId>,
    /// Print JSON instead of text.
    pub json: bool,
}

impl Session {
    /// Loads config and opens the database, ensuring the parent directory exists.
    pub fn open(config_path: Option<&Path>, user: Option<UserId>, json: bool) -> Result<Self> {
        let config = Config::load_from(config_path).context("failed to load configuration")?;
        tracing::debug!(?config, "loaded configuration");

        if let Some(parent) = config.database_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create database directory")?;
        }

        let db = Database::open(&config.database_path)
            .with_context(|| format!("failed to open {}", config.database_path.display()))?;
        Self::new(db, config, user, json)
    }

    /// Wraps an open database, applying the configured policies and catalog.
    pub fn new(db: Database, config: Config, user: Option<UserId>, json: bool) -> Result<Self> {
        let db = db
            .with_policies(config.policies())
            .context("invalid policy configuration")?
            .with_catalog(config.catalog());
        let user = user.or_else(|| config.user.clone());
        Ok(Self {
            db,
            config,
            user,
            json,
        })
    }

    /// The acting user; commands that touch owned data need one.
    pub fn user(&self) -> Result<&UserId> {
        self.user
            .as_ref()
            .context("no user configured: pass --user or set `user` in the config file")
    }

    /// The acting user with their roles in `workspace`.
    pub fn actor(&self, workspace: &WorkspaceId) -> Result<Actor> {
        Ok(self.config.actor(self.user()?, workspace))
    }
}
