//! Configuration loading and management.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use tt_core::{Actor, Catalog, Policies, Role, StaticCatalog, UserId, WorkspaceId, WorkspacePolicy};

/// Application configuration.
///
/// ```toml
/// user = "alice"
///
/// [policy]
/// weekly_overtime_hours = 40
///
/// [workspaces.acme.workflow]
/// steps = [{ role = "manager" }, { user = "dana" }]
///
/// [catalog.projects.web]
/// workspace = "acme"
/// rate = "100"
///
/// [members.acme]
/// bob = ["manager"]
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,
    /// Who commands act as unless `--user` is given.
    #[serde(default)]
    pub user: Option<UserId>,
    /// Policy of workspaces without their own entry.
    #[serde(default)]
    pub policy: WorkspacePolicy,
    /// Per-workspace policy overrides.
    #[serde(default)]
    pub workspaces: HashMap<WorkspaceId, WorkspacePolicy>,
    #[serde(default)]
    pub catalog: StaticCatalog,
    /// Workspace roles of each user, used to authorize approvals.
    #[serde(default)]
    pub members: HashMap<WorkspaceId, HashMap<UserId, Vec<Role>>>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("user", &self.user)
            .field("workspaces", &self.workspaces.len())
            .field("projects", &self.catalog.projects.len())
            .field("tasks", &self.catalog.tasks.len())
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("tt.db"),
            user: None,
            policy: WorkspacePolicy::default(),
            workspaces: HashMap::new(),
            catalog: StaticCatalog::default(),
            members: HashMap::new(),
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    ///
    /// Later sources win: defaults, `~/.config/tt/config.toml`, the given
    /// file, then `TT_*` variables (`__` separates nested keys, so
    /// `TT_POLICY__IDLE_THRESHOLD_MINUTES=10`).
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("TT_").split("__"));

        figment.extract()
    }

    /// The default policy plus the per-workspace overrides.
    pub fn policies(&self) -> Policies {
        self.workspaces.iter().fold(
            Policies::new(self.policy.clone()),
            |policies, (workspace, policy)| policies.with_workspace(workspace.clone(), policy.clone()),
        )
    }

    pub fn catalog(&self) -> Arc<dyn Catalog> {
        Arc::new(self.catalog.clone())
    }

    /// The user with the roles they hold in `workspace`.
    ///
    /// Users missing from `members` act with no roles: they may manage their
    /// own time and decide steps assigned to them by name.
    pub fn actor(&self, user: &UserId, workspace: &WorkspaceId) -> Actor {
        let roles = self
            .members
            .get(workspace)
            .and_then(|members| members.get(user))
            .cloned()
            .unwrap_or_default();
        Actor::new(user.clone(), roles)
    }
}

/// Returns the platform-specific config directory for tt.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("tt"))
}

/// Returns the platform-specific data directory for tt.
///
/// On Linux: `~/.local/share/tt`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("tt"))
}
