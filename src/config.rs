//! Configuration management for the migration server

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub repository: RepositoryConfig,
    pub agent: AgentConfig,
    pub staging: StagingConfig,
    pub validation: ValidationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

/// The git repository the agent edits and sessions branch from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub path: PathBuf,
    /// Checkout holding `docs/API.md`, embedded into agent instructions when present
    pub backend_path: Option<PathBuf>,
    pub default_branch: String,
    pub fallback_branch: String,
    pub remote: String,
    pub branch_prefix: String,
    pub conflict_strategy: ConflictStrategy,
}

/// How `merge_branch` treats files that conflict with the default branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// Take the session branch's version of every conflicting file.
    /// Overwrites conflicting work on the default branch.
    Theirs,
    /// Abort the merge and report the conflicting files.
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub executable: String,
    pub skip_permissions: bool,
    /// Launch through `stdbuf -o0` so output lines arrive as they are written
    pub unbuffered: bool,
    pub stop_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    pub temp_directory: PathBuf,
    pub upload_max_size_mb: usize,
    pub session_timeout_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_typecheck_command")]
    pub typecheck_command: Vec<String>,
    #[serde(default = "default_test_command")]
    pub test_command: Vec<String>,
    #[serde(default = "default_build_command")]
    pub build_command: Vec<String>,
    pub source_dir: String,
    #[serde(default = "default_allowed_endpoints")]
    pub allowed_endpoints: Vec<String>,
}

fn default_typecheck_command() -> Vec<String> {
    vec!["npx".into(), "tsc".into(), "--noEmit".into()]
}

fn default_test_command() -> Vec<String> {
    vec!["npm".into(), "run".into(), "test".into()]
}

fn default_build_command() -> Vec<String> {
    vec!["npm".into(), "run".into(), "build".into()]
}

fn default_allowed_endpoints() -> Vec<String> {
    vec![
        "/api/auth/login".into(),
        "/api/accounts".into(),
        "/api/invoices".into(),
    ]
}

fn default_temp_directory() -> PathBuf {
    std::env::temp_dir().join("vibe-migrate")
}

/// `~/.vibe-migrate/config.toml`
pub fn default_config_file() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".vibe-migrate").join("config.toml"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                path: "./.vibe-migrate/vibe-migrate.db".to_string(),
            },
            repository: RepositoryConfig {
                path: PathBuf::from("."),
                backend_path: None,
                default_branch: "main".to_string(),
                fallback_branch: "master".to_string(),
                remote: "origin".to_string(),
                branch_prefix: "migration".to_string(),
                conflict_strategy: ConflictStrategy::Theirs,
            },
            agent: AgentConfig {
                executable: "claude".to_string(),
                skip_permissions: true,
                unbuffered: true,
                stop_grace_secs: 5,
            },
            staging: StagingConfig {
                temp_directory: default_temp_directory(),
                upload_max_size_mb: 100,
                session_timeout_hours: 24,
            },
            validation: ValidationConfig {
                typecheck_command: default_typecheck_command(),
                test_command: default_test_command(),
                build_command: default_build_command(),
                source_dir: "apps".to_string(),
                allowed_endpoints: default_allowed_endpoints(),
            },
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional TOML file and
    /// `VIBE_MIGRATE_<SECTION>__<KEY>` environment variables, in that order.
    pub fn load(config_file: Option<&Path>) -> Result<Self, config::ConfigError> {
        let defaults = Config::default();
        let file = config_file.map(Path::to_path_buf).or_else(default_config_file);

        let mut builder = config::Config::builder()
            .set_default("server.host", defaults.server.host)?
            .set_default("server.port", defaults.server.port as i64)?
            .set_default("database.path", defaults.database.path)?
            .set_default(
                "repository.path",
                defaults.repository.path.to_string_lossy().to_string(),
            )?
            .set_default("repository.default_branch", defaults.repository.default_branch)?
            .set_default(
                "repository.fallback_branch",
                defaults.repository.fallback_branch,
            )?
            .set_default("repository.remote", defaults.repository.remote)?
            .set_default("repository.branch_prefix", defaults.repository.branch_prefix)?
            .set_default("repository.conflict_strategy", "theirs")?
            .set_default("agent.executable", defaults.agent.executable)?
            .set_default("agent.skip_permissions", defaults.agent.skip_permissions)?
            .set_default("agent.unbuffered", defaults.agent.unbuffered)?
            .set_default("agent.stop_grace_secs", defaults.agent.stop_grace_secs as i64)?
            .set_default(
                "staging.temp_directory",
                defaults.staging.temp_directory.to_string_lossy().to_string(),
            )?
            .set_default(
                "staging.upload_max_size_mb",
                defaults.staging.upload_max_size_mb as i64,
            )?
            .set_default(
                "staging.session_timeout_hours",
                defaults.staging.session_timeout_hours as i64,
            )?
            .set_default("validation.source_dir", defaults.validation.source_dir)?;

        if let Some(file) = file {
            builder = builder.add_source(config::File::from(file).required(false));
        }

        builder
            .add_source(
                config::Environment::with_prefix("VIBE_MIGRATE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn database_url(&self) -> String {
        format!("sqlite:{}?mode=rwc", self.database.path)
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn upload_limit_bytes(&self) -> usize {
        self.staging.upload_max_size_mb * 1024 * 1024
    }
}

impl AgentConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}
