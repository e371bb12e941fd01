//! Configuration for the kiln server.
//!
//! Configuration is loaded from environment variables. Everything except
//! the API key has a default.

use kiln_core::LifecycleConfig;
use kiln_gen::{GenerationConfig, DEFAULT_ENDPOINT, DEFAULT_MODEL};
use kiln_runtime::{CommandSpec, LocalRuntimeConfig};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for the kiln server.
#[derive(Clone)]
pub struct KilnConfig {
    /// Bearer credential for the model backend.
    pub api_key: String,

    /// Chat completions endpoint.
    pub api_url: String,

    /// Model identifier.
    pub model: String,

    /// Hard deadline for one generation request (default: 120s).
    pub generation_timeout: Duration,

    /// How long to wait for the dev server before the fallback address
    /// is published (default: 30s).
    pub readiness_timeout: Duration,

    /// Directory holding per-boot sandbox directories.
    pub sandbox_root: PathBuf,

    /// HTTP server bind address.
    pub http_addr: SocketAddr,

    /// Dependency install command (default: `npm install`).
    pub install_command: CommandSpec,

    /// Dev server command (default: `npm run dev`).
    pub dev_command: CommandSpec,
}

impl fmt::Debug for KilnConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KilnConfig")
            .field("api_key", &"<redacted>")
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("generation_timeout", &self.generation_timeout)
            .field("readiness_timeout", &self.readiness_timeout)
            .field("sandbox_root", &self.sandbox_root)
            .field("http_addr", &self.http_addr)
            .field("install_command", &self.install_command.to_string())
            .field("dev_command", &self.dev_command.to_string())
            .finish()
    }
}

/// Configuration loading error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("KILN_API_KEY is not set")]
    MissingApiKey,

    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Default for KilnConfig {
    fn default() -> Self {
        let lifecycle = LifecycleConfig::default();
        Self {
            api_key: String::new(),
            api_url: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            generation_timeout: Duration::from_secs(120),
            readiness_timeout: lifecycle.readiness_deadline,
            sandbox_root: LocalRuntimeConfig::default().root_dir,
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 8080),
            install_command: lifecycle.install_command,
            dev_command: lifecycle.dev_command,
        }
    }
}

impl KilnConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `KILN_API_KEY` | required |
    /// | `KILN_API_URL` | `https://api.x.ai/v1/chat/completions` |
    /// | `KILN_MODEL` | `grok-code-fast-1` |
    /// | `KILN_GENERATION_TIMEOUT_SECS` | `120` |
    /// | `KILN_READINESS_TIMEOUT_SECS` | `30` |
    /// | `KILN_SANDBOX_ROOT` | `$TMPDIR/kiln` |
    /// | `KILN_HTTP_HOST` | `0.0.0.0` |
    /// | `KILN_HTTP_PORT` | `8080` |
    /// | `KILN_INSTALL_CMD` | `npm install` |
    /// | `KILN_DEV_CMD` | `npm run dev` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through `lookup` instead of the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let api_key = var("KILN_API_KEY").ok_or(ConfigError::MissingApiKey)?;

        let http_host: IpAddr = parsed(&var, "KILN_HTTP_HOST")?.unwrap_or(default.http_addr.ip());
        let http_port: u16 = parsed(&var, "KILN_HTTP_PORT")?.unwrap_or(default.http_addr.port());

        Ok(Self {
            api_key,
            api_url: var("KILN_API_URL").unwrap_or(default.api_url),
            model: var("KILN_MODEL").unwrap_or(default.model),
            generation_timeout: seconds(&var, "KILN_GENERATION_TIMEOUT_SECS")?
                .unwrap_or(default.generation_timeout),
            readiness_timeout: seconds(&var, "KILN_READINESS_TIMEOUT_SECS")?
                .unwrap_or(default.readiness_timeout),
            sandbox_root: var("KILN_SANDBOX_ROOT")
                .map(PathBuf::from)
                .unwrap_or(default.sandbox_root),
            http_addr: SocketAddr::new(http_host, http_port),
            install_command: command(&var, "KILN_INSTALL_CMD")?
                .unwrap_or(default.install_command),
            dev_command: command(&var, "KILN_DEV_CMD")?.unwrap_or(default.dev_command),
        })
    }

    /// Settings for the generation client.
    pub fn generation_config(&self) -> Result<GenerationConfig, ConfigError> {
        GenerationConfig::builder()
            .endpoint(self.api_url.clone())
            .api_key(self.api_key.clone())
            .model(self.model.clone())
            .deadline(self.generation_timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Settings for the sandbox lifecycle manager.
    pub fn lifecycle_config(&self) -> Result<LifecycleConfig, ConfigError> {
        LifecycleConfig::builder()
            .install_command(self.install_command.clone())
            .dev_command(self.dev_command.clone())
            .readiness_deadline(self.readiness_timeout)
            .build()
            .map_err(ConfigError::Invalid)
    }

    /// Settings for the host-process sandbox engine.
    pub fn runtime_config(&self) -> Result<LocalRuntimeConfig, ConfigError> {
        LocalRuntimeConfig::builder()
            .root_dir(self.sandbox_root.clone())
            .build()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

fn parsed<T, F>(var: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var: name, value }),
        None => Ok(None),
    }
}

fn seconds<F>(var: &F, name: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match parsed::<u64, F>(var, name)? {
        Some(0) => Err(ConfigError::InvalidValue {
            var: name,
            value: "0".to_string(),
        }),
        other => Ok(other.map(Duration::from_secs)),
    }
}

fn command<F>(var: &F, name: &'static str) -> Result<Option<CommandSpec>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(line) => CommandSpec::parse(&line)
            .map(Some)
            .ok_or(ConfigError::InvalidValue { var: name, value: line }),
        None => Ok(None),
    }
}
