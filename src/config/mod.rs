//! Configuration loading and management.
//!
//! Loads configuration from `./modkern.toml` (or `$MODKERN_CONFIG_PATH`).
//! Environment variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::credential::MasterKey;
use crate::identifier::Identifier;
use crate::kernel::{CoreModules, RouterSettings, KERNEL_VERSION};

// ── Top-level config ────────────────────────────────────────────

/// Top-level configuration loaded from TOML.
///
/// Path: `./modkern.toml` or `$MODKERN_CONFIG_PATH`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModkernConfig {
    /// Router and key settings (`[kernel]`).
    pub kernel: KernelConfig,
    /// Filesystem locations (`[paths]`).
    pub paths: PathsConfig,
    /// Registry defaults and core modules (`[registry]`).
    pub registry: RegistryConfig,
    /// Sandbox host settings (`[sandbox]`).
    pub sandbox: SandboxConfig,
}

impl ModkernConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// `path` takes priority over `$MODKERN_CONFIG_PATH`. A missing file
    /// yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env = |key: &str| std::env::var(key).ok();
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path_with(env),
        };
        let mut config = Self::load_from_file(&path)?;
        config.apply_overrides(env);
        Ok(config)
    }

    /// Load from a TOML file only, no env overrides.
    fn load_from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("failed to parse {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config file {}: {e}",
                path.display()
            )),
        }
    }

    /// Resolve the config path using a custom env resolver.
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("MODKERN_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("modkern.toml"))
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function so tests never touch the process environment.
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        // Kernel.
        if let Some(v) = env("MODKERN_QUERY_TTL_SECS") {
            match v.parse() {
                Ok(n) => self.kernel.query_ttl_seconds = n,
                Err(_) => tracing::warn!(
                    var = "MODKERN_QUERY_TTL_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("MODKERN_LOG_LEVEL") {
            self.kernel.log_level = v;
        }

        // Paths.
        if let Some(v) = env("MODKERN_STORE_DIR") {
            self.paths.store_dir = Some(v);
        }
        if let Some(v) = env("MODKERN_LOGS_DIR") {
            self.paths.logs_dir = Some(v);
        }
        if let Some(v) = env("MODKERN_OVERRIDES_FILE") {
            self.paths.overrides_file = Some(v);
        }

        // Sandbox.
        if let Some(v) = env("MODKERN_SANDBOX_COMMAND") {
            let command: Vec<String> = v.split_whitespace().map(str::to_owned).collect();
            if command.is_empty() {
                tracing::warn!(var = "MODKERN_SANDBOX_COMMAND", "ignoring empty env override");
            } else {
                self.sandbox.command = command;
            }
        }
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// Router settings derived from `[kernel]` and `[sandbox]`.
    pub fn router_settings(&self) -> RouterSettings {
        RouterSettings {
            distribution: self.kernel.distribution.clone(),
            version: KERNEL_VERSION.to_owned(),
            query_ttl: Duration::from_secs(self.kernel.query_ttl_seconds),
            reap_interval: Duration::from_secs(self.kernel.reap_interval_seconds.max(1)),
            trusted_schemes: self.kernel.trusted_schemes.clone(),
            handshake_timeout: Duration::from_secs(self.sandbox.handshake_timeout_seconds),
            load_timeout: Duration::from_secs(self.kernel.load_timeout_seconds),
        }
    }

    /// Parsed core module identifiers.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first identifier that does not parse.
    pub fn core_modules(&self) -> Result<CoreModules> {
        let parse = |name: &str, value: &Option<String>| -> Result<Option<Identifier>> {
            value
                .as_deref()
                .map(|text| {
                    Identifier::parse(text)
                        .with_context(|| format!("invalid registry.core.{name} identifier"))
                })
                .transpose()
        };
        Ok(CoreModules {
            swarm: parse("swarm", &self.registry.core.swarm)?,
            s5: parse("s5", &self.registry.core.s5)?,
        })
    }

    /// Master key from the env var named by `kernel.master_key_env`.
    ///
    /// Returns `None` when the variable is unset.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is set but is not a 32-byte hex key.
    pub fn master_key_with(
        &self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<MasterKey>> {
        env(&self.kernel.master_key_env)
            .map(|hex| {
                MasterKey::from_hex(&hex)
                    .with_context(|| format!("invalid master key in {}", self.kernel.master_key_env))
            })
            .transpose()
    }

    /// Resolve every filesystem location, defaulting under `root`.
    pub fn runtime_paths_in(&self, root: &Path) -> RuntimePaths {
        let pick = |value: &Option<String>, default: &str| {
            value
                .as_deref()
                .map(PathBuf::from)
                .unwrap_or_else(|| root.join(default))
        };
        RuntimePaths {
            root: root.to_path_buf(),
            store_dir: pick(&self.paths.store_dir, "store"),
            logs_dir: pick(&self.paths.logs_dir, "logs"),
            overrides_file: pick(&self.paths.overrides_file, "overrides.json"),
            scratch_dir: pick(&self.sandbox.scratch_dir, "sandboxes"),
        }
    }

    /// Resolve every filesystem location under `~/.modkern/`.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn runtime_paths(&self) -> Result<RuntimePaths> {
        Ok(self.runtime_paths_in(&runtime_dir()?))
    }
}

/// Resolved filesystem locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    /// Runtime root directory.
    pub root: PathBuf,
    /// Module code store.
    pub store_dir: PathBuf,
    /// Rotated log files.
    pub logs_dir: PathBuf,
    /// Saved registry overrides.
    pub overrides_file: PathBuf,
    /// Temp files for sandbox code.
    pub scratch_dir: PathBuf,
}

/// Resolve the default runtime directory (`~/.modkern/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn runtime_dir() -> Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".modkern"))
}

// ── Kernel config ───────────────────────────────────────────────

/// Router and key settings (`[kernel]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Distribution name reported by `version`.
    pub distribution: String,
    /// Tracing filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Open queries older than this are closed with an error.
    pub query_ttl_seconds: u64,
    /// How often expired queries are looked for.
    pub reap_interval_seconds: u64,
    /// Pending loads still unfinished after this many seconds fail.
    pub load_timeout_seconds: u64,
    /// Origin schemes whose callers declare their own domain.
    pub trusted_schemes: Vec<String>,
    /// Env var holding the hex master key.
    pub master_key_env: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        let router = RouterSettings::default();
        Self {
            distribution: router.distribution,
            log_level: "info".to_owned(),
            query_ttl_seconds: router.query_ttl.as_secs(),
            reap_interval_seconds: router.reap_interval.as_secs(),
            load_timeout_seconds: router.load_timeout.as_secs(),
            trusted_schemes: router.trusted_schemes,
            master_key_env: "MODKERN_MASTER_KEY".to_owned(),
        }
    }
}

// ── Paths config ────────────────────────────────────────────────

/// Filesystem locations (`[paths]`). Unset entries live under `~/.modkern/`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Module code store directory.
    pub store_dir: Option<String>,
    /// Log directory.
    pub logs_dir: Option<String>,
    /// Saved overrides JSON file.
    pub overrides_file: Option<String>,
}

// ── Registry config ─────────────────────────────────────────────

/// Registry defaults and core modules (`[registry]`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Default resolver to content mappings, consulted after saved ones.
    pub defaults: BTreeMap<String, String>,
    /// Modules the registry transport calls into.
    pub core: CoreModulesConfig,
}

/// Core module identifiers (`[registry.core]`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CoreModulesConfig {
    /// Peer swarm module.
    pub swarm: Option<String>,
    /// Registry client module.
    pub s5: Option<String>,
}

// ── Sandbox config ──────────────────────────────────────────────

/// Sandbox host settings (`[sandbox]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter command line; the code file path is appended.
    pub command: Vec<String>,
    /// Upper bound on sandbox creation.
    pub handshake_timeout_seconds: u64,
    /// Where code files for running sandboxes are written.
    pub scratch_dir: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            command: vec!["node".to_owned()],
            handshake_timeout_seconds: 30,
            scratch_dir: None,
        }
    }
}
