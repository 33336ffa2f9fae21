use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Default settings shared by every dev server target
    #[serde(default)]
    pub defaults: TargetDefaults,

    /// Dev server targets keyed by name
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,

    /// Directory that relative working directories are resolved against.
    /// Set by [`Config::load`] to the directory holding the config file.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 5000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Maximum idle connections per dev server (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TargetDefaults {
    /// How long to wait for a launched dev server to answer before giving up
    #[serde(default = "default_max_timeout")]
    pub max_timeout_secs: u64,

    /// Grace period in seconds between the polite stop request and the tree kill
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Upper bound for a single forwarded request, in seconds
    #[serde(default = "default_forward_timeout")]
    pub forward_timeout_secs: u64,

    /// Working directory for launch commands, relative to the config file
    #[serde(default = "default_working_directory")]
    pub working_directory: String,
}

impl Default for TargetDefaults {
    fn default() -> Self {
        Self {
            max_timeout_secs: default_max_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            forward_timeout_secs: default_forward_timeout(),
            working_directory: default_working_directory(),
        }
    }
}

/// Configuration for a single dev server target
///
/// # Security Warning
///
/// `launch_command` is executed directly with the permissions of the proxy.
/// Only load configuration files from trusted sources.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TargetConfig {
    /// Base URL of the dev server, e.g. `https://localhost:44478`
    #[serde(default)]
    pub client_url: String,

    /// Program followed by its arguments, e.g. `npm run dev`
    #[serde(default)]
    pub launch_command: String,

    /// Working directory (overrides default)
    pub working_directory: Option<String>,

    /// Launch timeout in seconds (overrides default)
    pub max_timeout_secs: Option<u64>,

    /// Path prefix this target is mounted at. Targets without one receive
    /// every request no other target claims.
    pub public_path: Option<String>,

    /// Grace period in seconds (overrides default)
    pub shutdown_grace_period_secs: Option<u64>,

    /// Forward timeout in seconds (overrides default)
    pub forward_timeout_secs: Option<u64>,

    /// Keep the matched public path on forwarded requests (default: true)
    pub preserve_matched_path_segment: Option<bool>,
}

impl TargetConfig {
    /// Create a target with defaults for everything but the URL and command
    pub fn new(client_url: &str, launch_command: &str) -> Self {
        Self {
            client_url: client_url.to_string(),
            launch_command: launch_command.to_string(),
            ..Self::default()
        }
    }

    /// Mount this target under a path prefix (builder pattern)
    pub fn with_public_path(mut self, public_path: &str) -> Self {
        self.public_path = Some(public_path.to_string());
        self
    }

    /// Set working directory (builder pattern)
    pub fn with_working_directory(mut self, dir: &str) -> Self {
        self.working_directory = Some(dir.to_string());
        self
    }

    /// Set the launch timeout (builder pattern)
    pub fn with_max_timeout_secs(mut self, secs: u64) -> Self {
        self.max_timeout_secs = Some(secs);
        self
    }

    /// Strip the public path before forwarding (builder pattern)
    pub fn strip_public_path(mut self) -> Self {
        self.preserve_matched_path_segment = Some(false);
        self
    }

    /// Launch budget, falling back to the defaults
    pub fn max_timeout(&self, defaults: &TargetDefaults) -> Duration {
        Duration::from_secs(self.max_timeout_secs.unwrap_or(defaults.max_timeout_secs))
    }

    pub fn shutdown_grace_period(&self, defaults: &TargetDefaults) -> Duration {
        Duration::from_secs(
            self.shutdown_grace_period_secs
                .unwrap_or(defaults.shutdown_grace_period_secs),
        )
    }

    /// Time to wait for a forwarded response
    pub fn forward_timeout(&self, defaults: &TargetDefaults) -> Duration {
        Duration::from_secs(
            self.forward_timeout_secs
                .unwrap_or(defaults.forward_timeout_secs),
        )
    }

    /// Normalized public path (`/segment`), if any
    pub fn normalized_public_path(&self) -> Option<String> {
        self.public_path.as_deref().and_then(normalize_public_path)
    }

    /// Merge this target with the defaults into a resolved record
    pub fn resolve(&self, name: &str, defaults: &TargetDefaults, base_dir: &Path) -> DevServerTarget {
        let working_directory = self
            .working_directory
            .as_deref()
            .unwrap_or(&defaults.working_directory);

        DevServerTarget {
            name: name.to_string(),
            client_url: self.client_url.trim().to_string(),
            launch_command: self.launch_command.trim().to_string(),
            working_directory: base_dir.join(working_directory),
            max_timeout: self.max_timeout(defaults),
            public_path: self.normalized_public_path(),
            preserve_matched_path_segment: self.preserve_matched_path_segment.unwrap_or(true),
            shutdown_grace_period: self.shutdown_grace_period(defaults),
            forward_timeout: self.forward_timeout(defaults),
        }
    }

    /// Validate the target configuration
    pub fn validate(&self, name: &str) -> Result<(), String> {
        let url = self.client_url.trim();
        if url.is_empty() {
            return Err(format!("Target '{}': 'client_url' is required", name));
        }

        match url.parse::<http::Uri>() {
            Ok(uri)
                if matches!(uri.scheme_str(), Some("http") | Some("https"))
                    && uri.authority().is_some() => {}
            _ => {
                return Err(format!(
                    "Target '{}': 'client_url' must be an absolute http or https URL, got '{}'",
                    name, url
                ));
            }
        }

        if self.launch_command.trim().is_empty() {
            return Err(format!("Target '{}': 'launch_command' is required", name));
        }

        Ok(())
    }
}

/// A fully resolved dev server target, ready for launching and forwarding
#[derive(Debug, Clone, PartialEq)]
pub struct DevServerTarget {
    pub name: String,
    pub client_url: String,
    pub launch_command: String,
    pub working_directory: PathBuf,
    pub max_timeout: Duration,
    /// Normalized mount prefix, `None` for the default target
    pub public_path: Option<String>,
    pub preserve_matched_path_segment: bool,
    pub shutdown_grace_period: Duration,
    pub forward_timeout: Duration,
}

impl DevServerTarget {
    /// URL probed to decide whether the dev server is answering
    pub fn probe_url(&self) -> String {
        let base = self.client_url.trim_end_matches('/');
        match &self.public_path {
            Some(path) => format!("{}{}/", base, path),
            None => format!("{}/", base),
        }
    }

    /// Whether this target catches paths no other target claims
    pub fn is_default(&self) -> bool {
        self.public_path.is_none()
    }
}

/// Normalize a public path to `/a/b` form. Returns `None` for paths that
/// are empty once slashes and whitespace are trimmed.
pub fn normalize_public_path(path: &str) -> Option<String> {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(format!("/{}", trimmed))
    }
}

/// The `SpaProxyServer` section of a `spa.proxy.json` file
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct SpaProxyServerSection {
    client_url: String,
    launch_command: String,
    max_timeout_in_seconds: Option<u64>,
    working_directory: Option<String>,
    public_path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpaProxyFile {
    #[serde(default)]
    spa_proxy_server: SpaProxyServerSection,
}

/// Name given to the single target read from a `spa.proxy.json` file
pub const SPA_PROXY_TARGET_NAME: &str = "spa";

// Default value functions
fn default_listen_port() -> u16 {
    5000
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_max_timeout() -> u64 {
    120
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_forward_timeout() -> u64 {
    100
}

fn default_working_directory() -> String {
    ".".to_string()
}

impl Config {
    /// Load configuration from a TOML file, or from a `spa.proxy.json`
    /// style file when the extension is `.json`
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let mut config = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::from_spa_proxy_json(&content)?,
            _ => toml::from_str(&content)?,
        };

        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields `Ok(None)`
    pub fn load_optional<P: AsRef<Path>>(path: P) -> anyhow::Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        Self::load(path).map(Some)
    }

    /// Parse the contents of a `spa.proxy.json` file into a single target config
    pub fn from_spa_proxy_json(content: &str) -> anyhow::Result<Self> {
        let file: SpaProxyFile = serde_json::from_str(content)?;
        let section = file.spa_proxy_server;

        let target = TargetConfig {
            client_url: section.client_url,
            launch_command: section.launch_command,
            working_directory: section.working_directory.filter(|d| !d.trim().is_empty()),
            // Absent means `[defaults]`, an explicit 0 is kept
            max_timeout_secs: section.max_timeout_in_seconds,
            public_path: section.public_path,
            ..TargetConfig::default()
        };

        let mut targets = BTreeMap::new();
        targets.insert(SPA_PROXY_TARGET_NAME.to_string(), target);

        Ok(Self {
            targets,
            ..Self::default()
        })
    }

    /// Resolve every target against the defaults
    pub fn resolved_targets(&self) -> Vec<DevServerTarget> {
        self.targets
            .iter()
            .map(|(name, target)| target.resolve(name, &self.defaults, &self.base_dir))
            .collect()
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for (name, target) in &self.targets {
            if let Err(e) = target.validate(name) {
                errors.push(e);
            }
        }

        let defaults: Vec<&str> = self
            .targets
            .iter()
            .filter(|(_, t)| t.normalized_public_path().is_none())
            .map(|(name, _)| name.as_str())
            .collect();
        if defaults.len() > 1 {
            errors.push(format!(
                "Only one target may omit 'public_path', found: {}",
                defaults.join(", ")
            ));
        }

        let mut mounts: HashMap<String, &str> = HashMap::new();
        for (name, target) in &self.targets {
            let Some(path) = target.normalized_public_path() else {
                continue;
            };
            if let Some(other) = mounts.insert(path.to_ascii_lowercase(), name) {
                errors.push(format!(
                    "Targets '{}' and '{}' share public_path '{}'",
                    other, name, path
                ));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
