use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the control panel
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Filesystem locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// How mock servers are launched
    #[serde(default)]
    pub mock: MockConfig,

    /// Reverse-proxy routing documents
    #[serde(default)]
    pub routing: RoutingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port of the control panel API (default: 3600)
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Hostname used for direct mock URLs when proxy mode is off
    #[serde(default = "default_public_hostname")]
    pub public_hostname: String,

    /// Basic auth credentials as "user:password"
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_server_port(),
            public_hostname: default_public_hostname(),
            api_key: default_api_key(),
        }
    }
}

impl ServerConfig {
    /// Split the api key into (user, password)
    pub fn credentials(&self) -> Option<(&str, &str)> {
        self.api_key.split_once(':')
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Directory holding the mock definition documents
    #[serde(default = "default_configs_dir")]
    pub configs_dir: PathBuf,

    /// Staging directory for uploads
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,

    /// Directory for per-port mock server logs
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,

    /// SQLite database holding aliases
    #[serde(default = "default_database")]
    pub database: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            configs_dir: default_configs_dir(),
            upload_dir: default_upload_dir(),
            logs_dir: default_logs_dir(),
            database: default_database(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MockConfig {
    /// Command line used to launch a mock server.
    ///
    /// `{data}` is replaced with the document path and `{port}` with the
    /// target port in every argument.
    #[serde(default = "default_mock_command")]
    pub command: String,

    /// Arguments used to check that the executable is installed
    #[serde(default = "default_version_args")]
    pub version_args: Vec<String>,

    /// Accept any positive port instead of the configured range
    #[serde(default)]
    pub allow_any_port: bool,

    /// First port of the allowed range
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// Last port of the allowed range (inclusive)
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Extension of the documents listed by the store
    #[serde(default = "default_document_extension")]
    pub document_extension: String,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            command: default_mock_command(),
            version_args: default_version_args(),
            allow_any_port: false,
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            document_extension: default_document_extension(),
        }
    }
}

impl MockConfig {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoutingConfig {
    /// Dynamic routing document, rewritten on every instance change
    #[serde(default = "default_dynamic_config")]
    pub dynamic_config: PathBuf,

    /// Static entry-point document
    #[serde(default = "default_static_config")]
    pub static_config: PathBuf,

    /// Address of the static frontend
    #[serde(default = "default_frontend_url")]
    pub frontend_url: String,

    /// Entry point name attached to instance routers
    #[serde(default = "default_entry_point")]
    pub entry_point: String,

    /// Listen address of the entry point
    #[serde(default = "default_entry_point_address")]
    pub entry_point_address: String,

    /// Build mock URLs through the proxy instead of direct host:port
    #[serde(default = "default_proxy_mode")]
    pub proxy_mode: bool,

    /// Public base URL of the proxy (derived from the request host if unset)
    pub proxy_base_url: Option<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            dynamic_config: default_dynamic_config(),
            static_config: default_static_config(),
            frontend_url: default_frontend_url(),
            entry_point: default_entry_point(),
            entry_point_address: default_entry_point_address(),
            proxy_mode: default_proxy_mode(),
            proxy_base_url: None,
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    3600
}

fn default_public_hostname() -> String {
    "localhost".to_string()
}

fn default_api_key() -> String {
    "admin:admin".to_string()
}

fn default_configs_dir() -> PathBuf {
    PathBuf::from("../configs")
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("./uploads")
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("./logs")
}

fn default_database() -> PathBuf {
    PathBuf::from("../configs/db/db.sqlite")
}

fn default_mock_command() -> String {
    "mockoon-cli start --data {data} --port {port}".to_string()
}

fn default_version_args() -> Vec<String> {
    vec!["--version".to_string()]
}

fn default_port_range_start() -> u16 {
    9001
}

fn default_port_range_end() -> u16 {
    9999
}

fn default_shutdown_grace_period() -> u64 {
    10 // 10 seconds between SIGTERM and SIGKILL
}

fn default_document_extension() -> String {
    "json".to_string()
}

fn default_dynamic_config() -> PathBuf {
    PathBuf::from("../configs/traefik/dynamic.yml")
}

fn default_static_config() -> PathBuf {
    PathBuf::from("../configs/traefik/traefik.yml")
}

fn default_frontend_url() -> String {
    "http://localhost:3005".to_string()
}

fn default_entry_point() -> String {
    "web".to_string()
}

fn default_entry_point_address() -> String {
    ":80".to_string()
}

fn default_proxy_mode() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if shell_words::split(&self.mock.command)
            .map(|words| words.is_empty())
            .unwrap_or(true)
        {
            errors.push("mock.command must be a non-empty command line".to_string());
        }

        if self.mock.port_range_start == 0 {
            errors.push("mock.port_range_start must be greater than 0".to_string());
        }

        if self.mock.port_range_start > self.mock.port_range_end {
            errors.push(format!(
                "mock.port_range_start ({}) must not exceed mock.port_range_end ({})",
                self.mock.port_range_start, self.mock.port_range_end
            ));
        }

        if self.mock.document_extension.trim_start_matches('.').is_empty() {
            errors.push("mock.document_extension must not be empty".to_string());
        }

        if self.server.credentials().is_none() {
            errors.push("server.api_key must have the form user:password".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Every directory the control panel writes into
    pub fn required_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![
            self.paths.configs_dir.clone(),
            self.paths.upload_dir.clone(),
            self.paths.logs_dir.clone(),
        ];
        for file in [
            &self.routing.dynamic_config,
            &self.routing.static_config,
            &self.paths.database,
        ] {
            if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
                if !dirs.iter().any(|d| d == parent) {
                    dirs.push(parent.to_path_buf());
                }
            }
        }
        dirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "127.0.0.1"
port = 4000
api_key = "ops:secret"

[paths]
configs_dir = "/srv/mocks"
logs_dir = "/var/log/mockgate"

[mock]
command = "mockoon-cli start --data {data} --port {port} --disable-log-to-file"
allow_any_port = true

[routing]
frontend_url = "http://localhost:8080"
proxy_base_url = "https://mocks.example.com"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.credentials(), Some(("ops", "secret")));
        assert_eq!(config.paths.configs_dir, PathBuf::from("/srv/mocks"));
        assert_eq!(config.paths.upload_dir, PathBuf::from("./uploads"));
        assert!(config.mock.allow_any_port);
        assert_eq!(config.mock.port_range_start, 9001);
        assert_eq!(
            config.routing.proxy_base_url.as_deref(),
            Some("https://mocks.example.com")
        );
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 3600);
        assert_eq!(config.server.api_key, "admin:admin");
    }

    #[test]
    fn test_default_mock_config() {
        let mock = MockConfig::default();
        assert_eq!(mock.command, "mockoon-cli start --data {data} --port {port}");
        assert_eq!(mock.version_args, vec!["--version".to_string()]);
        assert!(!mock.allow_any_port);
        assert_eq!(mock.port_range_start, 9001);
        assert_eq!(mock.port_range_end, 9999);
        assert_eq!(mock.shutdown_grace_period(), Duration::from_secs(10));
        assert_eq!(mock.document_extension, "json");
    }

    #[test]
    fn test_default_routing_config() {
        let routing = RoutingConfig::default();
        assert_eq!(
            routing.dynamic_config,
            PathBuf::from("../configs/traefik/dynamic.yml")
        );
        assert_eq!(routing.frontend_url, "http://localhost:3005");
        assert_eq!(routing.entry_point, "web");
        assert_eq!(routing.entry_point_address, ":80");
        assert!(routing.proxy_mode);
        assert!(routing.proxy_base_url.is_none());
    }

    #[test]
    fn test_validate_port_range() {
        let mut config = Config::default();
        config.mock.port_range_start = 9500;
        config.mock.port_range_end = 9100;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("must not exceed"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let mut config = Config::default();
        config.mock.command = "   ".to_string();
        config.server.api_key = "no-colon".to_string();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("mock.command"));
        assert!(err.contains("server.api_key"));
    }

    #[test]
    fn test_required_dirs_deduplicates_routing_dir() {
        let config = Config::default();
        let dirs = config.required_dirs();

        let traefik = PathBuf::from("../configs/traefik");
        assert_eq!(dirs.iter().filter(|d| **d == traefik).count(), 1);
        assert!(dirs.contains(&PathBuf::from("../configs/db")));
        assert!(dirs.contains(&PathBuf::from("./logs")));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 3600);
    }
}
