//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The admin token is loaded from the ADMIN_TOKEN env var or
//! admin_token_file, never stored in the TOML directly to avoid leaking
//! secrets into config management.

use account_pool::{HeartbeatSettings, PoolSettings};
use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub pool: PoolConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
}

/// Listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Admin API listener; kept off the public address so account
    /// management never shares a port with dashboard traffic.
    pub admin_listen_addr: SocketAddr,
    #[serde(skip)]
    pub admin_token: Option<Secret<String>>,
    /// Path to a file containing the admin token (alternative to ADMIN_TOKEN env var)
    #[serde(default)]
    pub admin_token_file: Option<PathBuf>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Upstream research service settings
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default = "default_probe_path")]
    pub probe_path: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Credential pool settings
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    pub credentials_path: PathBuf,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

/// Heartbeat prober settings (initial values; mutable later via admin API)
#[derive(Debug, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_secs: default_heartbeat_interval(),
            timeout_secs: default_heartbeat_timeout(),
            max_concurrent_probes: default_max_concurrent_probes(),
        }
    }
}

/// Fallback policy when no account is usable
#[derive(Debug, Default, Deserialize)]
pub struct FallbackConfig {
    #[serde(default)]
    pub to_auto: bool,
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval() -> u64 {
    300
}

fn default_heartbeat_timeout() -> u64 {
    30
}

fn default_max_concurrent_probes() -> usize {
    4
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_probe_path() -> String {
    "/rest/user/settings".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Admin token resolution order:
    /// 1. ADMIN_TOKEN env var
    /// 2. admin_token_file path from config
    ///
    /// A missing admin token is a configuration error: the admin listener
    /// must never come up unauthenticated.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if !config.upstream.base_url.starts_with("http://")
            && !config.upstream.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream base_url must start with http:// or https://, got: {}",
                config.upstream.base_url
            )));
        }

        if config.upstream.request_timeout_secs == 0 {
            return Err(common::Error::Config(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        // Heartbeat/threshold constraints are the pool's rules; reject them
        // here so a bad file fails at startup, not at the first admin call.
        config
            .pool_settings()
            .validate()
            .map_err(|e| common::Error::Config(e.to_string()))?;

        // Resolve admin token: env var takes precedence over file
        if let Ok(token) = std::env::var("ADMIN_TOKEN") {
            config.server.admin_token = Some(Secret::new(token));
        } else if let Some(ref token_file) = config.server.admin_token_file {
            let token = std::fs::read_to_string(token_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read admin_token_file {}: {e}",
                    token_file.display()
                ))
            })?;
            let token = token.trim().to_owned();
            if !token.is_empty() {
                config.server.admin_token = Some(Secret::new(token));
            }
        }

        if config.server.admin_token.is_none() {
            return Err(common::Error::Config(
                "admin token required: set ADMIN_TOKEN or server.admin_token_file".into(),
            ));
        }

        Ok(config)
    }

    /// Initial runtime settings for the pool, from the static config.
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            heartbeat: HeartbeatSettings {
                enabled: self.heartbeat.enabled,
                interval_secs: self.heartbeat.interval_secs,
                timeout_secs: self.heartbeat.timeout_secs,
                max_concurrent_probes: self.heartbeat.max_concurrent_probes,
            },
            fallback_to_auto: self.fallback.to_auto,
            failure_threshold: self.pool.failure_threshold,
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("research-proxy.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn valid_toml() -> &'static str {
        r#"
[server]
listen_addr = "127.0.0.1:8080"
admin_listen_addr = "127.0.0.1:9090"

[upstream]
base_url = "https://upstream.example"

[pool]
credentials_path = "/var/lib/research-proxy/accounts.json"
"#
    }

    fn write_config(dir_name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(dir_name);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_valid_config_with_env_token() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let path = write_config("research-proxy-test-valid", valid_toml());

        unsafe { set_env("ADMIN_TOKEN", "admin-secret-1") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env("ADMIN_TOKEN") };

        assert_eq!(config.upstream.base_url, "https://upstream.example");
        assert_eq!(config.upstream.probe_path, "/rest/user/settings");
        assert_eq!(config.upstream.request_timeout_secs, 60);
        assert_eq!(config.server.max_connections, 1000);
        assert!(config.heartbeat.enabled);
        assert_eq!(config.heartbeat.interval_secs, 300);
        assert_eq!(config.heartbeat.timeout_secs, 30);
        assert_eq!(config.pool.failure_threshold, 3);
        assert!(!config.fallback.to_auto);
        assert_eq!(
            config.server.admin_token.as_ref().unwrap().expose(),
            "admin-secret-1"
        );
    }

    #[test]
    fn test_missing_admin_token_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let path = write_config("research-proxy-test-no-token", valid_toml());

        unsafe { remove_env("ADMIN_TOKEN") };
        let result = Config::load(&path);
        let err = format!("{}", result.unwrap_err());
        assert!(err.contains("admin token required"), "got: {err}");
    }

    #[test]
    fn test_admin_token_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = std::env::temp_dir().join("research-proxy-test-tokenfile");
        std::fs::create_dir_all(&dir).unwrap();
        let token_path = dir.join("admin_token");
        std::fs::write(&token_path, "file-token-456\n").unwrap();

        let toml_content = format!(
            r#"
[server]
listen_addr = "127.0.0.1:8080"
admin_listen_addr = "127.0.0.1:9090"
admin_token_file = "{}"

[upstream]
base_url = "https://upstream.example"

[pool]
credentials_path = "/tmp/accounts.json"
"#,
            token_path.display()
        );
        let config_path = dir.join("config.toml");
        std::fs::write(&config_path, &toml_content).unwrap();

        unsafe { remove_env("ADMIN_TOKEN") };
        let config = Config::load(&config_path).unwrap();
        assert_eq!(
            config.server.admin_token.as_ref().unwrap().expose(),
            "file-token-456"
        );
    }

    #[test]
    fn test_admin_token_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = std::env::temp_dir().join("research-proxy-test-token-override");
        std::fs::create_dir_all(&dir).unwrap();
        let token_path = dir.join("admin_token");
        std::fs::write(&token_path, "file-token").unwrap();

        let toml_content = format!(
            r#"
[server]
listen_addr = "127.0.0.1:8080"
admin_listen_addr = "127.0.0.1:9090"
admin_token_file = "{}"

[upstream]
base_url = "https://upstream.example"

[pool]
credentials_path = "/tmp/accounts.json"
"#,
            token_path.display()
        );
        let config_path = dir.join("config.toml");
        std::fs::write(&config_path, &toml_content).unwrap();

        unsafe { set_env("ADMIN_TOKEN", "env-token") };
        let config = Config::load(&config_path).unwrap();
        unsafe { remove_env("ADMIN_TOKEN") };
        assert_eq!(
            config.server.admin_token.as_ref().unwrap().expose(),
            "env-token"
        );
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let path = write_config("research-proxy-test-invalid", "not valid {{{{ toml");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let toml_content = r#"
[server]
listen_addr = "127.0.0.1:8080"
admin_listen_addr = "127.0.0.1:9090"

[upstream]
base_url = "upstream.example"

[pool]
credentials_path = "/tmp/accounts.json"
"#;
        let path = write_config("research-proxy-test-bad-url", toml_content);
        unsafe { set_env("ADMIN_TOKEN", "t") };
        let result = Config::load(&path);
        unsafe { remove_env("ADMIN_TOKEN") };

        let err = format!("{}", result.unwrap_err());
        assert!(err.contains("base_url must start with http"), "got: {err}");
    }

    #[test]
    fn test_heartbeat_timeout_not_less_than_interval_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let toml_content = r#"
[server]
listen_addr = "127.0.0.1:8080"
admin_listen_addr = "127.0.0.1:9090"

[upstream]
base_url = "https://upstream.example"

[pool]
credentials_path = "/tmp/accounts.json"

[heartbeat]
interval_secs = 30
timeout_secs = 30
"#;
        let path = write_config("research-proxy-test-hb-timeout", toml_content);
        unsafe { set_env("ADMIN_TOKEN", "t") };
        let result = Config::load(&path);
        unsafe { remove_env("ADMIN_TOKEN") };

        let err = format!("{}", result.unwrap_err());
        assert!(
            err.contains("timeout_secs must be less than interval_secs"),
            "got: {err}"
        );
    }

    #[test]
    fn test_zero_heartbeat_interval_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let toml_content = r#"
[server]
listen_addr = "127.0.0.1:8080"
admin_listen_addr = "127.0.0.1:9090"

[upstream]
base_url = "https://upstream.example"

[pool]
credentials_path = "/tmp/accounts.json"

[heartbeat]
interval_secs = 0
"#;
        let path = write_config("research-proxy-test-hb-zero", toml_content);
        unsafe { set_env("ADMIN_TOKEN", "t") };
        let result = Config::load(&path);
        unsafe { remove_env("ADMIN_TOKEN") };
        assert!(result.is_err(), "interval_secs = 0 must be rejected");
    }

    #[test]
    fn test_zero_failure_threshold_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let toml_content = r#"
[server]
listen_addr = "127.0.0.1:8080"
admin_listen_addr = "127.0.0.1:9090"

[upstream]
base_url = "https://upstream.example"

[pool]
credentials_path = "/tmp/accounts.json"
failure_threshold = 0
"#;
        let path = write_config("research-proxy-test-threshold-zero", toml_content);
        unsafe { set_env("ADMIN_TOKEN", "t") };
        let result = Config::load(&path);
        unsafe { remove_env("ADMIN_TOKEN") };
        assert!(result.is_err(), "failure_threshold = 0 must be rejected");
    }

    #[test]
    fn test_pool_settings_mirror_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let toml_content = r#"
[server]
listen_addr = "127.0.0.1:8080"
admin_listen_addr = "127.0.0.1:9090"

[upstream]
base_url = "https://upstream.example"

[pool]
credentials_path = "/tmp/accounts.json"
failure_threshold = 5

[heartbeat]
enabled = false
interval_secs = 120
timeout_secs = 15
max_concurrent_probes = 2

[fallback]
to_auto = true
"#;
        let path = write_config("research-proxy-test-mirror", toml_content);
        unsafe { set_env("ADMIN_TOKEN", "t") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env("ADMIN_TOKEN") };

        let settings = config.pool_settings();
        assert!(!settings.heartbeat.enabled);
        assert_eq!(settings.heartbeat.interval_secs, 120);
        assert_eq!(settings.heartbeat.timeout_secs, 15);
        assert_eq!(settings.heartbeat.max_concurrent_probes, 2);
        assert!(settings.fallback_to_auto);
        assert_eq!(settings.failure_threshold, 5);
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("research-proxy.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(
            path,
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONFIG_PATH env var"
        );
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_empty_token_file_yields_missing_token_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = std::env::temp_dir().join("research-proxy-test-empty-tokenfile");
        std::fs::create_dir_all(&dir).unwrap();
        let token_path = dir.join("admin_token");
        std::fs::write(&token_path, "  \n  ").unwrap();

        let toml_content = format!(
            r#"
[server]
listen_addr = "127.0.0.1:8080"
admin_listen_addr = "127.0.0.1:9090"
admin_token_file = "{}"

[upstream]
base_url = "https://upstream.example"

[pool]
credentials_path = "/tmp/accounts.json"
"#,
            token_path.display()
        );
        let config_path = dir.join("config.toml");
        std::fs::write(&config_path, &toml_content).unwrap();

        unsafe { remove_env("ADMIN_TOKEN") };
        let result = Config::load(&config_path);
        assert!(
            result.is_err(),
            "whitespace-only admin_token_file must leave the token missing"
        );
    }
}
