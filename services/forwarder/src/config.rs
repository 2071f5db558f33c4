//! Forwarder configuration.
//!
//! Built once at startup and never mutated. Values come from `RUDICS_*`
//! environment variables, optionally layered over a TOML file named by
//! `RUDICS_CONFIG_FILE`. Environment values win.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::proxy::{
    Backend, Backends, ClassifierConfig, ListenerConfig, PrefixPolicy, RelayConfig,
    DEFAULT_BUFFERED_MIN_BYTES, DEFAULT_LISTEN_BACKLOG, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_READ_BUFFER_SIZE,
};

/// Env var naming an optional TOML config file.
pub const CONFIG_FILE_VAR: &str = "RUDICS_CONFIG_FILE";

const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";
const DEFAULT_LISTEN_PORT: u16 = 40000;
const DEFAULT_ROUTE_A_HOST: &str = "127.0.0.1";
const DEFAULT_ROUTE_A_PORT: u16 = 40002;
const DEFAULT_ROUTE_B_HOST: &str = "127.0.0.1";
const DEFAULT_ROUTE_B_PORT: u16 = 40001;

const MIN_READ_BUFFER_SIZE: usize = 64;
const MAX_READ_BUFFER_SIZE: usize = 1 << 20;

/// Config file contents. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    listen_address: Option<String>,
    listen_port: Option<u16>,
    route_a_host: Option<String>,
    route_a_port: Option<u16>,
    route_b_host: Option<String>,
    route_b_port: Option<u16>,
    classification_prefix_policy: Option<String>,
    classification_min_bytes: Option<usize>,
    read_buffer_size: Option<usize>,
    classify_timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    idle_timeout_ms: Option<u64>,
    max_connections: Option<usize>,
    listen_backlog: Option<u32>,
    log_level: Option<String>,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config from {:?}", path))
    }

    fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }
}

/// Forwarder configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the RUDICS listener binds to.
    pub listen_addr: SocketAddr,

    /// Destinations for the two routes.
    pub backends: Backends,

    /// When the prefix rule is evaluated.
    pub prefix_policy: PrefixPolicy,

    /// Relay read buffer size in bytes.
    pub read_buffer_size: usize,

    /// Optional bound on time spent classifying.
    pub classify_timeout: Option<Duration>,

    /// Optional bound on backend connects.
    pub connect_timeout: Option<Duration>,

    /// Optional idle timeout while relaying.
    pub idle_timeout: Option<Duration>,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Listen backlog.
    pub listen_backlog: u32,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration using `lookup` in place of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = match lookup(CONFIG_FILE_VAR) {
            Some(path) => FileConfig::load(Path::new(&path))?,
            None => FileConfig::default(),
        };
        Self::resolve(file, lookup)
    }

    fn resolve<F>(file: FileConfig, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_address = lookup("RUDICS_LISTEN_ADDRESS")
            .or(file.listen_address)
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_string());
        let listen_ip: IpAddr = listen_address
            .parse()
            .with_context(|| format!("RUDICS_LISTEN_ADDRESS must be an IP address, got {listen_address:?}."))?;
        let listen_port = parse_var(&lookup, "RUDICS_LISTEN_PORT", "a port number")?
            .or(file.listen_port)
            .unwrap_or(DEFAULT_LISTEN_PORT);

        let route_a = Backend::new(
            lookup("RUDICS_ROUTE_A_HOST")
                .or(file.route_a_host)
                .unwrap_or_else(|| DEFAULT_ROUTE_A_HOST.to_string()),
            parse_var(&lookup, "RUDICS_ROUTE_A_PORT", "a port number")?
                .or(file.route_a_port)
                .unwrap_or(DEFAULT_ROUTE_A_PORT),
        );
        let route_b = Backend::new(
            lookup("RUDICS_ROUTE_B_HOST")
                .or(file.route_b_host)
                .unwrap_or_else(|| DEFAULT_ROUTE_B_HOST.to_string()),
            parse_var(&lookup, "RUDICS_ROUTE_B_PORT", "a port number")?
                .or(file.route_b_port)
                .unwrap_or(DEFAULT_ROUTE_B_PORT),
        );
        for (name, backend) in [("route_a", &route_a), ("route_b", &route_b)] {
            if backend.host.trim().is_empty() {
                bail!("{name} host must not be empty.");
            }
            if backend.port == 0 {
                bail!("{name} port must be non-zero.");
            }
        }

        let policy_name = lookup("RUDICS_CLASSIFICATION_PREFIX_POLICY")
            .or(file.classification_prefix_policy)
            .unwrap_or_else(|| PrefixPolicy::default().name().to_string());
        let min_bytes = parse_var(&lookup, "RUDICS_CLASSIFICATION_MIN_BYTES", "an integer")?
            .or(file.classification_min_bytes)
            .unwrap_or(DEFAULT_BUFFERED_MIN_BYTES);
        let prefix_policy = PrefixPolicy::from_name(&policy_name, min_bytes).with_context(|| {
            format!(
                "RUDICS_CLASSIFICATION_PREFIX_POLICY must be \"immediate\" or \"buffered\", got {policy_name:?}."
            )
        })?;

        let read_buffer_size = parse_var(&lookup, "RUDICS_READ_BUFFER_SIZE", "an integer (bytes)")?
            .or(file.read_buffer_size)
            .unwrap_or(DEFAULT_READ_BUFFER_SIZE)
            .clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);

        let classify_timeout = millis(
            parse_var(&lookup, "RUDICS_CLASSIFY_TIMEOUT_MS", "an integer (milliseconds)")?
                .or(file.classify_timeout_ms),
        );
        let connect_timeout = millis(
            parse_var(&lookup, "RUDICS_CONNECT_TIMEOUT_MS", "an integer (milliseconds)")?
                .or(file.connect_timeout_ms),
        );
        let idle_timeout = millis(
            parse_var(&lookup, "RUDICS_IDLE_TIMEOUT_MS", "an integer (milliseconds)")?
                .or(file.idle_timeout_ms),
        );

        let max_connections = parse_var(&lookup, "RUDICS_MAX_CONNECTIONS", "an integer")?
            .or(file.max_connections)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);
        let listen_backlog = parse_var(&lookup, "RUDICS_LISTEN_BACKLOG", "an integer")?
            .or(file.listen_backlog)
            .unwrap_or(DEFAULT_LISTEN_BACKLOG)
            .max(1);

        let log_level = lookup("RUDICS_LOG_LEVEL")
            .or(file.log_level)
            .unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr: SocketAddr::new(listen_ip, listen_port),
            backends: Backends { route_a, route_b },
            prefix_policy,
            read_buffer_size,
            classify_timeout,
            connect_timeout,
            idle_timeout,
            max_connections,
            listen_backlog,
            log_level,
        })
    }

    /// Listener settings derived from this configuration.
    pub fn listener_config(&self) -> ListenerConfig {
        let mut config = ListenerConfig::new(self.listen_addr, self.backends.clone());
        config.backlog = self.listen_backlog;
        config.max_connections = self.max_connections;
        config.connect_timeout = self.connect_timeout;
        config.classifier = ClassifierConfig {
            policy: self.prefix_policy,
            timeout: self.classify_timeout,
            ..ClassifierConfig::default()
        };
        config.relay = RelayConfig {
            buffer_size: self.read_buffer_size,
            idle_timeout: self.idle_timeout,
        };
        config
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, expected: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(name)
        .map(|v| v.trim().parse())
        .transpose()
        .with_context(|| format!("{name} must be {expected}."))
}

/// Zero disables a timeout.
fn millis(value: Option<u64>) -> Option<Duration> {
    value.filter(|ms| *ms > 0).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:40000".parse().unwrap());
        assert_eq!(config.backends.route_a, Backend::new("127.0.0.1", 40002));
        assert_eq!(config.backends.route_b, Backend::new("127.0.0.1", 40001));
        assert_eq!(config.prefix_policy, PrefixPolicy::Immediate);
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert!(config.classify_timeout.is_none());
        assert!(config.connect_timeout.is_none());
        assert!(config.idle_timeout.is_none());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("RUDICS_LISTEN_ADDRESS", "::"),
            ("RUDICS_LISTEN_PORT", "5000"),
            ("RUDICS_ROUTE_A_HOST", "ppp.internal"),
            ("RUDICS_ROUTE_B_PORT", "6001"),
            ("RUDICS_CLASSIFICATION_PREFIX_POLICY", "buffered"),
            ("RUDICS_CLASSIFICATION_MIN_BYTES", "12"),
            ("RUDICS_READ_BUFFER_SIZE", "16"),
            ("RUDICS_IDLE_TIMEOUT_MS", "30000"),
            ("RUDICS_CONNECT_TIMEOUT_MS", "0"),
        ]))
        .unwrap();

        assert_eq!(config.listen_addr, "[::]:5000".parse().unwrap());
        assert_eq!(config.backends.route_a.host, "ppp.internal");
        assert_eq!(config.backends.route_b.port, 6001);
        assert_eq!(
            config.prefix_policy,
            PrefixPolicy::Buffered { min_bytes: 12 }
        );
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
        assert!(config.connect_timeout.is_none());
    }

    #[test]
    fn test_invalid_values() {
        let err = Config::from_lookup(lookup_from(&[("RUDICS_LISTEN_PORT", "forty")])).unwrap_err();
        assert!(err.to_string().contains("RUDICS_LISTEN_PORT"));

        let err = Config::from_lookup(lookup_from(&[(
            "RUDICS_CLASSIFICATION_PREFIX_POLICY",
            "eventually",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("RUDICS_CLASSIFICATION_PREFIX_POLICY"));

        let err = Config::from_lookup(lookup_from(&[("RUDICS_ROUTE_A_PORT", "0")])).unwrap_err();
        assert!(err.to_string().contains("route_a port"));

        assert!(Config::from_lookup(lookup_from(&[("RUDICS_LISTEN_ADDRESS", "localhost")])).is_err());
    }

    #[test]
    fn test_file_layer() {
        let file = FileConfig::parse(
            r#"
            listen_port = 41000
            route_b_host = "10.0.0.5"
            classification_prefix_policy = "buffered"
            log_level = "debug"
            "#,
        )
        .unwrap();

        let config = Config::resolve(file, lookup_from(&[("RUDICS_LOG_LEVEL", "warn")])).unwrap();
        assert_eq!(config.listen_addr.port(), 41000);
        assert_eq!(config.backends.route_b, Backend::new("10.0.0.5", 40001));
        assert_eq!(
            config.prefix_policy,
            PrefixPolicy::Buffered {
                min_bytes: DEFAULT_BUFFERED_MIN_BYTES
            }
        );
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_file_rejects_unknown_keys() {
        assert!(FileConfig::parse("listen_prot = 1").is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_lookup(lookup_from(&[(
            CONFIG_FILE_VAR,
            "/nonexistent/rudics-forwarder.toml",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }

    #[test]
    fn test_listener_config() {
        let config = Config::from_lookup(lookup_from(&[
            ("RUDICS_MAX_CONNECTIONS", "50"),
            ("RUDICS_CLASSIFY_TIMEOUT_MS", "250"),
        ]))
        .unwrap();
        let listener = config.listener_config();

        assert_eq!(listener.bind_addr, config.listen_addr);
        assert_eq!(listener.max_connections, 50);
        assert_eq!(
            listener.classifier.timeout,
            Some(Duration::from_millis(250))
        );
        assert_eq!(listener.relay.buffer_size, DEFAULT_READ_BUFFER_SIZE);
    }
}
