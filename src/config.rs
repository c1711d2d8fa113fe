use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Log level used when RUST_LOG is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub hosts: HostsConfig,

    #[serde(default)]
    pub blocker: BlockerConfig,

    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address for both UDP and TCP DNS.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResolverConfig {
    /// Ordered upstream list, `ip` or `ip:port` (port defaults to 53).
    #[serde(default = "default_nameservers")]
    pub nameservers: Vec<String>,

    /// Milliseconds between racer launches.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Per-query timeout (seconds).
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Default cache TTL (seconds), also used for sinkhole and hosts replies.
    #[serde(default = "default_ttl")]
    pub ttl: u32,

    /// Reply NXDOMAIN for blocked domains instead of a sinkhole address.
    #[serde(default)]
    pub nxdomain_on_block: bool,

    #[serde(default)]
    pub doh: DohConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DohConfig {
    #[serde(default)]
    pub enable: bool,

    #[serde(default = "default_doh_endpoint")]
    pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostsConfig {
    #[serde(default = "default_true")]
    pub enable: bool,

    #[serde(default = "default_hosts_file")]
    pub hosts_file: String,

    /// Seconds between hosts table refreshes.
    #[serde(default = "default_hosts_refresh")]
    pub refresh_interval: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BlockerConfig {
    #[serde(default = "default_true")]
    pub enable: bool,

    /// Named blocklist downloads.
    #[serde(default)]
    pub sources: Vec<BlockSource>,

    /// Where downloaded lists are kept between runs.
    #[serde(default = "default_source_dir")]
    pub source_dir: String,

    /// Inline domains to block.
    #[serde(default)]
    pub blocklist: Vec<String>,

    /// Domains never inserted as blocked, whatever the lists say.
    #[serde(default)]
    pub whitelist: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BlockSource {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enable: bool,

    #[serde(default = "default_api_bind_addr")]
    pub bind_addr: SocketAddr,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 53))
}

fn default_nameservers() -> Vec<String> {
    vec!["1.1.1.1:53".to_string(), "1.0.0.1:53".to_string()]
}

fn default_interval_ms() -> u64 {
    200
}

fn default_timeout() -> u64 {
    5
}

fn default_ttl() -> u32 {
    600
}

fn default_doh_endpoint() -> String {
    "https://cloudflare-dns.com/dns-query".to_string()
}

fn default_true() -> bool {
    true
}

fn default_hosts_file() -> String {
    "/etc/hosts".to_string()
}

fn default_hosts_refresh() -> u64 {
    900
}

fn default_source_dir() -> String {
    "sources".to_string()
}

fn default_api_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerConfig::default(),
            resolver: ResolverConfig::default(),
            hosts: HostsConfig::default(),
            blocker: BlockerConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            nameservers: default_nameservers(),
            interval_ms: default_interval_ms(),
            timeout: default_timeout(),
            ttl: default_ttl(),
            nxdomain_on_block: false,
            doh: DohConfig::default(),
        }
    }
}

impl Default for HostsConfig {
    fn default() -> Self {
        Self {
            enable: true,
            hosts_file: default_hosts_file(),
            refresh_interval: default_hosts_refresh(),
        }
    }
}

impl Default for BlockerConfig {
    fn default() -> Self {
        Self {
            enable: true,
            sources: Vec::new(),
            source_dir: default_source_dir(),
            blocklist: Vec::new(),
            whitelist: Vec::new(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enable: true,
            bind_addr: default_api_bind_addr(),
        }
    }
}

/// `ip` or `ip:port`; port defaults to 53.
pub fn parse_nameserver(raw: &str) -> Option<SocketAddr> {
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Some(addr);
    }
    raw.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, 53))
}

impl ResolverConfig {
    pub fn upstream_addrs(&self) -> Vec<SocketAddr> {
        self.nameservers
            .iter()
            .filter_map(|ns| match parse_nameserver(ns) {
                Some(addr) => Some(addr),
                None => {
                    tracing::warn!(nameserver = %ns, "ignoring unparseable nameserver");
                    None
                }
            })
            .collect()
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.server.bind_addr.port() == 0 {
            anyhow::bail!("server listen port cannot be 0");
        }

        if self.resolver.nameservers.is_empty() {
            anyhow::bail!("resolver.nameservers cannot be empty");
        }

        for ns in &self.resolver.nameservers {
            if parse_nameserver(ns).is_none() {
                anyhow::bail!("invalid nameserver '{}': expected ip or ip:port", ns);
            }
        }

        if self.resolver.doh.enable && self.resolver.doh.endpoint.is_empty() {
            anyhow::bail!("resolver.doh.endpoint must be set when DoH is enabled");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.bind_addr.port(), 53);
        assert_eq!(config.resolver.nameservers.len(), 2);
        assert_eq!(config.resolver.interval_ms, 200);
        assert_eq!(config.resolver.ttl, 600);
        assert!(!config.resolver.nxdomain_on_block);
        assert!(!config.resolver.doh.enable);
        assert!(config.hosts.enable);
        assert_eq!(config.hosts.refresh_interval, 900);
        assert!(config.blocker.enable);
        assert!(config.api.enable);
    }

    #[test]
    fn test_full_config_parses() {
        let raw = r#"
log_level = "debug"

[server]
bind_addr = "127.0.0.1:5353"

[resolver]
nameservers = ["9.9.9.9", "8.8.8.8:53"]
interval_ms = 50
timeout = 2
ttl = 120
nxdomain_on_block = true

[resolver.doh]
enable = true
endpoint = "https://dns.example/dns-query"

[hosts]
enable = false
hosts_file = "/tmp/hosts"
refresh_interval = 60

[blocker]
source_dir = "/tmp/sources"
blocklist = ["ads.example.com"]
whitelist = ["good.example.com"]

[[blocker.sources]]
name = "ads"
url = "https://example.com/hosts.txt"

[api]
bind_addr = "127.0.0.1:9090"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.resolver.nameservers[0], "9.9.9.9");
        assert!(config.resolver.nxdomain_on_block);
        assert!(config.resolver.doh.enable);
        assert!(!config.hosts.enable);
        assert_eq!(config.blocker.sources.len(), 1);
        assert_eq!(config.blocker.sources[0].name, "ads");
    }

    #[test]
    fn test_nameserver_port_defaults_to_53() {
        assert_eq!(
            parse_nameserver("9.9.9.9"),
            Some(SocketAddr::from(([9, 9, 9, 9], 53)))
        );
        assert_eq!(
            parse_nameserver("9.9.9.9:5353"),
            Some(SocketAddr::from(([9, 9, 9, 9], 5353)))
        );
        assert_eq!(
            parse_nameserver("[2606:4700:4700::1111]:53").map(|a| a.port()),
            Some(53)
        );
        assert!(parse_nameserver("not-an-ip").is_none());
    }

    #[test]
    fn test_validate_rejects_bad_nameserver() {
        let mut config = Config::default();
        config.resolver.nameservers = vec!["dns.example.com".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_doh_endpoint() {
        let mut config = Config::default();
        config.resolver.doh.enable = true;
        config.resolver.doh.endpoint = String::new();
        assert!(config.validate().is_err());
    }
}
