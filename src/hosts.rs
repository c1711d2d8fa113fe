use crate::config::HostsConfig;
use crate::dns::Family;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Hosts-file overlay. Exact entries map a lowercase host to one textual IP;
/// `*.domain.tld` entries match any name sharing the same registrable domain
/// (eTLD+1). The whole table is replaced on refresh.
pub struct Hosts {
    file: PathBuf,
    entries: RwLock<HashMap<String, String>>,
}

impl Hosts {
    /// The first refresh runs synchronously so the first query already sees
    /// a populated table.
    pub fn new(config: &HostsConfig) -> Arc<Self> {
        let hosts = Arc::new(Self {
            file: PathBuf::from(&config.hosts_file),
            entries: RwLock::new(HashMap::new()),
        });
        hosts.refresh();
        hosts
    }

    pub fn spawn_refresh_ticker(self: &Arc<Self>, interval: Duration) {
        let hosts = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the interval fires immediately; the constructor already
            // refreshed once
            ticker.tick().await;
            loop {
                ticker.tick().await;
                hosts.refresh();
            }
        });
    }

    pub fn get(&self, domain: &str, family: Family) -> Option<Vec<IpAddr>> {
        let raw = self.lookup(&domain.to_lowercase())?;
        let ips: Vec<IpAddr> = raw
            .iter()
            .filter_map(|ip| ip.parse::<IpAddr>().ok())
            .filter(|ip| family.matches(ip))
            .collect();
        if ips.is_empty() {
            None
        } else {
            Some(ips)
        }
    }

    fn lookup(&self, domain: &str) -> Option<Vec<String>> {
        let entries = self.entries.read().unwrap();
        if let Some(ip) = entries.get(domain) {
            return Some(vec![ip.clone()]);
        }

        let registrable = psl::domain_str(domain)?;
        for (host, ip) in entries.iter() {
            if let Some(base) = host.strip_prefix("*.") {
                if psl::domain_str(base) == Some(registrable) {
                    return Some(vec![ip.clone()]);
                }
            }
        }
        None
    }

    /// Re-read the hosts file and swap in the new table. On read failure the
    /// previous table is kept.
    pub fn refresh(&self) {
        let content = match std::fs::read_to_string(&self.file) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(
                    file = %self.file.display(),
                    error = %e,
                    "failed to read hosts file, keeping previous table"
                );
                return;
            }
        };

        let mut table = HashMap::new();
        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").replace('\t', " ");
            let mut fields = line.split_whitespace();
            let Some(ip) = fields.next() else { continue };
            if ip.parse::<IpAddr>().is_err() {
                continue;
            }
            // a line may carry several hosts, e.g.
            // "127.0.0.1 localhost localhost.localdomain"
            for host in fields {
                table.insert(host.to_lowercase(), ip.to_string());
            }
        }

        let records = table.len();
        *self.entries.write().unwrap() = table;
        tracing::debug!(file = %self.file.display(), records, "hosts table refreshed");
    }
}
