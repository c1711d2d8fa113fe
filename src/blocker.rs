use crate::config::BlockerConfig;
use crate::dns::cache::{Record, RecordCache};
use crate::stats::Stats;
use futures::future::join_all;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Run the blocklist pipeline: seed the inline entries, download missing
/// sources concurrently, then load every file in the source directory into
/// the cache as never-expiring blocked records. Whitelisted domains are
/// skipped; a domain already in the cache stays as-is (first list wins).
///
/// Failures along the way are logged, never fatal.
pub async fn perform_update(config: &BlockerConfig, cache: &RecordCache, stats: &Stats, force: bool) {
    let whitelist: HashSet<&str> = config.whitelist.iter().map(String::as_str).collect();

    for domain in &config.blocklist {
        insert_blocked(cache, stats, &whitelist, domain);
    }

    fetch_sources(config, force).await;

    if let Err(e) = load_sources(&config.source_dir, cache, stats, &whitelist).await {
        tracing::warn!(dir = %config.source_dir, error = %e, "failed to load blocklist sources");
    }

    tracing::debug!(domains = cache.len(), "blocklist update complete");
}

fn insert_blocked(
    cache: &RecordCache,
    stats: &Stats,
    whitelist: &HashSet<&str>,
    domain: &str,
) -> bool {
    if whitelist.contains(domain) || cache.exists(domain) {
        return false;
    }
    match cache.set(domain, Record::blocked()) {
        Ok(()) => {
            stats.add_blocked_domain();
            true
        }
        Err(e) => {
            tracing::warn!(domain, error = %e, "failed to insert blocked record");
            false
        }
    }
}

/// Download every source whose `<dir>/<name>.list` is missing (all of them
/// when `force` is set). Downloads run concurrently and settle together;
/// a failed download only costs its own list.
async fn fetch_sources(config: &BlockerConfig, force: bool) {
    if config.sources.is_empty() {
        return;
    }
    if let Err(e) = tokio::fs::create_dir_all(&config.source_dir).await {
        tracing::warn!(dir = %config.source_dir, error = %e, "failed to create source directory");
        return;
    }

    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .user_agent(concat!("sinkdns/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default();

    let downloads = config.sources.iter().filter_map(|source| {
        let path = Path::new(&config.source_dir).join(format!("{}.list", source.name));
        if path.exists() && !force {
            tracing::debug!(source = %source.name, "list already downloaded");
            return None;
        }
        let client = client.clone();
        let name = source.name.clone();
        let url = source.url.clone();
        Some(async move {
            tracing::debug!(source = %name, url = %url, "fetching blocklist");
            if let Err(e) = download_to_file(&client, &url, &path).await {
                tracing::warn!(source = %name, error = %e, "failed to download blocklist");
            }
        })
    });

    join_all(downloads).await;
}

async fn download_to_file(
    client: &reqwest::Client,
    url: &str,
    path: &Path,
) -> anyhow::Result<()> {
    let response = client.get(url).send().await?.error_for_status()?;
    let body = response.bytes().await?;

    // write to a sibling first so a torn download never shadows a good list
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn load_sources(
    dir: &str,
    cache: &RecordCache,
    stats: &Stats,
    whitelist: &HashSet<&str>,
) -> anyhow::Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let path = entry.path();
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let loaded = load_list(&content, cache, stats, whitelist);
                tracing::debug!(file = %path.display(), loaded, "loaded blocklist file");
            }
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "failed to read blocklist file")
            }
        }
    }
    Ok(())
}

/// Accepts both hosts-format lines (`0.0.0.0 ad.example`) and bare domains;
/// the second field wins when present.
fn load_list(
    content: &str,
    cache: &RecordCache,
    stats: &Stats,
    whitelist: &HashSet<&str>,
) -> usize {
    let mut loaded = 0;
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let first = fields.next();
        let Some(domain) = fields.next().or(first) else {
            continue;
        };
        if insert_blocked(cache, stats, whitelist, domain) {
            loaded += 1;
        }
    }
    loaded
}
