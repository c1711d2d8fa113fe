// Blocklist pipeline tests: download from an in-process HTTP server, load
// into the cache, honor the whitelist.

use axum::routing::get;
use axum::Router;
use sinkdns::blocker;
use sinkdns::config::{BlockSource, BlockerConfig};
use sinkdns::dns::cache::RecordCache;
use sinkdns::stats::Stats;
use std::net::SocketAddr;

async fn serve_list(body: &'static str) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/list", get(move || async move { body }));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn blocker_config(dir: &tempfile::TempDir, sources: Vec<BlockSource>) -> BlockerConfig {
    BlockerConfig {
        enable: true,
        sources,
        source_dir: dir.path().to_string_lossy().to_string(),
        blocklist: Vec::new(),
        whitelist: Vec::new(),
    }
}

#[tokio::test]
async fn test_download_parse_and_whitelist() {
    let addr = serve_list("# ad servers\n0.0.0.0 ads.test\n0.0.0.0 good.test\ntracker.test\n").await;
    let dir = tempfile::tempdir().unwrap();

    let mut config = blocker_config(
        &dir,
        vec![BlockSource {
            name: "ads".to_string(),
            url: format!("http://{addr}/list"),
        }],
    );
    config.blocklist = vec!["inline.test".to_string()];
    config.whitelist = vec!["good.test".to_string()];

    let cache = RecordCache::new();
    let stats = Stats::new();
    blocker::perform_update(&config, &cache, &stats, false).await;

    assert!(dir.path().join("ads.list").exists());
    assert!(cache.get("inline.test").unwrap().is_blocked());
    assert!(cache.get("ads.test").unwrap().is_blocked());
    assert!(cache.get("tracker.test").unwrap().is_blocked());
    // whitelisted even though the downloaded list carries it
    assert!(!cache.exists("good.test"));
    assert_eq!(stats.domain_blocked(), 3);
}

#[tokio::test]
async fn test_existing_list_not_redownloaded() {
    let addr = serve_list("0.0.0.0 served.test\n").await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("ads.list"), "0.0.0.0 prewritten.test\n").unwrap();

    let config = blocker_config(
        &dir,
        vec![BlockSource {
            name: "ads".to_string(),
            url: format!("http://{addr}/list"),
        }],
    );

    let cache = RecordCache::new();
    let stats = Stats::new();
    blocker::perform_update(&config, &cache, &stats, false).await;

    assert!(cache.exists("prewritten.test"));
    assert!(!cache.exists("served.test"));
}

#[tokio::test]
async fn test_force_redownloads_existing_list() {
    let addr = serve_list("0.0.0.0 served.test\n").await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("ads.list"), "0.0.0.0 prewritten.test\n").unwrap();

    let config = blocker_config(
        &dir,
        vec![BlockSource {
            name: "ads".to_string(),
            url: format!("http://{addr}/list"),
        }],
    );

    let cache = RecordCache::new();
    let stats = Stats::new();
    blocker::perform_update(&config, &cache, &stats, true).await;

    assert!(cache.exists("served.test"));
    assert!(!cache.exists("prewritten.test"));
}

#[tokio::test]
async fn test_failed_download_does_not_abort_pipeline() {
    let dir = tempfile::tempdir().unwrap();

    let mut config = blocker_config(
        &dir,
        vec![BlockSource {
            name: "dead".to_string(),
            // nothing listens here
            url: "http://127.0.0.1:1/list".to_string(),
        }],
    );
    config.blocklist = vec!["inline.test".to_string()];

    let cache = RecordCache::new();
    let stats = Stats::new();
    blocker::perform_update(&config, &cache, &stats, false).await;

    assert!(cache.get("inline.test").unwrap().is_blocked());
    assert!(!dir.path().join("dead.list").exists());
}
