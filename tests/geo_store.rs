//! 地理数据库存储：准备、校验替换、并发可见性与刷新调度

mod common;

use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

use common::{geoip_db, resolver, Reply, ScriptedFetcher};
use georoute::common::GeoErrorKind;
use georoute::router::fetch::Fetcher;
use georoute::router::geoip::GeoIpReader;
use georoute::router::rules::RegionLookup;
use georoute::router::scheduler::{dispatch, RefreshRequest, RefreshScheduler, RefreshTarget};
use georoute::router::store::{GeoStore, GeoUpdateOptions, TEMP_SUFFIX};

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn geoip_store(dir: &Path, fetcher: Arc<dyn Fetcher>) -> Arc<GeoStore<GeoIpReader>> {
    let options = GeoUpdateOptions {
        path: Some(dir.join("geoip.db").display().to_string()),
        download_url: Some("https://example.com/geoip.db".to_string()),
        ..Default::default()
    };
    Arc::new(GeoStore::new(
        options,
        &resolver(dir),
        fetcher,
        CancellationToken::new(),
    ))
}

fn temp_path(store: &GeoStore<GeoIpReader>) -> std::path::PathBuf {
    let mut name = store.path().as_os_str().to_owned();
    name.push(TEMP_SUFFIX);
    name.into()
}

#[tokio::test]
async fn prepare_downloads_missing_database_with_one_retry() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher::new(vec![Reply::Fail, Reply::Bytes(geoip_db("cn"))]);
    let store = geoip_store(dir.path(), fetcher.clone());

    let loaded = store.prepare().await.unwrap();
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(fetcher.urls()[0], "https://example.com/geoip.db");
    assert_eq!(loaded.codes, vec!["cn".to_string()]);
    assert_eq!(loaded.source_path, store.path());
    assert_eq!(store.lookup_region(ip("1.2.3.4")).as_deref(), Some("cn"));
    assert_eq!(store.lookup_region(ip("200.1.1.1")), None);
}

#[tokio::test]
async fn prepare_surfaces_last_error_after_three_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher::new(vec![
        Reply::Fail,
        Reply::Fail,
        Reply::Fail,
        Reply::Bytes(geoip_db("cn")),
    ]);
    let store = geoip_store(dir.path(), fetcher.clone());

    let err = store.prepare().await.unwrap_err();
    assert_eq!(err.kind(), GeoErrorKind::Download);
    assert_eq!(fetcher.calls(), 3);
    assert!(!store.path().exists());
    assert!(store.current().is_none());
}

#[tokio::test]
async fn prepare_stops_retrying_when_detour_is_missing() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher::new(vec![
        Reply::NoDetour,
        Reply::Bytes(geoip_db("cn")),
        Reply::Bytes(geoip_db("cn")),
    ]);
    let store = geoip_store(dir.path(), fetcher.clone());

    let err = store.prepare().await.unwrap_err();
    assert_eq!(err.kind(), GeoErrorKind::DetourNotFound);
    assert!(err.is_permanent());
    assert_eq!(fetcher.calls(), 1);
    assert!(!store.path().exists());
    assert!(store.current().is_none());
}

#[tokio::test]
async fn prepare_uses_existing_file_without_network() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("geoip.db"), geoip_db("cn")).unwrap();
    let fetcher = ScriptedFetcher::new(vec![]);
    let store = geoip_store(dir.path(), fetcher.clone());

    store.prepare().await.unwrap();
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn directory_path_fails_without_fetch() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("geoip.db")).unwrap();
    let fetcher = ScriptedFetcher::new(vec![Reply::Bytes(geoip_db("cn"))]);
    let store = geoip_store(dir.path(), fetcher.clone());

    let err = store.prepare().await.unwrap_err();
    assert_eq!(err.kind(), GeoErrorKind::Configuration);
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn corrupt_existing_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("geoip.db"), b"garbage").unwrap();
    let store = geoip_store(dir.path(), ScriptedFetcher::new(vec![]));

    let err = store.prepare().await.unwrap_err();
    assert_eq!(err.kind(), GeoErrorKind::CorruptDatabase);
}

#[tokio::test]
async fn empty_file_is_treated_as_missing() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("geoip.db"), b"").unwrap();
    let fetcher = ScriptedFetcher::new(vec![Reply::Bytes(geoip_db("cn"))]);
    let store = geoip_store(dir.path(), fetcher.clone());

    store.prepare().await.unwrap();
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn download_then_swap_replaces_file_and_reader() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("geoip.db"), geoip_db("cn")).unwrap();
    let fetcher = ScriptedFetcher::new(vec![Reply::Bytes(geoip_db("us"))]);
    let store = geoip_store(dir.path(), fetcher.clone());
    let before = store.prepare().await.unwrap();

    let after = store.download_then_swap(TEMP_SUFFIX).await.unwrap();
    assert!(after.generation > before.generation);
    assert_eq!(after.source_path, store.path());
    assert_eq!(store.lookup_region(ip("1.2.3.4")).as_deref(), Some("us"));
    assert_eq!(std::fs::read(store.path()).unwrap(), geoip_db("us"));
    assert!(!temp_path(&store).exists());
}

#[tokio::test]
async fn corrupt_download_keeps_current_state() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("geoip.db"), geoip_db("cn")).unwrap();
    let fetcher = ScriptedFetcher::new(vec![Reply::Bytes(b"not a database".to_vec())]);
    let store = geoip_store(dir.path(), fetcher.clone());
    let before = store.prepare().await.unwrap();

    let err = store.download_then_swap(TEMP_SUFFIX).await.unwrap_err();
    assert_eq!(err.kind(), GeoErrorKind::CorruptDatabase);
    assert!(Arc::ptr_eq(&before, &store.current().unwrap()));
    assert_eq!(std::fs::read(store.path()).unwrap(), geoip_db("cn"));
    assert!(!temp_path(&store).exists());
}

#[tokio::test]
async fn failed_download_removes_temp_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("geoip.db"), geoip_db("cn")).unwrap();
    let store = geoip_store(dir.path(), ScriptedFetcher::new(vec![Reply::Fail]));
    let before = store.prepare().await.unwrap();

    let err = store.download_then_swap(TEMP_SUFFIX).await.unwrap_err();
    assert_eq!(err.kind(), GeoErrorKind::Download);
    assert!(Arc::ptr_eq(&before, &store.current().unwrap()));
    assert!(!temp_path(&store).exists());
}

#[tokio::test]
async fn stale_temp_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("geoip.db"), geoip_db("cn")).unwrap();
    std::fs::write(dir.path().join("geoip.db.tmp"), b"leftover").unwrap();
    let store = geoip_store(
        dir.path(),
        ScriptedFetcher::new(vec![Reply::Bytes(geoip_db("jp"))]),
    );
    store.prepare().await.unwrap();

    store.download_then_swap(TEMP_SUFFIX).await.unwrap();
    assert_eq!(store.lookup_region(ip("1.2.3.4")).as_deref(), Some("jp"));
}

#[tokio::test]
async fn reload_of_missing_file_is_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = geoip_store(dir.path(), ScriptedFetcher::new(vec![]));
    let err = store.reload().await.unwrap_err();
    assert_eq!(err.kind(), GeoErrorKind::MissingResource);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_always_see_a_complete_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let cn = dir.path().join("cn.db");
    let us = dir.path().join("us.db");
    std::fs::write(&cn, geoip_db("cn")).unwrap();
    std::fs::write(&us, geoip_db("us")).unwrap();
    std::fs::write(dir.path().join("geoip.db"), geoip_db("cn")).unwrap();

    let store = geoip_store(dir.path(), ScriptedFetcher::new(vec![]));
    store.prepare().await.unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let mut readers = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        let stop = stop.clone();
        readers.push(tokio::spawn(async move {
            let mut seen = 0usize;
            while !stop.load(Ordering::SeqCst) {
                let snapshot = store.current().unwrap();
                let region = snapshot.reader.lookup("1.2.3.4".parse().unwrap()).unwrap();
                assert_eq!(snapshot.codes, vec![region]);
                seen += 1;
                tokio::task::yield_now().await;
            }
            seen
        }));
    }

    for i in 0..20 {
        let path = if i % 2 == 0 { &us } else { &cn };
        store.swap(path).await.unwrap();
    }
    stop.store(true, Ordering::SeqCst);
    for reader in readers {
        assert!(reader.await.unwrap() > 0);
    }
}

#[tokio::test]
async fn concurrent_triggers_run_a_single_refresh() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("geoip.db"), geoip_db("cn")).unwrap();
    let fetcher = ScriptedFetcher::slow(
        vec![Reply::Bytes(geoip_db("us")), Reply::Bytes(geoip_db("jp"))],
        Duration::from_millis(200),
    );
    let store = geoip_store(dir.path(), fetcher.clone());
    store.prepare().await.unwrap();

    let target: Arc<dyn RefreshTarget> = store.clone();
    let first = dispatch(&target, RefreshRequest::Update).expect("lock is free");
    for _ in 0..4 {
        assert!(dispatch(&target, RefreshRequest::Update).is_none());
        assert!(dispatch(&target, RefreshRequest::Reload).is_none());
    }
    first.await.unwrap();

    let stats = store.refresh_lock().stats();
    assert_eq!(stats.cycles_started, 1);
    assert_eq!(stats.peak_concurrent, 1);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(store.lookup_region(ip("1.2.3.4")).as_deref(), Some("us"));
}

#[tokio::test]
async fn stale_file_triggers_one_update_before_first_tick() {
    let dir = tempfile::tempdir().unwrap();
    let live = dir.path().join("geoip.db");
    std::fs::write(&live, geoip_db("cn")).unwrap();
    let file = std::fs::File::options().write(true).open(&live).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(2 * 3600))
        .unwrap();
    drop(file);

    let fetcher = ScriptedFetcher::new(vec![Reply::Bytes(geoip_db("us"))]);
    let cancel = CancellationToken::new();
    let options = GeoUpdateOptions {
        path: Some(live.display().to_string()),
        auto_update_interval: Duration::from_secs(3600),
        watch: false,
        ..Default::default()
    };
    let store = Arc::new(GeoStore::<GeoIpReader>::new(
        options,
        &resolver(dir.path()),
        fetcher.clone(),
        cancel.clone(),
    ));
    store.prepare().await.unwrap();

    let scheduler = RefreshScheduler::start(store.clone(), cancel.clone());
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.lookup_region(ip("1.2.3.4")).as_deref() != Some("us") {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("startup refresh finished");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(fetcher.calls(), 1);
    assert_eq!(store.refresh_lock().stats().cycles_started, 1);
    cancel.cancel();
    scheduler.join().await;
}

#[tokio::test]
async fn fresh_file_does_not_trigger_update() {
    let dir = tempfile::tempdir().unwrap();
    let live = dir.path().join("geoip.db");
    std::fs::write(&live, geoip_db("cn")).unwrap();

    let fetcher = ScriptedFetcher::new(vec![]);
    let cancel = CancellationToken::new();
    let options = GeoUpdateOptions {
        path: Some(live.display().to_string()),
        auto_update_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let store = Arc::new(GeoStore::<GeoIpReader>::new(
        options,
        &resolver(dir.path()),
        fetcher.clone(),
        cancel.clone(),
    ));
    store.prepare().await.unwrap();

    let scheduler = RefreshScheduler::start(store.clone(), cancel.clone());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fetcher.calls(), 0);
    cancel.cancel();
    scheduler.join().await;
}
