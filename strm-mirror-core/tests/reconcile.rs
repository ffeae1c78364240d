use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use strm_mirror_core::{
    MirrorMapper, MirrorService, ReconcileSettings, SyncExecutor, TaskExit,
};
use tokio::time::{Instant, sleep};

fn stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default()
        .to_string()
}

fn fast_settings() -> ReconcileSettings {
    ReconcileSettings {
        debounce_window: Duration::from_millis(50),
        full_sync_interval: Duration::from_secs(3600),
        full_sync_retry_interval: Duration::from_millis(50),
        max_path_retries: 3,
    }
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(20)).await;
    }
}

fn write(path: &Path, contents: &str) {
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, contents).expect("write");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recorded_changes_reach_the_mirror() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source: PathBuf = dir.path().join("media");
    let dest: PathBuf = dir.path().join("dest");
    fs::create_dir_all(&source).expect("source");
    fs::create_dir_all(&dest).expect("dest");
    write(&source.join("old/BASE-001.strm"), "baseline");

    let mapper = MirrorMapper::new(&source, &dest, "strm", Arc::new(stem));
    let executor = Arc::new(SyncExecutor::new(mapper));
    let service =
        MirrorService::new(executor, &source, "strm", fast_settings()).without_watch();
    let aggregator = service.aggregator();
    let running = service.start().expect("start");

    let baseline = dest.join("old/BASE-001/BASE-001.strm");
    eventually("baseline full sync", || baseline.is_file()).await;

    let created = source.join("new/NEW-001.strm");
    write(&created, "fresh");
    aggregator.record_changed(created.clone());
    let mirrored = dest.join("new/NEW-001/NEW-001.strm");
    eventually("incremental update", || mirrored.is_file()).await;

    fs::remove_file(&created).expect("remove");
    aggregator.record_deleted(created);
    eventually("incremental delete", || !dest.join("new").exists()).await;
    assert!(baseline.is_file());

    let report = running.shutdown().await;
    assert_eq!(report.exit_of("reconcile"), Some(&TaskExit::Clean));
    assert!(report.is_clean());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn baseline_waits_for_missing_root() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("media");
    let dest = dir.path().join("dest");
    fs::create_dir_all(&source).expect("source");
    write(&source.join("x/LATE-001.strm"), "late");

    let mapper = MirrorMapper::new(&source, &dest, "strm", Arc::new(stem));
    let service = MirrorService::new(
        Arc::new(SyncExecutor::new(mapper)),
        &source,
        "strm",
        fast_settings(),
    )
    .without_watch();
    let running = service.start().expect("start");

    sleep(Duration::from_millis(150)).await;
    assert!(!dest.exists());

    fs::create_dir_all(&dest).expect("dest appears");
    let mirrored = dest.join("x/LATE-001/LATE-001.strm");
    eventually("baseline after retry", || mirrored.is_file()).await;

    assert!(running.shutdown().await.is_clean());
}
