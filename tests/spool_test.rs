//! End-to-end delivery over a spool directory
//!
//! Each test builds a throwaway spool tree, runs one subscription for a short
//! while and inspects what landed in the output directory.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use filefeed::config::{DeliveryMode, InvokeConfig, SubscriptionConfig};
use filefeed::delivery::{DeliveryEngine, DeliverySource, EngineSettings, LoopExit, RunReport};
use filefeed::notify::TracingNotifier;
use filefeed::session::spool::SpoolTransport;
use filefeed::session::Credentials;
use filefeed::shutdown;

fn publish(root: &Path, group: &str, file_type: &str, name: &str, content: &str) {
    let dir = root.join(group).join(file_type);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(name), content).unwrap();
}

fn settings() -> EngineSettings {
    EngineSettings {
        credentials: Credentials {
            user: "tester".to_string(),
            password: None,
        },
        reconnect_delay: Duration::from_millis(50),
        tick: Duration::from_millis(20),
        pending_capacity: 64,
    }
}

async fn run_for(config: SubscriptionConfig, spool: &Path, source: DeliverySource, period: Duration) -> RunReport {
    let engine = DeliveryEngine::new(
        config,
        Arc::new(SpoolTransport::new(spool.to_path_buf())),
        Arc::new(TracingNotifier),
        settings(),
    )
    .unwrap();

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        tokio::time::sleep(period).await;
        trigger.trigger();
    });
    engine.run(source, shutdown).await.unwrap()
}

#[tokio::test]
async fn test_pull_delivers_published_files() {
    let spool = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    publish(spool.path(), "dev", "images", "a.dat", "alpha");
    publish(spool.path(), "dev", "images", "b.dat", "bravo");

    let mut config = SubscriptionConfig::new(DeliveryMode::Pull, "dev", Some("images"), out.path().to_path_buf());
    config.poll_interval_ms = 50;

    let report = run_for(config, spool.path(), DeliverySource::Pull, Duration::from_millis(300)).await;

    assert_eq!(report.exit, LoopExit::Interrupted);
    assert_eq!(report.delivered, 2);
    assert_eq!(report.errors, 0);
    assert_eq!(fs::read_to_string(out.path().join("a.dat")).unwrap(), "alpha");
    assert_eq!(fs::read_to_string(out.path().join("b.dat")).unwrap(), "bravo");
}

#[tokio::test]
async fn test_pull_restart_resumes_from_saved_position() {
    let spool = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    publish(spool.path(), "dev", "images", "a.dat", "alpha");

    let mut config = SubscriptionConfig::new(DeliveryMode::Pull, "dev", Some("images"), out.path().to_path_buf());
    config.poll_interval_ms = 50;
    config.restart = true;

    let first = run_for(config.clone(), spool.path(), DeliverySource::Pull, Duration::from_millis(200)).await;
    assert_eq!(first.delivered, 1);

    // A new run must not re-deliver what the saved position already covers
    fs::remove_file(out.path().join("a.dat")).unwrap();
    let second = run_for(config, spool.path(), DeliverySource::Pull, Duration::from_millis(200)).await;
    assert_eq!(second.delivered, 0);
    assert!(!out.path().join("a.dat").exists());
}

#[tokio::test]
async fn test_push_picks_up_files_published_while_running() {
    let spool = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    publish(spool.path(), "dev", "logs", "old.log", "before");

    let transport = SpoolTransport::new(spool.path().to_path_buf());
    let source = transport.notifications("dev", "logs", Duration::from_millis(20), false);
    let config = SubscriptionConfig::new(DeliveryMode::Push, "dev", Some("logs"), out.path().to_path_buf());

    let publisher_root = spool.path().to_path_buf();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        publish(&publisher_root, "dev", "logs", "new.log", "after");
    });

    let report = run_for(config, spool.path(), DeliverySource::Push(Box::new(source)), Duration::from_millis(500)).await;

    assert_eq!(report.delivered, 1);
    assert!(out.path().join("new.log").exists());
    assert!(!out.path().join("old.log").exists());
}

#[tokio::test]
async fn test_query_delivers_across_types() {
    let spool = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    fs::create_dir_all(spool.path().join("dev").join("logs")).unwrap();
    fs::create_dir_all(spool.path().join("dev").join("images")).unwrap();

    let transport = SpoolTransport::new(spool.path().to_path_buf());
    let source = transport.query("dev", Vec::new(), Duration::from_millis(20));
    let config = SubscriptionConfig::new(DeliveryMode::Query, "dev", None, out.path().to_path_buf());

    let publisher_root = spool.path().to_path_buf();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        publish(&publisher_root, "dev", "logs", "l1.log", "log");
        publish(&publisher_root, "dev", "images", "i1.png", "img");
    });

    let report = run_for(config, spool.path(), DeliverySource::Query(Box::new(source)), Duration::from_millis(500)).await;

    assert_eq!(report.delivered, 2);
    assert!(out.path().join("l1.log").exists());
    assert!(out.path().join("i1.png").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_invocation_runs_for_each_delivery() {
    let spool = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let marker = TempDir::new().unwrap();
    publish(spool.path(), "dev", "images", "a.dat", "alpha");

    let mut config = SubscriptionConfig::new(DeliveryMode::Pull, "dev", Some("images"), out.path().to_path_buf());
    config.poll_interval_ms = 50;
    config.invoke = Some(InvokeConfig {
        command: format!("echo $filename $filetype >> {}", marker.path().join("calls").display()),
        exit_on_error: true,
        asynchronous: false,
    });

    let report = run_for(config, spool.path(), DeliverySource::Pull, Duration::from_millis(400)).await;

    assert_eq!(report.errors, 0);
    let calls = fs::read_to_string(marker.path().join("calls")).unwrap();
    assert_eq!(calls.trim(), "a.dat images");
}

#[cfg(unix)]
#[tokio::test]
async fn test_failing_invocation_aborts_under_exit_on_error() {
    let spool = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    publish(spool.path(), "dev", "images", "a.dat", "alpha");

    let mut config = SubscriptionConfig::new(DeliveryMode::Pull, "dev", Some("images"), out.path().to_path_buf());
    config.poll_interval_ms = 50;
    config.invoke = Some(InvokeConfig {
        command: "exit 3".to_string(),
        exit_on_error: true,
        asynchronous: false,
    });

    let report = run_for(config, spool.path(), DeliverySource::Pull, Duration::from_secs(5)).await;

    assert_eq!(report.exit, LoopExit::Aborted);
    assert_eq!(report.errors, 1);
    assert_eq!(report.delivered, 0);
}
