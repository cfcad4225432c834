mod common;

use std::time::Duration;

use batchkit::config::{Config, ConfigReloader, EndpointConfig};
use batchkit::error::Error;
use batchkit::model::IdentityStrategy;
use batchkit::config::secrets::ExposeSecret;
use batchkit::transcribe::resolve_endpoints;
use common::{Workspace, config_toml};
use tokio_util::sync::CancellationToken;

fn violations(text: &str) -> batchkit::error::Violations {
    match Config::from_toml_str(text) {
        Err(Error::InvalidConfig(v)) => v,
        other => panic!("expected InvalidConfig, got {other:?}"),
    }
}

#[test]
fn valid_document_loads_with_defaults() {
    let ws = Workspace::new();
    let config = Config::from_toml_str(&config_toml(&ws.root)).unwrap();

    assert_eq!(config.watch.root, ws.root);
    assert_eq!(config.watch.extensions, vec!["wav", "mp3"]);
    assert_eq!(config.watch.identity, IdentityStrategy::Path);
    assert_eq!(config.workers.concurrency, 3);
    assert_eq!(config.rate.max_concurrent, 2);
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.retry.backoff_multiplier, 2.0);
    assert_eq!(config.checkpoint.batch_size, 64);
    assert_eq!(config.status.recent_failures, 50);
}

#[test]
fn extensions_are_normalized() {
    let ws = Workspace::new();
    let text = config_toml(&ws.root).replace(r#"["wav", "mp3"]"#, r#"[".WAV", "Flac"]"#);
    let config = Config::from_toml_str(&text).unwrap();
    assert_eq!(config.watch.extensions, vec!["wav", "flac"]);
    assert!(config.watch.accepts(std::path::Path::new("a/b/take1.FLAC")));
    assert!(!config.watch.accepts(std::path::Path::new("notes.txt")));
}

#[test]
fn every_schema_violation_is_listed() {
    let v = violations(
        r#"
        [watch]
        root = "/tmp"
        identity = "inode"
        poll_interval_ms = 1

        [workers]
        concurrency = 0

        [rate]
        max_concurrent = "two"

        [retry]
        backoff_initial_ms = 10
        backoff_max_ms = 40

        [recognizer]
        endpoint = ""
        credentials_env = "KEY"
        region = "eu"

        [metrics]
        enabled = true
        "#,
    );

    for path in [
        "watch.identity",
        "watch.poll_interval_ms",
        "workers.concurrency",
        "rate.max_concurrent",
        "retry.max_attempts",
        "recognizer.endpoint",
        "recognizer.region",
        "metrics",
    ] {
        assert!(v.mentions(path), "missing violation for {path}: {v}");
    }
    assert_eq!(v.len(), 8, "{v}");
}

#[test]
fn missing_sections_are_reported() {
    let v = violations("[watch]\nroot = \"/tmp\"\n");
    for section in ["workers", "rate", "retry", "recognizer"] {
        assert!(v.mentions(section), "{v}");
    }
}

#[test]
fn cross_field_constraints_are_checked() {
    let ws = Workspace::new();
    let text = config_toml(&ws.dir.path().join("absent"))
        .replace("backoff_initial_ms = 10", "backoff_initial_ms = 100")
        .replace("acquire_timeout_ms = 1000", "acquire_timeout_ms = 9000\nwindow_ms = 1000");
    let v = violations(&text);

    assert!(v.mentions("watch.root"), "{v}");
    assert!(v.mentions("retry.backoff_initial_ms"), "{v}");
    assert!(v.mentions("rate.max_calls_per_window"), "{v}");
    assert!(v.mentions("rate.acquire_timeout_ms"), "{v}");
}

#[test]
fn unparseable_document_is_a_violation() {
    let v = violations("[watch\nroot = ");
    assert!(v.mentions("<document>"));
}

#[test]
fn endpoint_credentials_come_from_the_named_variable() {
    let ws = Workspace::new();
    let text = config_toml(&ws.root).replace("BATCHKIT_TEST_CREDENTIALS", "BATCHKIT_CFG_TEST_KEY");
    let config = Config::from_toml_str(&text).unwrap();

    unsafe {
        std::env::remove_var("BATCHKIT_CFG_TEST_KEY");
    }
    assert!(matches!(resolve_endpoints(&config), Err(Error::Config(_))));

    unsafe {
        std::env::set_var("BATCHKIT_CFG_TEST_KEY", "sk-test");
    }
    let endpoints = resolve_endpoints(&config).unwrap();
    assert_eq!(endpoints.len(), 1);
    let (endpoint, slots) = &endpoints[0];
    assert_eq!(endpoint.name, "default");
    assert_eq!(*slots, 3);
    assert_eq!(endpoint.credentials().expose_secret(), "sk-test");
    assert!(!format!("{endpoint:?}").contains("sk-test"));

    unsafe {
        std::env::remove_var("BATCHKIT_CFG_TEST_KEY");
    }
}

#[test]
fn type_errors_and_constraint_errors_are_reported_together() {
    let ws = Workspace::new();
    let text = config_toml(&ws.root)
        .replace("concurrency = 3", "concurrency = \"three\"")
        .replace("backoff_initial_ms = 10", "backoff_initial_ms = 100");
    let v = violations(&text);

    assert!(v.mentions("workers.concurrency"), "{v}");
    assert!(v.mentions("retry.backoff_initial_ms"), "{v}");
    assert_eq!(v.len(), 2, "{v}");
}

#[test]
fn named_endpoints_replace_the_single_endpoint() {
    let ws = Workspace::new();
    let text = config_toml(&ws.root).replace(
        "endpoint = \"http://asr.local\"\n",
        "",
    ) + r#"
[endpoints.east]
url = "http://east.local"
concurrency = 2

[endpoints.west]
url = "http://west.local"
"#;
    let config = Config::from_toml_str(&text).unwrap();
    let names: Vec<_> = config.endpoint_specs().into_iter().map(|e| (e.name, e.concurrency)).collect();
    assert_eq!(names, vec![("east".to_string(), 2), ("west".to_string(), 3)]);

    let both = config_toml(&ws.root) + "\n[endpoints.east]\nurl = \"http://east.local\"\n";
    assert!(violations(&both).mentions("recognizer.endpoint"));
}

#[test]
fn reload_can_swap_endpoints() {
    let ws = Workspace::new();
    let config = ws.config();
    let reloader = ConfigReloader::new(ws.dir.path().join("batchkit.toml"), config.clone());

    let mut candidate = config.clone();
    candidate.recognizer.endpoint = None;
    candidate.endpoints.insert(
        "east".into(),
        EndpointConfig {
            url: "http://east.local".into(),
            concurrency: Some(2),
            credentials_env: None,
        },
    );
    let diff = reloader.apply(candidate).unwrap();
    let mut paths = diff.paths();
    paths.sort();
    assert_eq!(paths, vec!["endpoints.east", "recognizer.endpoint"]);
    assert_eq!(reloader.current().endpoint_specs()[0].name, "east");
}

#[test]
fn reload_applies_hot_fields() {
    let ws = Workspace::new();
    let config = ws.config();
    let reloader = ConfigReloader::new(ws.dir.path().join("batchkit.toml"), config.clone());
    let rx = reloader.subscribe();

    let mut candidate = config.clone();
    candidate.retry.max_attempts = 7;
    candidate.workers.concurrency = 5;
    let diff = reloader.apply(candidate).unwrap();

    let mut paths = diff.paths();
    paths.sort();
    assert_eq!(paths, vec!["retry.max_attempts", "workers.concurrency"]);
    assert_eq!(rx.borrow().retry.max_attempts, 7);
    assert_eq!(reloader.current().workers.concurrency, 5);
}

#[test]
fn reload_rejects_restart_only_fields() {
    let ws = Workspace::new();
    let config = ws.config();
    let reloader = ConfigReloader::new(ws.dir.path().join("batchkit.toml"), config.clone());

    let mut candidate = config.clone();
    candidate.watch.identity = IdentityStrategy::PathAndContent;
    candidate.retry.max_attempts = 9;

    match reloader.apply(candidate) {
        Err(Error::UnsafeReload { fields }) => assert_eq!(fields, vec!["watch.identity"]),
        other => panic!("expected UnsafeReload, got {other:?}"),
    }
    assert_eq!(*reloader.current(), config);
}

#[test]
fn reload_rejects_invalid_file_and_keeps_snapshot() {
    let ws = Workspace::new();
    let path = ws.dir.path().join("batchkit.toml");
    std::fs::write(&path, config_toml(&ws.root).replace("concurrency = 3", "concurrency = -1"))
        .unwrap();
    let config = ws.config();
    let reloader = ConfigReloader::new(&path, config.clone());

    assert!(matches!(reloader.reload_from_disk(), Err(Error::InvalidConfig(_))));
    assert_eq!(*reloader.current(), config);
}

#[tokio::test]
async fn reloader_picks_up_file_edits() {
    let ws = Workspace::new();
    let path = ws.dir.path().join("batchkit.toml");
    let text = config_toml(&ws.root);
    std::fs::write(&path, &text).unwrap();
    let config = Config::load(&path).unwrap();

    let reloader = ConfigReloader::new(&path, config);
    let mut rx = reloader.subscribe();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(reloader.run(shutdown.clone()));

    // let the poll baseline settle so the edit lands on a later mtime
    tokio::time::sleep(Duration::from_millis(200)).await;
    std::fs::write(&path, text.replace("max_attempts = 3", "max_attempts = 6")).unwrap();

    tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|c| c.retry.max_attempts == 6))
        .await
        .expect("reload was not applied")
        .unwrap();

    shutdown.cancel();
    task.await.unwrap();
}
