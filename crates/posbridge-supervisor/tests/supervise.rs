// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Supervisor against a file source and a real child process.

#![cfg(unix)]

use posbridge::source::FileSource;
use posbridge_supervisor::{ProcessLauncher, Supervisor, SupervisorConfig, SupervisorState};
use serde_json::json;
use std::path::Path;
use std::time::{Duration, Instant};

fn app_document(scale: f64) -> String {
    json!({
        "name": "site-a",
        "source": { "address": "localhost", "topics": ["tags/+"] },
        "transform": { "origin_x": 0.0, "origin_y": 0.0, "scale": scale }
    })
    .to_string()
}

async fn wait_for(path: &Path, needle: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if std::fs::read_to_string(path).map(|s| s.contains(needle)).unwrap_or(false) {
            return;
        }
        assert!(Instant::now() < deadline, "{} never contained {}", path.display(), needle);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_supervises_worker_from_file_source() {
    let source_dir = tempfile::tempdir().expect("tempdir");
    let out_dir = tempfile::tempdir().expect("tempdir");
    let rendered = out_dir.path().join("posbridge.toml");
    std::fs::write(source_dir.path().join("app.json"), app_document(1.0)).expect("write");

    let config = SupervisorConfig {
        health_interval_ms: 50,
        restart_delay_ms: 10,
        stop_timeout_ms: 1000,
        startup_grace_ms: 10,
        ..SupervisorConfig::default()
    }
    .config_path(&rendered);
    let launcher = ProcessLauncher::new("sh", vec!["-c".into(), "sleep 30".into()]);
    let mut supervisor = Supervisor::new(config, launcher);

    let source = FileSource::new(source_dir.path()).poll_interval(Duration::from_millis(20));
    let app_path = source_dir.path().join("app.json");
    let rendered_path = rendered.clone();
    let scenario = async move {
        wait_for(&rendered_path, "scale = 1.0").await;
        std::fs::write(&app_path, app_document(0.5)).expect("write");
        wait_for(&rendered_path, "scale = 0.5").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    };

    supervisor.run(&source, scenario).await.expect("run");

    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert_eq!(supervisor.restart_count(), 0);
    assert!(supervisor.worker().is_none());
    let text = std::fs::read_to_string(&rendered).expect("read");
    let parsed: posbridge::BridgeConfig = toml::from_str(&text).expect("rendered toml");
    assert!((parsed.transform.scale - 0.5).abs() < f64::EPSILON);
}
