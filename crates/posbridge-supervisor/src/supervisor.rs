// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker lifecycle driven by configuration documents.

use crate::config::SupervisorConfig;
use crate::render::{render, write_atomic};
use crate::worker::{WorkerExit, WorkerHandle, WorkerLauncher, WorkerProcess};
use crate::SupervisorError;
use posbridge::source::{ConfigSource, APP_KEY};
use serde_json::Value;
use std::future::Future;
use std::time::Instant;
use tokio::time::MissedTickBehavior;

/// Supervisor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No worker started yet.
    Starting,
    Running,
    /// Between a worker stop and its replacement.
    Restarting,
    Stopping,
    Stopped,
}

/// Result of [`Supervisor::apply_document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Same rendered configuration as the running worker.
    Unchanged,
    /// Written to disk and the worker (re)started.
    Applied { config_id: u64 },
}

/// Result of [`Supervisor::check_health`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    /// Nothing to supervise yet, or shutting down.
    Idle,
    Restarted { exit: Option<WorkerExit> },
}

/// Keeps one bridge worker running with the latest valid configuration.
pub struct Supervisor<L: WorkerLauncher> {
    config: SupervisorConfig,
    launcher: L,
    state: SupervisorState,
    current_id: Option<u64>,
    worker: Option<(L::Handle, WorkerProcess)>,
    restarts: u32,
}

impl<L: WorkerLauncher> Supervisor<L> {
    pub fn new(config: SupervisorConfig, launcher: L) -> Self {
        Self {
            config,
            launcher,
            state: SupervisorState::Starting,
            current_id: None,
            worker: None,
            restarts: 0,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn worker(&self) -> Option<&WorkerProcess> {
        self.worker.as_ref().map(|(_, process)| process)
    }

    /// Crash restarts so far.
    pub fn restart_count(&self) -> u32 {
        self.restarts
    }

    /// Identity of the configuration last written to disk.
    pub fn config_id(&self) -> Option<u64> {
        self.current_id
    }

    /// Render, persist and (re)start on a new configuration.
    ///
    /// An invalid document is rejected without touching the file or the
    /// running worker.
    pub async fn apply_document(&mut self, doc: &Value) -> Result<ApplyOutcome, SupervisorError> {
        if matches!(self.state, SupervisorState::Stopping | SupervisorState::Stopped) {
            return Err(SupervisorError::Stopped);
        }

        let rendered = render(doc)?;
        if self.current_id == Some(rendered.identity) && self.worker.is_some() {
            return Ok(ApplyOutcome::Unchanged);
        }

        write_atomic(&self.config.config_path, &rendered.toml)?;
        self.current_id = Some(rendered.identity);
        tracing::info!(
            path = %self.config.config_path.display(),
            config_id = %format!("{:016x}", rendered.identity),
            "Configuration written"
        );

        if self.worker.is_some() {
            self.state = SupervisorState::Restarting;
            self.stop_worker().await;
        }
        self.spawn_worker().await?;
        Ok(ApplyOutcome::Applied {
            config_id: rendered.identity,
        })
    }

    /// Poll the worker and restart it if it exited.
    pub async fn check_health(&mut self) -> Result<HealthOutcome, SupervisorError> {
        if matches!(self.state, SupervisorState::Stopping | SupervisorState::Stopped) {
            return Ok(HealthOutcome::Idle);
        }

        let exit = match self.worker.as_mut() {
            Some((handle, process)) => match handle.try_wait()? {
                None => {
                    process.last_health_check = Instant::now();
                    return Ok(HealthOutcome::Healthy);
                }
                Some(exit) => {
                    tracing::warn!(pid = ?process.pid, "Worker exited unexpectedly ({})", exit);
                    Some(exit)
                }
            },
            // A previous spawn failed; retry once a configuration exists.
            None if self.current_id.is_some() => None,
            None => return Ok(HealthOutcome::Idle),
        };

        self.worker = None;
        self.state = SupervisorState::Restarting;
        tokio::time::sleep(self.config.restart_delay()).await;

        self.restarts += 1;
        self.spawn_worker().await?;
        Ok(HealthOutcome::Restarted { exit })
    }

    /// Stop the worker.
    pub async fn shutdown(&mut self) {
        self.state = SupervisorState::Stopping;
        self.stop_worker().await;
        self.state = SupervisorState::Stopped;
    }

    /// Follow `source` until `shutdown` completes or the source closes.
    pub async fn run<S, F>(&mut self, source: &S, shutdown: F) -> Result<(), SupervisorError>
    where
        S: ConfigSource,
        F: Future<Output = ()>,
    {
        self.config.validate()?;
        let mut updates = source.watch(APP_KEY).await?;

        let mut health = tokio::time::interval(self.config.health_interval());
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        health.tick().await;

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                doc = updates.recv() => {
                    let Some(doc) = doc else {
                        tracing::warn!("Configuration source closed");
                        break;
                    };
                    match self.apply_document(&doc).await {
                        Ok(ApplyOutcome::Unchanged) => tracing::debug!("Configuration unchanged"),
                        Ok(ApplyOutcome::Applied { .. }) => {}
                        Err(e) => tracing::error!("Configuration rejected: {}", e),
                    }
                }
                _ = health.tick() => {
                    if let Err(e) = self.check_health().await {
                        tracing::error!("Worker restart failed: {}", e);
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn spawn_worker(&mut self) -> Result<(), SupervisorError> {
        let config_id = self.current_id.ok_or(SupervisorError::NoConfiguration)?;
        let mut handle = self.launcher.launch(&self.config.config_path)?;
        let now = Instant::now();
        let process = WorkerProcess {
            pid: handle.pid(),
            config_id,
            started_at: now,
            last_health_check: now,
            restart_count: self.restarts,
        };

        tokio::time::sleep(self.config.startup_grace()).await;
        if let Some(exit) = handle.try_wait()? {
            // Kept so the next health check restarts it.
            tracing::error!(pid = ?process.pid, "Worker exited during startup ({})", exit);
        } else {
            tracing::info!(pid = ?process.pid, restarts = self.restarts, "Worker started");
        }

        self.worker = Some((handle, process));
        self.state = SupervisorState::Running;
        Ok(())
    }

    async fn stop_worker(&mut self) {
        let Some((mut handle, process)) = self.worker.take() else {
            return;
        };
        match handle.stop(self.config.stop_timeout()).await {
            Ok(exit) => tracing::info!(pid = ?process.pid, "Worker stopped ({})", exit),
            Err(e) => tracing::warn!(pid = ?process.pid, "Worker stop failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Record {
        launches: Vec<PathBuf>,
        stops: u32,
        exited: Option<WorkerExit>,
        fail_launch: bool,
    }

    #[derive(Clone, Default)]
    struct FakeLauncher(Arc<Mutex<Record>>);

    impl FakeLauncher {
        fn launches(&self) -> usize {
            self.0.lock().launches.len()
        }

        fn stops(&self) -> u32 {
            self.0.lock().stops
        }

        fn crash(&self, code: i32) {
            self.0.lock().exited = Some(WorkerExit { code: Some(code) });
        }
    }

    struct FakeHandle {
        pid: u32,
        record: Arc<Mutex<Record>>,
    }

    impl WorkerLauncher for FakeLauncher {
        type Handle = FakeHandle;

        fn launch(&self, config_path: &Path) -> Result<FakeHandle, SupervisorError> {
            let mut record = self.0.lock();
            if record.fail_launch {
                return Err(SupervisorError::Spawn("no such file".into()));
            }
            record.launches.push(config_path.to_path_buf());
            record.exited = None;
            Ok(FakeHandle {
                pid: 1000 + record.launches.len() as u32,
                record: self.0.clone(),
            })
        }
    }

    impl WorkerHandle for FakeHandle {
        fn pid(&self) -> Option<u32> {
            Some(self.pid)
        }

        fn try_wait(&mut self) -> Result<Option<WorkerExit>, SupervisorError> {
            Ok(self.record.lock().exited)
        }

        fn stop(&mut self, _timeout: Duration) -> impl Future<Output = Result<WorkerExit, SupervisorError>> + Send {
            self.record.lock().stops += 1;
            std::future::ready(Ok(WorkerExit { code: Some(0) }))
        }
    }

    struct ChannelSource(Mutex<Option<mpsc::Receiver<Value>>>);

    impl ConfigSource for ChannelSource {
        fn fetch(&self, key: &str) -> impl Future<Output = Result<Value, posbridge::source::SourceError>> + Send {
            std::future::ready(Err(posbridge::source::SourceError::NotFound(key.to_string())))
        }

        fn watch(
            &self,
            _key: &str,
        ) -> impl Future<Output = Result<mpsc::Receiver<Value>, posbridge::source::SourceError>> + Send {
            let rx = self.0.lock().take().ok_or(posbridge::source::SourceError::Closed);
            std::future::ready(rx)
        }

        fn close(&self) -> impl Future<Output = ()> + Send {
            std::future::ready(())
        }
    }

    fn doc(scale: f64) -> Value {
        json!({
            "name": "site-a",
            "source": { "address": "localhost", "topics": ["tags/+"] },
            "transform": { "origin_x": 0.0, "origin_y": 0.0, "scale": scale }
        })
    }

    fn supervisor(dir: &Path) -> (Supervisor<FakeLauncher>, FakeLauncher) {
        let launcher = FakeLauncher::default();
        let config = SupervisorConfig::default().config_path(dir.join("bridge.toml"));
        (Supervisor::new(config, launcher.clone()), launcher)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_document_starts_worker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut sup, launcher) = supervisor(dir.path());
        assert_eq!(sup.state(), SupervisorState::Starting);

        let outcome = sup.apply_document(&doc(1.0)).await.expect("apply");
        assert!(matches!(outcome, ApplyOutcome::Applied { .. }));
        assert_eq!(sup.state(), SupervisorState::Running);
        assert_eq!(launcher.launches(), 1);

        let written = std::fs::read_to_string(dir.path().join("bridge.toml")).expect("read");
        let parsed: posbridge::BridgeConfig = toml::from_str(&written).expect("valid toml");
        assert_eq!(parsed.name, "site-a");
        assert_eq!(sup.worker().map(|w| w.pid), Some(Some(1001)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_document_keeps_worker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut sup, launcher) = supervisor(dir.path());
        sup.apply_document(&doc(1.0)).await.expect("apply");

        // Hand edits survive because nothing is rewritten.
        let path = dir.path().join("bridge.toml");
        std::fs::write(&path, "edited").expect("write");

        let outcome = sup.apply_document(&doc(1.0)).await.expect("apply");
        assert_eq!(outcome, ApplyOutcome::Unchanged);
        assert_eq!(launcher.launches(), 1);
        assert_eq!(launcher.stops(), 0);
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "edited");
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_document_restarts_worker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut sup, launcher) = supervisor(dir.path());
        sup.apply_document(&doc(1.0)).await.expect("apply");
        let first = sup.config_id();

        sup.apply_document(&doc(0.5)).await.expect("apply");
        assert_ne!(sup.config_id(), first);
        assert_eq!(launcher.stops(), 1);
        assert_eq!(launcher.launches(), 2);
        assert_eq!(sup.worker().map(|w| w.config_id), sup.config_id());
        assert_eq!(sup.restart_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_document_keeps_current() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut sup, launcher) = supervisor(dir.path());
        sup.apply_document(&doc(1.0)).await.expect("apply");
        let before = std::fs::read_to_string(dir.path().join("bridge.toml")).expect("read");
        let id = sup.config_id();

        assert!(sup.apply_document(&doc(0.0)).await.is_err());
        assert_eq!(sup.config_id(), id);
        assert_eq!(launcher.launches(), 1);
        assert_eq!(launcher.stops(), 0);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("bridge.toml")).expect("read"),
            before
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_restarts_after_delay() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut sup, launcher) = supervisor(dir.path());
        sup.apply_document(&doc(1.0)).await.expect("apply");
        assert_eq!(sup.check_health().await.expect("health"), HealthOutcome::Healthy);

        launcher.crash(1);
        let started = tokio::time::Instant::now();
        let outcome = sup.check_health().await.expect("health");
        assert_eq!(
            outcome,
            HealthOutcome::Restarted {
                exit: Some(WorkerExit { code: Some(1) })
            }
        );
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(launcher.launches(), 2);
        assert_eq!(sup.restart_count(), 1);
        assert_eq!(sup.worker().map(|w| w.restart_count), Some(1));
        assert_eq!(sup.state(), SupervisorState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_spawn_retried_by_health_check() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut sup, launcher) = supervisor(dir.path());
        launcher.0.lock().fail_launch = true;
        assert!(matches!(
            sup.apply_document(&doc(1.0)).await,
            Err(SupervisorError::Spawn(_))
        ));
        assert!(sup.worker().is_none());

        launcher.0.lock().fail_launch = false;
        let outcome = sup.check_health().await.expect("health");
        assert_eq!(outcome, HealthOutcome::Restarted { exit: None });
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_worker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut sup, launcher) = supervisor(dir.path());
        assert_eq!(sup.check_health().await.expect("health"), HealthOutcome::Idle);

        sup.apply_document(&doc(1.0)).await.expect("apply");
        sup.shutdown().await;
        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert_eq!(launcher.stops(), 1);
        assert!(matches!(
            sup.apply_document(&doc(2.0)).await,
            Err(SupervisorError::Stopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_follows_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut sup, launcher) = supervisor(dir.path());
        let (tx, rx) = mpsc::channel(8);
        let source = ChannelSource(Mutex::new(Some(rx)));

        tx.send(doc(1.0)).await.expect("send");
        tx.send(doc(1.0)).await.expect("send");
        tx.send(doc(0.0)).await.expect("send");
        tx.send(doc(0.5)).await.expect("send");
        drop(tx);

        sup.run(&source, std::future::pending()).await.expect("run");
        assert_eq!(launcher.launches(), 2);
        assert_eq!(launcher.stops(), 2);
        assert_eq!(sup.state(), SupervisorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ends_on_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut sup, launcher) = supervisor(dir.path());
        let (tx, rx) = mpsc::channel(8);
        let source = ChannelSource(Mutex::new(Some(rx)));
        tx.send(doc(1.0)).await.expect("send");

        sup.run(&source, tokio::time::sleep(Duration::from_secs(30)))
            .await
            .expect("run");
        assert_eq!(launcher.launches(), 1);
        assert_eq!(launcher.stops(), 1);
        drop(tx);
    }
}
