// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Configuration sources.
//!
//! A source serves JSON documents by key (`app`, `transform`) and can push
//! every new version of a document. Two backends exist: a directory of
//! files, polled for changes, and retained MQTT topics on a control broker.

use crate::config::{EndpointConfig, QosLevel, ReconnectConfig};
use crate::connection::{ConnectionError, ConnectionManager, ConnectionSettings, Transport};
use crate::mqtt::MqttTransport;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Key of the full bridge configuration document.
pub const APP_KEY: &str = "app";

/// Key of the transform parameter document.
pub const TRANSFORM_KEY: &str = "transform";

const WATCH_BUFFER: usize = 16;

/// Source errors.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Document '{0}' not found")]
    NotFound(String),

    #[error("Document '{key}' unreadable: {reason}")]
    Parse { key: String, reason: String },

    #[error("Invalid source URI '{0}'")]
    InvalidSpec(String),

    #[error("Source connection failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Source closed")]
    Closed,
}

/// A push-capable document store.
pub trait ConfigSource: Send + Sync + 'static {
    /// Read the current version of a document.
    fn fetch(&self, key: &str) -> impl Future<Output = Result<Value, SourceError>> + Send;

    /// Subscribe to a document. The current version, if any, comes first.
    fn watch(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<mpsc::Receiver<Value>, SourceError>> + Send;

    /// Release the source's resources.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Directory of `<key>.json` / `<key>.toml` documents.
#[derive(Debug, Clone)]
pub struct FileSource {
    dir: PathBuf,
    poll_interval: Duration,
}

impl FileSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Set how often watched documents are re-read.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn locate(&self, key: &str) -> Option<PathBuf> {
        ["json", "toml"]
            .iter()
            .map(|ext| self.dir.join(format!("{}.{}", key, ext)))
            .find(|path| path.is_file())
    }

    async fn read(&self, key: &str) -> Result<Value, SourceError> {
        let path = self
            .locate(key)
            .ok_or_else(|| SourceError::NotFound(key.to_string()))?;
        let content = tokio::fs::read_to_string(&path).await?;
        parse_document(key, &path, &content)
    }
}

fn parse_document(key: &str, path: &Path, content: &str) -> Result<Value, SourceError> {
    let parse_err = |reason: String| SourceError::Parse {
        key: key.to_string(),
        reason,
    };
    if path.extension().map(|e| e == "toml").unwrap_or(false) {
        let doc: toml::Value = toml::from_str(content).map_err(|e| parse_err(e.to_string()))?;
        serde_json::to_value(doc).map_err(|e| parse_err(e.to_string()))
    } else {
        serde_json::from_str(content).map_err(|e| parse_err(e.to_string()))
    }
}

impl ConfigSource for FileSource {
    fn fetch(&self, key: &str) -> impl Future<Output = Result<Value, SourceError>> + Send {
        self.read(key)
    }

    fn watch(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<mpsc::Receiver<Value>, SourceError>> + Send {
        let source = self.clone();
        let key = key.to_string();
        async move {
            let (tx, rx) = mpsc::channel(WATCH_BUFFER);
            tokio::spawn(async move {
                let mut last: Option<Value> = None;
                let mut ticker = tokio::time::interval(source.poll_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = tx.closed() => break,
                        _ = ticker.tick() => {}
                    }
                    match source.read(&key).await {
                        Ok(doc) if last.as_ref() != Some(&doc) => {
                            last = Some(doc.clone());
                            if tx.send(doc).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) | Err(SourceError::NotFound(_)) => {}
                        Err(e) => {
                            tracing::warn!(key = %key, dir = %source.dir.display(), "Ignoring document: {}", e);
                        }
                    }
                }
                tracing::debug!(key = %key, "File watch stopped");
            });
            Ok(rx)
        }
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Retained documents under `<prefix>/<key>` on a control broker.
pub struct MqttSource<T: Transport = MqttTransport> {
    manager: ConnectionManager<T>,
    prefix: String,
    docs: Arc<watch::Sender<HashMap<String, Value>>>,
}

impl MqttSource<MqttTransport> {
    /// Connect to a control broker.
    pub async fn connect(endpoint: &EndpointConfig, prefix: &str) -> Result<Self, SourceError> {
        let transport = MqttTransport::new(endpoint)?;
        Self::start(transport, prefix, endpoint.reconnect.clone()).await
    }
}

impl<T: Transport> MqttSource<T> {
    /// Subscribe to `<prefix>/+` over `transport` and wait for the session.
    pub async fn start(
        transport: T,
        prefix: &str,
        reconnect: ReconnectConfig,
    ) -> Result<Self, SourceError> {
        let prefix = prefix.trim_end_matches('/').to_string();
        let settings = ConnectionSettings {
            topics: vec![format!("{}/+", prefix)],
            qos: QosLevel::AtLeastOnce,
            reconnect,
            ..Default::default()
        }
        .with_queue(1, 1);
        let manager = ConnectionManager::new(format!("config:{}", prefix), transport, settings);

        let (docs, _) = watch::channel(HashMap::new());
        let docs = Arc::new(docs);
        let store = docs.clone();
        let topic_prefix = format!("{}/", prefix);
        manager.on_message(Arc::new(move |topic: &str, payload: &[u8]| {
            let Some(key) = topic.strip_prefix(&topic_prefix) else {
                return;
            };
            if payload.is_empty() {
                return;
            }
            match serde_json::from_slice::<Value>(payload) {
                Ok(doc) => {
                    store.send_modify(|docs| {
                        docs.insert(key.to_string(), doc);
                    });
                }
                Err(e) => {
                    tracing::warn!(topic, "Ignoring unparsable config document: {}", e);
                }
            }
        }));

        manager.connect().await?;
        Ok(Self {
            manager,
            prefix,
            docs,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl<T: Transport> ConfigSource for MqttSource<T> {
    fn fetch(&self, key: &str) -> impl Future<Output = Result<Value, SourceError>> + Send {
        let mut docs = self.docs.subscribe();
        let key = key.to_string();
        async move {
            let docs = docs
                .wait_for(|docs| docs.contains_key(&key))
                .await
                .map_err(|_| SourceError::Closed)?;
            docs.get(&key).cloned().ok_or(SourceError::NotFound(key.clone()))
        }
    }

    fn watch(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<mpsc::Receiver<Value>, SourceError>> + Send {
        let mut docs = self.docs.subscribe();
        let key = key.to_string();
        async move {
            let (tx, rx) = mpsc::channel(WATCH_BUFFER);
            tokio::spawn(async move {
                let mut last: Option<Value> = None;
                loop {
                    let current = docs.borrow_and_update().get(&key).cloned();
                    if let Some(doc) = current {
                        if last.as_ref() != Some(&doc) {
                            last = Some(doc.clone());
                            if tx.send(doc).await.is_err() {
                                break;
                            }
                        }
                    }
                    tokio::select! {
                        _ = tx.closed() => break,
                        changed = docs.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
            Ok(rx)
        }
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        self.manager.disconnect(Duration::from_millis(100))
    }
}

/// Where configuration comes from, as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    /// `file:///path/to/dir`
    File(PathBuf),
    /// `mqtt://host[:port]/prefix` or `mqtts://...`
    Mqtt {
        host: String,
        port: u16,
        tls: bool,
        prefix: String,
    },
}

impl SourceSpec {
    pub fn parse(uri: &str) -> Result<Self, SourceError> {
        let invalid = || SourceError::InvalidSpec(uri.to_string());
        let (scheme, rest) = uri.split_once("://").ok_or_else(invalid)?;

        match scheme {
            "file" => {
                if rest.is_empty() {
                    return Err(invalid());
                }
                Ok(Self::File(PathBuf::from(rest)))
            }
            "mqtt" | "mqtts" => {
                let tls = scheme == "mqtts";
                let (authority, prefix) = rest.split_once('/').ok_or_else(invalid)?;
                let prefix = prefix.trim_matches('/');
                if prefix.is_empty() || prefix.contains('+') || prefix.contains('#') {
                    return Err(invalid());
                }
                let (host, port) = match authority.rsplit_once(':') {
                    Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
                    None => (authority, if tls { 8883 } else { 1883 }),
                };
                if host.is_empty() {
                    return Err(invalid());
                }
                Ok(Self::Mqtt {
                    host: host.to_string(),
                    port,
                    tls,
                    prefix: prefix.to_string(),
                })
            }
            _ => Err(invalid()),
        }
    }

    /// Open the source. `client_name` distinguishes processes sharing a
    /// control broker.
    pub async fn open(&self, client_name: &str) -> Result<AnySource, SourceError> {
        match self {
            Self::File(dir) => Ok(AnySource::File(FileSource::new(dir.clone()))),
            Self::Mqtt {
                host,
                port,
                tls,
                prefix,
            } => {
                let client_id = format!("{}-{}", client_name, std::process::id());
                let mut endpoint = EndpointConfig::new(host.clone(), client_id).port(*port);
                endpoint.tls = *tls;
                let source = MqttSource::connect(&endpoint, prefix).await?;
                Ok(AnySource::Mqtt(source))
            }
        }
    }
}

/// A source chosen at runtime.
pub enum AnySource {
    File(FileSource),
    Mqtt(MqttSource),
}

impl ConfigSource for AnySource {
    fn fetch(&self, key: &str) -> impl Future<Output = Result<Value, SourceError>> + Send {
        async move {
            match self {
                Self::File(s) => s.fetch(key).await,
                Self::Mqtt(s) => s.fetch(key).await,
            }
        }
    }

    fn watch(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<mpsc::Receiver<Value>, SourceError>> + Send {
        async move {
            match self {
                Self::File(s) => s.watch(key).await,
                Self::Mqtt(s) => s.watch(key).await,
            }
        }
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        async move {
            match self {
                Self::File(s) => s.close().await,
                Self::Mqtt(s) => s.close().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use serde_json::json;

    #[test]
    fn test_spec_parse() {
        assert_eq!(
            SourceSpec::parse("file:///etc/posbridge").expect("file"),
            SourceSpec::File(PathBuf::from("/etc/posbridge"))
        );
        assert_eq!(
            SourceSpec::parse("mqtt://control.local/site/a").expect("mqtt"),
            SourceSpec::Mqtt {
                host: "control.local".into(),
                port: 1883,
                tls: false,
                prefix: "site/a".into()
            }
        );
        assert_eq!(
            SourceSpec::parse("mqtts://control.local:9999/cfg/").expect("mqtts"),
            SourceSpec::Mqtt {
                host: "control.local".into(),
                port: 9999,
                tls: true,
                prefix: "cfg".into()
            }
        );
        for bad in ["", "file://", "http://x/y", "mqtt://host", "mqtt://host/", "mqtt://:1/x", "mqtt://h/a/#"] {
            assert!(SourceSpec::parse(bad).is_err(), "{} should be rejected", bad);
        }
    }

    #[tokio::test]
    async fn test_file_fetch_json_and_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("transform.json"), r#"{"origin_x": 1.0}"#).expect("write");
        std::fs::write(dir.path().join("app.toml"), "name = \"a\"\n[routing]\npublish_workers = 3\n")
            .expect("write");
        let source = FileSource::new(dir.path());

        assert_eq!(source.fetch(TRANSFORM_KEY).await.expect("json"), json!({"origin_x": 1.0}));
        let app = source.fetch(APP_KEY).await.expect("toml");
        assert_eq!(app["routing"]["publish_workers"], json!(3));
        assert!(matches!(source.fetch("missing").await, Err(SourceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_file_watch_pushes_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("transform.json");
        std::fs::write(&path, r#"{"v": 1}"#).expect("write");
        let source = FileSource::new(dir.path()).poll_interval(Duration::from_millis(20));

        let mut rx = source.watch(TRANSFORM_KEY).await.expect("watch");
        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.expect("first");
        assert_eq!(first, Some(json!({"v": 1})));

        std::fs::write(&path, "{ broken").expect("write");
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(&path, r#"{"v": 2}"#).expect("write");

        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.expect("second");
        assert_eq!(second, Some(json!({"v": 2})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mqtt_source_fetch_and_watch() {
        let (transport, broker) = MockTransport::new();
        broker.connect_ack();
        broker.deliver("site/app", br#"{"name": "bridge"}"#.to_vec());
        broker.deliver("site/other/deep", br#"{"ignored": true}"#.to_vec());

        let source = MqttSource::start(transport, "site/", ReconnectConfig::default())
            .await
            .expect("start");
        assert_eq!(broker.subscriptions(), vec!["site/+".to_string()]);

        let app = source.fetch(APP_KEY).await.expect("fetch");
        assert_eq!(app, json!({"name": "bridge"}));

        let mut updates = source.watch(TRANSFORM_KEY).await.expect("watch");
        broker.deliver("site/transform", br#"{"scale": 1.0}"#.to_vec());
        broker.deliver("site/transform", b"not json".to_vec());
        broker.deliver("site/transform", br#"{"scale": 2.0}"#.to_vec());

        let mut seen = Vec::new();
        while let Ok(Some(doc)) = tokio::time::timeout(Duration::from_secs(1), updates.recv()).await {
            seen.push(doc);
        }
        assert_eq!(seen.last(), Some(&json!({"scale": 2.0})));
        assert!(seen.iter().all(|d| d["scale"].is_number()));

        source.close().await;
        assert!(broker.disconnected());
    }
}
