//! Defines the telemetry event sinks and the instrumentation wrapper
//! applied around every handler.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Properties attached to a telemetry event.
pub type Properties = BTreeMap<String, Value>;

/// Emitted before a handler starts working.
pub const STARTED_EVENT: &str = "FunctionStarted";

/// Emitted after a handler finishes, successfully or not.
pub const ENDED_EVENT: &str = "FunctionEnded";

/// Emitted when a caller requests a simulated throttle.
pub const THROTTLE_EVENT: &str = "ThrottleEvent";

/// Emitted when the storage service rate-limits an invocation.
pub const STORAGE_THROTTLED_EVENT: &str = "StorageThrottled";

/// A destination for telemetry events.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Records an event. Sinks may buffer it until the next flush.
    fn track_event(&self, name: &str, properties: Properties) -> Result<()>;

    /// Ships every buffered event.
    async fn flush(&self) -> Result<()>;
}

/// Writes events to the log. Used when no instrumentation key is
/// configured.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl TelemetrySink for LogSink {
    fn track_event(&self, name: &str, properties: Properties) -> Result<()> {
        info!(
            event = name,
            properties = %serde_json::to_string(&properties)?,
            "Telemetry event"
        );
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Event payload in the ingestion envelope.
#[derive(Debug, Serialize)]
struct EventData {
    ver: u8,
    name: String,
    properties: BTreeMap<String, String>,
    measurements: BTreeMap<String, f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeData {
    base_type: &'static str,
    base_data: EventData,
}

/// A single event as accepted by the ingestion endpoint.
#[derive(Debug, Serialize)]
struct Envelope {
    name: &'static str,
    time: String,
    #[serde(rename = "iKey")]
    ikey: String,
    data: EnvelopeData,
}

/// Buffers events and posts them to an HTTP ingestion endpoint on
/// flush.
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
    instrumentation_key: String,
    buffer: Mutex<Vec<Envelope>>,
}

impl HttpSink {
    /// Builds a sink whose requests give up after `timeout`, so an
    /// awaited flush never holds a handler longer than that.
    pub fn new(endpoint: &str, instrumentation_key: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build the telemetry HTTP client")?;
        Ok(Self {
            client,
            endpoint: String::from(endpoint),
            instrumentation_key: String::from(instrumentation_key),
            buffer: Mutex::new(Vec::new()),
        })
    }

    /// Wraps an event in its ingestion envelope. Numbers become
    /// measurements and everything else a string property.
    fn envelope(&self, name: &str, properties: Properties) -> Envelope {
        let mut props = BTreeMap::new();
        let mut measurements = BTreeMap::new();
        for (key, value) in properties {
            match value {
                Value::Number(n) => {
                    if let Some(n) = n.as_f64() {
                        measurements.insert(key, n);
                    }
                }
                Value::String(s) => {
                    props.insert(key, s);
                }
                Value::Null => (),
                other => {
                    props.insert(key, other.to_string());
                }
            }
        }
        Envelope {
            name: "Microsoft.ApplicationInsights.Event",
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            ikey: self.instrumentation_key.clone(),
            data: EnvelopeData {
                base_type: "EventData",
                base_data: EventData {
                    ver: 2,
                    name: String::from(name),
                    properties: props,
                    measurements,
                },
            },
        }
    }

    fn take_buffer(&self) -> Result<Vec<Envelope>> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| anyhow!("telemetry buffer lock is poisoned"))?;
        Ok(std::mem::take(&mut *buffer))
    }
}

#[async_trait]
impl TelemetrySink for HttpSink {
    fn track_event(&self, name: &str, properties: Properties) -> Result<()> {
        let envelope = self.envelope(name, properties);
        self.buffer
            .lock()
            .map_err(|_| anyhow!("telemetry buffer lock is poisoned"))?
            .push(envelope);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let batch = self.take_buffer()?;
        if batch.is_empty() {
            return Ok(());
        }
        let count = batch.len();
        self.client
            .post(&self.endpoint)
            .json(&batch)
            .send()
            .await
            .with_context(|| format!("Failed to post {} telemetry events", count))?
            .error_for_status()
            .with_context(|| format!("Telemetry endpoint rejected {} events", count))?;
        Ok(())
    }
}

/// Whether an emission waits for the sink to flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Flush on a detached task; the handler doesn't wait.
    Background,
    /// Flush before returning to the handler.
    Await,
}

/// The outcome reported in the ended event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "Success",
            Outcome::Error => "Error",
        }
    }
}

/// Best-effort event emission around handler bodies. Sink failures
/// are logged and never reach the caller.
#[derive(Clone)]
pub struct Instrumentation {
    sink: Arc<dyn TelemetrySink>,
    lifecycle_flush: FlushMode,
    throttle_flush: FlushMode,
}

impl Instrumentation {
    pub fn new(
        sink: Arc<dyn TelemetrySink>,
        lifecycle_flush: FlushMode,
        throttle_flush: FlushMode,
    ) -> Self {
        Self {
            sink,
            lifecycle_flush,
            throttle_flush,
        }
    }

    /// Reports that a handler started working.
    pub async fn started(&self, handler: &str, invocation_id: &str, cold_start: bool) {
        let mut properties = Properties::new();
        properties.insert("functionName".into(), handler.into());
        properties.insert("invocationId".into(), invocation_id.into());
        properties.insert("coldStart".into(), cold_start.into());
        self.emit(STARTED_EVENT, properties, self.lifecycle_flush).await;
    }

    /// Reports that a handler finished. `extra` carries stage timings
    /// and other details.
    #[allow(clippy::too_many_arguments)]
    pub async fn ended(
        &self,
        handler: &str,
        invocation_id: &str,
        cold_start: bool,
        duration_ms: u64,
        outcome: Outcome,
        error: Option<&str>,
        extra: Properties,
    ) {
        let mut properties = extra;
        properties.insert("functionName".into(), handler.into());
        properties.insert("invocationId".into(), invocation_id.into());
        properties.insert("coldStart".into(), cold_start.into());
        properties.insert("durationMs".into(), duration_ms.into());
        properties.insert("outcome".into(), outcome.as_str().into());
        if let Some(error) = error {
            properties.insert("error".into(), error.into());
        }
        self.emit(ENDED_EVENT, properties, self.lifecycle_flush).await;
    }

    /// Reports a simulated throttle.
    pub async fn throttled(&self, handler: &str) {
        let mut properties = Properties::new();
        properties.insert("functionName".into(), handler.into());
        self.emit(THROTTLE_EVENT, properties, self.throttle_flush).await;
    }

    /// Reports that the storage service rate-limited an invocation.
    pub async fn storage_throttled(&self, handler: &str, invocation_id: &str, error: &str) {
        let mut properties = Properties::new();
        properties.insert("functionName".into(), handler.into());
        properties.insert("invocationId".into(), invocation_id.into());
        properties.insert("error".into(), error.into());
        self.emit(STORAGE_THROTTLED_EVENT, properties, self.lifecycle_flush).await;
    }

    async fn emit(&self, name: &str, properties: Properties, flush: FlushMode) {
        if let Err(e) = self.sink.track_event(name, properties) {
            warn!("Couldn't track telemetry event {:?}: {:?}", name, e);
            return;
        }
        match flush {
            FlushMode::Await => {
                if let Err(e) = self.sink.flush().await {
                    warn!("Couldn't flush telemetry: {:?}", e);
                }
            }
            FlushMode::Background => {
                let sink = Arc::clone(&self.sink);
                tokio::spawn(async move {
                    if let Err(e) = sink.flush().await {
                        warn!("Couldn't flush telemetry: {:?}", e);
                    }
                });
            }
        }
    }
}
