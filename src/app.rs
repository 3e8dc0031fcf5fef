//! Defines the per-process application state shared by every
//! invocation served by an execution environment.

use crate::client::{ConnectionString, S3Store};
use crate::cold_start::ColdStart;
use crate::conf::Settings;
use crate::http::{HttpResponse, Invocation};
use crate::pipeline::Pipeline;
use crate::storage::ObjectStore;
use crate::telemetry::{FlushMode, HttpSink, Instrumentation, LogSink, TelemetrySink};
use crate::transform::{ImageCodec, THUMBNAIL};
use anyhow::{anyhow, Context, Result};
use envy::from_env;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};

/// An App is an initialized application state, derived from
/// settings. It owns the pipeline and, through it, the cold start
/// flag of this execution environment.
pub struct App {
    /// The original settings.
    pub settings: Settings,

    /// The pipeline serving both handlers.
    pub pipeline: Pipeline,
}

impl App {
    /// Initialize an App instance given a settings struct. Consumes
    /// the settings struct.
    pub async fn new(settings: Settings) -> Result<Self> {
        let store = match settings.storage_connection() {
            Some(raw) => connect(raw).await.map_err(|e| format!("{:#}", e)),
            None => Err(String::from("Storage connection string is missing.")),
        };
        if let Err(reason) = &store {
            warn!("Storage is unusable; every invocation will fail: {}", reason);
        }
        let timeout = Duration::from_millis(settings.telemetry_timeout_ms);
        let sink: Arc<dyn TelemetrySink> = match settings.instrumentation_key() {
            Some(key) => match HttpSink::new(&settings.telemetry_endpoint, key, timeout) {
                Ok(sink) => Arc::new(sink),
                Err(e) => {
                    warn!("Telemetry sink is unusable; events will only be logged: {:#}", e);
                    Arc::new(LogSink)
                }
            },
            None => {
                warn!("Telemetry instrumentation key is missing; events will only be logged");
                Arc::new(LogSink)
            }
        };
        let flush_mode = |wait: bool| {
            if wait {
                FlushMode::Await
            } else {
                FlushMode::Background
            }
        };
        let pipeline = Pipeline {
            store,
            transformer: Arc::new(ImageCodec),
            spec: THUMBNAIL,
            instrumentation: Instrumentation::new(
                sink,
                flush_mode(settings.await_lifecycle_flush),
                flush_mode(settings.await_throttle_flush),
            ),
            cold_start: ColdStart::new(),
            naming: settings.naming_rule,
            raw_container: settings.raw_container.clone(),
            processed_container: settings.processed_container.clone(),
        };
        Ok(App { settings, pipeline })
    }

    /// Handle an ingest request.
    #[instrument(skip(self, invocation))]
    pub async fn ingest(&self, invocation: Invocation, invocation_id: &str) -> HttpResponse {
        self.pipeline.ingest(&invocation, invocation_id).await
    }

    /// Handle a transform request.
    #[instrument(skip(self, invocation))]
    pub async fn transform(&self, invocation: Invocation, invocation_id: &str) -> HttpResponse {
        self.pipeline.transform(&invocation, invocation_id).await
    }
}

/// Connects to the storage described by a raw connection string.
async fn connect(raw: &str) -> Result<Arc<dyn ObjectStore>> {
    let connection =
        ConnectionString::parse(raw).context("Failed to parse the storage connection string")?;
    let store = S3Store::connect(&connection)
        .await
        .context("Failed to configure the storage client")?;
    Ok(Arc::new(store))
}

/// Global App instance.
static CURRENT: OnceCell<App> = OnceCell::new();

/// Initialize the global App instance.
pub async fn init() -> Result<()> {
    let settings = from_env()?;
    let app = App::new(settings).await?;
    CURRENT
        .set(app)
        .map_err(|_| anyhow!("app::CURRENT was already initialized"))
}

/// Get the current App instance, or panic if it hasn't been
/// initialized.
pub fn current() -> &'static App {
    CURRENT.get().expect("app is not initialized")
}
