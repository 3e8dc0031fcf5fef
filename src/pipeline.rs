//! The fetch, transform, publish and record pipeline behind both
//! handlers.

use crate::cold_start::ColdStart;
use crate::error::PipelineError;
use crate::http::{
    decode_base64, ErrorResponse, HttpResponse, IngestResponse, Invocation, StatusRecord,
    TransformResponse,
};
use crate::naming::NamingRule;
use crate::storage::ObjectStore;
use crate::telemetry::{Instrumentation, Outcome, Properties};
use crate::transform::{ImageTransform, TransformError, TransformSpec};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

/// Content type of raw uploads.
const RAW_CONTENT_TYPE: &str = "image/jpeg";

/// Content type of status records.
const STATUS_CONTENT_TYPE: &str = "application/json";

const INGEST_MESSAGE: &str = "Image uploaded successfully!";
const TRANSFORM_MESSAGE: &str = "Image processed successfully!";

/// The entry points served by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    /// Stores a base64-encoded image verbatim.
    Ingest,
    /// Resizes a stored image and publishes it with a status record.
    Transform,
}

impl Handler {
    /// The logical name reported in logs and telemetry.
    pub fn name(&self) -> &'static str {
        match self {
            Handler::Ingest => "uploadImage",
            Handler::Transform => "processImage",
        }
    }
}

/// A timed sub-stage of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    EnsureContainer,
    Upload,
    Fetch,
    Transform,
    Publish,
    Record,
}

impl Stage {
    /// The telemetry property holding the stage's duration.
    pub fn property(&self) -> &'static str {
        match self {
            Stage::EnsureContainer => "ensureContainerMs",
            Stage::Upload => "uploadMs",
            Stage::Fetch => "fetchMs",
            Stage::Transform => "transformMs",
            Stage::Publish => "publishMs",
            Stage::Record => "recordMs",
        }
    }
}

/// Per-call state, discarded when the invocation returns.
#[derive(Debug)]
pub struct InvocationContext {
    pub handler: Handler,
    pub invocation_id: String,
    pub cold_start: bool,
    started: Instant,
    /// Recorded stage durations, in milliseconds.
    pub stages: Vec<(Stage, u64)>,
}

impl InvocationContext {
    fn new(handler: Handler, invocation_id: &str, cold_start: bool) -> Self {
        Self {
            handler,
            invocation_id: String::from(invocation_id),
            cold_start,
            started: Instant::now(),
            stages: Vec::new(),
        }
    }

    /// Milliseconds since the invocation started.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Awaits a stage, recording how long it took.
    async fn timed<T, F: Future<Output = T>>(&mut self, stage: Stage, fut: F) -> T {
        let start = Instant::now();
        let output = fut.await;
        let elapsed = start.elapsed().as_millis() as u64;
        info!(stage = ?stage, elapsed_ms = elapsed, "Stage finished");
        self.stages.push((stage, elapsed));
        output
    }

    fn stage_properties(&self) -> Properties {
        self.stages
            .iter()
            .map(|(stage, ms)| (String::from(stage.property()), (*ms).into()))
            .collect()
    }
}

/// What a successful handler body produced.
enum Success {
    Ingested,
    Transformed { processed_key: String },
}

/// Everything the pipeline needs, injected at construction.
pub struct Pipeline {
    /// Holds why storage is unusable when it isn't configured.
    pub store: Result<Arc<dyn ObjectStore>, String>,
    pub transformer: Arc<dyn ImageTransform>,
    pub spec: TransformSpec,
    pub instrumentation: Instrumentation,
    pub cold_start: ColdStart,
    pub naming: NamingRule,
    pub raw_container: String,
    pub processed_container: String,
}

impl Pipeline {
    /// Stores a base64-encoded image in the raw container.
    pub async fn ingest(&self, invocation: &Invocation, invocation_id: &str) -> HttpResponse {
        self.invoke(Handler::Ingest, invocation, invocation_id).await
    }

    /// Resizes a stored image and publishes it to the processed
    /// container.
    pub async fn transform(&self, invocation: &Invocation, invocation_id: &str) -> HttpResponse {
        self.invoke(Handler::Transform, invocation, invocation_id).await
    }

    /// Runs a handler body inside the throttle check and the
    /// instrumentation wrapper, and shapes its response.
    #[instrument(skip(self, handler, invocation), fields(handler = handler.name()))]
    async fn invoke(
        &self,
        handler: Handler,
        invocation: &Invocation,
        invocation_id: &str,
    ) -> HttpResponse {
        if invocation.simulate_throttle {
            info!("Simulating throttle response");
            self.instrumentation.throttled(handler.name()).await;
            return HttpResponse::throttled();
        }

        let mut ctx = InvocationContext::new(handler, invocation_id, self.cold_start.mark());
        self.instrumentation
            .started(handler.name(), invocation_id, ctx.cold_start)
            .await;

        let result = match handler {
            Handler::Ingest => self.ingest_body(invocation, &mut ctx).await,
            Handler::Transform => self.transform_body(invocation, &mut ctx).await,
        };
        let execution_time = ctx.elapsed_ms();
        info!(
            "Overall execution time: {} ms, Cold start: {}",
            execution_time, ctx.cold_start
        );

        let (response, outcome, error_message) = match result {
            Ok(success) => {
                let response = match success {
                    Success::Ingested => HttpResponse::json(
                        200,
                        &IngestResponse {
                            message: String::from(INGEST_MESSAGE),
                            execution_time,
                        },
                    ),
                    Success::Transformed { processed_key } => HttpResponse::json(
                        200,
                        &TransformResponse {
                            message: String::from(TRANSFORM_MESSAGE),
                            processed_key,
                            cold_start: ctx.cold_start,
                            execution_time,
                        },
                    ),
                };
                (response, Outcome::Success, None)
            }
            Err(e) => {
                let message = e.to_string();
                if e.is_throttled() {
                    warn!("Storage is throttling {}: {}", handler.name(), message);
                    self.instrumentation
                        .storage_throttled(handler.name(), invocation_id, &message)
                        .await;
                }
                error!("{} error: {}", handler.name(), message);
                let response = HttpResponse::json(
                    e.status_code(),
                    &ErrorResponse {
                        error: message.clone(),
                        cold_start: ctx.cold_start,
                        execution_time,
                    },
                );
                (response, Outcome::Error, Some(message))
            }
        };

        self.instrumentation
            .ended(
                handler.name(),
                invocation_id,
                ctx.cold_start,
                execution_time,
                outcome,
                error_message.as_deref(),
                ctx.stage_properties(),
            )
            .await;
        response
    }

    fn store(&self) -> Result<&Arc<dyn ObjectStore>, PipelineError> {
        self.store
            .as_ref()
            .map_err(|reason| PipelineError::Configuration(reason.clone()))
    }

    async fn ingest_body(
        &self,
        invocation: &Invocation,
        ctx: &mut InvocationContext,
    ) -> Result<Success, PipelineError> {
        let (image, file_name) = match (invocation.field("image"), invocation.field("fileName")) {
            (Some(image), Some(file_name)) => (image, file_name),
            _ => {
                return Err(PipelineError::ClientInput(String::from(
                    "Missing image or fileName",
                )))
            }
        };
        let buffer = decode_base64(image).map_err(|e| {
            PipelineError::ClientInput(format!("image is not valid base64: {}", e))
        })?;
        let store = self.store()?;

        let container = self.raw_container.as_str();
        ctx.timed(Stage::EnsureContainer, async {
            if !store.exists(container).await? {
                info!("Creating container {:?}", container);
                store.create(container).await?;
            }
            Ok::<_, PipelineError>(())
        })
        .await?;

        info!("Uploading {} bytes to {:?}", buffer.len(), file_name);
        ctx.timed(
            Stage::Upload,
            store.upload(container, file_name, buffer, RAW_CONTENT_TYPE),
        )
        .await?;
        Ok(Success::Ingested)
    }

    async fn transform_body(
        &self,
        invocation: &Invocation,
        ctx: &mut InvocationContext,
    ) -> Result<Success, PipelineError> {
        let (container, file_name) = match (
            invocation.field("containerName"),
            invocation.field("fileName"),
        ) {
            (Some(container), Some(file_name)) => (container, file_name),
            _ => {
                return Err(PipelineError::ClientInput(String::from(
                    "Missing containerName or fileName",
                )))
            }
        };
        let store = self.store()?;

        info!("Downloading {:?} from {:?}", file_name, container);
        let source = ctx
            .timed(Stage::Fetch, store.download(container, file_name))
            .await?;

        let transformer = Arc::clone(&self.transformer);
        let spec = self.spec;
        let processed = ctx
            .timed(
                Stage::Transform,
                tokio::task::spawn_blocking(move || transformer.apply(&source, &spec)),
            )
            .await
            .map_err(|e| TransformError::Aborted(e.to_string()))??;

        let processed_key = self.naming.processed_key(file_name);
        info!("Processed file name: {}", processed_key);
        ctx.timed(
            Stage::Publish,
            store.upload(
                &self.processed_container,
                &processed_key,
                processed,
                self.spec.format.content_type(),
            ),
        )
        .await?;

        let status_key = self.naming.status_key(file_name);
        let record = StatusRecord {
            message: String::from(TRANSFORM_MESSAGE),
            processed_key: processed_key.clone(),
            cold_start: ctx.cold_start,
            execution_time: None,
        };
        let record = serde_json::to_vec(&record)?;
        info!("Uploading status file: {}", status_key);
        ctx.timed(
            Stage::Record,
            store.upload(
                &self.processed_container,
                &status_key,
                record,
                STATUS_CONTENT_TYPE,
            ),
        )
        .await?;

        info!("Memory usage: {} KB", resident_memory_kb());
        Ok(Success::Transformed { processed_key })
    }
}

/// Resident memory of this process, read from `/proc/self/statm`.
/// Zero where that isn't available.
fn resident_memory_kb() -> u64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|s| s.split_whitespace().nth(1)?.parse::<u64>().ok())
        .map(|pages| pages * 4)
        .unwrap_or(0)
}
