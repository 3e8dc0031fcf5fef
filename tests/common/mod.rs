//! In-memory collaborators for driving the pipeline in tests.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use image_pipeline::cold_start::ColdStart;
use image_pipeline::naming::NamingRule;
use image_pipeline::pipeline::Pipeline;
use image_pipeline::storage::{ObjectStore, StorageError};
use image_pipeline::telemetry::{FlushMode, Instrumentation, Properties, TelemetrySink};
use image_pipeline::transform::{
    ImageCodec, ImageTransform, TransformError, TransformSpec, THUMBNAIL,
};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A stored object.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub body: Vec<u8>,
    pub content_type: String,
}

/// Containers and objects kept in memory. Every call is counted, and
/// uploads can be made to fail with a given status.
#[derive(Default)]
pub struct MemoryStore {
    pub containers: Mutex<BTreeSet<String>>,
    pub objects: Mutex<BTreeMap<(String, String), Object>>,
    pub calls: AtomicUsize,
    pub creates: AtomicUsize,
    pub fail_uploads_with: Mutex<Option<u16>>,
}

impl MemoryStore {
    pub fn with_object(container: &str, key: &str, body: Vec<u8>) -> Self {
        let store = MemoryStore::default();
        store.containers.lock().unwrap().insert(container.into());
        store.objects.lock().unwrap().insert(
            (container.into(), key.into()),
            Object {
                body,
                content_type: "image/png".into(),
            },
        );
        store
    }

    pub fn get(&self, container: &str, key: &str) -> Option<Object> {
        self.objects
            .lock()
            .unwrap()
            .get(&(container.to_string(), key.to_string()))
            .cloned()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn exists(&self, container: &str) -> Result<bool, StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.containers.lock().unwrap().contains(container))
    }

    async fn create(&self, container: &str) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.containers.lock().unwrap().insert(container.into());
        Ok(())
    }

    async fn download(&self, container: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.get(container, key)
            .map(|o| o.body)
            .ok_or_else(|| StorageError::NotFound {
                container: container.into(),
                key: key.into(),
            })
    }

    async fn upload(
        &self,
        container: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = *self.fail_uploads_with.lock().unwrap() {
            return Err(StorageError::Service {
                operation: "PutObject".into(),
                status: Some(status),
                code: None,
                message: "injected failure".into(),
            });
        }
        self.objects.lock().unwrap().insert(
            (container.into(), key.into()),
            Object {
                body,
                content_type: content_type.into(),
            },
        );
        Ok(())
    }
}

/// Keeps every tracked event, counting flushes.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<(String, Properties)>>,
    pub flushes: AtomicUsize,
}

impl RecordingSink {
    pub fn named(&self, name: &str) -> Vec<Properties> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[async_trait]
impl TelemetrySink for RecordingSink {
    fn track_event(&self, name: &str, properties: Properties) -> Result<()> {
        self.events.lock().unwrap().push((name.into(), properties));
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Delegates to the real codec, counting calls.
#[derive(Default)]
pub struct CountingTransform {
    pub calls: AtomicUsize,
}

impl ImageTransform for CountingTransform {
    fn apply(&self, source: &[u8], spec: &TransformSpec) -> Result<Vec<u8>, TransformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ImageCodec.apply(source, spec)
    }
}

/// A pipeline wired to in-memory collaborators.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub sink: Arc<RecordingSink>,
    pub transformer: Arc<CountingTransform>,
    pub pipeline: Pipeline,
}

impl Harness {
    pub fn new(store: MemoryStore) -> Self {
        Self::wire(Arc::new(store), true, NamingRule::Prefix)
    }

    pub fn with_naming(store: MemoryStore, naming: NamingRule) -> Self {
        Self::wire(Arc::new(store), true, naming)
    }

    pub fn unconfigured() -> Self {
        Self::wire(Arc::new(MemoryStore::default()), false, NamingRule::Prefix)
    }

    fn wire(store: Arc<MemoryStore>, configured: bool, naming: NamingRule) -> Self {
        let sink = Arc::new(RecordingSink::default());
        let transformer = Arc::new(CountingTransform::default());
        let dyn_store: Arc<dyn ObjectStore> = store.clone();
        let pipeline = Pipeline {
            store: if configured {
                Ok(dyn_store)
            } else {
                Err("Storage connection string is missing.".into())
            },
            transformer: transformer.clone(),
            spec: THUMBNAIL,
            instrumentation: Instrumentation::new(
                sink.clone(),
                FlushMode::Background,
                FlushMode::Await,
            ),
            cold_start: ColdStart::new(),
            naming,
            raw_container: "upload".into(),
            processed_container: "process".into(),
        };
        Self {
            store,
            sink,
            transformer,
            pipeline,
        }
    }

    pub fn transform_calls(&self) -> usize {
        self.transformer.calls.load(Ordering::SeqCst)
    }
}

/// Encodes a two-tone PNG of the given size.
pub fn png(width: u32, height: u32) -> Vec<u8> {
    gradient(width, height, ImageFormat::Png)
}

/// Encodes a two-tone JPEG of the given size.
pub fn jpeg(width: u32, height: u32) -> Vec<u8> {
    gradient(width, height, ImageFormat::Jpeg)
}

fn gradient(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), format)
        .expect("source encodes");
    out
}
