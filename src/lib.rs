//! A two-stage image pipeline: an ingest handler storing raw uploads
//! and a transform handler publishing resized copies alongside a
//! status record.

pub mod app;
pub mod client;
pub mod cold_start;
pub mod conf;
pub mod error;
pub mod http;
pub mod naming;
pub mod pipeline;
pub mod storage;
pub mod telemetry;
pub mod transform;
