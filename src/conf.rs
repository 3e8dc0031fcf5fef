//! Defines configuration as read from the environment.

use crate::naming::NamingRule;
use serde::Deserialize;

/// Default `raw_container` value.
fn default_raw_container() -> String {
    String::from("upload")
}

/// Default `processed_container` value.
fn default_processed_container() -> String {
    String::from("process")
}

/// Default `telemetry_endpoint` value.
fn default_telemetry_endpoint() -> String {
    String::from("https://dc.services.visualstudio.com/v2/track")
}

/// Default `telemetry_timeout_ms` value.
fn default_telemetry_timeout_ms() -> u64 {
    2000
}

/// Default `await_throttle_flush` value.
fn default_await_throttle_flush() -> bool {
    true
}

/// Both pipeline stages are configured through environment
/// variables. Only the storage connection is required to serve
/// requests, and even its absence is reported per invocation rather
/// than at startup.
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// The connection string for the object storage, given as
    /// `Key=Value` pairs separated by semicolons. See
    /// [`crate::client::ConnectionString`] for the recognized keys.
    #[serde(default, alias = "azurewebjobsstorage")]
    pub storage_connection_string: Option<String>,

    /// The instrumentation key used to ship telemetry events. If
    /// omitted, events are only written to the log.
    #[serde(default, alias = "appinsights_instrumentationkey")]
    pub telemetry_instrumentation_key: Option<String>,

    /// The ingestion endpoint telemetry batches are posted to.
    #[serde(default = "default_telemetry_endpoint")]
    pub telemetry_endpoint: String,

    /// How long, in milliseconds, a telemetry request may take before
    /// it's abandoned.
    #[serde(default = "default_telemetry_timeout_ms")]
    pub telemetry_timeout_ms: u64,

    /// The container receiving raw uploads.
    #[serde(default = "default_raw_container")]
    pub raw_container: String,

    /// The container receiving processed images and status records.
    #[serde(default = "default_processed_container")]
    pub processed_container: String,

    /// The rule deriving processed object names from source names.
    #[serde(default)]
    pub naming_rule: NamingRule,

    /// Whether started/ended events are flushed before the handler
    /// returns.
    #[serde(default)]
    pub await_lifecycle_flush: bool,

    /// Whether the simulated throttle event is flushed before the
    /// handler returns.
    #[serde(default = "default_await_throttle_flush")]
    pub await_throttle_flush: bool,
}

impl Settings {
    /// The storage connection string, if it's present and not blank.
    pub fn storage_connection(&self) -> Option<&str> {
        non_blank(&self.storage_connection_string)
    }

    /// The telemetry instrumentation key, if it's present and not
    /// blank.
    pub fn instrumentation_key(&self) -> Option<&str> {
        non_blank(&self.telemetry_instrumentation_key)
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
