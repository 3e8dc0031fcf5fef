//! Defines the HTTP surface of the handlers: parsing proxy requests
//! and shaping proxy responses.

use aws_lambda_events::event::apigw::ApiGatewayProxyRequest;
use base64ct::{Base64, Base64Unpadded, Encoding};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// The flag requesting a simulated throttle.
const SIMULATE_THROTTLE: &str = "simulateThrottle";

/// The fixed body of a simulated throttle response.
pub const THROTTLED_BODY: &str = "Throttled due to simulation.";

/// A parsed handler request.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// The JSON body. Anything but an object is treated as empty.
    pub body: Map<String, Value>,

    /// Whether a throttle simulation was requested.
    pub simulate_throttle: bool,
}

impl Invocation {
    /// Builds an invocation from a raw body and the raw
    /// `simulateThrottle` query parameter.
    pub fn new(body: Option<&str>, throttle_param: Option<&str>) -> Self {
        let body = match body.map(serde_json::from_str::<Value>) {
            Some(Ok(Value::Object(map))) => map,
            _ => Map::new(),
        };
        let simulate_throttle = throttle_param.map(truthy_str).unwrap_or(false)
            || body.get(SIMULATE_THROTTLE).map(truthy).unwrap_or(false);
        Self {
            body,
            simulate_throttle,
        }
    }

    /// A non-empty string field of the body.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.body
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

impl From<ApiGatewayProxyRequest> for Invocation {
    fn from(request: ApiGatewayProxyRequest) -> Self {
        let body = match request.body {
            Some(body) if request.is_base64_encoded => decode_base64(&body)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok()),
            body => body,
        };
        Invocation::new(
            body.as_deref(),
            request.query_string_parameters.first(SIMULATE_THROTTLE),
        )
    }
}

/// Decodes base64 the way clients tend to send it: padded or not,
/// possibly wrapped across lines.
pub fn decode_base64(input: &str) -> Result<Vec<u8>, base64ct::Error> {
    let compact: String = input
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    Base64::decode_vec(&compact).or_else(|_| Base64Unpadded::decode_vec(&compact))
}

fn truthy_str(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::String(s) => truthy_str(s),
        _ => false,
    }
}

/// The response handed back to the proxy integration.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    /// A response with a JSON body.
    pub fn json<T: Serialize>(status_code: u16, body: &T) -> Self {
        match serde_json::to_string(body) {
            Ok(body) => Self::with_content_type(status_code, "application/json", body),
            Err(e) => Self::with_content_type(
                500,
                "text/plain",
                format!("Failed to serialize response: {}", e),
            ),
        }
    }

    /// The simulated throttle response.
    pub fn throttled() -> Self {
        Self::with_content_type(429, "text/plain", String::from(THROTTLED_BODY))
    }

    fn with_content_type(status_code: u16, content_type: &str, body: String) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(String::from("content-type"), String::from(content_type));
        Self {
            status_code,
            headers,
            body,
        }
    }
}

/// The body of a successful ingest.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub message: String,
    pub execution_time: u64,
}

/// The body of a successful transform.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformResponse {
    pub message: String,
    pub processed_key: String,
    pub cold_start: bool,
    pub execution_time: u64,
}

/// The body of any failed invocation.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub cold_start: bool,
    pub execution_time: u64,
}

/// The JSON sidecar written next to each processed image.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub message: String,
    pub processed_key: String,
    pub cold_start: bool,
    /// Never populated; kept for consumers expecting the field.
    pub execution_time: Option<u64>,
}
