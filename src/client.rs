//! Defines the S3-backed object store and the connection string that
//! configures it.

use crate::storage::{ObjectStore, StorageError};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client;
use std::collections::BTreeMap;
use tracing::warn;

/// The region S3 uses when no location constraint is given.
const DEFAULT_REGION: &str = "us-east-1";

/// Storage connection parameters, given as `Key=Value` pairs separated
/// by semicolons, e.g.
/// `Endpoint=http://localhost:9000;Region=eu-west-1;ForcePathStyle=true`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub force_path_style: bool,
}

impl ConnectionString {
    /// Parses a connection string. Keys are case-insensitive, and
    /// unknown keys are ignored.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut pairs = BTreeMap::new();
        for pair in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("Malformed storage connection string entry {:?}", pair))?;
            pairs.insert(key.trim().to_ascii_lowercase(), String::from(value.trim()));
        }
        let mut connection = ConnectionString::default();
        for (key, value) in pairs {
            match key.as_str() {
                "endpoint" => connection.endpoint = Some(value),
                "region" => connection.region = Some(value),
                "accesskeyid" => connection.access_key_id = Some(value),
                "secretaccesskey" => connection.secret_access_key = Some(value),
                "sessiontoken" => connection.session_token = Some(value),
                "forcepathstyle" => {
                    connection.force_path_style = value.parse::<bool>().with_context(|| {
                        format!("ForcePathStyle must be a boolean, got {:?}", value)
                    })?
                }
                other => warn!("Ignoring unknown storage connection key {:?}", other),
            }
        }
        Ok(connection)
    }

    /// The endpoint, with a scheme added when missing.
    fn endpoint_url(&self) -> Option<String> {
        self.endpoint.as_ref().map(|endpoint| {
            if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                endpoint.clone()
            } else {
                format!("https://{}", endpoint)
            }
        })
    }
}

/// An object store where each container is an S3 bucket.
pub struct S3Store {
    client: Client,
    region: String,
}

impl S3Store {
    /// Builds an S3 client from the connection parameters, falling
    /// back to the ambient AWS configuration for anything they don't
    /// set.
    pub async fn connect(connection: &ConnectionString) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &connection.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = connection.endpoint_url() {
            loader = loader.endpoint_url(endpoint);
        }
        match (&connection.access_key_id, &connection.secret_access_key) {
            (Some(key), Some(secret)) => {
                loader = loader.credentials_provider(Credentials::new(
                    key.clone(),
                    secret.clone(),
                    connection.session_token.clone(),
                    None,
                    "connection-string",
                ));
            }
            (None, None) => (),
            _ => {
                return Err(anyhow!(
                    "Storage connection string must give both AccessKeyId and SecretAccessKey"
                ))
            }
        }
        let sdk_config = loader.load().await;
        let region = sdk_config
            .region()
            .map(|r| r.to_string())
            .unwrap_or_else(|| String::from(DEFAULT_REGION));
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(connection.force_path_style)
            .build();
        Ok(Self {
            client: Client::from_conf(s3_config),
            region,
        })
    }
}

/// Converts an SDK failure into a structured storage error, keeping
/// the HTTP status and the service error code.
fn service_error<E>(operation: &str, err: SdkError<E>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    StorageError::Service {
        operation: String::from(operation),
        status: err.raw_response().map(|r| r.status().as_u16()),
        code: err.code().map(String::from),
        message: DisplayErrorContext(&err).to_string(),
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn exists(&self, container: &str) -> Result<bool, StorageError> {
        match self.client.head_bucket().bucket(container).send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                let missing = err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                    || err.raw_response().map(|r| r.status().as_u16()) == Some(404);
                if missing {
                    Ok(false)
                } else {
                    Err(service_error("HeadBucket", err))
                }
            }
        }
    }

    async fn create(&self, container: &str) -> Result<(), StorageError> {
        let mut operation = self.client.create_bucket().bucket(container);
        if self.region != DEFAULT_REGION {
            operation = operation.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        operation
            .send()
            .await
            .map_err(|err| service_error("CreateBucket", err))?;
        Ok(())
    }

    async fn download(&self, container: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(container)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    StorageError::NotFound {
                        container: String::from(container),
                        key: String::from(key),
                    }
                } else {
                    service_error("GetObject", err)
                }
            })?;
        let mut body = output.body;
        let mut buffer = Vec::new();
        while let Some(chunk) = body.try_next().await.map_err(|e| StorageError::Service {
            operation: String::from("GetObject"),
            status: None,
            code: None,
            message: format!("Failed to read body of {:?} in {:?}: {}", key, container, e),
        })? {
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer)
    }

    async fn upload(
        &self,
        container: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(container)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|err| service_error("PutObject", err))?;
        Ok(())
    }
}
