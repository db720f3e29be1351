use crate::{ByteStream, ObjectListing, StorageError, StorageProvider, DELETE_BATCH_SIZE};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::types::{Delete, ObjectIdentifier, StorageClass};
use aws_sdk_s3::Client;
use bytes::Bytes;
use log::{debug, info};
use std::path::Path;

/// AWS S3 storage provider (also serves MinIO, R2 and other S3-compatible
/// endpoints via `AWS_ENDPOINT`).
pub struct S3Provider {
    client: Client,
    bucket: String,
}

impl S3Provider {
    /// Creates a new S3 provider for one bucket. Credentials and region
    /// come from the standard SDK environment chain; `AWS_ENDPOINT` and
    /// `AWS_S3_FORCE_PATH_STYLE` select custom endpoints.
    pub async fn new(bucket: &str) -> Result<Self, StorageError> {
        let mut config_builder = aws_config::defaults(BehaviorVersion::latest());

        // Explicit credentials take precedence over the SDK's own chain.
        if let (Ok(access_key), Ok(secret_key)) = (
            std::env::var("AWS_ACCESS_KEY_ID"),
            std::env::var("AWS_SECRET_ACCESS_KEY"),
        ) {
            let credentials = aws_credential_types::Credentials::new(
                access_key,
                secret_key,
                std::env::var("AWS_SESSION_TOKEN").ok(),
                None,
                "environment",
            );
            config_builder =
                config_builder.credentials_provider(SharedCredentialsProvider::new(credentials));
        }

        let endpoint = std::env::var("AWS_ENDPOINT").ok();
        if let Some(ref endpoint) = endpoint {
            info!("Using custom endpoint: {endpoint}");
            config_builder = config_builder.endpoint_url(endpoint);
        }

        let sdk_config = config_builder.load().await;

        let mut force_path_style = endpoint.is_some();
        if let Ok(flag) = std::env::var("AWS_S3_FORCE_PATH_STYLE") {
            force_path_style = flag.parse().map_err(|_| {
                StorageError::Configuration(format!(
                    "failed to parse AWS_S3_FORCE_PATH_STYLE '{flag}'"
                ))
            })?;
        }

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }
        let client = Client::from_conf(s3_config_builder.build());

        Ok(Self {
            client,
            bucket: bucket.to_string(),
        })
    }
}

#[async_trait]
impl StorageProvider for S3Provider {
    fn name(&self) -> &str {
        "s3"
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(from_sdk("HeadObject", err))
                }
            }
        }
    }

    async fn etag(&self, key: &str) -> Result<String, StorageError> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| from_sdk("HeadObject", e))?;
        head.e_tag()
            .map(str::to_owned)
            .ok_or_else(|| StorageError::Fatal(format!("no ETag returned for '{key}'")))
    }

    async fn get(&self, key: &str) -> Result<ByteStream, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| from_sdk("GetObject", e))?;
        Ok(Box::pin(output.body.into_async_read()))
    }

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        storage_class: Option<&str>,
    ) -> Result<(), StorageError> {
        debug!("putting {} bytes at '{key}'", body.len());
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(aws_sdk_s3::primitives::ByteStream::from(body))
            .set_storage_class(storage_class.map(StorageClass::from))
            .send()
            .await
            .map_err(|e| from_sdk("PutObject", e))?;
        Ok(())
    }

    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        storage_class: Option<&str>,
    ) -> Result<(), StorageError> {
        let body = aws_sdk_s3::primitives::ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::Fatal(format!("failed to open '{}': {e}", path.display())))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .set_storage_class(storage_class.map(StorageClass::from))
            .send()
            .await
            .map_err(|e| from_sdk("PutObject", e))?;
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Result<Vec<ObjectListing>, StorageError> {
        let mut listing = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .set_delimiter(delimiter.map(str::to_owned))
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| from_sdk("ListObjectsV2", e))?;
            for object in page.contents() {
                let key = match object.key() {
                    Some(key) => key.to_string(),
                    None => continue,
                };
                let last_modified = object
                    .last_modified()
                    .and_then(|t| chrono::DateTime::from_timestamp(t.secs(), 0))
                    .unwrap_or_else(chrono::Utc::now);
                listing.push(ObjectListing { key, last_modified });
            }
        }
        Ok(listing)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StorageError> {
        for chunk in keys.chunks(DELETE_BATCH_SIZE) {
            let identifiers = chunk
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StorageError::Fatal(format!("bad delete key: {e}")))?;
            let delete = Delete::builder()
                .set_objects(Some(identifiers))
                .build()
                .map_err(|e| StorageError::Fatal(format!("bad delete request: {e}")))?;
            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| from_sdk("DeleteObjects", e))?;
        }
        Ok(())
    }
}

/// Maps SDK failures onto the storage error taxonomy. Throttling and
/// connectivity failures become `Transient` so the retry layer absorbs them.
fn from_sdk<E, R>(what: &str, err: SdkError<E, R>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let code = err.code().map(str::to_owned);
    let transport_failure = matches!(
        err,
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_)
    );
    let message = format!("{what}: {}", DisplayErrorContext(&err));

    if transport_failure {
        return StorageError::Transient(message);
    }
    match code.as_deref() {
        Some("NoSuchKey") | Some("NotFound") | Some("NoSuchBucket") => {
            StorageError::NotFound(message)
        }
        Some("AccessDenied") | Some("InvalidAccessKeyId") | Some("SignatureDoesNotMatch")
        | Some("ExpiredToken") | Some("TokenRefreshRequired") => {
            StorageError::AuthFailure(message)
        }
        Some("SlowDown") | Some("RequestTimeout") | Some("InternalError")
        | Some("ServiceUnavailable") | Some("503") => StorageError::Transient(message),
        _ => StorageError::Fatal(message),
    }
}
