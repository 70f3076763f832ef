//! OpenDAL operators holding block ciphertext: any S3-compatible endpoint in
//! production, the in-process memory service for tests and offline runs.

use anyhow::{Context, Result};
use nimbus_core::config::StorageConfig;
use opendal::layers::{LoggingLayer, RetryLayer};
use opendal::Operator;
use secrecy::{ExposeSecret, SecretString};

const S3_RETRIES: usize = 5;

#[derive(Debug, Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: SecretString,
}

fn plaintext_endpoint(storage: &StorageConfig) -> Result<()> {
    if !storage.endpoint.starts_with("http://") {
        return Ok(());
    }
    if storage.enforce_tls {
        anyhow::bail!(
            "block store endpoint {} is plain HTTP while storage.enforce_tls is set",
            storage.endpoint
        );
    }
    tracing::warn!(endpoint = %storage.endpoint, "block store endpoint is plain HTTP");
    Ok(())
}

/// S3 operator for the configured bucket. Plain-HTTP endpoints are refused
/// under `enforce_tls` and logged otherwise.
///
/// opendal 0.55 defaults to path-style addressing, which MinIO and SeaweedFS need.
pub fn s3_operator(storage: &StorageConfig, creds: &S3Credentials) -> Result<Operator> {
    plaintext_endpoint(storage)?;
    let builder = opendal::services::S3::default()
        .endpoint(&storage.endpoint)
        .region(&storage.region)
        .bucket(&storage.bucket)
        .access_key_id(&creds.access_key_id)
        .secret_access_key(creds.secret_access_key.expose_secret());

    Ok(Operator::new(builder)
        .with_context(|| format!("S3 operator for bucket {}", storage.bucket))?
        .layer(LoggingLayer::default())
        .layer(RetryLayer::new().with_max_times(S3_RETRIES).with_jitter())
        .finish())
}

pub fn memory_operator() -> Result<Operator> {
    Ok(Operator::new(opendal::services::Memory::default())
        .context("memory operator")?
        .layer(LoggingLayer::default())
        .finish())
}
