//! External collaborators: the object store and the OCR service.
//!
//! The pipeline only talks to these through the [`ObjectStore`] and
//! [`OcrService`] traits. The real implementations speak the Google Cloud
//! Storage and Cloud Vision REST APIs.

use std::{fmt, sync::Arc, time::Duration};

use crate::{config::PipelineConfig, errors::StageError, prelude::*};

use self::{auth::AccessTokenSource, gcs::GcsObjectStore, vision::VisionOcrService};

pub mod auth;
pub mod gcs;
#[cfg(test)]
pub mod testing;
pub mod vision;

/// How long to wait for a TCP/TLS connection to a Google API.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// The address of an object (or of a key prefix) in the object store.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemoteObjectRef {
    pub bucket: String,
    pub key: String,
}

impl RemoteObjectRef {
    /// Create a new reference.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// The `gs://` URI for this object, as expected by the OCR service.
    pub fn uri(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.key)
    }
}

impl fmt::Display for RemoteObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

/// Minimal object store interface.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Store `data` at `target`, replacing any existing object.
    async fn put(&self, target: &RemoteObjectRef, data: Vec<u8>) -> Result<()>;

    /// List the keys of all objects in `bucket` starting with `prefix`.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    /// Fetch the contents of an object.
    async fn get(&self, source: &RemoteObjectRef) -> Result<Vec<u8>>;
}

/// The OCR capability we ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecognitionFeature {
    /// Dense, full-page text recognition.
    DocumentText,
}

/// Everything the OCR service needs to start an asynchronous job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecognitionRequest {
    /// The uploaded document.
    pub input: RemoteObjectRef,

    /// MIME type of the uploaded document.
    pub mime_type: String,

    /// What kind of recognition to perform.
    pub feature: RecognitionFeature,

    /// Key prefix the service writes its result objects under.
    pub destination: RemoteObjectRef,

    /// Pages per result object.
    pub batch_size: u32,
}

/// Handle for an in-flight recognition job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecognitionJob {
    /// The operation name assigned by the service.
    pub name: String,
}

/// What the service says about a job right now.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Completed,
    Failed(String),
}

/// Asynchronous OCR service.
#[async_trait]
pub trait OcrService: Send + Sync + 'static {
    /// Start a recognition job. Only the submission is synchronous; the
    /// recognition itself happens in the background.
    async fn submit(
        &self,
        request: &RecognitionRequest,
    ) -> Result<RecognitionJob, StageError>;

    /// Ask for the current state of a job.
    async fn poll(&self, job: &RecognitionJob) -> Result<JobState>;
}

/// Build the real Google Cloud services for a configuration.
///
/// This fetches an access token immediately, so missing credentials are
/// reported before we touch any documents.
pub async fn google_cloud_services(
    config: &PipelineConfig,
) -> Result<(Arc<dyn ObjectStore>, Arc<dyn OcrService>)> {
    let tokens = Arc::new(AccessTokenSource::from_env());
    tokens
        .token()
        .await
        .context("could not obtain Google Cloud credentials")?;
    let http = reqwest::Client::builder()
        .user_agent(concat!("ocr-batch/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()
        .context("failed to create HTTP client")?;

    let store = GcsObjectStore::new(
        http.clone(),
        tokens.clone(),
        config.storage_endpoint.as_deref(),
        config.quota_project.clone(),
    )?;
    let ocr = VisionOcrService::new(
        http,
        tokens,
        config.vision_endpoint.as_deref(),
        config.quota_project.clone(),
    )?;
    Ok((Arc::new(store), Arc::new(ocr)))
}

/// Attach the headers every Google API call needs.
pub(crate) fn authorize(
    request: reqwest::RequestBuilder,
    token: &str,
    quota_project: Option<&str>,
) -> reqwest::RequestBuilder {
    let request = request.bearer_auth(token);
    match quota_project {
        Some(project) => request.header("x-goog-user-project", project),
        None => request,
    }
}

/// A Google API error response, as far as we care about it.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

/// Turn a non-success HTTP response into an error, including the server's
/// explanation if it sent one.
pub(crate) async fn check_response(
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ApiErrorBody>(&body) {
        Ok(parsed) => parsed.error.message,
        Err(_) => body,
    };
    Err(anyhow!("HTTP {}: {}", status, message.trim()))
}
