//! OCR using Google Cloud Vision's asynchronous file annotation API.
//!
//! We start jobs with `files:asyncBatchAnnotate`, which returns a long-running
//! operation, and then poll that operation until it reports `done`. Vision
//! writes its results as JSON objects into the Cloud Storage prefix we give it.

use std::sync::Arc;

use reqwest::{Client, Url};

use crate::{config::DEFAULT_VISION_ENDPOINT, errors::StageError, prelude::*};

use super::{
    JobState, OcrService, RecognitionFeature, RecognitionJob, RecognitionRequest,
    auth::AccessTokenSource, authorize, check_response,
};

/// OCR service wrapping the Cloud Vision REST API.
pub struct VisionOcrService {
    http: Client,
    tokens: Arc<AccessTokenSource>,
    endpoint: Url,
    quota_project: Option<String>,
}

impl VisionOcrService {
    /// Create a new service client. `endpoint` defaults to the public API.
    pub fn new(
        http: Client,
        tokens: Arc<AccessTokenSource>,
        endpoint: Option<&str>,
        quota_project: Option<String>,
    ) -> Result<Self> {
        let endpoint = endpoint.unwrap_or(DEFAULT_VISION_ENDPOINT);
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("invalid vision endpoint {:?}", endpoint))?;
        Ok(Self {
            http,
            tokens,
            endpoint,
            quota_project,
        })
    }

    /// Build an API URL under `v1/`.
    fn url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("vision endpoint {} cannot have a path", self.endpoint))?
            .pop_if_empty()
            .push("v1")
            .extend(segments);
        Ok(url)
    }

    /// Send the request and parse the operation it returns.
    async fn start_operation(&self, request: &RecognitionRequest) -> Result<Operation> {
        let body = AsyncBatchAnnotateFilesRequest::from_request(request);
        trace!(?body, "Vision request");
        let token = self.tokens.token().await?;
        let url = self.url(["files:asyncBatchAnnotate"])?;
        let response = authorize(
            self.http.post(url),
            &token,
            self.quota_project.as_deref(),
        )
        .json(&body)
        .send()
        .await
        .context("failed to send request to Cloud Vision")?;
        let operation = check_response(response)
            .await?
            .json::<Operation>()
            .await
            .context("failed to parse Cloud Vision operation")?;
        Ok(operation)
    }
}

#[async_trait]
impl OcrService for VisionOcrService {
    #[instrument(level = "debug", skip_all, fields(input = %request.input))]
    async fn submit(
        &self,
        request: &RecognitionRequest,
    ) -> Result<RecognitionJob, StageError> {
        let operation = self
            .start_operation(request)
            .await
            .map_err(StageError::submission)?;
        if operation.name.is_empty() {
            return Err(StageError::Submission(
                "Cloud Vision returned an operation without a name".to_owned(),
            ));
        }
        // Vision may reject a request immediately with a finished operation.
        if let JobState::Failed(reason) = operation.state() {
            return Err(StageError::Submission(reason));
        }
        debug!(operation = %operation.name, "Started Cloud Vision operation");
        Ok(RecognitionJob {
            name: operation.name,
        })
    }

    #[instrument(level = "trace", skip_all, fields(operation = %job.name))]
    async fn poll(&self, job: &RecognitionJob) -> Result<JobState> {
        let token = self.tokens.token().await?;
        let url = self.url(job.name.split('/'))?;
        let response = authorize(
            self.http.get(url),
            &token,
            self.quota_project.as_deref(),
        )
        .send()
        .await
        .with_context(|| format!("failed to poll operation {}", job.name))?;
        let operation = check_response(response)
            .await
            .with_context(|| format!("failed to poll operation {}", job.name))?
            .json::<Operation>()
            .await
            .context("failed to parse Cloud Vision operation")?;
        trace!(?operation, "Vision operation");
        Ok(operation.state())
    }
}

/// Body of `files:asyncBatchAnnotate`.
#[derive(Debug, Serialize)]
struct AsyncBatchAnnotateFilesRequest {
    requests: Vec<AsyncAnnotateFileRequest>,
}

impl AsyncBatchAnnotateFilesRequest {
    /// We always send exactly one file per request.
    fn from_request(request: &RecognitionRequest) -> Self {
        let feature_type = match request.feature {
            RecognitionFeature::DocumentText => "DOCUMENT_TEXT_DETECTION",
        };
        Self {
            requests: vec![AsyncAnnotateFileRequest {
                input_config: InputConfig {
                    gcs_source: GcsLocation {
                        uri: request.input.uri(),
                    },
                    mime_type: request.mime_type.clone(),
                },
                features: vec![Feature {
                    feature_type: feature_type.to_owned(),
                }],
                output_config: OutputConfig {
                    gcs_destination: GcsLocation {
                        uri: request.destination.uri(),
                    },
                    batch_size: request.batch_size,
                },
            }],
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AsyncAnnotateFileRequest {
    input_config: InputConfig,
    features: Vec<Feature>,
    output_config: OutputConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InputConfig {
    gcs_source: GcsLocation,
    mime_type: String,
}

#[derive(Debug, Serialize)]
struct GcsLocation {
    uri: String,
}

#[derive(Debug, Serialize)]
struct Feature {
    #[serde(rename = "type")]
    feature_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutputConfig {
    gcs_destination: GcsLocation,
    batch_size: u32,
}

/// A long-running operation.
#[derive(Debug, Deserialize)]
struct Operation {
    #[serde(default)]
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<OperationError>,
}

/// The `google.rpc.Status` attached to a failed operation.
#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

impl Operation {
    /// Interpret the operation's fields.
    fn state(&self) -> JobState {
        match (&self.error, self.done) {
            (Some(err), _) => {
                JobState::Failed(format!("code {}: {}", err.code, err.message))
            }
            (None, true) => JobState::Completed,
            (None, false) => JobState::Pending,
        }
    }
}
