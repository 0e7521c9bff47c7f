//! Pipeline configuration.
//!
//! Everything the pipeline needs to know is loaded once, up front, into a
//! [`PipelineConfig`] and handed to each component. There are no process-wide
//! settings apart from the credentials described in `--help`.

use std::time::Duration;

use schemars::JsonSchema;

use crate::{
    async_utils::io::read_json_or_toml, pipeline::wait::WaitPolicy, prelude::*,
};

/// Default Cloud Storage JSON API endpoint.
pub const DEFAULT_STORAGE_ENDPOINT: &str = "https://storage.googleapis.com";

/// Default Cloud Vision API endpoint.
pub const DEFAULT_VISION_ENDPOINT: &str = "https://vision.googleapis.com";

/// Longest we'll wait for a single recognition job.
pub const MAX_JOB_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Text used for a page on which the OCR service found nothing.
pub const DEFAULT_EMPTY_TEXT_MARKER: &str = "**NO_TEXT_FOUND**";

/// Configuration for an `ocr` run.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct PipelineConfig {
    /// Directory containing the documents to OCR. Only immediate children are
    /// considered.
    pub source_dir: PathBuf,

    /// File name suffixes to accept, matched case-sensitively.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Cloud Storage bucket used both for uploads and for OCR output.
    pub bucket: String,

    /// Key prefix for uploaded documents.
    #[serde(default = "default_input_prefix")]
    pub input_prefix: String,

    /// Key prefix under which each document's results are written, as
    /// `<output_prefix><id>/`.
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,

    /// Local directory for downloaded result objects.
    pub results_dir: PathBuf,

    /// Local directory for the final CSV tables.
    pub output_dir: PathBuf,

    /// Only result objects whose key ends with this suffix are downloaded.
    #[serde(default = "default_result_suffix")]
    pub result_suffix: String,

    /// Number of pages per result object.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// How long to wait for a recognition job before giving up on a document.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// How often to ask the OCR service whether a job has finished.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Upper bound on any single HTTP request (upload, list, download, submit
    /// or status check).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Text written for pages with no recognized text.
    #[serde(default = "default_empty_text_marker")]
    pub empty_text_marker: String,

    /// Start each CSV table with a UTF-8 byte order mark, so that spreadsheet
    /// tools detect the encoding of non-ASCII text.
    #[serde(default = "default_write_bom")]
    pub write_bom: bool,

    /// Override the Cloud Storage endpoint, for emulators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_endpoint: Option<String>,

    /// Override the Cloud Vision endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_endpoint: Option<String>,

    /// GCP project to bill API usage to, sent as `x-goog-user-project`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_project: Option<String>,
}

fn default_extensions() -> Vec<String> {
    vec![".pdf".to_owned()]
}

fn default_input_prefix() -> String {
    "input/".to_owned()
}

fn default_output_prefix() -> String {
    "output/".to_owned()
}

fn default_result_suffix() -> String {
    ".json".to_owned()
}

fn default_batch_size() -> u32 {
    1
}

fn default_job_timeout_secs() -> u64 {
    300
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_empty_text_marker() -> String {
    DEFAULT_EMPTY_TEXT_MARKER.to_owned()
}

fn default_write_bom() -> bool {
    true
}

impl PipelineConfig {
    /// Load and validate a configuration file (TOML, or JSON if the file
    /// name ends in `.json`).
    pub async fn load(path: &Path) -> Result<Self> {
        let config = read_json_or_toml::<Self>(path).await?;
        config
            .validate()
            .with_context(|| format!("invalid configuration in {:?}", path))?;
        Ok(config)
    }

    /// Check values that serde can't check for us.
    pub fn validate(&self) -> Result<()> {
        if self.bucket.trim().is_empty() {
            return Err(anyhow!("`bucket` must not be empty"));
        }
        if self.extensions.is_empty() {
            return Err(anyhow!("`extensions` must list at least one suffix"));
        }
        if self.batch_size == 0 {
            return Err(anyhow!("`batch_size` must be at least 1"));
        }
        if self.job_timeout_secs == 0 || self.job_timeout_secs > MAX_JOB_TIMEOUT_SECS {
            return Err(anyhow!(
                "`job_timeout_secs` must be between 1 and {} (one day)",
                MAX_JOB_TIMEOUT_SECS
            ));
        }
        if self.request_timeout_secs == 0 || self.request_timeout_secs > MAX_JOB_TIMEOUT_SECS {
            return Err(anyhow!(
                "`request_timeout_secs` must be between 1 and {}",
                MAX_JOB_TIMEOUT_SECS
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(anyhow!("`poll_interval_secs` must be at least 1"));
        }
        if self.empty_text_marker.trim().is_empty() {
            return Err(anyhow!(
                "`empty_text_marker` must not be blank, or it can't be told apart from a missing row"
            ));
        }
        Ok(())
    }

    /// Timeout and poll interval for the job waiter.
    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            timeout: Duration::from_secs(self.job_timeout_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
        }
    }

    /// Create the local directories we write into.
    pub async fn create_output_dirs(&self) -> Result<()> {
        for dir in [&self.results_dir, &self.output_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create directory {:?}", dir))?;
        }
        Ok(())
    }
}
