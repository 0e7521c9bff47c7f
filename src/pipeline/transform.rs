//! Turning Cloud Vision result files into table rows.
//!
//! Each result object is an `AnnotateFileResponse`: a `responses` array with
//! one entry per page, each optionally holding `fullTextAnnotation.text`. We
//! only read the fields we need and ignore the (large) rest.

use schemars::JsonSchema;

use crate::{async_utils::io::strip_bom, errors::StageError, prelude::*};

/// Placeholder text for a result object (or page) we could not read. Kept
/// distinct from the empty-text marker, which means "read fine, no text".
pub const UNREADABLE_RESULT_MARKER: &str = "**COULD_NOT_READ_RESULT**";

/// One output row.
#[derive(Clone, Debug, JsonSchema, PartialEq, Eq, Serialize)]
pub struct ResultRecord {
    /// The document's base identifier.
    pub document_id: String,
    /// Normalized recognized text, or one of the marker values.
    pub text: String,
}

/// A Vision result file.
#[derive(Debug, Deserialize)]
struct AnnotateFileResponse {
    responses: Vec<AnnotateImageResponse>,
}

/// One page of a result file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    #[serde(default)]
    full_text_annotation: Option<TextAnnotation>,
    #[serde(default)]
    error: Option<PageError>,
}

#[derive(Debug, Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageError {
    #[serde(default)]
    message: String,
}

/// Replace every newline with a space, then trim the ends. Runs of spaces
/// produced by consecutive newlines are left alone.
pub fn normalize_text(text: &str) -> String {
    text.replace('\n', " ").trim().to_owned()
}

/// Parse the contents of one result object into records.
pub fn records_from_json(
    document_id: &str,
    data: &[u8],
    empty_text_marker: &str,
) -> Result<Vec<ResultRecord>, StageError> {
    let text = std::str::from_utf8(data)
        .map_err(|err| StageError::Parse(format!("result is not UTF-8: {err}")))?;
    let file = serde_json::from_str::<AnnotateFileResponse>(strip_bom(text))
        .map_err(|err| StageError::Parse(err.to_string()))?;

    let records = file
        .responses
        .into_iter()
        .enumerate()
        .map(|(idx, response)| {
            let text = response
                .full_text_annotation
                .and_then(|annotation| annotation.text)
                .map(|text| normalize_text(&text))
                .unwrap_or_default();
            let text = match (text.is_empty(), response.error) {
                (false, _) => text,
                (true, Some(err)) => {
                    warn!(id = %document_id, response = idx, error = %err.message, "OCR service could not read page");
                    UNREADABLE_RESULT_MARKER.to_owned()
                }
                (true, None) => empty_text_marker.to_owned(),
            };
            ResultRecord {
                document_id: document_id.to_owned(),
                text,
            }
        })
        .collect();
    Ok(records)
}

/// Read and parse one downloaded result file.
#[instrument(level = "debug", skip(empty_text_marker))]
pub async fn records_from_file(
    document_id: &str,
    path: &Path,
    empty_text_marker: &str,
) -> Result<Vec<ResultRecord>, StageError> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|err| StageError::Parse(format!("cannot read {:?}: {}", path, err)))?;
    records_from_json(document_id, &data, empty_text_marker)
}

/// The single placeholder row for a result object we had to skip.
pub fn unreadable_record(document_id: &str) -> ResultRecord {
    ResultRecord {
        document_id: document_id.to_owned(),
        text: UNREADABLE_RESULT_MARKER.to_owned(),
    }
}
