//! Starting recognition jobs.

use crate::{
    errors::StageError,
    prelude::*,
    services::{
        OcrService, RecognitionFeature, RecognitionJob, RecognitionRequest,
        RemoteObjectRef,
    },
};

use super::Document;

/// MIME types the asynchronous file API accepts.
const SUPPORTED_MIME_TYPES: &[&str] = &["application/pdf", "image/tiff", "image/gif"];

/// Guess the MIME type of a document from its extension.
pub fn document_mime_type(document: &Document) -> Result<String, StageError> {
    let mime = mime_guess::from_path(&document.path)
        .first()
        .map(|m| m.essence_str().to_owned())
        .ok_or_else(|| {
            StageError::Submission(format!(
                "cannot determine MIME type of {:?}",
                document.file_name
            ))
        })?;
    if !SUPPORTED_MIME_TYPES.contains(&mime.as_str()) {
        return Err(StageError::Submission(format!(
            "{} files are not supported (expected one of {})",
            mime,
            SUPPORTED_MIME_TYPES.join(", ")
        )));
    }
    Ok(mime)
}

/// Build the request for one uploaded document.
pub fn build_request(
    document: &Document,
    input: RemoteObjectRef,
    destination: RemoteObjectRef,
    batch_size: u32,
) -> Result<RecognitionRequest, StageError> {
    Ok(RecognitionRequest {
        input,
        mime_type: document_mime_type(document)?,
        feature: RecognitionFeature::DocumentText,
        destination,
        batch_size,
    })
}

/// Submit a recognition job.
#[instrument(level = "debug", skip_all, fields(input = %request.input))]
pub async fn submit_job(
    service: &dyn OcrService,
    request: &RecognitionRequest,
) -> Result<RecognitionJob, StageError> {
    let job = service.submit(request).await?;
    info!(
        operation = %job.name,
        "Submitted OCR request: {} -> {}",
        request.input,
        request.destination
    );
    Ok(job)
}
