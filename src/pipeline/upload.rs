//! Staging documents in the object store.

use crate::{
    errors::StageError,
    prelude::*,
    services::{ObjectStore, RemoteObjectRef},
};

use super::Document;

/// Where a document is uploaded: `<input_prefix><file name>`.
pub fn input_ref(bucket: &str, input_prefix: &str, document: &Document) -> RemoteObjectRef {
    RemoteObjectRef::new(bucket, format!("{}{}", input_prefix, document.file_name))
}

/// Where the OCR service should write a document's results:
/// `<output_prefix><id>/`.
pub fn destination_ref(
    bucket: &str,
    output_prefix: &str,
    document: &Document,
) -> RemoteObjectRef {
    RemoteObjectRef::new(bucket, format!("{}{}/", output_prefix, document.id))
}

/// Upload a document, replacing whatever is already stored at `target`.
#[instrument(level = "debug", skip_all, fields(id = %document.id, object = %target))]
pub async fn upload_document(
    store: &dyn ObjectStore,
    document: &Document,
    target: &RemoteObjectRef,
) -> Result<(), StageError> {
    let data = tokio::fs::read(&document.path)
        .await
        .with_context(|| format!("failed to read {:?}", document.path))
        .map_err(StageError::transfer)?;
    let len = data.len();
    store
        .put(target, data)
        .await
        .map_err(StageError::transfer)?;
    info!(bytes = len, "Uploaded {} to {}", document.path.display(), target);
    Ok(())
}
