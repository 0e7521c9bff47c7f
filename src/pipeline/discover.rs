//! Finding the documents to OCR.

use futures::TryStreamExt as _;
use tokio_stream::wrappers::ReadDirStream;

use crate::{errors::StageError, prelude::*};

use super::Document;

/// List the regular files directly inside `dir` whose names end with one of
/// `extensions`, in directory-listing order.
///
/// Matching is case-sensitive, so `.pdf` does not match `SCAN.PDF`.
#[instrument(level = "debug", skip(extensions))]
pub async fn discover_documents(
    dir: &Path,
    extensions: &[String],
) -> Result<Vec<Document>, StageError> {
    if !tokio::fs::metadata(dir)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        return Err(StageError::NotFound(dir.to_owned()));
    }
    let entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|_| StageError::NotFound(dir.to_owned()))?;

    let mut documents = Vec::new();
    let mut entries = ReadDirStream::new(entries);
    while let Some(entry) = entries.try_next().await.map_err(|err| {
        StageError::Transfer(format!("failed to read directory {:?}: {}", dir, err))
    })? {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            warn!(path = ?entry.path(), "Skipping file with non-UTF-8 name");
            continue;
        };
        if !extensions.iter().any(|ext| name.ends_with(ext.as_str())) {
            continue;
        }
        // Follow symlinks, but skip directories that happen to be named
        // `something.pdf`.
        let is_file = tokio::fs::metadata(entry.path())
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            continue;
        }
        let document = Document::from_path(entry.path());
        debug!(id = %document.id, path = ?document.path, "Found document");
        documents.push(document);
    }
    Ok(documents)
}
