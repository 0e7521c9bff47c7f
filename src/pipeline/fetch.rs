//! Downloading result objects.

use crate::{
    errors::{Stage, StageError},
    prelude::*,
    services::{ObjectStore, RemoteObjectRef},
};

use super::Document;

/// One result object found under a document's destination prefix.
#[derive(Debug)]
pub enum FetchedResult {
    /// Downloaded and saved locally.
    Saved { key: String, local_path: PathBuf },
    /// Could not be downloaded or saved. Sibling objects are unaffected.
    Failed { key: String, error: StageError },
}

/// Download every result object under `prefix` whose key ends with `suffix`
/// into `<results_dir>/<id>/`, in page order.
///
/// Returns an empty list if the prefix holds no matching objects. Only a
/// failure to list the prefix fails the whole call.
#[instrument(level = "debug", skip_all, fields(id = %document.id, prefix = %prefix))]
pub async fn fetch_results(
    store: &dyn ObjectStore,
    document: &Document,
    prefix: &RemoteObjectRef,
    suffix: &str,
    results_dir: &Path,
) -> Result<Vec<FetchedResult>, StageError> {
    let keys = store
        .list(&prefix.bucket, &prefix.key)
        .await
        .map_err(StageError::transfer)?;
    let mut keys = keys
        .into_iter()
        .filter(|key| key.ends_with(suffix))
        .collect::<Vec<_>>();
    keys.sort_by_cached_key(|key| result_order_key(object_file_name(key)));
    if keys.is_empty() {
        warn!(id = %document.id, "No result objects found under {}", prefix);
        return Ok(vec![]);
    }

    let local_dir = results_dir.join(&document.id);
    tokio::fs::create_dir_all(&local_dir)
        .await
        .with_context(|| format!("failed to create directory {:?}", local_dir))
        .map_err(StageError::transfer)?;

    let mut fetched = Vec::with_capacity(keys.len());
    for key in keys {
        let source = RemoteObjectRef::new(prefix.bucket.clone(), key.clone());
        let local_path = local_dir.join(object_file_name(&key));
        match download(store, &source, &local_path).await {
            Ok(()) => {
                info!("Saved {} to {}", source, local_path.display());
                fetched.push(FetchedResult::Saved { key, local_path });
            }
            Err(error) => {
                warn!(id = %document.id, stage = %Stage::Fetch, %error, "Skipping result object {}", source);
                fetched.push(FetchedResult::Failed { key, error });
            }
        }
    }
    Ok(fetched)
}

/// Download one object to a local file.
async fn download(
    store: &dyn ObjectStore,
    source: &RemoteObjectRef,
    local_path: &Path,
) -> Result<(), StageError> {
    let data = store.get(source).await.map_err(StageError::transfer)?;
    tokio::fs::write(local_path, data)
        .await
        .with_context(|| format!("failed to write {:?}", local_path))
        .map_err(StageError::transfer)
}

/// Sort key for result file names. Vision names its output
/// `output-<first page>-to-<last page>.json`; those come first, by first page.
/// Anything else follows, by name.
pub fn result_order_key(file_name: &str) -> (u64, String) {
    let first_page = file_name
        .strip_prefix("output-")
        .and_then(|rest| rest.split_once("-to-"))
        .and_then(|(first, _)| first.parse::<u64>().ok());
    (first_page.unwrap_or(u64::MAX), file_name.to_owned())
}

/// The last component of an object key.
fn object_file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}
