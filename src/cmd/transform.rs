//! The `transform` subcommand: rebuild CSV tables from downloaded results,
//! without talking to any cloud service.

use clap::Args;
use futures::TryStreamExt as _;
use tokio_stream::wrappers::ReadDirStream;

use crate::{
    config::DEFAULT_EMPTY_TEXT_MARKER,
    errors::Stage,
    pipeline::{
        RunSummary,
        fetch::result_order_key,
        table::write_table,
        transform::{records_from_file, unreadable_record},
    },
    prelude::*,
    ui::{ProgressConfig, Ui},
};

/// Transform command line arguments.
#[derive(Debug, Args)]
pub struct TransformOpts {
    /// Directory of downloaded results, laid out as `<id>/<result>.json`.
    #[clap(value_name = "RESULTS_DIR")]
    pub results_dir: PathBuf,

    /// Directory to write `<id>.csv` tables to.
    #[clap(long = "out-dir", value_name = "DIR")]
    pub output_dir: PathBuf,

    /// Only read result files ending with this suffix.
    #[clap(long, default_value = ".json")]
    pub result_suffix: String,

    /// Text written for pages with no recognized text.
    #[clap(long, default_value = DEFAULT_EMPTY_TEXT_MARKER)]
    pub empty_text_marker: String,

    /// Don't start tables with a UTF-8 byte order mark.
    #[clap(long)]
    pub no_bom: bool,
}

/// The `transform` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_transform(ui: Ui, opts: &TransformOpts) -> Result<()> {
    let document_dirs = sorted_entries(&opts.results_dir, EntryKind::Dir).await?;
    tokio::fs::create_dir_all(&opts.output_dir)
        .await
        .with_context(|| format!("failed to create directory {:?}", opts.output_dir))?;

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📝",
            msg: "Writing tables",
            done_msg: "Wrote tables",
        },
        document_dirs.len() as u64,
    );
    let mut summary = RunSummary::default();
    for dir in document_dirs {
        let Some(id) = dir.file_name().and_then(|name| name.to_str()) else {
            warn!(path = ?dir, "Skipping directory with non-UTF-8 name");
            pb.inc(1);
            continue;
        };
        let mut results = sorted_entries(&dir, EntryKind::File).await?;
        results.retain(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(opts.result_suffix.as_str()))
        });
        if results.is_empty() {
            debug!(id, "No result files");
            pb.inc(1);
            continue;
        }

        let mut records = Vec::new();
        let mut incomplete = false;
        for path in results {
            match records_from_file(id, &path, &opts.empty_text_marker).await {
                Ok(parsed) => records.extend(parsed),
                Err(err) => {
                    warn!(id, stage = %Stage::Transform, error = %err, "Skipping result file {}", path.display());
                    incomplete = true;
                    records.push(unreadable_record(id));
                }
            }
        }
        let (path, rows) =
            write_table(&opts.output_dir, id, !opts.no_bom, &records).await?;
        info!(rows, "Wrote {}", path.display());

        if incomplete {
            summary.incomplete += 1;
        } else {
            summary.ok += 1;
        }
        summary.records += rows;
        pb.inc(1);
    }
    pb.finish();

    ui.display_message(
        "✅",
        &format!(
            "{} tables written, {} records",
            summary.ok + summary.incomplete,
            summary.records
        ),
    );
    if summary.incomplete > 0 {
        ui.display_message(
            "⚠️",
            &format!("{} tables have unreadable results", summary.incomplete),
        );
    }
    Ok(())
}

/// Which directory entries [`sorted_entries`] should return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntryKind {
    Dir,
    File,
}

/// The subdirectories or regular files of `dir`, with result files in page
/// order and everything else sorted by name.
async fn sorted_entries(dir: &Path, kind: EntryKind) -> Result<Vec<PathBuf>> {
    let entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read directory {:?}", dir))?;
    let paths = ReadDirStream::new(entries)
        .map_ok(|entry| entry.path())
        .try_collect::<Vec<_>>()
        .await
        .with_context(|| format!("failed to read directory {:?}", dir))?;

    let mut kept = Vec::with_capacity(paths.len());
    for path in paths {
        let metadata = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("failed to inspect {:?}", path))?;
        let wanted = match kind {
            EntryKind::Dir => metadata.is_dir(),
            EntryKind::File => metadata.is_file(),
        };
        if wanted {
            kept.push(path);
        }
    }
    kept.sort_by_cached_key(|path| {
        result_order_key(&path.file_name().unwrap_or_default().to_string_lossy())
    });
    Ok(kept)
}
