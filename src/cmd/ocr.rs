//! The `ocr` subcommand.

use std::sync::{Arc, Mutex};

use clap::Args;
use futures::StreamExt as _;

use crate::{
    async_utils::io::write_jsonl,
    config::PipelineConfig,
    pipeline::{Pipeline, RunSummary, discover::discover_documents},
    prelude::*,
    services::google_cloud_services,
    ui::{ProgressConfig, Ui},
};

/// OCR command line arguments.
#[derive(Debug, Args)]
pub struct OcrOpts {
    /// Pipeline configuration (TOML, or JSON if the name ends in `.json`).
    #[clap(short = 'c', long = "config", value_name = "FILE")]
    pub config_path: PathBuf,

    /// Max number of documents to process at a time.
    #[clap(short = 'j', long = "jobs", default_value = "1")]
    pub job_count: usize,

    /// Override `job_timeout_secs` from the configuration.
    #[clap(long = "timeout", value_name = "SECS")]
    pub timeout_secs: Option<u64>,

    /// Write a JSONL report with one line per document.
    #[clap(long = "report", value_name = "FILE")]
    pub report_path: Option<PathBuf>,
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(ui: Ui, opts: &OcrOpts) -> Result<()> {
    if opts.job_count == 0 {
        return Err(anyhow!("--jobs must be at least 1"));
    }

    let mut config = PipelineConfig::load(&opts.config_path).await?;
    if let Some(timeout_secs) = opts.timeout_secs {
        config.job_timeout_secs = timeout_secs;
        config.validate().context("invalid --timeout")?;
    }

    // A missing source directory is fatal, unlike anything that goes wrong
    // with an individual document.
    let documents = discover_documents(&config.source_dir, &config.extensions)
        .await
        .context("could not find documents to OCR")?;
    if documents.is_empty() {
        ui.display_message(
            "📭",
            &format!(
                "No files ending in {} found in {}",
                config.extensions.join(", "),
                config.source_dir.display()
            ),
        );
        return Ok(());
    }
    info!(count = documents.len(), "Found documents");

    config.create_output_dirs().await?;
    let (store, ocr) = google_cloud_services(&config).await?;
    let pipeline = Arc::new(Pipeline::new(config, store, ocr));

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "OCRing documents",
            done_msg: "OCRed documents",
        },
        documents.len() as u64,
    );
    let reports = pb.wrap_stream(
        pipeline
            .process_documents(documents)
            .buffered(opts.job_count),
    );

    let summary = Arc::new(Mutex::new(RunSummary::default()));
    let summary_clone = summary.clone();
    let reports = reports
        .map(move |report| {
            summary_clone
                .lock()
                .expect("lock poisoned")
                .update(&report);
            report
        })
        .boxed();
    match &opts.report_path {
        Some(path) => write_jsonl(Some(path), reports).await?,
        None => reports.for_each(|_| async {}).await,
    }

    let summary = summary.lock().expect("lock poisoned").to_owned();
    display_summary(&ui, &summary);
    Ok(())
}

/// Tell the user how the run went. Skipped documents don't change our exit
/// status; they're listed in the log and in the report.
fn display_summary(ui: &Ui, summary: &RunSummary) {
    ui.display_message(
        "✅",
        &format!(
            "{} documents OK, {} records written",
            summary.ok, summary.records
        ),
    );
    if summary.incomplete > 0 {
        ui.display_message(
            "⚠️",
            &format!(
                "{} documents had unreadable result objects",
                summary.incomplete
            ),
        );
    }
    if summary.failed > 0 {
        ui.display_message(
            "❌",
            &format!("{} documents could not be processed", summary.failed),
        );
    }
}
