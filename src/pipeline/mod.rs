//! The OCR batch pipeline.
//!
//! Each [`Document`] goes through upload → submit → wait → fetch → transform
//! → write. A failure in one of the first steps skips the document. A failure
//! reading one result object only costs that object's row. Nothing here
//! aborts the batch; configuration errors are caught before we get this far.

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::Arc,
};

use futures::{FutureExt as _, StreamExt as _, future, stream};
use schemars::JsonSchema;

use crate::{
    async_utils::{BoxedFuture, BoxedStream},
    config::PipelineConfig,
    errors::{Stage, StageError},
    prelude::*,
    services::{ObjectStore, OcrService},
};

use self::{
    fetch::{FetchedResult, fetch_results},
    submit::{build_request, submit_job},
    table::write_table,
    transform::{records_from_file, unreadable_record},
    upload::{destination_ref, input_ref, upload_document},
    wait::{WaitPolicy, wait_for_job},
};

pub mod discover;
pub mod fetch;
pub mod submit;
pub mod table;
pub mod transform;
pub mod upload;
pub mod wait;

/// A local file queued for recognition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Document {
    /// Path to the file.
    pub path: PathBuf,
    /// The file name, including extension.
    pub file_name: String,
    /// The file name without its extension. Used to name remote prefixes and
    /// output tables.
    pub id: String,
}

impl Document {
    /// Describe the file at `path`.
    pub fn from_path(path: PathBuf) -> Self {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name.clone());
        Self {
            path,
            file_name,
            id,
        }
    }
}

/// How processing a document went.
#[derive(Clone, Copy, Debug, JsonSchema, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Every result object was turned into rows.
    Ok,
    /// A table was written, but some result objects were unreadable.
    Incomplete,
    /// The document was skipped.
    Failed,
}

/// Audit record for one document.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct DocumentReport {
    /// The document's base identifier.
    pub id: String,

    /// The local file.
    pub path: PathBuf,

    /// Overall status.
    pub status: DocumentStatus,

    /// Where a failed document was given up on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,

    /// Everything that went wrong, document-level or per result object.
    pub errors: Vec<String>,

    /// How many result objects we found under the destination prefix.
    pub result_object_count: usize,

    /// How many rows we wrote.
    pub record_count: usize,

    /// The table we wrote, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_path: Option<PathBuf>,
}

impl DocumentReport {
    /// Start a report with nothing done yet.
    fn new(document: &Document) -> Self {
        Self {
            id: document.id.clone(),
            path: document.path.clone(),
            status: DocumentStatus::Ok,
            failed_stage: None,
            errors: vec![],
            result_object_count: 0,
            record_count: 0,
            table_path: None,
        }
    }

    /// Mark the document as skipped at `stage`.
    fn fail(mut self, stage: Stage, error: impl std::fmt::Display) -> Self {
        warn!(id = %self.id, %stage, %error, "Skipping document");
        self.status = DocumentStatus::Failed;
        self.failed_stage = Some(stage);
        self.errors.push(format!("{stage}: {error}"));
        self
    }

    /// Record a skipped result object.
    fn object_error(&mut self, stage: Stage, key: &str, error: &StageError) {
        self.status = DocumentStatus::Incomplete;
        self.errors.push(format!("{stage} {key}: {error}"));
    }
}

/// Everything needed to process documents, built once per run.
pub struct Pipeline {
    config: PipelineConfig,
    wait_policy: WaitPolicy,
    store: Arc<dyn ObjectStore>,
    ocr: Arc<dyn OcrService>,
}

impl Pipeline {
    /// Create a pipeline using the configured wait policy.
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn ObjectStore>,
        ocr: Arc<dyn OcrService>,
    ) -> Self {
        let wait_policy = config.wait_policy();
        Self {
            config,
            wait_policy,
            store,
            ocr,
        }
    }

    /// Override the wait policy.
    pub fn with_wait_policy(mut self, wait_policy: WaitPolicy) -> Self {
        self.wait_policy = wait_policy;
        self
    }

    /// Turn a list of documents into a stream of processing futures. Resolve
    /// them with [`StreamExt::buffered`] to control how many documents are in
    /// flight; `buffered(1)` processes them strictly one after another.
    ///
    /// A document whose id was already taken by an earlier one is skipped
    /// without touching any service.
    pub fn process_documents(
        self: Arc<Self>,
        documents: Vec<Document>,
    ) -> BoxedStream<BoxedFuture<DocumentReport>> {
        let mut ids = HashMap::<String, PathBuf>::new();
        stream::iter(documents)
            .map(move |document| match ids.entry(document.id.clone()) {
                Entry::Occupied(first) => {
                    let err = StageError::DuplicateId {
                        id: document.id.clone(),
                        first: first.get().clone(),
                    };
                    future::ready(DocumentReport::new(&document).fail(Stage::Discover, err))
                        .boxed()
                }
                Entry::Vacant(slot) => {
                    slot.insert(document.path.clone());
                    let pipeline = self.clone();
                    async move { pipeline.process_document(&document).await }.boxed()
                }
            })
            .boxed()
    }

    /// Run one document through every stage.
    #[instrument(level = "info", skip_all, fields(id = %document.id))]
    pub async fn process_document(&self, document: &Document) -> DocumentReport {
        let mut report = DocumentReport::new(document);
        let config = &self.config;

        // Upload.
        let input = input_ref(&config.bucket, &config.input_prefix, document);
        if let Err(err) = upload_document(self.store.as_ref(), document, &input).await {
            return report.fail(Stage::Upload, err);
        }

        // Submit.
        let destination = destination_ref(&config.bucket, &config.output_prefix, document);
        let job = match build_request(document, input, destination.clone(), config.batch_size)
        {
            Ok(request) => submit_job(self.ocr.as_ref(), &request).await,
            Err(err) => Err(err),
        };
        let job = match job {
            Ok(job) => job,
            Err(err) => return report.fail(Stage::Submit, err),
        };

        // Wait.
        let outcome = wait_for_job(self.ocr.as_ref(), &job, self.wait_policy).await;
        if let Err(err) = outcome.into_result() {
            return report.fail(Stage::Wait, err);
        }
        info!("OCR finished for {}", document.file_name);

        // Fetch.
        let fetched = match fetch_results(
            self.store.as_ref(),
            document,
            &destination,
            &config.result_suffix,
            &config.results_dir,
        )
        .await
        {
            Ok(fetched) => fetched,
            Err(err) => return report.fail(Stage::Fetch, err),
        };
        report.result_object_count = fetched.len();
        if fetched.is_empty() {
            return report;
        }

        // Transform.
        let mut records = Vec::new();
        for result in fetched {
            match result {
                FetchedResult::Saved { key, local_path } => {
                    match records_from_file(
                        &document.id,
                        &local_path,
                        &config.empty_text_marker,
                    )
                    .await
                    {
                        Ok(parsed) => records.extend(parsed),
                        Err(err) => {
                            warn!(id = %document.id, stage = %Stage::Transform, error = %err, "Skipping result object {}", key);
                            report.object_error(Stage::Transform, &key, &err);
                            records.push(unreadable_record(&document.id));
                        }
                    }
                }
                FetchedResult::Failed { key, error } => {
                    report.object_error(Stage::Fetch, &key, &error);
                    records.push(unreadable_record(&document.id));
                }
            }
        }

        // Write.
        match write_table(&config.output_dir, &document.id, config.write_bom, &records)
            .await
        {
            Ok((path, rows)) => {
                info!(rows, "Wrote {}", path.display());
                report.table_path = Some(path);
                report.record_count = rows;
                report
            }
            Err(err) => report.fail(Stage::Write, format!("{err:#}")),
        }
    }
}

/// Totals for a run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ok: usize,
    pub incomplete: usize,
    pub failed: usize,
    pub records: usize,
}

impl RunSummary {
    /// Count one document.
    pub fn update(&mut self, report: &DocumentReport) {
        match report.status {
            DocumentStatus::Ok => self.ok += 1,
            DocumentStatus::Incomplete => self.incomplete += 1,
            DocumentStatus::Failed => self.failed += 1,
        }
        self.records += report.record_count;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt as _;

    use super::*;
    use crate::{
        config::DEFAULT_EMPTY_TEXT_MARKER,
        pipeline::transform::UNREADABLE_RESULT_MARKER,
        services::testing::{MemoryObjectStore, Script, ScriptedOcrService},
    };

    /// A scratch workspace with source, results and output directories.
    struct Workspace {
        _dir: tempfile::TempDir,
        config: PipelineConfig,
    }

    impl Workspace {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path();
            for sub in ["before", "tmp", "after"] {
                std::fs::create_dir(root.join(sub)).unwrap();
            }
            let config = toml::from_str::<PipelineConfig>(&format!(
                r#"
source_dir = {:?}
bucket = "my-pdf-ocr-output"
results_dir = {:?}
output_dir = {:?}
write_bom = false
"#,
                root.join("before"),
                root.join("tmp"),
                root.join("after"),
            ))
            .unwrap();
            Self { _dir: dir, config }
        }

        fn add_document(&self, name: &str) -> Document {
            let path = self.config.source_dir.join(name);
            std::fs::write(&path, b"%PDF-1.7").unwrap();
            Document::from_path(path)
        }

        fn table(&self, id: &str) -> String {
            std::fs::read_to_string(self.config.output_dir.join(format!("{id}.csv")))
                .unwrap()
        }

        fn pipeline(
            &self,
            store: Arc<MemoryObjectStore>,
            ocr: ScriptedOcrService,
        ) -> Arc<Pipeline> {
            Arc::new(
                Pipeline::new(self.config.clone(), store, Arc::new(ocr)).with_wait_policy(
                    WaitPolicy {
                        timeout: Duration::from_millis(50),
                        poll_interval: Duration::from_millis(5),
                    },
                ),
            )
        }
    }

    fn page(text: &str) -> String {
        serde_json::json!({"responses": [{"fullTextAnnotation": {"text": text}}]})
            .to_string()
    }

    async fn run(pipeline: Arc<Pipeline>, documents: Vec<Document>) -> Vec<DocumentReport> {
        pipeline
            .process_documents(documents)
            .buffered(1)
            .collect::<Vec<_>>()
            .await
    }

    #[tokio::test]
    async fn test_receipt_end_to_end() {
        let ws = Workspace::new();
        let doc = ws.add_document("receipt-01.pdf");
        let store = MemoryObjectStore::new();
        let ocr = ScriptedOcrService::new(store.clone()).with_script(
            "input/receipt-01.pdf",
            Script::Complete {
                polls: 1,
                outputs: vec![("output-1-to-1.json".to_owned(), page("TOTAL 1200円\n"))],
            },
        );
        let pipeline = ws.pipeline(store.clone(), ocr);

        let reports = run(pipeline, vec![doc]).await;
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.status, DocumentStatus::Ok, "{report:?}");
        assert_eq!(report.result_object_count, 1);
        assert_eq!(report.record_count, 1);

        assert_eq!(
            store.object("my-pdf-ocr-output", "input/receipt-01.pdf").unwrap(),
            b"%PDF-1.7"
        );
        assert!(
            ws.config
                .results_dir
                .join("receipt-01")
                .join("output-1-to-1.json")
                .exists()
        );
        assert_eq!(
            ws.table("receipt-01"),
            "document identifier,recognized text\nreceipt-01,TOTAL 1200円\n"
        );
    }

    #[tokio::test]
    async fn test_one_unparseable_result_object() {
        let ws = Workspace::new();
        let doc = ws.add_document("scan.pdf");
        let store = MemoryObjectStore::new();
        let ocr = ScriptedOcrService::new(store.clone()).with_script(
            "input/scan.pdf",
            Script::Complete {
                polls: 0,
                outputs: vec![
                    ("output-1-to-1.json".to_owned(), page("one")),
                    ("output-2-to-2.json".to_owned(), "{not json".to_owned()),
                    ("output-3-to-3.json".to_owned(), page("")),
                ],
            },
        );
        let reports = run(ws.pipeline(store, ocr), vec![doc]).await;
        let report = &reports[0];
        assert_eq!(report.status, DocumentStatus::Incomplete);
        assert_eq!(report.result_object_count, 3);
        assert_eq!(report.record_count, 3);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("transform output/scan/output-2-to-2.json"));
        assert_eq!(
            ws.table("scan"),
            format!(
                "document identifier,recognized text\nscan,one\nscan,{UNREADABLE_RESULT_MARKER}\nscan,{DEFAULT_EMPTY_TEXT_MARKER}\n"
            )
        );
    }

    #[tokio::test]
    async fn test_timeout_skips_document_and_continues() {
        let ws = Workspace::new();
        let slow = ws.add_document("slow.pdf");
        let fast = ws.add_document("fast.pdf");
        let store = MemoryObjectStore::new();
        let ocr = ScriptedOcrService::new(store.clone())
            .with_script("input/slow.pdf", Script::Hang)
            .with_script(
                "input/fast.pdf",
                Script::Complete {
                    polls: 0,
                    outputs: vec![("output-1-to-1.json".to_owned(), page("ok"))],
                },
            );
        let reports = run(ws.pipeline(store.clone(), ocr), vec![slow, fast]).await;

        assert_eq!(reports[0].id, "slow");
        assert_eq!(reports[0].status, DocumentStatus::Failed);
        assert_eq!(reports[0].failed_stage, Some(Stage::Wait));
        assert_eq!(reports[1].id, "fast");
        assert_eq!(reports[1].status, DocumentStatus::Ok);

        // We never looked for the slow document's results.
        assert_eq!(store.list_calls(), vec!["output/fast/"]);
        assert!(!ws.config.output_dir.join("slow.csv").exists());
    }

    #[tokio::test]
    async fn test_failures_before_waiting() {
        let ws = Workspace::new();
        let denied = ws.add_document("denied.pdf");
        let rejected = ws.add_document("rejected.pdf");
        let broken = ws.add_document("broken.pdf");
        let store = MemoryObjectStore::new();
        store.fail_put("input/denied.pdf");
        let ocr = ScriptedOcrService::new(store.clone())
            .with_script("input/rejected.pdf", Script::Reject("bad config".to_owned()))
            .with_script("input/broken.pdf", Script::Fail("code 13".to_owned()));
        let reports = run(ws.pipeline(store, ocr), vec![denied, rejected, broken]).await;

        let stages = reports
            .iter()
            .map(|r| (r.status, r.failed_stage))
            .collect::<Vec<_>>();
        assert_eq!(
            stages,
            vec![
                (DocumentStatus::Failed, Some(Stage::Upload)),
                (DocumentStatus::Failed, Some(Stage::Submit)),
                (DocumentStatus::Failed, Some(Stage::Wait)),
            ]
        );
        assert!(reports[1].errors[0].contains("bad config"));
    }

    #[tokio::test]
    async fn test_no_results_writes_no_table() {
        let ws = Workspace::new();
        let doc = ws.add_document("blank.pdf");
        let store = MemoryObjectStore::new();
        let ocr = ScriptedOcrService::new(store.clone());
        let reports = run(ws.pipeline(store, ocr), vec![doc]).await;
        assert_eq!(reports[0].status, DocumentStatus::Ok);
        assert_eq!(reports[0].result_object_count, 0);
        assert!(reports[0].table_path.is_none());
        assert!(!ws.config.output_dir.join("blank.csv").exists());
    }

    #[tokio::test]
    async fn test_concurrent_jobs_keep_order() {
        let ws = Workspace::new();
        let store = MemoryObjectStore::new();
        let mut ocr = ScriptedOcrService::new(store.clone());
        let mut documents = vec![];
        for (n, polls) in [3, 0, 1].into_iter().enumerate() {
            let name = format!("doc-{n}.pdf");
            documents.push(ws.add_document(&name));
            ocr = ocr.with_script(
                &format!("input/{name}"),
                Script::Complete {
                    polls,
                    outputs: vec![("output-1-to-1.json".to_owned(), page(&name))],
                },
            );
        }
        let reports = ws
            .pipeline(store, ocr)
            .process_documents(documents)
            .buffered(3)
            .collect::<Vec<_>>()
            .await;
        let ids = reports.iter().map(|r| r.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["doc-0", "doc-1", "doc-2"]);
        assert!(reports.iter().all(|r| r.status == DocumentStatus::Ok));
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_skipped() {
        let ws = Workspace::new();
        let pdf = ws.add_document("scan.pdf");
        let tiff = ws.add_document("scan.tiff");
        let store = MemoryObjectStore::new();
        let ocr = ScriptedOcrService::new(store.clone()).with_script(
            "input/scan.pdf",
            Script::Complete {
                polls: 0,
                outputs: vec![("output-1-to-1.json".to_owned(), page("from pdf"))],
            },
        );
        let reports = run(ws.pipeline(store.clone(), ocr), vec![pdf, tiff]).await;

        assert_eq!(reports[0].status, DocumentStatus::Ok);
        assert_eq!(reports[1].status, DocumentStatus::Failed);
        assert_eq!(reports[1].failed_stage, Some(Stage::Discover));
        assert!(reports[1].errors[0].contains("scan.pdf"), "{:?}", reports[1].errors);
        assert!(store.object("my-pdf-ocr-output", "input/scan.tiff").is_none());
        assert_eq!(store.list_calls(), vec!["output/scan/"]);
        assert_eq!(
            ws.table("scan"),
            "document identifier,recognized text\nscan,from pdf\n"
        );
    }

    #[tokio::test]
    async fn test_listing_failure_skips_document() {
        let ws = Workspace::new();
        let doc = ws.add_document("receipt-01.pdf");
        let store = MemoryObjectStore::new();
        store.fail_list("output/receipt-01/");
        let ocr = ScriptedOcrService::new(store.clone()).with_script(
            "input/receipt-01.pdf",
            Script::Complete {
                polls: 0,
                outputs: vec![("output-1-to-1.json".to_owned(), page("lost"))],
            },
        );
        let reports = run(ws.pipeline(store, ocr), vec![doc]).await;
        let report = &reports[0];
        assert_eq!(report.status, DocumentStatus::Failed);
        assert_eq!(report.failed_stage, Some(Stage::Fetch));
        assert!(report.table_path.is_none());
        assert!(!ws.config.output_dir.join("receipt-01.csv").exists());
        assert!(!ws.config.results_dir.join("receipt-01").exists());
    }

    #[test]
    fn test_summary() {
        let doc = Document::from_path(PathBuf::from("a.pdf"));
        let mut ok = DocumentReport::new(&doc);
        ok.record_count = 2;
        let failed = DocumentReport::new(&doc).fail(Stage::Upload, "denied");
        let mut summary = RunSummary::default();
        summary.update(&ok);
        summary.update(&failed);
        assert_eq!(
            summary,
            RunSummary {
                ok: 1,
                incomplete: 0,
                failed: 1,
                records: 2,
            }
        );
    }

    #[test]
    fn test_document_ids() {
        let doc = Document::from_path(PathBuf::from("/x/receipt-01.pdf"));
        assert_eq!(doc.id, "receipt-01");
        assert_eq!(doc.file_name, "receipt-01.pdf");
        let doc = Document::from_path(PathBuf::from("/x/archive.tar.pdf"));
        assert_eq!(doc.id, "archive.tar");
    }
}
