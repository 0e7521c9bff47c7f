//! CSV output tables, one per document.

use csv_async::{AsyncWriter, AsyncWriterBuilder};
use tokio::{fs::File, io::AsyncWriteExt as _};

use crate::{async_utils::io::UTF8_BOM, prelude::*};

use super::transform::ResultRecord;

/// Column headers of every output table.
pub const TABLE_HEADER: [&str; 2] = ["document identifier", "recognized text"];

/// Writes `<output_dir>/<id>.csv`, one row per [`ResultRecord`].
pub struct TableWriter {
    path: PathBuf,
    writer: AsyncWriter<File>,
    row_count: usize,
}

impl TableWriter {
    /// Create (or truncate) the table for `document_id` and write the header.
    pub async fn create(
        output_dir: &Path,
        document_id: &str,
        write_bom: bool,
    ) -> Result<Self> {
        let path = output_dir.join(format!("{document_id}.csv"));
        let mut file = File::create(&path)
            .await
            .with_context(|| format!("Failed to create file at path: {:?}", path))?;
        if write_bom {
            file.write_all(UTF8_BOM.as_bytes())
                .await
                .with_context(|| format!("Failed to write to {:?}", path))?;
        }
        let mut writer = AsyncWriterBuilder::new().create_writer(file);
        writer
            .write_record(&TABLE_HEADER)
            .await
            .with_context(|| format!("Failed to write CSV header to {:?}", path))?;
        Ok(Self {
            path,
            writer,
            row_count: 0,
        })
    }

    /// Append one row.
    pub async fn write_record(&mut self, record: &ResultRecord) -> Result<()> {
        self.writer
            .write_record(&[record.document_id.as_str(), record.text.as_str()])
            .await
            .with_context(|| format!("Failed to write CSV row to {:?}", self.path))?;
        self.row_count += 1;
        Ok(())
    }

    /// Flush everything to disk, returning the table's path and row count.
    pub async fn finish(mut self) -> Result<(PathBuf, usize)> {
        self.writer
            .flush()
            .await
            .with_context(|| format!("Failed to flush {:?}", self.path))?;
        Ok((self.path, self.row_count))
    }
}

/// Write all of a document's records to its table, returning the table's
/// path and row count.
pub async fn write_table(
    output_dir: &Path,
    document_id: &str,
    write_bom: bool,
    records: &[ResultRecord],
) -> Result<(PathBuf, usize)> {
    let mut table = TableWriter::create(output_dir, document_id, write_bom).await?;
    for record in records {
        table.write_record(record).await?;
    }
    table.finish().await
}
