//! I/O utilities.
//!
//! Reading configuration files (TOML or JSON), and writing JSONL reports to a
//! file or standard output.

use futures::{pin_mut, stream::StreamExt as _};
use serde::de::DeserializeOwned;
use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt as _, BufWriter},
};

use crate::prelude::*;

use super::BoxedStream;

/// The UTF-8 byte order mark. Some tools write it at the start of JSON and
/// CSV files.
pub const UTF8_BOM: &str = "\u{feff}";

/// Strip a leading UTF-8 byte order mark, if present.
pub fn strip_bom(text: &str) -> &str {
    text.strip_prefix(UTF8_BOM).unwrap_or(text)
}

/// Read TOML or JSON from a file. Files ending in `.json` are parsed as JSON,
/// everything else as TOML.
pub async fn read_json_or_toml<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let is_json = path.extension().is_some_and(|ext| ext == "json");
    // Read all at once because our parsing libraries don't do async I/O.
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", path))?;
    let data = strip_bom(&data);
    if is_json {
        serde_json::from_str(data).with_context(|| {
            format!("Failed to parse JSON from file at path: {:?}", path)
        })
    } else {
        toml::from_str(data).with_context(|| {
            format!("Failed to parse TOML from file at path: {:?}", path)
        })
    }
}

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write a stream of serializable records to a file or standard output, one
/// JSON object per line.
pub async fn write_jsonl<T>(path: Option<&Path>, stream: BoxedStream<T>) -> Result<()>
where
    T: Serialize + std::fmt::Debug,
{
    let mut writer = BufWriter::new(create_writer(path).await?);
    pin_mut!(stream);
    while let Some(record) = stream.next().await {
        let json = serde_json::to_string(&record)
            .with_context(|| format!("Failed to serialize JSON from {:?}", record))?;
        writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write JSON to output")?;
        writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline to output")?;
    }
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;

    #[test]
    fn test_strip_bom() {
        assert_eq!(strip_bom("\u{feff}{}"), "{}");
        assert_eq!(strip_bom("{}"), "{}");
    }

    #[tokio::test]
    async fn test_write_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let records = stream::iter(vec![
            serde_json::json!({"id": "a"}),
            serde_json::json!({"id": "b"}),
        ])
        .boxed();
        write_jsonl(Some(&path), records).await.unwrap();
        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(written, "{\"id\":\"a\"}\n{\"id\":\"b\"}\n");
    }
}
