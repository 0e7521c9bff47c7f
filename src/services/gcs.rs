//! Google Cloud Storage, via the JSON API.

use std::sync::Arc;

use reqwest::{Client, Url};

use crate::{config::DEFAULT_STORAGE_ENDPOINT, prelude::*};

use super::{
    ObjectStore, RemoteObjectRef, auth::AccessTokenSource, authorize, check_response,
};

/// An [`ObjectStore`] backed by a Cloud Storage bucket.
pub struct GcsObjectStore {
    http: Client,
    tokens: Arc<AccessTokenSource>,
    endpoint: Url,
    quota_project: Option<String>,
}

impl GcsObjectStore {
    /// Create a new store. `endpoint` defaults to the public API.
    pub fn new(
        http: Client,
        tokens: Arc<AccessTokenSource>,
        endpoint: Option<&str>,
        quota_project: Option<String>,
    ) -> Result<Self> {
        let endpoint = endpoint.unwrap_or(DEFAULT_STORAGE_ENDPOINT);
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("invalid storage endpoint {:?}", endpoint))?;
        Ok(Self {
            http,
            tokens,
            endpoint,
            quota_project,
        })
    }

    /// Build an API URL from path segments. Each segment is percent-encoded,
    /// so object names containing `/` become a single segment.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        build_url(&self.endpoint, segments)
    }

    /// Start an authorized request.
    async fn request(
        &self,
        method: reqwest::Method,
        url: Url,
    ) -> Result<reqwest::RequestBuilder> {
        let token = self.tokens.token().await?;
        Ok(authorize(
            self.http.request(method, url),
            &token,
            self.quota_project.as_deref(),
        ))
    }
}

/// Append percent-encoded path segments to `base`.
fn build_url(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| anyhow!("storage endpoint {} cannot have a path", base))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// One page of an object listing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectListItem>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectListItem {
    name: String,
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    #[instrument(
        level = "debug",
        skip(self, target, data),
        fields(object = %target, len = data.len())
    )]
    async fn put(&self, target: &RemoteObjectRef, data: Vec<u8>) -> Result<()> {
        let bucket = target.bucket.as_str();
        let mut url = self.url(&["upload", "storage", "v1", "b", bucket, "o"])?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", &target.key);
        let response = self
            .request(reqwest::Method::POST, url)
            .await?
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await
            .with_context(|| format!("failed to upload {}", target))?;
        check_response(response)
            .await
            .with_context(|| format!("failed to upload {}", target))?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.url(&["storage", "v1", "b", bucket, "o"])?;
            {
                let mut query = url.query_pairs_mut();
                query
                    .append_pair("prefix", prefix)
                    .append_pair("fields", "items(name),nextPageToken");
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }
            let response = self
                .request(reqwest::Method::GET, url)
                .await?
                .send()
                .await
                .with_context(|| format!("failed to list gs://{}/{}", bucket, prefix))?;
            let page = check_response(response)
                .await
                .with_context(|| format!("failed to list gs://{}/{}", bucket, prefix))?
                .json::<ObjectList>()
                .await
                .context("failed to parse object listing")?;
            keys.extend(page.items.into_iter().map(|item| item.name));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        debug!(count = keys.len(), "Listed objects");
        Ok(keys)
    }

    #[instrument(level = "debug", skip(self, source), fields(object = %source))]
    async fn get(&self, source: &RemoteObjectRef) -> Result<Vec<u8>> {
        let (bucket, key) = (source.bucket.as_str(), source.key.as_str());
        let mut url = self.url(&["storage", "v1", "b", bucket, "o", key])?;
        url.query_pairs_mut().append_pair("alt", "media");
        let response = self
            .request(reqwest::Method::GET, url)
            .await?
            .send()
            .await
            .with_context(|| format!("failed to download {}", source))?;
        let bytes = check_response(response)
            .await
            .with_context(|| format!("failed to download {}", source))?
            .bytes()
            .await
            .with_context(|| format!("failed to read body of {}", source))?;
        Ok(bytes.to_vec())
    }
}
