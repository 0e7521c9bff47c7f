//! Google Cloud access tokens.
//!
//! We accept a token from `GOOGLE_OAUTH_ACCESS_TOKEN`, or ask the `gcloud` CLI
//! for one using Application Default Credentials. `gcloud` takes care of
//! `GOOGLE_APPLICATION_CREDENTIALS`, service accounts and user logins, so we
//! don't have to.

use std::{
    env,
    time::{Duration, Instant},
};

use tokio::{process::Command, sync::Mutex};

use crate::{async_utils::check_for_command_failure, prelude::*};

/// Environment variable holding a ready-made access token.
pub const ACCESS_TOKEN_ENV_VAR: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

/// ADC tokens are valid for an hour. Refresh well before that.
const TOKEN_LIFETIME: Duration = Duration::from_secs(45 * 60);

/// A cached token.
#[derive(Debug)]
struct CachedToken {
    value: String,
    fetched_at: Instant,
}

/// Where our tokens come from.
#[derive(Debug)]
enum TokenOrigin {
    /// A fixed token supplied by the user. Never refreshed.
    Static(String),
    /// Run `gcloud auth application-default print-access-token`.
    Gcloud,
}

/// Supplies OAuth access tokens for Google APIs.
#[derive(Debug)]
pub struct AccessTokenSource {
    origin: TokenOrigin,
    cached: Mutex<Option<CachedToken>>,
}

impl AccessTokenSource {
    /// Use `GOOGLE_OAUTH_ACCESS_TOKEN` if set, or `gcloud` otherwise.
    pub fn from_env() -> Self {
        match env::var(ACCESS_TOKEN_ENV_VAR) {
            Ok(token) if !token.trim().is_empty() => {
                debug!("Using access token from {}", ACCESS_TOKEN_ENV_VAR);
                Self::fixed(token.trim().to_owned())
            }
            _ => Self {
                origin: TokenOrigin::Gcloud,
                cached: Mutex::new(None),
            },
        }
    }

    /// Always return the same token.
    pub fn fixed(token: String) -> Self {
        Self {
            origin: TokenOrigin::Static(token),
            cached: Mutex::new(None),
        }
    }

    /// Get a valid access token, fetching a new one if needed.
    pub async fn token(&self) -> Result<String> {
        match &self.origin {
            TokenOrigin::Static(token) => Ok(token.clone()),
            TokenOrigin::Gcloud => self.cached_gcloud_token().await,
        }
    }

    /// Return our cached `gcloud` token, refreshing it once it gets old.
    async fn cached_gcloud_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && token.fetched_at.elapsed() < TOKEN_LIFETIME
        {
            return Ok(token.value.clone());
        }
        let value = fetch_gcloud_token().await?;
        *cached = Some(CachedToken {
            value: value.clone(),
            fetched_at: Instant::now(),
        });
        Ok(value)
    }
}

/// Ask `gcloud` for an Application Default Credentials token.
#[instrument(level = "debug")]
async fn fetch_gcloud_token() -> Result<String> {
    let output = Command::new("gcloud")
        .args(["auth", "application-default", "print-access-token"])
        .output()
        .await
        .with_context(|| {
            format!(
                "cannot run gcloud (install the Google Cloud CLI or set {})",
                ACCESS_TOKEN_ENV_VAR
            )
        })?;
    check_for_command_failure("gcloud", &output)?;
    let token = String::from_utf8(output.stdout)
        .context("gcloud printed a non-UTF-8 access token")?
        .trim()
        .to_owned();
    if token.is_empty() {
        return Err(anyhow!("gcloud printed an empty access token"));
    }
    Ok(token)
}
