//! Durable state and output collaborators for the permit crawler: the
//! checkpoint file, the CSV table and the spreadsheet client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use permit_core::Checkpoint;
use reqwest::{StatusCode, Url};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "permit-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` wholesale through a temp file in the same directory and a rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Single-record store for the date of the last successful run.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing, unreadable or unparseable files all mean "no checkpoint".
    pub async fn load(&self) -> Option<Checkpoint> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no checkpoint file found; starting fresh");
                return None;
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to read checkpoint; starting fresh");
                return None;
            }
        };
        match serde_json::from_str::<Checkpoint>(&text) {
            Ok(checkpoint) => {
                info!(
                    last_execution_date = %checkpoint.last_execution_date,
                    "resuming from checkpoint"
                );
                Some(checkpoint)
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to parse checkpoint; starting fresh");
                None
            }
        }
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(checkpoint).context("serializing checkpoint")?;
        write_atomic(&self.path, &bytes).await?;
        info!(
            path = %self.path.display(),
            last_execution_date = %checkpoint.last_execution_date,
            "checkpoint saved"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TableSummary {
    pub path: String,
    pub rows: usize,
    pub bytes: u64,
    pub sha256: String,
}

/// CSV writer for the local tabular output: one header row, then data rows.
#[derive(Debug, Clone)]
pub struct CsvTableWriter {
    path: PathBuf,
}

impl CsvTableWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn encode(headers: &[&str], rows: &[Vec<String>]) -> anyhow::Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(headers)
            .context("writing csv header")?;
        for row in rows {
            writer.write_record(row).context("writing csv row")?;
        }
        writer
            .into_inner()
            .map_err(|err| anyhow::anyhow!("flushing csv buffer: {}", err.error()))
    }

    pub async fn write(&self, headers: &[&str], rows: &[Vec<String>]) -> anyhow::Result<TableSummary> {
        let bytes = Self::encode(headers, rows)?;
        write_atomic(&self.path, &bytes).await?;
        info!(path = %self.path.display(), rows = rows.len(), "tabular output written");
        Ok(TableSummary {
            path: self.path.display().to_string(),
            rows: rows.len(),
            bytes: bytes.len() as u64,
            sha256: sha256_hex(&bytes),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum SheetsError {
    #[error("sheets request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("invalid sheets url: {0}")]
    Url(String),
    #[error("encoding sheets payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("sheets request retries exhausted for {0}")]
    RetriesExhausted(String),
}

/// Remote spreadsheet collaborator.
#[async_trait]
pub trait SpreadsheetGateway: Send + Sync {
    async fn clear(&self, sheet_id: &str, range: &str) -> Result<(), SheetsError>;

    async fn append(
        &self,
        sheet_id: &str,
        range: &str,
        rows: &[Vec<String>],
    ) -> Result<(), SheetsError>;
}

#[derive(Debug, Clone)]
pub struct SheetsClientConfig {
    pub api_base: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for SheetsClientConfig {
    fn default() -> Self {
        Self {
            api_base: "https://sheets.googleapis.com".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Google Sheets v4 values API over a bearer access token.
#[derive(Debug)]
pub struct GoogleSheetsClient {
    client: reqwest::Client,
    api_base: String,
    access_token: String,
    backoff: BackoffPolicy,
}

#[derive(Debug, Serialize)]
struct ValueRange<'a> {
    values: &'a [Vec<String>],
}

impl GoogleSheetsClient {
    pub fn new(config: SheetsClientConfig, access_token: impl Into<String>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            api_base: config.api_base,
            access_token: access_token.into(),
            backoff: config.backoff,
        })
    }

    async fn post_with_retry(
        &self,
        url: Url,
        body: &serde_json::Value,
    ) -> Result<(), SheetsError> {
        let span = info_span!("sheets_request", url = %url);
        async {
            for attempt in 0..=self.backoff.max_retries {
                let result = self
                    .client
                    .post(url.clone())
                    .bearer_auth(&self.access_token)
                    .json(body)
                    .send()
                    .await;

                match result {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            debug!(%status, "sheets request succeeded");
                            return Ok(());
                        }
                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(%status, attempt, "retrying sheets request");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        let body = resp.text().await.unwrap_or_default();
                        return Err(SheetsError::HttpStatus {
                            status: status.as_u16(),
                            url: url.to_string(),
                            body,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(error = %err, attempt, "retrying sheets request");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(SheetsError::Request(err));
                    }
                }
            }
            Err(SheetsError::RetriesExhausted(url.to_string()))
        }
        .instrument(span)
        .await
    }
}

/// `{api_base}/v4/spreadsheets/{sheet_id}/values/{range}:{action}`
pub fn values_url(api_base: &str, sheet_id: &str, range: &str, action: &str) -> Result<Url, SheetsError> {
    let mut url = Url::parse(api_base).map_err(|e| SheetsError::Url(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| SheetsError::Url(format!("{api_base} cannot be a base url")))?
        .pop_if_empty()
        .extend(["v4", "spreadsheets", sheet_id, "values"])
        .push(&format!("{range}:{action}"));
    Ok(url)
}

#[async_trait]
impl SpreadsheetGateway for GoogleSheetsClient {
    async fn clear(&self, sheet_id: &str, range: &str) -> Result<(), SheetsError> {
        let url = values_url(&self.api_base, sheet_id, range, "clear")?;
        self.post_with_retry(url, &serde_json::json!({})).await
    }

    async fn append(
        &self,
        sheet_id: &str,
        range: &str,
        rows: &[Vec<String>],
    ) -> Result<(), SheetsError> {
        let mut url = values_url(&self.api_base, sheet_id, range, "append")?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "USER_ENTERED");
        let body = serde_json::to_value(ValueRange { values: rows })?;
        self.post_with_retry(url, &body).await?;
        info!(rows = rows.len(), range, "rows appended to spreadsheet");
        Ok(())
    }
}
