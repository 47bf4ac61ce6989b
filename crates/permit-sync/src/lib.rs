//! Crawl orchestration: configuration, window planning, discovery, bounded
//! parallel fetching, delivery of records and checkpoint advancement.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use permit_adapters::chromium::ChromiumSessionFactory;
use permit_adapters::fixture::{FixturePortal, FixtureSessionFactory};
use permit_adapters::{DetailFetcher, PortalLayout, SessionFactory, WorkItemDiscoverer};
use permit_core::{
    Checkpoint, CrawlWindow, FetchOutcome, PermitType, PlanError, Record, WorkItem,
    DEFAULT_LOOKBACK_DAYS, RECORD_HEADERS,
};
use permit_storage::{
    CheckpointStore, CsvTableWriter, GoogleSheetsClient, SheetsClientConfig, SpreadsheetGateway,
    TableSummary,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "permit-sync";

pub const SHEET_ID_ENV: &str = "PERMIT_SHEET_ID";
pub const SHEETS_TOKEN_ENV: &str = "GOOGLE_SHEETS_ACCESS_TOKEN";
pub const SHEETS_TOKEN_FILE_ENV: &str = "GOOGLE_SHEETS_TOKEN_FILE";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("required configuration missing: {0}")]
    Missing(&'static str),
    #[error("reading {path}: {reason}")]
    Unreadable { path: String, reason: String },
    #[error("{name} {reason}")]
    Invalid { name: &'static str, reason: &'static str },
}

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub workspace_root: PathBuf,
    pub sheets_enabled: bool,
    pub sheet_id: Option<String>,
    pub sheet_range: String,
    pub sheets_access_token: Option<String>,
    pub sheets_token_file: Option<PathBuf>,
    pub checkpoint_file: PathBuf,
    pub scrape_log_file: PathBuf,
    pub output_file: PathBuf,
    pub reports_dir: PathBuf,
    pub concurrency: usize,
    pub lookback_days: u64,
    pub headless: bool,
    pub scheduler_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl CrawlConfig {
    /// Defaults rooted at `workspace_root`, with no remote sheet configured.
    pub fn for_workspace(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        Self {
            checkpoint_file: workspace_root.join("last_run_log.json"),
            scrape_log_file: workspace_root.join("scrape_log.txt"),
            output_file: workspace_root.join("permit_applications_details.csv"),
            reports_dir: workspace_root.join("reports"),
            workspace_root,
            sheets_enabled: true,
            sheet_id: None,
            sheet_range: "Sheet1".to_string(),
            sheets_access_token: None,
            sheets_token_file: None,
            concurrency: default_concurrency(),
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            headless: true,
            scheduler_cron: "0 0 6 * * *".to_string(),
            user_agent: "permit-crawler/0.1".to_string(),
            http_timeout_secs: 20,
        }
    }

    pub fn from_env() -> Self {
        let workspace_root = std::env::var("PERMIT_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let defaults = Self::for_workspace(&workspace_root);
        let path_var = |name: &str, default: PathBuf| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(|v| workspace_root.join(v))
                .unwrap_or(default)
        };

        Self {
            sheets_enabled: std::env::var("PERMIT_SHEETS_ENABLED")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
            sheet_id: non_empty_var(SHEET_ID_ENV),
            sheet_range: non_empty_var("PERMIT_SHEET_RANGE").unwrap_or(defaults.sheet_range),
            sheets_access_token: non_empty_var(SHEETS_TOKEN_ENV),
            sheets_token_file: non_empty_var(SHEETS_TOKEN_FILE_ENV).map(PathBuf::from),
            checkpoint_file: path_var("PERMIT_CHECKPOINT_FILE", defaults.checkpoint_file),
            scrape_log_file: path_var("PERMIT_SCRAPE_LOG_FILE", defaults.scrape_log_file),
            output_file: path_var("PERMIT_OUTPUT_FILE", defaults.output_file),
            reports_dir: path_var("PERMIT_REPORTS_DIR", defaults.reports_dir),
            concurrency: positive_var("PERMIT_CONCURRENCY").unwrap_or(defaults.concurrency),
            lookback_days: positive_var("PERMIT_LOOKBACK_DAYS").unwrap_or(defaults.lookback_days),
            headless: std::env::var("PERMIT_HEADLESS")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
            scheduler_cron: non_empty_var("PERMIT_SCHEDULER_CRON")
                .unwrap_or(defaults.scheduler_cron),
            user_agent: non_empty_var("PERMIT_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("PERMIT_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            workspace_root,
        }
    }

    /// Checks that everything a run depends on is configured.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lookback_days == 0 {
            return Err(ConfigError::Invalid {
                name: "PERMIT_LOOKBACK_DAYS",
                reason: "must be at least 1",
            });
        }
        if !self.sheets_enabled {
            return Ok(());
        }
        if self.sheet_id.as_deref().map_or(true, |id| id.trim().is_empty()) {
            return Err(ConfigError::Missing(SHEET_ID_ENV));
        }
        if self.sheets_access_token.is_none() && self.sheets_token_file.is_none() {
            return Err(ConfigError::Missing(
                "GOOGLE_SHEETS_ACCESS_TOKEN or GOOGLE_SHEETS_TOKEN_FILE",
            ));
        }
        Ok(())
    }

    /// Bearer token for the sheets API, read from the environment or the token file.
    pub fn resolve_access_token(&self) -> Result<String, ConfigError> {
        if let Some(token) = &self.sheets_access_token {
            return Ok(token.trim().to_string());
        }
        let path = self
            .sheets_token_file
            .as_ref()
            .ok_or(ConfigError::Missing(SHEETS_TOKEN_ENV))?;
        let token = std::fs::read_to_string(path).map_err(|err| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        let token = token.trim();
        if token.is_empty() {
            return Err(ConfigError::Missing(SHEETS_TOKEN_FILE_ENV));
        }
        Ok(token.to_string())
    }

    pub fn sheets_client_config(&self) -> SheetsClientConfig {
        SheetsClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Zero and unparseable values fall back to the default.
fn positive_var<T>(name: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let value = std::env::var(name).ok()?.trim().parse::<T>().ok()?;
    if value > T::default() {
        Some(value)
    } else {
        warn!(name, "ignoring non-positive setting");
        None
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PermitTypeRegistry {
    pub permit_types: Vec<PermitTypeEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PermitTypeEntry {
    pub label: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_true() -> bool {
    true
}

impl PermitTypeRegistry {
    pub fn builtin() -> Self {
        let permit_types = [
            "Fence Permit",
            "Retaining Wall Permit",
            "Building Residential",
            "Electrical Permit",
        ]
        .into_iter()
        .map(|label| PermitTypeEntry {
            label: label.to_string(),
            enabled: true,
            notes: None,
        })
        .collect();
        Self { permit_types }
    }

    /// Reads `permit_types.yaml` under `root`, falling back to the built-in list.
    pub async fn load_or_builtin(root: &Path) -> Result<Self> {
        let path = root.join("permit_types.yaml");
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Self::builtin());
        }
        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> Vec<PermitType> {
        self.permit_types
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| PermitType::new(entry.label.trim()))
            .collect()
    }
}

/// Reads `portal.yaml` under `root`; absent keys keep their defaults.
pub async fn load_portal_layout(root: &Path) -> Result<PortalLayout> {
    let path = root.join("portal.yaml");
    if !fs::try_exists(&path).await.unwrap_or(false) {
        return Ok(PortalLayout::default());
    }
    let raw = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// A pool task that ended without producing an outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    pub index: usize,
    pub reason: String,
}

impl From<WorkerFailure> for FetchOutcome {
    fn from(failure: WorkerFailure) -> Self {
        FetchOutcome::TransientError(format!(
            "worker for item {} failed: {}",
            failure.index, failure.reason
        ))
    }
}

/// Runs independent work items with at most `concurrency` in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPool {
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// One outcome per item, in input order. A task that panics or is
    /// cancelled yields `O::from(WorkerFailure)` in its slot.
    pub async fn run_all<T, O, W, Fut>(&self, items: Vec<T>, work: W) -> Vec<O>
    where
        T: Send + 'static,
        O: From<WorkerFailure> + Send + 'static,
        W: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let work = Arc::new(work);
        let handles = items
            .into_iter()
            .map(|item| {
                let semaphore = Arc::clone(&semaphore);
                let work = Arc::clone(&work);
                tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    work(item).await
                })
            })
            .collect::<Vec<_>>();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (index, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    warn!(index, error = %err, "worker task did not complete");
                    outcomes.push(O::from(WorkerFailure {
                        index,
                        reason: err.to_string(),
                    }));
                }
            }
        }
        outcomes
    }
}

struct SheetTarget {
    gateway: Arc<dyn SpreadsheetGateway>,
    sheet_id: String,
    range: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryReport {
    pub table: Option<TableSummary>,
    pub table_error: Option<String>,
    pub sheet_rows: Option<usize>,
    pub sheet_error: Option<String>,
}

/// Collects successful records and hands them to the tabular outputs.
pub struct ResultSink {
    table: CsvTableWriter,
    sheet: Option<SheetTarget>,
}

impl ResultSink {
    pub fn new(table: CsvTableWriter) -> Self {
        Self { table, sheet: None }
    }

    pub fn with_sheet(
        mut self,
        gateway: Arc<dyn SpreadsheetGateway>,
        sheet_id: impl Into<String>,
        range: impl Into<String>,
    ) -> Self {
        self.sheet = Some(SheetTarget {
            gateway,
            sheet_id: sheet_id.into(),
            range: range.into(),
        });
        self
    }

    /// Successful records in outcome order; other outcomes are dropped.
    pub fn collect(outcomes: Vec<FetchOutcome>) -> Vec<Record> {
        outcomes
            .into_iter()
            .filter_map(FetchOutcome::into_record)
            .collect()
    }

    /// Writes the local table, then replaces the remote sheet contents.
    pub async fn deliver(&self, records: &[Record]) -> DeliveryReport {
        let rows = records.iter().map(Record::to_row).collect::<Vec<_>>();
        let mut report = DeliveryReport::default();

        match self.table.write(&RECORD_HEADERS, &rows).await {
            Ok(summary) => report.table = Some(summary),
            Err(err) => {
                let message = format!("{err:#}");
                error!(path = %self.table.path().display(), error = %message, "writing tabular output failed");
                report.table_error = Some(message);
            }
        }

        if let Some(sheet) = &self.sheet {
            match replace_sheet(sheet, &rows).await {
                Ok(()) => {
                    info!(rows = rows.len(), sheet_id = %sheet.sheet_id, "Data successfully written to Google Sheets");
                    report.sheet_rows = Some(rows.len());
                }
                Err(err) => {
                    error!(sheet_id = %sheet.sheet_id, error = %err, "writing to Google Sheets failed");
                    report.sheet_error = Some(err.to_string());
                }
            }
        }
        report
    }
}

async fn replace_sheet(
    sheet: &SheetTarget,
    rows: &[Vec<String>],
) -> Result<(), permit_storage::SheetsError> {
    sheet.gateway.clear(&sheet.sheet_id, &sheet.range).await?;
    let mut values: Vec<Vec<String>> = Vec::with_capacity(rows.len() + 1);
    values.push(RECORD_HEADERS.iter().map(|h| h.to_string()).collect());
    values.extend(rows.iter().cloned());
    sheet
        .gateway
        .append(&sheet.sheet_id, &sheet.range, &values)
        .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    WindowPlanned,
    Discovering,
    Fetching,
    Aggregated,
    CheckpointSaved,
    Done,
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::WindowPlanned => "window_planned",
            Self::Discovering => "discovering",
            Self::Fetching => "fetching",
            Self::Aggregated => "aggregated",
            Self::CheckpointSaved => "checkpoint_saved",
            Self::Done => "done",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PermitTypeTally {
    pub discovered: usize,
    pub succeeded: usize,
    pub not_found: usize,
    pub transient_errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub today: NaiveDate,
    pub state: RunState,
    pub states: Vec<RunState>,
    pub window: Option<CrawlWindow>,
    pub work_items: usize,
    pub records: usize,
    pub not_found: usize,
    pub transient_errors: usize,
    pub permit_types: BTreeMap<PermitType, PermitTypeTally>,
    pub delivery: DeliveryReport,
    pub checkpoint_saved: Option<NaiveDate>,
    pub reports_dir: Option<String>,
}

impl CrawlRunSummary {
    fn new(today: NaiveDate) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            today,
            state: RunState::Init,
            states: vec![RunState::Init],
            window: None,
            work_items: 0,
            records: 0,
            not_found: 0,
            transient_errors: 0,
            permit_types: BTreeMap::new(),
            delivery: DeliveryReport::default(),
            checkpoint_saved: None,
            reports_dir: None,
        }
    }

    fn enter(&mut self, state: RunState) {
        info!(run_id = %self.run_id, from = %self.state, to = %state, "crawl state");
        self.state = state;
        self.states.push(state);
    }
}

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("crawl aborted: {0}")]
    Aborted(#[from] ConfigError),
}

pub struct CrawlPipeline<F> {
    config: CrawlConfig,
    permit_types: Vec<PermitType>,
    layout: Arc<PortalLayout>,
    discoverer: WorkItemDiscoverer<F>,
    fetcher: DetailFetcher<F>,
    checkpoints: CheckpointStore,
    sheets: Option<Arc<dyn SpreadsheetGateway>>,
    pool: WorkerPool,
}

impl<F: SessionFactory + 'static> CrawlPipeline<F> {
    pub fn new(
        config: CrawlConfig,
        permit_types: Vec<PermitType>,
        layout: Arc<PortalLayout>,
        factory: Arc<F>,
    ) -> Self {
        Self {
            permit_types,
            discoverer: WorkItemDiscoverer::new(Arc::clone(&factory), Arc::clone(&layout)),
            fetcher: DetailFetcher::new(factory, Arc::clone(&layout)),
            layout,
            checkpoints: CheckpointStore::new(config.checkpoint_file.clone()),
            sheets: None,
            pool: WorkerPool::new(config.concurrency),
            config,
        }
    }

    pub fn with_sheets(mut self, gateway: Arc<dyn SpreadsheetGateway>) -> Self {
        self.sheets = Some(gateway);
        self
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<CrawlRunSummary> {
        self.run_once_at(Local::now().date_naive()).await
    }

    /// One crawl as of `today`: the window ends the day before.
    pub async fn run_once_at(&self, today: NaiveDate) -> Result<CrawlRunSummary> {
        let mut summary = CrawlRunSummary::new(today);

        if let Err(err) = self.check_ready() {
            summary.enter(RunState::Aborted);
            error!(error = %err, "crawl aborted before start");
            return Err(CrawlError::Aborted(err).into());
        }

        let checkpoint = self.checkpoints.load().await;
        let window = match CrawlWindow::plan(checkpoint.as_ref(), today, self.config.lookback_days)
        {
            Ok(window) => window,
            Err(PlanError::InvalidWindow { start, end }) => {
                info!(%start, %end, "crawl window is empty; nothing to do");
                summary.enter(RunState::Done);
                summary.finished_at = Utc::now();
                return Ok(summary);
            }
        };
        summary.window = Some(window);
        summary.enter(RunState::WindowPlanned);
        info!(%window, days = window.day_count(), "crawl window planned");

        summary.enter(RunState::Discovering);
        let items = self.discover_all(&window).await;
        summary.work_items = items.len();
        for item in &items {
            summary
                .permit_types
                .entry(item.permit_type.clone())
                .or_default()
                .discovered += 1;
        }
        info!("Total applications to process: {}", items.len());

        summary.enter(RunState::Fetching);
        let fetcher = self.fetcher.clone();
        let outcomes = self
            .pool
            .run_all(items.clone(), move |item: WorkItem| {
                let fetcher = fetcher.clone();
                async move { fetcher.fetch(&item).await }
            })
            .await;
        for (item, outcome) in items.iter().zip(&outcomes) {
            let tally = summary
                .permit_types
                .entry(item.permit_type.clone())
                .or_default();
            match outcome {
                FetchOutcome::Success(_) => tally.succeeded += 1,
                FetchOutcome::NotFound(reason) => {
                    tally.not_found += 1;
                    summary.not_found += 1;
                    info!(item = %item, %reason, "application skipped");
                }
                FetchOutcome::TransientError(reason) => {
                    tally.transient_errors += 1;
                    summary.transient_errors += 1;
                    warn!(item = %item, %reason, "application failed");
                }
            }
        }

        let records = ResultSink::collect(outcomes);
        summary.records = records.len();
        summary.enter(RunState::Aggregated);
        summary.delivery = self.sink().deliver(&records).await;

        if summary.delivery.table.is_some() {
            let next = next_checkpoint(checkpoint.as_ref(), &window);
            self.checkpoints
                .save(&next)
                .await
                .context("saving crawl checkpoint")?;
            summary.checkpoint_saved = Some(next.last_execution_date);
            summary.enter(RunState::CheckpointSaved);
        } else {
            warn!("tabular output missing; checkpoint left unchanged");
        }

        summary.enter(RunState::Done);
        summary.finished_at = Utc::now();
        match write_reports(&self.config.reports_dir, &summary).await {
            Ok(dir) => summary.reports_dir = Some(dir.display().to_string()),
            Err(err) => warn!(error = ?err, "writing run reports failed"),
        }
        info!(
            run_id = %summary.run_id,
            records = summary.records,
            not_found = summary.not_found,
            transient_errors = summary.transient_errors,
            "crawl finished"
        );
        Ok(summary)
    }

    fn check_ready(&self) -> Result<(), ConfigError> {
        self.config.validate()?;
        if self.config.sheets_enabled && self.sheets.is_none() {
            return Err(ConfigError::Missing("spreadsheet client"));
        }
        Ok(())
    }

    fn sink(&self) -> ResultSink {
        let sink = ResultSink::new(CsvTableWriter::new(self.config.output_file.clone()));
        match (&self.sheets, &self.config.sheet_id) {
            (Some(gateway), Some(sheet_id)) if self.config.sheets_enabled => sink.with_sheet(
                Arc::clone(gateway),
                sheet_id.clone(),
                self.config.sheet_range.clone(),
            ),
            _ => sink,
        }
    }

    /// Permit types outer, dates ascending inner.
    async fn discover_all(&self, window: &CrawlWindow) -> Vec<WorkItem> {
        let mut items = Vec::new();
        for permit_type in &self.permit_types {
            info!("Starting scraping for {permit_type}");
            for date in window.dates() {
                let found = self.discoverer.discover(date, permit_type).await;
                info!(
                    "Found {} applications for {} on {}",
                    found.len(),
                    permit_type,
                    self.layout.format_date(date)
                );
                items.extend(found);
            }
            info!("Finished scraping for {permit_type}");
        }
        items
    }
}

/// The saved checkpoint never moves backwards.
pub fn next_checkpoint(previous: Option<&Checkpoint>, window: &CrawlWindow) -> Checkpoint {
    let date = match previous {
        Some(previous) => previous.last_execution_date.max(window.end()),
        None => window.end(),
    };
    Checkpoint::new(date)
}

async fn write_reports(reports_root: &Path, summary: &CrawlRunSummary) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let window = summary
        .window
        .map(|w| w.to_string())
        .unwrap_or_else(|| "empty".to_string());
    let brief = format!(
        "# Permit Crawl Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Window: {}\n- Work items: {}\n- Records: {}\n- Not found: {}\n- Transient errors: {}\n- Checkpoint: {}\n\n## Permit Types\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        window,
        summary.work_items,
        summary.records,
        summary.not_found,
        summary.transient_errors,
        summary
            .checkpoint_saved
            .map(|d| d.to_string())
            .unwrap_or_else(|| "unchanged".to_string()),
        summary
            .permit_types
            .iter()
            .map(|(permit_type, tally)| format!(
                "- {}: {} discovered, {} scraped",
                permit_type, tally.discovered, tally.succeeded
            ))
            .collect::<Vec<_>>()
            .join("\n")
    );
    fs::write(reports_dir.join("crawl_brief.md"), brief)
        .await
        .context("writing crawl_brief.md")?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    Ok(reports_dir)
}

/// Markdown digest of the most recent `runs` report directories.
pub fn report_recent_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let summaries = dirs
        .into_iter()
        .filter_map(|dir| {
            let summary_path = dir.path().join("run_summary.json");
            let raw = std::fs::read_to_string(&summary_path).ok()?;
            match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(value) => Some((dir, summary_path, value)),
                Err(err) => {
                    warn!(path = %summary_path.display(), error = %err, "skipping unreadable run summary");
                    None
                }
            }
        })
        .take(runs.max(1));

    let mut lines = vec!["# Permit Crawl Runs".to_string(), String::new()];
    for (dir, summary_path, value) in summaries {
        let field = |name: &str| value.get(name).cloned().unwrap_or(serde_json::Value::Null);

        lines.push(format!("## Run `{}`", dir.file_name().to_string_lossy()));
        lines.push(format!("- state: {}", field("state")));
        lines.push(format!("- records: {}", field("records")));
        lines.push(format!("- checkpoint: {}", field("checkpoint_saved")));
        lines.push(format!("- summary: `{}`", summary_path.display()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

/// Registers `pipeline` to run on `config.scheduler_cron`. The caller starts it.
pub async fn build_scheduler<F: SessionFactory + 'static>(
    pipeline: Arc<CrawlPipeline<F>>,
) -> Result<JobScheduler> {
    let cron = pipeline.config().scheduler_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(&cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(run_id = %summary.run_id, records = summary.records, "scheduled crawl finished"),
                Err(err) => error!(error = ?err, "scheduled crawl failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Loads the permit-type registry and portal layout from the workspace root.
pub async fn load_workspace(config: &CrawlConfig) -> Result<(Vec<PermitType>, Arc<PortalLayout>)> {
    let registry = PermitTypeRegistry::load_or_builtin(&config.workspace_root).await?;
    let layout = load_portal_layout(&config.workspace_root).await?;
    Ok((registry.enabled(), Arc::new(layout)))
}

/// Sheets client for `config`, or `None` when sheets are disabled or unconfigured.
pub fn sheets_gateway(config: &CrawlConfig) -> Result<Option<Arc<dyn SpreadsheetGateway>>> {
    if !config.sheets_enabled || config.validate().is_err() {
        return Ok(None);
    }
    let token = config.resolve_access_token()?;
    let client = GoogleSheetsClient::new(config.sheets_client_config(), token)?;
    Ok(Some(Arc::new(client)))
}

pub async fn live_pipeline(config: CrawlConfig) -> Result<CrawlPipeline<ChromiumSessionFactory>> {
    let (permit_types, layout) = load_workspace(&config).await?;
    let factory = Arc::new(ChromiumSessionFactory::new(config.headless));
    let sheets = sheets_gateway(&config)?;
    let pipeline = CrawlPipeline::new(config, permit_types, layout, factory);
    Ok(match sheets {
        Some(gateway) => pipeline.with_sheets(gateway),
        None => pipeline,
    })
}

pub async fn fixture_pipeline(
    config: CrawlConfig,
    fixture: &Path,
) -> Result<CrawlPipeline<FixtureSessionFactory>> {
    let (permit_types, layout) = load_workspace(&config).await?;
    let portal = FixturePortal::load(fixture)?;
    let factory = Arc::new(FixtureSessionFactory::new(portal, Arc::clone(&layout)));
    let sheets = sheets_gateway(&config)?;
    let pipeline = CrawlPipeline::new(config, permit_types, layout, factory);
    Ok(match sheets {
        Some(gateway) => pipeline.with_sheets(gateway),
        None => pipeline,
    })
}

pub async fn run_crawl_once_from_env() -> Result<CrawlRunSummary> {
    let pipeline = live_pipeline(CrawlConfig::from_env()).await?;
    pipeline.run_once().await
}
