//! Core domain model for the permit crawler: work items, records, checkpoints
//! and the crawl-window planner.

use std::fmt;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "permit-core";

/// Days crawled on a first run, when no checkpoint exists yet.
pub const DEFAULT_LOOKBACK_DAYS: u64 = 30;

/// Column headers of the tabular output, in [`Record::to_row`] order.
pub const RECORD_HEADERS: [&str; 8] = [
    "Permit Type",
    "Application Number",
    "Application Date",
    "Status",
    "Site Address",
    "Square Footage",
    "Value",
    "Subdivision",
];

/// Category label used to filter the portal's daily summary listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermitType(String);

impl PermitType {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn label(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PermitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PermitType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One unit of fetch work produced by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    pub application_identifier: String,
    pub date: NaiveDate,
    pub permit_type: PermitType,
}

impl WorkItem {
    pub fn new(
        application_identifier: impl Into<String>,
        date: NaiveDate,
        permit_type: PermitType,
    ) -> Self {
        Self {
            application_identifier: application_identifier.into(),
            date,
            permit_type,
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} application {} for date {}",
            self.permit_type, self.application_identifier, self.date
        )
    }
}

/// Fully extracted permit application. Never partially populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub permit_type: PermitType,
    pub application_identifier: String,
    pub application_date: NaiveDate,
    pub status: String,
    pub site_address: String,
    pub square_footage: String,
    pub value: String,
    pub subdivision: String,
}

impl Record {
    /// Row cells in [`RECORD_HEADERS`] order.
    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.permit_type.label().to_string(),
            self.application_identifier.clone(),
            self.application_date.format("%Y-%m-%d").to_string(),
            self.status.clone(),
            self.site_address.clone(),
            self.square_footage.clone(),
            self.value.clone(),
            self.subdivision.clone(),
        ]
    }
}

/// Persisted marker of crawl progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(alias = "lastExecutionDate")]
    pub last_execution_date: NaiveDate,
}

impl Checkpoint {
    pub fn new(last_execution_date: NaiveDate) -> Self {
        Self {
            last_execution_date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("crawl window is empty: start {start} is after end {end}")]
    InvalidWindow { start: NaiveDate, end: NaiveDate },
}

/// Inclusive date range crawled in one run. Always `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CrawlWindow {
    start: NaiveDate,
    end: NaiveDate,
}

impl CrawlWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, PlanError> {
        if start > end {
            return Err(PlanError::InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }

    /// Plan this run's window. The end is always the day before `now`, since
    /// same-day portal data is not yet stable.
    pub fn plan(
        checkpoint: Option<&Checkpoint>,
        now: NaiveDate,
        lookback_days: u64,
    ) -> Result<Self, PlanError> {
        let start = match checkpoint {
            Some(checkpoint) => checkpoint.last_execution_date,
            None => days_before(now, lookback_days),
        };
        Self::new(start, days_before(now, 1))
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn day_count(&self) -> u64 {
        (self.end - self.start).num_days().unsigned_abs() + 1
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |date| *date <= end)
    }
}

impl fmt::Display for CrawlWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

fn days_before(date: NaiveDate, days: u64) -> NaiveDate {
    date.checked_sub_days(Days::new(days))
        .unwrap_or(NaiveDate::MIN)
}

/// Result of fetching one work item. Per-item failures are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success(Record),
    NotFound(String),
    TransientError(String),
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn record(&self) -> Option<&Record> {
        match self {
            Self::Success(record) => Some(record),
            _ => None,
        }
    }

    pub fn into_record(self) -> Option<Record> {
        match self {
            Self::Success(record) => Some(record),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::NotFound(_) => "not_found",
            Self::TransientError(_) => "transient_error",
        }
    }
}
