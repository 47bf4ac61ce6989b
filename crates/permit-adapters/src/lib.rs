//! Browsing-session contracts and the permit portal adapter: discovery of
//! application identifiers and detail-page extraction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use permit_core::{FetchOutcome, PermitType, Record, WorkItem};
use scraper::{ElementRef, Html, Node, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

#[cfg(feature = "chromium")]
pub mod chromium;
pub mod fixture;

pub const CRATE_NAME: &str = "permit-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    Attached,
    Visible,
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("timed out after {timeout_ms} ms waiting for {selector}")]
    Timeout { selector: String, timeout_ms: u64 },
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("script evaluation failed: {0}")]
    Script(String),
    #[error("no element matches {0}")]
    MissingElement(String),
    #[error("browser session error: {0}")]
    Backend(String),
}

impl SessionError {
    pub fn timeout(selector: &str, timeout: Duration) -> Self {
        Self::Timeout {
            selector: selector.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

#[async_trait]
pub trait ElementHandle: Send + Sync + Sized {
    async fn text(&self) -> Result<String, SessionError>;

    async fn click(&self) -> Result<(), SessionError>;

    async fn query(&self, selector: &str) -> Result<Option<Self>, SessionError>;

    async fn query_all(&self, selector: &str) -> Result<Vec<Self>, SessionError>;
}

/// One isolated browsing session: its own page, cookies and form state.
#[async_trait]
pub trait Session: Send + Sync + Sized {
    type Element: ElementHandle;

    async fn navigate(&self, url: &str) -> Result<(), SessionError>;

    async fn select_option(&self, selector: &str, value: &str) -> Result<(), SessionError>;

    async fn evaluate(&self, script: &str, args: JsonValue) -> Result<JsonValue, SessionError>;

    async fn wait_for(
        &self,
        selector: &str,
        state: WaitState,
        timeout: Duration,
    ) -> Result<Self::Element, SessionError>;

    async fn query_all(&self, selector: &str) -> Result<Vec<Self::Element>, SessionError>;

    /// Serialized HTML of the current page.
    async fn content(&self) -> Result<String, SessionError>;

    async fn close(self) -> Result<(), SessionError>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    type Session: Session;

    async fn open(&self) -> Result<Self::Session, SessionError>;
}

/// Sets the search form's date input and fires a bubbling `change` event.
pub const SET_DATE_SCRIPT: &str = r#"(args) => {
    const input = document.getElementById(args.inputId);
    input.value = args.value;
    input.dispatchEvent(new Event('change', { bubbles: true }));
}"#;

/// Selectors and timings of the date-search portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalLayout {
    pub search_url: String,
    pub search_mode_select: String,
    pub search_mode_value: String,
    pub date_input_id: String,
    pub date_search_button: String,
    pub summary_table: String,
    pub summary_rows: String,
    pub row_cells: String,
    pub row_link: String,
    pub detail_list: String,
    pub detail_rows: String,
    pub detail_view: String,
    pub header_cell: String,
    pub date_format: String,
    pub settle_delay_ms: u64,
    pub wait_timeout_ms: u64,
}

impl Default for PortalLayout {
    fn default() -> Self {
        Self {
            search_url: "https://permittingservices.montgomerycountymd.gov/DPS/online/eSearch.aspx?by=Address&SearchType=DataSearch#".to_string(),
            search_mode_select: "#tabsNamesSelect".to_string(),
            search_mode_value: "tabsDate".to_string(),
            date_input_id: "dpsTopSection_txtDate".to_string(),
            date_search_button: "#dpsTopSection_cmdDateSearch".to_string(),
            summary_table: "#listDateSummary".to_string(),
            summary_rows: "#listDateSummary tr".to_string(),
            row_cells: "td".to_string(),
            row_link: "td.clickLink".to_string(),
            detail_list: "#listDateDetail".to_string(),
            detail_rows: "#listDateDetail tbody tr".to_string(),
            detail_view: "#divApplicationDate".to_string(),
            header_cell: "td.head".to_string(),
            date_format: "%m/%d/%Y".to_string(),
            settle_delay_ms: 2_000,
            wait_timeout_ms: 60_000,
        }
    }
}

impl PortalLayout {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn format_date(&self, date: NaiveDate) -> String {
        date.format(&self.date_format).to_string()
    }
}

/// Output fields read from the detail view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailField {
    ApplicationDate,
    Status,
    SiteAddress,
    SquareFootage,
    Value,
    Subdivision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub field: DetailField,
    pub label: &'static str,
    /// Line breaks inside the cell collapse to single spaces.
    pub join_lines: bool,
}

impl DetailField {
    pub const fn spec(self) -> FieldSpec {
        let (label, join_lines) = match self {
            DetailField::ApplicationDate => ("Application Date", false),
            DetailField::Status => ("Status", false),
            DetailField::SiteAddress => ("Site Address", true),
            DetailField::SquareFootage => ("Square Footage", false),
            DetailField::Value => ("Value", false),
            DetailField::Subdivision => ("Subdivision", false),
        };
        FieldSpec {
            field: self,
            label,
            join_lines,
        }
    }
}

pub const DETAIL_FIELD_MAP: [FieldSpec; 6] = [
    DetailField::ApplicationDate.spec(),
    DetailField::Status.spec(),
    DetailField::SiteAddress.spec(),
    DetailField::SquareFootage.spec(),
    DetailField::Value.spec(),
    DetailField::Subdivision.spec(),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetailParseError {
    #[error("invalid selector {selector}: {reason}")]
    InvalidSelector { selector: String, reason: String },
    #[error("label '{0}' missing from detail page")]
    MissingLabel(&'static str),
    #[error("unparseable {label} '{value}'")]
    InvalidDate { label: &'static str, value: String },
}

fn normalize_text(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn cell_text(cell: ElementRef<'_>, join_lines: bool) -> String {
    let mut out = String::new();
    for node in cell.descendants() {
        match node.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(element) if element.name() == "br" => out.push('\n'),
            _ => {}
        }
    }
    if join_lines {
        normalize_text(&out.replace("<br>", " "))
    } else {
        out.trim().to_string()
    }
}

/// Text of the cell immediately following the header cell whose text equals `label`.
pub fn extract_by_label(
    document: &Html,
    header: &Selector,
    label: &str,
    join_lines: bool,
) -> Option<String> {
    document
        .select(header)
        .find(|cell| normalize_text(&cell.text().collect::<String>()) == label)
        .and_then(|cell| cell.next_siblings().find_map(ElementRef::wrap))
        .map(|value| cell_text(value, join_lines))
}

fn parse_portal_date(value: &str, layout: &PortalLayout) -> Option<NaiveDate> {
    [layout.date_format.as_str(), "%Y-%m-%d", "%m/%d/%y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

/// Build a [`Record`] from a detail page. Any missing label rejects the whole page.
pub fn parse_detail_page(
    html: &str,
    layout: &PortalLayout,
    item: &WorkItem,
) -> Result<Record, DetailParseError> {
    let header = Selector::parse(&layout.header_cell).map_err(|e| DetailParseError::InvalidSelector {
        selector: layout.header_cell.clone(),
        reason: e.to_string(),
    })?;
    let document = Html::parse_document(html);

    let read = |field: DetailField| {
        let spec = field.spec();
        extract_by_label(&document, &header, spec.label, spec.join_lines)
            .ok_or(DetailParseError::MissingLabel(spec.label))
    };

    let date_text = read(DetailField::ApplicationDate)?;
    let application_date =
        parse_portal_date(&date_text, layout).ok_or_else(|| DetailParseError::InvalidDate {
            label: DetailField::ApplicationDate.spec().label,
            value: date_text.clone(),
        })?;

    Ok(Record {
        permit_type: item.permit_type.clone(),
        application_identifier: item.application_identifier.clone(),
        application_date,
        status: read(DetailField::Status)?,
        site_address: read(DetailField::SiteAddress)?,
        square_footage: read(DetailField::SquareFootage)?,
        value: read(DetailField::Value)?,
        subdivision: read(DetailField::Subdivision)?,
    })
}

async fn submit_date_search<S: Session>(
    session: &S,
    layout: &PortalLayout,
    date: NaiveDate,
) -> Result<(), SessionError> {
    let timeout = layout.wait_timeout();
    session.navigate(&layout.search_url).await?;
    session
        .wait_for(&layout.search_mode_select, WaitState::Visible, timeout)
        .await?;
    session
        .select_option(&layout.search_mode_select, &layout.search_mode_value)
        .await?;
    if !layout.settle_delay().is_zero() {
        tokio::time::sleep(layout.settle_delay()).await;
    }
    session
        .evaluate(
            SET_DATE_SCRIPT,
            json!({ "inputId": layout.date_input_id, "value": layout.format_date(date) }),
        )
        .await?;
    let search = session
        .wait_for(&layout.date_search_button, WaitState::Visible, timeout)
        .await?;
    search.click().await?;
    session
        .wait_for(&layout.summary_table, WaitState::Visible, timeout)
        .await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Listing {
    Opened,
    RowNotFound,
    NoLink,
}

async fn open_permit_listing<S: Session>(
    session: &S,
    layout: &PortalLayout,
    permit_type: &PermitType,
) -> Result<Listing, SessionError> {
    for row in session.query_all(&layout.summary_rows).await? {
        let mut matches = false;
        for cell in row.query_all(&layout.row_cells).await? {
            if normalize_text(&cell.text().await?) == permit_type.label() {
                matches = true;
                break;
            }
        }
        if !matches {
            continue;
        }
        let Some(link) = row.query(&layout.row_link).await? else {
            return Ok(Listing::NoLink);
        };
        link.click().await?;
        session
            .wait_for(&layout.detail_list, WaitState::Visible, layout.wait_timeout())
            .await?;
        return Ok(Listing::Opened);
    }
    Ok(Listing::RowNotFound)
}

/// Enumerates application identifiers for one (date, permit type) pair.
#[derive(Debug)]
pub struct WorkItemDiscoverer<F> {
    factory: Arc<F>,
    layout: Arc<PortalLayout>,
}

impl<F> Clone for WorkItemDiscoverer<F> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            layout: Arc::clone(&self.layout),
        }
    }
}

impl<F: SessionFactory> WorkItemDiscoverer<F> {
    pub fn new(factory: Arc<F>, layout: Arc<PortalLayout>) -> Self {
        Self { factory, layout }
    }

    /// Never fails: structural problems are logged and yield no items.
    pub async fn discover(&self, date: NaiveDate, permit_type: &PermitType) -> Vec<WorkItem> {
        let span = info_span!("discover", %date, permit_type = %permit_type);
        async {
            let session = match self.factory.open().await {
                Ok(session) => session,
                Err(err) => {
                    warn!(error = %err, "could not open browsing session for discovery");
                    return Vec::new();
                }
            };
            let result = self.discover_in_session(&session, date, permit_type).await;
            if let Err(err) = session.close().await {
                debug!(error = %err, "closing discovery session failed");
            }
            match result {
                Ok(items) => items,
                Err(err) => {
                    warn!(error = %err, "discovery failed; treating as no applications");
                    Vec::new()
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn discover_in_session(
        &self,
        session: &F::Session,
        date: NaiveDate,
        permit_type: &PermitType,
    ) -> Result<Vec<WorkItem>, SessionError> {
        let layout = self.layout.as_ref();
        submit_date_search(session, layout, date).await?;
        match open_permit_listing(session, layout, permit_type).await? {
            Listing::Opened => {}
            Listing::RowNotFound => {
                info!("{permit_type} row not found");
                return Ok(Vec::new());
            }
            Listing::NoLink => {
                info!("No applications link found for {permit_type}");
                return Ok(Vec::new());
            }
        }

        let mut items = Vec::new();
        for row in session.query_all(&layout.detail_rows).await? {
            let Some(link) = row.query(&layout.row_link).await? else {
                continue;
            };
            let identifier = normalize_text(&link.text().await?);
            if !identifier.is_empty() {
                items.push(WorkItem::new(identifier, date, permit_type.clone()));
            }
        }
        Ok(items)
    }
}

/// Retrieves one application's detail record in a fresh session.
#[derive(Debug)]
pub struct DetailFetcher<F> {
    factory: Arc<F>,
    layout: Arc<PortalLayout>,
}

impl<F> Clone for DetailFetcher<F> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            layout: Arc::clone(&self.layout),
        }
    }
}

impl<F: SessionFactory> DetailFetcher<F> {
    pub fn new(factory: Arc<F>, layout: Arc<PortalLayout>) -> Self {
        Self { factory, layout }
    }

    pub async fn fetch(&self, item: &WorkItem) -> FetchOutcome {
        let span = info_span!(
            "fetch_detail",
            application = %item.application_identifier,
            date = %item.date,
            permit_type = %item.permit_type
        );
        async {
            info!("Processing {item}");
            let session = match self.factory.open().await {
                Ok(session) => session,
                Err(err) => {
                    warn!(error = %err, "could not open browsing session");
                    return FetchOutcome::TransientError(err.to_string());
                }
            };
            let result = self.fetch_in_session(&session, item).await;
            if let Err(err) = session.close().await {
                debug!(error = %err, "closing fetch session failed");
            }
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(err) => FetchOutcome::TransientError(err.to_string()),
            };
            match &outcome {
                FetchOutcome::Success(record) => info!(
                    "Scraped: {}, {}, {}, {}, {}, {}, {}, {}",
                    record.permit_type,
                    record.application_identifier,
                    record.application_date,
                    record.status,
                    record.site_address,
                    record.square_footage,
                    record.value,
                    record.subdivision
                ),
                FetchOutcome::NotFound(reason) => info!(reason = %reason, "application not found"),
                FetchOutcome::TransientError(reason) => {
                    warn!(reason = %reason, "An error occurred while processing {item}")
                }
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn fetch_in_session(
        &self,
        session: &F::Session,
        item: &WorkItem,
    ) -> Result<FetchOutcome, SessionError> {
        let layout = self.layout.as_ref();
        submit_date_search(session, layout, item.date).await?;
        match open_permit_listing(session, layout, &item.permit_type).await? {
            Listing::Opened => {}
            Listing::RowNotFound => {
                return Ok(FetchOutcome::NotFound(format!(
                    "{} row not found",
                    item.permit_type
                )))
            }
            Listing::NoLink => {
                return Ok(FetchOutcome::NotFound(format!(
                    "No applications link found for {}",
                    item.permit_type
                )))
            }
        }

        let mut target = None;
        for row in session.query_all(&layout.detail_rows).await? {
            if let Some(link) = row.query(&layout.row_link).await? {
                if normalize_text(&link.text().await?) == item.application_identifier {
                    target = Some(link);
                    break;
                }
            }
        }
        let Some(link) = target else {
            return Ok(FetchOutcome::NotFound(format!(
                "Application {} not found in the list",
                item.application_identifier
            )));
        };

        link.click().await?;
        session
            .wait_for(&layout.detail_view, WaitState::Visible, layout.wait_timeout())
            .await?;
        let html = session.content().await?;
        Ok(match parse_detail_page(&html, layout, item) {
            Ok(record) => FetchOutcome::Success(record),
            Err(err) => FetchOutcome::NotFound(err.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{FixtureApplication, FixtureFault, FixturePortal, FixtureSessionFactory};

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn fast_layout() -> Arc<PortalLayout> {
        Arc::new(PortalLayout {
            settle_delay_ms: 0,
            wait_timeout_ms: 50,
            ..PortalLayout::default()
        })
    }

    fn item(id: &str, date: NaiveDate, permit_type: &str) -> WorkItem {
        WorkItem::new(id, date, PermitType::new(permit_type))
    }

    const DETAIL_HTML: &str = r#"
        <div id="divApplicationDate">
          <table>
            <tr><td class="head">Application Date</td><td>01/02/2023</td></tr>
            <tr><td class="head">Status</td><td> Issued </td></tr>
            <tr><td class="head">Site Address</td><td>12 Oak Ln<br>Rockville, MD 20850</td></tr>
            <tr><td class="head">Square Footage</td><td>120</td></tr>
            <tr><td class="head">Value</td><td>$4,500.00</td></tr>
            <tr><td class="head">Subdivision</td><td>Twinbrook</td></tr>
          </table>
        </div>"#;

    #[test]
    fn detail_page_with_all_labels_yields_full_record() {
        let layout = PortalLayout::default();
        let work = item("1012345", ymd(2023, 1, 2), "Fence Permit");
        let record = parse_detail_page(DETAIL_HTML, &layout, &work).unwrap();

        assert_eq!(
            record.to_row(),
            vec![
                "Fence Permit",
                "1012345",
                "2023-01-02",
                "Issued",
                "12 Oak Ln Rockville, MD 20850",
                "120",
                "$4,500.00",
                "Twinbrook"
            ]
        );
    }

    #[test]
    fn field_map_covers_each_field_once() {
        for spec in DETAIL_FIELD_MAP {
            assert_eq!(spec.field.spec(), spec);
        }
        let joined = DETAIL_FIELD_MAP
            .iter()
            .filter(|spec| spec.join_lines)
            .map(|spec| spec.label)
            .collect::<Vec<_>>();
        assert_eq!(joined, vec!["Site Address"]);
    }

    #[test]
    fn detail_page_missing_any_label_is_rejected() {
        let layout = PortalLayout::default();
        let work = item("1012345", ymd(2023, 1, 2), "Fence Permit");
        for spec in DETAIL_FIELD_MAP {
            let needle = format!(r#"<td class="head">{}</td>"#, spec.label);
            let html = DETAIL_HTML.replace(&needle, r#"<td class="head">Other</td>"#);
            assert_eq!(
                parse_detail_page(&html, &layout, &work),
                Err(DetailParseError::MissingLabel(spec.label)),
                "label {}",
                spec.label
            );
        }
    }

    #[test]
    fn label_lookup_is_exact_not_prefix() {
        let html = r#"<table>
            <tr><td class="head">Status Date</td><td>wrong</td></tr>
            <tr><td class="head">Status</td><td>Open</td></tr>
        </table>"#;
        let document = Html::parse_document(html);
        let header = Selector::parse("td.head").unwrap();
        assert_eq!(
            extract_by_label(&document, &header, "Status", false).as_deref(),
            Some("Open")
        );
        assert_eq!(extract_by_label(&document, &header, "Value", false), None);
    }

    #[test]
    fn unparseable_application_date_is_rejected() {
        let layout = PortalLayout::default();
        let work = item("1", ymd(2023, 1, 2), "Fence Permit");
        let html = DETAIL_HTML.replace("01/02/2023", "pending");
        assert_eq!(
            parse_detail_page(&html, &layout, &work),
            Err(DetailParseError::InvalidDate {
                label: "Application Date",
                value: "pending".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn discover_lists_identifiers_for_matching_row() {
        let date = ymd(2023, 1, 2);
        let portal = FixturePortal::default()
            .with_application(date, "Fence Permit", FixtureApplication::complete("A-1", "01/02/2023"))
            .with_application(date, "Fence Permit", FixtureApplication::complete("A-2", "01/02/2023"))
            .with_application(date, "Electrical Permit", FixtureApplication::complete("E-1", "01/02/2023"));
        let factory = Arc::new(FixtureSessionFactory::new(portal, fast_layout()));
        let discoverer = WorkItemDiscoverer::new(factory.clone(), fast_layout());

        let items = discoverer.discover(date, &PermitType::new("Fence Permit")).await;
        assert_eq!(
            items,
            vec![item("A-1", date, "Fence Permit"), item("A-2", date, "Fence Permit")]
        );
        assert_eq!(factory.sessions_opened(), 1);
        assert_eq!(factory.sessions_closed(), 1);
    }

    #[tokio::test]
    async fn discover_returns_empty_when_permit_row_is_absent() {
        let date = ymd(2023, 1, 2);
        let portal = FixturePortal::default()
            .with_application(date, "Fence Permit", FixtureApplication::complete("A-1", "01/02/2023"));
        let factory = Arc::new(FixtureSessionFactory::new(portal, fast_layout()));
        let discoverer = WorkItemDiscoverer::new(factory, fast_layout());

        assert!(discoverer
            .discover(date, &PermitType::new("Retaining Wall Permit"))
            .await
            .is_empty());
        assert!(discoverer
            .discover(ymd(2023, 1, 3), &PermitType::new("Fence Permit"))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn discover_swallows_structural_failures() {
        let date = ymd(2023, 1, 2);
        let portal = FixturePortal::default()
            .with_application(date, "Fence Permit", FixtureApplication::complete("A-1", "01/02/2023"))
            .with_listing_fault(date, "Fence Permit");
        let factory = Arc::new(FixtureSessionFactory::new(portal, fast_layout()));
        let discoverer = WorkItemDiscoverer::new(factory.clone(), fast_layout());

        assert!(discoverer
            .discover(date, &PermitType::new("Fence Permit"))
            .await
            .is_empty());
        assert_eq!(factory.sessions_closed(), 1);
    }

    #[tokio::test]
    async fn fetch_returns_success_for_listed_application() {
        let date = ymd(2023, 1, 2);
        let portal = FixturePortal::default().with_application(
            date,
            "Fence Permit",
            FixtureApplication::complete("A-1", "01/02/2023")
                .with_field("Site Address", "5 Elm St<br>Bethesda"),
        );
        let factory = Arc::new(FixtureSessionFactory::new(portal, fast_layout()));
        let fetcher = DetailFetcher::new(factory, fast_layout());

        let outcome = fetcher.fetch(&item("A-1", date, "Fence Permit")).await;
        let record = outcome.into_record().expect("success");
        assert_eq!(record.application_identifier, "A-1");
        assert_eq!(record.application_date, date);
        assert_eq!(record.site_address, "5 Elm St Bethesda");
    }

    #[tokio::test]
    async fn fetch_reports_not_found_for_unknown_identifier_or_missing_label() {
        let date = ymd(2023, 1, 2);
        let portal = FixturePortal::default()
            .with_application(date, "Fence Permit", FixtureApplication::complete("A-1", "01/02/2023"))
            .with_application(
                date,
                "Fence Permit",
                FixtureApplication::complete("A-2", "01/02/2023").without_field("Subdivision"),
            );
        let factory = Arc::new(FixtureSessionFactory::new(portal, fast_layout()));
        let fetcher = DetailFetcher::new(factory, fast_layout());

        assert!(matches!(
            fetcher.fetch(&item("A-9", date, "Fence Permit")).await,
            FetchOutcome::NotFound(_)
        ));
        assert!(matches!(
            fetcher.fetch(&item("A-1", date, "Electrical Permit")).await,
            FetchOutcome::NotFound(_)
        ));
        assert_eq!(
            fetcher.fetch(&item("A-2", date, "Fence Permit")).await,
            FetchOutcome::NotFound("label 'Subdivision' missing from detail page".to_string())
        );
    }

    #[tokio::test]
    async fn fetch_converts_timeouts_into_transient_errors() {
        let date = ymd(2023, 1, 2);
        let portal = FixturePortal::default().with_application(
            date,
            "Fence Permit",
            FixtureApplication::complete("A-1", "01/02/2023").with_fault(FixtureFault::Timeout),
        );
        let factory = Arc::new(FixtureSessionFactory::new(portal, fast_layout()));
        let fetcher = DetailFetcher::new(factory.clone(), fast_layout());

        match fetcher.fetch(&item("A-1", date, "Fence Permit")).await {
            FetchOutcome::TransientError(reason) => {
                assert!(reason.contains("#divApplicationDate"), "{reason}")
            }
            other => panic!("expected transient error, got {other:?}"),
        }
        assert_eq!(factory.sessions_closed(), 1);
    }

    #[test]
    fn portal_layout_overrides_merge_with_defaults() {
        let layout: PortalLayout =
            serde_json::from_str(r#"{"wait_timeout_ms": 1000, "date_format": "%Y-%m-%d"}"#).unwrap();
        assert_eq!(layout.wait_timeout(), Duration::from_secs(1));
        assert_eq!(layout.format_date(ymd(2023, 1, 2)), "2023-01-02");
        assert_eq!(layout.summary_table, "#listDateSummary");
    }
}
