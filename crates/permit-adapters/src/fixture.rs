//! Fixture replay of the date-search portal.
//!
//! A [`FixturePortal`] describes what the portal lists per date and permit
//! type, and what each application's detail view shows. The session types
//! here walk that description with the same navigation protocol the live
//! browser follows, so the crawl pipeline can run offline.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{
    ElementHandle, PortalLayout, Session, SessionError, SessionFactory, WaitState,
    DETAIL_FIELD_MAP,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureFault {
    /// The detail view never appears.
    Timeout,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureApplication {
    pub identifier: String,
    /// Detail-view label → cell markup.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Raw detail-view markup; takes precedence over `fields`.
    #[serde(default)]
    pub detail_html: Option<String>,
    #[serde(default)]
    pub fault: Option<FixtureFault>,
}

impl FixtureApplication {
    /// An application whose detail view carries every label the extractor reads.
    pub fn complete(identifier: impl Into<String>, application_date: &str) -> Self {
        let identifier = identifier.into();
        let mut fields = BTreeMap::new();
        for spec in DETAIL_FIELD_MAP {
            let value = match spec.label {
                "Application Date" => application_date.to_string(),
                "Status" => "Issued".to_string(),
                "Site Address" => format!("{identifier} Main St"),
                "Square Footage" => "0".to_string(),
                "Value" => "$1,000.00".to_string(),
                _ => "Unknown".to_string(),
            };
            fields.insert(spec.label.to_string(), value);
        }
        Self {
            identifier,
            fields,
            detail_html: None,
            fault: None,
        }
    }

    pub fn with_field(mut self, label: &str, value: &str) -> Self {
        self.fields.insert(label.to_string(), value.to_string());
        self
    }

    pub fn without_field(mut self, label: &str) -> Self {
        self.fields.remove(label);
        self
    }

    pub fn with_fault(mut self, fault: FixtureFault) -> Self {
        self.fault = Some(fault);
        self
    }

    fn render_detail(&self, layout: &PortalLayout) -> String {
        if let Some(html) = &self.detail_html {
            return html.clone();
        }
        let view_id = layout.detail_view.trim_start_matches('#');
        let rows = self
            .fields
            .iter()
            .map(|(label, value)| format!(r#"<tr><td class="head">{label}</td><td>{value}</td></tr>"#))
            .collect::<String>();
        format!(r#"<html><body><div id="{view_id}"><table>{rows}</table></div></body></html>"#)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureListing {
    pub permit_type: String,
    #[serde(default = "default_true")]
    pub has_link: bool,
    /// Clicking the summary link never reaches the detail list.
    #[serde(default)]
    pub listing_fault: bool,
    #[serde(default)]
    pub applications: Vec<FixtureApplication>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureDay {
    pub date: NaiveDate,
    #[serde(default)]
    pub listings: Vec<FixtureListing>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixturePortal {
    #[serde(default)]
    pub days: Vec<FixtureDay>,
}

impl FixturePortal {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
    }

    fn listing_mut(&mut self, date: NaiveDate, permit_type: &str) -> &mut FixtureListing {
        let day_index = match self.days.iter().position(|d| d.date == date) {
            Some(index) => index,
            None => {
                self.days.push(FixtureDay {
                    date,
                    listings: Vec::new(),
                });
                self.days.len() - 1
            }
        };
        let day = &mut self.days[day_index];
        let listing_index = match day.listings.iter().position(|l| l.permit_type == permit_type) {
            Some(index) => index,
            None => {
                day.listings.push(FixtureListing {
                    permit_type: permit_type.to_string(),
                    has_link: true,
                    listing_fault: false,
                    applications: Vec::new(),
                });
                day.listings.len() - 1
            }
        };
        &mut day.listings[listing_index]
    }

    pub fn with_application(
        mut self,
        date: NaiveDate,
        permit_type: &str,
        application: FixtureApplication,
    ) -> Self {
        self.listing_mut(date, permit_type).applications.push(application);
        self
    }

    pub fn with_listing_fault(mut self, date: NaiveDate, permit_type: &str) -> Self {
        self.listing_mut(date, permit_type).listing_fault = true;
        self
    }

    pub fn listing(&self, date: NaiveDate, permit_type: &str) -> Option<&FixtureListing> {
        self.days
            .iter()
            .find(|d| d.date == date)
            .and_then(|d| d.listings.iter().find(|l| l.permit_type == permit_type))
    }

    fn listings(&self, date: NaiveDate) -> &[FixtureListing] {
        self.days
            .iter()
            .find(|d| d.date == date)
            .map(|d| d.listings.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Screen {
    Blank,
    SearchForm {
        mode_selected: bool,
        date: Option<String>,
    },
    Summary(NaiveDate),
    DetailList(NaiveDate, String),
    Detail(NaiveDate, String, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FixtureNode {
    ModeSelect,
    SearchButton,
    SummaryTable,
    SummaryRow(NaiveDate, String),
    Cell(String),
    PermitLink(NaiveDate, String),
    DetailList,
    DetailRow(NaiveDate, String, String),
    ApplicationLink(NaiveDate, String, String),
    DetailView,
}

#[derive(Debug)]
struct SessionInner {
    portal: Arc<FixturePortal>,
    layout: Arc<PortalLayout>,
    screen: Mutex<Screen>,
}

impl SessionInner {
    fn screen(&self) -> Screen {
        self.screen
            .lock()
            .map(|screen| (*screen).clone())
            .unwrap_or(Screen::Blank)
    }

    fn set_screen(&self, screen: Screen) -> Result<(), SessionError> {
        let mut guard = self
            .screen
            .lock()
            .map_err(|e| SessionError::Backend(e.to_string()))?;
        *guard = screen;
        Ok(())
    }

    fn element(self: &Arc<Self>, node: FixtureNode) -> FixtureElement {
        FixtureElement {
            node,
            inner: Arc::clone(self),
        }
    }
}

/// Session over a [`FixturePortal`].
#[derive(Debug)]
pub struct FixtureSession {
    inner: Arc<SessionInner>,
    closed: Arc<AtomicUsize>,
}

#[derive(Debug, Clone)]
pub struct FixtureElement {
    node: FixtureNode,
    inner: Arc<SessionInner>,
}

#[async_trait]
impl ElementHandle for FixtureElement {
    async fn text(&self) -> Result<String, SessionError> {
        Ok(match &self.node {
            FixtureNode::Cell(text) => text.clone(),
            FixtureNode::PermitLink(date, permit_type) => self
                .inner
                .portal
                .listing(*date, permit_type)
                .map(|l| l.applications.len().to_string())
                .unwrap_or_default(),
            FixtureNode::ApplicationLink(_, _, identifier) => identifier.clone(),
            _ => String::new(),
        })
    }

    async fn click(&self) -> Result<(), SessionError> {
        let layout = &self.inner.layout;
        match &self.node {
            FixtureNode::SearchButton => match self.inner.screen() {
                Screen::SearchForm {
                    mode_selected: true,
                    date: Some(value),
                } => {
                    let date = NaiveDate::parse_from_str(&value, &layout.date_format)
                        .map_err(|e| SessionError::Script(format!("bad date '{value}': {e}")))?;
                    self.inner.set_screen(Screen::Summary(date))
                }
                _ => Ok(()),
            },
            FixtureNode::PermitLink(date, permit_type) => {
                let faulty = self
                    .inner
                    .portal
                    .listing(*date, permit_type)
                    .map(|l| l.listing_fault)
                    .unwrap_or(true);
                if faulty {
                    return Ok(());
                }
                self.inner
                    .set_screen(Screen::DetailList(*date, permit_type.clone()))
            }
            FixtureNode::ApplicationLink(date, permit_type, identifier) => self.inner.set_screen(
                Screen::Detail(*date, permit_type.clone(), identifier.clone()),
            ),
            _ => Ok(()),
        }
    }

    async fn query(&self, selector: &str) -> Result<Option<Self>, SessionError> {
        let layout = &self.inner.layout;
        if selector != layout.row_link {
            return Ok(None);
        }
        Ok(match &self.node {
            FixtureNode::SummaryRow(date, permit_type) => self
                .inner
                .portal
                .listing(*date, permit_type)
                .filter(|l| l.has_link)
                .map(|_| {
                    self.inner
                        .element(FixtureNode::PermitLink(*date, permit_type.clone()))
                }),
            FixtureNode::DetailRow(date, permit_type, identifier) => {
                Some(self.inner.element(FixtureNode::ApplicationLink(
                    *date,
                    permit_type.clone(),
                    identifier.clone(),
                )))
            }
            _ => None,
        })
    }

    async fn query_all(&self, selector: &str) -> Result<Vec<Self>, SessionError> {
        let layout = &self.inner.layout;
        if selector == layout.row_cells {
            if let FixtureNode::SummaryRow(_, permit_type) = &self.node {
                let mut cells = vec![self.inner.element(FixtureNode::Cell(permit_type.clone()))];
                if let Some(link) = self.query(&layout.row_link).await? {
                    cells.push(link);
                }
                return Ok(cells);
            }
        }
        Ok(self.query(selector).await?.into_iter().collect())
    }
}

#[async_trait]
impl Session for FixtureSession {
    type Element = FixtureElement;

    async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        if url != self.inner.layout.search_url {
            return Err(SessionError::Navigation {
                url: url.to_string(),
                reason: "unknown fixture page".to_string(),
            });
        }
        self.inner.set_screen(Screen::SearchForm {
            mode_selected: false,
            date: None,
        })
    }

    async fn select_option(&self, selector: &str, value: &str) -> Result<(), SessionError> {
        let layout = &self.inner.layout;
        match self.inner.screen() {
            Screen::SearchForm { date, .. }
                if selector == layout.search_mode_select && value == layout.search_mode_value =>
            {
                self.inner.set_screen(Screen::SearchForm {
                    mode_selected: true,
                    date,
                })
            }
            _ => Err(SessionError::MissingElement(format!("{selector} option {value}"))),
        }
    }

    async fn evaluate(&self, _script: &str, args: JsonValue) -> Result<JsonValue, SessionError> {
        let layout = &self.inner.layout;
        if let Screen::SearchForm { mode_selected, .. } = self.inner.screen() {
            if args.get("inputId").and_then(JsonValue::as_str) == Some(layout.date_input_id.as_str()) {
                let value = args
                    .get("value")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string);
                self.inner.set_screen(Screen::SearchForm {
                    mode_selected,
                    date: value,
                })?;
            }
        }
        Ok(JsonValue::Null)
    }

    async fn wait_for(
        &self,
        selector: &str,
        _state: WaitState,
        timeout: Duration,
    ) -> Result<Self::Element, SessionError> {
        let layout = &self.inner.layout;
        let screen = self.inner.screen();
        let node = match screen {
            Screen::SearchForm { .. } if selector == layout.search_mode_select => {
                Some(FixtureNode::ModeSelect)
            }
            Screen::SearchForm { .. } if selector == layout.date_search_button => {
                Some(FixtureNode::SearchButton)
            }
            Screen::Summary(_) if selector == layout.summary_table => Some(FixtureNode::SummaryTable),
            Screen::DetailList(..) if selector == layout.detail_list => Some(FixtureNode::DetailList),
            Screen::Detail(date, permit_type, identifier) if selector == layout.detail_view => self
                .inner
                .portal
                .listing(date, &permit_type)
                .and_then(|l| l.applications.iter().find(|a| a.identifier == identifier))
                .filter(|a| a.fault.is_none())
                .map(|_| FixtureNode::DetailView),
            _ => None,
        };
        node.map(|node| self.inner.element(node))
            .ok_or_else(|| SessionError::timeout(selector, timeout))
    }

    async fn query_all(&self, selector: &str) -> Result<Vec<Self::Element>, SessionError> {
        let layout = &self.inner.layout;
        Ok(match self.inner.screen() {
            Screen::Summary(date) if selector == layout.summary_rows => self
                .inner
                .portal
                .listings(date)
                .iter()
                .map(|l| {
                    self.inner
                        .element(FixtureNode::SummaryRow(date, l.permit_type.clone()))
                })
                .collect(),
            Screen::DetailList(date, permit_type) if selector == layout.detail_rows => self
                .inner
                .portal
                .listing(date, &permit_type)
                .map(|l| {
                    l.applications
                        .iter()
                        .map(|a| {
                            self.inner.element(FixtureNode::DetailRow(
                                date,
                                permit_type.clone(),
                                a.identifier.clone(),
                            ))
                        })
                        .collect()
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        })
    }

    async fn content(&self) -> Result<String, SessionError> {
        Ok(match self.inner.screen() {
            Screen::Detail(date, permit_type, identifier) => self
                .inner
                .portal
                .listing(date, &permit_type)
                .and_then(|l| l.applications.iter().find(|a| a.identifier == identifier))
                .map(|a| a.render_detail(&self.inner.layout))
                .unwrap_or_default(),
            _ => "<html><body></body></html>".to_string(),
        })
    }

    async fn close(self) -> Result<(), SessionError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Opens isolated [`FixtureSession`]s that share one read-only portal.
#[derive(Debug)]
pub struct FixtureSessionFactory {
    portal: Arc<FixturePortal>,
    layout: Arc<PortalLayout>,
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
}

impl FixtureSessionFactory {
    pub fn new(portal: FixturePortal, layout: Arc<PortalLayout>) -> Self {
        Self {
            portal: Arc::new(portal),
            layout,
            opened: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn sessions_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory for FixtureSessionFactory {
    type Session = FixtureSession;

    async fn open(&self) -> Result<Self::Session, SessionError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(FixtureSession {
            inner: Arc::new(SessionInner {
                portal: Arc::clone(&self.portal),
                layout: Arc::clone(&self.layout),
                screen: Mutex::new(Screen::Blank),
            }),
            closed: Arc::clone(&self.closed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portal_loads_from_json_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("portal.json");
        fs::write(
            &path,
            r#"{
              "days": [{
                "date": "2023-01-02",
                "listings": [{
                  "permit_type": "Fence Permit",
                  "applications": [
                    { "identifier": "A-1", "fields": { "Status": "Issued" } },
                    { "identifier": "A-2", "fault": "timeout" }
                  ]
                }]
              }]
            }"#,
        )
        .unwrap();

        let portal = FixturePortal::load(&path).unwrap();
        let date = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        let listing = portal.listing(date, "Fence Permit").unwrap();
        assert!(listing.has_link);
        assert!(!listing.listing_fault);
        assert_eq!(listing.applications.len(), 2);
        assert_eq!(listing.applications[1].fault, Some(FixtureFault::Timeout));
    }

    #[test]
    fn rendered_detail_uses_layout_view_id() {
        let html = FixtureApplication::complete("A-1", "01/02/2023")
            .render_detail(&PortalLayout::default());
        assert!(html.contains(r#"<div id="divApplicationDate">"#));
        assert!(html.contains(r#"<td class="head">Subdivision</td>"#));
    }
}
