use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use permit_adapters::fixture::{FixtureApplication, FixtureFault, FixturePortal, FixtureSessionFactory};
use permit_adapters::PortalLayout;
use permit_core::{Checkpoint, PermitType};
use permit_storage::{CheckpointStore, SheetsError, SpreadsheetGateway};
use permit_sync::{CrawlConfig, CrawlError, CrawlPipeline, RunState};
use tempfile::TempDir;

fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SheetCall {
    Clear(String),
    Append(String, Vec<Vec<String>>),
}

#[derive(Default)]
struct RecordingGateway {
    calls: Mutex<Vec<SheetCall>>,
    fail_append: bool,
}

impl RecordingGateway {
    fn calls(&self) -> Vec<SheetCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpreadsheetGateway for RecordingGateway {
    async fn clear(&self, _sheet_id: &str, range: &str) -> Result<(), SheetsError> {
        self.calls
            .lock()
            .unwrap()
            .push(SheetCall::Clear(range.to_string()));
        Ok(())
    }

    async fn append(
        &self,
        _sheet_id: &str,
        range: &str,
        rows: &[Vec<String>],
    ) -> Result<(), SheetsError> {
        if self.fail_append {
            return Err(SheetsError::RetriesExhausted("append".to_string()));
        }
        self.calls
            .lock()
            .unwrap()
            .push(SheetCall::Append(range.to_string(), rows.to_vec()));
        Ok(())
    }
}

fn fast_layout() -> Arc<PortalLayout> {
    Arc::new(PortalLayout {
        settle_delay_ms: 0,
        wait_timeout_ms: 50,
        ..PortalLayout::default()
    })
}

fn config(dir: &TempDir) -> CrawlConfig {
    let mut config = CrawlConfig::for_workspace(dir.path());
    config.sheet_id = Some("sheet-123".to_string());
    config.sheets_access_token = Some("test-token".to_string());
    config.concurrency = 3;
    config
}

fn pipeline(
    config: CrawlConfig,
    portal: FixturePortal,
    permit_types: &[&str],
    gateway: Arc<RecordingGateway>,
) -> (CrawlPipeline<FixtureSessionFactory>, Arc<FixtureSessionFactory>) {
    let layout = fast_layout();
    let factory = Arc::new(FixtureSessionFactory::new(portal, Arc::clone(&layout)));
    let permit_types = permit_types.iter().map(|p| PermitType::new(*p)).collect();
    let pipeline = CrawlPipeline::new(config, permit_types, layout, Arc::clone(&factory))
        .with_sheets(gateway);
    (pipeline, factory)
}

/// Two days, two permit types; the second type has nothing on the first day.
fn two_day_portal() -> FixturePortal {
    FixturePortal::default()
        .with_application(
            ymd(2023, 3, 13),
            "Fence Permit",
            FixtureApplication::complete("F-1", "03/13/2023"),
        )
        .with_application(
            ymd(2023, 3, 13),
            "Fence Permit",
            FixtureApplication::complete("F-2", "03/13/2023"),
        )
        .with_application(
            ymd(2023, 3, 14),
            "Fence Permit",
            FixtureApplication::complete("F-3", "03/14/2023"),
        )
        .with_application(
            ymd(2023, 3, 14),
            "Electrical Permit",
            FixtureApplication::complete("E-1", "03/14/2023"),
        )
}

#[tokio::test]
async fn crawl_collects_all_records_and_advances_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let checkpoint_file = config.checkpoint_file.clone();
    let output_file = config.output_file.clone();
    CheckpointStore::new(&checkpoint_file)
        .save(&Checkpoint::new(ymd(2023, 3, 13)))
        .await
        .unwrap();

    let gateway = Arc::new(RecordingGateway::default());
    let (pipeline, factory) = pipeline(
        config,
        two_day_portal(),
        &["Fence Permit", "Electrical Permit"],
        Arc::clone(&gateway),
    );
    let summary = pipeline.run_once_at(ymd(2023, 3, 15)).await.unwrap();

    assert_eq!(summary.state, RunState::Done);
    assert_eq!(
        summary.states,
        vec![
            RunState::Init,
            RunState::WindowPlanned,
            RunState::Discovering,
            RunState::Fetching,
            RunState::Aggregated,
            RunState::CheckpointSaved,
            RunState::Done,
        ]
    );
    assert_eq!(summary.work_items, 4);
    assert_eq!(summary.records, 4);
    assert_eq!(summary.checkpoint_saved, Some(ymd(2023, 3, 14)));

    let csv = std::fs::read_to_string(&output_file).unwrap();
    let ids = csv
        .lines()
        .skip(1)
        .map(|line| line.split(',').nth(1).unwrap().to_string())
        .collect::<Vec<_>>();
    // permit types outer, dates inner
    assert_eq!(ids, vec!["F-1", "F-2", "F-3", "E-1"]);

    let saved = CheckpointStore::new(&checkpoint_file).load().await.unwrap();
    assert_eq!(saved.last_execution_date, ymd(2023, 3, 14));

    let calls = gateway.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], SheetCall::Clear("Sheet1".to_string()));
    match &calls[1] {
        SheetCall::Append(range, rows) => {
            assert_eq!(range, "Sheet1");
            assert_eq!(rows.len(), 5);
            assert_eq!(rows[0][0], "Permit Type");
            assert_eq!(rows[1][2], "2023-03-13");
        }
        other => panic!("unexpected call {other:?}"),
    }

    assert_eq!(factory.sessions_opened(), factory.sessions_closed());
    let reports_dir = std::path::PathBuf::from(summary.reports_dir.unwrap());
    assert!(reports_dir.join("run_summary.json").exists());
    assert!(reports_dir.join("crawl_brief.md").exists());
}

#[tokio::test]
async fn failed_items_are_dropped_without_failing_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let output_file = config.output_file.clone();
    CheckpointStore::new(&config.checkpoint_file)
        .save(&Checkpoint::new(ymd(2023, 3, 14)))
        .await
        .unwrap();

    let portal = FixturePortal::default()
        .with_application(
            ymd(2023, 3, 14),
            "Fence Permit",
            FixtureApplication::complete("OK-1", "03/14/2023"),
        )
        .with_application(
            ymd(2023, 3, 14),
            "Fence Permit",
            FixtureApplication::complete("SLOW-1", "03/14/2023").with_fault(FixtureFault::Timeout),
        )
        .with_application(
            ymd(2023, 3, 14),
            "Fence Permit",
            FixtureApplication::complete("BARE-1", "03/14/2023").without_field("Subdivision"),
        );

    let gateway = Arc::new(RecordingGateway::default());
    let (pipeline, factory) = pipeline(config, portal, &["Fence Permit"], gateway);
    let summary = pipeline.run_once_at(ymd(2023, 3, 15)).await.unwrap();

    assert_eq!(summary.work_items, 3);
    assert_eq!(summary.records, 1);
    assert_eq!(summary.not_found, 1);
    assert_eq!(summary.transient_errors, 1);
    assert_eq!(summary.checkpoint_saved, Some(ymd(2023, 3, 14)));

    let csv = std::fs::read_to_string(&output_file).unwrap();
    assert_eq!(csv.lines().count(), 2);
    assert!(csv.contains("OK-1"));
    assert_eq!(factory.sessions_opened(), factory.sessions_closed());
}

#[tokio::test]
async fn checkpoint_of_today_is_an_empty_window() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let output_file = config.output_file.clone();
    CheckpointStore::new(&config.checkpoint_file)
        .save(&Checkpoint::new(ymd(2023, 3, 15)))
        .await
        .unwrap();

    let gateway = Arc::new(RecordingGateway::default());
    let (pipeline, factory) = pipeline(
        config,
        two_day_portal(),
        &["Fence Permit"],
        Arc::clone(&gateway),
    );
    let summary = pipeline.run_once_at(ymd(2023, 3, 15)).await.unwrap();

    assert_eq!(summary.state, RunState::Done);
    assert_eq!(summary.window, None);
    assert_eq!(summary.work_items, 0);
    assert_eq!(factory.sessions_opened(), 0);
    assert!(gateway.calls().is_empty());
    assert!(!output_file.exists());
}

#[tokio::test]
async fn missing_sheet_configuration_aborts_before_any_work() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    config.sheet_id = None;
    let checkpoint_file = config.checkpoint_file.clone();

    let gateway = Arc::new(RecordingGateway::default());
    let (pipeline, factory) = pipeline(config, two_day_portal(), &["Fence Permit"], gateway);
    let err = pipeline.run_once_at(ymd(2023, 3, 15)).await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<CrawlError>(),
        Some(CrawlError::Aborted(_))
    ));
    assert_eq!(factory.sessions_opened(), 0);
    assert!(!checkpoint_file.exists());
}

#[tokio::test]
async fn sheet_failure_does_not_block_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let checkpoint_file = config.checkpoint_file.clone();
    CheckpointStore::new(&checkpoint_file)
        .save(&Checkpoint::new(ymd(2023, 3, 14)))
        .await
        .unwrap();

    let gateway = Arc::new(RecordingGateway {
        fail_append: true,
        ..Default::default()
    });
    let (pipeline, _factory) = pipeline(config, two_day_portal(), &["Fence Permit"], gateway);
    let summary = pipeline.run_once_at(ymd(2023, 3, 15)).await.unwrap();

    assert_eq!(summary.records, 1);
    assert!(summary.delivery.sheet_error.is_some());
    assert!(summary.delivery.table.is_some());
    assert_eq!(summary.checkpoint_saved, Some(ymd(2023, 3, 14)));
}

#[tokio::test]
async fn first_run_crawls_thirty_days_ending_yesterday() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    config.sheets_enabled = false;
    config.sheet_id = None;
    let checkpoint_file = config.checkpoint_file.clone();

    let portal = FixturePortal::default().with_application(
        ymd(2023, 2, 13),
        "Fence Permit",
        FixtureApplication::complete("EARLY-1", "02/13/2023"),
    );
    let gateway = Arc::new(RecordingGateway::default());
    let (pipeline, _factory) = pipeline(config, portal, &["Fence Permit"], Arc::clone(&gateway));
    let summary = pipeline.run_once_at(ymd(2023, 3, 15)).await.unwrap();

    let window = summary.window.unwrap();
    assert_eq!(window.start(), ymd(2023, 2, 13));
    assert_eq!(window.end(), ymd(2023, 3, 14));
    assert_eq!(summary.records, 1);
    assert!(gateway.calls().is_empty());

    let saved = CheckpointStore::new(&checkpoint_file).load().await.unwrap();
    assert_eq!(saved.last_execution_date, ymd(2023, 3, 14));
}

#[tokio::test]
async fn sample_fixture_replays_through_workspace_config() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("portal.yaml"),
        "settle_delay_ms: 0\nwait_timeout_ms: 50\n",
    )
    .unwrap();
    let mut config = CrawlConfig::for_workspace(dir.path());
    config.sheets_enabled = false;
    CheckpointStore::new(&config.checkpoint_file)
        .save(&Checkpoint::new(ymd(2023, 3, 13)))
        .await
        .unwrap();

    let fixture = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/sample_portal.json");
    let pipeline = permit_sync::fixture_pipeline(config, &fixture).await.unwrap();
    let summary = pipeline.run_once_at(ymd(2023, 3, 15)).await.unwrap();

    assert_eq!(summary.work_items, 4);
    assert_eq!(summary.records, 2);
    assert_eq!(summary.not_found, 1);
    assert_eq!(summary.transient_errors, 1);

    let brief = std::fs::read_to_string(
        std::path::PathBuf::from(summary.reports_dir.unwrap()).join("crawl_brief.md"),
    )
    .unwrap();
    assert!(brief.contains("- Records: 2"));
}
