//! History maintenance against the JSON file store.
//!
//! Covers the operations the CLI exposes on a persisted history:
//! incomplete-entry listing, suspended-URL repair, pattern analysis,
//! entry deletion and clearing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use harvest::history::{Cadence, IncompleteReason, PatternConfidence};
use harvest::testing::{record, ManualClock};
use harvest::{
    ExtractedRecord, HistoryRepository, HistoryStore, JsonFileStore, RecordStatus,
};

const REGULAR: &str = "https://anid.cl/concursos/fondecyt-regular/";
const SUSPENDED: &str = "https://anid.cl/concurso-suspendido/becas-chile-2025/";
const BARE: &str = "https://anid.cl/concursos/fondef-idea/";

const ONE_YEAR: Duration = Duration::from_secs(365 * 24 * 3600);

struct Env {
    _dir: tempfile::TempDir,
    clock: Arc<ManualClock>,
    store: Arc<JsonFileStore>,
    history: HistoryStore,
}

fn env() -> Env {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(JsonFileStore::new(dir.path()).with_clock(clock.clone()));
    let history = HistoryStore::new(store.clone(), clock.clone());
    Env {
        _dir: dir,
        clock,
        store,
        history,
    }
}

fn dated(name: &str, url: &str, opening: &str, closing: &str, status: RecordStatus) -> ExtractedRecord {
    ExtractedRecord {
        opening_date: Some(opening.to_string()),
        closing_date: Some(closing.to_string()),
        status: Some(status),
        ..record(name, url)
    }
}

#[tokio::test]
async fn test_find_incomplete_skips_suspended_and_complete_entries() {
    let env = env();
    let records = vec![
        dated("FONDECYT Regular", REGULAR, "2025-03-03", "2025-05-02", RecordStatus::Closed),
        record("Becas Chile 2025", SUSPENDED),
        record("FONDEF IDeA", BARE),
    ];
    env.history
        .reconcile("anid.cl", &records, &HashMap::new())
        .await
        .unwrap();

    let incomplete = env.history.find_incomplete("anid.cl").await.unwrap();

    assert_eq!(incomplete.len(), 1);
    assert_eq!(incomplete[0].url, BARE);
    assert_eq!(
        incomplete[0].reasons,
        vec![
            IncompleteReason::MissingStatus,
            IncompleteReason::MissingOpeningDate,
            IncompleteReason::MissingClosingDate,
        ]
    );
}

#[tokio::test]
async fn test_fix_suspended_appends_a_version_once() {
    let env = env();
    env.history
        .reconcile("anid.cl", &[record("Becas Chile 2025", SUSPENDED)], &HashMap::new())
        .await
        .unwrap();

    // an older run stored the entry before suspended URLs were recognized
    let mut stored = env.store.load_history("anid.cl").await.unwrap().unwrap();
    stored.entries[0].versions[0].status = Some(RecordStatus::Open);
    env.store.save_history(&stored).await.unwrap();

    let fixed = env.history.fix_suspended_by_url("anid.cl").await.unwrap();
    assert_eq!(fixed, vec![SUSPENDED.to_string()]);

    let again = env.history.fix_suspended_by_url("anid.cl").await.unwrap();
    assert!(again.is_empty());

    let entry = env
        .store
        .load_history("anid.cl")
        .await
        .unwrap()
        .unwrap()
        .find(SUSPENDED)
        .cloned()
        .unwrap();
    assert_eq!(entry.versions.len(), 2);
    assert_eq!(entry.latest_status(), Some(RecordStatus::Suspended));
}

#[tokio::test]
async fn test_pattern_analysis_over_three_years() {
    let env = env();
    let editions = [
        ("2025-03-03", "2025-05-02"),
        ("2026-03-02", "2026-05-04"),
        ("2027-03-01", "2027-05-03"),
    ];

    for (opening, closing) in editions {
        env.history
            .reconcile(
                "anid.cl",
                &[dated("FONDECYT Regular", REGULAR, opening, closing, RecordStatus::Closed)],
                &HashMap::new(),
            )
            .await
            .unwrap();
        env.clock.advance(ONE_YEAR);
    }

    let analysis = env
        .history
        .analyze_patterns("anid.cl", REGULAR, 5)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(analysis.total_versions, 3);
    assert_eq!(analysis.average_opening_month, Some(3));
    assert_eq!(analysis.cadence, Some(Cadence::Annual));
    assert_eq!(analysis.confidence, PatternConfidence::High);
    assert_eq!(
        analysis.predicted_opening.map(|d| d.to_string()).as_deref(),
        Some("2028-02-28")
    );

    // a one-year window only sees the latest version
    let narrow = env
        .history
        .analyze_patterns("anid.cl", REGULAR, 1)
        .await
        .unwrap();
    assert!(narrow.is_none());
}

#[tokio::test]
async fn test_delete_and_clear() {
    let env = env();
    env.history
        .reconcile(
            "anid.cl",
            &[record("FONDECYT Regular", REGULAR), record("FONDEF IDeA", BARE)],
            &HashMap::new(),
        )
        .await
        .unwrap();

    assert!(env.history.delete_entry("anid.cl", BARE).await.unwrap());
    assert!(!env.history.delete_entry("anid.cl", BARE).await.unwrap());

    let removed = env.history.clear("anid.cl").await.unwrap();
    assert_eq!(removed, 1);

    let stored = env.store.load_history("anid.cl").await.unwrap().unwrap();
    assert!(stored.is_empty());
}
