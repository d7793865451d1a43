//! End-to-end reconciliation runs against an in-memory record store.

use std::sync::Mutex;

use agora_core::{EventRecord, EventType};
use agora_recon::{
    run_reconcile, ReconcileConfig, ReconcileEngine, RunMode,
};
use agora_store::{RecordStore, StoreError};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};

struct MemoryStore {
    records: Mutex<Vec<EventRecord>>,
}

impl MemoryStore {
    fn new(records: Vec<EventRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn load_working_set(&self, now: NaiveDateTime) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.start >= now)
            .cloned()
            .collect())
    }

    async fn delete_records(&self, ids: &[String]) -> Result<u64, StoreError> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|r| !ids.contains(&r.id));
        Ok((before - records.len()) as u64)
    }
}

fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 9, day)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

fn now() -> NaiveDateTime {
    at(1, 0, 0)
}

fn rec(id: &str, title: &str, venue: &str, start: NaiveDateTime) -> EventRecord {
    EventRecord {
        id: id.to_string(),
        title: title.to_string(),
        venue_name: venue.to_string(),
        start,
        event_type: EventType::Concert,
        source: "more.com".to_string(),
        url: None,
        description_len: 0,
    }
}

#[test]
fn shared_url_keeps_the_trusted_richer_record() {
    // Scenario: identical external URL under two different titles.
    let mut primary = rec("jazz-night-2026-09-03", "Jazz Night", "Half Note", at(3, 21, 0));
    primary.url = Some("https://x/y".to_string());
    primary.description_len = 640;
    let mut newsletter = rec("jazz-night-live-2026-09-03", "Jazz Night Live!", "Half Note", at(3, 21, 0));
    newsletter.url = Some("https://x/y".to_string());
    newsletter.source = "email-newsletter".to_string();
    newsletter.description_len = 120;

    let engine = ReconcileEngine::new(ReconcileConfig::default());
    let plan = engine.plan(&[primary.clone(), newsletter.clone()]);

    assert_eq!(plan.passes[0].groups, 1);
    assert_eq!(plan.passes[0].removed_ids, vec![newsletter.id.clone()]);
    assert_eq!(plan.surviving_ids, vec![primary.id]);
}

#[test]
fn url_group_of_three_keeps_exactly_one_survivor() {
    let records: Vec<EventRecord> = (0..3)
        .map(|i| {
            let mut r = rec(&format!("copy-{i}"), "Jazz Night", "Half Note", at(3, 21, 0));
            r.url = Some("https://x/y".to_string());
            r
        })
        .collect();

    let plan = ReconcileEngine::new(ReconcileConfig::default()).plan(&records);
    assert_eq!(plan.passes[0].groups, 1);
    assert_eq!(plan.passes[0].removed_ids.len(), 2);
    assert_eq!(plan.surviving_ids.len(), 1);
}

#[tokio::test]
async fn theater_run_survives_an_apply_run_untouched() {
    let mut records = vec![
        rec("hamlet-2026-09-02", "Hamlet", "Onassis Stegi", at(2, 21, 0)),
        rec("hamlet-2026-09-05", "Hamlet", "Onassis Stegi", at(5, 21, 0)),
        rec("hamlet-2026-09-09", "Hamlet", "Onassis Stegi", at(9, 21, 0)),
    ];
    for r in &mut records {
        r.event_type = EventType::Theater;
    }
    let store = MemoryStore::new(records);

    let report = run_reconcile(&store, &ReconcileConfig::default(), RunMode::Apply, now())
        .await
        .expect("run");

    assert_eq!(report.protected.theater_run, 3);
    assert_eq!(report.total_removed, 0);
    assert_eq!(store.ids().len(), 3);
}

#[test]
fn sentinel_timestamp_copy_loses_to_the_real_showtime() {
    // Same title, venue and date; only the time of day differs.
    let sentinel = rec("a-jam-midnight", "Jam Session", "Fuzz Club", at(3, 0, 0));
    let real = rec("b-jam-evening", "Jam Session", "Fuzz Club", at(3, 21, 30));

    let plan = ReconcileEngine::new(ReconcileConfig::default()).plan(&[sentinel.clone(), real.clone()]);

    let sentinel_pass = plan.passes.last().expect("six passes");
    assert_eq!(sentinel_pass.groups, 1);
    assert_eq!(sentinel_pass.removed_ids, vec![sentinel.id]);
    assert_eq!(plan.surviving_ids, vec![real.id]);
}

#[test]
fn fuzzy_title_pass_collapses_case_and_whitespace_variants() {
    let mut canonical = rec("jazz-a", "Jazz Night", "Half Note", at(3, 21, 0));
    canonical.description_len = 420;
    let variant = rec("jazz-b", "jazz night ", "Half Note", at(3, 21, 0));

    let plan = ReconcileEngine::new(ReconcileConfig::default()).plan(&[canonical.clone(), variant.clone()]);

    assert_eq!(plan.passes[3].groups, 1);
    assert_eq!(plan.passes[3].removed_ids, vec![variant.id]);
    assert_eq!(plan.surviving_ids, vec![canonical.id]);
}

fn threshold_breach_records() -> Vec<EventRecord> {
    // 20 records, 7 of them removable URL copies: a 35% removal rate.
    let mut records = Vec::new();
    for i in 0..7 {
        let mut keep = rec(&format!("dup-{i}-a"), &format!("Show {i}"), "Gagarin 205", at(10 + i, 21, 0));
        keep.url = Some(format!("https://tickets/{i}"));
        let mut drop = rec(&format!("dup-{i}-b"), &format!("Show {i} at Gagarin"), "Gagarin 205", at(10 + i, 21, 0));
        drop.url = Some(format!("https://tickets/{i}"));
        drop.source = "email-newsletter".to_string();
        records.push(keep);
        records.push(drop);
    }
    for i in 0..6 {
        records.push(rec(&format!("solo-{i}"), &format!("Solo {i}"), "Arch Club", at(20 + i, 20, 0)));
    }
    records
}

#[tokio::test]
async fn threshold_breach_is_advisory_and_modes_agree() {
    let config = ReconcileConfig::default();

    let dry_store = MemoryStore::new(threshold_breach_records());
    let dry = run_reconcile(&dry_store, &config, RunMode::DryRun, now())
        .await
        .expect("dry-run");

    let apply_store = MemoryStore::new(threshold_breach_records());
    let applied = run_reconcile(&apply_store, &config, RunMode::Apply, now())
        .await
        .expect("apply");

    assert_eq!(dry.total_removed, 7);
    assert!((dry.removal_rate - 0.35).abs() < 1e-9);
    assert!(!dry.within_threshold);
    assert!(!applied.within_threshold);

    // Dry-run projection matches what apply actually removed.
    assert_eq!(dry.total_removed, applied.total_removed);
    assert_eq!(dry_store.ids().len(), 20, "dry-run must not delete");
    assert_eq!(apply_store.ids().len(), 13);

    // And the apply-mode store now holds exactly the dry-run survivors.
    let dry_plan = ReconcileEngine::new(config).plan(
        &dry_store.load_working_set(now()).await.expect("load"),
    );
    assert_eq!(dry_plan.surviving_ids, apply_store.ids());
}

#[tokio::test]
async fn apply_is_idempotent() {
    let store = MemoryStore::new(threshold_breach_records());
    let config = ReconcileConfig::default();

    let first = run_reconcile(&store, &config, RunMode::Apply, now())
        .await
        .expect("first run");
    let after_first = store.ids();

    let second = run_reconcile(&store, &config, RunMode::Apply, now())
        .await
        .expect("second run");

    assert_eq!(first.total_removed, 7);
    assert_eq!(second.total_removed, 0);
    assert_eq!(store.ids(), after_first);
}

#[test]
fn plan_does_not_depend_on_store_iteration_order() {
    let records = threshold_breach_records();
    let mut reversed = records.clone();
    reversed.reverse();

    let engine = ReconcileEngine::new(ReconcileConfig::default());
    let forward = engine.plan(&records);
    let backward = engine.plan(&reversed);

    assert_eq!(forward.surviving_ids, backward.surviving_ids);
    for (f, b) in forward.passes.iter().zip(backward.passes.iter()) {
        assert_eq!(f.groups, b.groups);
        assert_eq!(f.removed_ids, b.removed_ids);
    }
}

#[test]
fn protected_records_are_never_in_any_deletion_set() {
    // A weekly residency whose scraper also duplicated the URL: still
    // untouchable once protected.
    let mut records: Vec<EventRecord> = [7u32, 14, 21, 28]
        .iter()
        .map(|d| rec(&format!("open-mic-{d}"), "Open Mic", "Arch Club", at(*d, 21, 0)))
        .collect();
    records[0].url = Some("https://archclub/open-mic".to_string());
    records[1].url = Some("https://archclub/open-mic".to_string());

    let plan = ReconcileEngine::new(ReconcileConfig::default()).plan(&records);

    assert_eq!(plan.protection.len(), 4);
    for pass in &plan.passes {
        for removed in &pass.removed_ids {
            assert!(
                !plan.protection.is_protected(removed),
                "pass {:?} removed protected record {removed}",
                pass.pass
            );
        }
    }
    assert_eq!(plan.surviving_ids.len(), 4);
}
