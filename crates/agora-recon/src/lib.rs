//! Event reconciliation engine: recurring-show protection, six ordered
//! duplicate passes, canonical survivor selection, and run reporting.
//!
//! The engine is a deterministic batch process. It reads the working set
//! once, plans every deletion in memory (each pass only sees what survived
//! the passes before it), and in apply mode commits the plan pass by pass.
//! A false-positive merge destroys a legitimate occurrence for good, so
//! every rule here errs on the side of leaving a duplicate behind.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use agora_core::{
    is_sentinel_time, normalize_title, normalize_venue, EventRecord, ProtectionReason,
};
use agora_store::RecordStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "agora-recon";

const THEATER_RUN_MIN_SHOWS: usize = 3;
const THEATER_RUN_MIN_SPAN_DAYS: i64 = 7;
const EXHIBITION_RUN_MIN_SHOWS: usize = 5;
const EXHIBITION_RUN_MIN_SPAN_DAYS: i64 = 14;
const WEEKLY_MIN_OCCURRENCES: usize = 4;
const FESTIVAL_MIN_SHOWS: usize = 3;

/// Separator for composite grouping keys; never appears in scraped text.
const KEY_SEP: char = '\u{1f}';

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    /// Ranked source trust list; earlier entries win duplicate groups.
    /// Sources not listed rank behind everything listed.
    #[serde(default = "default_source_priority")]
    pub source_priority: Vec<String>,
    #[serde(default = "default_removal_warn_threshold")]
    pub removal_warn_threshold: f64,
    /// Tokens that mark a multi-day festival title, matched after title
    /// normalization.
    #[serde(default = "default_festival_markers")]
    pub festival_markers: Vec<String>,
}

fn default_source_priority() -> Vec<String> {
    vec!["more.com".into(), "viva.gr".into(), "gazarte.gr".into()]
}

fn default_removal_warn_threshold() -> f64 {
    0.20
}

fn default_festival_markers() -> Vec<String> {
    vec!["festival".into(), "φεστιβάλ".into()]
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            source_priority: default_source_priority(),
            removal_warn_threshold: default_removal_warn_threshold(),
            festival_markers: default_festival_markers(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(flatten)]
    config: ReconcileConfig,
}

impl ReconcileConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: RulesFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(file.config)
    }

    pub fn source_rank(&self, source: &str) -> usize {
        self.source_priority
            .iter()
            .position(|s| s == source)
            .unwrap_or(self.source_priority.len())
    }

    fn is_festival_title(&self, normalized_title: &str) -> bool {
        self.festival_markers
            .iter()
            .any(|marker| normalized_title.contains(&marker.to_lowercase()))
    }
}

/// Ids excluded from every deletion pass, with the classification that
/// excluded them. Computed fresh each run from the current working set
/// and consulted read-only by the passes.
#[derive(Debug, Clone, Default)]
pub struct ProtectionIndex {
    reasons: BTreeMap<String, ProtectionReason>,
}

impl ProtectionIndex {
    pub fn is_protected(&self, id: &str) -> bool {
        self.reasons.contains_key(id)
    }

    pub fn reason(&self, id: &str) -> Option<ProtectionReason> {
        self.reasons.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.reasons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reasons.is_empty()
    }

    pub fn counts(&self) -> ProtectedCounts {
        let mut counts = ProtectedCounts::default();
        for reason in self.reasons.values() {
            match reason {
                ProtectionReason::TheaterRun => counts.theater_run += 1,
                ProtectionReason::ExhibitionRun => counts.exhibition_run += 1,
                ProtectionReason::WeeklyRecurring => counts.weekly_recurring += 1,
                ProtectionReason::Festival => counts.festival += 1,
            }
        }
        counts.total = self.reasons.len();
        counts
    }
}

/// Marks every member of a legitimate multi-occurrence group. Groups are
/// keyed on `(normalized title, venue)`; records missing either field
/// join no group. Admission is judged on the qualifying subset (e.g. the
/// theater-typed members) but protection covers the whole group, matching
/// how listings mix types for one production.
pub fn classify_protected(
    records: &[EventRecord],
    config: &ReconcileConfig,
) -> ProtectionIndex {
    let mut groups: BTreeMap<(String, String), Vec<&EventRecord>> = BTreeMap::new();
    for record in records {
        if !record.has_title() || !record.has_venue() {
            continue;
        }
        groups
            .entry((normalize_title(&record.title), record.venue_name.clone()))
            .or_default()
            .push(record);
    }

    let mut index = ProtectionIndex::default();
    for ((normalized_title, _venue), members) in &groups {
        if let Some(reason) = admit_group(normalized_title, members, config) {
            for member in members {
                index.reasons.insert(member.id.clone(), reason);
            }
        }
    }
    index
}

fn admit_group(
    normalized_title: &str,
    members: &[&EventRecord],
    config: &ReconcileConfig,
) -> Option<ProtectionReason> {
    let staged: Vec<&&EventRecord> = members
        .iter()
        .filter(|m| m.event_type.is_staged_run())
        .collect();
    if staged.len() >= THEATER_RUN_MIN_SHOWS
        && span_days(staged.iter().map(|m| m.start)) >= THEATER_RUN_MIN_SPAN_DAYS
    {
        return Some(ProtectionReason::TheaterRun);
    }

    let exhibitions: Vec<&&EventRecord> = members
        .iter()
        .filter(|m| m.event_type == agora_core::EventType::Exhibition)
        .collect();
    if exhibitions.len() >= EXHIBITION_RUN_MIN_SHOWS
        && span_days(exhibitions.iter().map(|m| m.start)) >= EXHIBITION_RUN_MIN_SPAN_DAYS
    {
        return Some(ProtectionReason::ExhibitionRun);
    }

    if members.len() >= WEEKLY_MIN_OCCURRENCES {
        let weekdays: HashSet<chrono::Weekday> =
            members.iter().map(|m| m.start.date().weekday()).collect();
        if weekdays.len() <= 1 {
            return Some(ProtectionReason::WeeklyRecurring);
        }
    }

    if members.len() >= FESTIVAL_MIN_SHOWS && config.is_festival_title(normalized_title) {
        return Some(ProtectionReason::Festival);
    }

    None
}

fn span_days(starts: impl Iterator<Item = NaiveDateTime>) -> i64 {
    let dates: Vec<chrono::NaiveDate> = starts.map(|s| s.date()).collect();
    match (dates.iter().min(), dates.iter().max()) {
        (Some(first), Some(last)) => (*last - *first).num_days(),
        _ => 0,
    }
}

/// The six reconciliation passes, strongest signal first. Later passes
/// only ever see the residue the earlier ones could not resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Pass {
    ExternalUrl,
    ExactTuple,
    CrossSourceWindow,
    FuzzyTitle,
    VenueNormalized,
    SentinelTimestamp,
}

impl Pass {
    pub const ALL: [Pass; 6] = [
        Pass::ExternalUrl,
        Pass::ExactTuple,
        Pass::CrossSourceWindow,
        Pass::FuzzyTitle,
        Pass::VenueNormalized,
        Pass::SentinelTimestamp,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Pass::ExternalUrl => "external-url",
            Pass::ExactTuple => "exact-tuple",
            Pass::CrossSourceWindow => "cross-source-window",
            Pass::FuzzyTitle => "fuzzy-title",
            Pass::VenueNormalized => "venue-normalized",
            Pass::SentinelTimestamp => "sentinel-timestamp",
        }
    }
}

fn composite_key(parts: &[&str]) -> String {
    let mut key = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEP);
        }
        key.push_str(part);
    }
    key
}

/// Grouping key for one record under one pass. `None` means the record
/// lacks a field the key depends on and is merge-ineligible in this pass.
fn pass_key(pass: Pass, record: &EventRecord) -> Option<String> {
    if pass == Pass::ExternalUrl {
        if !record.has_url() {
            return None;
        }
        return record.url.as_deref().map(|u| u.trim().to_string());
    }

    if !record.has_title() || !record.has_venue() {
        return None;
    }
    let date = record.start.date().to_string();
    match pass {
        Pass::ExternalUrl => unreachable!("handled above"),
        Pass::ExactTuple => Some(composite_key(&[
            &record.title,
            &record.venue_name,
            &date,
            &record.start.time().to_string(),
        ])),
        Pass::CrossSourceWindow => Some(composite_key(&[
            &normalize_title(&record.title),
            &record.venue_name,
            &date,
        ])),
        Pass::FuzzyTitle => {
            if record.title.chars().count() < 5 {
                return None;
            }
            Some(composite_key(&[
                &record.title.trim().to_lowercase(),
                &record.venue_name,
                &date,
            ]))
        }
        Pass::VenueNormalized => Some(composite_key(&[
            &record.title,
            &normalize_venue(&record.venue_name),
            &date,
        ])),
        Pass::SentinelTimestamp => Some(composite_key(&[
            &record.title,
            &record.venue_name,
            &date,
        ])),
    }
}

fn group_qualifies(pass: Pass, members: &[&EventRecord]) -> bool {
    match pass {
        Pass::CrossSourceWindow => {
            let sources: HashSet<&str> = members.iter().map(|m| m.source.as_str()).collect();
            if sources.len() < 2 {
                return false;
            }
            let starts: Vec<NaiveDateTime> = members.iter().map(|m| m.start).collect();
            match (starts.iter().min(), starts.iter().max()) {
                (Some(first), Some(last)) => *last - *first <= Duration::hours(24),
                _ => false,
            }
        }
        // Passes 4 and 5 exist to catch casing/punctuation variants. A
        // group whose titles (or venues) are byte-identical is not a
        // variant group: it differs only in showtime, which is either a
        // legitimate double bill or pass 6's sentinel case.
        Pass::FuzzyTitle => {
            let titles: HashSet<&str> = members.iter().map(|m| m.title.as_str()).collect();
            titles.len() >= 2
        }
        Pass::VenueNormalized => {
            let venues: HashSet<&str> = members.iter().map(|m| m.venue_name.as_str()).collect();
            venues.len() >= 2
        }
        Pass::SentinelTimestamp => members
            .iter()
            .map(|m| m.start.time())
            .min()
            .is_some_and(is_sentinel_time),
        _ => true,
    }
}

/// Total order over a duplicate group; the first record survives. One
/// governing principle for every pass: prefer the most authoritative,
/// most complete record. Pass 6 alone ranks time realism above source
/// trust; pass 1 alone breaks remaining ties on title length.
pub fn canonical_cmp(
    config: &ReconcileConfig,
    pass: Pass,
    a: &EventRecord,
    b: &EventRecord,
) -> Ordering {
    if pass == Pass::SentinelTimestamp {
        // false < true, so a real showtime sorts ahead of a sentinel
        let ord = a.has_sentinel_time().cmp(&b.has_sentinel_time());
        if ord != Ordering::Equal {
            return ord;
        }
    }
    let ord = config.source_rank(&a.source).cmp(&config.source_rank(&b.source));
    if ord != Ordering::Equal {
        return ord;
    }
    let ord = b.description_len.cmp(&a.description_len);
    if ord != Ordering::Equal {
        return ord;
    }
    if pass == Pass::ExternalUrl {
        let ord = b.title.chars().count().cmp(&a.title.chars().count());
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.id.cmp(&b.id)
}

#[derive(Debug, Clone)]
pub struct PassOutcome {
    pub pass: Pass,
    pub groups: usize,
    /// Ids deleted by this pass, in deterministic (key, selector) order.
    pub removed_ids: Vec<String>,
}

/// Pure deletion plan for one run. Identical inputs produce an identical
/// plan regardless of store iteration order.
#[derive(Debug, Clone)]
pub struct ReconcilePlan {
    pub initial_count: usize,
    pub ungroupable: usize,
    pub protection: ProtectionIndex,
    pub passes: Vec<PassOutcome>,
    pub surviving_ids: Vec<String>,
    pub residual_duplicates: usize,
}

impl ReconcilePlan {
    pub fn total_removed(&self) -> usize {
        self.passes.iter().map(|p| p.removed_ids.len()).sum()
    }

    pub fn removal_rate(&self) -> f64 {
        if self.initial_count == 0 {
            0.0
        } else {
            self.total_removed() as f64 / self.initial_count as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileEngine {
    config: ReconcileConfig,
}

impl ReconcileEngine {
    pub fn new(config: ReconcileConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn plan(&self, records: &[EventRecord]) -> ReconcilePlan {
        let protection = classify_protected(records, &self.config);
        let ungroupable = records
            .iter()
            .filter(|r| !r.has_title() || !r.has_venue())
            .count();

        let mut removed: HashSet<String> = HashSet::new();
        let mut passes = Vec::with_capacity(Pass::ALL.len());

        for pass in Pass::ALL {
            // BTreeMap keeps group iteration independent of input order.
            let mut groups: BTreeMap<String, Vec<&EventRecord>> = BTreeMap::new();
            for record in records {
                if removed.contains(&record.id) || protection.is_protected(&record.id) {
                    continue;
                }
                if let Some(key) = pass_key(pass, record) {
                    groups.entry(key).or_default().push(record);
                }
            }

            let mut outcome = PassOutcome {
                pass,
                groups: 0,
                removed_ids: Vec::new(),
            };
            for (_key, mut members) in groups {
                if members.len() < 2 || !group_qualifies(pass, &members) {
                    continue;
                }
                outcome.groups += 1;
                members.sort_by(|a, b| canonical_cmp(&self.config, pass, a, b));
                for loser in &members[1..] {
                    outcome.removed_ids.push(loser.id.clone());
                    removed.insert(loser.id.clone());
                }
            }
            passes.push(outcome);
        }

        let mut surviving_ids: Vec<String> = records
            .iter()
            .filter(|r| !removed.contains(&r.id))
            .map(|r| r.id.clone())
            .collect();
        surviving_ids.sort();

        // Post-hoc check: survivors still sharing (title, venue, date)
        // belong to a duplicate class no pass covers. Reported, not fixed.
        let mut distinct_tuples: BTreeSet<String> = BTreeSet::new();
        let mut survivor_count = 0usize;
        for record in records.iter().filter(|r| !removed.contains(&r.id)) {
            survivor_count += 1;
            distinct_tuples.insert(composite_key(&[
                &record.title,
                &record.venue_name,
                &record.start.date().to_string(),
            ]));
        }
        let residual_duplicates = survivor_count - distinct_tuples.len();

        ReconcilePlan {
            initial_count: records.len(),
            ungroupable,
            protection,
            passes,
            surviving_ids,
            residual_duplicates,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    DryRun,
    Apply,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ProtectedCounts {
    pub theater_run: usize,
    pub exhibition_run: usize,
    pub weekly_recurring: usize,
    pub festival: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PassReport {
    pub pass: Pass,
    pub groups: usize,
    pub removed: usize,
}

/// Structured run report, suitable for logging or CI-style assertions.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub initial_count: usize,
    pub protected: ProtectedCounts,
    pub ungroupable: usize,
    pub passes: Vec<PassReport>,
    pub total_removed: usize,
    pub removal_rate: f64,
    pub removal_warn_threshold: f64,
    /// Advisory only: `false` flags the run for human review, it never
    /// blocks or reverts.
    pub within_threshold: bool,
    pub surviving_count: usize,
    pub residual_duplicates: usize,
}

impl RunReport {
    fn from_plan(
        plan: &ReconcilePlan,
        run_id: Uuid,
        mode: RunMode,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        removal_warn_threshold: f64,
    ) -> Self {
        let total_removed = plan.total_removed();
        let removal_rate = plan.removal_rate();
        Self {
            run_id,
            mode,
            started_at,
            finished_at,
            initial_count: plan.initial_count,
            protected: plan.protection.counts(),
            ungroupable: plan.ungroupable,
            passes: plan
                .passes
                .iter()
                .map(|p| PassReport {
                    pass: p.pass,
                    groups: p.groups,
                    removed: p.removed_ids.len(),
                })
                .collect(),
            total_removed,
            removal_rate,
            removal_warn_threshold,
            within_threshold: removal_rate <= removal_warn_threshold,
            surviving_count: plan.surviving_ids.len(),
            residual_duplicates: plan.residual_duplicates,
        }
    }
}

/// One full reconciliation run: load, plan, commit pass by pass (apply
/// mode only), report. Strictly linear; a store failure aborts mid-pass
/// and leaves earlier passes committed, which is safe because the plan is
/// idempotent over its own output.
pub async fn run_reconcile(
    store: &dyn RecordStore,
    config: &ReconcileConfig,
    mode: RunMode,
    now: NaiveDateTime,
) -> Result<RunReport> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();

    let records = store
        .load_working_set(now)
        .await
        .context("loading working set")?;
    info!(run_id = %run_id, records = records.len(), "reconciliation run started");

    let engine = ReconcileEngine::new(config.clone());
    let plan = engine.plan(&records);
    info!(
        protected = plan.protection.len(),
        ungroupable = plan.ungroupable,
        "protection classification complete"
    );

    for outcome in &plan.passes {
        let removed = outcome.removed_ids.len();
        match mode {
            RunMode::Apply if removed > 0 => {
                let affected = store
                    .delete_records(&outcome.removed_ids)
                    .await
                    .with_context(|| format!("deleting duplicates in pass {}", outcome.pass.name()))?;
                info!(pass = outcome.pass.name(), groups = outcome.groups, removed = affected, "pass applied");
            }
            RunMode::Apply => {
                info!(pass = outcome.pass.name(), "no duplicates found");
            }
            RunMode::DryRun => {
                info!(pass = outcome.pass.name(), groups = outcome.groups, removed, "pass planned (dry-run)");
            }
        }
    }

    let report = RunReport::from_plan(
        &plan,
        run_id,
        mode,
        started_at,
        Utc::now(),
        config.removal_warn_threshold,
    );

    if !report.within_threshold {
        warn!(
            removal_rate = report.removal_rate,
            threshold = report.removal_warn_threshold,
            "removal rate exceeds threshold; review this run before trusting it"
        );
    }
    if report.residual_duplicates > 0 {
        warn!(
            residual = report.residual_duplicates,
            "survivors still share title/venue/date; an uncovered duplicate class remains"
        );
    }

    Ok(report)
}
