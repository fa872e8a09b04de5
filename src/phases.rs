//! Phase tracking shared by lead-generation flows and audit jobs.
//!
//! Each owner document embeds a fixed-length, fixed-order list of phases. The
//! functions here apply status/progress transitions to that list and project a
//! weighted overall progress from it.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt::Debug;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{AuditJob, Flow, LastEvent};
use crate::store::FlowStore;

/// A closed set of phase names for one owner type.
pub trait PhaseName:
    Copy + Eq + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Every phase, in execution order.
    const ORDER: &'static [Self];

    /// Share of the owner's overall progress. Weights of `ORDER` sum to 1.0.
    fn weight(self) -> f64;

    fn as_str(self) -> &'static str;

    fn position(self) -> usize {
        Self::ORDER
            .iter()
            .position(|p| *p == self)
            .unwrap_or(Self::ORDER.len())
    }
}

/// Phases of the outer lead-generation flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadPhase {
    Source,
    FilterRank,
    PersistLeads,
    ScrapeContent,
    GenerateDossier,
    FinalizeRank,
}

impl PhaseName for LeadPhase {
    const ORDER: &'static [Self] = &[
        LeadPhase::Source,
        LeadPhase::FilterRank,
        LeadPhase::PersistLeads,
        LeadPhase::ScrapeContent,
        LeadPhase::GenerateDossier,
        LeadPhase::FinalizeRank,
    ];

    // Dossier generation dominates: it is the longest and most expensive phase.
    fn weight(self) -> f64 {
        match self {
            LeadPhase::Source => 0.05,
            LeadPhase::FilterRank => 0.05,
            LeadPhase::PersistLeads => 0.05,
            LeadPhase::ScrapeContent => 0.05,
            LeadPhase::GenerateDossier => 0.80,
            LeadPhase::FinalizeRank => 0.0,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LeadPhase::Source => "source",
            LeadPhase::FilterRank => "filter_rank",
            LeadPhase::PersistLeads => "persist_leads",
            LeadPhase::ScrapeContent => "scrape_content",
            LeadPhase::GenerateDossier => "generate_dossier",
            LeadPhase::FinalizeRank => "finalize_rank",
        }
    }
}

/// Phases of the per-opportunity audit sub-pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditPhase {
    MapUrls,
    FilterUrls,
    ScrapeContent,
    GenerateDossier,
}

impl PhaseName for AuditPhase {
    const ORDER: &'static [Self] = &[
        AuditPhase::MapUrls,
        AuditPhase::FilterUrls,
        AuditPhase::ScrapeContent,
        AuditPhase::GenerateDossier,
    ];

    fn weight(self) -> f64 {
        match self {
            AuditPhase::MapUrls => 0.15,
            AuditPhase::FilterUrls => 0.10,
            AuditPhase::ScrapeContent => 0.25,
            AuditPhase::GenerateDossier => 0.50,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            AuditPhase::MapUrls => "map_urls",
            AuditPhase::FilterUrls => "filter_urls",
            AuditPhase::ScrapeContent => "scrape_content",
            AuditPhase::GenerateDossier => "generate_dossier",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Complete,
    Error,
}

/// One named stage of a flow or audit job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase<N> {
    pub name: N,
    pub status: PhaseStatus,
    pub progress: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
}

impl<N: PhaseName> Phase<N> {
    pub fn pending(name: N) -> Self {
        Self {
            name,
            status: PhaseStatus::Pending,
            progress: 0.0,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error_message: None,
        }
    }

    fn reset(&mut self) {
        *self = Self::pending(self.name);
    }
}

/// Builds the initial phase list for an owner: every phase pending, in order.
pub fn initial_phases<N: PhaseName>() -> Vec<Phase<N>> {
    N::ORDER.iter().map(|name| Phase::pending(*name)).collect()
}

/// A requested transition for a single phase.
#[derive(Debug, Clone)]
pub struct PhaseUpdate<N> {
    pub name: N,
    pub status: PhaseStatus,
    pub progress: Option<f64>,
    pub error_message: Option<String>,
    pub event: Option<String>,
}

impl<N: PhaseName> PhaseUpdate<N> {
    pub fn running(name: N) -> Self {
        Self {
            name,
            status: PhaseStatus::Running,
            progress: None,
            error_message: None,
            event: None,
        }
    }

    pub fn progress(name: N, progress: f64) -> Self {
        Self {
            progress: Some(progress),
            ..Self::running(name)
        }
    }

    pub fn complete(name: N) -> Self {
        Self {
            status: PhaseStatus::Complete,
            ..Self::running(name)
        }
    }

    pub fn failed(name: N, message: impl Into<String>) -> Self {
        Self {
            status: PhaseStatus::Error,
            error_message: Some(message.into()),
            ..Self::running(name)
        }
    }

    pub fn with_event(mut self, message: impl Into<String>) -> Self {
        self.event = Some(message.into());
        self
    }
}

/// Applies `update` to the matching phase.
///
/// Rules: `started_at` is stamped once, on first entry to running; progress never
/// decreases while running; `completed_at` and `duration_ms` are stamped once, on
/// the terminal transition. Returns false when the phase is not in the list.
pub fn apply_update<N: PhaseName>(
    phases: &mut [Phase<N>],
    update: &PhaseUpdate<N>,
    now: DateTime<Utc>,
) -> bool {
    let Some(phase) = phases.iter_mut().find(|p| p.name == update.name) else {
        return false;
    };

    match update.status {
        PhaseStatus::Pending => phase.reset(),
        PhaseStatus::Running => {
            if phase.status != PhaseStatus::Running {
                phase.status = PhaseStatus::Running;
                if phase.started_at.is_none() {
                    phase.started_at = Some(now);
                }
            }
            if let Some(progress) = update.progress {
                phase.progress = phase.progress.max(progress.clamp(0.0, 1.0));
            }
        }
        PhaseStatus::Complete | PhaseStatus::Error => {
            let started = *phase.started_at.get_or_insert(now);
            if phase.completed_at.is_none() {
                phase.completed_at = Some(now);
                phase.duration_ms = Some((now - started).num_milliseconds().max(0));
            }
            phase.status = update.status;
            if update.status == PhaseStatus::Complete {
                phase.progress = 1.0;
            } else {
                phase.error_message = update.error_message.clone();
            }
        }
    }
    true
}

/// Resets `from` and every later phase back to pending.
pub fn reset_from<N: PhaseName>(phases: &mut [Phase<N>], from: N) {
    let cutoff = from.position();
    for phase in phases.iter_mut() {
        if phase.name.position() >= cutoff {
            phase.reset();
        }
    }
}

/// Weighted completion of an owner, in `[0, 1]`.
pub fn overall_progress<N: PhaseName>(phases: &[Phase<N>]) -> f64 {
    phases
        .iter()
        .map(|phase| {
            let weight = phase.name.weight();
            match phase.status {
                PhaseStatus::Complete => weight,
                PhaseStatus::Running => weight * phase.progress.clamp(0.0, 1.0),
                PhaseStatus::Pending | PhaseStatus::Error => 0.0,
            }
        })
        .sum::<f64>()
        .min(1.0)
}

/// Read-modify-write of one flow phase, optionally overwriting `last_event`.
pub async fn update_flow_phase(
    store: &dyn FlowStore,
    flow_id: Uuid,
    update: PhaseUpdate<LeadPhase>,
) -> Result<Flow, AppError> {
    let now = Utc::now();
    store
        .mutate_flow(flow_id, &|flow: &mut Flow| {
            if !apply_update(&mut flow.phases, &update, now) {
                tracing::warn!("Flow {} has no phase {}", flow.id, update.name.as_str());
            }
            if let Some(message) = &update.event {
                flow.last_event = Some(LastEvent::new(update.name.as_str(), message, now));
            }
        })
        .await
}

/// Read-modify-write of one audit phase.
pub async fn update_audit_phase(
    store: &dyn FlowStore,
    audit_id: Uuid,
    update: PhaseUpdate<AuditPhase>,
) -> Result<AuditJob, AppError> {
    let now = Utc::now();
    store
        .mutate_audit_job(audit_id, &|job: &mut AuditJob| {
            if !apply_update(&mut job.phases, &update, now) {
                tracing::warn!("Audit {} has no phase {}", job.id, update.name.as_str());
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn weight_sum<N: PhaseName>() -> f64 {
        N::ORDER.iter().map(|p| p.weight()).sum()
    }

    #[test]
    fn weight_tables_sum_to_one() {
        assert!((weight_sum::<LeadPhase>() - 1.0).abs() < 1e-9);
        assert!((weight_sum::<AuditPhase>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn timestamps_are_stamped_once() {
        let mut phases = initial_phases::<LeadPhase>();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(3);
        let t2 = t0 + Duration::seconds(9);

        apply_update(&mut phases, &PhaseUpdate::running(LeadPhase::Source), t0);
        apply_update(&mut phases, &PhaseUpdate::progress(LeadPhase::Source, 0.4), t1);
        assert_eq!(phases[0].started_at, Some(t0));

        apply_update(&mut phases, &PhaseUpdate::complete(LeadPhase::Source), t1);
        apply_update(&mut phases, &PhaseUpdate::complete(LeadPhase::Source), t2);
        assert_eq!(phases[0].completed_at, Some(t1));
        assert_eq!(phases[0].duration_ms, Some(3_000));
        assert_eq!(phases[0].progress, 1.0);
    }

    #[test]
    fn progress_does_not_move_backwards_while_running() {
        let mut phases = initial_phases::<AuditPhase>();
        let now = Utc::now();
        apply_update(&mut phases, &PhaseUpdate::progress(AuditPhase::MapUrls, 0.6), now);
        apply_update(&mut phases, &PhaseUpdate::progress(AuditPhase::MapUrls, 0.2), now);
        assert_eq!(phases[0].progress, 0.6);

        apply_update(&mut phases, &PhaseUpdate::progress(AuditPhase::MapUrls, 7.0), now);
        assert_eq!(phases[0].progress, 1.0);
    }

    #[test]
    fn error_records_message_and_keeps_progress() {
        let mut phases = initial_phases::<AuditPhase>();
        let now = Utc::now();
        apply_update(&mut phases, &PhaseUpdate::progress(AuditPhase::MapUrls, 0.5), now);
        apply_update(
            &mut phases,
            &PhaseUpdate::failed(AuditPhase::MapUrls, "crawl timed out"),
            now,
        );
        assert_eq!(phases[0].status, PhaseStatus::Error);
        assert_eq!(phases[0].error_message.as_deref(), Some("crawl timed out"));
        assert_eq!(phases[0].progress, 0.5);
        assert!(phases[0].completed_at.is_some());
    }

    #[test]
    fn reset_from_clears_the_tail_only() {
        let mut phases = initial_phases::<LeadPhase>();
        let now = Utc::now();
        for name in LeadPhase::ORDER {
            apply_update(&mut phases, &PhaseUpdate::complete(*name), now);
        }
        reset_from(&mut phases, LeadPhase::GenerateDossier);

        assert_eq!(phases[3].status, PhaseStatus::Complete);
        assert_eq!(phases[4], Phase::pending(LeadPhase::GenerateDossier));
        assert_eq!(phases[5], Phase::pending(LeadPhase::FinalizeRank));
    }

    #[test]
    fn overall_progress_is_monotonic_through_a_run() {
        let mut phases = initial_phases::<LeadPhase>();
        let now = Utc::now();
        let mut last = overall_progress(&phases);
        assert_eq!(last, 0.0);

        for name in LeadPhase::ORDER {
            for step in [
                PhaseUpdate::running(*name),
                PhaseUpdate::progress(*name, 0.5),
                PhaseUpdate::complete(*name),
            ] {
                apply_update(&mut phases, &step, now);
                let current = overall_progress(&phases);
                assert!(current + 1e-12 >= last, "{} < {}", current, last);
                last = current;
            }
        }
        assert!((last - 1.0).abs() < 1e-9);
    }

    #[test]
    fn zero_weight_phase_never_contributes() {
        let mut phases = initial_phases::<LeadPhase>();
        apply_update(
            &mut phases,
            &PhaseUpdate::complete(LeadPhase::FinalizeRank),
            Utc::now(),
        );
        assert_eq!(overall_progress(&phases), 0.0);
    }
}
