//! Lead-generation workflow: the six-phase flow, start, resume and restart
//! recovery.
//!
//! One execution drives one flow at a time. Phases run strictly in order and
//! each phase's terminal state is persisted before the next one starts. A
//! billing pause ends the execution cleanly; a resume starts a new execution
//! from the top, which skips the phases that are already complete.

use async_trait::async_trait;
use chrono::Utc;
use moka::future::Cache;
use std::ops::ControlFlow;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditOutcome, AuditPipeline};
use crate::billing::{is_pause_signal, BillingGate, Feature, GateOutcome, PauseSignal};
use crate::config::{AuditSettings, WorkflowSettings};
use crate::errors::AppError;
use crate::ledger::UsageLedger;
use crate::models::{
    AuditJob, AuditStatus, Campaign, Flow, FlowStatus, LastEvent, PlaceRecord, StartFlowRequest,
};
use crate::persistence::persist_opportunities;
use crate::phases::{reset_from, update_flow_phase, LeadPhase, PhaseName, PhaseStatus, PhaseUpdate};
use crate::services::{BillingProvider, CrawlProvider, LlmProvider, ScrapeProvider, SearchProvider};
use crate::signals::{qualify, QualifiedLead};
use crate::store::{require_flow, FlowStore};

/// How an execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Paused { phase: LeadPhase },
    Failed { phase: LeadPhase, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    /// The flow was not paused; nothing changed.
    NotPaused { status: FlowStatus },
    /// Billing still refuses the blocked feature; nothing changed.
    StillInsufficient { feature_id: String, phase: LeadPhase },
    Resumed { execution_id: Uuid },
}

/// Starts flow executions in the background.
#[async_trait]
pub trait ExecutionLauncher: Send + Sync {
    /// Starts a new execution for `flow_id` and returns its identity.
    async fn launch(&self, flow_id: Uuid) -> Result<Uuid, AppError>;
}

/// External collaborators used by the workflow.
#[derive(Clone)]
pub struct Collaborators {
    pub search: Arc<dyn SearchProvider>,
    pub crawl: Arc<dyn CrawlProvider>,
    pub scrape: Arc<dyn ScrapeProvider>,
    pub llm: Arc<dyn LlmProvider>,
    pub billing: Arc<dyn BillingProvider>,
}

pub struct LeadGenWorkflow {
    store: Arc<dyn FlowStore>,
    search: Arc<dyn SearchProvider>,
    gate: Arc<BillingGate>,
    ledger: Arc<UsageLedger>,
    audits: AuditPipeline,
    settings: WorkflowSettings,
}

/// Unwraps a phase result, ending the execution on a pause or a failure.
macro_rules! phase_step {
    ($self:ident, $flow_id:expr, $phase:expr, $result:expr) => {
        match $result {
            Ok(ControlFlow::Continue(value)) => value,
            Ok(ControlFlow::Break(signal)) => return Ok($self.paused(&signal)),
            Err(e) => return $self.fail($flow_id, $phase, e).await,
        }
    };
}

impl LeadGenWorkflow {
    pub fn new(
        store: Arc<dyn FlowStore>,
        collaborators: Collaborators,
        settings: WorkflowSettings,
        audit_settings: AuditSettings,
    ) -> Self {
        let gate = Arc::new(BillingGate::new(collaborators.billing, store.clone()));
        let ledger = Arc::new(UsageLedger::new(gate.clone(), store.clone()));
        let audits = AuditPipeline::new(
            store.clone(),
            collaborators.crawl,
            collaborators.scrape,
            collaborators.llm,
            gate.clone(),
            ledger.clone(),
            audit_settings,
            settings.retry,
        );
        Self {
            store,
            search: collaborators.search,
            gate,
            ledger,
            audits,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn FlowStore> {
        &self.store
    }

    pub fn gate(&self) -> &Arc<BillingGate> {
        &self.gate
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    /// Runs one execution of the flow to completion, a pause, or a failure.
    ///
    /// `Err` means the store itself failed and the flow could not be updated.
    pub async fn run(&self, flow_id: Uuid) -> Result<RunOutcome, AppError> {
        let flow = require_flow(self.store.as_ref(), flow_id).await?;
        match flow.status() {
            FlowStatus::Completed => return Ok(RunOutcome::Completed),
            FlowStatus::PausedForUpgrade => {
                let phase = flow
                    .billing_block()
                    .map(|b| b.phase)
                    .unwrap_or(LeadPhase::Source);
                tracing::warn!("⚠ Flow {} is paused, not running", flow_id);
                return Ok(RunOutcome::Paused { phase });
            }
            FlowStatus::Error => {
                let phase = failed_phase(&flow).unwrap_or(LeadPhase::Source);
                return Ok(RunOutcome::Failed {
                    phase,
                    message: flow.error_message.clone().unwrap_or_default(),
                });
            }
            FlowStatus::Idle | FlowStatus::Running => {}
        }

        let now = Utc::now();
        let flow = self
            .store
            .mutate_flow(flow_id, &|flow: &mut Flow| {
                flow.mark_running();
                flow.last_event = Some(LastEvent::new("running", "Execution started", now));
            })
            .await?;
        tracing::info!(
            "=== Running flow {} ({}) ===",
            flow_id,
            flow.campaign.search_query()
        );

        // Sourced leads live only in memory, so the ingest phases rerun together
        // until persistence has completed once.
        if !phase_complete(&flow, LeadPhase::PersistLeads) {
            self.store
                .mutate_flow(flow_id, &|flow: &mut Flow| {
                    reset_from(&mut flow.phases, LeadPhase::Source)
                })
                .await?;
            let places = phase_step!(self, flow_id, LeadPhase::Source, self.source(&flow).await);
            let leads = phase_step!(
                self,
                flow_id,
                LeadPhase::FilterRank,
                self.filter_rank(&flow, &places).await
            );
            phase_step!(
                self,
                flow_id,
                LeadPhase::PersistLeads,
                self.persist_leads(&flow, &leads).await
            );
        }

        let flow = require_flow(self.store.as_ref(), flow_id).await?;
        if !phase_complete(&flow, LeadPhase::ScrapeContent) {
            phase_step!(
                self,
                flow_id,
                LeadPhase::ScrapeContent,
                self.queue_audits(&flow).await
            );
        }

        let flow = require_flow(self.store.as_ref(), flow_id).await?;
        if !phase_complete(&flow, LeadPhase::GenerateDossier) {
            phase_step!(
                self,
                flow_id,
                LeadPhase::GenerateDossier,
                self.drive_audits(&flow).await
            );
        }

        phase_step!(
            self,
            flow_id,
            LeadPhase::FinalizeRank,
            self.finalize(flow_id).await
        );
        Ok(RunOutcome::Completed)
    }

    /// Background entry point: runs the flow and records store failures on it.
    pub async fn execute(&self, flow_id: Uuid, execution_id: Uuid) -> RunOutcome {
        tracing::info!("Starting execution {} for flow {}", execution_id, flow_id);
        match self.run(flow_id).await {
            Ok(outcome) => {
                match &outcome {
                    RunOutcome::Completed => {
                        tracing::info!("✓ Execution {} completed flow {}", execution_id, flow_id)
                    }
                    RunOutcome::Paused { phase } => tracing::info!(
                        "Execution {} left flow {} paused at {}",
                        execution_id,
                        flow_id,
                        phase.as_str()
                    ),
                    RunOutcome::Failed { phase, message } => tracing::error!(
                        "✗ Execution {} failed flow {} at {}: {}",
                        execution_id,
                        flow_id,
                        phase.as_str(),
                        message
                    ),
                }
                outcome
            }
            Err(e) => {
                tracing::error!("✗ Execution {} aborted for flow {}: {}", execution_id, flow_id, e);
                let message = e.to_string();
                let phase = self.current_phase(flow_id).await;
                if let Err(e) = self
                    .store
                    .mutate_flow(flow_id, &|flow: &mut Flow| flow.mark_error(message.clone()))
                    .await
                {
                    tracing::error!("Failed to mark flow {} as errored: {}", flow_id, e);
                }
                RunOutcome::Failed { phase, message }
            }
        }
    }

    async fn current_phase(&self, flow_id: Uuid) -> LeadPhase {
        match self.store.get_flow(flow_id).await {
            Ok(Some(flow)) => flow
                .phases
                .iter()
                .find(|p| p.status == PhaseStatus::Running)
                .map(|p| p.name)
                .unwrap_or(LeadPhase::Source),
            _ => LeadPhase::Source,
        }
    }

    fn paused(&self, signal: &PauseSignal) -> RunOutcome {
        tracing::info!(
            "⏸ Flow {} paused at {} waiting for {} credits",
            signal.flow_id,
            signal.phase.as_str(),
            signal.feature_id
        );
        RunOutcome::Paused {
            phase: signal.phase,
        }
    }

    /// Records a phase failure and terminates the flow, unless `err` is a pause.
    async fn fail(
        &self,
        flow_id: Uuid,
        phase: LeadPhase,
        err: AppError,
    ) -> Result<RunOutcome, AppError> {
        if is_pause_signal(&err) {
            // The gate already persisted the pause.
            tracing::info!("⏸ Flow {} paused at {} ({})", flow_id, phase.as_str(), err);
            return Ok(RunOutcome::Paused { phase });
        }

        let message = err.to_string();
        tracing::error!("✗ Flow {} failed at {}: {}", flow_id, phase.as_str(), message);
        update_flow_phase(
            self.store.as_ref(),
            flow_id,
            PhaseUpdate::failed(phase, message.clone())
                .with_event(format!("{} failed: {}", phase.as_str(), message)),
        )
        .await?;
        self.store
            .mutate_flow(flow_id, &|flow: &mut Flow| flow.mark_error(message.clone()))
            .await?;
        Ok(RunOutcome::Failed { phase, message })
    }

    // ------------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------------

    async fn source(&self, flow: &Flow) -> Result<ControlFlow<PauseSignal, Vec<PlaceRecord>>, AppError> {
        let phase = LeadPhase::Source;
        if let GateOutcome::Paused(signal) = self
            .gate
            .check_and_pause(flow.id, &flow.owner_id, Feature::LeadSourcing, phase, None)
            .await?
        {
            return Ok(ControlFlow::Break(signal));
        }

        let query = flow.campaign.search_query();
        update_flow_phase(
            self.store.as_ref(),
            flow.id,
            PhaseUpdate::running(phase).with_event(format!("Searching for {}", query)),
        )
        .await?;

        let places = self
            .settings
            .retry
            .sourcing
            .run("search places", || self.search.search(&query, flow.requested_leads))
            .await?;
        if places.is_empty() {
            return Err(AppError::NotFound(format!("No places found for '{}'", query)));
        }

        let fetched = places.len() as u32;
        let snapshot: Vec<PlaceRecord> = places
            .iter()
            .take(self.settings.places_snapshot_limit)
            .cloned()
            .collect();
        self.store
            .mutate_flow(flow.id, &|flow: &mut Flow| {
                flow.fetched_leads = fetched;
                flow.places_snapshot = snapshot.clone();
                flow.stats.sourced = fetched;
            })
            .await?;

        if let Err(e) = self
            .settings
            .retry
            .sourcing
            .run("track sourcing usage", || {
                self.gate
                    .track_usage(&flow.owner_id, Feature::LeadSourcing, fetched as f64)
            })
            .await
        {
            tracing::error!(
                "✗ Sourced {} places for flow {} but usage was not recorded: {}",
                fetched,
                flow.id,
                e
            );
        }

        update_flow_phase(
            self.store.as_ref(),
            flow.id,
            PhaseUpdate::complete(phase).with_event(format!("Found {} places", fetched)),
        )
        .await?;
        Ok(ControlFlow::Continue(places))
    }

    async fn filter_rank(
        &self,
        flow: &Flow,
        places: &[PlaceRecord],
    ) -> Result<ControlFlow<PauseSignal, Vec<QualifiedLead>>, AppError> {
        let phase = LeadPhase::FilterRank;
        update_flow_phase(
            self.store.as_ref(),
            flow.id,
            PhaseUpdate::running(phase).with_event("Scoring leads"),
        )
        .await?;

        let criteria = self
            .store
            .get_agency(flow.agency_id)
            .await?
            .map(|agency| agency.criteria)
            .unwrap_or_default();
        let report = qualify(places, &criteria);
        let kept = report.kept.len() as u32;
        let dropped = report.dropped as u32;

        self.store
            .mutate_flow(flow.id, &|flow: &mut Flow| {
                flow.stats.kept = kept;
                flow.stats.dropped = dropped;
            })
            .await?;
        update_flow_phase(
            self.store.as_ref(),
            flow.id,
            PhaseUpdate::complete(phase)
                .with_event(format!("Kept {} leads, dropped {}", kept, dropped)),
        )
        .await?;
        Ok(ControlFlow::Continue(report.kept))
    }

    async fn persist_leads(
        &self,
        flow: &Flow,
        leads: &[QualifiedLead],
    ) -> Result<ControlFlow<PauseSignal, ()>, AppError> {
        let phase = LeadPhase::PersistLeads;
        update_flow_phase(
            self.store.as_ref(),
            flow.id,
            PhaseUpdate::running(phase).with_event("Saving opportunities"),
        )
        .await?;

        let report = persist_opportunities(
            self.store.as_ref(),
            flow.id,
            flow.agency_id,
            &flow.campaign,
            leads,
        )
        .await?;

        self.store
            .mutate_flow(flow.id, &|flow: &mut Flow| {
                flow.stats.created = report.created as u32;
                flow.stats.skipped = report.skipped as u32;
            })
            .await?;
        update_flow_phase(
            self.store.as_ref(),
            flow.id,
            PhaseUpdate::complete(phase).with_event(format!(
                "Saved {} opportunities, skipped {} duplicates",
                report.created, report.skipped
            )),
        )
        .await?;
        Ok(ControlFlow::Continue(()))
    }

    /// Queues one audit job per opportunity with a resolvable domain.
    async fn queue_audits(&self, flow: &Flow) -> Result<ControlFlow<PauseSignal, ()>, AppError> {
        let phase = LeadPhase::ScrapeContent;
        update_flow_phase(
            self.store.as_ref(),
            flow.id,
            PhaseUpdate::running(phase).with_event("Queueing audits"),
        )
        .await?;

        let opportunities = self.store.list_flow_opportunities(flow.id).await?;
        let mut created = 0;
        for opportunity in &opportunities {
            let Some(target_url) = opportunity.audit_url() else {
                tracing::debug!("No domain for {}, not auditing", opportunity.name);
                continue;
            };
            if self
                .store
                .create_audit_job_if_absent(&AuditJob::queued(opportunity, target_url))
                .await?
            {
                created += 1;
            }
        }

        let queued = self.store.list_audit_jobs(flow.id).await?.len() as u32;
        self.store
            .mutate_flow(flow.id, &|flow: &mut Flow| flow.stats.audits_queued = queued)
            .await?;
        tracing::info!(
            "✓ Flow {}: {} audits queued ({} new)",
            flow.id,
            queued,
            created
        );
        update_flow_phase(
            self.store.as_ref(),
            flow.id,
            PhaseUpdate::complete(phase).with_event(format!("{} audits queued", queued)),
        )
        .await?;
        Ok(ControlFlow::Continue(()))
    }

    /// Runs queued audits one at a time. Any pause pauses the whole flow; any
    /// other audit failure only lowers the yield.
    async fn drive_audits(&self, flow: &Flow) -> Result<ControlFlow<PauseSignal, ()>, AppError> {
        let phase = LeadPhase::GenerateDossier;
        update_flow_phase(
            self.store.as_ref(),
            flow.id,
            PhaseUpdate::running(phase).with_event("Generating dossiers"),
        )
        .await?;

        let jobs = self.store.list_audit_jobs(flow.id).await?;
        let total = jobs.len();
        for (index, job) in jobs.iter().enumerate() {
            if needs_run(job) {
                if let GateOutcome::Paused(signal) = self
                    .gate
                    .check_and_pause(
                        flow.id,
                        &flow.owner_id,
                        Feature::DossierGeneration,
                        phase,
                        Some(job.id),
                    )
                    .await?
                {
                    return Ok(ControlFlow::Break(signal));
                }

                match self.audits.run(job.id, &flow.owner_id).await {
                    Ok(AuditOutcome::Completed { .. }) => {}
                    Ok(AuditOutcome::Failed { phase, message }) => tracing::warn!(
                        "⚠ Audit {} failed at {}, continuing: {}",
                        job.id,
                        phase.as_str(),
                        message
                    ),
                    Ok(AuditOutcome::Paused(signal)) => return Ok(ControlFlow::Break(signal)),
                    Err(e) => return Err(e),
                }
            }

            if let Err(e) = self.ledger.reconcile(job.id, &flow.owner_id).await {
                tracing::warn!("⚠ Ledger reconcile failed for audit {}: {}", job.id, e);
            }

            update_flow_phase(
                self.store.as_ref(),
                flow.id,
                PhaseUpdate::progress(phase, (index + 1) as f64 / total as f64)
                    .with_event(format!("Audited {} of {} sites", index + 1, total)),
            )
            .await?;
        }

        let jobs = self.store.list_audit_jobs(flow.id).await?;
        let completed = jobs
            .iter()
            .filter(|j| j.status == AuditStatus::Completed)
            .count() as u32;
        let failed = jobs.iter().filter(|j| j.status == AuditStatus::Error).count() as u32;
        let dossiers = jobs.iter().filter(|j| j.dossier_id.is_some()).count() as u32;
        self.store
            .mutate_flow(flow.id, &|flow: &mut Flow| {
                flow.stats.audits_completed = completed;
                flow.stats.audits_failed = failed;
                flow.stats.dossiers = dossiers;
            })
            .await?;
        update_flow_phase(
            self.store.as_ref(),
            flow.id,
            PhaseUpdate::complete(phase).with_event(format!(
                "{} dossiers ready, {} audits failed",
                dossiers, failed
            )),
        )
        .await?;
        Ok(ControlFlow::Continue(()))
    }

    async fn finalize(&self, flow_id: Uuid) -> Result<ControlFlow<PauseSignal, ()>, AppError> {
        let phase = LeadPhase::FinalizeRank;
        update_flow_phase(self.store.as_ref(), flow_id, PhaseUpdate::running(phase)).await?;
        update_flow_phase(self.store.as_ref(), flow_id, PhaseUpdate::complete(phase)).await?;

        let now = Utc::now();
        let flow = self
            .store
            .mutate_flow(flow_id, &|flow: &mut Flow| {
                let message = format!(
                    "Completed: {} dossiers from {} leads",
                    flow.stats.dossiers, flow.fetched_leads
                );
                flow.mark_completed();
                flow.last_event = Some(LastEvent::new("completed", &message, now));
            })
            .await?;
        tracing::info!(
            "✓ Flow {} completed: {} leads, {} opportunities, {} dossiers",
            flow_id,
            flow.fetched_leads,
            flow.stats.created,
            flow.stats.dossiers
        );
        Ok(ControlFlow::Continue(()))
    }
}

fn phase_complete(flow: &Flow, phase: LeadPhase) -> bool {
    flow.phase(phase)
        .map(|p| p.status == PhaseStatus::Complete)
        .unwrap_or(false)
}

fn failed_phase(flow: &Flow) -> Option<LeadPhase> {
    flow.phases
        .iter()
        .find(|p| p.status == PhaseStatus::Error)
        .map(|p| p.name)
}

/// Whether an audit still has to be driven in this execution.
///
/// A job that errored on a pause that lost its type is retried too.
fn needs_run(job: &AuditJob) -> bool {
    match job.status {
        AuditStatus::Queued | AuditStatus::Running => true,
        AuditStatus::Completed => false,
        AuditStatus::Error => job
            .last_error
            .clone()
            .map(|failure| is_pause_signal(&failure.into_error()))
            .unwrap_or(false),
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Creates an idle flow for the agency and launches its first execution.
pub async fn start_flow(
    store: &dyn FlowStore,
    launcher: &dyn ExecutionLauncher,
    settings: &WorkflowSettings,
    owner_id: &str,
    agency_id: Uuid,
    request: StartFlowRequest,
) -> Result<Flow, AppError> {
    if owner_id.trim().is_empty() {
        return Err(AppError::Unauthorized("Missing owner id".to_string()));
    }
    if request.lead_count == 0 || request.lead_count > settings.max_leads_per_flow {
        return Err(AppError::BadRequest(format!(
            "lead_count must be between 1 and {}",
            settings.max_leads_per_flow
        )));
    }

    let agency = store.get_agency(agency_id).await?;
    let pick = |given: Option<String>, fallback: Option<&String>| {
        given
            .filter(|v| !v.trim().is_empty())
            .or_else(|| fallback.filter(|v| !v.trim().is_empty()).cloned())
    };
    let vertical = pick(
        request.vertical,
        agency.as_ref().and_then(|a| a.default_vertical.as_ref()),
    )
    .ok_or_else(|| AppError::BadRequest("vertical is required".to_string()))?;
    let geography = pick(
        request.geography,
        agency.as_ref().and_then(|a| a.default_geography.as_ref()),
    )
    .ok_or_else(|| AppError::BadRequest("geography is required".to_string()))?;

    let flow = Flow::new(
        owner_id.to_string(),
        agency_id,
        request.lead_count,
        Campaign {
            vertical,
            geography,
        },
    );
    store.create_flow(&flow).await?;
    tracing::info!(
        "Created flow {} for agency {}: {} leads of {}",
        flow.id,
        agency_id,
        flow.requested_leads,
        flow.campaign.search_query()
    );

    let execution_id = match launcher.launch(flow.id).await {
        Ok(id) => id,
        Err(e) => {
            let message = format!("Failed to start execution: {}", e);
            store
                .mutate_flow(flow.id, &|flow: &mut Flow| flow.mark_error(message.clone()))
                .await?;
            return Err(e);
        }
    };
    store
        .mutate_flow(flow.id, &|flow: &mut Flow| {
            flow.execution_id = Some(execution_id)
        })
        .await
}

/// Resumes a paused flow once billing allows the blocked feature again.
pub async fn resume_flow(
    store: &dyn FlowStore,
    gate: &BillingGate,
    launcher: &dyn ExecutionLauncher,
    flow_id: Uuid,
) -> Result<ResumeOutcome, AppError> {
    let flow = require_flow(store, flow_id).await?;
    let block = match flow.billing_block() {
        Some(block) if flow.status() == FlowStatus::PausedForUpgrade => block.clone(),
        _ => {
            tracing::info!(
                "Resume requested for flow {} in status {}, nothing to do",
                flow_id,
                flow.status().as_str()
            );
            return Ok(ResumeOutcome::NotPaused {
                status: flow.status(),
            });
        }
    };

    let allowance = gate.allowance(&flow.owner_id, &block.feature_id).await?;
    if !allowance.allowed {
        tracing::warn!(
            "⚠ Flow {} still lacks credits for {} (balance {}, required {})",
            flow_id,
            block.feature_id,
            allowance.balance,
            allowance.required_balance
        );
        return Ok(ResumeOutcome::StillInsufficient {
            feature_id: block.feature_id,
            phase: block.phase,
        });
    }

    let original_phases = flow.phases.clone();
    let now = Utc::now();
    let resumed = store
        .mutate_flow(flow_id, &|flow: &mut Flow| {
            if flow.status() != FlowStatus::PausedForUpgrade {
                return;
            }
            reset_from(&mut flow.phases, block.phase);
            flow.mark_running();
            flow.last_event = Some(LastEvent::new(
                "resumed",
                &format!("Resuming at {}", block.phase.as_str()),
                now,
            ));
        })
        .await?;
    if resumed.status() != FlowStatus::Running {
        return Ok(ResumeOutcome::NotPaused {
            status: resumed.status(),
        });
    }

    match launcher.launch(flow_id).await {
        Ok(execution_id) => {
            store
                .mutate_flow(flow_id, &|flow: &mut Flow| {
                    flow.execution_id = Some(execution_id)
                })
                .await?;
            tracing::info!(
                "✓ Flow {} resumed at {} as execution {}",
                flow_id,
                block.phase.as_str(),
                execution_id
            );
            Ok(ResumeOutcome::Resumed { execution_id })
        }
        Err(e) => {
            tracing::error!("✗ Failed to relaunch flow {}, restoring pause: {}", flow_id, e);
            let message = format!("Resume failed: {}", e);
            store
                .mutate_flow(flow_id, &|flow: &mut Flow| {
                    flow.phases = original_phases.clone();
                    flow.mark_paused(block.clone());
                    flow.last_event = Some(LastEvent::new("paused_for_upgrade", &message, now));
                })
                .await?;
            Err(e)
        }
    }
}

/// Relaunches flows left `running` by a previous process.
pub async fn recover_interrupted_flows(
    store: &dyn FlowStore,
    launcher: &dyn ExecutionLauncher,
) -> Result<usize, AppError> {
    let flows = store.list_flows_by_status(FlowStatus::Running).await?;
    let mut relaunched = 0;
    for flow in flows {
        match launcher.launch(flow.id).await {
            Ok(execution_id) => {
                store
                    .mutate_flow(flow.id, &|flow: &mut Flow| {
                        flow.execution_id = Some(execution_id)
                    })
                    .await?;
                relaunched += 1;
            }
            Err(e) => tracing::warn!("⚠ Could not relaunch flow {}: {}", flow.id, e),
        }
    }
    if relaunched > 0 {
        tracing::info!("✓ Relaunched {} interrupted flows", relaunched);
    }
    Ok(relaunched)
}

// ============================================================================
// Launcher
// ============================================================================

/// Spawns executions on the tokio runtime, at most one per flow at a time.
pub struct TokioLauncher {
    workflow: Arc<LeadGenWorkflow>,
    active: Cache<Uuid, Uuid>,
}

impl TokioLauncher {
    pub fn new(workflow: Arc<LeadGenWorkflow>) -> Self {
        let active = Cache::builder().max_capacity(10_000).build();
        Self { workflow, active }
    }

    pub async fn is_active(&self, flow_id: Uuid) -> bool {
        self.active.get(&flow_id).await.is_some()
    }
}

#[async_trait]
impl ExecutionLauncher for TokioLauncher {
    async fn launch(&self, flow_id: Uuid) -> Result<Uuid, AppError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AppError::InternalError(format!("No runtime to launch on: {}", e)))?;

        let execution_id = Uuid::new_v4();
        let entry = self
            .active
            .entry(flow_id)
            .or_insert_with(async { execution_id })
            .await;
        if !entry.is_fresh() {
            return Err(AppError::Conflict(format!(
                "Flow {} already has execution {}",
                flow_id,
                entry.value()
            )));
        }

        let workflow = self.workflow.clone();
        let active = self.active.clone();
        runtime.spawn(async move {
            workflow.execute(flow_id, execution_id).await;
            active.invalidate(&flow_id).await;
        });
        Ok(execution_id)
    }
}
