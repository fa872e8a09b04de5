use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::errors::AppError;
use crate::phases::{initial_phases, AuditPhase, LeadPhase, Phase, PhaseName};
use crate::signals::SignalName;

// ============================================================================
// Flow
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Idle,
    Running,
    PausedForUpgrade,
    Error,
    Completed,
}

impl FlowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowStatus::Idle => "idle",
            FlowStatus::Running => "running",
            FlowStatus::PausedForUpgrade => "paused_for_upgrade",
            FlowStatus::Error => "error",
            FlowStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub vertical: String,
    pub geography: String,
}

impl Campaign {
    /// Free-text query sent to the search provider.
    pub fn search_query(&self) -> String {
        format!("{} in {}", self.vertical, self.geography)
    }
}

/// Credit figures captured when a billing check failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditPreview {
    pub balance: f64,
    pub required_balance: f64,
    #[serde(default)]
    pub detail: serde_json::Value,
}

/// Frozen state needed to resume a paused flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingBlock {
    pub phase: LeadPhase,
    pub feature_id: String,
    pub credit_preview: CreditPreview,
    pub related_audit_job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Latest human-readable status line of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastEvent {
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LastEvent {
    pub fn new(kind: &str, message: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.to_string(),
            timestamp,
        }
    }
}

/// Counters recorded by the flow phases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowStats {
    pub sourced: u32,
    pub kept: u32,
    pub dropped: u32,
    pub created: u32,
    pub skipped: u32,
    pub audits_queued: u32,
    pub audits_completed: u32,
    pub audits_failed: u32,
    pub dossiers: u32,
}

/// One run of the lead-generation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: Uuid,
    /// Billing customer that pays for the metered steps.
    pub owner_id: String,
    pub agency_id: Uuid,
    pub requested_leads: u32,
    pub fetched_leads: u32,
    pub campaign: Campaign,
    status: FlowStatus,
    pub phases: Vec<Phase<LeadPhase>>,
    billing_block: Option<BillingBlock>,
    pub last_event: Option<LastEvent>,
    pub places_snapshot: Vec<PlaceRecord>,
    #[serde(default)]
    pub stats: FlowStats,
    pub execution_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: i64,
}

impl Flow {
    pub fn new(owner_id: String, agency_id: Uuid, requested_leads: u32, campaign: Campaign) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id,
            agency_id,
            requested_leads,
            fetched_leads: 0,
            campaign,
            status: FlowStatus::Idle,
            phases: initial_phases(),
            billing_block: None,
            last_event: None,
            places_snapshot: Vec::new(),
            stats: FlowStats::default(),
            execution_id: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn status(&self) -> FlowStatus {
        self.status
    }

    pub fn billing_block(&self) -> Option<&BillingBlock> {
        self.billing_block.as_ref()
    }

    pub fn phase(&self, name: LeadPhase) -> Option<&Phase<LeadPhase>> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Attaches a driver. Clears any pause descriptor.
    pub fn mark_running(&mut self) {
        self.status = FlowStatus::Running;
        self.billing_block = None;
        self.error_message = None;
    }

    pub fn mark_paused(&mut self, block: BillingBlock) {
        self.status = FlowStatus::PausedForUpgrade;
        self.billing_block = Some(block);
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = FlowStatus::Error;
        self.billing_block = None;
        self.error_message = Some(message.into());
    }

    pub fn mark_completed(&mut self) {
        self.status = FlowStatus::Completed;
        self.billing_block = None;
    }

    /// `paused_for_upgrade` holds exactly when a billing block is recorded.
    pub fn invariant_holds(&self) -> bool {
        (self.status == FlowStatus::PausedForUpgrade) == self.billing_block.is_some()
    }
}

// ============================================================================
// Source records
// ============================================================================

/// Raw place record returned by the search provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaceRecord {
    pub external_id: String,
    pub name: String,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub review_count: Option<u32>,
    #[serde(default)]
    pub address: Option<String>,
}

// ============================================================================
// Agency
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agency {
    pub id: Uuid,
    pub name: String,
    /// Signals the agency wants in a prospect.
    #[serde(default)]
    pub criteria: Vec<SignalName>,
    #[serde(default)]
    pub default_vertical: Option<String>,
    #[serde(default)]
    pub default_geography: Option<String>,
}

// ============================================================================
// Opportunity
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpportunityStatus {
    #[serde(rename = "SOURCED")]
    Sourced,
    /// Audited, dossier available: ready to contact.
    #[serde(rename = "READY")]
    Ready,
    /// Data available but the audit did not finish.
    #[serde(rename = "DATA_READY")]
    DataReady,
    #[serde(rename = "Rejected")]
    Rejected,
    #[serde(rename = "BOOKED")]
    Booked,
    #[serde(rename = "COMPLETE")]
    Complete,
}

impl OpportunityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OpportunityStatus::Sourced => "SOURCED",
            OpportunityStatus::Ready => "READY",
            OpportunityStatus::DataReady => "DATA_READY",
            OpportunityStatus::Rejected => "Rejected",
            OpportunityStatus::Booked => "BOOKED",
            OpportunityStatus::Complete => "COMPLETE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub agency_id: Uuid,
    pub flow_id: Uuid,
    pub external_id: String,
    pub domain: Option<String>,
    pub name: String,
    pub website: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    pub vertical: String,
    pub geography: String,
    pub status: OpportunityStatus,
    pub qualification_score: f64,
    pub signals: BTreeSet<SignalName>,
    pub fit_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Opportunity {
    /// URL the audit starts from: the listed website, else the bare domain.
    pub fn audit_url(&self) -> Option<String> {
        let domain = self.domain.as_ref()?;
        match &self.website {
            Some(site) if site.starts_with("http://") || site.starts_with("https://") => {
                Some(site.clone())
            }
            _ => Some(format!("https://{}", domain)),
        }
    }
}

// ============================================================================
// Audit job
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Queued,
    Running,
    Completed,
    Error,
}

/// Serialized form of a step failure. Only the symbolic name and the rendered
/// message are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub name: String,
    pub message: String,
}

impl From<&AppError> for StepFailure {
    fn from(err: &AppError) -> Self {
        Self {
            name: err.name().to_string(),
            message: err.to_string(),
        }
    }
}

impl StepFailure {
    pub fn into_error(self) -> AppError {
        AppError::Remote {
            name: self.name,
            message: self.message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditJob {
    pub id: Uuid,
    pub opportunity_id: Uuid,
    pub agency_id: Uuid,
    pub flow_id: Uuid,
    pub target_url: String,
    pub status: AuditStatus,
    pub phases: Vec<Phase<AuditPhase>>,
    pub dossier_id: Option<Uuid>,
    /// Set once dossier generation for this job has been charged.
    pub metered: bool,
    /// Conversation handle for the LLM provider.
    pub thread_id: String,
    #[serde(default)]
    pub discovered_urls: Vec<String>,
    #[serde(default)]
    pub selected_urls: Vec<String>,
    #[serde(default)]
    pub page_refs: Vec<String>,
    pub last_error: Option<StepFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: i64,
}

impl AuditJob {
    pub fn queued(opportunity: &Opportunity, target_url: String) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4();
        Self {
            id,
            opportunity_id: opportunity.id,
            agency_id: opportunity.agency_id,
            flow_id: opportunity.flow_id,
            target_url,
            status: AuditStatus::Queued,
            phases: initial_phases(),
            dossier_id: None,
            metered: false,
            thread_id: format!("audit-{}", id),
            discovered_urls: Vec::new(),
            selected_urls: Vec::new(),
            page_refs: Vec::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn phase(&self, name: AuditPhase) -> Option<&Phase<AuditPhase>> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_done(&self, name: AuditPhase) -> bool {
        self.phase(name)
            .map(|p| p.status == crate::phases::PhaseStatus::Complete)
            .unwrap_or(false)
    }
}

// ============================================================================
// Content and dossiers
// ============================================================================

/// Scraped page stored behind an opaque content reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageContent {
    pub content_ref: String,
    pub audit_job_id: Uuid,
    pub url: String,
    pub title: Option<String>,
    pub http_status: u16,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Query projection of a page: metadata and reference, never the content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSummary {
    pub content_ref: String,
    pub url: String,
    pub title: Option<String>,
    pub http_status: u16,
    pub content_length: usize,
}

impl From<&PageContent> for PageSummary {
    fn from(page: &PageContent) -> Self {
        Self {
            content_ref: page.content_ref.clone(),
            url: page.url.clone(),
            title: page.title.clone(),
            http_status: page.http_status,
            content_length: page.content.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dossier {
    pub id: Uuid,
    pub audit_job_id: Uuid,
    pub opportunity_id: Uuid,
    pub summary: String,
    pub gaps: Vec<String>,
    pub talking_points: Vec<String>,
    pub contact_email: Option<String>,
    pub fit_rationale: String,
    /// Built from known fields because generation or validation failed.
    pub fallback: bool,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// API payloads
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct StartFlowRequest {
    pub lead_count: u32,
    #[serde(default)]
    pub vertical: Option<String>,
    #[serde(default)]
    pub geography: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgencyProfileRequest {
    pub name: String,
    #[serde(default)]
    pub criteria: Vec<SignalName>,
    #[serde(default)]
    pub default_vertical: Option<String>,
    #[serde(default)]
    pub default_geography: Option<String>,
}

/// Pause details shown to the customer.
#[derive(Debug, Clone, Serialize)]
pub struct PauseView {
    pub phase: &'static str,
    pub feature_id: String,
    pub credit_preview: CreditPreview,
    pub related_audit_job_id: Option<Uuid>,
    pub resume_available: bool,
}

/// Read-only projection of a flow.
#[derive(Debug, Clone, Serialize)]
pub struct FlowView {
    pub id: Uuid,
    pub status: FlowStatus,
    pub campaign: Campaign,
    pub requested_leads: u32,
    pub fetched_leads: u32,
    pub overall_progress: f64,
    pub phases: Vec<Phase<LeadPhase>>,
    pub pause: Option<PauseView>,
    pub failed_phase: Option<LeadPhase>,
    pub error_message: Option<String>,
    pub last_event: Option<LastEvent>,
    pub places_snapshot: Vec<PlaceRecord>,
    pub stats: FlowStats,
    pub execution_id: Option<Uuid>,
}

impl From<&Flow> for FlowView {
    fn from(flow: &Flow) -> Self {
        let pause = flow.billing_block().map(|block| PauseView {
            phase: block.phase.as_str(),
            feature_id: block.feature_id.clone(),
            credit_preview: block.credit_preview.clone(),
            related_audit_job_id: block.related_audit_job_id,
            resume_available: true,
        });
        let failed_phase = flow
            .phases
            .iter()
            .find(|p| p.status == crate::phases::PhaseStatus::Error)
            .map(|p| p.name);

        Self {
            id: flow.id,
            status: flow.status(),
            campaign: flow.campaign.clone(),
            requested_leads: flow.requested_leads,
            fetched_leads: flow.fetched_leads,
            overall_progress: crate::phases::overall_progress(&flow.phases),
            phases: flow.phases.clone(),
            pause,
            failed_phase,
            error_message: flow.error_message.clone(),
            last_event: flow.last_event.clone(),
            places_snapshot: flow.places_snapshot.clone(),
            stats: flow.stats.clone(),
            execution_id: flow.execution_id,
        }
    }
}

/// Read-only projection of an audit job.
#[derive(Debug, Clone, Serialize)]
pub struct AuditJobView {
    pub id: Uuid,
    pub opportunity_id: Uuid,
    pub target_url: String,
    pub status: AuditStatus,
    pub overall_progress: f64,
    pub phases: Vec<Phase<AuditPhase>>,
    pub dossier_id: Option<Uuid>,
    pub metered: bool,
    pub last_error: Option<StepFailure>,
}

impl From<&AuditJob> for AuditJobView {
    fn from(job: &AuditJob) -> Self {
        Self {
            id: job.id,
            opportunity_id: job.opportunity_id,
            target_url: job.target_url.clone(),
            status: job.status,
            overall_progress: crate::phases::overall_progress(&job.phases),
            phases: job.phases.clone(),
            dossier_id: job.dossier_id,
            metered: job.metered,
            last_error: job.last_error.clone(),
        }
    }
}
