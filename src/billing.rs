//! Billing gate: pre-flight credit checks and the pause protocol.
//!
//! A failed check records a `BillingBlock` on the flow and flips it to
//! `paused_for_upgrade` in one write, then hands a [`PauseSignal`] back to the
//! caller. The signal is a value, not a failure: the orchestrator exits cleanly
//! and a later resume picks the flow up again.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{BillingBlock, CreditPreview, Flow};
use crate::phases::{LeadPhase, PhaseName};
use crate::services::{Allowance, BillingProvider};
use crate::store::FlowStore;

/// Stable symbolic name carried by every pause, whatever its runtime form.
pub const PAUSE_SIGNAL_NAME: &str = "BillingPauseSignal";
/// Marker embedded in the rendered text of a pause.
pub const PAUSE_MARKER: &str = "[billing:paused_for_upgrade]";

/// Metered features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Charged per sourced place.
    LeadSourcing,
    /// Charged per audit job that produced a dossier.
    DossierGeneration,
}

impl Feature {
    pub fn id(self) -> &'static str {
        match self {
            Feature::LeadSourcing => "lead_sourcing",
            Feature::DossierGeneration => "dossier_generation",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "lead_sourcing" => Some(Feature::LeadSourcing),
            "dossier_generation" => Some(Feature::DossierGeneration),
            _ => None,
        }
    }
}

/// Raised when a flow was paused for insufficient credits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseSignal {
    pub flow_id: Uuid,
    pub feature_id: String,
    pub phase: LeadPhase,
    pub audit_job_id: Option<Uuid>,
}

impl fmt::Display for PauseSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} flow {} paused at {}: insufficient credits for {}",
            PAUSE_MARKER,
            self.flow_id,
            self.phase.as_str(),
            self.feature_id
        )
    }
}

/// Result of a gate check.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Proceed,
    Paused(PauseSignal),
}

/// Whether `err` is a billing pause rather than a real failure.
///
/// Checked in order: the `Paused` variant itself (also behind context
/// wrappers), the symbolic name, and finally the marker in the rendered text.
pub fn is_pause_signal(err: &AppError) -> bool {
    fn is_paused_variant(err: &AppError) -> bool {
        match err {
            AppError::Paused(_) => true,
            AppError::WithContext { source, .. } => is_paused_variant(source),
            _ => false,
        }
    }

    is_paused_variant(err)
        || err.name() == PAUSE_SIGNAL_NAME
        || err.to_string().contains(PAUSE_MARKER)
}

pub struct BillingGate {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn FlowStore>,
}

impl BillingGate {
    pub fn new(provider: Arc<dyn BillingProvider>, store: Arc<dyn FlowStore>) -> Self {
        Self { provider, store }
    }

    pub async fn allowance(&self, customer_id: &str, feature_id: &str) -> Result<Allowance, AppError> {
        self.provider.check_allowance(customer_id, feature_id).await
    }

    /// Checks the customer's allowance for `feature` before a metered step.
    ///
    /// On insufficiency the flow is paused with a billing block describing the
    /// phase (and audit job, when given) that was blocked.
    pub async fn check_and_pause(
        &self,
        flow_id: Uuid,
        customer_id: &str,
        feature: Feature,
        phase: LeadPhase,
        audit_job_id: Option<Uuid>,
    ) -> Result<GateOutcome, AppError> {
        let allowance = self.allowance(customer_id, feature.id()).await?;
        if allowance.allowed {
            tracing::debug!(
                "Billing gate open for {} on flow {} (balance {})",
                feature.id(),
                flow_id,
                allowance.balance
            );
            return Ok(GateOutcome::Proceed);
        }

        let block = BillingBlock {
            phase,
            feature_id: feature.id().to_string(),
            credit_preview: CreditPreview {
                balance: allowance.balance,
                required_balance: allowance.required_balance,
                detail: allowance.preview.clone(),
            },
            related_audit_job_id: audit_job_id,
            created_at: Utc::now(),
        };
        let message = format!(
            "Insufficient credits for {} (balance {}, required {}). Add credits to resume.",
            feature.id(),
            allowance.balance,
            allowance.required_balance
        );
        let now = block.created_at;

        self.store
            .mutate_flow(flow_id, &|flow: &mut Flow| {
                flow.mark_paused(block.clone());
                flow.last_event = Some(crate::models::LastEvent::new(
                    "paused_for_upgrade",
                    &message,
                    now,
                ));
            })
            .await?;

        tracing::warn!(
            "⚠ Flow {} paused at {}: insufficient credits for {}",
            flow_id,
            phase.as_str(),
            feature.id()
        );

        Ok(GateOutcome::Paused(PauseSignal {
            flow_id,
            feature_id: feature.id().to_string(),
            phase,
            audit_job_id,
        }))
    }

    /// Records usage after the metered operation succeeded.
    pub async fn track_usage(
        &self,
        customer_id: &str,
        feature: Feature,
        value: f64,
    ) -> Result<(), AppError> {
        self.provider
            .record_usage(customer_id, feature.id(), value)
            .await?;
        tracing::info!("✓ Tracked {} x{} for {}", feature.id(), value, customer_id);
        Ok(())
    }
}
