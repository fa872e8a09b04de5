//! Usage ledger: at most one successful dossier charge per audit job.
//!
//! The `metered` flag on the audit job is the ledger entry. Tracking usage and
//! setting the flag are two writes; a crash between them leaves a job that was
//! charged but still reads as unmetered, which is logged for monitoring.

use std::sync::Arc;
use uuid::Uuid;

use crate::billing::{BillingGate, Feature};
use crate::errors::{AppError, ResultExt};
use crate::models::AuditJob;
use crate::store::{require_audit_job, FlowStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeOutcome {
    Charged,
    AlreadyMetered,
    /// The job has no dossier yet, so there is nothing to charge for.
    NotBillable,
}

pub struct UsageLedger {
    gate: Arc<BillingGate>,
    store: Arc<dyn FlowStore>,
}

impl UsageLedger {
    pub fn new(gate: Arc<BillingGate>, store: Arc<dyn FlowStore>) -> Self {
        Self { gate, store }
    }

    /// Charges one dossier generation for `audit_id` unless already metered.
    pub async fn charge_dossier(
        &self,
        audit_id: Uuid,
        customer_id: &str,
    ) -> Result<ChargeOutcome, AppError> {
        let job = require_audit_job(self.store.as_ref(), audit_id).await?;
        if job.metered {
            tracing::debug!("Audit {} already metered, skipping charge", audit_id);
            return Ok(ChargeOutcome::AlreadyMetered);
        }
        self.charge(&job, customer_id).await
    }

    /// Fallback run after each audit: charges a job that produced a dossier but
    /// was never flagged as metered.
    pub async fn reconcile(
        &self,
        audit_id: Uuid,
        customer_id: &str,
    ) -> Result<ChargeOutcome, AppError> {
        let job = require_audit_job(self.store.as_ref(), audit_id).await?;
        if job.metered {
            return Ok(ChargeOutcome::AlreadyMetered);
        }
        if job.dossier_id.is_none() {
            return Ok(ChargeOutcome::NotBillable);
        }
        tracing::warn!(
            "⚠ Audit {} has dossier {:?} but is unmetered, charging in reconcile",
            audit_id,
            job.dossier_id
        );
        self.charge(&job, customer_id).await
    }

    async fn charge(&self, job: &AuditJob, customer_id: &str) -> Result<ChargeOutcome, AppError> {
        self.gate
            .track_usage(customer_id, Feature::DossierGeneration, 1.0)
            .await
            .with_context(|| format!("charging dossier for audit {}", job.id))?;

        if let Err(e) = self
            .store
            .mutate_audit_job(job.id, &|job: &mut AuditJob| job.metered = true)
            .await
        {
            tracing::warn!(
                "⚠ Usage tracked for audit {} but metered flag not persisted: {}",
                job.id,
                e
            );
            return Err(e);
        }

        tracing::info!("✓ Metered dossier generation for audit {}", job.id);
        Ok(ChargeOutcome::Charged)
    }
}
