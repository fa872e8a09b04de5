//! Document store for flows, audit jobs, opportunities, dossiers and pages.
//!
//! Flow and audit-job documents are mutated only through `mutate_*`: a single
//! atomic read-modify-write keyed by the document id. Mutations are plain
//! closures so a backend may re-apply them after losing a compare-and-swap race.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{
    Agency, AuditJob, Dossier, Flow, FlowStatus, Opportunity, OpportunityStatus, PageContent,
};

pub type FlowMutation<'a> = &'a (dyn Fn(&mut Flow) + Send + Sync);
pub type AuditMutation<'a> = &'a (dyn Fn(&mut AuditJob) + Send + Sync);

#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn upsert_agency(&self, agency: &Agency) -> Result<(), AppError>;
    async fn get_agency(&self, id: Uuid) -> Result<Option<Agency>, AppError>;

    async fn create_flow(&self, flow: &Flow) -> Result<(), AppError>;
    async fn get_flow(&self, id: Uuid) -> Result<Option<Flow>, AppError>;
    /// Applies `mutation` atomically, bumps `version` and `updated_at`, and
    /// returns the stored document.
    async fn mutate_flow(&self, id: Uuid, mutation: FlowMutation<'_>) -> Result<Flow, AppError>;
    async fn list_flows_by_status(&self, status: FlowStatus) -> Result<Vec<Flow>, AppError>;

    async fn find_opportunity_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Opportunity>, AppError>;
    async fn find_opportunity_by_domain(
        &self,
        agency_id: Uuid,
        domain: &str,
    ) -> Result<Option<Opportunity>, AppError>;
    /// Inserts unless the external id or `(agency, domain)` is taken.
    /// Returns whether a row was written.
    async fn insert_opportunity(&self, opportunity: &Opportunity) -> Result<bool, AppError>;
    async fn get_opportunity(&self, id: Uuid) -> Result<Option<Opportunity>, AppError>;
    async fn list_flow_opportunities(&self, flow_id: Uuid) -> Result<Vec<Opportunity>, AppError>;
    async fn update_opportunity_status(
        &self,
        id: Uuid,
        status: OpportunityStatus,
    ) -> Result<(), AppError>;

    /// Inserts unless the flow already has a job for the opportunity.
    /// Returns whether a job was written.
    async fn create_audit_job_if_absent(&self, job: &AuditJob) -> Result<bool, AppError>;
    async fn get_audit_job(&self, id: Uuid) -> Result<Option<AuditJob>, AppError>;
    async fn mutate_audit_job(
        &self,
        id: Uuid,
        mutation: AuditMutation<'_>,
    ) -> Result<AuditJob, AppError>;
    /// Jobs of a flow in creation order.
    async fn list_audit_jobs(&self, flow_id: Uuid) -> Result<Vec<AuditJob>, AppError>;

    async fn insert_dossier(&self, dossier: &Dossier) -> Result<(), AppError>;
    async fn get_dossier_for_audit(&self, audit_job_id: Uuid) -> Result<Option<Dossier>, AppError>;

    async fn store_page(&self, page: &PageContent) -> Result<(), AppError>;
    async fn list_pages(&self, audit_job_id: Uuid) -> Result<Vec<PageContent>, AppError>;
}

pub async fn require_flow(store: &dyn FlowStore, id: Uuid) -> Result<Flow, AppError> {
    store
        .get_flow(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Flow {} not found", id)))
}

pub async fn require_audit_job(store: &dyn FlowStore, id: Uuid) -> Result<AuditJob, AppError> {
    store
        .get_audit_job(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Audit job {} not found", id)))
}

pub async fn require_opportunity(
    store: &dyn FlowStore,
    id: Uuid,
) -> Result<Opportunity, AppError> {
    store
        .get_opportunity(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Opportunity {} not found", id)))
}

#[derive(Default)]
struct MemoryState {
    agencies: HashMap<Uuid, Agency>,
    flows: HashMap<Uuid, Flow>,
    audit_jobs: Vec<AuditJob>,
    opportunities: Vec<Opportunity>,
    dossiers: Vec<Dossier>,
    pages: Vec<PageContent>,
}

/// In-process store used when no database is configured, and by tests.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowStore for MemoryStore {
    async fn upsert_agency(&self, agency: &Agency) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        state.agencies.insert(agency.id, agency.clone());
        Ok(())
    }

    async fn get_agency(&self, id: Uuid) -> Result<Option<Agency>, AppError> {
        Ok(self.state.lock().await.agencies.get(&id).cloned())
    }

    async fn create_flow(&self, flow: &Flow) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if state.flows.contains_key(&flow.id) {
            return Err(AppError::Conflict(format!("Flow {} already exists", flow.id)));
        }
        state.flows.insert(flow.id, flow.clone());
        Ok(())
    }

    async fn get_flow(&self, id: Uuid) -> Result<Option<Flow>, AppError> {
        Ok(self.state.lock().await.flows.get(&id).cloned())
    }

    async fn mutate_flow(&self, id: Uuid, mutation: FlowMutation<'_>) -> Result<Flow, AppError> {
        let mut state = self.state.lock().await;
        let flow = state
            .flows
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Flow {} not found", id)))?;
        mutation(flow);
        flow.version += 1;
        flow.updated_at = Utc::now();
        Ok(flow.clone())
    }

    async fn list_flows_by_status(&self, status: FlowStatus) -> Result<Vec<Flow>, AppError> {
        let state = self.state.lock().await;
        let mut flows: Vec<Flow> = state
            .flows
            .values()
            .filter(|f| f.status() == status)
            .cloned()
            .collect();
        flows.sort_by_key(|f| f.created_at);
        Ok(flows)
    }

    async fn find_opportunity_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Opportunity>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .opportunities
            .iter()
            .find(|o| o.external_id == external_id)
            .cloned())
    }

    async fn find_opportunity_by_domain(
        &self,
        agency_id: Uuid,
        domain: &str,
    ) -> Result<Option<Opportunity>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .opportunities
            .iter()
            .find(|o| o.agency_id == agency_id && o.domain.as_deref() == Some(domain))
            .cloned())
    }

    async fn insert_opportunity(&self, opportunity: &Opportunity) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        let taken = state.opportunities.iter().any(|o| {
            o.external_id == opportunity.external_id
                || (opportunity.domain.is_some()
                    && o.agency_id == opportunity.agency_id
                    && o.domain == opportunity.domain)
        });
        if taken {
            return Ok(false);
        }
        state.opportunities.push(opportunity.clone());
        Ok(true)
    }

    async fn get_opportunity(&self, id: Uuid) -> Result<Option<Opportunity>, AppError> {
        let state = self.state.lock().await;
        Ok(state.opportunities.iter().find(|o| o.id == id).cloned())
    }

    async fn list_flow_opportunities(&self, flow_id: Uuid) -> Result<Vec<Opportunity>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .opportunities
            .iter()
            .filter(|o| o.flow_id == flow_id)
            .cloned()
            .collect())
    }

    async fn update_opportunity_status(
        &self,
        id: Uuid,
        status: OpportunityStatus,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        let opportunity = state
            .opportunities
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or_else(|| AppError::NotFound(format!("Opportunity {} not found", id)))?;
        opportunity.status = status;
        Ok(())
    }

    async fn create_audit_job_if_absent(&self, job: &AuditJob) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        let exists = state
            .audit_jobs
            .iter()
            .any(|j| j.flow_id == job.flow_id && j.opportunity_id == job.opportunity_id);
        if exists {
            return Ok(false);
        }
        state.audit_jobs.push(job.clone());
        Ok(true)
    }

    async fn get_audit_job(&self, id: Uuid) -> Result<Option<AuditJob>, AppError> {
        let state = self.state.lock().await;
        Ok(state.audit_jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn mutate_audit_job(
        &self,
        id: Uuid,
        mutation: AuditMutation<'_>,
    ) -> Result<AuditJob, AppError> {
        let mut state = self.state.lock().await;
        let job = state
            .audit_jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| AppError::NotFound(format!("Audit job {} not found", id)))?;
        mutation(job);
        job.version += 1;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn list_audit_jobs(&self, flow_id: Uuid) -> Result<Vec<AuditJob>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .audit_jobs
            .iter()
            .filter(|j| j.flow_id == flow_id)
            .cloned()
            .collect())
    }

    async fn insert_dossier(&self, dossier: &Dossier) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if state
            .dossiers
            .iter()
            .any(|d| d.audit_job_id == dossier.audit_job_id)
        {
            return Err(AppError::Conflict(format!(
                "Audit job {} already has a dossier",
                dossier.audit_job_id
            )));
        }
        state.dossiers.push(dossier.clone());
        Ok(())
    }

    async fn get_dossier_for_audit(&self, audit_job_id: Uuid) -> Result<Option<Dossier>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .dossiers
            .iter()
            .find(|d| d.audit_job_id == audit_job_id)
            .cloned())
    }

    async fn store_page(&self, page: &PageContent) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        state
            .pages
            .retain(|p| !(p.audit_job_id == page.audit_job_id && p.url == page.url));
        state.pages.push(page.clone());
        Ok(())
    }

    async fn list_pages(&self, audit_job_id: Uuid) -> Result<Vec<PageContent>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .pages
            .iter()
            .filter(|p| p.audit_job_id == audit_job_id)
            .cloned()
            .collect())
    }
}
