use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::{AppError, ResultExt};
use crate::models::{
    Agency, AuditJob, Dossier, Flow, FlowStatus, Opportunity, OpportunityStatus, PageContent,
};
use crate::store::{AuditMutation, FlowMutation, FlowStore};

/// Attempts before a compare-and-swap update gives up.
const MAX_CAS_ATTEMPTS: usize = 5;

/// Postgres-backed document store.
///
/// Flow and audit-job documents are updated with a version compare-and-swap:
/// read the row, apply the mutation, write back only if the version is unchanged.
/// No row lock is held between the read and the write.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FlowStore for PgStore {
    async fn upsert_agency(&self, agency: &Agency) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO agencies (id, doc, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (id) DO UPDATE SET doc = EXCLUDED.doc, updated_at = now()
            "#,
        )
        .bind(agency.id)
        .bind(Json(agency))
        .execute(&self.pool)
        .await
        .context("upserting agency")?;
        Ok(())
    }

    async fn get_agency(&self, id: Uuid) -> Result<Option<Agency>, AppError> {
        let row = sqlx::query_as::<_, (Json<Agency>,)>("SELECT doc FROM agencies WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("loading agency")?;
        Ok(row.map(|(doc,)| doc.0))
    }

    async fn create_flow(&self, flow: &Flow) -> Result<(), AppError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO lead_flows (id, owner_id, agency_id, status, version, doc, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(flow.id)
        .bind(&flow.owner_id)
        .bind(flow.agency_id)
        .bind(flow.status().as_str())
        .bind(flow.version)
        .bind(Json(flow))
        .bind(flow.created_at)
        .execute(&self.pool)
        .await
        .context("creating flow")?
        .rows_affected();

        if inserted == 0 {
            return Err(AppError::Conflict(format!("Flow {} already exists", flow.id)));
        }
        Ok(())
    }

    async fn get_flow(&self, id: Uuid) -> Result<Option<Flow>, AppError> {
        let row = sqlx::query_as::<_, (Json<Flow>, i64)>(
            "SELECT doc, version FROM lead_flows WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("loading flow")?;

        Ok(row.map(|(doc, version)| {
            let mut flow = doc.0;
            flow.version = version;
            flow
        }))
    }

    async fn mutate_flow(&self, id: Uuid, mutation: FlowMutation<'_>) -> Result<Flow, AppError> {
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let mut flow = self
                .get_flow(id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Flow {} not found", id)))?;
            let expected = flow.version;

            mutation(&mut flow);
            flow.version = expected + 1;
            flow.updated_at = Utc::now();

            let written = sqlx::query(
                r#"
                UPDATE lead_flows
                SET doc = $3, status = $4, version = $5, updated_at = $6
                WHERE id = $1 AND version = $2
                "#,
            )
            .bind(id)
            .bind(expected)
            .bind(Json(&flow))
            .bind(flow.status().as_str())
            .bind(flow.version)
            .bind(flow.updated_at)
            .execute(&self.pool)
            .await
            .context("updating flow")?
            .rows_affected();

            if written == 1 {
                return Ok(flow);
            }
            tracing::debug!(
                "Flow {} changed underneath update (attempt {}), retrying",
                id,
                attempt + 1
            );
        }

        Err(AppError::Conflict(format!(
            "Flow {} kept changing during update",
            id
        )))
    }

    async fn list_flows_by_status(&self, status: FlowStatus) -> Result<Vec<Flow>, AppError> {
        let rows = sqlx::query_as::<_, (Json<Flow>, i64)>(
            "SELECT doc, version FROM lead_flows WHERE status = $1 ORDER BY created_at",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .context("listing flows")?;

        Ok(rows
            .into_iter()
            .map(|(doc, version)| {
                let mut flow = doc.0;
                flow.version = version;
                flow
            })
            .collect())
    }

    async fn find_opportunity_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Opportunity>, AppError> {
        let row = sqlx::query_as::<_, (Json<Opportunity>,)>(
            "SELECT doc FROM opportunities WHERE external_id = $1 LIMIT 1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .context("finding opportunity by external id")?;
        Ok(row.map(|(doc,)| doc.0))
    }

    async fn find_opportunity_by_domain(
        &self,
        agency_id: Uuid,
        domain: &str,
    ) -> Result<Option<Opportunity>, AppError> {
        let row = sqlx::query_as::<_, (Json<Opportunity>,)>(
            "SELECT doc FROM opportunities WHERE agency_id = $1 AND domain = $2 LIMIT 1",
        )
        .bind(agency_id)
        .bind(domain)
        .fetch_optional(&self.pool)
        .await
        .context("finding opportunity by domain")?;
        Ok(row.map(|(doc,)| doc.0))
    }

    async fn insert_opportunity(&self, opportunity: &Opportunity) -> Result<bool, AppError> {
        // Both unique constraints (external id, agency+domain) resolve to a no-op.
        let inserted = sqlx::query(
            r#"
            INSERT INTO opportunities
                (id, agency_id, flow_id, external_id, domain, status, qualification_score, doc, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(opportunity.id)
        .bind(opportunity.agency_id)
        .bind(opportunity.flow_id)
        .bind(&opportunity.external_id)
        .bind(&opportunity.domain)
        .bind(opportunity.status.as_str())
        .bind(opportunity.qualification_score)
        .bind(Json(opportunity))
        .bind(opportunity.created_at)
        .execute(&self.pool)
        .await
        .context("inserting opportunity")?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn get_opportunity(&self, id: Uuid) -> Result<Option<Opportunity>, AppError> {
        let row = sqlx::query_as::<_, (Json<Opportunity>,)>(
            "SELECT doc FROM opportunities WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("loading opportunity")?;
        Ok(row.map(|(doc,)| doc.0))
    }

    async fn list_flow_opportunities(&self, flow_id: Uuid) -> Result<Vec<Opportunity>, AppError> {
        let rows = sqlx::query_as::<_, (Json<Opportunity>,)>(
            "SELECT doc FROM opportunities WHERE flow_id = $1 ORDER BY created_at",
        )
        .bind(flow_id)
        .fetch_all(&self.pool)
        .await
        .context("listing flow opportunities")?;
        Ok(rows.into_iter().map(|(doc,)| doc.0).collect())
    }

    async fn update_opportunity_status(
        &self,
        id: Uuid,
        status: OpportunityStatus,
    ) -> Result<(), AppError> {
        let updated = sqlx::query(
            r#"
            UPDATE opportunities
            SET status = $2,
                doc = jsonb_set(doc, '{status}', to_jsonb($2::text))
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .context("updating opportunity status")?
        .rows_affected();

        if updated == 0 {
            return Err(AppError::NotFound(format!("Opportunity {} not found", id)));
        }
        Ok(())
    }

    async fn create_audit_job_if_absent(&self, job: &AuditJob) -> Result<bool, AppError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO audit_jobs (id, flow_id, opportunity_id, status, version, doc, created_at)
            VALUES ($1, $2, $3, 'queued', $4, $5, $6)
            ON CONFLICT (flow_id, opportunity_id) DO NOTHING
            "#,
        )
        .bind(job.id)
        .bind(job.flow_id)
        .bind(job.opportunity_id)
        .bind(job.version)
        .bind(Json(job))
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .context("queueing audit job")?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn get_audit_job(&self, id: Uuid) -> Result<Option<AuditJob>, AppError> {
        let row = sqlx::query_as::<_, (Json<AuditJob>, i64)>(
            "SELECT doc, version FROM audit_jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("loading audit job")?;

        Ok(row.map(|(doc, version)| {
            let mut job = doc.0;
            job.version = version;
            job
        }))
    }

    async fn mutate_audit_job(
        &self,
        id: Uuid,
        mutation: AuditMutation<'_>,
    ) -> Result<AuditJob, AppError> {
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let mut job = self
                .get_audit_job(id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Audit job {} not found", id)))?;
            let expected = job.version;

            mutation(&mut job);
            job.version = expected + 1;
            job.updated_at = Utc::now();

            let status = serde_json::to_value(job.status)?;
            let written = sqlx::query(
                r#"
                UPDATE audit_jobs
                SET doc = $3, status = $4, version = $5
                WHERE id = $1 AND version = $2
                "#,
            )
            .bind(id)
            .bind(expected)
            .bind(Json(&job))
            .bind(status.as_str().unwrap_or("queued"))
            .bind(job.version)
            .execute(&self.pool)
            .await
            .context("updating audit job")?
            .rows_affected();

            if written == 1 {
                return Ok(job);
            }
            tracing::debug!(
                "Audit job {} changed underneath update (attempt {}), retrying",
                id,
                attempt + 1
            );
        }

        Err(AppError::Conflict(format!(
            "Audit job {} kept changing during update",
            id
        )))
    }

    async fn list_audit_jobs(&self, flow_id: Uuid) -> Result<Vec<AuditJob>, AppError> {
        let rows = sqlx::query_as::<_, (Json<AuditJob>, i64)>(
            "SELECT doc, version FROM audit_jobs WHERE flow_id = $1 ORDER BY created_at, id",
        )
        .bind(flow_id)
        .fetch_all(&self.pool)
        .await
        .context("listing audit jobs")?;

        Ok(rows
            .into_iter()
            .map(|(doc, version)| {
                let mut job = doc.0;
                job.version = version;
                job
            })
            .collect())
    }

    async fn insert_dossier(&self, dossier: &Dossier) -> Result<(), AppError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO dossiers (id, audit_job_id, opportunity_id, doc, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (audit_job_id) DO NOTHING
            "#,
        )
        .bind(dossier.id)
        .bind(dossier.audit_job_id)
        .bind(dossier.opportunity_id)
        .bind(Json(dossier))
        .bind(dossier.created_at)
        .execute(&self.pool)
        .await
        .context("inserting dossier")?
        .rows_affected();

        if inserted == 0 {
            return Err(AppError::Conflict(format!(
                "Audit job {} already has a dossier",
                dossier.audit_job_id
            )));
        }
        Ok(())
    }

    async fn get_dossier_for_audit(&self, audit_job_id: Uuid) -> Result<Option<Dossier>, AppError> {
        let row = sqlx::query_as::<_, (Json<Dossier>,)>(
            "SELECT doc FROM dossiers WHERE audit_job_id = $1",
        )
        .bind(audit_job_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading dossier")?;
        Ok(row.map(|(doc,)| doc.0))
    }

    async fn store_page(&self, page: &PageContent) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO page_contents (audit_job_id, url, content_ref, title, http_status, content, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (audit_job_id, url) DO UPDATE
            SET content_ref = EXCLUDED.content_ref,
                title = EXCLUDED.title,
                http_status = EXCLUDED.http_status,
                content = EXCLUDED.content
            "#,
        )
        .bind(page.audit_job_id)
        .bind(&page.url)
        .bind(&page.content_ref)
        .bind(&page.title)
        .bind(i32::from(page.http_status))
        .bind(&page.content)
        .bind(page.created_at)
        .execute(&self.pool)
        .await
        .context("storing page content")?;
        Ok(())
    }

    async fn list_pages(&self, audit_job_id: Uuid) -> Result<Vec<PageContent>, AppError> {
        let rows = sqlx::query_as::<_, (String, String, Option<String>, i32, String, chrono::DateTime<Utc>)>(
            r#"
            SELECT url, content_ref, title, http_status, content, created_at
            FROM page_contents
            WHERE audit_job_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(audit_job_id)
        .fetch_all(&self.pool)
        .await
        .context("listing page contents")?;

        Ok(rows
            .into_iter()
            .map(|(url, content_ref, title, http_status, content, created_at)| PageContent {
                content_ref,
                audit_job_id,
                url,
                title,
                http_status: u16::try_from(http_status).unwrap_or(0),
                content,
                created_at,
            })
            .collect())
    }
}
