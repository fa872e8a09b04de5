use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{
    Agency, AgencyProfileRequest, AuditJobView, Dossier, FlowView, Opportunity, PageSummary,
    StartFlowRequest,
};
use crate::orchestrator::{self, ExecutionLauncher, LeadGenWorkflow, ResumeOutcome};
use crate::phases::PhaseName;
use crate::store::{require_audit_job, require_flow, FlowStore};

/// Header carrying the billing customer, set by the upstream gateway.
pub const OWNER_HEADER: &str = "x-owner-id";
/// Header carrying the acting agency, set by the upstream gateway.
pub const AGENCY_HEADER: &str = "x-agency-id";

/// Request bodies are small JSON documents.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub workflow: Arc<LeadGenWorkflow>,
    /// Starts flow executions in the background.
    pub launcher: Arc<dyn ExecutionLauncher>,
}

impl AppState {
    fn store(&self) -> &dyn FlowStore {
        self.workflow.store().as_ref()
    }
}

/// Health check endpoint.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "leadgen-orchestrator",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Unauthorized(format!("Missing '{}' header", name)))
}

/// PUT /api/v1/agencies/:id
///
/// Stores the agency profile: the signals it sells against and the campaign
/// defaults used when a flow is started without them.
pub async fn put_agency(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AgencyProfileRequest>,
) -> Result<Json<Agency>, AppError> {
    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("name is required".to_string()));
    }

    let mut criteria = payload.criteria;
    criteria.sort();
    criteria.dedup();

    let agency = Agency {
        id,
        name: payload.name.trim().to_string(),
        criteria,
        default_vertical: payload.default_vertical,
        default_geography: payload.default_geography,
    };
    state.store().upsert_agency(&agency).await?;
    tracing::info!(
        "Agency {} saved with {} criteria",
        agency.id,
        agency.criteria.len()
    );
    Ok(Json(agency))
}

/// POST /api/v1/flows
///
/// Creates a flow and starts its first execution in the background.
pub async fn start_flow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<StartFlowRequest>,
) -> Result<(StatusCode, Json<FlowView>), AppError> {
    let owner_id = header(&headers, OWNER_HEADER)?;
    let agency_id = header(&headers, AGENCY_HEADER)?
        .parse::<Uuid>()
        .map_err(|_| AppError::BadRequest(format!("'{}' must be a UUID", AGENCY_HEADER)))?;

    tracing::info!(
        "POST /flows - owner {} agency {} leads {}",
        owner_id,
        agency_id,
        payload.lead_count
    );

    let flow = orchestrator::start_flow(
        state.store(),
        state.launcher.as_ref(),
        state.workflow.settings(),
        owner_id,
        agency_id,
        payload,
    )
    .await?;
    Ok((StatusCode::ACCEPTED, Json(FlowView::from(&flow))))
}

/// GET /api/v1/flows/:id
pub async fn get_flow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<FlowView>, AppError> {
    let flow = require_flow(state.store(), id).await?;
    Ok(Json(FlowView::from(&flow)))
}

/// POST /api/v1/flows/:id/resume
pub async fn resume_flow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    tracing::info!("POST /flows/{}/resume", id);
    let outcome = orchestrator::resume_flow(
        state.store(),
        state.workflow.gate(),
        state.launcher.as_ref(),
        id,
    )
    .await?;

    let response = match outcome {
        ResumeOutcome::Resumed { execution_id } => (
            StatusCode::ACCEPTED,
            Json(json!({
                "resumed": true,
                "execution_id": execution_id
            })),
        ),
        ResumeOutcome::NotPaused { status } => (
            StatusCode::OK,
            Json(json!({
                "resumed": false,
                "status": status.as_str(),
                "message": "Flow is not paused"
            })),
        ),
        ResumeOutcome::StillInsufficient { feature_id, phase } => (
            StatusCode::PAYMENT_REQUIRED,
            Json(json!({
                "resumed": false,
                "feature_id": feature_id,
                "phase": phase.as_str(),
                "message": "Insufficient credits, add credits and retry"
            })),
        ),
    };
    Ok(response.into_response())
}

/// GET /api/v1/flows/:id/audits
pub async fn list_audits(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<AuditJobView>>, AppError> {
    require_flow(state.store(), id).await?;
    let jobs = state.store().list_audit_jobs(id).await?;
    Ok(Json(jobs.iter().map(AuditJobView::from).collect()))
}

/// GET /api/v1/flows/:id/opportunities
pub async fn list_opportunities(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Opportunity>>, AppError> {
    require_flow(state.store(), id).await?;
    Ok(Json(state.store().list_flow_opportunities(id).await?))
}

/// GET /api/v1/audits/:id/dossier
pub async fn get_dossier(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Dossier>, AppError> {
    state
        .store()
        .get_dossier_for_audit(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("No dossier for audit {}", id)))
}

/// GET /api/v1/audits/:id/pages
///
/// Page metadata and content references; the content itself is not returned.
pub async fn list_pages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<PageSummary>>, AppError> {
    require_audit_job(state.store(), id).await?;
    let pages = state.store().list_pages(id).await?;
    Ok(Json(pages.iter().map(PageSummary::from).collect()))
}

/// API routes, without state or outer layers.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/agencies/:id", put(put_agency))
        .route("/api/v1/flows", post(start_flow))
        .route("/api/v1/flows/:id", get(get_flow))
        .route("/api/v1/flows/:id/resume", post(resume_flow))
        .route("/api/v1/flows/:id/audits", get(list_audits))
        .route("/api/v1/flows/:id/opportunities", get(list_opportunities))
        .route("/api/v1/audits/:id/dossier", get(get_dossier))
        .route("/api/v1/audits/:id/pages", get(list_pages))
}

/// Health check plus `api`, with tracing and CORS applied to everything.
pub fn app(state: Arc<AppState>, api: Router<Arc<AppState>>) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(api)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Full router with a body limit on the API routes and no rate limiting.
pub fn build_router(state: Arc<AppState>) -> Router {
    app(state, api_routes().layer(body_limit()))
}

pub fn body_limit() -> RequestBodyLimitLayer {
    RequestBodyLimitLayer::new(MAX_BODY_BYTES)
}
