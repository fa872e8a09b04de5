//! Fake collaborators and fixtures shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use leadgen_orchestrator::config::{AuditSettings, WorkflowSettings};
use leadgen_orchestrator::errors::AppError;
use leadgen_orchestrator::models::{Agency, Campaign, Flow, PlaceRecord};
use leadgen_orchestrator::orchestrator::{Collaborators, ExecutionLauncher, LeadGenWorkflow};
use leadgen_orchestrator::retry::RetryPolicies;
use leadgen_orchestrator::services::{
    Allowance, BillingProvider, CrawlPoll, CrawlProvider, CrawlStatus, FetchedPage, LlmProvider,
    ScrapeProvider, SearchProvider,
};
use leadgen_orchestrator::signals::SignalName;
use leadgen_orchestrator::store::{FlowStore, MemoryStore};

pub const OWNER: &str = "cus_test";

// ============================================================================
// Fixtures
// ============================================================================

pub fn place(
    id: &str,
    website: Option<&str>,
    phone: Option<&str>,
    rating: Option<f64>,
    reviews: Option<u32>,
) -> PlaceRecord {
    PlaceRecord {
        external_id: id.to_string(),
        name: format!("Business {}", id),
        website: website.map(str::to_string),
        phone: phone.map(str::to_string),
        rating,
        review_count: reviews,
        address: Some("100 Congress Ave, Austin, TX".to_string()),
    }
}

/// Five places: three dialable (two with their own websites), two without a phone.
pub fn five_places() -> Vec<PlaceRecord> {
    vec![
        place(
            "p-1",
            Some("https://www.alpha-plumbing.com"),
            Some("(512) 463-4630"),
            Some(3.5),
            Some(40),
        ),
        place(
            "p-2",
            Some("https://bravo-plumbing.com/home"),
            Some("512-555-0199"),
            Some(4.8),
            Some(3),
        ),
        place("p-3", None, Some("+1 512 463 0000"), Some(4.2), Some(25)),
        place("p-4", Some("https://delta.com"), None, Some(4.9), Some(200)),
        place("p-5", Some("https://echo.com"), Some("12"), None, None),
    ]
}

pub fn test_audit_settings() -> AuditSettings {
    AuditSettings {
        crawl_url_limit: 10,
        crawl_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(1),
        pages_per_audit: 3,
        scrape_concurrency: 2,
        scrape_batch_delay: Duration::ZERO,
    }
}

pub fn test_workflow_settings() -> WorkflowSettings {
    WorkflowSettings {
        max_leads_per_flow: 50,
        places_snapshot_limit: 2,
        retry: RetryPolicies::without_backoff(),
    }
}

// ============================================================================
// Search
// ============================================================================

#[derive(Default)]
pub struct FakeSearch {
    places: Mutex<Vec<PlaceRecord>>,
    pub calls: AtomicUsize,
}

impl FakeSearch {
    pub fn returning(places: Vec<PlaceRecord>) -> Self {
        Self {
            places: Mutex::new(places),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchProvider for FakeSearch {
    async fn search(&self, _query: &str, max_results: u32) -> Result<Vec<PlaceRecord>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let places = self.places.lock().unwrap().clone();
        Ok(places.into_iter().take(max_results as usize).collect())
    }
}

// ============================================================================
// Crawl
// ============================================================================

/// Completes every crawl immediately with `/contact` and `/about` pages,
/// except for roots listed in `failing`.
#[derive(Default)]
pub struct FakeCrawl {
    failing: Mutex<HashSet<String>>,
    /// Roots whose crawl never finishes.
    stuck: Mutex<HashSet<String>>,
    pub starts: AtomicUsize,
}

impl FakeCrawl {
    pub fn fail_for(&self, root: &str) {
        self.failing.lock().unwrap().insert(root.to_string());
    }

    pub fn stall_for(&self, root: &str) {
        self.stuck.lock().unwrap().insert(root.to_string());
    }
}

#[async_trait]
impl CrawlProvider for FakeCrawl {
    async fn start_discovery(&self, root_url: &str, _limit: u32) -> Result<String, AppError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(root_url.to_string())
    }

    async fn poll(&self, job: &str) -> Result<CrawlPoll, AppError> {
        if self.failing.lock().unwrap().contains(job) {
            return Ok(CrawlPoll {
                status: CrawlStatus::Failed,
                discovered_urls: vec![],
            });
        }
        if self.stuck.lock().unwrap().contains(job) {
            return Ok(CrawlPoll {
                status: CrawlStatus::Running,
                discovered_urls: vec![],
            });
        }
        let root = job.trim_end_matches('/');
        Ok(CrawlPoll {
            status: CrawlStatus::Completed,
            discovered_urls: vec![
                format!("{}/blog/winter-pipes", root),
                format!("{}/contact", root),
                format!("{}/about", root),
            ],
        })
    }
}

// ============================================================================
// Scrape
// ============================================================================

#[derive(Default)]
pub struct FakeScrape {
    pub fetches: AtomicUsize,
    fail_all: Mutex<bool>,
}

impl FakeScrape {
    pub fn fail_everything(&self) {
        *self.fail_all.lock().unwrap() = true;
    }
}

#[async_trait]
impl ScrapeProvider for FakeScrape {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, AppError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if *self.fail_all.lock().unwrap() {
            return Err(AppError::ExternalApiError(format!("503 fetching {}", url)));
        }
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
            .unwrap_or_default();
        Ok(FetchedPage {
            title: Some(format!("Page {}", url)),
            http_status: 200,
            content: Some(format!(
                "Welcome to {}. Reach the owner at owner@{} for a quote.",
                url, host
            )),
        })
    }
}

// ============================================================================
// LLM
// ============================================================================

#[derive(Default)]
pub struct FakeLlm {
    pub text_calls: AtomicUsize,
    pub structured_calls: AtomicUsize,
    /// When set, structured generation returns an invalid dossier.
    invalid_dossier: Mutex<bool>,
}

impl FakeLlm {
    pub fn return_invalid_dossiers(&self) {
        *self.invalid_dossier.lock().unwrap() = true;
    }
}

#[async_trait]
impl LlmProvider for FakeLlm {
    async fn generate_text(&self, _thread: &str, _prompt: &str) -> Result<String, AppError> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        Ok("I'd look at the contact page first.".to_string())
    }

    async fn generate_structured(
        &self,
        _thread: &str,
        _prompt: &str,
        _schema: &Value,
    ) -> Result<Value, AppError> {
        self.structured_calls.fetch_add(1, Ordering::SeqCst);
        if *self.invalid_dossier.lock().unwrap() {
            return Ok(json!({ "summary": "", "gaps": ["one"], "talking_points": [] }));
        }
        Ok(json!({
            "summary": "Established local plumber with a dated website.",
            "gaps": ["No online booking", "Reviews are not answered"],
            "talking_points": ["Booking widget", "Review follow-ups"],
            "contact_email": null,
            "fit_rationale": "Low rating across a real sample of reviews."
        }))
    }
}

// ============================================================================
// Billing
// ============================================================================

#[derive(Default)]
struct BillingState {
    denied: HashSet<String>,
    /// Feature id -> number of checks still allowed before denying.
    allow_budget: HashMap<String, usize>,
    usage: Vec<(String, String, f64)>,
    checks: Vec<String>,
    fail_usage: bool,
}

#[derive(Default)]
pub struct FakeBilling {
    state: Mutex<BillingState>,
}

impl FakeBilling {
    pub fn deny(&self, feature_id: &str) {
        self.state.lock().unwrap().denied.insert(feature_id.to_string());
    }

    pub fn allow(&self, feature_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.denied.remove(feature_id);
        state.allow_budget.remove(feature_id);
    }

    /// Allows `checks` more checks of `feature_id`, then denies.
    pub fn deny_after(&self, feature_id: &str, checks: usize) {
        self.state
            .lock()
            .unwrap()
            .allow_budget
            .insert(feature_id.to_string(), checks);
    }

    pub fn fail_usage_recording(&self, fail: bool) {
        self.state.lock().unwrap().fail_usage = fail;
    }

    pub fn usage(&self) -> Vec<(String, String, f64)> {
        self.state.lock().unwrap().usage.clone()
    }

    pub fn usage_for(&self, feature_id: &str) -> Vec<f64> {
        self.usage()
            .into_iter()
            .filter(|(_, f, _)| f == feature_id)
            .map(|(_, _, v)| v)
            .collect()
    }

    pub fn checks_for(&self, feature_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .checks
            .iter()
            .filter(|f| *f == feature_id)
            .count()
    }
}

#[async_trait]
impl BillingProvider for FakeBilling {
    async fn check_allowance(
        &self,
        _customer_id: &str,
        feature_id: &str,
    ) -> Result<Allowance, AppError> {
        let mut state = self.state.lock().unwrap();
        state.checks.push(feature_id.to_string());
        let mut allowed = !state.denied.contains(feature_id);
        if let Some(budget) = state.allow_budget.get_mut(feature_id) {
            if *budget == 0 {
                allowed = false;
            } else {
                *budget -= 1;
            }
        }
        Ok(Allowance {
            allowed,
            balance: if allowed { 100.0 } else { 0.0 },
            required_balance: 1.0,
            preview: json!({ "plan": "starter" }),
        })
    }

    async fn record_usage(
        &self,
        customer_id: &str,
        feature_id: &str,
        value: f64,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_usage {
            return Err(AppError::ExternalApiError("billing unavailable".into()));
        }
        state
            .usage
            .push((customer_id.to_string(), feature_id.to_string(), value));
        Ok(())
    }
}

// ============================================================================
// Launchers
// ============================================================================

/// Records launches without running anything.
#[derive(Default)]
pub struct RecordingLauncher {
    pub launched: Mutex<Vec<(Uuid, Uuid)>>,
}

impl RecordingLauncher {
    pub fn launches(&self) -> Vec<(Uuid, Uuid)> {
        self.launched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionLauncher for RecordingLauncher {
    async fn launch(&self, flow_id: Uuid) -> Result<Uuid, AppError> {
        let execution_id = Uuid::new_v4();
        self.launched.lock().unwrap().push((flow_id, execution_id));
        Ok(execution_id)
    }
}

pub struct FailingLauncher;

#[async_trait]
impl ExecutionLauncher for FailingLauncher {
    async fn launch(&self, _flow_id: Uuid) -> Result<Uuid, AppError> {
        Err(AppError::InternalError("executor unavailable".into()))
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub search: Arc<FakeSearch>,
    pub crawl: Arc<FakeCrawl>,
    pub scrape: Arc<FakeScrape>,
    pub llm: Arc<FakeLlm>,
    pub billing: Arc<FakeBilling>,
    pub workflow: Arc<LeadGenWorkflow>,
    pub agency_id: Uuid,
}

impl Harness {
    pub async fn new(places: Vec<PlaceRecord>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let search = Arc::new(FakeSearch::returning(places));
        let crawl = Arc::new(FakeCrawl::default());
        let scrape = Arc::new(FakeScrape::default());
        let llm = Arc::new(FakeLlm::default());
        let billing = Arc::new(FakeBilling::default());

        let workflow = Arc::new(LeadGenWorkflow::new(
            store.clone(),
            Collaborators {
                search: search.clone(),
                crawl: crawl.clone(),
                scrape: scrape.clone(),
                llm: llm.clone(),
                billing: billing.clone(),
            },
            test_workflow_settings(),
            test_audit_settings(),
        ));

        let agency_id = Uuid::new_v4();
        store
            .upsert_agency(&Agency {
                id: agency_id,
                name: "Pipe Growth Agency".into(),
                criteria: vec![SignalName::LowRating, SignalName::FewReviews],
                default_vertical: Some("plumbers".into()),
                default_geography: Some("Austin, TX".into()),
            })
            .await
            .unwrap();

        Self {
            store,
            search,
            crawl,
            scrape,
            llm,
            billing,
            workflow,
            agency_id,
        }
    }

    /// Stores an idle flow without launching it.
    pub async fn idle_flow(&self, leads: u32) -> Flow {
        let flow = Flow::new(
            OWNER.to_string(),
            self.agency_id,
            leads,
            Campaign {
                vertical: "plumbers".into(),
                geography: "Austin, TX".into(),
            },
        );
        self.store.create_flow(&flow).await.unwrap();
        flow
    }

    pub async fn flow(&self, id: Uuid) -> Flow {
        self.store.get_flow(id).await.unwrap().unwrap()
    }
}
