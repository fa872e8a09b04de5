//! External collaborators: search, crawl, scrape, LLM and billing.
//!
//! Each collaborator is a trait so the orchestrator can be driven by any
//! backend; the `Http*Service` types are the thin `reqwest` clients used in
//! production.

use async_trait::async_trait;
use failsafe::futures::CircuitBreaker;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::circuit_breaker::{create_collaborator_circuit_breaker, CollaboratorBreaker};
use crate::config::Config;
use crate::errors::AppError;
use crate::models::PlaceRecord;

// ============================================================================
// Collaborator contracts
// ============================================================================

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<PlaceRecord>, AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlPoll {
    pub status: CrawlStatus,
    #[serde(default)]
    pub discovered_urls: Vec<String>,
}

#[async_trait]
pub trait CrawlProvider: Send + Sync {
    /// Starts URL discovery under `root_url`. Returns the job handle.
    async fn start_discovery(&self, root_url: &str, limit: u32) -> Result<String, AppError>;
    async fn poll(&self, job: &str) -> Result<CrawlPoll, AppError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub title: Option<String>,
    pub http_status: u16,
    pub content: Option<String>,
}

#[async_trait]
pub trait ScrapeProvider: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, AppError>;
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate_text(&self, thread: &str, prompt: &str) -> Result<String, AppError>;
    /// Returns an object that satisfies `schema`, or `AppError::SchemaError`.
    async fn generate_structured(
        &self,
        thread: &str,
        prompt: &str,
        schema: &Value,
    ) -> Result<Value, AppError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allowance {
    pub allowed: bool,
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub required_balance: f64,
    #[serde(default)]
    pub preview: Value,
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    async fn check_allowance(&self, customer_id: &str, feature_id: &str)
        -> Result<Allowance, AppError>;
    async fn record_usage(
        &self,
        customer_id: &str,
        feature_id: &str,
        value: f64,
    ) -> Result<(), AppError>;
}

// ============================================================================
// HTTP plumbing
// ============================================================================

fn build_client(service: &str) -> Result<Client, AppError> {
    Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .map_err(|e| AppError::ExternalApiError(format!("Failed to create {} client: {}", service, e)))
}

/// Reads a JSON body, turning non-success statuses into errors that name the service.
/// Turns a non-2xx response into an `ExternalApiError` carrying the body text.
async fn ensure_success(
    response: reqwest::Response,
    service: &str,
) -> Result<reqwest::Response, AppError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    tracing::error!("{} returned error {}: {}", service, status, error_text);
    Err(AppError::ExternalApiError(format!(
        "{} returned status {}: {}",
        service, status, error_text
    )))
}

async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
    service: &str,
) -> Result<T, AppError> {
    ensure_success(response, service)
        .await?
        .json()
        .await
        .map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse {} response: {}", service, e))
        })
}

fn flatten_breaker_error(err: failsafe::Error<AppError>, service: &str) -> AppError {
    match err {
        failsafe::Error::Inner(e) => e,
        failsafe::Error::Rejected => {
            tracing::warn!("⚠ {} circuit open, rejecting call", service);
            AppError::ExternalApiError(format!("{} circuit open", service))
        }
    }
}

// ============================================================================
// Search
// ============================================================================

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    places: Vec<PlaceRecord>,
}

pub struct HttpSearchService {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpSearchService {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client("search")?,
            base_url: config.search_base_url.clone(),
            api_key: config.search_api_key.clone(),
        })
    }
}

#[async_trait]
impl SearchProvider for HttpSearchService {
    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<PlaceRecord>, AppError> {
        let url = format!("{}/v1/places:search", self.base_url);
        tracing::info!("Searching places: '{}' (max {})", query, max_results);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "query": query, "max_results": max_results }))
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Search request failed: {}", e)))?;

        let body: SearchResponse = read_json(response, "Search").await?;
        tracing::info!("Search returned {} places", body.places.len());
        Ok(body.places)
    }
}

// ============================================================================
// Crawl
// ============================================================================

#[derive(Debug, Deserialize)]
struct CrawlStarted {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CrawlStatusResponse {
    status: CrawlStatus,
    #[serde(default)]
    links: Vec<String>,
}

pub struct HttpCrawlService {
    client: Client,
    base_url: String,
    api_key: String,
    breaker: CollaboratorBreaker,
}

impl HttpCrawlService {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client("crawl")?,
            base_url: config.crawl_base_url.clone(),
            api_key: config.crawl_api_key.clone(),
            breaker: create_collaborator_circuit_breaker(),
        })
    }
}

#[async_trait]
impl CrawlProvider for HttpCrawlService {
    async fn start_discovery(&self, root_url: &str, limit: u32) -> Result<String, AppError> {
        let url = format!("{}/v1/map", self.base_url);
        tracing::info!("Starting URL discovery for {} (limit {})", root_url, limit);

        let request = async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&json!({ "url": root_url, "limit": limit }))
                .send()
                .await
                .map_err(|e| AppError::ExternalApiError(format!("Crawl request failed: {}", e)))?;
            read_json::<CrawlStarted>(response, "Crawl").await
        };

        let started = self
            .breaker
            .call(request)
            .await
            .map_err(|e| flatten_breaker_error(e, "Crawl"))?;
        Ok(started.id)
    }

    async fn poll(&self, job: &str) -> Result<CrawlPoll, AppError> {
        let url = format!("{}/v1/map/{}", self.base_url, job);

        let request = async {
            let response = self
                .client
                .get(&url)
                .bearer_auth(&self.api_key)
                .send()
                .await
                .map_err(|e| AppError::ExternalApiError(format!("Crawl poll failed: {}", e)))?;
            read_json::<CrawlStatusResponse>(response, "Crawl").await
        };

        let body = self
            .breaker
            .call(request)
            .await
            .map_err(|e| flatten_breaker_error(e, "Crawl"))?;
        Ok(CrawlPoll {
            status: body.status,
            discovered_urls: body.links,
        })
    }
}

// ============================================================================
// Scrape
// ============================================================================

#[derive(Debug, Deserialize)]
struct ScrapeResponse {
    #[serde(default)]
    title: Option<String>,
    status_code: u16,
    #[serde(default)]
    markdown: Option<String>,
}

pub struct HttpScrapeService {
    client: Client,
    base_url: String,
    api_key: String,
    breaker: CollaboratorBreaker,
}

impl HttpScrapeService {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client("scrape")?,
            base_url: config.crawl_base_url.clone(),
            api_key: config.crawl_api_key.clone(),
            breaker: create_collaborator_circuit_breaker(),
        })
    }
}

#[async_trait]
impl ScrapeProvider for HttpScrapeService {
    async fn fetch(&self, page_url: &str) -> Result<FetchedPage, AppError> {
        let url = format!("{}/v1/scrape", self.base_url);
        tracing::debug!("Scraping {}", page_url);

        let request = async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&json!({ "url": page_url, "formats": ["markdown"] }))
                .send()
                .await
                .map_err(|e| AppError::ExternalApiError(format!("Scrape request failed: {}", e)))?;
            read_json::<ScrapeResponse>(response, "Scrape").await
        };

        let body = self
            .breaker
            .call(request)
            .await
            .map_err(|e| flatten_breaker_error(e, "Scrape"))?;
        Ok(FetchedPage {
            title: body.title,
            http_status: body.status_code,
            content: body.markdown,
        })
    }
}

// ============================================================================
// LLM
// ============================================================================

#[derive(Debug, Deserialize)]
struct TextResponse {
    text: String,
}

#[derive(Debug, Deserialize)]
struct StructuredResponse {
    object: Value,
}

pub struct HttpLlmService {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpLlmService {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client("LLM")?,
            base_url: config.llm_base_url.clone(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
        })
    }
}

#[async_trait]
impl LlmProvider for HttpLlmService {
    async fn generate_text(&self, thread: &str, prompt: &str) -> Result<String, AppError> {
        let url = format!("{}/v1/threads/{}/generate", self.base_url, thread);
        tracing::debug!("LLM text generation on thread {} ({} chars)", thread, prompt.len());

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "prompt": prompt }))
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("LLM request failed: {}", e)))?;

        let body: TextResponse = read_json(response, "LLM").await?;
        Ok(body.text)
    }

    async fn generate_structured(
        &self,
        thread: &str,
        prompt: &str,
        schema: &Value,
    ) -> Result<Value, AppError> {
        let url = format!("{}/v1/threads/{}/generate_structured", self.base_url, thread);
        tracing::debug!("LLM structured generation on thread {}", thread);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "prompt": prompt, "schema": schema }))
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("LLM request failed: {}", e)))?;

        // The provider reports objects that failed its own schema check as 422
        if response.status() == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            let detail = response
                .text()
                .await
                .unwrap_or_else(|_| "schema validation failed".to_string());
            return Err(AppError::SchemaError(detail));
        }

        let body: StructuredResponse = read_json(response, "LLM").await?;
        Ok(body.object)
    }
}

// ============================================================================
// Billing
// ============================================================================

pub struct HttpBillingService {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpBillingService {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client("billing")?,
            base_url: config.billing_base_url.clone(),
            api_key: config.billing_api_key.clone(),
        })
    }
}

#[async_trait]
impl BillingProvider for HttpBillingService {
    async fn check_allowance(
        &self,
        customer_id: &str,
        feature_id: &str,
    ) -> Result<Allowance, AppError> {
        // Build URL with proper parameter encoding
        let url = reqwest::Url::parse_with_params(
            &format!("{}/v1/check", self.base_url),
            &[("customer_id", customer_id), ("feature_id", feature_id)],
        )
        .map_err(|e| AppError::ExternalApiError(format!("Failed to build URL: {}", e)))?;

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Billing check failed: {}", e)))?;

        read_json(response, "Billing").await
    }

    async fn record_usage(
        &self,
        customer_id: &str,
        feature_id: &str,
        value: f64,
    ) -> Result<(), AppError> {
        let url = format!("{}/v1/usage", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "customer_id": customer_id,
                "feature_id": feature_id,
                "value": value,
            }))
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Usage tracking failed: {}", e)))?;

        // Any 2xx means the usage was recorded, whatever the body.
        ensure_success(response, "Billing").await?;
        Ok(())
    }
}
