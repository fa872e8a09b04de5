use serde::Deserialize;
use std::time::Duration;

use crate::retry::RetryPolicies;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Absent means the in-memory store.
    pub database_url: Option<String>,
    pub port: u16,
    pub search_base_url: String,
    pub search_api_key: String,
    pub crawl_base_url: String,
    pub crawl_api_key: String,
    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub billing_base_url: String,
    pub billing_api_key: String,
    pub max_leads_per_flow: u32,
    pub places_snapshot_limit: usize,
    pub crawl_url_limit: usize,
    pub crawl_timeout_secs: u64,
    pub crawl_poll_interval_ms: u64,
    pub pages_per_audit: usize,
    pub scrape_concurrency: usize,
    pub scrape_batch_delay_ms: u64,
}

/// Tuning knobs for the audit sub-pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditSettings {
    pub crawl_url_limit: usize,
    pub crawl_timeout: Duration,
    pub poll_interval: Duration,
    pub pages_per_audit: usize,
    pub scrape_concurrency: usize,
    pub scrape_batch_delay: Duration,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            crawl_url_limit: 50,
            crawl_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(2000),
            pages_per_audit: 4,
            scrape_concurrency: 2,
            scrape_batch_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowSettings {
    pub max_leads_per_flow: u32,
    pub places_snapshot_limit: usize,
    pub retry: RetryPolicies,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_leads_per_flow: 100,
            places_snapshot_limit: 20,
            retry: RetryPolicies::default(),
        }
    }
}

fn required(name: &str) -> anyhow::Result<String> {
    std::env::var(name)
        .map_err(|_| anyhow::anyhow!("{} environment variable required", name))
        .and_then(|value| {
            if value.trim().is_empty() {
                anyhow::bail!("{} cannot be empty", name);
            }
            Ok(value)
        })
}

fn required_url(name: &str) -> anyhow::Result<String> {
    required(name).and_then(|url| {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            anyhow::bail!("{} must start with http:// or https://", name);
        }
        Ok(url.trim_end_matches('/').to_string())
    })
}

/// First 20 characters of a URL, for logs that must not show credentials in full.
fn url_prefix(url: &str) -> String {
    url.chars().take(20).collect()
}

fn number<T: std::str::FromStr>(name: &str, default: T, min: T) -> anyhow::Result<T>
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    let value = match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("{} must be a valid number", name))?,
        _ => default,
    };
    if value < min {
        anyhow::bail!("{} must be at least {}", name, min);
    }
    Ok(value)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = match std::env::var("DB_URL").or_else(|_| std::env::var("DATABASE_URL"))
        {
            Ok(url) if !url.trim().is_empty() => {
                if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                    anyhow::bail!("DB_URL must start with postgresql:// or postgres://");
                }
                Some(url)
            }
            _ => None,
        };

        let config = Self {
            database_url,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            search_base_url: required_url("SEARCH_BASE_URL")?,
            search_api_key: required("SEARCH_API_KEY")?,
            crawl_base_url: required_url("CRAWL_BASE_URL")?,
            crawl_api_key: required("CRAWL_API_KEY")?,
            llm_base_url: required_url("LLM_BASE_URL")?,
            llm_api_key: required("LLM_API_KEY")?,
            llm_model: std::env::var("LLM_MODEL")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "default".to_string()),
            billing_base_url: required_url("BILLING_BASE_URL")?,
            billing_api_key: required("BILLING_API_KEY")?,
            max_leads_per_flow: number("MAX_LEADS_PER_FLOW", 100, 1)?,
            places_snapshot_limit: number("PLACES_SNAPSHOT_LIMIT", 20, 0)?,
            crawl_url_limit: number("CRAWL_URL_LIMIT", 50, 1)?,
            crawl_timeout_secs: number("CRAWL_TIMEOUT_SECS", 120, 1)?,
            crawl_poll_interval_ms: number("CRAWL_POLL_INTERVAL_MS", 2000, 10)?,
            pages_per_audit: number("PAGES_PER_AUDIT", 4, 1)?,
            scrape_concurrency: number("SCRAPE_CONCURRENCY", 2, 1)?,
            scrape_batch_delay_ms: number("SCRAPE_BATCH_DELAY_MS", 500, 0)?,
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        match config.database_url {
            Some(ref url) => tracing::debug!("Database URL: {}...", url_prefix(url)),
            None => tracing::warn!("⚠ No DATABASE_URL set, flows are kept in memory only"),
        }
        tracing::debug!("Search Base URL: {}", config.search_base_url);
        tracing::debug!("Crawl Base URL: {}", config.crawl_base_url);
        tracing::debug!("LLM Base URL: {} (model {})", config.llm_base_url, config.llm_model);
        tracing::debug!("Billing Base URL: {}", config.billing_base_url);
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }

    pub fn audit_settings(&self) -> AuditSettings {
        AuditSettings {
            crawl_url_limit: self.crawl_url_limit,
            crawl_timeout: Duration::from_secs(self.crawl_timeout_secs),
            poll_interval: Duration::from_millis(self.crawl_poll_interval_ms),
            pages_per_audit: self.pages_per_audit,
            scrape_concurrency: self.scrape_concurrency,
            scrape_batch_delay: Duration::from_millis(self.scrape_batch_delay_ms),
        }
    }

    pub fn workflow_settings(&self) -> WorkflowSettings {
        WorkflowSettings {
            max_leads_per_flow: self.max_leads_per_flow,
            places_snapshot_limit: self.places_snapshot_limit,
            retry: RetryPolicies::default(),
        }
    }
}
