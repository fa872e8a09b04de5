//! Per-opportunity audit: discover pages, pick the useful ones, scrape them and
//! synthesize a dossier.
//!
//! Every step records its outputs on the audit job before marking its phase
//! complete, so a replayed audit skips straight to the first unfinished phase.

use chrono::Utc;
use futures::future::join_all;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::billing::{is_pause_signal, BillingGate, Feature, GateOutcome, PauseSignal};
use crate::config::AuditSettings;
use crate::dossier::{dossier_prompt, dossier_schema, fallback_draft, DossierDraft};
use crate::errors::AppError;
use crate::ledger::UsageLedger;
use crate::models::{
    AuditJob, AuditStatus, Opportunity, OpportunityStatus, PageContent, StepFailure,
};
use crate::phases::{reset_from, update_audit_phase, AuditPhase, LeadPhase, PhaseName, PhaseUpdate};
use crate::retry::RetryPolicies;
use crate::services::{CrawlProvider, CrawlStatus, LlmProvider, ScrapeProvider};
use crate::store::{require_audit_job, require_opportunity, FlowStore};

/// Path fragments of pages likely to help a sales conversation, best first.
pub const PAGE_KEYWORDS: &[&str] = &[
    "contact", "about", "team", "services", "pricing", "book", "location", "testimonials",
    "reviews", "faq",
];

/// Path fragments that suggest a contact email is on the page.
const CONTACT_KEYWORDS: &[&str] = &["contact", "about", "team"];

#[derive(Debug, Clone, PartialEq)]
pub enum AuditOutcome {
    Completed { dossier_id: Uuid, fallback: bool },
    Failed { phase: AuditPhase, message: String },
    Paused(PauseSignal),
}

/// Result of a single step: either carry on or stop the audit with an outcome.
enum Step<T> {
    Continue(T),
    Stop(AuditOutcome),
}

pub struct AuditPipeline {
    store: Arc<dyn FlowStore>,
    crawl: Arc<dyn CrawlProvider>,
    scrape: Arc<dyn ScrapeProvider>,
    llm: Arc<dyn LlmProvider>,
    gate: Arc<BillingGate>,
    ledger: Arc<UsageLedger>,
    settings: AuditSettings,
    retry: RetryPolicies,
}

impl AuditPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn FlowStore>,
        crawl: Arc<dyn CrawlProvider>,
        scrape: Arc<dyn ScrapeProvider>,
        llm: Arc<dyn LlmProvider>,
        gate: Arc<BillingGate>,
        ledger: Arc<UsageLedger>,
        settings: AuditSettings,
        retry: RetryPolicies,
    ) -> Self {
        Self {
            store,
            crawl,
            scrape,
            llm,
            gate,
            ledger,
            settings,
            retry,
        }
    }

    /// Drives one audit job to a terminal state or a pause.
    ///
    /// `Err` is reserved for store failures; collaborator failures end the
    /// audit as `Failed` and leave the opportunity at `DATA_READY`.
    pub async fn run(&self, audit_id: Uuid, customer_id: &str) -> Result<AuditOutcome, AppError> {
        let job = require_audit_job(self.store.as_ref(), audit_id).await?;
        if job.status == AuditStatus::Completed {
            if let Some(dossier) = self.store.get_dossier_for_audit(audit_id).await? {
                return Ok(AuditOutcome::Completed {
                    dossier_id: dossier.id,
                    fallback: dossier.fallback,
                });
            }
        }

        let opportunity = require_opportunity(self.store.as_ref(), job.opportunity_id).await?;
        let job = self
            .store
            .mutate_audit_job(audit_id, &|job: &mut AuditJob| {
                job.status = AuditStatus::Running;
                job.last_error = None;
            })
            .await?;

        tracing::info!(
            "🔎 Auditing {} ({}) for opportunity {}",
            job.target_url,
            job.id,
            opportunity.name
        );

        if !job.phase_done(AuditPhase::MapUrls) {
            if let Step::Stop(outcome) = self.map_urls(&job).await? {
                return Ok(outcome);
            }
        }

        let job = require_audit_job(self.store.as_ref(), audit_id).await?;
        if !job.phase_done(AuditPhase::FilterUrls) {
            if let Step::Stop(outcome) = self.filter_urls(&job, &opportunity).await? {
                return Ok(outcome);
            }
        }

        let job = require_audit_job(self.store.as_ref(), audit_id).await?;
        if !job.phase_done(AuditPhase::ScrapeContent) {
            if let Step::Stop(outcome) = self.scrape_content(&job).await? {
                return Ok(outcome);
            }
        }

        let job = require_audit_job(self.store.as_ref(), audit_id).await?;
        match self.generate_dossier(&job, &opportunity, customer_id).await? {
            Step::Continue(outcome) | Step::Stop(outcome) => Ok(outcome),
        }
    }

    // ------------------------------------------------------------------------
    // map_urls
    // ------------------------------------------------------------------------

    async fn map_urls(&self, job: &AuditJob) -> Result<Step<()>, AppError> {
        let phase = AuditPhase::MapUrls;
        update_audit_phase(
            self.store.as_ref(),
            job.id,
            PhaseUpdate::running(phase).with_event(format!("Discovering pages on {}", job.target_url)),
        )
        .await?;

        let urls = match self.discover(job).await {
            Ok(urls) => urls,
            Err(e) => return self.fail(job, phase, e).await.map(Step::Stop),
        };

        let count = urls.len();
        self.store
            .mutate_audit_job(job.id, &|job: &mut AuditJob| {
                job.discovered_urls = urls.clone();
            })
            .await?;
        update_audit_phase(
            self.store.as_ref(),
            job.id,
            PhaseUpdate::complete(phase).with_event(format!("Discovered {} pages", count)),
        )
        .await?;
        Ok(Step::Continue(()))
    }

    async fn discover(&self, job: &AuditJob) -> Result<Vec<String>, AppError> {
        let root = job.target_url.as_str();
        let limit = self.settings.crawl_url_limit;
        let handle = self
            .retry
            .content_fetch
            .run("start crawl", || self.crawl.start_discovery(root, limit as u32))
            .await?;

        let started = tokio::time::Instant::now();
        let deadline = started + self.settings.crawl_timeout;
        let discovered = loop {
            let poll = self
                .retry
                .content_fetch
                .run("poll crawl", || self.crawl.poll(&handle))
                .await?;
            match poll.status {
                CrawlStatus::Completed => break poll.discovered_urls,
                CrawlStatus::Failed => {
                    return Err(AppError::ExternalApiError(format!(
                        "Crawl job {} failed for {}",
                        handle, root
                    )))
                }
                CrawlStatus::Running => {}
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(AppError::ExternalApiError(format!(
                    "Crawl job {} exceeded {:?} for {}",
                    handle, self.settings.crawl_timeout, root
                )));
            }
            let elapsed = (now - started).as_secs_f64();
            let fraction = elapsed / self.settings.crawl_timeout.as_secs_f64().max(f64::EPSILON);
            update_audit_phase(
                self.store.as_ref(),
                job.id,
                PhaseUpdate::progress(AuditPhase::MapUrls, (fraction * 0.9).min(0.9)),
            )
            .await?;
            tokio::time::sleep(self.settings.poll_interval).await;
        };

        Ok(with_root_first(root, discovered, limit))
    }

    // ------------------------------------------------------------------------
    // filter_urls
    // ------------------------------------------------------------------------

    async fn filter_urls(
        &self,
        job: &AuditJob,
        opportunity: &Opportunity,
    ) -> Result<Step<()>, AppError> {
        let phase = AuditPhase::FilterUrls;
        update_audit_phase(
            self.store.as_ref(),
            job.id,
            PhaseUpdate::running(phase).with_event("Ranking pages"),
        )
        .await?;

        let prompt = ranking_prompt(opportunity, &job.discovered_urls);
        let ranked = match self
            .retry
            .ai_generation
            .run("rank pages", || self.llm.generate_text(&job.thread_id, &prompt))
            .await
            .and_then(|text| parse_ranked_urls(&text, &job.discovered_urls))
        {
            Ok(ranked) => ranked,
            Err(e) => {
                tracing::warn!(
                    "⚠ Page ranking for audit {} fell back to keywords: {}",
                    job.id,
                    e
                );
                heuristic_rank(&job.discovered_urls)
            }
        };

        let selected = select_pages(&job.target_url, &ranked, self.settings.pages_per_audit);
        let count = selected.len();
        self.store
            .mutate_audit_job(job.id, &|job: &mut AuditJob| {
                job.selected_urls = selected.clone();
            })
            .await?;
        update_audit_phase(
            self.store.as_ref(),
            job.id,
            PhaseUpdate::complete(phase).with_event(format!("Selected {} pages", count)),
        )
        .await?;
        Ok(Step::Continue(()))
    }

    // ------------------------------------------------------------------------
    // scrape_content
    // ------------------------------------------------------------------------

    async fn scrape_content(&self, job: &AuditJob) -> Result<Step<()>, AppError> {
        let phase = AuditPhase::ScrapeContent;
        update_audit_phase(
            self.store.as_ref(),
            job.id,
            PhaseUpdate::running(phase).with_event(format!("Fetching {} pages", job.selected_urls.len())),
        )
        .await?;

        let chunk_size = self.settings.scrape_concurrency.max(1);
        let total_chunks = job.selected_urls.len().div_ceil(chunk_size).max(1);
        let mut refs = Vec::new();

        for (index, chunk) in job.selected_urls.chunks(chunk_size).enumerate() {
            if index > 0 && !self.settings.scrape_batch_delay.is_zero() {
                tokio::time::sleep(self.settings.scrape_batch_delay).await;
            }

            let fetches = chunk.iter().map(|url| async move {
                let result = self
                    .retry
                    .content_fetch
                    .run("fetch page", || self.scrape.fetch(url))
                    .await;
                (url, result)
            });

            for (url, result) in join_all(fetches).await {
                match result {
                    Ok(page) => match page.content.filter(|c| !c.trim().is_empty()) {
                        Some(content) => {
                            let stored = PageContent {
                                content_ref: content_ref(&content),
                                audit_job_id: job.id,
                                url: url.clone(),
                                title: page.title,
                                http_status: page.http_status,
                                content,
                                created_at: Utc::now(),
                            };
                            self.store.store_page(&stored).await?;
                            refs.push(stored.content_ref);
                        }
                        None => tracing::warn!(
                            "⚠ {} returned no content (status {})",
                            url,
                            page.http_status
                        ),
                    },
                    Err(e) => tracing::warn!("⚠ Skipping {} for audit {}: {}", url, job.id, e),
                }
            }

            update_audit_phase(
                self.store.as_ref(),
                job.id,
                PhaseUpdate::progress(phase, (index + 1) as f64 / total_chunks as f64),
            )
            .await?;
        }

        if refs.is_empty() {
            let err = AppError::ExternalApiError(format!(
                "None of {} selected pages could be fetched",
                job.selected_urls.len()
            ));
            return self.fail(job, phase, err).await.map(Step::Stop);
        }

        let count = refs.len();
        self.store
            .mutate_audit_job(job.id, &|job: &mut AuditJob| {
                job.page_refs = refs.clone();
            })
            .await?;
        update_audit_phase(
            self.store.as_ref(),
            job.id,
            PhaseUpdate::complete(phase).with_event(format!("Fetched {} pages", count)),
        )
        .await?;
        Ok(Step::Continue(()))
    }

    // ------------------------------------------------------------------------
    // generate_dossier
    // ------------------------------------------------------------------------

    async fn generate_dossier(
        &self,
        job: &AuditJob,
        opportunity: &Opportunity,
        customer_id: &str,
    ) -> Result<Step<AuditOutcome>, AppError> {
        let phase = AuditPhase::GenerateDossier;

        if let GateOutcome::Paused(signal) = self
            .gate
            .check_and_pause(
                job.flow_id,
                customer_id,
                Feature::DossierGeneration,
                LeadPhase::GenerateDossier,
                Some(job.id),
            )
            .await?
        {
            self.requeue(job.id).await?;
            return Ok(Step::Stop(AuditOutcome::Paused(signal)));
        }

        update_audit_phase(
            self.store.as_ref(),
            job.id,
            PhaseUpdate::running(phase).with_event("Writing dossier"),
        )
        .await?;

        let (dossier_id, fallback) = match self.store.get_dossier_for_audit(job.id).await? {
            Some(existing) => (existing.id, existing.fallback),
            None => {
                let pages = self.store.list_pages(job.id).await?;
                let (draft, fallback) = match self.draft_dossier(job, opportunity, &pages).await {
                    Ok(draft) => (draft, false),
                    Err(e) => {
                        tracing::warn!(
                            "⚠ Dossier generation for audit {} failed, using fallback: {}",
                            job.id,
                            e
                        );
                        (fallback_draft(opportunity, &pages), true)
                    }
                };
                let dossier = draft.into_dossier(job, fallback);
                self.store.insert_dossier(&dossier).await?;
                (dossier.id, fallback)
            }
        };

        self.store
            .mutate_audit_job(job.id, &|job: &mut AuditJob| {
                job.dossier_id = Some(dossier_id);
            })
            .await?;

        if let Err(e) = self.ledger.charge_dossier(job.id, customer_id).await {
            // Reconciled by the orchestrator after the audit returns.
            tracing::warn!("⚠ Charging dossier for audit {} failed: {}", job.id, e);
        }

        update_audit_phase(
            self.store.as_ref(),
            job.id,
            PhaseUpdate::complete(phase).with_event(if fallback {
                "Dossier ready (fallback)"
            } else {
                "Dossier ready"
            }),
        )
        .await?;
        self.store
            .mutate_audit_job(job.id, &|job: &mut AuditJob| {
                job.status = AuditStatus::Completed;
            })
            .await?;
        self.store
            .update_opportunity_status(opportunity.id, OpportunityStatus::Ready)
            .await?;

        tracing::info!(
            "✓ Audit {} completed for {} (dossier {}{})",
            job.id,
            opportunity.name,
            dossier_id,
            if fallback { ", fallback" } else { "" }
        );
        Ok(Step::Continue(AuditOutcome::Completed {
            dossier_id,
            fallback,
        }))
    }

    async fn draft_dossier(
        &self,
        job: &AuditJob,
        opportunity: &Opportunity,
        pages: &[PageContent],
    ) -> Result<DossierDraft, AppError> {
        let prompt = dossier_prompt(opportunity, pages);
        let schema = dossier_schema();
        let value = self
            .retry
            .ai_generation
            .run("generate dossier", || {
                self.llm.generate_structured(&job.thread_id, &prompt, &schema)
            })
            .await?;
        DossierDraft::from_value(value)
    }

    /// Puts a paused job back in the queue with its dossier phase reset.
    async fn requeue(&self, audit_id: Uuid) -> Result<(), AppError> {
        self.store
            .mutate_audit_job(audit_id, &|job: &mut AuditJob| {
                job.status = AuditStatus::Queued;
                reset_from(&mut job.phases, AuditPhase::GenerateDossier);
            })
            .await?;
        Ok(())
    }

    /// Rebuilds a pause that lost its type, from the block stored on the flow.
    async fn recover_signal(&self, job: &AuditJob) -> Result<PauseSignal, AppError> {
        let flow = self.store.get_flow(job.flow_id).await?;
        Ok(match flow.as_ref().and_then(|f| f.billing_block()) {
            Some(block) => PauseSignal {
                flow_id: job.flow_id,
                feature_id: block.feature_id.clone(),
                phase: block.phase,
                audit_job_id: block.related_audit_job_id,
            },
            None => PauseSignal {
                flow_id: job.flow_id,
                feature_id: Feature::DossierGeneration.id().to_string(),
                phase: LeadPhase::GenerateDossier,
                audit_job_id: Some(job.id),
            },
        })
    }

    /// Records a step failure on the job and downgrades the opportunity.
    async fn fail(
        &self,
        job: &AuditJob,
        phase: AuditPhase,
        err: AppError,
    ) -> Result<AuditOutcome, AppError> {
        if is_pause_signal(&err) {
            // The flow was already paused by whoever raised the signal.
            self.requeue(job.id).await?;
            let signal = match err {
                AppError::Paused(signal) => signal,
                _ => self.recover_signal(job).await?,
            };
            return Ok(AuditOutcome::Paused(signal));
        }

        let message = err.to_string();
        tracing::error!(
            "✗ Audit {} failed at {}: {}",
            job.id,
            phase.as_str(),
            message
        );
        update_audit_phase(
            self.store.as_ref(),
            job.id,
            PhaseUpdate::failed(phase, message.clone()).with_event(format!("Failed: {}", message)),
        )
        .await?;
        let failure = StepFailure::from(&err);
        self.store
            .mutate_audit_job(job.id, &|job: &mut AuditJob| {
                job.status = AuditStatus::Error;
                job.last_error = Some(failure.clone());
            })
            .await?;
        self.store
            .update_opportunity_status(job.opportunity_id, OpportunityStatus::DataReady)
            .await?;
        Ok(AuditOutcome::Failed { phase, message })
    }
}

/// SHA-256 hex digest of the page content.
pub fn content_ref(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// Root first, duplicates removed, truncated to `limit`.
fn with_root_first(root: &str, urls: Vec<String>, limit: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    std::iter::once(root.to_string())
        .chain(urls)
        .filter(|url| seen.insert(normalize_url(url)))
        .take(limit.max(1))
        .collect()
}

fn ranking_prompt(opportunity: &Opportunity, urls: &[String]) -> String {
    format!(
        "You are preparing a sales call with {} ({} in {}). Rank these pages by how useful \
         they are for understanding the business and finding a contact email. Reply with a \
         JSON array of URLs only, best first.\n{}",
        opportunity.name,
        opportunity.vertical,
        opportunity.geography,
        urls.join("\n")
    )
}

/// Extracts the JSON array from a model reply, keeping only discovered URLs.
pub fn parse_ranked_urls(text: &str, discovered: &[String]) -> Result<Vec<String>, AppError> {
    let start = text
        .find('[')
        .ok_or_else(|| AppError::SchemaError("no JSON array in ranking reply".into()))?;
    let end = text
        .rfind(']')
        .filter(|end| *end > start)
        .ok_or_else(|| AppError::SchemaError("unterminated JSON array in ranking reply".into()))?;
    let urls: Vec<String> = serde_json::from_str(&text[start..=end])
        .map_err(|e| AppError::SchemaError(format!("ranking reply: {}", e)))?;

    let known: HashSet<String> = discovered.iter().map(|u| normalize_url(u)).collect();
    let ranked: Vec<String> = urls
        .into_iter()
        .filter(|url| known.contains(&normalize_url(url)))
        .collect();
    if ranked.is_empty() {
        return Err(AppError::SchemaError(
            "ranking reply named no discovered URL".into(),
        ));
    }
    Ok(ranked)
}

fn keyword_rank(url: &str) -> usize {
    let lowered = url.to_lowercase();
    PAGE_KEYWORDS
        .iter()
        .position(|k| lowered.contains(k))
        .unwrap_or(PAGE_KEYWORDS.len())
}

/// Orders discovered URLs by the first marketing keyword they contain.
pub fn heuristic_rank(discovered: &[String]) -> Vec<String> {
    let mut ranked: Vec<String> = discovered.to_vec();
    ranked.sort_by_key(|url| keyword_rank(url));
    ranked
}

fn is_contact_like(url: &str) -> bool {
    let lowered = url.to_lowercase();
    CONTACT_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Homepage first, then contact-like pages, then the rest in ranked order.
pub fn select_pages(root: &str, ranked: &[String], limit: usize) -> Vec<String> {
    let root_key = normalize_url(root);
    let (contact, other): (Vec<&String>, Vec<&String>) = ranked
        .iter()
        .filter(|url| normalize_url(url) != root_key)
        .partition(|url| is_contact_like(url));

    let mut seen = HashSet::new();
    std::iter::once(root.to_string())
        .chain(contact.into_iter().cloned())
        .chain(other.into_iter().cloned())
        .filter(|url| seen.insert(normalize_url(url)))
        .take(limit.max(1))
        .collect()
}
