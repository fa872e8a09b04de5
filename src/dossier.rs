//! Dossier schema, validation and the deterministic fallback.

use chrono::Utc;
use regex::Regex;
use std::sync::LazyLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{AuditJob, Dossier, Opportunity, PageContent};
use crate::signals::SignalName;

pub const MIN_GAPS: usize = 2;
pub const MAX_GAPS: usize = 5;
pub const MIN_TALKING_POINTS: usize = 2;
pub const MAX_TALKING_POINTS: usize = 4;

/// Characters of each page handed to the model.
const PAGE_EXCERPT_CHARS: usize = 4_000;

/// JSON schema handed to the structured-generation call.
pub fn dossier_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["summary", "gaps", "talking_points", "fit_rationale"],
        "properties": {
            "summary": { "type": "string", "minLength": 1 },
            "gaps": {
                "type": "array",
                "items": { "type": "string", "minLength": 1 },
                "minItems": MIN_GAPS,
                "maxItems": MAX_GAPS
            },
            "talking_points": {
                "type": "array",
                "items": { "type": "string", "minLength": 1 },
                "minItems": MIN_TALKING_POINTS,
                "maxItems": MAX_TALKING_POINTS
            },
            "contact_email": { "type": ["string", "null"], "format": "email" },
            "fit_rationale": { "type": "string", "minLength": 1 }
        }
    })
}

/// Dossier body before it is attached to an audit job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DossierDraft {
    pub summary: String,
    pub gaps: Vec<String>,
    pub talking_points: Vec<String>,
    #[serde(default)]
    pub contact_email: Option<String>,
    pub fit_rationale: String,
}

impl DossierDraft {
    /// Parses and validates a model response.
    pub fn from_value(value: Value) -> Result<Self, AppError> {
        let draft: DossierDraft = serde_json::from_value(value)
            .map_err(|e| AppError::SchemaError(format!("dossier shape: {}", e)))?;
        draft.validate()?;
        Ok(draft)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.summary.trim().is_empty() {
            return Err(AppError::SchemaError("summary: empty".into()));
        }
        if self.fit_rationale.trim().is_empty() {
            return Err(AppError::SchemaError("fit_rationale: empty".into()));
        }
        check_items("gaps", &self.gaps, MIN_GAPS, MAX_GAPS)?;
        check_items(
            "talking_points",
            &self.talking_points,
            MIN_TALKING_POINTS,
            MAX_TALKING_POINTS,
        )?;
        if let Some(email) = &self.contact_email {
            if !is_valid_email(email) {
                return Err(AppError::SchemaError(format!(
                    "contact_email: invalid format '{}'",
                    email
                )));
            }
        }
        Ok(())
    }

    pub fn into_dossier(self, job: &AuditJob, fallback: bool) -> Dossier {
        Dossier {
            id: Uuid::new_v4(),
            audit_job_id: job.id,
            opportunity_id: job.opportunity_id,
            summary: self.summary,
            gaps: self.gaps,
            talking_points: self.talking_points,
            contact_email: self.contact_email,
            fit_rationale: self.fit_rationale,
            fallback,
            created_at: Utc::now(),
        }
    }
}

fn check_items(field: &str, items: &[String], min: usize, max: usize) -> Result<(), AppError> {
    if items.len() < min || items.len() > max {
        return Err(AppError::SchemaError(format!(
            "{}: expected {}-{} items, got {}",
            field,
            min,
            max,
            items.len()
        )));
    }
    if items.iter().any(|item| item.trim().is_empty()) {
        return Err(AppError::SchemaError(format!("{}: empty item", field)));
    }
    Ok(())
}

// RFC 5322 simplified: local@domain.tld
static EMAIL_REGEX: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$",
    )
    .ok()
});

static EMAIL_FINDER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").ok());

/// Validate email address
///
/// Checks for:
/// - Basic email format (contains @ and .)
/// - Placeholder patterns (noreply addresses, repeated digits)
/// - Valid domain structure
pub fn is_valid_email(email: &str) -> bool {
    if email.len() < 5 || !email.contains('@') || !email.contains('.') {
        return false;
    }

    let placeholder_patterns = ["example.com", "noreply", "no-reply", "000000", "111111"];
    let lowered = email.to_lowercase();
    if placeholder_patterns.iter().any(|p| lowered.contains(p)) {
        tracing::debug!("Rejected placeholder email: {}", email);
        return false;
    }

    EMAIL_REGEX.as_ref().is_some_and(|re| re.is_match(email))
}

/// Best-guess contact address from scraped pages, preferring the business's own domain.
pub fn extract_contact_email(pages: &[PageContent], domain: Option<&str>) -> Option<String> {
    let finder = EMAIL_FINDER.as_ref()?;

    let candidates: Vec<String> = pages
        .iter()
        .flat_map(|page| finder.find_iter(&page.content).map(|m| m.as_str().to_lowercase()))
        .map(|email| email.trim_end_matches('.').to_string())
        .filter(|email| is_valid_email(email))
        .collect();

    if let Some(domain) = domain {
        let on_domain = candidates
            .iter()
            .find(|email| email.ends_with(&format!("@{}", domain)));
        if on_domain.is_some() {
            return on_domain.cloned();
        }
    }
    candidates.into_iter().next()
}

fn signal_gap(signal: SignalName) -> &'static str {
    match signal {
        SignalName::MissingWebsite => "No website listed, so search traffic has nowhere to land",
        SignalName::WeakPresence => {
            "Web presence relies on a social or directory page instead of an owned site"
        }
        SignalName::LowRating => "Public rating is below 4 stars across a meaningful sample",
        SignalName::FewReviews => "Very few public reviews compared to local competitors",
    }
}

/// Deterministic dossier built only from fields the pipeline already holds.
pub fn fallback_draft(opportunity: &Opportunity, pages: &[PageContent]) -> DossierDraft {
    let mut summary = format!(
        "{} is a {} business in {}",
        opportunity.name, opportunity.vertical, opportunity.geography
    );
    if let Some(rating) = opportunity.rating {
        summary.push_str(&format!(
            ", rated {:.1} from {} reviews",
            rating,
            opportunity.review_count.unwrap_or(0)
        ));
    }
    summary.push('.');

    let mut gaps: Vec<String> = opportunity
        .signals
        .iter()
        .map(|s| signal_gap(*s).to_string())
        .take(MAX_GAPS)
        .collect();
    for generic in [
        "No clear call to action for booking or contact found",
        "Online reputation is not actively managed",
    ] {
        if gaps.len() >= MIN_GAPS {
            break;
        }
        gaps.push(generic.to_string());
    }

    let talking_points = vec![
        format!(
            "How {} currently wins new customers in {}",
            opportunity.name, opportunity.geography
        ),
        format!(
            "What a stronger online presence could add for a {} business",
            opportunity.vertical
        ),
    ];

    let fit_rationale = opportunity.fit_reason.clone().unwrap_or_else(|| {
        format!(
            "Qualification score {:.2} from public listing data",
            opportunity.qualification_score
        )
    });

    DossierDraft {
        summary,
        gaps,
        talking_points,
        contact_email: extract_contact_email(pages, opportunity.domain.as_deref()),
        fit_rationale,
    }
}

pub fn dossier_prompt(opportunity: &Opportunity, pages: &[PageContent]) -> String {
    let signals: Vec<&str> = opportunity.signals.iter().map(|s| s.as_str()).collect();
    let mut prompt = format!(
        "Write a sales research dossier for {name}, a {vertical} business in {geo}.\n\
         Website: {site}\nRating: {rating}\nReviews: {reviews}\nDetected signals: {signals}\n\
         Return a summary, {min_g}-{max_g} concrete gaps, {min_t}-{max_t} talking points, \
         the best contact email if one appears in the pages, and a one-sentence fit rationale.\n",
        name = opportunity.name,
        vertical = opportunity.vertical,
        geo = opportunity.geography,
        site = opportunity.website.as_deref().unwrap_or("none"),
        rating = opportunity
            .rating
            .map(|r| format!("{:.1}", r))
            .unwrap_or_else(|| "unknown".into()),
        reviews = opportunity.review_count.unwrap_or(0),
        signals = if signals.is_empty() {
            "none".to_string()
        } else {
            signals.join(", ")
        },
        min_g = MIN_GAPS,
        max_g = MAX_GAPS,
        min_t = MIN_TALKING_POINTS,
        max_t = MAX_TALKING_POINTS,
    );

    for page in pages {
        let excerpt: String = page.content.chars().take(PAGE_EXCERPT_CHARS).collect();
        prompt.push_str(&format!("\n--- {} ---\n{}\n", page.url, excerpt));
    }
    prompt
}
