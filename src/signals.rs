//! Qualification signals and fit scoring for sourced places.
//!
//! Everything here is pure: no I/O, no clock.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::models::PlaceRecord;

/// Ratings strictly below this are "low".
pub const LOW_RATING_THRESHOLD: f64 = 4.0;
/// A low rating only counts once the place has at least this many reviews.
pub const MIN_RATING_SAMPLE: u32 = 5;
/// Fewer reviews than this is "few reviews".
pub const FEW_REVIEWS_THRESHOLD: u32 = 10;
/// Minimum digits for a phone number to be dialable.
pub const MIN_PHONE_DIGITS: usize = 7;

/// Hosts that indicate a social or aggregator page instead of a real website.
pub const WEAK_PRESENCE_HOSTS: &[&str] = &[
    "facebook.com",
    "instagram.com",
    "twitter.com",
    "x.com",
    "linkedin.com",
    "yelp.com",
    "tripadvisor.com",
    "linktr.ee",
    "business.site",
    "yellowpages.com",
    "nextdoor.com",
    "google.com",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalName {
    MissingWebsite,
    WeakPresence,
    LowRating,
    FewReviews,
}

impl SignalName {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalName::MissingWebsite => "missing_website",
            SignalName::WeakPresence => "weak_presence",
            SignalName::LowRating => "low_rating",
            SignalName::FewReviews => "few_reviews",
        }
    }

    fn describe(self) -> &'static str {
        match self {
            SignalName::MissingWebsite => "no website",
            SignalName::WeakPresence => "only a social or directory page",
            SignalName::LowRating => "a low rating across a meaningful number of reviews",
            SignalName::FewReviews => "very few reviews",
        }
    }
}

/// Lower-cased host with a leading `www.` removed. Used only for dedup.
///
/// Scheme-less input such as `Example.com/about` is accepted.
pub fn canonical_domain(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let parsed = url::Url::parse(&candidate).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    let host = host.trim_end_matches('.');
    if host.is_empty() || !host.contains('.') {
        return None;
    }
    Some(host.to_string())
}

/// True when `domain` is a social or directory host shared by many businesses.
pub fn is_weak_presence_host(domain: &str) -> bool {
    WEAK_PRESENCE_HOSTS
        .iter()
        .any(|deny| domain == *deny || domain.ends_with(&format!(".{}", deny)))
}

/// Evaluates every signal rule independently.
pub fn detect_signals(place: &PlaceRecord) -> BTreeSet<SignalName> {
    let mut signals = BTreeSet::new();

    let website = place
        .website
        .as_deref()
        .map(str::trim)
        .filter(|w| !w.is_empty());
    match website {
        None => {
            signals.insert(SignalName::MissingWebsite);
        }
        Some(site) => {
            if canonical_domain(site).is_some_and(|d| is_weak_presence_host(&d)) {
                signals.insert(SignalName::WeakPresence);
            }
        }
    }

    let reviews = place.review_count.unwrap_or(0);
    if let Some(rating) = place.rating {
        if rating < LOW_RATING_THRESHOLD && reviews >= MIN_RATING_SAMPLE {
            signals.insert(SignalName::LowRating);
        }
    }
    if reviews < FEW_REVIEWS_THRESHOLD {
        signals.insert(SignalName::FewReviews);
    }

    signals
}

/// Fraction of the agency's own criteria that the signals satisfy.
pub fn score(signals: &BTreeSet<SignalName>, criteria: &[SignalName]) -> f64 {
    let wanted: BTreeSet<SignalName> = criteria.iter().copied().collect();
    if wanted.is_empty() {
        return 0.0;
    }
    let matched = wanted.intersection(signals).count();
    matched as f64 / wanted.len() as f64
}

/// Human-readable reason built from the matched criteria.
pub fn fit_reason(signals: &BTreeSet<SignalName>, criteria: &[SignalName]) -> Option<String> {
    let wanted: BTreeSet<SignalName> = criteria.iter().copied().collect();
    let matched: Vec<&str> = wanted
        .intersection(signals)
        .map(|s| s.describe())
        .collect();
    if matched.is_empty() {
        None
    } else {
        Some(format!("Matches agency criteria: {}", matched.join("; ")))
    }
}

/// Leads without a dialable phone are dropped before scoring.
pub fn passes_hard_filter(place: &PlaceRecord) -> bool {
    place
        .phone
        .as_deref()
        .map(|p| p.chars().filter(|c| c.is_ascii_digit()).count() >= MIN_PHONE_DIGITS)
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct QualifiedLead {
    pub place: PlaceRecord,
    pub signals: BTreeSet<SignalName>,
    pub score: f64,
    pub fit_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct QualifyReport {
    /// Kept leads, best score first. Ties keep source order.
    pub kept: Vec<QualifiedLead>,
    pub dropped: usize,
}

/// Hard-filters, scores and ranks a batch of sourced places.
pub fn qualify(places: &[PlaceRecord], criteria: &[SignalName]) -> QualifyReport {
    let mut report = QualifyReport::default();
    for place in places {
        if !passes_hard_filter(place) {
            tracing::debug!("Dropping {} ({}): no usable phone", place.name, place.external_id);
            report.dropped += 1;
            continue;
        }
        let signals = detect_signals(place);
        report.kept.push(QualifiedLead {
            score: score(&signals, criteria),
            fit_reason: fit_reason(&signals, criteria),
            place: place.clone(),
            signals,
        });
    }
    report
        .kept
        .sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    report
}
