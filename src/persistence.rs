//! Upserts qualified leads as opportunities, deduplicated by external id and
//! by `(agency, canonical domain)`.

use chrono::Utc;
use phonenumber::country::Id as CountryId;
use phonenumber::Mode;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{Campaign, Opportunity, OpportunityStatus};
use crate::signals::{canonical_domain, is_weak_presence_host, QualifiedLead};
use crate::store::FlowStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub created: usize,
    pub skipped: usize,
}

/// Normalize a listing phone number to E.164.
///
/// Numbers without a country code are parsed as US numbers. Unparseable or
/// invalid numbers are kept as listed, since the hard filter already accepted
/// them as dialable.
pub fn normalize_phone(raw: &str) -> String {
    match phonenumber::parse(Some(CountryId::US), raw) {
        Ok(number) if phonenumber::is_valid(&number) => {
            let formatted = number.format().mode(Mode::E164).to_string();
            tracing::debug!("✓ Normalized phone: {} → {}", raw, formatted);
            formatted
        }
        Ok(_) => {
            tracing::debug!("Phone {} parsed but is not valid, keeping as listed", raw);
            raw.trim().to_string()
        }
        Err(e) => {
            tracing::debug!("Failed to parse phone '{}': {:?}", raw, e);
            raw.trim().to_string()
        }
    }
}

fn to_opportunity(
    flow_id: Uuid,
    agency_id: Uuid,
    campaign: &Campaign,
    lead: &QualifiedLead,
    domain: Option<String>,
) -> Opportunity {
    let place = &lead.place;
    Opportunity {
        id: Uuid::new_v4(),
        agency_id,
        flow_id,
        external_id: place.external_id.clone(),
        domain,
        name: place.name.clone(),
        website: place.website.clone(),
        phone: place.phone.as_deref().map(normalize_phone),
        address: place.address.clone(),
        rating: place.rating,
        review_count: place.review_count,
        vertical: campaign.vertical.clone(),
        geography: campaign.geography.clone(),
        status: OpportunityStatus::Sourced,
        qualification_score: lead.score,
        signals: lead.signals.clone(),
        fit_reason: lead.fit_reason.clone(),
        created_at: Utc::now(),
    }
}

/// Persists `leads` in order. Existing opportunities are skipped, never
/// updated, so replaying the same input creates nothing new.
pub async fn persist_opportunities(
    store: &dyn FlowStore,
    flow_id: Uuid,
    agency_id: Uuid,
    campaign: &Campaign,
    leads: &[QualifiedLead],
) -> Result<PersistReport, AppError> {
    let mut report = PersistReport::default();

    for lead in leads {
        let external_id = &lead.place.external_id;
        if store
            .find_opportunity_by_external_id(external_id)
            .await?
            .is_some()
        {
            tracing::info!("Skipping {}: external id {} already stored", lead.place.name, external_id);
            report.skipped += 1;
            continue;
        }

        // Social and directory hosts are shared, so they identify no business.
        let domain = lead
            .place
            .website
            .as_deref()
            .and_then(canonical_domain)
            .filter(|d| !is_weak_presence_host(d));
        if let Some(ref domain) = domain {
            if store
                .find_opportunity_by_domain(agency_id, domain)
                .await?
                .is_some()
            {
                tracing::info!(
                    "Skipping {}: domain {} already stored for agency {}",
                    lead.place.name,
                    domain,
                    agency_id
                );
                report.skipped += 1;
                continue;
            }
        }

        let opportunity = to_opportunity(flow_id, agency_id, campaign, lead, domain);
        if store.insert_opportunity(&opportunity).await? {
            report.created += 1;
        } else {
            tracing::info!(
                "Skipping {}: concurrent insert won for external id {}",
                lead.place.name,
                external_id
            );
            report.skipped += 1;
        }
    }

    tracing::info!(
        "✓ Persisted leads for flow {}: {} created, {} skipped",
        flow_id,
        report.created,
        report.skipped
    );
    Ok(report)
}
