use std::env;
use uuid::Uuid;

use leadgen_orchestrator::db::Database;
use leadgen_orchestrator::db_storage::PgStore;
use leadgen_orchestrator::models::{Campaign, Flow, FlowStatus, PlaceRecord};
use leadgen_orchestrator::persistence::persist_opportunities;
use leadgen_orchestrator::phases::{update_flow_phase, LeadPhase, PhaseStatus, PhaseUpdate};
use leadgen_orchestrator::signals::qualify;
use leadgen_orchestrator::store::FlowStore;

async fn store() -> anyhow::Result<PgStore> {
    let db_url = env::var("TEST_DATABASE_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("Set TEST_DATABASE_URL or DATABASE_URL to run this test"))?;
    let db = Database::new(&db_url).await?;
    Ok(PgStore::new(db.pool))
}

fn campaign() -> Campaign {
    Campaign {
        vertical: "plumbers".into(),
        geography: "Austin, TX".into(),
    }
}

/// Flow documents survive a round trip through JSONB with their phase list intact.
/// Marked ignored so it never runs against a shared database by accident.
#[tokio::test]
#[ignore]
async fn flow_document_smoke_test() -> anyhow::Result<()> {
    let store = store().await?;
    let flow = Flow::new("cus_smoke".into(), Uuid::new_v4(), 5, campaign());
    store.create_flow(&flow).await?;

    store
        .mutate_flow(flow.id, &|flow: &mut Flow| flow.mark_running())
        .await?;
    update_flow_phase(
        &store,
        flow.id,
        PhaseUpdate::running(LeadPhase::Source).with_event("Searching"),
    )
    .await?;

    let stored = store
        .get_flow(flow.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("flow not stored"))?;
    assert_eq!(stored.status(), FlowStatus::Running);
    assert_eq!(stored.phases.len(), 6);
    assert_eq!(
        stored.phase(LeadPhase::Source).map(|p| p.status),
        Some(PhaseStatus::Running)
    );
    assert!(stored.version >= 2);

    let running = store.list_flows_by_status(FlowStatus::Running).await?;
    assert!(running.iter().any(|f| f.id == flow.id));
    Ok(())
}

/// Replaying the same leads creates nothing, thanks to the unique indexes.
#[tokio::test]
#[ignore]
async fn opportunity_dedup_smoke_test() -> anyhow::Result<()> {
    let store = store().await?;
    let agency_id = Uuid::new_v4();
    let flow_id = Uuid::new_v4();
    let unique = Uuid::new_v4().simple().to_string();

    let places = vec![PlaceRecord {
        external_id: format!("smoke-{}", unique),
        name: "Smoke Plumbing".into(),
        website: Some(format!("https://smoke-{}.com", &unique[..8])),
        phone: Some("(512) 463-4630".into()),
        rating: Some(3.1),
        review_count: Some(12),
        address: None,
    }];
    let leads = qualify(&places, &[]).kept;

    let first = persist_opportunities(&store, flow_id, agency_id, &campaign(), &leads).await?;
    let second = persist_opportunities(&store, flow_id, agency_id, &campaign(), &leads).await?;

    assert_eq!(first.created, 1);
    assert_eq!(second.created, 0);
    assert_eq!(second.skipped, 1);
    assert_eq!(store.list_flow_opportunities(flow_id).await?.len(), 1);
    Ok(())
}
