/// Workflow tests driving the full six-phase flow against fake collaborators
mod support;

use std::time::Duration;

use leadgen_orchestrator::errors::AppError;
use leadgen_orchestrator::models::{
    AuditStatus, FlowStatus, OpportunityStatus, StartFlowRequest,
};
use leadgen_orchestrator::orchestrator::{
    recover_interrupted_flows, resume_flow, start_flow, ResumeOutcome, RunOutcome, TokioLauncher,
};
use leadgen_orchestrator::phases::{overall_progress, AuditPhase, LeadPhase, PhaseStatus};
use leadgen_orchestrator::store::FlowStore;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use support::*;

fn phase_status(flow: &leadgen_orchestrator::models::Flow, phase: LeadPhase) -> PhaseStatus {
    flow.phase(phase).unwrap().status
}

#[tokio::test]
async fn five_leads_end_to_end() {
    let h = Harness::new(five_places()).await;
    let flow = h.idle_flow(5).await;

    let outcome = h.workflow.run(flow.id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let flow = h.flow(flow.id).await;
    assert_eq!(flow.status(), FlowStatus::Completed);
    assert!(flow.invariant_holds());
    assert_eq!(flow.fetched_leads, 5);
    assert_eq!(flow.places_snapshot.len(), 2);
    assert_eq!(flow.stats.kept, 3);
    assert_eq!(flow.stats.dropped, 2);
    assert_eq!(flow.stats.created, 3);
    assert_eq!(flow.stats.audits_queued, 2);
    assert_eq!(flow.stats.audits_completed, 2);
    assert_eq!(flow.stats.dossiers, 2);
    assert!(flow
        .phases
        .iter()
        .all(|p| p.status == PhaseStatus::Complete));
    assert!((overall_progress(&flow.phases) - 1.0).abs() < 1e-9);

    let opportunities = h.store.list_flow_opportunities(flow.id).await.unwrap();
    assert_eq!(opportunities.len(), 3);
    let ready = opportunities
        .iter()
        .filter(|o| o.status == OpportunityStatus::Ready)
        .count();
    assert_eq!(ready, 2);

    let jobs = h.store.list_audit_jobs(flow.id).await.unwrap();
    assert_eq!(jobs.len(), 2);
    for job in &jobs {
        assert_eq!(job.status, AuditStatus::Completed);
        assert!(job.metered);
        assert!(h.store.get_dossier_for_audit(job.id).await.unwrap().is_some());
        assert!(!h.store.list_pages(job.id).await.unwrap().is_empty());
    }

    assert_eq!(h.billing.usage_for("lead_sourcing"), vec![5.0]);
    assert_eq!(h.billing.usage_for("dossier_generation").len(), 2);
}

#[tokio::test]
async fn zero_search_results_fail_the_source_phase() {
    let h = Harness::new(vec![]).await;
    let flow = h.idle_flow(5).await;

    let outcome = h.workflow.run(flow.id).await.unwrap();
    assert!(matches!(
        outcome,
        RunOutcome::Failed {
            phase: LeadPhase::Source,
            ..
        }
    ));

    let flow = h.flow(flow.id).await;
    assert_eq!(flow.status(), FlowStatus::Error);
    assert!(flow.billing_block().is_none());
    let source = flow.phase(LeadPhase::Source).unwrap();
    assert_eq!(source.status, PhaseStatus::Error);
    assert!(source.error_message.as_deref().unwrap().contains("No places"));
    assert_eq!(phase_status(&flow, LeadPhase::FilterRank), PhaseStatus::Pending);
    assert!(h.billing.usage_for("lead_sourcing").is_empty());
}

#[tokio::test]
async fn insufficient_sourcing_credits_pause_before_searching() {
    let h = Harness::new(five_places()).await;
    h.billing.deny("lead_sourcing");
    let flow = h.idle_flow(5).await;

    let outcome = h.workflow.run(flow.id).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Paused {
            phase: LeadPhase::Source
        }
    );
    assert_eq!(h.search.calls(), 0);

    let flow = h.flow(flow.id).await;
    assert_eq!(flow.status(), FlowStatus::PausedForUpgrade);
    assert!(flow.invariant_holds());
    let block = flow.billing_block().unwrap();
    assert_eq!(block.phase, LeadPhase::Source);
    assert_eq!(block.feature_id, "lead_sourcing");
    assert_eq!(block.related_audit_job_id, None);
    assert_eq!(phase_status(&flow, LeadPhase::Source), PhaseStatus::Pending);
}

#[tokio::test]
async fn resume_with_insufficient_credits_changes_nothing() {
    let h = Harness::new(five_places()).await;
    h.billing.deny("lead_sourcing");
    let flow = h.idle_flow(5).await;
    h.workflow.run(flow.id).await.unwrap();
    let paused = h.flow(flow.id).await;

    let launcher = RecordingLauncher::default();
    let outcome = resume_flow(h.store.as_ref(), h.workflow.gate(), &launcher, flow.id)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ResumeOutcome::StillInsufficient {
            feature_id: "lead_sourcing".into(),
            phase: LeadPhase::Source
        }
    );
    assert!(launcher.launches().is_empty());
    assert_eq!(h.flow(flow.id).await, paused);
}

#[tokio::test]
async fn resume_of_a_running_flow_is_a_no_op() {
    let h = Harness::new(five_places()).await;
    let flow = h.idle_flow(5).await;
    h.workflow.run(flow.id).await.unwrap();

    let launcher = RecordingLauncher::default();
    let outcome = resume_flow(h.store.as_ref(), h.workflow.gate(), &launcher, flow.id)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ResumeOutcome::NotPaused {
            status: FlowStatus::Completed
        }
    );
    assert!(launcher.launches().is_empty());
}

#[tokio::test]
async fn resume_after_source_pause_runs_the_whole_flow() {
    let h = Harness::new(five_places()).await;
    h.billing.deny("lead_sourcing");
    let flow = h.idle_flow(5).await;
    h.workflow.run(flow.id).await.unwrap();

    h.billing.allow("lead_sourcing");
    let launcher = RecordingLauncher::default();
    let outcome = resume_flow(h.store.as_ref(), h.workflow.gate(), &launcher, flow.id)
        .await
        .unwrap();

    let launches = launcher.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(
        outcome,
        ResumeOutcome::Resumed {
            execution_id: launches[0].1
        }
    );

    let resumed = h.flow(flow.id).await;
    assert_eq!(resumed.status(), FlowStatus::Running);
    assert!(resumed.billing_block().is_none());
    assert_eq!(resumed.execution_id, Some(launches[0].1));
    assert!(resumed.phases.iter().all(|p| p.status == PhaseStatus::Pending));

    assert_eq!(h.workflow.run(flow.id).await.unwrap(), RunOutcome::Completed);
    assert_eq!(h.flow(flow.id).await.stats.dossiers, 2);
}

#[tokio::test]
async fn dossier_pause_resumes_at_the_blocked_audit() {
    let h = Harness::new(five_places()).await;
    h.billing.deny("dossier_generation");
    let flow = h.idle_flow(5).await;

    let outcome = h.workflow.run(flow.id).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Paused {
            phase: LeadPhase::GenerateDossier
        }
    );

    let jobs = h.store.list_audit_jobs(flow.id).await.unwrap();
    let paused = h.flow(flow.id).await;
    let block = paused.billing_block().unwrap();
    assert_eq!(block.feature_id, "dossier_generation");
    assert_eq!(block.related_audit_job_id, Some(jobs[0].id));
    assert!(jobs.iter().all(|j| j.status == AuditStatus::Queued));
    assert_eq!(phase_status(&paused, LeadPhase::PersistLeads), PhaseStatus::Complete);
    assert_eq!(phase_status(&paused, LeadPhase::ScrapeContent), PhaseStatus::Complete);
    assert!(h.billing.usage_for("dossier_generation").is_empty());

    h.billing.allow("dossier_generation");
    let launcher = RecordingLauncher::default();
    resume_flow(h.store.as_ref(), h.workflow.gate(), &launcher, flow.id)
        .await
        .unwrap();

    let resumed = h.flow(flow.id).await;
    assert_eq!(phase_status(&resumed, LeadPhase::PersistLeads), PhaseStatus::Complete);
    assert_eq!(phase_status(&resumed, LeadPhase::GenerateDossier), PhaseStatus::Pending);
    assert_eq!(phase_status(&resumed, LeadPhase::FinalizeRank), PhaseStatus::Pending);
    let dossier_phase = resumed.phase(LeadPhase::GenerateDossier).unwrap();
    assert_eq!(dossier_phase.progress, 0.0);
    assert!(dossier_phase.started_at.is_none());

    assert_eq!(h.workflow.run(flow.id).await.unwrap(), RunOutcome::Completed);
    // Completed ingest phases are not replayed.
    assert_eq!(h.search.calls(), 1);
    assert_eq!(h.billing.usage_for("dossier_generation").len(), 2);
    assert_eq!(h.flow(flow.id).await.stats.dossiers, 2);
}

#[tokio::test]
async fn pause_inside_an_audit_keeps_its_finished_steps() {
    let h = Harness::new(five_places()).await;
    // The flow-level check passes, the audit's own check fails.
    h.billing.deny_after("dossier_generation", 1);
    let flow = h.idle_flow(5).await;

    let outcome = h.workflow.run(flow.id).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Paused {
            phase: LeadPhase::GenerateDossier
        }
    );

    let job = h.store.list_audit_jobs(flow.id).await.unwrap().remove(0);
    assert_eq!(job.status, AuditStatus::Queued);
    assert!(job.phase_done(AuditPhase::MapUrls));
    assert!(job.phase_done(AuditPhase::FilterUrls));
    assert!(job.phase_done(AuditPhase::ScrapeContent));
    assert_eq!(
        job.phase(AuditPhase::GenerateDossier).unwrap().status,
        PhaseStatus::Pending
    );
    assert_eq!(h.crawl.starts.load(Ordering::SeqCst), 1);
    let fetched_before = h.scrape.fetches.load(Ordering::SeqCst);

    h.billing.allow("dossier_generation");
    resume_flow(
        h.store.as_ref(),
        h.workflow.gate(),
        &RecordingLauncher::default(),
        flow.id,
    )
    .await
    .unwrap();
    assert_eq!(h.workflow.run(flow.id).await.unwrap(), RunOutcome::Completed);

    // Only the second audit crawls and scrapes.
    assert_eq!(h.crawl.starts.load(Ordering::SeqCst), 2);
    assert_eq!(
        h.scrape.fetches.load(Ordering::SeqCst),
        fetched_before * 2
    );
    assert_eq!(h.billing.usage_for("dossier_generation").len(), 2);
}

#[tokio::test]
async fn failed_relaunch_restores_the_pause() {
    let h = Harness::new(five_places()).await;
    h.billing.deny("dossier_generation");
    let flow = h.idle_flow(5).await;
    h.workflow.run(flow.id).await.unwrap();
    let paused = h.flow(flow.id).await;

    h.billing.allow("dossier_generation");
    let result = resume_flow(h.store.as_ref(), h.workflow.gate(), &FailingLauncher, flow.id).await;
    assert!(matches!(result, Err(AppError::InternalError(_))));

    let restored = h.flow(flow.id).await;
    assert_eq!(restored.status(), FlowStatus::PausedForUpgrade);
    assert_eq!(restored.billing_block(), paused.billing_block());
    assert_eq!(restored.phases, paused.phases);
    assert!(restored.invariant_holds());
}

#[tokio::test]
async fn one_broken_website_does_not_void_the_flow() {
    let h = Harness::new(five_places()).await;
    h.crawl.fail_for("https://www.alpha-plumbing.com");
    let flow = h.idle_flow(5).await;

    assert_eq!(h.workflow.run(flow.id).await.unwrap(), RunOutcome::Completed);

    let flow = h.flow(flow.id).await;
    assert_eq!(flow.status(), FlowStatus::Completed);
    assert_eq!(flow.stats.audits_failed, 1);
    assert_eq!(flow.stats.dossiers, 1);

    let jobs = h.store.list_audit_jobs(flow.id).await.unwrap();
    let failed = jobs.iter().find(|j| j.status == AuditStatus::Error).unwrap();
    assert_eq!(
        failed.phase(AuditPhase::MapUrls).unwrap().status,
        PhaseStatus::Error
    );
    assert!(failed.last_error.is_some());
    assert!(!failed.metered);

    let opportunity = h
        .store
        .get_opportunity(failed.opportunity_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(opportunity.status, OpportunityStatus::DataReady);
    assert_eq!(h.billing.usage_for("dossier_generation").len(), 1);
}

#[tokio::test]
async fn stalled_crawl_fails_the_audit_after_the_ceiling() {
    let h = Harness::new(five_places()).await;
    h.crawl.stall_for("https://www.alpha-plumbing.com");
    let flow = h.idle_flow(5).await;

    assert_eq!(h.workflow.run(flow.id).await.unwrap(), RunOutcome::Completed);

    let jobs = h.store.list_audit_jobs(flow.id).await.unwrap();
    let failed = jobs.iter().find(|j| j.status == AuditStatus::Error).unwrap();
    let message = failed
        .phase(AuditPhase::MapUrls)
        .unwrap()
        .error_message
        .clone()
        .unwrap();
    assert!(message.contains("exceeded"), "unexpected message: {}", message);
}

#[tokio::test]
async fn unusable_model_output_falls_back_to_a_deterministic_dossier() {
    let h = Harness::new(five_places()).await;
    h.llm.return_invalid_dossiers();
    let flow = h.idle_flow(5).await;

    assert_eq!(h.workflow.run(flow.id).await.unwrap(), RunOutcome::Completed);

    for job in h.store.list_audit_jobs(flow.id).await.unwrap() {
        let dossier = h.store.get_dossier_for_audit(job.id).await.unwrap().unwrap();
        assert!(dossier.fallback);
        assert!((2..=5).contains(&dossier.gaps.len()));
        assert!((2..=4).contains(&dossier.talking_points.len()));
        assert!(dossier.contact_email.is_some());
    }
    assert_eq!(h.flow(flow.id).await.stats.dossiers, 2);
}

#[tokio::test]
async fn audits_with_no_fetchable_pages_fail_without_a_dossier() {
    let h = Harness::new(five_places()).await;
    h.scrape.fail_everything();
    let flow = h.idle_flow(5).await;

    assert_eq!(h.workflow.run(flow.id).await.unwrap(), RunOutcome::Completed);

    let flow = h.flow(flow.id).await;
    assert_eq!(flow.stats.audits_failed, 2);
    assert_eq!(flow.stats.dossiers, 0);
    for job in h.store.list_audit_jobs(flow.id).await.unwrap() {
        assert_eq!(
            job.phase(AuditPhase::ScrapeContent).unwrap().status,
            PhaseStatus::Error
        );
    }
    assert!(h.billing.usage_for("dossier_generation").is_empty());
}

#[tokio::test]
async fn start_flow_validates_and_fills_campaign_defaults() {
    let h = Harness::new(five_places()).await;
    let launcher = RecordingLauncher::default();
    let settings = h.workflow.settings().clone();

    let too_many = StartFlowRequest {
        lead_count: settings.max_leads_per_flow + 1,
        vertical: None,
        geography: None,
    };
    let err = start_flow(h.store.as_ref(), &launcher, &settings, OWNER, h.agency_id, too_many)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    let zero = StartFlowRequest {
        lead_count: 0,
        vertical: None,
        geography: None,
    };
    assert!(
        start_flow(h.store.as_ref(), &launcher, &settings, OWNER, h.agency_id, zero)
            .await
            .is_err()
    );

    let unknown_agency = StartFlowRequest {
        lead_count: 5,
        vertical: Some("roofers".into()),
        geography: None,
    };
    let err = start_flow(
        h.store.as_ref(),
        &launcher,
        &settings,
        OWNER,
        uuid::Uuid::new_v4(),
        unknown_agency,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    let request = StartFlowRequest {
        lead_count: 5,
        vertical: Some("roofers".into()),
        geography: None,
    };
    let flow = start_flow(h.store.as_ref(), &launcher, &settings, OWNER, h.agency_id, request)
        .await
        .unwrap();
    assert_eq!(flow.campaign.vertical, "roofers");
    assert_eq!(flow.campaign.geography, "Austin, TX");
    assert_eq!(flow.status(), FlowStatus::Idle);
    assert_eq!(flow.execution_id, Some(launcher.launches()[0].1));
}

#[tokio::test]
async fn start_flow_marks_the_flow_failed_when_launch_fails() {
    let h = Harness::new(five_places()).await;
    let settings = h.workflow.settings().clone();
    let request = StartFlowRequest {
        lead_count: 5,
        vertical: None,
        geography: None,
    };

    let err = start_flow(
        h.store.as_ref(),
        &FailingLauncher,
        &settings,
        OWNER,
        h.agency_id,
        request,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::InternalError(_)));

    let errored = h.store.list_flows_by_status(FlowStatus::Error).await.unwrap();
    assert_eq!(errored.len(), 1);
}

#[tokio::test]
async fn tokio_launcher_runs_one_execution_per_flow() {
    let h = Harness::new(five_places()).await;
    // Keeps the first execution busy long enough to observe it.
    h.crawl.stall_for("https://www.alpha-plumbing.com");
    let flow = h.idle_flow(5).await;
    let launcher = TokioLauncher::new(h.workflow.clone());

    use leadgen_orchestrator::orchestrator::ExecutionLauncher;
    launcher.launch(flow.id).await.unwrap();
    let second = launcher.launch(flow.id).await;
    assert!(matches!(second, Err(AppError::Conflict(_))));

    let mut status = FlowStatus::Idle;
    for _ in 0..200 {
        status = h.flow(flow.id).await.status();
        if status == FlowStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, FlowStatus::Completed);
}

#[tokio::test]
async fn restart_recovery_relaunches_running_flows() {
    let h = Harness::new(five_places()).await;
    let running = h.idle_flow(5).await;
    let _idle = h.idle_flow(5).await;
    h.store
        .mutate_flow(running.id, &|flow| flow.mark_running())
        .await
        .unwrap();

    let launcher = Arc::new(RecordingLauncher::default());
    let count = recover_interrupted_flows(h.store.as_ref(), launcher.as_ref())
        .await
        .unwrap();

    assert_eq!(count, 1);
    let launches = launcher.launches();
    assert_eq!(launches[0].0, running.id);
    assert_eq!(h.flow(running.id).await.execution_id, Some(launches[0].1));
}
