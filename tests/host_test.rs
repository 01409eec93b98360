//! Transactional execution host over the in-memory transaction manager

use bpelway::config::EngineConfig;
use bpelway::persistence::{MemoryTransactionManager, TransactionManager, TransactionStatus};
use bpelway::process::types::{ActivityKind, Deadline, ProcessBuilder, ProcessDefinition, QName};
use bpelway::runtime::channel::{Message, PostOutcome};
use bpelway::runtime::context::Effect;
use bpelway::runtime::error::EngineError;
use bpelway::runtime::host::HostState;
use bpelway::runtime::{ExecutionHost, HostError, InstanceOutcome, InstanceStatus, PassTrigger, ProcessInstance};
use std::sync::Arc;

fn host() -> ExecutionHost<MemoryTransactionManager> {
    ExecutionHost::new(MemoryTransactionManager::new(), EngineConfig { max_steps_per_pass: 1_000 })
}

fn waiting_process() -> Arc<ProcessDefinition> {
    let mut b = ProcessBuilder::new("waiting");
    let w = b.add(ActivityKind::Wait {
        deadline: Deadline { for_seconds: Some(60), until: None },
    });
    let done = b.add(ActivityKind::Empty);
    let root = b.add(ActivityKind::Sequence { children: vec![w, done] });
    Arc::new(b.build(root).unwrap())
}

fn timer_of(effects: &[Effect]) -> bpelway::runtime::ChannelId {
    effects
        .iter()
        .find_map(|e| match e {
            Effect::RegisterTimer { timer, .. } => Some(*timer),
            _ => None,
        })
        .unwrap()
}

#[tokio::test]
async fn committed_pass_updates_instance_and_store() {
    let mut host = host();
    let mut instance = ProcessInstance::new(waiting_process());
    assert_eq!(instance.status(), InstanceStatus::Ready);

    let report = host.run_pass(&mut instance, PassTrigger::Start).await.unwrap();

    assert_eq!(report.status, InstanceStatus::Running);
    assert_eq!(instance.status(), InstanceStatus::Running);
    assert_eq!(host.state(), HostState::Idle);
    let tm = host.transaction_manager();
    assert_eq!(tm.commits(), 1);
    assert_eq!(tm.status(), TransactionStatus::Committed);
    let record = tm.record(instance.id).unwrap();
    assert_eq!(record.status, InstanceStatus::Running);
    assert_eq!(record.soup, instance.soup.serialize().unwrap());
    assert_eq!(tm.effects().len(), report.effects.len());

    let timer = timer_of(&report.effects);
    let report = host
        .run_pass(&mut instance, PassTrigger::Deliver { channel: timer, message: Message::TimerFired })
        .await
        .unwrap();

    assert_eq!(report.delivered, Some(PostOutcome::Matched));
    assert_eq!(report.outcome, Some(InstanceOutcome::Completed));
    assert_eq!(instance.status(), InstanceStatus::Completed);
    assert_eq!(host.transaction_manager().record(instance.id).unwrap().status, InstanceStatus::Completed);
}

#[tokio::test]
async fn failed_commit_leaves_instance_untouched() {
    let mut host = host();
    let mut instance = ProcessInstance::new(waiting_process());
    host.transaction_manager_mut().fail_next_commit();

    let err = host.run_pass(&mut instance, PassTrigger::Start).await.unwrap_err();

    assert!(matches!(err, HostError::Transaction(_)));
    assert!(instance.is_fresh());
    assert_eq!(host.state(), HostState::Idle);
    let tm = host.transaction_manager();
    assert_eq!(tm.rollbacks(), 1);
    assert!(tm.record(instance.id).is_none());
    assert!(tm.effects().is_empty());

    // the same trigger succeeds once storage recovers
    host.run_pass(&mut instance, PassTrigger::Start).await.unwrap();
    assert_eq!(instance.status(), InstanceStatus::Running);
}

#[tokio::test]
async fn failed_write_rolls_back_the_pass() {
    let mut host = host();
    let mut instance = ProcessInstance::new(waiting_process());
    host.run_pass(&mut instance, PassTrigger::Start).await.unwrap();
    let before = instance.soup.serialize().unwrap();
    let timer = instance.soup.awaited_external_channels()[0].0;

    host.transaction_manager_mut().fail_next_write();
    let err = host
        .run_pass(&mut instance, PassTrigger::Deliver { channel: timer, message: Message::TimerFired })
        .await
        .unwrap_err();

    assert!(matches!(err, HostError::Transaction(_)));
    assert_eq!(instance.soup.serialize().unwrap(), before);
    assert_eq!(host.transaction_manager().record(instance.id).unwrap().status, InstanceStatus::Running);

    // the timer channel is still live, so redelivery completes the instance
    let report = host
        .run_pass(&mut instance, PassTrigger::Deliver { channel: timer, message: Message::TimerFired })
        .await
        .unwrap();
    assert_eq!(report.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn rollback_only_transaction_is_not_committed() {
    let mut host = host();
    let mut instance = ProcessInstance::new(waiting_process());
    host.transaction_manager_mut().veto_next_write();

    let err = host.run_pass(&mut instance, PassTrigger::Start).await.unwrap_err();

    assert!(matches!(err, HostError::MarkedRollback));
    assert!(instance.is_fresh());
    assert_eq!(host.transaction_manager().commits(), 0);
    assert_eq!(host.transaction_manager().rollbacks(), 1);
    assert_eq!(host.state(), HostState::Idle);
}

#[tokio::test]
async fn engine_error_aborts_the_pass() {
    let mut b = ProcessBuilder::new("long");
    let children = (0..20).map(|_| b.add(ActivityKind::Empty)).collect();
    let root = b.add(ActivityKind::Sequence { children });
    let mut instance = ProcessInstance::new(Arc::new(b.build(root).unwrap()));
    let mut host = ExecutionHost::new(MemoryTransactionManager::new(), EngineConfig { max_steps_per_pass: 5 });

    let err = host.run_pass(&mut instance, PassTrigger::Start).await.unwrap_err();

    assert!(matches!(err, HostError::Engine(EngineError::StepBudgetExceeded { budget: 5 })));
    assert!(instance.is_fresh());
    assert_eq!(host.transaction_manager().rollbacks(), 1);
}

#[tokio::test]
async fn starting_twice_is_rejected() {
    let mut host = host();
    let mut instance = ProcessInstance::new(waiting_process());
    host.run_pass(&mut instance, PassTrigger::Start).await.unwrap();
    let before = instance.soup.serialize().unwrap();

    let err = host.run_pass(&mut instance, PassTrigger::Start).await.unwrap_err();

    assert!(matches!(err, HostError::InvalidState(_)));
    assert_eq!(instance.soup.serialize().unwrap(), before);
    assert_eq!(host.transaction_manager().commits(), 1);
}

#[tokio::test]
async fn terminate_trigger_stops_the_instance() {
    let mut host = host();
    let mut instance = ProcessInstance::new(waiting_process());
    let started = host.run_pass(&mut instance, PassTrigger::Start).await.unwrap();
    let timer = timer_of(&started.effects);

    let report = host.run_pass(&mut instance, PassTrigger::Terminate).await.unwrap();

    assert_eq!(report.status, InstanceStatus::Terminated);
    assert!(report.effects.contains(&Effect::CancelTimer { timer }));
    assert!(instance.soup.is_complete());

    // a second terminate lands on the retired root channel and changes nothing
    let report = host.run_pass(&mut instance, PassTrigger::Terminate).await.unwrap();
    assert_eq!(report.delivered, Some(PostOutcome::Dropped));
    assert_eq!(report.steps, 0);
    assert_eq!(instance.outcome(), Some(&InstanceOutcome::Terminated));
}

#[tokio::test]
async fn faulted_instance_reports_its_fault() {
    let mut b = ProcessBuilder::new("faulty");
    let root = b.add(ActivityKind::Throw {
        fault_name: QName::new("urn:test", "boom"),
        fault_variable: None,
        fault_type: None,
    });
    let mut instance = ProcessInstance::new(Arc::new(b.build(root).unwrap()));
    let mut host = host();

    let report = host.run_pass(&mut instance, PassTrigger::Start).await.unwrap();

    assert_eq!(report.status, InstanceStatus::Faulted);
    match report.outcome {
        Some(InstanceOutcome::Faulted { fault }) => assert_eq!(fault.name, QName::new("urn:test", "boom")),
        other => panic!("expected fault outcome, got {:?}", other),
    }
    let record = host.transaction_manager().record(instance.id).unwrap();
    assert_eq!(record.status, InstanceStatus::Faulted);
}
