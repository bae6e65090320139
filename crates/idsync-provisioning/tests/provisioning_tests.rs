//! Provisioning Queue Tests
//!
//! End-to-end behaviour of the queue, dispatcher, breaker and echo markers:
//! - Last-write-wins collapsing of pending updates
//! - Breaker opening, half-open probes and backoff
//! - Parking on missing capabilities, requeue after intervention
//! - Retry sweep after a target recovers
//! - Echo suppression of pushed changes, before and after marker expiry
//! - Per-account exclusivity of dispatch

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::sync::Semaphore;

use idsync_connector::operation::{AttributeSet, GuardedString, Uid, PASSWORD_ATTRIBUTE};
use idsync_connector::traits::{SyncChange, SyncChangeType};
use idsync_connector::types::{CircuitState, OperationKind};
use idsync_provisioning::{
    AccountState, BatchStatus, BatchStore, Clock, DispatchOutcome, EchoAspect, IdentityEvent,
    IdentityStore, ProvisioningError, ReconciliationMode, SyncConfigStore, SyncConfiguration,
};

use common::{attrs, test_config, Harness, MockDirectory, OBJECT_CLASS};

// =============================================================================
// Batching
// =============================================================================

#[tokio::test]
async fn test_updates_before_dispatch_collapse_last_write_wins() {
    let h = Harness::new(test_config());
    let (_, account) = h.linked_account("jdoe", "jdoe@old.example.com").await;
    let account_ref = account.account_ref();

    let first = h
        .engine
        .enqueue(account_ref.clone(), OperationKind::Update, attrs(&[("mail", "a@example.com")]))
        .await
        .unwrap();
    let second = h
        .engine
        .enqueue(account_ref.clone(), OperationKind::Update, attrs(&[("mail", "b@example.com")]))
        .await
        .unwrap();
    assert_eq!(first.batch_id, second.batch_id);

    let dispatcher = h.engine.provisioning().dispatcher();
    let outcome = dispatcher.dispatch(&account_ref).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Executed { operations: 1, .. }));

    assert_eq!(MockDirectory::calls(&h.directory.update_calls), 1);
    let (uid, delta) = h.directory.last_update().unwrap();
    assert_eq!(uid, Uid::from_value("jdoe"));
    assert_eq!(delta.replace["mail"].to_display_string(), "b@example.com");
    assert_eq!(
        h.directory.object(&uid).unwrap().get_string("mail"),
        Some("b@example.com")
    );

    // Both operations are archived as executed under the one dispatch.
    let history = h.batches.all_records().await;
    assert_eq!(history.len(), 1);
    assert!(history[0].operation.covers(first.operation_id));
    assert!(history[0].operation.covers(second.operation_id));

    let again = dispatcher.dispatch(&account_ref).await.unwrap();
    assert!(matches!(again, DispatchOutcome::NotClaimed));
    assert!(h.batches.is_empty().await);
}

#[tokio::test]
async fn test_create_records_uid_and_snapshot() {
    let h = Harness::new(test_config());
    let account_ref = h.new_account_ref();

    h.engine
        .provision_sync(
            account_ref.clone(),
            OperationKind::Create,
            attrs(&[("uid", "asmith"), ("mail", "asmith@example.com")]),
            BTreeMap::new(),
        )
        .await
        .unwrap();

    let account = h.identities.get_account(account_ref.account_id).await.unwrap().unwrap();
    assert_eq!(account.uid, Some(Uid::from_value("asmith")));
    assert_eq!(account.state, AccountState::Active);
    assert_eq!(account.attributes.get_string("mail"), Some("asmith@example.com"));
    assert_eq!(MockDirectory::calls(&h.directory.create_calls), 1);
}

#[tokio::test]
async fn test_history_failure_after_create_does_not_repeat_create() {
    let h = Harness::new(test_config());
    let account_ref = h.new_account_ref();
    h.engine
        .enqueue(
            account_ref.clone(),
            OperationKind::Create,
            attrs(&[("uid", "zed"), ("mail", "zed@example.com")]),
        )
        .await
        .unwrap();

    h.history.fail_next_records(1);
    let dispatcher = h.engine.provisioning().dispatcher();
    let err = dispatcher.dispatch(&account_ref).await.unwrap_err();
    assert_eq!(err.error_code(), "STORAGE");

    // The batch is back to pending without the applied create.
    let batch = h.batches.get_for_account(&account_ref).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Pending);
    assert!(batch.operations.is_empty());

    let outcome = dispatcher.dispatch(&account_ref).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Executed { operations: 0, .. }));
    assert!(h.batches.is_empty().await);
    assert_eq!(MockDirectory::calls(&h.directory.create_calls), 1);
    assert_eq!(h.directory.object_count(), 1);

    let account = h.identities.get_account(account_ref.account_id).await.unwrap().unwrap();
    assert_eq!(account.uid, Some(Uid::from_value("zed")));
}

// =============================================================================
// Circuit Breaker
// =============================================================================

async fn fail_creates(h: &Harness, count: usize) {
    for _ in 0..count {
        let err = h
            .engine
            .provision_sync(h.new_account_ref(), OperationKind::Create, attrs(&[("cn", "x")]), BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::ConnectorUnavailable { .. }), "{err}");
    }
}

#[tokio::test]
async fn test_breaker_blocks_after_threshold_without_connector_call() {
    let h = Harness::new(test_config());
    h.directory.set_fail_writes(true);

    fail_creates(&h, 3).await;
    assert_eq!(MockDirectory::calls(&h.directory.create_calls), 3);

    let snapshot = h
        .engine
        .get_breaker_state(&h.system, OperationKind::Create)
        .await
        .unwrap();
    assert_eq!(snapshot.state, CircuitState::Open);
    assert_eq!(snapshot.consecutive_failures, 3);
    assert_eq!(snapshot.blocked_until, Some(h.clock.now() + ChronoDuration::seconds(60)));

    let err = h
        .engine
        .provision_sync(h.new_account_ref(), OperationKind::Create, attrs(&[("cn", "y")]), BTreeMap::new())
        .await
        .unwrap_err();
    match err {
        ProvisioningError::ProvisioningBlocked { system, kind, .. } => {
            assert_eq!(system, h.system);
            assert_eq!(kind, OperationKind::Create);
        }
        other => panic!("expected ProvisioningBlocked, got {other}"),
    }
    assert_eq!(MockDirectory::calls(&h.directory.create_calls), 3);

    // Other operation kinds on the same system keep flowing.
    let update = h
        .engine
        .get_breaker_state(&h.system, OperationKind::Update)
        .await
        .unwrap();
    assert_eq!(update.state, CircuitState::Closed);
}

#[tokio::test]
async fn test_half_open_probe_reopens_then_closes() {
    let h = Harness::new(test_config());
    h.directory.set_fail_writes(true);
    fail_creates(&h, 3).await;

    // Window elapsed: exactly one probe goes through, and it fails.
    h.advance(61);
    fail_creates(&h, 1).await;
    assert_eq!(MockDirectory::calls(&h.directory.create_calls), 4);
    let reopened = h
        .engine
        .get_breaker_state(&h.system, OperationKind::Create)
        .await
        .unwrap();
    assert_eq!(reopened.state, CircuitState::Open);
    assert_eq!(reopened.blocked_until, Some(h.clock.now() + ChronoDuration::seconds(120)));

    // Target recovered: the next probe closes the breaker.
    h.advance(121);
    h.directory.set_fail_writes(false);
    h.engine
        .provision_sync(h.new_account_ref(), OperationKind::Create, attrs(&[("cn", "z")]), BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(MockDirectory::calls(&h.directory.create_calls), 5);

    let closed = h
        .engine
        .get_breaker_state(&h.system, OperationKind::Create)
        .await
        .unwrap();
    assert_eq!(closed.state, CircuitState::Closed);
    assert_eq!(closed.consecutive_failures, 0);
}

// =============================================================================
// Parking and Retry
// =============================================================================

#[tokio::test]
async fn test_missing_capability_parks_batch() {
    let h = Harness::with_directory(test_config(), MockDirectory::read_only("ldap1"));
    let account_ref = h.new_account_ref();

    let err = h
        .engine
        .provision_sync(account_ref.clone(), OperationKind::Create, attrs(&[("cn", "x")]), BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisioningError::CapabilityNotSupported { .. }), "{err}");
    assert_eq!(err.error_code(), "CAPABILITY_NOT_SUPPORTED");

    let parked = h.engine.list_parked().await.unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].account, account_ref);
    assert!(parked[0].last_error.is_some());

    // Parked batches are not breaker failures.
    let snapshot = h
        .engine
        .get_breaker_state(&h.system, OperationKind::Create)
        .await
        .unwrap();
    assert_eq!(snapshot.consecutive_failures, 0);

    h.engine.requeue_parked(parked[0].id).await.unwrap();
    let batch = h.batches.get_for_account(&account_ref).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Pending);
}

#[tokio::test]
async fn test_retry_sweep_applies_pending_batches_after_recovery() {
    let h = Harness::new(test_config());
    h.directory.set_fail_writes(true);
    fail_creates(&h, 2).await;
    assert_eq!(h.batches.len().await, 2);

    h.directory.set_fail_writes(false);
    h.advance(600);
    let report = h.engine.retry_sweep(None).unwrap().wait().await.unwrap();

    assert_eq!(report.total, 2);
    assert_eq!(report.processed, 2);
    assert_eq!(report.executed, 2);
    assert!(h.batches.is_empty().await);
    assert_eq!(MockDirectory::calls(&h.directory.create_calls), 4);
}

#[tokio::test]
async fn test_retry_sweep_leaves_recent_batches_to_the_worker() {
    let h = Harness::new(test_config());
    h.directory.set_fail_writes(true);
    fail_creates(&h, 1).await;
    h.directory.set_fail_writes(false);

    // Inside the grace period nothing qualifies.
    let report = h.engine.retry_sweep(None).unwrap().wait().await.unwrap();
    assert_eq!(report.total, 0);
    assert_eq!(h.batches.len().await, 1);
}

#[tokio::test]
async fn test_retry_sweep_cancel_reports_partial_progress() {
    let h = Harness::new(test_config());
    for login in ["a1", "a2", "a3"] {
        let (_, account) = h.linked_account(login, &format!("{login}@example.com")).await;
        h.engine
            .enqueue(account.account_ref(), OperationKind::Update, attrs(&[("cn", "renamed")]))
            .await
            .unwrap();
    }
    h.advance(600);

    let gate = Arc::new(Semaphore::new(1));
    h.directory.gate_writes(Arc::clone(&gate));
    let sweep = h.engine.retry_sweep(None).unwrap();

    let second = h.engine.retry_sweep(None).unwrap_err();
    assert_eq!(second.error_code(), "ALREADY_RUNNING");

    tokio::time::timeout(Duration::from_secs(5), async {
        while MockDirectory::calls(&h.directory.update_calls) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sweep made no progress");
    assert!(h.engine.cancel_sweep(sweep.id()));
    gate.add_permits(1);

    let report = sweep.wait().await.unwrap();
    assert!(report.canceled);
    assert_eq!(report.total, 3);
    assert_eq!(report.processed, 2);
    assert_eq!(report.executed, 2);
    assert_eq!(h.batches.len().await, 1);

    // The slot is free again and the rest goes through.
    h.directory.ungate_writes();
    let rest = h.engine.retry_sweep(None).unwrap().wait().await.unwrap();
    assert_eq!(rest.executed, 1);
    assert!(!rest.canceled);
    assert!(h.batches.is_empty().await);
}

// =============================================================================
// Exclusivity
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dispatch_claims_account_once() {
    let h = Arc::new(Harness::new(test_config()));
    let (_, account) = h.linked_account("jdoe", "jdoe@example.com").await;
    let account_ref = account.account_ref();
    h.engine
        .enqueue(account_ref.clone(), OperationKind::Update, attrs(&[("cn", "John")]))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let h = Arc::clone(&h);
        let account_ref = account_ref.clone();
        tasks.push(tokio::spawn(async move {
            h.engine.provisioning().dispatcher().dispatch(&account_ref).await.unwrap()
        }));
    }
    let mut executed = 0;
    for task in tasks {
        if matches!(task.await.unwrap(), DispatchOutcome::Executed { .. }) {
            executed += 1;
        }
    }
    assert_eq!(executed, 1);
    assert_eq!(MockDirectory::calls(&h.directory.update_calls), 1);
}

// =============================================================================
// Echo Suppression
// =============================================================================

async fn save_sync_config(h: &Harness) {
    h.configs
        .save(SyncConfiguration::new(
            h.system.clone(),
            OBJECT_CLASS,
            ReconciliationMode::SystemToIdentity,
        ))
        .await
        .unwrap();
}

fn pushed(uid: &Uid, attributes: AttributeSet) -> SyncChange {
    SyncChange {
        uid: uid.clone(),
        change_type: SyncChangeType::Update,
        object_class: OBJECT_CLASS.to_string(),
        attributes: Some(attributes),
        timestamp: None,
    }
}

#[tokio::test]
async fn test_password_echo_discarded_exactly_once() {
    let h = Harness::new(test_config());
    save_sync_config(&h).await;
    let (identity, account) = h.linked_account("jdoe", "jdoe@example.com").await;
    let uid = account.uid.clone().unwrap();

    let enqueued = h
        .engine
        .handle_event(IdentityEvent::PasswordChanged {
            identity: identity.id,
            password: GuardedString::new("s3cret!"),
        })
        .await
        .unwrap();
    assert_eq!(enqueued.len(), 1);
    h.engine
        .provisioning()
        .dispatcher()
        .dispatch(&account.account_ref())
        .await
        .unwrap();

    let (_, delta) = h.directory.last_update().unwrap();
    assert_eq!(delta.replace[PASSWORD_ATTRIBUTE].to_display_string(), "s3cret!");
    assert!(h
        .engine
        .echo_marker_exists(&h.system, &uid, &EchoAspect::Password)
        .await
        .unwrap());
    let changed_at = h.identities.get_identity(identity.id).await.unwrap().unwrap().password_changed_at;

    // The target reports our own write back.
    let echo = attrs(&[(PASSWORD_ATTRIBUTE, "********")]);
    let stats = h.engine.handle_pushed_change(&h.system, pushed(&uid, echo.clone())).await.unwrap();
    assert_eq!(stats.echoes_suppressed, 1);
    assert!(!h
        .engine
        .echo_marker_exists(&h.system, &uid, &EchoAspect::Password)
        .await
        .unwrap());
    assert_eq!(MockDirectory::calls(&h.directory.update_calls), 1);

    // A second report is an independent change made on the target.
    h.advance(10);
    let stats = h.engine.handle_pushed_change(&h.system, pushed(&uid, echo)).await.unwrap();
    assert_eq!(stats.echoes_suppressed, 0);
    let after = h.identities.get_identity(identity.id).await.unwrap().unwrap().password_changed_at;
    assert_ne!(after, changed_at);
    assert_eq!(after, Some(h.clock.now()));
    assert_eq!(MockDirectory::calls(&h.directory.update_calls), 1);
}

#[tokio::test]
async fn test_attribute_echo_after_ttl_is_external() {
    let h = Harness::new(test_config());
    save_sync_config(&h).await;
    let (identity, account) = h.linked_account("jdoe", "jdoe@example.com").await;
    let uid = account.uid.clone().unwrap();

    h.identities
        .update_identity_attributes(
            identity.id,
            BTreeMap::from([("email".to_string(), "john@example.com".to_string())]),
        )
        .await
        .unwrap();
    h.engine
        .handle_event(IdentityEvent::AttributesChanged {
            identity: identity.id,
            changed: vec!["email".to_string()],
        })
        .await
        .unwrap();
    h.engine
        .provisioning()
        .dispatcher()
        .dispatch(&account.account_ref())
        .await
        .unwrap();
    let mail = EchoAspect::Attribute("mail".to_string());
    assert!(h.engine.echo_marker_exists(&h.system, &uid, &mail).await.unwrap());

    h.advance(test_config().echo.marker_ttl_secs + 1);
    assert!(!h.engine.echo_marker_exists(&h.system, &uid, &mail).await.unwrap());

    let stats = h
        .engine
        .handle_pushed_change(&h.system, pushed(&uid, attrs(&[("mail", "john@example.com")])))
        .await
        .unwrap();
    assert_eq!(stats.echoes_suppressed, 0);
    assert_eq!(stats.unchanged, 1);
}

#[tokio::test]
async fn test_attribute_echo_with_other_value_is_applied() {
    let h = Harness::new(test_config());
    save_sync_config(&h).await;
    let (identity, account) = h.linked_account("jdoe", "jdoe@example.com").await;
    let uid = account.uid.clone().unwrap();

    h.engine
        .enqueue(account.account_ref(), OperationKind::Update, attrs(&[("mail", "ours@example.com")]))
        .await
        .unwrap();
    h.engine
        .provisioning()
        .dispatcher()
        .dispatch(&account.account_ref())
        .await
        .unwrap();

    // Someone changed mail on the target to a value we never pushed.
    let stats = h
        .engine
        .handle_pushed_change(&h.system, pushed(&uid, attrs(&[("mail", "theirs@example.com")])))
        .await
        .unwrap();
    assert_eq!(stats.echoes_suppressed, 0);
    assert_eq!(stats.updated, 1);
    let owner = h.identities.get_identity(identity.id).await.unwrap().unwrap();
    assert_eq!(owner.attributes["email"], "theirs@example.com");

    // The marker for our own value is still live.
    let mail = EchoAspect::Attribute("mail".to_string());
    assert!(h.engine.echo_marker_exists(&h.system, &uid, &mail).await.unwrap());
}
