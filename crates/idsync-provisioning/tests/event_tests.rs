//! Identity Event and Worker Tests
//!
//! Identity lifecycle events turned into queued operations, and the
//! background worker draining them.

mod common;

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use idsync_connector::operation::Uid;
use idsync_connector::types::OperationKind;
use idsync_provisioning::{
    AccountState, Identity, IdentityEvent, IdentityStore, ProvisioningError,
};

use common::{attrs, test_config, Harness, MockDirectory, OBJECT_CLASS};

async fn wait_until_drained(h: &Harness) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !h.batches.is_empty().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queue was not drained");
}

#[tokio::test]
async fn test_assignment_creates_account_through_worker() {
    let h = Harness::new(test_config());
    let worker = h.engine.spawn_worker().unwrap();
    assert!(h.engine.spawn_worker().is_none());

    let kim = Identity::new()
        .with_attribute("login", "kim")
        .with_attribute("email", "kim@example.com")
        .with_attribute("name", "Kim");
    h.identities.insert_identity(kim.clone()).await;

    let enqueued = h
        .engine
        .handle_event(IdentityEvent::AccountAssigned {
            identity: kim.id,
            system: h.system.clone(),
            object_class: OBJECT_CLASS.to_string(),
        })
        .await
        .unwrap();
    assert_eq!(enqueued.len(), 1);

    wait_until_drained(&h).await;
    worker.stop().await;

    let accounts = h.identities.linked_accounts(kim.id).await.unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].uid, Some(Uid::from_value("kim")));
    assert_eq!(accounts[0].state, AccountState::Active);

    let object = h.directory.object(&Uid::from_value("kim")).unwrap();
    assert_eq!(object.get_string("mail"), Some("kim@example.com"));
    assert_eq!(object.get_string("cn"), Some("Kim"));
    assert_eq!(MockDirectory::calls(&h.directory.create_calls), 1);
}

#[tokio::test]
async fn test_unmapped_attribute_change_enqueues_nothing() {
    let h = Harness::new(test_config());
    let (identity, _) = h.linked_account("lee", "lee@example.com").await;

    h.identities
        .update_identity_attributes(
            identity.id,
            BTreeMap::from([("phone".to_string(), "555-0100".to_string())]),
        )
        .await
        .unwrap();
    let enqueued = h
        .engine
        .handle_event(IdentityEvent::AttributesChanged {
            identity: identity.id,
            changed: vec!["phone".to_string()],
        })
        .await
        .unwrap();
    assert!(enqueued.is_empty());
    assert!(h.batches.is_empty().await);
}

#[tokio::test]
async fn test_revocation_deletes_only_after_last_link() {
    let h = Harness::new(test_config());
    let (first, mut account) = h.linked_account("max", "max@example.com").await;
    let second = Identity::new().with_attribute("login", "max2");
    h.identities.insert_identity(second.clone()).await;
    account.links.insert(second.id);
    h.identities.save_account(account.clone()).await.unwrap();

    let enqueued = h
        .engine
        .handle_event(IdentityEvent::AccountRevoked {
            identity: first.id,
            account: account.id,
        })
        .await
        .unwrap();
    assert!(enqueued.is_empty());
    let stored = h.identities.get_account(account.id).await.unwrap().unwrap();
    assert_eq!(stored.links.len(), 1);

    let enqueued = h
        .engine
        .handle_event(IdentityEvent::AccountRevoked {
            identity: second.id,
            account: account.id,
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
    assert!(h.directory.object(account.uid.as_ref().unwrap()).is_none());
    assert!(h.identities.get_account(account.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_event_for_unknown_identity_fails() {
    let h = Harness::new(test_config());
    let err = h
        .engine
        .handle_event(IdentityEvent::AccountAssigned {
            identity: Identity::new().id,
            system: h.system.clone(),
            object_class: OBJECT_CLASS.to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisioningError::NotFound { .. }));
    assert!(h.batches.is_empty().await);
}

#[tokio::test]
async fn test_provision_sync_applies_before_returning() {
    let h = Harness::new(test_config());
    let (_, account) = h.linked_account("nia", "nia@example.com").await;

    h.engine
        .provision_sync(
            account.account_ref(),
            OperationKind::Update,
            attrs(&[("cn", "Nia Smith")]),
            BTreeMap::new(),
        )
        .await
        .unwrap();

    assert!(h.batches.is_empty().await);
    let object = h.directory.object(account.uid.as_ref().unwrap()).unwrap();
    assert_eq!(object.get_string("cn"), Some("Nia Smith"));
}

#[tokio::test]
async fn test_provision_sync_reports_connector_failure() {
    let h = Harness::new(test_config());
    let (_, account) = h.linked_account("oli", "oli@example.com").await;
    h.directory.fail_writes.store(true, Ordering::SeqCst);

    let err = h
        .engine
        .provision_sync(
            account.account_ref(),
            OperationKind::Update,
            attrs(&[("cn", "Oli")]),
            BTreeMap::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "CONNECTOR_UNAVAILABLE");
    // The operation stays queued for a later retry.
    assert_eq!(h.batches.len().await, 1);
}

#[tokio::test]
async fn test_worker_stop_cancels_active_sweep() {
    let h = Harness::new(test_config());
    let mut accounts = Vec::new();
    for login in ["pia", "quin"] {
        let (_, account) = h.linked_account(login, &format!("{login}@example.com")).await;
        accounts.push(account);
    }
    // Two failures stay below the block threshold and leave both batches pending.
    h.directory.set_fail_writes(true);
    for account in &accounts {
        h.engine
            .provision_sync(
                account.account_ref(),
                OperationKind::Update,
                attrs(&[("cn", "renamed")]),
                BTreeMap::new(),
            )
            .await
            .unwrap_err();
    }
    h.directory.set_fail_writes(false);
    h.advance(600);

    let gate = Arc::new(Semaphore::new(0));
    h.directory.gate_writes(Arc::clone(&gate));
    let worker = h.engine.spawn_worker().unwrap();
    let sweep = h.engine.retry_sweep(None).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while MockDirectory::calls(&h.directory.update_calls) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sweep made no progress");

    worker.stop().await;
    gate.add_permits(1);
    let report = sweep.wait().await.unwrap();
    assert!(report.canceled);
    assert_eq!(report.processed, 1);
    assert_eq!(h.batches.len().await, 1);

    // Nothing is left holding the sweep slot.
    h.directory.ungate_writes();
    let rest = h.engine.retry_sweep(None).unwrap().wait().await.unwrap();
    assert_eq!(rest.executed, 1);
    assert!(h.batches.is_empty().await);
}
