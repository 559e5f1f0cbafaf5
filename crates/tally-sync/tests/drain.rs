//! Drain behavior across cache, queue and backend.

mod common;

use serde_json::json;
use std::time::Duration;

use common::{session, sorted};
use tally_core::{NewOperation, Record, RecordId, ViewKey};
use tally_sync::gateway::{GatewayCall, GatewayError};
use tally_sync::{EntityKind, MutationOutcome, RemoteGateway};

fn sale(quantity: i64) -> serde_json::Value {
    json!({ "inventory_id": 1, "quantity": quantity, "sale_type": "grams", "total_price": quantity * 10 })
}

#[tokio::test]
async fn drain_preserves_enqueue_order() {
    let s = session(true, vec![(EntityKind::Sale, vec![json!({ "id": 1, "quantity": 1 })])]);
    s.services.sales.list().await.unwrap();
    s.flag.set_online(false);

    s.services.sales.create(sale(2)).await.unwrap();
    s.services
        .sales
        .update(&RecordId::from(1), json!({ "quantity": 5 }))
        .await
        .unwrap();
    s.services.sales.create(sale(3)).await.unwrap();
    s.services.sales.delete(&RecordId::from(1)).await.unwrap();

    s.flag.set_online(true);
    let report = s.services.sales.drain().await.unwrap().report().cloned().unwrap();
    assert_eq!(report.confirmed, 4);

    let calls = s.gateway(EntityKind::Sale).mutation_calls();
    assert!(matches!(&calls[0], GatewayCall::Create { payload } if payload["quantity"] == 2));
    assert!(matches!(&calls[1], GatewayCall::Update { id, .. } if id == &RecordId::from(1)));
    assert!(matches!(&calls[2], GatewayCall::Create { payload } if payload["quantity"] == 3));
    assert!(matches!(&calls[3], GatewayCall::Delete { id } if id == &RecordId::from(1)));
}

#[tokio::test]
async fn drain_stops_at_first_failure() {
    let s = session(
        true,
        vec![(
            EntityKind::Inventory,
            vec![json!({ "id": 1 }), json!({ "id": 2 }), json!({ "id": 3 })],
        )],
    );
    s.flag.set_online(false);

    for id in [1, 2, 3] {
        s.services
            .inventory
            .update(&RecordId::from(id), json!({ "price_per_gram": 20 }))
            .await
            .unwrap();
    }

    s.gateway(EntityKind::Inventory).fail_on(|call| match call {
        GatewayCall::Update { id, .. } if id == &RecordId::from(2) => {
            Some(GatewayError::Unavailable("connection reset".into()))
        }
        _ => None,
    });
    s.flag.set_online(true);

    let report = s.services.inventory.drain().await.unwrap().report().cloned().unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.confirmed, 1);
    assert_eq!(report.remaining, 2);
    assert!(report.failure.as_ref().unwrap().connectivity);

    let pending = s.services.inventory.pending_operations().await.unwrap();
    let targets: Vec<_> = pending.iter().filter_map(|op| op.target_id.clone()).collect();
    assert_eq!(targets, vec![RecordId::from(2), RecordId::from(3)]);

    // C was never dispatched.
    let gateway = s.gateway(EntityKind::Inventory);
    assert!(gateway
        .mutation_calls()
        .iter()
        .all(|c| c.target() != Some(&RecordId::from(3))));

    // A is not resubmitted on the next pass.
    gateway.clear_failures();
    gateway.clear_calls();
    let report = s.services.inventory.drain().await.unwrap().report().cloned().unwrap();
    assert!(report.is_complete());

    let retried: Vec<_> = gateway
        .mutation_calls()
        .iter()
        .filter_map(|c| c.target().cloned())
        .collect();
    assert_eq!(retried, vec![RecordId::from(2), RecordId::from(3)]);
}

#[tokio::test]
async fn full_drain_converges_cache_with_backend() {
    let s = session(
        true,
        vec![(
            EntityKind::Joint,
            vec![
                json!({ "id": 1, "assigned_to": 4, "joints_count": 10 }),
                json!({ "id": 2, "assigned_to": 5, "joints_count": 6 }),
            ],
        )],
    );
    s.services.joints.list().await.unwrap();
    s.services.joints.list_by_employee(&RecordId::from(4)).await.unwrap();
    s.services.joints.wait_for_background().await;
    s.flag.set_online(false);

    s.services
        .joints
        .create(json!({
            "inventory_id": 1, "grams_used": 3, "joints_count": 6,
            "price_per_joint": 5, "assigned_to": 4
        }))
        .await
        .unwrap();
    s.services
        .joints
        .assign_to_employee(&RecordId::from(2), &RecordId::from(4))
        .await
        .unwrap();

    s.flag.set_online(true);
    let report = s.services.joints.drain().await.unwrap().report().cloned().unwrap();
    assert!(report.is_complete());
    assert_eq!(report.refreshed, 2);

    let gateway = s.gateway(EntityKind::Joint);
    let cache = s.services.joints.cache();
    for view in [ViewKey::all(), ViewKey::employee(4)] {
        let remote = gateway.list(&view).await.unwrap();
        let cached = cache.read(&view).await.unwrap().unwrap();
        assert_eq!(sorted(cached), sorted(remote));
    }
}

#[tokio::test]
async fn optimistic_records_are_replaced_after_drain() {
    let s = session(false, vec![]);

    let outcome = s
        .services
        .inventory
        .create(json!({ "strain_name": "OG", "price_per_gram": 12, "buying_price": 7 }))
        .await
        .unwrap();
    let local_id = match &outcome {
        MutationOutcome::Queued { value, .. } => value.id.clone(),
        MutationOutcome::Confirmed(_) => panic!("expected a queued create"),
    };
    assert!(local_id.is_local());

    s.flag.set_online(true);
    s.services.inventory.drain().await.unwrap();

    let cached = s.services.inventory.list().await.unwrap();
    assert_eq!(cached.len(), 1);
    assert!(cached.iter().all(|r| !r.id.is_local() && !r.is_pending()));
    assert_eq!(cached[0].field("strain_name"), Some(&json!("OG")));
    s.services.inventory.wait_for_background().await;
}

#[tokio::test]
async fn empty_drain_is_idempotent() {
    let s = session(true, vec![]);

    for _ in 0..2 {
        let report = s.services.sales.drain().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(report.refreshed, 0);
    }
    assert!(s.gateway(EntityKind::Sale).calls().is_empty());
}

#[tokio::test]
async fn partial_drain_keeps_unconfirmed_tail_and_cache() {
    let s = session(
        true,
        vec![(
            EntityKind::Sale,
            vec![json!({ "id": 7, "qty": 1 }), json!({ "id": 9, "qty": 2 })],
        )],
    );
    s.services.sales.list().await.unwrap();

    let queue = s.services.sales.queue();
    let cache = s.services.sales.cache();

    let local = RecordId::local();
    let create = queue
        .enqueue(NewOperation::create(EntityKind::Sale, json!({ "name": "A" }), local.clone()))
        .await
        .unwrap();
    cache
        .append_optimistic(
            &ViewKey::all(),
            Record::optimistic(local, &create.payload, create.pending_marker()).unwrap(),
        )
        .await
        .unwrap();
    queue
        .enqueue(NewOperation::update(EntityKind::Sale, 7.into(), json!({ "qty": 3 })))
        .await
        .unwrap();
    let delete = queue
        .enqueue(NewOperation::delete(EntityKind::Sale, 9.into()))
        .await
        .unwrap();

    s.gateway(EntityKind::Sale).fail_on(|call| match call {
        GatewayCall::Delete { .. } => Some(GatewayError::Rejected {
            status: 409,
            message: "sale is locked".into(),
        }),
        _ => None,
    });

    let report = s.services.sales.drain().await.unwrap().report().cloned().unwrap();
    assert_eq!(report.confirmed, 2);
    assert_eq!(report.failure.as_ref().unwrap().seq, delete.seq);

    let pending = s.services.sales.pending_operations().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].seq, delete.seq);

    let cached = cache.read(&ViewKey::all()).await.unwrap().unwrap();
    let created = cached
        .iter()
        .find(|r| r.field("name") == Some(&json!("A")))
        .unwrap();
    assert!(!created.id.is_local());
    assert!(!created.is_pending());

    let seven = cached.iter().find(|r| r.id == RecordId::from(7)).unwrap();
    assert_eq!(seven.field("qty"), Some(&json!(3)));
    assert!(cached.iter().any(|r| r.id == RecordId::from(9)));

    let drained = s.observer.reports();
    assert_eq!(drained.len(), 1);
    assert!(!drained[0].is_complete());
}

#[tokio::test]
async fn dependent_update_survives_partial_drain() {
    let s = session(false, vec![]);

    let created = s
        .services
        .sales
        .create(sale(1))
        .await
        .unwrap()
        .into_value();
    s.services
        .sales
        .update(&created.id, json!({ "quantity": 4 }))
        .await
        .unwrap();

    s.flag.set_online(true);
    let gateway = s.gateway(EntityKind::Sale);
    gateway.fail_on(|call| match call {
        GatewayCall::Update { .. } => Some(GatewayError::Timeout(Duration::from_secs(2))),
        _ => None,
    });

    let report = s.services.sales.drain().await.unwrap().report().cloned().unwrap();
    assert_eq!(report.confirmed, 1);

    let pending = s.services.sales.pending_operations().await.unwrap();
    assert_eq!(pending[0].target_id, Some(RecordId::from(1)));

    gateway.clear_failures();
    let report = s.services.sales.drain().await.unwrap().report().cloned().unwrap();
    assert!(report.is_complete());
    assert_eq!(
        gateway.record(&RecordId::from(1)).unwrap().field("quantity"),
        Some(&json!(4))
    );
}

#[tokio::test]
async fn concurrent_drain_returns_busy() {
    let s = session(true, vec![(EntityKind::Sale, vec![json!({ "id": 1 })])]);
    s.flag.set_online(false);
    s.services.sales.delete(&RecordId::from(1)).await.unwrap();
    s.flag.set_online(true);

    let gateway = s.gateway(EntityKind::Sale);
    gateway.set_latency(Duration::from_millis(100));

    let (first, second) = tokio::join!(s.services.sales.drain(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        s.services.sales.drain().await
    });

    assert!(first.unwrap().report().unwrap().is_complete());
    assert!(second.unwrap().is_busy());
    assert_eq!(gateway.mutation_calls().len(), 1);
}

#[tokio::test]
async fn late_edit_on_drained_create_reaches_backend_record() {
    let s = session(false, vec![]);

    let created = s
        .services
        .inventory
        .create(json!({ "strain_name": "OG", "price_per_gram": 12, "buying_price": 7 }))
        .await
        .unwrap()
        .into_value();
    assert!(created.id.is_local());

    s.flag.set_online(true);
    let report = s.services.inventory.drain().await.unwrap().report().cloned().unwrap();
    assert!(report.is_complete());
    assert_eq!(report.remaining, 0);

    // The caller still holds the local id; edit it while offline.
    s.flag.set_online(false);
    s.services
        .inventory
        .update(&created.id, json!({ "price_per_gram": 15 }))
        .await
        .unwrap();
    let pending = s.services.inventory.pending_operations().await.unwrap();
    assert_eq!(pending[0].target_id, Some(RecordId::from(1)));

    s.flag.set_online(true);
    let report = s.services.inventory.drain().await.unwrap().report().cloned().unwrap();
    assert!(report.is_complete());
    assert_eq!(report.remaining, 0);

    let gateway = s.gateway(EntityKind::Inventory);
    assert_eq!(
        gateway.record(&RecordId::from(1)).unwrap().field("price_per_gram"),
        Some(&json!(15))
    );

    // Online, the same id goes straight to the backend.
    let outcome = s
        .services
        .inventory
        .delete(&created.id)
        .await
        .unwrap();
    assert!(!outcome.is_queued());
    assert!(gateway.records().is_empty());
}
