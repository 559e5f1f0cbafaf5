//! # Pending Overlay
//!
//! Re-applies queued, unconfirmed mutations on top of a freshly fetched
//! view, so a refresh never makes an offline edit disappear from the
//! dashboard before it has been confirmed.
//!
//! ```text
//!   backend list          pending log                 cached view
//!   ───────────────       ──────────────────          ─────────────────
//!   [7, 9]          +     #1 create (local-…)    =    [7', local-…]
//!                         #2 update 7 {qty: 3}
//!                         #3 delete 9
//! ```

use crate::types::{EntityKind, OperationKind, PendingOperation, Record, ViewKey};

/// Applies `ops` in order to `records`, a snapshot of `view`.
///
/// Operations for other entity types are ignored. A create whose optimistic
/// record is already present (matched by pending seq) is not duplicated.
pub fn apply_pending(
    entity: EntityKind,
    view: &ViewKey,
    records: &mut Vec<Record>,
    ops: &[PendingOperation],
) {
    for op in ops.iter().filter(|op| op.entity == entity) {
        match &op.kind {
            OperationKind::Create => {
                let Some(local_id) = op.local_id.clone() else {
                    continue;
                };
                if records.iter().any(|r| r.pending_seq() == Some(op.seq)) {
                    continue;
                }
                if let Ok(record) = Record::optimistic(local_id, &op.payload, op.pending_marker()) {
                    if view.admits(entity, &record) {
                        records.push(record);
                    }
                }
            }
            OperationKind::Delete => {
                if let Some(target) = &op.target_id {
                    records.retain(|r| &r.id != target);
                }
            }
            OperationKind::Update | OperationKind::Custom(_) => {
                let Some(target) = &op.target_id else {
                    continue;
                };
                if let Some(position) = records.iter().position(|r| &r.id == target) {
                    records[position].merge_payload(&op.payload);
                    if !view.admits(entity, &records[position]) {
                        records.remove(position);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewOperation, RecordId};
    use chrono::Utc;
    use serde_json::json;

    fn pending(seq: u64, op: NewOperation) -> PendingOperation {
        PendingOperation::from_new(op, seq, Utc::now())
    }

    #[test]
    fn test_overlay_on_fresh_list() {
        let mut records = vec![
            Record::from_value(json!({ "id": 7, "qty": 1 })).unwrap(),
            Record::from_value(json!({ "id": 9 })).unwrap(),
        ];
        let ops = vec![
            pending(
                1,
                NewOperation::create(EntityKind::Sale, json!({ "name": "A" }), RecordId::local()),
            ),
            pending(2, NewOperation::update(EntityKind::Sale, 7.into(), json!({ "qty": 3 }))),
            pending(3, NewOperation::delete(EntityKind::Sale, 9.into())),
            pending(4, NewOperation::delete(EntityKind::Joint, 7.into())),
        ];

        apply_pending(EntityKind::Sale, &ViewKey::all(), &mut records, &ops);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].field("qty"), Some(&json!(3)));
        assert!(records[1].is_pending());

        // Applying again does not duplicate the optimistic record.
        apply_pending(EntityKind::Sale, &ViewKey::all(), &mut records, &ops);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_overlay_respects_view_membership() {
        let mut records = vec![Record::from_value(json!({ "id": 3, "assigned_to": 1 })).unwrap()];
        let ops = vec![
            pending(
                1,
                NewOperation::custom(EntityKind::Joint, "assign", 3.into(), json!({ "assigned_to": 2 })),
            ),
            pending(
                2,
                NewOperation::create(EntityKind::Joint, json!({ "assigned_to": 5 }), RecordId::local()),
            ),
        ];

        apply_pending(EntityKind::Joint, &ViewKey::employee(1), &mut records, &ops);
        assert!(records.is_empty());
    }
}
