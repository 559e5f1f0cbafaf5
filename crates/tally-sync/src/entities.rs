//! # Entity Services
//!
//! Thin, typed faces over [`EntityService`] for the four dashboard entity
//! types. Each derefs to the generic service, so `list`, `create`,
//! `update`, `delete`, `drain` and friends are available on all of them.

use serde_json::{json, Value};
use std::ops::Deref;

use tally_core::{MutationOutcome, Record, RecordId, ViewKey};

use crate::error::SyncResult;
use crate::service::EntityService;

/// Custom operation name for assigning a production unit to an employee.
pub const ASSIGN_OPERATION: &str = "assign";

/// Custom operation name for changing a user's role.
pub const ROLE_OPERATION: &str = "role";

macro_rules! entity_service {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        pub struct $name(EntityService);

        impl $name {
            pub fn new(service: EntityService) -> Self {
                $name(service)
            }

            pub fn into_inner(self) -> EntityService {
                self.0
            }
        }

        impl Deref for $name {
            type Target = EntityService;

            fn deref(&self) -> &EntityService {
                &self.0
            }
        }
    };
}

entity_service!(
    /// Inventory lots.
    InventoryService
);

entity_service!(
    /// Production units ("joints") rolled from inventory.
    JointService
);

entity_service!(
    /// Sales.
    SaleService
);

entity_service!(
    /// Dashboard users. The backend offers no generic update or delete for
    /// users; role changes go through [`UserService::update_role`].
    UserService
);

impl InventoryService {
    /// Registers a new inventory lot.
    pub async fn add_lot(&self, lot: Value) -> SyncResult<MutationOutcome<Record>> {
        self.create(lot).await
    }
}

impl JointService {
    /// Production units assigned to one employee.
    pub async fn list_by_employee(&self, employee_id: &RecordId) -> SyncResult<Vec<Record>> {
        self.list_view(&ViewKey::employee(employee_id)).await
    }

    /// Assigns a production unit to an employee.
    pub async fn assign_to_employee(
        &self,
        joint_id: &RecordId,
        employee_id: &RecordId,
    ) -> SyncResult<MutationOutcome<Record>> {
        self.custom(ASSIGN_OPERATION, joint_id, json!({ "assigned_to": employee_id }))
            .await
    }
}

impl SaleService {
    /// Sales recorded by one seller.
    pub async fn list_by_seller(&self, seller_id: &RecordId) -> SyncResult<Vec<Record>> {
        self.list_view(&ViewKey::by("seller", seller_id)).await
    }
}

impl UserService {
    /// Users with the `employee` role.
    pub async fn list_employees(&self) -> SyncResult<Vec<Record>> {
        self.list_view(&ViewKey::by("role", "employee")).await
    }

    /// Registers a new user.
    pub async fn sign_up(&self, user: Value) -> SyncResult<MutationOutcome<Record>> {
        self.create(user).await
    }

    /// Changes a user's role (`employee` or `superadmin`).
    pub async fn update_role(
        &self,
        user_id: &RecordId,
        role: &str,
    ) -> SyncResult<MutationOutcome<Record>> {
        self.custom(ROLE_OPERATION, user_id, json!({ "role": role }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ConnectivityFlag;
    use crate::error::SyncError;
    use crate::gateway::MemoryGateway;
    use crate::observer::NoOpObserver;
    use crate::service::ServiceContext;
    use std::sync::Arc;
    use tally_core::EntityKind;
    use tally_store::MemoryKvStore;

    fn service(entity: EntityKind, backend: Vec<Value>, flag: &ConnectivityFlag) -> EntityService {
        let ctx = ServiceContext::new(Arc::new(flag.clone())).with_observer(Arc::new(NoOpObserver));
        EntityService::new(
            entity,
            Arc::new(MemoryKvStore::new(entity.cache_instance())),
            Arc::new(MemoryKvStore::new(entity.queue_instance())),
            Arc::new(MemoryGateway::with_records(entity, backend)),
            &ctx,
        )
    }

    #[tokio::test]
    async fn test_offline_assignment_moves_between_employee_views() {
        let flag = ConnectivityFlag::new(true);
        let joints = JointService::new(service(
            EntityKind::Joint,
            vec![
                json!({ "id": 1, "assigned_to": 4 }),
                json!({ "id": 2, "assigned_to": 5 }),
            ],
            &flag,
        ));

        joints.list().await.unwrap();
        assert_eq!(joints.list_by_employee(&RecordId::from(4)).await.unwrap().len(), 1);
        assert_eq!(joints.list_by_employee(&RecordId::from(5)).await.unwrap().len(), 1);
        joints.wait_for_background().await;

        flag.set_online(false);
        let outcome = joints
            .assign_to_employee(&RecordId::from(1), &RecordId::from(5))
            .await
            .unwrap();
        assert!(outcome.is_queued());

        assert!(joints.list_by_employee(&RecordId::from(4)).await.unwrap().is_empty());
        assert_eq!(joints.list_by_employee(&RecordId::from(5)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_role_change_validated_offline() {
        let flag = ConnectivityFlag::new(false);
        let users = UserService::new(service(EntityKind::User, vec![], &flag));

        let err = users.update_role(&RecordId::from(3), "owner").await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        let outcome = users.update_role(&RecordId::from(3), "superadmin").await.unwrap();
        assert!(outcome.is_queued());
        assert_eq!(outcome.value().field("role"), Some(&json!("superadmin")));
    }

    #[tokio::test]
    async fn test_employee_view() {
        let flag = ConnectivityFlag::new(true);
        let users = UserService::new(service(
            EntityKind::User,
            vec![
                json!({ "id": 1, "role": "superadmin" }),
                json!({ "id": 2, "role": "employee" }),
            ],
            &flag,
        ));

        let employees = users.list_employees().await.unwrap();
        assert_eq!(employees.len(), 1);
        assert_eq!(employees[0].id, RecordId::from(2));
    }
}
