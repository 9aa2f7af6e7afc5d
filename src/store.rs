use crate::errors::OrderResult;
use crate::models::{OrderDimension, OrderRecord, OrderScope};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Durable storage for position keys.
///
/// Calls block on I/O. Writes take the caller's cancellation token and must
/// leave nothing behind when it fires before they commit.
pub trait OrderStore: Send + Sync {
    /// Rows of one scope, ascending by position. An empty scope is not an error.
    fn fetch_sorted(&self, scope: &OrderScope) -> OrderResult<Vec<OrderRecord>>;

    /// Create or replace one row. Key collisions with other items are not
    /// checked.
    fn upsert(
        &self,
        scope: &OrderScope,
        item_id: Uuid,
        position: &str,
        cancel: &CancellationToken,
    ) -> OrderResult<()>;

    /// All rows are written or none are.
    fn batch_upsert(
        &self,
        scope: &OrderScope,
        entries: &[(Uuid, String)],
        cancel: &CancellationToken,
    ) -> OrderResult<()>;

    /// Deleting a row that does not exist is a no-op.
    fn delete(&self, scope: &OrderScope, item_id: Uuid, cancel: &CancellationToken) -> OrderResult<()>;

    /// Removes an item's rows for every user (and every parent) of a dimension.
    fn purge_item(
        &self,
        dimension: OrderDimension,
        project_id: Uuid,
        item_id: Uuid,
        cancel: &CancellationToken,
    ) -> OrderResult<usize>;

    /// Removes a role or stage column for every user together with every
    /// kanban row nested under it, in one transaction.
    fn purge_column(
        &self,
        column: OrderDimension,
        project_id: Uuid,
        column_id: Uuid,
        cancel: &CancellationToken,
    ) -> OrderResult<usize>;

    /// Removes every row nested under a role, stage or view.
    fn purge_parent(
        &self,
        dimension: OrderDimension,
        project_id: Uuid,
        parent_id: Uuid,
        cancel: &CancellationToken,
    ) -> OrderResult<usize>;
}

/// Read side of the custom-field service, used to seed column orders.
pub trait CustomFieldDirectory: Send + Sync {
    fn list_custom_role_ids(&self, project_id: Uuid) -> OrderResult<Vec<Uuid>>;
    fn list_custom_stage_ids(&self, project_id: Uuid) -> OrderResult<Vec<Uuid>>;
}
