use crate::db::SqliteOrderStore;
use crate::errors::{OrderError, OrderResult};
use crate::models::{IntegrityReport, OrderDimension, OrderRecord, OrderScope, OrderSettings};
use crate::position;
use crate::store::{CustomFieldDirectory, OrderStore};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Moves, seeds and purges per-user orderings.
///
/// Every store call runs on the blocking pool under the configured deadline.
/// Concurrent writes to one scope are not coordinated here: the last upsert to
/// land wins.
#[derive(Clone)]
pub struct OrderService {
    store: Arc<dyn OrderStore>,
    custom_fields: Arc<dyn CustomFieldDirectory>,
    store_timeout: Duration,
}

impl OrderService {
    pub fn new(store: Arc<dyn OrderStore>, custom_fields: Arc<dyn CustomFieldDirectory>) -> Self {
        Self {
            store,
            custom_fields,
            store_timeout: OrderSettings::default().store_timeout(),
        }
    }

    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    pub fn from_settings(
        settings: &OrderSettings,
        custom_fields: Arc<dyn CustomFieldDirectory>,
    ) -> OrderResult<Self> {
        let store = SqliteOrderStore::from_settings(settings)?;
        Ok(Self::new(Arc::new(store), custom_fields).with_store_timeout(settings.store_timeout()))
    }

    pub async fn get_order(
        &self,
        scope: &OrderScope,
        cancel: &CancellationToken,
    ) -> OrderResult<Vec<OrderRecord>> {
        let records = self.fetch(scope, cancel).await?;
        tracing::debug!(
            dimension = scope.dimension().as_str(),
            user_id = %scope.user_id(),
            project_id = %scope.project_id(),
            rows = records.len(),
            "fetched order"
        );
        Ok(records)
    }

    /// Places `item_id` between the given neighbors and returns its new key.
    ///
    /// With one neighbor the item lands right next to it. With none it goes to
    /// the tail, or gets the initial key in an empty scope.
    pub async fn move_item(
        &self,
        scope: &OrderScope,
        item_id: Uuid,
        before_id: Option<Uuid>,
        after_id: Option<Uuid>,
        cancel: &CancellationToken,
    ) -> OrderResult<String> {
        if before_id == Some(item_id) || after_id == Some(item_id) {
            return Err(OrderError::InvalidOrder(format!(
                "item {} cannot be its own neighbor",
                item_id
            )));
        }

        let mut others = self.fetch(scope, cancel).await?;
        others.retain(|record| record.item_id != item_id);
        let position = next_position(&others, before_id, after_id)?;

        let store = Arc::clone(&self.store);
        let (target, key) = (*scope, position.clone());
        self.blocking("upsert", cancel, move |token| {
            store.upsert(&target, item_id, &key, token)
        })
        .await?;

        tracing::info!(
            dimension = scope.dimension().as_str(),
            user_id = %scope.user_id(),
            project_id = %scope.project_id(),
            item_id = %item_id,
            position = %position,
            "moved item"
        );
        Ok(position)
    }

    /// Rewrites the keys of `ordered_ids` so they sort in the given order.
    /// Rows of items not listed keep their keys.
    pub async fn reorder_batch(
        &self,
        scope: &OrderScope,
        ordered_ids: &[Uuid],
        cancel: &CancellationToken,
    ) -> OrderResult<()> {
        if ordered_ids.is_empty() {
            return Ok(());
        }
        let mut seen = HashSet::with_capacity(ordered_ids.len());
        if let Some(duplicate) = ordered_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(OrderError::InvalidOrder(format!(
                "item {} appears more than once in reorder",
                duplicate
            )));
        }

        let entries: Vec<(Uuid, String)> = ordered_ids
            .iter()
            .copied()
            .zip(position::spread(ordered_ids.len()))
            .collect();
        let count = entries.len();
        self.write_batch(scope, entries, cancel).await?;

        tracing::info!(
            dimension = scope.dimension().as_str(),
            user_id = %scope.user_id(),
            project_id = %scope.project_id(),
            items = count,
            "reordered scope"
        );
        Ok(())
    }

    /// Writes client-chosen keys as they are, after checking every key.
    ///
    /// Keys ending in `0` are refused: nothing sorts below `"0"`, and nothing
    /// fits between `"a"` and `"a00"`, so such keys would pin their
    /// neighbors in place.
    pub async fn apply_positions(
        &self,
        scope: &OrderScope,
        entries: &[(Uuid, String)],
        cancel: &CancellationToken,
    ) -> OrderResult<()> {
        if let Some((item_id, key)) = entries.iter().find(|(_, key)| !position::validate(key)) {
            return Err(OrderError::InvalidKey(format!(
                "position '{}' for item {} is not a valid key",
                key.escape_default(),
                item_id
            )));
        }
        if let Some((item_id, key)) = entries.iter().find(|(_, key)| key.ends_with('0')) {
            return Err(OrderError::InvalidKey(format!(
                "position '{}' for item {} must not end with '0'",
                key, item_id
            )));
        }
        if entries.is_empty() {
            return Ok(());
        }

        self.write_batch(scope, entries.to_vec(), cancel).await?;
        tracing::info!(
            dimension = scope.dimension().as_str(),
            user_id = %scope.user_id(),
            project_id = %scope.project_id(),
            items = entries.len(),
            "applied explicit positions"
        );
        Ok(())
    }

    /// Seeds role and stage column orders for a user joining a project, in the
    /// order the custom-field service lists them. Existing rows for listed
    /// columns are overwritten.
    pub async fn initialize_user_orders(
        &self,
        user_id: Uuid,
        project_id: Uuid,
        cancel: &CancellationToken,
    ) -> OrderResult<()> {
        let role_ids = self
            .list_column_ids(OrderDimension::RoleColumn, project_id, cancel)
            .await?;
        let stage_ids = self
            .list_column_ids(OrderDimension::StageColumn, project_id, cancel)
            .await?;

        let roles = OrderScope::role_columns(user_id, project_id);
        let stages = OrderScope::stage_columns(user_id, project_id);
        let (role_count, stage_count) = (role_ids.len(), stage_ids.len());
        self.write_batch(&roles, seed_entries(&role_ids)?, cancel).await?;
        self.write_batch(&stages, seed_entries(&stage_ids)?, cancel).await?;

        tracing::info!(
            user_id = %user_id,
            project_id = %project_id,
            roles = role_count,
            stages = stage_count,
            "initialized user orders"
        );
        Ok(())
    }

    /// Column order for display. An empty role or stage column scope is
    /// seeded from the project's custom fields first. Only the requested
    /// dimension is seeded; the other one is left as the user arranged it.
    pub async fn ensure_column_order(
        &self,
        scope: &OrderScope,
        cancel: &CancellationToken,
    ) -> OrderResult<Vec<OrderRecord>> {
        let records = self.fetch(scope, cancel).await?;
        if !records.is_empty() || scope.dimension().has_parent() {
            return Ok(records);
        }

        tracing::info!(
            dimension = scope.dimension().as_str(),
            user_id = %scope.user_id(),
            project_id = %scope.project_id(),
            "column order missing, seeding defaults"
        );
        let column_ids = self
            .list_column_ids(scope.dimension(), scope.project_id(), cancel)
            .await?;
        self.write_batch(scope, seed_entries(&column_ids)?, cancel).await?;
        self.fetch(scope, cancel).await
    }

    /// Sorts externally supplied items by the user's keys. Items without a
    /// row follow in their given order; rows for items not supplied are
    /// skipped.
    pub async fn arrange(
        &self,
        scope: &OrderScope,
        item_ids: &[Uuid],
        cancel: &CancellationToken,
    ) -> OrderResult<Vec<Uuid>> {
        let records = self.fetch(scope, cancel).await?;
        let rank: HashMap<Uuid, usize> = records
            .iter()
            .enumerate()
            .map(|(index, record)| (record.item_id, index))
            .collect();

        let mut arranged = item_ids.to_vec();
        arranged.sort_by_key(|id| match rank.get(id) {
            Some(index) => (false, *index),
            None => (true, 0),
        });
        Ok(arranged)
    }

    pub async fn remove_item(
        &self,
        scope: &OrderScope,
        item_id: Uuid,
        cancel: &CancellationToken,
    ) -> OrderResult<()> {
        let store = Arc::clone(&self.store);
        let target = *scope;
        self.blocking("delete", cancel, move |token| store.delete(&target, item_id, token))
            .await?;
        tracing::info!(
            dimension = scope.dimension().as_str(),
            user_id = %scope.user_id(),
            project_id = %scope.project_id(),
            item_id = %item_id,
            "removed item from order"
        );
        Ok(())
    }

    /// Drops a deleted role's column rows and every kanban order inside it,
    /// for all users, in one transaction.
    pub async fn purge_role(
        &self,
        project_id: Uuid,
        role_id: Uuid,
        cancel: &CancellationToken,
    ) -> OrderResult<usize> {
        self.purge(PurgeTarget::Column(OrderDimension::RoleColumn), project_id, role_id, cancel)
            .await
    }

    /// Stage counterpart of [`purge_role`](Self::purge_role).
    pub async fn purge_stage(
        &self,
        project_id: Uuid,
        stage_id: Uuid,
        cancel: &CancellationToken,
    ) -> OrderResult<usize> {
        self.purge(PurgeTarget::Column(OrderDimension::StageColumn), project_id, stage_id, cancel)
            .await
    }

    pub async fn purge_view(
        &self,
        project_id: Uuid,
        view_id: Uuid,
        cancel: &CancellationToken,
    ) -> OrderResult<usize> {
        self.purge(PurgeTarget::Parent(OrderDimension::BoardInView), project_id, view_id, cancel)
            .await
    }

    /// Drops a deleted kanban from every role, stage and view order.
    pub async fn purge_kanban(
        &self,
        project_id: Uuid,
        kanban_id: Uuid,
        cancel: &CancellationToken,
    ) -> OrderResult<usize> {
        let mut removed = 0;
        for dimension in [
            OrderDimension::KanbanInRole,
            OrderDimension::KanbanInStage,
            OrderDimension::BoardInView,
        ] {
            removed += self
                .purge(PurgeTarget::Item(dimension), project_id, kanban_id, cancel)
                .await?;
        }
        Ok(removed)
    }

    pub async fn verify_scope(
        &self,
        scope: &OrderScope,
        cancel: &CancellationToken,
    ) -> OrderResult<IntegrityReport> {
        let records = self.fetch(scope, cancel).await?;
        let report = integrity_report(scope.dimension(), &records);
        if !report.is_clean() {
            tracing::warn!(
                dimension = scope.dimension().as_str(),
                user_id = %scope.user_id(),
                project_id = %scope.project_id(),
                invalid_keys = report.invalid_keys.len(),
                duplicate_positions = report.duplicate_positions.len(),
                "order scope failed integrity check"
            );
        }
        Ok(report)
    }

    /// Like [`verify_scope`](Self::verify_scope) but fails with `InvalidKey`
    /// when a stored key is malformed. Duplicate keys are only reported.
    pub async fn ensure_scope_valid(
        &self,
        scope: &OrderScope,
        cancel: &CancellationToken,
    ) -> OrderResult<IntegrityReport> {
        let report = self.verify_scope(scope, cancel).await?;
        if let Some((item_id, key)) = report.invalid_keys.first() {
            return Err(OrderError::InvalidKey(format!(
                "{} stored key '{}' for item {} ({} invalid in scope)",
                scope.dimension().as_str(),
                key.escape_default(),
                item_id,
                report.invalid_keys.len()
            )));
        }
        Ok(report)
    }

    async fn list_column_ids(
        &self,
        dimension: OrderDimension,
        project_id: Uuid,
        cancel: &CancellationToken,
    ) -> OrderResult<Vec<Uuid>> {
        let custom_fields = Arc::clone(&self.custom_fields);
        match dimension {
            OrderDimension::RoleColumn => {
                self.blocking("list custom roles", cancel, move |_| {
                    custom_fields.list_custom_role_ids(project_id)
                })
                .await
            }
            OrderDimension::StageColumn => {
                self.blocking("list custom stages", cancel, move |_| {
                    custom_fields.list_custom_stage_ids(project_id)
                })
                .await
            }
            other => Err(OrderError::Internal(format!(
                "{} is not a column dimension",
                other.as_str()
            ))),
        }
    }

    async fn fetch(
        &self,
        scope: &OrderScope,
        cancel: &CancellationToken,
    ) -> OrderResult<Vec<OrderRecord>> {
        let store = Arc::clone(&self.store);
        let scope = *scope;
        self.blocking("fetch", cancel, move |_| store.fetch_sorted(&scope))
            .await
    }

    async fn write_batch(
        &self,
        scope: &OrderScope,
        entries: Vec<(Uuid, String)>,
        cancel: &CancellationToken,
    ) -> OrderResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let store = Arc::clone(&self.store);
        let scope = *scope;
        self.blocking("batch upsert", cancel, move |token| {
            store.batch_upsert(&scope, &entries, token)
        })
        .await
    }

    async fn purge(
        &self,
        target: PurgeTarget,
        project_id: Uuid,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> OrderResult<usize> {
        let store = Arc::clone(&self.store);
        let removed = self
            .blocking("purge", cancel, move |token| match target {
                PurgeTarget::Item(dimension) => store.purge_item(dimension, project_id, id, token),
                PurgeTarget::Parent(dimension) => store.purge_parent(dimension, project_id, id, token),
                PurgeTarget::Column(dimension) => store.purge_column(dimension, project_id, id, token),
            })
            .await?;

        let (dimension, kind) = match target {
            PurgeTarget::Item(dimension) => (dimension, "item"),
            PurgeTarget::Parent(dimension) => (dimension, "parent"),
            PurgeTarget::Column(dimension) => (dimension, "column"),
        };
        tracing::info!(
            dimension = dimension.as_str(),
            project_id = %project_id,
            id = %id,
            kind,
            removed,
            "purged order rows"
        );
        Ok(removed)
    }

    /// Runs `work` on the blocking pool under the store deadline. On timeout
    /// the token handed to `work` is cancelled so an unfinished write rolls
    /// back instead of committing late.
    async fn blocking<T, F>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        work: F,
    ) -> OrderResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&CancellationToken) -> OrderResult<T> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(OrderError::Cancelled(format!("{} not started", operation)));
        }

        let token = cancel.child_token();
        let task_token = token.clone();
        let task = tokio::task::spawn_blocking(move || work(&task_token));
        match timeout(self.store_timeout, task).await {
            Ok(Ok(result)) => {
                if let Err(OrderError::Cancelled(reason)) = &result {
                    tracing::warn!(operation, reason = %reason, "store call cancelled");
                }
                result
            }
            Ok(Err(error)) => Err(OrderError::Internal(format!(
                "{} task failed: {}",
                operation, error
            ))),
            Err(_) => {
                token.cancel();
                tracing::warn!(
                    operation,
                    timeout_ms = self.store_timeout.as_millis() as u64,
                    "store call timed out"
                );
                Err(OrderError::StoreUnavailable(format!(
                    "{} timed out after {}ms",
                    operation,
                    self.store_timeout.as_millis()
                )))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PurgeTarget {
    Item(OrderDimension),
    Parent(OrderDimension),
    Column(OrderDimension),
}

/// Key for an item placed among `others`, which excludes the item itself.
fn next_position(
    others: &[OrderRecord],
    before_id: Option<Uuid>,
    after_id: Option<Uuid>,
) -> OrderResult<String> {
    let locate = |id: Uuid| {
        others
            .iter()
            .position(|record| record.item_id == id)
            .ok_or_else(|| OrderError::NeighborNotFound(format!("item {} has no row in scope", id)))
    };

    match (before_id, after_id) {
        (Some(before_id), Some(after_id)) => {
            let lower = &others[locate(before_id)?].position;
            let upper = &others[locate(after_id)?].position;
            if lower >= upper {
                return Err(OrderError::InvalidOrder(format!(
                    "neighbor {} ('{}') does not sort before {} ('{}')",
                    before_id, lower, after_id, upper
                )));
            }
            position::between(lower, upper)
        }
        (Some(before_id), None) => {
            let index = locate(before_id)?;
            let lower = &others[index].position;
            match others.get(index + 1).filter(|next| next.position > *lower) {
                Some(next) => position::between(lower, &next.position),
                None => position::after(lower),
            }
        }
        (None, Some(after_id)) => {
            let index = locate(after_id)?;
            let upper = &others[index].position;
            match index
                .checked_sub(1)
                .and_then(|previous| others.get(previous))
                .filter(|previous| previous.position < *upper)
            {
                Some(previous) => position::between(&previous.position, upper),
                None => position::before(upper),
            }
        }
        (None, None) => match others.last() {
            Some(tail) => position::after(&tail.position),
            None => Ok(position::initial()),
        },
    }
}

fn seed_entries(ids: &[Uuid]) -> OrderResult<Vec<(Uuid, String)>> {
    let mut entries = Vec::with_capacity(ids.len());
    let mut key = position::initial();
    for id in ids {
        entries.push((*id, key.clone()));
        key = position::after(&key)?;
    }
    Ok(entries)
}

fn integrity_report(dimension: OrderDimension, records: &[OrderRecord]) -> IntegrityReport {
    let invalid_keys = records
        .iter()
        .filter(|record| !position::validate(&record.position))
        .map(|record| (record.item_id, record.position.clone()))
        .collect();

    let mut duplicate_positions: Vec<String> = records
        .windows(2)
        .filter(|pair| pair[0].position == pair[1].position)
        .map(|pair| pair[0].position.clone())
        .collect();
    duplicate_positions.dedup();

    IntegrityReport {
        dimension,
        row_count: records.len(),
        invalid_keys,
        duplicate_positions,
    }
}
