use crate::errors::{OrderError, OrderResult};
use crate::models::{OrderDimension, OrderRecord, OrderScope, OrderSettings};
use crate::store::OrderStore;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Table layout of one dimension. Every table is keyed by
/// `(user_id, project_id, [parent], item)`.
#[derive(Debug, Clone, Copy)]
struct TableSpec {
    table: &'static str,
    parent_column: Option<&'static str>,
    item_column: &'static str,
}

fn table_spec(dimension: OrderDimension) -> TableSpec {
    match dimension {
        OrderDimension::RoleColumn => TableSpec {
            table: "user_role_column_order",
            parent_column: None,
            item_column: "custom_role_id",
        },
        OrderDimension::StageColumn => TableSpec {
            table: "user_stage_column_order",
            parent_column: None,
            item_column: "custom_stage_id",
        },
        OrderDimension::KanbanInRole => TableSpec {
            table: "user_kanban_order_in_role",
            parent_column: Some("custom_role_id"),
            item_column: "kanban_id",
        },
        OrderDimension::KanbanInStage => TableSpec {
            table: "user_kanban_order_in_stage",
            parent_column: Some("custom_stage_id"),
            item_column: "kanban_id",
        },
        OrderDimension::BoardInView => TableSpec {
            table: "user_board_order_in_view",
            parent_column: Some("view_id"),
            item_column: "board_id",
        },
    }
}

impl TableSpec {
    fn key_columns(&self) -> Vec<&'static str> {
        let mut columns = vec!["user_id", "project_id"];
        columns.extend(self.parent_column);
        columns
    }

    fn scope_filter(&self) -> String {
        self.key_columns()
            .iter()
            .enumerate()
            .map(|(index, column)| format!("{} = ?{}", column, index + 1))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn upsert_sql(&self) -> String {
        let mut columns = self.key_columns();
        columns.push(self.item_column);
        let conflict = columns.join(", ");
        columns.extend(["position", "updated_at"]);
        let placeholders = (1..=columns.len())
            .map(|index| format!("?{}", index))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({})
             ON CONFLICT({}) DO UPDATE SET position = excluded.position, updated_at = excluded.updated_at",
            self.table,
            columns.join(", "),
            placeholders,
            conflict
        )
    }
}

fn scope_values(scope: &OrderScope) -> Vec<String> {
    let mut values = vec![scope.user_id().to_string(), scope.project_id().to_string()];
    values.extend(scope.parent_id().map(|parent| parent.to_string()));
    values
}

#[derive(Debug)]
pub struct SqliteOrderStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl SqliteOrderStore {
    pub fn open(path: &Path, busy_timeout: Duration) -> OrderResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        Self::from_connection(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> OrderResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    pub fn from_settings(settings: &OrderSettings) -> OrderResult<Self> {
        Self::open(&settings.database_path, settings.busy_timeout())
    }

    fn from_connection(conn: Connection, db_path: Option<PathBuf>) -> OrderResult<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn lock(&self) -> OrderResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| OrderError::StoreUnavailable("database mutex poisoned".to_string()))
    }
}

impl OrderStore for SqliteOrderStore {
    fn fetch_sorted(&self, scope: &OrderScope) -> OrderResult<Vec<OrderRecord>> {
        let spec = table_spec(scope.dimension());
        let query = format!(
            "SELECT {item}, position, updated_at FROM {table} WHERE {filter}
             ORDER BY position ASC, {item} ASC",
            item = spec.item_column,
            table = spec.table,
            filter = spec.scope_filter(),
        );

        let conn = self.lock()?;
        let mut statement = conn.prepare(&query)?;
        let records = statement
            .query_map(params_from_iter(scope_values(scope)), parse_order_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn upsert(
        &self,
        scope: &OrderScope,
        item_id: Uuid,
        position: &str,
        cancel: &CancellationToken,
    ) -> OrderResult<()> {
        let spec = table_spec(scope.dimension());
        let mut values = scope_values(scope);
        values.push(item_id.to_string());
        values.push(position.to_string());
        values.push(Utc::now().to_rfc3339());

        let conn = self.lock()?;
        ensure_live(cancel, "upsert")?;
        conn.execute(&spec.upsert_sql(), params_from_iter(values))?;
        Ok(())
    }

    fn batch_upsert(
        &self,
        scope: &OrderScope,
        entries: &[(Uuid, String)],
        cancel: &CancellationToken,
    ) -> OrderResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let spec = table_spec(scope.dimension());
        let base = scope_values(scope);
        let now = Utc::now().to_rfc3339();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut statement = tx.prepare(&spec.upsert_sql())?;
            for (item_id, position) in entries {
                ensure_live(cancel, "batch upsert")?;
                let mut values = base.clone();
                values.push(item_id.to_string());
                values.push(position.clone());
                values.push(now.clone());
                statement.execute(params_from_iter(values))?;
            }
        }
        ensure_live(cancel, "batch upsert")?;
        tx.commit()?;
        Ok(())
    }

    fn delete(&self, scope: &OrderScope, item_id: Uuid, cancel: &CancellationToken) -> OrderResult<()> {
        let spec = table_spec(scope.dimension());
        let mut values = scope_values(scope);
        let query = format!(
            "DELETE FROM {} WHERE {} AND {} = ?{}",
            spec.table,
            spec.scope_filter(),
            spec.item_column,
            values.len() + 1
        );
        values.push(item_id.to_string());

        let conn = self.lock()?;
        ensure_live(cancel, "delete")?;
        conn.execute(&query, params_from_iter(values))?;
        Ok(())
    }

    fn purge_item(
        &self,
        dimension: OrderDimension,
        project_id: Uuid,
        item_id: Uuid,
        cancel: &CancellationToken,
    ) -> OrderResult<usize> {
        let spec = table_spec(dimension);
        let query = format!(
            "DELETE FROM {} WHERE project_id = ?1 AND {} = ?2",
            spec.table, spec.item_column
        );

        let conn = self.lock()?;
        ensure_live(cancel, "purge item")?;
        let removed = conn.execute(&query, params![project_id.to_string(), item_id.to_string()])?;
        Ok(removed)
    }

    fn purge_column(
        &self,
        column: OrderDimension,
        project_id: Uuid,
        column_id: Uuid,
        cancel: &CancellationToken,
    ) -> OrderResult<usize> {
        let Some(nested) = column.nested() else {
            return Err(OrderError::Internal(format!(
                "{} is not a column dimension",
                column.as_str()
            )));
        };
        let column_spec = table_spec(column);
        let nested_spec = table_spec(nested);
        let Some(parent_column) = nested_spec.parent_column else {
            return Err(OrderError::Internal(format!(
                "{} rows are not nested under a parent",
                nested.as_str()
            )));
        };
        let (project, column_key) = (project_id.to_string(), column_id.to_string());

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut removed = tx.execute(
            &format!(
                "DELETE FROM {} WHERE project_id = ?1 AND {} = ?2",
                column_spec.table, column_spec.item_column
            ),
            params![project, column_key],
        )?;
        removed += tx.execute(
            &format!(
                "DELETE FROM {} WHERE project_id = ?1 AND {} = ?2",
                nested_spec.table, parent_column
            ),
            params![project, column_key],
        )?;
        ensure_live(cancel, "purge column")?;
        tx.commit()?;
        Ok(removed)
    }

    fn purge_parent(
        &self,
        dimension: OrderDimension,
        project_id: Uuid,
        parent_id: Uuid,
        cancel: &CancellationToken,
    ) -> OrderResult<usize> {
        let spec = table_spec(dimension);
        let Some(parent_column) = spec.parent_column else {
            return Err(OrderError::Internal(format!(
                "{} rows are not nested under a parent",
                dimension.as_str()
            )));
        };
        let query = format!(
            "DELETE FROM {} WHERE project_id = ?1 AND {} = ?2",
            spec.table, parent_column
        );

        let conn = self.lock()?;
        ensure_live(cancel, "purge parent")?;
        let removed = conn.execute(&query, params![project_id.to_string(), parent_id.to_string()])?;
        Ok(removed)
    }
}

fn ensure_live(cancel: &CancellationToken, operation: &str) -> OrderResult<()> {
    if cancel.is_cancelled() {
        return Err(OrderError::Cancelled(format!("{} aborted before commit", operation)));
    }
    Ok(())
}

fn parse_order_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderRecord> {
    Ok(OrderRecord {
        item_id: parse_uuid(&row.get::<_, String>(0)?)?,
        position: row.get(1)?,
        updated_at: parse_time(&row.get::<_, String>(2)?)?,
    })
}

fn parse_uuid(raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|error| conversion_failure(0, error.to_string()))
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| conversion_failure(2, error.to_string()))
}

fn conversion_failure(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

#[cfg(test)]
mod tests {
    use super::SqliteOrderStore;
    use crate::errors::OrderError;
    use crate::models::{OrderDimension, OrderScope};
    use crate::store::OrderStore;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn positions(store: &SqliteOrderStore, scope: &OrderScope) -> Vec<(Uuid, String)> {
        store
            .fetch_sorted(scope)
            .expect("fetch sorted")
            .into_iter()
            .map(|record| (record.item_id, record.position))
            .collect()
    }

    #[test]
    fn empty_scope_fetches_nothing() {
        let store = SqliteOrderStore::open_in_memory().expect("store");
        let scope = OrderScope::role_columns(Uuid::new_v4(), Uuid::new_v4());
        assert!(store.fetch_sorted(&scope).expect("fetch").is_empty());
    }

    #[test]
    fn fetch_sorts_by_position_bytes() {
        let store = SqliteOrderStore::open_in_memory().expect("store");
        let scope = OrderScope::stage_columns(Uuid::new_v4(), Uuid::new_v4());
        let token = CancellationToken::new();
        let (a, b, c, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        store.upsert(&scope, a, "a1", &token).expect("upsert");
        store.upsert(&scope, b, "Z", &token).expect("upsert");
        store.upsert(&scope, c, "a0V", &token).expect("upsert");
        store.upsert(&scope, d, "9", &token).expect("upsert");

        let order: Vec<Uuid> = positions(&store, &scope).into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![d, b, c, a]);
    }

    #[test]
    fn upsert_twice_with_same_key_is_idempotent() {
        let store = SqliteOrderStore::open_in_memory().expect("store");
        let scope = OrderScope::boards_in_view(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let token = CancellationToken::new();
        let item = Uuid::new_v4();

        store.upsert(&scope, item, "a0", &token).expect("first upsert");
        let first = positions(&store, &scope);
        store.upsert(&scope, item, "a0", &token).expect("second upsert");
        assert_eq!(positions(&store, &scope), first);
        assert_eq!(first.len(), 1);
    }

    #[test]
    fn upsert_replaces_existing_key() {
        let store = SqliteOrderStore::open_in_memory().expect("store");
        let scope = OrderScope::role_columns(Uuid::new_v4(), Uuid::new_v4());
        let token = CancellationToken::new();
        let item = Uuid::new_v4();

        store.upsert(&scope, item, "a0", &token).expect("upsert");
        store.upsert(&scope, item, "b", &token).expect("upsert");
        assert_eq!(positions(&store, &scope), vec![(item, "b".to_string())]);
    }

    #[test]
    fn scopes_do_not_see_each_other() {
        let store = SqliteOrderStore::open_in_memory().expect("store");
        let token = CancellationToken::new();
        let project = Uuid::new_v4();
        let role = Uuid::new_v4();
        let kanban = Uuid::new_v4();
        let alice = OrderScope::kanbans_in_role(Uuid::new_v4(), project, role);
        let bob = OrderScope::kanbans_in_role(Uuid::new_v4(), project, role);
        let other_role = OrderScope::kanbans_in_role(alice.user_id(), project, Uuid::new_v4());

        store.upsert(&alice, kanban, "a0", &token).expect("upsert");
        store.upsert(&bob, kanban, "z", &token).expect("upsert");

        assert_eq!(positions(&store, &alice), vec![(kanban, "a0".to_string())]);
        assert_eq!(positions(&store, &bob), vec![(kanban, "z".to_string())]);
        assert!(positions(&store, &other_role).is_empty());
    }

    #[test]
    fn batch_upsert_writes_every_row() {
        let store = SqliteOrderStore::open_in_memory().expect("store");
        let scope = OrderScope::kanbans_in_stage(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let entries = vec![
            (Uuid::new_v4(), "a0".to_string()),
            (Uuid::new_v4(), "a1".to_string()),
            (Uuid::new_v4(), "a2".to_string()),
        ];

        store
            .batch_upsert(&scope, &entries, &CancellationToken::new())
            .expect("batch upsert");
        assert_eq!(positions(&store, &scope), entries);
    }

    #[test]
    fn batch_upsert_rolls_back_on_failure() {
        let store = SqliteOrderStore::open_in_memory().expect("store");
        store
            .lock()
            .expect("lock")
            .execute_batch(
                "CREATE TRIGGER reject_boom BEFORE INSERT ON user_role_column_order
                 WHEN NEW.position = 'boom'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .expect("trigger");

        let scope = OrderScope::role_columns(Uuid::new_v4(), Uuid::new_v4());
        let entries = vec![(Uuid::new_v4(), "a0".to_string()), (Uuid::new_v4(), "boom".to_string())];

        let err = store
            .batch_upsert(&scope, &entries, &CancellationToken::new())
            .expect_err("second row should fail");
        assert!(matches!(err, OrderError::StoreUnavailable(_)));
        assert!(positions(&store, &scope).is_empty());
    }

    #[test]
    fn cancelled_writes_leave_no_rows() {
        let store = SqliteOrderStore::open_in_memory().expect("store");
        let scope = OrderScope::role_columns(Uuid::new_v4(), Uuid::new_v4());
        let token = CancellationToken::new();
        token.cancel();

        let err = store
            .batch_upsert(&scope, &[(Uuid::new_v4(), "a0".to_string())], &token)
            .expect_err("cancelled");
        assert!(matches!(err, OrderError::Cancelled(_)));
        let err = store
            .upsert(&scope, Uuid::new_v4(), "a1", &token)
            .expect_err("cancelled");
        assert!(matches!(err, OrderError::Cancelled(_)));
        assert!(positions(&store, &scope).is_empty());
    }

    #[test]
    fn delete_missing_row_is_a_no_op() {
        let store = SqliteOrderStore::open_in_memory().expect("store");
        let scope = OrderScope::boards_in_view(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let token = CancellationToken::new();
        let kept = Uuid::new_v4();
        let dropped = Uuid::new_v4();

        store.upsert(&scope, kept, "a0", &token).expect("upsert");
        store.upsert(&scope, dropped, "a1", &token).expect("upsert");
        store.delete(&scope, dropped, &token).expect("delete");
        store.delete(&scope, dropped, &token).expect("delete again");
        store.delete(&scope, Uuid::new_v4(), &token).expect("delete unknown");

        assert_eq!(positions(&store, &scope), vec![(kept, "a0".to_string())]);
    }

    #[test]
    fn purge_item_removes_rows_for_every_user() {
        let store = SqliteOrderStore::open_in_memory().expect("store");
        let token = CancellationToken::new();
        let project = Uuid::new_v4();
        let board = Uuid::new_v4();
        let other = Uuid::new_v4();
        let first = OrderScope::boards_in_view(Uuid::new_v4(), project, Uuid::new_v4());
        let second = OrderScope::boards_in_view(Uuid::new_v4(), project, Uuid::new_v4());

        store.upsert(&first, board, "a0", &token).expect("upsert");
        store.upsert(&first, other, "a1", &token).expect("upsert");
        store.upsert(&second, board, "a0", &token).expect("upsert");

        let removed = store
            .purge_item(OrderDimension::BoardInView, project, board, &token)
            .expect("purge");
        assert_eq!(removed, 2);
        assert_eq!(positions(&store, &first), vec![(other, "a1".to_string())]);
        assert!(positions(&store, &second).is_empty());
    }

    #[test]
    fn purge_parent_removes_nested_rows_only() {
        let store = SqliteOrderStore::open_in_memory().expect("store");
        let token = CancellationToken::new();
        let user = Uuid::new_v4();
        let project = Uuid::new_v4();
        let deleted_stage = Uuid::new_v4();
        let gone = OrderScope::kanbans_in_stage(user, project, deleted_stage);
        let kept = OrderScope::kanbans_in_stage(user, project, Uuid::new_v4());

        store.upsert(&gone, Uuid::new_v4(), "a0", &token).expect("upsert");
        store.upsert(&kept, Uuid::new_v4(), "a0", &token).expect("upsert");

        let removed = store
            .purge_parent(OrderDimension::KanbanInStage, project, deleted_stage, &token)
            .expect("purge");
        assert_eq!(removed, 1);
        assert!(positions(&store, &gone).is_empty());
        assert_eq!(positions(&store, &kept).len(), 1);
    }

    #[test]
    fn purge_column_removes_column_and_nested_rows() {
        let store = SqliteOrderStore::open_in_memory().expect("store");
        let token = CancellationToken::new();
        let project = Uuid::new_v4();
        let role = Uuid::new_v4();
        let columns = OrderScope::role_columns(Uuid::new_v4(), project);
        let nested = OrderScope::kanbans_in_role(columns.user_id(), project, role);

        store.upsert(&columns, role, "a0", &token).expect("upsert");
        store.upsert(&nested, Uuid::new_v4(), "a0", &token).expect("upsert");
        store.upsert(&nested, Uuid::new_v4(), "a1", &token).expect("upsert");

        let removed = store
            .purge_column(OrderDimension::RoleColumn, project, role, &token)
            .expect("purge");
        assert_eq!(removed, 3);
        assert!(positions(&store, &columns).is_empty());
        assert!(positions(&store, &nested).is_empty());
    }

    #[test]
    fn purge_column_keeps_columns_when_nested_delete_fails() {
        let store = SqliteOrderStore::open_in_memory().expect("store");
        store
            .lock()
            .expect("lock")
            .execute_batch(
                "CREATE TRIGGER reject_nested_delete BEFORE DELETE ON user_kanban_order_in_stage
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .expect("trigger");
        let token = CancellationToken::new();
        let project = Uuid::new_v4();
        let stage = Uuid::new_v4();
        let columns = OrderScope::stage_columns(Uuid::new_v4(), project);
        let nested = OrderScope::kanbans_in_stage(columns.user_id(), project, stage);

        store.upsert(&columns, stage, "a0", &token).expect("upsert");
        store.upsert(&nested, Uuid::new_v4(), "a0", &token).expect("upsert");

        let err = store
            .purge_column(OrderDimension::StageColumn, project, stage, &token)
            .expect_err("nested delete rejected");
        assert!(matches!(err, OrderError::StoreUnavailable(_)));
        assert_eq!(positions(&store, &columns), vec![(stage, "a0".to_string())]);
        assert_eq!(positions(&store, &nested).len(), 1);
    }

    #[test]
    fn purge_column_rejects_nested_dimensions() {
        let store = SqliteOrderStore::open_in_memory().expect("store");
        let result = store.purge_column(
            OrderDimension::BoardInView,
            Uuid::new_v4(),
            Uuid::new_v4(),
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(OrderError::Internal(_))));
    }

    #[test]
    fn purge_parent_rejects_column_dimensions() {
        let store = SqliteOrderStore::open_in_memory().expect("store");
        let result = store.purge_parent(
            OrderDimension::RoleColumn,
            Uuid::new_v4(),
            Uuid::new_v4(),
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(OrderError::Internal(_))));
    }

    #[test]
    fn rows_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("nested").join("orders.db");
        let scope = OrderScope::role_columns(Uuid::new_v4(), Uuid::new_v4());
        let item = Uuid::new_v4();

        {
            let store = SqliteOrderStore::open(&db_path, Duration::from_millis(100)).expect("open");
            store
                .upsert(&scope, item, "a0", &CancellationToken::new())
                .expect("upsert");
            assert_eq!(store.db_path(), Some(db_path.as_path()));
        }

        let reopened = SqliteOrderStore::open(&db_path, Duration::from_millis(100)).expect("reopen");
        assert_eq!(positions(&reopened, &scope), vec![(item, "a0".to_string())]);
    }
}
