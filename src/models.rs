use crate::errors::{OrderError, OrderResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderDimension {
    RoleColumn,
    StageColumn,
    KanbanInRole,
    KanbanInStage,
    BoardInView,
}

impl OrderDimension {
    pub const ALL: [OrderDimension; 5] = [
        Self::RoleColumn,
        Self::StageColumn,
        Self::KanbanInRole,
        Self::KanbanInStage,
        Self::BoardInView,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoleColumn => "role-column",
            Self::StageColumn => "stage-column",
            Self::KanbanInRole => "kanban-in-role",
            Self::KanbanInStage => "kanban-in-stage",
            Self::BoardInView => "board-in-view",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|dimension| dimension.as_str() == raw)
    }

    /// Column orders are per project; the other dimensions live under a role,
    /// stage or saved view.
    pub fn has_parent(self) -> bool {
        !matches!(self, Self::RoleColumn | Self::StageColumn)
    }

    /// The dimension whose rows live under a column of this dimension.
    pub fn nested(self) -> Option<Self> {
        match self {
            Self::RoleColumn => Some(Self::KanbanInRole),
            Self::StageColumn => Some(Self::KanbanInStage),
            _ => None,
        }
    }
}

/// One independent ordered collection. Each variant carries exactly the IDs
/// its dimension's natural key is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderScope {
    RoleColumn {
        user_id: Uuid,
        project_id: Uuid,
    },
    StageColumn {
        user_id: Uuid,
        project_id: Uuid,
    },
    KanbanInRole {
        user_id: Uuid,
        project_id: Uuid,
        role_id: Uuid,
    },
    KanbanInStage {
        user_id: Uuid,
        project_id: Uuid,
        stage_id: Uuid,
    },
    BoardInView {
        user_id: Uuid,
        project_id: Uuid,
        view_id: Uuid,
    },
}

impl OrderScope {
    pub fn role_columns(user_id: Uuid, project_id: Uuid) -> Self {
        Self::RoleColumn { user_id, project_id }
    }

    pub fn stage_columns(user_id: Uuid, project_id: Uuid) -> Self {
        Self::StageColumn { user_id, project_id }
    }

    pub fn kanbans_in_role(user_id: Uuid, project_id: Uuid, role_id: Uuid) -> Self {
        Self::KanbanInRole {
            user_id,
            project_id,
            role_id,
        }
    }

    pub fn kanbans_in_stage(user_id: Uuid, project_id: Uuid, stage_id: Uuid) -> Self {
        Self::KanbanInStage {
            user_id,
            project_id,
            stage_id,
        }
    }

    pub fn boards_in_view(user_id: Uuid, project_id: Uuid, view_id: Uuid) -> Self {
        Self::BoardInView {
            user_id,
            project_id,
            view_id,
        }
    }

    pub fn dimension(&self) -> OrderDimension {
        match self {
            Self::RoleColumn { .. } => OrderDimension::RoleColumn,
            Self::StageColumn { .. } => OrderDimension::StageColumn,
            Self::KanbanInRole { .. } => OrderDimension::KanbanInRole,
            Self::KanbanInStage { .. } => OrderDimension::KanbanInStage,
            Self::BoardInView { .. } => OrderDimension::BoardInView,
        }
    }

    pub fn user_id(&self) -> Uuid {
        match *self {
            Self::RoleColumn { user_id, .. }
            | Self::StageColumn { user_id, .. }
            | Self::KanbanInRole { user_id, .. }
            | Self::KanbanInStage { user_id, .. }
            | Self::BoardInView { user_id, .. } => user_id,
        }
    }

    pub fn project_id(&self) -> Uuid {
        match *self {
            Self::RoleColumn { project_id, .. }
            | Self::StageColumn { project_id, .. }
            | Self::KanbanInRole { project_id, .. }
            | Self::KanbanInStage { project_id, .. }
            | Self::BoardInView { project_id, .. } => project_id,
        }
    }

    pub fn parent_id(&self) -> Option<Uuid> {
        match *self {
            Self::RoleColumn { .. } | Self::StageColumn { .. } => None,
            Self::KanbanInRole { role_id, .. } => Some(role_id),
            Self::KanbanInStage { stage_id, .. } => Some(stage_id),
            Self::BoardInView { view_id, .. } => Some(view_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    pub item_id: Uuid,
    pub position: String,
    pub updated_at: DateTime<Utc>,
}

/// Findings of an integrity pass over one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub dimension: OrderDimension,
    pub row_count: usize,
    pub invalid_keys: Vec<(Uuid, String)>,
    pub duplicate_positions: Vec<String>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.invalid_keys.is_empty() && self.duplicate_positions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrderSettings {
    pub database_path: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub log_filter: String,
    pub store_timeout_ms: u64,
    pub busy_timeout_ms: u64,
}

impl Default for OrderSettings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("board-order.sqlite"),
            log_dir: None,
            log_filter: "info".to_string(),
            store_timeout_ms: 5_000,
            busy_timeout_ms: 2_000,
        }
    }
}

impl OrderSettings {
    /// Reads settings from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> OrderResult<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(error) => {
                return Err(OrderError::Config(format!(
                    "failed to read settings {}: {}",
                    path.display(),
                    error
                )))
            }
        };
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
