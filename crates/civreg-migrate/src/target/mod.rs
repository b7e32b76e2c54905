//! Target database access (new schema).
//!
//! Two seams are defined here:
//!
//! - [`TargetRepository`]: per-entity existence check, natural-key upsert and
//!   count, used by the table migrator.
//! - [`TargetInspector`]: read-only queries over the whole target, used by
//!   the validation engine and the backup manager.

mod postgres;
pub mod tls;

pub use postgres::PgTarget;

use crate::error::Result;
use crate::mapper::{
    CitizenRecord, Entity, FamilyRecord, MappedRecord, RoleRecord, SettingRecord, UserRecord,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Result of a successful upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    /// A new row was inserted.
    Created,
    /// An existing row with the same natural key was overwritten.
    Updated,
}

/// Upsert access to one target entity collection, keyed by natural key.
#[async_trait]
pub trait TargetRepository<R: MappedRecord>: Send + Sync {
    /// Check whether a row with this natural key exists.
    async fn exists(&self, natural_key: &str) -> Result<bool>;

    /// Insert or update using the natural key as the conflict target.
    ///
    /// Never creates a second row for the same natural key. Foreign key
    /// parents are resolved by their natural keys; a missing parent is an
    /// error for this record only.
    async fn upsert(&self, natural_key: &str, record: &R) -> Result<UpsertOutcome>;

    /// Count rows in the collection.
    async fn count(&self) -> Result<i64>;
}

/// A foreign key between two migrated entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relation {
    pub child: Entity,
    pub fk_column: &'static str,
    pub parent: Entity,
}

/// Foreign keys in the target schema.
pub const RELATIONS: &[Relation] = &[
    Relation {
        child: Entity::Users,
        fk_column: "role_id",
        parent: Entity::Roles,
    },
    Relation {
        child: Entity::Citizens,
        fk_column: "family_id",
        parent: Entity::Families,
    },
];

/// Read-only queries over the target database.
#[async_trait]
pub trait TargetInspector: Send + Sync {
    /// Row count for every table in the target schema, keyed by table name.
    async fn table_counts(&self) -> Result<BTreeMap<String, i64>>;

    /// Natural keys of child rows whose foreign key points at a parent id
    /// that does not exist.
    async fn orphaned_references(&self, relation: &Relation) -> Result<Vec<String>>;

    /// Natural keys of child rows whose foreign key is NULL.
    async fn missing_references(&self, relation: &Relation) -> Result<Vec<String>>;

    /// Natural keys that appear more than once, with their row counts.
    async fn duplicate_natural_keys(&self, entity: Entity) -> Result<Vec<(String, i64)>>;

    /// Family numbers of families with no member whose role is head.
    async fn families_without_head(&self) -> Result<Vec<String>>;
}

/// All per-entity repositories needed for one migration run.
pub struct TargetSet {
    pub roles: Arc<dyn TargetRepository<RoleRecord>>,
    pub users: Arc<dyn TargetRepository<UserRecord>>,
    pub families: Arc<dyn TargetRepository<FamilyRecord>>,
    pub citizens: Arc<dyn TargetRepository<CitizenRecord>>,
    pub settings: Arc<dyn TargetRepository<SettingRecord>>,
}

impl TargetSet {
    /// Use one backend for every entity.
    pub fn from_backend<T>(backend: Arc<T>) -> Self
    where
        T: TargetRepository<RoleRecord>
            + TargetRepository<UserRecord>
            + TargetRepository<FamilyRecord>
            + TargetRepository<CitizenRecord>
            + TargetRepository<SettingRecord>
            + 'static,
    {
        Self {
            roles: backend.clone(),
            users: backend.clone(),
            families: backend.clone(),
            citizens: backend.clone(),
            settings: backend,
        }
    }
}
