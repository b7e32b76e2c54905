//! Field mapping from the legacy schema to the new schema.
//!
//! Mapping is pure: no I/O, no clocks other than the "now" fallback for
//! missing timestamps. Each entity has a typed source record (extracted from
//! a [`SourceRow`]) and a typed mapped record that satisfies the target
//! schema's constraints before it is handed to a repository.

pub mod codes;
mod records;

pub use codes::*;
pub use records::*;

use crate::source::SourceRow;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Record-level mapping failure. Always recoverable: the record is counted
/// as an error and migration continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    /// A required column is NULL or empty.
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    /// A field is present but violates a target constraint.
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl MappingError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        MappingError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Migrated entity types, declared in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Roles,
    Users,
    Families,
    Citizens,
    Settings,
}

impl Entity {
    /// Fixed migration order: FK parents before their children.
    pub const MIGRATION_ORDER: [Entity; 5] = [
        Entity::Roles,
        Entity::Users,
        Entity::Families,
        Entity::Citizens,
        Entity::Settings,
    ];

    /// Target table name.
    pub fn table_name(&self) -> &'static str {
        match self {
            Entity::Roles => "roles",
            Entity::Users => "users",
            Entity::Families => "families",
            Entity::Citizens => "citizens",
            Entity::Settings => "settings",
        }
    }

    /// Natural key column in the target table.
    pub fn natural_key_column(&self) -> &'static str {
        match self {
            Entity::Roles => "name",
            Entity::Users => "username",
            Entity::Families => "family_number",
            Entity::Citizens => "national_id",
            Entity::Settings => "key",
        }
    }

    /// Entities this one references by foreign key.
    pub fn parents(&self) -> &'static [Entity] {
        match self {
            Entity::Users => &[Entity::Roles],
            Entity::Citizens => &[Entity::Families],
            _ => &[],
        }
    }

    /// Default legacy table name.
    pub fn default_source_table(&self) -> &'static str {
        match self {
            Entity::Roles => "tbl_roles",
            Entity::Users => "tbl_users",
            Entity::Families => "tbl_families",
            Entity::Citizens => "tbl_citizens",
            Entity::Settings => "tbl_settings",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.table_name())
    }
}

/// Lookups gathered while parent tables are migrated, for child rows that
/// reference their parent by legacy id instead of by natural key.
#[derive(Debug, Clone, Default)]
pub struct MappingContext {
    role_names: HashMap<i64, String>,
}

impl MappingContext {
    pub fn add_role(&mut self, legacy_id: i64, name: impl Into<String>) {
        self.role_names.insert(legacy_id, name.into());
    }

    /// Mapped name of the role whose legacy id is `legacy_id`.
    pub fn role_name(&self, legacy_id: i64) -> Option<&str> {
        self.role_names.get(&legacy_id).map(String::as_str)
    }
}

/// A target-schema record produced by the field mapper.
///
/// Ties together the entity, its typed source record and the mapping
/// function so the table migrator can stay generic over entity types.
pub trait MappedRecord: Clone + fmt::Debug + Send + Sync + 'static {
    /// Entity this record belongs to.
    const ENTITY: Entity;

    /// Typed legacy record this one is mapped from.
    type Source: for<'r> TryFrom<&'r SourceRow, Error = MappingError> + Send;

    /// Map a typed source record, enforcing target constraints. Legacy ids
    /// of parents are resolved through `context`.
    fn from_source(source: Self::Source, context: &MappingContext) -> Result<Self, MappingError>;

    /// Natural key used for skip detection and as the upsert conflict target.
    fn natural_key(&self) -> &str;

    /// Record what later entities need to resolve references to this one.
    /// Called once the record has reached the target.
    fn remember(&self, _row: &SourceRow, _context: &mut MappingContext) {}

    /// Extract and map a raw row in one step.
    fn from_row(row: &SourceRow, context: &MappingContext) -> Result<Self, MappingError> {
        Self::from_source(Self::Source::try_from(row)?, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_order_puts_parents_first() {
        for (idx, entity) in Entity::MIGRATION_ORDER.iter().enumerate() {
            for parent in entity.parents() {
                let parent_idx = Entity::MIGRATION_ORDER
                    .iter()
                    .position(|e| e == parent)
                    .unwrap();
                assert!(parent_idx < idx, "{} must follow {}", entity, parent);
            }
        }
    }

    #[test]
    fn test_context_resolves_roles_by_legacy_id() {
        let mut context = MappingContext::default();
        context.add_role(4, "kepala desa");
        assert_eq!(context.role_name(4), Some("kepala desa"));
        assert_eq!(context.role_name(1), None);
    }

    #[test]
    fn test_entity_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Entity::Citizens).unwrap(), "\"citizens\"");
    }
}
