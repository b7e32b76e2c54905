//! In-memory source, target and dump tool.
//!
//! These back the unit and pipeline tests. [`MemoryTarget`] enforces
//! the same natural-key uniqueness and foreign key resolution as the
//! PostgreSQL schema, and both sides support simple fault injection.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::backup::DumpTool;
use crate::config::SourceTable;
use crate::error::{MigrateError, Result};
use crate::mapper::{
    CitizenRecord, Entity, FamilyRecord, FamilyRole, MappedRecord, RoleRecord, SettingRecord,
    UserRecord,
};
use crate::source::{SourceReader, SourceRow, SourceValue};
use crate::target::{Relation, TargetInspector, TargetRepository, UpsertOutcome};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking test thread must not wedge the others
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ===== Source =====

/// Legacy tables held in memory.
#[derive(Default)]
pub struct MemorySource {
    tables: Mutex<HashMap<String, Vec<SourceRow>>>,
    fail_fetch_at: Mutex<HashMap<String, usize>>,
    overcount: Mutex<HashMap<String, i64>>,
    cancel_on_fetch: Mutex<Option<(String, CancellationToken)>>,
    fetches: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a table.
    pub fn with_table(self, name: impl Into<String>, rows: Vec<SourceRow>) -> Self {
        lock(&self.tables).insert(name.into(), rows);
        self
    }

    /// Append rows to a table, creating it if needed.
    pub fn push_rows(&self, name: &str, rows: impl IntoIterator<Item = SourceRow>) {
        lock(&self.tables)
            .entry(name.to_string())
            .or_default()
            .extend(rows);
    }

    /// Make every fetch of `table` at or beyond `offset` fail as if the
    /// connection dropped.
    pub fn fail_fetch_at(&self, table: &str, offset: usize) {
        lock(&self.fail_fetch_at).insert(table.to_string(), offset);
    }

    /// Report `extra` more rows for `table` than it holds, as if rows were
    /// deleted between the count and the fetches.
    pub fn overcount(&self, table: &str, extra: i64) {
        lock(&self.overcount).insert(table.to_string(), extra);
    }

    /// Cancel `token` as soon as the first batch of `table` is served.
    pub fn cancel_after_fetch(&self, table: &str, token: CancellationToken) {
        *lock(&self.cancel_on_fetch) = Some((table.to_string(), token));
    }

    /// Number of fetch calls served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(AtomicOrdering::SeqCst)
    }

    fn compare(a: &SourceValue, b: &SourceValue) -> Ordering {
        match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => a.to_string().cmp(&b.to_string()),
        }
    }
}

#[async_trait]
impl SourceReader for MemorySource {
    async fn count(&self, table: &SourceTable) -> Result<i64> {
        let extra = lock(&self.overcount).get(&table.name).copied().unwrap_or(0);
        lock(&self.tables)
            .get(&table.name)
            .map(|rows| rows.len() as i64 + extra)
            .ok_or_else(|| MigrateError::transfer(&table.name, "source table does not exist"))
    }

    async fn fetch(
        &self,
        table: &SourceTable,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SourceRow>> {
        self.fetches.fetch_add(1, AtomicOrdering::SeqCst);

        if let Some(&fail_at) = lock(&self.fail_fetch_at).get(&table.name) {
            if offset >= fail_at {
                return Err(MigrateError::pool(
                    "connection reset by peer",
                    format!("fetching {} at offset {}", table.name, offset),
                ));
            }
        }

        if let Some((name, token)) = lock(&self.cancel_on_fetch).as_ref() {
            if *name == table.name {
                token.cancel();
            }
        }

        let tables = lock(&self.tables);
        let rows = tables
            .get(&table.name)
            .ok_or_else(|| MigrateError::transfer(&table.name, "source table does not exist"))?;

        let mut sorted: Vec<&SourceRow> = rows.iter().collect();
        sorted.sort_by(|a, b| {
            Self::compare(a.get(&table.primary_key), b.get(&table.primary_key))
        });
        Ok(sorted
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    fn db_type(&self) -> &str {
        "memory"
    }
}

// ===== Target =====

/// A stored target row with its surrogate id and resolved parent id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRow<R> {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub record: R,
}

/// Full contents of a [`MemoryTarget`], serializable for dumps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySnapshot {
    pub tables: BTreeSet<Entity>,
    pub next_id: i64,
    pub roles: BTreeMap<String, StoredRow<RoleRecord>>,
    pub users: BTreeMap<String, StoredRow<UserRecord>>,
    pub families: BTreeMap<String, StoredRow<FamilyRecord>>,
    pub citizens: BTreeMap<String, StoredRow<CitizenRecord>>,
    pub settings: BTreeMap<String, StoredRow<SettingRecord>>,
}

impl MemorySnapshot {
    fn with_tables(tables: impl IntoIterator<Item = Entity>) -> Self {
        Self {
            tables: tables.into_iter().collect(),
            next_id: 1,
            roles: BTreeMap::new(),
            users: BTreeMap::new(),
            families: BTreeMap::new(),
            citizens: BTreeMap::new(),
            settings: BTreeMap::new(),
        }
    }

    fn len(&self, entity: Entity) -> usize {
        match entity {
            Entity::Roles => self.roles.len(),
            Entity::Users => self.users.len(),
            Entity::Families => self.families.len(),
            Entity::Citizens => self.citizens.len(),
            Entity::Settings => self.settings.len(),
        }
    }

    fn id_of(&self, entity: Entity, key: &str) -> Option<i64> {
        match entity {
            Entity::Roles => self.roles.get(key).map(|r| r.id),
            Entity::Users => self.users.get(key).map(|r| r.id),
            Entity::Families => self.families.get(key).map(|r| r.id),
            Entity::Citizens => self.citizens.get(key).map(|r| r.id),
            Entity::Settings => self.settings.get(key).map(|r| r.id),
        }
    }

    fn ids(&self, entity: Entity) -> HashSet<i64> {
        fn collect<R>(m: &BTreeMap<String, StoredRow<R>>) -> HashSet<i64> {
            m.values().map(|r| r.id).collect()
        }
        match entity {
            Entity::Roles => collect(&self.roles),
            Entity::Users => collect(&self.users),
            Entity::Families => collect(&self.families),
            Entity::Citizens => collect(&self.citizens),
            Entity::Settings => collect(&self.settings),
        }
    }

    /// (natural key, parent id) of every child row for `entity`.
    fn links(&self, entity: Entity) -> Vec<(String, Option<i64>)> {
        fn collect<R>(m: &BTreeMap<String, StoredRow<R>>) -> Vec<(String, Option<i64>)> {
            m.iter().map(|(k, r)| (k.clone(), r.parent_id)).collect()
        }
        match entity {
            Entity::Users => collect(&self.users),
            Entity::Citizens => collect(&self.citizens),
            _ => Vec::new(),
        }
    }
}

/// Record types storable in a [`MemoryTarget`].
pub trait MemoryRecord: MappedRecord {
    fn rows(snapshot: &MemorySnapshot) -> &BTreeMap<String, StoredRow<Self>>;
    fn rows_mut(snapshot: &mut MemorySnapshot) -> &mut BTreeMap<String, StoredRow<Self>>;

    /// FK parent entity and its natural key, if this record references one.
    fn parent_key(&self) -> Option<(Entity, &str)> {
        None
    }
}

impl MemoryRecord for RoleRecord {
    fn rows(s: &MemorySnapshot) -> &BTreeMap<String, StoredRow<Self>> {
        &s.roles
    }
    fn rows_mut(s: &mut MemorySnapshot) -> &mut BTreeMap<String, StoredRow<Self>> {
        &mut s.roles
    }
}

impl MemoryRecord for UserRecord {
    fn rows(s: &MemorySnapshot) -> &BTreeMap<String, StoredRow<Self>> {
        &s.users
    }
    fn rows_mut(s: &mut MemorySnapshot) -> &mut BTreeMap<String, StoredRow<Self>> {
        &mut s.users
    }
    fn parent_key(&self) -> Option<(Entity, &str)> {
        Some((Entity::Roles, self.role_name.as_str()))
    }
}

impl MemoryRecord for FamilyRecord {
    fn rows(s: &MemorySnapshot) -> &BTreeMap<String, StoredRow<Self>> {
        &s.families
    }
    fn rows_mut(s: &mut MemorySnapshot) -> &mut BTreeMap<String, StoredRow<Self>> {
        &mut s.families
    }
}

impl MemoryRecord for CitizenRecord {
    fn rows(s: &MemorySnapshot) -> &BTreeMap<String, StoredRow<Self>> {
        &s.citizens
    }
    fn rows_mut(s: &mut MemorySnapshot) -> &mut BTreeMap<String, StoredRow<Self>> {
        &mut s.citizens
    }
    fn parent_key(&self) -> Option<(Entity, &str)> {
        Some((Entity::Families, &self.family_number))
    }
}

impl MemoryRecord for SettingRecord {
    fn rows(s: &MemorySnapshot) -> &BTreeMap<String, StoredRow<Self>> {
        &s.settings
    }
    fn rows_mut(s: &mut MemorySnapshot) -> &mut BTreeMap<String, StoredRow<Self>> {
        &mut s.settings
    }
}

/// Target database held in memory.
pub struct MemoryTarget {
    state: Mutex<MemorySnapshot>,
    offline: AtomicBool,
    rejected_keys: Mutex<HashSet<String>>,
    upserts: AtomicUsize,
}

impl Default for MemoryTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTarget {
    /// Empty target with every migrated table present.
    pub fn new() -> Self {
        Self::with_tables(Entity::MIGRATION_ORDER)
    }

    /// Empty target containing only the given tables.
    pub fn with_tables(tables: impl IntoIterator<Item = Entity>) -> Self {
        Self {
            state: Mutex::new(MemorySnapshot::with_tables(tables)),
            offline: AtomicBool::new(false),
            rejected_keys: Mutex::new(HashSet::new()),
            upserts: AtomicUsize::new(0),
        }
    }

    /// Simulate a lost connection: every call fails with a pool error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, AtomicOrdering::SeqCst);
    }

    /// Make upserts of this natural key fail as a constraint violation.
    pub fn reject_key(&self, natural_key: impl Into<String>) {
        lock(&self.rejected_keys).insert(natural_key.into());
    }

    /// Number of upsert calls received, successful or not.
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(AtomicOrdering::SeqCst)
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        lock(&self.state).clone()
    }

    pub fn restore(&self, snapshot: MemorySnapshot) {
        *lock(&self.state) = snapshot;
    }

    pub fn get<R: MemoryRecord>(&self, natural_key: &str) -> Option<R> {
        R::rows(&lock(&self.state))
            .get(natural_key)
            .map(|row| row.record.clone())
    }

    /// Number of stored rows for an entity.
    pub fn len(&self, entity: Entity) -> usize {
        lock(&self.state).len(entity)
    }

    pub fn is_empty(&self) -> bool {
        Entity::MIGRATION_ORDER.iter().all(|e| self.len(*e) == 0)
    }

    /// Delete a row without touching rows that reference it.
    pub fn remove(&self, entity: Entity, natural_key: &str) -> bool {
        let mut state = lock(&self.state);
        match entity {
            Entity::Roles => state.roles.remove(natural_key).is_some(),
            Entity::Users => state.users.remove(natural_key).is_some(),
            Entity::Families => state.families.remove(natural_key).is_some(),
            Entity::Citizens => state.citizens.remove(natural_key).is_some(),
            Entity::Settings => state.settings.remove(natural_key).is_some(),
        }
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(AtomicOrdering::SeqCst) {
            return Err(MigrateError::pool(
                "connection refused",
                "memory target is offline",
            ));
        }
        Ok(())
    }

    fn check_table(state: &MemorySnapshot, entity: Entity) -> Result<()> {
        if !state.tables.contains(&entity) {
            return Err(MigrateError::transfer(
                entity.table_name(),
                format!("relation \"{}\" does not exist", entity.table_name()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl<R: MemoryRecord> TargetRepository<R> for MemoryTarget {
    async fn exists(&self, natural_key: &str) -> Result<bool> {
        self.check_online()?;
        let state = lock(&self.state);
        Self::check_table(&state, R::ENTITY)?;
        Ok(R::rows(&state).contains_key(natural_key))
    }

    async fn upsert(&self, natural_key: &str, record: &R) -> Result<UpsertOutcome> {
        self.upserts.fetch_add(1, AtomicOrdering::SeqCst);
        self.check_online()?;
        if lock(&self.rejected_keys).contains(natural_key) {
            return Err(MigrateError::transfer(
                R::ENTITY.table_name(),
                format!("check constraint violated for '{}'", natural_key),
            ));
        }

        let mut state = lock(&self.state);
        Self::check_table(&state, R::ENTITY)?;

        let parent_id = match record.parent_key() {
            Some((parent, key)) => Some(state.id_of(parent, key).ok_or_else(|| {
                MigrateError::foreign_key(R::ENTITY.to_string(), parent.to_string(), key)
            })?),
            None => None,
        };

        let next_id = state.next_id;
        let rows = R::rows_mut(&mut state);
        let outcome = match rows.get_mut(natural_key) {
            Some(existing) => {
                existing.record = record.clone();
                existing.parent_id = parent_id;
                UpsertOutcome::Updated
            }
            None => {
                rows.insert(
                    natural_key.to_string(),
                    StoredRow {
                        id: next_id,
                        parent_id,
                        record: record.clone(),
                    },
                );
                UpsertOutcome::Created
            }
        };
        if outcome == UpsertOutcome::Created {
            state.next_id += 1;
        }
        Ok(outcome)
    }

    async fn count(&self) -> Result<i64> {
        self.check_online()?;
        let state = lock(&self.state);
        Self::check_table(&state, R::ENTITY)?;
        Ok(R::rows(&state).len() as i64)
    }
}

#[async_trait]
impl TargetInspector for MemoryTarget {
    async fn table_counts(&self) -> Result<BTreeMap<String, i64>> {
        self.check_online()?;
        let state = lock(&self.state);
        Ok(state
            .tables
            .iter()
            .map(|e| (e.table_name().to_string(), state.len(*e) as i64))
            .collect())
    }

    async fn orphaned_references(&self, relation: &Relation) -> Result<Vec<String>> {
        self.check_online()?;
        let state = lock(&self.state);
        let parents = state.ids(relation.parent);
        Ok(state
            .links(relation.child)
            .into_iter()
            .filter(|(_, parent)| matches!(parent, Some(id) if !parents.contains(id)))
            .map(|(key, _)| key)
            .collect())
    }

    async fn missing_references(&self, relation: &Relation) -> Result<Vec<String>> {
        self.check_online()?;
        let state = lock(&self.state);
        Ok(state
            .links(relation.child)
            .into_iter()
            .filter(|(_, parent)| parent.is_none())
            .map(|(key, _)| key)
            .collect())
    }

    async fn duplicate_natural_keys(&self, _entity: Entity) -> Result<Vec<(String, i64)>> {
        // Rows are keyed by natural key, so duplicates cannot be stored
        self.check_online()?;
        Ok(Vec::new())
    }

    async fn families_without_head(&self) -> Result<Vec<String>> {
        self.check_online()?;
        let state = lock(&self.state);
        let headed: HashSet<i64> = state
            .citizens
            .values()
            .filter(|c| c.record.family_role == FamilyRole::Head)
            .filter_map(|c| c.parent_id)
            .collect();
        Ok(state
            .families
            .iter()
            .filter(|(_, f)| !headed.contains(&f.id))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

// ===== Dump tool =====

/// Dumps a [`MemoryTarget`] as a JSON snapshot file.
pub struct MemoryDumpTool {
    target: Arc<MemoryTarget>,
    restores: AtomicUsize,
    lost_on_restore: Mutex<Option<Entity>>,
}

impl MemoryDumpTool {
    pub fn new(target: Arc<MemoryTarget>) -> Self {
        Self {
            target,
            restores: AtomicUsize::new(0),
            lost_on_restore: Mutex::new(None),
        }
    }

    /// Leave `entity`'s table out of every replay, as if the dump only
    /// partially applied.
    pub fn lose_on_restore(&self, entity: Entity) {
        *lock(&self.lost_on_restore) = Some(entity);
    }

    /// Number of dumps replayed against the target.
    pub fn restore_count(&self) -> usize {
        self.restores.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl DumpTool for MemoryDumpTool {
    async fn dump(&self, path: &Path) -> Result<()> {
        self.target.check_online()?;
        let json = serde_json::to_vec_pretty(&self.target.snapshot())?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    async fn restore(&self, path: &Path) -> Result<()> {
        self.target.check_online()?;
        let bytes = tokio::fs::read(path).await?;
        let mut snapshot: MemorySnapshot = serde_json::from_slice(&bytes)
            .map_err(|e| MigrateError::Backup(format!("unreadable dump: {}", e)))?;
        if let Some(entity) = *lock(&self.lost_on_restore) {
            snapshot.tables.remove(&entity);
        }
        self.target.restore(snapshot);
        self.restores.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
