//! PostgreSQL target repository.
//!
//! Uses deadpool-postgres for connection pooling. Every write is a single
//! `INSERT ... ON CONFLICT` statement on the entity's natural key, so each
//! upsert is its own transaction and a failing record never rolls back its
//! neighbours. The target schema must already exist with a unique
//! constraint on each natural key column and an `id` surrogate key on the
//! parent tables.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use tokio_postgres::types::ToSql;
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, warn};

use super::tls::SslMode;
use super::{Relation, TargetInspector, TargetRepository, UpsertOutcome};
use crate::config::{redact_connection_string, TargetConfig};
use crate::error::{MigrateError, Result};
use crate::mapper::{
    CitizenRecord, Entity, FamilyRecord, FamilyRole, RoleRecord, SettingRecord, UserRecord,
};

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

const UPSERT_ROLE: &str = "\
INSERT INTO roles (name, description, created_at)
VALUES ($1, $2, $3)
ON CONFLICT (name) DO UPDATE SET
    description = EXCLUDED.description
RETURNING (xmax = 0) AS inserted";

// Parent ids are resolved inside the statement; no parent row means no
// inserted row, which the caller reports as a foreign key error.
const UPSERT_USER: &str = "\
INSERT INTO users (username, password_hash, full_name, email, role_id, is_active,
                   last_login, created_at, updated_at)
SELECT $1::text, $2::text, $3::text, $4::text, r.id, $6::boolean,
       $7::timestamptz, $8::timestamptz, $9::timestamptz
FROM roles r
WHERE r.name = $5::text
ON CONFLICT (username) DO UPDATE SET
    password_hash = EXCLUDED.password_hash,
    full_name = EXCLUDED.full_name,
    email = EXCLUDED.email,
    role_id = EXCLUDED.role_id,
    is_active = EXCLUDED.is_active,
    last_login = EXCLUDED.last_login,
    updated_at = EXCLUDED.updated_at
RETURNING (xmax = 0) AS inserted";

const UPSERT_FAMILY: &str = "\
INSERT INTO families (family_number, address, rt, rw, village, district, regency,
                      province, postal_code, created_at, updated_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
ON CONFLICT (family_number) DO UPDATE SET
    address = EXCLUDED.address,
    rt = EXCLUDED.rt,
    rw = EXCLUDED.rw,
    village = EXCLUDED.village,
    district = EXCLUDED.district,
    regency = EXCLUDED.regency,
    province = EXCLUDED.province,
    postal_code = EXCLUDED.postal_code,
    updated_at = EXCLUDED.updated_at
RETURNING (xmax = 0) AS inserted";

const UPSERT_CITIZEN: &str = "\
INSERT INTO citizens (national_id, family_id, full_name, birth_place, birth_date, gender,
                      religion, education, occupation, marital_status, blood_type,
                      nationality, family_role, father_name, mother_name,
                      created_at, updated_at)
SELECT $1::text, f.id, $3::text, $4::text, $5::date, $6::text,
       $7::text, $8::text, $9::text, $10::text, $11::text,
       $12::text, $13::text, $14::text, $15::text,
       $16::timestamptz, $17::timestamptz
FROM families f
WHERE f.family_number = $2::text
ON CONFLICT (national_id) DO UPDATE SET
    family_id = EXCLUDED.family_id,
    full_name = EXCLUDED.full_name,
    birth_place = EXCLUDED.birth_place,
    birth_date = EXCLUDED.birth_date,
    gender = EXCLUDED.gender,
    religion = EXCLUDED.religion,
    education = EXCLUDED.education,
    occupation = EXCLUDED.occupation,
    marital_status = EXCLUDED.marital_status,
    blood_type = EXCLUDED.blood_type,
    nationality = EXCLUDED.nationality,
    family_role = EXCLUDED.family_role,
    father_name = EXCLUDED.father_name,
    mother_name = EXCLUDED.mother_name,
    updated_at = EXCLUDED.updated_at
RETURNING (xmax = 0) AS inserted";

const UPSERT_SETTING: &str = "\
INSERT INTO settings (key, value, description, updated_at)
VALUES ($1, $2, $3, $4)
ON CONFLICT (key) DO UPDATE SET
    value = EXCLUDED.value,
    description = EXCLUDED.description,
    updated_at = EXCLUDED.updated_at
RETURNING (xmax = 0) AS inserted";

/// PostgreSQL implementation of the target repositories and inspector.
pub struct PgTarget {
    pool: Pool,
}

impl PgTarget {
    /// Create the pool from configuration and verify the connection.
    pub async fn connect(config: &TargetConfig) -> Result<Self> {
        let mut pg_config: PgConfig = config.url.parse().map_err(|e| {
            MigrateError::Config(format!("target.url is not a valid connection string: {}", e))
        })?;

        // Connection options for reliability
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(POOL_CONNECTION_TIMEOUT);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let max_size = config.max_connections as usize;

        let pool = match SslMode::parse(&config.ssl_mode)?.connector()? {
            None => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
                Pool::builder(mgr)
                    .max_size(max_size)
                    .build()
                    .map_err(|e| MigrateError::pool(e, "creating PostgreSQL target pool"))?
            }
            Some(tls) => {
                let mgr = Manager::from_config(pg_config, tls, mgr_config);
                Pool::builder(mgr)
                    .max_size(max_size)
                    .build()
                    .map_err(|e| MigrateError::pool(e, "creating PostgreSQL target pool"))?
            }
        };

        // Test connection
        let client = pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "testing PostgreSQL target connection"))?;
        client.simple_query("SELECT 1").await?;

        info!(
            "Connected to PostgreSQL target: {}",
            redact_connection_string(&config.url)
        );

        Ok(Self { pool })
    }

    async fn client(&self) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "getting PostgreSQL connection"))
    }

    /// Quote a PostgreSQL identifier.
    fn quote_ident(name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    async fn key_exists(&self, entity: Entity, natural_key: &str) -> Result<bool> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE {} = $1)",
            Self::quote_ident(entity.table_name()),
            Self::quote_ident(entity.natural_key_column())
        );
        let client = self.client().await?;
        let row = client.query_one(&sql, &[&natural_key]).await?;
        Ok(row.get(0))
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", Self::quote_ident(table));
        let client = self.client().await?;
        let row = client.query_one(&sql, &[]).await?;
        Ok(row.get(0))
    }

    /// Run one upsert statement. `parent` names the FK parent resolved by
    /// the statement, if any.
    async fn execute_upsert(
        &self,
        entity: Entity,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
        parent: Option<(Entity, &str)>,
    ) -> Result<UpsertOutcome> {
        let client = self.client().await?;
        let stmt = client.prepare_cached(sql).await?;
        match client.query_opt(&stmt, params).await? {
            Some(row) if row.get::<_, bool>(0) => Ok(UpsertOutcome::Created),
            Some(_) => Ok(UpsertOutcome::Updated),
            None => match parent {
                Some((parent, key)) => Err(MigrateError::foreign_key(
                    entity.to_string(),
                    parent.to_string(),
                    key,
                )),
                None => Err(MigrateError::transfer(
                    entity.table_name(),
                    "upsert returned no row",
                )),
            },
        }
    }

    async fn natural_keys(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<String>> {
        let client = self.client().await?;
        let rows = client.query(sql, params).await?;
        Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
    }
}

#[async_trait]
impl TargetRepository<RoleRecord> for PgTarget {
    async fn exists(&self, natural_key: &str) -> Result<bool> {
        self.key_exists(Entity::Roles, natural_key).await
    }

    async fn upsert(&self, _natural_key: &str, r: &RoleRecord) -> Result<UpsertOutcome> {
        self.execute_upsert(
            Entity::Roles,
            UPSERT_ROLE,
            &[&r.name, &r.description, &r.created_at],
            None,
        )
        .await
    }

    async fn count(&self) -> Result<i64> {
        self.row_count(Entity::Roles.table_name()).await
    }
}

#[async_trait]
impl TargetRepository<UserRecord> for PgTarget {
    async fn exists(&self, natural_key: &str) -> Result<bool> {
        self.key_exists(Entity::Users, natural_key).await
    }

    async fn upsert(&self, _natural_key: &str, u: &UserRecord) -> Result<UpsertOutcome> {
        let role = u.role_name.as_str();
        self.execute_upsert(
            Entity::Users,
            UPSERT_USER,
            &[
                &u.username,
                &u.password_hash,
                &u.full_name,
                &u.email,
                &role,
                &u.is_active,
                &u.last_login,
                &u.created_at,
                &u.updated_at,
            ],
            Some((Entity::Roles, role)),
        )
        .await
    }

    async fn count(&self) -> Result<i64> {
        self.row_count(Entity::Users.table_name()).await
    }
}

#[async_trait]
impl TargetRepository<FamilyRecord> for PgTarget {
    async fn exists(&self, natural_key: &str) -> Result<bool> {
        self.key_exists(Entity::Families, natural_key).await
    }

    async fn upsert(&self, _natural_key: &str, f: &FamilyRecord) -> Result<UpsertOutcome> {
        self.execute_upsert(
            Entity::Families,
            UPSERT_FAMILY,
            &[
                &f.family_number,
                &f.address,
                &f.rt,
                &f.rw,
                &f.village,
                &f.district,
                &f.regency,
                &f.province,
                &f.postal_code,
                &f.created_at,
                &f.updated_at,
            ],
            None,
        )
        .await
    }

    async fn count(&self) -> Result<i64> {
        self.row_count(Entity::Families.table_name()).await
    }
}

#[async_trait]
impl TargetRepository<CitizenRecord> for PgTarget {
    async fn exists(&self, natural_key: &str) -> Result<bool> {
        self.key_exists(Entity::Citizens, natural_key).await
    }

    async fn upsert(&self, _natural_key: &str, c: &CitizenRecord) -> Result<UpsertOutcome> {
        let (gender, religion, education) =
            (c.gender.label(), c.religion.label(), c.education.label());
        let (marital, blood, nationality, family_role) = (
            c.marital_status.label(),
            c.blood_type.label(),
            c.nationality.label(),
            c.family_role.label(),
        );
        self.execute_upsert(
            Entity::Citizens,
            UPSERT_CITIZEN,
            &[
                &c.national_id,
                &c.family_number,
                &c.full_name,
                &c.birth_place,
                &c.birth_date,
                &gender,
                &religion,
                &education,
                &c.occupation,
                &marital,
                &blood,
                &nationality,
                &family_role,
                &c.father_name,
                &c.mother_name,
                &c.created_at,
                &c.updated_at,
            ],
            Some((Entity::Families, c.family_number.as_str())),
        )
        .await
    }

    async fn count(&self) -> Result<i64> {
        self.row_count(Entity::Citizens.table_name()).await
    }
}

#[async_trait]
impl TargetRepository<SettingRecord> for PgTarget {
    async fn exists(&self, natural_key: &str) -> Result<bool> {
        self.key_exists(Entity::Settings, natural_key).await
    }

    async fn upsert(&self, _natural_key: &str, s: &SettingRecord) -> Result<UpsertOutcome> {
        self.execute_upsert(
            Entity::Settings,
            UPSERT_SETTING,
            &[&s.key, &s.value, &s.description, &s.updated_at],
            None,
        )
        .await
    }

    async fn count(&self) -> Result<i64> {
        self.row_count(Entity::Settings.table_name()).await
    }
}

#[async_trait]
impl TargetInspector for PgTarget {
    async fn table_counts(&self) -> Result<BTreeMap<String, i64>> {
        let tables = self
            .natural_keys(
                "SELECT table_name::text FROM information_schema.tables \
                 WHERE table_schema = 'public' AND table_type = 'BASE TABLE' \
                 ORDER BY table_name",
                &[],
            )
            .await?;

        let mut counts = BTreeMap::new();
        for table in tables {
            let count = self.row_count(&table).await?;
            debug!("{}: {} rows", table, count);
            counts.insert(table, count);
        }
        Ok(counts)
    }

    async fn orphaned_references(&self, relation: &Relation) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT c.{nk}::text FROM {child} c \
             WHERE c.{fk} IS NOT NULL \
               AND NOT EXISTS (SELECT 1 FROM {parent} p WHERE p.id = c.{fk}) \
             ORDER BY 1",
            nk = Self::quote_ident(relation.child.natural_key_column()),
            child = Self::quote_ident(relation.child.table_name()),
            fk = Self::quote_ident(relation.fk_column),
            parent = Self::quote_ident(relation.parent.table_name()),
        );
        self.natural_keys(&sql, &[]).await
    }

    async fn missing_references(&self, relation: &Relation) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT {nk}::text FROM {child} WHERE {fk} IS NULL ORDER BY 1",
            nk = Self::quote_ident(relation.child.natural_key_column()),
            child = Self::quote_ident(relation.child.table_name()),
            fk = Self::quote_ident(relation.fk_column),
        );
        self.natural_keys(&sql, &[]).await
    }

    async fn duplicate_natural_keys(&self, entity: Entity) -> Result<Vec<(String, i64)>> {
        let sql = format!(
            "SELECT {nk}::text, COUNT(*) FROM {table} GROUP BY {nk} HAVING COUNT(*) > 1 ORDER BY 1",
            nk = Self::quote_ident(entity.natural_key_column()),
            table = Self::quote_ident(entity.table_name()),
        );
        let client = self.client().await?;
        let rows = client.query(&sql, &[]).await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<_, String>(0), r.get::<_, i64>(1)))
            .collect())
    }

    async fn families_without_head(&self) -> Result<Vec<String>> {
        let head = FamilyRole::Head.label();
        self.natural_keys(
            "SELECT f.family_number::text FROM families f \
             WHERE NOT EXISTS ( \
                 SELECT 1 FROM citizens c WHERE c.family_id = f.id AND c.family_role = $1 \
             ) \
             ORDER BY 1",
            &[&head],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::MappedRecord;

    fn conflict_column<R: MappedRecord>() -> &'static str {
        R::ENTITY.natural_key_column()
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(PgTarget::quote_ident("citizens"), "\"citizens\"");
        assert_eq!(PgTarget::quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_upserts_conflict_on_natural_key() {
        let cases = [
            (UPSERT_ROLE, conflict_column::<RoleRecord>()),
            (UPSERT_USER, conflict_column::<UserRecord>()),
            (UPSERT_FAMILY, conflict_column::<FamilyRecord>()),
            (UPSERT_CITIZEN, conflict_column::<CitizenRecord>()),
            (UPSERT_SETTING, conflict_column::<SettingRecord>()),
        ];
        for (sql, column) in cases {
            assert!(
                sql.contains(&format!("ON CONFLICT ({})", column)),
                "statement does not target {}",
                column
            );
            assert!(sql.ends_with("RETURNING (xmax = 0) AS inserted"));
        }
    }

    #[test]
    fn test_child_upserts_resolve_parent_by_natural_key() {
        assert!(UPSERT_USER.contains("FROM roles r"));
        assert!(UPSERT_CITIZEN.contains("WHERE f.family_number = $2::text"));
    }
}
