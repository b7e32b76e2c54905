//! MySQL/MariaDB source reader.
//!
//! Uses SQLx for connection pooling and async query execution.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tracing::{debug, info};

use super::{SourceReader, SourceRow, SourceValue};
use crate::config::{SourceConfig, SourceTable};
use crate::error::{MigrateError, Result};

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// MySQL/MariaDB source reader.
pub struct MysqlSource {
    pool: MySqlPool,
}

impl MysqlSource {
    /// Connect to the legacy database and verify the connection.
    pub async fn connect(config: &SourceConfig) -> Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password)
            .ssl_mode(MySqlSslMode::Preferred);

        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(POOL_CONNECTION_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| MigrateError::pool(e, "creating MySQL source pool"))?;

        // Test connection
        sqlx::query("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| MigrateError::pool(e, "testing MySQL source connection"))?;

        info!("Connected to MySQL source: {}", config.connection_url(true));

        Ok(Self { pool })
    }

    /// Quote a MySQL identifier.
    fn quote_ident(name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    /// Convert a MySQL row into a column map.
    fn row_to_source(row: &MySqlRow) -> SourceRow {
        let mut out = SourceRow::new();
        for (i, col) in row.columns().iter().enumerate() {
            let is_null = row.try_get_raw(i).map(|r| r.is_null()).unwrap_or(true);
            let value = if is_null {
                SourceValue::Null
            } else {
                Self::convert_value(row, i, &col.type_info().name().to_uppercase())
            };
            out.insert(col.name(), value);
        }
        out
    }

    /// Decode one column by its reported MySQL type. Values the driver
    /// refuses to decode (zero dates, out-of-range unsigned) read as NULL.
    fn convert_value(row: &MySqlRow, i: usize, type_name: &str) -> SourceValue {
        let base = type_name.split_whitespace().next().unwrap_or(type_name);
        match base {
            "BOOLEAN" => row
                .try_get::<bool, _>(i)
                .map(SourceValue::Bool)
                .unwrap_or(SourceValue::Null),
            "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "INTEGER" | "BIGINT" | "YEAR" => row
                .try_get::<i64, _>(i)
                .map(SourceValue::Int)
                .or_else(|_| {
                    row.try_get::<u64, _>(i)
                        .map(|v| SourceValue::Int(i64::try_from(v).unwrap_or(i64::MAX)))
                })
                .unwrap_or(SourceValue::Null),
            "FLOAT" | "DOUBLE" | "REAL" => row
                .try_get::<f64, _>(i)
                .or_else(|_| row.try_get::<f32, _>(i).map(f64::from))
                .map(SourceValue::Float)
                .unwrap_or(SourceValue::Null),
            "DECIMAL" | "NUMERIC" => row
                .try_get::<rust_decimal::Decimal, _>(i)
                .map(|d| SourceValue::Text(d.normalize().to_string()))
                .unwrap_or(SourceValue::Null),
            "DATE" => row
                .try_get::<chrono::NaiveDate, _>(i)
                .map(SourceValue::Date)
                .unwrap_or(SourceValue::Null),
            "DATETIME" | "TIMESTAMP" => row
                .try_get::<chrono::NaiveDateTime, _>(i)
                .map(SourceValue::DateTime)
                .or_else(|_| {
                    row.try_get::<chrono::DateTime<chrono::Utc>, _>(i)
                        .map(|dt| SourceValue::DateTime(dt.naive_utc()))
                })
                .unwrap_or(SourceValue::Null),
            "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" => row
                .try_get::<Vec<u8>, _>(i)
                .map(SourceValue::Bytes)
                .unwrap_or(SourceValue::Null),
            _ => row
                .try_get::<String, _>(i)
                .map(SourceValue::Text)
                .or_else(|_| row.try_get::<Vec<u8>, _>(i).map(SourceValue::Bytes))
                .unwrap_or(SourceValue::Null),
        }
    }
}

#[async_trait]
impl SourceReader for MysqlSource {
    async fn count(&self, table: &SourceTable) -> Result<i64> {
        let sql = format!(
            "SELECT CAST(COUNT(*) AS SIGNED) FROM {}",
            Self::quote_ident(&table.name)
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>(0)?)
    }

    async fn fetch(
        &self,
        table: &SourceTable,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SourceRow>> {
        let sql = format!(
            "SELECT * FROM {} ORDER BY {} LIMIT ? OFFSET ?",
            Self::quote_ident(&table.name),
            Self::quote_ident(&table.primary_key)
        );
        debug!("{}: fetching {} rows at offset {}", table.name, limit, offset);

        let rows: Vec<MySqlRow> = sqlx::query(&sql)
            .bind(limit as u64)
            .bind(offset as u64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(Self::row_to_source).collect())
    }

    fn db_type(&self) -> &str {
        "mysql"
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
