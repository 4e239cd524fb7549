//! Postgres adapters.
//!
//! The registry tables are plain relational rows. Readings live in one JSONB
//! table partitioned logically by `device_id`; `seq` records insertion order,
//! which is what "newest" means for rule evaluation.

use crate::errors::{Error, Result};
use crate::metrics::STORE_FAILURES_TOTAL;
use crate::model::{Device, Reading, Sensor, Status};
use crate::registry::{DeviceDirectory, SensorRegistry};
use crate::rule::{Aggregation, Operator, Rule, RuleStore};
use crate::timeseries::{project, ReadingQuery, ReadingStore, SortOrder};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}

fn unique_violation(err: sqlx::Error, message: &str) -> Error {
    match &err {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
            Error::Conflict(message.to_string())
        }
        _ => Error::Store(err),
    }
}

/// All store seams over one connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_batch_inner(&self, device_id: Uuid, batch: &[Reading]) -> Result<()> {
        let docs: Vec<Json<&Reading>> = batch.iter().map(Json).collect();

        // one statement, so the batch lands entirely or not at all
        sqlx::query(
            r#"
            INSERT INTO readings (device_id, doc)
            SELECT $1, d FROM UNNEST($2::jsonb[]) WITH ORDINALITY AS t(d, n)
            ORDER BY n
            "#,
        )
        .bind(device_id)
        .bind(&docs)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    id: Uuid,
    tenant_id: Uuid,
    name: String,
    status: String,
    secret_key: String,
}

#[derive(sqlx::FromRow)]
struct SensorRow {
    id: Uuid,
    device_id: Uuid,
    name: String,
    description: String,
    unit: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SensorRow> for Sensor {
    fn from(row: SensorRow) -> Self {
        Sensor {
            id: row.id,
            device_id: row.device_id,
            name: row.name,
            description: row.description,
            unit: row.unit,
            status: Status::parse(&row.status).unwrap_or(Status::Active),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    id: Uuid,
    device_id: Uuid,
    tenant_id: Uuid,
    sensor: String,
    description: String,
    operation: String,
    count_latest: i64,
    email: String,
    email_subject: String,
    email_body: String,
    endpoint_url: String,
    endpoint_header: Json<Map<String, Value>>,
    endpoint_payload: Json<Map<String, Value>>,
    operator: String,
    value: String,
    time_between_notification: String,
    last_notification: Option<DateTime<Utc>>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RuleRow> for Rule {
    fn from(row: RuleRow) -> Self {
        Rule {
            id: row.id,
            device_id: row.device_id,
            tenant_id: row.tenant_id,
            sensor: row.sensor,
            description: row.description,
            operation: Aggregation::parse(&row.operation),
            count_latest: row.count_latest,
            email: row.email,
            email_subject: row.email_subject,
            email_body: row.email_body,
            endpoint_url: row.endpoint_url,
            endpoint_header: row.endpoint_header.0,
            endpoint_payload: row.endpoint_payload.0,
            operator: Operator::parse(&row.operator),
            value: row.value,
            time_between_notification: row.time_between_notification,
            last_notification: row.last_notification,
            status: Status::parse(&row.status).unwrap_or(Status::Active),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const SENSOR_COLUMNS: &str =
    "id, device_id, name, description, unit, status, created_at, updated_at";

const RULE_COLUMNS: &str = "id, device_id, tenant_id, sensor, description, operation, \
     count_latest, email, email_subject, email_body, endpoint_url, endpoint_header, \
     endpoint_payload, operator, value, time_between_notification, last_notification, \
     status, created_at, updated_at";

#[async_trait]
impl DeviceDirectory for PgStore {
    async fn find_device(&self, device_id: Uuid) -> Result<Option<Device>> {
        let row = sqlx::query_as::<_, DeviceRow>(
            "SELECT id, tenant_id, name, status, secret_key FROM devices WHERE id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let sensors = self.list_sensors(device_id).await?;
        Ok(Some(Device {
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            status: Status::parse(&row.status).unwrap_or(Status::Inactive),
            secret_key: row.secret_key,
            sensors,
        }))
    }
}

#[async_trait]
impl SensorRegistry for PgStore {
    async fn list_sensors(&self, device_id: Uuid) -> Result<Vec<Sensor>> {
        let rows = sqlx::query_as::<_, SensorRow>(&format!(
            "SELECT {SENSOR_COLUMNS} FROM sensors WHERE device_id = $1 ORDER BY created_at, name"
        ))
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Sensor::from).collect())
    }

    async fn get_sensor(&self, device_id: Uuid, sensor_id: Uuid) -> Result<Option<Sensor>> {
        let row = sqlx::query_as::<_, SensorRow>(&format!(
            "SELECT {SENSOR_COLUMNS} FROM sensors WHERE device_id = $1 AND id = $2"
        ))
        .bind(device_id)
        .bind(sensor_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Sensor::from))
    }

    async fn find_sensor_by_name(&self, device_id: Uuid, name: &str) -> Result<Option<Sensor>> {
        let row = sqlx::query_as::<_, SensorRow>(&format!(
            "SELECT {SENSOR_COLUMNS} FROM sensors WHERE device_id = $1 AND name = $2"
        ))
        .bind(device_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Sensor::from))
    }

    async fn insert_sensor(&self, sensor: &Sensor) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensors (id, device_id, name, description, unit, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(sensor.id)
        .bind(sensor.device_id)
        .bind(&sensor.name)
        .bind(&sensor.description)
        .bind(&sensor.unit)
        .bind(sensor.status.as_str())
        .bind(sensor.created_at)
        .bind(sensor.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| unique_violation(e, "sensor already exists"))?;
        Ok(())
    }

    async fn update_sensor(&self, sensor: &Sensor) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sensors
            SET name = $3, description = $4, unit = $5, status = $6, updated_at = $7
            WHERE device_id = $1 AND id = $2
            "#,
        )
        .bind(sensor.device_id)
        .bind(sensor.id)
        .bind(&sensor.name)
        .bind(&sensor.description)
        .bind(&sensor.unit)
        .bind(sensor.status.as_str())
        .bind(sensor.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| unique_violation(e, "sensor with that name already exists"))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("sensor {}", sensor.id)));
        }
        Ok(())
    }

    async fn delete_sensor(&self, device_id: Uuid, sensor_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sensors WHERE device_id = $1 AND id = $2")
            .bind(device_id)
            .bind(sensor_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ReadingStore for PgStore {
    async fn insert_batch(&self, device_id: Uuid, batch: &[Reading]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut attempts = 0;
        let max_attempts = 5;

        loop {
            attempts += 1;
            match self.insert_batch_inner(device_id, batch).await {
                Ok(()) => return Ok(()),
                Err(Error::Store(db_err)) => {
                    if attempts >= max_attempts || !is_transient_error(&db_err) {
                        error!(
                            "Reading insert failed permanently after {} attempts: {}",
                            attempts, db_err
                        );
                        return Err(Error::Store(db_err));
                    }

                    let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                    warn!(
                        "Reading insert failed (attempt {}/{}), retrying in {}ms: {}",
                        attempts, max_attempts, wait_ms, db_err
                    );
                    STORE_FAILURES_TOTAL.inc();
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                Err(e) => {
                    error!("Reading insert failed with non-database error: {}", e);
                    return Err(e);
                }
            }
        }
    }

    async fn query(&self, device_id: Uuid, query: &ReadingQuery) -> Result<Vec<Reading>> {
        let order = match query.order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        let sql = format!(
            r#"
            SELECT doc FROM readings
            WHERE device_id = $1
              AND doc->>'collected_at' > $2
              AND doc->>'collected_at' < $3
              AND doc ?| $4
            ORDER BY seq {order}
            LIMIT $5 OFFSET $6
            "#
        );

        let rows: Vec<(Json<Reading>,)> = sqlx::query_as(&sql)
            .bind(device_id)
            .bind(query.lower_bound())
            .bind(query.upper_bound())
            .bind(&query.fields)
            .bind(query.limit as i64)
            .bind(query.offset as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(doc,)| project(&doc.0, &query.fields))
            .collect())
    }

    async fn latest_with_field(&self, device_id: Uuid, field: &str, limit: usize) -> Result<Vec<Reading>> {
        let rows: Vec<(Json<Reading>,)> = sqlx::query_as(
            r#"
            SELECT doc FROM readings
            WHERE device_id = $1 AND doc ? $2
            ORDER BY seq DESC
            LIMIT $3
            "#,
        )
        .bind(device_id)
        .bind(field)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(doc,)| doc.0).collect())
    }

    async fn rename_field(&self, device_id: Uuid, old: &str, new: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE readings
            SET doc = (doc - $2::text) || jsonb_build_object($3::text, doc -> $2::text)
            WHERE device_id = $1 AND doc ? $2::text
            "#,
        )
        .bind(device_id)
        .bind(old)
        .bind(new)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_field(&self, device_id: Uuid, name: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE readings SET doc = doc - $2::text WHERE device_id = $1 AND doc ? $2::text",
        )
        .bind(device_id)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_documents_with_only_field(
        &self,
        device_id: Uuid,
        name: &str,
        other_fields: &[String],
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM readings
            WHERE device_id = $1 AND doc ? $2::text AND NOT (doc ?| $3::text[])
            "#,
        )
        .bind(device_id)
        .bind(name)
        .bind(other_fields)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RuleStore for PgStore {
    async fn insert_rule(&self, rule: &Rule) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO rules ({RULE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)"
        ))
        .bind(rule.id)
        .bind(rule.device_id)
        .bind(rule.tenant_id)
        .bind(&rule.sensor)
        .bind(&rule.description)
        .bind(rule.operation.map(|a| a.as_str()).unwrap_or_default())
        .bind(rule.count_latest)
        .bind(&rule.email)
        .bind(&rule.email_subject)
        .bind(&rule.email_body)
        .bind(&rule.endpoint_url)
        .bind(Json(&rule.endpoint_header))
        .bind(Json(&rule.endpoint_payload))
        .bind(rule.operator.map(|o| o.as_str()).unwrap_or_default())
        .bind(&rule.value)
        .bind(&rule.time_between_notification)
        .bind(rule.last_notification)
        .bind(rule.status.as_str())
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_rule(&self, rule: &Rule) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE rules
            SET device_id = $3, sensor = $4, description = $5, operation = $6,
                count_latest = $7, email = $8, email_subject = $9, email_body = $10,
                endpoint_url = $11, endpoint_header = $12, endpoint_payload = $13,
                operator = $14, value = $15, time_between_notification = $16,
                status = $17, updated_at = now()
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(rule.tenant_id)
        .bind(rule.id)
        .bind(rule.device_id)
        .bind(&rule.sensor)
        .bind(&rule.description)
        .bind(rule.operation.map(|a| a.as_str()).unwrap_or_default())
        .bind(rule.count_latest)
        .bind(&rule.email)
        .bind(&rule.email_subject)
        .bind(&rule.email_body)
        .bind(&rule.endpoint_url)
        .bind(Json(&rule.endpoint_header))
        .bind(Json(&rule.endpoint_payload))
        .bind(rule.operator.map(|o| o.as_str()).unwrap_or_default())
        .bind(&rule.value)
        .bind(&rule.time_between_notification)
        .bind(rule.status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("rule {}", rule.id)));
        }
        Ok(())
    }

    async fn get_rule(&self, tenant_id: Uuid, rule_id: Uuid) -> Result<Option<Rule>> {
        let row = sqlx::query_as::<_, RuleRow>(&format!(
            "SELECT {RULE_COLUMNS} FROM rules WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id)
        .bind(rule_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Rule::from))
    }

    async fn list_rules(&self, tenant_id: Uuid) -> Result<Vec<Rule>> {
        let rows = sqlx::query_as::<_, RuleRow>(&format!(
            "SELECT {RULE_COLUMNS} FROM rules WHERE tenant_id = $1 ORDER BY updated_at DESC"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Rule::from).collect())
    }

    async fn delete_rule(&self, tenant_id: Uuid, rule_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM rules WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id)
            .bind(rule_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn active_rules_for_device(&self, device_id: Uuid) -> Result<Vec<Rule>> {
        let rows = sqlx::query_as::<_, RuleRow>(&format!(
            "SELECT {RULE_COLUMNS} FROM rules WHERE device_id = $1 AND status = 'active'"
        ))
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Rule::from).collect())
    }

    async fn mark_fired(
        &self,
        rule_id: Uuid,
        previous: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE rules SET last_notification = $3
            WHERE id = $1 AND last_notification IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(rule_id)
        .bind(previous)
        .bind(fired_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
