//! Append-only, schema-less reading store.
//!
//! Every device owns one logical collection of documents. A document is the
//! reading exactly as ingested: arbitrary sensor keys plus `collected_at`.
//! Nothing ties a document key to a registry row, so renames and deletions
//! are pushed down explicitly through [`ReadingStore::rename_field`] and
//! friends.

use crate::errors::Result;
use crate::model::{format_timestamp, Reading, COLLECTED_AT};
use crate::registry::SensorRegistry;
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Insertion order, oldest first.
    #[default]
    Ascending,
    Descending,
}

/// Range query over one device collection.
#[derive(Debug, Clone)]
pub struct ReadingQuery {
    /// Sensor fields to project; `collected_at` is always added.
    pub fields: Vec<String>,
    /// Exclusive lower bound on `collected_at`; unbounded when `None`.
    pub from: Option<String>,
    /// Exclusive upper bound on `collected_at`; "now" when `None`.
    pub to: Option<String>,
    pub limit: usize,
    pub offset: usize,
    pub order: SortOrder,
}

impl ReadingQuery {
    pub fn new(fields: Vec<String>) -> Self {
        Self {
            fields,
            from: None,
            to: None,
            limit: 100,
            offset: 0,
            order: SortOrder::Ascending,
        }
    }

    pub fn lower_bound(&self) -> &str {
        self.from.as_deref().unwrap_or("")
    }

    pub fn upper_bound(&self) -> String {
        self.to
            .clone()
            .unwrap_or_else(|| format_timestamp(Utc::now()))
    }
}

#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Appends the whole batch or nothing.
    async fn insert_batch(&self, device_id: Uuid, readings: &[Reading]) -> Result<()>;

    async fn query(&self, device_id: Uuid, query: &ReadingQuery) -> Result<Vec<Reading>>;

    /// Up to `limit` documents holding `field`, newest first.
    async fn latest_with_field(
        &self,
        device_id: Uuid,
        field: &str,
        limit: usize,
    ) -> Result<Vec<Reading>>;

    /// Renames `old` to `new` in every document holding `old`, atomically.
    async fn rename_field(&self, device_id: Uuid, old: &str, new: &str) -> Result<u64>;

    /// Removes `name` from every document holding it.
    async fn delete_field(&self, device_id: Uuid, name: &str) -> Result<u64>;

    /// Deletes documents that hold `name` and none of `other_fields`.
    async fn delete_documents_with_only_field(
        &self,
        device_id: Uuid,
        name: &str,
        other_fields: &[String],
    ) -> Result<u64>;
}

/// Resolves which sensor fields a query projects.
///
/// Requested names are kept only when the device knows them. An empty
/// request, or one that matches nothing, means "every device sensor".
pub fn select_fields(requested: &[String], device_sensors: &[String]) -> Vec<String> {
    let mut selected: Vec<String> = Vec::new();
    for name in requested {
        if name != COLLECTED_AT && device_sensors.contains(name) && !selected.contains(name) {
            selected.push(name.clone());
        }
    }

    if selected.is_empty() {
        return device_sensors.to_vec();
    }
    selected
}

/// Projects `doc` onto `fields` plus `collected_at`.
///
/// Returns `None` when the document carries none of the requested fields.
pub fn project(doc: &Reading, fields: &[String]) -> Option<Reading> {
    let mut projected = Reading::new();
    for field in fields {
        if let Some(value) = doc.get(field) {
            projected.insert(field.clone(), value.clone());
        }
    }
    if projected.is_empty() {
        return None;
    }
    if let Some(ts) = doc.get(COLLECTED_AT) {
        projected.insert(COLLECTED_AT.to_string(), ts.clone());
    }
    Some(projected)
}

/// `from < collected_at < to`, compared lexically.
pub fn within_window(doc: &Reading, from: &str, to: &str) -> bool {
    match doc.get(COLLECTED_AT).and_then(|v| v.as_str()) {
        Some(ts) => ts > from && ts < to,
        None => false,
    }
}

/// True when `name` is the only field of `doc` among the device's sensors.
pub fn holds_only_field(doc: &Reading, name: &str, other_fields: &[String]) -> bool {
    doc.contains_key(name) && !other_fields.iter().any(|f| doc.contains_key(f))
}

/// Reads a device collection the way the data endpoint exposes it.
pub async fn query_device_readings(
    registry: &dyn SensorRegistry,
    store: &dyn ReadingStore,
    device_id: Uuid,
    requested: &[String],
    mut query: ReadingQuery,
) -> Result<Vec<Reading>> {
    let known: Vec<String> = registry
        .list_sensors(device_id)
        .await?
        .into_iter()
        .map(|s| s.name)
        .collect();

    query.fields = select_fields(requested, &known);
    if query.fields.is_empty() {
        return Ok(Vec::new());
    }
    store.query(device_id, &query).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Reading {
        value.as_object().unwrap().clone()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_fields_intersects_with_registry() {
        let known = names(&["temp", "humidity", "battery"]);
        let requested = names(&["humidity", "unknown", "humidity", "collected_at"]);
        assert_eq!(select_fields(&requested, &known), names(&["humidity"]));
    }

    #[test]
    fn test_select_fields_falls_back_to_all_sensors() {
        let known = names(&["temp", "humidity"]);
        assert_eq!(select_fields(&names(&["nope"]), &known), known);
        assert_eq!(select_fields(&[], &known), known);
        assert_eq!(select_fields(&names(&["collected_at"]), &known), known);
    }

    #[test]
    fn test_project_keeps_timestamp_and_requested_fields() {
        let d = doc(json!({"temp": 21.5, "humidity": 40, "collected_at": "2024-01-01T00:00:00.000Z"}));
        let projected = project(&d, &names(&["temp"])).unwrap();
        assert_eq!(
            serde_json::Value::Object(projected),
            json!({"temp": 21.5, "collected_at": "2024-01-01T00:00:00.000Z"})
        );
    }

    #[test]
    fn test_project_skips_documents_without_fields() {
        let d = doc(json!({"humidity": 40, "collected_at": "2024-01-01T00:00:00.000Z"}));
        assert!(project(&d, &names(&["temp"])).is_none());
    }

    #[test]
    fn test_within_window_is_exclusive() {
        let d = doc(json!({"collected_at": "2024-01-01T00:00:00.000Z"}));
        assert!(within_window(&d, "", "2024-01-02T00:00:00.000Z"));
        assert!(!within_window(&d, "2024-01-01T00:00:00.000Z", "2024-01-02T00:00:00.000Z"));
        assert!(!within_window(&d, "", "2024-01-01T00:00:00.000Z"));
    }

    #[test]
    fn test_holds_only_field() {
        let single = doc(json!({"humidity": 40, "collected_at": "x"}));
        let multi = doc(json!({"humidity": 40, "temp": 20, "collected_at": "x"}));
        let others = names(&["temp"]);
        assert!(holds_only_field(&single, "humidity", &others));
        assert!(!holds_only_field(&multi, "humidity", &others));
        assert!(!holds_only_field(&multi, "battery", &others));
    }

    #[test]
    fn test_default_upper_bound_is_now() {
        let q = ReadingQuery::new(vec![]);
        assert_eq!(q.lower_bound(), "");
        assert_eq!(q.upper_bound().len(), 24);
    }
}
