use crate::errors::Error;
use crate::ingest::Ingestor;
use crate::model::{parse_timestamp, Device, Page, ReadingBatch, ReadingsResponse, Sensor, SensorInput};
use crate::registry::{DeviceDirectory, SensorRegistry};
use crate::rule::{Rule, RuleInput, RuleStore};
use crate::sensors::SensorService;
use crate::timeseries::{query_device_readings, ReadingQuery, ReadingStore};
use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

const DEFAULT_PAGE: usize = 1;
const DEFAULT_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub directory: Arc<dyn DeviceDirectory>,
    pub registry: Arc<dyn SensorRegistry>,
    pub readings: Arc<dyn ReadingStore>,
    pub rules: Arc<dyn RuleStore>,
    pub ingestor: Arc<Ingestor>,
    pub sensors: Arc<SensorService>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/:tenant_id/devices/:device_id/data",
            get(get_data).post(post_data),
        )
        .route(
            "/api/:tenant_id/devices/:device_id/sensors",
            get(list_sensors).post(create_sensor),
        )
        .route(
            "/api/:tenant_id/devices/:device_id/sensors/:sensor_id",
            get(show_sensor).put(update_sensor).delete(delete_sensor),
        )
        .route("/api/:tenant_id/rules", get(list_rules).post(create_rule))
        .route(
            "/api/:tenant_id/rules/:rule_id",
            get(show_rule).put(update_rule).delete(delete_rule),
        )
        .with_state(state)
}

/// `page`/`limit` query parameters; anything but a positive integer falls
/// back to the default.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pagination {
    pub page: usize,
    pub limit: usize,
}

impl Pagination {
    pub fn from_params(params: &[(String, String)]) -> Self {
        let positive = |key: &str, default: usize| {
            param(params, key)
                .and_then(|raw| raw.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(default)
        };
        Self {
            page: positive("page", DEFAULT_PAGE),
            limit: positive("limit", DEFAULT_LIMIT),
        }
    }

    pub fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.limit)
    }

    pub fn paginate<T>(&self, items: Vec<T>) -> Result<Page<T>, Error> {
        let total_records = items.len();
        let total_pages = total_records.div_ceil(self.limit);
        if total_pages > 0 && self.page > total_pages {
            return Err(Error::invalid("exceeded the number of pages"));
        }

        Ok(Page {
            limit: self.limit,
            page: self.page,
            total_records,
            total_pages,
            data: items
                .into_iter()
                .skip(self.offset())
                .take(self.limit)
                .collect(),
        })
    }
}

fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
        .filter(|v| !v.is_empty())
}

/// Builds the reading query from `sensors`, `from`, `to`, `page` and `limit`.
/// Timestamps that do not parse are ignored.
pub fn reading_query(params: &[(String, String)]) -> (Vec<String>, ReadingQuery) {
    let sensors: Vec<String> = params
        .iter()
        .filter(|(k, _)| k == "sensors")
        .map(|(_, v)| v.clone())
        .collect();
    let valid_ts = |key: &str| {
        param(params, key)
            .filter(|raw| parse_timestamp(raw).is_some())
            .map(str::to_string)
    };
    let pagination = Pagination::from_params(params);

    let mut query = ReadingQuery::new(Vec::new());
    query.from = valid_ts("from");
    query.to = valid_ts("to");
    query.limit = pagination.limit;
    query.offset = pagination.offset();
    (sensors, query)
}

async fn load_device(state: &AppState, tenant_id: Uuid, device_id: Uuid) -> Result<Device, AppError> {
    state
        .directory
        .find_device(device_id)
        .await?
        .filter(|d| d.tenant_id == tenant_id)
        .ok_or_else(|| AppError::from(Error::NotFound(format!("device {device_id}"))))
}

async fn post_data(
    State(state): State<AppState>,
    ApiPath((tenant_id, device_id)): ApiPath<(Uuid, Uuid)>,
    body: Result<Json<ReadingBatch>, JsonRejection>,
) -> Result<StatusCode, AppError> {
    let Json(batch) = body.map_err(|e| Error::invalid(e.body_text()))?;
    load_device(&state, tenant_id, device_id).await?;
    state.ingestor.ingest(device_id, batch.data).await?;
    Ok(StatusCode::CREATED)
}

async fn get_data(
    State(state): State<AppState>,
    ApiPath((tenant_id, device_id)): ApiPath<(Uuid, Uuid)>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<ReadingsResponse>, AppError> {
    load_device(&state, tenant_id, device_id).await?;
    let (sensors, query) = reading_query(&params);
    let data = query_device_readings(
        state.registry.as_ref(),
        state.readings.as_ref(),
        device_id,
        &sensors,
        query,
    )
    .await?;
    Ok(Json(ReadingsResponse { data }))
}

async fn list_sensors(
    State(state): State<AppState>,
    ApiPath((tenant_id, device_id)): ApiPath<(Uuid, Uuid)>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<Page<Sensor>>, AppError> {
    load_device(&state, tenant_id, device_id).await?;
    let sensors = state.sensors.list(device_id).await?;
    Ok(Json(Pagination::from_params(&params).paginate(sensors)?))
}

async fn create_sensor(
    State(state): State<AppState>,
    ApiPath((tenant_id, device_id)): ApiPath<(Uuid, Uuid)>,
    body: Result<Json<SensorInput>, JsonRejection>,
) -> Result<(StatusCode, Json<Sensor>), AppError> {
    let Json(input) = body.map_err(|e| Error::invalid(e.body_text()))?;
    load_device(&state, tenant_id, device_id).await?;
    let sensor = state.sensors.create(device_id, input).await?;
    Ok((StatusCode::CREATED, Json(sensor)))
}

async fn show_sensor(
    State(state): State<AppState>,
    ApiPath((tenant_id, device_id, sensor_id)): ApiPath<(Uuid, Uuid, Uuid)>,
) -> Result<Json<Sensor>, AppError> {
    load_device(&state, tenant_id, device_id).await?;
    Ok(Json(state.sensors.get(device_id, sensor_id).await?))
}

async fn update_sensor(
    State(state): State<AppState>,
    ApiPath((tenant_id, device_id, sensor_id)): ApiPath<(Uuid, Uuid, Uuid)>,
    body: Result<Json<SensorInput>, JsonRejection>,
) -> Result<Json<Sensor>, AppError> {
    let Json(input) = body.map_err(|e| Error::invalid(e.body_text()))?;
    load_device(&state, tenant_id, device_id).await?;
    Ok(Json(state.sensors.update(device_id, sensor_id, input).await?))
}

async fn delete_sensor(
    State(state): State<AppState>,
    ApiPath((tenant_id, device_id, sensor_id)): ApiPath<(Uuid, Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    load_device(&state, tenant_id, device_id).await?;
    state.sensors.delete(device_id, sensor_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_rules(
    State(state): State<AppState>,
    ApiPath(tenant_id): ApiPath<Uuid>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<Page<Rule>>, AppError> {
    let rules = state.rules.list_rules(tenant_id).await?;
    Ok(Json(Pagination::from_params(&params).paginate(rules)?))
}

async fn create_rule(
    State(state): State<AppState>,
    ApiPath(tenant_id): ApiPath<Uuid>,
    body: Result<Json<RuleInput>, JsonRejection>,
) -> Result<(StatusCode, Json<Rule>), AppError> {
    let Json(input) = body.map_err(|e| Error::invalid(e.body_text()))?;
    let input = input.normalized();
    input
        .validate(tenant_id, state.directory.as_ref(), state.registry.as_ref())
        .await?;

    let rule = input.into_rule(tenant_id);
    state.rules.insert_rule(&rule).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn show_rule(
    State(state): State<AppState>,
    ApiPath((tenant_id, rule_id)): ApiPath<(Uuid, Uuid)>,
) -> Result<Json<Rule>, AppError> {
    Ok(Json(find_rule(&state, tenant_id, rule_id).await?))
}

async fn update_rule(
    State(state): State<AppState>,
    ApiPath((tenant_id, rule_id)): ApiPath<(Uuid, Uuid)>,
    body: Result<Json<RuleInput>, JsonRejection>,
) -> Result<Json<Rule>, AppError> {
    let Json(input) = body.map_err(|e| Error::invalid(e.body_text()))?;
    let existing = find_rule(&state, tenant_id, rule_id).await?;
    let input = input.normalized();
    input
        .validate(tenant_id, state.directory.as_ref(), state.registry.as_ref())
        .await?;

    state.rules.update_rule(&input.apply_to(&existing)).await?;
    Ok(Json(find_rule(&state, tenant_id, rule_id).await?))
}

async fn delete_rule(
    State(state): State<AppState>,
    ApiPath((tenant_id, rule_id)): ApiPath<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    if !state.rules.delete_rule(tenant_id, rule_id).await? {
        return Err(Error::NotFound(format!("rule {rule_id}")).into());
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn find_rule(state: &AppState, tenant_id: Uuid, rule_id: Uuid) -> Result<Rule, AppError> {
    state
        .rules
        .get_rule(tenant_id, rule_id)
        .await?
        .ok_or_else(|| AppError::from(Error::NotFound(format!("rule {rule_id}"))))
}

pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, messages) = match self.0.downcast_ref::<Error>() {
            Some(
                e @ (Error::Validation(_) | Error::InactiveSensor(_) | Error::Conflict(_)),
            ) => (StatusCode::UNPROCESSABLE_ENTITY, e.messages()),
            Some(e @ Error::NotFound(_)) => (StatusCode::NOT_FOUND, e.messages()),
            _ => {
                error!("API error: {}", self.0);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    vec![format!("Internal server error: {}", self.0)],
                )
            }
        };
        (status, Json(json!({ "errors": messages }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Path parameters whose rejection (a malformed id) is reported like any
/// other validation failure.
pub struct ApiPath<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e| Error::invalid(e.body_text()))?;
        Ok(ApiPath(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_pagination_defaults_and_garbage() {
        assert_eq!(
            Pagination::from_params(&[]),
            Pagination { page: 1, limit: 100 }
        );
        let p = Pagination::from_params(&params(&[("page", "0"), ("limit", "abc")]));
        assert_eq!(p, Pagination { page: 1, limit: 100 });
        let p = Pagination::from_params(&params(&[("page", "3"), ("limit", "20")]));
        assert_eq!(p.offset(), 40);
    }

    #[test]
    fn test_paginate() {
        let p = Pagination { page: 2, limit: 2 };
        let page = p.paginate(vec![1, 2, 3, 4, 5]).unwrap();
        assert_eq!(page.data, vec![3, 4]);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.total_records, 5);

        let beyond = Pagination { page: 4, limit: 2 };
        assert!(beyond.paginate(vec![1, 2, 3]).is_err());

        let empty = Pagination { page: 1, limit: 10 };
        assert!(empty.paginate(Vec::<u8>::new()).unwrap().data.is_empty());
    }

    #[test]
    fn test_reading_query_params() {
        let (sensors, query) = reading_query(&params(&[
            ("sensors", "temp"),
            ("sensors", "humidity"),
            ("from", "2024-01-01T00:00:00.000Z"),
            ("to", "not-a-date"),
            ("page", "2"),
            ("limit", "10"),
        ]));
        assert_eq!(sensors, vec!["temp", "humidity"]);
        assert_eq!(query.from.as_deref(), Some("2024-01-01T00:00:00.000Z"));
        assert!(query.to.is_none());
        assert_eq!(query.limit, 10);
        assert_eq!(query.offset, 10);
    }

    #[test]
    fn test_error_status_codes() {
        let status = |e: Error| AppError::from(e).into_response().status();
        assert_eq!(status(Error::invalid("x")), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            status(Error::InactiveSensor("t".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status(Error::Conflict("dup".into())), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status(Error::NotFound("d".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status(Error::Notification("smtp down".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
