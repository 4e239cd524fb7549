//! Rule definitions, their validation and the pure parts of evaluation.

use crate::errors::{Error, Result};
use crate::model::{value_to_plain_string, Status};
use crate::registry::{DeviceDirectory, SensorRegistry};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

const MAX_FIELD_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
}

impl Operator {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "lt" => Some(Operator::Lt),
            "lte" => Some(Operator::Lte),
            "gt" => Some(Operator::Gt),
            "gte" => Some(Operator::Gte),
            "eq" => Some(Operator::Eq),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Eq => "eq",
        }
    }

    /// Applies the operator to an observed device value.
    ///
    /// Ordering operators need both sides numeric. `eq` falls back to exact
    /// string equality when either side is not a number.
    pub fn holds(&self, observed: &Value, target: &RuleValue) -> bool {
        match (self, numeric(observed)) {
            (_, Some(o)) if target.as_number().is_some() => self.holds_number(o, target),
            (Operator::Eq, _) => value_to_plain_string(observed) == target.raw(),
            _ => false,
        }
    }

    /// Numeric comparison for aggregates, which may overflow to infinity and
    /// so cannot round-trip through a JSON value. False for a text target.
    pub fn holds_number(&self, observed: f64, target: &RuleValue) -> bool {
        let Some(t) = target.as_number() else {
            return false;
        };
        match self {
            Operator::Gt => observed > t,
            Operator::Gte => observed >= t,
            Operator::Lt => observed < t,
            Operator::Lte => observed <= t,
            Operator::Eq => observed == t,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Sum,
    Mean,
    Median,
    Max,
    Min,
}

impl Aggregation {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sum" => Some(Aggregation::Sum),
            "mean" => Some(Aggregation::Mean),
            "median" => Some(Aggregation::Median),
            "max" => Some(Aggregation::Max),
            "min" => Some(Aggregation::Min),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Sum => "sum",
            Aggregation::Mean => "mean",
            Aggregation::Median => "median",
            Aggregation::Max => "max",
            Aggregation::Min => "min",
        }
    }

    /// Aggregates the numeric members of `values`; non-numeric ones are skipped.
    ///
    /// Returns `None` when nothing numeric is left.
    pub fn apply(&self, values: &[Value]) -> Option<f64> {
        let mut numbers: Vec<f64> = values.iter().filter_map(numeric).collect();
        if numbers.is_empty() {
            return None;
        }

        let result = match self {
            Aggregation::Sum => numbers.iter().sum(),
            Aggregation::Mean => numbers.iter().sum::<f64>() / numbers.len() as f64,
            Aggregation::Median => {
                numbers.sort_by(|a, b| a.total_cmp(b));
                let mid = numbers.len() / 2;
                if numbers.len() % 2 == 0 {
                    (numbers[mid - 1] + numbers[mid]) / 2.0
                } else {
                    numbers[mid]
                }
            }
            Aggregation::Max => numbers.iter().copied().fold(numbers[0], f64::max),
            Aggregation::Min => numbers.iter().copied().fold(numbers[0], f64::min),
        };
        Some(result)
    }
}

/// A rule's comparison value, resolved at evaluation time.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleValue {
    Number(f64, String),
    Text(String),
}

impl RuleValue {
    pub fn parse(raw: &str) -> Self {
        match raw.parse::<f64>() {
            Ok(n) => RuleValue::Number(n, raw.to_string()),
            Err(_) => RuleValue::Text(raw.to_string()),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            RuleValue::Number(n, _) => Some(*n),
            RuleValue::Text(_) => None,
        }
    }

    pub fn raw(&self) -> &str {
        match self {
            RuleValue::Number(_, raw) | RuleValue::Text(raw) => raw,
        }
    }
}

/// Numeric view of a stored JSON value: numbers, or strings that parse as one.
pub fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Parses `time_between_notification`: digits followed by `s`, `m` or `h`.
pub fn parse_throttle(raw: &str) -> Option<Duration> {
    let unit = raw.chars().last()?;
    let digits = &raw[..raw.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: i64 = digits.parse().ok()?;
    let seconds = match unit {
        's' => Some(amount),
        'm' => amount.checked_mul(60),
        'h' => amount.checked_mul(3600),
        _ => None,
    }?;
    Duration::try_seconds(seconds)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rule {
    pub id: Uuid,
    pub device_id: Uuid,
    #[serde(skip_serializing)]
    pub tenant_id: Uuid,
    pub sensor: String,
    pub description: String,
    pub operation: Option<Aggregation>,
    pub count_latest: i64,
    pub email: String,
    pub email_subject: String,
    pub email_body: String,
    pub endpoint_url: String,
    pub endpoint_header: Map<String, Value>,
    pub endpoint_payload: Map<String, Value>,
    pub operator: Option<Operator>,
    pub value: String,
    pub time_between_notification: String,
    pub last_notification: Option<DateTime<Utc>>,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    pub fn is_active(&self) -> bool {
        self.status == Status::Active
    }

    /// True while the rule is still inside its debounce window.
    pub fn is_throttled(&self, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_notification else {
            return false;
        };
        match parse_throttle(&self.time_between_notification) {
            Some(window) => now - last < window,
            None => false,
        }
    }

    /// A rule without an explicit operator compares for equality.
    pub fn effective_operator(&self) -> Operator {
        self.operator.unwrap_or(Operator::Eq)
    }

    pub fn comparison_value(&self) -> RuleValue {
        RuleValue::parse(&self.value)
    }
}

/// Rule body accepted by the create and update endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuleInput {
    pub device_id: Option<Uuid>,
    pub sensor: String,
    pub description: String,
    pub operation: String,
    pub count_latest: Option<i64>,
    pub email: String,
    pub email_subject: String,
    pub email_body: String,
    pub endpoint_url: String,
    pub endpoint_header: Option<Map<String, Value>>,
    pub endpoint_payload: Option<Map<String, Value>>,
    pub operator: String,
    pub value: String,
    pub time_between_notification: String,
    pub status: String,
}

impl RuleInput {
    pub fn normalized(mut self) -> Self {
        for field in [
            &mut self.sensor,
            &mut self.description,
            &mut self.operation,
            &mut self.email,
            &mut self.endpoint_url,
            &mut self.operator,
            &mut self.value,
            &mut self.time_between_notification,
        ] {
            *field = field.trim().to_string();
        }
        self.status = self.status.trim().to_lowercase();
        self
    }

    pub fn count_latest(&self) -> i64 {
        self.count_latest.unwrap_or(1)
    }

    /// Checks everything that does not need a store lookup.
    pub fn field_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let too_long = |s: &str| s.chars().count() > MAX_FIELD_LEN;

        if self.value.is_empty() {
            errors.push("value is required".to_string());
        }
        if too_long(&self.value) {
            errors.push("value is too long".to_string());
        }
        if too_long(&self.description) {
            errors.push("description is too long".to_string());
        }
        if !self.email.is_empty() {
            if too_long(&self.email) {
                errors.push("email is too long".to_string());
            }
            if self.email.parse::<lettre::Address>().is_err() {
                errors.push("invalid email".to_string());
            }
        }
        if too_long(&self.email_subject) {
            errors.push("email_subject is too long".to_string());
        }
        if too_long(&self.email_body) {
            errors.push("email_body is too long".to_string());
        }
        if too_long(&self.endpoint_url) {
            errors.push("endpoint_url is too long".to_string());
        }
        if !self.time_between_notification.is_empty()
            && parse_throttle(&self.time_between_notification).is_none()
        {
            errors.push("invalid time_between_notification".to_string());
        }

        let invalid_operator =
            "invalid operator. The available operators are: lt, lte, gt, gte and eq";
        let invalid_operation =
            "invalid operation. The available operations are: sum, mean, median, max and min";

        let count = self.count_latest();
        if count < 1 {
            errors.push("count_latest is required".to_string());
        } else if count > 1 {
            if self.operator.is_empty() {
                errors.push("operator is required".to_string());
            } else if Operator::parse(&self.operator).is_none() {
                errors.push(invalid_operator.to_string());
            }
            if self.operation.is_empty() {
                errors.push("operation is required".to_string());
            } else if Aggregation::parse(&self.operation).is_none() {
                errors.push(invalid_operation.to_string());
            }
        } else {
            if !self.operator.is_empty() && Operator::parse(&self.operator).is_none() {
                errors.push(invalid_operator.to_string());
            }
            if !self.operation.is_empty() && Aggregation::parse(&self.operation).is_none() {
                errors.push(invalid_operation.to_string());
            }
        }

        errors
    }

    /// Full validation: field checks plus device ownership and sensor existence.
    pub async fn validate(
        &self,
        tenant_id: Uuid,
        directory: &dyn DeviceDirectory,
        registry: &dyn SensorRegistry,
    ) -> Result<()> {
        let mut errors = self.field_errors();

        match self.device_id {
            None => {
                errors.push("device_id is required".to_string());
                errors.push("invalid sensor name".to_string());
            }
            Some(device_id) => {
                let owned = directory
                    .find_device(device_id)
                    .await?
                    .is_some_and(|d| d.tenant_id == tenant_id);
                if !owned {
                    errors.push("invalid device_id".to_string());
                }
                if registry
                    .find_sensor_by_name(device_id, &self.sensor)
                    .await?
                    .is_none()
                {
                    errors.push("invalid sensor name".to_string());
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(errors))
        }
    }

    /// Builds a new rule; call only after [`RuleInput::validate`] succeeded.
    pub fn into_rule(self, tenant_id: Uuid) -> Rule {
        let now = Utc::now();
        let count_latest = self.count_latest();
        Rule {
            id: Uuid::new_v4(),
            device_id: self.device_id.unwrap_or_default(),
            tenant_id,
            sensor: self.sensor,
            description: self.description,
            operation: Aggregation::parse(&self.operation),
            count_latest,
            email: self.email,
            email_subject: self.email_subject,
            email_body: self.email_body,
            endpoint_url: self.endpoint_url,
            endpoint_header: self.endpoint_header.unwrap_or_default(),
            endpoint_payload: self.endpoint_payload.unwrap_or_default(),
            operator: Operator::parse(&self.operator),
            value: self.value,
            time_between_notification: self.time_between_notification,
            last_notification: None,
            status: Status::parse(&self.status).unwrap_or(Status::Active),
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies an update onto `existing`, keeping identity, creation time and
    /// firing state. An unrecognised status leaves the current one.
    pub fn apply_to(self, existing: &Rule) -> Rule {
        let status = Status::parse(&self.status).unwrap_or(existing.status);
        let tenant_id = existing.tenant_id;
        let mut rule = self.into_rule(tenant_id);
        rule.id = existing.id;
        rule.created_at = existing.created_at;
        rule.last_notification = existing.last_notification;
        rule.status = status;
        rule
    }
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn insert_rule(&self, rule: &Rule) -> Result<()>;

    /// Persists the editable fields; never touches `last_notification`.
    async fn update_rule(&self, rule: &Rule) -> Result<()>;

    async fn get_rule(&self, tenant_id: Uuid, rule_id: Uuid) -> Result<Option<Rule>>;

    /// Tenant rules, most recently updated first.
    async fn list_rules(&self, tenant_id: Uuid) -> Result<Vec<Rule>>;

    async fn delete_rule(&self, tenant_id: Uuid, rule_id: Uuid) -> Result<bool>;

    async fn active_rules_for_device(&self, device_id: Uuid) -> Result<Vec<Rule>>;

    /// Sets `last_notification = fired_at` only if it still equals `previous`.
    ///
    /// Returns `false` when another evaluation fired the rule first.
    async fn mark_fired(
        &self,
        rule_id: Uuid,
        previous: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
    ) -> Result<bool>;
}
