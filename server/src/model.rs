use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Key every reading must carry.
pub const COLLECTED_AT: &str = "collected_at";

/// Wire format of `collected_at`, e.g. `2024-01-01T00:00:00.000Z`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// One timestamped set of sensor-name → value pairs.
pub type Reading = Map<String, Value>;

/// Lifecycle status shared by devices, sensors and rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Active,
    Inactive,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::Inactive => "inactive",
        }
    }

    /// Case-insensitive parse; anything but `active`/`inactive` is `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "active" => Some(Status::Active),
            "inactive" => Some(Status::Inactive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub status: Status,
    #[serde(skip_serializing)]
    pub secret_key: String,
    pub sensors: Vec<Sensor>,
}

impl Device {
    pub fn is_active(&self) -> bool {
        self.status == Status::Active
    }
}

/// A named measurement channel of a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sensor {
    pub id: Uuid,
    #[serde(skip_serializing)]
    pub device_id: Uuid,
    pub name: String,
    pub description: String,
    pub unit: String,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sensor {
    pub fn new(device_id: Uuid, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            device_id,
            name: name.into(),
            description: String::new(),
            unit: String::new(),
            status: Status::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == Status::Active
    }
}

/// Sensor fields accepted from the API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SensorInput {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub status: Option<String>,
}

impl SensorInput {
    pub fn normalized(mut self) -> Self {
        self.name = self.name.trim().to_string();
        self.description = self.description.trim().to_string();
        self.unit = self.unit.trim().to_string();
        self
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("name is required".to_string());
        }
        if self.name.chars().count() > 255 {
            errors.push("name is too long".to_string());
        }
        // every stored reading carries this key; a sensor may not shadow it
        if self.name == COLLECTED_AT {
            errors.push("collected_at is a reserved name".to_string());
        }
        if self.description.chars().count() > 255 {
            errors.push("description is too long".to_string());
        }
        if self.unit.chars().count() > 255 {
            errors.push("unit is too long".to_string());
        }
        errors
    }

    pub fn status(&self) -> Option<Status> {
        self.status.as_deref().and_then(Status::parse)
    }
}

/// Ingestion request body: `{"data": [ {...}, ... ]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingBatch {
    pub data: Vec<Reading>,
}

/// Query response body; `data` is `[]`, never null.
#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    pub data: Vec<Reading>,
}

/// Paginated list envelope used by the sensor and rule listings.
#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub limit: usize,
    pub page: usize,
    pub total_records: usize,
    pub total_pages: usize,
    pub data: Vec<T>,
}

/// Parses a strict `YYYY-MM-DDTHH:MM:SS.sssZ` timestamp.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    // chrono treats the fractional part as optional, the wire format does not
    if raw.len() != 24 || raw.as_bytes()[19] != b'.' {
        return None;
    }
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Renders a JSON scalar the way it appears in templates and string
/// comparisons: strings unquoted, everything else as JSON text.
pub fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
