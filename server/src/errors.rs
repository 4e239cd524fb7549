use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Validation error: {}", .0.join(", "))]
    Validation(Vec<String>),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("You can't send data with sensor {0} because is inactive")]
    InactiveSensor(String),

    #[error("Database error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a validation failure carrying a single message.
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::Validation(vec![message.into()])
    }

    /// Human-readable messages as returned in `{"errors": [...]}` bodies.
    pub fn messages(&self) -> Vec<String> {
        match self {
            Error::Validation(messages) => messages.clone(),
            other => vec![other.to_string()],
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_messages_are_kept_separate() {
        let err = Error::Validation(vec!["value is required".into(), "invalid email".into()]);
        assert_eq!(err.messages(), vec!["value is required", "invalid email"]);
        assert_eq!(
            err.to_string(),
            "Validation error: value is required, invalid email"
        );
    }

    #[test]
    fn test_inactive_sensor_message_names_sensor() {
        let err = Error::InactiveSensor("humidity".into());
        assert_eq!(
            err.messages(),
            vec!["You can't send data with sensor humidity because is inactive"]
        );
    }
}
