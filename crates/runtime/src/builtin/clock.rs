use std::fmt::Write;

use async_trait::async_trait;
use chrono::{FixedOffset, SecondsFormat, Utc};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::capability::Capability;
use crate::error::CapabilityError;
use crate::schema::{ParamSpec, ParameterSchema};

pub(super) const NAME: &str = "clock";
pub(super) const DESCRIPTION: &str = "Report the current date and time";

pub struct Clock {
    schema: ParameterSchema,
}

impl Clock {
    pub fn new() -> Self {
        let schema = ParameterSchema::new()
            .param(
                "utc_offset_minutes",
                ParamSpec::integer("Offset from UTC in minutes").with_default(json!(0)),
            )
            .param(
                "format",
                ParamSpec::string("strftime-style format, RFC 3339 when omitted"),
            );
        Self { schema }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Capability for Clock {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn parameter_schema(&self) -> &ParameterSchema {
        &self.schema
    }

    async fn execute(
        &self,
        arguments: Value,
        _cancel: CancellationToken,
    ) -> Result<Value, CapabilityError> {
        let minutes = arguments["utc_offset_minutes"].as_i64().unwrap_or(0);
        let offset = i32::try_from(minutes)
            .ok()
            .and_then(|m| m.checked_mul(60))
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                CapabilityError::Execution(format!("utc_offset_minutes out of range: {minutes}"))
            })?;

        let now = Utc::now().with_timezone(&offset);
        let time = match arguments["format"].as_str() {
            Some(format) => {
                let mut rendered = String::new();
                write!(rendered, "{}", now.format(format)).map_err(|_| {
                    CapabilityError::Execution(format!("invalid format string: {format}"))
                })?;
                rendered
            }
            None => now.to_rfc3339_opts(SecondsFormat::Secs, true),
        };

        Ok(json!({
            "time": time,
            "utc_offset_minutes": minutes,
            "unix": now.timestamp(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    async fn run(arguments: Value) -> Result<Value, CapabilityError> {
        Clock::new().execute(arguments, CancellationToken::new()).await
    }

    #[tokio::test]
    async fn defaults_to_rfc3339_utc() {
        let value = run(json!({})).await.unwrap();
        let time = value["time"].as_str().unwrap();
        assert!(time.ends_with('Z'));
        assert!(DateTime::parse_from_rfc3339(time).is_ok());
        assert_eq!(value["utc_offset_minutes"], 0);
    }

    #[tokio::test]
    async fn applies_offset_and_format() {
        let value = run(json!({"utc_offset_minutes": 330, "format": "%z"})).await.unwrap();
        assert_eq!(value["time"], "+0530");
    }

    #[tokio::test]
    async fn rejects_out_of_range_offset() {
        let err = run(json!({"utc_offset_minutes": 100_000})).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Execution(_)));
    }

    #[tokio::test]
    async fn rejects_invalid_format() {
        let err = run(json!({"format": "%Q%"})).await.unwrap_err();
        assert!(err.to_string().contains("invalid format string"));
    }
}
