//! DateTime Utility

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use agent_core::{
    ExecuteResult, ExecutionContext, Result as CoreResult, Utility, UtilityDescriptor,
};

/// Returns the current time
pub struct DateTimeUtility;

impl DateTimeUtility {
    pub const ID: &'static str = "datetime";
}

/// Render a timestamp in one of the supported formats
pub fn render(now: DateTime<Utc>, format: &str) -> String {
    match format {
        "iso" => now.to_rfc3339(),
        "unix" => now.timestamp().to_string(),
        _ => now.format("%A, %B %d, %Y at %H:%M:%S UTC").to_string(),
    }
}

#[async_trait]
impl Utility for DateTimeUtility {
    fn descriptor(&self) -> UtilityDescriptor {
        UtilityDescriptor::new(
            Self::ID,
            "Get the current date and time (UTC)",
            json!({
                "type": "object",
                "properties": {
                    "format": {
                        "type": "string",
                        "enum": ["iso", "human", "unix"],
                        "description": "Output format: 'iso', 'human', or 'unix' (default: human)"
                    }
                },
                "additionalProperties": false
            }),
        )
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        _ctx: &ExecutionContext,
    ) -> CoreResult<ExecuteResult> {
        let format = args
            .get("format")
            .and_then(|v| v.as_str())
            .unwrap_or("human");
        let now = Utc::now();

        Ok(ExecuteResult::success(render(now, format))
            .with_data(json!({ "timestamp": now.timestamp() })))
    }
}
