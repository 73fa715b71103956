//! A small capability server, run by `toolhost serve-demo`.
//!
//! Speaks the bridge protocol on stdin/stdout so it can be listed as a
//! `[[server]]` of another toolhost.

use std::time::Duration;

use async_trait::async_trait;
use bridge::protocol::{CallCapabilityResult, CapabilityInfo, ServerInfo};
use bridge::{Handler, serve};
use serde_json::{Value, json};
use tracing::info;

use crate::error::Result;

/// Longest sleep the demo will perform.
const MAX_SLEEP_MS: u64 = 60_000;

struct Demo;

#[async_trait]
impl Handler for Demo {
    fn server_info(&self) -> ServerInfo {
        ServerInfo {
            name: "toolhost-demo".to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }

    fn capabilities(&self) -> Vec<CapabilityInfo> {
        vec![
            capability(
                "echo",
                "Return the given text",
                json!({"text": {"type": "string", "description": "Text to return"}}),
                &["text"],
            ),
            capability(
                "sleep",
                "Wait before answering",
                json!({"ms": {"type": "integer", "description": "Milliseconds to wait"}}),
                &["ms"],
            ),
            capability(
                "fail",
                "Always report an error",
                json!({"message": {"type": "string", "description": "Error message"}}),
                &[],
            ),
        ]
    }

    async fn call(&self, name: &str, arguments: Value) -> CallCapabilityResult {
        match name {
            "echo" => match arguments["text"].as_str() {
                Some(text) => CallCapabilityResult::text(text),
                None => CallCapabilityResult::error("`text` must be a string"),
            },
            "sleep" => {
                let ms = arguments["ms"].as_u64().unwrap_or(0).min(MAX_SLEEP_MS);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                CallCapabilityResult::json(json!({"slept_ms": ms}))
            }
            "fail" => CallCapabilityResult::error(
                arguments["message"].as_str().unwrap_or("demo failure"),
            ),
            other => CallCapabilityResult::error(format!("unknown capability: {other}")),
        }
    }
}

fn capability(name: &str, description: &str, properties: Value, required: &[&str]) -> CapabilityInfo {
    CapabilityInfo {
        name: name.to_string(),
        description: Some(description.to_string()),
        input_schema: Some(json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })),
    }
}

/// Serve the demo capabilities until stdin closes or a shutdown arrives.
pub async fn run() -> Result<()> {
    info!("demo server listening on stdio");
    serve(tokio::io::stdin(), tokio::io::stdout(), &Demo).await?;
    info!("demo server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_and_fail() {
        let echo = Demo.call("echo", json!({"text": "hi"})).await;
        assert_eq!(echo, CallCapabilityResult::text("hi"));

        let fail = Demo.call("fail", json!({"message": "boom"})).await;
        assert!(fail.is_error);
        assert_eq!(fail.joined_text(), "boom");

        let unknown = Demo.call("nope", json!({})).await;
        assert!(unknown.is_error);
    }

    #[test]
    fn schemas_declare_required() {
        let caps = Demo.capabilities();
        let names: Vec<&str> = caps.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "sleep", "fail"]);
        assert_eq!(caps[0].input_schema.as_ref().unwrap()["required"], json!(["text"]));
    }
}
