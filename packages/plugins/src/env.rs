// ABOUTME: Sets environment variables from the task payload plus TASK_ID and RUN_ID
// ABOUTME: A payload variable clashing with a reserved one is reported as malformed payload

use crate::error::{PluginError, Result};
use crate::plugin::{Plugin, TaskPlugin, TaskPluginOptions};
use async_trait::async_trait;
use hatch_runtime::{MalformedPayloadError, PayloadSchema, TaskInfo};
use hatch_sandbox::{EngineError, SandboxBuilder};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

pub struct EnvPlugin;

#[async_trait]
impl Plugin for EnvPlugin {
    fn name(&self) -> &'static str {
        "env"
    }

    fn payload_schema(&self) -> PayloadSchema {
        PayloadSchema::new().property(
            "env",
            json!({
                "type": "object",
                "additionalProperties": {"type": "string"}
            }),
            false,
        )
    }

    async fn new_task_plugin(&self, options: TaskPluginOptions) -> Result<Box<dyn TaskPlugin>> {
        let env: BTreeMap<String, String> = match options.payload.get("env") {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                MalformedPayloadError::new(format!("task.payload.env: {}", e))
            })?,
            None => BTreeMap::new(),
        };
        Ok(Box::new(EnvTaskPlugin {
            info: options.info().clone(),
            env,
        }))
    }
}

struct EnvTaskPlugin {
    info: TaskInfo,
    env: BTreeMap<String, String>,
}

fn set(builder: &dyn SandboxBuilder, name: &str, value: &str) -> Result<()> {
    match builder.set_environment_variable(name, value) {
        Err(EngineError::NamingConflict(_)) => Err(MalformedPayloadError::new(format!(
            "environment variable '{}' conflicts with a variable set by the worker",
            name
        ))
        .into()),
        other => other.map_err(PluginError::from),
    }
}

#[async_trait]
impl TaskPlugin for EnvTaskPlugin {
    async fn build_sandbox(&self, builder: &dyn SandboxBuilder) -> Result<()> {
        set(builder, "TASK_ID", &self.info.task_id)?;
        set(builder, "RUN_ID", &self.info.run_id.to_string())?;

        let mut issues = Vec::new();
        for (name, value) in &self.env {
            match set(builder, name, value) {
                Ok(()) => {}
                Err(PluginError::MalformedPayload(e)) => issues.push(e),
                Err(e) => return Err(e),
            }
        }
        if !issues.is_empty() {
            return Err(MalformedPayloadError::merge(issues).into());
        }

        debug!("Set {} environment variables for {}", self.env.len() + 2, self.info);
        Ok(())
    }
}

/// Payload fragment for [`EnvPlugin`].
pub fn env_payload<'a>(vars: impl IntoIterator<Item = (&'a str, &'a str)>) -> Value {
    let env: serde_json::Map<String, Value> = vars
        .into_iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect();
    json!({ "env": env })
}
