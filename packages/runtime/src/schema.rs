// ABOUTME: Composable task payload schemas declared by engines and plugins
// ABOUTME: Merges declarations, validates raw payloads with jsonschema and filters per consumer

use crate::error::{MalformedPayloadError, SchemaConflict};
use jsonschema::{Draft, JSONSchema};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Prefix used for every validation issue reported to the task log.
const PAYLOAD_PATH: &str = "task.payload";

/// Top-level payload properties a consumer understands.
///
/// Engines and plugins each declare the properties they read; the task
/// runner merges them into one schema to validate the whole payload and
/// then hands every consumer only its own slice via [`PayloadSchema::filter`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadSchema {
    properties: BTreeMap<String, Value>,
    required: BTreeSet<String>,
}

impl PayloadSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a property with its JSON schema.
    pub fn property(mut self, name: impl Into<String>, schema: Value, required: bool) -> Self {
        let name = name.into();
        if required {
            self.required.insert(name.clone());
        }
        self.properties.insert(name, schema);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    /// Union of several schemas. Declaring the same property twice is only
    /// allowed when both declarations are identical.
    pub fn merge<'a, I>(schemas: I) -> Result<PayloadSchema, SchemaConflict>
    where
        I: IntoIterator<Item = &'a PayloadSchema>,
    {
        let mut merged = PayloadSchema::new();
        for schema in schemas {
            for (name, property) in &schema.properties {
                match merged.properties.get(name) {
                    Some(existing) if existing != property => {
                        return Err(SchemaConflict {
                            property: name.clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        merged.properties.insert(name.clone(), property.clone());
                    }
                }
            }
            merged.required.extend(schema.required.iter().cloned());
        }
        Ok(merged)
    }

    /// The JSON schema document describing the whole payload object.
    pub fn to_json_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": self.properties,
            "required": self.required,
            "additionalProperties": false,
        })
    }

    /// Validate `payload`, collecting every violation into one error.
    pub fn validate(&self, payload: &Value) -> Result<(), MalformedPayloadError> {
        let document = self.to_json_schema();
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&document)
            .map_err(|e| {
                MalformedPayloadError::new(format!("{}: invalid payload schema: {}", PAYLOAD_PATH, e))
            })?;

        let result = compiled.validate(payload);
        if let Err(errors) = result {
            let issues = errors
                .map(|error| format!("{}{}: {}", PAYLOAD_PATH, error.instance_path, error))
                .collect();
            return Err(MalformedPayloadError::from_issues(issues));
        }
        Ok(())
    }

    /// The part of `payload` this schema declares. Non-object payloads
    /// filter to an empty object.
    pub fn filter(&self, payload: &Value) -> Value {
        let mut filtered = Map::new();
        if let Value::Object(fields) = payload {
            for name in self.properties.keys() {
                if let Some(value) = fields.get(name) {
                    filtered.insert(name.clone(), value.clone());
                }
            }
        }
        Value::Object(filtered)
    }
}
