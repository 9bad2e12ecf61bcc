// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use jsonschema::JSONSchema;
use serde_json::Value;
use tracing::debug;

use quill_model::ToolSchema;

use crate::tool::{Tool, ToolDescriptor};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("tool '{name}' has an invalid parameter schema: {message}")]
    InvalidSchema { name: String, message: String },
}

/// Outcome of validating a tool call's arguments.
#[derive(Debug)]
pub enum ArgValidation {
    /// Arguments conform to the schema.
    Valid(Value),
    /// Validation failed but the tool opted into lenient handling; the raw
    /// arguments are passed through unchanged.
    LenientPassthrough(Value),
    /// Validation failed on a strict tool; the messages describe every
    /// violation.
    Invalid(Vec<String>),
}

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    descriptor: ToolDescriptor,
    validator: JSONSchema,
}

/// Central registry holding all available tools.
///
/// Names are unique; re-registration replaces in place (used at session
/// start only).  The parameter schema is compiled at registration so an
/// invalid schema is rejected up front rather than at first call.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let descriptor = tool.descriptor();
        let validator = JSONSchema::compile(&descriptor.parameters).map_err(|e| {
            RegistryError::InvalidSchema {
                name: descriptor.name.clone(),
                message: e.to_string(),
            }
        })?;
        if self.tools.contains_key(&descriptor.name) {
            debug!(name = %descriptor.name, "replacing registered tool");
        }
        self.tools.insert(
            descriptor.name.clone(),
            RegisteredTool { tool, descriptor, validator },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|r| Arc::clone(&r.tool))
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name).map(|r| &r.descriptor)
    }

    /// Validate `args` against the tool's parameter schema, honouring the
    /// strict / lenient flags.  Unknown tools are the caller's problem;
    /// this returns `Valid` so the resolve step reports the proper error.
    pub fn validate_args(&self, name: &str, args: &Value) -> ArgValidation {
        let Some(reg) = self.tools.get(name) else {
            return ArgValidation::Valid(args.clone());
        };
        let violations: Vec<String> = match reg.validator.validate(args) {
            Ok(()) => return ArgValidation::Valid(args.clone()),
            Err(errors) => errors.map(|e| e.to_string()).collect(),
        };
        if reg.descriptor.lenient_arg_validation {
            ArgValidation::LenientPassthrough(args.clone())
        } else {
            ArgValidation::Invalid(violations)
        }
    }

    /// Schemas for all registered tools, sorted by name for stable requests.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|r| ToolSchema {
                name: r.descriptor.name.clone(),
                description: r.descriptor.description.clone(),
                parameters: r.descriptor.parameters.clone(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::tool::{ToolContext, ToolResult};

    struct EchoTool {
        name: &'static str,
        lenient: bool,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn descriptor(&self) -> ToolDescriptor {
            let d = ToolDescriptor::new(
                self.name,
                "echoes its input",
                json!({
                    "type": "object",
                    "properties": { "text": { "type": "string" } },
                    "required": ["text"],
                }),
            );
            if self.lenient { d.lenient() } else { d }
        }

        async fn execute(&self, _id: &str, args: Value, _ctx: &ToolContext) -> ToolResult {
            ToolResult::ok(format!("echo:{args}"))
        }
    }

    fn echo(name: &'static str) -> Arc<dyn Tool> {
        Arc::new(EchoTool { name, lenient: false })
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(echo("echo")).unwrap();
        assert!(reg.get("echo").is_some());
        assert!(reg.get("nope").is_none());
    }

    #[test]
    fn invalid_schema_is_rejected_at_registration() {
        struct BadTool;
        #[async_trait]
        impl Tool for BadTool {
            fn descriptor(&self) -> ToolDescriptor {
                ToolDescriptor::new("bad", "broken schema", json!({"type": 42}))
            }
            async fn execute(&self, _id: &str, _a: Value, _c: &ToolContext) -> ToolResult {
                ToolResult::ok("unreachable")
            }
        }
        let mut reg = ToolRegistry::new();
        let err = reg.register(Arc::new(BadTool)).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSchema { .. }));
    }

    #[test]
    fn registering_same_name_twice_replaces() {
        let mut reg = ToolRegistry::new();
        reg.register(echo("t")).unwrap();
        reg.register(echo("t")).unwrap();
        assert_eq!(reg.names().len(), 1);
    }

    #[test]
    fn schemas_are_sorted_by_name() {
        let mut reg = ToolRegistry::new();
        reg.register(echo("zeta")).unwrap();
        reg.register(echo("alpha")).unwrap();
        let schemas = reg.schemas();
        assert_eq!(schemas[0].name, "alpha");
        assert_eq!(schemas[1].name, "zeta");
    }

    #[test]
    fn strict_tool_rejects_bad_args() {
        let mut reg = ToolRegistry::new();
        reg.register(echo("echo")).unwrap();
        match reg.validate_args("echo", &json!({"text": 42})) {
            ArgValidation::Invalid(violations) => assert!(!violations.is_empty()),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn lenient_tool_passes_bad_args_through() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool { name: "soft", lenient: true })).unwrap();
        match reg.validate_args("soft", &json!({"wrong": true})) {
            ArgValidation::LenientPassthrough(v) => assert_eq!(v["wrong"], true),
            other => panic!("expected LenientPassthrough, got {other:?}"),
        }
    }

    #[test]
    fn conforming_args_are_valid() {
        let mut reg = ToolRegistry::new();
        reg.register(echo("echo")).unwrap();
        assert!(matches!(
            reg.validate_args("echo", &json!({"text": "hi"})),
            ArgValidation::Valid(_)
        ));
    }
}
