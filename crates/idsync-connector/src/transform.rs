//! Attribute transformation engine.
//!
//! Evaluates mapping rules against identity attributes (outbound) and
//! remote values (inbound). Script transforms run in a sandboxed rhai engine.

use rhai::{Dynamic, Engine, Scope};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{ConnectorError, ConnectorResult};
use crate::mapping::{placeholder_regex, AttributeSource, MappingRule, Transform};
use crate::operation::AttributeValue;

/// Resource limits for script transforms.
#[derive(Debug, Clone)]
pub struct ScriptLimits {
    /// Maximum number of operations before termination.
    pub max_operations: u64,
    /// Maximum call stack depth.
    pub max_call_levels: usize,
    /// Maximum string size in bytes.
    pub max_string_size: usize,
    /// Maximum array size.
    pub max_array_size: usize,
    /// Maximum map size.
    pub max_map_size: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_operations: 100_000,
            max_call_levels: 64,
            max_string_size: 65_536,
            max_array_size: 10_000,
            max_map_size: 10_000,
        }
    }
}

/// Transformation engine for evaluating attribute mappings.
pub struct TransformEngine {
    scripts: Engine,
}

impl TransformEngine {
    /// Create an engine with default script limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(&ScriptLimits::default())
    }

    /// Create an engine with custom script limits.
    #[must_use]
    pub fn with_limits(limits: &ScriptLimits) -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(limits.max_operations);
        engine.set_max_call_levels(limits.max_call_levels);
        engine.set_max_string_size(limits.max_string_size);
        engine.set_max_array_size(limits.max_array_size);
        engine.set_max_map_size(limits.max_map_size);
        engine.set_strict_variables(true);
        engine.register_fn("log_debug", |msg: &str| {
            debug!(script_log = %msg, "Transform script debug");
        });
        Self { scripts: engine }
    }

    /// Evaluate one outbound rule.
    ///
    /// Returns `Ok(None)` when the rule yields no value and is not required.
    pub fn evaluate_rule(
        &self,
        rule: &MappingRule,
        attributes: &BTreeMap<String, String>,
    ) -> ConnectorResult<Option<String>> {
        let fail = |message: String| ConnectorError::TransformationFailed {
            attribute: rule.target_attribute.clone(),
            message,
        };

        let value = self
            .evaluate_source(&rule.source, attributes)
            .map_err(fail)?
            .filter(|v| !v.is_empty())
            .or_else(|| rule.default_value.clone());

        let value = match (value, &rule.transform) {
            (Some(v), Some(transform)) => {
                Some(self.apply_transform(transform, &v, attributes).map_err(fail)?)
            }
            (value, _) => value,
        }
        .filter(|v| !v.is_empty());

        if value.is_none() && rule.required {
            return Err(fail("required attribute has no value".to_string()));
        }
        Ok(value)
    }

    /// Evaluate one inbound rule against the remote value of its target attribute.
    pub fn evaluate_inbound(
        &self,
        rule: &MappingRule,
        remote: &AttributeValue,
        attributes: &BTreeMap<String, String>,
    ) -> ConnectorResult<Option<String>> {
        if remote.is_null() {
            return Ok(None);
        }
        let value = remote.to_display_string();
        match &rule.inbound_transform {
            Some(transform) => self
                .apply_transform(transform, &value, attributes)
                .map(Some)
                .map_err(|message| ConnectorError::TransformationFailed {
                    attribute: rule.target_attribute.clone(),
                    message,
                }),
            None => Ok(Some(value)),
        }
    }

    /// Evaluate an attribute source.
    pub fn evaluate_source(
        &self,
        source: &AttributeSource,
        attributes: &BTreeMap<String, String>,
    ) -> Result<Option<String>, String> {
        match source {
            AttributeSource::Attribute { name } => Ok(attributes.get(name).cloned()),
            AttributeSource::Constant { value } => Ok(Some(value.clone())),
            AttributeSource::Concat { sources, separator } => {
                let mut parts = Vec::new();
                for src in sources {
                    if let Some(value) = self.evaluate_source(src, attributes)? {
                        if !value.is_empty() {
                            parts.push(value);
                        }
                    }
                }
                if parts.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(parts.join(separator)))
                }
            }
            AttributeSource::Expression { expression } => {
                Ok(Self::evaluate_expression(expression, attributes))
            }
        }
    }

    /// Substitute `${attribute}` placeholders; `None` when none resolved.
    fn evaluate_expression(
        expression: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Option<String> {
        let mut has_value = false;
        let result = placeholder_regex().replace_all(expression, |caps: &regex::Captures<'_>| {
            match attributes.get(&caps[1]) {
                Some(value) => {
                    has_value = true;
                    value.clone()
                }
                None => String::new(),
            }
        });

        if has_value || !placeholder_regex().is_match(expression) {
            Some(result.into_owned())
        } else {
            None
        }
    }

    /// Apply a transformation to a value.
    pub fn apply_transform(
        &self,
        transform: &Transform,
        value: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<String, String> {
        match transform {
            Transform::Lowercase => Ok(value.to_lowercase()),
            Transform::Uppercase => Ok(value.to_uppercase()),
            Transform::Trim => Ok(value.trim().to_string()),
            Transform::Replace { from, to } => Ok(value.replace(from, to)),
            Transform::Substring { start, end } => {
                let chars: Vec<char> = value.chars().collect();
                let start = (*start).min(chars.len());
                let end = end.map_or(chars.len(), |e| e.min(chars.len())).max(start);
                Ok(chars[start..end].iter().collect())
            }
            Transform::Regex { pattern, group } => {
                let re = regex::Regex::new(pattern).map_err(|e| format!("invalid regex: {e}"))?;
                Ok(re
                    .captures(value)
                    .and_then(|caps| caps.get(*group))
                    .map_or_else(String::new, |m| m.as_str().to_string()))
            }
            Transform::EmailFormat { domain } => {
                if value.contains('@') {
                    Ok(value.to_string())
                } else {
                    Ok(format!("{value}{domain}"))
                }
            }
            Transform::DnFormat { template } => Ok(template.replace("{value}", value)),
            Transform::Script { script } => self.run_script(script, value, attributes),
            Transform::Chain { transforms } => {
                let mut current = value.to_string();
                for t in transforms {
                    current = self.apply_transform(t, &current, attributes)?;
                }
                Ok(current)
            }
        }
    }

    fn run_script(
        &self,
        script: &str,
        value: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<String, String> {
        let mut attrs = rhai::Map::new();
        for (name, v) in attributes {
            attrs.insert(name.as_str().into(), Dynamic::from(v.clone()));
        }

        let mut scope = Scope::new();
        scope.push("value", value.to_string());
        scope.push("attrs", attrs);

        let result: Dynamic = self
            .scripts
            .eval_with_scope(&mut scope, script)
            .map_err(|e| format!("script error: {e}"))?;

        if result.is_unit() {
            Ok(String::new())
        } else if result.is_string() {
            result
                .into_string()
                .map_err(|type_name| format!("script returned {type_name}"))
        } else {
            Ok(result.to_string())
        }
    }
}

impl Default for TransformEngine {
    fn default() -> Self {
        Self::new()
    }
}
