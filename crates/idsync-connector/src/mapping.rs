//! Attribute mapping definitions.
//!
//! Defines how identity attributes map to target system attributes for one
//! (system, object class) pair, and back again for inbound synchronization.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::ids::SystemId;
use crate::operation::PASSWORD_ATTRIBUTE;

/// A mapping configuration for one object class on one system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingConfiguration {
    /// The system this mapping targets.
    pub system: SystemId,

    /// The object class this mapping applies to (e.g., "inetOrgPerson").
    pub object_class: String,

    /// Bumped whenever administrators change the mapping.
    #[serde(default)]
    pub version: u64,

    /// Individual attribute mappings.
    pub rules: Vec<MappingRule>,
}

impl MappingConfiguration {
    pub fn new(system: SystemId, object_class: impl Into<String>, rules: Vec<MappingRule>) -> Self {
        Self {
            system,
            object_class: object_class.into(),
            version: 0,
            rules,
        }
    }

    /// Find the rule producing a target attribute.
    #[must_use]
    pub fn rule(&self, target_attribute: &str) -> Option<&MappingRule> {
        self.rules
            .iter()
            .find(|r| r.target_attribute == target_attribute)
    }

    /// Whether a target attribute holds a confidential value.
    ///
    /// The password attribute is always confidential.
    #[must_use]
    pub fn is_confidential(&self, target_attribute: &str) -> bool {
        target_attribute == PASSWORD_ATTRIBUTE
            || self.rule(target_attribute).is_some_and(|r| r.confidential)
    }

    /// Whether the target reflects writes of this attribute back to us.
    #[must_use]
    pub fn echoes(&self, target_attribute: &str) -> bool {
        self.rule(target_attribute).is_some_and(|r| r.echoes)
    }

    /// Outbound rules whose value depends on any of the changed identity attributes.
    pub fn rules_affected_by<'a>(
        &'a self,
        changed: &'a [String],
    ) -> impl Iterator<Item = &'a MappingRule> + 'a {
        self.rules.iter().filter(move |rule| {
            rule.direction.is_outbound()
                && rule
                    .source
                    .referenced_attributes()
                    .iter()
                    .any(|name| changed.iter().any(|c| c == name))
        })
    }
}

/// Which way a rule carries values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingDirection {
    /// Identity to target only.
    Outbound,
    /// Target to identity only.
    Inbound,
    /// Both ways.
    #[default]
    Both,
}

impl MappingDirection {
    #[must_use]
    pub fn is_outbound(&self) -> bool {
        matches!(self, MappingDirection::Outbound | MappingDirection::Both)
    }

    #[must_use]
    pub fn is_inbound(&self) -> bool {
        matches!(self, MappingDirection::Inbound | MappingDirection::Both)
    }
}

/// A single attribute mapping rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRule {
    /// Target attribute name in the target system.
    pub target_attribute: String,

    /// Source of the value for this attribute.
    pub source: AttributeSource,

    /// Optional transformation to apply on the way out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,

    /// Optional transformation applied to remote values on the way in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound_transform: Option<Transform>,

    /// Value used when the source yields nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,

    /// Whether this mapping is required (fail if source is empty).
    #[serde(default)]
    pub required: bool,

    /// Value is redirected to confidential storage instead of the queued payload.
    #[serde(default)]
    pub confidential: bool,

    /// The target echoes writes of this attribute through its change feed.
    #[serde(default)]
    pub echoes: bool,

    #[serde(default)]
    pub direction: MappingDirection,

    /// Whether to include this mapping in create operations.
    #[serde(default = "default_true")]
    pub on_create: bool,

    /// Whether to include this mapping in update operations.
    #[serde(default = "default_true")]
    pub on_update: bool,
}

fn default_true() -> bool {
    true
}

impl MappingRule {
    /// A plain attribute-to-attribute rule.
    pub fn direct(target_attribute: impl Into<String>, identity_attribute: impl Into<String>) -> Self {
        Self {
            target_attribute: target_attribute.into(),
            source: AttributeSource::Attribute {
                name: identity_attribute.into(),
            },
            transform: None,
            inbound_transform: None,
            default_value: None,
            required: false,
            confidential: false,
            echoes: false,
            direction: MappingDirection::Both,
            on_create: true,
            on_update: true,
        }
    }

    #[must_use]
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    #[must_use]
    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn confidential(mut self) -> Self {
        self.confidential = true;
        self
    }

    #[must_use]
    pub fn echoing(mut self) -> Self {
        self.echoes = true;
        self
    }

    #[must_use]
    pub fn with_direction(mut self, direction: MappingDirection) -> Self {
        self.direction = direction;
        self
    }

    /// The identity attribute fed by this rule inbound, if the rule is invertible.
    #[must_use]
    pub fn inbound_target(&self) -> Option<&str> {
        match (&self.source, self.direction.is_inbound()) {
            (AttributeSource::Attribute { name }, true) => Some(name),
            _ => None,
        }
    }
}

/// Source of an attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttributeSource {
    /// Value from an identity attribute.
    Attribute {
        /// Name of the identity attribute.
        name: String,
    },
    /// A constant value.
    Constant {
        /// The constant value.
        value: String,
    },
    /// Multiple sources concatenated.
    Concat {
        /// List of attribute sources to concatenate.
        sources: Vec<AttributeSource>,
        /// Separator between values (default: empty).
        #[serde(default)]
        separator: String,
    },
    /// Template with `${attribute}` placeholders.
    Expression {
        /// Expression string.
        expression: String,
    },
}

impl AttributeSource {
    /// Identity attributes this source reads.
    #[must_use]
    pub fn referenced_attributes(&self) -> Vec<String> {
        match self {
            AttributeSource::Attribute { name } => vec![name.clone()],
            AttributeSource::Constant { .. } => Vec::new(),
            AttributeSource::Concat { sources, .. } => sources
                .iter()
                .flat_map(AttributeSource::referenced_attributes)
                .collect(),
            AttributeSource::Expression { expression } => placeholder_regex()
                .captures_iter(expression)
                .map(|cap| cap[1].to_string())
                .collect(),
        }
    }
}

/// Matches `${attribute}` placeholders, dotted keys included.
pub(crate) fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([\w.]+)\}").expect("placeholder pattern is valid"))
}

/// Transformation to apply to an attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transform {
    /// Convert to lowercase.
    Lowercase,
    /// Convert to uppercase.
    Uppercase,
    /// Trim whitespace.
    Trim,
    /// Replace occurrences.
    Replace {
        /// Pattern to find.
        from: String,
        /// Replacement value.
        to: String,
    },
    /// Substring extraction.
    Substring {
        /// Start index (0-based, in characters).
        start: usize,
        /// Optional end index.
        #[serde(skip_serializing_if = "Option::is_none")]
        end: Option<usize>,
    },
    /// Apply regex and capture group.
    Regex {
        /// Regular expression pattern.
        pattern: String,
        /// Capture group to use (0 for whole match).
        #[serde(default)]
        group: usize,
    },
    /// Format as email (append domain).
    EmailFormat {
        /// Domain to append (e.g., "@example.com").
        domain: String,
    },
    /// Format as DN (Distinguished Name).
    DnFormat {
        /// Template for DN (e.g., "uid={value},ou=users,dc=example,dc=com").
        template: String,
    },
    /// Sandboxed rhai script. `value` holds the input and `attrs` the identity
    /// attributes; the script's result becomes the new value.
    Script {
        script: String,
    },
    /// Chain multiple transforms.
    Chain {
        /// Ordered list of transforms to apply.
        transforms: Vec<Transform>,
    },
}
