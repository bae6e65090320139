//! Target system schema types
//!
//! Object classes and attributes as reported by schema introspection, and
//! validation of outbound payloads against them.

use serde::{Deserialize, Serialize};

use crate::error::{ConnectorError, ConnectorResult};
use crate::operation::{AttributeSet, AttributeValue, PASSWORD_ATTRIBUTE};

/// Schema representing the structure of a target system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// The object classes available in this schema.
    pub object_classes: Vec<ObjectClass>,
}

impl Schema {
    /// Create a schema with the given object classes.
    #[must_use]
    pub fn with_object_classes(object_classes: Vec<ObjectClass>) -> Self {
        Self { object_classes }
    }

    /// Get an object class by name.
    #[must_use]
    pub fn get_object_class(&self, name: &str) -> Option<&ObjectClass> {
        self.object_classes.iter().find(|oc| oc.name == name)
    }

    /// Check if an object class exists.
    #[must_use]
    pub fn has_object_class(&self, name: &str) -> bool {
        self.get_object_class(name).is_some()
    }

    /// Validate a payload for the given object class.
    ///
    /// `full` payloads (CREATE) must carry every required attribute; partial
    /// payloads (UPDATE) may not clear one.
    pub fn validate(
        &self,
        object_class: &str,
        attributes: &AttributeSet,
        full: bool,
    ) -> ConnectorResult<()> {
        let class = self
            .get_object_class(object_class)
            .ok_or_else(|| ConnectorError::ObjectClassNotFound {
                object_class: object_class.to_string(),
            })?;

        for (name, value) in attributes.iter() {
            if name == PASSWORD_ATTRIBUTE {
                continue;
            }
            let attribute =
                class
                    .get_attribute(name)
                    .ok_or_else(|| ConnectorError::AttributeNotFound {
                        attribute: name.clone(),
                        object_class: object_class.to_string(),
                    })?;
            attribute.check_value(value)?;
        }

        for required in class.attributes.iter().filter(|a| a.required) {
            let value = attributes.get(&required.name);
            let missing = match value {
                Some(v) => v.is_null(),
                None => full,
            };
            if missing {
                return Err(ConnectorError::SchemaMismatch {
                    message: format!(
                        "required attribute '{}' of '{}' has no value",
                        required.name, object_class
                    ),
                });
            }
        }

        Ok(())
    }
}

/// An object class in a target system (e.g. "inetOrgPerson", "account").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectClass {
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<SchemaAttribute>,
}

impl ObjectClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, attribute: SchemaAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    #[must_use]
    pub fn get_attribute(&self, name: &str) -> Option<&SchemaAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// Data type of a schema attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeDataType {
    #[default]
    String,
    Integer,
    Boolean,
}

/// An attribute of an object class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaAttribute {
    pub name: String,
    #[serde(default)]
    pub data_type: AttributeDataType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub multi_valued: bool,
    #[serde(default)]
    pub max_length: Option<usize>,
}

impl SchemaAttribute {
    pub fn new(name: impl Into<String>, data_type: AttributeDataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            required: false,
            multi_valued: false,
            max_length: None,
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn multi_valued(mut self) -> Self {
        self.multi_valued = true;
        self
    }

    #[must_use]
    pub fn with_max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    fn check_value(&self, value: &AttributeValue) -> ConnectorResult<()> {
        match value {
            AttributeValue::Null => Ok(()),
            AttributeValue::Array(values) if self.multi_valued => {
                values.iter().try_for_each(|v| self.check_single(v))
            }
            AttributeValue::Array(_) => Err(ConnectorError::SchemaMismatch {
                message: format!("attribute '{}' is single-valued", self.name),
            }),
            single => self.check_single(single),
        }
    }

    fn check_single(&self, value: &AttributeValue) -> ConnectorResult<()> {
        let type_ok = matches!(
            (self.data_type, value),
            (AttributeDataType::String, AttributeValue::String(_))
                | (AttributeDataType::Integer, AttributeValue::Integer(_))
                | (AttributeDataType::Boolean, AttributeValue::Boolean(_))
        );
        if !type_ok {
            return Err(ConnectorError::SchemaMismatch {
                message: format!(
                    "attribute '{}' expects {:?}, got {value:?}",
                    self.name, self.data_type
                ),
            });
        }
        if let (Some(max), AttributeValue::String(s)) = (self.max_length, value) {
            if s.chars().count() > max {
                return Err(ConnectorError::InvalidData {
                    message: format!("attribute '{}' exceeds {max} characters", self.name),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person_schema() -> Schema {
        Schema::with_object_classes(vec![ObjectClass::new("inetOrgPerson")
            .with_attribute(SchemaAttribute::new("uid", AttributeDataType::String).required())
            .with_attribute(
                SchemaAttribute::new("mail", AttributeDataType::String).with_max_length(20),
            )
            .with_attribute(
                SchemaAttribute::new("memberOf", AttributeDataType::String).multi_valued(),
            )])
    }

    #[test]
    fn test_validate_accepts_valid_create() {
        let attrs = AttributeSet::new()
            .with("uid", "jdoe")
            .with("mail", "jdoe@example.com")
            .with("memberOf", vec!["staff"])
            .with(PASSWORD_ATTRIBUTE, "secret");
        assert!(person_schema().validate("inetOrgPerson", &attrs, true).is_ok());
    }

    #[test]
    fn test_validate_unknown_class_and_attribute() {
        let schema = person_schema();
        let attrs = AttributeSet::new().with("uid", "jdoe");
        assert!(matches!(
            schema.validate("group", &attrs, true),
            Err(ConnectorError::ObjectClassNotFound { .. })
        ));

        let attrs = AttributeSet::new().with("uid", "jdoe").with("shoe", "42");
        assert!(matches!(
            schema.validate("inetOrgPerson", &attrs, true),
            Err(ConnectorError::AttributeNotFound { .. })
        ));
    }

    #[test]
    fn test_validate_required_only_for_full_payloads() {
        let schema = person_schema();
        let partial = AttributeSet::new().with("mail", "a@example.com");
        assert!(schema.validate("inetOrgPerson", &partial, false).is_ok());
        assert!(matches!(
            schema.validate("inetOrgPerson", &partial, true),
            Err(ConnectorError::SchemaMismatch { .. })
        ));

        let clearing = AttributeSet::new().with("uid", AttributeValue::Null);
        assert!(schema.validate("inetOrgPerson", &clearing, false).is_err());
    }

    #[test]
    fn test_validate_value_shape() {
        let schema = person_schema();
        let attrs = AttributeSet::new().with("uid", "jdoe").with("mail", vec!["a", "b"]);
        assert!(matches!(
            schema.validate("inetOrgPerson", &attrs, true),
            Err(ConnectorError::SchemaMismatch { .. })
        ));

        let attrs = AttributeSet::new()
            .with("uid", "jdoe")
            .with("mail", "much.too.long@example.com");
        assert!(matches!(
            schema.validate("inetOrgPerson", &attrs, true),
            Err(ConnectorError::InvalidData { .. })
        ));
    }
}
