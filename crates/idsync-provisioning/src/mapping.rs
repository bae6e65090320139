//! Attribute mapping repository and value cache.
//!
//! [`MappingRepository`] holds the current mapping per (system, object
//! class). [`AttributeMapper`] evaluates it: outbound payloads for
//! provisioning and inbound parses for reconciliation. Computed values are
//! cached per process, keyed by rule and owner.

use dashmap::DashMap;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use idsync_connector::ids::{IdentityId, SystemId};
use idsync_connector::mapping::{MappingConfiguration, MappingRule};
use idsync_connector::operation::{AttributeSet, AttributeValue, ConnectorObject, GuardedString};
use idsync_connector::transform::TransformEngine;
use idsync_connector::types::OperationKind;

use crate::error::{ProvisioningError, ProvisioningResult};
use crate::identity::Identity;

/// Bounds of the per-process value cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueCacheConfig {
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u64,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_max_capacity() -> u64 {
    10_000
}

fn default_ttl_secs() -> u64 {
    600
}

impl Default for ValueCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: default_max_capacity(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

/// Current mappings keyed by (system, object class).
#[derive(Debug, Default)]
pub struct MappingRepository {
    mappings: DashMap<(SystemId, String), Arc<MappingConfiguration>>,
}

impl MappingRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a mapping, assigning it the next version. Returns that version.
    pub fn put(&self, mut mapping: MappingConfiguration) -> u64 {
        let key = (mapping.system.clone(), mapping.object_class.clone());
        let version = self
            .mappings
            .get(&key)
            .map_or(1, |current| current.version + 1)
            .max(mapping.version);
        mapping.version = version;
        self.mappings.insert(key, Arc::new(mapping));
        version
    }

    #[must_use]
    pub fn get(&self, system: &SystemId, object_class: &str) -> Option<Arc<MappingConfiguration>> {
        self.mappings
            .get(&(system.clone(), object_class.to_string()))
            .map(|m| Arc::clone(m.value()))
    }

    /// Look up a mapping or fail with a configuration error.
    pub fn require(
        &self,
        system: &SystemId,
        object_class: &str,
    ) -> ProvisioningResult<Arc<MappingConfiguration>> {
        self.get(system, object_class)
            .ok_or_else(|| ProvisioningError::Configuration {
                system: system.clone(),
                message: format!("no attribute mapping for object class '{object_class}'"),
            })
    }
}

/// Outbound payload split into queueable and confidential parts.
#[derive(Debug, Clone, Default)]
pub struct MappedAttributes {
    pub attributes: AttributeSet,
    /// Kept out of the queued payload; resolved at dispatch.
    pub confidential: BTreeMap<String, GuardedString>,
}

/// One inbound value parsed from a remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundValue {
    pub target_attribute: String,
    pub identity_attribute: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ValueKey {
    owner: IdentityId,
    system: SystemId,
    object_class: String,
    target_attribute: String,
    mapping_version: u64,
    /// Fingerprint of the input values the rule reads.
    context: u64,
}

/// Evaluates mappings with a per-process value cache.
pub struct AttributeMapper {
    repository: Arc<MappingRepository>,
    engine: TransformEngine,
    values: Cache<ValueKey, Option<String>>,
}

impl AttributeMapper {
    pub fn new(
        repository: Arc<MappingRepository>,
        engine: TransformEngine,
        config: &ValueCacheConfig,
    ) -> Self {
        let values = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(Duration::from_secs(config.ttl_secs))
            .support_invalidation_closures()
            .build();
        Self {
            repository,
            engine,
            values,
        }
    }

    pub fn repository(&self) -> &Arc<MappingRepository> {
        &self.repository
    }

    /// Replace a mapping; cached values of the old version are dropped.
    pub fn replace_mapping(&self, mapping: MappingConfiguration) -> ProvisioningResult<u64> {
        let system = mapping.system.clone();
        let object_class = mapping.object_class.clone();
        let version = self.repository.put(mapping);
        self.values
            .invalidate_entries_if(move |key, _| {
                key.system == system && key.object_class == object_class && key.mapping_version < version
            })
            .map_err(|e| ProvisioningError::storage(format!("value cache invalidation: {e}")))?;
        info!(version, "Attribute mapping replaced");
        Ok(version)
    }

    /// Drop every cached value computed for `owner`.
    pub fn invalidate_owner(&self, owner: IdentityId) -> ProvisioningResult<()> {
        self.values
            .invalidate_entries_if(move |key, _| key.owner == owner)
            .map_err(|e| ProvisioningError::storage(format!("value cache invalidation: {e}")))?;
        Ok(())
    }

    /// Compute one outbound value for an owner, through the cache.
    pub async fn compute_value(
        &self,
        owner: &Identity,
        mapping: &MappingConfiguration,
        rule: &MappingRule,
    ) -> ProvisioningResult<Option<String>> {
        let key = ValueKey {
            owner: owner.id,
            system: mapping.system.clone(),
            object_class: mapping.object_class.clone(),
            target_attribute: rule.target_attribute.clone(),
            mapping_version: mapping.version,
            context: input_fingerprint(rule, &owner.attributes),
        };
        if let Some(cached) = self.values.get(&key).await {
            return Ok(cached);
        }

        let value = self
            .engine
            .evaluate_rule(rule, &owner.attributes)
            .map_err(|e| ProvisioningError::from_connector(&mapping.system, e))?;
        self.values.insert(key, value.clone()).await;
        Ok(value)
    }

    /// Build the outbound payload for an operation.
    ///
    /// With `changed`, only rules reading one of those identity attributes
    /// are evaluated. For updates, a rule that now yields nothing clears the
    /// target attribute.
    pub async fn compute_outbound(
        &self,
        owner: &Identity,
        system: &SystemId,
        object_class: &str,
        kind: OperationKind,
        changed: Option<&[String]>,
    ) -> ProvisioningResult<MappedAttributes> {
        let mut mapped = MappedAttributes::default();
        if kind == OperationKind::Delete {
            return Ok(mapped);
        }
        let mapping = self.repository.require(system, object_class)?;

        let rules: Vec<&MappingRule> = match changed {
            Some(changed) => mapping.rules_affected_by(changed).collect(),
            None => mapping.rules.iter().filter(|r| r.direction.is_outbound()).collect(),
        };

        for rule in rules {
            let applies = match kind {
                OperationKind::Create => rule.on_create,
                OperationKind::Update => rule.on_update,
                OperationKind::Delete => false,
            };
            if !applies {
                continue;
            }
            let target = rule.target_attribute.as_str();
            match self.compute_value(owner, &mapping, rule).await? {
                Some(value) if mapping.is_confidential(target) => {
                    mapped
                        .confidential
                        .insert(target.to_string(), GuardedString::new(value));
                }
                Some(value) => {
                    mapped.attributes.set(target, value);
                }
                None if kind == OperationKind::Update && !mapping.is_confidential(target) => {
                    mapped.attributes.set(target, AttributeValue::Null);
                }
                None => {}
            }
        }

        debug!(
            system = %system,
            owner = %owner.id,
            attributes = ?mapped.attributes.names().collect::<Vec<_>>(),
            confidential = mapped.confidential.len(),
            "Computed outbound attributes"
        );
        Ok(mapped)
    }

    /// Parse a remote object into identity attribute values.
    ///
    /// Confidential rules never flow inbound.
    pub fn parse_inbound(
        &self,
        object: &ConnectorObject,
        mapping: &MappingConfiguration,
        owner_attributes: &BTreeMap<String, String>,
    ) -> ProvisioningResult<Vec<InboundValue>> {
        let mut values = Vec::new();
        for rule in &mapping.rules {
            let Some(identity_attribute) = rule.inbound_target() else {
                continue;
            };
            if mapping.is_confidential(&rule.target_attribute) {
                continue;
            }
            let Some(remote) = object.attributes.get(&rule.target_attribute) else {
                continue;
            };
            let value = match self.engine.evaluate_inbound(rule, remote, owner_attributes) {
                Ok(value) => value,
                Err(e) => {
                    warn!(
                        system = %mapping.system,
                        uid = %object.uid,
                        attribute = %rule.target_attribute,
                        error = %e,
                        "Inbound transform failed"
                    );
                    return Err(ProvisioningError::from_connector(&mapping.system, e));
                }
            };
            values.push(InboundValue {
                target_attribute: rule.target_attribute.clone(),
                identity_attribute: identity_attribute.to_string(),
                value,
            });
        }
        Ok(values)
    }
}

fn input_fingerprint(rule: &MappingRule, attributes: &BTreeMap<String, String>) -> u64 {
    let mut hasher = DefaultHasher::new();
    for name in rule.source.referenced_attributes() {
        name.hash(&mut hasher);
        attributes.get(&name).hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use idsync_connector::mapping::{AttributeSource, Transform};
    use idsync_connector::operation::{Uid, PASSWORD_ATTRIBUTE};

    fn ldap1() -> SystemId {
        SystemId::new("ldap1").unwrap()
    }

    fn mapping() -> MappingConfiguration {
        MappingConfiguration::new(
            ldap1(),
            "inetOrgPerson",
            vec![
                MappingRule::direct("mail", "email").with_transform(Transform::Lowercase),
                MappingRule::direct("uid", "username").required(),
                MappingRule::direct("title", "job_title"),
                MappingRule::direct(PASSWORD_ATTRIBUTE, "password"),
                MappingRule {
                    on_update: false,
                    ..MappingRule::direct("cn", "display_name")
                },
            ],
        )
    }

    fn mapper() -> AttributeMapper {
        let repository = Arc::new(MappingRepository::new());
        let mapper = AttributeMapper::new(repository, TransformEngine::new(), &ValueCacheConfig::default());
        mapper.replace_mapping(mapping()).unwrap();
        mapper
    }

    fn jdoe() -> Identity {
        Identity::new()
            .with_attribute("email", "JDoe@Example.com")
            .with_attribute("username", "jdoe")
            .with_attribute("display_name", "John Doe")
            .with_attribute("password", "s3cret")
    }

    #[test]
    fn test_repository_bumps_version() {
        let repository = MappingRepository::new();
        assert_eq!(repository.put(mapping()), 1);
        assert_eq!(repository.put(mapping()), 2);
        assert_eq!(repository.require(&ldap1(), "inetOrgPerson").unwrap().version, 2);
        assert!(repository.require(&ldap1(), "group").is_err());
    }

    #[tokio::test]
    async fn test_outbound_create_splits_confidential() {
        let mapper = mapper();
        let mapped = mapper
            .compute_outbound(&jdoe(), &ldap1(), "inetOrgPerson", OperationKind::Create, None)
            .await
            .unwrap();

        assert_eq!(mapped.attributes.get_string("mail"), Some("jdoe@example.com"));
        assert_eq!(mapped.attributes.get_string("cn"), Some("John Doe"));
        assert!(!mapped.attributes.has("title"));
        assert!(!mapped.attributes.has(PASSWORD_ATTRIBUTE));
        assert_eq!(mapped.confidential[PASSWORD_ATTRIBUTE].expose(), "s3cret");
    }

    #[tokio::test]
    async fn test_outbound_update_only_changed_and_clears() {
        let mapper = mapper();
        let changed = vec!["email".to_string(), "job_title".to_string(), "display_name".to_string()];
        let mapped = mapper
            .compute_outbound(
                &jdoe(),
                &ldap1(),
                "inetOrgPerson",
                OperationKind::Update,
                Some(&changed),
            )
            .await
            .unwrap();

        assert_eq!(mapped.attributes.get_string("mail"), Some("jdoe@example.com"));
        assert_eq!(mapped.attributes.get("title"), Some(&AttributeValue::Null));
        assert!(!mapped.attributes.has("uid"));
        // cn is create-only
        assert!(!mapped.attributes.has("cn"));
    }

    #[tokio::test]
    async fn test_required_rule_without_value_fails() {
        let mapper = mapper();
        let identity = Identity::new().with_attribute("email", "a@example.com");
        let err = mapper
            .compute_outbound(&identity, &ldap1(), "inetOrgPerson", OperationKind::Create, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::Transformation { ref attribute, .. } if attribute == "uid"));
    }

    #[tokio::test]
    async fn test_cached_value_follows_input_and_mapping_changes() {
        let mapper = mapper();
        let mut identity = jdoe();
        let mapping = mapper.repository().require(&ldap1(), "inetOrgPerson").unwrap();
        let rule = mapping.rule("mail").unwrap().clone();

        let first = mapper.compute_value(&identity, &mapping, &rule).await.unwrap();
        assert_eq!(first.as_deref(), Some("jdoe@example.com"));

        identity.attributes.insert("email".into(), "New@Example.com".into());
        let second = mapper.compute_value(&identity, &mapping, &rule).await.unwrap();
        assert_eq!(second.as_deref(), Some("new@example.com"));

        let mut changed = mapping.as_ref().clone();
        changed.rules[0].transform = Some(Transform::Uppercase);
        mapper.replace_mapping(changed).unwrap();
        let mapping = mapper.repository().require(&ldap1(), "inetOrgPerson").unwrap();
        let rule = mapping.rule("mail").unwrap().clone();
        let third = mapper.compute_value(&identity, &mapping, &rule).await.unwrap();
        assert_eq!(third.as_deref(), Some("NEW@EXAMPLE.COM"));
    }

    #[tokio::test]
    async fn test_parse_inbound_skips_outbound_only_and_confidential() {
        let mapper = mapper();
        let mut config = mapping();
        config.rules.push(
            MappingRule::direct("telephoneNumber", "phone")
                .with_direction(idsync_connector::mapping::MappingDirection::Outbound),
        );
        config.rules.push(MappingRule {
            source: AttributeSource::Constant { value: "x".into() },
            ..MappingRule::direct("employeeType", "unused")
        });

        let object = ConnectorObject::new(
            Uid::from_value("jdoe"),
            "inetOrgPerson",
            AttributeSet::new()
                .with("mail", "jdoe@corp.example")
                .with("telephoneNumber", "555")
                .with("employeeType", "staff")
                .with(PASSWORD_ATTRIBUTE, "leak"),
        );

        let values = mapper
            .parse_inbound(&object, &config, &BTreeMap::new())
            .unwrap();
        assert_eq!(
            values,
            vec![InboundValue {
                target_attribute: "mail".into(),
                identity_attribute: "email".into(),
                value: Some("jdoe@corp.example".into()),
            }]
        );
    }
}
