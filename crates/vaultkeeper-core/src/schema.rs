//! Schema registry: the managed entity types and the relationships the validators check.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::identifiers::IdentifierScheme;
use crate::model::ModelId;
use crate::CoreError;

const BUILTIN_REGISTRY_YAML: &str = include_str!("../schema/builtin_registry.yaml");

/// Declared foreign key from `child.field` to `parent`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Relation {
    pub child: ModelId,
    pub field: String,
    pub parent: ModelId,
    /// Whether the field may legitimately be null
    #[serde(default)]
    pub nullable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrphanCheck {
    pub child: ModelId,
    pub field: String,
    pub parent: ModelId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequiredFields {
    pub model: ModelId,
    pub fields: Vec<String>,
}

/// Relationship checked inside an archive before restore.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForwardReference {
    pub model: ModelId,
    pub field: String,
    pub target: ModelId,
}

/// The primary business entity and its human-facing management identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusinessEntity {
    pub model: ModelId,
    #[serde(default = "default_identifier_field")]
    pub identifier_field: String,
    #[serde(default = "default_created_at_field")]
    pub created_at_field: String,
    #[serde(default)]
    pub identifier: IdentifierScheme,
}

fn default_identifier_field() -> String {
    "management_no".to_string()
}

fn default_created_at_field() -> String {
    "created_at".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaRegistry {
    /// Every entity type the target store knows about
    pub models: Vec<ModelId>,
    /// Namespaces counted by statistics collection
    #[serde(default)]
    pub managed_namespaces: Vec<String>,
    #[serde(default)]
    pub relations: Vec<Relation>,
    #[serde(default)]
    pub orphan_checks: Vec<OrphanCheck>,
    #[serde(default)]
    pub required_fields: Vec<RequiredFields>,
    #[serde(default)]
    pub forward_references: Vec<ForwardReference>,
    /// Never written into archives
    #[serde(default)]
    pub ephemeral_models: Vec<ModelId>,
    /// Never removed by clear or delete-all
    #[serde(default)]
    pub protected_models: Vec<ModelId>,
    #[serde(default)]
    pub purge_namespaces: Vec<String>,
    /// Deletion order for delete-all, children before parents
    #[serde(default)]
    pub purge_order: Vec<ModelId>,
    /// Display grouping for selective restore; falls back to the namespace
    #[serde(default)]
    pub categories: BTreeMap<String, Vec<ModelId>>,
    #[serde(default)]
    pub business_entity: Option<BusinessEntity>,
}

impl SchemaRegistry {
    /// Registry describing the order and subcontract management schema.
    ///
    /// # Errors
    /// Returns [`CoreError::Schema`] if the bundled registry fails to parse or validate.
    pub fn builtin() -> Result<Self, CoreError> {
        Self::parse(BUILTIN_REGISTRY_YAML)
    }

    /// # Errors
    /// Returns [`CoreError::Schema`] when the file cannot be read, parsed, or validated.
    pub fn from_path(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            CoreError::Schema(format!("failed to read schema registry {}: {err}", path.display()))
        })?;
        Self::parse(&content)
    }

    /// # Errors
    /// Returns [`CoreError::Schema`] when the YAML is malformed or the registry is inconsistent.
    pub fn parse(yaml: &str) -> Result<Self, CoreError> {
        let registry: Self = serde_yaml::from_str(yaml)
            .map_err(|err| CoreError::Schema(format!("invalid schema registry YAML: {err}")))?;
        registry.validate()?;
        Ok(registry)
    }

    /// Check that every reference names a declared model and the identifier scheme compiles.
    ///
    /// # Errors
    /// Returns [`CoreError::Schema`] describing the first inconsistency found.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.models.is_empty() {
            return Err(CoreError::Schema("schema registry declares no models".to_string()));
        }

        let known: BTreeSet<&ModelId> = self.models.iter().collect();
        let require = |model: &ModelId, context: &str| -> Result<(), CoreError> {
            if known.contains(model) {
                Ok(())
            } else {
                Err(CoreError::Schema(format!("{context} references undeclared model {model}")))
            }
        };

        for relation in &self.relations {
            require(&relation.child, "relation")?;
            require(&relation.parent, "relation")?;
        }
        for check in &self.orphan_checks {
            require(&check.child, "orphan check")?;
            require(&check.parent, "orphan check")?;
        }
        for required in &self.required_fields {
            require(&required.model, "required field check")?;
        }
        for reference in &self.forward_references {
            require(&reference.model, "forward reference")?;
            require(&reference.target, "forward reference")?;
        }
        for model in &self.purge_order {
            require(model, "purge order")?;
        }
        for models in self.categories.values() {
            for model in models {
                require(model, "category")?;
            }
        }
        if let Some(entity) = &self.business_entity {
            require(&entity.model, "business entity")?;
            entity.identifier.compile()?;
        }

        Ok(())
    }

    #[must_use]
    pub fn is_known(&self, model: &ModelId) -> bool {
        self.models.contains(model)
    }

    #[must_use]
    pub fn is_ephemeral(&self, model: &ModelId) -> bool {
        self.ephemeral_models.contains(model)
    }

    #[must_use]
    pub fn is_protected(&self, model: &ModelId) -> bool {
        self.protected_models.contains(model)
    }

    #[must_use]
    pub fn is_managed(&self, model: &ModelId) -> bool {
        self.managed_namespaces
            .iter()
            .any(|namespace| namespace == model.namespace())
    }

    #[must_use]
    pub fn is_purgeable(&self, model: &ModelId) -> bool {
        if self.is_protected(model) {
            return false;
        }
        self.purge_namespaces
            .iter()
            .any(|namespace| namespace == model.namespace())
    }

    /// Declared models in managed namespaces, in declaration order.
    pub fn managed_models(&self) -> impl Iterator<Item = &ModelId> {
        self.models.iter().filter(|model| self.is_managed(model))
    }

    #[must_use]
    pub fn category_of(&self, model: &ModelId) -> String {
        self.categories
            .iter()
            .find(|(_, models)| models.contains(model))
            .map_or_else(
                || model.namespace().to_string(),
                |(category, _)| category.clone(),
            )
    }
}
