use std::collections::HashMap;

use crate::config::RelationshipTypeConfig;

/// Graph constraints for one relationship type. Undeclared types get the
/// permissive default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeConstraints {
    pub acyclic: bool,
    pub allow_self_reference: bool,
    pub max_out_degree: Option<usize>,
    pub max_path_depth: Option<usize>,
}

impl Default for TypeConstraints {
    fn default() -> Self {
        Self {
            acyclic: false,
            allow_self_reference: true,
            max_out_degree: None,
            max_path_depth: None,
        }
    }
}

impl From<&RelationshipTypeConfig> for TypeConstraints {
    fn from(config: &RelationshipTypeConfig) -> Self {
        Self {
            acyclic: config.acyclic,
            allow_self_reference: config.allow_self_reference,
            max_out_degree: config.max_out_degree,
            max_path_depth: config.max_path_depth,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelationshipTypeRegistry {
    types: HashMap<String, TypeConstraints>,
    permissive: TypeConstraints,
}

impl RelationshipTypeRegistry {
    pub fn from_config(types: &[RelationshipTypeConfig]) -> Self {
        Self {
            types: types
                .iter()
                .map(|t| (t.name.clone(), TypeConstraints::from(t)))
                .collect(),
            permissive: TypeConstraints::default(),
        }
    }

    pub fn constraints(&self, relationship_type: &str) -> &TypeConstraints {
        self.types.get(relationship_type).unwrap_or(&self.permissive)
    }

    pub fn is_declared(&self, relationship_type: &str) -> bool {
        self.types.contains_key(relationship_type)
    }
}
