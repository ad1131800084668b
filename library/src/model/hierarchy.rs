//! Model lineage.
//!
//! A model may declare a parent it can be translated into. A provider allowed for a parent model
//! is therefore usable under every descendant model.

use std::collections::HashMap;

use crate::error::RegistryError;

#[derive(Debug, Clone, Default)]
pub struct ModelHierarchy {
    parents: HashMap<String, Option<String>>,
}

impl ModelHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a root model.
    pub fn declare(&mut self, model: impl Into<String>) -> Result<(), RegistryError> {
        let model = model.into();
        if model.is_empty() {
            return Err(RegistryError::EmptyField {
                node: "<model>".to_string(),
                field: "model name",
            });
        }
        if self.parents.contains_key(&model) {
            return Err(RegistryError::DuplicateModel(model));
        }
        self.parents.insert(model, None);
        Ok(())
    }

    /// Declares `child` as translatable into `parent`. The parent must already be declared.
    pub fn declare_child(
        &mut self,
        child: impl Into<String>,
        parent: &str,
    ) -> Result<(), RegistryError> {
        if !self.parents.contains_key(parent) {
            return Err(RegistryError::UnknownModel(parent.to_string()));
        }
        let child = child.into();
        self.declare(child.clone())?;
        self.parents.insert(child, Some(parent.to_string()));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn contains(&self, model: &str) -> bool {
        self.parents.contains_key(model)
    }

    /// `model` followed by its ancestors, nearest first. Undeclared models have no ancestors.
    pub fn lineage<'a>(&'a self, model: &'a str) -> Vec<&'a str> {
        let mut lineage = vec![model];
        let mut current = model;
        while let Some(Some(parent)) = self.parents.get(current) {
            lineage.push(parent.as_str());
            current = parent.as_str();
        }
        lineage
    }

    /// True if `allowed` is empty or contains `model` or one of its ancestors.
    pub fn is_compatible(&self, model: &str, allowed: &[String]) -> bool {
        if allowed.is_empty() {
            return true;
        }
        self.lineage(model)
            .iter()
            .any(|m| allowed.iter().any(|a| a == m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hierarchy() -> ModelHierarchy {
        let mut h = ModelHierarchy::new();
        h.declare("SingletDM").unwrap();
        h.declare_child("SingletDM_Z2", "SingletDM").unwrap();
        h.declare_child("SingletDM_Z2_running", "SingletDM_Z2").unwrap();
        h.declare("MSSM").unwrap();
        h
    }

    #[test]
    fn lineage_walks_to_root() {
        let h = hierarchy();
        assert_eq!(
            h.lineage("SingletDM_Z2_running"),
            vec!["SingletDM_Z2_running", "SingletDM_Z2", "SingletDM"]
        );
        assert_eq!(h.lineage("Unknown"), vec!["Unknown"]);
    }

    #[test]
    fn descendants_are_compatible_with_ancestor_providers() {
        let h = hierarchy();
        let allowed = vec!["SingletDM".to_string()];
        assert!(h.is_compatible("SingletDM_Z2_running", &allowed));
        assert!(!h.is_compatible("MSSM", &allowed));
        assert!(h.is_compatible("MSSM", &[]));
    }

    #[test]
    fn child_needs_declared_parent() {
        let mut h = hierarchy();
        assert_eq!(
            h.declare_child("X", "Nope"),
            Err(RegistryError::UnknownModel("Nope".to_string()))
        );
        assert_eq!(
            h.declare("MSSM"),
            Err(RegistryError::DuplicateModel("MSSM".to_string()))
        );
    }
}
