//! Template registry: static catalog mapping name -> ordered step list.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

use crate::core::error::AtlasError;
use crate::core::template::Template;

pub mod builtin;

/// Catalog of templates, with alias support. Built once at startup and then
/// shared immutably.
#[derive(Debug, Default)]
pub struct Registry {
    templates: BTreeMap<String, Template>,
    aliases: BTreeMap<String, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with all builtin templates and aliases.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for template in builtin::all() {
            registry
                .register(template)
                .expect("builtin templates are unique");
        }
        registry
            .register_alias("bug", "bugfix")
            .expect("builtin alias");
        registry
            .register_alias("hotfix", "bugfix")
            .expect("builtin alias");
        registry
    }

    pub fn register(&mut self, template: Template) -> Result<()> {
        anyhow::ensure!(
            !template.name.trim().is_empty(),
            "template name must not be empty"
        );
        if self.templates.contains_key(&template.name) {
            return Err(anyhow!("duplicate template '{}'", template.name));
        }
        self.templates.insert(template.name.clone(), template);
        Ok(())
    }

    /// Point `alias` at an existing template.
    pub fn register_alias(&mut self, alias: &str, target: &str) -> Result<()> {
        anyhow::ensure!(!alias.trim().is_empty(), "alias must not be empty");
        if !self.templates.contains_key(target) {
            return Err(anyhow!("alias target '{target}' is not registered"));
        }
        if self.templates.contains_key(alias) {
            return Err(anyhow!("alias '{alias}' conflicts with a template name"));
        }
        self.aliases.insert(alias.to_string(), target.to_string());
        Ok(())
    }

    /// Look up by name or alias.
    pub fn get(&self, name: &str) -> Result<&Template> {
        let resolved = self.aliases.get(name).map(String::as_str).unwrap_or(name);
        self.templates
            .get(resolved)
            .ok_or_else(|| AtlasError::NotFound(format!("template '{name}'")).into())
    }

    pub fn names(&self) -> Vec<&str> {
        self.templates.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let registry = Registry::with_builtins();
        for name in ["feature", "bugfix", "commit", "fix"] {
            registry.get(name).expect(name);
        }
    }

    #[test]
    fn aliases_resolve_to_target() {
        let registry = Registry::with_builtins();
        assert_eq!(registry.get("bug").expect("alias").name, "bugfix");
        assert_eq!(registry.get("hotfix").expect("alias").name, "bugfix");
    }

    #[test]
    fn unknown_template_is_not_found() {
        let registry = Registry::with_builtins();
        let err = registry.get("nope").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AtlasError>(),
            Some(AtlasError::NotFound(_))
        ));
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = Registry::with_builtins();
        let err = registry.register(builtin::commit_template()).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn alias_cannot_shadow_template() {
        let mut registry = Registry::with_builtins();
        let err = registry.register_alias("commit", "bugfix").unwrap_err();
        assert!(err.to_string().contains("conflicts"));
    }

    #[test]
    fn every_builtin_rework_step_precedes_its_final_gate() {
        let registry = Registry::with_builtins();
        for name in ["feature", "bugfix", "fix"] {
            let template = registry.get(name).expect(name);
            let rework = template.rework_index().expect("rework step");
            let gate = template
                .steps
                .iter()
                .rposition(|s| s.kind() == "human")
                .expect("approval gate");
            assert!(rework < gate, "{name}: rework must precede the final gate");
        }
    }
}
