use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::characters::catalog::{PromptGenerator, ToolHandler};

/// The instantiated behaviour of one loaded character file.
pub struct LoadedUnit {
    pub key: String,
    pub source: PathBuf,
    pub generator: Arc<dyn PromptGenerator>,
    pub handler: Option<Arc<dyn ToolHandler>>,
}

impl fmt::Debug for LoadedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedUnit")
            .field("key", &self.key)
            .field("source", &self.source)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// Per-session table of loaded units keyed `{namespace}/{file_stem}`.
/// Owned by exactly one registry and purged as a whole.
#[derive(Debug)]
pub struct Namespace {
    id: String,
    units: HashMap<String, Arc<LoadedUnit>>,
}

impl Namespace {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            units: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Key a file stem would be loaded under.
    pub fn unit_key(&self, stem: &str) -> String {
        format!("{}/{stem}", self.id)
    }

    pub fn insert(&mut self, unit: Arc<LoadedUnit>) {
        self.units.insert(unit.key.clone(), unit);
    }

    pub fn resolve(&self, stem: &str) -> Option<Arc<LoadedUnit>> {
        self.units.get(&self.unit_key(stem)).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.units.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Drop every unit under this namespace's prefix. Returns how many were removed.
    pub fn dispose(&mut self) -> usize {
        let prefix = format!("{}/", self.id);
        let before = self.units.len();
        self.units.retain(|key, _| !key.starts_with(&prefix));
        before - self.units.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Blank;

    impl PromptGenerator for Blank {
        fn make_system_prompt(&self, _llm_name: &str) -> String {
            String::new()
        }
    }

    fn unit(ns: &Namespace, stem: &str) -> Arc<LoadedUnit> {
        Arc::new(LoadedUnit {
            key: ns.unit_key(stem),
            source: PathBuf::from(format!("{stem}.toml")),
            generator: Arc::new(Blank),
            handler: None,
        })
    }

    #[test]
    fn identical_stems_do_not_alias_across_namespaces() {
        let mut a = Namespace::new("sess_a");
        let mut b = Namespace::new("sess_b");
        a.insert(unit(&a, "narrator"));
        b.insert(unit(&b, "narrator"));

        let ua = a.resolve("narrator").unwrap();
        let ub = b.resolve("narrator").unwrap();
        assert_eq!(ua.key, "sess_a/narrator");
        assert_eq!(ub.key, "sess_b/narrator");
        assert!(!Arc::ptr_eq(&ua, &ub));
    }

    #[test]
    fn dispose_purges_everything() {
        let mut ns = Namespace::new("sess_x");
        ns.insert(unit(&ns, "a"));
        ns.insert(unit(&ns, "b"));
        assert_eq!(ns.dispose(), 2);
        assert!(ns.is_empty());
        assert!(ns.resolve("a").is_none());
    }
}
