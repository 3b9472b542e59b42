//! Per-session character registry: discovers `*.toml` character files,
//! loads them concurrently, and owns the namespace their units live in.

pub mod builtin;
pub mod catalog;
pub mod definition;
pub mod namespace;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use parley_telemetry::MetricsRecorder;

pub use catalog::{Catalog, PromptGenerator, ToolHandler};
pub use definition::{
    CharacterDefinition, CharacterSummary, CompiledTool, Instructions, LoadError, LoadErrorKind, Metadata,
    VoiceRef,
};
pub use namespace::{LoadedUnit, Namespace};

use crate::error::RegistryError;

const CHARACTER_EXTENSION: &str = "toml";

#[derive(Debug)]
pub struct LoadResult {
    pub loaded: usize,
    pub total: usize,
    pub errors: Vec<LoadError>,
    pub duration: Duration,
}

impl LoadResult {
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }
}

/// Generation counter shared between a registry and whoever may supersede
/// its in-flight load. A load whose generation is no longer current drops
/// its results.
#[derive(Clone, Debug, Default)]
pub struct LoadFence(Arc<AtomicU64>);

impl LoadFence {
    /// Invalidate any load in flight. Returns the new generation.
    pub fn supersede(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

pub struct CharacterRegistry {
    namespace: Namespace,
    catalog: Arc<Catalog>,
    characters: BTreeMap<String, Arc<CharacterDefinition>>,
    current_directory: Option<PathBuf>,
    fence: LoadFence,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl CharacterRegistry {
    pub fn new(namespace_id: impl Into<String>, catalog: Arc<Catalog>) -> Self {
        Self {
            namespace: Namespace::new(namespace_id),
            catalog,
            characters: BTreeMap::new(),
            current_directory: None,
            fence: LoadFence::default(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn fence(&self) -> LoadFence {
        self.fence.clone()
    }

    pub fn namespace(&self) -> &str {
        self.namespace.id()
    }

    pub fn units(&self) -> &Namespace {
        &self.namespace
    }

    pub fn current_directory(&self) -> Option<&Path> {
        self.current_directory.as_deref()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CharacterDefinition>> {
        self.characters.get(name).cloned()
    }

    /// Loaded characters in name order.
    pub fn list(&self) -> Vec<CharacterSummary> {
        self.characters.values().map(|c| c.summary()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.characters.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.characters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }

    /// Load every character file in `dir`, replacing the current set.
    /// Individual file failures are collected in [`LoadResult::errors`].
    #[instrument(skip(self, dir), fields(namespace = %self.namespace.id(), dir = %dir.display()))]
    pub async fn load(&mut self, dir: &Path) -> Result<LoadResult, RegistryError> {
        let generation = self.fence.supersede();
        let start = Instant::now();
        let files = discover(dir).await?;
        let total = files.len();
        if total == 0 {
            warn!("no character files found, continuing with an empty registry");
        }

        let mut tasks = JoinSet::new();
        for (index, path) in files.iter().cloned().enumerate() {
            let catalog = Arc::clone(&self.catalog);
            let fence = self.fence.clone();
            let key = self.namespace.unit_key(&file_stem(&path));
            tasks.spawn_blocking(move || {
                if fence.current() != generation {
                    return (index, None);
                }
                (index, Some(definition::load_file(&path, key, &catalog)))
            });
        }

        let mut outcomes: Vec<Option<Result<CharacterDefinition, LoadError>>> = Vec::new();
        outcomes.resize_with(total, || None);
        while let Some(joined) = tasks.join_next().await {
            if self.fence.current() != generation {
                tasks.abort_all();
                return Err(RegistryError::Superseded);
            }
            match joined {
                Ok((index, outcome)) => outcomes[index] = outcome,
                Err(e) => warn!(error = %e, "character load task failed"),
            }
        }
        if self.fence.current() != generation {
            return Err(RegistryError::Superseded);
        }

        let mut characters: BTreeMap<String, Arc<CharacterDefinition>> = BTreeMap::new();
        let mut errors = Vec::new();
        for (path, outcome) in files.iter().zip(outcomes) {
            let outcome = outcome.unwrap_or_else(|| {
                Err(LoadError::new(path, LoadErrorKind::Io, "load task did not complete"))
            });
            match outcome {
                Ok(character) => match characters.get(&character.name) {
                    Some(first) => errors.push(LoadError::new(
                        path,
                        LoadErrorKind::DuplicateName,
                        format!(
                            "duplicate character name '{}' (first defined in {})",
                            character.name,
                            first.source_path.display()
                        ),
                    )),
                    None => {
                        characters.insert(character.name.clone(), Arc::new(character));
                    }
                },
                Err(e) => errors.push(e),
            }
        }

        self.namespace.dispose();
        for character in characters.values() {
            self.namespace.insert(Arc::clone(character.unit()));
        }
        self.characters = characters;
        self.current_directory = Some(dir.to_path_buf());

        for error in &errors {
            warn!(path = %error.path.display(), kind = error.kind.as_str(), message = %error.message, "character failed to load");
        }
        let result = LoadResult {
            loaded: self.characters.len(),
            total,
            errors,
            duration: start.elapsed(),
        };
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc("character_loads_total", &[("outcome", "loaded")], result.loaded as u64);
            metrics.counter_inc("character_loads_total", &[("outcome", "failed")], result.error_count() as u64);
            for error in &result.errors {
                metrics.counter_inc("character_load_errors_total", &[("kind", error.kind.as_str())], 1);
            }
            metrics.histogram_observe("character_load_duration_seconds", &[], result.duration.as_secs_f64());
        }
        info!(
            loaded = result.loaded,
            errors = result.error_count(),
            total = result.total,
            duration_ms = result.duration.as_millis() as u64,
            "characters loaded"
        );
        Ok(result)
    }

    /// Purge the current namespace, then load `dir`. A missing directory
    /// fails before anything is purged.
    pub async fn reload(&mut self, dir: &Path) -> Result<LoadResult, RegistryError> {
        check_directory(dir).await?;
        self.dispose();
        self.load(dir).await
    }

    /// Remove every loaded character and unit. Returns the number of units purged.
    pub fn dispose(&mut self) -> usize {
        self.characters.clear();
        let purged = self.namespace.dispose();
        if purged > 0 {
            info!(namespace = %self.namespace.id(), purged, "character namespace disposed");
        }
        purged
    }
}

async fn check_directory(dir: &Path) -> Result<(), RegistryError> {
    match tokio::fs::metadata(dir).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(RegistryError::NotADirectory(dir.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RegistryError::DirectoryNotFound(dir.to_path_buf())),
        Err(source) => Err(RegistryError::Io {
            path: dir.to_path_buf(),
            source,
        }),
    }
}

/// Candidate character files in `dir`, sorted by file name. Stems starting
/// with `_` are skipped.
async fn discover(dir: &Path) -> Result<Vec<PathBuf>, RegistryError> {
    check_directory(dir).await?;
    let io_err = |source| RegistryError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(CHARACTER_EXTENSION) {
            continue;
        }
        if file_stem(&path).starts_with('_') {
            continue;
        }
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::fs;

    fn character(name: &str, with_tools: bool, with_handler: bool) -> String {
        let mut source = format!(
            r#"
name = "{name}"

[voice]
path_on_server = "voices/{name}.wav"

[instructions]
instruction_prompt = "You are {name}."

[prompt]
generator = "standard"

[metadata]
good = true
comment = "{name} test character"
"#
        );
        if with_tools {
            source.push_str(
                r#"
[[tools]]
name = "log_story_event"
description = "Log an event"
parameters = { type = "object", required = ["event"], properties = { event = { type = "string" } } }
"#,
            );
        }
        if with_handler {
            source.push_str("\n[handler]\nkind = \"event_log\"\n");
        }
        source
    }

    fn write(dir: &Path, file: &str, source: &str) {
        fs::write(dir.join(file), source).unwrap();
    }

    fn registry(ns: &str) -> CharacterRegistry {
        CharacterRegistry::new(ns, Arc::new(Catalog::builtin()))
    }

    #[tokio::test]
    async fn ten_files_two_missing_handlers() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..10 {
            let broken = i == 3 || i == 7;
            write(dir.path(), &format!("c{i:02}.toml"), &character(&format!("C{i}"), true, !broken));
        }

        let mut reg = registry("sess_load");
        let result = reg.load(dir.path()).await.unwrap();
        assert_eq!(result.loaded, 8);
        assert_eq!(result.error_count(), 2);
        assert_eq!(result.total, 10);
        assert!(result.errors.iter().all(|e| e.kind == LoadErrorKind::MissingHandler));
        assert!(reg.get("C3").is_none());
        assert!(reg.get("C4").is_some());
        assert_eq!(reg.units().len(), 8);
    }

    #[tokio::test]
    async fn skips_underscore_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "_shared.toml", &character("Hidden", false, false));
        write(dir.path(), "notes.md", "# not a character");
        write(dir.path(), "alice.toml", &character("Alice", false, false));

        let mut reg = registry("sess_skip");
        let result = reg.load(dir.path()).await.unwrap();
        assert_eq!((result.loaded, result.total), (1, 1));
        assert_eq!(reg.current_directory(), Some(dir.path()));
    }

    #[tokio::test]
    async fn first_duplicate_wins_in_file_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.toml", &character("Twin", false, false));
        write(dir.path(), "b.toml", &character("Twin", false, false));

        let mut reg = registry("sess_dup");
        let result = reg.load(dir.path()).await.unwrap();
        assert_eq!(result.loaded, 1);
        assert_eq!(result.errors[0].kind, LoadErrorKind::DuplicateName);
        assert!(result.errors[0].path.ends_with("b.toml"));
        assert!(reg.get("Twin").unwrap().source_path.ends_with("a.toml"));
    }

    #[tokio::test]
    async fn empty_and_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry("sess_empty");
        let result = reg.load(dir.path()).await.unwrap();
        assert_eq!((result.loaded, result.total), (0, 0));

        let missing = dir.path().join("nope");
        assert_matches!(reg.load(&missing).await, Err(RegistryError::DirectoryNotFound(_)));

        let file = dir.path().join("file.toml");
        fs::write(&file, "").unwrap();
        assert_matches!(reg.reload(&file).await, Err(RegistryError::NotADirectory(_)));
    }

    #[tokio::test]
    async fn reload_disposes_previous_units() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        write(first.path(), "old.toml", &character("Old", false, false));
        write(second.path(), "new.toml", &character("New", false, false));

        let mut reg = registry("sess_reload");
        reg.load(first.path()).await.unwrap();
        assert!(reg.units().resolve("old").is_some());

        let result = reg.reload(second.path()).await.unwrap();
        assert_eq!(result.loaded, 1);
        assert!(reg.units().resolve("old").is_none());
        assert!(reg.get("Old").is_none());
        assert_eq!(reg.names(), vec!["New"]);
    }

    #[tokio::test]
    async fn sessions_do_not_share_units() {
        let a_dir = tempfile::tempdir().unwrap();
        let b_dir = tempfile::tempdir().unwrap();
        write(a_dir.path(), "host.toml", &character("Host", true, true));
        write(b_dir.path(), "host.toml", &character("Host", true, true));

        let mut a = registry("sess_a");
        let mut b = registry("sess_b");
        a.load(a_dir.path()).await.unwrap();
        b.load(b_dir.path()).await.unwrap();

        let ua = a.units().resolve("host").unwrap();
        let ub = b.units().resolve("host").unwrap();
        assert_ne!(ua.key, ub.key);
        assert!(!Arc::ptr_eq(&ua, &ub));
        assert!(b.units().resolve("host").is_some());

        a.dispose();
        assert!(a.units().is_empty());
        assert!(b.get("Host").is_some());
    }

    #[tokio::test]
    async fn superseded_load_leaves_registry_untouched() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.toml", &character("A", false, false));

        let fence = LoadFence::default();
        let mut catalog = Catalog::builtin();
        let trip = fence.clone();
        catalog.register_generator("standard", move |instructions| {
            trip.supersede();
            Ok(Arc::new(builtin::StandardPrompt::new(instructions)) as Arc<dyn PromptGenerator>)
        });

        let mut reg = CharacterRegistry::new("sess_fence", Arc::new(catalog));
        reg.fence = fence;
        assert_matches!(reg.load(dir.path()).await, Err(RegistryError::Superseded));
        assert!(reg.is_empty());
        assert!(reg.current_directory().is_none());
    }

    #[tokio::test]
    async fn list_is_name_ordered() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "1.toml", &character("Zoe", false, false));
        write(dir.path(), "2.toml", &character("Adam", false, false));

        let mut reg = registry("sess_list");
        reg.load(dir.path()).await.unwrap();
        let names: Vec<String> = reg.list().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["Adam", "Zoe"]);
    }
}
