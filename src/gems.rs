//! Cached persona catalog.

use std::sync::{Arc, Mutex, MutexGuard};

use chat_provider::{ChatBackend, ChatError, Gem, GemDraft, GemMutation};
use tracing::{debug, info};

/// Ordered snapshot of the persona catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GemJar {
    gems: Vec<Gem>,
}

impl GemJar {
    #[must_use]
    pub fn new(gems: Vec<Gem>) -> Self {
        let mut jar = Self::default();
        for gem in gems {
            jar.upsert(gem);
        }
        jar
    }

    pub fn iter(&self) -> impl Iterator<Item = &Gem> {
        self.gems.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.gems.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.gems.is_empty()
    }

    /// Resolves by exact id first, then by case-insensitive name.
    #[must_use]
    pub fn get(&self, id_or_name: &str) -> Option<&Gem> {
        let needle = id_or_name.trim();
        self.gems
            .iter()
            .find(|gem| gem.id == needle)
            .or_else(|| {
                let lowered = needle.to_lowercase();
                self.gems
                    .iter()
                    .find(|gem| gem.name.to_lowercase() == lowered)
            })
    }

    /// Keeps gems matching every given criterion. `name` matches a
    /// case-insensitive substring.
    #[must_use]
    pub fn filter(&self, predefined: Option<bool>, name: Option<&str>) -> GemJar {
        let name = name.map(str::to_lowercase);
        let gems = self
            .gems
            .iter()
            .filter(|gem| predefined.map_or(true, |wanted| gem.predefined == wanted))
            .filter(|gem| {
                name.as_deref()
                    .map_or(true, |needle| gem.name.to_lowercase().contains(needle))
            })
            .cloned()
            .collect();
        GemJar { gems }
    }

    fn upsert(&mut self, gem: Gem) {
        match self.gems.iter_mut().find(|existing| existing.id == gem.id) {
            Some(existing) => *existing = gem,
            None => self.gems.push(gem),
        }
    }

    fn remove(&mut self, id: &str) {
        self.gems.retain(|gem| gem.id != id);
    }
}

impl<'a> IntoIterator for &'a GemJar {
    type Item = &'a Gem;
    type IntoIter = std::slice::Iter<'a, Gem>;

    fn into_iter(self) -> Self::IntoIter {
        self.gems.iter()
    }
}

pub struct GemRegistry {
    backend: Arc<dyn ChatBackend>,
    jar: Mutex<GemJar>,
}

impl GemRegistry {
    #[must_use]
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            backend,
            jar: Mutex::new(GemJar::default()),
        }
    }

    /// Replaces the cache with the service catalog.
    pub fn fetch(&self, include_hidden: bool) -> Result<GemJar, ChatError> {
        let jar = GemJar::new(self.backend.fetch_gems(include_hidden)?);
        info!(count = jar.len(), include_hidden, "gem catalog fetched");
        *self.lock_jar() = jar.clone();
        Ok(jar)
    }

    /// Snapshot of the cache.
    #[must_use]
    pub fn jar(&self) -> GemJar {
        self.lock_jar().clone()
    }

    #[must_use]
    pub fn get(&self, id_or_name: &str) -> Option<Gem> {
        self.lock_jar().get(id_or_name).cloned()
    }

    pub fn create(&self, name: &str, prompt: &str, description: &str) -> Result<Gem, ChatError> {
        let mutation = GemMutation::Create(GemDraft::new(name, prompt, description));
        let gem = self.apply(&mutation)?.ok_or_else(missing_gem)?;
        self.lock_jar().upsert(gem.clone());
        Ok(gem)
    }

    pub fn update(
        &self,
        id: &str,
        name: &str,
        prompt: &str,
        description: &str,
    ) -> Result<Gem, ChatError> {
        self.ensure_mutable(id)?;
        let mutation = GemMutation::Update {
            id: id.to_owned(),
            draft: GemDraft::new(name, prompt, description),
        };
        let gem = self.apply(&mutation)?.ok_or_else(missing_gem)?;
        self.lock_jar().upsert(gem.clone());
        Ok(gem)
    }

    pub fn delete(&self, id: &str) -> Result<(), ChatError> {
        self.ensure_mutable(id)?;
        self.apply(&GemMutation::Delete { id: id.to_owned() })?;
        self.lock_jar().remove(id);
        Ok(())
    }

    fn ensure_mutable(&self, id: &str) -> Result<(), ChatError> {
        match self.lock_jar().gems.iter().find(|gem| gem.id == id) {
            Some(gem) if gem.predefined => Err(ChatError::Immutable(gem.name.clone())),
            _ => Ok(()),
        }
    }

    fn apply(&self, mutation: &GemMutation) -> Result<Option<Gem>, ChatError> {
        debug!(action = mutation.label(), "mutating gem");
        self.backend.mutate_gem(mutation)
    }

    fn lock_jar(&self) -> MutexGuard<'_, GemJar> {
        match self.jar.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn missing_gem() -> ChatError {
    ChatError::Protocol("gem mutation returned no gem".to_owned())
}

#[cfg(test)]
mod tests {
    use chat_provider_mock::ScriptedBackend;

    use super::*;

    fn gem(id: &str, name: &str, predefined: bool) -> Gem {
        Gem {
            id: id.to_owned(),
            name: name.to_owned(),
            description: None,
            prompt: None,
            predefined,
        }
    }

    fn registry() -> GemRegistry {
        let backend = ScriptedBackend::default().with_gems(vec![
            gem("sys-1", "Brainstormer", true),
            gem("mine-1", "Tutor", false),
        ]);
        GemRegistry::new(Arc::new(backend))
    }

    #[test]
    fn get_prefers_id_then_case_insensitive_name() {
        let jar = GemJar::new(vec![gem("tutor", "Other", false), gem("t-2", "Tutor", false)]);

        assert_eq!(jar.get("tutor").map(|g| g.id.as_str()), Some("tutor"));
        assert_eq!(jar.get("TUTOR").map(|g| g.id.as_str()), Some("t-2"));
        assert!(jar.get("missing").is_none());
    }

    #[test]
    fn filter_combines_criteria() {
        let jar = GemJar::new(vec![
            gem("a", "Code Helper", true),
            gem("b", "Code Tutor", false),
            gem("c", "Writer", false),
        ]);

        let custom: Vec<_> = jar.filter(Some(false), None).iter().map(|g| g.id.clone()).collect();
        assert_eq!(custom, vec!["b", "c"]);
        let code: Vec<_> = jar.filter(None, Some("code")).iter().map(|g| g.id.clone()).collect();
        assert_eq!(code, vec!["a", "b"]);
        assert_eq!(jar.filter(Some(true), Some("writer")).len(), 0);
    }

    #[test]
    fn fetch_populates_cache() {
        let registry = registry();
        assert!(registry.jar().is_empty());

        let jar = registry.fetch(false).expect("fetch");
        assert_eq!(jar.len(), 2);
        assert_eq!(registry.get("brainstormer").map(|g| g.id), Some("sys-1".to_owned()));
    }

    #[test]
    fn mutations_update_cache() {
        let registry = registry();
        registry.fetch(false).expect("fetch");

        let created = registry.create("Poet", "rhyme", "").expect("create");
        assert_eq!(registry.get("poet"), Some(created.clone()));

        let updated = registry
            .update(&created.id, "Poet 2", "rhyme more", "verse")
            .expect("update");
        assert_eq!(updated.description.as_deref(), Some("verse"));
        assert_eq!(registry.get(&created.id).map(|g| g.name), Some("Poet 2".to_owned()));

        registry.delete(&created.id).expect("delete");
        assert!(registry.get(&created.id).is_none());
        assert_eq!(registry.jar().len(), 2);
    }

    #[test]
    fn predefined_gems_are_immutable() {
        let registry = registry();
        registry.fetch(false).expect("fetch");

        assert_eq!(
            registry.update("sys-1", "x", "y", "z"),
            Err(ChatError::Immutable("Brainstormer".to_owned()))
        );
        assert_eq!(
            registry.delete("sys-1"),
            Err(ChatError::Immutable("Brainstormer".to_owned()))
        );
        assert!(registry.get("sys-1").is_some());
    }
}
