// Model registry - one gated model per collection name.

use crate::driver::DriverHandle;
use crate::gate::GatedModel;
use crate::model::{Model, ModelDefinition};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Collection name → gated model. Models share the registry's driver handle.
#[derive(Debug, Default)]
pub struct Registry {
    models: RwLock<HashMap<String, Arc<GatedModel>>>,
    handle: DriverHandle,
}

impl Registry {
    pub fn new(handle: DriverHandle) -> Self {
        Registry {
            models: RwLock::new(HashMap::new()),
            handle,
        }
    }

    /// Register a model, or return the one already registered under the same
    /// collection name. The first definition wins; a differing redefinition is
    /// logged and otherwise ignored.
    pub fn define_model(&self, definition: ModelDefinition) -> Arc<GatedModel> {
        let mut models = self.models.write();

        if let Some(existing) = models.get(&definition.collection_name) {
            if existing.definition() != &definition {
                log::warn!(
                    "Model '{}' is already defined; keeping the first definition",
                    definition.collection_name
                );
            }
            return Arc::clone(existing);
        }

        let name = definition.collection_name.clone();
        let model = Arc::new(Model::new(definition, self.handle.clone()));
        let gated = Arc::new(GatedModel::new(model));
        log::debug!(
            "Registered model '{name}' allowing [{}]",
            gated
                .allowed_operations()
                .iter()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        models.insert(name, Arc::clone(&gated));
        gated
    }

    pub fn get_model(&self, name: &str) -> Option<Arc<GatedModel>> {
        self.models.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.read().is_empty()
    }

    /// All registered models, ordered by collection name.
    pub fn models(&self) -> Vec<Arc<GatedModel>> {
        let mut models: Vec<Arc<GatedModel>> = self.models.read().values().cloned().collect();
        models.sort_by(|a, b| a.collection_name().cmp(b.collection_name()));
        models
    }

    pub fn names(&self) -> Vec<String> {
        self.models()
            .iter()
            .map(|m| m.collection_name().to_string())
            .collect()
    }
}
