// Database - owns the connection, the model registry, and collection setup.

use crate::config::{ConfigSource, DatabaseConfig, EnvSource, ResolvedConfig};
use crate::document::Document;
use crate::driver::{self, DriverHandle, StorageDriver};
use crate::error::Result;
use crate::gate::GatedModel;
use crate::id::{IdInput, ObjectId};
use crate::model::{parse_model_file, ModelDefinition};
use crate::registry::Registry;
use serde_json::{json, Value};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

/// The entry point: resolve configuration, connect, define models and set up
/// their collections.
#[derive(Debug)]
pub struct Database {
    config: ResolvedConfig,
    handle: DriverHandle,
    registry: Registry,
}

impl Database {
    /// Resolve `config` against the process environment.
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        Self::from_sources(&config, &DatabaseConfig::default(), &EnvSource)
    }

    /// Resolve explicit settings over `source` over file settings.
    pub fn from_sources(
        explicit: &DatabaseConfig,
        file: &DatabaseConfig,
        source: &dyn ConfigSource,
    ) -> Result<Self> {
        Ok(Self::with_resolved(ResolvedConfig::resolve(explicit, file, source)?))
    }

    pub fn with_resolved(config: ResolvedConfig) -> Self {
        let handle = DriverHandle::new();
        Database {
            config,
            registry: Registry::new(handle.clone()),
            handle,
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Open the driver the configured uri addresses. Returns the database
    /// name; connecting twice is a no-op.
    pub async fn connect(&self) -> Result<String> {
        if self.is_connected() {
            return Ok(self.config.db_name.clone());
        }

        let opened = driver::open(&self.config.uri, &self.config.db_name).await?;
        self.handle.attach(opened);
        log::info!(
            "Connected to '{}' at {}",
            self.config.db_name,
            self.config.redacted_uri()
        );
        Ok(self.config.db_name.clone())
    }

    /// Use an already opened driver.
    pub fn connect_with(&self, driver: Arc<dyn StorageDriver>) {
        if self.handle.attach(driver).is_some() {
            log::debug!("Replaced the active storage driver");
        }
    }

    pub fn disconnect(&self) {
        if self.handle.detach().is_some() {
            log::info!("Disconnected from '{}'", self.config.db_name);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_attached()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn define_model(&self, definition: ModelDefinition) -> Arc<GatedModel> {
        self.registry.define_model(definition)
    }

    pub fn get_model(&self, name: &str) -> Option<Arc<GatedModel>> {
        self.registry.get_model(name)
    }

    /// Define every model of a model file.
    pub fn load_models(&self, path: &Path) -> Result<Vec<Arc<GatedModel>>> {
        Ok(parse_model_file(path)?
            .into_iter()
            .map(|definition| self.define_model(definition))
            .collect())
    }

    pub fn object_id() -> ObjectId {
        ObjectId::new()
    }

    pub fn to_object_id(id: impl Into<IdInput>) -> Result<ObjectId> {
        id.into().normalize()
    }

    /// Create, validate and index the collection of every registered model.
    pub async fn setup_collections(&self) -> Result<()> {
        for model in self.registry.models() {
            self.setup_collection(&model).await?;
        }
        Ok(())
    }

    /// Create the collection if missing, install its validator, and rebuild
    /// its indexes when the model declares any.
    pub async fn setup_collection(&self, model: &GatedModel) -> Result<()> {
        let driver = self.handle.driver()?;
        let name = model.collection_name();
        prepare_collection(driver.as_ref(), model)
            .await
            .map_err(|e| e.into_storage(name))
    }

    /// Delete every document of every non-empty collection.
    pub async fn clean_collections(&self) -> Result<()> {
        let driver = self.handle.driver()?;
        for name in driver.list_collections().await? {
            let count = driver
                .count_documents(&name, &Document::new(), &Default::default())
                .await?;
            if count == 0 {
                continue;
            }
            let result = driver
                .delete_many(&name, &Document::new(), &Default::default())
                .await?;
            log::debug!("{name}: removed {} documents", result.deleted_count);
        }
        Ok(())
    }

    /// Run `f` inside a transaction: commit when it succeeds, abort when it fails.
    pub async fn with_transaction<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let driver = self.handle.driver()?;
        driver.begin_transaction().await?;

        match f().await {
            Ok(value) => {
                driver.commit_transaction().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort) = driver.abort_transaction().await {
                    log::warn!("Failed to abort transaction: {abort}");
                }
                Err(e)
            }
        }
    }

    /// Connection, registry and driver statistics.
    pub async fn info(&self) -> Result<Value> {
        let stats = match self.handle.driver() {
            Ok(driver) => driver.stats().await?,
            Err(_) => Value::Null,
        };

        Ok(json!({
            "connected": self.is_connected(),
            "uri": self.config.redacted_uri(),
            "dbName": self.config.db_name,
            "models": self.registry.names(),
            "stats": stats,
        }))
    }
}

async fn prepare_collection(driver: &dyn StorageDriver, model: &GatedModel) -> Result<()> {
    let name = model.collection_name();

    let exists = driver.list_collections().await?.iter().any(|c| c == name);
    if !exists {
        driver.create_collection(name).await?;
        log::info!("Created collection '{name}'");
    }

    driver.set_validator(name, model.descriptor()).await?;

    if !model.indexes().is_empty() {
        driver.drop_indexes(name).await?;
        for index in model.indexes() {
            let index_name = driver.create_index(name, index).await?;
            log::debug!("{name}: created index '{index_name}'");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::IndexSpec;
    use crate::error::ModelGateError;
    use crate::model::{OperationKind, Operations};
    use crate::schema::parse_field_schema_str;
    use crate::test_support::RecordingDriver;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn doc(value: Value) -> Document {
        value.as_object().unwrap().clone()
    }

    fn database() -> Database {
        Database::from_sources(
            &DatabaseConfig::default(),
            &DatabaseConfig::default(),
            &HashMap::<String, String>::new(),
        )
        .unwrap()
    }

    fn users() -> ModelDefinition {
        let schema = parse_field_schema_str(
            "bsonType: object\nproperties:\n  username: { bsonType: string }\nrequired: [username]",
        )
        .unwrap();
        ModelDefinition::new("users", schema)
            .with_validity(true)
            .with_index(IndexSpec::new(doc(json!({ "username": 1 }))).unique())
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let db = database();
        assert!(!db.is_connected());
        assert_eq!(db.connect().await.unwrap(), "modelgate-test");
        assert_eq!(db.connect().await.unwrap(), "modelgate-test");
        assert!(db.is_connected());

        db.disconnect();
        assert!(!db.is_connected());
    }

    #[tokio::test]
    async fn test_models_follow_connection_state() {
        let db = database();
        let model = db.define_model(users());

        let err = model.total(Document::new(), Default::default()).await.unwrap_err();
        assert!(matches!(err, ModelGateError::NotConnected));

        db.connect().await.unwrap();
        assert_eq!(model.total(Document::new(), Default::default()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_define_model_is_shared_with_registry() {
        let db = database();
        let first = db.define_model(users());
        let second = db.define_model(users());
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &db.get_model("users").unwrap()));
    }

    #[tokio::test]
    async fn test_setup_collection_steps() {
        let db = database();
        let driver = Arc::new(RecordingDriver::new());
        db.connect_with(driver.clone());
        db.define_model(users());
        db.define_model(ModelDefinition::new("audit", users().schema));

        db.setup_collections().await.unwrap();
        assert_eq!(
            driver.methods(),
            vec![
                "list_collections",
                "create_collection",
                "set_validator",
                "list_collections",
                "create_collection",
                "set_validator",
                "drop_indexes",
                "create_index",
            ]
        );

        driver.clear();
        db.setup_collections().await.unwrap();
        assert!(!driver.methods().contains(&"create_collection"));
    }

    #[tokio::test]
    async fn test_setup_enforces_schema_and_indexes() {
        let db = database();
        db.connect().await.unwrap();
        let model = db.define_model(users());
        db.setup_collections().await.unwrap();

        model
            .insert(doc(json!({ "username": "alice" })), Default::default())
            .await
            .unwrap();

        let dup = model
            .insert(doc(json!({ "username": "alice" })), Default::default())
            .await
            .unwrap_err();
        assert!(matches!(dup, ModelGateError::Storage(ref cause) if cause.contains("duplicate_key")));

        let extra = model
            .insert(doc(json!({ "username": "bob", "admin": true })), Default::default())
            .await
            .unwrap_err();
        assert!(matches!(extra, ModelGateError::Storage(ref cause) if cause.contains("admin")));
    }

    #[tokio::test]
    async fn test_clean_collections() {
        let db = database();
        db.connect().await.unwrap();
        let model = db.define_model(users());
        db.setup_collections().await.unwrap();
        for name in ["a", "b"] {
            model
                .insert(doc(json!({ "username": name })), Default::default())
                .await
                .unwrap();
        }

        db.clean_collections().await.unwrap();
        assert_eq!(model.total(Document::new(), Default::default()).await.unwrap(), 0);
        assert_eq!(db.registry().names(), vec!["users"]);
    }

    #[tokio::test]
    async fn test_with_transaction_commits_and_aborts() {
        let db = database();
        db.connect().await.unwrap();
        let model = db.define_model(users());

        let m = Arc::clone(&model);
        let kept = db
            .with_transaction(move || async move {
                m.insert(doc(json!({ "username": "kept" })), Default::default())
                    .await
            })
            .await
            .unwrap();
        assert_eq!(kept["username"], "kept");

        let m = Arc::clone(&model);
        let err = db
            .with_transaction(move || async move {
                m.insert(doc(json!({ "username": "dropped" })), Default::default())
                    .await?;
                Err::<(), _>(ModelGateError::Other("abort".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ModelGateError::Other(_)));

        assert_eq!(model.total(Document::new(), Default::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_info() {
        let db = database();
        db.define_model(users());
        let offline = db.info().await.unwrap();
        assert_eq!(offline["connected"], false);
        assert_eq!(offline["stats"], Value::Null);

        db.connect().await.unwrap();
        let online = db.info().await.unwrap();
        assert_eq!(online["dbName"], "modelgate-test");
        assert_eq!(online["models"], json!(["users"]));
        assert_eq!(online["stats"]["objects"], 0);
    }

    #[tokio::test]
    async fn test_load_models_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("models.yaml");
        std::fs::write(
            &path,
            "models:\n  - collectionName: notes\n    allowedOperations: [insert, findMany]\n    schema: { bsonType: object }\n",
        )
        .unwrap();

        let db = database();
        let models = db.load_models(&path).unwrap();
        assert_eq!(models.len(), 1);
        assert!(models[0].is_allowed(OperationKind::FindMany));
        assert!(!models[0].is_allowed(OperationKind::Find));
    }

    #[test]
    fn test_object_id_helpers() {
        let id = Database::object_id();
        assert_eq!(Database::to_object_id(id.to_hex()).unwrap(), id);
        assert!(Database::to_object_id("xyz").is_err());
    }
}
