pub mod config;
pub mod database;
pub mod document;
pub mod driver;
pub mod error;
pub mod gate;
pub mod id;
pub mod model;
pub mod query;
pub mod registry;
pub mod schema;
pub mod validation;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{ConfigSource, DatabaseConfig, EnvSource, ResolvedConfig};
pub use database::Database;
pub use document::Document;
pub use driver::{EmbeddedDriver, StorageDriver};
#[cfg(feature = "mongodb")]
pub use driver::MongoDriver;
pub use error::{ModelGateError, Result};
pub use gate::GatedModel;
pub use id::{IdInput, ObjectId};
pub use model::{Model, ModelDefinition, OperationKind, Operations};
pub use registry::Registry;
pub use schema::{FieldSchema, ValidationDescriptor};
