use clap::{Parser, Subcommand, ValueEnum};
use modelgate::driver::FindOptions;
use modelgate::{
    Database, DatabaseConfig, Document, EnvSource, GatedModel, ModelGateError, Operations,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

/// modelgate CLI: run gated model operations against a document store
#[derive(Parser)]
#[command(name = "modelgate", version, about)]
struct Cli {
    /// Model definition file (`models: [...]`)
    #[arg(long, default_value = "models.yaml")]
    models: PathBuf,

    /// Connection settings file (uri, username, password, dbName)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Connection string, e.g. embedded://./data (overrides MODELGATE_URI)
    #[arg(long)]
    uri: Option<String>,

    /// Database name (overrides MODELGATE_DB_NAME)
    #[arg(long)]
    db_name: Option<String>,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Print the validation descriptor built for a collection
    Validator {
        /// Collection name
        collection: String,
    },

    /// Create collections, install validators and build indexes
    Setup,

    /// Insert a document
    Insert {
        /// Collection name
        collection: String,
        /// Field values (e.g. --field username=alice)
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
        /// Whole document as JSON
        #[arg(long, value_parser = parse_document)]
        doc: Option<Document>,
    },

    /// Find documents matching a filter
    Find {
        /// Collection name
        collection: String,
        /// Filter as JSON (default: all documents)
        #[arg(long, value_parser = parse_document)]
        filter: Option<Document>,
        /// Sort as JSON, e.g. '{"age": -1}'
        #[arg(long, value_parser = parse_document)]
        sort: Option<Document>,
        #[arg(long)]
        skip: Option<u64>,
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Get a single document by ID
    FindById {
        /// Collection name
        collection: String,
        /// Document ID (24 hex characters)
        id: String,
    },

    /// Update the first document matching a filter
    Update {
        /// Collection name
        collection: String,
        /// Filter as JSON
        #[arg(long, value_parser = parse_document)]
        filter: Document,
        /// Fields to $set (e.g. --set role=admin)
        #[arg(long = "set", value_parser = parse_key_value)]
        set: Vec<(String, String)>,
        /// Full update document as JSON
        #[arg(long, value_parser = parse_document)]
        update: Option<Document>,
    },

    /// Delete the first document matching a filter
    Delete {
        /// Collection name
        collection: String,
        /// Filter as JSON
        #[arg(long, value_parser = parse_document)]
        filter: Document,
        /// Show what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Count documents matching a filter
    Total {
        /// Collection name
        collection: String,
        #[arg(long, value_parser = parse_document)]
        filter: Option<Document>,
    },

    /// Run an aggregation pipeline
    Aggregate {
        /// Collection name
        collection: String,
        /// Pipeline as a JSON array of stages
        #[arg(long)]
        pipeline: String,
    },

    /// Show connection info, registered models and store statistics
    Status,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn parse_document(s: &str) -> Result<Document, String> {
    match serde_json::from_str(s) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(format!("Expected a JSON object, got '{s}'")),
        Err(e) => Err(format!("Invalid JSON '{s}': {e}")),
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        // Machine-readable error on stderr
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let file_config = match &cli.config {
        Some(path) => DatabaseConfig::from_yaml_file(path)?,
        None => DatabaseConfig::default(),
    };
    let explicit = DatabaseConfig {
        uri: cli.uri.clone(),
        db_name: cli.db_name.clone(),
        ..Default::default()
    };
    let db = Database::from_sources(&explicit, &file_config, &EnvSource)?;
    db.load_models(&cli.models)?;

    let output = match cli.command {
        Command::Validator { collection } => {
            let model = model(&db, &collection)?;
            model.descriptor().to_value()
        }

        Command::Setup => {
            db.connect().await?;
            db.setup_collections().await?;
            json!({ "ok": true, "collections": db.registry().names() })
        }

        Command::Insert {
            collection,
            fields,
            doc,
        } => {
            let model = connected(&db, &collection).await?;
            let mut document = doc.unwrap_or_default();
            document.extend(fields_to_document(&fields));
            Value::Object(model.insert(document, Default::default()).await?)
        }

        Command::Find {
            collection,
            filter,
            sort,
            skip,
            limit,
        } => {
            let model = connected(&db, &collection).await?;
            let options = FindOptions {
                sort,
                skip,
                limit,
                projection: None,
            };
            let docs = model.find_many(filter.unwrap_or_default(), options).await?;
            Value::Array(docs.into_iter().map(Value::Object).collect())
        }

        Command::FindById { collection, id } => {
            let model = connected(&db, &collection).await?;
            let doc = model.find_by_id(id.into(), Default::default()).await?;
            doc.map(Value::Object).unwrap_or(Value::Null)
        }

        Command::Update {
            collection,
            filter,
            set,
            update,
        } => {
            let model = connected(&db, &collection).await?;
            let mut update = update.unwrap_or_default();
            if !set.is_empty() {
                update.insert("$set".into(), Value::Object(fields_to_document(&set)));
            }
            let doc = model.update(filter, update, Default::default()).await?;
            doc.map(Value::Object).unwrap_or(Value::Null)
        }

        Command::Delete {
            collection,
            filter,
            dry_run,
        } => {
            let model = connected(&db, &collection).await?;
            if dry_run {
                let doc = model.find(filter, Default::default()).await?;
                json!({
                    "dry_run": true,
                    "would_delete": doc.map(Value::Object).unwrap_or(Value::Null),
                })
            } else {
                let doc = model.delete(filter, Default::default()).await?;
                json!({ "ok": true, "deleted": doc.map(Value::Object).unwrap_or(Value::Null) })
            }
        }

        Command::Total { collection, filter } => {
            let model = connected(&db, &collection).await?;
            let total = model.total(filter.unwrap_or_default(), Default::default()).await?;
            json!({ "total": total })
        }

        Command::Aggregate {
            collection,
            pipeline,
        } => {
            let model = connected(&db, &collection).await?;
            let stages: Vec<Document> = serde_json::from_str(&pipeline)
                .map_err(|e| format!("Pipeline must be a JSON array of stage documents: {e}"))?;
            let docs = model.aggregate(stages, Default::default()).await?;
            Value::Array(docs.into_iter().map(Value::Object).collect())
        }

        Command::Status => {
            db.connect().await?;
            db.info().await?
        }
    };

    print_output(&output, &cli.format)
}

fn model(db: &Database, collection: &str) -> Result<Arc<GatedModel>, ModelGateError> {
    db.get_model(collection).ok_or_else(|| {
        ModelGateError::Schema(format!(
            "No model for collection '{collection}'. Defined: {}",
            db.registry().names().join(", ")
        ))
    })
}

/// Connect and make sure the collection carries its validator and indexes.
async fn connected(db: &Database, collection: &str) -> Result<Arc<GatedModel>, ModelGateError> {
    let model = model(db, collection)?;
    db.connect().await?;
    db.setup_collection(&model).await?;
    Ok(model)
}

fn print_output(value: &Value, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

fn fields_to_document(fields: &[(String, String)]) -> Document {
    let mut map = Document::new();
    for (key, val) in fields {
        // Try to parse as JSON value (for numbers, booleans, arrays, objects)
        let json_val = serde_json::from_str(val).unwrap_or(Value::String(val.clone()));
        map.insert(key.clone(), json_val);
    }
    map
}
