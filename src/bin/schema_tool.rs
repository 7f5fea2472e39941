//! `schema-tool` — the schema-management command surface (spec §6.4). A
//! thin binary over the library's `SchemaStore` + `InferenceEngine` +
//! `sample::mongo_sample`: it owns none of the hard-core logic, only
//! argument parsing, connection setup, and result formatting, the way
//! `examples/ConaryLabs-conary`'s `clap`-derived `main.rs` wraps its own
//! library crate.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgGroup, Parser};
use mongodb::bson::Document;
use mongodb::options::ClientOptions;
use mongodb::Client;
use serde::{Deserialize, Serialize};

use docrel::error::EngineError;
use docrel::inference::InferenceEngine;
use docrel::sample::VecDocumentSource;
use docrel::store::{ColumnRow, FileSchemaStore, MongoSchemaStore, SchemaStore, TableSchemaRow};
use docrel::types::{DatabaseSchema, SchemaVersion, TableId, TableSchema};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "schema-tool", author, version, about = "Inspect and manage docrel schema snapshots")]
#[command(group(ArgGroup::new("action").required(true).args(["generate_new", "remove", "list", "export", "import"])))]
struct Cli {
    #[arg(long)]
    server: String,
    #[arg(long)]
    database: String,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    tls: bool,
    #[arg(long)]
    tls_allow_invalid_hostnames: bool,

    #[arg(long, default_value = "_default")]
    schema_name: String,
    #[arg(long, default_value = "random")]
    scan_method: String,
    #[arg(long)]
    scan_limit: Option<u64>,
    #[arg(long)]
    output: Option<PathBuf>,

    /// Use a local JSON file store instead of the remote document store,
    /// rooted at the given directory (spec §4.D "File-backed variant").
    #[arg(long)]
    local_data_dir: Option<PathBuf>,

    #[arg(long)]
    generate_new: bool,
    #[arg(long)]
    remove: bool,
    #[arg(long)]
    list: bool,
    #[arg(long, num_args = 0.., value_name = "TABLE")]
    export: Option<Vec<String>>,
    #[arg(long, value_name = "FILE")]
    import: Option<PathBuf>,
}

#[derive(Serialize, Deserialize)]
struct SchemaExport {
    schema: DatabaseSchema,
    table_schemas: Vec<TableSchemaRow>,
}

fn exit_code_for(err: &EngineError) -> ExitCode {
    match err {
        EngineError::SchemaSecurity { .. } | EngineError::AuthenticationError { .. } => ExitCode::from(2),
        EngineError::InvalidConnectionProperties { .. } | EngineError::SchemaNotFound { .. } | EngineError::UnsupportedFeature { .. } => {
            ExitCode::from(1)
        }
        _ => ExitCode::from(3),
    }
}

async fn open_store(cli: &Cli) -> Result<Box<dyn SchemaStore>, EngineError> {
    if let Some(dir) = &cli.local_data_dir {
        return Ok(Box::new(FileSchemaStore::new(dir.clone(), cli.database.clone())));
    }

    let mut connection_string = String::from("mongodb://");
    if let Some(user) = &cli.user {
        connection_string.push_str(user);
        if let Some(password) = &cli.password {
            connection_string.push(':');
            connection_string.push_str(password);
        }
        connection_string.push('@');
    }
    connection_string.push_str(&cli.server);
    connection_string.push('/');
    connection_string.push_str(&cli.database);
    if cli.tls {
        connection_string.push_str("?tls=true");
        if cli.tls_allow_invalid_hostnames {
            connection_string.push_str("&tlsAllowInvalidHostnames=true");
        }
    }

    let options = ClientOptions::parse(&connection_string)
        .await
        .map_err(|e| EngineError::invalid_connection_properties(e.to_string()))?;
    let client = Client::with_options(options).map_err(|e| EngineError::connection_error(e.to_string()))?;
    Ok(Box::new(MongoSchemaStore::new(client, cli.database.clone())))
}

fn scan_method_of(name: &str) -> Result<docrel::connection_url::ScanMethod, EngineError> {
    use docrel::connection_url::ScanMethod;
    match name {
        "random" => Ok(ScanMethod::Random),
        "idForward" => Ok(ScanMethod::IdForward),
        "idReverse" => Ok(ScanMethod::IdReverse),
        "all" => Ok(ScanMethod::All),
        other => Err(EngineError::invalid_connection_properties(format!("unknown scan method '{other}'"))),
    }
}

async fn generate_new(cli: &Cli, store: &dyn SchemaStore) -> Result<(), EngineError> {
    let connection_string = format!("mongodb://{}", cli.server);
    let options = ClientOptions::parse(&connection_string)
        .await
        .map_err(|e| EngineError::invalid_connection_properties(e.to_string()))?;
    let client = Client::with_options(options).map_err(|e| EngineError::connection_error(e.to_string()))?;
    let db = client.database(&cli.database);
    let method = scan_method_of(&cli.scan_method)?;

    let collection_names = db.list_collection_names().await.map_err(|e| EngineError::connection_error(e.to_string()))?;

    let mut all_tables = Vec::new();
    for name in &collection_names {
        let collection = db.collection::<Document>(name);
        #[cfg(feature = "mongo-sample")]
        let documents = docrel::sample::mongo_sample(&collection, method, cli.scan_limit).await?;
        #[cfg(not(feature = "mongo-sample"))]
        let documents = {
            let _ = (&collection, method);
            Vec::new()
        };

        let source = VecDocumentSource::new(documents);
        let tables = InferenceEngine::new().infer(name, source)?;
        all_tables.extend(tables.into_values());
    }

    let schema = DatabaseSchema {
        schema_name: cli.schema_name.clone(),
        schema_version: SchemaVersion::INITIAL,
        sql_name: cli.database.clone(),
        modify_date: chrono::Utc::now(),
        table_references: all_tables.iter().map(|t| t.id).collect(),
    };

    store.write(schema, all_tables).await?;
    println!("Generated schema '{}' for database '{}'", cli.schema_name, cli.database);
    Ok(())
}

async fn run(cli: Cli) -> Result<(), EngineError> {
    let store = open_store(&cli).await?;

    if cli.generate_new {
        return generate_new(&cli, store.as_ref()).await;
    }
    if cli.remove {
        store.remove(&cli.schema_name).await?;
        println!("Removed schema '{}'", cli.schema_name);
        return Ok(());
    }
    if cli.list {
        let schemas = store.list().await?;
        if schemas.is_empty() {
            println!("No schemas found");
        }
        for schema in schemas {
            println!("{} v{} ({} tables)", schema.schema_name, schema.schema_version.0, schema.table_references.len());
        }
        return Ok(());
    }
    if let Some(tables) = &cli.export {
        let schema = store
            .read(&cli.schema_name)
            .await?
            .ok_or_else(|| EngineError::schema_not_found(cli.schema_name.clone(), 0))?;
        let mut table_schemas = store.read_tables(&cli.schema_name, schema.schema_version, &schema.table_references).await?;
        if !tables.is_empty() {
            table_schemas.retain(|t| tables.contains(&t.sql_name));
        }
        let export = SchemaExport {
            schema,
            table_schemas: table_schemas.iter().map(TableSchemaRow::from).collect(),
        };
        let json = serde_json::to_string_pretty(&export).map_err(|e| EngineError::internal(e.to_string()))?;
        match &cli.output {
            Some(path) => std::fs::write(path, json).map_err(|e| EngineError::internal(e.to_string()))?,
            None => {
                let mut stdout = std::io::stdout();
                let _ = stdout.write_all(json.as_bytes());
                let _ = stdout.write_all(b"\n");
            }
        }
        return Ok(());
    }
    if let Some(path) = &cli.import {
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::invalid_connection_properties(e.to_string()))?;
        let export: SchemaExport = serde_json::from_str(&content).map_err(|e| EngineError::invalid_connection_properties(e.to_string()))?;
        let tables: Vec<TableSchema> =
            export.table_schemas.into_iter().map(TableSchema::try_from).collect::<Result<_, _>>()?;
        store.write(export.schema, tables).await?;
        println!("Imported schema from {}", path.display());
        return Ok(());
    }

    unreachable!("clap's ArgGroup guarantees exactly one action flag is set")
}

#[tokio::main]
async fn main() -> ExitCode {
    docrel::observability::init_tracing();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            exit_code_for(&err)
        }
    }
}
