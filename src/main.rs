//! Contract Mock - CLI Entry Point

use anyhow::{Context, Result};
use clap::Parser;
use contract_mock::config::DocumentFormat;
use contract_mock::model::{Header, OperationsHeaders, ServiceType};
use contract_mock::{
    import_document, EngineConfig, HttpTransport, InMemoryServiceStore, RunnerRegistry, ServiceRepository,
    TestExecutor, TestRequest,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "contract-mock",
    about = "API virtualization and contract testing - import specs, dispatch mocks, replay tests",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "contract-mock.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    /// AsyncAPI or OpenAPI document to import
    #[arg(short, long, value_name = "SPEC")]
    import: Option<PathBuf>,

    /// Replay the imported requests against this endpoint
    #[arg(short = 't', long, value_name = "URL", requires = "import")]
    test_endpoint: Option<String>,

    /// Only test this operation (repeatable)
    #[arg(long = "operation", value_name = "NAME")]
    operations: Vec<String>,

    /// Header added to every test request (repeatable)
    #[arg(long = "header", value_name = "NAME=VALUE", value_parser = parse_header)]
    headers: Vec<Header>,
}

fn parse_header(raw: &str) -> Result<Header, String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => Ok(Header::from_csv(name.trim(), value)),
        _ => Err(format!("expected NAME=VALUE, got '{}'", raw)),
    }
}

fn declared_format(path: &Path) -> Option<DocumentFormat> {
    match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
        "json" => Some(DocumentFormat::Json),
        "yaml" | "yml" => Some(DocumentFormat::Yaml),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Print default config if requested
    if args.print_config {
        let default_config = include_str!("../config/default-config.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    // Load configuration
    let config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        EngineConfig::from_file(&args.config)?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration");
        EngineConfig::default()
    };

    if args.validate {
        config.validate()?;
        println!("Configuration is valid");
        return Ok(());
    }

    let Some(spec_path) = args.import else {
        anyhow::bail!("Nothing to do: pass --import <SPEC> (see --help)");
    };

    let content = tokio::fs::read(&spec_path)
        .await
        .with_context(|| format!("reading {}", spec_path.display()))?;
    let outcome = import_document(&content, declared_format(&spec_path), &config.importer)?;
    for warning in &outcome.warnings {
        warn!(unit = %warning.unit, reason = %warning.reason, "Import warning");
    }

    let Some(endpoint) = args.test_endpoint else {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    };

    let store = Arc::new(InMemoryServiceStore::new());
    let mut keys = Vec::new();
    for service in outcome.services {
        if service.service_type == ServiceType::Event {
            warn!(service = %service.key(), "Event services cannot be tested, skipping");
            continue;
        }
        keys.push(service.key());
        store.publish(service).await;
    }

    let transport = HttpTransport::new(&config.runner)?;
    let executor = TestExecutor::new(store, RunnerRegistry::new(Arc::new(transport)), config.runner.clone());
    let headers = OperationsHeaders {
        globals: args.headers,
        ..OperationsHeaders::default()
    };

    let mut results = Vec::new();
    for key in keys {
        let request = TestRequest {
            id: format!("{}:{}", key.name, key.version),
            service: key,
            endpoint: endpoint.clone(),
            operations: args.operations.clone(),
            headers: headers.clone(),
        };
        results.push(executor.launch(request).await?);
    }

    println!("{}", serde_json::to_string_pretty(&results)?);

    if results.iter().any(|r| !r.success) {
        anyhow::bail!("Contract test failed");
    }
    Ok(())
}
