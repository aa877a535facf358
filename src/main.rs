//! fhir-datalayer
//!
//! Command-line access to FHIR resources stored in partitioned MongoDB
//! collections.
//!
//! # Usage
//!
//! ```bash
//! # Stream every female patient, partition by partition
//! fhir-datalayer find Patient --filter '{"gender":"female"}'
//!
//! # Which collections would an AuditEvent query read?
//! fhir-datalayer partitions AuditEvent
//! ```

use fhir_datalayer::cli::CliInterface;
use fhir_datalayer::error::{DataLayerError, Result};
use fhir_datalayer::metrics;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Application entry point
#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        if let DataLayerError::Rethrown(rethrown) = &e {
            if let Ok(details) = serde_json::to_string_pretty(&rethrown.diagnostics()) {
                eprintln!("{}", details);
            }
        }
        std::process::exit(1);
    }
}

/// Main application logic
///
/// 1. Parse command-line arguments and load configuration
/// 2. Initialize logging and metrics
/// 3. Run the subcommand
async fn run() -> Result<()> {
    let cli = CliInterface::new()?;

    initialize_logging(&cli);

    let metrics_enabled = cli.config().metrics.enabled && metrics::init_metrics();

    let result = cli.execute().await;

    if metrics_enabled {
        if let Some(rendered) = metrics::render_metrics() {
            println!("{}", rendered);
        }
    }

    result
}

/// Initialize logging from configuration; `RUST_LOG` takes precedence
///
/// # Arguments
/// * `cli` - CLI interface with the effective configuration
fn initialize_logging(cli: &CliInterface) {
    let level = cli.config().logging.level.to_tracing_level();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::from_level(level).into()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if cli.config().logging.timestamps {
        subscriber.init();
    } else {
        subscriber.without_time().init();
    }
}
