//! Command-line interface for the data layer
//!
//! This module handles:
//! - Command-line argument parsing using clap
//! - Configuration loading, validation and overrides
//! - Running partitioned reads against a live server
//! - Connection string sanitizing for display

use bson::{Bson, Document};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::config::{Config, LogLevel};
use crate::connection::DatabaseManager;
use crate::cursor::PartitionedCursor;
use crate::cursor::mongo::CursorOptions;
use crate::error::{ConnectionError, DataLayerError, Result, ValidationError};
use crate::locator::{PartitioningManager, QueryManager, ResourceLocator};
use crate::resource::{FHIR_R4, ResourceFactory};

/// Partitioned FHIR data layer
#[derive(Parser, Debug)]
#[command(
    name = "fhir-datalayer",
    version,
    about = "Query FHIR resources stored across partitioned MongoDB collections",
    long_about = "Reads FHIR resources through the partitioned cursor, so a resource type spread over
several collections is queried as one."
)]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    pub config_file: Option<PathBuf>,

    /// MongoDB connection URI
    ///
    /// Format: mongodb://[username:password@]host[:port][/database][?options]
    #[arg(long, value_name = "URI", global = true)]
    pub uri: Option<String>,

    /// Database holding clinical resources
    #[arg(long, value_name = "NAME", global = true)]
    pub database: Option<String>,

    /// FHIR base version
    #[arg(long, value_name = "VERSION", default_value = FHIR_R4, global = true)]
    pub base_version: String,

    /// Quiet mode (errors only)
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose mode (detailed logging)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Very verbose mode (trace logging)
    #[arg(long = "vv", global = true)]
    pub very_verbose: bool,

    /// Print Prometheus metrics after the command
    #[arg(long, global = true)]
    pub metrics: bool,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Find resources across every partition
    Find {
        /// Resource type, e.g. Patient
        #[arg(value_name = "RESOURCE_TYPE")]
        resource_type: String,

        /// Filter as JSON
        #[arg(long, value_name = "JSON")]
        filter: Option<String>,

        /// Sort as JSON, applied within each partition
        #[arg(long, value_name = "JSON")]
        sort: Option<String>,

        /// Projection as JSON
        #[arg(long, value_name = "JSON")]
        projection: Option<String>,

        /// Limit per partition
        #[arg(long, value_name = "N")]
        limit: Option<i64>,

        /// Documents per round trip
        #[arg(long, value_name = "N")]
        batch_size: Option<u32>,

        /// Server-side time limit per partition
        #[arg(long, value_name = "MS")]
        max_time_ms: Option<u64>,

        /// Read history collections instead
        #[arg(long)]
        history: bool,

        /// Print stored documents without building resources
        #[arg(long)]
        raw: bool,
    },

    /// Show the query plan of the first partition
    Explain {
        #[arg(value_name = "RESOURCE_TYPE")]
        resource_type: String,

        /// Filter as JSON
        #[arg(long, value_name = "JSON")]
        filter: Option<String>,
    },

    /// Count matching resources across partitions
    Count {
        #[arg(value_name = "RESOURCE_TYPE")]
        resource_type: String,

        /// Filter as JSON
        #[arg(long, value_name = "JSON")]
        filter: Option<String>,

        /// Use collection metadata instead of an exact count
        #[arg(long)]
        estimated: bool,
    },

    /// List the partitions a query would read
    Partitions {
        #[arg(value_name = "RESOURCE_TYPE")]
        resource_type: String,

        /// Filter as JSON
        #[arg(long, value_name = "JSON")]
        filter: Option<String>,
    },

    /// Check that the server answers a ping
    Ping,

    /// Show configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Validate configuration file
        #[arg(long)]
        validate: bool,
    },
}

/// CLI interface handler
pub struct CliInterface {
    /// Parsed command-line arguments
    args: CliArgs,

    /// Loaded configuration
    config: Config,
}

impl CliInterface {
    /// Create a new CLI interface
    ///
    /// # Returns
    /// * `Result<Self>` - New CLI interface or error
    pub fn new() -> Result<Self> {
        let args = CliArgs::parse();
        let config = Self::load_config(&args)?;

        Ok(Self { args, config })
    }

    /// Load configuration from file and environment, then apply arguments
    ///
    /// The merged result must validate; an invalid file or variable is an
    /// error rather than a silent fallback to defaults.
    fn load_config(args: &CliArgs) -> Result<Config> {
        let mut config = Config::load(args.config_file.as_deref())?;
        Self::apply_args_to_config(&mut config, args);
        config.validate()?;
        Ok(config)
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Apply CLI arguments to configuration
    fn apply_args_to_config(config: &mut Config, args: &CliArgs) {
        if let Some(uri) = &args.uri {
            config.connection.uri = uri.clone();
        }
        if let Some(database) = &args.database {
            config.connection.db_name = database.clone();
        }
        if args.metrics {
            config.metrics.enabled = true;
        }

        config.logging.level = if args.very_verbose {
            LogLevel::Trace
        } else if args.verbose {
            LogLevel::Debug
        } else if args.quiet {
            LogLevel::Error
        } else {
            config.logging.level
        };
    }

    /// Sanitize URI by hiding credentials
    fn sanitize_uri(uri: &str) -> String {
        if let Some(proto_end) = uri.find("://") {
            if let Some(host_start) = uri.rfind('@') {
                let proto = &uri[..proto_end + 3];
                let host = &uri[host_start..];
                return format!("{}***{}", proto, host);
            }
        }
        uri.to_string()
    }

    /// Run the selected subcommand
    ///
    /// Commands that read data connect first and disconnect once they are
    /// done, whether or not they succeeded.
    ///
    /// # Returns
    /// * `Result<()>` - Success or the first error raised
    pub async fn execute(&self) -> Result<()> {
        let resource_type = match &self.args.command {
            Commands::Config { show, validate } => {
                return self.handle_config_command(*show, *validate);
            }
            Commands::Ping => return self.ping().await,
            Commands::Find { resource_type, .. }
            | Commands::Explain { resource_type, .. }
            | Commands::Count { resource_type, .. }
            | Commands::Partitions { resource_type, .. } => resource_type,
        };

        let (queries, databases) = self.query_manager(resource_type).await?;
        let result = self.run_query(&queries, &databases).await;
        drop(queries);
        let closed = Self::disconnect(databases).await;
        result.and(closed)
    }

    /// Run a data command against an open connection
    async fn run_query(&self, queries: &QueryManager, databases: &DatabaseManager) -> Result<()> {
        match &self.args.command {
            Commands::Find {
                filter,
                sort,
                projection,
                limit,
                batch_size,
                max_time_ms,
                history,
                raw,
                ..
            } => {
                let filter = parse_json_document(filter.as_deref(), "filter")?;
                let options = CursorOptions {
                    projection: parse_optional_document(projection.as_deref(), "projection")?,
                    sort: parse_optional_document(sort.as_deref(), "sort")?,
                    limit: *limit,
                    batch_size: *batch_size,
                    hint: None,
                    max_time_ms: *max_time_ms,
                };

                let mut cursor = if *history {
                    queries.find_history(filter, options).await?
                } else {
                    queries.find(filter, options).await?
                };
                self.print_cursor(&mut cursor, *raw).await
            }
            Commands::Explain { filter, .. } => {
                let filter = parse_json_document(filter.as_deref(), "filter")?;
                let mut cursor = queries.find(filter, CursorOptions::default()).await?;
                for plan in cursor.explain().await? {
                    println!("{}", to_json_pretty(plan)?);
                }
                Ok(())
            }
            Commands::Count {
                filter, estimated, ..
            } => {
                let filter = parse_json_document(filter.as_deref(), "filter")?;
                let count = if *estimated {
                    queries.estimated_document_count().await?
                } else {
                    queries.exact_document_count(filter).await?
                };
                println!("{count}");
                Ok(())
            }
            Commands::Partitions {
                resource_type,
                filter,
            } => {
                let filter = parse_json_document(filter.as_deref(), "filter")?;
                let locator = queries.locator();
                println!(
                    "database: {}",
                    databases.database_name_for_resource(resource_type)
                );
                for name in locator.collection_names_for_query(&filter).await? {
                    println!("{name}");
                }
                for name in locator.history_collection_names_for_query(&filter).await? {
                    println!("{name}");
                }
                Ok(())
            }
            // Answered without a query manager
            Commands::Config { .. } | Commands::Ping => Ok(()),
        }
    }

    /// Connect, ping once and report the round trip
    async fn ping(&self) -> Result<()> {
        let databases = Arc::new(self.connect().await?);
        let health = databases.health_check().await;
        let closed = Self::disconnect(databases).await;

        let health = health?;
        println!("{health}");
        closed?;
        if health.is_healthy {
            Ok(())
        } else {
            Err(ConnectionError::PingFailed(health.diagnostics.unwrap_or_default()).into())
        }
    }

    async fn connect(&self) -> Result<DatabaseManager> {
        if !self.args.quiet {
            eprintln!(
                "Connecting to: {}",
                Self::sanitize_uri(&self.config.connection.uri)
            );
        }

        let mut databases = DatabaseManager::new(self.config.connection.clone());
        databases.connect().await?;
        Ok(databases)
    }

    /// Close the connection once every other handle on it is gone
    async fn disconnect(databases: Arc<DatabaseManager>) -> Result<()> {
        match Arc::try_unwrap(databases) {
            Ok(mut databases) => databases.disconnect().await,
            Err(_) => {
                debug!("Connection still shared; leaving it open");
                Ok(())
            }
        }
    }

    /// Connect and build the query manager for a resource type
    async fn query_manager(&self, resource_type: &str) -> Result<(QueryManager, Arc<DatabaseManager>)> {
        let databases = Arc::new(self.connect().await?);

        let partitioning = Arc::new(PartitioningManager::new(
            &self.config.partitioning,
            Arc::clone(&databases),
        ));
        let locator = ResourceLocator::new(
            resource_type,
            self.args.base_version.as_str(),
            partitioning,
            Arc::clone(&databases),
        )?;

        Ok((
            QueryManager::new(
                locator,
                Arc::new(ResourceFactory::with_fhir_r4()),
                self.config.query.clone(),
            ),
            databases,
        ))
    }

    /// Print every remaining document, one JSON object per line
    async fn print_cursor(&self, cursor: &mut PartitionedCursor, raw: bool) -> Result<()> {
        let mut count = 0usize;
        while cursor.has_next().await? {
            let line = if raw {
                match cursor.next_document().await? {
                    Some(document) => to_json(document)?,
                    None => break,
                }
            } else {
                match cursor.next().await? {
                    Some(resource) => to_json(resource.to_document()?)?,
                    None => break,
                }
            };
            println!("{line}");
            count += 1;
        }

        if !self.args.quiet {
            eprintln!("{count} document(s)");
        }
        Ok(())
    }

    /// Handle config subcommand
    fn handle_config_command(&self, show: bool, validate: bool) -> Result<()> {
        if validate {
            self.validate_config_file();
        }

        if show {
            self.show_config()?;
        }

        Ok(())
    }

    /// Validate configuration file
    fn validate_config_file(&self) {
        let path = self.get_config_path();
        println!("Validating configuration file: {}", path.display());

        if !path.exists() {
            println!("Configuration file does not exist");
            return;
        }

        match Config::from_file(&path) {
            Ok(config) => match config.validate() {
                Ok(_) => println!("Configuration is valid"),
                Err(e) => println!("Configuration validation failed: {}", e),
            },
            Err(e) => println!("Failed to load configuration: {}", e),
        }
    }

    /// Show effective configuration
    fn show_config(&self) -> Result<()> {
        let path = self.get_config_path();
        println!("# Configuration file: {}", path.display());
        println!();

        let mut shown = self.config.clone();
        shown.connection.uri = Self::sanitize_uri(&shown.connection.uri);
        let toml_str = toml::to_string_pretty(&shown)
            .map_err(|e| DataLayerError::Generic(format!("Error formatting configuration: {e}")))?;
        println!("{}", toml_str);
        Ok(())
    }

    /// Get configuration file path (from args or default)
    fn get_config_path(&self) -> PathBuf {
        self.args
            .config_file
            .clone()
            .unwrap_or_else(Config::default_path)
    }
}

/// Parse a JSON argument into a document; absent means `{}`
///
/// Extended JSON such as `{"$date": "..."}` is accepted.
pub fn parse_json_document(json: Option<&str>, field: &'static str) -> Result<Document> {
    Ok(parse_optional_document(json, field)?.unwrap_or_default())
}

fn parse_optional_document(json: Option<&str>, field: &'static str) -> Result<Option<Document>> {
    let Some(json) = json else {
        return Ok(None);
    };

    let invalid = || ValidationError::Invalid {
        field,
        value: json.to_string(),
    };
    let value: serde_json::Value = serde_json::from_str(json).map_err(|_| invalid())?;
    match Bson::try_from(value).map_err(|_| invalid())? {
        Bson::Document(document) => Ok(Some(document)),
        _ => Err(invalid().into()),
    }
}

fn to_json(document: Document) -> Result<String> {
    serde_json::to_string(&Bson::Document(document).into_relaxed_extjson())
        .map_err(|e| DataLayerError::Generic(e.to_string()))
}

fn to_json_pretty(document: Document) -> Result<String> {
    serde_json::to_string_pretty(&Bson::Document(document).into_relaxed_extjson())
        .map_err(|e| DataLayerError::Generic(e.to_string()))
}
