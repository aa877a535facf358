//! Connection management for MongoDB
//!
//! This module provides:
//! - Client construction from the configured URI and pool settings
//! - A ping on connect so a bad URI fails at startup
//! - Database routing: audit events are kept apart from clinical resources

use mongodb::{Client, Database, bson::doc, options::ClientOptions};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, Result};
use crate::resource::AUDIT_EVENT;

/// MongoDB connection manager
///
/// Owns the client shared by every partition cursor and knows which
/// database each resource type is stored in.
pub struct DatabaseManager {
    /// MongoDB client instance
    client: Option<Client>,

    /// Connection configuration
    config: ConnectionConfig,

    /// Current connection state
    state: Arc<RwLock<ConnectionState>>,
}

/// Connection state information
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,

    /// Currently connecting
    Connecting,

    /// Connected and ready
    Connected,

    /// Connection failed
    Failed(String),
}

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool
    pub max_size: u32,

    /// Minimum number of idle connections
    pub min_idle: u32,

    /// Connection timeout duration
    pub connection_timeout: Duration,

    /// Server selection timeout duration
    pub server_selection_timeout: Duration,

    /// Idle connection timeout duration
    pub idle_timeout: Duration,
}

/// Health check result
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Whether the connection is healthy
    pub is_healthy: bool,

    /// Response time in milliseconds
    pub response_time_ms: u64,

    /// Additional diagnostic information
    pub diagnostics: Option<String>,
}

impl DatabaseManager {
    /// Create a new, unconnected manager
    ///
    /// # Arguments
    /// * `config` - Connection configuration
    ///
    /// # Returns
    /// * `Self` - New database manager instance
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            client: None,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
        }
    }

    /// Establish connection to MongoDB
    ///
    /// Builds the client and pings `admin`; the manager is only marked
    /// connected once the ping succeeds.
    ///
    /// # Returns
    /// * `Result<()>` - Success or connection error
    pub async fn connect(&mut self) -> Result<()> {
        self.set_state(ConnectionState::Connecting).await;

        match self.open_client().await {
            Ok(client) => {
                self.client = Some(client);
                self.set_state(ConnectionState::Connected).await;
                info!(
                    db = %self.config.db_name,
                    audit_db = %self.config.audit_db_name,
                    "Connected to MongoDB"
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Failed(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Disconnect from MongoDB
    ///
    /// Waits for in-flight operations to finish and closes the pool.
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            client.shutdown().await;
            debug!("Disconnected from MongoDB");
        }
        self.set_state(ConnectionState::Disconnected).await;
        Ok(())
    }

    /// Ping the server and time the round trip
    ///
    /// # Returns
    /// * `Result<HealthStatus>` - Health check results, or error when not connected
    pub async fn health_check(&self) -> Result<HealthStatus> {
        let client = self.client()?;
        let started = Instant::now();
        let result = client.database("admin").run_command(doc! { "ping": 1 }).await;
        let response_time_ms = started.elapsed().as_millis() as u64;

        Ok(match result {
            Ok(_) => HealthStatus {
                is_healthy: true,
                response_time_ms,
                diagnostics: None,
            },
            Err(e) => HealthStatus {
                is_healthy: false,
                response_time_ms,
                diagnostics: Some(e.to_string()),
            },
        })
    }

    /// Get the MongoDB client
    ///
    /// # Returns
    /// * `Result<&Client>` - Reference to client, or `NotConnected`
    pub fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| ConnectionError::NotConnected.into())
    }

    /// Database holding clinical resources
    pub fn client_db(&self) -> Result<Database> {
        Ok(self.client()?.database(&self.config.db_name))
    }

    /// Database holding audit events
    pub fn audit_db(&self) -> Result<Database> {
        Ok(self.client()?.database(&self.config.audit_db_name))
    }

    /// Database a resource type is stored in
    ///
    /// # Arguments
    /// * `resource_type` - Resource type, e.g. `AuditEvent`
    ///
    /// # Returns
    /// * `Result<Database>` - Audit database for audit events, client database otherwise
    pub fn database_for_resource(&self, resource_type: &str) -> Result<Database> {
        Ok(self
            .client()?
            .database(self.database_name_for_resource(resource_type)))
    }

    /// Name of the database a resource type is stored in
    pub fn database_name_for_resource(&self, resource_type: &str) -> &str {
        if resource_type == AUDIT_EVENT {
            &self.config.audit_db_name
        } else {
            &self.config.db_name
        }
    }

    /// Get current connection state
    pub async fn get_state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    /// Check if currently connected
    pub async fn is_connected(&self) -> bool {
        matches!(*self.state.read().await, ConnectionState::Connected)
    }

    async fn open_client(&self) -> Result<Client> {
        let options = Self::parse_uri(&self.config.uri).await?;
        let options = self.configure_pool(options);

        let client = Client::with_options(options)
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;

        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| ConnectionError::PingFailed(e.to_string()))?;

        Ok(client)
    }

    /// Parse connection URI and create client options
    async fn parse_uri(uri: &str) -> Result<ClientOptions> {
        ClientOptions::parse(uri)
            .await
            .map_err(|e| ConnectionError::InvalidUri(format!("{uri}: {e}")).into())
    }

    /// Configure client options with pool settings
    fn configure_pool(&self, mut options: ClientOptions) -> ClientOptions {
        let pool = PoolConfig::from(&self.config);

        options.app_name = Some(self.config.app_name.clone());
        options.max_pool_size = Some(pool.max_size);
        options.min_pool_size = Some(pool.min_idle);
        options.connect_timeout = Some(pool.connection_timeout);
        options.server_selection_timeout = Some(pool.server_selection_timeout);
        options.max_idle_time = Some(pool.idle_timeout);
        options
    }

    async fn set_state(&self, new_state: ConnectionState) {
        *self.state.write().await = new_state;
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.is_healthy { "healthy" } else { "unhealthy" };
        write!(f, "{status} ({} ms)", self.response_time_ms)?;
        if let Some(diagnostics) = &self.diagnostics {
            write!(f, ": {diagnostics}")?;
        }
        Ok(())
    }
}

impl From<&ConnectionConfig> for PoolConfig {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            max_size: config.max_pool_size,
            min_idle: config.min_pool_size,
            connection_timeout: Duration::from_secs(config.timeout),
            server_selection_timeout: Duration::from_secs(config.server_selection_timeout),
            idle_timeout: Duration::from_secs(config.idle_timeout),
        }
    }
}
