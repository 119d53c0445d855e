//! MongoDB connections and the shared client registry
//!
//! [`ClientRegistry`] hands out one [`Connection`] per data-source name and
//! keeps a reference count, so independent components can share a driver
//! client without coordinating its shutdown.

use bson::{doc, Document as BsonDocument};
use docflow_common::{DocFlowError, Result};
use mongodb::{
    options::{ClientOptions, ServerApi, ServerApiVersion},
    Client, Collection, Database,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Data-source name used when the caller does not pick one
pub const DEFAULT_POOL_NAME: &str = "DEFAULT_POOL";

/// Database used when the connection string names none
pub const DEFAULT_DB_NAME: &str = "DEFAULT_DB";

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum number of connections in the pool
    pub min_pool_size: Option<u32>,
    /// Maximum number of connections in the pool
    pub max_pool_size: Option<u32>,
    /// Maximum time a connection can remain idle before being closed
    pub max_idle_time: Option<Duration>,
    /// Connection timeout
    pub connect_timeout: Option<Duration>,
    /// Server selection timeout
    pub server_selection_timeout: Option<Duration>,
    /// Application name for server logs
    pub app_name: Option<String>,
    /// Database to use instead of the connection string's default
    pub database: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_pool_size: Some(5),
            max_pool_size: Some(20),
            max_idle_time: None,
            connect_timeout: Some(Duration::from_secs(10)),
            server_selection_timeout: Some(Duration::from_secs(30)),
            app_name: Some("docflow".to_string()),
            database: None,
        }
    }
}

impl PoolConfig {
    fn apply(&self, options: &mut ClientOptions) {
        if let Some(min) = self.min_pool_size {
            options.min_pool_size = Some(min);
        }
        if let Some(max) = self.max_pool_size {
            options.max_pool_size = Some(max);
        }
        if let Some(idle) = self.max_idle_time {
            options.max_idle_time = Some(idle);
        }
        if let Some(connect) = self.connect_timeout {
            options.connect_timeout = Some(connect);
        }
        if let Some(server_sel) = self.server_selection_timeout {
            options.server_selection_timeout = Some(server_sel);
        }
        if let Some(app) = &self.app_name {
            options.app_name = Some(app.clone());
        }
    }
}

/// MongoDB client bound to one database
#[derive(Debug)]
pub struct Connection {
    client: Client,
    database: Database,
    database_name: String,
}

impl Connection {
    /// Create a new MongoDB connection with default pool settings
    pub async fn new(connection_string: &str) -> Result<Self> {
        Self::with_config(connection_string, PoolConfig::default()).await
    }

    /// Create a new MongoDB connection with custom pool configuration.
    ///
    /// The client connects lazily; parsing a plain `mongodb://` string does
    /// not touch the network.
    pub async fn with_config(connection_string: &str, config: PoolConfig) -> Result<Self> {
        let mut client_options = ClientOptions::parse(connection_string).await?;
        config.apply(&mut client_options);

        let server_api = ServerApi::builder().version(ServerApiVersion::V1).build();
        client_options.server_api = Some(server_api);

        let client = Client::with_options(client_options)?;

        let database = match config.database.as_deref() {
            Some(name) => client.database(name),
            None => client
                .default_database()
                .unwrap_or_else(|| client.database(DEFAULT_DB_NAME)),
        };
        let database_name = database.name().to_string();
        tracing::debug!(database = %database_name, "Created MongoDB client");

        Ok(Self {
            client,
            database,
            database_name,
        })
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Untyped collection in the bound database
    pub fn collection(&self, name: &str) -> Collection<BsonDocument> {
        self.database.collection(name)
    }

    /// Check if the connection is healthy by pinging the server
    pub async fn ping(&self) -> Result<bool> {
        match self.database.run_command(doc! { "ping": 1 }).await {
            Ok(_) => Ok(true),
            Err(e) => Err(DocFlowError::Connection(format!("Ping failed: {}", e))),
        }
    }

    /// Close every pooled connection without waiting for in-flight operations
    pub async fn shutdown(&self) {
        self.client.clone().shutdown().immediate(true).await;
    }
}

struct Entry {
    connection: Arc<Connection>,
    ref_count: usize,
}

/// Reference-counted clients keyed by data-source name
#[derive(Default)]
pub struct ClientRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share the client registered under `name`, creating it from
    /// `connection_string` and `config` on first use. Later callers get the
    /// existing client; their arguments are ignored.
    pub async fn acquire(
        &self,
        name: &str,
        connection_string: &str,
        config: PoolConfig,
    ) -> Result<Arc<Connection>> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(name) {
            entry.ref_count += 1;
            tracing::trace!(pool = name, refs = entry.ref_count, "Shared MongoDB client");
            return Ok(Arc::clone(&entry.connection));
        }

        let connection = Arc::new(Connection::with_config(connection_string, config).await?);
        entries.insert(
            name.to_string(),
            Entry {
                connection: Arc::clone(&connection),
                ref_count: 1,
            },
        );
        tracing::debug!(pool = name, "Registered MongoDB client");
        Ok(connection)
    }

    /// Drop one reference to `name`. The client is shut down when the last
    /// reference goes away; returns whether that happened.
    pub async fn release(&self, name: &str) -> Result<bool> {
        let connection = {
            let mut entries = self.entries.lock().await;
            let entry = entries.get_mut(name).ok_or_else(|| {
                DocFlowError::Configuration(format!("no client registered as '{}'", name))
            })?;
            entry.ref_count -= 1;
            if entry.ref_count > 0 {
                return Ok(false);
            }
            entries.remove(name).map(|entry| entry.connection)
        };

        if let Some(connection) = connection {
            connection.shutdown().await;
            tracing::debug!(pool = name, "Closed MongoDB client");
        }
        Ok(true)
    }

    /// Current reference count of `name`, zero when unregistered
    pub async fn ref_count(&self, name: &str) -> usize {
        self.entries
            .lock()
            .await
            .get(name)
            .map(|entry| entry.ref_count)
            .unwrap_or(0)
    }
}
