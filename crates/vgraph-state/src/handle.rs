//! SurrealDB connection handling
//!
//! Resolves where the database lives and opens an authenticated, schema-ready
//! `Surreal<Any>` handle. Supported targets:
//! - `mem://` for tests
//! - `surrealkv://<path>` for local persistence
//! - `ws://` / `wss://` endpoints (SurrealDB Cloud or a self-hosted server)

use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{info, instrument};

use crate::error::StateError;
use crate::migrations;
use crate::Result;

/// Default namespace for vgraph data
pub const DEFAULT_NAMESPACE: &str = "vgraph";
/// Default database for vgraph data
pub const DEFAULT_DATABASE: &str = "main";
/// Local persistence directory used when no remote database is configured
pub const DEFAULT_LOCAL_PATH: &str = ".vgraph/db";

/// Configuration for an authenticated remote connection
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// WebSocket endpoint URL (e.g., "wss://xxx.aws-use1.surrealdb.cloud")
    pub endpoint: String,
    /// Database username
    pub username: String,
    /// Database password
    pub password: String,
    /// Namespace (default: "vgraph")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

impl CloudConfig {
    /// Create a new cloud configuration for a database user
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            is_root: false,
        }
    }

    /// Set custom namespace
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    /// Set custom database
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    /// Set whether this is a root user
    pub fn with_root(mut self, is_root: bool) -> Self {
        self.is_root = is_root;
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - SURREALDB_ENDPOINT (required)
    /// - SURREALDB_USERNAME (required)
    /// - SURREALDB_PASSWORD (required)
    /// - SURREALDB_NAMESPACE (optional, default: "vgraph")
    /// - SURREALDB_DATABASE (optional, default: "main")
    /// - SURREALDB_ROOT (optional, default: "false") - set to "true" for root users
    pub fn from_env() -> std::result::Result<Self, String> {
        let endpoint =
            std::env::var("SURREALDB_ENDPOINT").map_err(|_| "SURREALDB_ENDPOINT not set")?;
        let username =
            std::env::var("SURREALDB_USERNAME").map_err(|_| "SURREALDB_USERNAME not set")?;
        let password =
            std::env::var("SURREALDB_PASSWORD").map_err(|_| "SURREALDB_PASSWORD not set")?;
        let namespace =
            std::env::var("SURREALDB_NAMESPACE").unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        let database =
            std::env::var("SURREALDB_DATABASE").unwrap_or_else(|_| DEFAULT_DATABASE.to_string());
        let is_root = std::env::var("SURREALDB_ROOT")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            endpoint,
            username,
            password,
            namespace,
            database,
            is_root,
        })
    }
}

/// Connect to an unauthenticated URL (`mem://`, `surrealkv://...`, or a
/// server that allows guests), select namespace/database, and run migrations.
#[instrument(skip_all, fields(url = %url))]
pub async fn connect_url(url: &str, namespace: &str, database: &str) -> Result<Surreal<Any>> {
    if let Some(path) = url.strip_prefix("surrealkv://") {
        std::fs::create_dir_all(path).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {}: {}",
                path, e
            ))
        })?;
    }

    let db = surrealdb::engine::any::connect(url)
        .await
        .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

    db.use_ns(namespace)
        .use_db(database)
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;

    migrations::init_schema(&db).await?;
    info!("SurrealDB connected ({})", url);
    Ok(db)
}

/// Connect with credentials from a [`CloudConfig`] and run migrations.
#[instrument(skip(config), fields(endpoint = %config.endpoint, namespace = %config.namespace, database = %config.database))]
pub async fn connect_cloud(config: &CloudConfig) -> Result<Surreal<Any>> {
    info!("Connecting to SurrealDB (root={})", config.is_root);

    let db = surrealdb::engine::any::connect(&config.endpoint)
        .await
        .map_err(|e| {
            StateError::Connection(format!("Failed to connect to {}: {}", config.endpoint, e))
        })?;

    if config.is_root {
        db.signin(Root {
            username: &config.username,
            password: &config.password,
        })
        .await
        .map_err(|e| StateError::Connection(format!("Root auth failed: {e}")))?;
    } else {
        db.signin(Database {
            namespace: &config.namespace,
            database: &config.database,
            username: &config.username,
            password: &config.password,
        })
        .await
        .map_err(|e| StateError::Connection(format!("DB auth failed: {e}")))?;
    }

    db.use_ns(&config.namespace)
        .use_db(&config.database)
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;

    migrations::init_schema(&db).await?;
    Ok(db)
}

/// Resolve a connection from the environment.
///
/// Order: [`CloudConfig::from_env`], then `SURREALDB_URL`, then local
/// persistence at [`DEFAULT_LOCAL_PATH`].
pub async fn connect_from_env() -> Result<Surreal<Any>> {
    if let Ok(config) = CloudConfig::from_env() {
        return connect_cloud(&config).await;
    }

    if let Ok(url) = std::env::var("SURREALDB_URL") {
        return connect_url(&url, DEFAULT_NAMESPACE, DEFAULT_DATABASE).await;
    }

    let url = format!("surrealkv://{}", DEFAULT_LOCAL_PATH);
    info!(
        "No cloud config or SURREALDB_URL found, using local persistence: {}",
        url
    );
    connect_url(&url, DEFAULT_NAMESPACE, DEFAULT_DATABASE).await
}
