//! Embedded SQLite database layer underneath the store
//!
//! Separates pure configuration logic (connection options, pool sizing)
//! from I/O (file creation, pool setup, migrations).

use crate::domain_types::ConnectionPoolSize;
use nutype::nutype;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Static migrator for embedded `SQLite` migrations
static MIGRATOR: Migrator = sqlx::migrate!();

/// Database-specific error types
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Error from `SQLx`
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// File system I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Configuration error: {field} - {reason}")]
    Configuration {
        /// Name of the invalid configuration field
        field: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Migration error
    #[error("Migration failed: {message}")]
    Migration {
        /// Error message from the migration run
        message: String,
    },
}

/// Database result type
pub type DatabaseResult<T> = Result<T, DatabaseError>;

#[nutype(
    validate(predicate = |path| !path.as_os_str().is_empty() && path.extension().is_some_and(|ext| ext == "db")),
    derive(Clone, Debug, Eq, PartialEq)
)]
pub struct DatabasePath(PathBuf);

impl DatabasePath {
    /// Create a new database path with validation
    ///
    /// # Errors
    ///
    /// Returns an error if the path is empty or does not end in `.db`
    pub fn new<P: AsRef<Path>>(path: P) -> DatabaseResult<Self> {
        Self::try_new(path.as_ref().to_path_buf()).map_err(|_| DatabaseError::Configuration {
            field: "database_path".to_string(),
            reason: "Path is empty or has invalid extension (must be .db)".to_string(),
        })
    }

    /// Get the path as `PathBuf`
    pub fn as_path(&self) -> PathBuf {
        self.clone().into_inner()
    }

    /// Get parent directory for file creation
    pub fn parent_directory(&self) -> Option<PathBuf> {
        self.as_path().parent().map(Path::to_path_buf)
    }
}

impl std::fmt::Display for DatabasePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_path().display())
    }
}

/// Connection pool settings for the store
///
/// Defaults favor throughput: 25 connections, 5 kept idle, 5-minute
/// connection rotation.
#[derive(Clone, Debug)]
pub struct PoolSettings {
    /// Maximum open connections
    pub max_connections: ConnectionPoolSize,
    /// Connections kept idle and warm
    pub min_connections: u32,
    /// Rotate connections older than this
    pub max_connection_age: Duration,
    /// Close connections idle longer than this
    pub idle_timeout: Duration,
    /// How long an acquire may wait for a free connection
    pub acquire_timeout: Duration,
    /// SQLite busy handler timeout
    pub busy_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: ConnectionPoolSize::default(),
            min_connections: 5,
            max_connection_age: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolSettings {
    /// Minimal settings for tests: one connection, short waits
    ///
    /// # Panics
    ///
    /// Panics if pool size 1 is out of the valid range (it never is)
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            max_connections: ConnectionPoolSize::try_new(1).expect("pool size 1 is valid"),
            min_connections: 1,
            max_connection_age: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(2),
            busy_timeout: Duration::from_secs(2),
        }
    }
}

/// Database configuration with connection pool settings
#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    path: DatabasePath,
    pool: PoolSettings,
    enable_wal_mode: bool,
}

impl DatabaseConfig {
    /// Create new database config with default settings
    pub fn new(path: DatabasePath) -> Self {
        Self {
            path,
            pool: PoolSettings::default(),
            enable_wal_mode: true,
        }
    }

    /// Create config for testing with minimal settings
    pub fn for_testing(path: DatabasePath) -> Self {
        Self {
            path,
            pool: PoolSettings::for_testing(),
            enable_wal_mode: false,
        }
    }

    /// Builder pattern: override pool settings
    #[must_use]
    pub fn with_pool_settings(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }

    /// Builder pattern: enable/disable WAL mode
    #[must_use]
    pub fn with_wal_mode(mut self, enable: bool) -> Self {
        self.enable_wal_mode = enable;
        self
    }

    /// Get the database path
    pub fn path(&self) -> &DatabasePath {
        &self.path
    }

    /// Get the pool settings
    pub fn pool_settings(&self) -> &PoolSettings {
        &self.pool
    }

    /// Check if WAL mode is enabled
    pub fn wal_mode_enabled(&self) -> bool {
        self.enable_wal_mode
    }
}

/// Database connection with managed pool
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: Pool<Sqlite>,
    config: DatabaseConfig,
}

// Functional core: pure option generation.
impl DatabaseConnection {
    fn create_connect_options(config: &DatabaseConfig) -> SqliteConnectOptions {
        use sqlx::ConnectOptions;

        let mut options = SqliteConnectOptions::new()
            .filename(config.path().as_path())
            .create_if_missing(true)
            .busy_timeout(config.pool_settings().busy_timeout);

        if config.wal_mode_enabled() {
            options = options.pragma("journal_mode", "WAL");
        }

        options.disable_statement_logging()
    }

    fn create_pool_options(config: &DatabaseConfig) -> SqlitePoolOptions {
        let pool = config.pool_settings();
        SqlitePoolOptions::new()
            .max_connections(pool.max_connections.as_u32())
            .min_connections(pool.min_connections)
            .max_lifetime(pool.max_connection_age)
            .idle_timeout(pool.idle_timeout)
            .acquire_timeout(pool.acquire_timeout)
    }
}

// Imperative shell: I/O operations.
impl DatabaseConnection {
    /// Initialize the database: directory, pool, pragmas, migrations
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the pool fails
    /// to connect, or migrations fail
    pub async fn initialize(config: DatabaseConfig) -> DatabaseResult<Self> {
        if let Some(parent) = config.path().parent_directory() {
            tokio::fs::create_dir_all(&parent).await?;
        }

        let pool = Self::create_pool_options(&config)
            .connect_with(Self::create_connect_options(&config))
            .await?;

        Self::apply_database_settings(&pool).await?;
        Self::run_migrations(&pool).await?;

        Ok(Self { pool, config })
    }

    /// Apply pragma tuning after connection
    async fn apply_database_settings(pool: &Pool<Sqlite>) -> DatabaseResult<()> {
        // NORMAL is still crash-safe under WAL and measurably faster.
        sqlx::query("PRAGMA synchronous = NORMAL").execute(pool).await?;
        sqlx::query("PRAGMA temp_store = MEMORY").execute(pool).await?;
        sqlx::query("PRAGMA cache_size = -65536").execute(pool).await?;
        Ok(())
    }

    /// Run embedded database migrations
    async fn run_migrations(pool: &Pool<Sqlite>) -> DatabaseResult<()> {
        MIGRATOR
            .run(pool)
            .await
            .map_err(|e| DatabaseError::Migration {
                message: format!("schema migration failed: {e}"),
            })?;
        info!("database migrations applied");
        Ok(())
    }

    /// Issue a round-trip probe query
    ///
    /// # Errors
    ///
    /// Returns an error if the probe fails
    pub async fn ping(&self) -> DatabaseResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Get access to the connection pool
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Get the database configuration
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_should_create_valid_database_path_when_given_db_extension() {
        let path = DatabasePath::new("broker.db").unwrap();
        assert!(path.to_string().contains("broker.db"));
    }

    #[test]
    fn test_should_reject_database_path_when_extension_is_not_db() {
        assert!(DatabasePath::new("").is_err());
        assert!(DatabasePath::new("broker.txt").is_err());
    }

    #[test]
    fn test_should_extract_parent_directory_when_path_has_parent() {
        let path = DatabasePath::new("/tmp/subdir/broker.db").unwrap();
        let parent = path.parent_directory().unwrap();
        assert!(parent.to_string_lossy().contains("subdir"));
    }

    #[test]
    fn test_should_use_throughput_defaults_when_pool_settings_default() {
        let pool = PoolSettings::default();
        assert_eq!(pool.max_connections.as_u32(), 25);
        assert_eq!(pool.min_connections, 5);
        assert_eq!(pool.max_connection_age, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_should_initialize_database_when_config_is_valid() {
        let temp_dir = tempdir().unwrap();
        let path = DatabasePath::new(temp_dir.path().join("broker.db")).unwrap();
        let config = DatabaseConfig::for_testing(path);

        let connection = DatabaseConnection::initialize(config).await.unwrap();
        connection.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_should_apply_migrations_when_initializing_database() {
        let temp_dir = tempdir().unwrap();
        let path = DatabasePath::new(temp_dir.path().join("broker.db")).unwrap();
        let config = DatabaseConfig::for_testing(path);

        let connection = DatabaseConnection::initialize(config).await.unwrap();

        let applied = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM _sqlx_migrations")
            .fetch_one(connection.pool())
            .await
            .unwrap();
        assert!(applied >= 3, "expected all migrations recorded");
    }
}
