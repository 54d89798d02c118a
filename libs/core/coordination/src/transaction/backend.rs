//! Seam between the transaction manager and the relational engine.

use async_trait::async_trait;
use core_config::database::DatabaseConfig;
use sea_orm::{
    AccessMode, ConnectOptions, Database, DatabaseConnection, DatabaseTransaction, DbErr,
    TransactionTrait,
};
use std::any::Any;
use tracing::info;

use super::IsolationLevel;

/// Engine-specific failure, reported to callers as text
pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

/// Starts physical transactions on the relational engine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionBackend: Send + Sync + 'static {
    /// Begin a transaction at `isolation`, read-only if requested. The
    /// engine enforces both; nothing is emulated here.
    async fn begin(
        &self,
        isolation: IsolationLevel,
        read_only: bool,
    ) -> Result<Box<dyn PhysicalTransaction>, BackendError>;
}

/// One open engine transaction.
#[async_trait]
pub trait PhysicalTransaction: Send + 'static {
    async fn commit(self: Box<Self>) -> Result<(), BackendError>;

    async fn rollback(self: Box<Self>) -> Result<(), BackendError>;

    /// Access to the concrete type, e.g. `sea_orm::DatabaseTransaction`.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl From<IsolationLevel> for sea_orm::IsolationLevel {
    fn from(level: IsolationLevel) -> Self {
        match level {
            IsolationLevel::ReadCommitted => sea_orm::IsolationLevel::ReadCommitted,
            IsolationLevel::RepeatableRead => sea_orm::IsolationLevel::RepeatableRead,
            IsolationLevel::Serializable => sea_orm::IsolationLevel::Serializable,
        }
    }
}

#[async_trait]
impl TransactionBackend for DatabaseConnection {
    async fn begin(
        &self,
        isolation: IsolationLevel,
        read_only: bool,
    ) -> Result<Box<dyn PhysicalTransaction>, BackendError> {
        let access_mode = read_only.then_some(AccessMode::ReadOnly);
        let tx = self.begin_with_config(Some(isolation.into()), access_mode).await?;
        Ok(Box::new(tx))
    }
}

#[async_trait]
impl PhysicalTransaction for DatabaseTransaction {
    async fn commit(self: Box<Self>) -> Result<(), BackendError> {
        DatabaseTransaction::commit(*self).await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), BackendError> {
        DatabaseTransaction::rollback(*self).await?;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Open a pooled connection to the system of record.
///
/// # Example
/// ```ignore
/// use coordination::transaction::{connect, TransactionManager};
/// use core_config::{database::DatabaseConfig, FromEnv};
///
/// let db = connect(&DatabaseConfig::from_env()?).await?;
/// let transactions = TransactionManager::new(Arc::new(db));
/// ```
pub async fn connect(config: &DatabaseConfig) -> Result<DatabaseConnection, DbErr> {
    let mut options = ConnectOptions::new(config.url.clone());
    options
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(config.connect_timeout)
        .acquire_timeout(config.acquire_timeout)
        .sqlx_logging(config.sql_logging);

    let db = Database::connect(options).await?;
    info!(
        max_connections = config.max_connections,
        "Connected to relational store"
    );
    Ok(db)
}
