//! Scoped units of work with propagation.
//!
//! [`TransactionManager::run_scoped`] runs a body inside a transaction
//! decided by its [`Propagation`]:
//!
//! - `Required` joins the ambient transaction or starts one
//! - `RequiresNew` suspends the ambient transaction and starts its own
//! - `Supports` joins the ambient transaction or runs without one
//!
//! Only the scope that began a physical transaction commits or rolls it
//! back. A joined scope that fails marks the shared transaction
//! rollback-only, so the owner rolls back even if it swallowed the error.
//!
//! The ambient transaction is a tokio task-local: it follows `.await` chains
//! but not `tokio::spawn`. Work spawned onto another task must receive the
//! context explicitly.

mod backend;

pub use self::backend::{connect, BackendError, PhysicalTransaction, TransactionBackend};

#[cfg(test)]
pub use self::backend::MockTransactionBackend;

use sea_orm::DatabaseTransaction;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::metrics::CoordinationMetrics;

tokio::task_local! {
    static AMBIENT: Option<Arc<TransactionContext>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Propagation {
    #[default]
    Required,
    RequiresNew,
    Supports,
}

/// Requested from the engine, never emulated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

impl TransactionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TransactionState::Active,
            1 => TransactionState::Committed,
            _ => TransactionState::RolledBack,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TransactionState::Active => 0,
            TransactionState::Committed => 1,
            TransactionState::RolledBack => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    pub propagation: Propagation,
    pub isolation: IsolationLevel,
    /// Ignored when joining an ambient transaction
    pub read_only: bool,
}

impl TransactionOptions {
    pub fn required() -> Self {
        Self::default()
    }

    pub fn requires_new() -> Self {
        Self {
            propagation: Propagation::RequiresNew,
            ..Self::default()
        }
    }

    pub fn supports() -> Self {
        Self {
            propagation: Propagation::Supports,
            ..Self::default()
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("failed to begin transaction: {0}")]
    Begin(String),

    #[error("failed to commit transaction {id}: {reason}")]
    Commit { id: Uuid, reason: String },

    #[error("failed to roll back transaction {id}: {reason}")]
    Rollback { id: Uuid, reason: String },

    /// The body succeeded but a joined scope failed inside it
    #[error("transaction {id} was marked rollback-only and has been rolled back")]
    RollbackOnly { id: Uuid },

    #[error("transaction {id} is already completed")]
    Completed { id: Uuid },
}

/// One physical transaction as seen by the scopes sharing it.
pub struct TransactionContext {
    id: Uuid,
    isolation: IsolationLevel,
    read_only: bool,
    parent: Option<Arc<TransactionContext>>,
    state: AtomicU8,
    rollback_only: AtomicBool,
    tx: Mutex<Option<Box<dyn PhysicalTransaction>>>,
}

impl TransactionContext {
    fn new(
        options: TransactionOptions,
        parent: Option<Arc<TransactionContext>>,
        tx: Box<dyn PhysicalTransaction>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            isolation: options.isolation,
            read_only: options.read_only,
            parent,
            state: AtomicU8::new(TransactionState::Active.as_u8()),
            rollback_only: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
        }
    }

    /// The transaction in effect for the current task, if any.
    pub fn current() -> Option<Arc<TransactionContext>> {
        AMBIENT.try_with(Clone::clone).ok().flatten()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Transaction that was suspended when this one started.
    pub fn parent(&self) -> Option<&Arc<TransactionContext>> {
        self.parent.as_ref()
    }

    /// Number of suspended transactions below this one.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut cursor = self.parent.as_ref();
        while let Some(parent) = cursor {
            depth += 1;
            cursor = parent.parent.as_ref();
        }
        depth
    }

    pub fn state(&self) -> TransactionState {
        TransactionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::Acquire)
    }

    /// Force the owning scope to roll back regardless of its own outcome.
    pub fn set_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::Release);
    }

    /// Borrow the engine transaction as its concrete type.
    ///
    /// `None` once the transaction has completed or if `T` is the wrong type.
    pub async fn physical<T: 'static>(&self) -> Option<MappedMutexGuard<'_, T>> {
        let guard = self.tx.lock().await;
        MutexGuard::try_map(guard, |slot| {
            slot.as_mut()
                .and_then(|tx| tx.as_any_mut().downcast_mut::<T>())
        })
        .ok()
    }

    /// The sea-orm transaction, for running queries inside the scope.
    ///
    /// # Example
    /// ```ignore
    /// transactions
    ///     .required(|ctx| async move {
    ///         let ctx = ctx.expect("REQUIRED always provides a context");
    ///         let tx = ctx.database_transaction().await.ok_or(AppError::NoTransaction)?;
    ///         news::ActiveModel { .. }.insert(&*tx).await?;
    ///         Ok(())
    ///     })
    ///     .await?;
    /// ```
    pub async fn database_transaction(&self) -> Option<MappedMutexGuard<'_, DatabaseTransaction>> {
        self.physical::<DatabaseTransaction>().await
    }

    fn set_state(&self, state: TransactionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("isolation", &self.isolation)
            .field("read_only", &self.read_only)
            .field("parent", &self.parent.as_ref().map(|p| p.id))
            .field("state", &self.state())
            .field("rollback_only", &self.is_rollback_only())
            .finish()
    }
}

#[derive(Clone)]
pub struct TransactionManager {
    backend: Arc<dyn TransactionBackend>,
}

impl TransactionManager {
    pub fn new(backend: Arc<dyn TransactionBackend>) -> Self {
        Self { backend }
    }

    /// Run `body` inside the transaction chosen by `options.propagation`.
    ///
    /// `body` receives the context it runs in (`None` only for `Supports`
    /// without an ambient transaction). An owning scope commits when `body`
    /// returns `Ok` and rolls back when it returns `Err`; the error is
    /// returned after the rollback. A panic inside `body` drops the engine
    /// transaction, which rolls it back.
    pub async fn run_scoped<T, E, F, Fut>(&self, options: TransactionOptions, body: F) -> Result<T, E>
    where
        F: FnOnce(Option<Arc<TransactionContext>>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError> + fmt::Display,
    {
        let ambient = TransactionContext::current();

        match (options.propagation, ambient) {
            (Propagation::Required | Propagation::Supports, Some(ctx)) => {
                self.join(ctx, options, body).await
            }
            (Propagation::Supports, None) => {
                debug!("No ambient transaction, running without one");
                body(None).await
            }
            (Propagation::Required, None) => self.run_owned(options, None, body).await,
            (Propagation::RequiresNew, parent) => self.run_owned(options, parent, body).await,
        }
    }

    pub async fn required<T, E, F, Fut>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce(Option<Arc<TransactionContext>>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError> + fmt::Display,
    {
        self.run_scoped(TransactionOptions::required(), body).await
    }

    pub async fn requires_new<T, E, F, Fut>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce(Option<Arc<TransactionContext>>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError> + fmt::Display,
    {
        self.run_scoped(TransactionOptions::requires_new(), body).await
    }

    pub async fn supports<T, E, F, Fut>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce(Option<Arc<TransactionContext>>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError> + fmt::Display,
    {
        self.run_scoped(TransactionOptions::supports(), body).await
    }

    async fn join<T, E, F, Fut>(
        &self,
        ctx: Arc<TransactionContext>,
        options: TransactionOptions,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Option<Arc<TransactionContext>>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError> + fmt::Display,
    {
        if ctx.state() != TransactionState::Active {
            return Err(TransactionError::Completed { id: ctx.id }.into());
        }
        if options.isolation != ctx.isolation {
            debug!(
                tx_id = %ctx.id,
                requested = %options.isolation,
                actual = %ctx.isolation,
                "Joined transaction keeps its own isolation level"
            );
        }

        debug!(tx_id = %ctx.id, propagation = %options.propagation, "Joining transaction");
        let result = body(Some(ctx.clone())).await;

        if let Err(e) = &result {
            ctx.set_rollback_only();
            debug!(tx_id = %ctx.id, error = %e, "Joined scope failed, marked rollback-only");
        }
        result
    }

    async fn run_owned<T, E, F, Fut>(
        &self,
        options: TransactionOptions,
        parent: Option<Arc<TransactionContext>>,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Option<Arc<TransactionContext>>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError> + fmt::Display,
    {
        let tx = self
            .backend
            .begin(options.isolation, options.read_only)
            .await
            .map_err(|e| TransactionError::Begin(e.to_string()))?;

        let ctx = Arc::new(TransactionContext::new(options, parent, tx));
        debug!(
            tx_id = %ctx.id,
            propagation = %options.propagation,
            isolation = %options.isolation,
            read_only = options.read_only,
            suspended = ?ctx.parent.as_ref().map(|p| p.id),
            "Transaction started"
        );

        let result = AMBIENT.scope(Some(ctx.clone()), body(Some(ctx.clone()))).await;

        match result {
            Ok(_) if ctx.is_rollback_only() => {
                warn!(tx_id = %ctx.id, "Rolling back transaction marked rollback-only");
                self.finish(&ctx, false).await?;
                Err(TransactionError::RollbackOnly { id: ctx.id }.into())
            }
            Ok(value) => {
                self.finish(&ctx, true).await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.finish(&ctx, false).await {
                    error!(tx_id = %ctx.id, error = %rollback, cause = %e, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn finish(&self, ctx: &TransactionContext, commit: bool) -> Result<(), TransactionError> {
        let Some(tx) = ctx.tx.lock().await.take() else {
            return Err(TransactionError::Completed { id: ctx.id });
        };

        if commit {
            match tx.commit().await {
                Ok(()) => {
                    ctx.set_state(TransactionState::Committed);
                    CoordinationMetrics::transaction_finished("committed");
                    debug!(tx_id = %ctx.id, "Transaction committed");
                    Ok(())
                }
                Err(e) => {
                    ctx.set_state(TransactionState::RolledBack);
                    CoordinationMetrics::transaction_finished("commit_failed");
                    error!(tx_id = %ctx.id, error = %e, "Commit failed");
                    Err(TransactionError::Commit {
                        id: ctx.id,
                        reason: e.to_string(),
                    })
                }
            }
        } else {
            ctx.set_state(TransactionState::RolledBack);
            CoordinationMetrics::transaction_finished("rolled_back");
            tx.rollback().await.map_err(|e| TransactionError::Rollback {
                id: ctx.id,
                reason: e.to_string(),
            })?;
            debug!(tx_id = %ctx.id, "Transaction rolled back");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::sync::Mutex as StdMutex;

    type Log = Arc<StdMutex<Vec<String>>>;

    struct RecordingTx {
        name: String,
        log: Log,
    }

    #[async_trait::async_trait]
    impl PhysicalTransaction for RecordingTx {
        async fn commit(self: Box<Self>) -> Result<(), BackendError> {
            self.log.lock().unwrap().push(format!("commit {}", self.name));
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> Result<(), BackendError> {
            self.log.lock().unwrap().push(format!("rollback {}", self.name));
            Ok(())
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn recording_backend(expected_begins: usize) -> (TransactionManager, Log) {
        let log: Log = Arc::default();
        let mut backend = MockTransactionBackend::new();
        let begins = Arc::new(StdMutex::new(0));
        let tx_log = log.clone();
        backend
            .expect_begin()
            .times(expected_begins)
            .returning(move |_, _| {
                let mut n = begins.lock().unwrap();
                *n += 1;
                tx_log.lock().unwrap().push(format!("begin tx{n}"));
                Ok(Box::new(RecordingTx {
                    name: format!("tx{n}"),
                    log: tx_log.clone(),
                }))
            });
        (TransactionManager::new(Arc::new(backend)), log)
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[derive(Debug, Error)]
    enum TestError {
        #[error(transparent)]
        Tx(#[from] TransactionError),
        #[error("body failed")]
        Body,
    }

    #[tokio::test]
    async fn test_required_commits_on_success() {
        let (manager, log) = recording_backend(1);

        let value = manager
            .required(|ctx| async move {
                assert!(ctx.is_some());
                assert_eq!(TransactionContext::current().map(|c| c.id()), ctx.map(|c| c.id()));
                Ok::<_, TestError>(5)
            })
            .await
            .unwrap();

        assert_eq!(value, 5);
        assert_eq!(entries(&log), vec!["begin tx1", "commit tx1"]);
        assert!(TransactionContext::current().is_none());
    }

    #[tokio::test]
    async fn test_body_error_rolls_back_and_propagates() {
        let (manager, log) = recording_backend(1);

        let result: Result<(), TestError> = manager.required(|_| async { Err(TestError::Body) }).await;

        assert!(matches!(result, Err(TestError::Body)));
        assert_eq!(entries(&log), vec!["begin tx1", "rollback tx1"]);
    }

    #[tokio::test]
    async fn test_nested_required_shares_one_transaction() {
        let (manager, log) = recording_backend(1);
        let inner = manager.clone();

        manager
            .required(|outer| async move {
                let outer_id = outer.map(|c| c.id());
                inner
                    .required(|ctx| async move {
                        assert_eq!(ctx.map(|c| c.id()), outer_id);
                        Ok::<_, TestError>(())
                    })
                    .await
            })
            .await
            .unwrap();

        assert_eq!(entries(&log), vec!["begin tx1", "commit tx1"]);
    }

    #[tokio::test]
    async fn test_swallowed_inner_failure_still_rolls_back() {
        let (manager, log) = recording_backend(1);
        let inner = manager.clone();

        let result: Result<(), TestError> = manager
            .required(|_| async move {
                let _ignored: Result<(), TestError> =
                    inner.required(|_| async { Err(TestError::Body) }).await;
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(TestError::Tx(TransactionError::RollbackOnly { .. }))
        ));
        assert_eq!(entries(&log), vec!["begin tx1", "rollback tx1"]);
    }

    #[tokio::test]
    async fn test_supports_without_ambient_runs_bare() {
        let (manager, log) = recording_backend(0);

        let value = manager
            .supports(|ctx| async move {
                assert!(ctx.is_none());
                assert!(TransactionContext::current().is_none());
                Ok::<_, TestError>("bare")
            })
            .await
            .unwrap();

        assert_eq!(value, "bare");
        assert!(entries(&log).is_empty());
    }

    #[tokio::test]
    async fn test_requires_new_suspends_and_restores_ambient() {
        let (manager, log) = recording_backend(2);
        let inner = manager.clone();

        manager
            .required(|outer| async move {
                let outer = outer.unwrap();
                let outer_id = outer.id();
                inner
                    .requires_new(|ctx| async move {
                        let ctx = ctx.unwrap();
                        assert_ne!(ctx.id(), outer_id);
                        assert_eq!(ctx.parent().map(|p| p.id()), Some(outer_id));
                        assert_eq!(ctx.depth(), 1);
                        Ok::<_, TestError>(())
                    })
                    .await?;
                assert_eq!(TransactionContext::current().map(|c| c.id()), Some(outer_id));
                Ok::<_, TestError>(())
            })
            .await
            .unwrap();

        assert_eq!(
            entries(&log),
            vec!["begin tx1", "begin tx2", "commit tx2", "commit tx1"]
        );
    }

    #[tokio::test]
    async fn test_options_reach_the_engine() {
        let mut backend = MockTransactionBackend::new();
        backend
            .expect_begin()
            .withf(|isolation, read_only| *isolation == IsolationLevel::Serializable && *read_only)
            .times(1)
            .returning(|_, _| {
                Ok(Box::new(RecordingTx {
                    name: "ro".into(),
                    log: Arc::default(),
                }))
            });
        let manager = TransactionManager::new(Arc::new(backend));

        manager
            .run_scoped(
                TransactionOptions::required()
                    .with_isolation(IsolationLevel::Serializable)
                    .read_only(),
                |ctx| async move {
                    let ctx = ctx.unwrap();
                    assert!(ctx.is_read_only());
                    assert!(ctx.physical::<RecordingTx>().await.is_some());
                    assert!(ctx.database_transaction().await.is_none());
                    Ok::<_, TestError>(())
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_begin_failure_surfaces() {
        let mut backend = MockTransactionBackend::new();
        backend
            .expect_begin()
            .returning(|_, _| Err("connection refused".into()));
        let manager = TransactionManager::new(Arc::new(backend));

        let result: Result<(), TestError> = manager.required(|_| async { Ok(()) }).await;
        match result {
            Err(TestError::Tx(TransactionError::Begin(reason))) => {
                assert!(reason.contains("connection refused"))
            }
            other => panic!("expected Begin error, got {other:?}"),
        }
    }

    #[test]
    fn test_propagation_names() {
        assert_eq!(Propagation::RequiresNew.to_string(), "REQUIRES_NEW");
        assert_eq!(IsolationLevel::RepeatableRead.as_ref(), "REPEATABLE_READ");
    }
}
