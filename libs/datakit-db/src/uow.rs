//! Explicit transaction boundaries.

use std::future::Future;
use std::pin::Pin;

use sea_orm::{DatabaseTransaction, TransactionTrait};

use crate::connect::Db;
use crate::error::DbError;

/// An open transaction. Dropping it without [`commit`](Self::commit) rolls
/// it back.
///
/// ```rust,ignore
/// let uow = UnitOfWork::begin(&db).await?;
/// Repository::<note::Entity, _>::new(uow.conn(), scope).insert(model).await?;
/// uow.commit().await?;
/// ```
#[derive(Debug)]
pub struct UnitOfWork {
    txn: DatabaseTransaction,
}

impl UnitOfWork {
    /// # Errors
    /// Returns [`DbError::Sea`] if the transaction cannot be started.
    pub async fn begin(db: &Db) -> Result<Self, DbError> {
        let txn = db.conn().begin().await?;
        tracing::trace!(engine = db.engine().name(), "transaction started");
        Ok(Self { txn })
    }

    /// Connection to run statements on inside this transaction.
    #[must_use]
    pub fn conn(&self) -> &DatabaseTransaction {
        &self.txn
    }

    /// # Errors
    /// Returns [`DbError::Sea`] if the commit fails.
    pub async fn commit(self) -> Result<(), DbError> {
        self.txn.commit().await?;
        tracing::trace!("transaction committed");
        Ok(())
    }

    /// # Errors
    /// Returns [`DbError::Sea`] if the rollback fails.
    pub async fn rollback(self) -> Result<(), DbError> {
        self.txn.rollback().await?;
        tracing::trace!("transaction rolled back");
        Ok(())
    }
}

/// Run `f` in a transaction; commit on `Ok`, roll back on `Err`.
///
/// # Errors
/// Returns the closure's error, or [`DbError::Sea`] when the transaction
/// cannot be started or committed.
pub async fn in_transaction<T, E, F>(db: &Db, f: F) -> Result<T, E>
where
    T: Send,
    E: From<DbError> + Send,
    F: for<'a> FnOnce(
            &'a DatabaseTransaction,
        ) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>
        + Send,
{
    let uow = UnitOfWork::begin(db).await?;
    match f(uow.conn()).await {
        Ok(value) => {
            uow.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = uow.rollback().await {
                tracing::warn!(error = %rollback, "rollback after failed unit of work");
            }
            Err(err)
        }
    }
}
