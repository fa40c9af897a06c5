//! Module: db::nonblocking
//! Responsibility: async entry points for callers on a tokio runtime.
//! Does not own: any query or commit logic. Work runs on the blocking pool
//! through the same code the synchronous API uses.
//! Boundary: compilation and validation happen on the caller, before the
//! first await, so malformed requests never reach the pool.

use crate::{
    Error,
    db::{
        Session,
        commit::{CommitReport, Transaction},
        query::QuerySet,
        store::StoreError,
    },
    model::validate::validate_row,
    traits::EntityKind,
};

async fn run_blocking<T, F>(f: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Error> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| StoreError::Unavailable(format!("blocking task failed: {err}")))?
}

///
/// AsyncSession
///

#[derive(Clone, Debug)]
pub struct AsyncSession {
    session: Session,
}

impl AsyncSession {
    #[must_use]
    pub const fn new(session: Session) -> Self {
        Self { session }
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    pub async fn count<E: EntityKind>(&self, set: QuerySet<E>) -> Result<usize, Error> {
        set.prepare()?;
        run_blocking(move || set.count()).await
    }

    pub async fn items<E: EntityKind>(&self, set: QuerySet<E>) -> Result<Vec<E>, Error> {
        set.prepare()?;
        run_blocking(move || set.to_vec()).await
    }

    pub async fn get<E: EntityKind>(&self, set: QuerySet<E>) -> Result<E, Error> {
        set.prepare()?;
        run_blocking(move || set.get()).await
    }

    /// Commit a transaction buffered on the caller.
    pub async fn commit(&self, txn: Transaction) -> Result<CommitReport, Error> {
        run_blocking(move || {
            let mut txn = txn;
            txn.commit()
        })
        .await
    }

    /// Save one instance in its own transaction and return it with its id.
    pub async fn save<E: EntityKind>(&self, entity: E) -> Result<E, Error> {
        validate_row(E::MODEL, &entity.to_row())?;

        let session = self.session.clone();
        run_blocking(move || {
            let mut entity = entity;
            session.save(&mut entity)?;
            Ok(entity)
        })
        .await
    }

    pub async fn delete<E: EntityKind>(&self, entity: E) -> Result<bool, Error> {
        let session = self.session.clone();
        run_blocking(move || session.delete(&entity)).await
    }
}
