//! Module: db
//! Responsibility: the engine. Sessions bind a backend, key space, config
//! and hook registry; everything else hangs off a session.

pub mod commit;
pub mod event;
pub mod keyspace;
pub mod kv;
pub mod manager;
pub mod nonblocking;
pub mod query;
pub mod registry;
pub mod relation;
pub mod search;
pub mod store;

mod session;

// re-exports
pub use commit::{CommitError, CommitReport, Transaction, TxnState, UniqueViolation};
pub use event::{CommitEvent, EventBus, HookError, IndexHook};
pub use keyspace::KeySpace;
pub use kv::KvFacade;
pub use manager::Manager;
pub use nonblocking::AsyncSession;
pub use query::{Predicates, QueryError, QueryPlan, QuerySet};
pub use registry::RegistryError;
pub use relation::{ManyToManyManager, RelatedManager, RelationError};
pub use search::{SearchEngine, SearchError};
pub use session::Session;
pub use store::{Backend, MemoryStore, StoreError};
