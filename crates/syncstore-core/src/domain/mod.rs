//! Domain model (ids, scope, records, change sets, errors, ...).

pub mod change;
pub mod errors;
pub mod ids;
pub mod page;
pub mod record;
pub mod scope;
pub mod state;

pub use self::change::{ChangeSet, Commit, Document, RecordChange};
pub use self::errors::{ErrorKind, FetchError, PersistError, SyncError};
pub use self::ids::{CacheKey, Id, IdMarker, ObserverId, OperationId};
pub use self::page::PageToken;
pub use self::record::{CacheEntry, Record};
pub use self::scope::{FieldPath, Predicate, Scope, SortKey};
pub use self::state::{RefreshOutcome, RefreshResult};
