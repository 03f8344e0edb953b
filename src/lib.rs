pub mod batch;
pub mod change;
pub mod change_log;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod local_store;
pub mod network;
pub mod remote_store;
pub mod table_filter;
pub mod value;

pub use change::{Change, ChangeDescriptor, OpType, SyncError};
pub use change_log::{ChangeLog, MemoryChangeLog, SqliteChangeLog};
pub use config::{ConflictPolicyKind, Credential, SyncConfig};
pub use conflict::{Conflict, ConflictPolicy};
pub use engine::{PullResult, PushResult, SyncEngine, SyncResult, SyncState};
pub use local_store::{LocalStoreGateway, SqliteLocalStore};
pub use network::{LinkType, ManualNetworkMonitor, NetworkMonitor, NetworkState};
pub use remote_store::{HttpRemoteStore, RemoteStore};
pub use table_filter::{TableFilter, TableFilterConfig, TableMetadata, TableMetadataFilter};
pub use value::{Row, Value};
