//! Storage primitives: transaction status journal and resource cache

pub mod cache;
pub mod codec;
pub mod transaction;


// Re-export core types
pub use cache::{CacheGuard, CacheStats, ResourceCache, ResourceLoader};
pub use transaction::{TransactionLog, TransactionStatus, XID_SUFFIX, Xid, xid_file_path};
