//! 代理池模块
//! 对外提供持久化存储与代理池管理接口

mod manager;
mod storage;
mod types;

pub use manager::{AcquisitionReport, ConnectionPlan, PoolOrigin, ProxyManager};
pub use storage::ProxyStore;
pub use types::{FailureEntry, ProxyRecord, STORAGE_VERSION, StorageStats, StoreFile};
