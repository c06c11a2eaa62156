pub mod check;
pub mod config;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod source;
pub mod ui;

pub use config::Config;
pub use error::{PoolError, PoolResult};
pub use pool::{ConnectionPlan, ProxyManager, ProxyStore};
