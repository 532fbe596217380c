pub use crate::config::{SessionPoolConfig, SessionPoolConfigBuilder};
pub use crate::connection::{GrpcSessionService, RpcClientFactory, SessionService};
pub use crate::error::Error;
pub use crate::pool::{PoolStats, SessionPool, OPEN_SESSION_COUNT};
pub use crate::resource::DatabaseId;
pub use crate::session::SessionHandle;

mod config;
mod connection;
mod error;
mod health;
mod pool;
pub mod proto;
mod resource;
mod retry;
mod session;
