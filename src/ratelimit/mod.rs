//! Rate limiting logic and state management.

pub mod backend;
pub mod compound;
pub mod distributed;
pub mod limiter;
pub mod memory;
pub mod redis_store;

pub use backend::{select_backend, Backend};
pub use compound::{check_with_config, compound_check, LimiterCheck};
pub use distributed::{DistributedLimiter, ScriptReply, WindowStore, DEFAULT_PREFIX};
pub use limiter::{LimitConfig, Limiter, RateLimitDecision, RateLimitInfo};
pub use memory::{MemoryLimiter, DEFAULT_SWEEP_INTERVAL};
pub use redis_store::RedisStore;
