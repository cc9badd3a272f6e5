//! 用量记录模块
//!
//! 调度结果的消费端：每次调度恰好落一条记录，
//! 提供持久化存储与查询/统计接口

pub mod guard;
pub mod model;
pub mod store;
pub mod types;
mod handlers;
mod router;

pub use guard::UsageGuard;
pub use router::create_usage_router;
pub use store::UsageRecorder;
