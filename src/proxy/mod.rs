//! 调用方入口：/v1/* 代理面

pub mod handlers;
pub mod middleware;
pub mod router;
pub mod types;

pub use middleware::AppState;
pub use router::create_proxy_router;
