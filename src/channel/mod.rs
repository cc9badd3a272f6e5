//! 渠道领域：类型、存储、模型解析与选择

pub mod select;
pub mod store;
pub mod types;

pub use store::{AliasSnapshot, ChannelStore};
pub use types::{Channel, ChannelStatus, Dialect, TokenRecord};
