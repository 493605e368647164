pub mod provider;
pub mod types;

pub use provider::{ConfigProvider, FileConfigProvider, StaticConfigProvider};
pub use types::*;
