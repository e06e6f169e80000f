//! Common utilities and types shared across shardcoord

pub mod config;
pub mod error;
pub mod utils;

pub use config::{AllocationConfig, Config, CoordinationConfig};
pub use error::{Error, Result};
pub use utils::{jittered_backoff, parse_duration, parse_id_list};
