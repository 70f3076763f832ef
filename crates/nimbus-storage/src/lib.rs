//! nimbus-storage: OpenDAL storage abstraction for encrypted block objects

pub mod blocks;
pub mod health;
pub mod operator;

pub use blocks::BlockObjectStore;
pub use health::{is_reachable, round_trip};
pub use operator::{memory_operator, s3_operator, S3Credentials};
