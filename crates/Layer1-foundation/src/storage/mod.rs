//! Storage module for crun
//!
//! - `store`: 설정(TOML) 및 상태(JSON) 파일 저장/로드

mod store;

pub use store::FileStore;
