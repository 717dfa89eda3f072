//! # crun-foundation
//!
//! Foundation layer for crun:
//! - Error: 엔진 전체가 공유하는 에러 타입
//! - Config: 통합 설정 (CrunConfig, RunState)
//! - Storage: FileStore (TOML 설정, JSON 상태)

pub mod config;
pub mod error;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{
    current_user, stack_name_for_user, CrunConfig, LogsConfig, ProvisionConfig, RunState,
    TimingConfig, CRUN_CONFIG_FILE, DEFAULT_CONTAINER_NAME, PROJECT_NAME, RUN_STATE_FILE,
};

// ============================================================================
// Storage (저장소)
// ============================================================================
pub use storage::FileStore;
