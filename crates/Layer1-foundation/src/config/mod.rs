//! Config - 통합 설정 관리
//!
//! - `crun.rs` - CrunConfig 통합 설정
//! - `state.rs` - RunState (마지막 태스크 기록)

mod crun;
mod state;

pub use crun::{
    current_user, stack_name_for_user, CrunConfig, LogsConfig, ProvisionConfig, TimingConfig,
    CRUN_CONFIG_FILE, DEFAULT_CONTAINER_NAME, PROJECT_NAME,
};
pub use state::{RunState, RUN_STATE_FILE};
