//! Run state - 마지막으로 실행한 태스크 기록

use crate::storage::FileStore;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 상태 파일명
pub const RUN_STATE_FILE: &str = "state.json";

/// Last task started per stack, so `logs`/`stop`/`info` accept a bare task id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    #[serde(default)]
    pub last_task: BTreeMap<String, String>,
}

impl RunState {
    pub fn load(store: &FileStore) -> Result<Self> {
        Ok(store.load_json(RUN_STATE_FILE)?.unwrap_or_default())
    }

    pub fn save(&self, store: &FileStore) -> Result<()> {
        store.save_json(RUN_STATE_FILE, self)
    }

    pub fn record(&mut self, stack: impl Into<String>, task: impl Into<String>) {
        self.last_task.insert(stack.into(), task.into());
    }

    pub fn last_task(&self, stack: &str) -> Option<&str> {
        self.last_task.get(stack).map(String::as_str)
    }

    pub fn forget(&mut self, stack: &str) {
        self.last_task.remove(stack);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let mut state = RunState::load(&store).unwrap();
        assert!(state.last_task("crun-alice").is_none());

        state.record("crun-alice", "arn:aws:ecs:us-west-2:123456789012:task/c/abc");
        state.save(&store).unwrap();

        let mut reloaded = RunState::load(&store).unwrap();
        assert_eq!(reloaded, state);
        reloaded.forget("crun-alice");
        assert!(reloaded.last_task("crun-alice").is_none());
    }
}
