//! Crun Config - 통합 설정
//!
//! 글로벌 → 프로젝트 → 환경변수 순서로 병합되는 CrunConfig

use crate::storage::FileStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// 설정 파일명
pub const CRUN_CONFIG_FILE: &str = "config.toml";

/// Project name; prefix for stacks, tags and log streams
pub const PROJECT_NAME: &str = "crun";

/// Container name the task definition and run overrides target
pub const DEFAULT_CONTAINER_NAME: &str = "main";

// ============================================================================
// Crun Config (통합)
// ============================================================================

/// crun 통합 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrunConfig {
    /// 버전 (마이그레이션용)
    #[serde(default = "default_version")]
    pub version: u32,

    /// Region; blank, `docker` or `local` selects the local Docker driver
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Stack name override; defaults to `crun-<user>`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_name: Option<String>,

    #[serde(default)]
    pub provision: ProvisionConfig,

    #[serde(default)]
    pub logs: LogsConfig,

    #[serde(default)]
    pub timing: TimingConfig,
}

impl Default for CrunConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            region: None,
            stack_name: None,
            provision: ProvisionConfig::default(),
            logs: LogsConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl CrunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// 글로벌 + 프로젝트 + 환경변수 병합 로드
    pub fn load() -> Result<Self> {
        let mut config = Self::new();

        // 1. 글로벌 설정
        if let Ok(global) = FileStore::global() {
            if let Some(global_config) = global.load_toml::<CrunConfig>(CRUN_CONFIG_FILE)? {
                debug!("Loaded global config from {}", global.file_path(CRUN_CONFIG_FILE).display());
                config.merge(global_config);
            }
        }

        // 2. 프로젝트 설정
        if let Ok(project) = FileStore::current_project() {
            if let Some(project_config) = project.load_toml::<CrunConfig>(CRUN_CONFIG_FILE)? {
                debug!("Loaded project config from {}", project.file_path(CRUN_CONFIG_FILE).display());
                config.merge(project_config);
            }
        }

        // 3. 환경변수
        config.apply_env(|key| std::env::var(key).ok());

        config.validate()?;
        Ok(config)
    }

    /// Load from a single store
    pub fn load_from(store: &FileStore) -> Result<Self> {
        let mut config = Self::new();
        if let Some(file_config) = store.load_toml::<CrunConfig>(CRUN_CONFIG_FILE)? {
            config.merge(file_config);
        }
        config.validate()?;
        Ok(config)
    }

    /// Overlay `AWS_REGION` and `CRUN_STACK`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(region) = lookup("AWS_REGION").filter(|r| !r.is_empty()) {
            self.region = Some(region);
        }
        if let Some(stack) = lookup("CRUN_STACK").filter(|s| !s.is_empty()) {
            self.stack_name = Some(stack);
        }
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// 다른 설정과 병합 (other가 우선)
    pub fn merge(&mut self, other: CrunConfig) {
        if other.region.is_some() {
            self.region = other.region;
        }
        if other.stack_name.is_some() {
            self.stack_name = other.stack_name;
        }

        self.provision.merge(other.provision);
        self.logs.merge(other.logs);
        self.timing.merge(other.timing);
    }

    /// Rejects values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.logs.stream_prefix.trim().is_empty() {
            return Err(Error::Config("logs.streamPrefix must not be empty".into()));
        }
        if self.logs.container_name.trim().is_empty() {
            return Err(Error::Config("logs.containerName must not be empty".into()));
        }
        if let Some(stack) = &self.stack_name {
            if stack.trim().is_empty() {
                return Err(Error::Config("stackName must not be empty".into()));
            }
        }
        let intervals = [
            ("logs.retryIntervalMs", self.logs.retry_interval_ms),
            ("timing.stackPollIntervalMs", self.timing.stack_poll_interval_ms),
            ("timing.stackTimeoutSecs", self.timing.stack_timeout_secs),
            ("timing.statusPollIntervalMs", self.timing.status_poll_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }

    // ========================================================================
    // Derived values
    // ========================================================================

    /// Stack name: explicit override, else `crun-<user>`
    pub fn resolved_stack_name(&self) -> String {
        match &self.stack_name {
            Some(name) => name.clone(),
            None => stack_name_for_user(&current_user()),
        }
    }

    /// Region with surrounding whitespace removed (empty when unset)
    pub fn region(&self) -> &str {
        self.region.as_deref().map(str::trim).unwrap_or("")
    }

    // ========================================================================
    // Builder
    // ========================================================================

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_stack_name(mut self, stack: impl Into<String>) -> Self {
        self.stack_name = Some(stack.into());
        self
    }
}

// ============================================================================
// Provision Config
// ============================================================================

/// Stack provisioning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionConfig {
    /// Keep the state bucket when the stack is deleted (default: true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retain_bucket: Option<bool>,

    /// Use FARGATE_SPOT capacity (default: false)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spot: Option<bool>,

    /// Existing VPC; when unset the stack creates its own
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpc_id: Option<String>,

    /// Subnet override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,

    /// Security group override; disables public IP assignment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_group_id: Option<String>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            retain_bucket: None,
            spot: None,
            vpc_id: None,
            subnet_id: None,
            security_group_id: None,
        }
    }
}

impl ProvisionConfig {
    pub fn retain_bucket(&self) -> bool {
        self.retain_bucket.unwrap_or(true)
    }

    pub fn spot(&self) -> bool {
        self.spot.unwrap_or(false)
    }

    // 설정되지 않은 값은 이전 레이어를 유지
    fn merge(&mut self, other: ProvisionConfig) {
        if other.retain_bucket.is_some() {
            self.retain_bucket = other.retain_bucket;
        }
        if other.spot.is_some() {
            self.spot = other.spot;
        }
        if other.vpc_id.is_some() {
            self.vpc_id = other.vpc_id;
        }
        if other.subnet_id.is_some() {
            self.subnet_id = other.subnet_id;
        }
        if other.security_group_id.is_some() {
            self.security_group_id = other.security_group_id;
        }
    }
}

// ============================================================================
// Logs Config
// ============================================================================

/// Log naming and tailing knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsConfig {
    /// `awslogs-stream-prefix` of the task definition
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,

    /// Container whose stream is tailed
    #[serde(default = "default_container_name")]
    pub container_name: String,

    /// Retry tick for log destinations that do not exist yet (ms)
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Page size of the late-subscriber history query
    #[serde(default = "default_backfill_page_size")]
    pub backfill_page_size: u32,

    /// Upper bound on events returned by the history query
    #[serde(default = "default_backfill_limit")]
    pub backfill_limit: usize,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            stream_prefix: default_stream_prefix(),
            container_name: default_container_name(),
            retry_interval_ms: default_retry_interval_ms(),
            backfill_page_size: default_backfill_page_size(),
            backfill_limit: default_backfill_limit(),
        }
    }
}

impl LogsConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    fn merge(&mut self, other: LogsConfig) {
        if other.stream_prefix != default_stream_prefix() {
            self.stream_prefix = other.stream_prefix;
        }
        if other.container_name != default_container_name() {
            self.container_name = other.container_name;
        }
        if other.retry_interval_ms != default_retry_interval_ms() {
            self.retry_interval_ms = other.retry_interval_ms;
        }
        if other.backfill_page_size != default_backfill_page_size() {
            self.backfill_page_size = other.backfill_page_size;
        }
        if other.backfill_limit != default_backfill_limit() {
            self.backfill_limit = other.backfill_limit;
        }
    }
}

// ============================================================================
// Timing Config
// ============================================================================

/// Poll intervals and deadlines
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingConfig {
    /// Stack waiter poll tick (ms)
    #[serde(default = "default_stack_poll_interval_ms")]
    pub stack_poll_interval_ms: u64,

    /// Stack create/update/delete deadline (초)
    #[serde(default = "default_stack_timeout_secs")]
    pub stack_timeout_secs: u64,

    /// Task status poll tick while tailing (ms)
    #[serde(default = "default_status_poll_interval_ms")]
    pub status_poll_interval_ms: u64,

    /// How long buffered events are drained after the task stops (ms)
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            stack_poll_interval_ms: default_stack_poll_interval_ms(),
            stack_timeout_secs: default_stack_timeout_secs(),
            status_poll_interval_ms: default_status_poll_interval_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl TimingConfig {
    pub fn stack_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stack_poll_interval_ms)
    }

    pub fn stack_timeout(&self) -> Duration {
        Duration::from_secs(self.stack_timeout_secs)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    fn merge(&mut self, other: TimingConfig) {
        if other.stack_poll_interval_ms != default_stack_poll_interval_ms() {
            self.stack_poll_interval_ms = other.stack_poll_interval_ms;
        }
        if other.stack_timeout_secs != default_stack_timeout_secs() {
            self.stack_timeout_secs = other.stack_timeout_secs;
        }
        if other.status_poll_interval_ms != default_status_poll_interval_ms() {
            self.status_poll_interval_ms = other.status_poll_interval_ms;
        }
        if other.drain_timeout_ms != default_drain_timeout_ms() {
            self.drain_timeout_ms = other.drain_timeout_ms;
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// `USER`, then `USERNAME`, then "unknown"
pub fn current_user() -> String {
    ["USER", "USERNAME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|user| !user.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// `crun` for an empty user, `crun-<user>` otherwise
pub fn stack_name_for_user(user: &str) -> String {
    if user.is_empty() {
        PROJECT_NAME.to_string()
    } else {
        format!("{}-{}", PROJECT_NAME, user)
    }
}

fn default_version() -> u32 {
    1
}

fn default_stream_prefix() -> String {
    PROJECT_NAME.to_string()
}

fn default_container_name() -> String {
    DEFAULT_CONTAINER_NAME.to_string()
}

fn default_retry_interval_ms() -> u64 {
    1000
}

fn default_backfill_page_size() -> u32 {
    1000
}

fn default_backfill_limit() -> usize {
    10_000
}

fn default_stack_poll_interval_ms() -> u64 {
    1000
}

fn default_stack_timeout_secs() -> u64 {
    180
}

fn default_status_poll_interval_ms() -> u64 {
    3000
}

fn default_drain_timeout_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_crun_config_default() {
        let config = CrunConfig::new();
        assert_eq!(config.version, 1);
        assert!(config.region.is_none());
        assert!(config.provision.retain_bucket());
        assert!(!config.provision.spot());
        assert_eq!(config.logs.stream_prefix, "crun");
        assert_eq!(config.logs.container_name, "main");
        assert_eq!(config.timing.stack_timeout(), Duration::from_secs(180));
        assert_eq!(config.logs.retry_interval(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_merge() {
        let mut base = CrunConfig::new().with_region("us-west-2");
        let mut other = CrunConfig::new().with_stack_name("team");
        other.timing.status_poll_interval_ms = 500;
        other.provision.vpc_id = Some("vpc-123".into());

        base.merge(other);

        assert_eq!(base.region(), "us-west-2");
        assert_eq!(base.resolved_stack_name(), "team");
        assert_eq!(base.timing.status_poll_interval(), Duration::from_millis(500));
        assert_eq!(base.timing.stack_poll_interval(), Duration::from_secs(1));
        assert_eq!(base.provision.vpc_id.as_deref(), Some("vpc-123"));
    }

    #[test]
    fn test_apply_env() {
        let env: HashMap<&str, &str> = [("AWS_REGION", "eu-west-1"), ("CRUN_STACK", "")]
            .into_iter()
            .collect();
        let mut config = CrunConfig::new().with_stack_name("kept");
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.region(), "eu-west-1");
        assert_eq!(config.stack_name.as_deref(), Some("kept"));
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut config = CrunConfig::new();
        config.logs.retry_interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retryIntervalMs"));

        let mut config = CrunConfig::new();
        config.logs.container_name = " ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        std::fs::write(
            store.file_path(CRUN_CONFIG_FILE),
            r#"
region = "sim"
stackName = "crun-ci"

[provision]
retainBucket = false
spot = true

[timing]
stackTimeoutSecs = 60
"#,
        )
        .unwrap();

        let config = CrunConfig::load_from(&store).unwrap();
        assert_eq!(config.region(), "sim");
        assert_eq!(config.resolved_stack_name(), "crun-ci");
        assert!(!config.provision.retain_bucket());
        assert!(config.provision.spot());
        assert_eq!(config.timing.stack_timeout(), Duration::from_secs(60));
        assert_eq!(config.logs.stream_prefix, "crun");
    }

    #[test]
    fn test_project_layer_keeps_global_provision_flags() {
        let global = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        std::fs::write(
            global.path().join(CRUN_CONFIG_FILE),
            "[provision]\nretainBucket = false\nspot = true\n",
        )
        .unwrap();
        std::fs::write(project.path().join(CRUN_CONFIG_FILE), "region = \"sim\"\n").unwrap();

        let mut config = CrunConfig::load_from(&FileStore::new(global.path())).unwrap();
        config.merge(CrunConfig::load_from(&FileStore::new(project.path())).unwrap());

        assert_eq!(config.region(), "sim");
        assert!(!config.provision.retain_bucket());
        assert!(config.provision.spot());

        // 프로젝트에서 명시하면 덮어씀
        std::fs::write(
            project.path().join(CRUN_CONFIG_FILE),
            "[provision]\nretainBucket = true\n",
        )
        .unwrap();
        config.merge(CrunConfig::load_from(&FileStore::new(project.path())).unwrap());
        assert!(config.provision.retain_bucket());
        assert!(config.provision.spot());
    }

    #[test]
    fn test_stack_name_for_user() {
        assert_eq!(stack_name_for_user(""), "crun");
        assert_eq!(stack_name_for_user("alice"), "crun-alice");
    }
}
