//! 설정 관리: infw.toml 파싱 및 런타임 설정
//!
//! [`InfwConfig`]는 모든 모듈의 설정을 담는 최상위 구조체입니다.
//!
//! # 설정 로딩 우선순위
//! 1. CLI 인자 (최고 우선)
//! 2. 환경변수 (`INFW_FIREWALL_BACKEND=offload` 형식)
//! 3. 설정 파일 (`infw.toml`)
//! 4. 기본값 (`Default` 구현)
//!
//! # 사용 예시
//! ```no_run
//! # async fn example() -> Result<(), infw_core::error::InfwError> {
//! use infw_core::config::InfwConfig;
//!
//! // 파일에서 로드 + 환경변수 오버라이드
//! let config = InfwConfig::load("infw.toml").await?;
//!
//! // TOML 문자열에서 직접 파싱
//! let config = InfwConfig::parse("[general]\nlog_level = \"debug\"")?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, InfwError};
use crate::types::RuleAction;

/// infw 통합 설정
///
/// `infw.toml` 파일의 최상위 구조를 나타냅니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfwConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// 방화벽 엔진 설정
    #[serde(default)]
    pub firewall: FirewallConfig,
    /// 외부 오프로드 백엔드 설정
    #[serde(default)]
    pub offload: OffloadConfig,
}

impl InfwConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, InfwError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                InfwError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                InfwError::Io(e)
            }
        })?;
        let mut config = Self::parse(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, InfwError> {
        toml::from_str(toml_str).map_err(|e| {
            InfwError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 환경변수 네이밍 규칙: `INFW_{SECTION}_{FIELD}`
    /// 예: `INFW_FIREWALL_DEFAULT_ACTION=deny`
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "INFW_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "INFW_GENERAL_LOG_FORMAT");

        // Firewall
        override_string(&mut self.firewall.backend, "INFW_FIREWALL_BACKEND");
        override_string(&mut self.firewall.bpf_object, "INFW_FIREWALL_BPF_OBJECT");
        override_string(&mut self.firewall.xdp_mode, "INFW_FIREWALL_XDP_MODE");
        override_string(
            &mut self.firewall.default_action,
            "INFW_FIREWALL_DEFAULT_ACTION",
        );
        override_string(&mut self.firewall.rules_path, "INFW_FIREWALL_RULES_PATH");
        override_u64(
            &mut self.firewall.stats_interval_secs,
            "INFW_FIREWALL_STATS_INTERVAL_SECS",
        );
        override_bool(
            &mut self.firewall.events_enabled,
            "INFW_FIREWALL_EVENTS_ENABLED",
        );
        override_usize(
            &mut self.firewall.event_channel_capacity,
            "INFW_FIREWALL_EVENT_CHANNEL_CAPACITY",
        );

        // Offload
        override_string(&mut self.offload.command, "INFW_OFFLOAD_COMMAND");
        override_args(&mut self.offload.args, "INFW_OFFLOAD_ARGS");
        override_string(&mut self.offload.flush_command, "INFW_OFFLOAD_FLUSH_COMMAND");
        override_args(&mut self.offload.flush_args, "INFW_OFFLOAD_FLUSH_ARGS");
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), InfwError> {
        check_one_of(
            "general.log_level",
            &self.general.log_level,
            &["trace", "debug", "info", "warn", "error"],
        )?;
        check_one_of(
            "general.log_format",
            &self.general.log_format,
            &["json", "pretty"],
        )?;
        check_one_of(
            "firewall.backend",
            &self.firewall.backend,
            &["xdp", "offload"],
        )?;

        if let Err(reason) = self.firewall.default_action.parse::<RuleAction>() {
            return Err(ConfigError::InvalidValue {
                field: "firewall.default_action".to_owned(),
                reason,
            }
            .into());
        }

        if self.firewall.stats_interval_secs == 0 {
            return Err(invalid("firewall.stats_interval_secs", "must be greater than 0"));
        }
        if self.firewall.event_channel_capacity == 0 {
            return Err(invalid(
                "firewall.event_channel_capacity",
                "must be greater than 0",
            ));
        }

        match self.firewall.backend.as_str() {
            "xdp" => {
                check_one_of(
                    "firewall.xdp_mode",
                    &self.firewall.xdp_mode,
                    &["native", "skb", "hw"],
                )?;
                if self.firewall.bpf_object.is_empty() {
                    return Err(invalid(
                        "firewall.bpf_object",
                        "object path must not be empty when backend is 'xdp'",
                    ));
                }
            }
            _ => {
                if self.offload.command.is_empty() {
                    return Err(invalid(
                        "offload.command",
                        "command must not be empty when backend is 'offload'",
                    ));
                }
            }
        }

        Ok(())
    }
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
        }
    }
}

/// 방화벽 엔진 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// 룰 싱크 백엔드 (xdp, offload)
    pub backend: String,
    /// XDP 분류기 오브젝트 파일 경로
    pub bpf_object: String,
    /// XDP 모드 (native, skb, hw)
    pub xdp_mode: String,
    /// 매칭되는 프리픽스/룰이 없을 때의 기본 액션 (allow, deny)
    pub default_action: String,
    /// 원하는 상태(인터페이스별 룰) 파일 경로
    pub rules_path: String,
    /// 룰 통계 폴링 주기 (초)
    pub stats_interval_secs: u64,
    /// 매칭 이벤트 수집 활성화
    pub events_enabled: bool,
    /// 이벤트 채널 용량 (초과 시 이벤트 드롭)
    pub event_channel_capacity: usize,
}

impl FirewallConfig {
    /// 기본 액션을 파싱합니다. `validate()` 이후에는 실패하지 않습니다.
    pub fn default_action(&self) -> Result<RuleAction, InfwError> {
        self.default_action.parse().map_err(|reason| {
            ConfigError::InvalidValue {
                field: "firewall.default_action".to_owned(),
                reason,
            }
            .into()
        })
    }
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            backend: "xdp".to_owned(),
            bpf_object: "/usr/lib/infw/infw-ebpf".to_owned(),
            xdp_mode: "skb".to_owned(),
            default_action: "allow".to_owned(),
            rules_path: "/etc/infw/rules.toml".to_owned(),
            stats_interval_secs: 10,
            events_enabled: true,
            event_channel_capacity: 1024,
        }
    }
}

/// 외부 오프로드 백엔드 설정
///
/// `command`는 표준 입력으로 JSON 룰 맵을 받아 적용하고,
/// `flush_command`는 적용한 룰을 모두 제거합니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    /// 룰 적용 명령
    pub command: String,
    /// 룰 적용 명령 인자
    pub args: Vec<String>,
    /// 룰 제거 명령
    pub flush_command: String,
    /// 룰 제거 명령 인자
    pub flush_args: Vec<String>,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            command: "/venv/bin/python3".to_owned(),
            args: [
                "/pypcap-ng/ingress_firewall.py",
                "--mode",
                "iptables",
                "--backend",
                "u32",
                "--flush",
            ]
            .iter()
            .map(|s| (*s).to_owned())
            .collect(),
            flush_command: "/bin/sh".to_owned(),
            flush_args: vec![
                "-c".to_owned(),
                "/sbin/iptables -D INPUT -j IFW; /sbin/iptables -X IFW".to_owned(),
            ],
        }
    }
}

// --- 검증 헬퍼 ---

fn invalid(field: &str, reason: &str) -> InfwError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason: reason.to_owned(),
    }
    .into()
}

fn check_one_of(field: &str, value: &str, allowed: &[&str]) -> Result<(), InfwError> {
    if allowed.contains(&value) {
        return Ok(());
    }
    Err(ConfigError::InvalidValue {
        field: field.to_owned(),
        reason: format!("must be one of: {}", allowed.join(", ")),
    }
    .into())
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<bool>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse bool from env var, ignoring"
            ),
        }
    }
}

fn override_usize(target: &mut usize, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<usize>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse usize from env var, ignoring"
            ),
        }
    }
}

fn override_u64(target: &mut u64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u64 from env var, ignoring"
            ),
        }
    }
}

/// 공백으로 구분된 인자 목록을 오버라이드합니다.
fn override_args(target: &mut Vec<String>, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val.split_whitespace().map(str::to_owned).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let config = InfwConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.general.log_format, "json");
        assert_eq!(config.firewall.backend, "xdp");
        assert_eq!(config.firewall.default_action, "allow");
        assert!(config.firewall.events_enabled);
    }

    #[test]
    fn default_config_passes_validation() {
        InfwConfig::default().validate().unwrap();
    }

    #[test]
    fn from_str_empty_toml_uses_defaults() {
        let config = InfwConfig::parse("").unwrap();
        assert_eq!(config.firewall.xdp_mode, "skb");
        assert_eq!(config.firewall.stats_interval_secs, 10);
    }

    #[test]
    fn from_str_partial_toml_merges_with_defaults() {
        let toml = r#"
[firewall]
backend = "offload"
default_action = "deny"
"#;
        let config = InfwConfig::parse(toml).unwrap();
        assert_eq!(config.firewall.backend, "offload");
        assert_eq!(config.firewall.default_action().unwrap(), RuleAction::Deny);
        // 나머지는 기본값 유지
        assert_eq!(config.firewall.rules_path, "/etc/infw/rules.toml");
        assert_eq!(config.offload.command, "/venv/bin/python3");
        config.validate().unwrap();
    }

    #[test]
    fn from_str_invalid_toml_returns_error() {
        let err = InfwConfig::parse("invalid = [[[toml").unwrap_err();
        assert!(matches!(
            err,
            InfwError::Config(ConfigError::ParseFailed { .. })
        ));
    }

    #[test]
    fn validate_rejects_invalid_log_level() {
        let mut config = InfwConfig::default();
        config.general.log_level = "verbose".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("log_level"));
    }

    #[test]
    fn validate_rejects_unknown_backend() {
        let mut config = InfwConfig::default();
        config.firewall.backend = "nftables".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("firewall.backend"));
    }

    #[test]
    fn validate_rejects_unknown_default_action() {
        let mut config = InfwConfig::default();
        config.firewall.default_action = "drop".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("default_action"));
    }

    #[test]
    fn validate_checks_xdp_mode_only_for_xdp_backend() {
        let mut config = InfwConfig::default();
        config.firewall.xdp_mode = "turbo".to_owned();
        assert!(config.validate().is_err());

        config.firewall.backend = "offload".to_owned();
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_empty_offload_command() {
        let mut config = InfwConfig::default();
        config.firewall.backend = "offload".to_owned();
        config.offload.command = String::new();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("offload.command"));
    }

    #[test]
    fn validate_rejects_zero_intervals() {
        let mut config = InfwConfig::default();
        config.firewall.stats_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = InfwConfig::default();
        config.firewall.event_channel_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_override_missing_var_keeps_original() {
        let mut val = "original".to_owned();
        override_string(&mut val, "TEST_INFW_NONEXISTENT_12345");
        assert_eq!(val, "original");
    }

    #[test]
    fn config_serialize_roundtrip() {
        let config = InfwConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed = InfwConfig::parse(&toml_str).unwrap();
        assert_eq!(config.firewall.bpf_object, parsed.firewall.bpf_object);
        assert_eq!(config.offload.flush_args, parsed.offload.flush_args);
    }

    #[tokio::test]
    async fn load_not_found() {
        let err = InfwConfig::load("/nonexistent/path/infw.toml")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InfwError::Config(ConfigError::FileNotFound { .. })
        ));
    }
}
