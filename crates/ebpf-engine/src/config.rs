//! 엔진 설정: core 설정 변환 및 룰 파일 로딩
//!
//! [`EngineConfig`]는 core의 [`InfwConfig`]에서 엔진이 쓰는 값만 꺼내
//! 타입이 있는 형태로 변환합니다. 문자열 검증은 core의 `validate()`가 담당하고,
//! 여기서는 이미 검증된 값을 enum으로 바꿉니다.
//!
//! # 룰 파일 예시 (TOML)
//! ```toml
//! [[interfaces.eth0]]
//! sourceCIDRs = ["172.16.0.0/12"]
//!
//! [[interfaces.eth0.rules]]
//! order = 10
//! protocol = "ICMP"
//! icmpRule = { icmpType = 8 }
//! action = "Deny"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use infw_core::config::InfwConfig;
use infw_core::error::{ConfigError, InfwError};
use infw_core::types::{InterfaceRules, RuleAction};

/// 룰 싱크 백엔드 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// 커널 XDP 분류기
    Xdp,
    /// 외부 오프로드 프로그램
    Offload,
}

/// XDP 어태치 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XdpMode {
    /// 드라이버 네이티브 모드 (실패 시 SKB 모드로 폴백)
    Native,
    /// 범용 SKB 모드
    Skb,
    /// NIC 하드웨어 오프로드
    Hw,
}

/// 외부 명령 (프로그램 + 인자)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// 실행 파일 경로
    pub program: String,
    /// 인자 목록
    pub args: Vec<String>,
}

/// 오프로드 백엔드 명령 설정
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffloadCommands {
    /// 표준 입력으로 JSON 룰 맵을 받아 적용하는 명령
    pub offload: CommandSpec,
    /// 적용한 룰을 모두 제거하는 명령
    pub flush: CommandSpec,
}

/// 엔진 설정
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 룰 싱크 백엔드
    pub backend: BackendKind,
    /// XDP 분류기 오브젝트 파일
    pub bpf_object: PathBuf,
    /// XDP 어태치 모드
    pub xdp_mode: XdpMode,
    /// 매칭 실패 시 기본 액션
    pub default_action: RuleAction,
    /// 매칭 이벤트 수집 여부
    pub events_enabled: bool,
    /// 이벤트 채널 용량
    pub event_channel_capacity: usize,
    /// 오프로드 명령
    pub offload: OffloadCommands,
}

impl EngineConfig {
    /// 검증된 core 설정에서 엔진 설정을 생성합니다.
    pub fn from_core(config: &InfwConfig) -> Result<Self, InfwError> {
        let fw = &config.firewall;

        let backend = match fw.backend.as_str() {
            "xdp" => BackendKind::Xdp,
            "offload" => BackendKind::Offload,
            other => return Err(invalid("firewall.backend", other)),
        };
        let xdp_mode = match fw.xdp_mode.as_str() {
            "native" => XdpMode::Native,
            "skb" => XdpMode::Skb,
            "hw" => XdpMode::Hw,
            other => return Err(invalid("firewall.xdp_mode", other)),
        };

        Ok(Self {
            backend,
            bpf_object: PathBuf::from(&fw.bpf_object),
            xdp_mode,
            default_action: fw.default_action()?,
            events_enabled: fw.events_enabled,
            event_channel_capacity: fw.event_channel_capacity,
            offload: OffloadCommands {
                offload: CommandSpec {
                    program: config.offload.command.clone(),
                    args: config.offload.args.clone(),
                },
                flush: CommandSpec {
                    program: config.offload.flush_command.clone(),
                    args: config.offload.flush_args.clone(),
                },
            },
        })
    }
}

fn invalid(field: &str, value: &str) -> InfwError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason: format!("unsupported value '{value}'"),
    }
    .into()
}

/// TOML 룰 파일의 최상위 구조
#[derive(Debug, Clone, Deserialize)]
struct RulesFile {
    #[serde(default)]
    interfaces: InterfaceRules,
}

/// TOML 파일에서 인터페이스별 룰을 로드합니다.
///
/// 파일이 존재하지 않으면 빈 맵(관리 대상 인터페이스 없음)을 반환합니다.
pub async fn load_rules(path: impl AsRef<Path>) -> Result<InterfaceRules, InfwError> {
    let path = path.as_ref();
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "rules file not found, using empty rule set");
            return Ok(InterfaceRules::new());
        }
        Err(e) => return Err(InfwError::Io(e)),
    };
    parse_rules(&content)
}

/// TOML 문자열에서 인터페이스별 룰을 파싱하고 각 룰을 검증합니다.
///
/// order 범위/중복과 버킷 용량은 인코딩 단계에서 검사합니다.
pub fn parse_rules(toml_str: &str) -> Result<InterfaceRules, InfwError> {
    let file: RulesFile = toml::from_str(toml_str).map_err(|e| {
        InfwError::Config(ConfigError::ParseFailed {
            reason: e.to_string(),
        })
    })?;

    for ingress in file.interfaces.values().flatten() {
        ingress.parsed_cidrs()?;
        for rule in &ingress.protocol_rules {
            rule.validate()?;
        }
    }
    Ok(file.interfaces)
}

#[cfg(test)]
mod tests {
    use super::*;
    use infw_core::error::RuleError;
    use infw_core::types::Protocol;

    #[test]
    fn from_core_defaults() {
        let config = EngineConfig::from_core(&InfwConfig::default()).unwrap();
        assert_eq!(config.backend, BackendKind::Xdp);
        assert_eq!(config.xdp_mode, XdpMode::Skb);
        assert_eq!(config.default_action, RuleAction::Allow);
        assert_eq!(config.offload.flush.program, "/bin/sh");
    }

    #[test]
    fn from_core_offload_deny() {
        let mut core = InfwConfig::default();
        core.firewall.backend = "offload".to_owned();
        core.firewall.default_action = "deny".to_owned();
        core.firewall.xdp_mode = "native".to_owned();

        let config = EngineConfig::from_core(&core).unwrap();
        assert_eq!(config.backend, BackendKind::Offload);
        assert_eq!(config.xdp_mode, XdpMode::Native);
        assert_eq!(config.default_action, RuleAction::Deny);
    }

    #[test]
    fn from_core_rejects_unknown_backend() {
        let mut core = InfwConfig::default();
        core.firewall.backend = "tc".to_owned();
        assert!(EngineConfig::from_core(&core).is_err());
    }

    #[test]
    fn parse_rules_reads_interfaces() {
        let toml = r#"
[[interfaces.eth0]]
sourceCIDRs = ["172.16.0.0/12"]

[[interfaces.eth0.rules]]
order = 10
protocol = "ICMP"
icmpRule = { icmpType = 8 }
action = "Deny"

[[interfaces.eth0.rules]]
order = 20
protocol = "TCP"
protocolRule = { ports = "800-900" }
action = "Allow"
"#;
        let rules = parse_rules(toml).unwrap();
        let eth0 = &rules["eth0"];
        assert_eq!(eth0.len(), 1);
        assert_eq!(eth0[0].protocol_rules.len(), 2);
        assert_eq!(eth0[0].protocol_rules[0].protocol, Protocol::Icmp);
        assert_eq!(eth0[0].protocol_rules[1].action, RuleAction::Allow);
    }

    #[test]
    fn parse_rules_empty_is_empty_map() {
        assert!(parse_rules("").unwrap().is_empty());
    }

    #[test]
    fn parse_rules_rejects_bad_cidr() {
        let toml = r#"
[[interfaces.eth0]]
sourceCIDRs = ["10.0.0.0"]
"#;
        let err = parse_rules(toml).unwrap_err();
        assert!(matches!(
            err,
            InfwError::Rule(RuleError::InvalidCidr { .. })
        ));
    }

    #[test]
    fn parse_rules_rejects_port_matcher_on_icmp() {
        let toml = r#"
[[interfaces.eth0]]
sourceCIDRs = ["10.0.0.0/8"]

[[interfaces.eth0.rules]]
order = 1
protocol = "ICMP"
protocolRule = { ports = "80" }
action = "Deny"
"#;
        let err = parse_rules(toml).unwrap_err();
        assert!(matches!(
            err,
            InfwError::Rule(RuleError::InvalidRule { order: 1, .. })
        ));
    }

    #[tokio::test]
    async fn load_rules_missing_file_is_empty() {
        let rules = load_rules("/nonexistent/infw/rules.toml").await.unwrap();
        assert!(rules.is_empty());
    }

    #[tokio::test]
    async fn load_rules_example_file() {
        let rules = load_rules(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../../rules.toml.example"
        ))
        .await
        .unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules["eth0"].len(), 2);
        assert_eq!(rules["eth1"][0].source_cidrs, vec!["0.0.0.0/0"]);
    }
}
