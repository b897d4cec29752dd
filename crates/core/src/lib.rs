//! infw 공통 크레이트
//!
//! 인그레스 노드 방화벽의 모든 크레이트가 공유하는 에러 타입, 설정,
//! 룰 명세 도메인 타입, 메트릭 이름을 정의합니다.

pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

// --- 주요 타입 re-export ---

// 에러
pub use error::{ConfigError, EngineError, InfwError, RuleError};

// 설정
pub use config::InfwConfig;

// 도메인 타입
pub use types::{
    IcmpRule, IngressRule, InterfaceRules, PortRange, PortRule, Protocol, ProtocolRule,
    RuleAction, SourceCidr,
};
