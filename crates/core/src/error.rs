//! 에러 타입: 도메인별 에러 정의

/// infw 최상위 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum InfwError {
    /// 설정 관련 에러
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 룰 명세 에러
    #[error("rule error: {0}")]
    Rule(#[from] RuleError),

    /// 커널 엔진 에러
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 설정 관련 에러
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 설정 파일을 찾을 수 없음
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// 설정 파싱 실패
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// 유효하지 않은 설정 값
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 룰 명세 에러
///
/// 사용자 입력(룰 파일, 컨트롤러가 전달한 원하는 상태)이 잘못된 경우입니다.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    /// CIDR 파싱 실패
    #[error("invalid source CIDR '{cidr}': {reason}")]
    InvalidCidr { cidr: String, reason: String },

    /// 포트 또는 포트 범위 파싱 실패
    #[error("invalid port range '{ports}': {reason}")]
    InvalidPortRange { ports: String, reason: String },

    /// 룰 필드 조합 또는 값이 유효하지 않음
    #[error("invalid rule (order {order}): {reason}")]
    InvalidRule { order: u32, reason: String },
}

/// 커널 엔진 에러
///
/// eBPF 프로그램 로드, 맵 접근, XDP 어태치 등 커널 자원과의 상호작용 실패입니다.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// eBPF 프로그램 로드 실패
    #[error("ebpf load failed: {0}")]
    ProgramLoad(String),

    /// eBPF 맵 접근 실패
    #[error("ebpf map error: {0}")]
    MapAccess(String),

    /// 인터페이스 조회 실패
    #[error("interface '{interface}' lookup failed: {reason}")]
    InterfaceLookup { interface: String, reason: String },

    /// XDP 어태치 실패
    #[error("attach to '{interface}' failed: {reason}")]
    Attach { interface: String, reason: String },

    /// XDP 디태치 실패
    #[error("detach from '{interface}' failed: {reason}")]
    Detach { interface: String, reason: String },

    /// 외부 오프로드 프로그램 실행 실패
    #[error("offload command failed: {0}")]
    Offload(String),

    /// 현재 플랫폼에서 지원하지 않음
    #[error("unsupported: {0}")]
    Unsupported(String),
}
