//! 동기화 에러: 인코딩, 어태치, 테이블 설치, 서비스 큐 실패
//!
//! 인터페이스별 실패는 즉시 중단하지 않고 모아서 하나의 [`SyncError`]로 반환합니다.

use std::fmt;

use infw_core::error::{EngineError, RuleError};

/// 단일 인터페이스의 어태치/디태치 실패
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceFailure {
    /// 인터페이스 이름
    pub interface: String,
    /// 수행하던 작업
    pub operation: InterfaceOp,
    /// 실패 사유
    pub reason: String,
}

/// 인터페이스 작업 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceOp {
    /// XDP 어태치
    Attach,
    /// XDP 디태치
    Detach,
}

impl InterfaceOp {
    /// 메트릭 라벨 값
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Attach => "attach",
            Self::Detach => "detach",
        }
    }
}

impl fmt::Display for InterfaceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} '{}': {}",
            self.operation.as_str(),
            self.interface,
            self.reason
        )
    }
}

/// 동기화 에러
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// 방화벽 인스턴스(커널 프로그램/오프로드 컨트롤러) 생성 실패
    #[error("failed to create firewall instance: {0}")]
    InstanceCreationFailed(String),

    /// 인터페이스 이름 또는 상태가 유효하지 않아 건너뜀
    #[error("invalid interface '{0}'")]
    InvalidInterface(String),

    /// 프리픽스 하나의 룰 수가 버킷 용량을 초과함
    #[error("{interface} {prefix}: {count} rules exceed bucket capacity of {limit}")]
    CapacityExceeded {
        interface: String,
        prefix: String,
        count: usize,
        limit: usize,
    },

    /// 룰 명세 오류 (CIDR, 포트, order)
    #[error("invalid rule: {0}")]
    InvalidRule(#[from] RuleError),

    /// 하나 이상의 인터페이스 어태치/디태치 실패
    #[error("attach/detach failed: {}", join(.0))]
    AttachDetachFailed(Vec<InterfaceFailure>),

    /// 룰 테이블 설치 실패 (이전 테이블은 유지)
    #[error("failed to install rule table: {0}")]
    TableInstallFailed(String),

    /// 여러 단계의 실패 묶음
    #[error("{} errors: {}", .0.len(), join(.0))]
    Aggregate(Vec<SyncError>),

    /// 동기화 서비스가 종료됨
    #[error("sync service stopped")]
    ServiceStopped,
}

impl SyncError {
    /// 에러 목록을 하나의 에러로 합칩니다. 비어 있으면 `None`입니다.
    pub fn aggregate(mut errors: Vec<SyncError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Aggregate(errors)),
        }
    }

    /// 이 에러(또는 묶음 안의 에러) 중 조건을 만족하는 것이 있는지 확인합니다.
    pub fn any(&self, pred: &impl Fn(&SyncError) -> bool) -> bool {
        match self {
            Self::Aggregate(errors) => errors.iter().any(|e| e.any(pred)),
            other => pred(other),
        }
    }
}

impl From<EngineError> for SyncError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::ProgramLoad(reason) => Self::InstanceCreationFailed(reason),
            EngineError::InterfaceLookup { interface, .. } => Self::InvalidInterface(interface),
            other => Self::TableInstallFailed(other.to_string()),
        }
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_of_one_is_the_error_itself() {
        let err = SyncError::aggregate(vec![SyncError::InvalidInterface("eth9".to_owned())]);
        assert_eq!(err, Some(SyncError::InvalidInterface("eth9".to_owned())));
        assert_eq!(SyncError::aggregate(Vec::new()), None);
    }

    #[test]
    fn aggregate_display_lists_every_error() {
        let err = SyncError::aggregate(vec![
            SyncError::InvalidInterface("eth9".to_owned()),
            SyncError::AttachDetachFailed(vec![InterfaceFailure {
                interface: "eth1".to_owned(),
                operation: InterfaceOp::Attach,
                reason: "device busy".to_owned(),
            }]),
        ])
        .unwrap();

        let msg = err.to_string();
        assert!(msg.starts_with("2 errors"));
        assert!(msg.contains("eth9"));
        assert!(msg.contains("attach 'eth1': device busy"));
    }

    #[test]
    fn any_searches_nested_errors() {
        let err = SyncError::Aggregate(vec![
            SyncError::TableInstallFailed("map full".to_owned()),
            SyncError::InvalidInterface("eth9".to_owned()),
        ]);
        assert!(err.any(&|e| matches!(e, SyncError::InvalidInterface(_))));
        assert!(!err.any(&|e| matches!(e, SyncError::ServiceStopped)));
    }

    #[test]
    fn engine_error_conversion() {
        let err: SyncError = EngineError::InterfaceLookup {
            interface: "eth3".to_owned(),
            reason: "no such device".to_owned(),
        }
        .into();
        assert_eq!(err, SyncError::InvalidInterface("eth3".to_owned()));

        let err: SyncError = EngineError::ProgramLoad("verifier rejected".to_owned()).into();
        assert!(matches!(err, SyncError::InstanceCreationFailed(_)));
    }
}
