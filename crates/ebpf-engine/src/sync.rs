//! 동기화기: 원하는 인터페이스/룰 상태를 현재 어태치 상태에 맞춤
//!
//! [`Synchronizer`]는 방화벽 인스턴스와 관리 중인 인터페이스 집합을 단독으로
//! 소유하며, 모든 변경은 내부 mutex 아래에서 직렬화됩니다.
//! 상태와 관리 목록 조회는 호출이 끝날 때마다 게시되는 스냅샷을 읽으므로
//! 진행 중인 동기화를 기다리지 않습니다.
//!
//! # 상태 전이
//! ```text
//! Uninitialized ──sync──▶ Ready ──delete-all / teardown──▶ Terminating ──▶ Uninitialized
//! ```
//!
//! # 동기화 단계
//! 1. 인스턴스가 없으면 생성 (실패 시 `Uninitialized` 유지)
//! 2. 전체 삭제 요청이면 해제 후 종료
//! 3. 원하는 룰 검증 (실패 시 아무것도 바꾸지 않음)
//! 4. 원하지 않는 인터페이스 디태치, 새 인터페이스 모두 어태치
//! 5. 관리 중인 원하는 인터페이스의 룰 테이블 전체 교체
//!
//! 인터페이스별 실패는 모아서 하나의 에러로 반환하며, 앞 단계는 되돌리지 않습니다.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, info, warn};

use infw_core::error::EngineError;
use infw_core::metrics as m;
use infw_core::types::InterfaceRules;

use crate::backend::{BackendFactory, FirewallBackend};
use crate::codec;
use crate::error::{InterfaceFailure, InterfaceOp, SyncError};

/// 동기화기 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// 인스턴스 없음
    Uninitialized,
    /// 인스턴스 동작 중
    Ready,
    /// 인스턴스 해제 중
    Terminating,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Ready => write!(f, "ready"),
            Self::Terminating => write!(f, "terminating"),
        }
    }
}

/// 성공한 동기화의 결과
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// 새로 어태치된 인터페이스
    pub attached: Vec<String>,
    /// 디태치된 인터페이스
    pub detached: Vec<String>,
    /// 유효하지 않아 건너뛴 인터페이스
    pub skipped: Vec<String>,
    /// 설치된 룰 엔트리 수
    pub rules_installed: usize,
}

struct Inner {
    state: SyncState,
    backend: Option<Box<dyn FirewallBackend>>,
    managed: BTreeSet<String>,
}

/// 조회용 상태 사본
#[derive(Debug, Clone)]
struct Snapshot {
    state: SyncState,
    managed: Vec<String>,
}

/// 방화벽 동기화기
pub struct Synchronizer {
    factory: Box<dyn BackendFactory>,
    inner: Mutex<Inner>,
    snapshot: RwLock<Snapshot>,
}

impl Synchronizer {
    /// 새 동기화기를 생성합니다. 인스턴스는 첫 동기화 때 생성됩니다.
    pub fn new(factory: Box<dyn BackendFactory>) -> Self {
        Self {
            factory,
            inner: Mutex::new(Inner {
                state: SyncState::Uninitialized,
                backend: None,
                managed: BTreeSet::new(),
            }),
            snapshot: RwLock::new(Snapshot {
                state: SyncState::Uninitialized,
                managed: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &Inner) {
        let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        snapshot.state = inner.state;
        snapshot.managed = inner.managed.iter().cloned().collect();
    }

    /// 현재 상태
    ///
    /// 동기화가 진행 중이면 직전에 끝난 호출 기준의 상태입니다 (해제 중에는 `Terminating`).
    pub fn state(&self) -> SyncState {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner).state
    }

    /// 현재 관리 중인(어태치된) 인터페이스
    ///
    /// 진행 중인 동기화를 기다리지 않으며, 직전에 끝난 호출 기준입니다.
    pub fn managed_interfaces(&self) -> Vec<String> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .managed
            .clone()
    }

    /// 원하는 상태로 동기화합니다.
    ///
    /// `is_delete_all`이면 `desired`는 무시하고 모든 인터페이스를 디태치한 뒤
    /// 인스턴스를 해제합니다.
    ///
    /// # 에러
    /// - `InstanceCreationFailed`: 인스턴스 생성 실패 (상태 변화 없음)
    /// - `InvalidRule` / `CapacityExceeded`: 룰 검증 실패 (상태 변화 없음)
    /// - 그 외: 인터페이스별 실패와 테이블 설치 실패의 묶음
    pub fn sync_interface_rules(
        &self,
        desired: &InterfaceRules,
        is_delete_all: bool,
    ) -> Result<SyncReport, SyncError> {
        let mut inner = self.lock();
        let result = self.sync_locked(&mut inner, desired, is_delete_all);
        self.publish(&inner);

        let label = if result.is_ok() { "success" } else { "failure" };
        metrics::counter!(m::SYNC_CALLS_TOTAL, m::LABEL_RESULT => label).increment(1);
        metrics::gauge!(m::SYNC_MANAGED_INTERFACES).set(inner.managed.len() as f64);

        match &result {
            Ok(report) => info!(
                attached = report.attached.len(),
                detached = report.detached.len(),
                skipped = report.skipped.len(),
                rules = report.rules_installed,
                delete_all = is_delete_all,
                "interface rules synchronized"
            ),
            Err(e) => warn!(error = %e, delete_all = is_delete_all, "interface rule sync failed"),
        }
        result
    }

    /// 인스턴스를 해제합니다. 인스턴스가 없으면 아무것도 하지 않고 `Ok(false)`입니다.
    ///
    /// 종료 시그널 처리에서 호출하며, 여러 번 호출해도 해제는 한 번만 일어납니다.
    pub fn teardown(&self) -> Result<bool, SyncError> {
        let mut inner = self.lock();
        if inner.state == SyncState::Uninitialized {
            debug!("teardown requested without an instance");
            return Ok(false);
        }
        let result = self.teardown_locked(&mut inner);
        self.publish(&inner);
        result.map(|_| true)
    }

    fn sync_locked(
        &self,
        inner: &mut Inner,
        desired: &InterfaceRules,
        is_delete_all: bool,
    ) -> Result<SyncReport, SyncError> {
        if inner.backend.is_none() {
            let backend = self
                .factory
                .create()
                .map_err(|e| SyncError::InstanceCreationFailed(e.to_string()))?;
            info!(backend = backend.name(), "firewall instance created");
            inner.backend = Some(backend);
            inner.state = SyncState::Ready;
        }

        if is_delete_all {
            let detached = self.teardown_locked(inner)?;
            return Ok(SyncReport {
                detached,
                ..SyncReport::default()
            });
        }

        codec::validate(desired)?;

        let Inner {
            backend, managed, ..
        } = inner;
        let Some(backend) = backend.as_mut() else {
            return Err(SyncError::InstanceCreationFailed(
                "instance unavailable".to_owned(),
            ));
        };

        let mut report = SyncReport::default();
        let mut errors = Vec::new();
        let mut failures = Vec::new();

        let stale: Vec<String> = managed
            .iter()
            .filter(|name| !desired.contains_key(*name))
            .cloned()
            .collect();
        // 디태치에 실패한 인터페이스는 관리 목록에 남아 다음 동기화에서 재시도
        for name in stale {
            match backend.detach(&name) {
                Ok(_) => {
                    managed.remove(&name);
                    report.detached.push(name);
                }
                Err(e) => failures.push(interface_failure(name, InterfaceOp::Detach, &e)),
            }
        }

        for name in desired.keys() {
            if managed.contains(name) {
                continue;
            }
            match backend.attach(name) {
                Ok(_) => {
                    managed.insert(name.clone());
                    report.attached.push(name.clone());
                }
                Err(EngineError::InterfaceLookup { .. }) => {
                    record_failure(name, InterfaceOp::Attach);
                    report.skipped.push(name.clone());
                    errors.push(SyncError::InvalidInterface(name.clone()));
                }
                Err(e) => failures.push(interface_failure(name.clone(), InterfaceOp::Attach, &e)),
            }
        }

        let installable: InterfaceRules = desired
            .iter()
            .filter(|(name, _)| managed.contains(*name))
            .map(|(name, rules)| (name.clone(), rules.clone()))
            .collect();
        match backend.apply(&installable) {
            Ok(count) => {
                report.rules_installed = count;
                metrics::gauge!(m::RULE_ENTRIES_INSTALLED).set(count as f64);
            }
            Err(e) => errors.push(e),
        }

        if !failures.is_empty() {
            errors.insert(0, SyncError::AttachDetachFailed(failures));
        }
        match SyncError::aggregate(errors) {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// 모든 인터페이스를 디태치하고 인스턴스를 닫습니다.
    fn teardown_locked(&self, inner: &mut Inner) -> Result<Vec<String>, SyncError> {
        inner.state = SyncState::Terminating;
        self.publish(inner);
        let detached: Vec<String> = std::mem::take(&mut inner.managed).into_iter().collect();

        let result = match inner.backend.take() {
            Some(mut backend) => backend.close(),
            None => Ok(()),
        };
        inner.state = SyncState::Uninitialized;

        metrics::counter!(m::SYNC_TEARDOWNS_TOTAL).increment(1);
        metrics::gauge!(m::SYNC_MANAGED_INTERFACES).set(0.0);
        metrics::gauge!(m::RULE_ENTRIES_INSTALLED).set(0.0);
        info!(interfaces = detached.len(), "firewall instance released");

        result.map(|()| detached)
    }
}

fn record_failure(interface: &str, operation: InterfaceOp) {
    metrics::counter!(
        m::SYNC_INTERFACE_FAILURES_TOTAL,
        m::LABEL_INTERFACE => interface.to_owned(),
        m::LABEL_OPERATION => operation.as_str()
    )
    .increment(1);
}

fn interface_failure(interface: String, operation: InterfaceOp, err: &EngineError) -> InterfaceFailure {
    record_failure(&interface, operation);
    warn!(interface = interface.as_str(), operation = operation.as_str(), error = %err, "interface operation failed");
    InterfaceFailure {
        interface,
        operation,
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingFactory;

    impl BackendFactory for FailingFactory {
        fn create(&self) -> Result<Box<dyn FirewallBackend>, EngineError> {
            Err(EngineError::ProgramLoad("no object".to_owned()))
        }
    }

    #[test]
    fn starts_uninitialized() {
        let sync = Synchronizer::new(Box::new(FailingFactory));
        assert_eq!(sync.state(), SyncState::Uninitialized);
        assert!(sync.managed_interfaces().is_empty());
    }

    #[test]
    fn teardown_without_instance_is_noop() {
        let sync = Synchronizer::new(Box::new(FailingFactory));
        assert!(!sync.teardown().unwrap());
        assert!(!sync.teardown().unwrap());
    }

    #[test]
    fn creation_failure_keeps_uninitialized() {
        let sync = Synchronizer::new(Box::new(FailingFactory));
        let err = sync
            .sync_interface_rules(&InterfaceRules::new(), false)
            .unwrap_err();
        assert!(matches!(err, SyncError::InstanceCreationFailed(_)));
        assert_eq!(sync.state(), SyncState::Uninitialized);
    }

    #[test]
    fn state_display() {
        assert_eq!(SyncState::Ready.to_string(), "ready");
        assert_eq!(SyncState::Uninitialized.to_string(), "uninitialized");
    }
}
