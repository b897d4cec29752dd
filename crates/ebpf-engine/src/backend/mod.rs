//! 룰 싱크 백엔드: 커널 XDP 분류기 / 외부 오프로드 프로그램
//!
//! 동기화기는 [`FirewallBackend`] trait만 알고 있으며, 실제 인스턴스는
//! [`BackendFactory`]가 생성합니다. 인스턴스는 처음 필요할 때 생성되고
//! 전체 삭제나 종료 시 `close()` 후 버려집니다.
//!
//! # 구현
//! - [`XdpBackend`] (Linux): eBPF 오브젝트 로드, LPM 테이블 설치, XDP 어태치
//! - [`OffloadBackend`]: 외부 명령에 JSON 룰 맵 전달

pub mod offload;
#[cfg(target_os = "linux")]
pub mod xdp;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use infw_core::error::EngineError;
use infw_core::types::InterfaceRules;

use crate::attach::{IfIndexResolver, InterfaceValidator, SysfsInterfaceValidator};
use crate::config::{BackendKind, EngineConfig};
use crate::error::SyncError;
use crate::events::FirewallEvent;
use crate::stats::StatisticsHandle;

pub use offload::OffloadBackend;
#[cfg(target_os = "linux")]
pub use xdp::XdpBackend;

/// 원하는 룰 상태를 데이터 플레인에 적용하는 기능
pub trait RuleSink {
    /// 룰 맵 전체로 현재 룰을 교체하고 설치된 룰 엔트리 수를 반환합니다.
    ///
    /// 실패하면 이전에 설치된 룰이 유지됩니다.
    fn apply(&mut self, rules: &InterfaceRules) -> Result<usize, SyncError>;

    /// 설치된 룰을 모두 제거합니다.
    fn flush(&mut self) -> Result<(), SyncError>;
}

/// 인터페이스에 분류기를 붙이고 떼는 기능
pub trait InterfaceAttacher {
    /// 인터페이스에 어태치합니다. 이미 어태치되어 있으면 `Ok(false)`입니다.
    ///
    /// # 에러
    /// - `EngineError::InterfaceLookup`: 이름/상태가 유효하지 않음
    /// - `EngineError::Attach`: 어태치 실패
    fn attach(&mut self, interface: &str) -> Result<bool, EngineError>;

    /// 인터페이스에서 디태치합니다. 어태치되어 있지 않으면 `Ok(false)`입니다.
    fn detach(&mut self, interface: &str) -> Result<bool, EngineError>;
}

/// 방화벽 인스턴스
pub trait FirewallBackend: RuleSink + InterfaceAttacher + Send {
    /// 백엔드 이름 (로그용)
    fn name(&self) -> &'static str;

    /// 모든 인터페이스를 디태치하고 인스턴스 자원을 해제합니다.
    fn close(&mut self) -> Result<(), SyncError>;
}

/// 방화벽 인스턴스 생성기
pub trait BackendFactory: Send + Sync {
    /// 새 인스턴스를 생성합니다.
    ///
    /// # 에러
    /// 커널 프로그램 로드 실패 등. 동기화기는 `InstanceCreationFailed`로 보고합니다.
    fn create(&self) -> Result<Box<dyn FirewallBackend>, EngineError>;
}

/// 매칭 이벤트 전달 대상
#[derive(Clone)]
pub struct EventSink {
    /// 이벤트 채널
    pub tx: mpsc::Sender<FirewallEvent>,
    /// 이벤트 리더 태스크를 스폰할 런타임
    pub runtime: tokio::runtime::Handle,
}

/// 설정에 따라 XDP 또는 오프로드 백엔드를 생성하는 기본 팩토리
pub struct EngineBackendFactory {
    config: EngineConfig,
    validator: Arc<dyn InterfaceValidator>,
    resolver: Arc<dyn IfIndexResolver>,
    statistics: StatisticsHandle,
    events: Option<EventSink>,
}

impl EngineBackendFactory {
    /// sysfs 검증기/조회기를 사용하는 팩토리를 생성합니다.
    pub fn new(config: EngineConfig) -> Self {
        let sysfs = Arc::new(SysfsInterfaceValidator::new());
        Self {
            config,
            validator: sysfs.clone(),
            resolver: sysfs,
            statistics: StatisticsHandle::new(),
            events: None,
        }
    }

    /// 인터페이스 검증기와 ifindex 조회기를 교체합니다.
    pub fn interfaces(
        mut self,
        validator: Arc<dyn InterfaceValidator>,
        resolver: Arc<dyn IfIndexResolver>,
    ) -> Self {
        self.validator = validator;
        self.resolver = resolver;
        self
    }

    /// 통계 리더를 등록할 핸들을 설정합니다.
    pub fn statistics(mut self, handle: StatisticsHandle) -> Self {
        self.statistics = handle;
        self
    }

    /// 매칭 이벤트 전달 대상을 설정합니다.
    ///
    /// `events_enabled`가 꺼져 있으면 무시됩니다.
    pub fn events(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }

    /// 통계 핸들
    pub fn statistics_handle(&self) -> &StatisticsHandle {
        &self.statistics
    }
}

impl BackendFactory for EngineBackendFactory {
    fn create(&self) -> Result<Box<dyn FirewallBackend>, EngineError> {
        match self.config.backend {
            BackendKind::Offload => {
                info!("creating offload backend");
                Ok(Box::new(OffloadBackend::new(
                    self.config.offload.clone(),
                    Arc::clone(&self.validator),
                )))
            }
            BackendKind::Xdp => self.create_xdp(),
        }
    }
}

impl EngineBackendFactory {
    #[cfg(target_os = "linux")]
    fn create_xdp(&self) -> Result<Box<dyn FirewallBackend>, EngineError> {
        info!(object = %self.config.bpf_object.display(), "creating xdp backend");
        let events = if self.config.events_enabled {
            self.events.clone()
        } else {
            None
        };
        let backend = XdpBackend::load(
            &self.config,
            Arc::clone(&self.validator),
            Arc::clone(&self.resolver),
            self.statistics.clone(),
            events,
        )?;
        Ok(Box::new(backend))
    }

    #[cfg(not(target_os = "linux"))]
    fn create_xdp(&self) -> Result<Box<dyn FirewallBackend>, EngineError> {
        Err(EngineError::ProgramLoad(
            "xdp backend is only supported on linux".to_owned(),
        ))
    }
}
