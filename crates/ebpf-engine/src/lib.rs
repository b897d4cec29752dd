//! infw 엔진: 노드 로컬 인그레스 방화벽의 룰 테이블과 동기화
//!
//! # 모듈 구성
//! - [`codec`]: 인터페이스별 룰 명세 ⇄ 커널 LPM 테이블 레이아웃
//! - [`index`]: 최장 프리픽스 매치 분류 (커널 분류기의 유저스페이스 사본)
//! - [`attach`]: 인터페이스 검증, ifindex 조회, 멱등 어태치/디태치
//! - [`backend`]: XDP / 외부 오프로드 룰 싱크
//! - [`sync`]: 원하는 상태와 현재 상태를 맞추는 동기화기
//! - [`service`]: 동기화 요청 직렬화 큐, 종료 시그널 처리
//! - [`stats`]: 룰별 매칭 통계
//! - [`events`]: 매칭 이벤트 링 버퍼 리더
//! - [`config`]: 엔진 설정, 룰 파일 로딩
//!
//! # 공유 타입
//! 커널/유저스페이스 공유 레이아웃은 [`infw_ebpf_common`] 크레이트에 정의되어 있습니다.

pub mod attach;
pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod index;
pub mod service;
pub mod stats;
pub mod sync;

// --- 주요 타입 re-export ---

// 동기화
pub use service::{SyncHandle, SyncService};
pub use sync::{SyncReport, SyncState, Synchronizer};

// 백엔드
pub use backend::{
    BackendFactory, EngineBackendFactory, EventSink, FirewallBackend, InterfaceAttacher,
    OffloadBackend, RuleSink,
};

// 설정
pub use config::{BackendKind, EngineConfig, XdpMode, load_rules, parse_rules};

// 에러
pub use error::{InterfaceFailure, InterfaceOp, SyncError};

// 코덱 / 인덱스
pub use codec::{PrefixKey, RuleTable};
pub use index::{Classification, MatchOutcome, PrefixMatchIndex};

// 통계 / 이벤트
pub use events::FirewallEvent;
pub use stats::{CounterReader, RuleStatistics, StatisticsHandle};

// 공유 타입 (커널/유저스페이스 공통)
pub use infw_ebpf_common;
