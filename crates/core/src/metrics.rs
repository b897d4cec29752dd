//! 메트릭 상수 및 설명 등록
//!
//! 모든 메트릭의 이름과 설명을 중앙에서 정의합니다.
//! 각 모듈은 이 상수를 사용하여 `metrics::counter!()`, `metrics::gauge!()`
//! 매크로를 호출합니다. 익스포터 설치는 이 크레이트의 범위 밖이며,
//! 레코더가 없으면 모든 호출은 no-op입니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `infw_`
//! - 모듈명: `sync_`, `rule_`, `events_`
//! - 접미어: `_total` (counter), 없음 (gauge)

// ─── 레이블 키 상수 ────────────────────────────────────────────────

/// 결과 레이블 키 (success, failure)
pub const LABEL_RESULT: &str = "result";

/// 룰 ID 레이블 키
pub const LABEL_RULE_ID: &str = "rule_id";

/// 인터페이스 레이블 키
pub const LABEL_INTERFACE: &str = "interface";

/// 동작 레이블 키 (attach, detach)
pub const LABEL_OPERATION: &str = "operation";

// ─── Synchronizer 메트릭 ───────────────────────────────────────────

/// Sync: 수행된 동기화 호출 수 (counter, label: result)
pub const SYNC_CALLS_TOTAL: &str = "infw_sync_calls_total";

/// Sync: 현재 관리 중인 인터페이스 수 (gauge)
pub const SYNC_MANAGED_INTERFACES: &str = "infw_sync_managed_interfaces";

/// Sync: 인터페이스 어태치/디태치 실패 수 (counter, labels: interface, operation)
pub const SYNC_INTERFACE_FAILURES_TOTAL: &str = "infw_sync_interface_failures_total";

/// Sync: 커널 인스턴스 해제 횟수 (counter)
pub const SYNC_TEARDOWNS_TOTAL: &str = "infw_sync_teardowns_total";

// ─── 룰 테이블 메트릭 ──────────────────────────────────────────────

/// Rule: 설치된 룰 엔트리 수 (gauge)
pub const RULE_ENTRIES_INSTALLED: &str = "infw_rule_entries_installed";

/// Rule: 설치된 프리픽스 키 수 (gauge)
pub const RULE_PREFIXES_INSTALLED: &str = "infw_rule_prefixes_installed";

/// Rule: 룰별 매칭 패킷 수 (counter, label: rule_id)
pub const RULE_PACKETS_TOTAL: &str = "infw_rule_packets_total";

/// Rule: 룰별 매칭 바이트 수 (counter, label: rule_id)
pub const RULE_BYTES_TOTAL: &str = "infw_rule_bytes_total";

// ─── 이벤트 메트릭 ─────────────────────────────────────────────────

/// Events: 수신한 매칭 이벤트 수 (counter)
pub const EVENTS_RECEIVED_TOTAL: &str = "infw_events_received_total";

/// Events: 채널 포화로 버린 이벤트 수 (counter)
pub const EVENTS_DROPPED_TOTAL: &str = "infw_events_dropped_total";

/// 모든 메트릭의 설명을 등록합니다.
///
/// 레코더 설치 직후 한 번 호출합니다. 레코더가 없으면 아무 일도 하지 않습니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge};

    describe_counter!(
        SYNC_CALLS_TOTAL,
        "Total number of sync_interface_rules calls by result"
    );
    describe_gauge!(
        SYNC_MANAGED_INTERFACES,
        "Number of interfaces with the classifier attached"
    );
    describe_counter!(
        SYNC_INTERFACE_FAILURES_TOTAL,
        "Per-interface attach/detach failures"
    );
    describe_counter!(
        SYNC_TEARDOWNS_TOTAL,
        "Number of full teardowns of the kernel instance"
    );
    describe_gauge!(RULE_ENTRIES_INSTALLED, "Rule entries in the installed table");
    describe_gauge!(RULE_PREFIXES_INSTALLED, "Prefix keys in the installed table");
    describe_counter!(RULE_PACKETS_TOTAL, "Packets classified per rule id");
    describe_counter!(RULE_BYTES_TOTAL, "Bytes classified per rule id");
    describe_counter!(EVENTS_RECEIVED_TOTAL, "Match events read from the kernel");
    describe_counter!(
        EVENTS_DROPPED_TOTAL,
        "Match events dropped because the consumer was too slow"
    );
}
