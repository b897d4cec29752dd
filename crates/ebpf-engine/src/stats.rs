//! 통계 수집: 룰별 매칭 카운터
//!
//! 커널은 룰 ID를 인덱스로 하는 PerCpuArray에 매칭 패킷/바이트를 누적합니다.
//! 인덱스 0은 룰이 매칭되지 않아 기본 액션이 적용된 패킷입니다.
//!
//! # 데이터 흐름
//! ```text
//! PerCpuArray (kernel) ──CounterReader──▶ CounterSnapshot ──update──▶ RuleStatistics
//!                        (CPU별 값 합산)   (rule_id → 합계)            (rate 계산, 메트릭)
//! ```
//!
//! 커널 맵은 백엔드가 소유하므로, 백엔드는 생성 시 [`StatisticsHandle`]에
//! 자신의 [`CounterReader`]를 등록하고 해제 시 제거합니다.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use serde::Serialize;

use infw_core::error::EngineError;
use infw_core::metrics as m;
use infw_ebpf_common::{DEFAULT_RULE_ID, StatisticsEntry};

/// 한 번의 폴링에서 읽은 rule_id → CPU 합산 통계
///
/// 값이 0인 룰은 포함되지 않습니다.
pub type CounterSnapshot = BTreeMap<u32, StatisticsEntry>;

/// 커널 통계 맵 읽기
pub trait CounterReader: Send + Sync {
    /// 모든 룰의 CPU 합산 통계를 읽습니다.
    fn read_counters(&self) -> Result<CounterSnapshot, EngineError>;
}

/// 현재 활성 백엔드의 통계 리더를 공유하는 핸들
///
/// 동기화 스레드(백엔드 생성/해제)와 폴링 태스크가 함께 사용합니다.
#[derive(Clone, Default)]
pub struct StatisticsHandle {
    reader: Arc<RwLock<Option<Arc<dyn CounterReader>>>>,
}

impl StatisticsHandle {
    /// 빈 핸들을 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 통계 리더를 등록합니다. 기존 리더는 교체됩니다.
    pub fn publish(&self, reader: Arc<dyn CounterReader>) {
        *self.reader.write().unwrap_or_else(PoisonError::into_inner) = Some(reader);
    }

    /// 통계 리더를 제거합니다.
    pub fn clear(&self) {
        *self.reader.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// 리더가 등록되어 있는지
    pub fn is_available(&self) -> bool {
        self.reader
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// 등록된 리더로 통계를 읽습니다. 리더가 없으면 `None`입니다.
    pub fn read(&self) -> Option<Result<CounterSnapshot, EngineError>> {
        let reader = self
            .reader
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        Some(reader.read_counters())
    }
}

/// 단일 룰의 통계 (누적 + 비율)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleMetrics {
    /// 매칭된 패킷 수 (누적)
    pub packets: u64,
    /// 매칭된 바이트 수 (누적)
    pub bytes: u64,
    /// 초당 패킷 수
    pub pps: f64,
    /// 초당 비트 수
    pub bps: f64,
}

/// 룰별 통계
///
/// # Rate 계산
/// `update()`를 호출할 때마다 이전 스냅샷과의 차이를 경과 시간으로 나누어
/// pps, bps를 계산합니다. 룰 테이블 설치 시 커널 카운터가 0으로 초기화되므로
/// 값이 줄어든 경우 rate는 0입니다.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleStatistics {
    /// rule_id → 통계
    pub rules: BTreeMap<u32, RuleMetrics>,
    #[serde(skip)]
    last_poll: Option<Instant>,
    #[serde(skip)]
    prev: Option<CounterSnapshot>,
}

impl RuleStatistics {
    /// 빈 통계를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 스냅샷으로 통계를 갱신하고 메트릭을 기록합니다.
    ///
    /// 첫 번째 호출에서는 rate가 0입니다.
    pub fn update(&mut self, snapshot: CounterSnapshot) {
        let now = Instant::now();
        let elapsed = self
            .last_poll
            .map(|last| now.duration_since(last).as_secs_f64())
            .unwrap_or(0.0);

        let mut rules = BTreeMap::new();
        for (&rule_id, entry) in &snapshot {
            let prev = self.prev.as_ref().and_then(|p| p.get(&rule_id));
            let mut metrics = RuleMetrics {
                packets: entry.packets,
                bytes: entry.bytes,
                ..RuleMetrics::default()
            };
            if let Some(prev) = prev {
                if elapsed > 0.0 {
                    let delta_packets = entry.packets.saturating_sub(prev.packets);
                    let delta_bytes = entry.bytes.saturating_sub(prev.bytes);
                    #[allow(clippy::cast_precision_loss)]
                    {
                        metrics.pps = delta_packets as f64 / elapsed;
                        metrics.bps = (delta_bytes as f64 * 8.0) / elapsed;
                    }
                }
            }

            let label = rule_label(rule_id);
            metrics::counter!(m::RULE_PACKETS_TOTAL, m::LABEL_RULE_ID => label.clone())
                .absolute(metrics.packets);
            metrics::counter!(m::RULE_BYTES_TOTAL, m::LABEL_RULE_ID => label)
                .absolute(metrics.bytes);

            rules.insert(rule_id, metrics);
        }

        self.rules = rules;
        self.prev = Some(snapshot);
        self.last_poll = Some(now);
    }

    /// 특정 룰의 통계
    pub fn get(&self, rule_id: u32) -> Option<&RuleMetrics> {
        self.rules.get(&rule_id)
    }

    /// 기본 액션이 적용된 패킷 통계
    pub fn default_action(&self) -> Option<&RuleMetrics> {
        self.get(DEFAULT_RULE_ID)
    }

    /// 모든 룰의 패킷 합계
    pub fn total_packets(&self) -> u64 {
        self.rules.values().map(|r| r.packets).sum()
    }

    /// 통계를 초기화합니다.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// 메트릭 레이블 값 (기본 액션 카운터는 "default")
pub fn rule_label(rule_id: u32) -> String {
    if rule_id == DEFAULT_RULE_ID {
        "default".to_owned()
    } else {
        rule_id.to_string()
    }
}

/// CPU별 통계를 합산합니다.
pub fn sum_per_cpu<'a>(values: impl IntoIterator<Item = &'a StatisticsEntry>) -> StatisticsEntry {
    values
        .into_iter()
        .fold(StatisticsEntry::zeroed(), |acc, v| StatisticsEntry {
            packets: acc.packets.saturating_add(v.packets),
            bytes: acc.bytes.saturating_add(v.bytes),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(packets: u64, bytes: u64) -> StatisticsEntry {
        StatisticsEntry { packets, bytes }
    }

    struct FixedReader(CounterSnapshot);

    impl CounterReader for FixedReader {
        fn read_counters(&self) -> Result<CounterSnapshot, EngineError> {
            Ok(self.0.clone())
        }
    }

    // =============================================================================
    // update 테스트 (첫 번째 폴링)
    // =============================================================================

    #[test]
    fn test_update_first_poll_sets_cumulative_only() {
        let mut stats = RuleStatistics::new();
        stats.update(BTreeMap::from([(0, entry(5, 300)), (10, entry(100, 6400))]));

        let rule = stats.get(10).unwrap();
        assert_eq!(rule.packets, 100);
        assert_eq!(rule.bytes, 6400);
        assert_eq!(rule.pps, 0.0);
        assert_eq!(stats.default_action().unwrap().packets, 5);
        assert_eq!(stats.total_packets(), 105);
    }

    // =============================================================================
    // update 테스트 (두 번째 폴링, rate 계산)
    // =============================================================================

    #[test]
    fn test_update_second_poll_calculates_rate() {
        let mut stats = RuleStatistics::new();
        stats.update(BTreeMap::from([(10, entry(1000, 64000))]));

        std::thread::sleep(std::time::Duration::from_millis(100));

        stats.update(BTreeMap::from([(10, entry(2000, 128000))]));

        let rule = stats.get(10).unwrap();
        assert_eq!(rule.packets, 2000);
        assert!(rule.pps > 0.0);
        assert!(rule.bps > 0.0);
        assert!(rule.pps < 100000.0);
    }

    #[test]
    fn test_update_after_counter_reset_has_zero_rate() {
        let mut stats = RuleStatistics::new();
        stats.update(BTreeMap::from([(10, entry(1000, 64000))]));
        std::thread::sleep(std::time::Duration::from_millis(10));
        stats.update(BTreeMap::from([(10, entry(3, 192))]));

        let rule = stats.get(10).unwrap();
        assert_eq!(rule.packets, 3);
        assert_eq!(rule.pps, 0.0);
    }

    #[test]
    fn test_update_drops_rules_missing_from_snapshot() {
        let mut stats = RuleStatistics::new();
        stats.update(BTreeMap::from([(10, entry(1, 64)), (20, entry(2, 128))]));
        stats.update(BTreeMap::from([(20, entry(4, 256))]));

        assert!(stats.get(10).is_none());
        assert_eq!(stats.get(20).unwrap().packets, 4);
    }

    #[test]
    fn test_reset_clears_all_state() {
        let mut stats = RuleStatistics::new();
        stats.update(BTreeMap::from([(10, entry(1, 64))]));
        stats.reset();
        assert!(stats.rules.is_empty());
        assert!(stats.last_poll.is_none());
    }

    // =============================================================================
    // 헬퍼 / 핸들 테스트
    // =============================================================================

    #[test]
    fn test_sum_per_cpu() {
        let per_cpu = [entry(1, 100), entry(2, 200), entry(0, 0)];
        assert_eq!(sum_per_cpu(&per_cpu), entry(3, 300));
        assert_eq!(sum_per_cpu(&[entry(u64::MAX, 1), entry(1, 1)]).packets, u64::MAX);
    }

    #[test]
    fn test_rule_label() {
        assert_eq!(rule_label(0), "default");
        assert_eq!(rule_label(42), "42");
    }

    #[test]
    fn test_statistics_handle_publish_and_clear() {
        let handle = StatisticsHandle::new();
        assert!(handle.read().is_none());

        handle.publish(Arc::new(FixedReader(BTreeMap::from([(7, entry(1, 60))]))));
        let shared = handle.clone();
        assert!(shared.is_available());
        let snapshot = shared.read().unwrap().unwrap();
        assert_eq!(snapshot[&7], entry(1, 60));

        handle.clear();
        assert!(!shared.is_available());
        assert!(shared.read().is_none());
    }

    #[test]
    fn test_serialize_rules() {
        let mut stats = RuleStatistics::new();
        stats.update(BTreeMap::from([(10, entry(1, 64))]));
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["rules"]["10"]["packets"], 1);
    }
}
