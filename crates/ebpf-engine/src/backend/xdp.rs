//! XDP 백엔드: eBPF 오브젝트 로드, LPM 룰 테이블 설치, 인터페이스 어태치
//!
//! # 맵
//! - `INFW_TABLE`: `LpmTrie<LpmKeyData, RuleBucket>`
//! - `INFW_STATS`: `PerCpuArray<StatisticsEntry>` (rule_id 인덱스)
//! - `INFW_EVENTS`: 매칭 이벤트 링 버퍼
//! - `INFW_CONFIG`: 기본 액션
//!
//! # 설치 순서
//! 1. 원하는 상태 인코딩 (실패 시 커널 상태 변경 없음)
//! 2. 새 키 삽입/덮어쓰기
//! 3. 새 테이블에 없는 키 제거
//! 4. 통계 초기화

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use aya::Ebpf;
use aya::maps::lpm_trie::{Key, LpmTrie};
use aya::maps::{Array, MapData, PerCpuArray, PerCpuValues, RingBuf};
use aya::programs::xdp::XdpLinkId;
use aya::programs::{Xdp, XdpFlags};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use infw_core::error::EngineError;
use infw_core::metrics as m;
use infw_core::types::InterfaceRules;
use infw_ebpf_common::{
    CONFIG_IDX_DEFAULT_ACTION, LpmKeyData, MAP_CONFIG, MAP_EVENTS, MAP_STATS, MAP_TABLE,
    PROGRAM_NAME, RuleBucket, STATS_MAX_ENTRIES, StatisticsEntry,
};

use super::{EventSink, FirewallBackend, InterfaceAttacher, RuleSink};
use crate::attach::{
    AttachmentManager, DetachFailure, IfIndexResolver, InterfaceValidator, LinkDriver,
};
use crate::codec::{self, RuleTable, action_code};
use crate::config::{EngineConfig, XdpMode};
use crate::error::{InterfaceFailure, InterfaceOp, SyncError};
use crate::events::EventReader;
use crate::stats::{CounterReader, CounterSnapshot, StatisticsHandle, sum_per_cpu};

type TableMap = LpmTrie<MapData, LpmKeyData, RuleBucket>;
type StatsMap = PerCpuArray<MapData, StatisticsEntry>;

fn map_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::MapAccess(e.to_string())
}

fn program_mut(ebpf: &mut Ebpf) -> Result<&mut Xdp, EngineError> {
    ebpf.program_mut(PROGRAM_NAME)
        .ok_or_else(|| EngineError::ProgramLoad(format!("program '{PROGRAM_NAME}' not found")))?
        .try_into()
        .map_err(|e| EngineError::ProgramLoad(format!("'{PROGRAM_NAME}' is not xdp: {e}")))
}

fn take_map(ebpf: &mut Ebpf, name: &str) -> Result<aya::maps::Map, EngineError> {
    ebpf.take_map(name)
        .ok_or_else(|| EngineError::ProgramLoad(format!("map '{name}' not found")))
}

const fn xdp_flags(mode: XdpMode) -> XdpFlags {
    match mode {
        XdpMode::Native => XdpFlags::DRV_MODE,
        XdpMode::Skb => XdpFlags::SKB_MODE,
        XdpMode::Hw => XdpFlags::HW_MODE,
    }
}

/// aya XDP 링크 드라이버
///
/// `Ebpf` 핸들을 소유하며, 드롭되면 프로그램이 언로드됩니다.
pub struct XdpLinkDriver {
    ebpf: Ebpf,
    mode: XdpMode,
}

impl LinkDriver for XdpLinkDriver {
    type Link = XdpLinkId;

    fn attach(&mut self, name: &str) -> Result<XdpLinkId, EngineError> {
        let mode = self.mode;
        let program = program_mut(&mut self.ebpf)?;
        let attach_err = |e: aya::programs::ProgramError| EngineError::Attach {
            interface: name.to_owned(),
            reason: e.to_string(),
        };

        match program.attach(name, xdp_flags(mode)) {
            Ok(link) => Ok(link),
            Err(e) if mode == XdpMode::Native => {
                warn!(interface = name, error = %e, "native xdp attach failed, falling back to skb mode");
                program.attach(name, XdpFlags::SKB_MODE).map_err(attach_err)
            }
            Err(e) => Err(attach_err(e)),
        }
    }

    /// aya는 실패한 디태치에서도 링크 ID를 소비하므로 핸들을 돌려주지 않습니다.
    fn detach(&mut self, name: &str, link: XdpLinkId) -> Result<(), DetachFailure<XdpLinkId>> {
        let detach_err = |reason: String| DetachFailure {
            link: None,
            error: EngineError::Detach {
                interface: name.to_owned(),
                reason,
            },
        };
        match program_mut(&mut self.ebpf) {
            Ok(program) => program.detach(link).map_err(|e| detach_err(e.to_string())),
            Err(e) => Err(DetachFailure {
                link: Some(link),
                error: e,
            }),
        }
    }
}

/// 통계 맵 리더 (백엔드와 폴링 태스크가 공유)
struct StatsReader {
    map: Mutex<StatsMap>,
}

impl StatsReader {
    fn zero(&self) -> Result<(), EngineError> {
        let nr_cpus =
            aya::util::nr_cpus().map_err(|(msg, e)| EngineError::MapAccess(format!("{msg}: {e}")))?;
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        for idx in 0..STATS_MAX_ENTRIES {
            let zeroed = PerCpuValues::try_from(vec![StatisticsEntry::zeroed(); nr_cpus])
                .map_err(map_err)?;
            map.set(idx, zeroed, 0).map_err(map_err)?;
        }
        Ok(())
    }
}

impl CounterReader for StatsReader {
    fn read_counters(&self) -> Result<CounterSnapshot, EngineError> {
        let map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        let mut snapshot = CounterSnapshot::new();
        for idx in 0..STATS_MAX_ENTRIES {
            let values = map.get(&idx, 0).map_err(map_err)?;
            let total = sum_per_cpu(values.iter());
            if total != StatisticsEntry::zeroed() {
                snapshot.insert(idx, total);
            }
        }
        Ok(snapshot)
    }
}

/// 커널 XDP 분류기 백엔드
pub struct XdpBackend {
    links: AttachmentManager<XdpLinkDriver>,
    table: TableMap,
    stats: Arc<StatsReader>,
    resolver: Arc<dyn IfIndexResolver>,
    statistics: StatisticsHandle,
    event_task: Option<JoinHandle<()>>,
}

impl XdpBackend {
    /// eBPF 오브젝트를 로드하고 맵을 준비합니다.
    ///
    /// 프로그램은 로드되지만 어떤 인터페이스에도 어태치되지 않습니다.
    ///
    /// # 에러
    /// - `EngineError::ProgramLoad`: 오브젝트 파일/프로그램/맵이 없거나 검증기 거부
    /// - `EngineError::MapAccess`: 기본 액션 기록 실패
    pub fn load(
        config: &EngineConfig,
        validator: Arc<dyn InterfaceValidator>,
        resolver: Arc<dyn IfIndexResolver>,
        statistics: StatisticsHandle,
        events: Option<EventSink>,
    ) -> Result<Self, EngineError> {
        let mut ebpf = Ebpf::load_file(&config.bpf_object)
            .map_err(|e| EngineError::ProgramLoad(e.to_string()))?;

        if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
            warn!(error = %e, "failed to initialize ebpf logger");
        }

        program_mut(&mut ebpf)?
            .load()
            .map_err(|e| EngineError::ProgramLoad(e.to_string()))?;

        let table = TableMap::try_from(take_map(&mut ebpf, MAP_TABLE)?).map_err(map_err)?;
        let stats = StatsMap::try_from(take_map(&mut ebpf, MAP_STATS)?).map_err(map_err)?;
        let mut config_map =
            Array::<MapData, u8>::try_from(take_map(&mut ebpf, MAP_CONFIG)?).map_err(map_err)?;
        config_map
            .set(
                CONFIG_IDX_DEFAULT_ACTION,
                action_code(config.default_action),
                0,
            )
            .map_err(map_err)?;

        let event_task = match events {
            Some(sink) => {
                let ring = RingBuf::try_from(take_map(&mut ebpf, MAP_EVENTS)?).map_err(map_err)?;
                let reader = EventReader::new(ring);
                Some(sink.runtime.spawn(reader.run(sink.tx)))
            }
            None => None,
        };

        let stats = Arc::new(StatsReader {
            map: Mutex::new(stats),
        });
        statistics.publish(stats.clone());

        info!(
            object = %config.bpf_object.display(),
            default_action = %config.default_action,
            events = event_task.is_some(),
            "xdp program loaded"
        );

        Ok(Self {
            links: AttachmentManager::new(
                XdpLinkDriver {
                    ebpf,
                    mode: config.xdp_mode,
                },
                validator,
            ),
            table,
            stats,
            resolver,
            statistics,
            event_task,
        })
    }

    fn installed_keys(&self) -> Result<Vec<Key<LpmKeyData>>, EngineError> {
        self.table
            .keys()
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)
    }

    /// 인코딩된 테이블로 커널 LPM 맵을 교체합니다.
    fn install(&mut self, table: &RuleTable) -> Result<(), EngineError> {
        let stale = self.installed_keys()?;

        let mut desired = HashSet::with_capacity(table.len());
        for (key, bucket) in table.iter() {
            let lpm_key = Key::new(key.lpm_prefix_len(), key.lpm_data());
            self.table.insert(&lpm_key, bucket, 0).map_err(map_err)?;
            desired.insert((lpm_key.prefix_len(), lpm_key.data()));
        }

        let mut removed = 0usize;
        for key in stale {
            if !desired.contains(&(key.prefix_len(), key.data())) {
                self.table.remove(&key).map_err(map_err)?;
                removed += 1;
            }
        }
        debug!(installed = table.len(), removed, "lpm table updated");
        metrics::gauge!(m::RULE_PREFIXES_INSTALLED).set(table.len() as f64);

        self.stats.zero()
    }
}

impl RuleSink for XdpBackend {
    fn apply(&mut self, rules: &InterfaceRules) -> Result<usize, SyncError> {
        let table = codec::encode(rules, self.resolver.as_ref())?;
        self.install(&table)
            .map_err(|e| SyncError::TableInstallFailed(e.to_string()))?;
        Ok(table.rule_count())
    }

    fn flush(&mut self) -> Result<(), SyncError> {
        self.install(&RuleTable::default())
            .map_err(|e| SyncError::TableInstallFailed(e.to_string()))
    }
}

impl InterfaceAttacher for XdpBackend {
    fn attach(&mut self, interface: &str) -> Result<bool, EngineError> {
        self.links.attach(interface)
    }

    fn detach(&mut self, interface: &str) -> Result<bool, EngineError> {
        self.links.detach(interface)
    }
}

impl FirewallBackend for XdpBackend {
    fn name(&self) -> &'static str {
        "xdp"
    }

    fn close(&mut self) -> Result<(), SyncError> {
        let failures = self.links.detach_all();
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
        self.statistics.clear();

        if failures.is_empty() {
            info!("xdp backend closed");
            return Ok(());
        }
        Err(SyncError::AttachDetachFailed(
            failures
                .into_iter()
                .map(|(interface, e)| InterfaceFailure {
                    interface,
                    operation: InterfaceOp::Detach,
                    reason: e.to_string(),
                })
                .collect(),
        ))
    }
}

impl Drop for XdpBackend {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
    }
}
