//! eBPF 커널/유저스페이스 공유 타입
//!
//! 이 크레이트는 `#![no_std]` 환경에서 사용 가능한 공통 타입을 정의합니다.
//! XDP 분류기와 유저스페이스가 동일한 메모리 레이아웃(`#[repr(C)]`)을
//! 사용하도록 보장합니다.
//!
//! # 맵 타입 선택 근거
//! - **LpmTrie** (`INFW_TABLE`): (인터페이스, 출발지 프리픽스) → 룰 버킷, 최장 프리픽스 매칭
//! - **PerCpuArray** (`INFW_STATS`): 룰 ID별 통계 (CPU별 독립 카운터, 락 프리)
//! - **RingBuf** (`INFW_EVENTS`): 분류 결과 이벤트 전달
//! - **Array** (`INFW_CONFIG`): 기본 액션 등 런타임 설정
//!
//! # 룰 매칭
//! [`RuleBucket::first_match`]는 커널 프로그램과 유저스페이스 인덱스가
//! 함께 사용하는 단일 판정 로직입니다.

#![no_std]

// =============================================================================
// 맵 이름 상수
// =============================================================================

/// 룰 테이블 LpmTrie 맵 이름
pub const MAP_TABLE: &str = "INFW_TABLE";
/// 룰 통계 PerCpuArray 맵 이름
pub const MAP_STATS: &str = "INFW_STATS";
/// 이벤트 RingBuf 맵 이름
pub const MAP_EVENTS: &str = "INFW_EVENTS";
/// 런타임 설정 Array 맵 이름
pub const MAP_CONFIG: &str = "INFW_CONFIG";
/// XDP 프로그램 이름
pub const PROGRAM_NAME: &str = "infw_xdp";

// =============================================================================
// 용량 상수
// =============================================================================

/// 프리픽스 하나에 담을 수 있는 최대 룰 수
pub const MAX_RULES_PER_TARGET: usize = 100;
/// LpmTrie 최대 엔트리 수 (인터페이스 × 프리픽스)
pub const TABLE_MAX_ENTRIES: u32 = 1024;
/// 통계 PerCpuArray 엔트리 수 (룰 ID 0..=1023, 0은 기본 액션 카운터)
pub const STATS_MAX_ENTRIES: u32 = 1024;
/// 기본 액션 판정이 기록되는 통계 슬롯
pub const DEFAULT_RULE_ID: u32 = 0;
/// 사용자 룰 ID 최댓값
pub const MAX_RULE_ID: u32 = STATS_MAX_ENTRIES - 1;
/// 이벤트 RingBuf 크기 (바이트)
pub const EVENTS_RINGBUF_SIZE: u32 = 256 * 4096;

// =============================================================================
// 설정 맵 인덱스 (Array)
// =============================================================================

/// 기본 액션 슬롯
pub const CONFIG_IDX_DEFAULT_ACTION: u32 = 0;
/// 설정 Array 엔트리 수
pub const CONFIG_MAX_ENTRIES: u32 = 1;

// =============================================================================
// 프로토콜 상수
// =============================================================================

/// 모든 프로토콜 (와일드카드)
pub const PROTO_ANY: u8 = 0;
/// ICMP 프로토콜 번호
pub const PROTO_ICMP: u8 = 1;
/// TCP 프로토콜 번호
pub const PROTO_TCP: u8 = 6;
/// UDP 프로토콜 번호
pub const PROTO_UDP: u8 = 17;
/// ICMPv6 프로토콜 번호
pub const PROTO_ICMPV6: u8 = 58;

// =============================================================================
// 액션 코드
// =============================================================================

/// 미설정 (빈 슬롯)
pub const ACTION_UNSET: u8 = 0;
/// 패킷 통과 (XDP_PASS)
pub const ACTION_ALLOW: u8 = 1;
/// 패킷 차단 (XDP_DROP)
pub const ACTION_DENY: u8 = 2;

// =============================================================================
// 룰 플래그
// =============================================================================

/// ICMP 타입/코드 매처가 지정됨
pub const RULE_FLAG_ICMP_MATCH: u8 = 0x01;

// =============================================================================
// LPM 키
// =============================================================================

/// LPM 키 앞부분의 인터페이스 인덱스 비트 수
pub const LPM_IFINDEX_BITS: u32 = 32;
/// IPv4-mapped IPv6 주소(`::ffff:a.b.c.d`)의 고정 접두 비트 수
pub const LPM_IPV4_MAPPED_BITS: u32 = 96;
/// LPM 키 데이터 길이: ifindex(4, big-endian) + 주소(16)
pub const LPM_KEY_DATA_LEN: usize = 20;

/// LpmTrie 키 데이터 (`Key<LpmKeyData>`의 data 부분)
pub type LpmKeyData = [u8; LPM_KEY_DATA_LEN];

/// IPv4 주소를 IPv4-mapped IPv6 형식의 16바이트로 변환합니다.
#[inline(always)]
pub const fn ipv4_mapped(v4: [u8; 4]) -> [u8; 16] {
    [
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, v4[0], v4[1], v4[2], v4[3],
    ]
}

/// 16바이트 주소가 IPv4-mapped 형식인지 확인합니다.
#[inline(always)]
pub fn is_ipv4_mapped(addr: &[u8; 16]) -> bool {
    addr[..10].iter().all(|b| *b == 0) && addr[10] == 0xff && addr[11] == 0xff
}

/// (ifindex, 16바이트 주소)로 LPM 키 데이터를 구성합니다.
#[inline(always)]
pub fn lpm_key_data(ifindex: u32, addr: &[u8; 16]) -> LpmKeyData {
    let mut data = [0u8; LPM_KEY_DATA_LEN];
    let idx = ifindex.to_be_bytes();
    data[0] = idx[0];
    data[1] = idx[1];
    data[2] = idx[2];
    data[3] = idx[3];
    let mut i = 0;
    while i < 16 {
        data[4 + i] = addr[i];
        i += 1;
    }
    data
}

// =============================================================================
// 공유 데이터 구조
// =============================================================================

/// 분류 대상 패킷의 L4 메타데이터
///
/// 커널은 헤더를 파싱해서, 유저스페이스 인덱스는 테스트 입력에서 구성합니다.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketMeta {
    /// IP 프로토콜 번호
    pub protocol: u8,
    /// 목적지 포트 (TCP/UDP가 아니면 0)
    pub dst_port: u16,
    /// ICMP 타입 (ICMP/ICMPv6가 아니면 0)
    pub icmp_type: u8,
    /// ICMP 코드 (ICMP/ICMPv6가 아니면 0)
    pub icmp_code: u8,
}

/// 룰 버킷의 단일 룰
///
/// # 메모리 레이아웃 (16 바이트, 4바이트 정렬)
/// ```text
/// offset  field       size
/// 0       rule_id     4
/// 4       protocol    1
/// 5       flags       1
/// 6       port_start  2
/// 8       port_end    2
/// 10      icmp_type   1
/// 11      icmp_code   1
/// 12      action      1
/// 13      _pad        3
/// ```
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuleEntry {
    /// 룰 ID (= order, 통계 인덱스)
    pub rule_id: u32,
    /// IP 프로토콜 번호 (PROTO_ANY면 모든 프로토콜)
    pub protocol: u8,
    /// RULE_FLAG_* 비트
    pub flags: u8,
    /// 목적지 포트 범위 시작 (0이면 포트 매처 없음)
    pub port_start: u16,
    /// 목적지 포트 범위 끝 (양 끝 포함)
    pub port_end: u16,
    /// ICMP 타입 (RULE_FLAG_ICMP_MATCH일 때만 유효)
    pub icmp_type: u8,
    /// ICMP 코드 (RULE_FLAG_ICMP_MATCH일 때만 유효)
    pub icmp_code: u8,
    /// ACTION_ALLOW 또는 ACTION_DENY
    pub action: u8,
    /// 4바이트 정렬을 위한 패딩
    pub _pad: [u8; 3],
}

// SAFETY: RuleEntry는 #[repr(C)]이며 모든 필드가 Plain Old Data입니다.
// 메모리 정렬이 보장되고 패딩도 명시적으로 정의되어 있습니다.
#[cfg(feature = "user")]
unsafe impl aya::Pod for RuleEntry {}

impl RuleEntry {
    /// 제로 초기화된 룰을 생성합니다.
    pub const fn zeroed() -> Self {
        Self {
            rule_id: 0,
            protocol: 0,
            flags: 0,
            port_start: 0,
            port_end: 0,
            icmp_type: 0,
            icmp_code: 0,
            action: ACTION_UNSET,
            _pad: [0; 3],
        }
    }

    /// 패킷이 이 룰의 프로토콜/포트/ICMP 조건을 만족하는지 판정합니다.
    #[inline(always)]
    pub fn matches(&self, pkt: &PacketMeta) -> bool {
        if self.protocol != PROTO_ANY && self.protocol != pkt.protocol {
            return false;
        }
        match self.protocol {
            PROTO_TCP | PROTO_UDP => {
                self.port_start == 0
                    || (pkt.dst_port >= self.port_start && pkt.dst_port <= self.port_end)
            }
            PROTO_ICMP | PROTO_ICMPV6 => {
                self.flags & RULE_FLAG_ICMP_MATCH == 0
                    || (pkt.icmp_type == self.icmp_type && pkt.icmp_code == self.icmp_code)
            }
            _ => true,
        }
    }
}

/// 프리픽스 하나에 연결된 룰 버킷
///
/// `LpmTrie<LpmKeyData, RuleBucket>` 맵의 값입니다.
/// `rules[..num_rules]`가 rule_id 오름차순으로 정렬되어 있습니다.
///
/// # 메모리 레이아웃 (1604 바이트)
/// ```text
/// offset  field       size
/// 0       num_rules   4
/// 4       rules       16 × 100
/// ```
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuleBucket {
    /// 유효한 룰 수 (≤ MAX_RULES_PER_TARGET)
    pub num_rules: u32,
    /// 룰 배열
    pub rules: [RuleEntry; MAX_RULES_PER_TARGET],
}

// SAFETY: RuleBucket은 #[repr(C)]이며 RuleEntry 배열과 u32로만 구성됩니다.
#[cfg(feature = "user")]
unsafe impl aya::Pod for RuleBucket {}

impl RuleBucket {
    /// 빈 버킷을 생성합니다.
    pub const fn zeroed() -> Self {
        Self {
            num_rules: 0,
            rules: [RuleEntry::zeroed(); MAX_RULES_PER_TARGET],
        }
    }

    /// 순서대로 평가하여 처음 매칭되는 룰을 반환합니다.
    ///
    /// 루프 상한이 상수여서 검증기가 종료를 증명할 수 있습니다.
    #[inline(always)]
    pub fn first_match(&self, pkt: &PacketMeta) -> Option<&RuleEntry> {
        let n = self.num_rules as usize;
        for i in 0..MAX_RULES_PER_TARGET {
            if i >= n {
                break;
            }
            let rule = &self.rules[i];
            if rule.matches(pkt) {
                return Some(rule);
            }
        }
        None
    }
}

/// 룰 ID별 트래픽 통계
///
/// `PerCpuArray<StatisticsEntry>` 맵의 값입니다.
/// 유저스페이스에서 모든 CPU의 값을 합산합니다.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatisticsEntry {
    /// 매칭된 패킷 수
    pub packets: u64,
    /// 매칭된 바이트 수
    pub bytes: u64,
}

// SAFETY: StatisticsEntry는 #[repr(C)]이며 모든 필드가 Plain Old Data입니다.
#[cfg(feature = "user")]
unsafe impl aya::Pod for StatisticsEntry {}

impl StatisticsEntry {
    /// 제로 초기화된 통계를 생성합니다.
    pub const fn zeroed() -> Self {
        Self {
            packets: 0,
            bytes: 0,
        }
    }
}

/// 분류 결과 이벤트
///
/// `RingBuf`를 통해 커널 → 유저스페이스로 전달됩니다.
/// 기본 액션 판정도 rule_id 0으로 보고됩니다.
///
/// # 메모리 레이아웃 (24 바이트, 2바이트 정렬)
/// ```text
/// offset  field       size
/// 0       if_id       2
/// 2       rule_id     2
/// 4       action      1
/// 5       _fill       1
/// 6       pkt_len     2
/// 8       src_addr    16
/// ```
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventRecord {
    /// 수신 인터페이스 인덱스
    pub if_id: u16,
    /// 판정한 룰 ID (0 = 기본 액션)
    pub rule_id: u16,
    /// ACTION_ALLOW 또는 ACTION_DENY
    pub action: u8,
    /// 패딩
    pub _fill: u8,
    /// 패킷 길이 (바이트)
    pub pkt_len: u16,
    /// 출발지 주소 (IPv4는 IPv4-mapped 형식)
    pub src_addr: [u8; 16],
}

// SAFETY: EventRecord는 #[repr(C)]이며 모든 필드가 Plain Old Data입니다.
#[cfg(feature = "user")]
unsafe impl aya::Pod for EventRecord {}

impl EventRecord {
    /// 제로 초기화된 이벤트를 생성합니다.
    pub const fn zeroed() -> Self {
        Self {
            if_id: 0,
            rule_id: 0,
            action: ACTION_UNSET,
            _fill: 0,
            pkt_len: 0,
            src_addr: [0; 16],
        }
    }
}
