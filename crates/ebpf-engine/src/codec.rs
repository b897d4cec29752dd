//! 룰 테이블 코덱: 인터페이스별 룰 명세 ⇄ 커널 고정 레이아웃
//!
//! 원하는 상태([`InterfaceRules`])를 (ifindex, 출발지 프리픽스) 키와
//! 용량이 고정된 [`RuleBucket`]의 집합인 [`RuleTable`]로 인코딩합니다.
//! 인코딩은 전부 성공하거나 전부 실패합니다.
//!
//! # 키 구성
//! ```text
//! LpmKey (24 bytes)
//! 0  prefix_len u32   32 + (IPv4: 96 + n, IPv6: n)
//! 4  ifindex    [u8;4] big-endian
//! 8  addr       [u8;16] (IPv4 → ::ffff:a.b.c.d)
//! ```
//! ifindex를 키 앞부분에 두어 인터페이스마다 독립된 테이블처럼 동작하고,
//! IPv4 주소를 IPv4-mapped 형식으로 넣어 IPv4/IPv6 프리픽스가 섞이지 않습니다.
//!
//! 바이트 인코딩은 `bpfel` 타겟과 같은 리틀 엔디언입니다.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use infw_core::error::RuleError;
use infw_core::types::{
    IcmpRule, InterfaceRules, PortRange, Protocol, ProtocolRule, RuleAction, SourceCidr,
};
use infw_ebpf_common::{
    ACTION_ALLOW, ACTION_DENY, EventRecord, LPM_IFINDEX_BITS, LPM_IPV4_MAPPED_BITS, LpmKeyData,
    MAX_RULE_ID, MAX_RULES_PER_TARGET, RULE_FLAG_ICMP_MATCH, RuleBucket, RuleEntry,
    StatisticsEntry, ipv4_mapped, is_ipv4_mapped, lpm_key_data,
};

use crate::attach::IfIndexResolver;
use crate::error::SyncError;

/// `RuleEntry` 바이트 크기
pub const RULE_ENTRY_SIZE: usize = 16;
/// `RuleBucket` 바이트 크기
pub const RULE_BUCKET_SIZE: usize = 4 + RULE_ENTRY_SIZE * MAX_RULES_PER_TARGET;
/// LPM 키 바이트 크기 (prefix_len + data)
pub const LPM_KEY_SIZE: usize = 4 + 20;
/// `StatisticsEntry` 바이트 크기
pub const STATISTICS_ENTRY_SIZE: usize = 16;
/// `EventRecord` 바이트 크기
pub const EVENT_RECORD_SIZE: usize = 24;

/// 바이트 디코딩 에러
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// 입력 길이가 레이아웃과 맞지 않음
    #[error("{what}: expected {expected} bytes, got {actual}")]
    Length {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// 버킷의 룰 수가 용량을 초과함
    #[error("bucket claims {0} rules, more than its capacity")]
    TooManyRules(u32),

    /// LPM 프리픽스 길이가 유효 범위 밖
    #[error("invalid LPM prefix length {0}")]
    PrefixLen(u32),

    /// 알 수 없는 액션 코드
    #[error("unknown action code {0}")]
    Action(u8),

    /// 알 수 없는 프로토콜 번호
    #[error("unknown protocol number {0}")]
    Protocol(u8),
}

// =============================================================================
// PrefixKey
// =============================================================================

/// 룰 테이블 키: (인터페이스, 출발지 네트워크 프리픽스)
///
/// 호스트 비트는 항상 0입니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PrefixKey {
    /// 수신 인터페이스 인덱스
    pub ifindex: u32,
    /// 네트워크 주소
    pub addr: IpAddr,
    /// 프리픽스 길이 (IPv4: 0-32, IPv6: 0-128)
    pub prefix_len: u8,
}

impl PrefixKey {
    /// 호스트 비트를 지워 키를 생성합니다.
    pub fn new(ifindex: u32, cidr: SourceCidr) -> Self {
        let net = cidr.network();
        Self {
            ifindex,
            addr: net.addr,
            prefix_len: net.prefix_len,
        }
    }

    /// 출발지 CIDR 형태로 반환합니다.
    pub fn cidr(&self) -> SourceCidr {
        SourceCidr {
            addr: self.addr,
            prefix_len: self.prefix_len,
        }
    }

    /// 커널 LPM 키의 프리픽스 길이 (ifindex 비트 포함)
    pub fn lpm_prefix_len(&self) -> u32 {
        let addr_bits = match self.addr {
            IpAddr::V4(_) => LPM_IPV4_MAPPED_BITS + u32::from(self.prefix_len),
            IpAddr::V6(_) => u32::from(self.prefix_len),
        };
        LPM_IFINDEX_BITS + addr_bits
    }

    /// 커널 LPM 키 데이터 (ifindex + 16바이트 주소)
    pub fn lpm_data(&self) -> LpmKeyData {
        lpm_key_data(self.ifindex, &addr_bytes(self.addr))
    }
}

/// 주소를 LPM 키의 16바이트 형식으로 변환합니다.
pub fn addr_bytes(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(v4) => ipv4_mapped(v4.octets()),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// LPM 키의 16바이트 주소를 `IpAddr`로 되돌립니다.
pub fn addr_from_bytes(bytes: [u8; 16]) -> IpAddr {
    if is_ipv4_mapped(&bytes) {
        IpAddr::V4(Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]))
    } else {
        IpAddr::V6(Ipv6Addr::from(bytes))
    }
}

// =============================================================================
// RuleTable
// =============================================================================

/// 디코딩된 단일 룰
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRule {
    /// 룰 ID (= order)
    pub rule_id: u32,
    /// 프로토콜
    pub protocol: Protocol,
    /// 목적지 포트 범위
    pub ports: Option<PortRange>,
    /// ICMP 타입/코드
    pub icmp: Option<IcmpRule>,
    /// 액션
    pub action: RuleAction,
}

/// 커널에 설치할 전체 룰 테이블
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleTable {
    buckets: BTreeMap<PrefixKey, RuleBucket>,
}

impl RuleTable {
    /// 프리픽스 수
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// 비어 있는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// 모든 버킷의 룰 수 합계
    pub fn rule_count(&self) -> usize {
        self.buckets.values().map(|b| b.num_rules as usize).sum()
    }

    /// 키의 버킷을 조회합니다 (정확히 일치하는 키만).
    pub fn get(&self, key: &PrefixKey) -> Option<&RuleBucket> {
        self.buckets.get(key)
    }

    /// (키, 버킷)을 키 순서로 순회합니다.
    pub fn iter(&self) -> impl Iterator<Item = (&PrefixKey, &RuleBucket)> {
        self.buckets.iter()
    }

    /// 프리픽스별 순서 있는 룰 목록으로 디코딩합니다.
    pub fn decode(&self) -> Result<BTreeMap<PrefixKey, Vec<DecodedRule>>, DecodeError> {
        self.buckets
            .iter()
            .map(|(key, bucket)| {
                let rules = active_rules(bucket)?
                    .iter()
                    .map(decode_entry)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((*key, rules))
            })
            .collect()
    }
}

fn active_rules(bucket: &RuleBucket) -> Result<&[RuleEntry], DecodeError> {
    let n = bucket.num_rules as usize;
    if n > MAX_RULES_PER_TARGET {
        return Err(DecodeError::TooManyRules(bucket.num_rules));
    }
    Ok(&bucket.rules[..n])
}

fn decode_entry(entry: &RuleEntry) -> Result<DecodedRule, DecodeError> {
    let protocol =
        Protocol::from_ip_number(entry.protocol).ok_or(DecodeError::Protocol(entry.protocol))?;
    let ports = (entry.port_start != 0).then_some(PortRange {
        start: entry.port_start,
        end: entry.port_end,
    });
    let icmp = (entry.flags & RULE_FLAG_ICMP_MATCH != 0).then_some(IcmpRule {
        icmp_type: entry.icmp_type,
        icmp_code: entry.icmp_code,
    });
    Ok(DecodedRule {
        rule_id: entry.rule_id,
        protocol,
        ports,
        icmp,
        action: decode_action(entry.action)?,
    })
}

/// 액션을 커널 코드로 변환합니다.
pub const fn action_code(action: RuleAction) -> u8 {
    match action {
        RuleAction::Allow => ACTION_ALLOW,
        RuleAction::Deny => ACTION_DENY,
    }
}

/// 커널 액션 코드를 변환합니다.
pub fn decode_action(code: u8) -> Result<RuleAction, DecodeError> {
    match code {
        ACTION_ALLOW => Ok(RuleAction::Allow),
        ACTION_DENY => Ok(RuleAction::Deny),
        other => Err(DecodeError::Action(other)),
    }
}

// =============================================================================
// 인코딩
// =============================================================================

/// 프로토콜 룰을 커널 룰 엔트리로 변환합니다.
pub fn rule_entry(rule: &ProtocolRule) -> Result<RuleEntry, RuleError> {
    rule.validate()?;
    if rule.order == 0 || rule.order > MAX_RULE_ID {
        return Err(RuleError::InvalidRule {
            order: rule.order,
            reason: format!("order must be in 1..={MAX_RULE_ID}"),
        });
    }

    let mut entry = RuleEntry {
        rule_id: rule.order,
        protocol: rule.protocol.ip_number(),
        action: action_code(rule.action),
        ..RuleEntry::zeroed()
    };
    if let Some(range) = rule.port_range()? {
        entry.port_start = range.start;
        entry.port_end = range.end;
    }
    if let Some(icmp) = rule.icmp_rule {
        entry.flags |= RULE_FLAG_ICMP_MATCH;
        entry.icmp_type = icmp.icmp_type;
        entry.icmp_code = icmp.icmp_code;
    }
    Ok(entry)
}

type Compiled<'a> = BTreeMap<(&'a str, SourceCidr), Vec<RuleEntry>>;

/// (인터페이스, 프리픽스)별로 정렬된 룰 엔트리를 모읍니다.
fn compile(rules: &InterfaceRules) -> Result<Compiled<'_>, SyncError> {
    let mut compiled: BTreeMap<(&str, SourceCidr), Vec<RuleEntry>> = BTreeMap::new();

    for (iface, ingress_rules) in rules {
        for ingress in ingress_rules {
            let entries = ingress
                .protocol_rules
                .iter()
                .map(rule_entry)
                .collect::<Result<Vec<_>, _>>()?;

            for cidr in ingress.parsed_cidrs()? {
                compiled
                    .entry((iface.as_str(), cidr.network()))
                    .or_default()
                    .extend_from_slice(&entries);
            }
        }
    }

    for ((iface, cidr), entries) in &mut compiled {
        entries.sort_by_key(|e| e.rule_id);
        if let Some(pair) = entries.windows(2).find(|w| w[0].rule_id == w[1].rule_id) {
            return Err(RuleError::InvalidRule {
                order: pair[0].rule_id,
                reason: format!("duplicate order for {cidr} on {iface}"),
            }
            .into());
        }
        if entries.len() > MAX_RULES_PER_TARGET {
            return Err(SyncError::CapacityExceeded {
                interface: (*iface).to_owned(),
                prefix: cidr.to_string(),
                count: entries.len(),
                limit: MAX_RULES_PER_TARGET,
            });
        }
    }

    Ok(compiled)
}

/// 원하는 상태를 커널 룰 테이블로 인코딩합니다.
///
/// # 에러
/// - `CapacityExceeded`: 프리픽스 하나의 룰이 100개를 초과
/// - `InvalidRule`: CIDR/포트/order 오류 또는 같은 프리픽스 안의 order 중복
/// - `InvalidInterface`: ifindex를 조회할 수 없는 인터페이스
pub fn encode(
    rules: &InterfaceRules,
    resolver: &dyn IfIndexResolver,
) -> Result<RuleTable, SyncError> {
    let compiled = compile(rules)?;

    let mut ifindexes = BTreeMap::new();
    for iface in rules.keys() {
        ifindexes.insert(iface.as_str(), resolver.ifindex(iface)?);
    }

    let mut buckets = BTreeMap::new();
    for ((iface, cidr), entries) in compiled {
        let ifindex = ifindexes
            .get(iface)
            .copied()
            .ok_or_else(|| SyncError::InvalidInterface(iface.to_owned()))?;
        let mut bucket = RuleBucket::zeroed();
        bucket.num_rules = entries.len() as u32;
        bucket.rules[..entries.len()].copy_from_slice(&entries);
        buckets.insert(PrefixKey::new(ifindex, cidr), bucket);
    }

    Ok(RuleTable { buckets })
}

/// ifindex 없이 룰을 검증하고 인코딩될 룰 엔트리 수를 반환합니다.
pub fn validate(rules: &InterfaceRules) -> Result<usize, SyncError> {
    Ok(compile(rules)?.values().map(Vec::len).sum())
}

// =============================================================================
// 바이트 레이아웃
// =============================================================================

fn check_len(what: &'static str, buf: &[u8], expected: usize) -> Result<(), DecodeError> {
    if buf.len() != expected {
        return Err(DecodeError::Length {
            what,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// `RuleBucket`을 1604바이트 레코드로 인코딩합니다.
pub fn encode_bucket(bucket: &RuleBucket) -> Bytes {
    let mut buf = BytesMut::with_capacity(RULE_BUCKET_SIZE);
    buf.put_u32_le(bucket.num_rules);
    for entry in &bucket.rules {
        buf.put_u32_le(entry.rule_id);
        buf.put_u8(entry.protocol);
        buf.put_u8(entry.flags);
        buf.put_u16_le(entry.port_start);
        buf.put_u16_le(entry.port_end);
        buf.put_u8(entry.icmp_type);
        buf.put_u8(entry.icmp_code);
        buf.put_u8(entry.action);
        buf.put_bytes(0, 3);
    }
    buf.freeze()
}

/// 1604바이트 레코드를 `RuleBucket`으로 디코딩합니다.
pub fn decode_bucket(mut buf: &[u8]) -> Result<RuleBucket, DecodeError> {
    check_len("rule bucket", buf, RULE_BUCKET_SIZE)?;

    let mut bucket = RuleBucket::zeroed();
    bucket.num_rules = buf.get_u32_le();
    if bucket.num_rules as usize > MAX_RULES_PER_TARGET {
        return Err(DecodeError::TooManyRules(bucket.num_rules));
    }
    for entry in &mut bucket.rules {
        entry.rule_id = buf.get_u32_le();
        entry.protocol = buf.get_u8();
        entry.flags = buf.get_u8();
        entry.port_start = buf.get_u16_le();
        entry.port_end = buf.get_u16_le();
        entry.icmp_type = buf.get_u8();
        entry.icmp_code = buf.get_u8();
        entry.action = buf.get_u8();
        buf.advance(3);
    }
    Ok(bucket)
}

/// `PrefixKey`를 24바이트 커널 LPM 키로 인코딩합니다.
pub fn encode_key(key: &PrefixKey) -> Bytes {
    let mut buf = BytesMut::with_capacity(LPM_KEY_SIZE);
    buf.put_u32_le(key.lpm_prefix_len());
    buf.put_slice(&key.lpm_data());
    buf.freeze()
}

/// 24바이트 커널 LPM 키를 `PrefixKey`로 디코딩합니다.
pub fn decode_key(mut buf: &[u8]) -> Result<PrefixKey, DecodeError> {
    check_len("lpm key", buf, LPM_KEY_SIZE)?;

    let lpm_len = buf.get_u32_le();
    let ifindex = buf.get_u32();
    let mut addr = [0u8; 16];
    buf.copy_to_slice(&mut addr);

    let addr_bits = lpm_len
        .checked_sub(LPM_IFINDEX_BITS)
        .filter(|bits| *bits <= 128)
        .ok_or(DecodeError::PrefixLen(lpm_len))?;

    let addr = addr_from_bytes(addr);
    let prefix_len = match addr {
        IpAddr::V4(_) => addr_bits
            .checked_sub(LPM_IPV4_MAPPED_BITS)
            .ok_or(DecodeError::PrefixLen(lpm_len))?,
        IpAddr::V6(_) => addr_bits,
    };

    Ok(PrefixKey {
        ifindex,
        addr,
        prefix_len: prefix_len as u8,
    })
}

/// 16바이트 통계 엔트리 배열을 rule_id → 통계로 디코딩합니다.
///
/// 배열 인덱스가 rule_id이며, 값이 모두 0인 엔트리는 생략합니다.
pub fn decode_statistics(region: &[u8]) -> Result<BTreeMap<u32, StatisticsEntry>, DecodeError> {
    if region.len() % STATISTICS_ENTRY_SIZE != 0 {
        return Err(DecodeError::Length {
            what: "statistics region",
            expected: region.len() - region.len() % STATISTICS_ENTRY_SIZE,
            actual: region.len(),
        });
    }

    let mut out = BTreeMap::new();
    for (rule_id, mut chunk) in region.chunks_exact(STATISTICS_ENTRY_SIZE).enumerate() {
        let entry = StatisticsEntry {
            packets: chunk.get_u64_le(),
            bytes: chunk.get_u64_le(),
        };
        if entry != StatisticsEntry::zeroed() {
            out.insert(rule_id as u32, entry);
        }
    }
    Ok(out)
}

/// 24바이트 이벤트 레코드를 디코딩합니다.
///
/// 링 버퍼 레코드는 정렬 패딩으로 더 길 수 있으므로 앞부분만 읽습니다.
pub fn decode_event(mut buf: &[u8]) -> Result<EventRecord, DecodeError> {
    if buf.len() < EVENT_RECORD_SIZE {
        return Err(DecodeError::Length {
            what: "event record",
            expected: EVENT_RECORD_SIZE,
            actual: buf.len(),
        });
    }

    let mut record = EventRecord::zeroed();
    record.if_id = buf.get_u16_le();
    record.rule_id = buf.get_u16_le();
    record.action = buf.get_u8();
    record._fill = buf.get_u8();
    record.pkt_len = buf.get_u16_le();
    buf.copy_to_slice(&mut record.src_addr);
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attach::StaticIfIndexResolver;
    use infw_core::types::{IngressRule, PortRule};

    fn resolver() -> StaticIfIndexResolver {
        StaticIfIndexResolver::new([("eth0", 2), ("eth1", 3)])
    }

    fn tcp(order: u32, ports: &str, action: RuleAction) -> ProtocolRule {
        ProtocolRule {
            order,
            protocol: Protocol::Tcp,
            protocol_rule: Some(PortRule {
                ports: ports.to_owned(),
            }),
            icmp_rule: None,
            action,
        }
    }

    fn icmp(order: u32, icmp_type: u8, action: RuleAction) -> ProtocolRule {
        ProtocolRule {
            order,
            protocol: Protocol::Icmp,
            protocol_rule: None,
            icmp_rule: Some(IcmpRule {
                icmp_type,
                icmp_code: 0,
            }),
            action,
        }
    }

    fn single(iface: &str, cidrs: &[&str], rules: Vec<ProtocolRule>) -> InterfaceRules {
        InterfaceRules::from([(
            iface.to_owned(),
            vec![IngressRule {
                source_cidrs: cidrs.iter().map(|c| (*c).to_owned()).collect(),
                protocol_rules: rules,
            }],
        )])
    }

    #[test]
    fn encode_sorts_rules_by_order() {
        let rules = single(
            "eth0",
            &["172.16.0.0/12"],
            vec![
                tcp(20, "800-900", RuleAction::Deny),
                icmp(10, 8, RuleAction::Deny),
                tcp(5, "22", RuleAction::Allow),
            ],
        );
        let table = encode(&rules, &resolver()).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.rule_count(), 3);

        let decoded = table.decode().unwrap();
        let (key, list) = decoded.iter().next().unwrap();
        assert_eq!(key.ifindex, 2);
        assert_eq!(key.cidr().to_string(), "172.16.0.0/12");

        let ids: Vec<u32> = list.iter().map(|r| r.rule_id).collect();
        assert_eq!(ids, vec![5, 10, 20]);
        assert_eq!(list[0].action, RuleAction::Allow);
        assert_eq!(list[1].icmp, Some(IcmpRule { icmp_type: 8, icmp_code: 0 }));
        assert_eq!(list[2].ports, Some(PortRange { start: 800, end: 900 }));
        assert_eq!(list[2].action, RuleAction::Deny);
    }

    #[test]
    fn encode_normalizes_host_bits() {
        let rules = single("eth0", &["10.1.2.3/8"], vec![tcp(1, "80", RuleAction::Deny)]);
        let table = encode(&rules, &resolver()).unwrap();
        let (key, _) = table.iter().next().unwrap();
        assert_eq!(key.addr, "10.0.0.0".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn encode_splits_cidrs_and_interfaces() {
        let mut rules = single(
            "eth0",
            &["10.0.0.0/8", "fd00::/16"],
            vec![tcp(1, "80", RuleAction::Deny)],
        );
        rules.extend(single("eth1", &["10.0.0.0/8"], vec![tcp(2, "443", RuleAction::Allow)]));

        let table = encode(&rules, &resolver()).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.rule_count(), 3);
    }

    #[test]
    fn encode_rejects_bucket_over_capacity() {
        let many: Vec<ProtocolRule> = (1..=101)
            .map(|order| tcp(order, "80", RuleAction::Deny))
            .collect();
        let rules = single("eth0", &["10.0.0.0/8"], many);

        let err = encode(&rules, &resolver()).unwrap_err();
        assert!(matches!(
            err,
            SyncError::CapacityExceeded {
                count: 101,
                limit: 100,
                ..
            }
        ));
        assert!(validate(&rules).is_err());
    }

    #[test]
    fn encode_accepts_exactly_capacity() {
        let full: Vec<ProtocolRule> = (1..=100)
            .map(|order| tcp(order, "80", RuleAction::Deny))
            .collect();
        let rules = single("eth0", &["10.0.0.0/8"], full);
        assert_eq!(validate(&rules).unwrap(), 100);
    }

    #[test]
    fn encode_rejects_capacity_across_ingress_entries() {
        let first: Vec<ProtocolRule> = (1..=60).map(|o| tcp(o, "80", RuleAction::Deny)).collect();
        let second: Vec<ProtocolRule> =
            (61..=120).map(|o| tcp(o, "80", RuleAction::Deny)).collect();
        let rules = InterfaceRules::from([(
            "eth0".to_owned(),
            vec![
                IngressRule {
                    source_cidrs: vec!["10.0.0.0/8".to_owned()],
                    protocol_rules: first,
                },
                IngressRule {
                    source_cidrs: vec!["10.9.9.9/8".to_owned()],
                    protocol_rules: second,
                },
            ],
        )]);
        assert!(matches!(
            validate(&rules),
            Err(SyncError::CapacityExceeded { count: 120, .. })
        ));
    }

    #[test]
    fn encode_rejects_duplicate_order_in_bucket() {
        let rules = single(
            "eth0",
            &["10.0.0.0/8"],
            vec![tcp(7, "80", RuleAction::Deny), tcp(7, "81", RuleAction::Deny)],
        );
        let err = encode(&rules, &resolver()).unwrap_err();
        assert!(matches!(
            err,
            SyncError::InvalidRule(RuleError::InvalidRule { order: 7, .. })
        ));
    }

    #[test]
    fn encode_rejects_out_of_range_order() {
        for order in [0, 1024] {
            let rules = single("eth0", &["10.0.0.0/8"], vec![tcp(order, "80", RuleAction::Deny)]);
            assert!(matches!(
                encode(&rules, &resolver()),
                Err(SyncError::InvalidRule(_))
            ));
        }
    }

    #[test]
    fn encode_rejects_bad_ports() {
        let rules = single("eth0", &["10.0.0.0/8"], vec![tcp(1, "900-800", RuleAction::Deny)]);
        assert!(matches!(
            encode(&rules, &resolver()),
            Err(SyncError::InvalidRule(RuleError::InvalidPortRange { .. }))
        ));
    }

    #[test]
    fn encode_unknown_interface_is_invalid_interface() {
        let rules = single("eth9", &["10.0.0.0/8"], vec![tcp(1, "80", RuleAction::Deny)]);
        assert_eq!(
            encode(&rules, &resolver()).unwrap_err(),
            SyncError::InvalidInterface("eth9".to_owned())
        );
    }

    #[test]
    fn bucket_bytes_layout() {
        let mut bucket = RuleBucket::zeroed();
        bucket.num_rules = 1;
        bucket.rules[0] = rule_entry(&tcp(10, "800-900", RuleAction::Deny)).unwrap();

        let bytes = encode_bucket(&bucket);
        assert_eq!(bytes.len(), RULE_BUCKET_SIZE);
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &10u32.to_le_bytes());
        assert_eq!(bytes[8], 6);
        assert_eq!(&bytes[10..12], &800u16.to_le_bytes());
        assert_eq!(&bytes[12..14], &900u16.to_le_bytes());
        assert_eq!(bytes[16], ACTION_DENY);

        assert_eq!(decode_bucket(&bytes).unwrap(), bucket);
    }

    #[test]
    fn decode_bucket_rejects_bad_input() {
        assert!(matches!(
            decode_bucket(&[0u8; 10]),
            Err(DecodeError::Length { .. })
        ));

        let mut raw = vec![0u8; RULE_BUCKET_SIZE];
        raw[..4].copy_from_slice(&101u32.to_le_bytes());
        assert_eq!(decode_bucket(&raw), Err(DecodeError::TooManyRules(101)));
    }

    #[test]
    fn key_encoding_v4() {
        let key = PrefixKey::new(7, "192.168.0.0/16".parse().unwrap());
        assert_eq!(key.lpm_prefix_len(), 32 + 96 + 16);

        let bytes = encode_key(&key);
        assert_eq!(bytes.len(), LPM_KEY_SIZE);
        assert_eq!(&bytes[0..4], &144u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &[0, 0, 0, 7]);
        assert_eq!(&bytes[18..20], &[0xff, 0xff]);
        assert_eq!(&bytes[20..24], &[192, 168, 0, 0]);

        assert_eq!(decode_key(&bytes).unwrap(), key);
    }

    #[test]
    fn key_encoding_v6() {
        let key = PrefixKey::new(3, "fd00::/16".parse().unwrap());
        assert_eq!(key.lpm_prefix_len(), 32 + 16);
        assert_eq!(decode_key(&encode_key(&key)).unwrap(), key);
    }

    #[test]
    fn key_encoding_default_routes_differ_by_family() {
        let v4 = PrefixKey::new(2, "0.0.0.0/0".parse().unwrap());
        let v6 = PrefixKey::new(2, "::/0".parse().unwrap());
        assert_ne!(encode_key(&v4), encode_key(&v6));
        assert_eq!(decode_key(&encode_key(&v4)).unwrap(), v4);
    }

    #[test]
    fn decode_key_rejects_short_prefix() {
        let mut raw = [0u8; LPM_KEY_SIZE];
        raw[..4].copy_from_slice(&16u32.to_le_bytes());
        assert_eq!(decode_key(&raw), Err(DecodeError::PrefixLen(16)));
    }

    #[test]
    fn statistics_skip_zero_entries() {
        let mut region = vec![0u8; STATISTICS_ENTRY_SIZE * 4];
        // slot 0: 기본 액션 카운터
        region[0..8].copy_from_slice(&5u64.to_le_bytes());
        region[8..16].copy_from_slice(&300u64.to_le_bytes());
        // slot 3
        region[48..56].copy_from_slice(&2u64.to_le_bytes());
        region[56..64].copy_from_slice(&128u64.to_le_bytes());

        let stats = decode_statistics(&region).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[&0], StatisticsEntry { packets: 5, bytes: 300 });
        assert_eq!(stats[&3], StatisticsEntry { packets: 2, bytes: 128 });
    }

    #[test]
    fn statistics_reject_partial_entry() {
        assert!(decode_statistics(&[0u8; 20]).is_err());
    }

    #[test]
    fn event_decoding() {
        let mut raw = [0u8; EVENT_RECORD_SIZE];
        raw[0..2].copy_from_slice(&4u16.to_le_bytes());
        raw[2..4].copy_from_slice(&10u16.to_le_bytes());
        raw[4] = ACTION_DENY;
        raw[6..8].copy_from_slice(&98u16.to_le_bytes());
        raw[8..24].copy_from_slice(&ipv4_mapped([10, 0, 0, 1]));

        let event = decode_event(&raw).unwrap();
        assert_eq!(event.if_id, 4);
        assert_eq!(event.rule_id, 10);
        assert_eq!(decode_action(event.action).unwrap(), RuleAction::Deny);
        assert_eq!(event.pkt_len, 98);
        assert_eq!(
            addr_from_bytes(event.src_addr),
            "10.0.0.1".parse::<IpAddr>().unwrap()
        );

        assert!(decode_event(&raw[..20]).is_err());
    }

    // =============================================================================
    // 속성 테스트
    // =============================================================================

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        /// (프로토콜 종류, 시작 포트, 포트 폭, ICMP 타입, allow 여부)
        type RuleSpec = (u8, u16, u16, u8, bool);

        type Summary = BTreeMap<PrefixKey, Vec<(u32, Protocol, RuleAction)>>;

        fn source_cidr() -> impl Strategy<Value = SourceCidr> {
            prop_oneof![
                (any::<u32>(), 0u8..=32).prop_map(|(addr, prefix_len)| SourceCidr {
                    addr: IpAddr::V4(Ipv4Addr::from(addr)),
                    prefix_len,
                }),
                (any::<u128>(), 0u8..=128).prop_map(|(addr, prefix_len)| SourceCidr {
                    addr: IpAddr::V6(Ipv6Addr::from(addr)),
                    prefix_len,
                }),
            ]
        }

        fn block() -> impl Strategy<Value = (Vec<SourceCidr>, Vec<RuleSpec>)> {
            (
                prop::collection::vec(source_cidr(), 1..=3),
                prop::collection::vec(
                    (0u8..4, 1u16..=65535, 0u16..1000, any::<u8>(), any::<bool>()),
                    1..=30,
                ),
            )
        }

        fn protocol_rule(order: u32, (kind, start, width, icmp_type, allow): RuleSpec) -> ProtocolRule {
            let action = if allow { RuleAction::Allow } else { RuleAction::Deny };
            let end = start.saturating_add(width);
            match kind {
                0 => tcp(order, &format!("{start}-{end}"), action),
                1 => ProtocolRule {
                    protocol: Protocol::Udp,
                    ..tcp(order, &start.to_string(), action)
                },
                2 => icmp(order, icmp_type, action),
                _ => ProtocolRule {
                    order,
                    protocol: Protocol::Any,
                    protocol_rule: None,
                    icmp_rule: None,
                    action,
                },
            }
        }

        fn ingress(
            (cidrs, specs): (Vec<SourceCidr>, Vec<RuleSpec>),
            orders: &mut impl Iterator<Item = u32>,
        ) -> IngressRule {
            // 같은 네트워크로 정규화되는 CIDR은 한 번만 사용 (호스트 비트는 유지)
            let unique: BTreeMap<SourceCidr, SourceCidr> =
                cidrs.into_iter().map(|c| (c.network(), c)).collect();
            IngressRule {
                source_cidrs: unique.values().map(ToString::to_string).collect(),
                protocol_rules: specs
                    .into_iter()
                    .zip(orders)
                    .map(|(spec, order)| protocol_rule(order, spec))
                    .collect(),
            }
        }

        /// 인터페이스마다 order가 겹치지 않고 프리픽스당 최대 90개인 룰 집합
        fn rule_set() -> impl Strategy<Value = InterfaceRules> {
            (
                prop::collection::vec(block(), 1..=3),
                prop::collection::vec(block(), 0..=3),
                Just((1..=MAX_RULE_ID).collect::<Vec<u32>>()).prop_shuffle(),
            )
                .prop_map(|(eth0, eth1, orders)| {
                    let mut rules = InterfaceRules::new();
                    for (iface, blocks) in [("eth0", eth0), ("eth1", eth1)] {
                        if blocks.is_empty() {
                            continue;
                        }
                        let mut orders = orders.iter().copied();
                        let ingress_rules = blocks
                            .into_iter()
                            .map(|b| ingress(b, &mut orders))
                            .collect();
                        rules.insert(iface.to_owned(), ingress_rules);
                    }
                    rules
                })
        }

        fn expected_summary(rules: &InterfaceRules, resolver: &StaticIfIndexResolver) -> Summary {
            let mut expected = Summary::new();
            for (iface, ingress_rules) in rules {
                let ifindex = resolver.ifindex(iface).unwrap();
                for ingress in ingress_rules {
                    for cidr in ingress.parsed_cidrs().unwrap() {
                        expected
                            .entry(PrefixKey::new(ifindex, cidr))
                            .or_default()
                            .extend(ingress.protocol_rules.iter().map(|r| (r.order, r.protocol, r.action)));
                    }
                }
            }
            for list in expected.values_mut() {
                list.sort_by_key(|(order, ..)| *order);
            }
            expected
        }

        proptest! {
            #[test]
            fn decode_restores_ids_order_and_actions(rules in rule_set()) {
                let resolver = resolver();
                let table = encode(&rules, &resolver).unwrap();

                let decoded: Summary = table
                    .decode()
                    .unwrap()
                    .into_iter()
                    .map(|(key, list)| {
                        let entries = list.iter().map(|r| (r.rule_id, r.protocol, r.action)).collect();
                        (key, entries)
                    })
                    .collect();
                prop_assert_eq!(decoded, expected_summary(&rules, &resolver));
            }
        }
    }
}
