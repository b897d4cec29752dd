//! 프리픽스 매치 인덱스: 커널 분류기와 동일한 LPM 조회의 유저스페이스 사본
//!
//! 커널 LPM 트라이와 같은 키(ifindex 32비트 + 16바이트 주소)와 같은 비트 비교를
//! 사용하므로, 설치할 [`RuleTable`]이 패킷을 어떻게 분류할지 미리 확인할 수 있습니다.
//!
//! # 분류 순서
//! 1. (ifindex, 출발지 주소)에 매칭되는 가장 긴 프리픽스를 찾음
//! 2. 프리픽스가 없으면 기본 액션 (`NoPrefix`)
//! 3. 버킷을 order 오름차순으로 스캔해 첫 번째 매칭 룰의 액션 (`Rule`)
//! 4. 버킷 안에 매칭 룰이 없으면 기본 액션 (`NoRuleInBucket`)

use std::net::IpAddr;

use infw_core::types::RuleAction;
use infw_ebpf_common::{DEFAULT_RULE_ID, LpmKeyData, PacketMeta, RuleBucket, lpm_key_data};

use crate::codec::{DecodeError, PrefixKey, RuleTable, addr_bytes, decode_action};

/// 분류 결과의 근거
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// 버킷 안의 룰이 매칭됨
    Rule,
    /// 프리픽스는 매칭됐지만 버킷 안에 매칭 룰이 없음
    NoRuleInBucket,
    /// 매칭되는 프리픽스가 없음
    NoPrefix,
}

/// 분류 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// 매칭된 룰 ID (기본 액션이면 0)
    pub rule_id: u32,
    /// 적용할 액션
    pub action: RuleAction,
    /// 결과 근거
    pub outcome: MatchOutcome,
    /// 매칭된 프리픽스 (`NoPrefix`면 `None`)
    pub prefix: Option<PrefixKey>,
}

struct IndexEntry {
    key: PrefixKey,
    data: LpmKeyData,
    bits: u32,
    bucket: RuleBucket,
}

/// 최장 프리픽스 매치 인덱스
pub struct PrefixMatchIndex {
    /// LPM 비트 길이 내림차순
    entries: Vec<IndexEntry>,
    default_action: RuleAction,
}

impl PrefixMatchIndex {
    /// 룰 테이블로 인덱스를 생성합니다.
    ///
    /// # 에러
    /// 버킷에 유효하지 않은 액션 코드가 있으면 `DecodeError`를 반환합니다.
    pub fn new(table: &RuleTable, default_action: RuleAction) -> Result<Self, DecodeError> {
        table.decode()?;

        let mut entries: Vec<IndexEntry> = table
            .iter()
            .map(|(key, bucket)| IndexEntry {
                key: *key,
                data: key.lpm_data(),
                bits: key.lpm_prefix_len(),
                bucket: *bucket,
            })
            .collect();
        entries.sort_by(|a, b| b.bits.cmp(&a.bits));

        Ok(Self {
            entries,
            default_action,
        })
    }

    /// 프리픽스 수
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 인덱스가 비어 있는지
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 가장 긴 매칭 프리픽스를 찾습니다.
    pub fn longest_match(&self, ifindex: u32, src: IpAddr) -> Option<(&PrefixKey, &RuleBucket)> {
        let data = lpm_key_data(ifindex, &addr_bytes(src));
        self.entries
            .iter()
            .find(|entry| prefix_matches(&entry.data, &data, entry.bits))
            .map(|entry| (&entry.key, &entry.bucket))
    }

    /// 패킷을 분류합니다.
    pub fn classify(&self, ifindex: u32, src: IpAddr, pkt: &PacketMeta) -> Classification {
        let Some((key, bucket)) = self.longest_match(ifindex, src) else {
            return self.default_classification(MatchOutcome::NoPrefix, None);
        };

        match bucket.first_match(pkt) {
            Some(entry) => match decode_action(entry.action) {
                Ok(action) => Classification {
                    rule_id: entry.rule_id,
                    action,
                    outcome: MatchOutcome::Rule,
                    prefix: Some(*key),
                },
                // new()에서 디코딩을 검증했으므로 도달하지 않음
                Err(_) => self.default_classification(MatchOutcome::NoRuleInBucket, Some(*key)),
            },
            None => self.default_classification(MatchOutcome::NoRuleInBucket, Some(*key)),
        }
    }

    fn default_classification(
        &self,
        outcome: MatchOutcome,
        prefix: Option<PrefixKey>,
    ) -> Classification {
        Classification {
            rule_id: DEFAULT_RULE_ID,
            action: self.default_action,
            outcome,
            prefix,
        }
    }
}

/// `key`의 앞 `bits` 비트가 `data`와 같은지 확인합니다.
fn prefix_matches(key: &LpmKeyData, data: &LpmKeyData, bits: u32) -> bool {
    let full = (bits / 8) as usize;
    let rest = bits % 8;
    if key[..full] != data[..full] {
        return false;
    }
    if rest == 0 {
        return true;
    }
    let mask = 0xffu8 << (8 - rest);
    key[full] & mask == data[full] & mask
}
