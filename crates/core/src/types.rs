//! 도메인 타입: 인그레스 방화벽 룰 명세
//!
//! 외부 컨트롤러(또는 룰 파일)가 전달하는 "원하는 상태"를 표현합니다.
//! JSON 직렬화 형식은 외부 오프로드 백엔드와의 계약이므로
//! 필드 이름(camelCase)을 바꾸지 않습니다.
//!
//! # JSON 예시
//! ```json
//! {
//!   "eth0": [
//!     {
//!       "sourceCIDRs": ["172.16.0.0/12"],
//!       "rules": [
//!         { "order": 10, "protocol": "ICMP", "icmpRule": { "icmpType": 8, "icmpCode": 0 }, "action": "Deny" },
//!         { "order": 20, "protocol": "TCP", "protocolRule": { "ports": "800-900" }, "action": "Deny" }
//!       ]
//!     }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RuleError;

/// 인터페이스 이름 → 순서 있는 인그레스 룰 목록
///
/// `BTreeMap`을 사용하여 순회 순서와 JSON 출력이 결정적입니다.
pub type InterfaceRules = BTreeMap<String, Vec<IngressRule>>;

/// 출발지 CIDR 집합 × 프로토콜 룰 목록
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    /// 출발지 CIDR 목록 (IPv4 또는 IPv6)
    #[serde(rename = "sourceCIDRs")]
    pub source_cidrs: Vec<String>,
    /// 프로토콜 룰 목록 (`order` 오름차순으로 평가)
    #[serde(rename = "rules", default)]
    pub protocol_rules: Vec<ProtocolRule>,
}

impl IngressRule {
    /// 모든 출발지 CIDR을 파싱합니다.
    pub fn parsed_cidrs(&self) -> Result<Vec<SourceCidr>, RuleError> {
        self.source_cidrs.iter().map(|c| c.parse()).collect()
    }
}

/// 단일 프로토콜 룰
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolRule {
    /// 평가 순서이자 룰 ID (낮을수록 먼저 평가)
    pub order: u32,
    /// 매칭할 프로토콜
    #[serde(default)]
    pub protocol: Protocol,
    /// TCP/UDP 목적지 포트 매처
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_rule: Option<PortRule>,
    /// ICMP/ICMPv6 타입/코드 매처
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icmp_rule: Option<IcmpRule>,
    /// 매칭 시 적용할 액션
    pub action: RuleAction,
}

impl ProtocolRule {
    /// 프로토콜과 매처의 조합을 검증합니다.
    ///
    /// - 포트 매처는 TCP/UDP에서만 허용됩니다.
    /// - ICMP 매처는 ICMP/ICMPv6에서만 허용됩니다.
    /// - 두 매처를 동시에 지정할 수 없습니다.
    pub fn validate(&self) -> Result<(), RuleError> {
        let invalid = |reason: String| RuleError::InvalidRule {
            order: self.order,
            reason,
        };

        match (self.protocol, &self.protocol_rule, &self.icmp_rule) {
            (_, Some(_), Some(_)) => {
                return Err(invalid(
                    "protocolRule and icmpRule are mutually exclusive".to_owned(),
                ));
            }
            (Protocol::Tcp | Protocol::Udp, _, None) => {}
            (Protocol::Icmp | Protocol::Icmp6, None, _) => {}
            (Protocol::Any, None, None) => {}
            (p, Some(_), None) => {
                return Err(invalid(format!("protocolRule requires TCP or UDP, got {p}")));
            }
            (p, None, Some(_)) => {
                return Err(invalid(format!("icmpRule requires ICMP or ICMPv6, got {p}")));
            }
        }

        self.port_range().map(|_| ())
    }

    /// 목적지 포트 범위를 파싱합니다. 포트 매처가 없으면 `None`입니다.
    pub fn port_range(&self) -> Result<Option<PortRange>, RuleError> {
        self.protocol_rule
            .as_ref()
            .map(|r| r.ports.parse())
            .transpose()
    }
}

/// 매칭 대상 프로토콜
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// 모든 프로토콜
    #[default]
    #[serde(rename = "Any", alias = "")]
    Any,
    /// TCP
    #[serde(rename = "TCP")]
    Tcp,
    /// UDP
    #[serde(rename = "UDP")]
    Udp,
    /// ICMP (IPv4)
    #[serde(rename = "ICMP")]
    Icmp,
    /// ICMPv6
    #[serde(rename = "ICMPv6")]
    Icmp6,
}

impl Protocol {
    /// IP 프로토콜 번호를 반환합니다. `Any`는 0입니다.
    pub const fn ip_number(self) -> u8 {
        match self {
            Self::Any => 0,
            Self::Icmp => 1,
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Icmp6 => 58,
        }
    }

    /// IP 프로토콜 번호에서 변환합니다.
    pub const fn from_ip_number(n: u8) -> Option<Self> {
        match n {
            0 => Some(Self::Any),
            1 => Some(Self::Icmp),
            6 => Some(Self::Tcp),
            17 => Some(Self::Udp),
            58 => Some(Self::Icmp6),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "Any"),
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
            Self::Icmp => write!(f, "ICMP"),
            Self::Icmp6 => write!(f, "ICMPv6"),
        }
    }
}

/// TCP/UDP 목적지 포트 매처
///
/// `ports`는 단일 포트(`"80"`) 또는 범위(`"800-900"`)입니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRule {
    /// 포트 또는 포트 범위 문자열
    pub ports: String,
}

/// 파싱된 목적지 포트 범위 (양 끝 포함)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    /// 시작 포트
    pub start: u16,
    /// 끝 포트 (단일 포트면 `start`와 같음)
    pub end: u16,
}

impl FromStr for PortRange {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| RuleError::InvalidPortRange {
            ports: s.to_owned(),
            reason: reason.to_owned(),
        };
        let parse_port = |p: &str| -> Result<u16, RuleError> {
            let port: u16 = p
                .trim()
                .parse()
                .map_err(|_| invalid("not a number in 1-65535"))?;
            if port == 0 {
                return Err(invalid("port 0 is not allowed"));
            }
            Ok(port)
        };

        let (start, end) = match s.split_once('-') {
            Some((lo, hi)) => (parse_port(lo)?, parse_port(hi)?),
            None => {
                let p = parse_port(s)?;
                (p, p)
            }
        };
        if start > end {
            return Err(invalid("start is greater than end"));
        }
        Ok(Self { start, end })
    }
}

/// ICMP/ICMPv6 타입/코드 매처
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IcmpRule {
    /// ICMP 타입 (예: 8 = echo request, 128 = ICMPv6 echo request)
    pub icmp_type: u8,
    /// ICMP 코드
    #[serde(default)]
    pub icmp_code: u8,
}

/// 룰 액션
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleAction {
    /// 패킷 통과 (XDP_PASS)
    #[serde(alias = "allow")]
    Allow,
    /// 패킷 차단 (XDP_DROP)
    #[serde(alias = "deny")]
    Deny,
}

impl FromStr for RuleAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            other => Err(format!("unknown action '{other}', expected 'allow' or 'deny'")),
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Deny => write!(f, "deny"),
        }
    }
}

/// 파싱된 출발지 CIDR
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceCidr {
    /// 주소
    pub addr: IpAddr,
    /// 프리픽스 길이 (IPv4: 0-32, IPv6: 0-128)
    pub prefix_len: u8,
}

impl SourceCidr {
    /// 주소 패밀리의 비트 폭
    pub const fn max_prefix_len(&self) -> u8 {
        match self.addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }

    /// 호스트 비트를 0으로 만든 네트워크 주소를 반환합니다.
    pub fn network(&self) -> Self {
        let addr = match self.addr {
            IpAddr::V4(v4) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
            }
            IpAddr::V6(v6) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
            }
        };
        Self {
            addr,
            prefix_len: self.prefix_len,
        }
    }
}

impl FromStr for SourceCidr {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| RuleError::InvalidCidr {
            cidr: s.to_owned(),
            reason: reason.to_owned(),
        };

        let (addr, len) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| invalid("missing '/<prefix length>'"))?;
        let addr: IpAddr = addr.parse().map_err(|_| invalid("invalid address"))?;
        let prefix_len: u8 = len.parse().map_err(|_| invalid("invalid prefix length"))?;

        let cidr = Self { addr, prefix_len };
        if prefix_len > cidr.max_prefix_len() {
            return Err(invalid("prefix length exceeds address width"));
        }
        Ok(cidr)
    }
}

impl fmt::Display for SourceCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}
