#![no_std]
#![no_main]

use core::mem;

use aya_ebpf::{
    bindings::xdp_action,
    macros::{map, xdp},
    maps::{
        Array, PerCpuArray, RingBuf,
        lpm_trie::{Key, LpmTrie},
    },
    programs::XdpContext,
};
use aya_log_ebpf::debug;
use infw_ebpf_common::{
    ACTION_ALLOW, ACTION_DENY, CONFIG_IDX_DEFAULT_ACTION, CONFIG_MAX_ENTRIES, DEFAULT_RULE_ID,
    EVENTS_RINGBUF_SIZE, EventRecord, LPM_IFINDEX_BITS, LpmKeyData, PROTO_ICMP, PROTO_ICMPV6,
    PROTO_TCP, PROTO_UDP, PacketMeta, RuleBucket, STATS_MAX_ENTRIES, StatisticsEntry,
    TABLE_MAX_ENTRIES, ipv4_mapped, lpm_key_data,
};

// =============================================================================
// 헤더 정의
// =============================================================================

const ETH_P_IP: u16 = 0x0800;
const ETH_P_IPV6: u16 = 0x86DD;
const ETH_HDR_LEN: usize = 14;
const IPV6_HDR_LEN: usize = 40;
/// LPM 키 전체 비트 수 (ifindex + 128비트 주소)
const FULL_PREFIX_LEN: u32 = LPM_IFINDEX_BITS + 128;

#[repr(C)]
struct EthHdr {
    _dst: [u8; 6],
    _src: [u8; 6],
    ether_type: [u8; 2],
}

#[repr(C)]
struct Ipv4Hdr {
    ver_ihl: u8,
    _tos: u8,
    _tot_len: [u8; 2],
    _id: [u8; 2],
    _frag_off: [u8; 2],
    _ttl: u8,
    proto: u8,
    _check: [u8; 2],
    src_addr: [u8; 4],
    _dst_addr: [u8; 4],
}

#[repr(C)]
struct Ipv6Hdr {
    _vtcfl: [u8; 4],
    _payload_len: [u8; 2],
    next_hdr: u8,
    _hop_limit: u8,
    src_addr: [u8; 16],
    _dst_addr: [u8; 16],
}

/// TCP/UDP 공통 앞부분 (포트)
#[repr(C)]
struct PortsHdr {
    _src: [u8; 2],
    dst: [u8; 2],
}

#[repr(C)]
struct IcmpHdr {
    icmp_type: u8,
    icmp_code: u8,
}

// =============================================================================
// 맵
// =============================================================================

/// (ifindex, 출발지 프리픽스) → 룰 버킷
#[map(name = "INFW_TABLE")]
static INFW_TABLE: LpmTrie<LpmKeyData, RuleBucket> =
    LpmTrie::with_max_entries(TABLE_MAX_ENTRIES, 0);

/// 룰 ID별 CPU 카운터
#[map(name = "INFW_STATS")]
static INFW_STATS: PerCpuArray<StatisticsEntry> =
    PerCpuArray::with_max_entries(STATS_MAX_ENTRIES, 0);

/// 분류 결과 이벤트
#[map(name = "INFW_EVENTS")]
static INFW_EVENTS: RingBuf = RingBuf::with_byte_size(EVENTS_RINGBUF_SIZE, 0);

/// 런타임 설정 (0: 기본 액션)
#[map(name = "INFW_CONFIG")]
static INFW_CONFIG: Array<u8> = Array::with_max_entries(CONFIG_MAX_ENTRIES, 0);

/// 인그레스 방화벽 XDP 분류기
///
/// 어태치된 인터페이스의 모든 수신 패킷을 출발지 프리픽스와 룰 버킷으로 판정합니다.
#[xdp]
pub fn infw_xdp(ctx: XdpContext) -> u32 {
    match try_infw_xdp(&ctx) {
        Ok(ret) => ret,
        // 파싱할 수 없는 패킷은 통과
        Err(()) => xdp_action::XDP_PASS,
    }
}

fn try_infw_xdp(ctx: &XdpContext) -> Result<u32, ()> {
    let eth: *const EthHdr = unsafe { ptr_at(ctx, 0)? };
    let ether_type = u16::from_be_bytes(unsafe { (*eth).ether_type });
    let l3 = ETH_HDR_LEN;

    let (src_addr, protocol, l4) = match ether_type {
        ETH_P_IP => {
            let ip: *const Ipv4Hdr = unsafe { ptr_at(ctx, l3)? };
            let ihl = usize::from(unsafe { (*ip).ver_ihl } & 0x0f) * 4;
            (
                ipv4_mapped(unsafe { (*ip).src_addr }),
                unsafe { (*ip).proto },
                l3 + ihl,
            )
        }
        ETH_P_IPV6 => {
            let ip: *const Ipv6Hdr = unsafe { ptr_at(ctx, l3)? };
            (
                unsafe { (*ip).src_addr },
                unsafe { (*ip).next_hdr },
                l3 + IPV6_HDR_LEN,
            )
        }
        _ => return Ok(xdp_action::XDP_PASS),
    };

    let mut pkt = PacketMeta {
        protocol,
        dst_port: 0,
        icmp_type: 0,
        icmp_code: 0,
    };
    match protocol {
        PROTO_TCP | PROTO_UDP => {
            let ports: *const PortsHdr = unsafe { ptr_at(ctx, l4)? };
            pkt.dst_port = u16::from_be_bytes(unsafe { (*ports).dst });
        }
        PROTO_ICMP | PROTO_ICMPV6 => {
            let icmp: *const IcmpHdr = unsafe { ptr_at(ctx, l4)? };
            pkt.icmp_type = unsafe { (*icmp).icmp_type };
            pkt.icmp_code = unsafe { (*icmp).icmp_code };
        }
        _ => {}
    }

    let ifindex = unsafe { (*ctx.ctx).ingress_ifindex };
    let pkt_len = (ctx.data_end() - ctx.data()) as u64;

    let key = Key::new(FULL_PREFIX_LEN, lpm_key_data(ifindex, &src_addr));
    let (rule_id, action) = match INFW_TABLE.get(&key) {
        Some(bucket) => match bucket.first_match(&pkt) {
            Some(rule) => (rule.rule_id, rule.action),
            None => (DEFAULT_RULE_ID, default_action()),
        },
        None => (DEFAULT_RULE_ID, default_action()),
    };

    record_stats(rule_id, pkt_len);
    emit_event(ifindex, rule_id, action, pkt_len, &src_addr);

    if action == ACTION_DENY {
        debug!(ctx, "deny rule={} if={}", rule_id, ifindex);
        Ok(xdp_action::XDP_DROP)
    } else {
        Ok(xdp_action::XDP_PASS)
    }
}

#[inline(always)]
fn default_action() -> u8 {
    match INFW_CONFIG.get(CONFIG_IDX_DEFAULT_ACTION) {
        Some(&action) if action == ACTION_DENY => ACTION_DENY,
        _ => ACTION_ALLOW,
    }
}

#[inline(always)]
fn record_stats(rule_id: u32, pkt_len: u64) {
    if let Some(entry) = INFW_STATS.get_ptr_mut(rule_id) {
        unsafe {
            (*entry).packets += 1;
            (*entry).bytes += pkt_len;
        }
    }
}

/// 링 버퍼가 가득 차면 이벤트를 버립니다.
#[inline(always)]
fn emit_event(ifindex: u32, rule_id: u32, action: u8, pkt_len: u64, src_addr: &[u8; 16]) {
    if let Some(mut entry) = INFW_EVENTS.reserve::<EventRecord>(0) {
        let ptr = entry.as_mut_ptr();
        unsafe {
            (*ptr).if_id = ifindex as u16;
            (*ptr).rule_id = rule_id as u16;
            (*ptr).action = action;
            (*ptr)._fill = 0;
            (*ptr).pkt_len = pkt_len as u16;
            (*ptr).src_addr = *src_addr;
        }
        entry.submit(0);
    }
}

/// 범위 검사된 포인터 접근. 검증기는 모든 접근이 data_end 이내임을 요구합니다.
#[inline(always)]
unsafe fn ptr_at<T>(ctx: &XdpContext, offset: usize) -> Result<*const T, ()> {
    let start = ctx.data();
    let end = ctx.data_end();
    let len = mem::size_of::<T>();
    if start + offset + len > end {
        return Err(());
    }
    Ok((start + offset) as *const T)
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
