//! 매칭 이벤트: 커널 링 버퍼 레코드를 유저스페이스 이벤트로 전달
//!
//! 커널 분류기는 분류 결정마다 [`EventRecord`] 하나를 링 버퍼에 기록합니다.
//! [`EventReader`]는 링 버퍼를 비우면서 레코드를 [`FirewallEvent`]로 디코딩해
//! bounded 채널로 보냅니다. 채널이 가득 차면 이벤트를 버리고 카운트합니다.

use std::fmt;
use std::net::IpAddr;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use infw_core::metrics as m;
use infw_core::types::RuleAction;
use infw_ebpf_common::EventRecord;

use crate::codec::{DecodeError, addr_from_bytes, decode_action, decode_event};

/// 분류 결정 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallEvent {
    /// 수신 인터페이스 인덱스
    pub interface_index: u32,
    /// 매칭된 룰 ID (기본 액션이면 0)
    pub rule_id: u32,
    /// 적용된 액션
    pub action: RuleAction,
    /// 패킷 길이 (바이트)
    pub pkt_len: u16,
    /// 출발지 주소
    pub src: IpAddr,
}

impl FirewallEvent {
    /// 커널 레코드에서 변환합니다.
    pub fn from_record(record: &EventRecord) -> Result<Self, DecodeError> {
        Ok(Self {
            interface_index: u32::from(record.if_id),
            rule_id: u32::from(record.rule_id),
            action: decode_action(record.action)?,
            pkt_len: record.pkt_len,
            src: addr_from_bytes(record.src_addr),
        })
    }

    /// 링 버퍼 바이트에서 디코딩합니다.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, DecodeError> {
        Self::from_record(&decode_event(buf)?)
    }
}

impl fmt::Display for FirewallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ifindex={} rule={} action={} src={} len={}",
            self.interface_index, self.rule_id, self.action, self.src, self.pkt_len
        )
    }
}

/// 레코드 하나를 전달한 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// 채널로 전송함
    Sent,
    /// 채널이 가득 차서 버림
    Dropped,
    /// 디코딩 실패
    Malformed,
    /// 수신자가 없음
    Closed,
}

/// 레코드 바이트를 디코딩해 채널로 보냅니다. 블로킹하지 않습니다.
pub fn dispatch(buf: &[u8], tx: &mpsc::Sender<FirewallEvent>) -> Dispatch {
    let event = match FirewallEvent::from_bytes(buf) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "malformed event record");
            return Dispatch::Malformed;
        }
    };
    metrics::counter!(m::EVENTS_RECEIVED_TOTAL).increment(1);

    match tx.try_send(event) {
        Ok(()) => Dispatch::Sent,
        Err(TrySendError::Full(_)) => {
            metrics::counter!(m::EVENTS_DROPPED_TOTAL).increment(1);
            debug!("event channel full, dropping event");
            Dispatch::Dropped
        }
        Err(TrySendError::Closed(_)) => Dispatch::Closed,
    }
}

#[cfg(target_os = "linux")]
pub use reader::EventReader;

#[cfg(target_os = "linux")]
mod reader {
    use aya::maps::{MapData, RingBuf};
    use tokio::io::Interest;
    use tokio::io::unix::AsyncFd;
    use tokio::sync::mpsc;
    use tracing::{error, info};

    use super::{Dispatch, FirewallEvent, dispatch};

    /// INFW_EVENTS 링 버퍼 리더
    ///
    /// `AsyncFd`로 읽기 가능 알림을 기다린 뒤 가능한 레코드를 모두 비웁니다.
    pub struct EventReader {
        ring_buf: RingBuf<MapData>,
    }

    impl EventReader {
        /// 링 버퍼 맵으로 리더를 생성합니다.
        pub fn new(ring_buf: RingBuf<MapData>) -> Self {
            Self { ring_buf }
        }

        /// 수신 루프를 실행합니다.
        ///
        /// 런타임 안에서 호출해야 합니다. 링 버퍼 에러가 발생하거나
        /// 수신자가 모두 사라지면 종료합니다.
        pub async fn run(self, tx: mpsc::Sender<FirewallEvent>) {
            let mut async_fd = match AsyncFd::with_interest(self.ring_buf, Interest::READABLE) {
                Ok(fd) => fd,
                Err(e) => {
                    error!(error = %e, "failed to register event ring buffer");
                    return;
                }
            };
            info!("event reader started");

            loop {
                let mut guard = match async_fd.readable_mut().await {
                    Ok(guard) => guard,
                    Err(e) => {
                        error!(error = %e, "event ring buffer readable error");
                        break;
                    }
                };

                let rb = guard.get_inner_mut();
                while let Some(item) = rb.next() {
                    if dispatch(&item, &tx) == Dispatch::Closed {
                        info!("event receiver closed, stopping event reader");
                        return;
                    }
                }
                guard.clear_ready();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EVENT_RECORD_SIZE;
    use infw_ebpf_common::{ACTION_ALLOW, ACTION_DENY, ipv4_mapped};

    fn record_bytes(if_id: u16, rule_id: u16, action: u8, src: [u8; 16]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(EVENT_RECORD_SIZE);
        buf.extend_from_slice(&if_id.to_le_bytes());
        buf.extend_from_slice(&rule_id.to_le_bytes());
        buf.push(action);
        buf.push(0);
        buf.extend_from_slice(&98u16.to_le_bytes());
        buf.extend_from_slice(&src);
        buf
    }

    #[test]
    fn decode_ipv4_deny_event() {
        let bytes = record_bytes(2, 10, ACTION_DENY, ipv4_mapped([10, 1, 2, 3]));
        let event = FirewallEvent::from_bytes(&bytes).unwrap();

        assert_eq!(event.interface_index, 2);
        assert_eq!(event.rule_id, 10);
        assert_eq!(event.action, RuleAction::Deny);
        assert_eq!(event.pkt_len, 98);
        assert_eq!(event.src, "10.1.2.3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn decode_ipv6_event() {
        let src: std::net::Ipv6Addr = "fd00::5".parse().unwrap();
        let bytes = record_bytes(3, 0, ACTION_ALLOW, src.octets());
        let event = FirewallEvent::from_bytes(&bytes).unwrap();

        assert_eq!(event.rule_id, 0);
        assert_eq!(event.src, IpAddr::V6(src));
    }

    #[test]
    fn display_contains_fields() {
        let bytes = record_bytes(2, 10, ACTION_DENY, ipv4_mapped([10, 1, 2, 3]));
        let msg = FirewallEvent::from_bytes(&bytes).unwrap().to_string();
        assert!(msg.contains("rule=10"));
        assert!(msg.contains("src=10.1.2.3"));
    }

    #[tokio::test]
    async fn dispatch_sends_then_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let bytes = record_bytes(2, 10, ACTION_DENY, ipv4_mapped([10, 0, 0, 1]));

        assert_eq!(dispatch(&bytes, &tx), Dispatch::Sent);
        assert_eq!(dispatch(&bytes, &tx), Dispatch::Dropped);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.rule_id, 10);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dispatch_reports_malformed_and_closed() {
        let (tx, rx) = mpsc::channel(4);

        assert_eq!(dispatch(&[0u8; 8], &tx), Dispatch::Malformed);
        let unset_action = record_bytes(2, 10, 0, ipv4_mapped([10, 0, 0, 1]));
        assert_eq!(dispatch(&unset_action, &tx), Dispatch::Malformed);

        drop(rx);
        let bytes = record_bytes(2, 10, ACTION_DENY, ipv4_mapped([10, 0, 0, 1]));
        assert_eq!(dispatch(&bytes, &tx), Dispatch::Closed);
    }
}
