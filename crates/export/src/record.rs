//! NetFlow v5 와이어 포맷 — 24바이트 헤더 + 48바이트 레코드
//!
//! 모든 다중 바이트 필드는 빅엔디언입니다. 하나의 데이터그램은
//! 1400바이트를 넘지 않으며 최대 28개의 레코드를 담습니다.
//!
//! 조회 불가능한 필드(next-hop, 출력 ifIndex, AS 번호, 프리픽스 길이)는
//! 0으로 채웁니다.

use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use netflume_core::flow::Flow;

use crate::error::ExportError;

/// NetFlow v5 헤더 크기 (바이트)
pub const HEADER_SIZE: usize = 24;
/// NetFlow v5 레코드 크기 (바이트)
pub const RECORD_SIZE: usize = 48;
/// 데이터그램 최대 크기 (바이트)
pub const MAX_DATAGRAM_SIZE: usize = 1_400;
/// 데이터그램 하나에 담기는 최대 레코드 수
pub const MAX_RECORDS_PER_DATAGRAM: usize = (MAX_DATAGRAM_SIZE - HEADER_SIZE) / RECORD_SIZE;

/// NetFlow v5 버전 상수
const NETFLOW_V5_VERSION: u16 = 5;

/// `base` 이후 경과한 밀리초 (u32 절사, 역전 시 0)
fn millis_since(base: SystemTime, t: SystemTime) -> u32 {
    t.duration_since(base)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u32
}

/// 플로우 키의 IPv4 옥텟을 추출합니다.
fn ipv4_octets(addr: &IpAddr) -> Result<[u8; 4], ExportError> {
    match addr {
        IpAddr::V4(v4) => Ok(v4.octets()),
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(|v4| v4.octets())
            .ok_or(ExportError::UnsupportedIpVersion(6)),
    }
}

/// 헤더 프리앰블을 기록합니다 (버전, 엔진 타입/ID, 샘플링).
///
/// 레코드 수와 시각 필드는 플러시 시점에 [`patch_header`]로 채워집니다.
pub fn write_header_preamble(buf: &mut [u8]) {
    buf[0..2].copy_from_slice(&NETFLOW_V5_VERSION.to_be_bytes());
    buf[20] = 0; // engine type
    buf[21] = 0; // engine id
    buf[22..24].copy_from_slice(&0u16.to_be_bytes()); // sampling interval
}

/// 플러시 직전에 헤더의 가변 필드를 채웁니다.
///
/// - `record_count`: 이 데이터그램에 실제로 담긴 레코드 수
/// - `last_flow_end`: 마지막으로 담긴 플로우의 `end` 시각
/// - `base_time`: sysUptime의 기준 시각 (데몬 기동 시각)
/// - `flow_sequence`: 누적 플로우 시퀀스 카운터
pub fn patch_header(
    buf: &mut [u8],
    record_count: u16,
    last_flow_end: SystemTime,
    base_time: SystemTime,
    flow_sequence: u32,
) {
    let since_epoch = last_flow_end
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    buf[2..4].copy_from_slice(&record_count.to_be_bytes());
    buf[4..8].copy_from_slice(&millis_since(base_time, last_flow_end).to_be_bytes());
    buf[8..12].copy_from_slice(&(since_epoch.as_secs() as u32).to_be_bytes());
    buf[12..16].copy_from_slice(&since_epoch.subsec_nanos().to_be_bytes());
    buf[16..20].copy_from_slice(&flow_sequence.to_be_bytes());
}

/// 플로우 하나를 48바이트 v5 레코드로 직렬화합니다.
///
/// `buf`는 정확히 [`RECORD_SIZE`] 바이트의 쓰기 구간이어야 합니다.
/// ICMP 플로우는 목적지 포트 필드에 `type<<8 | code`를 싣습니다.
pub fn serialize_record(
    flow: &Flow,
    base_time: SystemTime,
    buf: &mut [u8],
) -> Result<(), ExportError> {
    if flow.key.ip_version != 4 {
        return Err(ExportError::UnsupportedIpVersion(flow.key.ip_version));
    }

    buf[0..4].copy_from_slice(&ipv4_octets(&flow.key.source_ip)?);
    buf[4..8].copy_from_slice(&ipv4_octets(&flow.key.destination_ip)?);
    buf[8..12].copy_from_slice(&0u32.to_be_bytes()); // next-hop, 조회 불가
    buf[12..14].copy_from_slice(&flow.if_index.to_be_bytes());
    buf[14..16].copy_from_slice(&0u16.to_be_bytes()); // output ifIndex, 조회 불가
    buf[16..20].copy_from_slice(&(flow.packet_delta_count as u32).to_be_bytes());
    buf[20..24].copy_from_slice(&(flow.octet_delta_count as u32).to_be_bytes());
    buf[24..28].copy_from_slice(&millis_since(base_time, flow.start).to_be_bytes());
    buf[28..32].copy_from_slice(&millis_since(base_time, flow.end).to_be_bytes());
    if flow.key.icmp_type_code > 0 {
        buf[32..34].copy_from_slice(&0u16.to_be_bytes());
        buf[34..36].copy_from_slice(&flow.key.icmp_type_code.to_be_bytes());
    } else {
        buf[32..34].copy_from_slice(&flow.key.source_port.to_be_bytes());
        buf[34..36].copy_from_slice(&flow.key.destination_port.to_be_bytes());
    }
    buf[36] = 0; // padding
    buf[37] = flow.tcp_control_bits as u8;
    buf[38] = flow.key.protocol;
    buf[39] = flow.key.class_of_service;
    buf[40..42].copy_from_slice(&0u16.to_be_bytes()); // source AS
    buf[42..44].copy_from_slice(&0u16.to_be_bytes()); // destination AS
    buf[44] = 0; // source prefix length
    buf[45] = 0; // destination prefix length
    buf[46..48].copy_from_slice(&0u16.to_be_bytes()); // padding
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use netflume_core::flow::{FlowKey, TCP_CONTROL_ACK, TCP_CONTROL_NS, TCP_CONTROL_SYN};

    fn base() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    fn sample_flow() -> Flow {
        let key = FlowKey {
            source_ip: "192.168.1.10".parse().unwrap(),
            destination_ip: "10.20.30.40".parse().unwrap(),
            source_port: 443,
            destination_port: 51000,
            protocol: 6,
            class_of_service: 0x48,
            ip_version: 4,
            ..FlowKey::default()
        };
        let mut flow = Flow::from_packet(key, 1_500, base() + Duration::from_millis(250), 3);
        flow.end = base() + Duration::from_millis(750);
        flow.packet_delta_count = 10;
        flow.octet_delta_count = 15_000;
        flow.tcp_control_bits = TCP_CONTROL_SYN | TCP_CONTROL_ACK;
        flow
    }

    #[test]
    fn sizes_match_the_v5_layout() {
        assert_eq!(HEADER_SIZE, 24);
        assert_eq!(RECORD_SIZE, 48);
        assert_eq!(MAX_RECORDS_PER_DATAGRAM, 28);
        assert_eq!(HEADER_SIZE + MAX_RECORDS_PER_DATAGRAM * RECORD_SIZE, 1_368);
    }

    #[test]
    fn record_fields_land_at_documented_offsets() {
        let mut buf = [0u8; RECORD_SIZE];
        serialize_record(&sample_flow(), base(), &mut buf).unwrap();

        assert_eq!(&buf[0..4], &[192, 168, 1, 10]);
        assert_eq!(&buf[4..8], &[10, 20, 30, 40]);
        assert_eq!(&buf[8..12], &[0; 4]); // next-hop
        assert_eq!(u16::from_be_bytes([buf[12], buf[13]]), 3); // input ifIndex
        assert_eq!(u16::from_be_bytes([buf[14], buf[15]]), 0);
        assert_eq!(u32::from_be_bytes(buf[16..20].try_into().unwrap()), 10);
        assert_eq!(u32::from_be_bytes(buf[20..24].try_into().unwrap()), 15_000);
        assert_eq!(u32::from_be_bytes(buf[24..28].try_into().unwrap()), 250);
        assert_eq!(u32::from_be_bytes(buf[28..32].try_into().unwrap()), 750);
        assert_eq!(u16::from_be_bytes([buf[32], buf[33]]), 443);
        assert_eq!(u16::from_be_bytes([buf[34], buf[35]]), 51_000);
        assert_eq!(buf[36], 0);
        assert_eq!(buf[37], (TCP_CONTROL_SYN | TCP_CONTROL_ACK) as u8);
        assert_eq!(buf[38], 6);
        assert_eq!(buf[39], 0x48);
        assert_eq!(&buf[40..48], &[0; 8]); // AS, 프리픽스 길이, 패딩
    }

    #[test]
    fn icmp_flow_uses_destination_port_field() {
        let mut flow = sample_flow();
        flow.key.icmp_type_code = 0x0303; // dest unreachable / port unreachable
        flow.key.source_port = 0;
        flow.key.destination_port = 0;
        flow.key.protocol = 1;

        let mut buf = [0u8; RECORD_SIZE];
        serialize_record(&flow, base(), &mut buf).unwrap();
        assert_eq!(u16::from_be_bytes([buf[32], buf[33]]), 0);
        assert_eq!(u16::from_be_bytes([buf[34], buf[35]]), 0x0303);
    }

    #[test]
    fn counters_truncate_to_u32() {
        let mut flow = sample_flow();
        flow.packet_delta_count = u64::from(u32::MAX) + 7;
        flow.octet_delta_count = u64::from(u32::MAX) + 100;

        let mut buf = [0u8; RECORD_SIZE];
        serialize_record(&flow, base(), &mut buf).unwrap();
        assert_eq!(u32::from_be_bytes(buf[16..20].try_into().unwrap()), 6);
        assert_eq!(u32::from_be_bytes(buf[20..24].try_into().unwrap()), 99);
    }

    #[test]
    fn control_bits_keep_low_byte_only() {
        let mut flow = sample_flow();
        flow.tcp_control_bits = TCP_CONTROL_NS | TCP_CONTROL_SYN;

        let mut buf = [0u8; RECORD_SIZE];
        serialize_record(&flow, base(), &mut buf).unwrap();
        assert_eq!(buf[37], TCP_CONTROL_SYN as u8);
    }

    #[test]
    fn ipv6_flow_is_rejected() {
        let mut flow = sample_flow();
        flow.key.ip_version = 6;
        flow.key.source_ip = "2001:db8::1".parse().unwrap();
        flow.key.destination_ip = "2001:db8::2".parse().unwrap();

        let mut buf = [0u8; RECORD_SIZE];
        let err = serialize_record(&flow, base(), &mut buf).unwrap_err();
        assert!(matches!(err, ExportError::UnsupportedIpVersion(6)));
    }

    #[test]
    fn header_preamble_and_patch() {
        let mut buf = [0u8; HEADER_SIZE];
        write_header_preamble(&mut buf);
        assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), 5);

        let last_end = base() + Duration::from_millis(1_500) + Duration::from_nanos(42);
        patch_header(&mut buf, 28, last_end, base(), 56);

        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 28);
        assert_eq!(u32::from_be_bytes(buf[4..8].try_into().unwrap()), 1_500);
        assert_eq!(
            u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            1_700_000_001
        );
        assert_eq!(
            u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            500_000_042
        );
        assert_eq!(u32::from_be_bytes(buf[16..20].try_into().unwrap()), 56);
        assert_eq!(buf[20], 0);
        assert_eq!(buf[21], 0);
        assert_eq!(u16::from_be_bytes([buf[22], buf[23]]), 0);
    }

    #[test]
    fn start_before_base_time_clamps_to_zero() {
        let mut flow = sample_flow();
        flow.start = base() - Duration::from_secs(5);

        let mut buf = [0u8; RECORD_SIZE];
        serialize_record(&flow, base(), &mut buf).unwrap();
        assert_eq!(u32::from_be_bytes(buf[24..28].try_into().unwrap()), 0);
    }
}
