//! 패킷 디코더 — 링크/네트워크/전송 계층 슬라이싱과 플로우 발행
//!
//! 캡처된 프레임을 `Ethernet → [802.1Q] → {IPv4 | IPv6} → {TCP | UDP |
//! ICMPv4 | ICMPv6}` 순으로 디코딩하여 패킷 1개짜리 [`Flow`]를 만듭니다.
//! 지원하지 않는 계층은 무시하고 디코딩 가능한 부분만 사용합니다.
//!
//! IP 계층이 없는 프레임(ARP 등)은 플로우가 되지 않으며 조용히 드롭됩니다.

use std::net::IpAddr;
use std::time::SystemTime;

use etherparse::{LinkSlice, NetSlice, SlicedPacket, TcpSlice, TransportSlice, VlanSlice};

use netflume_core::flow::{
    Flow, FlowKey, TCP_CONTROL_ACK, TCP_CONTROL_CWR, TCP_CONTROL_ECE, TCP_CONTROL_FIN,
    TCP_CONTROL_NS, TCP_CONTROL_PSH, TCP_CONTROL_RST, TCP_CONTROL_SYN, TCP_CONTROL_URG,
};

/// TCP 헤더 플래그를 IANA IPFIX IE 6 비트 배치로 변환합니다.
fn tcp_control_bits(tcp: &TcpSlice<'_>) -> u16 {
    let mut bits = 0u16;
    if tcp.fin() {
        bits |= TCP_CONTROL_FIN;
    }
    if tcp.syn() {
        bits |= TCP_CONTROL_SYN;
    }
    if tcp.rst() {
        bits |= TCP_CONTROL_RST;
    }
    if tcp.psh() {
        bits |= TCP_CONTROL_PSH;
    }
    if tcp.ack() {
        bits |= TCP_CONTROL_ACK;
    }
    if tcp.urg() {
        bits |= TCP_CONTROL_URG;
    }
    if tcp.ece() {
        bits |= TCP_CONTROL_ECE;
    }
    if tcp.cwr() {
        bits |= TCP_CONTROL_CWR;
    }
    if tcp.ns() {
        bits |= TCP_CONTROL_NS;
    }
    bits
}

/// 프레임 하나를 디코딩하여 플로우를 발행합니다.
///
/// `wire_length`는 캡처 메타데이터의 원래(on-wire) 길이로,
/// 스냅 길이에 잘린 경우에도 실제 패킷 크기를 반영합니다.
/// IP 계층이 없으면 `None`을 반환합니다 (비-IP 패킷 드롭).
pub fn decode_frame(
    data: &[u8],
    wire_length: u32,
    timestamp: SystemTime,
    if_index: u16,
) -> Option<Flow> {
    let sliced = match SlicedPacket::from_ethernet(data) {
        Ok(sliced) => sliced,
        Err(e) => {
            tracing::trace!(error = %e, "cannot slice captured frame");
            return None;
        }
    };

    let mut key = FlowKey::default();
    let mut control_bits = 0u16;

    if let Some(LinkSlice::Ethernet2(eth)) = &sliced.link {
        // 슬라이스는 캡처 버퍼를 빌린다 — 키에는 값으로 복사해 저장한다.
        key.source_mac = eth.source();
        key.destination_mac = eth.destination();
    }

    match &sliced.vlan {
        Some(VlanSlice::SingleVlan(vlan)) => {
            key.vlan_id = vlan.vlan_identifier().value();
        }
        Some(VlanSlice::DoubleVlan(vlan)) => {
            // QinQ는 외측 태그를 사용한다.
            key.vlan_id = vlan.outer().vlan_identifier().value();
        }
        None => {}
    }

    match &sliced.net {
        Some(NetSlice::Ipv4(v4)) => {
            let header = v4.header();
            key.ip_version = 4;
            key.protocol = header.protocol().0;
            key.class_of_service = (header.dcp().value() << 2) | header.ecn().value();
            key.source_ip = IpAddr::V4(header.source_addr());
            key.destination_ip = IpAddr::V4(header.destination_addr());
            key.fragment_id = u32::from(header.identification());
        }
        Some(NetSlice::Ipv6(v6)) => {
            let header = v6.header();
            key.ip_version = 6;
            key.protocol = header.next_header().0;
            key.class_of_service = header.traffic_class();
            key.source_ip = IpAddr::V6(header.source_addr());
            key.destination_ip = IpAddr::V6(header.destination_addr());
            key.flow_label_v6 = header.flow_label().value();
        }
        _ => {}
    }

    match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => {
            control_bits = tcp_control_bits(tcp);
            key.source_port = tcp.source_port();
            key.destination_port = tcp.destination_port();
        }
        Some(TransportSlice::Udp(udp)) => {
            key.source_port = udp.source_port();
            key.destination_port = udp.destination_port();
        }
        Some(TransportSlice::Icmpv4(icmp)) => {
            key.icmp_type_code = (u16::from(icmp.type_u8()) << 8) | u16::from(icmp.code_u8());
        }
        Some(TransportSlice::Icmpv6(icmp)) => {
            key.icmp_type_code = (u16::from(icmp.type_u8()) << 8) | u16::from(icmp.code_u8());
        }
        _ => {}
    }

    if key.ip_version == 0 {
        return None;
    }

    let mut flow = Flow::from_packet(key, u64::from(wire_length), timestamp, if_index);
    flow.tcp_control_bits = control_bits;
    Some(flow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    const SRC_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
    const DST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];

    fn ethernet(dst: [u8; 6], src: [u8; 6], ether_type: u16) -> Vec<u8> {
        let mut frame = Vec::with_capacity(64);
        frame.extend_from_slice(&dst);
        frame.extend_from_slice(&src);
        frame.extend_from_slice(&ether_type.to_be_bytes());
        frame
    }

    fn ipv4_header(tos: u8, id: u16, protocol: u8, payload_len: u16, src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut header = Vec::with_capacity(20);
        header.push(0x45); // version 4, IHL 5
        header.push(tos);
        header.extend_from_slice(&(20 + payload_len).to_be_bytes());
        header.extend_from_slice(&id.to_be_bytes());
        header.extend_from_slice(&0u16.to_be_bytes()); // flags + fragment offset
        header.push(64); // TTL
        header.push(protocol);
        header.extend_from_slice(&0u16.to_be_bytes()); // checksum (슬라이싱은 검증하지 않음)
        header.extend_from_slice(&src);
        header.extend_from_slice(&dst);
        header
    }

    fn udp_header(sport: u16, dport: u16, payload_len: u16) -> Vec<u8> {
        let mut header = Vec::with_capacity(8);
        header.extend_from_slice(&sport.to_be_bytes());
        header.extend_from_slice(&dport.to_be_bytes());
        header.extend_from_slice(&(8 + payload_len).to_be_bytes());
        header.extend_from_slice(&0u16.to_be_bytes());
        header
    }

    fn tcp_header(sport: u16, dport: u16, flags: u8) -> Vec<u8> {
        let mut header = Vec::with_capacity(20);
        header.extend_from_slice(&sport.to_be_bytes());
        header.extend_from_slice(&dport.to_be_bytes());
        header.extend_from_slice(&1u32.to_be_bytes()); // seq
        header.extend_from_slice(&0u32.to_be_bytes()); // ack
        header.push(0x50); // data offset 5
        header.push(flags);
        header.extend_from_slice(&1024u16.to_be_bytes()); // window
        header.extend_from_slice(&0u16.to_be_bytes()); // checksum
        header.extend_from_slice(&0u16.to_be_bytes()); // urgent pointer
        header
    }

    fn ipv4_udp_frame() -> Vec<u8> {
        let mut frame = ethernet(DST_MAC, SRC_MAC, 0x0800);
        frame.extend_from_slice(&ipv4_header(
            0x10,
            0x1234,
            17,
            8,
            [10, 0, 0, 1],
            [10, 0, 0, 2],
        ));
        frame.extend_from_slice(&udp_header(53, 40000, 0));
        frame
    }

    fn ts() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    #[test]
    fn decodes_ipv4_udp_frame() {
        let frame = ipv4_udp_frame();
        let flow = decode_frame(&frame, 128, ts(), 7).expect("udp frame should decode");

        assert_eq!(flow.key.ip_version, 4);
        assert_eq!(flow.key.protocol, 17);
        assert_eq!(flow.key.class_of_service, 0x10);
        assert_eq!(flow.key.source_ip, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(flow.key.destination_ip, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(flow.key.source_port, 53);
        assert_eq!(flow.key.destination_port, 40000);
        assert_eq!(flow.key.fragment_id, 0x1234);
        assert_eq!(flow.key.source_mac, SRC_MAC);
        assert_eq!(flow.key.destination_mac, DST_MAC);
        assert_eq!(flow.packet_delta_count, 1);
        assert_eq!(flow.octet_delta_count, 128);
        assert_eq!(flow.start, flow.end);
        assert_eq!(flow.if_index, 7);
    }

    #[test]
    fn decodes_vlan_tagged_frame() {
        let mut frame = ethernet(DST_MAC, SRC_MAC, 0x8100);
        frame.extend_from_slice(&0x00e7u16.to_be_bytes()); // PCP 0, VID 0xe7
        frame.extend_from_slice(&0x0800u16.to_be_bytes());
        frame.extend_from_slice(&ipv4_header(0, 1, 17, 8, [10, 0, 0, 1], [10, 0, 0, 2]));
        frame.extend_from_slice(&udp_header(1000, 2000, 0));

        let flow = decode_frame(&frame, 64, ts(), 1).expect("vlan frame should decode");
        assert_eq!(flow.key.vlan_id, 0xe7);
        assert_eq!(flow.key.ip_version, 4);
    }

    #[test]
    fn translates_tcp_flags_to_ie6_layout() {
        let mut frame = ethernet(DST_MAC, SRC_MAC, 0x0800);
        frame.extend_from_slice(&ipv4_header(0, 2, 6, 20, [10, 0, 0, 1], [10, 0, 0, 2]));
        frame.extend_from_slice(&tcp_header(443, 51000, 0x12)); // SYN|ACK

        let flow = decode_frame(&frame, 74, ts(), 1).expect("tcp frame should decode");
        assert_eq!(flow.key.protocol, 6);
        assert_eq!(flow.tcp_control_bits, TCP_CONTROL_SYN | TCP_CONTROL_ACK);

        let mut fin_frame = ethernet(DST_MAC, SRC_MAC, 0x0800);
        fin_frame.extend_from_slice(&ipv4_header(0, 3, 6, 20, [10, 0, 0, 1], [10, 0, 0, 2]));
        fin_frame.extend_from_slice(&tcp_header(443, 51000, 0x11)); // FIN|ACK
        let fin_flow = decode_frame(&fin_frame, 74, ts(), 1).unwrap();
        assert_eq!(fin_flow.tcp_control_bits, TCP_CONTROL_FIN | TCP_CONTROL_ACK);

        // NS는 data offset 바이트의 최하위 비트 (프레임 오프셋 14 + 20 + 12)
        let mut ns_frame = ethernet(DST_MAC, SRC_MAC, 0x0800);
        ns_frame.extend_from_slice(&ipv4_header(0, 4, 6, 20, [10, 0, 0, 1], [10, 0, 0, 2]));
        ns_frame.extend_from_slice(&tcp_header(443, 51000, 0x02)); // SYN
        ns_frame[46] |= 0x01;
        let ns_flow = decode_frame(&ns_frame, 74, ts(), 1).unwrap();
        assert_eq!(ns_flow.tcp_control_bits, TCP_CONTROL_SYN | TCP_CONTROL_NS);
    }

    #[test]
    fn decodes_ipv6_tcp_frame() {
        let mut frame = ethernet(DST_MAC, SRC_MAC, 0x86dd);
        // version 6, traffic class 0x20, flow label 0x12345
        let vtc_flow: u32 = (6 << 28) | (0x20 << 20) | 0x12345;
        frame.extend_from_slice(&vtc_flow.to_be_bytes());
        frame.extend_from_slice(&20u16.to_be_bytes()); // payload length
        frame.push(6); // next header = TCP
        frame.push(64); // hop limit
        frame.extend_from_slice(&"2001:db8::1".parse::<std::net::Ipv6Addr>().unwrap().octets());
        frame.extend_from_slice(&"2001:db8::2".parse::<std::net::Ipv6Addr>().unwrap().octets());
        frame.extend_from_slice(&tcp_header(443, 52000, 0x02)); // SYN

        let flow = decode_frame(&frame, 94, ts(), 2).expect("ipv6 frame should decode");
        assert_eq!(flow.key.ip_version, 6);
        assert_eq!(flow.key.protocol, 6);
        assert_eq!(flow.key.class_of_service, 0x20);
        assert_eq!(flow.key.flow_label_v6, 0x12345);
        assert_eq!(
            flow.key.source_ip,
            "2001:db8::1".parse::<IpAddr>().unwrap()
        );
        assert_eq!(flow.tcp_control_bits, TCP_CONTROL_SYN);
    }

    #[test]
    fn decodes_icmpv4_type_and_code() {
        let mut frame = ethernet(DST_MAC, SRC_MAC, 0x0800);
        frame.extend_from_slice(&ipv4_header(0, 4, 1, 8, [10, 0, 0, 1], [10, 0, 0, 2]));
        // ICMP echo request: type 8, code 0
        frame.extend_from_slice(&[8, 0, 0, 0, 0, 1, 0, 1]);

        let flow = decode_frame(&frame, 60, ts(), 1).expect("icmp frame should decode");
        assert_eq!(flow.key.icmp_type_code, 0x0800);
        assert_eq!(flow.key.source_port, 0);
        assert_eq!(flow.key.destination_port, 0);
    }

    #[test]
    fn non_ip_frame_is_dropped() {
        // ARP 요청 프레임
        let mut frame = ethernet([0xff; 6], SRC_MAC, 0x0806);
        frame.extend_from_slice(&[
            0, 1, 8, 0, 6, 4, 0, 1, // htype/ptype/hlen/plen/oper
            2, 0, 0, 0, 0, 1, 10, 0, 0, 1, // sender
            0, 0, 0, 0, 0, 0, 10, 0, 0, 2, // target
        ]);
        assert!(decode_frame(&frame, 60, ts(), 1).is_none());
    }

    #[test]
    fn truncated_frame_is_dropped() {
        let frame = ipv4_udp_frame();
        assert!(decode_frame(&frame[..10], 10, ts(), 1).is_none());
    }

    #[test]
    fn both_directions_of_one_conversation_share_a_hash() {
        let forward = decode_frame(&ipv4_udp_frame(), 128, ts(), 1).unwrap();

        let mut reverse = ethernet(SRC_MAC, DST_MAC, 0x0800);
        reverse.extend_from_slice(&ipv4_header(
            0x10,
            0x4321,
            17,
            8,
            [10, 0, 0, 2],
            [10, 0, 0, 1],
        ));
        reverse.extend_from_slice(&udp_header(40000, 53, 0));
        let backward = decode_frame(&reverse, 90, ts(), 1).unwrap();

        assert_eq!(forward.key.hash(), backward.key.hash());
    }
}
