//! 플로우 도메인 타입 — 방향 정규화 키와 집계 레코드
//!
//! [`FlowKey`]는 캡처된 패킷의 5-튜플 + 메타데이터를 담는 플로우 식별자입니다.
//! 양방향 트래픽이 같은 키로 귀결되도록 직렬화 시점에 정규화(canonicalization)되며,
//! 55바이트 직렬화 버퍼에 대한 FNV-1a 64 해시가 캐시 조회 키가 됩니다.
//!
//! [`Flow`]는 같은 키를 공유하는 패킷들의 집계 레코드입니다.
//! 캡처 핸들러가 패킷 1개짜리 플로우를 발행하고, 캐시가 [`Flow::absorb`]로 병합합니다.

use std::cmp::Ordering;
use std::fmt;
use std::hash::Hasher;
use std::net::{IpAddr, Ipv4Addr};
use std::time::SystemTime;

use fnv::FnvHasher;

// --- IANA IPFIX IE 6: tcpControlBits 비트 배치 ---
// https://www.iana.org/assignments/ipfix/ipfix.xml

/// TCP FIN 플래그
pub const TCP_CONTROL_FIN: u16 = 0x0001;
/// TCP SYN 플래그
pub const TCP_CONTROL_SYN: u16 = 0x0002;
/// TCP RST 플래그
pub const TCP_CONTROL_RST: u16 = 0x0004;
/// TCP PSH 플래그
pub const TCP_CONTROL_PSH: u16 = 0x0008;
/// TCP ACK 플래그
pub const TCP_CONTROL_ACK: u16 = 0x0010;
/// TCP URG 플래그
pub const TCP_CONTROL_URG: u16 = 0x0020;
/// TCP ECE 플래그
pub const TCP_CONTROL_ECE: u16 = 0x0040;
/// TCP CWR 플래그
pub const TCP_CONTROL_CWR: u16 = 0x0080;
/// TCP NS 플래그
pub const TCP_CONTROL_NS: u16 = 0x0100;

/// 직렬화된 FlowKey의 길이 (정렬 헤더 48바이트 + 판별자 7바이트)
pub const SERIALIZED_KEY_LEN: usize = 55;

/// 플로우 종료 사유 — IANA IPFIX IE 136 (flowEndReason)
///
/// 캐시에서 플로우가 퇴출될 때 부여됩니다. `None`(와이어 값 0)은
/// 아직 살아있는 플로우, 종료 시 purge된 플로우, LRU 밀려남에 해당합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlowEndReason {
    /// 유휴 타임아웃 초과
    IdleTimeout = 1,
    /// 활성 타임아웃 초과
    ActiveTimeout = 2,
    /// TCP FIN 관측 (자연 종료)
    EndOfFlow = 3,
    /// 강제 종료
    ForceEnd = 4,
    /// 자원 부족 (캐시 밀려남에 대한 계약상 의미)
    LackOfResources = 5,
}

impl FlowEndReason {
    /// IE 136 와이어 값을 반환합니다.
    pub fn wire_value(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for FlowEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdleTimeout => write!(f, "idle-timeout"),
            Self::ActiveTimeout => write!(f, "active-timeout"),
            Self::EndOfFlow => write!(f, "end-of-flow"),
            Self::ForceEnd => write!(f, "force-end"),
            Self::LackOfResources => write!(f, "lack-of-resources"),
        }
    }
}

/// 플로우 식별자 — 방향에 무관한 정규화 키
///
/// 캡처 핸들러가 디코딩한 계층에서 채워 넣습니다. IP 주소는 디코더의
/// 내부 버퍼 재사용 문제를 피하기 위해 값으로 복사되어 저장됩니다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowKey {
    /// 출발지 IP (IPv4는 v4-in-v6 매핑으로 직렬화)
    pub source_ip: IpAddr,
    /// 목적지 IP
    pub destination_ip: IpAddr,
    /// 출발지 전송 포트
    pub source_port: u16,
    /// 목적지 전송 포트
    pub destination_port: u16,
    /// ICMPv4/v6 type<<8 | code
    pub icmp_type_code: u16,
    /// 출발지 MAC
    pub source_mac: [u8; 6],
    /// 목적지 MAC
    pub destination_mac: [u8; 6],
    /// 802.1Q VLAN ID (12비트 유효)
    pub vlan_id: u16,
    /// IPv6 플로우 레이블 (20비트 유효)
    pub flow_label_v6: u32,
    /// IPv4 단편화 식별자
    pub fragment_id: u32,
    /// IP 프로토콜 / IPv6 NextHeader
    pub protocol: u8,
    /// IPv4 TOS / IPv6 Traffic Class
    pub class_of_service: u8,
    /// 4 또는 6. 0이면 IP 패킷이 아니며 캡처 단계에서 드롭됩니다.
    pub ip_version: u8,
}

impl Default for FlowKey {
    fn default() -> Self {
        Self {
            source_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            destination_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            source_port: 0,
            destination_port: 0,
            icmp_type_code: 0,
            source_mac: [0; 6],
            destination_mac: [0; 6],
            vlan_id: 0,
            flow_label_v6: 0,
            fragment_id: 0,
            protocol: 0,
            class_of_service: 0,
            ip_version: 0,
        }
    }
}

/// IP 주소를 16바이트 표현으로 변환합니다 (IPv4는 v4-in-v6 매핑).
fn ip_octets16(addr: &IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

impl FlowKey {
    /// 방향 정규화된 48바이트 정렬 헤더를 생성합니다.
    ///
    /// 엔드포인트마다 `[IP(16) | 포트(2, BE) | MAC(6)]` 24바이트 버퍼를 만들고,
    /// IP+포트 구간(0..18)의 사전순 비교로 두 버퍼의 순서를 결정합니다.
    /// 같으면 MAC 주소로 동률을 깹니다 (src ≥ dst이면 src 우선).
    /// 어느 방향의 패킷이든 같은 헤더가 나옵니다.
    pub fn sort_key_header(&self) -> [u8; 48] {
        let mut first = [0u8; 24];
        first[..16].copy_from_slice(&ip_octets16(&self.source_ip));
        first[16..18].copy_from_slice(&self.source_port.to_be_bytes());
        first[18..].copy_from_slice(&self.source_mac);

        let mut second = [0u8; 24];
        second[..16].copy_from_slice(&ip_octets16(&self.destination_ip));
        second[16..18].copy_from_slice(&self.destination_port.to_be_bytes());
        second[18..].copy_from_slice(&self.destination_mac);

        let source_first = match first[..18].cmp(&second[..18]) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.source_mac >= self.destination_mac,
        };

        let mut buf = [0u8; 48];
        if source_first {
            buf[..24].copy_from_slice(&first);
            buf[24..].copy_from_slice(&second);
        } else {
            buf[..24].copy_from_slice(&second);
            buf[24..].copy_from_slice(&first);
        }
        buf
    }

    /// 55바이트 직렬화 키를 생성합니다.
    ///
    /// 정렬 헤더 48바이트 뒤에 판별자 7바이트를 덧붙입니다:
    /// `icmp_type_code >> 8`(u16 BE — 상위 바이트만 유효, 원본과의
    /// 키 호환을 위해 유지), `vlan_id`(u16 BE), 프로토콜, TOS, IP 버전.
    pub fn serialize_key(&self) -> [u8; SERIALIZED_KEY_LEN] {
        let mut buf = [0u8; SERIALIZED_KEY_LEN];
        buf[..48].copy_from_slice(&self.sort_key_header());
        buf[48..50].copy_from_slice(&(self.icmp_type_code >> 8).to_be_bytes());
        buf[50..52].copy_from_slice(&self.vlan_id.to_be_bytes());
        buf[52] = self.protocol;
        buf[53] = self.class_of_service;
        buf[54] = self.ip_version;
        buf
    }

    /// 직렬화 키에 대한 FNV-1a 64 해시를 반환합니다.
    ///
    /// 같은 대화의 양방향 패킷은 동일한 해시를 가집니다.
    pub fn hash(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        hasher.write(&self.serialize_key());
        hasher.finish()
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sIP:{}, dIP:{}, sPort:{}, dPort:{}, icmp:{}, vlan:{}, label:{}, fragID:{}, proto:{}, tos:{}, ipver:{}",
            self.source_ip,
            self.destination_ip,
            self.source_port,
            self.destination_port,
            self.icmp_type_code,
            self.vlan_id,
            self.flow_label_v6,
            self.fragment_id,
            self.protocol,
            self.class_of_service,
            self.ip_version,
        )
    }
}

/// 플로우 집계 레코드
///
/// 캡처 핸들러가 패킷마다 `packet_delta_count = 1`로 발행하고,
/// 캐시가 같은 키의 기존 레코드에 병합합니다.
#[derive(Debug, Clone)]
pub struct Flow {
    /// 정규화 키
    pub key: FlowKey,
    /// 병합된 모든 패킷의 와이어 길이 합
    pub octet_delta_count: u64,
    /// 병합된 패킷 수
    pub packet_delta_count: u64,
    /// 첫 패킷 관측 시각 (생성 후 불변)
    pub start: SystemTime,
    /// 최근 패킷 관측 시각 (병합마다 단조 증가)
    pub end: SystemTime,
    /// 관측된 모든 TCP 플래그의 OR (IE 6 배치)
    pub tcp_control_bits: u16,
    /// 종료 사유 — 퇴출 시 부여, 살아있는 동안 None
    pub end_reason: Option<FlowEndReason>,
    /// 캡처한 인터페이스 인덱스
    pub if_index: u16,
}

impl Flow {
    /// 단일 패킷으로부터 플로우를 생성합니다.
    pub fn from_packet(key: FlowKey, wire_length: u64, timestamp: SystemTime, if_index: u16) -> Self {
        Self {
            key,
            octet_delta_count: wire_length,
            packet_delta_count: 1,
            start: timestamp,
            end: timestamp,
            tcp_control_bits: 0,
            end_reason: None,
            if_index,
        }
    }

    /// 같은 키의 후속 플로우를 병합합니다.
    ///
    /// 카운터는 유입된 값만큼 누적되고, `end`는 유입 시각으로 갱신되며,
    /// TCP 플래그는 OR로 쌓입니다. `start`와 키는 변하지 않습니다.
    pub fn absorb(&mut self, incoming: &Flow) {
        self.packet_delta_count += incoming.packet_delta_count;
        self.octet_delta_count += incoming.octet_delta_count;
        self.end = incoming.end;
        self.tcp_control_bits |= incoming.tcp_control_bits;
    }

    /// 종료 사유의 IE 136 와이어 값을 반환합니다 (미부여 시 0).
    pub fn end_reason_wire_value(&self) -> u8 {
        self.end_reason.map_or(0, FlowEndReason::wire_value)
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "key:[{}], tcpFlags:{:#06x}, octets:{}, packets:{}, iface:{}",
            self.key,
            self.tcp_control_bits,
            self.octet_delta_count,
            self.packet_delta_count,
            self.if_index,
        )
    }
}
