//! 플로우 캐시 통합 테스트 — 채널을 통한 end-to-end 시나리오

use std::net::IpAddr;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::time::timeout;

use netflume_core::flow::{
    Flow, FlowEndReason, FlowKey, TCP_CONTROL_ACK, TCP_CONTROL_FIN, TCP_CONTROL_SYN,
};
use netflume_core::pipeline::Pipeline;
use netflume_flow_cache::{FlowCache, FlowCacheConfig};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn config(max_flows: u32, idle_secs: u64) -> FlowCacheConfig {
    FlowCacheConfig {
        max_flows,
        idle_timeout_secs: idle_secs,
        active_timeout_secs: 1800,
        sweep_interval_secs: idle_secs * 2,
    }
}

fn tcp_key(src_port: u16) -> FlowKey {
    FlowKey {
        source_ip: "192.168.1.10".parse::<IpAddr>().unwrap(),
        destination_ip: "192.168.1.20".parse::<IpAddr>().unwrap(),
        source_port: src_port,
        destination_port: 80,
        protocol: 6,
        ip_version: 4,
        ..FlowKey::default()
    }
}

fn packet_at(key: FlowKey, timestamp: SystemTime, flags: u16) -> Flow {
    let mut flow = Flow::from_packet(key, 60, timestamp, 1);
    flow.tcp_control_bits = flags;
    flow
}

fn packet(key: FlowKey, flags: u16) -> Flow {
    packet_at(key, SystemTime::now(), flags)
}

async fn build_and_start(
    config: FlowCacheConfig,
) -> (FlowCache, mpsc::Sender<Flow>, mpsc::Receiver<Flow>) {
    let capacity = config.max_flows as usize;
    let (input_tx, input_rx) = mpsc::channel(capacity);
    let (export_tx, export_rx) = mpsc::channel(capacity);
    let mut cache = FlowCache::builder()
        .config(config)
        .input_receiver(input_rx)
        .export_sender(export_tx)
        .build()
        .unwrap();
    cache.start().await.unwrap();
    (cache, input_tx, export_rx)
}

#[tokio::test]
async fn three_packet_tcp_conversation_ends_with_fin() {
    let (mut cache, input_tx, mut export_rx) = build_and_start(config(16, 15)).await;

    let t0 = SystemTime::now();
    input_tx
        .send(packet_at(tcp_key(50000), t0, TCP_CONTROL_SYN))
        .await
        .unwrap();
    input_tx
        .send(packet_at(
            tcp_key(50000),
            t0 + Duration::from_millis(10),
            TCP_CONTROL_ACK,
        ))
        .await
        .unwrap();
    input_tx
        .send(packet_at(
            tcp_key(50000),
            t0 + Duration::from_millis(20),
            TCP_CONTROL_FIN | TCP_CONTROL_ACK,
        ))
        .await
        .unwrap();

    let exported = timeout(RECV_TIMEOUT, export_rx.recv())
        .await
        .expect("flow should be exported before timeout")
        .expect("export channel should stay open");

    assert_eq!(exported.end_reason, Some(FlowEndReason::EndOfFlow));
    assert_eq!(exported.packet_delta_count, 3);
    assert_eq!(exported.octet_delta_count, 180);
    assert_eq!(
        exported.tcp_control_bits,
        TCP_CONTROL_SYN | TCP_CONTROL_ACK | TCP_CONTROL_FIN
    );

    cache.stop().await.unwrap();
}

#[tokio::test]
async fn bidirectional_udp_aggregates_into_one_flow() {
    let (mut cache, input_tx, mut export_rx) = build_and_start(config(16, 15)).await;

    let forward = FlowKey {
        source_ip: "10.0.0.1".parse::<IpAddr>().unwrap(),
        destination_ip: "10.0.0.2".parse::<IpAddr>().unwrap(),
        source_port: 53,
        destination_port: 40000,
        protocol: 17,
        ip_version: 4,
        ..FlowKey::default()
    };
    let backward = FlowKey {
        source_ip: "10.0.0.2".parse::<IpAddr>().unwrap(),
        destination_ip: "10.0.0.1".parse::<IpAddr>().unwrap(),
        source_port: 40000,
        destination_port: 53,
        ..forward.clone()
    };

    input_tx.send(packet(forward, 0)).await.unwrap();
    input_tx.send(packet(backward, 0)).await.unwrap();

    // 두 방향이 하나의 엔트리로 병합될 때까지 대기
    timeout(RECV_TIMEOUT, async {
        while cache.merged_count() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("cache should process both packets");
    assert_eq!(cache.len().await, 1);

    // 종료 시 purge로 내보내진다 (종료 사유 없음)
    cache.stop().await.unwrap();
    let purged = timeout(RECV_TIMEOUT, export_rx.recv())
        .await
        .expect("purged flow should arrive")
        .expect("export channel should stay open");
    assert_eq!(purged.packet_delta_count, 2);
    assert_eq!(purged.end_reason, None);
}

#[tokio::test]
async fn lru_displacement_exports_least_recent_flow() {
    let (mut cache, input_tx, mut export_rx) = build_and_start(config(2, 15)).await;

    input_tx.send(packet(tcp_key(50001), 0)).await.unwrap();
    input_tx.send(packet(tcp_key(50002), 0)).await.unwrap();
    input_tx.send(packet(tcp_key(50003), 0)).await.unwrap();

    let displaced = timeout(RECV_TIMEOUT, export_rx.recv())
        .await
        .expect("displaced flow should be exported")
        .expect("export channel should stay open");

    assert_eq!(displaced.key.source_port, 50001);
    assert_eq!(displaced.end_reason, None);
    assert_eq!(cache.len().await, 2);

    cache.stop().await.unwrap();
}

#[tokio::test]
async fn sweeper_evicts_idle_flow() {
    // 유휴 1초 → 스위퍼 주기 2초
    let (mut cache, input_tx, mut export_rx) = build_and_start(config(16, 1)).await;

    // 마지막 패킷이 이미 오래 전인 플로우 하나
    let stale = packet_at(
        tcp_key(50010),
        SystemTime::now() - Duration::from_secs(10),
        0,
    );
    input_tx.send(stale).await.unwrap();

    let swept = timeout(Duration::from_secs(10), export_rx.recv())
        .await
        .expect("sweeper should evict the idle flow")
        .expect("export channel should stay open");

    assert_eq!(swept.key.source_port, 50010);
    assert_eq!(swept.end_reason, Some(FlowEndReason::IdleTimeout));
    assert!(cache.is_empty().await);

    cache.stop().await.unwrap();
}

#[tokio::test]
async fn stop_purges_all_entries_through_exporter() {
    let (mut cache, input_tx, mut export_rx) = build_and_start(config(16, 15)).await;

    for port in 0..5u16 {
        input_tx.send(packet(tcp_key(51000 + port), 0)).await.unwrap();
    }
    timeout(RECV_TIMEOUT, async {
        while cache.merged_count() < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("cache should process all packets");

    cache.stop().await.unwrap();

    let mut purged = Vec::new();
    while let Ok(Some(flow)) = timeout(Duration::from_millis(200), export_rx.recv()).await {
        purged.push(flow);
    }
    assert_eq!(purged.len(), 5);
    assert!(purged.iter().all(|f| f.end_reason.is_none()));
}
