//! NetFlow v5 익스포터 — 데이터그램 패킹과 UDP 송신
//!
//! [`DatagramPacker`]는 플로우를 1400바이트 버퍼에 순차 직렬화하고,
//! 다음 레코드가 들어갈 수 없을 때 헤더를 완성하여 데이터그램을
//! 내어놓는 순수 패킹 상태 기계입니다.
//!
//! [`Netflow5Exporter`]는 core의 [`Pipeline`] trait을 구현하며,
//! cache→exporter 채널에서 플로우를 수신해 패킹하고, 연결된 UDP
//! 소켓으로 송신합니다. 소켓 쓰기는 익스포터 태스크에서만 일어납니다.
//!
//! 송신 실패는 로그만 남기고 버퍼를 버립니다 (재시도 없음).
//! IPv6 플로우는 에러로 거절되지만 익스포터는 계속 동작합니다.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use netflume_core::error::{NetflumeError, PipelineError};
use netflume_core::flow::Flow;
use netflume_core::pipeline::{HealthStatus, Pipeline};

use crate::config::ExportConfig;
use crate::error::ExportError;
use crate::record::{
    HEADER_SIZE, MAX_DATAGRAM_SIZE, RECORD_SIZE, patch_header, serialize_record,
    write_header_preamble,
};

/// NetFlow v5 데이터그램 패킹 상태 기계
///
/// `base_time`은 sysUptime의 기준 시각으로, 데몬 기동 시각을 넣어
/// 32비트 밀리초 필드가 약 49일까지 유효하도록 합니다.
pub struct DatagramPacker {
    buffer: [u8; MAX_DATAGRAM_SIZE],
    used: usize,
    last_flow_end: Option<SystemTime>,
    base_time: SystemTime,
    flow_sequence: u32,
}

impl DatagramPacker {
    /// 새 패커를 생성합니다.
    pub fn new(base_time: SystemTime) -> Self {
        Self {
            buffer: [0u8; MAX_DATAGRAM_SIZE],
            used: 0,
            last_flow_end: None,
            base_time,
            flow_sequence: 0,
        }
    }

    /// 현재 버퍼에 담긴 레코드 수를 반환합니다.
    pub fn pending_records(&self) -> usize {
        self.used.saturating_sub(HEADER_SIZE) / RECORD_SIZE
    }

    /// 누적 플로우 시퀀스 카운터를 반환합니다.
    pub fn flow_sequence(&self) -> u32 {
        self.flow_sequence
    }

    /// 플로우 하나를 버퍼에 담습니다.
    ///
    /// 버퍼가 차서 다음 레코드가 들어갈 수 없으면 완성된 데이터그램을
    /// 반환합니다. IPv4가 아닌 플로우는 [`ExportError::UnsupportedIpVersion`]으로
    /// 거절되며 버퍼 상태는 변하지 않습니다.
    pub fn push(&mut self, flow: &Flow) -> Result<Option<Vec<u8>>, ExportError> {
        if flow.key.ip_version != 4 {
            return Err(ExportError::UnsupportedIpVersion(flow.key.ip_version));
        }

        if self.used == 0 {
            write_header_preamble(&mut self.buffer[..HEADER_SIZE]);
            self.used = HEADER_SIZE;
        }

        if self.used + RECORD_SIZE <= MAX_DATAGRAM_SIZE {
            serialize_record(
                flow,
                self.base_time,
                &mut self.buffer[self.used..self.used + RECORD_SIZE],
            )?;
            self.used += RECORD_SIZE;
            self.last_flow_end = Some(flow.end);
        }

        if self.used + RECORD_SIZE > MAX_DATAGRAM_SIZE {
            return Ok(self.flush());
        }
        Ok(None)
    }

    /// 현재 버퍼를 완성된 데이터그램으로 내어놓습니다.
    ///
    /// 레코드 수는 실제로 담긴 수 `(used − 24) / 48`로 기록되고,
    /// 시퀀스 카운터도 같은 수만큼 전진합니다. 담긴 레코드가 없으면
    /// `None`을 반환합니다.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        let last_flow_end = self.last_flow_end?;
        if self.used <= HEADER_SIZE {
            return None;
        }

        let record_count = ((self.used - HEADER_SIZE) / RECORD_SIZE) as u16;
        self.flow_sequence = self.flow_sequence.wrapping_add(u32::from(record_count));
        patch_header(
            &mut self.buffer[..HEADER_SIZE],
            record_count,
            last_flow_end,
            self.base_time,
            self.flow_sequence,
        );

        let datagram = self.buffer[..self.used].to_vec();
        self.used = HEADER_SIZE;
        Some(datagram)
    }
}

/// 익스포터 실행 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExporterState {
    /// 초기화됨, 아직 시작하지 않음
    Initialized,
    /// 실행 중
    Running,
    /// 정지됨
    Stopped,
}

/// NetFlow v5 UDP 익스포터
///
/// # 사용 예시
/// ```ignore
/// let mut exporter = Netflow5Exporter::builder()
///     .config(ExportConfig::from_core(&config.exporter))
///     .input_receiver(export_rx)
///     .build()?;
///
/// exporter.start().await?; // 소켓 연결 + 수신 루프 스폰
/// ```
pub struct Netflow5Exporter {
    config: ExportConfig,
    state: ExporterState,
    input_rx: Option<mpsc::Receiver<Flow>>,
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
    base_time: SystemTime,
    flows_exported: Arc<AtomicU64>,
    datagrams_sent: Arc<AtomicU64>,
    export_errors: Arc<AtomicU64>,
}

/// 익스포터 빌더
pub struct Netflow5ExporterBuilder {
    config: Option<ExportConfig>,
    input_rx: Option<mpsc::Receiver<Flow>>,
}

impl Netflow5ExporterBuilder {
    fn new() -> Self {
        Self {
            config: None,
            input_rx: None,
        }
    }

    /// 익스포터 설정을 지정합니다.
    pub fn config(mut self, config: ExportConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// cache→exporter 채널의 수신자를 지정합니다.
    pub fn input_receiver(mut self, rx: mpsc::Receiver<Flow>) -> Self {
        self.input_rx = Some(rx);
        self
    }

    /// 익스포터를 빌드합니다.
    ///
    /// `base_time`(sysUptime 기준)은 이 시점의 현재 시각으로 고정됩니다.
    pub fn build(self) -> Result<Netflow5Exporter, ExportError> {
        let config = self.config.ok_or_else(|| ExportError::Config {
            field: "config".to_owned(),
            reason: "config is required".to_owned(),
        })?;
        config.validate()?;
        let input_rx = self.input_rx.ok_or_else(|| ExportError::Config {
            field: "input_receiver".to_owned(),
            reason: "input channel receiver is required".to_owned(),
        })?;

        Ok(Netflow5Exporter {
            config,
            state: ExporterState::Initialized,
            input_rx: Some(input_rx),
            cancel: CancellationToken::new(),
            task: None,
            base_time: SystemTime::now(),
            flows_exported: Arc::new(AtomicU64::new(0)),
            datagrams_sent: Arc::new(AtomicU64::new(0)),
            export_errors: Arc::new(AtomicU64::new(0)),
        })
    }
}

impl Netflow5Exporter {
    /// 빌더를 반환합니다.
    pub fn builder() -> Netflow5ExporterBuilder {
        Netflow5ExporterBuilder::new()
    }

    /// 지금까지 레코드로 실린 플로우 수를 반환합니다.
    pub fn flows_exported(&self) -> u64 {
        self.flows_exported.load(Ordering::Relaxed)
    }

    /// 지금까지 송신한 데이터그램 수를 반환합니다.
    pub fn datagrams_sent(&self) -> u64 {
        self.datagrams_sent.load(Ordering::Relaxed)
    }

    /// 거절되거나 송신에 실패한 플로우/데이터그램 수를 반환합니다.
    pub fn export_errors(&self) -> u64 {
        self.export_errors.load(Ordering::Relaxed)
    }

    /// sysUptime의 기준 시각을 반환합니다.
    pub fn base_time(&self) -> SystemTime {
        self.base_time
    }
}

/// 데이터그램 하나를 송신합니다. 실패는 로그만 남깁니다 (재시도 없음).
async fn send_datagram(
    socket: &UdpSocket,
    datagram: &[u8],
    datagrams_sent: &AtomicU64,
    export_errors: &AtomicU64,
) {
    match socket.send(datagram).await {
        Ok(_) => {
            datagrams_sent.fetch_add(1, Ordering::Relaxed);
            debug!(bytes = datagram.len(), "sent NetFlow v5 datagram");
        }
        Err(e) => {
            export_errors.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "cannot send NetFlow v5 datagram, discarding");
        }
    }
}

/// 플로우 하나를 패커에 담고, 데이터그램이 완성되면 송신합니다.
async fn pack_and_send(
    packer: &mut DatagramPacker,
    flow: &Flow,
    socket: &UdpSocket,
    flows_exported: &AtomicU64,
    datagrams_sent: &AtomicU64,
    export_errors: &AtomicU64,
) {
    match packer.push(flow) {
        Ok(Some(datagram)) => {
            flows_exported.fetch_add(1, Ordering::Relaxed);
            send_datagram(socket, &datagram, datagrams_sent, export_errors).await;
        }
        Ok(None) => {
            flows_exported.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            export_errors.fetch_add(1, Ordering::Relaxed);
            debug!(error = %e, flow = %flow, "cannot export flow");
        }
    }
}

impl Pipeline for Netflow5Exporter {
    /// UDP 소켓을 연결하고 수신 루프를 스폰합니다.
    async fn start(&mut self) -> Result<(), NetflumeError> {
        if self.state == ExporterState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }

        let mut input_rx = self
            .input_rx
            .take()
            .ok_or(NetflumeError::Pipeline(PipelineError::InitFailed(
                "input channel already consumed (exporter cannot restart)".to_owned(),
            )))?;

        let target = self.config.collector_address();
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| ExportError::Socket {
                target: target.clone(),
                reason: e.to_string(),
            })?;
        socket
            .connect(&target)
            .await
            .map_err(|e| ExportError::Socket {
                target: target.clone(),
                reason: e.to_string(),
            })?;

        info!(collector = %target, "starting NetFlow v5 exporter");

        let cancel = self.cancel.clone();
        let base_time = self.base_time;
        let flows_exported = Arc::clone(&self.flows_exported);
        let datagrams_sent = Arc::clone(&self.datagrams_sent);
        let export_errors = Arc::clone(&self.export_errors);

        let task = tokio::spawn(async move {
            let mut packer = DatagramPacker::new(base_time);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("exporter received shutdown signal");
                        break;
                    }
                    received = input_rx.recv() => {
                        let Some(flow) = received else {
                            debug!("export channel closed, exiting exporter loop");
                            break;
                        };
                        pack_and_send(
                            &mut packer,
                            &flow,
                            &socket,
                            &flows_exported,
                            &datagrams_sent,
                            &export_errors,
                        )
                        .await;
                    }
                }
            }

            // 종료 경로: 캐시 purge가 이미 채널에 밀어넣은 플로우를 비운 뒤
            // 부분 데이터그램을 플러시한다.
            while let Ok(flow) = input_rx.try_recv() {
                pack_and_send(
                    &mut packer,
                    &flow,
                    &socket,
                    &flows_exported,
                    &datagrams_sent,
                    &export_errors,
                )
                .await;
            }
            if let Some(datagram) = packer.flush() {
                send_datagram(&socket, &datagram, &datagrams_sent, &export_errors).await;
            }
            // 소켓은 태스크 종료와 함께 닫힌다.
        });

        self.task = Some(task);
        self.state = ExporterState::Running;
        Ok(())
    }

    /// 수신 루프를 정지하고 부분 데이터그램을 플러시합니다.
    async fn stop(&mut self) -> Result<(), NetflumeError> {
        if self.state != ExporterState::Running {
            return Err(PipelineError::NotRunning.into());
        }

        info!("stopping NetFlow v5 exporter");
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }

        self.state = ExporterState::Stopped;
        info!(
            flows = self.flows_exported(),
            datagrams = self.datagrams_sent(),
            "NetFlow v5 exporter stopped"
        );
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            ExporterState::Running => match &self.task {
                Some(task) if !task.is_finished() => HealthStatus::Healthy,
                _ => HealthStatus::Unhealthy("exporter loop exited".to_owned()),
            },
            ExporterState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            ExporterState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}
