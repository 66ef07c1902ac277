//! 캡처 엔진 — 인터페이스별 라이브 캡처 루프
//!
//! [`CaptureEngine`]은 NIC 하나의 라이브 캡처 핸들을 소유하고,
//! 수신한 프레임을 디코딩하여 패킷 1개짜리 [`Flow`]를
//! capture→cache 채널로 전송합니다. 채널이 가득 차면 전송이 블로킹되어
//! 캐시 → 캡처 순의 배압이 형성되고, 넘치는 패킷은 OS 캡처 링에서
//! 드롭됩니다 (허용되는 동작).
//!
//! # 아키텍처
//! ```text
//! NIC ──pcap──▶ blocking read loop ──decode──▶ mpsc::Sender<Flow> (→ cache)
//! ```
//!
//! # 사용 예시
//! ```ignore
//! let (engine, _) = CaptureEngine::builder()
//!     .config(CaptureConfig::from_core("eth0", &iface_config))
//!     .flow_sender(flow_tx.clone())
//!     .build()?;
//!
//! engine.start().await?; // 캡처 핸들 오픈 + 읽기 루프 스폰
//! ```

use std::ffi::CString;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use netflume_core::error::{NetflumeError, PipelineError};
use netflume_core::flow::Flow;
use netflume_core::pipeline::{HealthStatus, Pipeline};

use crate::config::CaptureConfig;
use crate::decoder;
use crate::error::CaptureError;

/// 인터페이스명을 OS 인터페이스 인덱스로 변환합니다.
fn interface_index(name: &str) -> Result<u16, CaptureError> {
    let c_name = CString::new(name).map_err(|_| CaptureError::InterfaceIndex {
        interface: name.to_owned(),
        reason: "interface name contains NUL".to_owned(),
    })?;
    // SAFETY: c_name은 유효한 NUL 종료 문자열이며 호출 동안 살아있다.
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(CaptureError::InterfaceIndex {
            interface: name.to_owned(),
            reason: std::io::Error::last_os_error().to_string(),
        });
    }
    Ok(index as u16)
}

/// pcap 패킷 헤더의 timeval을 SystemTime으로 변환합니다.
fn packet_timestamp(header: &pcap::PacketHeader) -> SystemTime {
    let secs = header.ts.tv_sec.max(0) as u64;
    let micros = header.ts.tv_usec.max(0) as u32;
    UNIX_EPOCH + Duration::new(secs, micros.saturating_mul(1_000))
}

/// 인터페이스 하나의 라이브 캡처를 담당하는 엔진
///
/// # 필드
/// - `config`: 인터페이스명, BPF 필터, 스냅 길이 등
/// - `flow_tx`: 발행된 플로우를 캐시로 보내는 채널
/// - `if_index`: NetFlow 레코드에 실리는 입력 인터페이스 인덱스
///
/// 캡처 핸들 오픈은 `start()`에서 수행되며, 오픈 실패는 데몬 기동
/// 실패로 이어집니다. BPF 필터 적용 실패는 로그만 남기고
/// 필터 없이 계속합니다.
#[derive(Debug)]
pub struct CaptureEngine {
    config: CaptureConfig,
    flow_tx: mpsc::Sender<Flow>,
    if_index: u16,
    running: bool,
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
    packets_captured: Arc<AtomicU64>,
    packets_dropped: Arc<AtomicU64>,
}

/// 캡처 엔진 빌더
///
/// `build()`에서 인터페이스 인덱스를 해석하고 설정을 검증합니다.
pub struct CaptureEngineBuilder {
    config: Option<CaptureConfig>,
    flow_tx: Option<mpsc::Sender<Flow>>,
}

impl CaptureEngineBuilder {
    fn new() -> Self {
        Self {
            config: None,
            flow_tx: None,
        }
    }

    /// 캡처 설정을 지정합니다.
    pub fn config(mut self, config: CaptureConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// 플로우 전송 채널의 송신자를 지정합니다.
    pub fn flow_sender(mut self, tx: mpsc::Sender<Flow>) -> Self {
        self.flow_tx = Some(tx);
        self
    }

    /// 엔진을 생성합니다.
    ///
    /// # 에러
    /// - `CaptureError::Config`: 필수 설정 누락 또는 유효하지 않은 값
    /// - `CaptureError::InterfaceIndex`: 인터페이스 인덱스 해석 실패
    pub fn build(self) -> Result<CaptureEngine, CaptureError> {
        let config = self.config.ok_or_else(|| CaptureError::Config {
            field: "config".to_owned(),
            reason: "config is required".to_owned(),
        })?;
        config.validate()?;
        let flow_tx = self.flow_tx.ok_or_else(|| CaptureError::Config {
            field: "flow_sender".to_owned(),
            reason: "flow sender channel is required".to_owned(),
        })?;
        let if_index = interface_index(&config.interface)?;

        Ok(CaptureEngine {
            config,
            flow_tx,
            if_index,
            running: false,
            cancel: CancellationToken::new(),
            task: None,
            packets_captured: Arc::new(AtomicU64::new(0)),
            packets_dropped: Arc::new(AtomicU64::new(0)),
        })
    }
}

impl CaptureEngine {
    /// 빌더를 반환합니다.
    pub fn builder() -> CaptureEngineBuilder {
        CaptureEngineBuilder::new()
    }

    /// 캡처 대상 인터페이스명을 반환합니다.
    pub fn interface(&self) -> &str {
        &self.config.interface
    }

    /// 입력 인터페이스 인덱스를 반환합니다.
    pub fn if_index(&self) -> u16 {
        self.if_index
    }

    /// 지금까지 캡처한 패킷 수를 반환합니다.
    pub fn packets_captured(&self) -> u64 {
        self.packets_captured.load(Ordering::Relaxed)
    }

    /// 디코딩되지 않아 드롭된 패킷 수를 반환합니다 (비-IP 포함).
    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped.load(Ordering::Relaxed)
    }

    /// 라이브 캡처 핸들을 엽니다 (스냅 길이 65536, promiscuous).
    fn open_capture(&self) -> Result<pcap::Capture<pcap::Active>, CaptureError> {
        let capture = pcap::Capture::from_device(self.config.interface.as_str())
            .map_err(|e| CaptureError::Open {
                interface: self.config.interface.clone(),
                reason: e.to_string(),
            })?
            .promisc(self.config.promiscuous)
            .snaplen(self.config.snaplen)
            .timeout(self.config.poll_timeout_ms)
            .open()
            .map_err(|e| CaptureError::Open {
                interface: self.config.interface.clone(),
                reason: e.to_string(),
            })?;
        Ok(capture)
    }
}

impl Pipeline for CaptureEngine {
    /// 캡처 핸들을 열고 읽기 루프를 스폰합니다.
    ///
    /// 1. 라이브 캡처 오픈 (실패 시 데몬 기동 실패)
    /// 2. BPF 필터 적용 (실패 시 로그 후 무필터로 계속)
    /// 3. blocking 읽기 루프 스폰
    async fn start(&mut self) -> Result<(), NetflumeError> {
        if self.running {
            return Err(PipelineError::AlreadyRunning.into());
        }

        let mut capture = self.open_capture()?;

        if let Some(filter) = &self.config.filter {
            if let Err(e) = capture.filter(filter, true) {
                error!(
                    interface = %self.config.interface,
                    filter = %filter,
                    error = %e,
                    "cannot set BPF filter, capturing unfiltered"
                );
            }
        }

        info!(
            interface = %self.config.interface,
            if_index = self.if_index,
            snaplen = self.config.snaplen,
            "starting capture engine"
        );

        self.cancel = CancellationToken::new();
        let cancel = self.cancel.clone();
        let flow_tx = self.flow_tx.clone();
        let if_index = self.if_index;
        let interface = self.config.interface.clone();
        let captured = Arc::clone(&self.packets_captured);
        let dropped = Arc::clone(&self.packets_dropped);

        let task = tokio::task::spawn_blocking(move || {
            run_capture_loop(
                &mut capture,
                &cancel,
                &flow_tx,
                if_index,
                &interface,
                &captured,
                &dropped,
            );
        });

        self.task = Some(task);
        self.running = true;
        Ok(())
    }

    /// 읽기 루프를 취소하고 캡처 핸들을 닫습니다.
    async fn stop(&mut self) -> Result<(), NetflumeError> {
        if !self.running {
            return Err(PipelineError::NotRunning.into());
        }

        info!(interface = %self.config.interface, "stopping capture engine");
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }

        self.running = false;
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        if !self.running {
            return HealthStatus::Unhealthy("not running".to_owned());
        }
        match &self.task {
            Some(task) if !task.is_finished() => HealthStatus::Healthy,
            _ => HealthStatus::Unhealthy("capture loop exited".to_owned()),
        }
    }
}

/// blocking 캡처 읽기 루프
///
/// 읽기 타임아웃마다 취소 토큰을 확인합니다. 디코딩 실패는 trace
/// 로그 후 계속하고, 채널이 닫히면 루프를 종료합니다.
fn run_capture_loop(
    capture: &mut pcap::Capture<pcap::Active>,
    cancel: &CancellationToken,
    flow_tx: &mpsc::Sender<Flow>,
    if_index: u16,
    interface: &str,
    captured: &AtomicU64,
    dropped: &AtomicU64,
) {
    loop {
        if cancel.is_cancelled() {
            info!(interface = %interface, "capture loop received shutdown signal");
            return;
        }

        let packet = match capture.next_packet() {
            Ok(packet) => packet,
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => {
                warn!(interface = %interface, error = %e, "capture handle closed, exiting loop");
                return;
            }
        };

        captured.fetch_add(1, Ordering::Relaxed);
        let timestamp = packet_timestamp(packet.header);
        let wire_length = packet.header.len;

        match decoder::decode_frame(packet.data, wire_length, timestamp, if_index) {
            Some(flow) => {
                // 채널이 가득 차면 여기서 블로킹된다 (의도된 배압).
                if flow_tx.blocking_send(flow).is_err() {
                    warn!(interface = %interface, "flow channel closed, exiting capture loop");
                    return;
                }
            }
            None => {
                trace!(interface = %interface, "dropped undecodable or non-IP packet");
                dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
