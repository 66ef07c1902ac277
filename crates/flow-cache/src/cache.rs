//! 캐시 모듈 — 수신 루프와 스위퍼의 생명주기 관리
//!
//! [`FlowCache`]는 core의 [`Pipeline`] trait을 구현하여
//! `netflume-daemon`에서 다른 모듈과 동일한 생명주기로 관리됩니다.
//!
//! # 내부 아키텍처
//! ```text
//! captures -> mpsc -> listener ─┐
//!                               ├─ Mutex<FlowTable> ─ 퇴출 플로우 -> mpsc -> exporter
//!              interval -> sweeper ┘
//! ```
//!
//! 퇴출 플로우의 채널 전송은 테이블 락을 놓은 뒤에 수행됩니다.
//! 익스포터 채널이 가득 차면 전송이 블로킹되어 캐시 → 캡처 순의
//! 배압이 형성됩니다.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use tokio::sync::{Mutex, mpsc};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use netflume_core::error::{NetflumeError, PipelineError};
use netflume_core::flow::Flow;
use netflume_core::pipeline::{HealthStatus, Pipeline};

use crate::config::FlowCacheConfig;
use crate::error::CacheError;
use crate::table::FlowTable;

/// 캐시 실행 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheState {
    /// 초기화됨, 아직 시작하지 않음
    Initialized,
    /// 실행 중
    Running,
    /// 정지됨
    Stopped,
}

/// 플로우 캐시 — 수신 병합 루프와 유휴 스위퍼를 관리합니다.
///
/// # 사용 예시
/// ```ignore
/// let (input_tx, input_rx) = mpsc::channel(max_flows);
/// let (export_tx, export_rx) = mpsc::channel(max_flows);
///
/// let mut cache = FlowCache::builder()
///     .config(FlowCacheConfig::from_core(&config.cache))
///     .input_receiver(input_rx)
///     .export_sender(export_tx)
///     .build()?;
///
/// cache.start().await?;
/// ```
pub struct FlowCache {
    config: FlowCacheConfig,
    state: CacheState,
    table: Arc<Mutex<FlowTable>>,
    input_rx: Option<mpsc::Receiver<Flow>>,
    export_tx: mpsc::Sender<Flow>,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    merged_count: Arc<AtomicU64>,
    evicted_count: Arc<AtomicU64>,
}

/// 플로우 캐시 빌더
pub struct FlowCacheBuilder {
    config: FlowCacheConfig,
    input_rx: Option<mpsc::Receiver<Flow>>,
    export_tx: Option<mpsc::Sender<Flow>>,
}

impl FlowCacheBuilder {
    fn new() -> Self {
        Self {
            config: FlowCacheConfig::default(),
            input_rx: None,
            export_tx: None,
        }
    }

    /// 캐시 설정을 지정합니다.
    pub fn config(mut self, config: FlowCacheConfig) -> Self {
        self.config = config;
        self
    }

    /// capture→cache 채널의 수신자를 지정합니다.
    pub fn input_receiver(mut self, rx: mpsc::Receiver<Flow>) -> Self {
        self.input_rx = Some(rx);
        self
    }

    /// cache→exporter 채널의 송신자를 지정합니다.
    ///
    /// 캐시가 락을 쥔 채 전송에 블로킹되지 않도록, 이 채널은
    /// `max_flows` 이상의 용량으로 만드는 것이 기준 구성입니다.
    pub fn export_sender(mut self, tx: mpsc::Sender<Flow>) -> Self {
        self.export_tx = Some(tx);
        self
    }

    /// 캐시를 빌드합니다.
    pub fn build(self) -> Result<FlowCache, CacheError> {
        self.config.validate()?;
        let input_rx = self.input_rx.ok_or_else(|| CacheError::Config {
            field: "input_receiver".to_owned(),
            reason: "input channel receiver is required".to_owned(),
        })?;
        let export_tx = self.export_tx.ok_or_else(|| CacheError::Config {
            field: "export_sender".to_owned(),
            reason: "export channel sender is required".to_owned(),
        })?;

        let capacity =
            NonZeroUsize::new(self.config.max_flows as usize).ok_or_else(|| CacheError::Config {
                field: "max_flows".to_owned(),
                reason: "must be greater than 0".to_owned(),
            })?;
        let table = FlowTable::new(
            capacity,
            self.config.idle_timeout_secs,
            self.config.active_timeout_secs,
        );

        Ok(FlowCache {
            config: self.config,
            state: CacheState::Initialized,
            table: Arc::new(Mutex::new(table)),
            input_rx: Some(input_rx),
            export_tx,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            merged_count: Arc::new(AtomicU64::new(0)),
            evicted_count: Arc::new(AtomicU64::new(0)),
        })
    }
}

impl FlowCache {
    /// 빌더를 반환합니다.
    pub fn builder() -> FlowCacheBuilder {
        FlowCacheBuilder::new()
    }

    /// 현재 상태명을 반환합니다.
    pub fn state_name(&self) -> &str {
        match self.state {
            CacheState::Initialized => "initialized",
            CacheState::Running => "running",
            CacheState::Stopped => "stopped",
        }
    }

    /// 처리(병합/생성)된 플로우 수를 반환합니다.
    pub fn merged_count(&self) -> u64 {
        self.merged_count.load(Ordering::Relaxed)
    }

    /// 익스포터로 내보낸 플로우 수를 반환합니다.
    pub fn evicted_count(&self) -> u64 {
        self.evicted_count.load(Ordering::Relaxed)
    }

    /// 현재 테이블 사용률을 반환합니다.
    pub async fn utilization(&self) -> f64 {
        self.table.lock().await.utilization()
    }

    /// 현재 테이블에 있는 플로우 수를 반환합니다.
    pub async fn len(&self) -> usize {
        self.table.lock().await.len()
    }

    /// 테이블이 비어있는지 확인합니다.
    pub async fn is_empty(&self) -> bool {
        self.table.lock().await.is_empty()
    }
}

/// 퇴출된 플로우들을 익스포터 채널로 전달합니다.
///
/// 테이블 락을 놓은 뒤에 호출해야 합니다. 수신측이 닫혔으면
/// 로그만 남깁니다 (종료 중에 발생할 수 있음).
async fn forward_evicted(
    export_tx: &mpsc::Sender<Flow>,
    evicted: Vec<Flow>,
    evicted_count: &AtomicU64,
) {
    for flow in evicted {
        debug!(
            reason = flow.end_reason_wire_value(),
            packets = flow.packet_delta_count,
            "forwarding evicted flow to exporter"
        );
        if export_tx.send(flow).await.is_err() {
            warn!("export channel closed, dropping evicted flow");
            return;
        }
        evicted_count.fetch_add(1, Ordering::Relaxed);
    }
}

impl Pipeline for FlowCache {
    /// 수신 루프와 스위퍼 태스크를 스폰합니다.
    async fn start(&mut self) -> Result<(), NetflumeError> {
        if self.state == CacheState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }

        let mut input_rx = self
            .input_rx
            .take()
            .ok_or(NetflumeError::Pipeline(PipelineError::InitFailed(
                "input channel already consumed (cache cannot restart)".to_owned(),
            )))?;

        info!(
            max_flows = self.config.max_flows,
            idle_timeout_secs = self.config.idle_timeout_secs,
            active_timeout_secs = self.config.active_timeout_secs,
            "starting flow cache"
        );

        self.cancel = CancellationToken::new();

        // 수신 병합 루프
        let cancel = self.cancel.clone();
        let table = Arc::clone(&self.table);
        let export_tx = self.export_tx.clone();
        let merged_count = Arc::clone(&self.merged_count);
        let evicted_count = Arc::clone(&self.evicted_count);
        let listener = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("cache listener received shutdown signal");
                        break;
                    }
                    received = input_rx.recv() => {
                        let Some(flow) = received else {
                            debug!("input channel closed, exiting cache listener");
                            break;
                        };
                        let evicted = {
                            let mut table = table.lock().await;
                            table.insert(flow)
                        };
                        merged_count.fetch_add(1, Ordering::Relaxed);
                        // 락 해제 후 전송 (채널 포화가 테이블을 막지 않도록)
                        forward_evicted(&export_tx, evicted, &evicted_count).await;
                    }
                }
            }
        });
        self.tasks.push(listener);

        // 유휴 스위퍼
        let cancel = self.cancel.clone();
        let table = Arc::clone(&self.table);
        let export_tx = self.export_tx.clone();
        let evicted_count = Arc::clone(&self.evicted_count);
        let sweep_interval = Duration::from_secs(self.config.sweep_interval_secs);
        let sweeper = tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // 첫 tick은 즉시 발화하므로 건너뛴다.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("cache sweeper received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let now = SystemTime::now();
                        let expired = {
                            let mut table = table.lock().await;
                            table.sweep(now)
                        };
                        if !expired.is_empty() {
                            debug!(count = expired.len(), "sweeper collected idle flows");
                            forward_evicted(&export_tx, expired, &evicted_count).await;
                        }
                    }
                }
            }
        });
        self.tasks.push(sweeper);

        self.state = CacheState::Running;
        info!("flow cache started");
        Ok(())
    }

    /// 태스크를 정지하고 남은 엔트리를 익스포터로 purge합니다.
    async fn stop(&mut self) -> Result<(), NetflumeError> {
        if self.state != CacheState::Running {
            return Err(PipelineError::NotRunning.into());
        }

        info!("stopping flow cache");
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        let remaining = {
            let mut table = self.table.lock().await;
            table.purge()
        };
        if !remaining.is_empty() {
            info!(count = remaining.len(), "flushing remaining cache entries");
            forward_evicted(&self.export_tx, remaining, &self.evicted_count).await;
        }

        self.state = CacheState::Stopped;
        info!("flow cache stopped");
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            CacheState::Running => {
                let utilization = self.table.lock().await.utilization();
                if utilization > 0.9 {
                    HealthStatus::Degraded(format!(
                        "cache utilization high: {:.1}%",
                        utilization * 100.0
                    ))
                } else {
                    HealthStatus::Healthy
                }
            }
            CacheState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            CacheState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}
