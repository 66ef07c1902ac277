//! 플로우 테이블 — 키 해시로 색인되는 고정 용량 LRU 맵
//!
//! [`FlowTable`]은 `hash(u64) → Flow`의 타입이 지정된 LRU 맵과
//! 병합/만료 판정 로직을 담습니다. 퇴출된 플로우는 호출자에게 **반환**되며,
//! 익스포터 채널로의 전송은 락을 놓은 뒤 소유 태스크가 수행합니다.
//! 테이블 자체는 락과 채널을 모르는 순수 자료구조입니다.
//!
//! 만료 판정은 세 가지입니다:
//! 1. 병합 시점의 패킷 간 간격 > 유휴 타임아웃 → [`FlowEndReason::IdleTimeout`]
//! 2. 누적 TCP FIN 관측 → [`FlowEndReason::EndOfFlow`]
//! 3. `end − start` > 활성 타임아웃 → [`FlowEndReason::ActiveTimeout`]
//!
//! 유휴 만료의 주 경로는 주기적 [`FlowTable::sweep`]입니다 (1번 분기는
//! 스위퍼가 아직 수거하지 못한 간격 뒤에 패킷이 도착했을 때만 발동).

use std::num::NonZeroUsize;
use std::time::{Duration, SystemTime};

use lru::LruCache;

use netflume_core::flow::{Flow, FlowEndReason, TCP_CONTROL_FIN};

/// 두 시각 사이의 경과 초 (역전 시 0)
fn elapsed_secs(earlier: SystemTime, later: SystemTime) -> u64 {
    later
        .duration_since(earlier)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// 고정 용량 LRU 플로우 테이블
pub struct FlowTable {
    flows: LruCache<u64, Flow>,
    idle_timeout_secs: u64,
    active_timeout_secs: u64,
}

impl FlowTable {
    /// 새 플로우 테이블을 생성합니다.
    pub fn new(max_flows: NonZeroUsize, idle_timeout_secs: u64, active_timeout_secs: u64) -> Self {
        Self {
            flows: LruCache::new(max_flows),
            idle_timeout_secs,
            active_timeout_secs,
        }
    }

    /// 현재 저장된 플로우 수를 반환합니다.
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// 테이블이 비어있는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// 최대 용량을 반환합니다.
    pub fn capacity(&self) -> usize {
        self.flows.cap().get()
    }

    /// 테이블 사용률을 0.0~1.0 범위로 반환합니다.
    pub fn utilization(&self) -> f64 {
        self.flows.len() as f64 / self.flows.cap().get() as f64
    }

    /// 유입 플로우를 테이블에 병합합니다.
    ///
    /// 반환된 플로우들은 호출자가 익스포터로 전달해야 합니다:
    /// - 같은 키의 기존 엔트리가 있으면 병합 후 만료 판정. 종료 사유가
    ///   부여되면 엔트리를 제거하고 **병합된** 플로우를 반환합니다.
    ///   사유가 없으면 엔트리를 유지합니다 (접근으로 recency 갱신).
    /// - 새 키이고 용량이 가득 찼으면 가장 오래 건드리지 않은 엔트리가
    ///   밀려나 반환됩니다 (종료 사유 미부여 — 자원 부족에 해당).
    pub fn insert(&mut self, flow: Flow) -> Vec<Flow> {
        let key = flow.key.hash();
        let mut evicted = Vec::new();
        let idle = self.idle_timeout_secs;
        let active = self.active_timeout_secs;

        // 병합 직후의 만료 판정. `previous_end`는 병합 전의 `end`
        // (직전 패킷 시각)이고, 유휴 분기는 패킷 간 간격으로 평가한다.
        let end_reason = match self.flows.get_mut(&key) {
            Some(existing) => {
                let previous_end = existing.end;
                existing.absorb(&flow);
                let reason = if elapsed_secs(previous_end, flow.end) > idle {
                    Some(FlowEndReason::IdleTimeout)
                } else if existing.tcp_control_bits & TCP_CONTROL_FIN != 0 {
                    Some(FlowEndReason::EndOfFlow)
                } else if elapsed_secs(existing.start, existing.end) > active {
                    Some(FlowEndReason::ActiveTimeout)
                } else {
                    None
                };
                Some(reason)
            }
            None => None,
        };

        match end_reason {
            Some(Some(reason)) => {
                if let Some(mut finished) = self.flows.pop(&key) {
                    finished.end_reason = Some(reason);
                    evicted.push(finished);
                }
            }
            Some(None) => {
                // 병합 완료, get_mut 접근이 recency를 이미 갱신함
            }
            None => {
                if let Some((displaced_key, displaced)) = self.flows.push(key, flow) {
                    if displaced_key != key {
                        evicted.push(displaced);
                    }
                }
            }
        }

        evicted
    }

    /// `now` 기준으로 유휴 타임아웃을 초과한 엔트리를 모두 수거합니다.
    ///
    /// 수거된 플로우에는 [`FlowEndReason::IdleTimeout`]이 부여됩니다.
    pub fn sweep(&mut self, now: SystemTime) -> Vec<Flow> {
        let expired_keys: Vec<u64> = self
            .flows
            .iter()
            .filter(|(_, flow)| elapsed_secs(flow.end, now) > self.idle_timeout_secs)
            .map(|(key, _)| *key)
            .collect();

        let mut expired = Vec::with_capacity(expired_keys.len());
        for key in expired_keys {
            if let Some(mut flow) = self.flows.pop(&key) {
                flow.end_reason = Some(FlowEndReason::IdleTimeout);
                expired.push(flow);
            }
        }
        expired
    }

    /// 남은 모든 엔트리를 비웁니다 (종료 시 purge).
    ///
    /// 종료 사유는 부여하지 않습니다 (와이어 값 0).
    pub fn purge(&mut self) -> Vec<Flow> {
        let mut remaining = Vec::with_capacity(self.flows.len());
        while let Some((_, flow)) = self.flows.pop_lru() {
            remaining.push(flow);
        }
        remaining
    }
}
