//! 플로우 캐시 설정
//!
//! [`FlowCacheConfig`]는 core의
//! [`CacheConfig`](netflume_core::config::CacheConfig)를 기반으로
//! 캐시 전용 설정을 제공합니다.

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// 플로우 캐시 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowCacheConfig {
    /// LRU 최대 플로우 수
    pub max_flows: u32,
    /// 유휴 타임아웃 (초)
    pub idle_timeout_secs: u64,
    /// 활성 타임아웃 (초)
    pub active_timeout_secs: u64,

    // --- 확장 설정 (core에 없는 추가 필드) ---
    /// 스위퍼 주기 (초). 기본값은 유휴 타임아웃의 2배이며,
    /// 최악의 유휴 수거 지연은 유휴 타임아웃의 약 3배가 됩니다.
    pub sweep_interval_secs: u64,
}

impl FlowCacheConfig {
    /// core의 캐시 설정에서 생성합니다.
    pub fn from_core(core: &netflume_core::config::CacheConfig) -> Self {
        Self {
            max_flows: core.max_flows,
            idle_timeout_secs: u64::from(core.idle_timeout_secs),
            active_timeout_secs: u64::from(core.active_timeout_secs),
            sweep_interval_secs: u64::from(core.idle_timeout_secs) * 2,
        }
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.max_flows == 0 {
            return Err(CacheError::Config {
                field: "max_flows".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        if self.idle_timeout_secs == 0 {
            return Err(CacheError::Config {
                field: "idle_timeout_secs".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        if self.active_timeout_secs == 0 {
            return Err(CacheError::Config {
                field: "active_timeout_secs".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        if self.sweep_interval_secs == 0 {
            return Err(CacheError::Config {
                field: "sweep_interval_secs".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        Ok(())
    }
}

impl Default for FlowCacheConfig {
    fn default() -> Self {
        Self::from_core(&netflume_core::config::CacheConfig::default())
    }
}
