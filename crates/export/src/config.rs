//! 익스포터 설정
//!
//! [`ExportConfig`]는 core의
//! [`ExporterConfig`](netflume_core::config::ExporterConfig)를 기반으로
//! 익스포터 전용 설정을 제공합니다.

use serde::{Deserialize, Serialize};

use crate::error::ExportError;

/// NetFlow v5 익스포터 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// 수집기 호스트
    pub host: String,
    /// 수집기 UDP 포트
    pub port: u16,
}

impl ExportConfig {
    /// core의 익스포터 설정에서 생성합니다.
    pub fn from_core(core: &netflume_core::config::ExporterConfig) -> Self {
        Self {
            host: core.host.clone(),
            port: core.port,
        }
    }

    /// `host:port` 형태의 수집기 주소를 반환합니다.
    pub fn collector_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), ExportError> {
        if self.host.trim().is_empty() {
            return Err(ExportError::Config {
                field: "host".to_owned(),
                reason: "collector host must be set".to_owned(),
            });
        }
        if self.port == 0 {
            return Err(ExportError::Config {
                field: "port".to_owned(),
                reason: "must be 1-65535".to_owned(),
            });
        }
        Ok(())
    }
}
