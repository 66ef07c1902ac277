//! 캡처 엔진 설정
//!
//! [`CaptureConfig`]는 core의
//! [`CaptureInterfaceConfig`](netflume_core::config::CaptureInterfaceConfig)를
//! 기반으로 인터페이스 하나에 대한 캡처 전용 설정을 제공합니다.

use serde::{Deserialize, Serialize};

use crate::error::CaptureError;

/// 캡처 스냅 길이 기본값 (바이트)
pub const DEFAULT_SNAPLEN: i32 = 65_536;

/// 캡처 읽기 폴링 타임아웃 기본값 (밀리초)
///
/// 원본은 무기한 블로킹 읽기였으나, 읽기 루프가 취소 신호를
/// 관측할 수 있도록 짧은 폴링 타임아웃을 둡니다.
pub const DEFAULT_POLL_TIMEOUT_MS: i32 = 1_000;

/// 단일 인터페이스 캡처 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// 캡처할 네트워크 인터페이스명
    pub interface: String,
    /// 선택적 BPF 필터 표현식
    pub filter: Option<String>,
    /// 스냅 길이 (바이트)
    pub snaplen: i32,
    /// 무차별(promiscuous) 모드 여부
    pub promiscuous: bool,
    /// 읽기 폴링 타임아웃 (밀리초)
    pub poll_timeout_ms: i32,
}

impl CaptureConfig {
    /// core의 인터페이스 설정에서 캡처 설정을 생성합니다.
    ///
    /// core 설정에 없는 확장 필드는 기본값이 적용됩니다.
    pub fn from_core(
        name: impl Into<String>,
        core: &netflume_core::config::CaptureInterfaceConfig,
    ) -> Self {
        Self {
            interface: name.into(),
            filter: core.filter.clone(),
            snaplen: DEFAULT_SNAPLEN,
            promiscuous: true,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
        }
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.interface.trim().is_empty() {
            return Err(CaptureError::Config {
                field: "interface".to_owned(),
                reason: "interface name must not be empty".to_owned(),
            });
        }
        if self.snaplen <= 0 {
            return Err(CaptureError::Config {
                field: "snaplen".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        if self.poll_timeout_ms <= 0 {
            return Err(CaptureError::Config {
                field: "poll_timeout_ms".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        if let Some(filter) = &self.filter {
            if filter.trim().is_empty() {
                return Err(CaptureError::Config {
                    field: "filter".to_owned(),
                    reason: "filter must not be an empty string (omit it instead)".to_owned(),
                });
            }
        }
        Ok(())
    }
}
