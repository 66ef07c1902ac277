//! 캡처 엔진 에러 타입
//!
//! [`CaptureError`]는 캡처 크레이트 내부에서 발생하는 모든 에러를 표현합니다.
//! `From<CaptureError> for NetflumeError` 변환이 구현되어 있어
//! 상위 레이어에서 `?` 연산자로 자연스럽게 전파할 수 있습니다.

use netflume_core::error::{NetflumeError, PipelineError};

/// 캡처 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// 라이브 캡처 핸들 오픈 실패 — 해당 인터페이스에 치명적이며
    /// 데몬 기동 실패로 이어집니다.
    #[error("cannot open capture on '{interface}': {reason}")]
    Open {
        /// 인터페이스명
        interface: String,
        /// 실패 사유
        reason: String,
    },

    /// 인터페이스 인덱스 조회 실패
    #[error("cannot resolve interface index for '{interface}': {reason}")]
    InterfaceIndex {
        /// 인터페이스명
        interface: String,
        /// 실패 사유
        reason: String,
    },

    /// BPF 필터 컴파일/적용 실패 — 로그만 남기고 필터 없이 계속합니다.
    #[error("cannot set BPF filter '{filter}' on '{interface}': {reason}")]
    Filter {
        /// 인터페이스명
        interface: String,
        /// 필터 표현식
        filter: String,
        /// 실패 사유
        reason: String,
    },

    /// 설정 에러
    #[error("config error: {field}: {reason}")]
    Config {
        /// 설정 필드명
        field: String,
        /// 에러 사유
        reason: String,
    },

    /// 채널 통신 에러
    #[error("channel error: {0}")]
    Channel(String),
}

impl From<CaptureError> for NetflumeError {
    fn from(err: CaptureError) -> Self {
        NetflumeError::Pipeline(PipelineError::InitFailed(err.to_string()))
    }
}
