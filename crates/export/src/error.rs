//! 익스포터 에러 타입

use netflume_core::error::{NetflumeError, PipelineError};

/// 익스포터 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// NetFlow v5는 IPv4 플로우만 실을 수 있습니다.
    /// 호출자에게 반환될 뿐 익스포터를 중단시키지 않습니다.
    #[error("IP version {0} not supported in NetFlow v5")]
    UnsupportedIpVersion(u8),

    /// UDP 소켓 생성/연결 실패
    #[error("cannot connect to collector {target}: {reason}")]
    Socket {
        /// 수집기 주소
        target: String,
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

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ExportError> for NetflumeError {
    fn from(err: ExportError) -> Self {
        NetflumeError::Pipeline(PipelineError::InitFailed(err.to_string()))
    }
}
