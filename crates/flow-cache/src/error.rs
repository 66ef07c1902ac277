//! 플로우 캐시 에러 타입

use netflume_core::error::{NetflumeError, PipelineError};

/// 플로우 캐시 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
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

impl From<CacheError> for NetflumeError {
    fn from(err: CacheError) -> Self {
        NetflumeError::Pipeline(PipelineError::InitFailed(err.to_string()))
    }
}
