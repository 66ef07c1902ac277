//! 파이프라인 trait — 모듈 생명주기 정의
//!
//! [`Pipeline`] trait은 캡처 엔진, 플로우 캐시, 익스포터가 공통으로
//! 구현하는 생명주기 인터페이스입니다. `netflume-daemon`은 이 trait을 통해
//! 각 단계를 순서대로 시작/정지하고 상태를 확인합니다.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::NetflumeError;

/// dyn-compatible Future 타입 별칭
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// 모든 파이프라인 모듈이 구현하는 생명주기 trait
///
/// `netflume-daemon`에서 각 모듈을 시작/정지하고 상태를 확인하는 데 사용됩니다.
///
/// # 구현 예시
/// ```ignore
/// struct CaptureEngine { /* ... */ }
///
/// impl Pipeline for CaptureEngine {
///     async fn start(&mut self) -> Result<(), NetflumeError> {
///         // 캡처 핸들 오픈, 수신 루프 스폰 등
///         Ok(())
///     }
///
///     async fn stop(&mut self) -> Result<(), NetflumeError> {
///         // 루프 취소, 핸들 정리
///         Ok(())
///     }
///
///     async fn health_check(&self) -> HealthStatus {
///         HealthStatus::Healthy
///     }
/// }
/// ```
pub trait Pipeline: Send + Sync {
    /// 모듈을 시작합니다.
    ///
    /// 리소스 초기화, 워커 스폰, 채널 연결 등을 수행합니다.
    /// 이미 실행 중인 경우 `PipelineError::AlreadyRunning`을 반환합니다.
    fn start(&mut self) -> impl Future<Output = Result<(), NetflumeError>> + Send;

    /// 모듈을 정지합니다.
    ///
    /// Graceful shutdown을 수행합니다.
    /// 진행 중인 작업을 완료하고 리소스를 정리합니다.
    fn stop(&mut self) -> impl Future<Output = Result<(), NetflumeError>> + Send;

    /// 모듈의 현재 상태를 확인합니다.
    fn health_check(&self) -> impl Future<Output = HealthStatus> + Send;
}

/// dyn-compatible 파이프라인 trait
///
/// `Pipeline` trait은 RPITIT를 사용하므로 `dyn Pipeline`이 불가합니다.
/// `DynPipeline`은 `BoxFuture`를 반환하여 `Vec<Box<dyn DynPipeline>>`으로
/// 모듈을 동적 관리할 수 있게 합니다. `Pipeline` 구현 타입은
/// blanket impl으로 자동으로 `DynPipeline`도 구현합니다.
pub trait DynPipeline: Send + Sync {
    /// 모듈을 시작합니다.
    fn start(&mut self) -> BoxFuture<'_, Result<(), NetflumeError>>;

    /// 모듈을 정지합니다.
    fn stop(&mut self) -> BoxFuture<'_, Result<(), NetflumeError>>;

    /// 모듈의 현재 상태를 확인합니다.
    fn health_check(&self) -> BoxFuture<'_, HealthStatus>;
}

impl<T: Pipeline> DynPipeline for T {
    fn start(&mut self) -> BoxFuture<'_, Result<(), NetflumeError>> {
        Box::pin(Pipeline::start(self))
    }

    fn stop(&mut self) -> BoxFuture<'_, Result<(), NetflumeError>> {
        Box::pin(Pipeline::stop(self))
    }

    fn health_check(&self) -> BoxFuture<'_, HealthStatus> {
        Box::pin(Pipeline::health_check(self))
    }
}

/// 모듈 헬스 상태
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// 정상 동작 중
    Healthy,
    /// 성능 저하 또는 부분적 장애 (서비스는 계속 동작)
    Degraded(String),
    /// 비정상 — 서비스 불가 상태
    Unhealthy(String),
}

impl HealthStatus {
    /// 정상 상태인지 확인합니다.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// 비정상 상태인지 확인합니다.
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy(_))
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded(reason) => write!(f, "degraded: {reason}"),
            Self::Unhealthy(reason) => write!(f, "unhealthy: {reason}"),
        }
    }
}
