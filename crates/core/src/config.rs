//! 설정 관리 — netflume.toml 파싱 및 검증
//!
//! [`NetflumeConfig`]는 데몬이 소비하는 통합 설정입니다.
//! TOML 파일에서 로드되며, 누락된 필드에는 기본값이 적용되고
//! [`NetflumeConfig::validate`]로 값의 유효성을 검증합니다.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const DEFAULT_EXPORTER_PORT: u16 = 9999;
const DEFAULT_MAX_FLOWS: u32 = 65_536;
const DEFAULT_IDLE_TIMEOUT_SECS: u32 = 15;
const DEFAULT_ACTIVE_TIMEOUT_SECS: u32 = 1_800;

/// Netflume 통합 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetflumeConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// 수집기(collector)로의 내보내기 설정
    #[serde(default)]
    pub exporter: ExporterConfig,
    /// 플로우 캐시 설정
    #[serde(default)]
    pub cache: CacheConfig,
    /// 캡처 인터페이스 설정 (인터페이스명 → 설정)
    #[serde(default)]
    pub interfaces: BTreeMap<String, CaptureInterfaceConfig>,
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// PID 파일 경로 (빈 문자열이면 미사용)
    #[serde(default)]
    pub pid_file: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            pid_file: String::new(),
        }
    }
}

/// NetFlow v5 내보내기 대상 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// 수집기 호스트 (IPv4 주소 또는 호스트명)
    #[serde(default)]
    pub host: String,
    /// 수집기 UDP 포트
    #[serde(default = "default_exporter_port")]
    pub port: u16,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_exporter_port(),
        }
    }
}

/// 플로우 캐시 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 캐시 최대 플로우 수 (LRU 용량이자 단계 간 채널 용량)
    #[serde(default = "default_max_flows")]
    pub max_flows: u32,
    /// 유휴 타임아웃 (초)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u32,
    /// 활성 타임아웃 (초)
    #[serde(default = "default_active_timeout")]
    pub active_timeout_secs: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_flows: default_max_flows(),
            idle_timeout_secs: default_idle_timeout(),
            active_timeout_secs: default_active_timeout(),
        }
    }
}

/// 캡처 인터페이스별 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureInterfaceConfig {
    /// 선택적 BPF 필터 표현식
    #[serde(default)]
    pub filter: Option<String>,
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_log_format() -> String {
    "json".to_owned()
}

fn default_exporter_port() -> u16 {
    DEFAULT_EXPORTER_PORT
}

fn default_max_flows() -> u32 {
    DEFAULT_MAX_FLOWS
}

fn default_idle_timeout() -> u32 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_active_timeout() -> u32 {
    DEFAULT_ACTIVE_TIMEOUT_SECS
}

impl NetflumeConfig {
    /// TOML 설정 파일을 로드합니다.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ConfigError::FileNotFound {
                    path: path.display().to_string(),
                },
                _ => ConfigError::ParseFailed {
                    reason: format!("cannot read {}: {e}", path.display()),
                },
            })?;
        Self::from_toml_str(&raw)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseFailed {
            reason: e.to_string(),
        })
    }

    /// 설정값의 유효성을 검증합니다.
    ///
    /// 데몬 기동 전과 `--validate` 모드에서 호출됩니다.
    pub fn validate(&self) -> Result<(), ConfigError> {
        const MAX_MAX_FLOWS: u32 = 16_777_216;

        if self.exporter.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "exporter.host".to_owned(),
                reason: "collector host must be set".to_owned(),
            });
        }
        if self.exporter.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "exporter.port".to_owned(),
                reason: "must be 1-65535".to_owned(),
            });
        }
        if self.cache.max_flows == 0 || self.cache.max_flows > MAX_MAX_FLOWS {
            return Err(ConfigError::InvalidValue {
                field: "cache.max_flows".to_owned(),
                reason: format!("must be 1-{MAX_MAX_FLOWS}"),
            });
        }
        if self.cache.idle_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.idle_timeout_secs".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        if self.cache.active_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.active_timeout_secs".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        match self.general.log_format.as_str() {
            "json" | "pretty" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "general.log_format".to_owned(),
                    reason: format!("unknown format '{other}', expected 'json' or 'pretty'"),
                });
            }
        }
        for (name, iface) in &self.interfaces {
            if name.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "interfaces".to_owned(),
                    reason: "interface name must not be empty".to_owned(),
                });
            }
            if let Some(filter) = &iface.filter {
                if filter.trim().is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field: format!("interfaces.{name}.filter"),
                        reason: "filter must not be an empty string (omit it instead)".to_owned(),
                    });
                }
            }
        }
        Ok(())
    }
}
