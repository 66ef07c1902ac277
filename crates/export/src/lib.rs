#![doc = include_str!("../README.md")]
//!
//! # 모듈 구성
//!
//! - [`record`]: NetFlow v5 헤더/레코드 바이트 배치 (24/48바이트, BE)
//! - [`exporter`]: 데이터그램 패킹 + UDP 송신 (Pipeline trait 구현)
//! - [`config`]: 익스포터 설정 (core 설정 확장)
//! - [`error`]: 도메인 에러 타입

pub mod config;
pub mod error;
pub mod exporter;
pub mod record;

// --- 주요 타입 re-export ---

pub use config::ExportConfig;
pub use error::ExportError;
pub use exporter::{DatagramPacker, Netflow5Exporter, Netflow5ExporterBuilder};
pub use record::{HEADER_SIZE, MAX_DATAGRAM_SIZE, MAX_RECORDS_PER_DATAGRAM, RECORD_SIZE};
