//! 板级支持：日志、状态灯、AP
//!
//! 设备上（ESP-IDF）使用真实外设；桌面主机上用日志和 sleep 模拟，便于调试 reactor。

use std::net::Ipv4Addr;
use std::time::Duration;

#[cfg(target_os = "espidf")]
pub mod esp;
#[cfg(target_os = "espidf")]
pub use esp::*;

#[cfg(not(target_os = "espidf"))]
pub mod host;
#[cfg(not(target_os = "espidf"))]
pub use host::*;

/// AP 模式的固定 IP 地址
pub const AP_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);

/// 启动时亮灯时长
pub const STARTUP_BLINK: Duration = Duration::from_secs(2);
/// 故障时慢闪的亮/灭时长
pub const FAULT_BLINK: Duration = Duration::from_secs(1);
