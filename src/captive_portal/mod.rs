//! Captive Portal：DNS 劫持 + HTTP 服务
//!
//! 所有 DNS 查询都解析到本机，所有 HTTP 请求都落到本机的页面上。
//! 两个服务共用一个单线程 poll 循环，见 [`Reactor`]。

pub mod content;
pub mod dns;
pub mod html;
pub mod http;
mod poller;
pub mod reactor;
mod slab;
pub mod streamer;

pub use content::{ContentSource, DiskRoot, WebRoot};
pub use reactor::{Reactor, Stats};
