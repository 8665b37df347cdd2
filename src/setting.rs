//! 门户配置
//!
//! 启动时加载一次，之后以只读引用传给 reactor，运行期间不再修改。

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Setting {
    /// AP 名称
    pub ap_ssid: String,
    /// 允许直接访问的域名（小写），第一个同时是重定向目标
    pub accepted_hosts: Vec<String>,
    pub log_dns: bool,
    pub log_http: bool,
    /// 静态文件根目录
    pub web_root: PathBuf,
    pub bind_address: Ipv4Addr,
    pub dns_port: u16,
    pub http_port: u16,
    /// DNS 应答中使用的地址，不设置时使用 AP 的地址
    pub device_ip: Option<Ipv4Addr>,
    /// poll 等待上限，不设置时无限等待
    pub poll_timeout_ms: Option<u64>,
}

impl Default for Setting {
    fn default() -> Self {
        Self {
            ap_ssid: "QRGames Player".to_string(),
            accepted_hosts: vec!["test.qrpr.eu".to_string()],
            log_dns: true,
            log_http: true,
            web_root: PathBuf::from("web"),
            bind_address: Ipv4Addr::UNSPECIFIED,
            dns_port: 53,
            http_port: 80,
            device_ip: None,
            poll_timeout_ms: None,
        }
    }
}

impl Setting {
    /// 从 JSON 文件加载；没有给出路径时使用默认配置
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let setting = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                serde_json::from_str::<Setting>(&raw)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?
            }
            None => {
                log::warn!("Using default configuration.");
                Setting::default()
            }
        };

        setting.normalized()
    }

    pub fn normalized(mut self) -> anyhow::Result<Self> {
        self.accepted_hosts = self
            .accepted_hosts
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();

        if self.accepted_hosts.is_empty() {
            anyhow::bail!("accepted_hosts must contain at least one host");
        }

        Ok(self)
    }

    /// 重定向页面指向的域名；未配置任何域名时为 None
    pub fn primary_host(&self) -> Option<&str> {
        self.accepted_hosts.first().map(String::as_str)
    }

    pub fn is_accepted(&self, host: &str) -> bool {
        self.accepted_hosts.iter().any(|h| h == host)
    }
}
