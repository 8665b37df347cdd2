//! HTTP 请求分类
//!
//! 只看 `GET` 行和 `Host` 行。白名单里的域名按路径返回文件，其余一律重定向。

use http::{header, Method};

use super::content::WebRoot;
use super::html::Templates;
use super::streamer::WriteTask;
use crate::setting::Setting;

pub const INDEX_PATH: &str = "/index.html";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub host: String,
}

/// `line` 以 `name` 开头（忽略大小写）时返回第二个空白分隔的字段
fn field<'a>(line: &'a str, name: &str) -> Option<Option<&'a str>> {
    let head = line.get(..name.len())?;
    if !head.eq_ignore_ascii_case(name) {
        return None;
    }
    Some(line.split_whitespace().nth(1))
}

impl Request {
    pub fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let mut request = Request::default();
        let mut seen_get = false;
        let mut seen_host = false;

        for line in text.lines() {
            if !seen_get {
                if let Some(path) = field(line, Method::GET.as_str()) {
                    seen_get = true;
                    request.method = Method::GET.to_string();
                    if let Some(path) = path {
                        request.path = path.to_string();
                    }
                    continue;
                }
            }
            if !seen_host {
                if let Some(host) = field(line, header::HOST.as_str()) {
                    seen_host = true;
                    if let Some(host) = host {
                        request.host = host.to_string();
                    }
                }
            }
            if seen_get && seen_host {
                break;
            }
        }

        request
    }

    /// 小写、去掉端口后的域名
    pub fn normalized_host(&self) -> String {
        let host = self.host.to_ascii_lowercase();
        match host.rsplit_once(':') {
            Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name.to_string(),
            _ => host,
        }
    }

    /// 去掉查询串和片段后的路径
    pub fn file_path(&self) -> &str {
        let end = self.path.find(['?', '#']).unwrap_or(self.path.len());
        &self.path[..end]
    }
}

/// 决定如何响应一个请求
pub fn classify<R: WebRoot>(
    request: &Request,
    templates: &Templates,
    setting: &Setting,
    root: &R,
) -> WriteTask {
    if !setting.is_accepted(&request.normalized_host()) {
        return WriteTask::new(templates.redirect.clone(), None);
    }

    let requested = request.file_path();
    let path = if root.exists(requested) {
        requested
    } else {
        INDEX_PATH
    };

    match root.open(path) {
        Ok(source) => WriteTask::new(templates.ok_header.clone(), Some(source)),
        Err(e) => {
            log::warn!("Web: failed to open {}: {}", path, e);
            WriteTask::new(templates.ok_header.clone(), None)
        }
    }
}
