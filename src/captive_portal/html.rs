//! 内嵌响应模板

use bytes::Bytes;
use http::StatusCode;

use crate::setting::Setting;

const REDIRECT_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <meta http-equiv="refresh" content="0; url={location}">
    <title>Redirecting</title>
</head>
<body>
    <p>Redirecting to <a href="{location}">{location}</a></p>
    <script>
        window.location.href = "{location}";
    </script>
</body>
</html>
"#;

fn status_line(status: StatusCode) -> String {
    format!(
        "HTTP/1.0 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default()
    )
}

/// 启动时生成一次的两份响应，之后每个连接只克隆引用
#[derive(Debug, Clone)]
pub struct Templates {
    pub ok_header: Bytes,
    pub redirect: Bytes,
}

impl Templates {
    /// 没有可用的重定向目标时返回错误
    pub fn new(setting: &Setting) -> anyhow::Result<Self> {
        let ok_header = format!("{}Connection: close\r\n\r\n", status_line(StatusCode::OK));

        let host = setting
            .primary_host()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| anyhow::anyhow!("accepted_hosts is empty, no redirect target"))?;
        let location = format!("http://{}/", host.to_ascii_lowercase());
        let redirect = format!(
            "{}Location: {}\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n{}",
            status_line(StatusCode::FOUND),
            location,
            REDIRECT_HTML.replace("{location}", &location)
        );

        Ok(Self {
            ok_header: Bytes::from(ok_header),
            redirect: Bytes::from(redirect),
        })
    }
}
