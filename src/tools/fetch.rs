//! Fetch 工具：HTTP GET 外部数据源（天气、统计接口等）
//!
//! 仅允许白名单域名；JSON 响应原样返回，HTML 用 html2text 转为可读文本；
//! 超过 max_result_chars 截断并追加 ...[truncated]。
//! GET 无副作用，满足至少一次语义下的重复调用要求。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::tools::Tool;

const USER_AGENT: &str = concat!("relay/", env!("CARGO_PKG_VERSION"));
/// html2text 的换行宽度
const TEXT_WIDTH: usize = 120;

pub struct FetchTool {
    client: Client,
    allowed_domains: HashSet<String>,
    max_result_chars: usize,
}

/// 从 URL 中提取 host（去掉协议、端口与路径）
fn extract_domain(url: &str) -> Option<String> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split('/').next()?;
    let host = host.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

/// 简易去除 HTML 标签并压缩空白（html2text 失败时的回退）
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// HTML → 可读文本（去除 script / style）
fn html_to_text(html: &str) -> String {
    match html2text::from_read(html.as_bytes(), TEXT_WIDTH) {
        Ok(text) if !text.trim().is_empty() => text,
        _ => strip_html_tags(html),
    }
}

fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("<!") || s.starts_with("<html") || s.starts_with("<HTML")
}

fn truncate(body: String, max_chars: usize) -> String {
    if body.chars().count() > max_chars {
        body.chars().take(max_chars).collect::<String>() + "\n...[truncated]"
    } else {
        body
    }
}

impl FetchTool {
    pub fn new(allowed_domains: Vec<String>, timeout: Duration, max_result_chars: usize) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            allowed_domains: allowed_domains
                .into_iter()
                .map(|s| s.to_lowercase())
                .collect(),
            max_result_chars,
        }
    }

    fn check_allowed(&self, url: &str) -> Result<(), String> {
        let domain = extract_domain(url).ok_or_else(|| "Invalid or missing URL".to_string())?;
        if self.allowed_domains.contains(&domain) {
            Ok(())
        } else {
            Err(format!("Domain not in allowlist: {domain}"))
        }
    }

    async fn fetch(&self, url: &str) -> Result<String, String> {
        self.check_allowed(url)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("Request failed: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| format!("Read body: {e}"))?;
        let body = body.trim_start_matches('\u{FEFF}');
        let body = if looks_like_html(body) {
            html_to_text(body)
        } else {
            body.to_string()
        };
        Ok(truncate(body, self.max_result_chars))
    }
}

#[async_trait]
impl Tool for FetchTool {
    fn name(&self) -> &str {
        "fetch"
    }

    fn description(&self) -> &str {
        "HTTP GET a URL from the configured domain allowlist and return the body. Args: {\"url\": \"https://...\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "url": { "type": "string" } },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let url = args
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        if url.is_empty() {
            return Err("Missing url".to_string());
        }
        tracing::info!(url = %url, "fetch tool get");
        self.fetch(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            extract_domain("https://API.open-meteo.com:443/v1/forecast?x=1"),
            Some("api.open-meteo.com".to_string())
        );
        assert_eq!(extract_domain("ftp://example.com"), None);
        assert_eq!(extract_domain("https:///path"), None);
    }

    #[test]
    fn test_strip_html() {
        assert_eq!(
            strip_html_tags("<html><body><p>Hello</p><p>world</p></body></html>"),
            "Hello world"
        );
    }

    #[test]
    fn test_html_body_becomes_readable_text() {
        let html = "<!DOCTYPE html><html><head><title>Forecast</title></head>\
                    <body><h1>Oslo</h1><p>Clear sky, 12 degrees</p></body></html>";
        assert!(looks_like_html(html));
        let text = html_to_text(html);
        assert!(text.contains("Oslo"));
        assert!(text.contains("Clear sky, 12 degrees"));
        assert!(!text.contains("<p>"));
        assert!(!looks_like_html("{\"temp\": 12}"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abcdef".into(), 3), "abc\n...[truncated]");
        assert_eq!(truncate("abc".into(), 3), "abc");
    }

    #[tokio::test]
    async fn test_rejects_domain_outside_allowlist() {
        let tool = FetchTool::new(vec!["api.open-meteo.com".into()], Duration::from_secs(5), 100);
        let err = tool
            .execute(serde_json::json!({"url": "https://evil.example/x"}))
            .await
            .unwrap_err();
        assert!(err.contains("allowlist"));
        let err = tool.execute(serde_json::json!({})).await.unwrap_err();
        assert_eq!(err, "Missing url");
    }
}
