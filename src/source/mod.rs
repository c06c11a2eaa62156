//! 代理来源适配器
//!
//! 每种来源都实现同一个 `fetch` 能力：返回 `ip:port` 字符串列表（可能含重复或
//! 无效条目，由过滤阶段处理）。网络或解析失败只记录日志并返回空列表。

use anyhow::{Context, Result, ensure};
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

lazy_static! {
    static ref IP_PORT: Regex = Regex::new(
        r"\b((?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)(?:\.(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)){3}):(\d{1,5})\b"
    )
    .expect("IP:PORT 正则无效");
    static ref TABLE_ROW: Regex = Regex::new(
        r"(?is)<td[^>]*>\s*((?:\d{1,3}\.){3}\d{1,3})\s*</td>\s*<td[^>]*>\s*(\d{1,5})\s*</td>"
    )
    .expect("表格正则无效");
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// API 密钥；`value` 优先，其次读取环境变量 `env`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiKey {
    pub value: Option<String>,
    pub env: Option<String>,
    /// 以查询参数携带
    pub query_param: Option<String>,
    /// 以请求头携带
    pub header: Option<String>,
    /// 请求头值前缀，如 `Token `
    pub prefix: Option<String>,
}

impl ApiKey {
    pub fn resolve(&self) -> Option<String> {
        self.value
            .clone()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| {
                self.env
                    .as_ref()
                    .and_then(|name| std::env::var(name).ok())
                    .filter(|v| !v.trim().is_empty())
            })
    }

    fn apply(&self, request: RequestBuilder, key: &str) -> RequestBuilder {
        let mut request = request;
        if let Some(param) = &self.query_param {
            request = request.query(&[(param.as_str(), key)]);
        }
        if let Some(header) = &self.header {
            let value = format!("{}{}", self.prefix.as_deref().unwrap_or(""), key);
            request = request.header(header.as_str(), value);
        }
        request
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum ProxySource {
    /// 返回 JSON 的代理列表接口
    JsonApi {
        name: String,
        url: String,
        #[serde(default)]
        method: HttpMethod,
        #[serde(default)]
        query: BTreeMap<String, String>,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<Value>,
        #[serde(default)]
        api_key: Option<ApiKey>,
    },
    /// 返回纯文本（每行或以空白分隔）的代理列表接口
    TextApi {
        name: String,
        url: String,
        #[serde(default)]
        query: BTreeMap<String, String>,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        api_key: Option<ApiKey>,
    },
    /// 免费代理网站的 HTML 页面
    HtmlScrape { name: String, urls: Vec<String> },
    /// 本地手动维护的代理文件
    ManualFile { path: String },
}

impl ProxySource {
    pub fn name(&self) -> &str {
        match self {
            ProxySource::JsonApi { name, .. }
            | ProxySource::TextApi { name, .. }
            | ProxySource::HtmlScrape { name, .. } => name,
            ProxySource::ManualFile { .. } => "manual_file",
        }
    }

    pub fn urls(&self) -> Vec<&str> {
        match self {
            ProxySource::JsonApi { url, .. } | ProxySource::TextApi { url, .. } => {
                vec![url.as_str()]
            }
            ProxySource::HtmlScrape { urls, .. } => urls.iter().map(String::as_str).collect(),
            ProxySource::ManualFile { .. } => vec![],
        }
    }

    fn api_key(&self) -> Option<&ApiKey> {
        match self {
            ProxySource::JsonApi { api_key, .. } | ProxySource::TextApi { api_key, .. } => {
                api_key.as_ref()
            }
            _ => None,
        }
    }

    /// 获取候选代理，从不返回错误
    pub async fn fetch(&self, client: &Client) -> Vec<String> {
        let key = match self.api_key() {
            Some(api_key) => match api_key.resolve() {
                Some(key) => Some(key),
                None => {
                    warn!("⚠️ {}: 未配置 API key，跳过", self.name());
                    return vec![];
                }
            },
            None => None,
        };

        match self.try_fetch(client, key.as_deref()).await {
            Ok(proxies) => {
                if proxies.is_empty() {
                    info!("⚠️ {}: 没有返回代理", self.name());
                } else {
                    info!("✅ {}: {} 个候选代理", self.name(), proxies.len());
                }
                proxies
            }
            Err(e) => {
                warn!("❌ {}: {:#}", self.name(), e);
                vec![]
            }
        }
    }

    async fn try_fetch(&self, client: &Client, key: Option<&str>) -> Result<Vec<String>> {
        match self {
            ProxySource::JsonApi {
                url,
                method,
                query,
                headers,
                body,
                api_key,
                ..
            } => {
                let mut request = build_request(client, *method, url, query, headers);
                if let Some(body) = body {
                    request = request.json(body);
                }
                if let (Some(api_key), Some(key)) = (api_key, key) {
                    request = api_key.apply(request, key);
                }

                let response = request.send().await?;
                ensure!(response.status().is_success(), "HTTP {}", response.status());
                let value: Value = response.json().await.context("响应不是合法 JSON")?;
                Ok(parse_json_proxies(&value))
            }
            ProxySource::TextApi {
                url,
                query,
                headers,
                api_key,
                ..
            } => {
                let mut request = build_request(client, HttpMethod::Get, url, query, headers);
                if let (Some(api_key), Some(key)) = (api_key, key) {
                    request = api_key.apply(request, key);
                }

                let response = request.send().await?;
                ensure!(response.status().is_success(), "HTTP {}", response.status());
                let text = response.text().await?;
                Ok(parse_text_proxies(&text))
            }
            ProxySource::HtmlScrape { name, urls } => {
                let mut proxies = Vec::new();
                for url in urls {
                    match fetch_page(client, url).await {
                        Ok(html) => {
                            let found = extract_from_html(&html);
                            debug!("{}: {} 提取到 {} 个代理", name, url, found.len());
                            proxies.extend(found);
                        }
                        Err(e) => debug!("{}: 抓取 {} 失败: {:#}", name, url, e),
                    }
                }
                Ok(proxies)
            }
            ProxySource::ManualFile { path } => load_manual_proxies(path),
        }
    }
}

fn build_request(
    client: &Client,
    method: HttpMethod,
    url: &str,
    query: &BTreeMap<String, String>,
    headers: &BTreeMap<String, String>,
) -> RequestBuilder {
    let mut request = match method {
        HttpMethod::Get => client.get(url),
        HttpMethod::Post => client.post(url),
    };
    if !query.is_empty() {
        request = request.query(query);
    }
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    request
}

async fn fetch_page(client: &Client, url: &str) -> Result<String> {
    let response = client.get(url).send().await?;
    ensure!(response.status().is_success(), "HTTP {}", response.status());
    Ok(response.text().await?)
}

fn entry_to_candidate(entry: &Value) -> Option<String> {
    match entry {
        Value::String(s) if s.contains(':') => Some(s.trim().to_string()),
        Value::Object(map) => {
            let host = map
                .get("ip")
                .or_else(|| map.get("address"))
                .and_then(Value::as_str)?
                .trim();
            let port = match map.get("port")? {
                Value::Number(n) => n.as_u64()?.to_string(),
                Value::String(s) => s.trim().to_string(),
                _ => return None,
            };
            let scheme = map
                .get("protocol")
                .and_then(Value::as_str)
                .map(|p| p.trim().to_ascii_lowercase())
                .filter(|p| p != "http" && p != "https");

            Some(match scheme {
                Some(scheme) => format!("{}://{}:{}", scheme, host, port),
                None => format!("{}:{}", host, port),
            })
        }
        _ => None,
    }
}

/// 支持数组、`{"proxies": [...]}` 以及单个代理对象三种结构
pub fn parse_json_proxies(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(entry_to_candidate).collect(),
        Value::Object(map) => match map.get("proxies") {
            Some(Value::Array(items)) => items.iter().filter_map(entry_to_candidate).collect(),
            _ => entry_to_candidate(value).into_iter().collect(),
        },
        _ => vec![],
    }
}

pub fn parse_text_proxies(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter(|entry| entry.contains(':'))
        .map(str::to_string)
        .collect()
}

pub fn extract_from_html(html: &str) -> Vec<String> {
    let mut proxies: Vec<String> = IP_PORT
        .captures_iter(html)
        .map(|cap| format!("{}:{}", &cap[1], &cap[2]))
        .collect();

    proxies.extend(
        TABLE_ROW
            .captures_iter(html)
            .map(|cap| format!("{}:{}", &cap[1], &cap[2])),
    );
    proxies
}

/// 每行一个代理，`#` 开头为注释
pub fn parse_manual_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// 文件不存在时视为空列表
pub fn load_manual_proxies<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    match fs::read_to_string(path.as_ref()) {
        Ok(content) => Ok(parse_manual_list(&content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(vec![]),
        Err(e) => Err(e).with_context(|| format!("读取 {} 失败", path.as_ref().display())),
    }
}
