use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{CONNECTION, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;

use crate::domain::Manifest;
use crate::error::MigrateError;

/// Parses a YAML (or JSON) document into a JSON value. Node tags such as
/// `!js/undefined` or `!<tag:yaml.org,2002:js/undefined>` are dropped and the
/// node keeps its plain value; an empty tagged node becomes null.
pub fn parse_document(text: &str) -> Result<Value, serde_yaml::Error> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    let document: serde_yaml::Value = serde_yaml::from_str(&normalize_tags(text))?;
    serde_json::to_value(untag(document))
        .map_err(<serde_yaml::Error as serde::ser::Error>::custom)
}

/// Rewrites tag tokens outside quoted scalars and comments so the YAML scanner
/// accepts them. Verbatim tags (`!<...>`) are removed, leaving a plain node.
/// A local tag directly followed by `}` or `]` gets a separating space, since
/// only whitespace or `,` may end a tag in flow context.
fn normalize_tags(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let prev = if i == 0 { None } else { Some(chars[i - 1]) };
        let at_token_start = prev.is_none_or(|p| p.is_whitespace() || "[{,:".contains(p));

        if let Some(q) = quote {
            out.push(c);
            if q == '"' && c == '\\' {
                if let Some(&escaped) = chars.get(i + 1) {
                    out.push(escaped);
                    i += 1;
                }
            } else if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        match c {
            '"' | '\'' if at_token_start => {
                quote = Some(c);
                out.push(c);
                i += 1;
            }
            '#' if prev.is_none_or(char::is_whitespace) => {
                while i < chars.len() && chars[i] != '\n' {
                    out.push(chars[i]);
                    i += 1;
                }
            }
            '!' if at_token_start && chars.get(i + 1) == Some(&'<') => {
                let close = chars[i..].iter().position(|&ch| ch == '>');
                match close {
                    Some(offset) => i += offset + 1,
                    None => {
                        out.push(c);
                        i += 1;
                    }
                }
            }
            '!' if at_token_start => {
                while i < chars.len() && !is_tag_end(chars[i]) {
                    out.push(chars[i]);
                    i += 1;
                }
                if matches!(chars.get(i), Some('}' | ']')) {
                    out.push(' ');
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn is_tag_end(c: char) -> bool {
    c.is_whitespace() || matches!(c, ',' | '[' | ']' | '{' | '}')
}

fn untag(value: serde_yaml::Value) -> serde_yaml::Value {
    match value {
        serde_yaml::Value::Tagged(tagged) => untag(tagged.value),
        serde_yaml::Value::Sequence(items) => {
            serde_yaml::Value::Sequence(items.into_iter().map(untag).collect())
        }
        serde_yaml::Value::Mapping(map) => serde_yaml::Value::Mapping(
            map.into_iter()
                .map(|(key, value)| (untag(key), untag(value)))
                .collect(),
        ),
        other => other,
    }
}

#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Fetches and parses one manifest. Never retries.
    async fn fetch(&self, url: &str) -> Result<Manifest, MigrateError>;
}

#[derive(Clone)]
pub struct HttpManifestFetcher {
    client: Client,
}

impl HttpManifestFetcher {
    pub fn new(timeout: Duration) -> Result<Self, MigrateError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("shareloc-migrate/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| MigrateError::InvalidSetting(err.to_string()))?,
        );
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| MigrateError::FetchHttp {
                url: String::new(),
                message: err.to_string(),
            })?;
        Ok(Self { client })
    }

    /// GETs `url` and parses the body as a structured document.
    pub async fn fetch_document(&self, url: &str) -> Result<Value, MigrateError> {
        let response =
            self.client
                .get(url)
                .send()
                .await
                .map_err(|err| MigrateError::FetchHttp {
                    url: url.to_string(),
                    message: err.to_string(),
                })?;
        let status = response.status();
        if !status.is_success() {
            return Err(MigrateError::FetchStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let text = response
            .text()
            .await
            .map_err(|err| MigrateError::FetchHttp {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        parse_document(&text).map_err(|err| MigrateError::ManifestParse {
            url: url.to_string(),
            message: err.to_string(),
        })
    }
}

#[async_trait]
impl ManifestSource for HttpManifestFetcher {
    async fn fetch(&self, url: &str) -> Result<Manifest, MigrateError> {
        let document = self.fetch_document(url).await?;
        Manifest::from_value(document).map_err(|err| MigrateError::ManifestParse {
            url: url.to_string(),
            message: err.to_string(),
        })
    }
}
