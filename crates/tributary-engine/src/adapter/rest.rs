//! Generic REST/JSON pull adapter
//!
//! Serves `rest_api` sources whose provider returns JSON (or NDJSON) pages. The record
//! array and the next page token are located with the dotted `records_path` and
//! `cursor_path` from the source configuration.

use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{json_path, AdapterError, FetchRequest, Page, SourceAdapter};
use crate::models::{DataFormat, RawRecord, RestApiConfig, SourceConfiguration};

pub struct RestJsonAdapter {
    client: reqwest::Client,
}

impl RestJsonAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn config<'a>(request: &'a FetchRequest<'_>) -> Result<&'a RestApiConfig, AdapterError> {
        match &request.source.configuration {
            SourceConfiguration::RestApi(config) => Ok(config),
            other => Err(AdapterError::Unsupported(format!(
                "REST adapter cannot serve {} sources",
                other.source_type().as_str()
            ))),
        }
    }
}

fn classify_transport(err: reqwest::Error, timeout: Duration) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Timeout(timeout)
    } else if err.is_decode() {
        AdapterError::Malformed(err.to_string())
    } else {
        AdapterError::Transient(err.to_string())
    }
}

pub(crate) fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn check_status(response: &Response) -> Result<(), AdapterError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            AdapterError::Auth(format!("provider answered {status}"))
        }
        StatusCode::TOO_MANY_REQUESTS => AdapterError::RateLimited {
            retry_after: retry_after(response),
        },
        StatusCode::REQUEST_TIMEOUT => AdapterError::Transient(format!("provider answered {status}")),
        s if s.is_server_error() => AdapterError::Transient(format!("provider answered {status}")),
        _ => AdapterError::Unsupported(format!("provider answered {status}")),
    })
}

fn token_from(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_json_page(config: &RestApiConfig, body: &Value) -> Result<Page, AdapterError> {
    let records_path = config.records_path.as_deref().unwrap_or("");
    let records = match json_path(body, records_path) {
        Some(Value::Array(items)) => items.iter().cloned().map(RawRecord::new).collect::<Vec<_>>(),
        Some(Value::Null) | None if !records_path.is_empty() => Vec::new(),
        _ => {
            return Err(AdapterError::Malformed(format!(
                "expected an array at '{records_path}'"
            )))
        }
    };

    let next = config
        .cursor_path
        .as_deref()
        .and_then(|path| token_from(json_path(body, path)));

    // An empty page ends pagination even if the provider hands out another token.
    let next_page_token = if records.is_empty() { None } else { next };
    Ok(Page {
        records,
        next_page_token,
    })
}

fn parse_ndjson_page(text: &str) -> Result<Page, AdapterError> {
    let records = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<Value>(line)
                .map(RawRecord::new)
                .map_err(|e| AdapterError::Malformed(e.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Page::last(records))
}

#[async_trait]
impl SourceAdapter for RestJsonAdapter {
    fn provider(&self) -> &str {
        "rest_json"
    }

    async fn fetch(&self, request: FetchRequest<'_>) -> Result<Page, AdapterError> {
        let config = Self::config(&request)?;
        let timeout = request.source.call_timeout();

        let mut query: Vec<(String, String)> =
            vec![(config.page_size_param.clone(), request.page_size.to_string())];
        if let Some(token) = request.page_token {
            query.push((config.page_param.clone(), token.to_string()));
        }
        if let (Some(param), Some(since)) = (&config.since_param, request.since) {
            query.push((param.clone(), since.to_rfc3339()));
        }

        let mut builder = self.client.get(&config.endpoint).query(&query).timeout(timeout);
        for (name, value) in &config.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = request.credential.apply(builder);

        debug!(
            source_id = %request.source.id,
            endpoint = %config.endpoint,
            page_token = ?request.page_token,
            "fetching page"
        );

        let response = builder
            .send()
            .await
            .map_err(|e| classify_transport(e, timeout))?;
        check_status(&response)?;

        match config.format {
            DataFormat::Json => {
                let body: Value = response
                    .json()
                    .await
                    .map_err(|e| classify_transport(e, timeout))?;
                parse_json_page(config, &body)
            }
            DataFormat::Ndjson => {
                let text = response
                    .text()
                    .await
                    .map_err(|e| classify_transport(e, timeout))?;
                parse_ndjson_page(&text)
            }
            other => Err(AdapterError::Unsupported(format!(
                "REST adapter does not parse {other:?} payloads"
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(records_path: Option<&str>, cursor_path: Option<&str>) -> RestApiConfig {
        let mut config: RestApiConfig =
            serde_json::from_value(json!({"endpoint": "https://api.test/items"})).unwrap();
        config.records_path = records_path.map(str::to_string);
        config.cursor_path = cursor_path.map(str::to_string);
        config
    }

    #[test]
    fn test_parse_nested_page() {
        let body = json!({"data": [{"id": 1}, {"id": 2}], "paging": {"next": "p2"}});
        let page = parse_json_page(&config(Some("data"), Some("paging.next")), &body).unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.next_page_token.as_deref(), Some("p2"));
    }

    #[test]
    fn test_numeric_cursor_and_empty_page() {
        let body = json!({"data": [], "next_offset": 40});
        let page = parse_json_page(&config(Some("data"), Some("next_offset")), &body).unwrap();
        assert!(page.records.is_empty());
        assert_eq!(page.next_page_token, None);

        let body = json!({"data": [{"id": 1}], "next_offset": 40});
        let page = parse_json_page(&config(Some("data"), Some("next_offset")), &body).unwrap();
        assert_eq!(page.next_page_token.as_deref(), Some("40"));
    }

    #[test]
    fn test_non_array_body_is_malformed() {
        let body = json!({"id": 1});
        let err = parse_json_page(&config(None, None), &body).unwrap_err();
        assert!(matches!(err, AdapterError::Malformed(_)));
    }

    #[test]
    fn test_ndjson() {
        let page = parse_ndjson_page("{\"id\":1}\n\n{\"id\":2}\n").unwrap();
        assert_eq!(page.records.len(), 2);
        assert!(parse_ndjson_page("{oops").is_err());
    }
}
