// Copyright 2025 Google LLC
// SPDX-License-Identifier: MIT

//! Client for a Prometheus-compatible query API such as VictoriaMetrics.

use anyhow::{Context, Result, anyhow};
use log::debug;
use serde::Deserialize;
use std::{collections::HashMap, future, pin, time};

const QUERY_TIMEOUT: time::Duration = time::Duration::from_secs(2);
const QUERY_RANGE_TIMEOUT: time::Duration = time::Duration::from_secs(10);

pub type BoxFuture<'a, T> = pin::Pin<Box<dyn future::Future<Output = T> + Send + 'a>>;

/// One element of an instant vector.
#[derive(Clone, Debug)]
pub struct Sample {
    pub labels: HashMap<String, String>,
    pub value: f64,
}

impl Sample {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// One element of a range vector.
#[derive(Clone, Debug)]
pub struct Series {
    pub labels: HashMap<String, String>,
    /// `(unix seconds, value)` in ascending time order.
    pub points: Vec<(f64, f64)>,
}

impl Series {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Range {
    pub start: i64,
    pub end: i64,
    pub step: u64,
}

pub trait TimeSeries: Send + Sync {
    fn query<'a>(&'a self, expr: &'a str) -> BoxFuture<'a, Result<Vec<Sample>>>;

    fn query_range<'a>(
        &'a self,
        expr: &'a str,
        range: Range,
    ) -> BoxFuture<'a, Result<Vec<Series>>>;
}

/// Returns the value of the first sample, if any.
pub fn first_value(samples: &[Sample]) -> Option<f64> {
    samples.first().map(|sample| sample.value)
}

#[derive(Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<ApiData>,
}

#[derive(Deserialize)]
struct ApiData {
    #[serde(default)]
    result: Vec<ApiResult>,
}

#[derive(Deserialize)]
struct ApiResult {
    #[serde(default)]
    metric: HashMap<String, String>,
    #[serde(default)]
    value: Option<(f64, String)>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

fn parse_value(val: &str) -> Result<f64> {
    val.parse()
        .with_context(|| format!("invalid sample value {val:?}"))
}

fn parse_results(body: &[u8]) -> Result<Vec<ApiResult>> {
    let resp: ApiResponse =
        serde_json::from_slice(body).context("failed to parse query response")?;
    if resp.status != "success" {
        let err = resp.error.unwrap_or_default();
        return Err(anyhow!("query responded status {} {err}", resp.status));
    }

    Ok(resp.data.map(|data| data.result).unwrap_or_default())
}

fn parse_instant(body: &[u8]) -> Result<Vec<Sample>> {
    parse_results(body)?
        .into_iter()
        .filter_map(|res| res.value.map(|val| (res.metric, val)))
        .map(|(labels, (_, val))| {
            Ok(Sample {
                labels,
                value: parse_value(&val)?,
            })
        })
        .collect()
}

fn parse_range(body: &[u8]) -> Result<Vec<Series>> {
    parse_results(body)?
        .into_iter()
        .map(|res| {
            let points = res
                .values
                .iter()
                .map(|(ts, val)| Ok((*ts, parse_value(val)?)))
                .collect::<Result<_>>()?;

            Ok(Series {
                labels: res.metric,
                points,
            })
        })
        .collect()
}

pub struct VictoriaMetrics {
    http: reqwest::Client,
    base_url: String,
}

impl VictoriaMetrics {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build http client")?;

        Ok(VictoriaMetrics {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get(
        &self,
        path: &str,
        params: &[(&str, String)],
        timeout: time::Duration,
    ) -> Result<Vec<u8>> {
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .http
            .get(&url)
            .query(params)
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("failed to request {url}"))?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .with_context(|| format!("failed to read response from {url}"))?;
        if !status.is_success() && body.is_empty() {
            return Err(anyhow!("unexpected status {status} from {url}"));
        }

        Ok(body.to_vec())
    }
}

impl TimeSeries for VictoriaMetrics {
    fn query<'a>(&'a self, expr: &'a str) -> BoxFuture<'a, Result<Vec<Sample>>> {
        Box::pin(async move {
            debug!("query {expr}");

            let params = [("query", expr.to_string())];
            let body = self.get("/api/v1/query", &params, QUERY_TIMEOUT).await?;
            parse_instant(&body).with_context(|| format!("query {expr:?} failed"))
        })
    }

    fn query_range<'a>(
        &'a self,
        expr: &'a str,
        range: Range,
    ) -> BoxFuture<'a, Result<Vec<Series>>> {
        Box::pin(async move {
            debug!("query_range {expr} {range:?}");

            let params = [
                ("query", expr.to_string()),
                ("start", range.start.to_string()),
                ("end", range.end.to_string()),
                ("step", range.step.to_string()),
            ];
            let body = self
                .get("/api/v1/query_range", &params, QUERY_RANGE_TIMEOUT)
                .await?;
            parse_range(&body).with_context(|| format!("query_range {expr:?} failed"))
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_vector() {
        let body = br#"{
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {"ip": "10.1.1.5", "direction": "rx"}, "value": [1700000000.5, "1250.5"]},
                    {"metric": {}, "value": [1700000000, "7"]}
                ]
            }
        }"#;

        let samples = parse_instant(body).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].label("ip"), Some("10.1.1.5"));
        assert_eq!(samples[0].value, 1250.5);
        assert_eq!(first_value(&samples[1..]), Some(7.0));
    }

    #[test]
    fn range_vector() {
        let body = br#"{
            "status": "success",
            "data": {
                "resultType": "matrix",
                "result": [
                    {"metric": {"ip": "10.1.1.5"}, "values": [[100, "1"], [130, "2.5"]]}
                ]
            }
        }"#;

        let series = parse_range(body).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].points, vec![(100.0, 1.0), (130.0, 2.5)]);
    }

    #[test]
    fn empty_result_is_not_an_error() {
        let body = br#"{"status": "success", "data": {"resultType": "vector", "result": []}}"#;
        assert!(parse_instant(body).unwrap().is_empty());
        assert_eq!(first_value(&[]), None);
    }

    #[test]
    fn error_status() {
        let body = br#"{"status": "error", "errorType": "bad_data", "error": "parse error"}"#;
        let err = parse_instant(body).unwrap_err();
        assert!(err.to_string().contains("parse error"));
    }

    #[test]
    fn malformed_shapes() {
        assert!(parse_instant(b"<html>").is_err());

        let body = br#"{"status": "success", "data": {"result": [{"metric": {}, "value": [1, "abc"]}]}}"#;
        assert!(parse_instant(body).is_err());
    }
}
