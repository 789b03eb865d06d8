// Copyright 2025 Google LLC
// SPDX-License-Identifier: MIT

use crate::collector::{Aggregator, Collector};
use anyhow::{Context, Result};
use hyper::{Method, Request, Response, Uri, body::Bytes, header};
use log::{debug, error, info};
use std::{future, pin, sync};

const DASHBOARD_HTML: &str = include_str!("dashboard.html");
const DEFAULT_DURATION: &str = "10m";

type Body = http_body_util::Full<Bytes>;

#[derive(Clone)]
struct Svc {
    aggregator: sync::Arc<Aggregator<Collector>>,

    error_500: Response<Body>,
}

/// Parses `ips=a,b&duration=3h`.
fn history_params(uri: &Uri) -> Result<(Option<Vec<String>>, String)> {
    let mut url = reqwest::Url::parse("http://localhost/")?;
    url.set_query(uri.query());

    let mut ips = None;
    let mut duration = DEFAULT_DURATION.to_string();
    for (key, val) in url.query_pairs() {
        match key.as_ref() {
            "ips" => {
                let list: Vec<String> = val
                    .split(',')
                    .map(str::trim)
                    .filter(|ip| !ip.is_empty())
                    .map(str::to_string)
                    .collect();
                ips = (!list.is_empty()).then_some(list);
            }
            "duration" if !val.is_empty() => duration = val.into_owned(),
            _ => (),
        }
    }

    Ok((ips, duration))
}

fn json_response(body: Vec<u8>) -> hyper::http::Result<Response<Body>> {
    Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Body::from(body))
}

impl Svc {
    async fn metrics(&self) -> Result<Response<Body>> {
        let snapshot = self.aggregator.snapshot().await;
        let body = serde_json::to_vec(&snapshot).context("failed to encode metrics")?;

        Ok(json_response(body)?)
    }

    async fn client_histories(&self, uri: &Uri) -> Result<Response<Body>> {
        let (ips, duration) = history_params(uri)?;
        let histories = self
            .aggregator
            .collector()
            .client_histories(ips, &duration)
            .await?;
        let body = serde_json::to_vec(&*histories).context("failed to encode histories")?;

        Ok(json_response(body)?)
    }

    async fn route(&self, method: &Method, uri: &Uri) -> Response<Body> {
        if *method != Method::GET {
            debug!("unsupported method {method} for {uri}");
            return Response::builder()
                .status(405)
                .header(header::ALLOW, "GET")
                .body(Body::default())
                .unwrap_or_else(|_| self.error_500.clone());
        }

        let resp = match uri.path() {
            "/" | "/index.html" => Response::builder()
                .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
                .body(Body::from(DASHBOARD_HTML))
                .map_err(anyhow::Error::from),
            "/api/metrics" => self.metrics().await,
            "/api/client-histories" => self.client_histories(uri).await,
            _ => {
                debug!("incorrect uri {uri}");
                Response::builder()
                    .status(404)
                    .body(Body::default())
                    .map_err(anyhow::Error::from)
            }
        };

        resp.unwrap_or_else(|err| {
            error!("failed to serve {uri}: {err:?}");
            self.error_500.clone()
        })
    }
}

impl hyper::service::Service<Request<hyper::body::Incoming>> for Svc {
    type Response = Response<Body>;
    type Error = hyper::Error;
    type Future =
        pin::Pin<Box<dyn future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<hyper::body::Incoming>) -> Self::Future {
        let svc = self.clone();

        Box::pin(async move { Ok(svc.route(req.method(), req.uri()).await) })
    }
}

async fn serve_connection(stream: tokio::net::TcpStream, svc: Svc) {
    let io = hyper_util::rt::TokioIo::new(stream);

    let http = hyper::server::conn::http1::Builder::new();
    let conn = http.serve_connection(io, svc);

    if let Err(err) = conn.await {
        error!("server connection error: {err:?}");
    }
}

fn new_svc(collector: Collector) -> Result<Svc> {
    Ok(Svc {
        aggregator: sync::Arc::new(Aggregator::new(collector)),
        error_500: Response::builder().status(500).body(Body::default())?,
    })
}

pub async fn run(addr: &str, collector: Collector) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    let local_addr = listener.local_addr()?;

    let svc = new_svc(collector)?;

    info!("dashboard at http://{local_addr}/");
    info!("metrics api at http://{local_addr}/api/metrics");

    loop {
        let stream = match listener.accept().await {
            Ok((stream, client_addr)) => {
                debug!("new connection from {client_addr:?}");
                stream
            }
            Err(err) => {
                error!("failed to accept connection: {err:?}");
                continue;
            }
        };

        tokio::task::spawn(serve_connection(stream, svc.clone()));
    }
}
