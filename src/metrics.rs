/*
 * Copyright 2020 Damian Peckett <damian@pecke.tt>
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::error::*;
use async_trait::async_trait;
use serde::de::IgnoredAny;
use serde::Deserialize;
use snafu::{OptionExt, ResultExt};

/// A backend able to report the average CPU utilization of a workload.
#[async_trait]
pub trait MetricSource {
    /// Average CPU usage, as a percentage of requested CPU, across every pod
    /// named `<name_prefix>-*` in `namespace` over `window`.
    async fn query_average(
        &self,
        namespace: &str,
        name_prefix: &str,
        window: &str,
    ) -> Result<f64, Error>;
}

/// Metric source backed by the Prometheus HTTP API.
pub struct PrometheusMetricSource {
    http_client: reqwest::Client,
    query_uri: String,
}

impl PrometheusMetricSource {
    /// The http client carries the per request timeout.
    pub fn new(http_client: reqwest::Client, base_url: &str) -> Self {
        Self {
            http_client,
            query_uri: format!("{}/api/v1/query", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl MetricSource for PrometheusMetricSource {
    async fn query_average(
        &self,
        namespace: &str,
        name_prefix: &str,
        window: &str,
    ) -> Result<f64, Error> {
        let query = cpu_utilization_query(namespace, name_prefix, window);

        let response: QueryResponse = self
            .http_client
            .get(&self.query_uri)
            .query(&[("query", query.as_str())])
            .send()
            .await
            .context(HttpClient {})?
            .json()
            .await
            .context(HttpClient {})?;

        response
            .into_value()?
            .context(NoData {
                namespace,
                name: name_prefix,
            })
    }
}

/// Build the PromQL expression for the average CPU utilization of a workload's pods.
pub(crate) fn cpu_utilization_query(namespace: &str, name_prefix: &str, window: &str) -> String {
    format!(
        "100 * avg(\
         sum by(pod) (rate(container_cpu_usage_seconds_total{{namespace=\"{ns}\",pod=~\"{name}-.*\",container!=\"POD\",container!=\"\"}}[{window}])) \
         / \
         sum by(pod) (kube_pod_container_resource_requests{{namespace=\"{ns}\",pod=~\"{name}-.*\",resource=\"cpu\"}})\
         )",
        ns = namespace,
        name = name_prefix,
        window = window,
    )
}

/// Prometheus instant query response envelope.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    status: String,
    data: Option<QueryData>,
    error_type: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum QueryData {
    Vector(Vec<VectorSample>),
    Scalar(SampleValue),
    Matrix(IgnoredAny),
    String(IgnoredAny),
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    value: SampleValue,
}

/// A `[<unix time>, "<value>"]` pair.
#[derive(Debug, Deserialize)]
struct SampleValue(IgnoredAny, String);

impl SampleValue {
    fn finite(&self) -> Option<f64> {
        self.1.parse::<f64>().ok().filter(|value| value.is_finite())
    }
}

impl QueryResponse {
    /// The first finite sample, if the query produced one.
    fn into_value(self) -> Result<Option<f64>, Error> {
        if self.status != "success" {
            return PrometheusApi {
                error_type: self.error_type.unwrap_or_else(|| "unknown".into()),
                message: self.error.unwrap_or_default(),
            }
            .fail();
        }

        Ok(match self.data {
            Some(QueryData::Vector(samples)) => {
                samples.first().and_then(|sample| sample.value.finite())
            }
            Some(QueryData::Scalar(value)) => value.finite(),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::routing::get;
    use axum::{Json, Router};
    use futures::channel::oneshot;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::time::Duration;

    /// Serve a canned Prometheus response on an ephemeral port.
    async fn spawn_server(body: serde_json::Value) -> (SocketAddr, oneshot::Sender<()>) {
        let (shutdown_sender, shutdown_receiver) = oneshot::channel::<()>();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let app = Router::new().route(
            "/api/v1/query",
            get(move |Query(params): Query<HashMap<String, String>>| {
                let body = body.clone();
                async move {
                    assert!(params["query"].contains("container_cpu_usage_seconds_total"));
                    Json(body)
                }
            }),
        );

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_receiver.await.ok();
                })
                .await
                .unwrap();
        });

        (addr, shutdown_sender)
    }

    fn metric_source(addr: SocketAddr) -> PrometheusMetricSource {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        PrometheusMetricSource::new(http_client, &format!("http://{}/", addr))
    }

    #[test]
    fn test_cpu_utilization_query() {
        let query = cpu_utilization_query("mongodb", "mongos", "5m");
        assert!(query.starts_with("100 * avg("));
        assert!(query.contains(
            "rate(container_cpu_usage_seconds_total{namespace=\"mongodb\",pod=~\"mongos-.*\",container!=\"POD\",container!=\"\"}[5m])"
        ));
        assert!(query.contains(
            "kube_pod_container_resource_requests{namespace=\"mongodb\",pod=~\"mongos-.*\",resource=\"cpu\"}"
        ));
    }

    #[tokio::test]
    async fn test_query_average() {
        let (addr, shutdown_sender) = spawn_server(serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [{ "metric": {}, "value": [1709294400.0, "82.5"] }]
            }
        }))
        .await;

        let value = metric_source(addr)
            .query_average("mongodb", "mongos", "5m")
            .await
            .unwrap();
        shutdown_sender.send(()).unwrap();

        assert_eq!(value, 82.5);
    }

    #[tokio::test]
    async fn test_query_average_no_data() {
        let (addr, shutdown_sender) = spawn_server(serde_json::json!({
            "status": "success",
            "data": { "resultType": "vector", "result": [] }
        }))
        .await;

        let result = metric_source(addr)
            .query_average("mongodb", "mongos", "5m")
            .await;
        shutdown_sender.send(()).unwrap();

        assert!(matches!(result, Err(Error::NoData { .. })));
    }

    #[tokio::test]
    async fn test_query_average_api_error() {
        let (addr, shutdown_sender) = spawn_server(serde_json::json!({
            "status": "error",
            "errorType": "bad_data",
            "error": "invalid parameter \"query\""
        }))
        .await;

        let result = metric_source(addr)
            .query_average("mongodb", "mongos", "5m")
            .await;
        shutdown_sender.send(()).unwrap();

        match result {
            Err(Error::PrometheusApi { error_type, .. }) => assert_eq!(error_type, "bad_data"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_query_average_unreachable() {
        // Bind and immediately release a port so nothing is listening on it.
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let result = metric_source(addr)
            .query_average("mongodb", "mongos", "5m")
            .await;

        assert!(matches!(result, Err(Error::HttpClient { .. })));
    }

    #[test]
    fn test_non_finite_sample_is_no_data() {
        let response: QueryResponse = serde_json::from_value(serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [{ "metric": {}, "value": [1709294400.0, "NaN"] }]
            }
        }))
        .unwrap();

        assert_eq!(response.into_value().unwrap(), None);
    }

    #[test]
    fn test_matrix_result_is_no_data() {
        let response: QueryResponse = serde_json::from_value(serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "matrix",
                "result": [{ "metric": {}, "values": [[1709294400.0, "82.5"]] }]
            }
        }))
        .unwrap();

        assert_eq!(response.into_value().unwrap(), None);
    }
}
