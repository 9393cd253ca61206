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

use snafu::Snafu;

/// Router autoscaler errors.
///
/// Apart from start-up failures, every variant is recoverable: the reconcile
/// cycle that hit it ends early and the next cycle retries from live state.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    /// General HTTP client errors.
    #[snafu(display("http client error: {}", source))]
    HttpClient { source: reqwest::Error },

    /// YAML serialization errors.
    #[snafu(display("yaml serialization error: {}", source))]
    YamlSerialization { source: serde_yaml::Error },

    /// Kubernetes API related errors.
    #[snafu(display("kubernetes error: {}", source))]
    Kube { source: kube::Error },

    /// The target workload does not exist.
    #[snafu(display("workload {}/{} not found", namespace, name))]
    WorkloadNotFound { namespace: String, name: String },

    /// Optimistic concurrency failure writing the replica count.
    #[snafu(display("conflicting update to workload {}/{}", namespace, name))]
    Conflict { namespace: String, name: String },

    /// Prometheus answered the query with an error.
    #[snafu(display("prometheus query error ({}): {}", error_type, message))]
    PrometheusApi { error_type: String, message: String },

    /// Prometheus returned no usable sample.
    #[snafu(display("no metric data for {}/{}", namespace, name))]
    NoData { namespace: String, name: String },

    /// An external call exceeded the configured call timeout.
    #[snafu(display("timed out during {}", operation))]
    Timeout {
        operation: String,
        source: tokio::time::error::Elapsed,
    },

    /// The autoscaler resource failed validation.
    #[snafu(display("invalid autoscaler spec: {}", reason))]
    InvalidSpec { reason: String },
}
