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
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::ensure;

/// Name used as the field manager for every write we make.
pub const FIELD_MANAGER: &str = "routerscaler";

/// Kubernetes resource kind of the scaling target.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum WorkloadKind {
    #[default]
    Deployment,
    StatefulSet,
}

/// The scalable workload an autoscaler manages.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    /// Workload name. Pods are matched by the `<name>-` prefix.
    pub name: String,
    /// Workload namespace.
    pub namespace: String,
    /// Workload kind, defaults to Deployment.
    #[serde(default)]
    pub kind: WorkloadKind,
}

/// Maximum and minimum number of replicas.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScaleBounds {
    /// Minimum allowed number of replicas.
    pub min_replicas: i32,
    /// Maximum allowed number of replicas.
    pub max_replicas: i32,
}

/// Scaling policy.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Desired average CPU utilization, as a percentage of requested CPU.
    pub cpu_target_percent: i32,
    /// Half width of the band around the target in which nothing happens.
    pub tolerance_percent: i32,
    /// Prometheus range selector for the rate window, eg. `5m`.
    pub window: String,
    /// Maximum replica change per scaling action.
    pub step: i32,
    /// Minimum time between two scaling actions (seconds).
    pub cooldown_seconds: i64,
}

/// Prometheus connection configuration.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct MetricsEndpoint {
    /// Base url of the Prometheus HTTP API.
    pub url: String,
}

/// Router autoscaler resource specification.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[kube(
    group = "autoscale.mongodb.io",
    version = "v1alpha1",
    kind = "MongoRouterAutoscaler",
    plural = "mongorouterautoscalers",
    shortname = "mra",
    status = "AutoscalerStatus",
    namespaced,
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.targetRef.name"}"#,
    printcolumn = r#"{"name":"CPU","type":"string","jsonPath":".status.lastObservedCPU"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.lastDesiredReplicas"}"#,
    printcolumn = r#"{"name":"Last Scale","type":"date","jsonPath":".status.lastScaleTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerSpec {
    /// The workload to scale.
    pub target_ref: TargetRef,
    /// Replica limits.
    pub scale_bounds: ScaleBounds,
    /// Scaling policy.
    pub policy: Policy,
    /// Metrics source.
    pub prometheus: MetricsEndpoint,
}

/// Observed state, written only by the reconciler.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerStatus {
    /// When the workload was last scaled by us.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scale_time: Option<DateTime<Utc>>,
    /// Most recently observed average CPU percentage.
    #[serde(
        default,
        rename = "lastObservedCPU",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_observed_cpu: Option<String>,
    /// Replica count set by the last scaling action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_desired_replicas: Option<i32>,
}

impl AutoscalerStatus {
    /// Decimal representation used for `lastObservedCPU`.
    pub fn format_metric(value: f64) -> String {
        format!("{:.6}", value)
    }
}

impl AutoscalerSpec {
    /// Reject specs the scaling policy cannot be evaluated against.
    pub fn validate(&self) -> Result<(), Error> {
        let bounds = &self.scale_bounds;
        let policy = &self.policy;

        ensure!(
            !self.target_ref.name.is_empty() && !self.target_ref.namespace.is_empty(),
            InvalidSpec {
                reason: "targetRef name and namespace are required"
            }
        );
        ensure!(
            bounds.min_replicas >= 0,
            InvalidSpec {
                reason: format!("minReplicas {} is negative", bounds.min_replicas)
            }
        );
        ensure!(
            bounds.min_replicas <= bounds.max_replicas,
            InvalidSpec {
                reason: format!(
                    "minReplicas {} exceeds maxReplicas {}",
                    bounds.min_replicas, bounds.max_replicas
                )
            }
        );
        ensure!(
            policy.step >= 1,
            InvalidSpec {
                reason: format!("step {} must be at least 1", policy.step)
            }
        );
        ensure!(
            policy.tolerance_percent >= 0,
            InvalidSpec {
                reason: format!("tolerancePercent {} is negative", policy.tolerance_percent)
            }
        );
        ensure!(
            policy.cooldown_seconds >= 0,
            InvalidSpec {
                reason: format!("cooldownSeconds {} is negative", policy.cooldown_seconds)
            }
        );
        match humantime::parse_duration(&policy.window) {
            Ok(window) if !window.is_zero() => (),
            _ => {
                return InvalidSpec {
                    reason: format!("window {:?} is not a positive duration", policy.window),
                }
                .fail()
            }
        }
        ensure!(
            !self.prometheus.url.is_empty(),
            InvalidSpec {
                reason: "prometheus url is required"
            }
        );

        Ok(())
    }
}
