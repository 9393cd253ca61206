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
use crate::kubernetes::WorkloadHandle;
use crate::metrics::MetricSource;
use crate::resource::{AutoscalerSpec, AutoscalerStatus};
use crate::strategy::tolerance_band::ToleranceBandStrategy;
use crate::strategy::{AutoScalerStrategy, AutoScalerStrategyTrait, ScaleDirection};
use chrono::{DateTime, Utc};
use slog::{debug, error, info, warn, Logger};
use snafu::ResultExt;
use std::future::Future;
use std::time::Duration;

/// Requeue delay once a cycle has run to completion.
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(45);
/// Requeue delay after a recoverable failure.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(60);
/// Upper bound on any single external call.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Timing configuration for reconcile cycles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconcilerSettings {
    pub resync_interval: Duration,
    pub retry_interval: Duration,
    pub call_timeout: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            resync_interval: RESYNC_INTERVAL,
            retry_interval: RETRY_INTERVAL,
            call_timeout: CALL_TIMEOUT,
        }
    }
}

/// Result of one reconcile cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcileOutcome {
    /// Status to persist. Equal to the input status if the cycle aborted early.
    pub status: AutoscalerStatus,
    /// Replica count written to the workload this cycle, if any.
    pub workload_patch: Option<i32>,
    /// When to run the next cycle.
    pub requeue_after: Duration,
}

/// Run one reconcile cycle against the target workload.
///
/// Never fails: every external error ends the cycle early with the input
/// status and a retry delay, so the next cycle re-derives the decision from
/// live state.
pub async fn reconcile<W, M>(
    logger: &Logger,
    settings: &ReconcilerSettings,
    spec: &AutoscalerSpec,
    status: &AutoscalerStatus,
    now: DateTime<Utc>,
    workload: &W,
    metrics: &M,
) -> ReconcileOutcome
where
    W: WorkloadHandle + ?Sized,
    M: MetricSource + ?Sized,
{
    let target = &spec.target_ref;
    let retry_later = || ReconcileOutcome {
        status: status.clone(),
        workload_patch: None,
        requeue_after: settings.retry_interval,
    };

    // Get the current number of replicas.
    let current_replicas = match bounded(
        settings.call_timeout,
        "replica lookup",
        workload.get_replicas(&target.namespace, &target.name),
    )
    .await
    {
        Ok(current_replicas) => current_replicas,
        Err(err) => {
            warn!(logger, "Autoscaler skipping workload due to error retrieving replica count";
                "error" => format!("{}", err));
            return retry_later();
        }
    };

    // Pull the average cpu utilization of the workload's pods.
    let observed_metric = match bounded(
        settings.call_timeout,
        "metric query",
        metrics.query_average(&target.namespace, &target.name, &spec.policy.window),
    )
    .await
    {
        Ok(observed_metric) => observed_metric,
        Err(err) => {
            warn!(logger, "Autoscaler skipping workload due to no available metrics";
                "current_replicas" => current_replicas,
                "error" => format!("{}", err));
            return retry_later();
        }
    };

    // A negative interval (clock skew) counts as still cooling down.
    let since_last_scale = status
        .last_scale_time
        .map(|last_scale_time| now.signed_duration_since(last_scale_time));

    let strategy: AutoScalerStrategy =
        ToleranceBandStrategy::new(&spec.scale_bounds, &spec.policy).into();
    let decision = strategy.evaluate(current_replicas, observed_metric, since_last_scale);

    let mut new_status = AutoscalerStatus {
        last_observed_cpu: Some(AutoscalerStatus::format_metric(observed_metric)),
        ..status.clone()
    };
    let mut workload_patch = None;

    if decision.direction == ScaleDirection::Hold {
        info!(logger, "Workload does not require scaling";
            "aggregate_metric_value" => decision.observed_metric,
            "current_replicas" => decision.current_replicas,
            "seconds_since_last_scale" => since_last_scale.map(|elapsed| elapsed.num_seconds()));
    } else {
        info!(logger, "Scaling workload based on autoscaler policy";
            "aggregate_metric_value" => decision.observed_metric,
            "current_replicas" => decision.current_replicas,
            "desired_replicas" => decision.desired_replicas,
            "direction" => decision.direction.as_str());

        match bounded(
            settings.call_timeout,
            "replica update",
            workload.set_replicas(&target.namespace, &target.name, decision.desired_replicas),
        )
        .await
        {
            Ok(()) => {
                new_status.last_scale_time = Some(now);
                new_status.last_desired_replicas = Some(decision.desired_replicas);
                workload_patch = Some(decision.desired_replicas);
            }
            Err(err) => {
                // Leaving lastScaleTime alone lets the next cycle retry the action.
                error!(logger, "Autoscaler encountered error scaling workload";
                    "current_replicas" => current_replicas,
                    "desired_replicas" => decision.desired_replicas,
                    "error" => format!("{}", err));
            }
        }
    }

    debug!(logger, "Reconcile cycle complete";
        "requeue_after_seconds" => settings.resync_interval.as_secs());

    ReconcileOutcome {
        status: new_status,
        workload_patch,
        requeue_after: settings.resync_interval,
    }
}

/// Bound an external call by the configured timeout.
async fn bounded<T, F>(timeout: Duration, operation: &str, call: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .context(Timeout { operation })?
}
