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
use crate::kubernetes::autoscaler::persist_status;
use crate::kubernetes::{KubernetesWorkload, WorkloadHandle};
use crate::metrics::{MetricSource, PrometheusMetricSource};
use crate::reconciler::{reconcile, ReconcilerSettings};
use crate::resource::{AutoscalerSpec, AutoscalerStatus, MongoRouterAutoscaler, WorkloadKind};
use crate::timer::RequeueTimer;
use async_trait::async_trait;
use chrono::Utc;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use kube::{Client, ResourceExt};
use slog::{debug, error, info, o, warn, Logger};
use snafu::ResultExt;
use std::collections::HashMap;
use std::time::Duration;
use stream_cancel::{Trigger, Tripwire};

/// Everything an autoscaler task talks to outside of itself.
#[async_trait]
pub trait AutoscalerBackend: Clone + Send + Sync + 'static {
    type Workload: WorkloadHandle + Send + Sync;
    type Metrics: MetricSource + Send + Sync;

    /// Replica access for the target workload.
    fn workload(&self, kind: WorkloadKind) -> Self::Workload;
    /// Metric source at the given base url.
    fn metrics(&self, url: &str) -> Self::Metrics;
    /// Write the status of an autoscaler resource.
    async fn persist_status(
        &self,
        namespace: &str,
        name: &str,
        status: &AutoscalerStatus,
    ) -> Result<(), Error>;
}

/// Shared kubernetes and prometheus clients.
#[derive(Clone)]
pub struct ControllerContext {
    pub kube_client: Client,
    pub http_client: reqwest::Client,
}

#[async_trait]
impl AutoscalerBackend for ControllerContext {
    type Workload = KubernetesWorkload;
    type Metrics = PrometheusMetricSource;

    fn workload(&self, kind: WorkloadKind) -> KubernetesWorkload {
        KubernetesWorkload::new(self.kube_client.clone(), kind)
    }

    fn metrics(&self, url: &str) -> PrometheusMetricSource {
        PrometheusMetricSource::new(self.http_client.clone(), url)
    }

    async fn persist_status(
        &self,
        namespace: &str,
        name: &str,
        status: &AutoscalerStatus,
    ) -> Result<(), Error> {
        persist_status(self.kube_client.clone(), namespace, name, status).await
    }
}

/// Handle for a running autoscaler task. Dropping it stops the task.
pub struct AutoscalerTask {
    updates: UnboundedSender<AutoscalerSpec>,
    uid: Option<String>,
    generation: Option<i64>,
    _shutdown: Trigger,
}

/// Status as last computed, and as last accepted by the api server.
#[derive(Clone, Debug, Default, PartialEq)]
struct StatusState {
    current: AutoscalerStatus,
    persisted: AutoscalerStatus,
}

impl StatusState {
    fn new(status: AutoscalerStatus) -> Self {
        Self {
            current: status.clone(),
            persisted: status,
        }
    }
}

/// Task map key of an autoscaler, `None` for cluster scoped objects.
pub fn autoscaler_key(autoscaler: &MongoRouterAutoscaler) -> Option<String> {
    autoscaler
        .namespace()
        .map(|namespace| format!("{}/{}", namespace, autoscaler.name_any()))
}

/// Start a task for a new autoscaler, or hand a changed spec to the existing one.
pub fn upsert_task<B: AutoscalerBackend>(
    logger: &Logger,
    backend: &B,
    settings: &ReconcilerSettings,
    tasks: &mut HashMap<String, AutoscalerTask>,
    autoscaler: MongoRouterAutoscaler,
) {
    let Some(key) = autoscaler_key(&autoscaler) else {
        warn!(logger, "Ignoring autoscaler without a namespace";
            "autoscaler_name" => autoscaler.name_any());
        return;
    };
    let task_logger = logger.new(o!(
        "autoscaler_namespace" => autoscaler.namespace().unwrap_or_default(),
        "autoscaler_name" => autoscaler.name_any()));

    match tasks.get_mut(&key) {
        // A recreated object shares the key but none of the old state.
        Some(task) if task.uid != autoscaler.metadata.uid => {
            info!(task_logger, "Replacing recreated autoscaler");
        }
        Some(task) => {
            // Status writes don't bump the generation, only spec changes do.
            if task.generation == autoscaler.metadata.generation {
                return;
            }
            info!(task_logger, "Modified autoscaler");
            task.generation = autoscaler.metadata.generation;
            if task.updates.unbounded_send(autoscaler.spec.clone()).is_ok() {
                return;
            }
            warn!(task_logger, "Restarting stopped autoscaler task");
        }
        None => info!(task_logger, "Added autoscaler"),
    }

    // Replacing a handle drops its trigger, which stops the old task.
    tasks.insert(
        key,
        autoscaler_loop(task_logger, backend.clone(), *settings, autoscaler),
    );
}

/// Spawn the task that reconciles one autoscaler until its handle is dropped.
///
/// Cycles for one autoscaler never overlap: the task runs them one at a time.
pub fn autoscaler_loop<B: AutoscalerBackend>(
    logger: Logger,
    backend: B,
    settings: ReconcilerSettings,
    autoscaler: MongoRouterAutoscaler,
) -> AutoscalerTask {
    // Create a channel for receiving updated autoscaler specifications.
    let (update_sender, mut update_receiver) = unbounded::<AutoscalerSpec>();
    let (shutdown, tripwire) = Tripwire::new();

    let uid = autoscaler.metadata.uid.clone();
    let generation = autoscaler.metadata.generation;
    let namespace = autoscaler.namespace().unwrap_or_default();
    let name = autoscaler.name_any();
    let mut spec = autoscaler.spec;
    let mut state = StatusState::new(autoscaler.status.unwrap_or_default());

    tokio::spawn(async move {
        let mut timer = RequeueTimer::new(settings.resync_interval);
        debug!(logger, "Starting autoscaler task");

        loop {
            tokio::select! {
                biased;

                _ = tripwire.clone() => break,
                update = update_receiver.next() => match update {
                    Some(updated_spec) => {
                        debug!(logger, "Received autoscaler update event");
                        spec = updated_spec;
                        timer.fire_now();
                    }
                    None => break,
                },
                _ = timer.next() => {
                    // Dropping an in-flight cycle aborts its external calls and skips the status write.
                    tokio::select! {
                        biased;

                        _ = tripwire.clone() => break,
                        requeue_after = reconciliation_cycle(
                            &logger, &backend, &settings, &namespace, &name, &spec, &mut state,
                        ) => timer.requeue_after(requeue_after),
                    }
                }
            }
        }

        debug!(logger, "Stopped autoscaler task");
    });

    AutoscalerTask {
        updates: update_sender,
        uid,
        generation,
        _shutdown: shutdown,
    }
}

/// Validate, reconcile and persist the status of one autoscaler.
async fn reconciliation_cycle<B: AutoscalerBackend>(
    logger: &Logger,
    backend: &B,
    settings: &ReconcilerSettings,
    namespace: &str,
    name: &str,
    spec: &AutoscalerSpec,
    state: &mut StatusState,
) -> Duration {
    if let Err(err) = spec.validate() {
        error!(logger, "Autoscaler has an invalid specification"; "error" => format!("{}", err));
        return settings.retry_interval;
    }

    let workload = backend.workload(spec.target_ref.kind);
    let metrics = backend.metrics(&spec.prometheus.url);
    let target_logger = logger.new(o!(
        "target_namespace" => spec.target_ref.namespace.clone(),
        "target_name" => spec.target_ref.name.clone()));

    let outcome = reconcile(
        &target_logger,
        settings,
        spec,
        &state.current,
        Utc::now(),
        &workload,
        &metrics,
    )
    .await;

    if let Some(replicas) = outcome.workload_patch {
        debug!(target_logger, "Workload replicas patched"; "replicas" => replicas);
    }
    state.current = outcome.status;

    if state.current != state.persisted {
        let persisted = tokio::time::timeout(
            settings.call_timeout,
            backend.persist_status(namespace, name, &state.current),
        )
        .await
        .context(Timeout {
            operation: "status update",
        })
        .and_then(|result| result);

        match persisted {
            Ok(()) => state.persisted = state.current.clone(),
            Err(err) => {
                // Still differs from the persisted copy, so the next cycle writes it again.
                warn!(logger, "Failed to persist autoscaler status"; "error" => format!("{}", err));
            }
        }
    }

    outcome.requeue_after
}
