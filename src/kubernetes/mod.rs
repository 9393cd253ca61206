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
use crate::kubernetes::deployment::KubernetesDeploymentWorkload;
use crate::kubernetes::statefulset::KubernetesStatefulSetWorkload;
use crate::resource::WorkloadKind;
use async_trait::async_trait;
use enum_dispatch::enum_dispatch;
use kube::Client;

pub mod autoscaler;
mod common;
pub mod deployment;
pub mod statefulset;

/// Scalable kubernetes workloads.
#[enum_dispatch]
pub enum KubernetesWorkload {
    /// An apps/v1 Deployment.
    Deployment(KubernetesDeploymentWorkload),
    /// An apps/v1 StatefulSet.
    StatefulSet(KubernetesStatefulSetWorkload),
}

impl KubernetesWorkload {
    /// Construct a handle for the given workload kind.
    pub fn new(kube_client: Client, kind: WorkloadKind) -> Self {
        match kind {
            WorkloadKind::Deployment => KubernetesDeploymentWorkload::new(kube_client).into(),
            WorkloadKind::StatefulSet => KubernetesStatefulSetWorkload::new(kube_client).into(),
        }
    }
}

/// Reads and writes the replica count of a named workload.
#[async_trait]
#[enum_dispatch(KubernetesWorkload)]
pub trait WorkloadHandle {
    /// The current number of replicas.
    async fn get_replicas(&self, namespace: &str, name: &str) -> Result<i32, Error>;
    /// Update the number of replicas. Fails with a conflict if the workload
    /// changed since it was last read through this handle.
    async fn set_replicas(&self, namespace: &str, name: &str, replicas: i32)
        -> Result<(), Error>;
}
