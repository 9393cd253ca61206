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
use crate::kubernetes::common::ScaleSubresource;
use crate::kubernetes::WorkloadHandle;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::Client;

/// Kubernetes StatefulSet related functions.
pub struct KubernetesStatefulSetWorkload {
    scale: ScaleSubresource<StatefulSet>,
}

impl KubernetesStatefulSetWorkload {
    pub fn new(kube_client: Client) -> Self {
        Self {
            scale: ScaleSubresource::new(kube_client),
        }
    }
}

#[async_trait]
impl WorkloadHandle for KubernetesStatefulSetWorkload {
    async fn get_replicas(&self, namespace: &str, name: &str) -> Result<i32, Error> {
        self.scale.replicas(namespace, name).await
    }

    async fn set_replicas(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), Error> {
        self.scale.scale(namespace, name, replicas).await
    }
}
