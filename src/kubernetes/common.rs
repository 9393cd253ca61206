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
use crate::resource::FIELD_MANAGER;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::HashMap;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::{Mutex, PoisonError};

/// Replica count used by kubernetes when `spec.replicas` is unset.
const DEFAULT_REPLICAS: i32 = 1;

/// Access to the `scale` subresource of a namespaced workload kind.
///
/// Remembers the resource version of every scale it reads, so a later write
/// only succeeds if nobody else touched the workload in between.
pub(crate) struct ScaleSubresource<K> {
    kube_client: Client,
    observed_versions: Mutex<HashMap<(String, String), String>>,
    kind: PhantomData<fn() -> K>,
}

impl<K> ScaleSubresource<K>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    pub(crate) fn new(kube_client: Client) -> Self {
        Self {
            kube_client,
            observed_versions: Mutex::new(HashMap::new()),
            kind: PhantomData,
        }
    }

    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.kube_client.clone(), namespace)
    }

    /// Read the desired replica count.
    pub(crate) async fn replicas(&self, namespace: &str, name: &str) -> Result<i32, Error> {
        let scale = self
            .api(namespace)
            .get_scale(name)
            .await
            .map_err(|err| workload_error(err, namespace, name))?;

        if let Some(resource_version) = scale.metadata.resource_version {
            self.observed_versions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert((namespace.into(), name.into()), resource_version);
        }

        Ok(scale
            .spec
            .and_then(|spec| spec.replicas)
            .unwrap_or(DEFAULT_REPLICAS))
    }

    /// Write the desired replica count.
    pub(crate) async fn scale(&self, namespace: &str, name: &str, replicas: i32) -> Result<(), Error> {
        let resource_version = self
            .observed_versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(namespace.to_string(), name.to_string()));

        let patch = match resource_version {
            Some(resource_version) => json!({
                "metadata": { "resourceVersion": resource_version },
                "spec": { "replicas": replicas }
            }),
            None => json!({
                "spec": { "replicas": replicas }
            }),
        };

        let patch_params = PatchParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..Default::default()
        };
        self.api(namespace)
            .patch_scale(name, &patch_params, &Patch::Merge(&patch))
            .await
            .map_err(|err| workload_error(err, namespace, name))?;

        Ok(())
    }
}

/// Map kubernetes api failures onto the workload error taxonomy.
pub(crate) fn workload_error(err: kube::Error, namespace: &str, name: &str) -> Error {
    match err {
        kube::Error::Api(response) if response.code == 404 => Error::WorkloadNotFound {
            namespace: namespace.into(),
            name: name.into(),
        },
        kube::Error::Api(response) if response.code == 409 => Error::Conflict {
            namespace: namespace.into(),
            name: name.into(),
        },
        source => Error::Kube { source },
    }
}
