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
use crate::resource::{AutoscalerStatus, MongoRouterAutoscaler, FIELD_MANAGER};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use snafu::ResultExt;

/// Write the observed status of an autoscaler through its status subresource.
pub async fn persist_status(
    kube_client: Client,
    namespace: &str,
    name: &str,
    status: &AutoscalerStatus,
) -> Result<(), Error> {
    let patch = json!({ "status": status });
    let patch_params = PatchParams {
        field_manager: Some(FIELD_MANAGER.into()),
        ..Default::default()
    };

    Api::<MongoRouterAutoscaler>::namespaced(kube_client, namespace)
        .patch_status(name, &patch_params, &Patch::Merge(&patch))
        .await
        .context(Kube {})?;
    Ok(())
}
