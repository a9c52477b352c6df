//! Direct containerd API calls for what `ctr` cannot express.

use std::{collections::HashMap, path::Path};

use {
    containerd_client::{
        connect,
        services::v1::{
            Container, CreateContainerRequest,
            container::Runtime,
            containers_client::ContainersClient,
        },
    },
    prost_types::Any,
    tonic::{Request, metadata::AsciiMetadataValue},
    tracing::debug,
};

use crate::{
    error::{Error, Result},
    types::ContainerSpec,
};

const NAMESPACE_HEADER: &str = "containerd-namespace";
const OCI_SPEC_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1/Spec";
const DEFAULT_RUNTIME: &str = "io.containerd.runc.v2";

/// Register a container record that reuses an existing active snapshot.
///
/// `ctr containers create` always prepares a new snapshot from the image, so
/// restoring a version goes through the Containers service directly.
pub(crate) async fn create_with_snapshot(
    socket: &Path,
    namespace: &str,
    spec: &ContainerSpec,
    snapshot_key: &str,
) -> Result<()> {
    let Some(runtime_spec) = spec.runtime_spec.as_ref() else {
        return Err(Error::message(format!(
            "container {} has no OCI spec to reuse",
            spec.id
        )));
    };

    let channel = connect(socket)
        .await
        .map_err(|e| Error::external(format!("connect to {}", socket.display()), e))?;
    let mut client = ContainersClient::new(channel);

    let container = Container {
        id: spec.id.clone(),
        labels: spec
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<HashMap<_, _>>(),
        image: spec.image.clone(),
        runtime: Some(Runtime {
            name: DEFAULT_RUNTIME.to_string(),
            options: None,
        }),
        spec: Some(Any {
            type_url: OCI_SPEC_TYPE_URL.to_string(),
            value: serde_json::to_vec(runtime_spec)?,
        }),
        snapshotter: spec.snapshotter.clone(),
        snapshot_key: snapshot_key.to_string(),
        ..Default::default()
    };

    let mut request = Request::new(CreateContainerRequest {
        container: Some(container),
    });
    let ns: AsciiMetadataValue = namespace
        .parse()
        .map_err(|e| Error::external(format!("invalid namespace {namespace:?}"), e))?;
    request.metadata_mut().insert(NAMESPACE_HEADER, ns);

    debug!(container_id = %spec.id, snapshot_key, "creating container from snapshot");
    match client.create(request).await {
        Ok(_) => Ok(()),
        Err(status) if status.code() == tonic::Code::AlreadyExists => {
            Err(Error::already_exists("container", spec.id.clone()))
        },
        Err(status) => Err(status.into()),
    }
}
