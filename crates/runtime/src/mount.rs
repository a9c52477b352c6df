//! Mount a container's snapshot on the host.

use std::path::Path;

use {tempfile::TempDir, tracing::{debug, warn}};

use crate::{
    error::{Context, Error, Result},
    service::RuntimeService,
    types::MountDescriptor,
};

/// A snapshot mounted under a temporary directory.
///
/// Dropping it unmounts and removes the directory; call [`release`] to see
/// the unmount error instead of only logging it. The directory is only
/// removed once every layer is unmounted; otherwise it is left in place.
///
/// [`release`]: MountedSnapshot::release
#[derive(Debug)]
pub struct MountedSnapshot {
    dir: Option<TempDir>,
    layers: usize,
}

impl MountedSnapshot {
    #[must_use]
    pub fn path(&self) -> &Path {
        match &self.dir {
            Some(dir) => dir.path(),
            None => Path::new(""),
        }
    }

    pub fn release(mut self) -> Result<()> {
        self.unmount_all(unmount)
    }

    fn unmount_all(&mut self, mut unmount: impl FnMut(&Path) -> Result<()>) -> Result<()> {
        let Some(dir) = self.dir.as_ref() else {
            return Ok(());
        };
        while self.layers > 0 {
            unmount(dir.path())?;
            self.layers -= 1;
        }
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            dir.close()
                .with_context(|| format!("removing mount directory {}", path.display()))?;
        }
        Ok(())
    }
}

impl Drop for MountedSnapshot {
    fn drop(&mut self) {
        if let Err(e) = self.unmount_all(unmount) {
            // Still mounted: deleting the directory would walk into the
            // snapshot contents.
            if let Some(dir) = self.dir.take() {
                let path = dir.keep();
                warn!(path = %path.display(), layers = self.layers, error = %e, "snapshot still mounted, leaving mount directory in place");
            }
        }
    }
}

/// Mount the active snapshot backing `container_id`.
pub async fn mount_container_snapshot(
    runtime: &dyn RuntimeService,
    container_id: &str,
) -> Result<MountedSnapshot> {
    let info = runtime.get_container(container_id).await?;
    mount_snapshot(runtime, &info.snapshotter, &info.snapshot_key).await
}

pub async fn mount_snapshot(
    runtime: &dyn RuntimeService,
    snapshotter: &str,
    key: &str,
) -> Result<MountedSnapshot> {
    let mounts = runtime.snapshot_mounts(snapshotter, key).await?;
    let dir = tempfile::Builder::new()
        .prefix("botbox-mount-")
        .tempdir()
        .context("creating mount directory")?;
    let mut mounted = MountedSnapshot {
        dir: Some(dir),
        layers: 0,
    };
    for m in &mounts {
        // On failure `mounted` drops and undoes the layers mounted so far.
        mount_one(m, mounted.path())?;
        mounted.layers += 1;
    }
    debug!(snapshot = key, target = %mounted.path().display(), layers = mounted.layers, "snapshot mounted");
    Ok(mounted)
}

#[cfg(target_os = "linux")]
fn mount_one(m: &MountDescriptor, target: &Path) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for opt in &m.options {
        match opt.as_str() {
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" => {},
            "bind" => flags |= MsFlags::MS_BIND,
            "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            other => data.push(other),
        }
    }
    if m.fs_type == "bind" {
        flags |= MsFlags::MS_BIND;
    }
    let data = data.join(",");
    let data = (!data.is_empty()).then_some(data.as_str());

    mount(
        Some(m.source.as_str()),
        target,
        Some(m.fs_type.as_str()),
        flags,
        data,
    )
    .map_err(|e| {
        Error::external(
            format!("mount {} ({}) at {}", m.source, m.fs_type, target.display()),
            e,
        )
    })
}

#[cfg(not(target_os = "linux"))]
fn mount_one(_m: &MountDescriptor, _target: &Path) -> Result<()> {
    Err(Error::not_supported("host", "mount snapshot"))
}

#[cfg(target_os = "linux")]
fn unmount(target: &Path) -> Result<()> {
    use nix::mount::{MntFlags, umount2};

    umount2(target, MntFlags::MNT_DETACH)
        .map_err(|e| Error::external(format!("unmount {}", target.display()), e))
}

#[cfg(not(target_os = "linux"))]
fn unmount(_target: &Path) -> Result<()> {
    Ok(())
}
