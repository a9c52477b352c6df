//! `ctr` invocation and output parsing.

use std::{
    collections::BTreeMap,
    ffi::{OsStr, OsString},
    path::PathBuf,
    process::Output,
};

use {serde::Deserialize, tokio::process::Command, tracing::debug};

use crate::{
    error::{Error, Result},
    platform::HostPlatform,
    types::{
        BindMount, ContainerInfo, ImageInfo, MountDescriptor, SnapshotInfo, SnapshotKind,
        TaskInfo, TaskState,
    },
};

#[derive(Debug, Clone)]
pub(crate) struct Ctr {
    pub(crate) bin: String,
    pub(crate) address: PathBuf,
    pub(crate) namespace: String,
    pub(crate) platform: HostPlatform,
}

impl Ctr {
    /// `ctr --address <a> --namespace <ns>` with the platform prefix applied.
    pub(crate) fn command(&self) -> Command {
        let mut cmd = self.platform.command(&self.bin);
        cmd.arg("--address")
            .arg(&self.address)
            .arg("--namespace")
            .arg(&self.namespace)
            .kill_on_drop(true);
        cmd
    }

    /// Run and return stdout, mapping failures to typed errors.
    pub(crate) async fn run<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        let output = self.command().args(&args).output().await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        Err(self.classify(&args, &output))
    }

    pub(crate) fn classify(&self, args: &[OsString], output: &Output) -> Error {
        let raw = String::from_utf8_lossy(&output.stderr);
        let (vm_lines, stderr) = self.platform.split_stderr(&raw);
        let stderr = stderr.trim().to_string();
        let subcommand = args
            .iter()
            .take(2)
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        debug!(%subcommand, %stderr, vm = ?vm_lines, "ctr failed");

        if stderr.is_empty() && !vm_lines.is_empty() {
            return Error::vm(vm_lines.join("\n"));
        }
        let target = args
            .last()
            .map(|a| a.to_string_lossy().into_owned())
            .unwrap_or_default();
        let lower = stderr.to_ascii_lowercase();
        if lower.contains("not found") || lower.contains("no such") {
            return Error::not_found(kind_of(&subcommand), target);
        }
        if lower.contains("already exists") {
            return Error::already_exists(kind_of(&subcommand), target);
        }
        Error::Command {
            program: self.bin.clone(),
            subcommand,
            code: output.status.code(),
            stderr,
        }
    }
}

fn kind_of(subcommand: &str) -> &'static str {
    match subcommand.split_whitespace().next() {
        Some("images" | "image" | "i") => "image",
        Some("containers" | "container" | "c") => "container",
        Some("tasks" | "task" | "t") => "task",
        Some("snapshots" | "snapshot") => "snapshot",
        _ => "object",
    }
}

/// Label filter understood by `ctr containers ls`.
pub(crate) fn label_filter(key: &str, value: &str) -> String {
    format!("labels.\"{key}\"=={value}")
}

/// `--mount` value for a bind mount.
pub(crate) fn bind_mount_arg(mount: &BindMount) -> String {
    let mode = if mount.read_only { "ro" } else { "rw" };
    format!(
        "type=bind,src={},dst={},options=rbind:{mode}",
        mount.source.display(),
        mount.destination
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawContainer {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    image: String,
    #[serde(default)]
    snapshotter: String,
    #[serde(default)]
    snapshot_key: String,
    #[serde(default)]
    spec: Option<serde_json::Value>,
}

/// Parse `ctr containers info <id>` JSON.
pub(crate) fn parse_container_info(raw: &str) -> Result<ContainerInfo> {
    let c: RawContainer = serde_json::from_str(raw)?;
    let (mounts, command) = match &c.spec {
        Some(spec) => (spec_bind_mounts(spec), spec_args(spec)),
        None => (Vec::new(), Vec::new()),
    };
    Ok(ContainerInfo {
        id: c.id,
        image: c.image,
        snapshotter: c.snapshotter,
        snapshot_key: c.snapshot_key,
        labels: c.labels.unwrap_or_default(),
        mounts,
        command,
        runtime_spec: c.spec,
    })
}

fn spec_bind_mounts(spec: &serde_json::Value) -> Vec<BindMount> {
    let Some(mounts) = spec.get("mounts").and_then(|m| m.as_array()) else {
        return Vec::new();
    };
    mounts
        .iter()
        .filter(|m| m.get("type").and_then(|t| t.as_str()) == Some("bind"))
        .filter_map(|m| {
            let source = m.get("source")?.as_str()?;
            let destination = m.get("destination")?.as_str()?;
            let read_only = m
                .get("options")
                .and_then(|o| o.as_array())
                .is_some_and(|opts| opts.iter().any(|o| o.as_str() == Some("ro")));
            Some(BindMount {
                source: PathBuf::from(source),
                destination: destination.to_string(),
                read_only,
            })
        })
        .collect()
}

fn spec_args(spec: &serde_json::Value) -> Vec<String> {
    spec.pointer("/process/args")
        .and_then(|a| a.as_array())
        .map(|args| {
            args.iter()
                .filter_map(|a| a.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

/// Parse `ctr tasks ls` (`TASK PID STATUS`).
pub(crate) fn parse_tasks(raw: &str) -> Vec<TaskInfo> {
    raw.lines()
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let container_id = cols.next()?.to_string();
            let pid = cols.next()?.parse::<u32>().ok().filter(|p| *p > 0);
            let state = TaskState::parse(cols.next()?);
            Some(TaskInfo {
                container_id,
                pid,
                state,
            })
        })
        .collect()
}

/// Parse `ctr snapshots ls` (`KEY PARENT KIND`, parent may be blank).
pub(crate) fn parse_snapshots(raw: &str) -> Vec<SnapshotInfo> {
    raw.lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let (key, parent, kind) = match cols.as_slice() {
                [key, parent, kind] => (*key, Some((*parent).to_string()), *kind),
                [key, kind] => (*key, None, *kind),
                _ => return None,
            };
            Some(SnapshotInfo {
                key: key.to_string(),
                parent,
                kind: SnapshotKind::parse(kind)?,
            })
        })
        .collect()
}

/// Parse the `mount -t <type> <source> <target> -o <opts>` lines printed by
/// `ctr snapshots mounts`.
pub(crate) fn parse_mount_commands(raw: &str) -> Vec<MountDescriptor> {
    raw.lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            if tokens.next()? != "mount" {
                return None;
            }
            let mut fs_type = None;
            let mut options = Vec::new();
            let mut positional = Vec::new();
            while let Some(tok) = tokens.next() {
                match tok {
                    "-t" => fs_type = tokens.next().map(String::from),
                    "-o" => {
                        if let Some(opts) = tokens.next() {
                            options = opts.split(',').map(String::from).collect();
                        }
                    },
                    other => positional.push(other.to_string()),
                }
            }
            Some(MountDescriptor {
                fs_type: fs_type?,
                source: positional.into_iter().next()?,
                options,
            })
        })
        .collect()
}

/// Parse `ctr images ls` (`REF TYPE DIGEST ...`).
pub(crate) fn parse_images(raw: &str) -> Vec<ImageInfo> {
    raw.lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let reference = (*cols.first()?).to_string();
            Some(ImageInfo {
                reference,
                digest: cols.get(2).map(|d| (*d).to_string()),
            })
        })
        .collect()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_container_info_with_spec() {
        let raw = r#"{
            "ID": "botbox-t1",
            "Labels": {"botbox.bot-id": "t1"},
            "Image": "docker.io/library/debian:bookworm-slim",
            "Runtime": {"Name": "io.containerd.runc.v2"},
            "SnapshotKey": "botbox-t1",
            "Snapshotter": "overlayfs",
            "Spec": {
                "ociVersion": "1.1.0",
                "process": {"args": ["sleep", "infinity"]},
                "mounts": [
                    {"destination": "/proc", "type": "proc", "source": "proc"},
                    {"destination": "/data", "type": "bind", "source": "/srv/bots/t1",
                     "options": ["rbind", "rw"]},
                    {"destination": "/etc/resolv.conf", "type": "bind",
                     "source": "/etc/resolv.conf", "options": ["rbind", "ro"]}
                ]
            }
        }"#;
        let info = parse_container_info(raw).unwrap();
        assert_eq!(info.bot_id(), Some("t1"));
        assert_eq!(info.snapshot_key, "botbox-t1");
        assert_eq!(info.command, vec!["sleep", "infinity"]);
        assert_eq!(info.mounts.len(), 2);
        assert!(!info.mounts[0].read_only);
        assert!(info.mounts[1].read_only);
        assert!(info.runtime_spec.is_some());
    }

    #[test]
    fn parses_container_info_without_labels() {
        let info = parse_container_info(r#"{"ID":"c","Labels":null}"#).unwrap();
        assert!(info.labels.is_empty());
        assert!(info.mounts.is_empty());
    }

    #[test]
    fn parses_tasks_table() {
        let raw = "TASK        PID     STATUS\nbotbox-t1   4242    RUNNING\nbotbox-t2   0       STOPPED\n";
        let tasks = parse_tasks(raw);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].pid, Some(4242));
        assert!(tasks[0].is_running());
        assert_eq!(tasks[1].pid, None);
        assert_eq!(tasks[1].state, TaskState::Stopped);
    }

    #[test]
    fn parses_snapshots_with_and_without_parent() {
        let raw = "KEY                 PARENT          KIND\nsha256:base                         Committed\nbotbox-t1   sha256:base     Active\n";
        let snaps = parse_snapshots(raw);
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].parent, None);
        assert_eq!(snaps[0].kind, SnapshotKind::Committed);
        assert_eq!(snaps[1].parent.as_deref(), Some("sha256:base"));
        assert_eq!(snaps[1].kind, SnapshotKind::Active);
    }

    #[test]
    fn parses_overlay_mount_command() {
        let raw = "mount -t overlay overlay /tmp/target -o index=off,workdir=/w,upperdir=/u,lowerdir=/l\n";
        let mounts = parse_mount_commands(raw);
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].fs_type, "overlay");
        assert_eq!(mounts[0].source, "overlay");
        assert_eq!(mounts[0].options, vec!["index=off", "workdir=/w", "upperdir=/u", "lowerdir=/l"]);
    }

    #[test]
    fn parses_bind_mount_command() {
        let mounts = parse_mount_commands("mount -t bind /snap/5/fs /tmp/target -o rbind,rw\n");
        assert_eq!(mounts[0].fs_type, "bind");
        assert_eq!(mounts[0].source, "/snap/5/fs");
    }

    #[test]
    fn parses_images_table() {
        let raw = "REF TYPE DIGEST SIZE PLATFORMS LABELS\ndocker.io/library/debian:bookworm-slim application/vnd.oci.image.index.v1+json sha256:abc 28.2 MiB linux/amd64 -\n";
        let images = parse_images(raw);
        assert_eq!(images[0].reference, "docker.io/library/debian:bookworm-slim");
        assert_eq!(images[0].digest.as_deref(), Some("sha256:abc"));
    }

    #[test]
    fn formats_filters_and_mounts() {
        assert_eq!(label_filter("botbox.bot-id", "t1"), "labels.\"botbox.bot-id\"==t1");
        assert_eq!(
            bind_mount_arg(&BindMount::read_only("/etc/resolv.conf", "/etc/resolv.conf")),
            "type=bind,src=/etc/resolv.conf,dst=/etc/resolv.conf,options=rbind:ro"
        );
    }
}
