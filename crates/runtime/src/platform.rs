//! Where runtime commands actually execute.
//!
//! On Linux hosts `ctr` and network plugins run directly. On hosts that reach
//! the runtime through a Linux VM, every privileged command is wrapped in the
//! configured VM shell and `sudo`, and the shell's own diagnostics have to be
//! separated from the command's stderr.

use std::{ffi::OsStr, process::Output};

use {
    botbox_config::VmConfig,
    tokio::process::Command,
    tracing::debug,
};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub enum HostPlatform {
    Direct,
    VmDelegated(VmShell),
}

impl HostPlatform {
    #[must_use]
    pub fn from_config(vm: &VmConfig) -> Self {
        if vm.is_active() && !vm.shell.is_empty() {
            Self::VmDelegated(VmShell::from_config(vm))
        } else {
            Self::Direct
        }
    }

    #[must_use]
    pub fn is_vm(&self) -> bool {
        matches!(self, Self::VmDelegated(_))
    }

    /// A command running `program` with the privileges the runtime needs.
    #[must_use]
    pub fn command(&self, program: &str) -> Command {
        match self {
            Self::Direct => Command::new(program),
            Self::VmDelegated(vm) => vm.privileged(program),
        }
    }

    /// Split captured stderr into VM tool diagnostics and the command's own
    /// stderr. Direct execution has no VM lines.
    #[must_use]
    pub fn split_stderr(&self, stderr: &str) -> (Vec<String>, String) {
        match self {
            Self::Direct => (Vec::new(), stderr.to_string()),
            Self::VmDelegated(vm) => vm.split_stderr(stderr),
        }
    }
}

/// Argv prefix that runs commands inside the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmShell {
    shell: Vec<String>,
    cli: String,
    error_prefix: String,
}

impl VmShell {
    #[must_use]
    pub fn from_config(vm: &VmConfig) -> Self {
        Self {
            shell: vm.shell.clone(),
            cli: vm.cli.clone(),
            error_prefix: vm.error_prefix.clone(),
        }
    }

    /// `<shell...> sudo <program>`; append further args on the result.
    #[must_use]
    pub fn privileged(&self, program: &str) -> Command {
        let (head, rest) = match self.shell.split_first() {
            Some((head, rest)) => (head.as_str(), rest),
            None => ("sh", &[][..]),
        };
        let mut cmd = Command::new(head);
        cmd.args(rest).arg("sudo").arg(program);
        cmd
    }

    #[must_use]
    pub fn split_stderr(&self, stderr: &str) -> (Vec<String>, String) {
        let mut vm_lines = Vec::new();
        let mut own = Vec::new();
        for line in stderr.lines() {
            if !self.error_prefix.is_empty() && line.starts_with(&self.error_prefix) {
                vm_lines.push(line.to_string());
            } else {
                own.push(line);
            }
        }
        let mut own = own.join("\n");
        if stderr.ends_with('\n') && !own.is_empty() {
            own.push('\n');
        }
        (vm_lines, own)
    }

    /// Run the privileged botbox CLI inside the VM.
    pub async fn run_cli<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.privileged(&self.cli);
        cmd.args(args).kill_on_drop(true);
        debug!(cli = %self.cli, "running botbox inside vm");
        let output = cmd.output().await?;
        self.check(&output)
    }

    fn check(&self, output: &Output) -> Result<String> {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let (vm_lines, own) = self.split_stderr(&stderr);
        let mut message = own.trim().to_string();
        if message.is_empty() {
            message = vm_lines.join("\n");
        }
        if message.is_empty() {
            message = format!("{} exited with {:?}", self.cli, output.status.code());
        }
        Err(Error::vm(message))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, botbox_config::VmMode};

    fn shell() -> VmShell {
        VmShell::from_config(&VmConfig::default())
    }

    #[test]
    fn direct_when_vm_off() {
        let cfg = VmConfig {
            enabled: VmMode::Off,
            ..Default::default()
        };
        assert!(!HostPlatform::from_config(&cfg).is_vm());
    }

    #[test]
    fn delegated_when_vm_on() {
        let cfg = VmConfig {
            enabled: VmMode::On,
            ..Default::default()
        };
        assert!(HostPlatform::from_config(&cfg).is_vm());
    }

    #[test]
    fn privileged_command_wraps_shell_and_sudo() {
        let cmd = shell().privileged("ctr");
        let std = cmd.as_std();
        assert_eq!(std.get_program(), "limactl");
        let args: Vec<_> = std.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["shell", "default", "--", "sudo", "ctr"]);
    }

    #[test]
    fn split_stderr_separates_vm_lines() {
        let stderr = "time=\"2024-01-01\" level=fatal msg=\"exit status 1\"\ncat: /x: No such file\n";
        let (vm, own) = shell().split_stderr(stderr);
        assert_eq!(vm.len(), 1);
        assert_eq!(own, "cat: /x: No such file\n");
    }

    #[test]
    fn direct_split_keeps_everything() {
        let (vm, own) = HostPlatform::Direct.split_stderr("time=1\nboom");
        assert!(vm.is_empty());
        assert_eq!(own, "time=1\nboom");
    }
}
