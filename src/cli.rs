//! Command-line surface (§11): a single flag-driven binary, no subcommands.

use crate::external::HypervisorSelection;
use clap::{
    builder::{styling, Styles},
    Parser,
};
use std::path::PathBuf;

fn create_styles() -> Styles {
    styling::Styles::styled()
        .header(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .usage(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .literal(styling::AnsiColor::Cyan.on_default() | styling::Effects::BOLD)
        .placeholder(styling::AnsiColor::Cyan.on_default())
}

#[derive(Parser, Debug)]
#[command(name = "kintegrity", version, about = "Live kernel and process integrity validator", styles = create_styles())]
pub struct Cli {
    /// Use the KVM backend, introspecting the named VM
    #[arg(short = 'k', value_name = "VM_NAME", group = "backend")]
    pub kvm: Option<String>,

    /// Use the Xen backend, introspecting the named VM
    #[arg(short = 'x', value_name = "VM_NAME", group = "backend")]
    pub xen: Option<String>,

    /// Use the file backend, reading a static memory snapshot
    #[arg(short = 'f', value_name = "PATH", group = "backend")]
    pub file: Option<PathBuf>,

    /// Loop mode: repeat validation until interrupted
    #[arg(short = 'l', long = "loop")]
    pub loop_mode: bool,

    /// Disable code-page validation (default: on)
    #[arg(short = 'c', long = "no-code")]
    pub no_code: bool,

    /// Disable pointer examination (default: on)
    #[arg(short = 'd', long = "no-data")]
    pub no_data: bool,

    /// Call-targets file (callsite/destination VA pairs)
    #[arg(short = 't', long = "targets", value_name = "PATH")]
    pub targets: Option<PathBuf>,

    /// Quirks file (version-specific exceptions)
    #[arg(short = 'q', long = "quirks", value_name = "PATH")]
    pub quirks: Option<PathBuf>,

    /// Validate a specific user-space process instead of just the kernel
    #[arg(short = 'p', long = "pid", value_name = "PID")]
    pub pid: Option<u32>,

    /// Expected environment variable for -p, as NAME=VALUE (repeatable)
    #[arg(short = 'e', long = "expect-env", value_name = "NAME=VALUE")]
    pub expect_env: Vec<String>,

    /// Directory holding vmlinux and its modules
    pub kerneldir: PathBuf,

    /// Name of the VM to introspect, when using -k/-x
    pub vm_name: Option<String>,
}

impl Cli {
    /// Parses `-e NAME=VALUE` entries into the map `check_environment`
    /// compares the process's actual environment against. Malformed
    /// entries (missing `=`) are skipped.
    pub fn expected_env(&self) -> std::collections::HashMap<String, String> {
        self.expect_env
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Resolves the mutually exclusive `-k`/`-x`/`-f` group into a
    /// `HypervisorSelection`, auto-detecting (KVM, then Xen) the way the
    /// original does when none is given.
    pub fn hypervisor_selection(&self) -> crate::error::Result<HypervisorSelection> {
        if let Some(path) = &self.file {
            return Ok(HypervisorSelection::File { snapshot_path: path.clone() });
        }
        if let Some(vm) = &self.kvm {
            return Ok(HypervisorSelection::Kvm { vm_name: vm.clone() });
        }
        if let Some(vm) = &self.xen {
            return Ok(HypervisorSelection::Xen { vm_name: vm.clone() });
        }
        let vm_name = self.vm_name.clone().unwrap_or_default();
        Ok(HypervisorSelection::Kvm { vm_name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_file_backend_with_kerneldir() {
        let cli = Cli::parse_from(["kintegrity", "-f", "snap.img", "/boot/kernel"]);
        assert_eq!(cli.file, Some(PathBuf::from("snap.img")));
        assert_eq!(cli.kerneldir, PathBuf::from("/boot/kernel"));
        assert!(!cli.loop_mode);
    }

    #[test]
    fn parses_loop_and_quirks_flags() {
        let cli = Cli::parse_from(["kintegrity", "-l", "-q", "quirks.yaml", "-f", "snap.img", "/boot/kernel"]);
        assert!(cli.loop_mode);
        assert_eq!(cli.quirks, Some(PathBuf::from("quirks.yaml")));
    }

    #[test]
    fn parses_pid_and_expect_env_flags() {
        let cli = Cli::parse_from([
            "kintegrity", "-p", "1234", "-e", "HOME=/root", "-e", "malformed", "-f", "snap.img", "/boot/kernel",
        ]);
        assert_eq!(cli.pid, Some(1234));
        let env = cli.expected_env();
        assert_eq!(env.get("HOME"), Some(&"/root".to_string()));
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn file_backend_resolves_to_file_selection() {
        let cli = Cli::parse_from(["kintegrity", "-f", "snap.img", "/boot/kernel"]);
        match cli.hypervisor_selection().unwrap() {
            HypervisorSelection::File { snapshot_path } => assert_eq!(snapshot_path, PathBuf::from("snap.img")),
            other => panic!("expected File selection, got {other:?}"),
        }
    }
}
