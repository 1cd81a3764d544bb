//! Building a sandbox's virtual machine runner.
//!
//! The [`Provisioner`] turns a record into a runner directory containing
//! `bin/microvm-run` (the supervisor) and, optionally, `bin/microvm-shutdown`.
//! [`NixProvisioner`] does so by generating a microvm.nix flake and building
//! it with `nix build`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::{AgentConfig, SshConfig};
use crate::error::{tail_lines, Error, Result};
use crate::git;
use crate::nix_expr::NixExpr;
use crate::sandbox::{AuthMode, NetworkMode, SandboxDirs, SandboxRecord};
use crate::tokens::{TokenSet, FORWARDABLE_TOKENS};

/// Supervisor executable, relative to the runner directory.
pub const RUN_SCRIPT: &str = "bin/microvm-run";

/// Graceful shutdown operation, relative to the runner directory.
pub const SHUTDOWN_SCRIPT: &str = "bin/microvm-shutdown";

const SYSTEM: &str = "x86_64-linux";

/// Path of the supervisor executable inside `runner`.
pub fn run_script(runner: &Path) -> PathBuf {
    runner.join(RUN_SCRIPT)
}

/// Path of the shutdown operation inside `runner`.
pub fn shutdown_script(runner: &Path) -> PathBuf {
    runner.join(SHUTDOWN_SCRIPT)
}

/// Builds the runnable supervisor for a sandbox.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Builds the runner for `record` and returns its directory.
    ///
    /// Fails with `ProvisioningFailed` carrying the tail of the build output.
    async fn build(&self, record: &SandboxRecord) -> Result<PathBuf>;
}

/// Git identity baked into the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

impl GitIdentity {
    /// Reads the host's global identity, with placeholders for missing parts.
    pub fn from_host() -> Self {
        Self {
            name: git::global_config("user.name").unwrap_or_else(|| "Sandbox User".to_string()),
            email: git::global_config("user.email")
                .unwrap_or_else(|| "sandbox@localhost".to_string()),
        }
    }
}

/// Host-derived values embedded into the generated flake.
#[derive(Debug, Clone)]
pub struct FlakeInputs {
    pub public_key: Option<String>,
    pub password: String,
    pub identity: GitIdentity,
    pub guest_workspace: String,
    /// Changes on every build so identical configurations are not served
    /// from the store cache.
    pub build_id: String,
}

/// Generates the flake for `record`.
pub fn sandbox_flake(record: &SandboxRecord, inputs: &FlakeInputs) -> NixExpr {
    let inputs_attr = NixExpr::attrs()
        .set("nixpkgs.url", "github:NixOS/nixpkgs/nixos-unstable")
        .set("microvm.url", "github:astro/microvm.nix")
        .set("microvm.inputs.nixpkgs.follows", "nixpkgs");

    let system = NixExpr::apply(
        NixExpr::reference("nixpkgs.lib.nixosSystem"),
        NixExpr::attrs()
            .set("system", SYSTEM)
            .set(
                "modules",
                NixExpr::list([
                    NixExpr::reference("microvm.nixosModules.microvm"),
                    NixExpr::function(&["config", "pkgs"], guest_module(record, inputs)),
                ]),
            )
            .build(),
    );

    let outputs = NixExpr::function(
        &["self", "nixpkgs", "microvm"],
        NixExpr::attrs()
            .set("nixosConfigurations.sandbox", system)
            .set(
                format!("packages.{}.default", SYSTEM),
                NixExpr::reference("self.nixosConfigurations.sandbox.config.microvm.declaredRunner"),
            )
            .build(),
    );

    NixExpr::attrs()
        .set("description", format!("Keystone Agent Sandbox: {}", record.name))
        .set("inputs", inputs_attr)
        .set("outputs", outputs)
        .build()
}

fn guest_module(record: &SandboxRecord, inputs: &FlakeInputs) -> NixExpr {
    let spec = &record.resource_spec;
    let user = record.ssh_user.as_str();

    let mut qemu_args = vec!["-sandbox", "off"];
    if spec.nested_virtualization_enabled {
        qemu_args.extend(["-cpu", "host"]);
    }

    let microvm = NixExpr::attrs()
        .set("hypervisor", "qemu")
        .set("mem", spec.memory_mb)
        .set("vcpu", spec.vcpu_count)
        .set("qemu.extraArgs", NixExpr::strs(qemu_args))
        .set(
            "interfaces",
            NixExpr::list([NixExpr::attrs()
                .set("type", "user")
                .set("id", "net0")
                .set("mac", "02:00:00:00:00:01")
                .build()]),
        )
        .set(
            "forwardPorts",
            NixExpr::list([NixExpr::attrs()
                .set("from", "host")
                .set("host.port", record.ssh_port)
                .set("guest.port", 22u16)
                .build()]),
        )
        .set(
            "shares",
            NixExpr::list([NixExpr::attrs()
                .set("tag", "ro-store")
                .set("source", "/nix/store")
                .set("mountPoint", "/nix/.ro-store")
                .build()]),
        )
        .set("writableStoreOverlay", "/nix/.rw-store");

    let password_auth = record.auth_mode == AuthMode::Password;
    let keys = inputs.public_key.iter().cloned();

    let mut module = NixExpr::attrs()
        .set("microvm", microvm)
        .set("networking.hostName", record.name.clone())
        .set("system.stateVersion", "24.11")
        .set("services.openssh.enable", true)
        .set("services.openssh.settings.PermitRootLogin", "no")
        .set("services.openssh.settings.PasswordAuthentication", password_auth)
        .set("services.openssh.settings.AcceptEnv", NixExpr::strs(FORWARDABLE_TOKENS.iter().copied()))
        .set(format!("users.users.{}.isNormalUser", user), true)
        .set(format!("users.users.{}.extraGroups", user), NixExpr::strs(["wheel"]))
        .set(format!("users.users.{}.password", user), inputs.password.clone())
        .set(
            format!("users.users.{}.openssh.authorizedKeys.keys", user),
            NixExpr::strs(keys),
        )
        .set(
            "security.sudo.extraRules",
            NixExpr::list([NixExpr::attrs()
                .set("users", NixExpr::strs([user]))
                .set(
                    "commands",
                    NixExpr::list([NixExpr::attrs()
                        .set("command", "ALL")
                        .set("options", NixExpr::strs(["NOPASSWD"]))
                        .build()]),
                )
                .build()]),
        )
        .set(
            "systemd.tmpfiles.rules",
            NixExpr::strs([format!("d {} 0755 {} users -", inputs.guest_workspace, user)]),
        )
        .set(
            "environment.systemPackages",
            NixExpr::list(
                ["pkgs.git", "pkgs.gnutar", "pkgs.vim", "pkgs.curl"]
                    .into_iter()
                    .map(NixExpr::reference),
            ),
        )
        .set("environment.variables.WORKSPACE", inputs.guest_workspace.clone())
        .set(
            "environment.etc.gitconfig.text",
            format!(
                "[user]\n    name = {}\n    email = {}\n",
                inputs.identity.name, inputs.identity.email
            ),
        )
        .set("environment.etc.sandbox-build-id.text", inputs.build_id.clone());

    if spec.nested_virtualization_enabled {
        module = module.set("boot.kernelModules", NixExpr::strs(["kvm-intel", "kvm-amd"]));
    }

    if spec.network_mode == NetworkMode::None {
        // The forward stays reachable; without a gateway the guest has no route out.
        module = module
            .set("networking.useDHCP", false)
            .set("networking.useNetworkd", true)
            .set("systemd.network.networks.10-sandbox.matchConfig.Type", "ether")
            .set(
                "systemd.network.networks.10-sandbox.address",
                NixExpr::strs(["10.0.2.15/24"]),
            );
    }

    module.build()
}

/// Builds runners with `nix build` from a generated flake.
#[derive(Debug, Clone)]
pub struct NixProvisioner {
    nix_command: String,
    build_timeout: Duration,
    diagnostic_lines: usize,
    ssh: SshConfig,
    guest_workspace: String,
}

impl NixProvisioner {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            nix_command: config.provision.nix_command.clone(),
            build_timeout: config.timing.build_timeout(),
            diagnostic_lines: config.provision.diagnostic_lines,
            ssh: config.ssh.clone(),
            guest_workspace: config.guest.workspace.clone(),
        }
    }

    fn flake_inputs(&self, record: &SandboxRecord) -> Result<FlakeInputs> {
        let public_key = self.ssh.read_public_key();
        if record.auth_mode == AuthMode::PublicKey && public_key.is_none() {
            return Err(Error::Config(
                "no SSH public key found for public-key auth; configure ssh.public_keys or use password auth"
                    .to_string(),
            ));
        }
        Ok(FlakeInputs {
            public_key,
            password: self.ssh.password.clone(),
            identity: GitIdentity::from_host(),
            guest_workspace: self.guest_workspace.clone(),
            build_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// Writes `flake.nix` into the sandbox's `vm/` directory and returns
    /// that directory.
    ///
    /// The workspace and logs stay outside it, so the build never copies
    /// them into the store.
    pub fn write_flake(&self, record: &SandboxRecord) -> Result<PathBuf> {
        let dirs = SandboxDirs::at(&record.state_dir);
        let flake = sandbox_flake(record, &self.flake_inputs(record)?);
        let vm_dir = dirs.vm_dir();
        std::fs::create_dir_all(&vm_dir)?;
        let path = dirs.flake_file();
        std::fs::write(&path, format!("{}\n", flake.render()))?;

        // A stale lock pins old inputs.
        let lock = vm_dir.join("flake.lock");
        if lock.exists() {
            std::fs::remove_file(&lock)?;
        }

        tracing::debug!(path = %path.display(), "wrote sandbox flake");
        Ok(vm_dir)
    }

    fn failure(&self, message: String, output: &str) -> Error {
        let redacted = TokenSet::from_env().redact(output);
        Error::ProvisioningFailed {
            message,
            diagnostics: tail_lines(redacted.trim_end(), self.diagnostic_lines),
        }
    }
}

#[async_trait]
impl Provisioner for NixProvisioner {
    async fn build(&self, record: &SandboxRecord) -> Result<PathBuf> {
        let vm_dir = self.write_flake(record)?;

        let target = format!("path:{}#default", vm_dir.display());
        tracing::info!(name = %record.name, target = %target, "building sandbox runner");

        let child = Command::new(&self.nix_command)
            .args(["build", &target, "--no-link", "--print-out-paths"])
            .current_dir(&vm_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.failure(format!("cannot run {}: {}", self.nix_command, e), ""))?;

        let output = match tokio::time::timeout(self.build_timeout, child.wait_with_output()).await
        {
            Ok(output) => output?,
            Err(_) => {
                return Err(self.failure(
                    format!("build timed out after {}s", self.build_timeout.as_secs()),
                    "",
                ))
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(self.failure(format!("nix build exited with {}", output.status), &stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let runner = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .map(PathBuf::from)
            .ok_or_else(|| self.failure("nix build printed no output path".to_string(), &stderr))?;

        if !run_script(&runner).exists() {
            return Err(self.failure(
                format!("runner {} has no {}", runner.display(), RUN_SCRIPT),
                &stderr,
            ));
        }

        tracing::info!(name = %record.name, runner = %runner.display(), "built sandbox runner");
        Ok(runner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{ResourceSpec, SandboxState, SyncMode};
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(state_dir: &Path, auth_mode: AuthMode) -> SandboxRecord {
        SandboxRecord {
            name: "proj".into(),
            state: SandboxState::Stopped,
            project_path: PathBuf::from("/src/proj"),
            workspace_path: state_dir.join("workspace"),
            state_dir: state_dir.to_path_buf(),
            resource_spec: ResourceSpec::default(),
            sync_mode: SyncMode::Manual,
            process_handle: None,
            ssh_port: 2225,
            ssh_user: "sandbox".into(),
            auth_mode,
            runner_path: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn inputs() -> FlakeInputs {
        FlakeInputs {
            public_key: Some("ssh-ed25519 AAAA test@host".into()),
            password: "sandbox".into(),
            identity: GitIdentity {
                name: "Ada \"The\" Dev".into(),
                email: "ada@example.com".into(),
            },
            guest_workspace: "/workspace".into(),
            build_id: "build-1".into(),
        }
    }

    fn write_fake_nix(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-nix");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn provisioner(nix: String) -> NixProvisioner {
        let mut config = AgentConfig::default();
        config.provision.nix_command = nix;
        config.provision.diagnostic_lines = 2;
        NixProvisioner::new(&config)
    }

    #[test]
    fn flake_carries_port_forward_and_resources() {
        let dir = TempDir::new().unwrap();
        let text = sandbox_flake(&record(dir.path(), AuthMode::PublicKey), &inputs()).render();

        assert!(text.contains("host.port = 2225;"));
        assert!(text.contains("guest.port = 22;"));
        assert!(text.contains("mem = 4096;"));
        assert!(text.contains("vcpu = 2;"));
        assert!(text.contains("PasswordAuthentication = false;"));
        assert!(text.contains("\"ssh-ed25519 AAAA test@host\""));
        assert!(text.contains("\"ANTHROPIC_API_KEY\""));
        assert!(text.contains("packages.x86_64-linux.default = self.nixosConfigurations.sandbox.config.microvm.declaredRunner;"));
        assert!(text.contains("\"d /workspace 0755 sandbox users -\""));
    }

    #[test]
    fn flake_escapes_host_identity() {
        let dir = TempDir::new().unwrap();
        let text = sandbox_flake(&record(dir.path(), AuthMode::Password), &inputs()).render();
        assert!(text.contains("name = Ada \\\"The\\\" Dev\\n"));
        assert!(text.contains("PasswordAuthentication = true;"));
    }

    #[test]
    fn nested_virtualization_and_offline_network() {
        let dir = TempDir::new().unwrap();
        let mut record = record(dir.path(), AuthMode::Password);
        record.resource_spec.nested_virtualization_enabled = true;
        record.resource_spec.network_mode = NetworkMode::None;
        let text = sandbox_flake(&record, &inputs()).render();

        assert!(text.contains("\"-cpu\" \"host\""));
        assert!(text.contains("\"kvm-intel\""));
        assert!(text.contains("networking.useDHCP = false;"));
    }

    #[tokio::test]
    async fn successful_build_returns_runner_and_clears_lock() {
        let dir = TempDir::new().unwrap();
        let runner = dir.path().join("runner");
        std::fs::create_dir_all(runner.join("bin")).unwrap();
        std::fs::write(runner.join(RUN_SCRIPT), "").unwrap();
        std::fs::create_dir_all(dir.path().join("vm")).unwrap();
        std::fs::write(dir.path().join("vm/flake.lock"), "{}").unwrap();
        std::fs::create_dir_all(dir.path().join("workspace")).unwrap();

        let nix = write_fake_nix(
            dir.path(),
            &format!("echo \"$2\" > ../target\nls -A > ../listing\necho {}", runner.display()),
        );
        let built = provisioner(nix)
            .build(&record(dir.path(), AuthMode::Password))
            .await
            .unwrap();

        assert_eq!(built, runner);
        let vm_dir = dir.path().join("vm");
        assert!(vm_dir.join("flake.nix").exists());
        assert!(!vm_dir.join("flake.lock").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("target")).unwrap().trim(),
            format!("path:{}#default", vm_dir.display())
        );
        // Only the flake is under the build root.
        assert_eq!(
            std::fs::read_to_string(dir.path().join("listing")).unwrap().trim(),
            "flake.nix"
        );
    }

    #[tokio::test]
    async fn failed_build_keeps_diagnostic_tail() {
        let dir = TempDir::new().unwrap();
        let nix = write_fake_nix(
            dir.path(),
            "echo one >&2; echo two >&2; echo three >&2; exit 1",
        );

        let err = provisioner(nix)
            .build(&record(dir.path(), AuthMode::Password))
            .await
            .unwrap_err();

        match err {
            Error::ProvisioningFailed { diagnostics, .. } => assert_eq!(diagnostics, "two\nthree"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
