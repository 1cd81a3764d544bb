//! Keystone Agent CLI
//!
//! Manages microVM sandboxes for coding agents.

use std::io::{BufRead, Write};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};

use keystone_agent::sandbox::{derive_name, SandboxDirs};
use keystone_agent::{
    AgentConfig, AgentPaths, ArtifactStatus, AuthMode, DestroyOutcome, Error, IdentitySync,
    LifecycleController, NetworkMode, NixProvisioner, Registry, ResourceSpec, SandboxRecord,
    SshExecutor, StartRequest, StopOutcome, SyncMode, SyncOptions, TokenSet,
};

/// Manage microVM sandboxes for coding agents
#[derive(Debug, Parser)]
#[command(name = "keystone-agent", version, author)]
struct Cli {
    /// Configuration root (default: $KEYSTONE_AGENT_HOME or ~/.config/keystone/agent)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a sandbox for a project, then attach to it
    Start {
        /// Project directory (default: current directory)
        project: Option<PathBuf>,
        /// Sandbox name (default: derived from the project directory)
        #[arg(long, short)]
        name: Option<String>,
        /// Guest memory in MiB
        #[arg(long)]
        memory: Option<u32>,
        /// Number of virtual CPUs
        #[arg(long)]
        vcpus: Option<u32>,
        /// Expose hardware virtualization to the guest
        #[arg(long)]
        nested: bool,
        #[arg(long, value_enum)]
        network: Option<NetworkArg>,
        #[arg(long, value_enum)]
        sync_mode: Option<SyncModeArg>,
        #[arg(long, value_enum)]
        auth: Option<AuthArg>,
        /// Remove any existing sandbox of the same name first
        #[arg(long)]
        fresh: bool,
        /// Don't attach after starting
        #[arg(long)]
        no_attach: bool,
    },
    /// Stop a running sandbox
    Stop {
        name: Option<String>,
        /// Pull new commits from the sandbox before stopping
        #[arg(long)]
        sync: bool,
    },
    /// Remove a sandbox and all of its data
    Destroy {
        name: Option<String>,
        /// Skip confirmation and kill the sandbox if it is running
        #[arg(long, short)]
        force: bool,
    },
    /// Show sandbox status (all sandboxes when no name is given)
    Status {
        name: Option<String>,
        #[arg(long, short, value_enum, default_value = "table")]
        output: OutputFormat,
    },
    /// List all sandboxes
    List {
        #[arg(long, short, value_enum, default_value = "table")]
        output: OutputFormat,
    },
    /// Pull commits (and optionally build artifacts) from a sandbox
    Sync {
        name: Option<String>,
        /// Also copy build output directories
        #[arg(long)]
        artifacts: bool,
        /// Show what would be synced without changing anything
        #[arg(long)]
        dry_run: bool,
        /// Copy the host's git identity into the sandbox
        #[arg(long)]
        git_identity: bool,
    },
    /// Run a command inside a sandbox
    Exec {
        #[arg(long, short)]
        name: Option<String>,
        /// Don't forward API tokens
        #[arg(long)]
        no_tokens: bool,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Open an interactive shell in a sandbox
    Ssh {
        name: Option<String>,
        /// Don't forward API tokens
        #[arg(long)]
        no_tokens: bool,
    },
    /// Show API tokens that will be forwarded
    Tokens,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum NetworkArg {
    User,
    None,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SyncModeArg {
    Manual,
    AutoCommit,
    AutoIdle,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AuthArg {
    PublicKey,
    Password,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Yaml,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(Error::NoChanges { uncommitted }) => {
            println!("Nothing to sync.");
            print_uncommitted(&uncommitted);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

struct App {
    controller: LifecycleController,
    ssh: SshExecutor,
}

impl App {
    fn new(root: Option<PathBuf>) -> keystone_agent::Result<Self> {
        let paths = AgentPaths::resolve(root)?;
        let config = AgentConfig::load(&paths)?;
        let ssh = SshExecutor::new(&config);
        let controller = LifecycleController::new(
            Registry::new(paths),
            config.clone(),
            Arc::new(ssh.clone()),
            Arc::new(NixProvisioner::new(&config)),
        );
        Ok(Self { controller, ssh })
    }

    /// Replaces this process with an interactive shell in `record`.
    fn attach(&self, record: &SandboxRecord, forward_tokens: bool) -> keystone_agent::Result<i32> {
        let tokens = if forward_tokens {
            TokenSet::from_env()
        } else {
            TokenSet::default()
        };
        if !tokens.is_empty() {
            println!(
                "Forwarding tokens: {}",
                tokens.names().collect::<Vec<_>>().join(", ")
            );
        }
        let err = self.ssh.attach_command(record, &tokens).exec();
        Err(Error::Io(err))
    }
}

/// Sandbox name from an argument, or derived from the current directory.
fn name_or_default(name: Option<String>) -> keystone_agent::Result<String> {
    if let Some(name) = name {
        return Ok(name);
    }
    let cwd = std::env::current_dir()?;
    derive_name(&cwd).ok_or_else(|| Error::InvalidName(cwd.display().to_string()))
}

async fn run(cli: Cli) -> keystone_agent::Result<i32> {
    if let Command::Tokens = cli.command {
        print_tokens();
        return Ok(0);
    }

    let app = App::new(cli.root)?;
    let controller = &app.controller;

    match cli.command {
        Command::Start {
            project,
            name,
            memory,
            vcpus,
            nested,
            network,
            sync_mode,
            auth,
            fresh,
            no_attach,
        } => {
            let project_path = match project {
                Some(path) => path,
                None => std::env::current_dir()?,
            };

            let mut resources: ResourceSpec = controller.config().default_resources();
            let overridden = memory.is_some() || vcpus.is_some() || nested || network.is_some();
            if let Some(memory) = memory {
                resources.memory_mb = memory;
            }
            if let Some(vcpus) = vcpus {
                resources.vcpu_count = vcpus;
            }
            resources.nested_virtualization_enabled |= nested;
            if let Some(network) = network {
                resources.network_mode = match network {
                    NetworkArg::User => NetworkMode::User,
                    NetworkArg::None => NetworkMode::None,
                };
            }
            if overridden {
                let warnings =
                    keystone_agent::Validate::validate(&resources).into_result()?;
                for warning in warnings {
                    eprintln!("Warning: {}", warning);
                }
            }

            let request = StartRequest {
                name,
                project_path,
                resources: overridden.then_some(resources),
                sync_mode: sync_mode.map(|mode| match mode {
                    SyncModeArg::Manual => SyncMode::Manual,
                    SyncModeArg::AutoCommit => SyncMode::AutoCommit,
                    SyncModeArg::AutoIdle => SyncMode::AutoIdle,
                }),
                auth_mode: auth.map(|auth| match auth {
                    AuthArg::PublicKey => AuthMode::PublicKey,
                    AuthArg::Password => AuthMode::Password,
                }),
                fresh,
            };

            let report = match controller.start(request).await {
                Ok(report) => report,
                Err(Error::AlreadyRunning(name)) => {
                    let record = controller.status(&name)?;
                    println!("Sandbox '{}' is already running.", name);
                    if no_attach {
                        return Ok(0);
                    }
                    return app.attach(&record, true);
                }
                Err(e) => return Err(e),
            };

            let record = &report.record;
            println!("Sandbox '{}' started.", record.name);
            println!("  Project: {}", record.project_path.display());
            println!(
                "  SSH:     ssh -p {} {}@localhost",
                record.ssh_port, record.ssh_user
            );
            if !report.ready {
                println!("  Still booting; the SSH port did not answer yet.");
            }
            if !report.workspace_pushed {
                println!("  Workspace was not copied into the sandbox yet.");
            }

            if no_attach || !report.ready {
                return Ok(0);
            }
            app.attach(record, true)
        }

        Command::Stop { name, sync } => {
            let name = name_or_default(name)?;
            match controller.stop(&name, sync).await? {
                StopOutcome::AlreadyStopped => println!("Sandbox '{}' is not running.", name),
                StopOutcome::Reclaimed => {
                    println!("Sandbox '{}' had already exited; cleaned up.", name)
                }
                StopOutcome::Stopped { graceful: true } => {
                    println!("Sandbox '{}' shut down.", name)
                }
                StopOutcome::Stopped { graceful: false } => {
                    println!("Sandbox '{}' stopped.", name)
                }
            }
            Ok(0)
        }

        Command::Destroy { name, force } => {
            let name = name_or_default(name)?;
            let outcome = controller
                .destroy(&name, force, |record| {
                    confirm(&format!(
                        "Are you sure you want to destroy sandbox '{}' ({})? [y/N] ",
                        record.name,
                        record.state_dir.display()
                    ))
                })
                .await?;
            match outcome {
                DestroyOutcome::Cancelled => println!("Aborted."),
                DestroyOutcome::Destroyed {
                    directories_removed,
                } => {
                    println!("Sandbox '{}' destroyed.", name);
                    if !directories_removed {
                        eprintln!("Warning: some sandbox files could not be removed.");
                    }
                }
            }
            Ok(0)
        }

        Command::Status { name: Some(name), output } => {
            let record = controller.status(&name)?;
            match output {
                OutputFormat::Table => print_record(&record),
                format => print_structured(&record, format)?,
            }
            Ok(0)
        }

        Command::Status { name: None, output } | Command::List { output } => {
            if let Err(e) = controller.registry().check() {
                eprintln!("Warning: {}", e);
            }
            let records = controller.list()?;
            match output {
                OutputFormat::Table => print_table(&records),
                format => print_structured(&records, format)?,
            }
            Ok(0)
        }

        Command::Sync {
            name,
            artifacts,
            dry_run,
            git_identity,
        } => {
            let name = name_or_default(name)?;
            let engine = controller.sync_engine();

            if git_identity {
                match engine.sync_git_identity(&name).await? {
                    IdentitySync::Applied { name: user, email } => {
                        println!("Git identity set to {} <{}>.", user, email)
                    }
                    IdentitySync::Incomplete => {
                        println!("Host git identity is incomplete; skipped.")
                    }
                }
            }

            let report = engine
                .sync(&name, SyncOptions { artifacts, dry_run })
                .await?;

            if report.dry_run {
                println!("Would sync {} commit(s):", report.commits.len());
            } else if let Some(head) = &report.merged_head {
                println!(
                    "Synced {} commit(s); host is now at {}.",
                    report.commits.len(),
                    head.get(..7).unwrap_or(head)
                );
            }
            for commit in &report.commits {
                println!("  {} {}", commit.short_hash(), commit.subject);
            }
            print_uncommitted(&report.uncommitted);
            for artifact in &report.artifacts {
                match &artifact.status {
                    ArtifactStatus::Copied => println!("Copied {}/", artifact.dir),
                    ArtifactStatus::Missing => {}
                    ArtifactStatus::Failed(e) => {
                        eprintln!("Failed to copy {}/: {}", artifact.dir, e)
                    }
                }
            }
            Ok(0)
        }

        Command::Exec {
            name,
            no_tokens,
            command,
        } => {
            let name = name_or_default(name)?;
            let tokens = (!no_tokens).then(TokenSet::from_env);
            let output = controller
                .sync_engine()
                .exec(&name, &command, tokens)
                .await?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            Ok(output.exit_code)
        }

        Command::Ssh { name, no_tokens } => {
            let name = name_or_default(name)?;
            let record = controller.sync_engine().require_running(&name)?;
            app.attach(&record, !no_tokens)
        }

        Command::Tokens => Ok(0),
    }
}

fn confirm(prompt: &str) -> bool {
    print!("{}", prompt);
    if std::io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    match std::io::stdin().lock().read_line(&mut answer) {
        Ok(_) => answer.trim().eq_ignore_ascii_case("y"),
        Err(_) => false,
    }
}

fn print_tokens() {
    let tokens = TokenSet::from_env();
    if tokens.is_empty() {
        println!("No API tokens found in environment");
        println!();
        println!("Set tokens via environment variables:");
        for var in keystone_agent::tokens::FORWARDABLE_TOKENS {
            println!("  export {}=your-token-here", var);
        }
        return;
    }

    println!("Available tokens (will be forwarded to sandbox):");
    for (name, masked) in tokens.masked_entries() {
        println!("  {}: {}", name, masked);
    }
}

fn print_uncommitted(changes: &[String]) {
    if changes.is_empty() {
        return;
    }
    println!("Uncommitted changes in sandbox (not synced):");
    for change in changes {
        println!("  {}", change);
    }
}

fn print_record(record: &SandboxRecord) {
    let spec = &record.resource_spec;
    println!("Name:      {}", record.name);
    println!("State:     {}", record.state);
    println!("Project:   {}", record.project_path.display());
    println!("Workspace: {}", record.workspace_path.display());
    println!(
        "SSH:       ssh -p {} {}@localhost",
        record.ssh_port, record.ssh_user
    );
    println!(
        "Resources: {} MiB, {} vCPU{}",
        spec.memory_mb,
        spec.vcpu_count,
        if spec.nested_virtualization_enabled {
            ", nested virtualization"
        } else {
            ""
        }
    );
    if let Some(handle) = record.process_handle {
        println!("Process:   pid {} (group {})", handle.pid, handle.process_group_id);
    }
    println!(
        "Config:    {}",
        SandboxDirs::at(&record.state_dir).flake_file().display()
    );
    println!("Updated:   {}", record.updated_at.to_rfc3339());
}

fn print_table(records: &[SandboxRecord]) {
    if records.is_empty() {
        println!("No sandboxes found");
        return;
    }

    println!("{:<20} {:<10} {:<6} PROJECT", "NAME", "STATE", "PORT");
    println!("{}", "-".repeat(72));
    for record in records {
        let project = record.project_path.display().to_string();
        let project = if project.chars().count() > 25 {
            let tail: String = project
                .chars()
                .skip(project.chars().count() - 22)
                .collect();
            format!("...{}", tail)
        } else {
            project
        };
        println!(
            "{:<20} {:<10} {:<6} {}",
            record.name,
            record.state.as_str(),
            record.ssh_port,
            project
        );
    }
}

fn print_structured<T: serde::Serialize>(
    value: &T,
    format: OutputFormat,
) -> keystone_agent::Result<()> {
    let text = match format {
        OutputFormat::Yaml => serde_yaml::to_string(value)
            .map_err(|e| Error::Serialization(e.to_string()))?,
        _ => serde_json::to_string_pretty(value)
            .map_err(|e| Error::Serialization(e.to_string()))?,
    };
    println!("{}", text.trim_end());
    Ok(())
}
