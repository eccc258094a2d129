//! tdeploy - GPU marketplace deployer
//!
//! ## Usage
//!
//! ```bash
//! # Provision an RTX 4090 and install ComfyUI on it
//! export TENSORDOCK_API_TOKEN=...
//! tdeploy deploy --gpu 4090
//!
//! # What is available right now
//! tdeploy locations --gpu 4090
//!
//! # List instances, optionally pick some to terminate
//! tdeploy list --terminate
//! tdeploy terminate <instance-id>...
//!
//! # Re-run setup on an existing instance (from server_info.json)
//! tdeploy ssh-setup
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tensordock_orchestrator::{
    AutoApprove, ConnectionEndpoint, ConnectionInfoSnapshot, Confirm, Credentials, DeployConfig,
    DeployReport, ExecutionReport, GpuMarketplace, InstanceManager, KnownHostsPolicy, Orchestrator,
    OrchestratorError, ResourceCatalog, SetupPayload, SetupRunner, SshShell, TensorDockClient,
    catalog::filter_candidates,
    config::{DEFAULT_API_URL, default_private_key},
    payload::{DEFAULT_DEPLOY_REPO, DEFAULT_LOCAL_COPY},
};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// tdeploy: provision GPU instances and run resilient setup over SSH
#[derive(Parser)]
#[command(name = "tdeploy", version)]
#[command(about = "Provision TensorDock GPU instances and deploy ComfyUI", long_about = None)]
struct Cli {
    /// Provider API token
    #[arg(long, global = true, env = "TENSORDOCK_API_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Provider API base URL
    #[arg(long, global = true, env = "TENSORDOCK_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    /// SSH private key (public key is read from <key>.pub) [default: ~/.ssh/id_ed25519]
    #[arg(long, global = true, env = "TDEPLOY_SSH_KEY")]
    ssh_key: Option<PathBuf>,

    /// Host key policy: strict, accept-new or ignore
    #[arg(long, global = true, default_value = "ignore")]
    known_hosts: KnownHostsPolicy,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Skip confirmation prompts
    #[arg(short = 'y', long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision an instance and run the setup payload on it
    Deploy {
        #[command(flatten)]
        sizing: SizingArgs,

        #[command(flatten)]
        setup: SetupArgs,

        /// Base configuration (JSON); flags override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Also consider locations without port forwarding
        #[arg(long)]
        allow_dedicated_ip: bool,

        /// Where to write connection info [default: server_info.json]
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },

    /// Show locations and their available accelerators
    Locations {
        /// Only show locations offering a matching accelerator
        #[arg(long)]
        gpu: Option<String>,
    },

    /// List instances
    List {
        /// Pick instances to terminate after listing
        #[arg(long)]
        terminate: bool,
    },

    /// Terminate instances by id
    Terminate {
        /// Instance ids
        #[arg(required = true)]
        instance_ids: Vec<String>,
    },

    /// Run the setup payload on an existing instance
    SshSetup {
        /// Instance address (default: from the snapshot)
        #[arg(long, requires = "port")]
        host: Option<String>,

        /// Remote shell port (default: from the snapshot)
        #[arg(long, requires = "host")]
        port: Option<u16>,

        /// Snapshot to read the endpoint from
        #[arg(long, default_value = "server_info.json")]
        snapshot: PathBuf,

        #[command(flatten)]
        setup: SetupArgs,
    },
}

#[derive(clap::Args)]
struct SizingArgs {
    /// Accelerator pattern, e.g. 4090 or a100 [default: 4090]
    #[arg(long)]
    gpu: Option<String>,

    /// Number of accelerators [default: 1]
    #[arg(long)]
    gpu_count: Option<u32>,

    /// Virtual CPUs [default: 8]
    #[arg(long)]
    vcpus: Option<u32>,

    /// Memory in GB [default: 32]
    #[arg(long)]
    ram: Option<u32>,

    /// Storage in GB [default: 200]
    #[arg(long)]
    storage: Option<u32>,

    /// OS image [default: ubuntu2404]
    #[arg(long)]
    image: Option<String>,
}

#[derive(clap::Args)]
struct SetupArgs {
    /// Custom setup script instead of the ComfyUI bootstrap
    #[arg(long)]
    script: Option<PathBuf>,

    /// CivitAI API key written into the deployment's .env
    #[arg(long, env = "CIVITAI_API_KEY", hide_env_values = true, default_value = "")]
    civitai_key: String,

    /// Deployment repository cloned by the bootstrap script
    #[arg(long, default_value = DEFAULT_DEPLOY_REPO)]
    repo_url: String,

    /// Re-runs allowed after a disconnect [default: 2]
    #[arg(long)]
    max_retries: Option<u32>,
}

impl SetupArgs {
    fn payload(&self) -> anyhow::Result<SetupPayload> {
        let payload = match &self.script {
            Some(path) => SetupPayload::from_file(path)?,
            None => SetupPayload::comfyui(&self.civitai_key, &self.repo_url),
        };
        if let Err(e) = payload.save_copy(DEFAULT_LOCAL_COPY) {
            warn!(error = %e, "Could not save local copy of setup script");
        }
        Ok(payload)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match init_tracing(cli.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialise logging: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let classified = e.downcast_ref::<OrchestratorError>();
            let class = classified.map(|c| c.classification()).unwrap_or("Error");
            let code = classified.map(|c| c.exit_code()).unwrap_or(1);
            error!("❌ {}: {:#}", class, e);
            if let Some(id) = classified.and_then(|c| c.instance_id()) {
                warn!("⚠️  Instance {} may still be running and billing; `tdeploy terminate {}` removes it", id, id);
            }
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

/// Console layer plus an optional non-blocking file layer
fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tdeploy=info,tensordock_orchestrator=info,info".into());

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("invalid log file path {}", path.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let ssh_key = cli.ssh_key.clone().unwrap_or_else(default_private_key);
    let confirm: Arc<dyn Confirm> = if cli.yes {
        Arc::new(AutoApprove)
    } else {
        Arc::new(prompt_yes_no)
    };

    match cli.command {
        Commands::Deploy {
            sizing,
            setup,
            config,
            allow_dedicated_ip,
            snapshot,
        } => {
            let credentials = Credentials::new(cli.token.unwrap_or_default(), &ssh_key)?
                .with_known_hosts(cli.known_hosts);
            if credentials.public_key.is_none() {
                return Err(OrchestratorError::config(format!(
                    "public key {}.pub not found; new instances need it for SSH access",
                    ssh_key.display()
                ))
                .into());
            }

            let mut config = match config {
                Some(path) => load_config(&path)?,
                None => DeployConfig::default(),
            };
            apply_sizing(&mut config, &sizing);
            if let Some(max_retries) = setup.max_retries {
                config.max_retries = max_retries;
            }
            if allow_dedicated_ip {
                config.require_port_forwarding = false;
            }
            if let Some(path) = snapshot {
                config.snapshot_path = path;
            }

            let payload = setup.payload()?;
            let provider = Arc::new(TensorDockClient::new(&credentials.token)?.with_base_url(&cli.api_url));
            let shell = Arc::new(SshShell::from_credentials(
                &credentials,
                &config.timeouts,
                &config.remote_user,
            ));

            info!(
                gpu = %config.gpu_pattern,
                gpu_count = config.gpu_count,
                vcpus = config.vcpus,
                ram_gb = config.ram_gb,
                storage_gb = config.storage_gb,
                "🚀 Deploying"
            );

            let snapshot_path = config.snapshot_path.clone();
            let orchestrator = Orchestrator::new(provider, shell.clone(), confirm, config)
                .with_credentials(&credentials);
            let report = orchestrator.deploy(&payload).await?;

            print_deploy_report(&report, &shell, &payload, &snapshot_path);
            Ok(())
        }

        Commands::Locations { gpu } => {
            let provider = provider(cli.token, &cli.api_url)?;
            let mut locations = ResourceCatalog::new(provider).locations().await?;
            if let Some(pattern) = &gpu {
                locations = filter_candidates(locations, pattern, false);
            }

            if locations.is_empty() {
                info!("⚠️  No matching locations");
                return Ok(());
            }

            for location in &locations {
                info!("📍 {} ({})", location.name, location.id);
                let offers: Vec<_> = location
                    .available_offers()
                    .filter(|o| gpu.as_deref().is_none_or(|p| o.matches(p)))
                    .collect();
                if offers.is_empty() {
                    info!("   No GPUs available");
                }
                for offer in offers {
                    info!(
                        "   {:<32} max {:<3} {:>10}  port forwarding: {}",
                        offer.display_name.as_deref().unwrap_or(&offer.model),
                        offer.max_count,
                        offer
                            .price_per_hour
                            .map(|p| format!("${:.2}/hr", p))
                            .unwrap_or_else(|| "N/A".to_string()),
                        if offer.port_forwarding { "yes" } else { "no" }
                    );
                }
            }
            Ok(())
        }

        Commands::List { terminate } => {
            let provider = provider(cli.token, &cli.api_url)?;
            let manager = InstanceManager::new(provider, confirm);
            let instances = manager.list().await?;

            if instances.is_empty() {
                info!("📭 No instances found");
                return Ok(());
            }

            info!("📋 Found {} instance(s)", instances.len());
            for (idx, instance) in instances.iter().enumerate() {
                info!("[{}] {}", idx + 1, instance.name);
                info!("    ID: {}", instance.id);
                info!("    Status: {}", instance.status);
                info!(
                    "    Address: {}:{}",
                    instance.ip_address.as_deref().unwrap_or("N/A"),
                    instance
                        .external_port(tensordock_orchestrator::instance::REMOTE_SHELL_PORT)
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "N/A".to_string())
                );
                info!(
                    "    GPUs: {}",
                    instance
                        .resources
                        .as_ref()
                        .map(|r| r.gpu_summary())
                        .unwrap_or_else(|| "None".to_string())
                );
                info!("    Created: {}", instance.created_at.as_deref().unwrap_or("N/A"));
            }

            if !terminate {
                return Ok(());
            }

            let selected = select_instances(instances.len())?;
            if selected.is_empty() {
                info!("Cancelled");
                return Ok(());
            }
            let ids: Vec<String> = selected.iter().map(|&i| instances[i].id.clone()).collect();
            report_terminations(&manager, &ids).await
        }

        Commands::Terminate { instance_ids } => {
            let provider = provider(cli.token, &cli.api_url)?;
            let manager = InstanceManager::new(provider, confirm);
            report_terminations(&manager, &instance_ids).await
        }

        Commands::SshSetup {
            host,
            port,
            snapshot,
            setup,
        } => {
            let mut config = DeployConfig::default();
            if let Some(max_retries) = setup.max_retries {
                config.max_retries = max_retries;
            }
            let (endpoint, user) = setup_target(host, port, &snapshot, &config.remote_user)?;

            let payload = setup.payload()?;
            let shell = Arc::new(
                SshShell::new(&user, &ssh_key)
                    .with_known_hosts(cli.known_hosts)
                    .with_connect_timeout(config.timeouts.probe_attempt_timeout)
                    .with_keepalive(
                        config.timeouts.keepalive_interval,
                        config.timeouts.keepalive_count_max,
                    ),
            );
            let runner = SetupRunner::new(shell.clone(), &config);

            info!(endpoint = %endpoint, "🔧 Running setup on existing instance");
            let report = runner.run(&endpoint, &payload).await?;
            print_setup_report(&report, &shell, &endpoint, &payload);
            Ok(())
        }
    }
}

/// Endpoint and login from `--host/--port`, else from the saved snapshot
fn setup_target(
    host: Option<String>,
    port: Option<u16>,
    snapshot: &Path,
    default_user: &str,
) -> anyhow::Result<(ConnectionEndpoint, String)> {
    if let (Some(host), Some(port)) = (host, port) {
        return Ok((ConnectionEndpoint::new(host, port), default_user.to_string()));
    }

    let saved = ConnectionInfoSnapshot::load(snapshot)?;
    info!(instance_id = %saved.instance_id, path = %snapshot.display(), "Using saved connection info");
    let user = if saved.username.is_empty() {
        default_user.to_string()
    } else {
        saved.username.clone()
    };
    Ok((saved.endpoint(), user))
}

fn provider(token: Option<String>, api_url: &str) -> anyhow::Result<Arc<dyn GpuMarketplace>> {
    let token = token.filter(|t| !t.trim().is_empty()).ok_or_else(|| {
        OrchestratorError::config("provider API token is required (set TENSORDOCK_API_TOKEN)")
    })?;
    Ok(Arc::new(TensorDockClient::new(token)?.with_base_url(api_url)))
}

fn load_config(path: &Path) -> anyhow::Result<DeployConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config {}", path.display()))?;
    let config = serde_json::from_str(&contents)
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

fn apply_sizing(config: &mut DeployConfig, sizing: &SizingArgs) {
    if let Some(gpu) = &sizing.gpu {
        config.gpu_pattern = gpu.clone();
    }
    if let Some(count) = sizing.gpu_count {
        config.gpu_count = count;
    }
    if let Some(vcpus) = sizing.vcpus {
        config.vcpus = vcpus;
    }
    if let Some(ram) = sizing.ram {
        config.ram_gb = ram;
    }
    if let Some(storage) = sizing.storage {
        config.storage_gb = storage;
    }
    if let Some(image) = &sizing.image {
        config.image = image.clone();
    }
}

fn prompt_yes_no(prompt: &str) -> bool {
    print!("{} [y/N]: ", prompt);
    if std::io::stdout().flush().is_err() {
        return false;
    }
    let mut input = String::new();
    if std::io::stdin().read_line(&mut input).is_err() {
        return false;
    }
    input.trim().to_lowercase().starts_with('y')
}

/// Read comma-separated 1-based instance numbers; empty or `q` cancels
fn select_instances(count: usize) -> anyhow::Result<Vec<usize>> {
    println!("Enter instance numbers to terminate (comma-separated), or 'q' to quit:");
    print!("> ");
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    parse_selection(&input, count)
}

fn parse_selection(input: &str, count: usize) -> anyhow::Result<Vec<usize>> {
    let input = input.trim();
    if input.is_empty() || input.eq_ignore_ascii_case("q") {
        return Ok(Vec::new());
    }

    let mut selected = Vec::new();
    for part in input.split(',') {
        let n: usize = part
            .trim()
            .parse()
            .with_context(|| format!("invalid instance number '{}'", part.trim()))?;
        if n == 0 || n > count {
            warn!("Ignoring out-of-range selection {}", n);
            continue;
        }
        if !selected.contains(&(n - 1)) {
            selected.push(n - 1);
        }
    }
    Ok(selected)
}

async fn report_terminations(manager: &InstanceManager, ids: &[String]) -> anyhow::Result<()> {
    let outcomes = manager.terminate_batch(ids).await;
    let mut failed = 0;
    let mut declined = 0;

    for outcome in &outcomes {
        match &outcome.result {
            Ok(()) => info!("🗑️  {} terminated", outcome.instance_id),
            Err(tensordock_orchestrator::TerminateError::Declined) => declined += 1,
            Err(e) => {
                failed += 1;
                error!("❌ {}: {}", outcome.instance_id, e);
            }
        }
    }

    if declined == outcomes.len() && !outcomes.is_empty() {
        return Err(OrchestratorError::Aborted("termination declined".to_string()).into());
    }
    if failed > 0 {
        anyhow::bail!("{} of {} termination(s) failed", failed, outcomes.len());
    }
    Ok(())
}

fn print_deploy_report(report: &DeployReport, shell: &SshShell, payload: &SetupPayload, snapshot: &Path) {
    info!("🎉 Deployment complete");
    info!("   Instance: {} ({})", report.instance_id, report.location_name);
    info!("   GPU: {} @ {}", report.gpu_model, report.endpoint);
    info!("   SSH: {}", shell.ssh_command_hint(&report.endpoint));
    if let Some(url) = &report.service_url {
        info!("   🌐 Service: {}", url);
    }
    info!("   Logs: {} 'tail -f {}'", shell.ssh_command_hint(&report.endpoint), payload.log_path);
    info!("   Connection info: {}", snapshot.display());
    let t = &report.phase_times;
    info!(
        "   Timings: catalog {:.1}s, create {:.1}s, ready {:.1}s, ssh {:.1}s, setup {:.1}s (total {:.1}s, {} attempt(s))",
        t.catalog_secs,
        t.provision_secs,
        t.readiness_secs,
        t.probe_secs,
        t.setup_secs,
        report.total_time_secs,
        report.attempts_used
    );
}

fn print_setup_report(
    report: &ExecutionReport,
    shell: &SshShell,
    endpoint: &ConnectionEndpoint,
    payload: &SetupPayload,
) {
    info!(
        "🎉 Setup complete after {} attempt(s) in {:.1}s",
        report.attempts_used,
        report.duration.as_secs_f64()
    );
    info!("   SSH: {}", shell.ssh_command_hint(endpoint));
    info!("   Logs: {} 'tail -f {}'", shell.ssh_command_hint(endpoint), payload.log_path);
}
