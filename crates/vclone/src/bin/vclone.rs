//! vclone CLI - clone a VM from a template and wait for it to come up.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::{theme::ColorfulTheme, Password};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vclone::customization::{GlobalIpSettings, PrimaryAddress};
use vclone::platform::local::{Credentials, LocalInventory};
use vclone::platform::ControlPlane;
use vclone::{
    provision, FolderFallback, ProvisionOptions, ProvisionOutcome, ProvisionRequest,
    ReadinessPolicy, TaskWaitPolicy,
};

/// vclone - provision a VM by cloning a template.
#[derive(Parser)]
#[command(name = "vclone")]
#[command(about = "Clone a VM from a template, customize its network and wait for the guest")]
#[command(version)]
struct Cli {
    /// Inventory file (or set `VCLONE_INVENTORY` env var).
    #[arg(long, env = "VCLONE_INVENTORY")]
    inventory: PathBuf,

    /// User name for the control-plane session.
    #[arg(long, env = "VCLONE_USER")]
    user: Option<String>,

    /// Password; prompted for when a user is given without one.
    #[arg(long, env = "VCLONE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Name of the VM to create.
    #[arg(short = 'v', long)]
    vm_name: String,

    /// Template to clone.
    #[arg(long)]
    template_name: String,

    /// Datacenter holding the template.
    #[arg(long)]
    datacenter_name: String,

    /// Cluster to place the VM in.
    #[arg(long)]
    cluster_name: String,

    /// Preferred host inside the cluster.
    #[arg(long)]
    host_name: Option<String>,

    /// Static IP for the first network adapter (DHCP when omitted).
    #[arg(long, requires = "mask")]
    ip: Option<Ipv4Addr>,

    /// Netmask for --ip.
    #[arg(long)]
    mask: Option<Ipv4Addr>,

    /// Gateway for --ip.
    #[arg(long, requires = "ip")]
    gateway: Option<Ipv4Addr>,

    /// DNS server for the guest (repeatable).
    #[arg(long = "dns-server")]
    dns_servers: Vec<Ipv4Addr>,

    /// Guest domain.
    #[arg(long)]
    domain: Option<String>,

    /// Produce a template instead of a running VM.
    #[arg(long, default_value = "false")]
    create_template: bool,

    /// Folder path the template is searched in (e.g. templates/linux).
    #[arg(long)]
    template_folder: Option<String>,

    /// Folder path the VM is created in.
    #[arg(long)]
    vm_folder: Option<String>,

    /// Fail instead of falling back to the datacenter VM folder when a folder is missing.
    #[arg(long, default_value = "false")]
    strict_folders: bool,

    /// Delay between task and guest polls, in milliseconds.
    #[arg(long, default_value = "1000")]
    poll_interval_ms: u64,

    /// Guest readiness attempts before giving up.
    #[arg(long, default_value = "300", value_parser = clap::value_parser!(u32).range(1..))]
    max_attempts: u32,

    /// Upper bound on the guest readiness wait, in seconds.
    #[arg(long)]
    max_wait_secs: Option<u64>,

    /// Upper bound on each task wait, in seconds.
    #[arg(long)]
    task_timeout_secs: Option<u64>,

    /// Print the outcome as JSON.
    #[arg(long, default_value = "false")]
    json: bool,

    /// Enable verbose logging.
    #[arg(long, default_value = "false")]
    verbose: bool,

    /// Emit logs as JSON.
    #[arg(long, default_value = "false")]
    log_json: bool,
}

impl Cli {
    fn request(&self) -> ProvisionRequest {
        ProvisionRequest {
            vm_name: self.vm_name.clone(),
            template_name: self.template_name.clone(),
            datacenter_name: self.datacenter_name.clone(),
            cluster_name: self.cluster_name.clone(),
            host_name: self.host_name.clone(),
            primary: self.ip.zip(self.mask).map(|(ip, mask)| PrimaryAddress {
                ip,
                mask,
                gateway: self.gateway,
            }),
            create_template: self.create_template,
            template_folder: self.template_folder.clone(),
            vm_folder: self.vm_folder.clone(),
            global: GlobalIpSettings {
                dns_servers: self.dns_servers.clone(),
                dns_suffixes: self.domain.iter().cloned().collect(),
            },
            domain: self.domain.clone(),
        }
    }

    fn options(&self) -> ProvisionOptions {
        let interval = Duration::from_millis(self.poll_interval_ms);
        ProvisionOptions {
            folder_fallback: if self.strict_folders {
                FolderFallback::Strict
            } else {
                FolderFallback::RootVmFolder
            },
            task_wait: TaskWaitPolicy {
                poll_interval: interval,
                timeout: self.task_timeout_secs.map(Duration::from_secs),
            },
            readiness: ReadinessPolicy {
                interval,
                max_attempts: Some(self.max_attempts),
                max_duration: self.max_wait_secs.map(Duration::from_secs),
            },
        }
    }

    fn credentials(&self) -> Result<Option<Credentials>> {
        let Some(user) = &self.user else {
            return Ok(None);
        };
        let password = match &self.password {
            Some(password) => password.clone(),
            None => Password::with_theme(&ColorfulTheme::default())
                .with_prompt(format!("Password for {user}"))
                .interact()
                .context("Failed to read password")?,
        };
        Ok(Some(Credentials {
            user: user.clone(),
            password,
        }))
    }
}

fn init_logging(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn print_report(outcome: &ProvisionOutcome) {
    println!("\nVM:          {} ({})", outcome.summary.name, outcome.vm.id);
    println!("Power state: {}", outcome.summary.power_state);
    println!("Template:    {}", outcome.summary.template);

    let Some(guest) = &outcome.guest else {
        return;
    };
    println!("IP address:  {}", guest.ip_address.as_deref().unwrap_or("-"));
    if let Some(host_name) = &guest.host_name {
        println!("Host name:   {host_name}");
    }
    println!("\n{:<20} {:<40} {:<6}", "MAC", "ADDRESS", "PREFIX");
    for nic in &guest.interfaces {
        for address in &nic.addresses {
            println!(
                "{:<20} {:<40} {:<6}",
                nic.mac_address, address.ip_address, address.prefix_length
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let credentials = cli.credentials()?;
    let plane = LocalInventory::connect(&cli.inventory, credentials.as_ref())
        .await
        .with_context(|| format!("Failed to open inventory {}", cli.inventory.display()))?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            on_signal.cancel();
        }
    });

    let result = provision(&plane, &cli.request(), &cli.options(), &cancel).await;

    if let Err(e) = plane.disconnect().await {
        warn!(error = %e, "Failed to close inventory session");
    }

    let outcome = result.with_context(|| format!("Failed to provision VM '{}'", cli.vm_name))?;
    info!(vm = %outcome.vm.name, "Provisioning finished");

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_report(&outcome);
    }

    Ok(())
}
