// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 dbtunnel Contributors

// dbtunnel - CLI Client
// Command-line interface for SSH tunnels to MySQL/MariaDB servers

mod display;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use dialoguer::{Confirm, Password};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dbtunnel_common::{
    delete_profile_by_name, describe_connect_error, format_host_port, load_all_profiles,
    load_profile_by_name, save_profile, AgentSource, AppConfig, DatabaseEndpoint, Error, Profile,
    SshTunnelSettings, TunnelConfig, Zeroizing,
};
use dbtunnel_tunnel::{preflight, test_connection, HostKeyPolicy, KnownHosts, SshTunnel};

#[derive(Parser)]
#[command(name = "dbtunnel")]
#[command(about = "SSH tunnels for MySQL/MariaDB backups", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Forward a local port to a database through an SSH bastion
    Forward(ForwardArgs),

    /// Run a step-by-step connectivity check for a profile
    Test {
        /// Profile name
        profile: String,

        /// Output the report as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Profile management
    Profile {
        #[command(subcommand)]
        action: ProfileCommands,
    },

    /// Trusted SSH host keys
    KnownHosts {
        #[command(subcommand)]
        action: KnownHostsCommands,
    },
}

#[derive(Args)]
struct ForwardArgs {
    /// Use the SSH and database settings of a saved profile
    #[arg(long, conflicts_with_all = ["ssh_host", "remote_host"])]
    profile: Option<String>,

    /// SSH bastion host
    #[arg(short = 'H', long, required_unless_present = "profile")]
    ssh_host: Option<String>,

    /// SSH bastion port
    #[arg(short = 'P', long, default_value_t = 22)]
    ssh_port: u16,

    /// SSH username (defaults to the current user)
    #[arg(short = 'u', long)]
    ssh_user: Option<String>,

    /// Path to an SSH private key
    #[arg(short = 'i', long)]
    identity_file: Option<PathBuf>,

    /// Prompt for the SSH password
    #[arg(long)]
    ask_password: bool,

    /// Prompt for the identity file passphrase
    #[arg(long)]
    ask_passphrase: bool,

    /// Do not use ssh-agent
    #[arg(long)]
    no_agent: bool,

    /// Local port to listen on (0 picks a free port)
    #[arg(short = 'l', long)]
    local_port: Option<u16>,

    /// Database host as seen from the bastion
    #[arg(short = 'r', long, required_unless_present = "profile")]
    remote_host: Option<String>,

    /// Database port
    #[arg(short = 'p', long, default_value_t = 3306)]
    remote_port: u16,
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// List all profiles
    List {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Show detailed information about a profile
    Show {
        /// Profile name
        name: String,
    },

    /// Add a new profile
    Add(AddProfileArgs),

    /// Delete a profile
    Delete {
        /// Profile name
        name: String,

        /// Do not ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

#[derive(Args)]
struct AddProfileArgs {
    /// Profile name
    name: String,

    /// Database host
    #[arg(long)]
    db_host: String,

    /// Database port
    #[arg(long, default_value_t = 3306)]
    db_port: u16,

    /// Database user
    #[arg(long)]
    db_user: String,

    /// Prompt for the database password and store it in the profile
    #[arg(long)]
    ask_db_password: bool,

    /// Free-form description
    #[arg(short, long)]
    description: Option<String>,

    /// SSH bastion host (enables the tunnel)
    #[arg(long)]
    ssh_host: Option<String>,

    /// SSH bastion port
    #[arg(long, default_value_t = 22)]
    ssh_port: u16,

    /// SSH username
    #[arg(long)]
    ssh_user: Option<String>,

    /// Path to an SSH private key
    #[arg(long)]
    identity_file: Option<PathBuf>,

    /// Prompt for the SSH password and store it in the profile
    #[arg(long)]
    ask_ssh_password: bool,

    /// Local port for the tunnel (0 picks a free port)
    #[arg(long, default_value_t = 0)]
    local_port: u16,

    /// Replace an existing profile with the same name
    #[arg(short, long)]
    force: bool,
}

#[derive(Subcommand)]
enum KnownHostsCommands {
    /// List trusted host keys
    List,
    /// Print the path of the known_hosts file in use
    Path,
    /// Remove the trusted key(s) for a host
    Forget {
        /// Host name or IP as it was used for the connection
        host: String,

        /// SSH port
        #[arg(short, long, default_value_t = 22)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            display::print_error(&err);
            let info = describe_connect_error(&format!("{:#}", err));
            display::print_hints(&info);
            ExitCode::from(exit_status(&err))
        }
    }
}

/// Distinct exit codes for the failure classes scripts most often branch on
fn exit_status(err: &anyhow::Error) -> u8 {
    let Some(err) = err.chain().find_map(|e| e.downcast_ref::<Error>()) else {
        return 1;
    };

    if err.is_config() {
        2
    } else if err.is_trust() {
        3
    } else if err.is_network() {
        4
    } else {
        1
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "dbtunnel=debug" } else { "dbtunnel=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Forward(args) => forward(args).await?,
        Commands::Test { profile, json } => return test_profile(profile, json).await,
        Commands::Profile { action } => match action {
            ProfileCommands::List { json } => list_profiles(json)?,
            ProfileCommands::Show { name } => show_profile(name)?,
            ProfileCommands::Add(args) => add_profile(args)?,
            ProfileCommands::Delete { name, yes } => delete_profile(name, yes)?,
        },
        Commands::KnownHosts { action } => {
            let app = load_app_config()?;
            match action {
                KnownHostsCommands::List => list_known_hosts(&app)?,
                KnownHostsCommands::Path => {
                    let store = open_known_hosts(&app)?;
                    println!("{}", store.path().display());
                }
                KnownHostsCommands::Forget { host, port } => forget_host(&app, &host, port)?,
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn load_app_config() -> Result<AppConfig> {
    AppConfig::load().context("Failed to load dbtunnel configuration")
}

fn host_key_policy(app: &AppConfig) -> Result<HostKeyPolicy> {
    HostKeyPolicy::from_env(app.known_hosts_path.as_deref())
        .context("Failed to set up SSH host key verification")
}

fn open_known_hosts(app: &AppConfig) -> Result<KnownHosts> {
    let store = match &app.known_hosts_path {
        Some(path) => KnownHosts::open(path)?,
        None => KnownHosts::open_default()?,
    };
    Ok(store)
}

fn prompt_secret(prompt: &str) -> Result<Zeroizing<String>> {
    let value = Password::new()
        .with_prompt(prompt)
        .allow_empty_password(true)
        .interact()
        .context("Failed to read password input")?;
    Ok(Zeroizing::new(value))
}

/// Build the tunnel configuration from command-line flags or a profile
fn forward_config(args: &ForwardArgs, app: &AppConfig) -> Result<TunnelConfig> {
    let mut config = match &args.profile {
        Some(name) => {
            let profile = load_profile_by_name(name)?;
            preflight(&profile)?;
            if !profile.ssh_tunnel.enabled {
                anyhow::bail!("Profile '{}' does not use an SSH tunnel", name);
            }
            profile.tunnel_config(app)
        }
        None => TunnelConfig {
            ssh_host: args.ssh_host.clone().unwrap_or_default(),
            ssh_port: args.ssh_port,
            ssh_user: args.ssh_user.clone(),
            identity_file: args.identity_file.clone(),
            remote_host: args.remote_host.clone().unwrap_or_default(),
            remote_port: args.remote_port,
            connect_timeout: app.connect_timeout(),
            keepalive_interval: app.keepalive_interval(),
            ..Default::default()
        },
    };

    if let Some(port) = args.local_port {
        config.local_port = port;
    }
    if args.profile.is_some() {
        if let Some(user) = &args.ssh_user {
            config.ssh_user = Some(user.clone());
        }
        if let Some(path) = &args.identity_file {
            config.identity_file = Some(path.clone());
        }
    }
    if args.no_agent {
        config.agent = AgentSource::Disabled;
    }
    if args.ask_password {
        config.password = Some(prompt_secret("SSH password")?);
    }
    if args.ask_passphrase {
        config.identity_passphrase = Some(prompt_secret("Identity file passphrase")?);
    }

    config.validate()?;
    Ok(config)
}

async fn forward(args: ForwardArgs) -> Result<()> {
    let app = load_app_config()?;
    let config = forward_config(&args, &app)?;
    let policy = host_key_policy(&app)?;

    let bastion = format_host_port(&config.ssh_host, config.effective_ssh_port());
    let spinner = display::spinner(format!("Connecting to {}...", bastion));
    let started = SshTunnel::start(config, &policy).await;
    spinner.finish_and_clear();
    let tunnel = started.with_context(|| format!("SSH tunnel via {} failed", bastion))?;

    display::announce_forwarding(&tunnel);

    wait_for_shutdown().await?;

    println!("{}", "Stopping tunnel...".yellow());
    tunnel.stop().await?;

    let stats = tunnel.stats();
    println!(
        "{}",
        format!(
            "✓ Tunnel stopped ({} connections, {} bytes sent, {} bytes received)",
            stats.total_connections(),
            stats.bytes_to_remote(),
            stats.bytes_from_remote()
        )
        .green()
        .bold()
    );
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("Failed to install SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}

async fn test_profile(name: String, json: bool) -> Result<ExitCode> {
    let app = load_app_config()?;
    let profile = load_profile_by_name(&name)?;
    let policy = host_key_policy(&app)?;

    let spinner = display::spinner(format!("Testing '{}'...", profile.metadata.name));
    let report = test_connection(&profile, &app, &policy).await;
    spinner.finish_and_clear();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        display::print_report(&profile, &report);
        if let Some(error) = &report.error {
            display::print_hints(&describe_connect_error(error));
        }
    }

    Ok(if report.healthy() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn list_profiles(json: bool) -> Result<()> {
    let profiles = load_all_profiles()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&profiles)?);
        return Ok(());
    }

    if profiles.is_empty() {
        println!("{}", "No profiles found.".yellow());
        println!("Create one with: {}", "dbtunnel profile add <name>".cyan());
        return Ok(());
    }

    display::print_profiles_table(&profiles);
    Ok(())
}

fn show_profile(name: String) -> Result<()> {
    let profile = load_profile_by_name(&name)?;
    display::print_profile(&profile);
    Ok(())
}

fn add_profile(args: AddProfileArgs) -> Result<()> {
    let db_password = if args.ask_db_password {
        Some(prompt_secret("Database password")?.to_string())
    } else {
        None
    };

    let mut profile = Profile::new(
        args.name.clone(),
        DatabaseEndpoint {
            host: args.db_host,
            port: args.db_port,
            user: args.db_user,
            password: db_password,
        },
    );
    profile.metadata.description = args.description;

    if let Some(ssh_host) = args.ssh_host {
        let ssh_password = if args.ask_ssh_password {
            Some(prompt_secret("SSH password")?.to_string())
        } else {
            None
        };
        profile.ssh_tunnel = SshTunnelSettings {
            enabled: true,
            host: ssh_host,
            port: args.ssh_port,
            user: args.ssh_user,
            password: ssh_password,
            identity_file: args.identity_file,
            local_port: args.local_port,
        };
    }

    let path = save_profile(&profile, args.force)?;

    println!();
    println!(
        "{}",
        format!("✓ Profile '{}' saved", profile.metadata.name)
            .green()
            .bold()
    );
    println!("  Location: {}", path.display().to_string().dimmed());
    println!();
    println!(
        "Test it with: {}",
        format!("dbtunnel test {}", profile.metadata.name).cyan()
    );
    Ok(())
}

fn delete_profile(name: String, yes: bool) -> Result<()> {
    // Fail on unknown names before asking anything
    load_profile_by_name(&name)?;

    if !yes {
        let confirm = Confirm::new()
            .with_prompt(format!(
                "Are you sure you want to delete profile '{}'?",
                name.yellow()
            ))
            .default(false)
            .interact()?;

        if !confirm {
            println!("{}", "Deletion cancelled".dimmed());
            return Ok(());
        }
    }

    let path = delete_profile_by_name(&name)?;
    println!("{}", format!("Profile '{}' deleted", name).green());
    println!("  Removed: {}", path.display().to_string().dimmed());
    Ok(())
}

fn list_known_hosts(app: &AppConfig) -> Result<()> {
    let store = open_known_hosts(app)?;
    let entries = store.entries();

    if entries.is_empty() {
        println!(
            "{}",
            format!("No trusted host keys in {}", store.path().display()).yellow()
        );
        return Ok(());
    }

    display::print_known_hosts_table(&entries);
    println!("{}", store.path().display().to_string().dimmed());
    Ok(())
}

fn forget_host(app: &AppConfig, host: &str, port: u16) -> Result<()> {
    let store = open_known_hosts(app)?;
    let removed = store.remove(host, port)?;

    let target = format_host_port(host, port);
    if removed == 0 {
        println!("{}", format!("No trusted key found for {}", target).yellow());
    } else {
        println!(
            "{}",
            format!("✓ Removed {} key(s) for {}", removed, target).green()
        );
    }
    Ok(())
}
