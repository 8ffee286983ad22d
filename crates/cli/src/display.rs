// dbtunnel - CLI Output
// Tables, spinners and error reporting for the terminal

use std::time::Duration;

use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use indicatif::{ProgressBar, ProgressStyle};

use dbtunnel_common::{
    format_host_port, ConnectErrorInfo, ConnectionTestReport, Profile, StepStatus,
};
use dbtunnel_tunnel::{KnownHostEntry, SshTunnel};

const SPINNER_TICK: Duration = Duration::from_millis(100);

/// Spinner on stderr, cleared by the caller once the operation finishes
pub fn spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message);
    pb.enable_steady_tick(SPINNER_TICK);
    pb
}

fn header(names: &[&str]) -> Vec<Cell> {
    names
        .iter()
        .map(|name| {
            Cell::new(name)
                .add_attribute(Attribute::Bold)
                .fg(Color::Cyan)
        })
        .collect()
}

fn new_table(columns: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header(columns));
    table
}

pub fn announce_forwarding(tunnel: &SshTunnel) {
    println!();
    println!(
        "{}",
        format!(
            "✓ Tunnel connected! Forwarding 127.0.0.1:{} → {}",
            tunnel.local_port(),
            tunnel.remote()
        )
        .green()
        .bold()
    );
    println!();
    println!(
        "Point your database client at {}",
        format!("127.0.0.1:{}", tunnel.local_port()).cyan()
    );
    println!("{}", "Tunnel is running. Press Ctrl+C to stop".dimmed());
}

pub fn print_profiles_table(profiles: &[Profile]) {
    let mut table = new_table(&["Name", "Database", "SSH Tunnel", "Local Port"]);

    for profile in profiles {
        let database = format!(
            "{}@{}",
            profile.database.user,
            format_host_port(&profile.database.host, profile.database.port)
        );

        let ssh = &profile.ssh_tunnel;
        let (tunnel, local_port) = if ssh.enabled {
            let user = ssh.user.as_deref().map(|u| format!("{}@", u)).unwrap_or_default();
            let local = if ssh.local_port == 0 {
                "auto".to_string()
            } else {
                ssh.local_port.to_string()
            };
            (format!("{}{}", user, format_host_port(&ssh.host, ssh.port)), local)
        } else {
            ("-".to_string(), "-".to_string())
        };

        table.add_row(vec![
            Cell::new(&profile.metadata.name),
            Cell::new(database),
            Cell::new(tunnel),
            Cell::new(local_port),
        ]);
    }

    println!("{table}");
}

pub fn print_profile(profile: &Profile) {
    println!();
    println!(
        "{}",
        format!("Profile: {}", profile.metadata.name).bold().green()
    );
    println!("  ID: {}", profile.metadata.id.to_string().dimmed());

    if let Some(desc) = &profile.metadata.description {
        println!("  Description: {}", desc);
    }

    println!();
    println!("{}", "  Database:".bold());
    println!("    Host:     {}", profile.database.host);
    println!("    Port:     {}", profile.database.port);
    println!("    User:     {}", profile.database.user);
    println!("    Password: {}", secret_marker(profile.database.password.as_deref()));

    let ssh = &profile.ssh_tunnel;
    println!();
    if ssh.enabled {
        println!("{}", "  SSH Tunnel:".bold());
        println!("    Host:       {}", ssh.host);
        println!("    Port:       {}", ssh.port);
        println!(
            "    User:       {}",
            ssh.user.as_deref().unwrap_or("(current user)")
        );
        println!("    Password:   {}", secret_marker(ssh.password.as_deref()));
        if let Some(path) = &ssh.identity_file {
            println!("    Key:        {}", path.display());
        }
        if ssh.local_port == 0 {
            println!("    Local Port: auto");
        } else {
            println!("    Local Port: {}", ssh.local_port);
        }
    } else {
        println!("{}", "  SSH Tunnel: disabled".dimmed());
    }

    println!();
    println!(
        "  Created:  {}",
        profile.metadata.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "  Modified: {}",
        profile.metadata.modified_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!();
}

fn secret_marker(value: Option<&str>) -> String {
    match value {
        Some(v) if !v.is_empty() => "(set)".to_string(),
        _ => "(not set)".dimmed().to_string(),
    }
}

fn status_cell(status: StepStatus) -> Cell {
    let color = match status {
        StepStatus::Success => Color::Green,
        StepStatus::Failed => Color::Red,
        StepStatus::Skipped => Color::DarkGrey,
        StepStatus::Disabled => Color::Yellow,
    };
    Cell::new(status.to_string()).fg(color)
}

pub fn print_report(profile: &Profile, report: &ConnectionTestReport) {
    let mut table = new_table(&["Step", "Status", "Time", "Detail"]);

    for step in &report.steps {
        let time = match step.status {
            StepStatus::Success | StepStatus::Failed => {
                format!("{} ms", step.duration.as_millis())
            }
            _ => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(&step.name),
            status_cell(step.status),
            Cell::new(time),
            Cell::new(&step.detail),
        ]);
    }

    println!();
    println!("{}", format!("Connection test: {}", profile.metadata.name).bold());
    println!("{table}");

    if report.healthy() {
        let endpoint = report.endpoint.as_deref().unwrap_or("-");
        println!(
            "{}",
            format!(
                "✓ Reachable at {} ({} ms total)",
                endpoint,
                report.total.as_millis()
            )
            .green()
            .bold()
        );
    } else {
        println!(
            "{}",
            format!("✗ Connection test failed ({} ms total)", report.total.as_millis())
                .red()
                .bold()
        );
    }
}

pub fn print_known_hosts_table(entries: &[KnownHostEntry]) {
    let mut table = new_table(&["Host", "Key Type", "Fingerprint", "Line"]);

    for entry in entries {
        table.add_row(vec![
            Cell::new(&entry.host_pattern),
            Cell::new(&entry.key_type),
            Cell::new(entry.fingerprint()),
            Cell::new(entry.line_number),
        ]);
    }

    println!("{table}");
}

/// Print an error and every cause underneath it
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);
    for cause in err.chain().skip(1) {
        eprintln!("  {} {}", "caused by:".dimmed(), cause);
    }
}

pub fn print_hints(info: &ConnectErrorInfo) {
    if info.hints.is_empty() {
        return;
    }

    eprintln!();
    eprintln!("{}", info.title.yellow().bold());
    for hint in &info.hints {
        eprintln!("  • {}", hint);
    }
}
