//! keyfob: host companion for the KeyFob vault device.
//!
//! Credentials are staged locally and pushed to the device as one atomic
//! batch over an authenticated, encrypted serial link. Secrets leave the
//! host only inside the transport envelope and are never printed.
mod config;
mod staging;
mod sync;
mod transport;

use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use zeroize::Zeroizing;

use config::{HostConfig, STAGING_FILE};
use shared::record::SecretString;
use shared::schema::{DeviceResponse, HostRequest, PROTOCOL_VERSION, StatusRequest};
use staging::StagingList;
use sync::run_sync;
use transport::{
    DeviceTransport, FramedTransport, detect_first_serial_port, list_candidate_ports,
    open_serial_port,
};

#[derive(Parser)]
#[command(name = "keyfob", version, about = "Host companion for the KeyFob vault")]
struct Cli {
    /// Serial port of the vault device (overrides config and detection).
    #[arg(long, global = true)]
    port: Option<String>,

    /// Connect to the first USB serial device instead of matching VID/PID.
    #[arg(long, global = true)]
    any_port: bool,

    /// Directory holding config.json and staging.json.
    #[arg(long, global = true, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List serial ports that look like a vault device.
    Detect,
    /// Query the device for lock state and record count.
    Status,
    /// Stage a credential for the next push. The secret is read from stdin.
    Add {
        /// Service the credential belongs to, e.g. "example.org".
        service: String,
        /// Account name on that service.
        username: String,
        /// Icon name shown on the device.
        #[arg(long, default_value = "key")]
        icon: String,
    },
    /// Show credentials staged for the next push.
    List,
    /// Drop a staged credential before it is pushed.
    Remove {
        /// Id printed by `add` or `list`.
        id: Uuid,
    },
    /// Push all staged credentials to the device as one atomic batch.
    Push,
    /// Forget the pinned device identity. The next push pins anew.
    ForgetDevice,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let Cli {
        port,
        any_port,
        config_dir,
        command,
    } = Cli::parse();
    let dir = config_dir.unwrap_or_else(config::config_dir);
    let config_path = config::config_path(&dir);
    let staging_path = dir.join(STAGING_FILE);

    let mut config = HostConfig::load(&config_path)?;
    let conn = ConnectOpts { port, any_port };

    match command {
        Command::Detect => detect(),
        Command::Status => status(&conn, &config),
        Command::Add {
            service,
            username,
            icon,
        } => add(&staging_path, service, username, icon),
        Command::List => list(&staging_path),
        Command::Remove { id } => remove(&staging_path, &id),
        Command::Push => push(&conn, &mut config, &config_path, &staging_path),
        Command::ForgetDevice => {
            config.pinned_identity = None;
            config.save(&config_path)?;
            println!("Pinned device identity forgotten.");
            Ok(())
        }
    }
}

/// Connection settings taken off the command line.
struct ConnectOpts {
    port: Option<String>,
    any_port: bool,
}

fn resolve_port(conn: &ConnectOpts, config: &HostConfig) -> Result<String> {
    if let Some(port) = &conn.port {
        return Ok(port.clone());
    }
    if let Some(port) = &config.port {
        return Ok(port.clone());
    }
    Ok(detect_first_serial_port(conn.any_port)?)
}

fn connect(conn: &ConnectOpts, config: &HostConfig) -> Result<transport::SerialTransport> {
    let port = resolve_port(conn, config)?;
    let serial = open_serial_port(&port)?;
    Ok(FramedTransport::new(serial))
}

fn detect() -> Result<()> {
    let ports = list_candidate_ports()?;
    if ports.is_empty() {
        println!("No vault device found.");
        return Ok(());
    }
    for info in ports {
        println!("{}", info.port_name);
    }
    Ok(())
}

fn status(conn: &ConnectOpts, config: &HostConfig) -> Result<()> {
    let mut transport = connect(conn, config)?;
    let response = transport.exchange(&HostRequest::Status(StatusRequest {
        protocol_version: PROTOCOL_VERSION,
    }))?;
    match response {
        DeviceResponse::Status(status) => {
            println!(
                "Vault: {} | records: {} | generation: {}{}",
                if status.locked { "locked" } else { "unlocked" },
                status.record_count,
                status.vault_generation,
                if status.session_active {
                    " | sync in progress"
                } else {
                    ""
                },
            );
            Ok(())
        }
        other => bail!("unexpected response to status request: {other:?}"),
    }
}

fn add(staging_path: &std::path::Path, service: String, username: String, icon: String) -> Result<()> {
    let secret = read_secret()?;
    if secret.is_empty() {
        bail!("refusing to stage an empty secret");
    }

    let mut staging = StagingList::load(staging_path)?;
    let id = staging.stage(service, username, SecretString::new(secret.to_string()), icon);
    staging.save(staging_path)?;

    println!("Staged {id} ({} pending).", staging.len());
    Ok(())
}

fn read_secret() -> Result<Zeroizing<String>> {
    eprint!("Secret: ");
    let mut line = Zeroizing::new(String::new());
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read secret from stdin")?;
    let trimmed = Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_string());
    Ok(trimmed)
}

fn list(staging_path: &std::path::Path) -> Result<()> {
    let staging = StagingList::load(staging_path)?;
    if staging.is_empty() {
        println!("Nothing staged.");
        return Ok(());
    }
    for record in &staging.records {
        println!(
            "{}  v{}  {} / {}",
            record.id, record.version, record.service_name, record.username
        );
    }
    println!("{} credential(s) staged.", staging.len());
    Ok(())
}

fn remove(staging_path: &std::path::Path, id: &Uuid) -> Result<()> {
    let mut staging = StagingList::load(staging_path)?;
    if !staging.remove(id) {
        bail!("no staged credential with id {id}");
    }
    staging.save(staging_path)?;
    println!("Removed {id} ({} pending).", staging.len());
    Ok(())
}

fn push(
    conn: &ConnectOpts,
    config: &mut HostConfig,
    config_path: &std::path::Path,
    staging_path: &std::path::Path,
) -> Result<()> {
    let mut staging = StagingList::load(staging_path)?;
    if staging.is_empty() {
        println!("Nothing staged; nothing to push.");
        return Ok(());
    }

    let pinned = config.pinned_identity_bytes()?;
    let first_sync = pinned.is_none();
    let mut transport = connect(conn, config)?;

    let (report, identity) = run_sync(&mut transport, &mut staging, pinned, &mut rand::rngs::OsRng)
        .context("sync failed; staged credentials were kept")?;
    staging.save(staging_path)?;

    if first_sync {
        config.pin_identity(&identity);
        config.save(config_path)?;
        println!(
            "Pinned device identity {}.",
            config::encode_hex(&identity)
        );
    }
    println!(
        "Pushed {} credential(s); vault generation {}.",
        report.pushed, report.generation
    );
    Ok(())
}
