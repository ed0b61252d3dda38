//! Subcommand handlers for the `mpyboard` binary.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use crate::cli::{Cli, Commands, SessionArgs};
use crate::config::default_config_dir;
use crate::connection::DeviceConnection;
use crate::host::{wait_until_ready, Host};
use crate::registry::RegistryAction;
use mpyb_core::{
    ConnectionDescriptor, ConnectionStatus, ConsoleEvent, LineEnding, ReplError, ReplResult,
    TransportAddress,
};
use mpyb_repl::repl::{run_monitor, CommandRunner, FileSystem, MonitorScript};
use mpyb_serial::serial::{list_ports, PortInfo};

/// How long a one-shot command waits for CONNECTED.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(cli: Cli) -> ReplResult<()> {
    if let Commands::Ports { json } = &cli.command {
        return print_ports(*json).await;
    }

    let config_dir = match &cli.config_dir {
        Some(dir) => dir.clone(),
        None => default_config_dir()?,
    };
    let host = Host::open(&config_dir).await?;

    match cli.command {
        Commands::List { json } => list(&host, json).await,
        Commands::Add {
            name,
            url,
            port,
            baud,
            line_ending,
            timestamps,
        } => {
            let desc = build_descriptor(&host, name, url, port, baud, &line_ending, timestamps)
                .await?;
            println!("{}", desc.id);
            host.apply(RegistryAction::Add(desc)).await
        }
        Commands::Remove { connection } => {
            let conn = host.registry().find(&connection).await?;
            host.apply(RegistryAction::Remove(conn.id().to_string())).await
        }
        Commands::Ports { .. } => Ok(()),
        Commands::Console {
            connection,
            session,
        } => {
            let conn = prepare(&host, &connection, &session).await?;
            console(conn).await
        }
        Commands::Exec {
            connection,
            snippet,
            session,
        } => {
            let conn = open_device(&host, &connection, &session).await?;
            let result = conn.execute_command(&snippet).await;
            finish(&conn, result, |value| {
                println!("{}", serde_json::to_string_pretty(&value)?);
                Ok(())
            })
            .await
        }
        Commands::Ls {
            connection,
            path,
            session,
        } => {
            let conn = open_device(&host, &connection, &session).await?;
            let result = conn.list_files(&path).await;
            finish(&conn, result, |entries| {
                for e in entries {
                    let marker = if e.is_dir() { "d" } else { "-" };
                    println!("{} {:>10} {}", marker, e.size, e.name);
                }
                Ok(())
            })
            .await
        }
        Commands::Cat {
            connection,
            path,
            session,
        } => {
            let conn = open_device(&host, &connection, &session).await?;
            let result = conn.read_file(&path).await;
            finish(&conn, result, |content| {
                print!("{}", content);
                std::io::stdout().flush()?;
                Ok(())
            })
            .await
        }
        Commands::Put {
            connection,
            local,
            remote,
            session,
        } => {
            let content = read_local(&local).await?;
            let conn = open_device(&host, &connection, &session).await?;
            let result = conn.write_file(&remote, &content).await;
            finish(&conn, result, |_| Ok(())).await
        }
        Commands::Mkdir {
            connection,
            path,
            session,
        } => {
            let conn = open_device(&host, &connection, &session).await?;
            let result = conn.mkdir(&path).await;
            finish(&conn, result, |_| Ok(())).await
        }
        Commands::Rm {
            connection,
            path,
            session,
        } => {
            let conn = open_device(&host, &connection, &session).await?;
            let result = conn.rm(&path).await;
            finish(&conn, result, |_| Ok(())).await
        }
        Commands::Rmdir {
            connection,
            path,
            session,
        } => {
            let conn = open_device(&host, &connection, &session).await?;
            let result = conn.rmdir(&path).await;
            finish(&conn, result, |_| Ok(())).await
        }
        Commands::Monitor {
            connection,
            script,
            session,
        } => {
            let script = MonitorScript::parse(&script).ok_or_else(|| {
                ReplError::validation(format!(
                    "Unknown monitor script '{}' (system, gpio, i2c, wifi)",
                    script
                ))
            })?;
            let conn = open_device(&host, &connection, &session).await?;
            let result = run_monitor(&conn, script).await;
            finish(&conn, result, |value| {
                println!("{}", serde_json::to_string_pretty(&value)?);
                Ok(())
            })
            .await
        }
    }
}

// ── Saved connections ───────────────────────────────────────────────

async fn list(host: &Host, json: bool) -> ReplResult<()> {
    let descriptors = host.registry().descriptors().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&descriptors)?);
        return Ok(());
    }
    if descriptors.is_empty() {
        println!("No saved connections ({})", host.store().path().display());
    }
    for d in descriptors {
        println!(
            "{}  {:<8} {:<20} {}",
            d.id,
            d.kind().label(),
            d.name,
            d.target()
        );
    }
    Ok(())
}

async fn build_descriptor(
    host: &Host,
    name: String,
    url: Option<String>,
    port: Option<String>,
    baud: Option<u32>,
    line_ending: &str,
    timestamps: bool,
) -> ReplResult<ConnectionDescriptor> {
    let line_ending = LineEnding::parse(line_ending).ok_or_else(|| {
        ReplError::validation(format!(
            "Unknown line ending '{}' (none, lf, cr, crlf)",
            line_ending
        ))
    })?;
    let mut desc = match (url, port) {
        (Some(url), None) => ConnectionDescriptor::socket(name, url),
        (None, port) => {
            let baud = baud.unwrap_or(host.settings().default_baud_rate);
            let mut desc = ConnectionDescriptor::serial(name, port.clone(), baud);
            if let Some(port) = port {
                attach_identity(&mut desc, &port).await;
            }
            desc
        }
        (Some(_), Some(_)) => {
            return Err(ReplError::validation("Give either --url or --port, not both"))
        }
    };
    desc.line_ending = line_ending;
    desc.display.show_timestamp = timestamps;
    desc.validate()?;
    Ok(desc)
}

/// Remember the USB identity of `port` so it can be found again later.
async fn attach_identity(desc: &mut ConnectionDescriptor, port: &str) {
    let ports = match list_ports().await {
        Ok(ports) => ports,
        Err(e) => {
            log::warn!("[cli] port scan failed: {}", e);
            return;
        }
    };
    let found = ports.iter().find(|p| p.port_name == port).and_then(|p| p.identity);
    match (found, &mut desc.address) {
        (Some(id), TransportAddress::Serial { identity, .. }) => *identity = Some(id),
        _ => log::warn!(
            "[cli] {} has no USB identity; pass --port each time you use it",
            port
        ),
    }
}

async fn print_ports(json: bool) -> ReplResult<()> {
    let ports: Vec<PortInfo> = list_ports().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for p in ports {
        match p.identity {
            Some(id) => println!("{}  [{}]", p.display_name, id),
            None => println!("{}", p.display_name),
        }
    }
    Ok(())
}

async fn read_local(path: &Path) -> ReplResult<String> {
    tokio::fs::read_to_string(path).await.map_err(|e| {
        ReplError::validation(format!("Cannot read {}: {}", path.display(), e))
    })
}

// ── Device sessions ─────────────────────────────────────────────────

/// Look up the connection and apply the per-invocation overrides.
async fn prepare(host: &Host, key: &str, session: &SessionArgs) -> ReplResult<DeviceConnection> {
    let conn = host.registry().find(key).await?;
    let mut desc = conn.descriptor().await;
    if let Some(password) = &session.password {
        desc.password = Some(password.clone());
    }
    if let (Some(port), TransportAddress::Serial { port_name, .. }) =
        (&session.port, &mut desc.address)
    {
        *port_name = Some(port.clone());
    }
    conn.update_descriptor(desc).await?;
    Ok(conn)
}

async fn open_device(
    host: &Host,
    key: &str,
    session: &SessionArgs,
) -> ReplResult<DeviceConnection> {
    let conn = prepare(host, key, session).await?;
    conn.connect().await?;
    if let Err(e) = wait_until_ready(&conn, READY_TIMEOUT).await {
        let _ = conn.disconnect().await;
        return Err(e);
    }
    Ok(conn)
}

/// Print a successful result, then always disconnect.
async fn finish<T>(
    conn: &DeviceConnection,
    result: ReplResult<T>,
    print: impl FnOnce(T) -> ReplResult<()>,
) -> ReplResult<()> {
    let printed = result.and_then(print);
    if let Err(e) = conn.disconnect().await {
        log::warn!("[cli] disconnect failed: {}", e);
    }
    printed
}

async fn console(conn: DeviceConnection) -> ReplResult<()> {
    let mut events = conn.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ConsoleEvent::Output { text }) => {
                    print!("{}", text);
                    let _ = std::io::stdout().flush();
                }
                Ok(ConsoleEvent::SystemLine { text }) => println!("\n[{}]", text),
                Ok(ConsoleEvent::Cleared) => {
                    print!("\x1b[2J\x1b[H");
                    let _ = std::io::stdout().flush();
                }
                Ok(ConsoleEvent::StatusChanged { .. }) => {}
                Err(RecvError::Lagged(n)) => log::warn!("[cli] console skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    conn.connect().await?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = stdin.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break,
                };
                let awaiting_password = conn.status().await == ConnectionStatus::Password;
                let outcome = match line.trim() {
                    ".clear" => {
                        conn.clear_output().await;
                        Ok(())
                    }
                    ".reconnect" => conn.reconnect().await,
                    ".interrupt" => conn.send_data("\x03").await,
                    _ if awaiting_password => {
                        conn.send_password(line.trim()).await
                    }
                    _ => conn.send_command(&line).await,
                };
                if let Err(e) = outcome {
                    eprintln!("error: {}", e);
                }
            }
        }
    }

    conn.disconnect().await?;
    printer.abort();
    Ok(())
}
