//! Probe command - send one request through the racer

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use colored::Colorize;
use detour_core::{Config, Conn, Dialer, Network, PathKind, Whitelist};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info};

use super::config::default_whitelist_path;
use super::whitelist::save as save_whitelist;
use crate::upstream::HttpConnectDial;

/// Largest response prefix read while looking for the status line
const MAX_STATUS_PREFIX: usize = 4096;

/// Probe command arguments
#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Destination (host:port)
    pub target: String,

    /// HTTP CONNECT proxy used as the detour (host:port)
    #[arg(long, value_name = "PROXY", env = "DETOUR_PROXY")]
    pub via: String,

    /// Request method
    #[arg(short, long, value_enum, default_value = "head")]
    pub method: Method,

    /// Request path
    #[arg(short, long, default_value = "/")]
    pub path: String,

    /// Host header (default: host part of the target)
    #[arg(long)]
    pub host: Option<String>,

    /// Network: tcp, tcp4 or tcp6
    #[arg(short, long, default_value = "tcp")]
    pub network: String,

    /// Connect timeout in seconds (overrides config)
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Head start for the direct path in milliseconds (overrides config)
    #[arg(long, value_name = "MS")]
    pub delay_before_detour: Option<u64>,

    /// Country code for the detector rules (overrides config)
    #[arg(long)]
    pub country: Option<String>,

    /// Do not write what was learned back to the whitelist file
    #[arg(long)]
    pub no_save: bool,
}

/// Request methods the probe can send
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Method {
    /// HEAD request (replayable)
    Head,
    /// GET request (replayable)
    Get,
    /// POST request with an empty body (never replayed)
    Post,
}

impl Method {
    fn as_str(self) -> &'static str {
        match self {
            Self::Head => "HEAD",
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// Execute probe command
pub fn execute(args: ProbeArgs, config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(probe(args, config))
}

async fn probe(args: ProbeArgs, mut config: Config) -> Result<()> {
    if let Some(secs) = args.timeout {
        config.dial.timeout_to_connect_secs = secs;
    }
    if let Some(ms) = args.delay_before_detour {
        config.dial.delay_before_detour_ms = ms;
    }
    if let Some(country) = &args.country {
        config.detector.country = country.clone();
    }
    if config.whitelist.file.is_none() {
        config.whitelist.file = Some(default_whitelist_path().display().to_string());
    }
    config.validate().context("Invalid probe settings")?;

    let network: Network = args.network.parse()?;
    let whitelist = Arc::new(config.whitelist.build().context("Failed to load whitelist")?);
    let (direct_ok_tx, mut direct_ok_rx) = mpsc::channel(1);
    let dialer = Dialer::builder(HttpConnectDial::new(args.via.clone()))
        .config(&config)
        .whitelist(Arc::clone(&whitelist))
        .notify_direct_ok(direct_ok_tx)
        .build();
    let settings = dialer.settings();

    let skipped_race = whitelist.contains(&args.target);
    println!("Probing {} via {}", args.target.cyan(), args.via.cyan());
    if skipped_race {
        println!("  {} Whitelisted, dialing detour only", "●".yellow());
    }

    let started = Instant::now();
    let conn = dialer
        .dial(network, &args.target)
        .await
        .with_context(|| format!("Failed to connect to {}", args.target))?;
    println!("  {} Connected in {:?}", "✓".green(), started.elapsed());

    let host = args
        .host
        .clone()
        .unwrap_or_else(|| host_of(&args.target).to_string());
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: detour/{}\r\nConnection: close\r\n{}\r\n",
        args.method.as_str(),
        args.path,
        host,
        env!("CARGO_PKG_VERSION"),
        if matches!(args.method, Method::Post) { "Content-Length: 0\r\n" } else { "" },
    );
    conn.write(request.as_bytes()).await.context("Failed to send request")?;
    debug!("Sent {} byte request", request.len());

    let status = timeout(settings.timeout_to_connect, read_status_line(&conn)).await;
    let paths = conn.paths().await.unwrap_or_default();
    let peer = conn.peer_addr().await.ok();
    let received = conn.bytes_received();
    conn.close().await.context("Failed to close connection")?;

    match status {
        Ok(Ok(Some(line))) => println!("  {} {}", "✓".green(), line.bold()),
        Ok(Ok(None)) => println!("  {} Connection closed without a response", "✗".red()),
        Ok(Err(e)) => println!("  {} Read failed: {}", "✗".red(), e),
        Err(_) => println!("  {} No response within {:?}", "✗".red(), settings.timeout_to_connect),
    }
    println!("  Path: {}", describe_paths(&paths));
    if let Some(peer) = peer {
        println!("  Peer: {}", peer);
    }
    println!("  Received: {} bytes", received);

    // Give the direct path's close notification a moment to land
    let direct_ok = timeout(Duration::from_millis(50), direct_ok_rx.recv())
        .await
        .ok()
        .flatten()
        .is_some();
    if direct_ok {
        println!("  {} Works without detour", "✓".green());
    }
    println!("  Whitelist: {}", describe_entry(&whitelist, &args.target));

    if !args.no_save {
        save_whitelist(&whitelist)?;
        if let Some(file) = whitelist.file() {
            info!("Saved whitelist to {}", file.display());
        }
    }
    Ok(())
}

/// Read until the first line of the response is complete
async fn read_status_line(conn: &Conn) -> std::io::Result<Option<String>> {
    let mut response = Vec::new();
    let mut buf = [0u8; 1024];
    while response.len() < MAX_STATUS_PREFIX {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);
        if response.contains(&b'\n') {
            break;
        }
    }
    Ok(status_line(&response))
}

fn status_line(response: &[u8]) -> Option<String> {
    let line = response.split(|&b| b == b'\n').next()?;
    let line = String::from_utf8_lossy(line).trim_end().to_string();
    (!line.is_empty()).then_some(line)
}

fn host_of(target: &str) -> &str {
    target.rsplit_once(':').map_or(target, |(host, _)| host)
}

fn describe_paths(paths: &[PathKind]) -> String {
    match paths {
        [] => "none left".to_string(),
        [only] => only.to_string(),
        _ => paths
            .iter()
            .map(PathKind::to_string)
            .collect::<Vec<_>>()
            .join(" + "),
    }
}

fn describe_entry(whitelist: &Whitelist, addr: &str) -> String {
    if whitelist.is_permanent(addr) {
        "permanent".green().to_string()
    } else if whitelist.is_temporary(addr) {
        "temporary (this run only)".yellow().to_string()
    } else {
        "not listed".dimmed().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_line() {
        assert_eq!(
            status_line(b"HTTP/1.1 200 OK\r\nServer: x\r\n").as_deref(),
            Some("HTTP/1.1 200 OK")
        );
        assert_eq!(status_line(b"HTTP/1.1 301 Moved").as_deref(), Some("HTTP/1.1 301 Moved"));
        assert_eq!(status_line(b""), None);
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("example.com:443"), "example.com");
        assert_eq!(host_of("[::1]:80"), "[::1]");
        assert_eq!(host_of("example.com"), "example.com");
    }

    #[test]
    fn test_describe_paths() {
        assert_eq!(describe_paths(&[]), "none left");
        assert_eq!(describe_paths(&[PathKind::Detour]), "detour");
        assert_eq!(
            describe_paths(&[PathKind::Direct, PathKind::Detour]),
            "direct + detour"
        );
    }
}
