//! `optad status`: check whether a daemon is running and speaks our contract.

use std::net::SocketAddr;
use std::time::Duration;

use opta_protocol::{ContractGate, HealthReport};

use crate::background::process_alive;
use crate::paths::DataPaths;
use crate::VERSION;

pub async fn run(paths: &DataPaths, bind: SocketAddr, auth_token: Option<&str>) -> anyhow::Result<()> {
    println!();
    println!("  Opta daemon v{}", VERSION);
    println!("  Data dir: {}", paths.root().display());

    let pid_path = paths.pid_file();
    let pid_alive = match read_pid(&pid_path) {
        Some(pid) if process_alive(pid) => {
            println!("  PID: {} (running)", pid);
            true
        }
        Some(pid) => {
            println!("  PID file: {} (stale, process not found)", pid);
            false
        }
        None => {
            println!("  PID file: not found");
            false
        }
    };

    let url = format!("http://{bind}/health");
    let health = match fetch_health(&url, auth_token).await {
        Ok(report) => Some(report),
        Err(e) => {
            if pid_alive {
                println!("  Health: unreachable at {url} ({e})");
                println!("          the daemon may be bound to a different address");
            } else {
                println!("  Health: unreachable");
            }
            None
        }
    };

    if let Some(report) = &health {
        match ContractGate::default().verify(report) {
            Ok(verified) => {
                println!("  Health: OK ({url})");
                println!(
                    "  Daemon: {} (contract {} v{})",
                    verified.daemon_id(),
                    verified.contract().name,
                    verified.contract().version
                );
                println!(
                    "  Sessions: {}  Background running: {}  Uptime: {}s",
                    report.sessions,
                    report.background_running,
                    report.uptime_ms / 1000
                );
            }
            Err(mismatch) => {
                println!("  Health: responding, but incompatible: {mismatch}");
            }
        }
    }

    let db_path = paths.db_path();
    match std::fs::metadata(&db_path) {
        Ok(meta) => println!("  Database: {} ({} KB)", db_path.display(), meta.len() / 1024),
        Err(_) => println!("  Database: not found"),
    }

    println!();
    if !pid_alive && health.is_none() {
        println!("  Daemon is not running.");
        println!("  Start with: optad start");
        println!();
    }
    Ok(())
}

fn read_pid(path: &std::path::Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse()
        .ok()
        .filter(|pid| *pid > 0)
}

async fn fetch_health(url: &str, auth_token: Option<&str>) -> anyhow::Result<HealthReport> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(1))
        .timeout(Duration::from_secs(2))
        .build()?;
    let mut request = client.get(url);
    if let Some(token) = auth_token {
        request = request.bearer_auth(token);
    }
    let report = request
        .send()
        .await?
        .error_for_status()?
        .json::<HealthReport>()
        .await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("optad.pid");
        assert_eq!(read_pid(&path), None);

        std::fs::write(&path, "4242\n").unwrap();
        assert_eq!(read_pid(&path), Some(4242));

        std::fs::write(&path, "0").unwrap();
        assert_eq!(read_pid(&path), None);

        std::fs::write(&path, "garbage").unwrap();
        assert_eq!(read_pid(&path), None);
    }
}
