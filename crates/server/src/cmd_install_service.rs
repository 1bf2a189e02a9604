//! `optad install-service`: generate and optionally enable a user service.
//!
//! macOS: ~/Library/LaunchAgents/dev.opta.daemon.plist
//! Linux: ~/.config/systemd/user/optad.service

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;

pub const LAUNCHD_LABEL: &str = "dev.opta.daemon";
pub const SYSTEMD_UNIT: &str = "optad.service";

const LAUNCHD_TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>dev.opta.daemon</string>
    <key>ProgramArguments</key>
    <array>
        <string>{{BINARY_PATH}}</string>
        <string>start</string>
        <string>--bind</string>
        <string>{{BIND_ADDR}}</string>
        <string>--data-dir</string>
        <string>{{DATA_DIR}}</string>
    </array>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <true/>
    <key>StandardOutPath</key>
    <string>{{DATA_DIR}}/logs/launchd-stdout.log</string>
    <key>StandardErrorPath</key>
    <string>{{DATA_DIR}}/logs/launchd-stderr.log</string>
</dict>
</plist>
"#;

const SYSTEMD_TEMPLATE: &str = r#"[Unit]
Description=Opta daemon (session and turn orchestration for local agents)
After=network.target

[Service]
Type=simple
ExecStart={{BINARY_PATH}} start --bind {{BIND_ADDR}} --data-dir {{DATA_DIR}}
Restart=on-failure
RestartSec=5

[Install]
WantedBy=default.target
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceManager {
    Launchd,
    Systemd,
}

impl ServiceManager {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Self::Launchd
        } else {
            Self::Systemd
        }
    }

    fn unit_path(self, home: &Path) -> PathBuf {
        match self {
            Self::Launchd => home
                .join("Library/LaunchAgents")
                .join(format!("{LAUNCHD_LABEL}.plist")),
            Self::Systemd => home.join(".config/systemd/user").join(SYSTEMD_UNIT),
        }
    }
}

/// A rendered unit file and where it belongs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceUnit {
    pub manager: ServiceManager,
    pub path: PathBuf,
    pub contents: String,
}

pub fn render_for(
    manager: ServiceManager,
    home: &Path,
    binary_path: &str,
    bind: SocketAddr,
    data_dir: &Path,
) -> ServiceUnit {
    let template = match manager {
        ServiceManager::Launchd => LAUNCHD_TEMPLATE,
        ServiceManager::Systemd => SYSTEMD_TEMPLATE,
    };
    let contents = template
        .replace("{{BINARY_PATH}}", binary_path)
        .replace("{{BIND_ADDR}}", &bind.to_string())
        .replace("{{DATA_DIR}}", &data_dir.to_string_lossy());
    ServiceUnit {
        manager,
        path: manager.unit_path(home),
        contents,
    }
}

/// Render the unit for this platform and the running binary.
pub fn render(bind: SocketAddr, data_dir: &Path) -> anyhow::Result<ServiceUnit> {
    let binary_path = std::env::current_exe()?.to_string_lossy().to_string();
    Ok(render_for(
        ServiceManager::current(),
        &home_dir()?,
        &binary_path,
        bind,
        data_dir,
    ))
}

fn home_dir() -> anyhow::Result<PathBuf> {
    dirs::home_dir().ok_or_else(|| anyhow::anyhow!("HOME directory not found"))
}

/// Write the unit file; with `enable`, also load it. Returns whether the
/// service manager accepted it.
pub fn install(unit: &ServiceUnit, enable: bool) -> anyhow::Result<bool> {
    if let Some(parent) = unit.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&unit.path, &unit.contents)?;

    match unit.manager {
        ServiceManager::Launchd => {
            if !enable {
                return Ok(false);
            }
            let path = unit.path.to_string_lossy().to_string();
            // Unload first in case it's already loaded (ignore errors)
            let _ = Command::new("launchctl").args(["unload", &path]).output();
            let output = Command::new("launchctl").args(["load", &path]).output()?;
            Ok(output.status.success())
        }
        ServiceManager::Systemd => {
            // Reload systemd to pick up new/changed unit file
            let _ = Command::new("systemctl")
                .args(["--user", "daemon-reload"])
                .output();
            if !enable {
                return Ok(false);
            }
            let output = Command::new("systemctl")
                .args(["--user", "enable", "--now", SYSTEMD_UNIT])
                .output()?;
            Ok(output.status.success())
        }
    }
}

/// Stop the service and delete its unit file. Returns the removed path, or
/// `None` when nothing was installed.
pub fn uninstall() -> anyhow::Result<Option<PathBuf>> {
    let manager = ServiceManager::current();
    let path = manager.unit_path(&home_dir()?);
    if !path.exists() {
        return Ok(None);
    }

    match manager {
        ServiceManager::Launchd => {
            let _ = Command::new("launchctl")
                .args(["unload", &path.to_string_lossy()])
                .output();
        }
        ServiceManager::Systemd => {
            let _ = Command::new("systemctl")
                .args(["--user", "disable", "--now", SYSTEMD_UNIT])
                .output();
        }
    }
    std::fs::remove_file(&path)?;
    if manager == ServiceManager::Systemd {
        let _ = Command::new("systemctl")
            .args(["--user", "daemon-reload"])
            .output();
    }
    Ok(Some(path))
}

pub fn run(data_dir: &Path, bind: SocketAddr, enable: bool) -> anyhow::Result<()> {
    let unit = render(bind, data_dir)?;
    let activated = install(&unit, enable)?;
    println!("  Wrote {}", unit.path.display());

    if activated {
        println!("  Service enabled and started");
    } else if enable {
        println!("  Warning: the service manager did not accept the unit");
    } else {
        println!();
        println!("  To enable:");
        match unit.manager {
            ServiceManager::Launchd => println!("    launchctl load {}", unit.path.display()),
            ServiceManager::Systemd => {
                println!("    systemctl --user enable --now {SYSTEMD_UNIT}")
            }
        }
    }

    println!();
    Ok(())
}

pub fn run_uninstall() -> anyhow::Result<()> {
    match uninstall()? {
        Some(path) => println!("  Removed {}", path.display()),
        None => println!("  No service installed"),
    }
    println!();
    Ok(())
}
