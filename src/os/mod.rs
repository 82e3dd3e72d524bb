use serde::Serialize;

use crate::error::{Result, RiggerError};
use crate::exec::{shell_quote, Executor};

/// Process supervisor on a host. Selected once per host; the service and
/// proxy modules derive paths and commands from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Systemd,
    Launchd,
    Supervisor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
        }
    }
}

impl Platform {
    /// Auto-detect: Darwin means launchd, otherwise systemd when systemctl
    /// is present, otherwise supervisord.
    pub async fn detect(exec: &dyn Executor) -> Result<Self> {
        let kernel = exec.exec("uname -s").await?;
        if kernel.trim() == "Darwin" {
            return Ok(Platform::Launchd);
        }
        if exec.exec_ok("command -v systemctl").await? {
            return Ok(Platform::Systemd);
        }
        Ok(Platform::Supervisor)
    }

    pub fn from_id(id: &str) -> Result<Self> {
        match id {
            "systemd" => Ok(Platform::Systemd),
            "launchd" => Ok(Platform::Launchd),
            "supervisor" | "supervisord" => Ok(Platform::Supervisor),
            other => Err(RiggerError::Config(format!(
                "Unsupported platform: '{}'. Supported: systemd, launchd, supervisor",
                other
            ))),
        }
    }

    /// Resolve from config override or auto-detect.
    pub async fn resolve(configured: Option<&str>, exec: &dyn Executor) -> Result<Self> {
        match configured {
            Some(id) => Self::from_id(id),
            None => Self::detect(exec).await,
        }
    }

    pub fn unit_name(&self, key: &str) -> String {
        match self {
            Platform::Systemd => format!("rigger-{}.service", key),
            Platform::Launchd => format!("com.rigger.{}", key),
            Platform::Supervisor => format!("rigger-{}", key),
        }
    }

    pub fn unit_path(&self, key: &str) -> String {
        match self {
            Platform::Systemd => format!("/etc/systemd/system/{}", self.unit_name(key)),
            Platform::Launchd => format!("/Library/LaunchDaemons/{}.plist", self.unit_name(key)),
            Platform::Supervisor => format!("/etc/supervisor/conf.d/{}.conf", self.unit_name(key)),
        }
    }

    /// Make the supervisor pick up a changed unit definition without
    /// touching the running process.
    pub fn reload_cmd(&self, key: &str) -> String {
        let unit = self.unit_name(key);
        match self {
            Platform::Systemd => format!("systemctl daemon-reload && systemctl enable {}", unit),
            Platform::Launchd => format!("plutil -lint {}", shell_quote(&self.unit_path(key))),
            Platform::Supervisor => "supervisorctl reread".to_string(),
        }
    }

    pub fn control_cmd(&self, action: ServiceAction, key: &str) -> String {
        let unit = self.unit_name(key);
        let path = shell_quote(&self.unit_path(key));
        match (self, action) {
            (Platform::Systemd, action) => format!("systemctl {} {}", action.as_str(), unit),

            (Platform::Launchd, ServiceAction::Start) => format!(
                "launchctl bootstrap system {} 2>/dev/null || launchctl kickstart system/{}",
                path, unit
            ),
            (Platform::Launchd, ServiceAction::Stop) => {
                format!("launchctl bootout system/{}", unit)
            }
            (Platform::Launchd, ServiceAction::Restart) => format!(
                "launchctl bootout system/{} 2>/dev/null; launchctl bootstrap system {}",
                unit, path
            ),

            (Platform::Supervisor, ServiceAction::Start) => format!(
                "supervisorctl update {u} && (supervisorctl status {u} | grep -q RUNNING || supervisorctl start {u})",
                u = unit
            ),
            (Platform::Supervisor, ServiceAction::Stop) => format!("supervisorctl stop {}", unit),
            (Platform::Supervisor, ServiceAction::Restart) => {
                format!("supervisorctl update {u} && supervisorctl restart {u}", u = unit)
            }
        }
    }

    pub fn status_cmd(&self, key: &str) -> String {
        let unit = self.unit_name(key);
        match self {
            Platform::Systemd => format!("systemctl show {} -p ActiveState -p MainPID", unit),
            Platform::Launchd => format!("launchctl print system/{}", unit),
            Platform::Supervisor => format!("supervisorctl status {}", unit),
        }
    }

    pub fn logs_cmd(&self, key: &str, lines: usize) -> String {
        let unit = self.unit_name(key);
        match self {
            Platform::Systemd => format!("journalctl -u {} -n {} --no-pager", unit, lines),
            Platform::Launchd => format!("tail -n {} /var/log/{}.log", lines, unit),
            Platform::Supervisor => format!("supervisorctl tail -{} {}", lines * 120, unit),
        }
    }

    /// Parse status output into (running, pid).
    pub fn parse_status(&self, output: &str) -> (bool, Option<u32>) {
        match self {
            Platform::Systemd => {
                let mut running = false;
                let mut pid = None;
                for line in output.lines() {
                    if let Some(state) = line.strip_prefix("ActiveState=") {
                        running = state.trim() == "active";
                    } else if let Some(value) = line.strip_prefix("MainPID=") {
                        pid = value.trim().parse().ok().filter(|p| *p != 0);
                    }
                }
                (running, pid)
            }
            Platform::Launchd => {
                let mut running = false;
                let mut pid = None;
                for line in output.lines() {
                    let line = line.trim();
                    if let Some(state) = line.strip_prefix("state = ") {
                        running = state.trim() == "running";
                    } else if let Some(value) = line.strip_prefix("pid = ") {
                        pid = value.trim().parse().ok();
                    }
                }
                (running, pid)
            }
            Platform::Supervisor => {
                // rigger-cigar   RUNNING   pid 1234, uptime 0:01:02
                let mut fields = output.split_whitespace().skip(1);
                let running = fields.next() == Some("RUNNING");
                let pid = output
                    .split("pid ")
                    .nth(1)
                    .and_then(|rest| rest.split(',').next())
                    .and_then(|p| p.trim().parse().ok());
                (running, pid)
            }
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Systemd => write!(f, "systemd"),
            Platform::Launchd => write!(f, "launchd"),
            Platform::Supervisor => write!(f, "supervisor"),
        }
    }
}
