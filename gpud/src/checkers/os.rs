//! OS component
//!
//! Reports boot time, uptime and boot id from procfs. The first check after a
//! boot records a `reboot` event in the `os` bucket, which feeds escalation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use gpud_core::component::{with_timeout, CheckResult, Checker};
use gpud_core::eventstore::{EventStore, OS_BUCKET, REBOOT_EVENT_NAME};
use gpud_core::{Event, EventType, HealthState, HealthStateType};

use super::CheckerError;

const PROC_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Boot information read from procfs
#[derive(Debug, Clone, PartialEq)]
pub struct BootInfo {
    pub boot_time: DateTime<Utc>,
    pub uptime: Duration,
    pub boot_id: Option<String>,
}

/// Result of one OS check
#[derive(Debug, Clone)]
pub struct OsCheckResult {
    time: DateTime<Utc>,
    boot: Option<BootInfo>,
    reboot_recorded: bool,
    error: Option<String>,
}

impl fmt::Display for OsCheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.boot, &self.error) {
            (Some(boot), _) => write!(
                f,
                "booted at {} (uptime {})",
                boot.boot_time,
                humantime::format_duration(boot.uptime)
            ),
            (None, Some(e)) => write!(f, "failed to read boot info: {}", e),
            (None, None) => write!(f, "no boot info"),
        }
    }
}

impl CheckResult for OsCheckResult {
    fn component_name(&self) -> &str {
        OS_BUCKET
    }

    fn summary(&self) -> String {
        match &self.error {
            Some(e) => format!("error reading boot info: {}", e),
            None if self.reboot_recorded => "reboot recorded".to_string(),
            None => "ok".to_string(),
        }
    }

    fn health_state_type(&self) -> HealthStateType {
        if self.error.is_some() {
            HealthStateType::Unhealthy
        } else {
            HealthStateType::Healthy
        }
    }

    fn health_states(&self) -> Vec<HealthState> {
        let mut state = HealthState {
            time: self.time,
            component: OS_BUCKET.to_string(),
            name: OS_BUCKET.to_string(),
            health: self.health_state_type(),
            reason: self.summary(),
            error: self.error.clone().unwrap_or_default(),
            ..Default::default()
        };
        if let Some(boot) = &self.boot {
            state
                .extra_info
                .insert("boot_time".to_string(), boot.boot_time.to_rfc3339());
            state.extra_info.insert(
                "uptime".to_string(),
                humantime::format_duration(boot.uptime).to_string(),
            );
            if let Some(id) = &boot.boot_id {
                state.extra_info.insert("boot_id".to_string(), id.clone());
            }
        }
        vec![state]
    }
}

/// Checker reading boot information from procfs
pub struct OsChecker {
    proc_root: PathBuf,
    event_store: Option<Arc<EventStore>>,
    // Survives event purges, so an old boot is never recorded twice
    recorded_boot: Mutex<Option<DateTime<Utc>>>,
}

impl OsChecker {
    pub fn new(event_store: Option<Arc<EventStore>>) -> Self {
        Self::with_proc_root("/proc", event_store)
    }

    /// Read procfs files under `proc_root` instead of `/proc`
    pub fn with_proc_root(proc_root: impl Into<PathBuf>, event_store: Option<Arc<EventStore>>) -> Self {
        Self {
            proc_root: proc_root.into(),
            event_store,
            recorded_boot: Mutex::new(None),
        }
    }

    async fn read_boot_info(&self) -> Result<BootInfo, CheckerError> {
        let stat = read_proc(&self.proc_root.join("stat")).await?;
        let btime = parse_btime(&stat)?;
        let boot_time = Utc
            .timestamp_opt(btime, 0)
            .single()
            .ok_or_else(|| CheckerError::Parse {
                what: "btime",
                detail: format!("out of range: {}", btime),
            })?;

        let uptime = parse_uptime(&read_proc(&self.proc_root.join("uptime")).await?)?;

        // Missing on some kernels, not an error
        let boot_id = tokio::fs::read_to_string(self.proc_root.join("sys/kernel/random/boot_id"))
            .await
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(BootInfo {
            boot_time,
            uptime,
            boot_id,
        })
    }

    /// Record the reboot event for this boot unless this checker or the
    /// store has already seen it
    fn record_reboot(&self, boot: &BootInfo) -> bool {
        let Some(store) = &self.event_store else {
            return false;
        };

        let mut recorded = self.recorded_boot.lock();
        if *recorded == Some(boot.boot_time) {
            return false;
        }

        let message = match &boot.boot_id {
            Some(id) => format!("system booted (boot id {})", id),
            None => "system booted".to_string(),
        };
        let event = Event::new(
            OS_BUCKET,
            boot.boot_time,
            REBOOT_EVENT_NAME,
            EventType::Warning,
            message,
        );

        let bucket = store.bucket(OS_BUCKET);
        *recorded = Some(boot.boot_time);
        if bucket.find(&event).is_some() {
            return false;
        }
        info!(boot_time = %boot.boot_time, "Recording reboot event");
        bucket.insert(event);
        true
    }
}

#[async_trait]
impl Checker for OsChecker {
    type Output = OsCheckResult;

    fn name(&self) -> &str {
        OS_BUCKET
    }

    fn is_supported(&self) -> bool {
        cfg!(target_os = "linux")
    }

    async fn check(&self, token: &CancellationToken) -> OsCheckResult {
        let time = Utc::now();
        let boot = with_timeout(token, PROC_READ_TIMEOUT, self.read_boot_info())
            .await
            .map_err(CheckerError::from)
            .and_then(|res| res);

        match boot {
            Ok(boot) => {
                let reboot_recorded = self.record_reboot(&boot);
                debug!(boot_time = %boot.boot_time, uptime = ?boot.uptime, "Read boot info");
                OsCheckResult {
                    time,
                    boot: Some(boot),
                    reboot_recorded,
                    error: None,
                }
            }
            Err(e) => OsCheckResult {
                time,
                boot: None,
                reboot_recorded: false,
                error: Some(e.to_string()),
            },
        }
    }

    async fn events(&self, since: DateTime<Utc>) -> gpud_core::Result<Vec<Event>> {
        Ok(self
            .event_store
            .as_ref()
            .map(|store| store.bucket(OS_BUCKET).get(since))
            .unwrap_or_default())
    }
}

async fn read_proc(path: &Path) -> Result<String, CheckerError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| CheckerError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Boot time in seconds since the epoch from `/proc/stat`
fn parse_btime(stat: &str) -> Result<i64, CheckerError> {
    let value = stat
        .lines()
        .find_map(|line| line.strip_prefix("btime "))
        .ok_or_else(|| CheckerError::Parse {
            what: "btime",
            detail: "no btime line in stat".to_string(),
        })?;
    value.trim().parse().map_err(|e| CheckerError::Parse {
        what: "btime",
        detail: format!("{}", e),
    })
}

/// First field of `/proc/uptime`
fn parse_uptime(uptime: &str) -> Result<Duration, CheckerError> {
    let secs: f64 = uptime
        .split_whitespace()
        .next()
        .ok_or_else(|| CheckerError::Parse {
            what: "uptime",
            detail: "empty".to_string(),
        })?
        .parse()
        .map_err(|e| CheckerError::Parse {
            what: "uptime",
            detail: format!("{}", e),
        })?;
    Duration::try_from_secs_f64(secs).map_err(|e| CheckerError::Parse {
        what: "uptime",
        detail: e.to_string(),
    })
}
