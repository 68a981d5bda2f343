use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub agent_id: String,
    pub endpoint_id: String,
    pub started_at: DateTime<Utc>,
}

/// Tracks every spawned script until it is reaped.
///
/// Scripts run as leaders of their own process group (unix), so killing a
/// tracked pid's group also takes down anything the script forked.
#[derive(Default)]
pub struct ProcessArena {
    processes: DashMap<u32, ProcessRecord>,
}

impl ProcessArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `pid` until the returned guard is dropped.
    pub fn track(&self, pid: u32, agent_id: &str, endpoint_id: &str) -> ProcessGuard<'_> {
        self.processes.insert(
            pid,
            ProcessRecord {
                agent_id: agent_id.to_string(),
                endpoint_id: endpoint_id.to_string(),
                started_at: Utc::now(),
            },
        );
        ProcessGuard { arena: self, pid }
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.processes.len()
    }

    #[must_use]
    pub fn record(&self, pid: u32) -> Option<ProcessRecord> {
        self.processes.get(&pid).map(|r| r.value().clone())
    }

    /// Kill every tracked process group. Returns how many groups were signalled.
    pub fn kill_all(&self) -> usize {
        let pids: Vec<u32> = self.processes.iter().map(|e| *e.key()).collect();
        let mut killed = 0;
        for pid in pids {
            if kill_group(pid) {
                killed += 1;
            }
            self.processes.remove(&pid);
        }
        if killed > 0 {
            warn!("Killed {} running script process group(s)", killed);
        }
        killed
    }
}

/// Removes its pid from the arena on drop.
pub struct ProcessGuard<'a> {
    arena: &'a ProcessArena,
    pid: u32,
}

impl ProcessGuard<'_> {
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// SIGKILL the whole process group.
    pub fn kill_group(&self) -> bool {
        kill_group(self.pid)
    }
}

impl Drop for ProcessGuard<'_> {
    fn drop(&mut self) {
        self.arena.processes.remove(&self.pid);
    }
}

/// Returns true when the signal was delivered. A group that no longer exists
/// is not an error.
#[cfg(unix)]
pub fn kill_group(pid: u32) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    // pid 0 would address our own group
    let raw = match i32::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return false,
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => {
            debug!(pid, "Sent SIGKILL to process group");
            true
        }
        Err(nix::errno::Errno::ESRCH) => false,
        Err(e) => {
            warn!(pid, "Failed to kill process group: {}", e);
            false
        }
    }
}

/// Without process groups the child itself is killed through `kill_on_drop`.
#[cfg(not(unix))]
pub fn kill_group(_pid: u32) -> bool {
    false
}
