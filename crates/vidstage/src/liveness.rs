use std::sync::Arc;
use chrono::{DateTime, Utc};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use uuid::Uuid;
use crate::lock::LockRecord;

/// Checks whether a process id is running on this host
pub trait ProcessProbe: Send + Sync {
    /// False when the platform offers no process table to inspect
    fn is_supported(&self) -> bool;
    /// Non-destructive existence check; never signals the process
    fn is_alive(&self, pid: u32) -> bool;
}

/// Process table lookup backed by `sysinfo`
#[derive(Debug, Default)]
pub struct SysinfoProbe;

impl ProcessProbe for SysinfoProbe {
    fn is_supported(&self) -> bool {
        sysinfo::IS_SUPPORTED_SYSTEM
    }

    fn is_alive(&self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        // Fresh table per query so exited processes are never served from cache
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        match system.process(pid) {
            Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
            None => false,
        }
    }
}

/// Why a lock was judged live or dangling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// This store instance is running the job right now
    HeldHere,
    /// Written by this store instance, but the job has already ended
    ReleasedHere,
    /// Heartbeat older than the lease grace window
    HeartbeatExpired,
    /// Owner process still in the local process table
    OwnerAlive,
    /// Owner process no longer exists
    OwnerGone,
    /// Owner cannot be checked from here (other host or unsupported platform)
    Unverifiable,
}

impl Verdict {
    pub fn is_live(self) -> bool {
        matches!(self, Verdict::HeldHere | Verdict::OwnerAlive)
    }
}

/// Liveness policy: heartbeat lease first, then the local process table.
pub struct Liveness {
    instance_id: Uuid,
    host_name: Option<String>,
    grace: Option<chrono::Duration>,
    probe: Arc<dyn ProcessProbe>,
}

impl Liveness {
    pub fn new(grace: Option<chrono::Duration>, probe: Arc<dyn ProcessProbe>) -> Self {
        Liveness {
            instance_id: Uuid::new_v4(),
            host_name: System::host_name(),
            grace,
            probe,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn host_name(&self) -> Option<String> {
        self.host_name.clone()
    }

    /// `held_here` tells whether this instance currently holds the key.
    pub fn assess(&self, lock: &LockRecord, held_here: bool, now: DateTime<Utc>) -> Verdict {
        if lock.owner_instance_id == Some(self.instance_id) {
            return if held_here { Verdict::HeldHere } else { Verdict::ReleasedHere };
        }

        if let Some(grace) = self.grace {
            if now - lock.last_seen() > grace {
                return Verdict::HeartbeatExpired;
            }
        }

        let same_host = match (&lock.host_name, &self.host_name) {
            (Some(theirs), Some(ours)) => theirs == ours,
            // Locks without a host name predate the field; assume they are local
            (None, _) => true,
            (Some(_), None) => false,
        };
        if !same_host || !self.probe.is_supported() {
            return Verdict::Unverifiable;
        }

        if self.probe.is_alive(lock.owner_process_id) {
            Verdict::OwnerAlive
        } else {
            Verdict::OwnerGone
        }
    }
}
