//! Candidate discovery from on-disk registration records.
//!
//! Every live extension window writes a `<name>.port` JSON file with
//! `{port, time, pid}` into a shared directory. The records are written by
//! the extension and consumed read-only here, except for the stale-record
//! sweep at startup and the recovery wipe, both of which only ever delete
//! files. Reads are best-effort: a record that fails to parse is skipped,
//! never fatal, and records may appear or vanish between reads.

use std::collections::HashSet;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::constants::{DEFAULT_EXTENSION_PORT, REGISTRATION_EXTENSION};
use crate::types::{CandidateEndpoint, RegistrationRecord};

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// Reads and ranks extension registration records.
#[derive(Clone)]
pub struct CandidateDirectory {
    dir: PathBuf,
}

impl CandidateDirectory {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Ranked candidate list: most recent registration first, each address at
    /// most once. Falls back to the well-known default port when no valid
    /// record exists. Never fails.
    pub fn discover(&self) -> Vec<CandidateEndpoint> {
        let mut candidates: Vec<CandidateEndpoint> = self
            .read_records()
            .into_iter()
            .map(|(_, record)| CandidateEndpoint {
                address: loopback(record.port),
                registered_at: record.time,
            })
            .collect();

        candidates.sort_by(|a, b| b.registered_at.cmp(&a.registered_at));

        let mut seen = HashSet::new();
        candidates.retain(|c| seen.insert(c.address));

        if candidates.is_empty() {
            debug!("no registration records; falling back to default port {DEFAULT_EXTENSION_PORT}");
            return vec![CandidateEndpoint {
                address: loopback(DEFAULT_EXTENSION_PORT),
                registered_at: 0,
            }];
        }

        candidates
    }

    /// Delete every registration record. Used by the one-shot recovery retry
    /// when the default port was the only candidate and did not answer.
    pub fn clear_registrations(&self) {
        let mut removed = 0usize;
        for (path, _) in self.read_records() {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("could not remove registration record {}: {e}", path.display()),
            }
        }
        info!("cleared {removed} registration record(s)");
    }

    /// Delete records whose owning extension process is no longer alive.
    /// Records without a pid are kept. Returns the number of files removed.
    pub fn remove_stale_records(&self) -> usize {
        let mut removed = 0usize;
        for (path, record) in self.read_records() {
            let Some(pid) = record.pid else { continue };
            if pid_alive(pid) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!("removed stale registration record {} (pid {pid} is gone)", path.display());
                    removed += 1;
                }
                Err(e) => warn!("could not remove stale record {}: {e}", path.display()),
            }
        }
        removed
    }

    fn read_records(&self) -> Vec<(PathBuf, RegistrationRecord)> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            // A missing directory just means no window has registered yet.
            Err(_) => return Vec::new(),
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(REGISTRATION_EXTENSION) {
                continue;
            }
            let contents = match fs::read_to_string(&path) {
                Ok(contents) => contents,
                Err(e) => {
                    debug!("skipping unreadable record {}: {e}", path.display());
                    continue;
                }
            };
            match serde_json::from_str::<RegistrationRecord>(&contents) {
                Ok(record) => records.push((path, record)),
                Err(e) => debug!("skipping malformed record {}: {e}", path.display()),
            }
        }
        records
    }
}

/// Signal-0 liveness probe. EPERM still means the process exists.
fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
