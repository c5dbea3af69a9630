//! OS seam: process snapshots and per-process identity queries.

use std::io;

use agent_common::procfs::{self, ProcfsError};
use agent_common::Pid;
use thiserror::Error;

/// One entry of the startup snapshot.
#[derive(Debug, Clone, Copy)]
pub struct ProcessEntry {
    pub pid: Pid,
    pub ppid: Pid,
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("process {0} not found")]
    NotFound(Pid),
    #[error("access to process {0} denied")]
    AccessDenied(Pid),
    #[error(transparent)]
    Procfs(#[from] ProcfsError),
}

/// Where process information comes from. The packet-filtering agent
/// queries the live system; tests inject synthetic processes.
///
/// `enumerate` returns a finite snapshot, not a live stream. The
/// per-process queries may block (they open OS structures) and are never
/// called while the tree lock is held.
pub trait ProcessSource: Send + Sync {
    fn enumerate(&self) -> Result<Vec<ProcessEntry>, SourceError>;

    /// Executable image path of a running process, in canonical case.
    fn image_path(&self, pid: Pid) -> Result<String, SourceError>;

    /// Full command line of a running process.
    fn command_line(&self, pid: Pid) -> Result<String, SourceError>;
}

/// `/proc`-backed source for Linux hosts.
#[derive(Debug, Default)]
pub struct ProcfsSource;

impl ProcessSource for ProcfsSource {
    fn enumerate(&self) -> Result<Vec<ProcessEntry>, SourceError> {
        let mut entries = Vec::new();
        for pid in procfs::get_running_processes()? {
            // a process may exit between the directory listing and the
            // status read; skip it rather than failing the snapshot
            match procfs::get_process_parent_pid(pid) {
                Ok(ppid) => entries.push(ProcessEntry { pid, ppid }),
                Err(err) => log::debug!("skipping enumerated process {pid}: {err}"),
            }
        }
        Ok(entries)
    }

    fn image_path(&self, pid: Pid) -> Result<String, SourceError> {
        procfs::get_process_image(pid)
            .map(|path| path.to_string_lossy().into_owned())
            .map_err(|err| classify(pid, err))
    }

    fn command_line(&self, pid: Pid) -> Result<String, SourceError> {
        procfs::get_process_command_line(pid).map_err(|err| classify(pid, err))
    }
}

fn classify(pid: Pid, err: ProcfsError) -> SourceError {
    if let ProcfsError::ReadFile { ref source, .. } = err {
        match source.kind() {
            io::ErrorKind::NotFound => return SourceError::NotFound(pid),
            io::ErrorKind::PermissionDenied => return SourceError::AccessDenied(pid),
            _ => {}
        }
    }
    SourceError::Procfs(err)
}
