//! Utility functions used to extract data from procfs

use std::{
    fs::{self, File},
    io::{self, prelude::*, BufReader},
    path::PathBuf,
};

use glob::glob;
use nix::unistd::Pid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcfsError {
    #[error("reading {path} failed")]
    ReadFile {
        #[source]
        source: io::Error,
        path: String,
    },

    #[error("parent for process {0} not found")]
    ParentNotFound(Pid),

    #[error("globbing running processes")]
    GlobbingError(#[from] glob::PatternError),
    #[error("unreadable entry")]
    GlobError(#[from] glob::GlobError),
    #[error(transparent)]
    ParseIntError(#[from] std::num::ParseIntError),
}

/// Returns the path of the executable image of a given process.
pub fn get_process_image(pid: Pid) -> Result<PathBuf, ProcfsError> {
    read_link(&format!("/proc/{pid}/exe"))
}

/// Return where a link is pointing to.
fn read_link(path: &str) -> Result<PathBuf, ProcfsError> {
    fs::read_link(path).map_err(|source| ProcfsError::ReadFile {
        source,
        path: path.to_string(),
    })
}

/// Returns the command line of the given process as a single
/// space-separated string, the form expected by argument-token scanners.
pub fn get_process_command_line(pid: Pid) -> Result<String, ProcfsError> {
    let path = format!("/proc/{pid}/cmdline");
    let data =
        fs::read_to_string(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;

    Ok(data
        .split('\0')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" "))
}

/// Returns the parent of a given process.
pub fn get_process_parent_pid(pid: Pid) -> Result<Pid, ProcfsError> {
    let path = format!("/proc/{pid}/status");
    let file = File::open(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;

    let reader = BufReader::new(file);
    for line in reader.lines().map_while(Result::ok) {
        if let Some(value) = line.strip_prefix("PPid:") {
            return Ok(Pid::from_raw(value.trim().parse()?));
        }
    }

    Err(ProcfsError::ParentNotFound(pid))
}

pub fn get_running_processes() -> Result<Vec<Pid>, ProcfsError> {
    glob("/proc/[0-9]*")?
        .map(|entry| {
            let entry: String = entry?.to_string_lossy().into();
            let pid = entry.replace("/proc/", "").parse()?;
            Ok(Pid::from_raw(pid))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn running_processes_contains_self() {
        let me = Pid::from_raw(std::process::id() as i32);
        let processes = get_running_processes().unwrap();
        assert!(processes.contains(&me));
    }

    #[test]
    fn command_line_of_self_is_not_empty() {
        let me = Pid::from_raw(std::process::id() as i32);
        let command_line = get_process_command_line(me).unwrap();
        assert!(!command_line.is_empty());
    }
}
