use std::collections::HashMap;
use std::sync::{mpsc, Mutex};

use agent_common::Pid;
use process_tree::source::{ProcessEntry, ProcessSource, SourceError};

struct FakeProcess {
    ppid: i32,
    image: String,
    command_line: String,
}

/// Hand controls for a gated [`FakeSource`]: `entered` fires when the
/// enumeration has started, `release` lets it finish.
pub struct EnumerationGate {
    pub entered: mpsc::Receiver<()>,
    pub release: mpsc::Sender<()>,
}

/// In-memory process table standing in for the OS.
#[derive(Default)]
pub struct FakeSource {
    processes: Mutex<HashMap<i32, FakeProcess>>,
    gate: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source whose enumeration blocks until released, so tests can
    /// observe the tracker mid-enumeration.
    pub fn gated() -> (Self, EnumerationGate) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let source = Self {
            processes: Mutex::default(),
            gate: Mutex::new(Some((entered_tx, release_rx))),
        };
        let gate = EnumerationGate {
            entered: entered_rx,
            release: release_tx,
        };
        (source, gate)
    }

    pub fn add(&self, pid: i32, ppid: i32, image: &str, command_line: &str) {
        self.processes.lock().unwrap().insert(
            pid,
            FakeProcess {
                ppid,
                image: image.to_string(),
                command_line: command_line.to_string(),
            },
        );
    }
}

impl ProcessSource for FakeSource {
    fn enumerate(&self) -> Result<Vec<ProcessEntry>, SourceError> {
        if let Some((entered, release)) = self.gate.lock().unwrap().take() {
            let _ = entered.send(());
            let _ = release.recv();
        }
        Ok(self
            .processes
            .lock()
            .unwrap()
            .iter()
            .map(|(pid, process)| ProcessEntry {
                pid: Pid::from_raw(*pid),
                ppid: Pid::from_raw(process.ppid),
            })
            .collect())
    }

    fn image_path(&self, pid: Pid) -> Result<String, SourceError> {
        self.processes
            .lock()
            .unwrap()
            .get(&pid.as_raw())
            .map(|process| process.image.clone())
            .ok_or(SourceError::NotFound(pid))
    }

    fn command_line(&self, pid: Pid) -> Result<String, SourceError> {
        self.processes
            .lock()
            .unwrap()
            .get(&pid.as_raw())
            .map(|process| process.command_line.clone())
            .ok_or(SourceError::NotFound(pid))
    }
}
