//! The process tree itself: lifecycle handling, startup enumeration and
//! the hot-path identity lookup.
//!
//! A single lock protects the node store and the identity pool. Create
//! and exit notifications, the startup enumeration worker and lookups
//! all run concurrently and take that lock for short, non-blocking
//! critical sections; everything that can block (image path and command
//! line queries) happens with the lock dropped.
//!
//! Startup ordering: notifications are ignored until the enumeration
//! worker has started, and block on its completion while it is running.
//! This guarantees the snapshot and the live stream never race to
//! double-insert a pid.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use agent_common::{log_error, Pid};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::identity::IdentityPool;
use crate::inherit::resolve_inheritance;
use crate::rules::RuleProvider;
use crate::service::ServiceMatcher;
use crate::source::{ProcessEntry, ProcessSource};
use crate::store::{NodeFlags, NodeStore};

/// Lifecycle notification delivered by the OS subscription.
///
/// Creations carry the image path and command line captured at creation
/// time; both are far harder to retrieve once the process is running.
/// For the same pid, creation is always delivered before exit.
#[derive(Debug)]
pub enum ProcessEvent {
    Created {
        pid: Pid,
        ppid: Pid,
        image: String,
        command_line: String,
    },
    Exited {
        pid: Pid,
    },
}

/// A resolved identity returned to the packet-classification path.
#[derive(Debug, Clone)]
pub struct ResolvedName {
    pub name: Arc<str>,
    /// True when the name was inherited from an ancestor rather than
    /// derived from the process itself.
    pub inherited: bool,
}

pub(crate) struct TreeState {
    pub(crate) store: NodeStore,
    pub(crate) pool: IdentityPool,
}

impl TreeState {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            store: NodeStore::new(config.max_tracked_processes),
            pool: IdentityPool::new(config.identity_pool_bytes),
        }
    }
}

/// The tree lock. Survives poisoning: state mutations keep their
/// invariants at every await-free step, so a panicking thread cannot
/// leave the tree half-updated.
pub(crate) fn lock_state(state: &Mutex<TreeState>) -> MutexGuard<'_, TreeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

const ENUM_STARTED: u8 = 0x01;
const ENUM_DONE: u8 = 0x02;

/// The kernel-thread reaper: its subtree consists of kernel threads,
/// which are never judged by per-application rules.
const KTHREADD: Pid = Pid::from_raw(2);

struct Shared {
    state: Mutex<TreeState>,
    source: Arc<dyn ProcessSource>,
    rules: Box<dyn RuleProvider>,
    matcher: ServiceMatcher,
    enum_flags: AtomicU8,
    enum_done: watch::Sender<bool>,
}

/// Live map of running processes to the identity they are judged under.
pub struct ProcessTree {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProcessTree {
    /// Initializes the tree, subscribes to the notification stream in
    /// `events` and starts the one-time startup enumeration.
    pub fn open<S: ProcessSource + 'static>(
        config: Config,
        source: Arc<S>,
        rules: impl RuleProvider + 'static,
        events: mpsc::UnboundedReceiver<ProcessEvent>,
    ) -> ProcessTree {
        let (enum_done, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            state: Mutex::new(TreeState::new(&config)),
            source,
            rules: Box::new(rules),
            matcher: config.service_matcher(),
            enum_flags: AtomicU8::new(0),
            enum_done,
        });
        let (shutdown, shutdown_rx) = watch::channel(false);

        let worker = {
            let shared = Arc::clone(&shared);
            tokio::task::spawn_blocking(move || shared.run_enumeration())
        };
        let pump = {
            let shared = Arc::clone(&shared);
            tokio::spawn(pump_events(shared, events, shutdown_rx))
        };

        ProcessTree {
            shared,
            shutdown,
            tasks: vec![worker, pump],
        }
    }

    /// Point-in-time identity query for the packet-classification path.
    ///
    /// Returns nothing when the process is untracked, unresolved, or in
    /// the grant-only state (`INHERIT` without `CUSTOM`): such a node
    /// holds a record for the benefit of its children, not as its own
    /// judged identity. Callers fall back to the process's own image
    /// path.
    pub fn lookup(&self, pid: Pid) -> Option<ResolvedName> {
        let state = lock_state(&self.shared.state);
        let slot = state.store.find(pid)?;
        let node = state.store.get(slot);
        let id = node.identity?;
        if node.flags.contains(NodeFlags::INHERIT) && !node.flags.contains(NodeFlags::CUSTOM) {
            return None;
        }
        Some(ResolvedName {
            name: Arc::clone(state.pool.name(id)),
            inherited: node.flags.contains(NodeFlags::INHERITED),
        })
    }

    /// Applies one lifecycle notification. Called by the event pump;
    /// exposed for embedders delivering notifications without a channel.
    pub async fn handle_event(&self, event: ProcessEvent) {
        self.shared.handle_event(event).await;
    }

    /// Completes once the startup enumeration has finished.
    pub async fn enumeration_complete(&self) {
        let mut rx = self.shared.enum_done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Stops the notification pump and the enumeration worker, then
    /// tears down all tracked state.
    pub async fn close(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                log::warn!("process tree task failed: {err}");
            }
        }

        let mut state = lock_state(&self.shared.state);
        let TreeState { store, pool } = &mut *state;
        store.clear(pool);
        debug_assert_eq!(pool.live_records(), 0);
    }
}

async fn pump_events(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(event) => shared.handle_event(event).await,
                None => break,
            },
        }
    }
}

impl Shared {
    async fn handle_event(&self, event: ProcessEvent) {
        match event {
            ProcessEvent::Created {
                pid,
                ppid,
                image,
                command_line,
            } => self.handle_created(pid, ppid, &image, &command_line).await,
            ProcessEvent::Exited { pid } => self.handle_exited(pid).await,
        }
    }

    async fn handle_created(&self, pid: Pid, ppid: Pid, image: &str, command_line: &str) {
        if !self.wait_enumeration().await {
            log::trace!("dropping create notification for {pid}: enumeration not started");
            return;
        }

        let service_name = self.matcher.derive(image, command_line);

        let inserted = {
            let mut state = lock_state(&self.state);
            if state.store.find(pid).is_some() {
                // the old node keeps its identity; see the exit handler
                log::debug!("duplicate create notification for process {pid}");
                None
            } else {
                let TreeState { store, pool } = &mut *state;
                match store.insert(pid, ppid) {
                    Ok(slot) => {
                        if let Some(name) = &service_name {
                            attach_service_name(store, pool, slot, name);
                        }
                        Some(slot)
                    }
                    Err(err) => {
                        log::warn!("cannot track process {pid}: {err}");
                        None
                    }
                }
            }
        };

        if let Some(slot) = inserted {
            resolve_inheritance(&self.state, &*self.source, &*self.rules, slot, pid);
        }
    }

    async fn handle_exited(&self, pid: Pid) {
        // exits go through the same gate as creations: an exit consumed
        // while the snapshot is still being inserted would race the
        // insert and leave a stale node behind
        if !self.wait_enumeration().await {
            log::trace!("dropping exit notification for {pid}: enumeration not started");
            return;
        }

        let mut state = lock_state(&self.state);
        match state.store.find(pid) {
            Some(slot) => {
                let TreeState { store, pool } = &mut *state;
                store.remove(slot, pool);
            }
            // the node may never have been created, e.g. under memory
            // pressure
            None => log::trace!("exit notification for untracked process {pid}"),
        }
    }

    /// Startup gate for live notifications: false before the
    /// enumeration worker has started, blocking while it runs.
    async fn wait_enumeration(&self) -> bool {
        let flags = self.enum_flags.load(Ordering::SeqCst);
        if flags & ENUM_STARTED == 0 {
            return false;
        }
        if flags & ENUM_DONE == 0 {
            let mut rx = self.enum_done.subscribe();
            // the worker always signals completion, even when the
            // snapshot failed
            let _ = rx.wait_for(|done| *done).await;
        }
        true
    }

    fn run_enumeration(&self) {
        self.enum_flags.fetch_or(ENUM_STARTED, Ordering::SeqCst);

        match self.source.enumerate() {
            Ok(entries) => {
                let total = entries.len();
                for entry in entries {
                    if is_system_process(&entry) {
                        continue;
                    }
                    self.insert_enumerated(entry);
                }
                log::debug!(
                    "enumerated {total} processes, tracking {}",
                    lock_state(&self.state).store.len()
                );
            }
            Err(err) => log_error("process enumeration failed", err),
        }

        self.enum_flags.fetch_or(ENUM_DONE, Ordering::SeqCst);
        self.enum_done.send_replace(true);
    }

    fn insert_enumerated(&self, entry: ProcessEntry) {
        let path = match self.source.image_path(entry.pid) {
            Ok(path) => path,
            Err(err) => {
                log::debug!("skipping enumerated process {}: {err}", entry.pid);
                return;
            }
        };

        // command lines are hard to retrieve long after creation, so
        // service names are resolved now rather than lazily
        let service_name = if self.matcher.is_host_path(&path) {
            match self.source.command_line(entry.pid) {
                Ok(command_line) => self.matcher.derive(&path, &command_line),
                Err(err) => {
                    log::debug!("skipping service host {}: {err}", entry.pid);
                    return;
                }
            }
        } else {
            None
        };

        let mut state = lock_state(&self.state);
        let TreeState { store, pool } = &mut *state;
        match store.insert(entry.pid, entry.ppid) {
            Ok(slot) => {
                if let Some(name) = &service_name {
                    attach_service_name(store, pool, slot, name);
                }
            }
            Err(err) => log::warn!("cannot track enumerated process {}: {err}", entry.pid),
        }
    }
}

fn attach_service_name(store: &mut NodeStore, pool: &mut IdentityPool, slot: usize, name: &str) {
    match pool.alloc(name) {
        Ok(id) => {
            let node = store.get_mut(slot);
            node.identity = Some(id);
            node.flags.insert(NodeFlags::CUSTOM);
        }
        // the process is tracked but judged by its own image path
        Err(err) => log::warn!("dropping service name {name}: {err}"),
    }
}

fn is_system_process(entry: &ProcessEntry) -> bool {
    entry.pid.as_raw() == 0 || entry.pid == KTHREADD || entry.ppid == KTHREADD
}
