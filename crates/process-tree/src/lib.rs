//! Process ancestry tracking and name inheritance for per-application
//! packet filtering.
//!
//! The firewall judges traffic by the name of the process that owns a
//! connection. Two situations make the process's own image path the
//! wrong name:
//!
//! - service-host processes all share one executable; the real identity
//!   is the service name hidden in the command line;
//! - rules flagged "apply to children" must follow a process's
//!   descendants, whose image paths say nothing about the ancestor that
//!   matched.
//!
//! [`ProcessTree`] keeps a live map of running processes, fed by
//! create/exit notifications and bootstrapped by a one-time enumeration,
//! and resolves inherited names lazily on the first notification that
//! reaches a process. The packet path queries it with
//! [`ProcessTree::lookup`].

pub mod config;
mod identity;
mod inherit;
pub mod rules;
pub mod service;
pub mod source;
mod store;
mod tracker;

pub use config::Config;
pub use tracker::{ProcessEvent, ProcessTree, ResolvedName};
