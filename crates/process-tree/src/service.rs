//! Synthetic service names for service-hosting processes.
//!
//! Several unrelated services can run under the same host executable,
//! distinguished only by a `-s <name>` command line argument. Judging
//! them all by the host's image path would make per-service rules
//! impossible, so such processes get a synthetic identity of the form
//! `<prefix><lowercased service name>` instead.

/// Service names at or above this many UTF-16 code units are treated as
/// malformed (typically a hostile command line) and the process is
/// considered a regular, non-service one.
pub const SERVICE_NAME_MAX_UTF16: usize = 120;

const SERVICE_ARG: &str = "-s ";

/// Matches service-host processes by image path and derives their
/// synthetic identity from the command line.
#[derive(Debug, Clone)]
pub struct ServiceMatcher {
    host_path: String,
    prefix: String,
}

impl ServiceMatcher {
    pub fn new(host_path: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            prefix: prefix.into(),
        }
    }

    /// Exact host-path check used at enumeration time to decide whether
    /// the command line is worth fetching at all. Paths are expected in
    /// canonical case at this point.
    pub(crate) fn is_host_path(&self, path: &str) -> bool {
        path == self.host_path
    }

    /// Returns the synthetic identity if `path` is the service host and
    /// the command line carries a well-formed service name.
    pub(crate) fn derive(&self, path: &str, command_line: &str) -> Option<String> {
        if path.len() != self.host_path.len() || !path.eq_ignore_ascii_case(&self.host_path) {
            return None;
        }

        let name = service_name_argument(command_line)?;
        if name.encode_utf16().count() >= SERVICE_NAME_MAX_UTF16 {
            return None;
        }

        Some(format!("{}{}", self.prefix, name.to_lowercase()))
    }
}

/// The token following `-s `, terminated by a space or the end of the
/// command line. An absent or empty token means no service name.
fn service_name_argument(command_line: &str) -> Option<&str> {
    let start = command_line.find(SERVICE_ARG)? + SERVICE_ARG.len();
    let rest = &command_line[start..];
    let name = rest.split(' ').next().unwrap_or(rest);
    (!name.is_empty()).then_some(name)
}
