pub mod config;
pub mod procfs;

pub use nix::unistd::Pid;

/// Utility function to pretty print an error with its sources.
///
/// By default Rust won't print the source of an error message, making it
/// much less useful. Instead of re-implementing that, we'll just use
/// anyhow as an error pretty-printer.
pub fn log_error<E: std::error::Error + Send + Sync + 'static>(msg: &str, err: E) {
    log::error!("{}: {:?}", msg, anyhow::Error::from(err));
}
