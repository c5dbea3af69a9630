use agent_common::config::{ConfigError, ModuleConfig};

use crate::service::ServiceMatcher;

pub const DEFAULT_SERVICE_HOST_PATH: &str = r"C:\Windows\System32\svchost.exe";
pub const DEFAULT_SERVICE_PREFIX: &str = r"\svchost\";
pub const DEFAULT_MAX_TRACKED_PROCESSES: usize = 65536;
pub const DEFAULT_IDENTITY_POOL_BYTES: usize = 1024 * 1024;

/// Tracker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Canonical path of the service-host executable.
    pub service_host_path: String,
    /// Prefix of synthetic service identities.
    pub service_prefix: String,
    /// Upper bound on concurrently tracked processes; processes past the
    /// cap simply go untracked.
    pub max_tracked_processes: usize,
    /// Byte budget for identity strings.
    pub identity_pool_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_host_path: DEFAULT_SERVICE_HOST_PATH.to_string(),
            service_prefix: DEFAULT_SERVICE_PREFIX.to_string(),
            max_tracked_processes: DEFAULT_MAX_TRACKED_PROCESSES,
            identity_pool_bytes: DEFAULT_IDENTITY_POOL_BYTES,
        }
    }
}

impl Config {
    pub(crate) fn service_matcher(&self) -> ServiceMatcher {
        ServiceMatcher::new(&self.service_host_path, &self.service_prefix)
    }
}

/// Extract Config from configuration file
impl TryFrom<&ModuleConfig> for Config {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        Ok(Config {
            service_host_path: config
                .with_default("service_host_path", DEFAULT_SERVICE_HOST_PATH.to_string())?,
            service_prefix: config
                .with_default("service_prefix", DEFAULT_SERVICE_PREFIX.to_string())?,
            max_tracked_processes: config
                .with_default("max_tracked_processes", DEFAULT_MAX_TRACKED_PROCESSES)?,
            identity_pool_bytes: config
                .with_default("identity_pool_bytes", DEFAULT_IDENTITY_POOL_BYTES)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_for_missing_fields() {
        let module_config = ModuleConfig::default();
        let config = Config::try_from(&module_config).unwrap();
        assert_eq!(config.service_host_path, DEFAULT_SERVICE_HOST_PATH);
        assert_eq!(config.max_tracked_processes, DEFAULT_MAX_TRACKED_PROCESSES);
    }

    #[test]
    fn fields_override_defaults() {
        let mut module_config = ModuleConfig::default();
        module_config.insert("max_tracked_processes", "128");
        module_config.insert("service_host_path", "/usr/lib/systemd/systemd");
        let config = Config::try_from(&module_config).unwrap();
        assert_eq!(config.max_tracked_processes, 128);
        assert_eq!(config.service_host_path, "/usr/lib/systemd/systemd");
    }
}
