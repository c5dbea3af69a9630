use std::{collections::HashMap, fmt::Display, str::FromStr};

use thiserror::Error;

/// Per module configuration: a flat string map with typed accessors.
#[derive(Debug, Clone, Default)]
pub struct ModuleConfig {
    inner: HashMap<String, String>,
}

#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("field {field} is required")]
    RequiredValue { field: String },
    #[error("{value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        field: String,
        value: String,
        err: String,
    },
}

impl ModuleConfig {
    /// Inserts a new configuration value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.inner.insert(key.into(), value.into())
    }

    /// Returns an option of raw configuration value.
    pub fn get_raw(&self, config_name: &str) -> Option<&str> {
        self.inner.get(config_name).map(String::as_str)
    }

    /// Returns a typed configuration value.
    pub fn required<T>(&self, config_name: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        match self.inner.get(config_name) {
            None => Err(ConfigError::RequiredValue {
                field: config_name.to_string(),
            }),
            Some(value) => parse(value, config_name),
        }
    }

    /// Returns a typed configuration value, falling back to the given
    /// default when the field is missing.
    pub fn with_default<T>(&self, config_name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        match self.inner.get(config_name) {
            None => Ok(default),
            Some(value) => parse(value, config_name),
        }
    }

    /// Return a comma separated list of values. Return empty vector if field is missing.
    pub fn get_list<T>(&self, config_name: &str) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(config_name)
            .iter()
            .flat_map(|config| config.split(','))
            .filter(|item| !item.is_empty())
            .map(|item| parse(item.trim(), config_name))
            .collect()
    }
}

impl FromIterator<(String, String)> for ModuleConfig {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}

fn parse<T>(value: &str, field: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    value.parse().map_err(|err: <T as FromStr>::Err| {
        ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            err: err.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_field_uses_default() {
        let config = ModuleConfig::default();
        assert_eq!(config.with_default("pool_bytes", 4096usize).unwrap(), 4096);
    }

    #[test]
    fn invalid_value_is_reported() {
        let mut config = ModuleConfig::default();
        config.insert("pool_bytes", "lots");
        assert!(config.with_default("pool_bytes", 4096usize).is_err());
    }

    #[test]
    fn list_values_are_trimmed() {
        let mut config = ModuleConfig::default();
        config.insert("names", "alpha, beta,,gamma");
        let names: Vec<String> = config.get_list("names").unwrap();
        assert_eq!(names, ["alpha", "beta", "gamma"]);
    }
}
