//! Bounded integer configuration.
//!
//! Every parameter is an integer with a documented default and an inclusive
//! `[min, max]` range, declared once in [`PARAMETERS`]. The key/value source
//! is a Java properties file, the same format the controller's other
//! components are configured with. A parameter that is absent, unparsable or
//! out of range falls back to its default with a warning; loading never fails
//! because of one bad value.

use std::{collections::HashMap, fs::File, io::Read, path::Path, time::Duration};

use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub flow_mod_timeout: u32,
    pub remote_flow_mod_timeout: u32,
    pub remote_bulk_flow_mod_timeout: u32,
    pub cache_transaction_timeout: u32,
    pub max_redirections: u32,
    pub l2_flow_priority: u32,
    pub ingress_remove_divisor: u32,
    pub task_pool_size: u32,
    pub task_keep_alive: u32,
}

pub struct Parameter {
    pub name: &'static str,
    pub default: u32,
    pub min: u32,
    pub max: u32,
    field: fn(&mut Config) -> &mut u32,
}

pub static PARAMETERS: [Parameter; 9] = [
    Parameter {
        name: "flowModTimeout",
        default: 3000,
        min: 100,
        max: 60000,
        field: |config| &mut config.flow_mod_timeout,
    },
    Parameter {
        name: "remoteFlowModTimeout",
        default: 5000,
        min: 1000,
        max: 60000,
        field: |config| &mut config.remote_flow_mod_timeout,
    },
    Parameter {
        name: "remoteBulkFlowModTimeout",
        default: 15000,
        min: 3000,
        max: 600000,
        field: |config| &mut config.remote_bulk_flow_mod_timeout,
    },
    Parameter {
        name: "cacheTransactionTimeout",
        default: 10000,
        min: 100,
        max: 600000,
        field: |config| &mut config.cache_transaction_timeout,
    },
    Parameter {
        name: "maxRedirections",
        default: 100,
        min: 10,
        max: 100000,
        field: |config| &mut config.max_redirections,
    },
    Parameter {
        name: "l2FlowPriority",
        default: 10,
        min: 1,
        max: 999,
        field: |config| &mut config.l2_flow_priority,
    },
    Parameter {
        name: "ingressRemoveDivisor",
        default: 4,
        min: 1,
        max: 16,
        field: |config| &mut config.ingress_remove_divisor,
    },
    Parameter {
        name: "taskPoolSize",
        default: 8,
        min: 2,
        max: 64,
        field: |config| &mut config.task_pool_size,
    },
    Parameter {
        name: "taskKeepAlive",
        default: 60000,
        min: 1000,
        max: 3600000,
        field: |config| &mut config.task_keep_alive,
    },
];

impl Parameter {
    fn resolve(&self, value: Option<&str>) -> u32 {
        let value = match value {
            Some(value) => value.trim(),
            None => return self.default,
        };
        match value.parse::<u32>() {
            Ok(n) if (self.min..=self.max).contains(&n) => n,
            Ok(n) => {
                warn!(
                    "{}: {} out of range [{}, {}], using default {}",
                    self.name, n, self.min, self.max, self.default
                );
                self.default
            }
            Err(_) => {
                warn!(
                    "{}: invalid value {:?}, using default {}",
                    self.name, value, self.default
                );
                self.default
            }
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_properties(&HashMap::new())
    }
}

impl Config {
    pub fn from_properties(properties: &HashMap<String, String>) -> Self {
        let mut config = Self {
            flow_mod_timeout: 0,
            remote_flow_mod_timeout: 0,
            remote_bulk_flow_mod_timeout: 0,
            cache_transaction_timeout: 0,
            max_redirections: 0,
            l2_flow_priority: 0,
            ingress_remove_divisor: 0,
            task_pool_size: 0,
            task_keep_alive: 0,
        };
        for parameter in &PARAMETERS {
            let value = parameter.resolve(properties.get(parameter.name).map(String::as_str));
            debug!("{} = {}", parameter.name, value);
            *(parameter.field)(&mut config) = value;
        }
        config
    }

    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let properties =
            java_properties::read(reader).map_err(|err| Error::Config(err.to_string()))?;
        Ok(Self::from_properties(&properties))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|err| Error::Config(format!("{}: {}", path.display(), err)))?;
        Self::from_reader(file)
    }

    pub fn flow_mod_timeout(&self) -> Duration {
        Duration::from_millis(self.flow_mod_timeout as _)
    }

    pub fn remote_flow_mod_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_flow_mod_timeout as _)
    }

    pub fn remote_bulk_flow_mod_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_bulk_flow_mod_timeout as _)
    }

    pub fn cache_transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_transaction_timeout as _)
    }

    pub fn task_keep_alive(&self) -> Duration {
        Duration::from_millis(self.task_keep_alive as _)
    }

    pub fn l2_flow_priority(&self) -> u16 {
        self.l2_flow_priority as _
    }
}
