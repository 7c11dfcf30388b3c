//! Runtime configuration.

use serde::{Deserialize, Serialize};

use crate::abi;

/// Names and budgets a [`ProgramRuntime`](crate::ProgramRuntime) uses when
/// binding a module.
///
/// Every field has a default matching the graphl ABI, so a config document
/// only needs to list what it overrides:
///
/// ```
/// use graphl_runtime::RuntimeConfig;
///
/// let cfg = RuntimeConfig::from_json(r#"{ "fuel_per_call": 100000 }"#).unwrap();
/// assert_eq!(cfg.fuel_per_call, Some(100_000));
/// assert_eq!(cfg.host_module, "env");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Export run once after instantiation. Skipped when `None` or when the
    /// module does not export it.
    pub initializer: Option<String>,
    /// Import module plain host bindings are linked under. Module-qualified
    /// bindings name their own module.
    pub host_module: String,
    pub memory_export: String,
    pub alloc_export: String,
    /// Custom section carrying module metadata.
    pub metadata_section: String,
    /// Fuel granted to the initializer and to each export call.
    pub fuel_per_call: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            initializer: Some(abi::DEFAULT_INITIALIZER.to_owned()),
            host_module: abi::HOST_MODULE.to_owned(),
            memory_export: abi::MEMORY_EXPORT.to_owned(),
            alloc_export: abi::ALLOC_EXPORT.to_owned(),
            metadata_section: abi::METADATA_SECTION.to_owned(),
            fuel_per_call: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn with_initializer(mut self, entry: Option<impl Into<String>>) -> Self {
        self.initializer = entry.map(Into::into);
        self
    }

    pub fn with_host_module(mut self, module: impl Into<String>) -> Self {
        self.host_module = module.into();
        self
    }

    pub fn with_memory_export(mut self, name: impl Into<String>) -> Self {
        self.memory_export = name.into();
        self
    }

    pub fn with_alloc_export(mut self, name: impl Into<String>) -> Self {
        self.alloc_export = name.into();
        self
    }

    pub fn with_metadata_section(mut self, name: impl Into<String>) -> Self {
        self.metadata_section = name.into();
        self
    }

    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel_per_call = Some(fuel);
        self
    }
}
