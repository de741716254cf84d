use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Global filter switch; when off, registered filters are ignored
    pub filters_enabled: bool,
    /// Global assertion switch; per-object check options apply only when on
    pub assertions_enabled: bool,
    /// Validate results against declared return constraints
    pub check_results: bool,
    /// Maximum number of nested call frames
    pub max_depth: usize,
    /// Log a warning when class-mixin expansion hits an already expanded class
    pub warn_mixin_cycles: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            filters_enabled: true,
            assertions_enabled: true,
            check_results: true,
            max_depth: 100,
            warn_mixin_cycles: true,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
