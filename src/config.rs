//! Data source configuration, deserializable from JSON
use crate::errors::DataSourceError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSourceConfig {
    /// Thread name of the apply worker.
    pub worker_name: String,
    /// Log every computed edit script at debug level.
    pub log_edit_scripts: bool,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        DataSourceConfig {
            worker_name: "diffable-apply".to_string(),
            log_edit_scripts: false,
        }
    }
}

impl DataSourceConfig {
    pub fn from_json_str(text: &str) -> Result<Self, DataSourceError> {
        Ok(serde_json::from_str(text)?)
    }
}
