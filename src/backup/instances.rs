use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use std::collections::HashMap;

/// Resolves instance ids to human-readable names for automatic backup names.
pub trait InstanceNames: Send + Sync {
    fn display_name(&self, instance_id: &str) -> Result<String>;
}

/// Names taken from the `instance_names` config map.
#[derive(Debug, Default, Clone)]
pub struct StaticInstanceNames {
    names: HashMap<String, String>,
}

impl StaticInstanceNames {
    pub fn new(names: HashMap<String, String>) -> Self {
        Self { names }
    }
}

impl InstanceNames for StaticInstanceNames {
    fn display_name(&self, instance_id: &str) -> Result<String> {
        self.names
            .get(instance_id)
            .cloned()
            .ok_or_else(|| Error::not_found("instance", instance_id))
    }
}
