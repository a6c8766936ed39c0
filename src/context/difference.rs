use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::protocol::{ControlCommand, ControlInput};

/// One attribute change of one CIM object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Difference {
    pub object: String,
    pub attribute: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifferenceMessage {
    pub timestamp: u64,
    pub difference_mrid: String,
    pub reverse_differences: Vec<Difference>,
    pub forward_differences: Vec<Difference>,
}

/// Collects forward and reverse differences into an `update` command.
#[derive(Debug, Clone, Default)]
pub struct DifferenceBuilder {
    simulation_id: Option<String>,
    forward: Vec<Difference>,
    reverse: Vec<Difference>,
}

impl DifferenceBuilder {
    pub fn new(simulation_id: Option<String>) -> Self {
        Self {
            simulation_id,
            ..Default::default()
        }
    }

    pub fn add_difference(
        &mut self,
        object: impl Into<String>,
        attribute: impl Into<String>,
        forward_value: impl Into<Value>,
        reverse_value: impl Into<Value>,
    ) -> &mut Self {
        let object = object.into();
        let attribute = attribute.into();
        self.forward.push(Difference {
            object: object.clone(),
            attribute: attribute.clone(),
            value: forward_value.into(),
        });
        self.reverse.push(Difference {
            object,
            attribute,
            value: reverse_value.into(),
        });
        self
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
    }

    pub fn simulation_id(&self) -> Option<&str> {
        self.simulation_id.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Builds the command stamped with `epoch` seconds, or the current time.
    pub fn build(&self, epoch: Option<u64>) -> ControlCommand {
        let timestamp = epoch.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default()
        });
        ControlCommand {
            command: "update".to_string(),
            input: ControlInput {
                simulation_id: self.simulation_id.clone(),
                message: json!({
                    "timestamp": timestamp,
                    "difference_mrid": Uuid::new_v4().to_string(),
                    "reverse_differences": self.reverse,
                    "forward_differences": self.forward,
                }),
                extra: Default::default(),
            },
        }
    }
}
