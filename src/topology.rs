//! Area topology as exchanged by `get_context`.
//!
//! A feeder node owns switch areas, each switch area owns secondary areas.
//! Every node is keyed by `@id`, which doubles as the id of the bus serving it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AreaTopology {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "AddressableEquipment", default)]
    pub addressable_equipment: Vec<String>,
    #[serde(rename = "UnaddressableEquipment", default)]
    pub unaddressable_equipment: Vec<String>,
    #[serde(rename = "Measurements", default)]
    pub measurements: Vec<String>,
    #[serde(rename = "SwitchAreas", default, skip_serializing_if = "Vec::is_empty")]
    pub switch_areas: Vec<AreaTopology>,
    #[serde(rename = "SecondaryAreas", default, skip_serializing_if = "Vec::is_empty")]
    pub secondary_areas: Vec<AreaTopology>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AreaTopology {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_switch_area(mut self, area: AreaTopology) -> Self {
        self.switch_areas.push(area);
        self
    }

    pub fn with_secondary_area(mut self, area: AreaTopology) -> Self {
        self.secondary_areas.push(area);
        self
    }

    pub fn with_addressable_equipment(mut self, id: impl Into<String>) -> Self {
        self.addressable_equipment.push(id.into());
        self
    }

    /// Depth-first search for the node with `id`, including `self`.
    pub fn find(&self, id: &str) -> Option<&AreaTopology> {
        if self.id == id {
            return Some(self);
        }
        self.switch_areas
            .iter()
            .chain(self.secondary_areas.iter())
            .find_map(|area| area.find(id))
    }

    /// Ids of every node in the tree, parents before children.
    pub fn area_ids(&self) -> Vec<String> {
        let mut ids = vec![self.id.clone()];
        for area in self.switch_areas.iter().chain(self.secondary_areas.iter()) {
            ids.extend(area.area_ids());
        }
        ids
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn feeder() -> AreaTopology {
        AreaTopology::new("feeder1").with_switch_area(
            AreaTopology::new("switch1")
                .with_addressable_equipment("breaker1")
                .with_secondary_area(AreaTopology::new("secondary1")),
        )
    }

    #[test]
    fn test_find_nested_area() {
        let topology = feeder();
        assert_eq!(topology.find("secondary1").map(|a| a.id.as_str()), Some("secondary1"));
        assert!(topology.find("nowhere").is_none());
        assert_eq!(topology.area_ids(), vec!["feeder1", "switch1", "secondary1"]);
    }

    #[test]
    fn test_unknown_fields_survive() {
        let value = json!({
            "@id": "switch1",
            "@type": "SwitchArea",
            "AddressableEquipment": ["sw1"],
            "BoundaryTerminals": ["t1"]
        });
        let topology: AreaTopology = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(topology.addressable_equipment, vec!["sw1"]);
        assert!(topology.measurements.is_empty());

        let back = topology.to_value();
        assert_eq!(back["@type"], "SwitchArea");
        assert_eq!(back["BoundaryTerminals"], json!(["t1"]));
    }
}
