use crate::topics;

/// Level of the grid hierarchy an agent serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum AreaKind {
    Feeder,
    SwitchArea,
    SecondaryArea,
    Substation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgentRole {
    pub kind: AreaKind,
    pub is_context_manager: bool,
}

impl AgentRole {
    pub fn new(kind: AreaKind, is_context_manager: bool) -> Self {
        Self {
            kind,
            is_context_manager,
        }
    }

    /// Role of application `app_id` in an area of `kind`.
    pub fn for_app(kind: AreaKind, app_id: &str) -> Self {
        Self::new(kind, topics::is_context_manager_app(app_id))
    }
}

/// Address an agent is reachable under. Context managers get a fixed,
/// discoverable id per bus; other agents one per application and area.
pub fn derive_agent_id(role: AgentRole, app_id: &str, downstream_bus_id: &str) -> String {
    if role.is_context_manager {
        topics::context_manager_agent_id(downstream_bus_id)
    } else {
        format!("da_{}_{}", app_id, downstream_bus_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_agent_ids() {
        let role = AgentRole::for_app(AreaKind::SwitchArea, "myapp");
        assert!(!role.is_context_manager);
        assert_eq!(derive_agent_id(role, "myapp", "switch1"), "da_myapp_switch1");

        let manager = AgentRole::for_app(AreaKind::Feeder, "context_manager");
        assert!(manager.is_context_manager);
        assert_eq!(
            derive_agent_id(manager, "context_manager", "feeder1"),
            "feeder1.context_manager"
        );
    }

    #[test]
    fn test_area_kind_names() {
        assert_eq!(AreaKind::SecondaryArea.to_string(), "secondary_area");
        assert_eq!(AreaKind::from_str("switch_area").unwrap(), AreaKind::SwitchArea);
    }
}
