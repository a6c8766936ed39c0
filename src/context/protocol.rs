use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::topology::AreaTopology;

use super::difference::DifferenceMessage;

/// What an agent announces about itself when it registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegistrationDetails {
    pub agent_id: String,
    pub app_id: String,
    pub description: String,
    pub upstream_message_bus_id: String,
    pub downstream_message_bus_id: String,
}

/// Registered agents of one area, keyed by agent id.
pub type AgentRoster = BTreeMap<String, AgentRegistrationDetails>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum::IntoStaticStr)]
#[serde(tag = "request_type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContextRequest {
    GetContext {
        #[serde(rename = "areaId", default, skip_serializing_if = "Option::is_none")]
        area_id: Option<String>,
        #[serde(rename = "modelId", default, skip_serializing_if = "Option::is_none")]
        model_id: Option<String>,
    },
    RegisterAgent {
        agent: AgentRegistrationDetails,
    },
    GetAgents,
    IsInitialized,
    ControlCommand(ControlCommand),
}

impl ContextRequest {
    pub fn get_context(area_id: impl Into<String>) -> Self {
        ContextRequest::GetContext {
            area_id: Some(area_id.into()),
            model_id: None,
        }
    }

    pub fn request_type(&self) -> &'static str {
        self.into()
    }

    /// Whether the responder answers on the request's `reply-to` destination.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            ContextRequest::GetContext { .. }
                | ContextRequest::GetAgents
                | ContextRequest::IsInitialized
        )
    }
}

/// Reply to `get_context`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextResponse {
    pub data: AreaTopology,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializedResponse {
    pub initialized: bool,
}

/// Device control forwarded by a context manager to the simulation input topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlCommand {
    pub command: String,
    pub input: ControlInput,
}

/// `message` is forwarded untouched, whatever its shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulation_id: Option<String>,
    #[serde(default)]
    pub message: Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ControlInput {
    /// The message read as a difference message, when it is one.
    pub fn difference_message(&self) -> Option<DifferenceMessage> {
        serde_json::from_value(self.message.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request = ContextRequest::get_context("switch1");
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"request_type": "get_context", "areaId": "switch1"})
        );
        assert_eq!(
            serde_json::to_value(ContextRequest::GetAgents).unwrap(),
            json!({"request_type": "get_agents"})
        );
        assert_eq!(request.request_type(), "get_context");
        assert_eq!(ContextRequest::IsInitialized.request_type(), "is_initialized");
    }

    #[test]
    fn test_register_agent_parses() {
        let request: ContextRequest = serde_json::from_value(json!({
            "request_type": "register_agent",
            "agent": {
                "agent_id": "da_app_switch1",
                "app_id": "app",
                "description": "",
                "upstream_message_bus_id": "feeder1",
                "downstream_message_bus_id": "switch1"
            }
        }))
        .unwrap();
        match request {
            ContextRequest::RegisterAgent { agent } => assert_eq!(agent.agent_id, "da_app_switch1"),
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_unknown_request_type_is_rejected() {
        let parsed = serde_json::from_value::<ContextRequest>(json!({"request_type": "reboot"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_only_queries_expect_replies() {
        assert!(ContextRequest::GetAgents.expects_reply());
        assert!(ContextRequest::get_context("a").expects_reply());
        let register = ContextRequest::RegisterAgent {
            agent: AgentRegistrationDetails {
                agent_id: "a".into(),
                app_id: "b".into(),
                description: String::new(),
                upstream_message_bus_id: "u".into(),
                downstream_message_bus_id: "d".into(),
            },
        };
        assert!(!register.expects_reply());
    }

    #[test]
    fn test_control_command_keeps_any_message_shape() {
        let request: ContextRequest = serde_json::from_value(json!({
            "request_type": "control_command",
            "command": "update",
            "input": {
                "simulation_id": "sim1",
                "message": {"timestamp": 1.5, "forward_differences": [], "reverse_differences": []},
                "priority": 2
            }
        }))
        .unwrap();
        let ContextRequest::ControlCommand(command) = request else {
            panic!("expected a control command");
        };
        assert_eq!(command.input.message["timestamp"], json!(1.5));
        assert_eq!(command.input.extra["priority"], json!(2));
        assert_eq!(command.input.difference_message(), None);
        assert!(!ContextRequest::ControlCommand(command).expects_reply());
    }
}
