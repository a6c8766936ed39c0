//! Canonical topic and queue names.
//!
//! Independent processes rendezvous by computing these strings on their own,
//! so every builder here is a pure function of its arguments. Names starting
//! with `/topic/` are broadcast, names starting with `/queue/` (or bare names,
//! which brokers place in the queue namespace) are point-to-point.

pub const BASE_TOPIC_PREFIX: &str = "/topic/";
pub const BASE_QUEUE_PREFIX: &str = "/queue/";
pub const TEMP_QUEUE_PREFIX: &str = "/temp-queue/";

pub const BASE_TOPIC: &str = "/topic/goss.gridappsd";
pub const BASE_SIMULATION_TOPIC: &str = "/topic/goss.gridappsd.simulation";
pub const BASE_SIMULATION_LOG_TOPIC: &str = "/topic/goss.gridappsd.simulation.log";
pub const BASE_FIELD_TOPIC: &str = "/topic/goss.gridappsd.field";
pub const BASE_FIELD_QUEUE: &str = "goss.gridappsd.field";
pub const PROCESS_PREFIX: &str = "goss.gridappsd.process";

pub const PLATFORM_STATUS: &str = "/queue/goss.gridappsd.process.request.status.platform";
pub const REQUEST_SIMULATION: &str = "goss.gridappsd.process.request.simulation";
pub const REQUEST_POWERGRID_DATA: &str = "goss.gridappsd.process.request.data.powergridmodel";
/// Field bus manager requests. Only context managers talk to this queue.
pub const REQUEST_FIELD: &str = "goss.gridappsd.process.request.field";
pub const REGISTER_AGENT_QUEUE: &str = "goss.gridappsd.field.register.agent";
pub const TOKEN_TOPIC: &str = "/topic/pnnl.goss.token.topic";

const CONTEXT_MANAGER_SUFFIX: &str = "context_manager";

pub fn platform_log_topic() -> String {
    format!("{}.platform.log", BASE_TOPIC)
}

pub fn simulation_input_topic(simulation_id: &str) -> String {
    format!("{}.input.{}", BASE_SIMULATION_TOPIC, simulation_id)
}

pub fn simulation_output_topic(simulation_id: &str) -> String {
    format!("{}.output.{}", BASE_SIMULATION_TOPIC, simulation_id)
}

pub fn simulation_log_topic(simulation_id: &str) -> String {
    format!("{}.{}", BASE_SIMULATION_LOG_TOPIC, simulation_id)
}

pub fn service_input_topic(service_id: &str, simulation_id: Option<&str>) -> String {
    scoped_service_topic(service_id, simulation_id, "input")
}

pub fn service_output_topic(service_id: &str, simulation_id: Option<&str>) -> String {
    scoped_service_topic(service_id, simulation_id, "output")
}

fn scoped_service_topic(service_id: &str, simulation_id: Option<&str>, direction: &str) -> String {
    match simulation_id {
        Some(sim) => format!("{}.{}.{}.{}", BASE_SIMULATION_TOPIC, service_id, sim, direction),
        None => format!("{}.{}.{}", BASE_SIMULATION_TOPIC, service_id, direction),
    }
}

pub fn application_input_topic(application_id: &str, simulation_id: Option<&str>) -> String {
    scoped_application_topic(application_id, simulation_id, "input")
}

pub fn application_output_topic(application_id: &str, simulation_id: Option<&str>) -> String {
    scoped_application_topic(application_id, simulation_id, "output")
}

fn scoped_application_topic(app_id: &str, simulation_id: Option<&str>, direction: &str) -> String {
    match simulation_id {
        Some(sim) => format!("{}.{}.{}.{}", BASE_SIMULATION_TOPIC, app_id, sim, direction),
        None => format!("{}.{}.{}", BASE_TOPIC, app_id, direction),
    }
}

/// Bus-wide broadcast topic of a field bus.
pub fn field_message_bus_topic(message_bus_id: &str) -> String {
    format!("{}.{}", BASE_FIELD_TOPIC, message_bus_id)
}

pub fn field_message_bus_app_topic(message_bus_id: &str, app_id: &str) -> String {
    format!("{}.{}.{}", BASE_FIELD_TOPIC, message_bus_id, app_id)
}

pub fn field_message_bus_agent_topic(message_bus_id: &str, agent_id: &str) -> String {
    format!("{}.{}.{}", BASE_FIELD_TOPIC, message_bus_id, agent_id)
}

pub fn field_agent_request_queue(message_bus_id: &str, agent_id: &str) -> String {
    format!("{}.request.{}.{}", BASE_FIELD_QUEUE, message_bus_id, agent_id)
}

/// Stable agent id of the context manager serving `message_bus_id`.
pub fn context_manager_agent_id(message_bus_id: &str) -> String {
    format!("{}.{}", message_bus_id, CONTEXT_MANAGER_SUFFIX)
}

pub fn context_request_queue(message_bus_id: &str) -> String {
    field_agent_request_queue(message_bus_id, &context_manager_agent_id(message_bus_id))
}

/// Live field measurements when `simulation_id` is `None`, otherwise the
/// simulation-scoped output of `message_bus_id`.
pub fn field_output_topic(message_bus_id: &str, simulation_id: Option<&str>) -> String {
    match simulation_id {
        Some(sim) => format!("{}.simulation.output.{}.{}", BASE_FIELD_TOPIC, sim, message_bus_id),
        None => format!("{}.output", BASE_FIELD_TOPIC),
    }
}

pub fn field_input_topic(message_bus_id: &str, simulation_id: Option<&str>) -> String {
    match simulation_id {
        Some(sim) => format!("{}.simulation.input.{}.{}", BASE_FIELD_TOPIC, sim, message_bus_id),
        None => format!("{}.input", BASE_FIELD_TOPIC),
    }
}

/// Ephemeral destination a single request's response is delivered to.
pub fn response_reply_topic(request_id: &str) -> String {
    format!("{}response.{}", TEMP_QUEUE_PREFIX, request_id)
}

pub fn token_reply_queue(user: &str, nonce: &str) -> String {
    format!("temp.token_resp.{}-{}", user, nonce)
}

pub fn is_context_manager_app(app_id: &str) -> bool {
    app_id.contains(CONTEXT_MANAGER_SUFFIX)
}

/// Bare names land in the default point-to-point namespace.
pub fn normalize_destination(topic: &str) -> String {
    if topic.starts_with('/') {
        topic.to_string()
    } else {
        format!("{}{}", BASE_QUEUE_PREFIX, topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_service_and_application_topics() {
        assert_eq!(
            service_input_topic("dnp3", Some("12345")),
            "/topic/goss.gridappsd.simulation.dnp3.12345.input"
        );
        assert_eq!(
            service_output_topic("dnp3", None),
            "/topic/goss.gridappsd.simulation.dnp3.output"
        );
        assert_eq!(application_input_topic("app1", None), "/topic/goss.gridappsd.app1.input");
        assert_eq!(
            application_output_topic("app1", Some("12345")),
            "/topic/goss.gridappsd.simulation.app1.12345.output"
        );
    }

    #[test]
    fn test_simulation_topics() {
        assert_eq!(
            simulation_output_topic("123"),
            "/topic/goss.gridappsd.simulation.output.123"
        );
        assert_eq!(
            simulation_input_topic("123"),
            "/topic/goss.gridappsd.simulation.input.123"
        );
        assert_eq!(
            simulation_log_topic("123"),
            "/topic/goss.gridappsd.simulation.log.123"
        );
        assert_eq!(platform_log_topic(), "/topic/goss.gridappsd.platform.log");
    }

    #[test]
    fn test_field_topics() {
        assert_eq!(field_message_bus_topic("sw1"), "/topic/goss.gridappsd.field.sw1");
        assert_eq!(
            field_message_bus_app_topic("sw1", "myapp"),
            "/topic/goss.gridappsd.field.sw1.myapp"
        );
        assert_eq!(
            field_agent_request_queue("sw1", "da_myapp_sw1"),
            "goss.gridappsd.field.request.sw1.da_myapp_sw1"
        );
        assert_eq!(
            context_request_queue("sw1"),
            "goss.gridappsd.field.request.sw1.sw1.context_manager"
        );
        assert_eq!(field_output_topic("sw1", None), "/topic/goss.gridappsd.field.output");
        assert_eq!(
            field_output_topic("sw1", Some("99")),
            "/topic/goss.gridappsd.field.simulation.output.99.sw1"
        );
        assert_eq!(
            field_input_topic("sw1", Some("99")),
            "/topic/goss.gridappsd.field.simulation.input.99.sw1"
        );
    }

    #[test]
    fn test_normalize_destination() {
        assert_eq!(normalize_destination("foo.bar"), "/queue/foo.bar");
        assert_eq!(normalize_destination("/topic/foo.bar"), "/topic/foo.bar");
        assert_eq!(
            normalize_destination(&response_reply_topic("abc")),
            "/temp-queue/response.abc"
        );
    }
}
