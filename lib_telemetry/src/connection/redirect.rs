//! # Redirect Address Grammar
//!
//! A link redirect from the IoT Hub broker names the Event Hub in its `address`:
//!
//! ```text
//! address     = prefix ":5671/" entity-path "/$management" suffix
//! entity-path = 1*char      ; captured verbatim
//! ```
//!
//! Both literals are matched case-insensitively. The capture runs from the first
//! `:5671/` to the last `/$management`, so an entity path may itself contain `/`.

const PORT_SEGMENT: &str = ":5671/";
const MANAGEMENT_SEGMENT: &str = "/$management";

/// Extracts the entity path from a redirect address, or `None` when the address
/// does not follow the grammar.
pub fn parse_entity_path(address: &str) -> Option<&str> {
    // ASCII lowercasing keeps byte offsets aligned with the original.
    let folded = address.to_ascii_lowercase();
    let start = folded.find(PORT_SEGMENT)? + PORT_SEGMENT.len();
    let end = folded.rfind(MANAGEMENT_SEGMENT)?;
    if end <= start {
        return None;
    }
    Some(&address[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_simple_entity_path() {
        assert_eq!(
            parse_entity_path("amqps://h2.servicebus.windows.net:5671/orders/$management"),
            Some("orders")
        );
    }

    #[test]
    fn literals_match_case_insensitively_and_capture_keeps_case() {
        assert_eq!(
            parse_entity_path("AMQPS://H2.SERVICEBUS.WINDOWS.NET:5671/MyHub-Events/$MANAGEMENT"),
            Some("MyHub-Events")
        );
    }

    #[test]
    fn capture_is_greedy_up_to_the_last_management_segment() {
        assert_eq!(
            parse_entity_path("amqps://h:5671/a/b/$management"),
            Some("a/b")
        );
    }

    #[test]
    fn rejects_addresses_outside_the_grammar() {
        assert_eq!(parse_entity_path("amqps://h:5672/orders/$management"), None);
        assert_eq!(parse_entity_path("amqps://h:5671/orders"), None);
        assert_eq!(parse_entity_path("amqps://h:5671//$management"), None);
        assert_eq!(parse_entity_path("amqps://h:5671/$management"), None);
        assert_eq!(parse_entity_path(""), None);
    }
}
