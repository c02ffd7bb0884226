use std::str::FromStr;

use crate::InstanceState;
use crate::LocateEvent;
use crate::LocateEventType;
use crate::ServiceInstance;

#[test]
fn test_new_generates_unique_ids() {
    let a = ServiceInstance::new("gate", "gate");
    let b = ServiceInstance::new("gate", "gate");
    assert!(!a.id.is_empty());
    assert_ne!(a.id, b.id);
}

#[test]
fn test_state_round_trips_through_str() {
    for state in [
        InstanceState::Idle,
        InstanceState::Working,
        InstanceState::Busy,
        InstanceState::Hangup,
    ] {
        let parsed = InstanceState::from_str(&state.to_string()).expect("should succeed");
        assert_eq!(parsed, state);
    }
    assert!(InstanceState::from_str("offline").is_err());
}

#[test]
fn test_locate_event_wire_format() {
    let event = LocateEvent::new(42, LocateEventType::BindNode, "n1", "node");
    let raw = serde_json::to_string(&event).expect("should succeed");

    // instance_name is omitted when unknown
    assert!(!raw.contains("instance_name"));
    assert!(raw.contains("bind_node"));

    let decoded: LocateEvent = serde_json::from_str(&raw).expect("should succeed");
    assert_eq!(decoded, event);
    assert!(decoded.is_bind());
}

#[test]
fn test_locate_event_unbind_is_not_bind() {
    let event = LocateEvent::new(42, LocateEventType::UnbindGate, "g1", "gate");
    assert!(!event.is_bind());
}
