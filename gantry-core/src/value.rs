/// Blackboard value type. JSON is the lingua franca between nodes,
/// edge conditions, and session state.
pub type Value = serde_json::Value;
