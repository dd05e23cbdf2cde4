use std::collections::HashMap;

/// Arbitrary additional fields preserved through parse and re-emission.
#[derive(Default, Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct UnknownFields(HashMap<String, serde_json::Value>);

impl UnknownFields {
    /// Whether any unrecognized fields were captured.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
