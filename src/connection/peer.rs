use serde::{Deserialize, Serialize};
use std::fmt;

/// The device on the other end of the link
///
/// `id` is assigned by the transport and may change when the device
/// reconnects; `display_name` is the stable label used to find it again.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerHandle {
    pub id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
}

impl PeerHandle {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    /// Same device, new transport id
    pub fn with_id(&self, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: self.display_name.clone(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}
