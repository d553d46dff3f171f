use serde::{Deserialize, Serialize};
use std::fmt;

/// Activity a training session is labelled with, and what recognition reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Action {
    #[default]
    Standing,
    Walking,
    Running,
    Sitting,
    Lying,
}

impl Action {
    /// Model output order
    pub const ALL: [Action; 5] = [
        Action::Standing,
        Action::Walking,
        Action::Running,
        Action::Sitting,
        Action::Lying,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Standing => "standing",
            Action::Walking => "walking",
            Action::Running => "running",
            Action::Sitting => "sitting",
            Action::Lying => "lying",
        }
    }

    /// Unknown labels fall back to `Standing`
    pub fn from_label(label: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == label)
            .unwrap_or_else(|| {
                tracing::warn!("Unknown action {:?}, using {}", label, Action::default());
                Action::default()
            })
    }
}

impl From<String> for Action {
    fn from(label: String) -> Self {
        Self::from_label(&label)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wrist the watch is worn on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum HandOption {
    #[default]
    Left,
    Right,
}

impl HandOption {
    pub fn as_str(self) -> &'static str {
        match self {
            HandOption::Left => "left",
            HandOption::Right => "right",
        }
    }

    /// Unknown labels fall back to `Left`
    pub fn from_label(label: &str) -> Self {
        match label {
            "left" => HandOption::Left,
            "right" => HandOption::Right,
            other => {
                tracing::warn!("Unknown hand {:?}, using {}", other, HandOption::Left);
                HandOption::Left
            }
        }
    }
}

impl From<String> for HandOption {
    fn from(label: String) -> Self {
        Self::from_label(&label)
    }
}

impl fmt::Display for HandOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_parse_and_display() {
        for action in Action::ALL {
            assert_eq!(Action::from_label(&action.to_string()), action);
        }
        assert_eq!(HandOption::from_label("right").to_string(), "right");
    }

    #[test]
    fn test_unknown_labels_fall_back() {
        assert_eq!(Action::from_label("jumping"), Action::Standing);
        assert_eq!(HandOption::from_label(""), HandOption::Left);
    }

    #[test]
    fn test_serde_uses_lowercase() {
        assert_eq!(serde_json::to_string(&Action::Lying).unwrap(), "\"lying\"");
        let hand: HandOption = serde_json::from_str("\"right\"").unwrap();
        assert_eq!(hand, HandOption::Right);
    }

    #[test]
    fn test_serde_falls_back_on_unknown_labels() {
        let action: Action = serde_json::from_str("\"jumping\"").unwrap();
        assert_eq!(action, Action::Standing);
        let hand: HandOption = serde_json::from_str("\"both\"").unwrap();
        assert_eq!(hand, HandOption::Left);
    }
}
