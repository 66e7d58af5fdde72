//! Task priority levels from the board

use serde::{Deserialize, Serialize};

/// Priority label carried by a board item
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl TaskPriority {
    /// Numeric queue priority (1-10 scale): urgent 9, high 7, medium 5, low 3
    pub fn queue_priority(&self) -> u8 {
        match self {
            Self::Urgent => 9,
            Self::High => 7,
            Self::Medium => 5,
            Self::Low => 3,
        }
    }

    /// Parse a board label, defaulting to medium for unknown values
    pub fn from_label(label: &str) -> Self {
        label.parse().unwrap_or_default()
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Urgent => write!(f, "urgent"),
        }
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" | "critical" => Ok(Self::Urgent),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_priority_mapping() {
        assert_eq!(TaskPriority::Urgent.queue_priority(), 9);
        assert_eq!(TaskPriority::High.queue_priority(), 7);
        assert_eq!(TaskPriority::Medium.queue_priority(), 5);
        assert_eq!(TaskPriority::Low.queue_priority(), 3);
    }

    #[test]
    fn test_from_label_defaults_to_medium() {
        assert_eq!(TaskPriority::from_label("HIGH"), TaskPriority::High);
        assert_eq!(TaskPriority::from_label("something else"), TaskPriority::Medium);
        assert_eq!(TaskPriority::from_label(""), TaskPriority::Medium);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Low < TaskPriority::Medium);
        assert!(TaskPriority::Medium < TaskPriority::High);
        assert!(TaskPriority::High < TaskPriority::Urgent);
    }

    #[test]
    fn test_priority_serde() {
        let json = serde_json::to_string(&TaskPriority::Urgent).unwrap();
        assert_eq!(json, "\"urgent\"");
        let parsed: TaskPriority = serde_json::from_str("\"low\"").unwrap();
        assert_eq!(parsed, TaskPriority::Low);
    }
}
