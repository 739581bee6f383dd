use serde::{Deserialize, Serialize};
use std::fmt;

/// Which append-only stream an alert belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Spike,
    EditWar,
}

impl AlertKind {
    /// Storage stream the alert kind is appended to.
    pub fn stream(&self) -> &'static str {
        match self {
            AlertKind::Spike => "alerts:spikes",
            AlertKind::EditWar => "alerts:editwars",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertKind::Spike => write!(f, "spike"),
            AlertKind::EditWar => write!(f, "editwar"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Kind-specific alert payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AlertPayload {
    Spike {
        /// 5-minute rate divided by the floored 1-hour rate.
        ratio: f64,
        edits_last_5min: u64,
        severity: Severity,
    },
    EditWar {
        editors: Vec<String>,
        edit_count: u64,
        revert_count: u64,
        severity: Severity,
        /// Unix seconds of the earliest edit in the detection window.
        started_at: i64,
    },
}

impl AlertPayload {
    pub fn severity(&self) -> Severity {
        match self {
            AlertPayload::Spike { severity, .. } => *severity,
            AlertPayload::EditWar { severity, .. } => *severity,
        }
    }
}

/// A record on one of the alert streams.
///
/// Streams tolerate duplicates; detectors bound them with per-page cooldowns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub title: String,
    pub wiki: String,
    /// Unix seconds at emission time.
    pub timestamp: i64,
    #[serde(flatten)]
    pub payload: AlertPayload,
}

impl Alert {
    pub fn kind(&self) -> AlertKind {
        match self.payload {
            AlertPayload::Spike { .. } => AlertKind::Spike,
            AlertPayload::EditWar { .. } => AlertKind::EditWar,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_tag_encodes_kind() {
        let alert = Alert {
            title: "Main Page".into(),
            wiki: "enwiki".into(),
            timestamp: 1_700_000_000,
            payload: AlertPayload::Spike {
                ratio: 12.5,
                edits_last_5min: 30,
                severity: Severity::Medium,
            },
        };
        assert_eq!(alert.kind(), AlertKind::Spike);

        let json = serde_json::to_value(&alert).expect("serialize");
        assert_eq!(json["kind"], "spike");
        assert_eq!(json["severity"], "medium");

        let back: Alert = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, alert);
    }

    #[test]
    fn severity_orders_by_escalation() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }
}
