use serde::{Deserialize, Serialize};

/// Status carried by an agent report. `Healthy`/`Unhealthy` arrive over the
/// wire; the consensus variants are written by the aggregator when a window
/// terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "report_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    Healthy,
    Unhealthy,
    ConsensusReached,
    ConsensusFailed,
}

impl ReportStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "HEALTHY" => Some(Self::Healthy),
            "UNHEALTHY" => Some(Self::Unhealthy),
            "CONSENSUS_REACHED" => Some(Self::ConsensusReached),
            "CONSENSUS_FAILED" => Some(Self::ConsensusFailed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::Unhealthy => "UNHEALTHY",
            Self::ConsensusReached => "CONSENSUS_REACHED",
            Self::ConsensusFailed => "CONSENSUS_FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "alert_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    Pending,
    Acknowledged,
    Resolved,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_all_wire_values() {
        assert_eq!(ReportStatus::parse("HEALTHY"), Some(ReportStatus::Healthy));
        assert_eq!(
            ReportStatus::parse("UNHEALTHY"),
            Some(ReportStatus::Unhealthy)
        );
        assert_eq!(
            ReportStatus::parse("CONSENSUS_REACHED"),
            Some(ReportStatus::ConsensusReached)
        );
        assert_eq!(
            ReportStatus::parse("CONSENSUS_FAILED"),
            Some(ReportStatus::ConsensusFailed)
        );
    }

    #[test]
    fn parse_rejects_unknown_values() {
        assert_eq!(ReportStatus::parse("healthy"), None);
        assert_eq!(ReportStatus::parse("DEGRADED"), None);
        assert_eq!(ReportStatus::parse(""), None);
    }

    #[test]
    fn round_trips_through_as_str() {
        for status in [
            ReportStatus::Healthy,
            ReportStatus::Unhealthy,
            ReportStatus::ConsensusReached,
            ReportStatus::ConsensusFailed,
        ] {
            assert_eq!(ReportStatus::parse(status.as_str()), Some(status));
        }
    }
}
