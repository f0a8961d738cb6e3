use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// Insight - a prioritized observation from comparing two scans
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
    NewVulnCritical,
    NewVulnHigh,
    NewVulnMedium,
    NewVulnLow,
    NewHost,
    MissingHost,
    NewPort,
    PortClosed,
    ServiceChange,
    ScanPerformance,
}

impl InsightKind {
    /// Fixed priority weight; insights are sorted descending by this.
    pub fn priority(&self) -> i32 {
        match self {
            InsightKind::NewVulnCritical => 100,
            InsightKind::NewVulnHigh => 90,
            InsightKind::MissingHost => 80,
            InsightKind::NewVulnMedium => 70,
            InsightKind::NewHost => 60,
            InsightKind::NewPort => 50,
            InsightKind::ServiceChange => 40,
            InsightKind::NewVulnLow => 30,
            InsightKind::PortClosed => 20,
            InsightKind::ScanPerformance => 10,
        }
    }
}

impl std::fmt::Display for InsightKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InsightKind::NewVulnCritical => "new_vuln_critical",
            InsightKind::NewVulnHigh => "new_vuln_high",
            InsightKind::NewVulnMedium => "new_vuln_medium",
            InsightKind::NewVulnLow => "new_vuln_low",
            InsightKind::NewHost => "new_host",
            InsightKind::MissingHost => "missing_host",
            InsightKind::NewPort => "new_port",
            InsightKind::PortClosed => "port_closed",
            InsightKind::ServiceChange => "service_change",
            InsightKind::ScanPerformance => "scan_performance",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: InsightKind,
    /// Subject label: an IP, or a summary like "12 hosts".
    pub host: String,
    pub message: String,
    pub priority: i32,
    pub details: Value,
    pub is_read: bool,
    pub scan_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Finding severity heuristics
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn vuln_insight_kind(&self) -> InsightKind {
        match self {
            Severity::Critical => InsightKind::NewVulnCritical,
            Severity::High => InsightKind::NewVulnHigh,
            Severity::Medium => InsightKind::NewVulnMedium,
            Severity::Low => InsightKind::NewVulnLow,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::High => write!(f, "high"),
            Severity::Medium => write!(f, "medium"),
            Severity::Low => write!(f, "low"),
        }
    }
}

/// Severity classification rules. CVSS thresholds apply when a score is
/// present; keyword buckets over finding id + output apply otherwise.
#[derive(Debug, Clone)]
pub struct SeverityRules {
    pub critical_min_score: f64,
    pub high_min_score: f64,
    pub medium_min_score: f64,
    pub critical_keywords: Vec<String>,
    pub high_keywords: Vec<String>,
    pub medium_keywords: Vec<String>,
}

impl Default for SeverityRules {
    fn default() -> Self {
        Self {
            critical_min_score: 9.0,
            high_min_score: 7.0,
            medium_min_score: 4.0,
            critical_keywords: vec![
                "critical".to_string(),
                "rce".to_string(),
                "remote code".to_string(),
            ],
            high_keywords: vec!["high".to_string(), "privilege escalation".to_string()],
            medium_keywords: vec!["medium".to_string(), "disclosure".to_string()],
        }
    }
}

impl SeverityRules {
    pub fn classify(&self, id: &str, output: &str, score: Option<f64>) -> Severity {
        if let Some(score) = score {
            if score >= self.critical_min_score {
                return Severity::Critical;
            }
            if score >= self.high_min_score {
                return Severity::High;
            }
            if score >= self.medium_min_score {
                return Severity::Medium;
            }
            return Severity::Low;
        }

        let haystack = format!("{} {}", id, output).to_lowercase();
        if self.critical_keywords.iter().any(|w| haystack.contains(w)) {
            Severity::Critical
        } else if self.high_keywords.iter().any(|w| haystack.contains(w)) {
            Severity::High
        } else if self.medium_keywords.iter().any(|w| haystack.contains(w)) {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(InsightKind::NewVulnCritical.priority() > InsightKind::NewVulnHigh.priority());
        assert!(InsightKind::MissingHost.priority() > InsightKind::NewHost.priority());
        assert!(InsightKind::NewPort.priority() > InsightKind::PortClosed.priority());
        assert_eq!(InsightKind::ScanPerformance.priority(), 10);
    }

    #[test]
    fn test_severity_from_score() {
        let rules = SeverityRules::default();
        assert_eq!(rules.classify("CVE-X", "", Some(9.8)), Severity::Critical);
        assert_eq!(rules.classify("CVE-X", "", Some(7.5)), Severity::High);
        assert_eq!(rules.classify("CVE-X", "", Some(5.0)), Severity::Medium);
        assert_eq!(rules.classify("CVE-X", "", Some(2.0)), Severity::Low);
    }

    #[test]
    fn test_severity_from_keywords() {
        let rules = SeverityRules::default();
        assert_eq!(
            rules.classify("ssl-poodle", "allows remote code execution", None),
            Severity::Critical
        );
        assert_eq!(
            rules.classify("x", "privilege escalation possible", None),
            Severity::High
        );
        assert_eq!(
            rules.classify("x", "information disclosure", None),
            Severity::Medium
        );
        assert_eq!(rules.classify("x", "nothing interesting", None), Severity::Low);
    }

    #[test]
    fn test_severity_score_beats_keywords() {
        // Explicit score wins over alarming words in the output
        let rules = SeverityRules::default();
        assert_eq!(
            rules.classify("CVE-X", "critical rce", Some(3.0)),
            Severity::Low
        );
    }
}
