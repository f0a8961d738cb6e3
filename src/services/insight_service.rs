use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::models::{Finding, Host, Insight, InsightKind, SeverityRules};

/// Hosts that drop off the network by more than this many between two scans
/// of the same type get a scan-performance insight: the difference is more
/// likely a scan condition than a real topology change.
const NETWORK_SIZE_CHANGE_THRESHOLD: usize = 5;

/// One scan's worth of comparable results.
pub struct ScanSnapshot<'a> {
    pub hosts: &'a [Host],
    pub findings: &'a [Finding],
}

/// Pure diff engine: compares a scan against the previous completed scan of
/// the same type and produces prioritized insights. No IO; the orchestrator
/// feeds it snapshots and persists what comes out.
pub struct InsightEngine {
    severity: SeverityRules,
}

struct DraftInsight {
    kind: InsightKind,
    host: String,
    message: String,
    details: serde_json::Value,
}

impl InsightEngine {
    pub fn new(severity: SeverityRules) -> Self {
        Self { severity }
    }

    /// First scan of a type has no baseline; summarize what it saw instead
    /// of diffing.
    pub fn baseline(&self, current: &ScanSnapshot<'_>, scan_id: Uuid) -> Vec<Insight> {
        let up_count = current.hosts.iter().filter(|h| h.is_up()).count();
        let critical_count = current
            .findings
            .iter()
            .filter(|f| {
                self.severity
                    .classify(&f.id, &f.output, f.score)
                    .vuln_insight_kind()
                    == InsightKind::NewVulnCritical
            })
            .count();

        let mut drafts = vec![DraftInsight {
            kind: InsightKind::ScanPerformance,
            host: format!("{} hosts", up_count),
            message: format!("Baseline scan found {} hosts up", up_count),
            details: json!({ "hosts_up": up_count }),
        }];

        if critical_count > 0 {
            drafts.push(DraftInsight {
                kind: InsightKind::NewVulnCritical,
                host: format!("{} findings", critical_count),
                message: format!(
                    "Baseline scan found {} critical severity findings",
                    critical_count
                ),
                details: json!({ "critical_findings": critical_count }),
            });
        }

        self.finalize(drafts, scan_id)
    }

    /// Compare against the previous completed scan of the same type.
    pub fn diff(
        &self,
        previous: &ScanSnapshot<'_>,
        current: &ScanSnapshot<'_>,
        scan_id: Uuid,
    ) -> Vec<Insight> {
        let mut drafts = Vec::new();

        let prev_hosts: BTreeMap<&str, &Host> = previous
            .hosts
            .iter()
            .filter(|h| h.is_up())
            .map(|h| (h.ip.as_str(), h))
            .collect();
        let curr_hosts: BTreeMap<&str, &Host> = current
            .hosts
            .iter()
            .filter(|h| h.is_up())
            .map(|h| (h.ip.as_str(), h))
            .collect();

        for (ip, host) in &curr_hosts {
            if !prev_hosts.contains_key(ip) {
                drafts.push(DraftInsight {
                    kind: InsightKind::NewHost,
                    host: ip.to_string(),
                    message: format!("New host appeared on the network: {}", ip),
                    details: json!({
                        "vendor": host.vendor,
                        "hostnames": host.hostnames,
                    }),
                });
            }
        }

        for ip in prev_hosts.keys() {
            if !curr_hosts.contains_key(ip) {
                drafts.push(DraftInsight {
                    kind: InsightKind::MissingHost,
                    host: ip.to_string(),
                    message: format!("Host no longer responding: {}", ip),
                    details: json!({}),
                });
            }
        }

        // Port and service diffs only make sense for hosts seen both times.
        for (ip, curr_host) in &curr_hosts {
            let Some(prev_host) = prev_hosts.get(ip) else {
                continue;
            };
            self.diff_ports(prev_host, curr_host, &mut drafts);
        }

        self.diff_findings(previous, current, &mut drafts);

        let prev_count = prev_hosts.len();
        let curr_count = curr_hosts.len();
        if prev_count.abs_diff(curr_count) > NETWORK_SIZE_CHANGE_THRESHOLD {
            drafts.push(DraftInsight {
                kind: InsightKind::ScanPerformance,
                host: format!("{} hosts", curr_count),
                message: format!(
                    "Network size changed significantly: {} hosts up, previously {}",
                    curr_count, prev_count
                ),
                details: json!({
                    "previous_hosts_up": prev_count,
                    "current_hosts_up": curr_count,
                }),
            });
        }

        self.finalize(drafts, scan_id)
    }

    /// Ports are compared by number only. Protocol and state flaps between
    /// filtered and open produce too much noise on home networks.
    fn diff_ports(&self, previous: &Host, current: &Host, drafts: &mut Vec<DraftInsight>) {
        let prev_open: BTreeMap<u16, &crate::models::Port> = previous
            .ports
            .iter()
            .filter(|p| p.is_open())
            .map(|p| (p.port, p))
            .collect();
        let curr_open: BTreeMap<u16, &crate::models::Port> = current
            .ports
            .iter()
            .filter(|p| p.is_open())
            .map(|p| (p.port, p))
            .collect();

        for (number, port) in &curr_open {
            match prev_open.get(number) {
                None => {
                    drafts.push(DraftInsight {
                        kind: InsightKind::NewPort,
                        host: current.ip.clone(),
                        message: format!(
                            "New open port on {}: {}/{} ({})",
                            current.ip,
                            number,
                            port.protocol,
                            port.service.as_deref().unwrap_or("unknown")
                        ),
                        details: json!({
                            "port": number,
                            "protocol": port.protocol,
                            "service": port.service,
                        }),
                    });
                }
                Some(prev_port) => {
                    let changed = prev_port.service != port.service
                        || prev_port.product != port.product
                        || prev_port.version != port.version;
                    if changed {
                        drafts.push(DraftInsight {
                            kind: InsightKind::ServiceChange,
                            host: current.ip.clone(),
                            message: format!(
                                "Service changed on {} port {}: {} -> {}",
                                current.ip,
                                number,
                                describe_service(prev_port),
                                describe_service(port)
                            ),
                            details: json!({
                                "port": number,
                                "previous": {
                                    "service": prev_port.service,
                                    "product": prev_port.product,
                                    "version": prev_port.version,
                                },
                                "current": {
                                    "service": port.service,
                                    "product": port.product,
                                    "version": port.version,
                                },
                            }),
                        });
                    }
                }
            }
        }

        for number in prev_open.keys() {
            if !curr_open.contains_key(number) {
                drafts.push(DraftInsight {
                    kind: InsightKind::PortClosed,
                    host: current.ip.clone(),
                    message: format!("Port closed on {}: {}", current.ip, number),
                    details: json!({ "port": number }),
                });
            }
        }
    }

    fn diff_findings(
        &self,
        previous: &ScanSnapshot<'_>,
        current: &ScanSnapshot<'_>,
        drafts: &mut Vec<DraftInsight>,
    ) {
        let prev_ids: BTreeSet<&str> = previous.findings.iter().map(|f| f.id.as_str()).collect();

        for finding in current.findings {
            if prev_ids.contains(finding.id.as_str()) {
                continue;
            }
            let severity = self
                .severity
                .classify(&finding.id, &finding.output, finding.score);
            drafts.push(DraftInsight {
                kind: severity.vuln_insight_kind(),
                host: finding.host.clone(),
                message: format!(
                    "New {} severity finding on {}: {}",
                    severity, finding.host, finding.id
                ),
                details: json!({
                    "finding_id": finding.id,
                    "score": finding.score,
                    "url": finding.url,
                    "exploit": finding.exploit,
                    "port": finding.port,
                    "service": finding.service,
                }),
            });
        }
    }

    fn finalize(&self, drafts: Vec<DraftInsight>, scan_id: Uuid) -> Vec<Insight> {
        let now = Utc::now();
        let mut insights: Vec<Insight> = drafts
            .into_iter()
            .map(|d| Insight {
                id: Uuid::new_v4(),
                kind: d.kind,
                host: d.host,
                message: d.message,
                priority: d.kind.priority(),
                details: d.details,
                is_read: false,
                scan_id,
                timestamp: now,
            })
            .collect();
        insights.sort_by(|a, b| b.priority.cmp(&a.priority));
        insights
    }
}

fn describe_service(port: &crate::models::Port) -> String {
    let name = port.service.as_deref().unwrap_or("unknown");
    match (&port.product, &port.version) {
        (Some(product), Some(version)) => format!("{} ({} {})", name, product, version),
        (Some(product), None) => format!("{} ({})", name, product),
        _ => name.to_string(),
    }
}
