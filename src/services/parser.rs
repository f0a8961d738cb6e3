use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::{
    error::ApiError,
    models::{Finding, Host, Port, ScanCounters, ScriptResult},
};

// ============================================================================
// XML document model (quick-xml serde)
// ============================================================================

#[derive(Debug, Deserialize)]
struct NmapRun {
    #[serde(rename = "host", default)]
    hosts: Vec<XmlHost>,
}

#[derive(Debug, Deserialize)]
struct XmlHost {
    status: Option<XmlStatus>,
    #[serde(rename = "address", default)]
    addresses: Vec<XmlAddress>,
    hostnames: Option<XmlHostnames>,
    ports: Option<XmlPorts>,
    os: Option<XmlOs>,
    uptime: Option<XmlUptime>,
    distance: Option<XmlDistance>,
    hostscript: Option<XmlHostScript>,
}

#[derive(Debug, Deserialize)]
struct XmlStatus {
    #[serde(rename = "@state")]
    state: String,
}

#[derive(Debug, Deserialize)]
struct XmlAddress {
    #[serde(rename = "@addr")]
    addr: String,
    #[serde(rename = "@addrtype")]
    addrtype: String,
    #[serde(rename = "@vendor")]
    vendor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlHostnames {
    #[serde(rename = "hostname", default)]
    hostnames: Vec<XmlHostname>,
}

#[derive(Debug, Deserialize)]
struct XmlHostname {
    #[serde(rename = "@name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct XmlPorts {
    #[serde(rename = "port", default)]
    ports: Vec<XmlPort>,
}

#[derive(Debug, Deserialize)]
struct XmlPort {
    #[serde(rename = "@protocol")]
    protocol: String,
    #[serde(rename = "@portid")]
    portid: u16,
    state: XmlPortState,
    service: Option<XmlService>,
    #[serde(rename = "script", default)]
    scripts: Vec<XmlScript>,
}

#[derive(Debug, Deserialize)]
struct XmlPortState {
    #[serde(rename = "@state")]
    state: String,
}

#[derive(Debug, Deserialize)]
struct XmlService {
    #[serde(rename = "@name")]
    name: Option<String>,
    #[serde(rename = "@product")]
    product: Option<String>,
    #[serde(rename = "@version")]
    version: Option<String>,
    #[serde(rename = "@extrainfo")]
    extrainfo: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlScript {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@output")]
    output: String,
}

#[derive(Debug, Deserialize)]
struct XmlOs {
    #[serde(rename = "osmatch", default)]
    matches: Vec<XmlOsMatch>,
}

#[derive(Debug, Deserialize)]
struct XmlOsMatch {
    #[serde(rename = "@name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct XmlUptime {
    #[serde(rename = "@seconds")]
    seconds: u64,
    #[serde(rename = "@lastboot")]
    lastboot: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlDistance {
    #[serde(rename = "@value")]
    value: u32,
}

#[derive(Debug, Deserialize)]
struct XmlHostScript {
    #[serde(rename = "script", default)]
    scripts: Vec<XmlScript>,
}

// ============================================================================
// False-positive filter
// ============================================================================

/// Applied before any finding is accepted into a scan's results.
#[derive(Debug, Clone)]
pub struct FalsePositiveFilter {
    deny_list: Vec<String>,
    min_score: f64,
}

impl Default for FalsePositiveFilter {
    fn default() -> Self {
        Self {
            deny_list: vec![
                "PACKETSTORM:140261".to_string(),
                "CVE-2025-32728".to_string(),
                "CVE-2025-26465".to_string(),
            ],
            min_score: 4.0,
        }
    }
}

impl FalsePositiveFilter {
    pub fn new(deny_list: Vec<String>, min_score: f64) -> Self {
        Self {
            deny_list,
            min_score,
        }
    }

    pub fn should_include(&self, id: &str, score: Option<f64>, exploit: bool) -> bool {
        if self.deny_list.iter().any(|denied| denied == id) {
            return false;
        }
        // Overlong hyphen-dense ids are scanner noise, not advisories
        if id.len() > 30 && id.matches('-').count() >= 4 {
            return false;
        }
        if let Some(score) = score {
            if score < self.min_score && !exploit {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// Parsing
// ============================================================================

fn vulners_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Z0-9\-:]+)\s+(\d+\.\d+)\s+(https?://\S+)(.*)$")
            .expect("vulners line regex is valid")
    })
}

fn cpe_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(cpe:/[\w:.\-]+)").expect("cpe regex is valid"))
}

/// Parse a complete nmap XML document into typed hosts.
///
/// Malformed documents produce a ParseError carrying a bounded excerpt of
/// the head of the document; the artifact itself stays on disk.
pub fn parse_hosts(xml: &str) -> Result<Vec<Host>, ApiError> {
    let run: NmapRun = quick_xml::de::from_str(xml).map_err(|e| {
        let excerpt: String = xml.chars().take(200).collect();
        ApiError::parse_error(format!("invalid nmap XML: {} (head: {:?})", e, excerpt))
    })?;

    let mut hosts = Vec::new();
    for xml_host in run.hosts {
        // Down hosts carry nothing useful; only live hosts enter the model.
        let up = xml_host
            .status
            .as_ref()
            .map(|s| s.state == "up")
            .unwrap_or(false);
        if !up {
            continue;
        }

        let Some(ip) = xml_host
            .addresses
            .iter()
            .find(|a| a.addrtype == "ipv4" || a.addrtype == "ipv6")
            .map(|a| a.addr.clone())
        else {
            continue;
        };

        let mac_entry = xml_host.addresses.iter().find(|a| a.addrtype == "mac");

        let mut ports: Vec<Port> = Vec::new();
        if let Some(xml_ports) = xml_host.ports {
            for p in xml_ports.ports {
                ports.push(Port {
                    port: p.portid,
                    protocol: p.protocol,
                    state: p.state.state,
                    service: p.service.as_ref().and_then(|s| s.name.clone()),
                    product: p.service.as_ref().and_then(|s| s.product.clone()),
                    version: p.service.as_ref().and_then(|s| s.version.clone()),
                    extrainfo: p.service.as_ref().and_then(|s| s.extrainfo.clone()),
                    scripts: p
                        .scripts
                        .into_iter()
                        .map(|s| ScriptResult {
                            id: s.id,
                            output: s.output,
                        })
                        .collect(),
                });
            }
        }
        ports.sort_by(|a, b| {
            (a.port, a.protocol.as_str()).cmp(&(b.port, b.protocol.as_str()))
        });

        // Host-level scripts are attached to a pseudo port entry with no
        // number so finding extraction sees them uniformly.
        let host_scripts: Vec<ScriptResult> = xml_host
            .hostscript
            .map(|hs| {
                hs.scripts
                    .into_iter()
                    .map(|s| ScriptResult {
                        id: s.id,
                        output: s.output,
                    })
                    .collect()
            })
            .unwrap_or_default();
        if !host_scripts.is_empty() {
            ports.push(Port {
                port: 0,
                protocol: "host".to_string(),
                state: "host".to_string(),
                service: None,
                product: None,
                version: None,
                extrainfo: None,
                scripts: host_scripts,
            });
        }

        hosts.push(Host {
            ip,
            mac: mac_entry.map(|a| a.addr.clone()),
            vendor: mac_entry.and_then(|a| a.vendor.clone()),
            hostnames: xml_host
                .hostnames
                .map(|h| h.hostnames.into_iter().map(|e| e.name).collect())
                .unwrap_or_default(),
            state: xml_host
                .status
                .map(|s| s.state)
                .unwrap_or_else(|| "unknown".to_string()),
            distance: xml_host.distance.map(|d| d.value),
            os: xml_host.os.and_then(|os| os.matches.into_iter().next().map(|m| m.name)),
            uptime_seconds: xml_host.uptime.as_ref().map(|u| u.seconds),
            last_boot: xml_host.uptime.and_then(|u| u.lastboot),
            ports,
        });
    }

    Ok(hosts)
}

/// Extract findings from all script output across all hosts, applying the
/// false-positive filter. Finding identity is the id string; the first
/// occurrence wins.
pub fn extract_findings(hosts: &[Host], filter: &FalsePositiveFilter) -> Vec<Finding> {
    let mut findings = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for host in hosts {
        for port in &host.ports {
            let port_number = (port.port > 0).then_some(port.port);
            for script in &port.scripts {
                if script.id == "vulners" {
                    parse_vulners_output(
                        &script.output,
                        host,
                        port_number,
                        port.service.as_deref(),
                        filter,
                        &mut seen,
                        &mut findings,
                    );
                } else if script.id.contains("vuln") {
                    if !filter.should_include(&script.id, None, false) {
                        continue;
                    }
                    if !seen.insert(script.id.clone()) {
                        continue;
                    }
                    findings.push(Finding {
                        id: script.id.clone(),
                        score: None,
                        url: None,
                        exploit: false,
                        host: host.ip.clone(),
                        port: port_number,
                        service: port.service.clone(),
                        output: script.output.clone(),
                        cpe: cpe_regex()
                            .captures(&script.output)
                            .map(|c| c[1].to_string()),
                    });
                }
            }
        }
    }

    findings
}

#[allow(clippy::too_many_arguments)]
fn parse_vulners_output(
    output: &str,
    host: &Host,
    port: Option<u16>,
    service: Option<&str>,
    filter: &FalsePositiveFilter,
    seen: &mut HashSet<String>,
    findings: &mut Vec<Finding>,
) {
    let cpe = cpe_regex().captures(output).map(|c| c[1].to_string());

    for line in output.lines() {
        let line = line.trim();
        let Some(caps) = vulners_line_regex().captures(line) else {
            continue;
        };

        let id = caps[1].to_string();
        let score: Option<f64> = caps[2].parse().ok();
        let url = caps[3].to_string();
        let exploit = caps[4].contains("*EXPLOIT*");

        if !filter.should_include(&id, score, exploit) {
            continue;
        }
        if !seen.insert(id.clone()) {
            continue;
        }

        findings.push(Finding {
            id,
            score,
            url: Some(url),
            exploit,
            host: host.ip.clone(),
            port,
            service: service.map(String::from),
            output: line.to_string(),
            cpe: cpe.clone(),
        });
    }
}

/// Result counters for the scan record.
pub fn count_results(hosts: &[Host]) -> ScanCounters {
    let mut counters = ScanCounters {
        total_hosts: hosts.len() as i32,
        ..ScanCounters::default()
    };
    for host in hosts {
        if host.is_up() {
            counters.hosts_up += 1;
        }
        for port in &host.ports {
            if port.port == 0 {
                continue;
            }
            counters.total_ports += 1;
            if port.is_open() {
                counters.open_ports += 1;
            }
        }
    }
    counters
}

/// Drop the network and broadcast addresses of the scanned CIDR from a
/// discovery result; nmap reports them as live on some networks.
pub fn drop_boundary_addresses(mut hosts: Vec<Host>, cidr: &str) -> Vec<Host> {
    let Ok(net) = cidr.parse::<ipnet::IpNet>() else {
        return hosts;
    };
    let network = net.network().to_string();
    let broadcast = net.broadcast().to_string();
    hosts.retain(|h| h.ip != network && h.ip != broadcast);
    hosts
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<nmaprun scanner="nmap" args="nmap -v -T4 -Pn" version="7.94">
  <host>
    <status state="up" reason="arp-response"/>
    <address addr="10.0.0.5" addrtype="ipv4"/>
    <address addr="AA:BB:CC:DD:EE:FF" addrtype="mac" vendor="Acme"/>
    <hostnames>
      <hostname name="printer.lan" type="PTR"/>
    </hostnames>
    <ports>
      <port protocol="tcp" portid="22">
        <state state="open" reason="syn-ack"/>
        <service name="ssh" product="OpenSSH" version="8.2p1"/>
        <script id="vulners" output="cpe:/a:openbsd:openssh:8.2p1:&#10;    CVE-2021-9999 9.8 https://vulners.com/cve/CVE-2021-9999&#10;    CVE-2021-1111 3.9 https://vulners.com/cve/CVE-2021-1111&#10;    EDB-ID:12345 3.9 https://vulners.com/exploit/EDB-ID:12345 *EXPLOIT*&#10;    PACKETSTORM:140261 7.5 https://vulners.com/packetstorm/PACKETSTORM:140261&#10;    CVE-2021-9999 5.0 https://vulners.com/cve/CVE-2021-9999&#10;    MSF:ILITIES-UBUNTU-CVE-2021-0001-ALPHA 5.0 https://vulners.com/msf/X"/>
      </port>
      <port protocol="tcp" portid="80">
        <state state="closed" reason="reset"/>
        <service name="http"/>
      </port>
    </ports>
    <os>
      <osmatch name="Linux 5.4" accuracy="97"/>
      <osmatch name="Linux 4.15" accuracy="92"/>
    </os>
    <uptime seconds="86400" lastboot="yesterday"/>
    <distance value="1"/>
    <hostscript>
      <script id="smb-vuln-ms17-010" output="VULNERABLE: remote code execution"/>
    </hostscript>
  </host>
  <host>
    <status state="down" reason="no-response"/>
    <address addr="10.0.0.6" addrtype="ipv4"/>
  </host>
</nmaprun>"#;

    #[test]
    fn test_parse_hosts_extracts_full_model() {
        let hosts = parse_hosts(SAMPLE_XML).unwrap();
        // The down host at 10.0.0.6 is dropped at parse time
        assert_eq!(hosts.len(), 1);

        let h = &hosts[0];
        assert_eq!(h.ip, "10.0.0.5");
        assert_eq!(h.mac.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(h.vendor.as_deref(), Some("Acme"));
        assert_eq!(h.hostnames, vec!["printer.lan"]);
        assert_eq!(h.state, "up");
        assert_eq!(h.distance, Some(1));
        assert_eq!(h.os.as_deref(), Some("Linux 5.4"));
        assert_eq!(h.uptime_seconds, Some(86400));
        assert_eq!(h.last_boot.as_deref(), Some("yesterday"));

        let ssh = &h.ports[0];
        assert_eq!(ssh.port, 22);
        assert_eq!(ssh.protocol, "tcp");
        assert!(ssh.is_open());
        assert_eq!(ssh.service.as_deref(), Some("ssh"));
        assert_eq!(ssh.product.as_deref(), Some("OpenSSH"));
        assert_eq!(ssh.version.as_deref(), Some("8.2p1"));
    }

    #[test]
    fn test_down_hosts_are_dropped() {
        let xml = r#"<?xml version="1.0"?>
<nmaprun scanner="nmap">
  <host>
    <status state="up"/>
    <address addr="10.0.0.1" addrtype="ipv4"/>
  </host>
  <host>
    <status state="down"/>
    <address addr="10.0.0.2" addrtype="ipv4"/>
  </host>
  <host>
    <address addr="10.0.0.3" addrtype="ipv4"/>
  </host>
</nmaprun>"#;
        let hosts = parse_hosts(xml).unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].ip, "10.0.0.1");
    }

    #[test]
    fn test_ports_sorted_by_number_then_protocol() {
        let xml = r#"<?xml version="1.0"?>
<nmaprun scanner="nmap">
  <host>
    <status state="up"/>
    <address addr="10.0.0.1" addrtype="ipv4"/>
    <ports>
      <port protocol="tcp" portid="443"><state state="open"/></port>
      <port protocol="udp" portid="53"><state state="open"/></port>
      <port protocol="tcp" portid="22"><state state="open"/></port>
      <port protocol="tcp" portid="53"><state state="open"/></port>
    </ports>
    <hostscript>
      <script id="smb-vuln-x" output="check"/>
    </hostscript>
  </host>
</nmaprun>"#;
        let hosts = parse_hosts(xml).unwrap();
        let keys: Vec<(u16, &str)> = hosts[0]
            .ports
            .iter()
            .map(|p| (p.port, p.protocol.as_str()))
            .collect();
        // Host scripts trail the real ports on a pseudo entry
        assert_eq!(
            keys,
            vec![
                (22, "tcp"),
                (53, "tcp"),
                (53, "udp"),
                (443, "tcp"),
                (0, "host"),
            ]
        );
    }

    #[test]
    fn test_malformed_xml_is_parse_error_with_excerpt() {
        let result = parse_hosts("this is not xml at all");
        match result {
            Err(ApiError::ParseError(msg)) => {
                assert!(msg.contains("this is not xml"));
            }
            other => panic!("expected ParseError, got {:?}", other),
        }
    }

    #[test]
    fn test_findings_extraction_and_filter() {
        let hosts = parse_hosts(SAMPLE_XML).unwrap();
        let findings = extract_findings(&hosts, &FalsePositiveFilter::default());

        let ids: Vec<&str> = findings.iter().map(|f| f.id.as_str()).collect();

        // 9.8 kept, first occurrence wins (score stays 9.8)
        let high = findings.iter().find(|f| f.id == "CVE-2021-9999").unwrap();
        assert_eq!(high.score, Some(9.8));
        assert_eq!(high.host, "10.0.0.5");
        assert_eq!(high.port, Some(22));
        assert_eq!(high.service.as_deref(), Some("ssh"));
        assert_eq!(high.cpe.as_deref(), Some("cpe:/a:openbsd:openssh:8.2p1"));
        assert_eq!(
            high.url.as_deref(),
            Some("https://vulners.com/cve/CVE-2021-9999")
        );

        // 3.9 without exploit dropped
        assert!(!ids.contains(&"CVE-2021-1111"));
        // 3.9 with exploit kept
        let exploit = findings.iter().find(|f| f.id == "EDB-ID:12345").unwrap();
        assert!(exploit.exploit);
        // deny-list entry dropped even with a high score
        assert!(!ids.contains(&"PACKETSTORM:140261"));
        // overlong hyphen-dense id dropped
        assert!(!ids.iter().any(|id| id.starts_with("MSF:ILITIES")));

        // host-level vuln script becomes a portless finding
        let smb = findings
            .iter()
            .find(|f| f.id == "smb-vuln-ms17-010")
            .unwrap();
        assert_eq!(smb.port, None);
        assert_eq!(smb.score, None);
    }

    #[test]
    fn test_filter_score_boundary() {
        let filter = FalsePositiveFilter::default();
        assert!(!filter.should_include("CVE-2024-0001", Some(3.9), false));
        assert!(filter.should_include("CVE-2024-0001", Some(3.9), true));
        assert!(filter.should_include("CVE-2024-0001", Some(4.0), false));
        // No score: the score rule does not apply
        assert!(filter.should_include("ssl-poodle-check", None, false));
    }

    #[test]
    fn test_filter_long_id_heuristic() {
        let filter = FalsePositiveFilter::default();
        // Long but few hyphens: kept
        assert!(filter.should_include(
            "PACKETSTORM:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
            Some(9.0),
            false
        ));
        // Long and hyphen-dense: dropped
        assert!(!filter.should_include(
            "MSF:ILITIES-UBUNTU-CVE-2020-12345-FOO",
            Some(9.0),
            false
        ));
    }

    #[test]
    fn test_count_results() {
        let hosts = parse_hosts(SAMPLE_XML).unwrap();
        let counters = count_results(&hosts);
        assert_eq!(counters.total_hosts, 1);
        assert_eq!(counters.hosts_up, 1);
        // Host-script pseudo entry is not a port
        assert_eq!(counters.total_ports, 2);
        assert_eq!(counters.open_ports, 1);
    }

    #[test]
    fn test_drop_boundary_addresses() {
        let make = |ip: &str| Host {
            ip: ip.to_string(),
            mac: None,
            vendor: None,
            hostnames: vec![],
            state: "up".to_string(),
            distance: None,
            os: None,
            uptime_seconds: None,
            last_boot: None,
            ports: vec![],
        };
        let hosts = vec![make("10.0.0.0"), make("10.0.0.5"), make("10.0.0.255")];
        let filtered = drop_boundary_addresses(hosts, "10.0.0.0/24");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].ip, "10.0.0.5");
    }

    #[test]
    fn test_drop_boundary_addresses_bad_cidr_is_noop() {
        let hosts = vec![Host {
            ip: "10.0.0.0".to_string(),
            mac: None,
            vendor: None,
            hostnames: vec![],
            state: "up".to_string(),
            distance: None,
            os: None,
            uptime_seconds: None,
            last_boot: None,
            ports: vec![],
        }];
        let filtered = drop_boundary_addresses(hosts.clone(), "not-a-cidr");
        assert_eq!(filtered.len(), hosts.len());
    }
}
