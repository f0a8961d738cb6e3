use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::{
    error::ApiError,
    models::{ScanOptions, ScanType},
};

/// Which launch profile an attempt uses. A privilege error on a Normal
/// attempt triggers exactly one Degraded retry; a Degraded failure is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanAttempt {
    /// Raw-socket profile (-sS, -O allowed). Needs elevated privileges.
    Normal,
    /// Unprivileged fallback: connect scans, no OS fingerprinting.
    Degraded,
}

/// A fully resolved scanner invocation.
#[derive(Debug, Clone)]
pub struct NmapCommand {
    pub program: String,
    pub args: Vec<String>,
    pub output_path: PathBuf,
}

impl NmapCommand {
    pub fn build(
        binary: &str,
        scan_type: ScanType,
        options: &ScanOptions,
        targets: &[String],
        output_path: &Path,
        attempt: ScanAttempt,
    ) -> Result<Self, ApiError> {
        if !scan_type.is_launchable() {
            return Err(ApiError::validation(format!(
                "Scan type {} cannot be launched",
                scan_type
            )));
        }
        if targets.is_empty() {
            return Err(ApiError::validation("No scan targets given"));
        }

        let mut args: Vec<String> = vec!["-v".into(), "-T4".into(), "-Pn".into()];

        match scan_type {
            ScanType::FullTcp => {
                args.extend(["-sS".into(), "-p-".into(), "--open".into()]);
            }
            ScanType::Iot => {
                args.extend([
                    "-sU".into(),
                    "-p".into(),
                    "53,67,68,80,443,1900,5353,554,8080".into(),
                ]);
            }
            ScanType::Vuln => {
                args.extend(["-sS".into(), "-p-".into(), "--open".into()]);
            }
            ScanType::Discovery => {
                args.push("-sn".into());
            }
            ScanType::Uploaded => unreachable!("rejected above"),
        }

        // Feature flags. Discovery is liveness-only and takes none of them.
        if scan_type != ScanType::Discovery {
            if options.os_detection_enabled {
                args.push("-O".into());
            }
            if options.service_detection_enabled {
                args.push("-sV".into());
            }
            if scan_type == ScanType::Vuln {
                args.push("--script=vuln".into());
            } else if options.vuln_scanning_enabled {
                args.push("--script=ssl-cert,ssl-enum-ciphers,http-title,ssh-hostkey".into());
            }
            if options.aggressive_scanning {
                args.push("-A".into());
            }
        }

        if attempt == ScanAttempt::Degraded {
            // Connect scans work without raw sockets; OS detection does not.
            for arg in args.iter_mut() {
                if arg == "-sS" {
                    *arg = "-sT".into();
                }
            }
            args.retain(|a| a != "-O");
        }

        args.extend(targets.iter().cloned());
        args.push("-oX".into());
        args.push(output_path.to_string_lossy().into_owned());

        Ok(Self {
            program: binary.to_string(),
            args,
            output_path: output_path.to_path_buf(),
        })
    }
}

/// XML artifact path: `{dir}/{type}_{YYYY-MM-DD_HHMM}.xml`
pub fn output_path_for(dir: &Path, scan_type: ScanType, now: DateTime<Utc>) -> PathBuf {
    dir.join(format!(
        "{}_{}.xml",
        scan_type,
        now.format("%Y-%m-%d_%H%M")
    ))
}
