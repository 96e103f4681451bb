//! Deterministic, per-job, in-memory label anonymization.

use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::model::ObfuscationMappings;

const KNOWN_COMPONENT_PREFIXES: &[&str] = &[
    "vmstorage_",
    "vmselect_",
    "vminsert_",
    "vmagent_",
    "vmalert_",
];

/// Documentary prefix substituted for masked private IPv4 addresses.
const PRIVATE_IP_MASK_PREFIX: &str = "777.777";

/// Process-scoped (really: job-scoped) deterministic remapper. One instance
/// per pipeline run; its maps are discarded with it once the manifest has
/// been written.
#[derive(Debug, Default)]
pub struct Obfuscator {
    instance_map: BTreeMap<String, String>,
    job_map: BTreeMap<String, String>,
    custom_label_maps: BTreeMap<String, BTreeMap<String, String>>,
}

impl Obfuscator {
    /// Creates an empty obfuscator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Anonymizes an `instance` label value, preserving the `:port` suffix
    /// and whether the host portion was an IP or a DNS name.
    pub fn obfuscate_instance(&mut self, original: &str) -> String {
        if let Some(existing) = self.instance_map.get(original) {
            return existing.clone();
        }
        let n = self.instance_map.len() + 1;
        let (host, port) = split_host_port(original);
        let pseudo_host = if let Ok(ip) = host.parse::<IpAddr>() {
            match ip {
                IpAddr::V4(v4) if is_private_v4(&v4) => {
                    let octets = v4.octets();
                    format!("{PRIVATE_IP_MASK_PREFIX}.{}.{}", octets[2], octets[3])
                }
                IpAddr::V4(_) => format!("10.255.{}.{}", (n >> 8) & 0xff, n & 0xff),
                IpAddr::V6(_) => format!("fd00::{n:x}"),
            }
        } else {
            format!("host-{n}.masked.invalid")
        };
        let pseudo = match &port {
            Some(p) => format!("{pseudo_host}:{p}"),
            None => pseudo_host,
        };
        self.instance_map.insert(original.to_string(), pseudo.clone());
        pseudo
    }

    /// Anonymizes a `job` label value as `<component>-job-<N>`, where `<N>`
    /// increments on each first appearance of `original` in this job's map.
    pub fn obfuscate_job(&mut self, original: &str, component: &str) -> String {
        if let Some(existing) = self.job_map.get(original) {
            return existing.clone();
        }
        let n = self.job_map.len() + 1;
        let pseudo = format!("{component}-job-{n}");
        self.job_map.insert(original.to_string(), pseudo.clone());
        pseudo
    }

    /// Anonymizes a value under a custom label's own namespace, independent
    /// of `instance`/`job`.
    pub fn obfuscate_custom_label(&mut self, label_name: &str, original: &str) -> String {
        let ns = self.custom_label_maps.entry(label_name.to_string()).or_default();
        if let Some(existing) = ns.get(original) {
            return existing.clone();
        }
        let n = ns.len() + 1;
        let pseudo = format!("{label_name}-{n}");
        ns.insert(original.to_string(), pseudo.clone());
        pseudo
    }

    /// Snapshots the accumulated mappings for embedding in the archive
    /// manifest.
    pub fn mappings(&self) -> ObfuscationMappings {
        ObfuscationMappings {
            instance_map: self.instance_map.clone(),
            job_map: self.job_map.clone(),
            custom_label_maps: self.custom_label_maps.clone(),
        }
    }
}

fn split_host_port(addr: &str) -> (String, Option<String>) {
    if let Some(idx) = addr.rfind(':') {
        let (host, port) = addr.split_at(idx);
        let port = &port[1..];
        if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() {
            return (host.to_string(), Some(port.to_string()));
        }
    }
    (addr.to_string(), None)
}

fn is_private_v4(ip: &std::net::Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local()
}

/// Infers the owning component for a record, used to prefix obfuscated job
/// names when no explicit component label is present. Preference order:
/// `component` label, `vm_component` label, longest-prefix match of
/// `__name__` against the known VictoriaMetrics component prefixes, the job
/// name itself, then `"unknown"`.
pub fn infer_component(labels: &BTreeMap<String, String>, job: &str) -> String {
    if let Some(c) = labels.get("component") {
        if !c.is_empty() {
            return c.clone();
        }
    }
    if let Some(c) = labels.get("vm_component") {
        if !c.is_empty() {
            return c.clone();
        }
    }
    if let Some(name) = labels.get("__name__") {
        if let Some(prefix) = KNOWN_COMPONENT_PREFIXES
            .iter()
            .filter(|p| name.starts_with(**p))
            .max_by_key(|p| p.len())
        {
            return prefix.trim_end_matches('_').to_string();
        }
    }
    if !job.is_empty() {
        return job.to_string();
    }
    "unknown".to_string()
}
