//! Fixed mapping from well-known placement labels to node constraints.

use kiln_core::config::TemplateEntry;
use kiln_core::sandbox::{ResourceRequirements, Toleration};
use std::collections::BTreeMap;

pub const OS_KEY: &str = "kubernetes.io/os";
pub const ARCH_KEY: &str = "kubernetes.io/arch";
pub const GPU_PRESENT_KEY: &str = "nvidia.com/gpu.present";
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";
pub const SELF_HOSTED_KEY: &str = "kiln.dev/self-hosted";
pub const LABEL_KEY_PREFIX: &str = "kiln.dev/label-";

/// What a single label contributes to a composed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelKind {
    Os(&'static str),
    Arch(&'static str),
    Gpu,
    SelfHosted,
    Size { cpu: &'static str, memory: &'static str },
    Unknown,
}

/// Classify a normalised (lower-case, trimmed) label.
pub fn classify(label: &str) -> LabelKind {
    match label {
        "linux" | "ubuntu" | "debian" => LabelKind::Os("linux"),
        l if l.starts_with("ubuntu-") || l.starts_with("debian-") => LabelKind::Os("linux"),
        "windows" => LabelKind::Os("windows"),
        l if l.starts_with("windows-") => LabelKind::Os("windows"),
        "x64" | "amd64" | "x86_64" => LabelKind::Arch("amd64"),
        "arm64" | "aarch64" => LabelKind::Arch("arm64"),
        "gpu" | "cuda" | "nvidia" => LabelKind::Gpu,
        "self-hosted" => LabelKind::SelfHosted,
        "large" => LabelKind::Size {
            cpu: "4",
            memory: "16Gi",
        },
        "xlarge" => LabelKind::Size {
            cpu: "8",
            memory: "32Gi",
        },
        _ => LabelKind::Unknown,
    }
}

/// Template fields contributed by one label.
pub fn contribution(label: &str) -> TemplateEntry {
    let mut entry = TemplateEntry::default();
    match classify(label) {
        LabelKind::Os(os) => {
            entry.os = Some(os.to_string());
            entry.node_selector.insert(OS_KEY.to_string(), os.to_string());
        }
        LabelKind::Arch(arch) => {
            entry
                .node_selector
                .insert(ARCH_KEY.to_string(), arch.to_string());
        }
        LabelKind::Gpu => {
            entry
                .node_selector
                .insert(GPU_PRESENT_KEY.to_string(), "true".to_string());
            entry.resources = ResourceRequirements {
                requests: BTreeMap::new(),
                limits: BTreeMap::from([(GPU_RESOURCE.to_string(), "1".to_string())]),
            };
            entry
                .tolerations
                .push(Toleration::exists(GPU_RESOURCE, Some("NoSchedule")));
        }
        LabelKind::SelfHosted => {
            entry
                .node_selector
                .insert(SELF_HOSTED_KEY.to_string(), "true".to_string());
        }
        LabelKind::Size { cpu, memory } => {
            let sizes = BTreeMap::from([
                ("cpu".to_string(), cpu.to_string()),
                ("memory".to_string(), memory.to_string()),
            ]);
            entry.resources = ResourceRequirements {
                requests: sizes.clone(),
                limits: sizes,
            };
        }
        LabelKind::Unknown => {
            entry
                .node_selector
                .insert(unknown_label_key(label), "true".to_string());
        }
    }
    entry
}

/// Node-selector key for a label with no known meaning. The name part of
/// a label key is at most 63 characters of `[a-z0-9-_.]`, starting and
/// ending alphanumeric.
pub fn unknown_label_key(label: &str) -> String {
    let budget = 63 - "label-".len();
    let sanitized: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .take(budget)
        .collect();
    let trimmed = sanitized.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    let name = if trimmed.is_empty() { "x" } else { trimmed };
    format!("{}{}", LABEL_KEY_PREFIX, name)
}
