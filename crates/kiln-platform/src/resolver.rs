//! Placement label resolution.
//!
//! Resolution is total. A label set that exactly names a platform entry
//! resolves to that entry; anything else is composed label by label over
//! the global default template. Composition walks the labels in sorted
//! order, so the result does not depend on how the job listed them, and
//! conflicting keys go to the label that sorts last.

use crate::labels;
use crate::template::{ResolvedTemplate, TemplateBuilder, TemplateSource};
use kiln_core::Result;
use kiln_core::config::PlatformTable;
use kiln_core::job::Placement;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Name of the template produced for an empty label set.
pub const DEFAULT_TEMPLATE_NAME: &str = "default";

/// Resolves placement labels against a platform table loaded once at startup.
#[derive(Debug, Clone)]
pub struct PlatformResolver {
    table: Arc<PlatformTable>,
    /// Normalised label set -> entry name.
    exact: BTreeMap<BTreeSet<String>, String>,
    /// Single label -> entry name, for entries addressable by one label.
    single: BTreeMap<String, String>,
}

impl PlatformResolver {
    /// Validate the table and index its entries.
    pub fn new(table: PlatformTable) -> Result<Self> {
        table.validate()?;

        let mut exact = BTreeMap::new();
        let mut single = BTreeMap::new();
        for (name, entry) in &table.entries {
            let key = normalise(name);
            exact.insert(BTreeSet::from([key.clone()]), name.clone());
            single.insert(key, name.clone());

            let aliases: BTreeSet<String> = entry.labels.iter().map(|l| normalise(l)).collect();
            if !aliases.is_empty() {
                if aliases.len() == 1
                    && let Some(alias) = aliases.first()
                {
                    single.insert(alias.clone(), name.clone());
                }
                exact.insert(aliases, name.clone());
            }
        }

        Ok(Self {
            table: Arc::new(table),
            exact,
            single,
        })
    }

    pub fn table(&self) -> &PlatformTable {
        &self.table
    }

    /// Resolve `placement` to a template. Never fails.
    pub fn resolve(&self, placement: &Placement) -> ResolvedTemplate {
        let labels = placement.label_set();

        let template = if labels.is_empty() {
            self.default_template()
        } else if let Some(name) = self.exact.get(&labels) {
            self.exact_template(name)
        } else {
            self.compose(&labels)
        };

        debug!(
            labels = ?labels,
            template = %template.name,
            source = ?template.source,
            image = %template.image,
            "Resolved placement"
        );
        template
    }

    fn default_template(&self) -> ResolvedTemplate {
        let mut builder = TemplateBuilder::default();
        builder.apply(&self.table.default_template);
        self.finish(builder, DEFAULT_TEMPLATE_NAME.to_string(), TemplateSource::Default)
    }

    fn exact_template(&self, name: &str) -> ResolvedTemplate {
        let mut builder = TemplateBuilder::default();
        if let Some(entry) = self.table.entries.get(name) {
            builder.apply(entry);
        }
        self.finish(builder, name.to_string(), TemplateSource::Exact)
    }

    fn compose(&self, labels: &BTreeSet<String>) -> ResolvedTemplate {
        // The base image gives way to the per-OS default once labels pick an OS.
        let mut base = self.table.default_template.clone();
        base.image = None;

        let mut builder = TemplateBuilder::default();
        builder.apply(&base);
        for label in labels {
            match self
                .single
                .get(label)
                .and_then(|name| self.table.entries.get(name))
            {
                Some(entry) => builder.apply(entry),
                None => builder.apply(&labels::contribution(label)),
            }
        }

        let name = labels.iter().cloned().collect::<Vec<_>>().join(",");
        self.finish(builder, name, TemplateSource::Composed)
    }

    fn finish(
        &self,
        builder: TemplateBuilder,
        name: String,
        source: TemplateSource,
    ) -> ResolvedTemplate {
        let fallback = self
            .table
            .default_template
            .image
            .as_deref()
            .unwrap_or("ubuntu:22.04");
        builder.finish(name, source, &self.table.default_image_by_os, fallback)
    }
}

fn normalise(label: &str) -> String {
    label.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{ARCH_KEY, GPU_PRESENT_KEY, GPU_RESOURCE, OS_KEY, SELF_HOSTED_KEY};
    use kiln_core::config::TemplateEntry;
    use pretty_assertions::assert_eq;

    fn table() -> PlatformTable {
        PlatformTable::default()
            .with_entry(
                "ubuntu-latest",
                TemplateEntry {
                    image: Some("ghcr.io/kiln/ubuntu:24.04".to_string()),
                    os: Some("linux".to_string()),
                    node_selector: BTreeMap::from([(OS_KEY.to_string(), "linux".to_string())]),
                    ..TemplateEntry::default()
                },
            )
            .with_entry(
                "gpu-pool",
                TemplateEntry {
                    labels: vec!["self-hosted".into(), "gpu".into(), "linux".into(), "x64".into()],
                    image: Some("nvcr.io/nvidia/cuda:12.4.0-runtime-ubuntu22.04".to_string()),
                    node_selector: BTreeMap::from([("pool".to_string(), "gpu".to_string())]),
                    ..TemplateEntry::default()
                },
            )
    }

    fn resolver() -> PlatformResolver {
        PlatformResolver::new(table()).unwrap()
    }

    #[test]
    fn test_empty_placement_yields_default_template() {
        let template = resolver().resolve(&Placement::default());
        assert_eq!(template.source, TemplateSource::Default);
        assert_eq!(template.name, DEFAULT_TEMPLATE_NAME);
        assert_eq!(template.image, "ubuntu:22.04");
    }

    #[test]
    fn test_exact_match_by_name_and_alias_set() {
        let resolver = resolver();

        let by_name = resolver.resolve(&Placement::new(["Ubuntu-Latest"]));
        assert_eq!(by_name.source, TemplateSource::Exact);
        assert_eq!(by_name.image, "ghcr.io/kiln/ubuntu:24.04");

        let by_alias = resolver.resolve(&Placement::new(["x64", "linux", "gpu", "self-hosted"]));
        assert_eq!(by_alias.source, TemplateSource::Exact);
        assert_eq!(by_alias.name, "gpu-pool");
        assert_eq!(by_alias.node_selector["pool"], "gpu");
    }

    #[test]
    fn test_self_hosted_gpu_linux_composes_all_constraints() {
        let resolver = resolver();
        let expected = resolver.resolve(&Placement::new(["self-hosted", "gpu", "linux"]));
        assert_eq!(expected.source, TemplateSource::Composed);
        assert_eq!(expected.node_selector[SELF_HOSTED_KEY], "true");
        assert_eq!(expected.node_selector[GPU_PRESENT_KEY], "true");
        assert_eq!(expected.node_selector[OS_KEY], "linux");
        assert_eq!(expected.resources.limits[GPU_RESOURCE], "1");

        let orders = [
            ["gpu", "linux", "self-hosted"],
            ["linux", "self-hosted", "gpu"],
            ["linux", "gpu", "self-hosted"],
            ["gpu", "self-hosted", "linux"],
            ["self-hosted", "linux", "gpu"],
        ];
        for order in orders {
            assert_eq!(resolver.resolve(&Placement::new(order)), expected, "{:?}", order);
        }
    }

    #[test]
    fn test_unknown_labels_become_boolean_constraints() {
        let template = resolver().resolve(&Placement::new(["linux", "team-infra"]));
        assert_eq!(template.node_selector["kiln.dev/label-team-infra"], "true");
        assert_eq!(template.image, "ubuntu:22.04");
    }

    #[test]
    fn test_windows_image_comes_from_os_table() {
        let template = resolver().resolve(&Placement::new(["windows", "x64"]));
        assert_eq!(template.os, "windows");
        assert_eq!(template.node_selector[OS_KEY], "windows");
        assert_eq!(template.node_selector[ARCH_KEY], "amd64");
        assert_eq!(template.image, "mcr.microsoft.com/windows/servercore:ltsc2022");
    }

    #[test]
    fn test_single_label_entry_contributes_to_composition() {
        let template = resolver().resolve(&Placement::new(["ubuntu-latest", "large"]));
        assert_eq!(template.source, TemplateSource::Composed);
        assert_eq!(template.image, "ghcr.io/kiln/ubuntu:24.04");
        assert_eq!(template.resources.requests["cpu"], "4");
    }

    #[test]
    fn test_conflicts_resolve_in_sorted_label_order() {
        // "windows" sorts after "linux" and wins the os key.
        let template = resolver().resolve(&Placement::new(["windows", "linux"]));
        assert_eq!(template.node_selector[OS_KEY], "windows");
        assert_eq!(
            template,
            resolver().resolve(&Placement::new(["linux", "windows"]))
        );
    }

    #[test]
    fn test_resolution_is_total_and_deterministic() {
        let resolver = resolver();
        let samples: [&[&str]; 6] = [
            &[],
            &["  "],
            &["??", "!!"],
            &["GPU", "gpu", "Gpu"],
            &["aarch64", "arm64", "xlarge"],
            &["ubuntu-22.04", "self-hosted", "cuda", "zone-a"],
        ];
        for labels in samples {
            let placement = Placement::new(labels.iter().copied());
            let first = resolver.resolve(&placement);
            assert!(!first.image.is_empty());
            assert_eq!(resolver.resolve(&placement), first);
        }
    }

    #[test]
    fn test_malformed_table_rejected() {
        let table = PlatformTable::default().with_entry(
            "broken",
            TemplateEntry {
                image: Some(" ".to_string()),
                ..TemplateEntry::default()
            },
        );
        assert!(matches!(
            PlatformResolver::new(table),
            Err(kiln_core::Error::Config(_))
        ));
    }
}
