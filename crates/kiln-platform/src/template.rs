//! Resolved sandbox templates.

use kiln_core::config::TemplateEntry;
use kiln_core::sandbox::{NodeRequirement, ResourceRequirements, SecurityProfile, Toleration};
use serde::Serialize;
use std::collections::BTreeMap;

/// How a template was arrived at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateSource {
    /// The whole label set named one platform entry.
    Exact,
    /// Built label by label.
    Composed,
    /// No usable label; the global default template.
    Default,
}

/// Concrete image, resource and placement bundle for one sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedTemplate {
    pub name: String,
    pub source: TemplateSource,
    pub image: String,
    pub os: String,
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
    pub affinity: Vec<NodeRequirement>,
    pub resources: ResourceRequirements,
    pub security: SecurityProfile,
}

/// Accumulates template fields as map unions. Later writes win per key.
#[derive(Debug, Clone, Default)]
pub(crate) struct TemplateBuilder {
    image: Option<String>,
    os: Option<String>,
    node_selector: BTreeMap<String, String>,
    tolerations: BTreeMap<(String, Option<String>), Toleration>,
    affinity: BTreeMap<String, Vec<String>>,
    resources: ResourceRequirements,
    security: Option<SecurityProfile>,
}

impl TemplateBuilder {
    pub(crate) fn apply(&mut self, entry: &TemplateEntry) {
        if let Some(image) = &entry.image {
            self.image = Some(image.clone());
        }
        if let Some(os) = &entry.os {
            self.os = Some(os.clone());
        }
        self.node_selector.extend(
            entry
                .node_selector
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        for toleration in &entry.tolerations {
            self.tolerations.insert(
                (toleration.key.clone(), toleration.effect.clone()),
                toleration.clone(),
            );
        }
        for requirement in &entry.affinity {
            self.affinity
                .insert(requirement.key.clone(), requirement.values.clone());
        }
        self.resources.merge(&entry.resources);
        if let Some(security) = &entry.security {
            self.security = Some(security.clone());
        }
    }

    /// Fill a missing image from the per-OS table, then from `fallback_image`.
    pub(crate) fn finish(
        self,
        name: String,
        source: TemplateSource,
        images_by_os: &BTreeMap<String, String>,
        fallback_image: &str,
    ) -> ResolvedTemplate {
        let os = self.os.unwrap_or_else(|| "linux".to_string());
        let image = self
            .image
            .or_else(|| images_by_os.get(&os).cloned())
            .unwrap_or_else(|| fallback_image.to_string());

        ResolvedTemplate {
            name,
            source,
            image,
            os,
            node_selector: self.node_selector,
            tolerations: self.tolerations.into_values().collect(),
            affinity: self
                .affinity
                .into_iter()
                .map(|(key, values)| NodeRequirement { key, values })
                .collect(),
            resources: self.resources,
            security: self.security.unwrap_or_default(),
        }
    }
}
