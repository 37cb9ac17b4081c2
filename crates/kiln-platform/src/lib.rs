//! Platform resolution for Kiln.
//!
//! Maps a job's free-form placement labels to a concrete sandbox template:
//! image, node constraints, resources and security profile.

pub mod labels;
pub mod resolver;
pub mod template;

pub use resolver::{DEFAULT_TEMPLATE_NAME, PlatformResolver};
pub use template::{ResolvedTemplate, TemplateSource};
