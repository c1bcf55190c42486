use indexmap::IndexMap;
use std::sync::Arc;
use tracing::info;

use super::{BackendDescriptor, BackendHandle, TransformBackend};
use crate::config::PipelineConfig;
use crate::error::RegistryError;
use crate::style::StylePreset;

/// Fixed set of backends, assembled at startup and read-only afterwards.
pub struct BackendRegistry {
    backends: IndexMap<String, Arc<BackendHandle>>,
}

impl BackendRegistry {
    pub fn new(config: &PipelineConfig, backends: Vec<Arc<dyn TransformBackend>>) -> Self {
        let backends = backends
            .into_iter()
            .map(|backend| {
                let handle = BackendHandle::new(
                    backend,
                    config.stage_timeout(),
                    config.backend_concurrency,
                );
                info!(
                    "Registered backend {} ({})",
                    handle.id(),
                    handle.descriptor().model_id
                );
                (handle.id().to_lowercase(), Arc::new(handle))
            })
            .collect();
        Self { backends }
    }

    pub fn resolve(&self, id: &str) -> Result<Arc<BackendHandle>, RegistryError> {
        self.backends
            .get(&id.to_lowercase())
            .cloned()
            .ok_or_else(|| RegistryError::UnknownBackend {
                requested: id.to_string(),
                available: self.ids().join(", "),
            })
    }

    /// Resolves `id` and checks it can run `preset`'s pipeline mode.
    pub fn resolve_for(
        &self,
        id: &str,
        preset: &StylePreset,
    ) -> Result<Arc<BackendHandle>, RegistryError> {
        let handle = self.resolve(id)?;
        let descriptor = handle.descriptor();
        let supported = if preset.is_two_step() {
            descriptor.supports_two_step
        } else {
            descriptor.supports_single_step
        };
        if !supported {
            return Err(RegistryError::IncompatibleStyle {
                style: preset.key.clone(),
                backend: descriptor.id.clone(),
            });
        }
        Ok(handle)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }

    pub fn descriptors(&self) -> Vec<&BackendDescriptor> {
        self.backends.values().map(|handle| handle.descriptor()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalCartoonBackend;
    use crate::style::StyleCatalog;
    use crate::testing::MockBackend;

    fn registry() -> BackendRegistry {
        BackendRegistry::new(
            &PipelineConfig::default(),
            vec![
                Arc::new(LocalCartoonBackend::new()),
                Arc::new(MockBackend::new("single_only").single_step_only()),
            ],
        )
    }

    #[test]
    fn test_resolve_known_backend() {
        let handle = registry().resolve("Local_Cartoon").unwrap();
        assert_eq!(handle.id(), "local_cartoon");
    }

    #[test]
    fn test_unknown_backend_lists_available() {
        match registry().resolve("stable_diffusion") {
            Err(RegistryError::UnknownBackend { requested, available }) => {
                assert_eq!(requested, "stable_diffusion");
                assert_eq!(available, "local_cartoon, single_only");
            }
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("expected UnknownBackend"),
        }
    }

    #[test]
    fn test_two_step_style_needs_two_step_backend() {
        let preset = StyleCatalog::builtin()
            .get("storybook_cartoon")
            .unwrap()
            .clone()
            .two_step("refine the linework");
        let registry = registry();

        assert!(registry.resolve_for("local_cartoon", &preset).is_ok());
        assert!(matches!(
            registry.resolve_for("single_only", &preset),
            Err(RegistryError::IncompatibleStyle { .. })
        ));
    }

    #[test]
    fn test_descriptors_listed_in_registration_order() {
        let registry = registry();
        let ids: Vec<_> = registry.descriptors().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["local_cartoon", "single_only"]);
    }
}
