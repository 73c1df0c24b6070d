use std::io::Read;
use std::sync::Arc;

use nvmflash_target::{ChipFamily, RawFlashAlgorithm, TargetDescriptionSource};

use super::Target;

/// Error type for all errors which occur when working with the catalogue of target descriptions.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum RegistryError {
    /// Failed to parse the target description.
    Yaml(#[from] serde_yaml::Error),

    /// Failed to read the target description.
    Io(#[from] std::io::Error),

    /// The description of chip family `{family}` is invalid: {message}
    InvalidFamily { family: String, message: String },

    /// No target variant named `{0}` is known.
    UnknownVariant(String),
}

/// A family, together with the shared flash algorithm definitions of its variants.
///
/// The definitions are moved out of `family.flash_algorithms`, so every instruction
/// blob is held exactly once.
#[derive(Debug)]
struct RegisteredFamily {
    family: ChipFamily,
    algorithms: Vec<Arc<RawFlashAlgorithm>>,
}

/// The catalogue of all known chip families.
///
/// Once populated, the registry is only read. Lookups hand out [`Target`]s which share
/// the algorithm definitions with the registry, so targets can be sent to other threads freely.
#[derive(Debug, Default)]
pub struct Registry {
    families: Vec<RegisteredFamily>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// All registered chip families.
    ///
    /// The flash algorithms of a family are not part of the returned value, they are
    /// shared by the [`Target`]s of its variants.
    pub fn families(&self) -> impl Iterator<Item = &ChipFamily> + '_ {
        self.families.iter().map(|registered| &registered.family)
    }

    /// Adds a chip family after validating it.
    ///
    /// A family with the same name which was added before is replaced.
    pub fn add_target_family(&mut self, mut family: ChipFamily) -> Result<(), RegistryError> {
        family
            .validate()
            .map_err(|message| RegistryError::InvalidFamily {
                family: family.name.clone(),
                message,
            })?;

        let algorithms = std::mem::take(&mut family.flash_algorithms)
            .into_iter()
            .map(Arc::new)
            .collect();

        if let Some(index) = self
            .families
            .iter()
            .position(|old| old.family.name == family.name)
        {
            tracing::info!("Replacing chip family {}", family.name);
            self.families.remove(index);
        }

        tracing::debug!(
            "Adding chip family {} with {} variants",
            family.name,
            family.variants.len()
        );
        self.families.push(RegisteredFamily { family, algorithms });

        Ok(())
    }

    /// Parses a chip family from YAML and adds it.
    pub fn add_target_family_from_yaml(&mut self, yaml: impl Read) -> Result<(), RegistryError> {
        let mut family: ChipFamily = serde_yaml::from_reader(yaml)?;
        family.source = TargetDescriptionSource::External;

        self.add_target_family(family)
    }

    /// Resolves the variant with the given name.
    ///
    /// The name is matched exactly, ignoring ASCII case.
    pub fn get_target_by_name(&self, name: impl AsRef<str>) -> Result<Target, RegistryError> {
        let name = name.as_ref();

        for registered in &self.families {
            let family = &registered.family;
            if let Some(variant) = family
                .variants
                .iter()
                .find(|variant| variant.name.eq_ignore_ascii_case(name))
            {
                if variant.name != name {
                    tracing::debug!("Matched chip {} for the name {}", variant.name, name);
                }

                let flash_algorithms = variant
                    .flash_algorithms
                    .iter()
                    .filter_map(|algorithm_name| {
                        registered
                            .algorithms
                            .iter()
                            .find(|algorithm| &algorithm.name == algorithm_name)
                            .cloned()
                    })
                    .collect();

                return Ok(Target::new(variant, flash_algorithms, family.source.clone()));
            }
        }

        Err(RegistryError::UnknownVariant(name.to_string()))
    }
}
