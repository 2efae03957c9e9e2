/// Name-to-kind registries for centroiders and PSF models
///
/// Registries are plain values filled by an explicit startup routine
/// (`Registries::with_builtins`). A process-wide instance is reachable through
/// `Registries::global()`; callers that need extra kinds install their own
/// instance with `Registries::install` before the first lookup.
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use crate::error::{MeasError, Result};

/// Centroiding algorithm kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CentroidKind {
    Naive,
    Quadratic,
    Sdss,
}

impl fmt::Display for CentroidKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CentroidKind::Naive => "NAIVE",
            CentroidKind::Quadratic => "QUADRATIC",
            CentroidKind::Sdss => "SDSS",
        };
        f.write_str(name)
    }
}

/// PSF model kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PsfKind {
    Gaussian,
    Fixed,
    Coadd,
    Pca,
}

impl fmt::Display for PsfKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PsfKind::Gaussian => "GAUSSIAN",
            PsfKind::Fixed => "FIXED",
            PsfKind::Coadd => "COADD",
            PsfKind::Pca => "PCA",
        };
        f.write_str(name)
    }
}

/// Mapping from a registered name to a kind identifier
#[derive(Debug, Clone)]
pub struct NamedRegistry<K> {
    label: &'static str,
    types: HashMap<String, K>,
}

impl<K: Copy + fmt::Debug> NamedRegistry<K> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            types: HashMap::new(),
        }
    }

    /// Insert or overwrite the mapping for `name`; the last registration wins
    pub fn register_type(&mut self, name: &str, kind: K) -> Option<K> {
        let previous = self.types.insert(name.to_string(), kind);
        if let Some(old) = previous {
            tracing::warn!(
                "{} registry: {} re-registered ({:?} replaced by {:?})",
                self.label,
                name,
                old,
                kind
            );
        } else {
            tracing::debug!("{} registry: registered {} as {:?}", self.label, name, kind);
        }
        previous
    }

    pub fn lookup_type(&self, name: &str) -> Result<K> {
        self.types
            .get(name)
            .copied()
            .ok_or_else(|| MeasError::NotFound {
                registry: self.label,
                name: name.to_string(),
            })
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }
}

#[derive(Debug, Clone)]
pub struct Registries {
    pub centroid: NamedRegistry<CentroidKind>,
    pub psf: NamedRegistry<PsfKind>,
}

static GLOBAL: OnceLock<Registries> = OnceLock::new();

impl Registries {
    pub fn empty() -> Self {
        Self {
            centroid: NamedRegistry::new("centroid"),
            psf: NamedRegistry::new("psf"),
        }
    }

    /// Every built-in implementation, registered in a fixed order
    pub fn with_builtins() -> Self {
        let mut registries = Self::empty();
        registries.centroid.register_type("NAIVE", CentroidKind::Naive);
        registries
            .centroid
            .register_type("QUADRATIC", CentroidKind::Quadratic);
        registries.psf.register_type("GAUSSIAN", PsfKind::Gaussian);
        registries.psf.register_type("FIXED", PsfKind::Fixed);
        registries.psf.register_type("COADD", PsfKind::Coadd);
        registries
    }

    /// Install the process-wide registries; fails if they were already
    /// installed or used
    pub fn install(registries: Registries) -> std::result::Result<(), Registries> {
        GLOBAL.set(registries)
    }

    /// Process-wide registries, populated with the built-ins on first use
    pub fn global() -> &'static Registries {
        GLOBAL.get_or_init(Registries::with_builtins)
    }
}
