/// Measurement stage: runs an ordered set of algorithms over every source
///
/// Controls are collected by a builder, sorted by `order` (ties keep the
/// order they were added in) and turned into algorithms for one pixel type.
/// Each algorithm also gets a `<name>.flags` field that is set when it fails
/// on a source; the remaining algorithms and sources still run.
use std::collections::BTreeMap;
use std::sync::Arc;

use rayon::prelude::*;

use crate::algorithm::{Algorithm, AlgorithmControl, ExposurePatch, MeasurablePixel};
use crate::error::Result;
use crate::image::Exposure;
use crate::schema::{Key, Schema, SourceCatalog, SourceRecord};

#[derive(Debug, Clone, Default)]
pub struct MeasurementStageBuilder {
    controls: Vec<Box<dyn AlgorithmControl>>,
}

impl MeasurementStageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a copy of `control`
    pub fn add(&mut self, control: &dyn AlgorithmControl) -> &mut Self {
        self.controls.push(control.clone_control());
        self
    }

    pub fn controls(&self) -> &[Box<dyn AlgorithmControl>] {
        &self.controls
    }

    /// Controls in execution order
    pub fn sorted_controls(&self) -> Vec<&dyn AlgorithmControl> {
        let mut sorted: Vec<&dyn AlgorithmControl> =
            self.controls.iter().map(|c| &**c).collect();
        sorted.sort_by_key(|c| c.order());
        sorted
    }

    /// Build every algorithm for pixel type `P` against a fresh schema
    pub fn build<P: MeasurablePixel>(&self) -> Result<MeasurementStage<P>> {
        let mut schema = Schema::new();
        let mut entries = Vec::with_capacity(self.controls.len());
        for control in self.sorted_controls() {
            let algorithm = control.make_algorithm::<P>(&mut schema)?;
            let failure = schema.add_field::<bool>(
                &format!("{}.flags", control.name()),
                "set if the algorithm failed on this source",
            )?;
            tracing::debug!(
                "Stage: {} (order {}) built for {} pixels",
                control.name(),
                control.order(),
                P::TYPE
            );
            entries.push(StageEntry { algorithm, failure });
        }
        tracing::debug!(
            "Stage built with {} algorithms and {} fields",
            entries.len(),
            schema.len()
        );
        Ok(MeasurementStage {
            schema: Arc::new(schema),
            entries,
        })
    }
}

struct StageEntry<P> {
    algorithm: Box<dyn Algorithm<P>>,
    failure: Key<bool>,
}

pub struct MeasurementStage<P> {
    schema: Arc<Schema>,
    entries: Vec<StageEntry<P>>,
}

/// Per-run counts, keyed by algorithm name
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct MeasurementSummary {
    pub sources: usize,
    pub failed_sources: usize,
    pub failures: BTreeMap<String, usize>,
}

impl<P: MeasurablePixel> MeasurementStage<P> {
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Algorithm names in execution order
    pub fn algorithm_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.algorithm.name()).collect()
    }

    /// Empty catalog laid out against this stage's schema
    pub fn make_catalog(&self) -> SourceCatalog {
        SourceCatalog::new(Arc::clone(&self.schema))
    }

    /// Run every algorithm on one source, returning the indices of the ones
    /// that failed
    pub fn apply_source(&self, source: &mut SourceRecord, exposure: &Exposure<P>) -> Vec<usize> {
        let patch = ExposurePatch::for_source(exposure, source);
        let mut failed = Vec::new();
        for (index, entry) in self.entries.iter().enumerate() {
            match entry.algorithm.apply(source, &patch) {
                Ok(()) => source.set(entry.failure, false),
                Err(err) => {
                    tracing::warn!(
                        "{} failed for source {}: {}",
                        entry.algorithm.name(),
                        source.id,
                        err
                    );
                    source.set(entry.failure, true);
                    failed.push(index);
                }
            }
        }
        failed
    }

    /// Measure every record of `catalog` in parallel
    ///
    /// `catalog` must have been created by `make_catalog` on this stage.
    pub fn measure(
        &self,
        catalog: &mut SourceCatalog,
        exposure: &Exposure<P>,
    ) -> MeasurementSummary {
        let outcomes: Vec<Vec<usize>> = catalog
            .records_mut()
            .par_iter_mut()
            .map(|source| self.apply_source(source, exposure))
            .collect();

        let mut summary = MeasurementSummary {
            sources: outcomes.len(),
            ..Default::default()
        };
        for entry in &self.entries {
            summary.failures.insert(entry.algorithm.name().to_string(), 0);
        }
        for failed in &outcomes {
            if !failed.is_empty() {
                summary.failed_sources += 1;
            }
            for &index in failed {
                let name = self.entries[index].algorithm.name();
                if let Some(count) = summary.failures.get_mut(name) {
                    *count += 1;
                }
            }
        }
        tracing::debug!(
            "Measured {} sources, {} with at least one failure",
            summary.sources,
            summary.failed_sources
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::centroid::CentroidControl;
    use crate::error::MeasError;
    use crate::image::Image;

    fn named_centroid(name: &str, order: i32) -> CentroidControl {
        CentroidControl {
            name: name.to_string(),
            order,
            ..CentroidControl::default()
        }
    }

    fn star_image() -> Exposure<f32> {
        let mut image = Image::<f32>::new(20, 20);
        image.fill(1.0);
        for (x, y) in [(5usize, 5usize), (12, 9), (15, 15)] {
            image.set(x, y, 20.0);
            image.set(x + 1, y, 8.0);
        }
        Exposure::new(image).with_background(1.0)
    }

    #[test]
    fn test_order_then_registration() {
        let mut builder = MeasurementStageBuilder::new();
        builder
            .add(&named_centroid("c.late", 60))
            .add(&named_centroid("c.first", 50))
            .add(&named_centroid("c.second", 50));
        let stage = builder.build::<f32>().unwrap();
        assert_eq!(stage.algorithm_names(), vec!["c.first", "c.second", "c.late"]);
        assert!(stage.schema().contains("c.late.flags"));
    }

    #[test]
    fn test_builder_copies_controls() {
        let mut control = named_centroid("c.a", 50);
        let mut builder = MeasurementStageBuilder::new();
        builder.add(&control);
        control.name = "c.changed".to_string();
        assert_eq!(builder.controls()[0].name(), "c.a");
    }

    #[test]
    fn test_duplicate_names_fail_at_build() {
        let mut builder = MeasurementStageBuilder::new();
        builder
            .add(&CentroidControl::default())
            .add(&CentroidControl::default());
        let err = builder.build::<f64>().err().unwrap();
        assert_eq!(err, MeasError::DuplicateField("centroid.naive.x".to_string()));
    }

    #[test]
    fn test_failures_are_isolated_per_source() {
        let mut builder = MeasurementStageBuilder::new();
        builder.add(&CentroidControl::default());
        let stage = builder.build::<f32>().unwrap();
        let exposure = star_image();

        let mut catalog = stage.make_catalog();
        catalog.add_source(1, 5, 5);
        catalog.add_source(2, 0, 9);
        catalog.add_source(3, 12, 9);
        let summary = stage.measure(&mut catalog, &exposure);

        assert_eq!(summary.sources, 3);
        assert_eq!(summary.failed_sources, 1);
        assert_eq!(summary.failures["centroid.naive"], 1);

        let schema = stage.schema();
        let x = schema.find::<f64>("centroid.naive.x").unwrap();
        let flag = schema.find::<bool>("centroid.naive.flags").unwrap();
        let records = catalog.records();
        assert!(!records[0].get(flag));
        assert!(records[1].get(flag));
        assert!(records[1].get(x).is_nan());
        assert!(!records[2].get(flag));
        assert!(records[2].get(x) > 12.0);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let mut builder = MeasurementStageBuilder::new();
        builder
            .add(&CentroidControl::default())
            .add(&CentroidControl::quadratic());
        let stage = builder.build::<f32>().unwrap();
        let exposure = star_image();

        let mut parallel = stage.make_catalog();
        let mut sequential = stage.make_catalog();
        for (id, (x, y)) in [(5, 5), (12, 9), (15, 15), (19, 19)].into_iter().enumerate() {
            parallel.add_source(id as u64, x, y);
            sequential.add_source(id as u64, x, y);
        }
        stage.measure(&mut parallel, &exposure);
        for record in sequential.records_mut() {
            stage.apply_source(record, &exposure);
        }
        assert_eq!(parallel.records(), sequential.records());
    }
}
