//! Numerical comparison of live state against a control point.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::control_point::{ControlPoint, SpeciesSnapshot};
use crate::domain::SpeciesId;
use crate::error::{PicError, Result};
use crate::field::FieldComponent;

/// Difference between two equally shaped value sets.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ArrayError {
    pub max_abs: f64,
    /// `||live - reference|| / ||reference||`.
    pub rel_l2: f64,
}

impl ArrayError {
    fn from_sums(max_abs: f64, diff_sq: f64, ref_sq: f64) -> Self {
        Self {
            max_abs,
            rel_l2: diff_sq.sqrt() / ref_sq.sqrt().max(f64::MIN_POSITIVE),
        }
    }

    pub fn magnitude(&self) -> f64 {
        self.rel_l2
    }
}

/// Particle differences of one species, matched by id.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SpeciesError {
    pub position: ArrayError,
    pub momentum: ArrayError,
    /// Reference ids without a live counterpart.
    pub missing: usize,
    /// Live ids absent from the reference.
    pub unexpected: usize,
}

/// Result of one validation pass. Large errors are reported, not raised.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub step: u64,
    pub fields: BTreeMap<FieldComponent, ArrayError>,
    pub species: BTreeMap<SpeciesId, SpeciesError>,
}

impl ValidationReport {
    /// Largest relative L2 error over every array and species.
    pub fn magnitude(&self) -> f64 {
        let fields = self.fields.values().map(ArrayError::magnitude);
        let species = self
            .species
            .values()
            .flat_map(|s| [s.position.magnitude(), s.momentum.magnitude()]);
        fields.chain(species).fold(0.0, f64::max)
    }

    pub fn exceeds(&self, tolerance: f64) -> bool {
        self.magnitude() > tolerance
    }

    /// Array or species with the largest error.
    pub fn worst(&self) -> Option<String> {
        let fields = self
            .fields
            .iter()
            .map(|(c, e)| (c.name().to_string(), e.magnitude()));
        let species = self.species.iter().map(|(id, e)| {
            (format!("species {id}"), e.position.magnitude().max(e.momentum.magnitude()))
        });
        fields
            .chain(species)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(name, _)| name)
    }
}

/// Compares live state (as a captured control point) with a reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointValidator {
    /// Box lengths of a periodic domain. Position differences then use the
    /// minimum image, so a particle wrapped on one side only is not a
    /// drift of a whole box length.
    period: Option<[f64; 3]>,
}

impl CheckpointValidator {
    pub fn periodic(extents: [f64; 3]) -> Self {
        Self { period: Some(extents) }
    }

    pub fn validate(&self, reference: &ControlPoint, live: &ControlPoint) -> Result<ValidationReport> {
        if reference.dims() != live.dims() {
            return Err(PicError::ShapeMismatch(format!(
                "control point covers {:?} cells, live state {:?}",
                reference.dims(),
                live.dims()
            )));
        }

        let fields = FieldComponent::ALL
            .into_iter()
            .map(|c| (c, compare_arrays(reference.array(c), live.array(c))))
            .collect();

        let empty = SpeciesSnapshot::default();
        let mut species = BTreeMap::new();
        for (id, reference_snap) in reference.species_iter() {
            let live_snap = live.species(id).unwrap_or(&empty);
            species.insert(id, compare_species(reference_snap, live_snap, self.period));
        }
        for (id, live_snap) in live.species_iter() {
            species
                .entry(id)
                .or_insert_with(|| compare_species(&empty, live_snap, self.period));
        }

        Ok(ValidationReport {
            step: live.step(),
            fields,
            species,
        })
    }
}

fn compare_arrays(reference: &[f64], live: &[f64]) -> ArrayError {
    let mut max_abs: f64 = 0.0;
    let mut diff_sq = 0.0;
    let mut ref_sq = 0.0;
    for (&b, &a) in reference.iter().zip(live) {
        let d = a - b;
        max_abs = max_abs.max(d.abs());
        diff_sq += d * d;
        ref_sq += b * b;
    }
    ArrayError::from_sums(max_abs, diff_sq, ref_sq)
}

#[derive(Default)]
struct Sums {
    max_abs: f64,
    diff_sq: f64,
    ref_sq: f64,
}

impl Sums {
    fn add(&mut self, reference: &[f64; 3], live: &[f64; 3], period: Option<&[f64; 3]>) {
        for a in 0..3 {
            let mut d = live[a] - reference[a];
            if let Some(l) = period {
                d -= l[a] * (d / l[a]).round();
            }
            self.max_abs = self.max_abs.max(d.abs());
            self.diff_sq += d * d;
            self.ref_sq += reference[a] * reference[a];
        }
    }

    fn finish(self) -> ArrayError {
        ArrayError::from_sums(self.max_abs, self.diff_sq, self.ref_sq)
    }
}

fn compare_species(reference: &SpeciesSnapshot, live: &SpeciesSnapshot, period: Option<[f64; 3]>) -> SpeciesError {
    let live_by_id: HashMap<u64, usize> = live.ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    let zero = [0.0; 3];
    let mut pos = Sums::default();
    let mut mom = Sums::default();
    let mut missing = 0;
    let mut matched = 0;

    for (i, id) in reference.ids.iter().enumerate() {
        match live_by_id.get(id) {
            Some(&j) => {
                matched += 1;
                pos.add(&reference.positions[i], &live.positions[j], period.as_ref());
                mom.add(&reference.momenta[i], &live.momenta[j], None);
            }
            None => {
                missing += 1;
                pos.add(&reference.positions[i], &zero, None);
                mom.add(&reference.momenta[i], &zero, None);
            }
        }
    }

    let reference_ids: HashSet<u64> = reference.ids.iter().copied().collect();
    for (j, id) in live.ids.iter().enumerate() {
        if !reference_ids.contains(id) {
            pos.add(&zero, &live.positions[j], None);
            mom.add(&zero, &live.momenta[j], None);
        }
    }
    let unexpected = live.len() - matched;

    SpeciesError {
        position: pos.finish(),
        momentum: mom.finish(),
        missing,
        unexpected,
    }
}
