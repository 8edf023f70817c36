//! Immutable field and particle snapshots and their binary layout.
//!
//! Layout, little endian:
//!
//! ```text
//! b"PICCTRL1"
//! u64 step, u64 nx, u64 ny, u64 nz, u64 species count
//! 10 x f64[nx*ny*nz]          Ex Ey Ez Hx Hy Hz Jx Jy Jz Rho, X fastest
//! per species, ascending id:
//!   u64 id, u64 count
//!   f64[count] x, y, z, px, py, pz
//!   u64[count] particle ids
//! ```

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use phyz_math::to_array;
use tracing::debug;

use crate::cell::CellGrid;
use crate::domain::SpeciesId;
use crate::error::{PicError, Result};
use crate::field::{FieldArrays, FieldComponent};

const MAGIC: &[u8; 8] = b"PICCTRL1";

/// Particles of one species in a control point, sorted by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpeciesSnapshot {
    pub ids: Vec<u64>,
    pub positions: Vec<[f64; 3]>,
    pub momenta: Vec<[f64; 3]>,
}

impl SpeciesSnapshot {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn sort_by_id(&mut self) {
        let mut order: Vec<usize> = (0..self.ids.len()).collect();
        order.sort_unstable_by_key(|&i| self.ids[i]);
        self.ids = order.iter().map(|&i| self.ids[i]).collect();
        self.positions = order.iter().map(|&i| self.positions[i]).collect();
        self.momenta = order.iter().map(|&i| self.momenta[i]).collect();
    }
}

/// Snapshot of one partition's state at a given step.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlPoint {
    step: u64,
    n: [usize; 3],
    arrays: Vec<Vec<f64>>,
    species: BTreeMap<SpeciesId, SpeciesSnapshot>,
}

impl ControlPoint {
    /// Snapshot live fields and particles. Every id in `species` gets an
    /// entry, even when it has no particles.
    pub fn capture(step: u64, fields: &FieldArrays, grid: &CellGrid, species: &[SpeciesId]) -> Self {
        let arrays = fields.iter().map(|(_, a)| a.interior_values()).collect();
        let mut snapshots: BTreeMap<SpeciesId, SpeciesSnapshot> =
            species.iter().map(|&s| (s, SpeciesSnapshot::default())).collect();
        for p in grid.particles() {
            let snap = snapshots.entry(p.species).or_default();
            snap.ids.push(p.id);
            snap.positions.push(to_array(&p.position));
            snap.momenta.push(to_array(&p.momentum));
        }
        for snap in snapshots.values_mut() {
            snap.sort_by_id();
        }
        Self {
            step,
            n: fields.dims(),
            arrays,
            species: snapshots,
        }
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn dims(&self) -> [usize; 3] {
        self.n
    }

    /// Interior values of one array, X fastest.
    pub fn array(&self, component: FieldComponent) -> &[f64] {
        &self.arrays[component.index()]
    }

    pub fn species(&self, id: SpeciesId) -> Option<&SpeciesSnapshot> {
        self.species.get(&id)
    }

    pub fn species_iter(&self) -> impl Iterator<Item = (SpeciesId, &SpeciesSnapshot)> {
        self.species.iter().map(|(&id, s)| (id, s))
    }

    pub fn particle_count(&self) -> usize {
        self.species.values().map(SpeciesSnapshot::len).sum()
    }

    /// The part of a whole-domain control point owned by the slab
    /// `[x_offset, x_offset + nx)`, for comparison against a decomposed run.
    ///
    /// Particles are selected by the global X cell of their position
    /// (`floor(x / hx)`).
    pub fn x_slab(&self, x_offset: usize, nx: usize, hx: f64) -> Result<Self> {
        let [nx_all, ny, nz] = self.n;
        if x_offset + nx > nx_all {
            return Err(PicError::ShapeMismatch(format!(
                "slab {x_offset}..{} exceeds {nx_all} x cells",
                x_offset + nx
            )));
        }
        let arrays = self
            .arrays
            .iter()
            .map(|values| {
                let mut out = Vec::with_capacity(nx * ny * nz);
                for k in 0..nz {
                    for j in 0..ny {
                        let row = nx_all * (j + ny * k);
                        out.extend_from_slice(&values[row + x_offset..row + x_offset + nx]);
                    }
                }
                out
            })
            .collect();

        let owns = |x: f64| {
            let c = (x / hx).floor();
            c >= x_offset as f64 && c < (x_offset + nx) as f64
        };
        let species = self
            .species
            .iter()
            .map(|(&id, snap)| {
                let mut part = SpeciesSnapshot::default();
                for i in 0..snap.len() {
                    if owns(snap.positions[i][0]) {
                        part.ids.push(snap.ids[i]);
                        part.positions.push(snap.positions[i]);
                        part.momenta.push(snap.momenta[i]);
                    }
                }
                (id, part)
            })
            .collect();

        Ok(Self {
            step: self.step,
            n: [nx, ny, nz],
            arrays,
            species,
        })
    }

    /// Write to `path`, creating or truncating it.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        debug!(path = %path.display(), step = self.step, "control point written");
        Ok(())
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(MAGIC)?;
        write_u64(w, self.step)?;
        for &d in &self.n {
            write_u64(w, d as u64)?;
        }
        write_u64(w, self.species.len() as u64)?;
        for values in &self.arrays {
            write_f64s(w, values.iter().copied())?;
        }
        for (&id, snap) in &self.species {
            write_u64(w, u64::from(id))?;
            write_u64(w, snap.len() as u64)?;
            for axis in 0..3 {
                write_f64s(w, snap.positions.iter().map(|p| p[axis]))?;
            }
            for axis in 0..3 {
                write_f64s(w, snap.momenta.iter().map(|p| p[axis]))?;
            }
            for &pid in &snap.ids {
                write_u64(w, pid)?;
            }
        }
        Ok(())
    }

    /// Read a control point from `path`.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = BufReader::new(File::open(path)?);
        let cp = Self::read_from(&mut reader)?;
        debug!(path = %path.display(), step = cp.step, "control point read");
        Ok(cp)
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut magic = [0u8; 8];
        read_exact(r, &mut magic, "magic")?;
        if &magic != MAGIC {
            return Err(PicError::MalformedControlPoint("bad magic".into()));
        }
        let step = read_u64(r, "step")?;
        let mut n = [0usize; 3];
        for d in &mut n {
            *d = to_usize(read_u64(r, "dimensions")?)?;
        }
        let cells = n[0]
            .checked_mul(n[1])
            .and_then(|v| v.checked_mul(n[2]))
            .ok_or_else(|| PicError::MalformedControlPoint("dimensions overflow".into()))?;
        let n_species = read_u64(r, "species count")?;

        let mut arrays = Vec::with_capacity(FieldComponent::ALL.len());
        for component in FieldComponent::ALL {
            arrays.push(read_f64s(r, cells, component.name())?);
        }

        let mut species = BTreeMap::new();
        let mut last: Option<SpeciesId> = None;
        for _ in 0..n_species {
            let id = SpeciesId::try_from(read_u64(r, "species id")?)
                .map_err(|_| PicError::MalformedControlPoint("species id out of range".into()))?;
            if last.is_some_and(|prev| prev >= id) {
                return Err(PicError::MalformedControlPoint(format!(
                    "species {id} out of order"
                )));
            }
            last = Some(id);
            let count = to_usize(read_u64(r, "particle count")?)?;
            let coords: Vec<Vec<f64>> = (0..6)
                .map(|_| read_f64s(r, count, "particle data"))
                .collect::<Result<_>>()?;
            let mut ids = Vec::new();
            for _ in 0..count {
                ids.push(read_u64(r, "particle ids")?);
            }
            if ids.windows(2).any(|w| w[0] >= w[1]) {
                return Err(PicError::MalformedControlPoint(format!(
                    "species {id} particle ids are not strictly ascending"
                )));
            }
            let positions = (0..count).map(|i| [coords[0][i], coords[1][i], coords[2][i]]).collect();
            let momenta = (0..count).map(|i| [coords[3][i], coords[4][i], coords[5][i]]).collect();
            species.insert(id, SpeciesSnapshot { ids, positions, momenta });
        }

        let mut trailing = [0u8; 1];
        if r.read(&mut trailing)? != 0 {
            return Err(PicError::MalformedControlPoint("trailing data".into()));
        }

        Ok(Self {
            step,
            n,
            arrays,
            species,
        })
    }
}

fn to_usize(v: u64) -> Result<usize> {
    usize::try_from(v).map_err(|_| PicError::MalformedControlPoint(format!("size {v} out of range")))
}

fn read_exact<R: Read>(r: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => PicError::MalformedControlPoint(format!("truncated in {what}")),
        _ => PicError::ControlPointIo(e),
    })
}

fn read_u64<R: Read>(r: &mut R, what: &str) -> Result<u64> {
    let mut b = [0u8; 8];
    read_exact(r, &mut b, what)?;
    Ok(u64::from_le_bytes(b))
}

fn read_f64s<R: Read>(r: &mut R, count: usize, what: &str) -> Result<Vec<f64>> {
    // Grown incrementally so a corrupt count fails on EOF instead of allocating
    let mut out = Vec::new();
    let mut b = [0u8; 8];
    for _ in 0..count {
        read_exact(r, &mut b, what)?;
        out.push(f64::from_le_bytes(b));
    }
    Ok(out)
}

fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_f64s<W: Write>(w: &mut W, values: impl Iterator<Item = f64>) -> io::Result<()> {
    for v in values {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}
