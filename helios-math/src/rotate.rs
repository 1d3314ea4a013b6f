// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Helios-Proprietary
// See LICENSE in the repository root for full license terms.

//! Precomputed rotation lookup tables
//!
//! Tomographic rotation of the object volume is a nearest-neighbor gather:
//! for each voxel of the rotated volume, a flat index into the unrotated
//! volume. Tables are precomputed per projection angle (rotation acts in
//! the x–z plane, axes 1 and 2 of a `[y, x, z]` volume; the y axis is the
//! rotation axis) and persisted so that every iteration and every process
//! reads the same remap. Rotating without a table is not supported
//! anywhere downstream — the forward models refuse rather than
//! approximate.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use nalgebra::{Matrix2, Vector2};

const MAGIC: &[u8; 4] = b"HROT";
const VERSION: u32 = 1;

/// Errors from building, saving or loading rotation tables.
#[derive(Debug, thiserror::Error)]
pub enum RotationTableError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a rotation-table file (bad magic)")]
    BadMagic,
    #[error("unsupported rotation-table version {0}")]
    BadVersion(u32),
    #[error("angle index {index} out of range ({count} angles)")]
    AngleOutOfRange { index: usize, count: usize },
}

/// Nearest-neighbor rotation remap tables for one volume shape and a fixed
/// set of equally spaced projection angles.
#[derive(Debug, Clone)]
pub struct RotationTables {
    shape: [usize; 3],
    tables: Vec<Vec<u32>>,
}

impl RotationTables {
    /// Build tables for `n_angles` angles equally spaced over `[0, 2π]`
    /// (endpoints inclusive) for a `[s0, s1, s2]` volume.
    ///
    /// Out-of-frame source coordinates are clamped to the volume edge, so
    /// every entry is a valid flat index.
    pub fn build(shape: [usize; 3], n_angles: usize) -> Self {
        let [s0, s1, s2] = shape;
        let center1 = (s1 / 2) as f64;
        let center2 = (s2 / 2) as f64;
        let slab = s1 * s2;

        let mut tables = Vec::with_capacity(n_angles);
        for i_theta in 0..n_angles {
            let theta = if n_angles > 1 {
                2.0 * std::f64::consts::PI * i_theta as f64 / (n_angles - 1) as f64
            } else {
                0.0
            };
            let rot = Matrix2::new(theta.cos(), -theta.sin(), theta.sin(), theta.cos());

            // The in-plane remap is identical for every slab along axis 0.
            let mut slab_map = Vec::with_capacity(slab);
            for i1 in 0..s1 {
                for i2 in 0..s2 {
                    let centered = Vector2::new(i1 as f64 - center1, i2 as f64 - center2);
                    let old = rot * centered;
                    let o1 = (old[0] + center1).round().clamp(0.0, (s1 - 1) as f64) as usize;
                    let o2 = (old[1] + center2).round().clamp(0.0, (s2 - 1) as f64) as usize;
                    slab_map.push((o1 * s2 + o2) as u32);
                }
            }

            let mut table = Vec::with_capacity(s0 * slab);
            for i0 in 0..s0 {
                let base = (i0 * slab) as u32;
                table.extend(slab_map.iter().map(|&m| base + m));
            }
            tables.push(table);
        }

        Self { shape, tables }
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn n_angles(&self) -> usize {
        self.tables.len()
    }

    /// Flat-index remap for one angle: `rotated[i] = source[table[i]]`.
    pub fn table(&self, angle_index: usize) -> Result<&[u32], RotationTableError> {
        self.tables
            .get(angle_index)
            .map(|t| t.as_slice())
            .ok_or(RotationTableError::AngleOutOfRange {
                index: angle_index,
                count: self.tables.len(),
            })
    }

    /// Persist all tables to one little-endian binary file.
    pub fn save(&self, path: &Path) -> Result<(), RotationTableError> {
        let mut w = BufWriter::new(File::create(path)?);
        w.write_all(MAGIC)?;
        w.write_u32::<LittleEndian>(VERSION)?;
        for s in self.shape {
            w.write_u64::<LittleEndian>(s as u64)?;
        }
        w.write_u64::<LittleEndian>(self.tables.len() as u64)?;
        for table in &self.tables {
            for &v in table {
                w.write_u32::<LittleEndian>(v)?;
            }
        }
        w.flush()?;
        Ok(())
    }

    /// Load tables previously written by [`RotationTables::save`].
    pub fn load(path: &Path) -> Result<Self, RotationTableError> {
        let mut r = BufReader::new(File::open(path)?);
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(RotationTableError::BadMagic);
        }
        let version = r.read_u32::<LittleEndian>()?;
        if version != VERSION {
            return Err(RotationTableError::BadVersion(version));
        }
        let mut shape = [0usize; 3];
        for s in shape.iter_mut() {
            *s = r.read_u64::<LittleEndian>()? as usize;
        }
        let n_angles = r.read_u64::<LittleEndian>()? as usize;
        let n_voxels = shape[0] * shape[1] * shape[2];

        let mut tables = Vec::with_capacity(n_angles);
        for _ in 0..n_angles {
            let mut table = Vec::with_capacity(n_voxels);
            for _ in 0..n_voxels {
                table.push(r.read_u32::<LittleEndian>()?);
            }
            tables.push(table);
        }
        Ok(Self { shape, tables })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_angle_zero_is_identity() {
        let tables = RotationTables::build([2, 5, 5], 4);
        let t = tables.table(0).unwrap();
        for (i, &v) in t.iter().enumerate() {
            assert_eq!(v as usize, i, "angle 0 must remap voxel {} to itself", i);
        }
    }

    #[test]
    fn test_all_indices_in_range() {
        let shape = [3, 7, 6];
        let n_voxels = shape[0] * shape[1] * shape[2];
        let tables = RotationTables::build(shape, 9);
        for a in 0..tables.n_angles() {
            for &v in tables.table(a).unwrap() {
                assert!((v as usize) < n_voxels);
            }
        }
    }

    #[test]
    fn test_full_turn_matches_identity() {
        // Last angle of an inclusive [0, 2π] sweep is a full turn.
        let tables = RotationTables::build([1, 6, 6], 5);
        let first = tables.table(0).unwrap();
        let last = tables.table(4).unwrap();
        assert_eq!(first, last);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tables.rot");

        let tables = RotationTables::build([2, 4, 4], 3);
        tables.save(&path).unwrap();
        let loaded = RotationTables::load(&path).unwrap();

        assert_eq!(loaded.shape(), tables.shape());
        assert_eq!(loaded.n_angles(), tables.n_angles());
        for a in 0..tables.n_angles() {
            assert_eq!(loaded.table(a).unwrap(), tables.table(a).unwrap());
        }
    }

    #[test]
    fn test_angle_out_of_range() {
        let tables = RotationTables::build([1, 2, 2], 2);
        assert!(tables.table(2).is_err());
    }
}
