// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Helios-Proprietary
// See LICENSE in the repository root for full license terms.

//! Optimizer checkpointing
//!
//! All named in-memory parameter arrays are stacked into one file in
//! declaration order and split back out by that same order on restore.
//! The file carries shapes but no names — order sensitivity is part of
//! the contract, so save and restore must enumerate parameters
//! identically or the restore is silently wrong. Keep the declaration
//! order stable.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::store::StoreError;

const MAGIC: &[u8; 4] = b"HCKP";

/// One restored parameter array.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointArray {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Persist parameter arrays in the given order.
pub fn save(path: &Path, arrays: &[(&[usize], &[f32])]) -> Result<(), StoreError> {
    for (shape, data) in arrays {
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "checkpoint array data does not match its shape"
        );
    }
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(MAGIC)?;
    w.write_u32::<LittleEndian>(arrays.len() as u32)?;
    for (shape, data) in arrays {
        w.write_u32::<LittleEndian>(shape.len() as u32)?;
        for &d in *shape {
            w.write_u64::<LittleEndian>(d as u64)?;
        }
        for &v in *data {
            w.write_f32::<LittleEndian>(v)?;
        }
    }
    w.flush()?;
    Ok(())
}

/// Reload arrays in the order they were saved.
pub fn load(path: &Path) -> Result<Vec<CheckpointArray>, StoreError> {
    let mut r = BufReader::new(File::open(path)?);
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(StoreError::BadMagic);
    }
    let count = r.read_u32::<LittleEndian>()? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let ndim = r.read_u32::<LittleEndian>()? as usize;
        let mut shape = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            shape.push(r.read_u64::<LittleEndian>()? as usize);
        }
        let n: usize = shape.iter().product();
        let mut data = Vec::with_capacity(n);
        for _ in 0..n {
            data.push(r.read_f32::<LittleEndian>()?);
        }
        out.push(CheckpointArray { shape, data });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_two_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opt.ckpt");

        // Two parameters of different shapes — a probe-like 3-D array and
        // a scalar-ish vector.
        let probe: Vec<f32> = (0..24).map(|i| i as f32 * 0.5 - 3.0).collect();
        let offsets = vec![0.25f32, -0.75];

        save(&path, &[(&[2, 3, 4], &probe), (&[2], &offsets)]).unwrap();
        let restored = load(&path).unwrap();

        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].shape, vec![2, 3, 4]);
        assert_eq!(restored[0].data, probe, "values must round-trip exactly");
        assert_eq!(restored[1].shape, vec![2]);
        assert_eq!(restored[1].data, offsets);
    }

    #[test]
    fn test_order_is_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opt.ckpt");

        let a = vec![1.0f32];
        let b = vec![2.0f32];
        save(&path, &[(&[1], &a), (&[1], &b)]).unwrap();
        let restored = load(&path).unwrap();
        // No names in the file: position 0 is whatever was saved first.
        assert_eq!(restored[0].data, a);
        assert_eq!(restored[1].data, b);
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk");
        std::fs::write(&path, b"????????").unwrap();
        assert!(matches!(load(&path).unwrap_err(), StoreError::BadMagic));
    }
}
