// Copyright (c) 2025-2026 brdigetrlol. All rights reserved.
// SPDX-License-Identifier: LicenseRef-Helios-Proprietary
// See LICENSE in the repository root for full license terms.

//! Persistent chunked array store
//!
//! One dataset per file: a little-endian header (magic, ndim, dims)
//! followed by f32 data, addressed one leading-axis slice at a time. The
//! slice is the unit of both streaming and cross-process partitioning:
//! cooperating processes open the same file and each reads/writes only
//! the slices it owns, so no locking is needed for disjoint regions.
//!
//! Creation is cooperative: every process calls
//! [`ChunkedDataset::open_or_create`]; the first successful creator wins
//! and the rest attach through exactly one fallback open — a lost race is
//! expected, not an error. Only a failed fallback surfaces, as
//! [`StoreError::Unavailable`].

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, warn};

const MAGIC: &[u8; 4] = b"HCD1";

/// Errors from the chunked store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a chunked dataset (bad magic)")]
    BadMagic,
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("dataset at {path} unavailable after create/open fallback: {source}")]
    Unavailable {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A persistent f32 array addressed by leading-axis slice.
#[derive(Debug)]
pub struct ChunkedDataset {
    file: File,
    path: PathBuf,
    shape: Vec<usize>,
    slice_len: usize,
    data_offset: u64,
}

impl ChunkedDataset {
    /// Create a zero-filled dataset. Fails if the file already exists.
    pub fn create(path: &Path, shape: &[usize]) -> Result<Self, StoreError> {
        assert!(!shape.is_empty(), "dataset needs at least one axis");
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        file.write_all(MAGIC)?;
        file.write_u32::<LittleEndian>(shape.len() as u32)?;
        for &d in shape {
            file.write_u64::<LittleEndian>(d as u64)?;
        }
        let slice_len: usize = shape[1..].iter().product::<usize>().max(1);
        let zeros = vec![0u8; slice_len * 4];
        for _ in 0..shape[0] {
            file.write_all(&zeros)?;
        }
        file.flush()?;

        let data_offset = (8 + 8 * shape.len()) as u64;
        debug!(path = %path.display(), ?shape, "created chunked dataset");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            shape: shape.to_vec(),
            slice_len,
            data_offset,
        })
    }

    /// Open an existing dataset and validate its header.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(StoreError::BadMagic);
        }
        let ndim = file.read_u32::<LittleEndian>()? as usize;
        let mut shape = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            shape.push(file.read_u64::<LittleEndian>()? as usize);
        }
        let slice_len: usize = shape[1..].iter().product::<usize>().max(1);
        let data_offset = (8 + 8 * ndim) as u64;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            shape,
            slice_len,
            data_offset,
        })
    }

    /// Cooperative create-or-attach: try to create; if another process won
    /// the race, fall back to a single plain open. Returns the dataset and
    /// whether this process was the creator.
    pub fn open_or_create(path: &Path, shape: &[usize]) -> Result<(Self, bool), StoreError> {
        match Self::create(path, shape) {
            Ok(ds) => Ok((ds, true)),
            Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!(path = %path.display(), "lost dataset creation race, attaching");
                let ds = Self::open(path).map_err(|err| match err {
                    StoreError::Io(source) => StoreError::Unavailable {
                        path: path.to_path_buf(),
                        source,
                    },
                    other => other,
                })?;
                if ds.shape != shape {
                    return Err(StoreError::ShapeMismatch(format!(
                        "existing dataset shape {:?} does not match requested {:?}",
                        ds.shape, shape
                    )));
                }
                Ok((ds, false))
            }
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn n_slices(&self) -> usize {
        self.shape[0]
    }

    /// Elements per leading-axis slice.
    pub fn slice_len(&self) -> usize {
        self.slice_len
    }

    fn slice_offset(&self, index: usize) -> u64 {
        assert!(
            index < self.shape[0],
            "slice {} out of range ({} slices)",
            index,
            self.shape[0]
        );
        self.data_offset + (index * self.slice_len * 4) as u64
    }

    /// Read one leading-axis slice.
    pub fn read_slice(&mut self, index: usize) -> Result<Vec<f32>, StoreError> {
        self.file.seek(SeekFrom::Start(self.slice_offset(index)))?;
        let mut buf = vec![0u8; self.slice_len * 4];
        self.file.read_exact(&mut buf)?;
        let mut out = Vec::with_capacity(self.slice_len);
        for chunk in buf.chunks_exact(4) {
            out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        Ok(out)
    }

    /// Overwrite one leading-axis slice.
    pub fn write_slice(&mut self, index: usize, data: &[f32]) -> Result<(), StoreError> {
        if data.len() != self.slice_len {
            return Err(StoreError::ShapeMismatch(format!(
                "slice length {} does not match dataset slice length {}",
                data.len(),
                self.slice_len
            )));
        }
        self.file.seek(SeekFrom::Start(self.slice_offset(index)))?;
        let mut buf = Vec::with_capacity(data.len() * 4);
        for &v in data {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        self.file.write_all(&buf)?;
        self.file.flush()?;
        Ok(())
    }

    /// Add a delta into one slice (read-modify-write). With disjoint
    /// slice ownership this needs no locking.
    pub fn accumulate_slice(&mut self, index: usize, delta: &[f32]) -> Result<(), StoreError> {
        let mut current = self.read_slice(index)?;
        if delta.len() != current.len() {
            return Err(StoreError::ShapeMismatch(format!(
                "delta length {} does not match slice length {}",
                delta.len(),
                current.len()
            )));
        }
        for (c, d) in current.iter_mut().zip(delta) {
            *c += d;
        }
        self.write_slice(index, &current)
    }
}

/// The driver-side reduction step before writing a shared update: the
/// accumulated delta of one process, divided by the process count so the
/// sum across processes averages instead of multiplying.
pub fn averaged_delta(current: &[f32], baseline: &[f32], process_count: usize) -> Vec<f32> {
    assert_eq!(current.len(), baseline.len(), "delta operands must match");
    assert!(process_count > 0, "process count must be positive");
    let inv = 1.0 / process_count as f32;
    current
        .iter()
        .zip(baseline)
        .map(|(&c, &b)| (c - b) * inv)
        .collect()
}
