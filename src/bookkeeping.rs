//! Per-fragment bookkeeping
//!
//! Records everything a reader needs to address any tile without scanning:
//! the fragment's non-empty domain, sparse tile MBRs and bounding
//! coordinates, cumulative tile offsets per attribute, variable-tile offsets
//! and raw sizes, and the cell count of the last (possibly short) tile.
//! The sidecar serializes little-endian and is gzip-wrapped as a whole.

use std::path::Path;

use crate::codec::{gzip_frame, gzip_unframe};
use crate::error::{Result, StoreError};
use crate::fs::{StorageBackend, FILE_MODE};
use crate::schema::{ArraySchema, Reader};

/// Bookkeeping file inside a fragment directory
pub const BOOKKEEPING_FILE: &str = "__book_keeping.tdb.gz";

#[derive(Debug)]
pub struct Bookkeeping {
    dense: bool,
    coords_size: usize,
    /// Cells of a full tile: extent product (dense) or capacity (sparse)
    cells_per_tile: u64,
    /// `[lo, hi]` per dimension actually covered by this fragment
    non_empty_domain: Vec<u8>,
    mbrs: Vec<Vec<u8>>,
    bounding_coords: Vec<Vec<u8>>,
    /// One list per attribute, coordinates last; cumulative from zero
    tile_offsets: Vec<Vec<i64>>,
    next_tile_offsets: Vec<i64>,
    /// One list per variable attribute (attribute order)
    tile_var_offsets: Vec<Vec<i64>>,
    next_tile_var_offsets: Vec<i64>,
    tile_var_sizes: Vec<Vec<u64>>,
    last_tile_cell_num: i64,
}

impl Bookkeeping {
    /// Fresh bookkeeping for a fragment being written.
    ///
    /// `non_empty_domain` is the subarray the fragment covers; `None` means
    /// the whole array domain.
    pub fn new(schema: &ArraySchema, non_empty_domain: Option<&[u8]>) -> Self {
        let attribute_num = schema.attribute_num();
        let domain = non_empty_domain.unwrap_or(schema.domain_bytes()).to_vec();
        Self {
            dense: schema.dense(),
            coords_size: schema.coords_size(),
            cells_per_tile: schema.cells_per_tile(),
            non_empty_domain: domain,
            mbrs: Vec::new(),
            bounding_coords: Vec::new(),
            tile_offsets: vec![Vec::new(); attribute_num + 1],
            next_tile_offsets: vec![0; attribute_num + 1],
            tile_var_offsets: vec![Vec::new(); attribute_num],
            next_tile_var_offsets: vec![0; attribute_num],
            tile_var_sizes: vec![Vec::new(); attribute_num],
            last_tile_cell_num: 0,
        }
    }

    pub fn dense(&self) -> bool {
        self.dense
    }

    pub fn non_empty_domain(&self) -> &[u8] {
        &self.non_empty_domain
    }

    pub fn mbr(&self, tile_pos: usize) -> &[u8] {
        &self.mbrs[tile_pos]
    }

    pub fn mbrs(&self) -> &[Vec<u8>] {
        &self.mbrs
    }

    pub fn bounding_coords(&self, tile_pos: usize) -> &[u8] {
        &self.bounding_coords[tile_pos]
    }

    /// Physical tiles recorded for an attribute
    pub fn tile_count(&self, attribute_id: usize) -> usize {
        self.tile_offsets[attribute_id].len()
    }

    /// Sparse tile count (dense fragments count via their attribute files)
    pub fn sparse_tile_num(&self) -> usize {
        self.mbrs.len()
    }

    pub fn last_tile_cell_num(&self) -> i64 {
        self.last_tile_cell_num
    }

    /// Cells held by the tile at `tile_pos` of an attribute
    pub fn cell_num(&self, attribute_id: usize, tile_pos: usize) -> u64 {
        let tile_num = self.tile_count(attribute_id);
        if tile_pos + 1 == tile_num {
            self.last_tile_cell_num as u64
        } else {
            self.cells_per_tile
        }
    }

    /// Byte range `[start, end)` of a tile inside its attribute file
    pub fn tile_byte_range(
        &self,
        attribute_id: usize,
        tile_pos: usize,
        file_size: u64,
    ) -> (u64, u64) {
        let offsets = &self.tile_offsets[attribute_id];
        let start = offsets[tile_pos] as u64;
        let end = offsets
            .get(tile_pos + 1)
            .map(|o| *o as u64)
            .unwrap_or(file_size);
        (start, end)
    }

    /// Same for the variable-value file of a variable attribute
    pub fn tile_var_byte_range(
        &self,
        attribute_id: usize,
        tile_pos: usize,
        file_size: u64,
    ) -> (u64, u64) {
        let offsets = &self.tile_var_offsets[attribute_id];
        let start = offsets[tile_pos] as u64;
        let end = offsets
            .get(tile_pos + 1)
            .map(|o| *o as u64)
            .unwrap_or(file_size);
        (start, end)
    }

    /// Raw (decompressed) size of a variable tile
    pub fn tile_var_size(&self, attribute_id: usize, tile_pos: usize) -> u64 {
        self.tile_var_sizes[attribute_id][tile_pos]
    }

    /// Absolute starting offset of a variable tile's values in its file,
    /// in raw (decompressed) byte terms
    pub fn tile_var_raw_start(&self, attribute_id: usize, tile_pos: usize) -> u64 {
        self.tile_var_sizes[attribute_id][..tile_pos].iter().sum()
    }

    pub fn append_mbr(&mut self, mbr: &[u8]) {
        debug_assert_eq!(mbr.len(), 2 * self.coords_size);
        self.mbrs.push(mbr.to_vec());
    }

    pub fn append_bounding_coords(&mut self, bounding: &[u8]) {
        debug_assert_eq!(bounding.len(), 2 * self.coords_size);
        self.bounding_coords.push(bounding.to_vec());
    }

    /// Record the next tile of an attribute; `step` is the bytes the tile
    /// occupies on disk. Stored offsets are cumulative from zero.
    pub fn append_tile_offset(&mut self, attribute_id: usize, step: u64) {
        let next = self.next_tile_offsets[attribute_id];
        self.tile_offsets[attribute_id].push(next);
        self.next_tile_offsets[attribute_id] = next + step as i64;
    }

    pub fn append_tile_var_offset(&mut self, attribute_id: usize, step: u64) {
        let next = self.next_tile_var_offsets[attribute_id];
        self.tile_var_offsets[attribute_id].push(next);
        self.next_tile_var_offsets[attribute_id] = next + step as i64;
    }

    pub fn append_tile_var_size(&mut self, attribute_id: usize, size: u64) {
        self.tile_var_sizes[attribute_id].push(size);
    }

    pub fn set_last_tile_cell_num(&mut self, cell_num: i64) {
        self.last_tile_cell_num = cell_num;
    }

    /* ----------------------------- save/load ----------------------------- */

    /// Flush to `<fragment>/__book_keeping.tdb.gz`
    pub fn save(
        &self,
        fs: &dyn StorageBackend,
        fragment_dir: &Path,
        schema: &ArraySchema,
    ) -> Result<()> {
        let mut out = Vec::new();

        out.extend_from_slice(&(self.non_empty_domain.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.non_empty_domain);

        out.extend_from_slice(&(self.mbrs.len() as i64).to_le_bytes());
        for mbr in &self.mbrs {
            out.extend_from_slice(mbr);
        }
        out.extend_from_slice(&(self.bounding_coords.len() as i64).to_le_bytes());
        for bc in &self.bounding_coords {
            out.extend_from_slice(bc);
        }

        for offsets in &self.tile_offsets {
            out.extend_from_slice(&(offsets.len() as i64).to_le_bytes());
            for off in offsets {
                out.extend_from_slice(&off.to_le_bytes());
            }
        }
        for (i, offsets) in self.tile_var_offsets.iter().enumerate() {
            if !schema.var_size(i) {
                continue;
            }
            out.extend_from_slice(&(offsets.len() as i64).to_le_bytes());
            for off in offsets {
                out.extend_from_slice(&off.to_le_bytes());
            }
        }
        for (i, sizes) in self.tile_var_sizes.iter().enumerate() {
            if !schema.var_size(i) {
                continue;
            }
            out.extend_from_slice(&(sizes.len() as i64).to_le_bytes());
            for size in sizes {
                out.extend_from_slice(&size.to_le_bytes());
            }
        }

        // A fragment closed on a tile boundary reports a full last tile.
        let last = if self.last_tile_cell_num == 0 {
            self.cells_per_tile as i64
        } else {
            self.last_tile_cell_num
        };
        out.extend_from_slice(&last.to_le_bytes());

        let framed = gzip_frame(&out)?;
        let path = fragment_dir.join(BOOKKEEPING_FILE);
        if fs.is_file(&path) {
            fs.delete_file(&path)?;
        }
        fs.write(&path, &framed)?;
        fs.close(&path)
    }

    /// Load and verify the sidecar of an existing fragment
    pub fn load(
        fs: &dyn StorageBackend,
        fragment_dir: &Path,
        schema: &ArraySchema,
        dense: bool,
    ) -> Result<Self> {
        let path = fragment_dir.join(BOOKKEEPING_FILE);
        let size = fs.file_size(&path)?;
        let mut framed = vec![0u8; size as usize];
        fs.read(&path, 0, &mut framed)?;
        let raw = gzip_unframe(&framed)?;
        let mut r = Reader::new(&raw);

        let attribute_num = schema.attribute_num();
        let coords_size = schema.coords_size();

        let domain_size = r.u64()? as usize;
        let non_empty_domain = r.bytes(domain_size)?.to_vec();

        let mbr_num = r.i64()? as usize;
        let mut mbrs = Vec::with_capacity(mbr_num);
        for _ in 0..mbr_num {
            mbrs.push(r.bytes(2 * coords_size)?.to_vec());
        }
        let bc_num = r.i64()? as usize;
        let mut bounding_coords = Vec::with_capacity(bc_num);
        for _ in 0..bc_num {
            bounding_coords.push(r.bytes(2 * coords_size)?.to_vec());
        }

        let mut tile_offsets = Vec::with_capacity(attribute_num + 1);
        for _ in 0..attribute_num + 1 {
            let n = r.i64()? as usize;
            let mut offsets = Vec::with_capacity(n);
            for _ in 0..n {
                offsets.push(r.i64()?);
            }
            tile_offsets.push(offsets);
        }
        let mut tile_var_offsets = vec![Vec::new(); attribute_num];
        for (i, slot) in tile_var_offsets.iter_mut().enumerate() {
            if !schema.var_size(i) {
                continue;
            }
            let n = r.i64()? as usize;
            for _ in 0..n {
                slot.push(r.i64()?);
            }
        }
        let mut tile_var_sizes = vec![Vec::new(); attribute_num];
        for (i, slot) in tile_var_sizes.iter_mut().enumerate() {
            if !schema.var_size(i) {
                continue;
            }
            let n = r.i64()? as usize;
            for _ in 0..n {
                slot.push(r.u64()?);
            }
        }
        let last_tile_cell_num = r.i64()?;
        r.done()?;

        let book = Self {
            dense,
            coords_size,
            cells_per_tile: schema.cells_per_tile(),
            non_empty_domain,
            mbrs,
            bounding_coords,
            next_tile_offsets: tile_offsets.iter().map(|o| o.last().copied().unwrap_or(0)).collect(),
            tile_offsets,
            next_tile_var_offsets: tile_var_offsets
                .iter()
                .map(|o| o.last().copied().unwrap_or(0))
                .collect(),
            tile_var_offsets,
            tile_var_sizes,
            last_tile_cell_num,
        };
        book.verify(schema)?;
        Ok(book)
    }

    fn verify(&self, schema: &ArraySchema) -> Result<()> {
        if self.mbrs.len() != self.bounding_coords.len() {
            return Err(StoreError::Decode(format!(
                "bookkeeping holds {} MBRs but {} bounding coordinates",
                self.mbrs.len(),
                self.bounding_coords.len()
            )));
        }
        let tile_num = self
            .tile_offsets
            .iter()
            .map(|o| o.len())
            .max()
            .unwrap_or(0);
        for (i, offsets) in self.tile_offsets.iter().enumerate() {
            // Attributes a write never touched may legally hold zero tiles.
            if !offsets.is_empty() && offsets.len() != tile_num {
                return Err(StoreError::Decode(format!(
                    "bookkeeping tile offset counts differ: {} vs {} (attribute {})",
                    offsets.len(),
                    tile_num,
                    i
                )));
            }
        }
        if !self.dense && self.mbrs.len() != tile_num {
            return Err(StoreError::Decode(format!(
                "bookkeeping holds {} MBRs for {} tiles",
                self.mbrs.len(),
                tile_num
            )));
        }
        for i in 0..schema.attribute_num() {
            if !schema.var_size(i) {
                continue;
            }
            if self.tile_var_offsets[i].len() != self.tile_offsets[i].len()
                || self.tile_var_sizes[i].len() != self.tile_offsets[i].len()
            {
                return Err(StoreError::Decode(format!(
                    "bookkeeping variable-tile counts differ for attribute {}",
                    i
                )));
            }
        }
        if tile_num > 0 {
            let last = self.last_tile_cell_num;
            if last < 1 || last as u64 > self.cells_per_tile {
                return Err(StoreError::Decode(format!(
                    "bookkeeping last tile holds {} cells, expected 1..={}",
                    last, self.cells_per_tile
                )));
            }
        }
        Ok(())
    }

    /// Create the fragment's bookkeeping file path
    pub fn path(fragment_dir: &Path) -> std::path::PathBuf {
        fragment_dir.join(BOOKKEEPING_FILE)
    }
}

/// Touch helper used by write-state finalize for sentinel creation
pub(crate) fn create_marker(fs: &dyn StorageBackend, path: &Path) -> Result<()> {
    fs.create_file(path, FILE_MODE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadMethod;
    use crate::fs::PosixFs;
    use crate::schema::{coords_to_bytes, Attribute, ArraySchema, Datatype, Layout};
    use tempfile::TempDir;

    fn sparse_schema() -> ArraySchema {
        ArraySchema::new(
            false,
            vec!["x".to_string(), "y".to_string()],
            Datatype::Int32,
            coords_to_bytes(&[0i32, 99, 0, 99]),
            None,
            Layout::RowMajor,
            Layout::RowMajor,
            4,
            vec![
                Attribute::new("v", Datatype::Int32),
                Attribute::new("s", Datatype::Char).var_sized(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_cumulative_offsets() {
        let schema = sparse_schema();
        let mut book = Bookkeeping::new(&schema, None);
        book.append_tile_offset(0, 100);
        book.append_tile_offset(0, 50);
        book.append_tile_offset(0, 7);
        assert_eq!(book.tile_offsets[0], vec![0, 100, 150]);
        assert_eq!(book.tile_byte_range(0, 1, 157), (100, 150));
        assert_eq!(book.tile_byte_range(0, 2, 157), (150, 157));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let schema = sparse_schema();
        let dir = TempDir::new().unwrap();
        let fs = PosixFs::new(ReadMethod::ReadIo);

        let mut book = Bookkeeping::new(&schema, None);
        book.append_mbr(&coords_to_bytes(&[0i32, 5, 0, 5]));
        book.append_bounding_coords(&coords_to_bytes(&[0i32, 0, 5, 5]));
        for attr in 0..3 {
            book.append_tile_offset(attr, 16);
        }
        book.append_tile_var_offset(1, 10);
        book.append_tile_var_size(1, 10);
        book.set_last_tile_cell_num(4);
        book.save(&fs, dir.path(), &schema).unwrap();

        let loaded = Bookkeeping::load(&fs, dir.path(), &schema, false).unwrap();
        assert_eq!(loaded.sparse_tile_num(), 1);
        assert_eq!(loaded.last_tile_cell_num(), 4);
        assert_eq!(loaded.mbr(0), &coords_to_bytes(&[0i32, 5, 0, 5])[..]);
        assert_eq!(loaded.tile_var_size(1, 0), 10);
        assert_eq!(loaded.tile_count(0), 1);
    }

    #[test]
    fn test_load_rejects_count_mismatch() {
        let schema = sparse_schema();
        let dir = TempDir::new().unwrap();
        let fs = PosixFs::new(ReadMethod::ReadIo);

        let mut book = Bookkeeping::new(&schema, None);
        book.append_mbr(&coords_to_bytes(&[0i32, 5, 0, 5]));
        // Missing bounding coordinates for the MBR
        for attr in 0..3 {
            book.append_tile_offset(attr, 16);
        }
        book.append_tile_var_offset(1, 10);
        book.append_tile_var_size(1, 10);
        book.set_last_tile_cell_num(4);
        book.save(&fs, dir.path(), &schema).unwrap();

        let err = Bookkeeping::load(&fs, dir.path(), &schema, false).unwrap_err();
        assert!(matches!(err, StoreError::Decode(_)));
    }

    #[test]
    fn test_zero_tiles_last_cell_num() {
        let schema = sparse_schema();
        let dir = TempDir::new().unwrap();
        let fs = PosixFs::new(ReadMethod::ReadIo);

        let book = Bookkeeping::new(&schema, None);
        book.save(&fs, dir.path(), &schema).unwrap();
        let loaded = Bookkeeping::load(&fs, dir.path(), &schema, false).unwrap();
        assert_eq!(loaded.sparse_tile_num(), 0);
        // Empty fragments round the last tile up to a full one
        assert_eq!(loaded.last_tile_cell_num(), 4);
    }
}
