//! Per-fragment read path
//!
//! A `ReadState` owns a committed fragment's bookkeeping and serves
//! decompressed tiles out of per-attribute LRU caches. It answers two
//! questions for the merger: which tiles overlap a subarray, and what bytes
//! live at a given (attribute, tile) position.

use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;

use crate::bookkeeping::Bookkeeping;
use crate::cache::TileCache;
use crate::codec;
use crate::error::{Result, StoreError};
use crate::fragment::{attr_file_name, attr_var_file_name, fragment_timestamp};
use crate::fs::StorageBackend;
use crate::schema::{cell_in_subarray, coords_from_bytes, ArraySchema, Coordinate, Layout};

pub struct ReadState {
    schema: Arc<ArraySchema>,
    fs: Arc<dyn StorageBackend>,
    fragment_dir: PathBuf,
    timestamp: u64,
    book: Bookkeeping,
    dense: bool,
    /// Data file size per attribute (None until a tile is fetched)
    file_sizes: Vec<Option<u64>>,
    var_file_sizes: Vec<Option<u64>>,
    /// One cache per attribute so concurrent readers contend per attribute
    caches: Vec<TileCache>,
    caches_var: Vec<TileCache>,
}

impl ReadState {
    pub fn open(
        schema: Arc<ArraySchema>,
        fs: Arc<dyn StorageBackend>,
        fragment_dir: PathBuf,
        cache_bytes: usize,
        cache_var_bytes: usize,
    ) -> Result<Self> {
        let book = Bookkeeping::load(fs.as_ref(), &fragment_dir, &schema, schema.dense())?;
        let timestamp = fragment_timestamp(&fragment_dir)?;
        let attribute_num = schema.attribute_num();
        let per_cache = cache_bytes / (attribute_num + 1).max(1);
        let per_cache_var = cache_var_bytes / attribute_num.max(1);
        Ok(Self {
            dense: schema.dense(),
            timestamp,
            book,
            file_sizes: vec![None; attribute_num + 1],
            var_file_sizes: vec![None; attribute_num],
            caches: (0..attribute_num + 1).map(|_| TileCache::new(per_cache)).collect(),
            caches_var: (0..attribute_num).map(|_| TileCache::new(per_cache_var)).collect(),
            schema,
            fs,
            fragment_dir,
        })
    }

    pub fn dense(&self) -> bool {
        self.dense
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn bookkeeping(&self) -> &Bookkeeping {
        &self.book
    }

    /// The subarray this fragment covers
    pub fn domain_bytes(&self) -> &[u8] {
        self.book.non_empty_domain()
    }

    /// Cells in a tile of an attribute
    pub fn cell_num(&self, attribute_id: usize, tile_pos: usize) -> u64 {
        self.book.cell_num(attribute_id, tile_pos)
    }

    fn file_size(&mut self, attribute_id: usize) -> Result<u64> {
        if let Some(size) = self.file_sizes[attribute_id] {
            return Ok(size);
        }
        let path = self.fragment_dir.join(attr_file_name(&self.schema, attribute_id));
        let size = self.fs.file_size(&path)?;
        self.file_sizes[attribute_id] = Some(size);
        Ok(size)
    }

    fn var_file_size(&mut self, attribute_id: usize) -> Result<u64> {
        if let Some(size) = self.var_file_sizes[attribute_id] {
            return Ok(size);
        }
        let path = self
            .fragment_dir
            .join(attr_var_file_name(&self.schema, attribute_id));
        let size = self.fs.file_size(&path)?;
        self.var_file_sizes[attribute_id] = Some(size);
        Ok(size)
    }

    /// Materialize a tile of an attribute (decompressed), through the cache
    pub fn fetch_tile(&mut self, attribute_id: usize, tile_pos: usize) -> Result<Arc<Vec<u8>>> {
        let key = (attribute_id, tile_pos);
        if let Some(tile) = self.caches[attribute_id].get(&key) {
            return Ok(tile);
        }
        if tile_pos >= self.book.tile_count(attribute_id) {
            return Err(StoreError::NotFound(format!(
                "tile {} of attribute {} in {}",
                tile_pos,
                attribute_id,
                self.fragment_dir.display()
            )));
        }
        let file_size = self.file_size(attribute_id)?;
        let (start, end) = self.book.tile_byte_range(attribute_id, tile_pos, file_size);
        let mut compressed = vec![0u8; (end - start) as usize];
        let path = self.fragment_dir.join(attr_file_name(&self.schema, attribute_id));
        self.fs.read(&path, start, &mut compressed)?;

        let cell_size = self.schema.cell_size(attribute_id);
        let raw_size = self.book.cell_num(attribute_id, tile_pos) as usize * cell_size;
        let mut raw = vec![0u8; raw_size];
        let (codec, _) = self.schema.codec(attribute_id);
        codec::decompress(codec, self.schema.codec_ctx(attribute_id), &compressed, &mut raw)?;
        Ok(self.caches[attribute_id].insert(key, raw))
    }

    /// Materialize the variable-value tile of a variable attribute
    pub fn fetch_tile_var(&mut self, attribute_id: usize, tile_pos: usize) -> Result<Arc<Vec<u8>>> {
        let key = (attribute_id, tile_pos);
        if let Some(tile) = self.caches_var[attribute_id].get(&key) {
            return Ok(tile);
        }
        let file_size = self.var_file_size(attribute_id)?;
        let (start, end) = self.book.tile_var_byte_range(attribute_id, tile_pos, file_size);
        let mut compressed = vec![0u8; (end - start) as usize];
        let path = self
            .fragment_dir
            .join(attr_var_file_name(&self.schema, attribute_id));
        self.fs.read(&path, start, &mut compressed)?;

        let raw_size = self.book.tile_var_size(attribute_id, tile_pos) as usize;
        let mut raw = vec![0u8; raw_size];
        let (codec, _) = self.schema.codec(attribute_id);
        codec::decompress(
            codec,
            self.schema.codec_ctx_var(attribute_id),
            &compressed,
            &mut raw,
        )?;
        Ok(self.caches_var[attribute_id].insert(key, raw))
    }

    /// Absolute raw starting offset of a variable tile's values
    pub fn tile_var_raw_start(&self, attribute_id: usize, tile_pos: usize) -> u64 {
        self.book.tile_var_raw_start(attribute_id, tile_pos)
    }

    /* ------------------------------- dense ------------------------------- */

    /// Tile position of a global tile coordinate, if this fragment covers
    /// it. Fragment domains are tile-aligned, so coverage is whole-tile.
    pub fn dense_tile_pos<T: Coordinate>(&self, tile_coords: &[u64]) -> Option<usize> {
        let dim_num = self.schema.dim_num();
        let schema_domain = self.schema.domain::<T>();
        let extents = self.schema.tile_extents::<T>()?;
        let frag_domain: Vec<T> = coords_from_bytes(self.book.non_empty_domain());

        let mut origin = vec![0u64; dim_num];
        let mut tiles_per_dim = vec![0u64; dim_num];
        let mut local = vec![0u64; dim_num];
        for d in 0..dim_num {
            origin[d] = frag_domain[2 * d].tile_index(schema_domain[2 * d], extents[d]);
            let last = frag_domain[2 * d + 1].tile_index(schema_domain[2 * d], extents[d]);
            tiles_per_dim[d] = last - origin[d] + 1;
            if tile_coords[d] < origin[d] || tile_coords[d] > last {
                return None;
            }
            local[d] = tile_coords[d] - origin[d];
        }
        Some(crate::schema::linearize(&local, &tiles_per_dim, self.schema.tile_order()) as usize)
    }

    /* ------------------------------- sparse ------------------------------ */

    /// Positions of sparse tiles whose MBR intersects the subarray,
    /// in tile (write) order
    pub fn overlapping_tiles<T: Coordinate>(&self, subarray: &[T]) -> Vec<usize> {
        let dim_num = self.schema.dim_num();
        let mut tiles = Vec::new();
        for pos in 0..self.book.sparse_tile_num() {
            let mbr: Vec<T> = coords_from_bytes(self.book.mbr(pos));
            let overlaps = (0..dim_num).all(|d| {
                mbr[2 * d].cmp_coord(subarray[2 * d + 1]) != std::cmp::Ordering::Greater
                    && mbr[2 * d + 1].cmp_coord(subarray[2 * d]) != std::cmp::Ordering::Less
            });
            if overlaps {
                tiles.push(pos);
            }
        }
        tiles
    }

    pub fn bounding_coords(&self, tile_pos: usize) -> &[u8] {
        self.book.bounding_coords(tile_pos)
    }

    pub fn mbr(&self, tile_pos: usize) -> &[u8] {
        self.book.mbr(tile_pos)
    }

    /// Cell positions inside a sparse tile whose coordinates fall in the
    /// subarray, in cell order (the stored order).
    ///
    /// Tiles are sorted in cell order, so for row- and column-major orders
    /// the subarray's corners bound the candidates: a binary search finds
    /// the window between the first cell at or after the low corner and
    /// the last cell at or before the high corner, and only that window is
    /// filtered against the rectangle. Hilbert order has no corner bound
    /// and falls back to filtering the whole tile.
    pub fn qualifying_positions<T: Coordinate>(
        &mut self,
        tile_pos: usize,
        subarray: &[T],
    ) -> Result<Vec<u64>> {
        let coords_id = self.schema.coords_id();
        let coords_size = self.schema.coords_size();
        let dim_num = self.schema.dim_num();
        let tile = self.fetch_tile(coords_id, tile_pos)?;
        let cell_num = self.book.cell_num(coords_id, tile_pos) as usize;

        let cell_at = |pos: usize| -> Vec<T> {
            coords_from_bytes(&tile[pos * coords_size..(pos + 1) * coords_size])
        };

        let (first, last) = if self.schema.cell_order() == Layout::Hilbert {
            (0, cell_num)
        } else {
            let lo: Vec<T> = (0..dim_num).map(|d| subarray[2 * d]).collect();
            let hi: Vec<T> = (0..dim_num).map(|d| subarray[2 * d + 1]).collect();
            let first = partition_point(cell_num, |pos| {
                self.schema.cell_cmp::<T>(&cell_at(pos), &lo) == Ordering::Less
            });
            let last = partition_point(cell_num, |pos| {
                self.schema.cell_cmp::<T>(&cell_at(pos), &hi) != Ordering::Greater
            });
            (first, last)
        };

        let mut positions = Vec::new();
        for pos in first..last {
            if cell_in_subarray(&cell_at(pos), subarray) {
                positions.push(pos as u64);
            }
        }
        Ok(positions)
    }

    /// Coordinates of one cell of a sparse tile
    pub fn cell_coords<T: Coordinate>(&mut self, tile_pos: usize, pos: u64) -> Result<Vec<T>> {
        let coords_id = self.schema.coords_id();
        let coords_size = self.schema.coords_size();
        let tile = self.fetch_tile(coords_id, tile_pos)?;
        let start = pos as usize * coords_size;
        if start + coords_size > tile.len() {
            return Err(StoreError::Decode(format!(
                "cell {} outside coordinate tile {}",
                pos, tile_pos
            )));
        }
        Ok(coords_from_bytes(&tile[start..start + coords_size]))
    }
}

/// First index in `0..n` where `pred` turns false; `pred` must hold on a
/// prefix and fail on the suffix
fn partition_point(n: usize, mut pred: impl FnMut(usize) -> bool) -> usize {
    let mut lo = 0usize;
    let mut hi = n;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(mid) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{Context, Mode};
    use crate::config::{ReadMethod, StorageConfig};
    use crate::fragment::list_fragments;
    use crate::fs::PosixFs;
    use crate::schema::{coords_to_bytes, Attribute, Datatype};
    use tempfile::TempDir;

    #[test]
    fn test_partition_point() {
        assert_eq!(partition_point(10, |i| i < 4), 4);
        assert_eq!(partition_point(10, |_| false), 0);
        assert_eq!(partition_point(10, |_| true), 10);
        assert_eq!(partition_point(0, |_| true), 0);
    }

    #[test]
    fn test_qualifying_positions_window() {
        let dir = TempDir::new().unwrap();
        let ctx =
            Context::init(StorageConfig::new(dir.path().display().to_string())).unwrap();
        let schema = ArraySchema::new(
            false,
            vec!["x".to_string(), "y".to_string()],
            Datatype::Int32,
            coords_to_bytes(&[0i32, 9, 0, 9]),
            None,
            Layout::RowMajor,
            Layout::RowMajor,
            10,
            vec![Attribute::new("v", Datatype::Int32)],
        )
        .unwrap();
        ctx.array_create("q", &schema).unwrap();

        // Stored row-major: (0,0) (1,1) (1,8) (2,2) (9,9) at positions 0..=4
        let coords = coords_to_bytes(&[1i32, 8, 9, 9, 0, 0, 2, 2, 1, 1]);
        let values: Vec<u8> = [18i32, 99, 0, 22, 11]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let mut array = ctx
            .array_init("q", Mode::WriteUnsorted, None, None)
            .unwrap();
        array.write(&[values.as_slice(), coords.as_slice()]).unwrap();
        array.finalize().unwrap();

        let fs: Arc<dyn StorageBackend> = Arc::new(PosixFs::new(ReadMethod::ReadIo));
        let fragment_dir = list_fragments(fs.as_ref(), &ctx.resolve("q").unwrap())
            .unwrap()
            .pop()
            .unwrap();
        let mut state = ReadState::open(
            Arc::new(schema),
            fs,
            fragment_dir,
            1 << 20,
            1 << 20,
        )
        .unwrap();

        // Window [1, 4): (1,1) (1,8) (2,2); only (1,8) fails the rectangle
        let positions = state
            .qualifying_positions::<i32>(0, &[1, 2, 0, 5])
            .unwrap();
        assert_eq!(positions, vec![1, 3]);

        // A corner-only match and an empty rectangle
        let positions = state.qualifying_positions::<i32>(0, &[9, 9, 9, 9]).unwrap();
        assert_eq!(positions, vec![4]);
        let positions = state.qualifying_positions::<i32>(0, &[3, 8, 0, 9]).unwrap();
        assert!(positions.is_empty());
    }
}
