//! Multi-fragment read merger
//!
//! Produces, per requested attribute, the cells inside the query subarray
//! from all visible fragments, in the schema's cell order, into
//! caller-sized buffers. The merger first commits an ordered sequence of
//! *cell position ranges* (fragment, tile, contiguous positions) and then
//! copies them attribute by attribute; per-attribute cursors into that
//! sequence make a filled buffer resumable at the exact cell where copying
//! stopped.
//!
//! Dense: walk the subarray's tile coordinates in tile order; the newest
//! fragment covering a tile claims it, tiles covered by no fragment fill
//! with the type's empty sentinel. Sparse: a merge across per-fragment tile
//! cursors ordered by cell order; on coordinate ties the newest fragment
//! wins and older duplicates are dropped.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{Result, StoreError};
use crate::read_state::ReadState;
use crate::schema::{ArraySchema, Coordinate, Layout, VAR_OFFSET_SIZE};

/// One committed range of the merged cell sequence
#[derive(Debug, Clone)]
enum PosRange {
    /// Cells `lo..=hi` of a tile of one fragment
    Data {
        fragment: usize,
        tile_pos: usize,
        lo: u64,
        hi: u64,
    },
    /// Cells covered by no fragment (dense only)
    Empty { count: u64 },
}

impl PosRange {
    fn cell_count(&self) -> u64 {
        match self {
            PosRange::Data { lo, hi, .. } => hi - lo + 1,
            PosRange::Empty { count } => *count,
        }
    }
}

/// Per-attribute cursor into the committed range sequence
#[derive(Debug, Clone, Copy)]
struct RangeCursor {
    /// Absolute index of the range being copied
    range: u64,
    /// Cells of that range already copied
    cell_off: u64,
}

pub struct ArrayReadState<T: Coordinate> {
    schema: Arc<ArraySchema>,
    fragments: Vec<ReadState>,
    subarray: Vec<T>,
    attribute_ids: Vec<usize>,
    overflow: Vec<bool>,
    ranges: VecDeque<PosRange>,
    /// Absolute index of `ranges.front()`
    ranges_base: u64,
    cursors: Vec<RangeCursor>,
    producer: Producer<T>,
    produced_all: bool,
}

impl<T: Coordinate> ArrayReadState<T> {
    pub fn new(
        schema: Arc<ArraySchema>,
        fragments: Vec<ReadState>,
        subarray: Vec<T>,
        attribute_ids: Vec<usize>,
    ) -> Result<Self> {
        let producer = if schema.dense() {
            Producer::Dense(DenseProducer::new(&schema, &subarray)?)
        } else {
            Producer::Sparse(SparseProducer::new())
        };
        let attr_num = attribute_ids.len();
        let mut state = Self {
            schema,
            fragments,
            subarray,
            attribute_ids,
            overflow: vec![false; attr_num],
            ranges: VecDeque::new(),
            ranges_base: 0,
            cursors: vec![RangeCursor { range: 0, cell_off: 0 }; attr_num],
            producer,
            produced_all: false,
        };
        if let Producer::Sparse(producer) = &mut state.producer {
            producer.init(&state.schema, &mut state.fragments, &state.subarray)?;
        }
        Ok(state)
    }

    /// Recover the fragment read states (for subarray/attribute resets)
    pub fn into_fragments(self) -> Vec<ReadState> {
        self.fragments
    }

    pub fn overflow(&self, attribute_id: usize) -> bool {
        self.attribute_ids
            .iter()
            .position(|&id| id == attribute_id)
            .map(|i| self.overflow[i])
            .unwrap_or(false)
    }

    pub fn any_overflow(&self) -> bool {
        self.overflow.iter().any(|&o| o)
    }

    /// Whether every attribute has consumed the whole merged sequence
    pub fn done(&self) -> bool {
        self.produced_all
            && self.cursors.iter().all(|c| c.range >= self.total_ranges())
    }

    fn total_ranges(&self) -> u64 {
        self.ranges_base + self.ranges.len() as u64
    }

    /// Read the next slice of results into the caller's buffers.
    ///
    /// `buffer_sizes[i]` holds the usable capacity of `buffers[i]` on entry
    /// and the bytes produced on return. Variable attributes take two
    /// consecutive buffers (offsets, then values). A full buffer sets the
    /// attribute's overflow flag; the next call resumes after the last
    /// complete cell.
    pub fn read(
        &mut self,
        buffers: &mut [&mut [u8]],
        buffer_sizes: &mut [usize],
        skip_counts: Option<&[u64]>,
    ) -> Result<()> {
        let expected: usize = self
            .attribute_ids
            .iter()
            .map(|&id| if self.is_var(id) { 2 } else { 1 })
            .sum();
        if buffers.len() != expected || buffer_sizes.len() != expected {
            return Err(StoreError::InvalidArg(format!(
                "read expects {} buffers, got {}",
                expected,
                buffers.len()
            )));
        }

        let mut buffer_i = 0;
        for attr_i in 0..self.attribute_ids.len() {
            self.overflow[attr_i] = false;
            let skip = skip_counts.map(|s| s[attr_i]).unwrap_or(0);
            if skip > 0 {
                self.skip_cells(attr_i, skip)?;
            }
            let id = self.attribute_ids[attr_i];
            if self.is_var(id) {
                let (head, tail) = buffers.split_at_mut(buffer_i + 1);
                let offsets_buf = &mut *head[buffer_i];
                let values_buf = &mut *tail[0];
                let (off_bytes, val_bytes) = self.copy_attr_var(
                    attr_i,
                    offsets_buf,
                    buffer_sizes[buffer_i],
                    values_buf,
                    buffer_sizes[buffer_i + 1],
                )?;
                buffer_sizes[buffer_i] = off_bytes;
                buffer_sizes[buffer_i + 1] = val_bytes;
                buffer_i += 2;
            } else {
                let written =
                    self.copy_attr(attr_i, &mut *buffers[buffer_i], buffer_sizes[buffer_i])?;
                buffer_sizes[buffer_i] = written;
                buffer_i += 1;
            }
        }

        self.collect_processed_ranges();
        Ok(())
    }

    fn is_var(&self, attribute_id: usize) -> bool {
        !self.schema.is_coords(attribute_id) && self.schema.var_size(attribute_id)
    }

    /// Drop committed ranges every attribute has fully copied
    fn collect_processed_ranges(&mut self) {
        let min_range = self.cursors.iter().map(|c| c.range).min().unwrap_or(0);
        while self.ranges_base < min_range {
            self.ranges.pop_front();
            self.ranges_base += 1;
        }
    }

    /// Ensure the range at absolute index `abs` is committed; false when
    /// the merged sequence is exhausted before it.
    fn ensure_range(&mut self, abs: u64) -> Result<bool> {
        while abs >= self.total_ranges() {
            if self.produced_all {
                return Ok(false);
            }
            let produced = match &mut self.producer {
                Producer::Dense(producer) => {
                    producer.produce(&self.schema, &self.fragments, &self.subarray)?
                }
                Producer::Sparse(producer) => {
                    producer.produce(&self.schema, &mut self.fragments)?
                }
            };
            match produced {
                Some(batch) => self.ranges.extend(batch),
                None => self.produced_all = true,
            }
        }
        Ok(true)
    }

    fn range_at(&self, abs: u64) -> PosRange {
        self.ranges[(abs - self.ranges_base) as usize].clone()
    }

    /// Advance an attribute's cursor by `count` cells without copying
    fn skip_cells(&mut self, attr_i: usize, count: u64) -> Result<()> {
        let mut remaining = count;
        while remaining > 0 {
            let cursor = self.cursors[attr_i];
            if !self.ensure_range(cursor.range)? {
                break;
            }
            let range = self.range_at(cursor.range);
            let left = range.cell_count() - cursor.cell_off;
            let n = left.min(remaining);
            remaining -= n;
            let cursor = &mut self.cursors[attr_i];
            cursor.cell_off += n;
            if cursor.cell_off == range.cell_count() {
                cursor.range += 1;
                cursor.cell_off = 0;
            }
        }
        Ok(())
    }

    /// Copy a fixed-size attribute; returns bytes written
    fn copy_attr(&mut self, attr_i: usize, buffer: &mut [u8], capacity: usize) -> Result<usize> {
        let id = self.attribute_ids[attr_i];
        let cell_size = self.schema.cell_size(id);
        let capacity = capacity.min(buffer.len());
        let mut written = 0usize;

        loop {
            let cursor = self.cursors[attr_i];
            if !self.ensure_range(cursor.range)? {
                break;
            }
            let range = self.range_at(cursor.range);
            let cells_left = range.cell_count() - cursor.cell_off;
            let cells_fit = ((capacity - written) / cell_size) as u64;
            if cells_fit == 0 {
                self.overflow[attr_i] = true;
                break;
            }
            let n = cells_left.min(cells_fit);

            match range {
                PosRange::Data {
                    fragment,
                    tile_pos,
                    lo,
                    ..
                } => {
                    let tile = self.fragments[fragment].fetch_tile(id, tile_pos)?;
                    let start = (lo + cursor.cell_off) as usize * cell_size;
                    let bytes = n as usize * cell_size;
                    buffer[written..written + bytes]
                        .copy_from_slice(&tile[start..start + bytes]);
                    written += bytes;
                }
                PosRange::Empty { .. } => {
                    let datatype = self.schema.attribute_type(id);
                    let value_size = datatype.size();
                    for _ in 0..n {
                        let mut slot = written;
                        while slot < written + cell_size {
                            datatype.write_empty(&mut buffer[slot..slot + value_size]);
                            slot += value_size;
                        }
                        written += cell_size;
                    }
                }
            }

            let cursor = &mut self.cursors[attr_i];
            cursor.cell_off += n;
            if cursor.cell_off == range.cell_count() {
                cursor.range += 1;
                cursor.cell_off = 0;
            }
            if n < cells_left {
                self.overflow[attr_i] = true;
                break;
            }
        }
        Ok(written)
    }

    /// Copy a variable attribute; returns (offset bytes, value bytes).
    /// Offsets written are relative to this call's value buffer.
    fn copy_attr_var(
        &mut self,
        attr_i: usize,
        offsets_buf: &mut [u8],
        offsets_capacity: usize,
        values_buf: &mut [u8],
        values_capacity: usize,
    ) -> Result<(usize, usize)> {
        let id = self.attribute_ids[attr_i];
        let offsets_capacity = offsets_capacity.min(offsets_buf.len());
        let values_capacity = values_capacity.min(values_buf.len());
        let mut off_written = 0usize;
        let mut val_written = 0usize;

        'ranges: loop {
            let cursor = self.cursors[attr_i];
            if !self.ensure_range(cursor.range)? {
                break;
            }
            let range = self.range_at(cursor.range);
            let cells_left = range.cell_count() - cursor.cell_off;

            for _ in 0..cells_left {
                if off_written + VAR_OFFSET_SIZE > offsets_capacity {
                    self.overflow[attr_i] = true;
                    break 'ranges;
                }
                let value: Option<(Arc<Vec<u8>>, usize, usize)> = match &range {
                    PosRange::Data {
                        fragment,
                        tile_pos,
                        lo,
                        ..
                    } => {
                        let pos = lo + self.cursors[attr_i].cell_off;
                        let (start, end) =
                            self.var_value_extent(*fragment, id, *tile_pos, pos)?;
                        let tile = self.fragments[*fragment].fetch_tile_var(id, *tile_pos)?;
                        Some((tile, start, end))
                    }
                    PosRange::Empty { .. } => None,
                };
                let value_len = value.as_ref().map(|(_, s, e)| e - s).unwrap_or(0);
                if val_written + value_len > values_capacity {
                    self.overflow[attr_i] = true;
                    break 'ranges;
                }
                offsets_buf[off_written..off_written + VAR_OFFSET_SIZE]
                    .copy_from_slice(&(val_written as u64).to_le_bytes());
                off_written += VAR_OFFSET_SIZE;
                if let Some((tile, start, end)) = value {
                    values_buf[val_written..val_written + value_len]
                        .copy_from_slice(&tile[start..end]);
                    val_written += value_len;
                }

                let cursor = &mut self.cursors[attr_i];
                cursor.cell_off += 1;
                if cursor.cell_off == range.cell_count() {
                    cursor.range += 1;
                    cursor.cell_off = 0;
                }
            }
        }
        Ok((off_written, val_written))
    }

    /// Byte extent of one cell's value inside its (decompressed) variable
    /// tile, derived from the absolute offsets stored in the main file
    fn var_value_extent(
        &mut self,
        fragment: usize,
        attribute_id: usize,
        tile_pos: usize,
        pos: u64,
    ) -> Result<(usize, usize)> {
        let offsets_tile = self.fragments[fragment].fetch_tile(attribute_id, tile_pos)?;
        let cell_num = self.fragments[fragment].cell_num(attribute_id, tile_pos);
        let raw_start = self.fragments[fragment].tile_var_raw_start(attribute_id, tile_pos);
        let entry = |i: u64| {
            u64::from_le_bytes(
                offsets_tile[i as usize * VAR_OFFSET_SIZE..(i as usize + 1) * VAR_OFFSET_SIZE]
                    .try_into()
                    .expect("offset entry"),
            )
        };
        let var_tile_len = self.fragments[fragment]
            .bookkeeping()
            .tile_var_size(attribute_id, tile_pos);
        let start = entry(pos) - raw_start;
        let end = if pos + 1 < cell_num {
            entry(pos + 1) - raw_start
        } else {
            var_tile_len
        };
        if start > end || end > var_tile_len {
            return Err(StoreError::Decode(format!(
                "corrupt variable offsets in tile {} of attribute {}",
                tile_pos, attribute_id
            )));
        }
        Ok((start as usize, end as usize))
    }
}

enum Producer<T: Coordinate> {
    Dense(DenseProducer<T>),
    Sparse(SparseProducer<T>),
}

/* -------------------------------- dense -------------------------------- */

struct DenseProducer<T: Coordinate> {
    /// `[lo, hi]` per dimension, in global tile coordinates
    tile_domain: Vec<u64>,
    /// Next tile to visit, `None` when exhausted
    current: Option<Vec<u64>>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Coordinate> DenseProducer<T> {
    fn new(schema: &ArraySchema, subarray: &[T]) -> Result<Self> {
        let dim_num = schema.dim_num();
        let domain = schema.domain::<T>();
        let extents = schema
            .tile_extents::<T>()
            .ok_or_else(|| StoreError::InvalidArg("dense arrays require tile extents".to_string()))?;
        let mut tile_domain = vec![0u64; 2 * dim_num];
        for d in 0..dim_num {
            tile_domain[2 * d] = subarray[2 * d].tile_index(domain[2 * d], extents[d]);
            tile_domain[2 * d + 1] = subarray[2 * d + 1].tile_index(domain[2 * d], extents[d]);
        }
        let current = Some((0..dim_num).map(|d| tile_domain[2 * d]).collect());
        Ok(Self {
            tile_domain,
            current,
            _marker: std::marker::PhantomData,
        })
    }

    /// Advance the tile odometer in tile order
    fn advance(&mut self, order: Layout) {
        let Some(tile) = &mut self.current else {
            return;
        };
        let dim_num = tile.len();
        let dims: Vec<usize> = match order {
            Layout::ColMajor => (0..dim_num).collect(),
            _ => (0..dim_num).rev().collect(),
        };
        for d in dims {
            if tile[d] < self.tile_domain[2 * d + 1] {
                tile[d] += 1;
                return;
            }
            tile[d] = self.tile_domain[2 * d];
        }
        self.current = None;
    }

    /// Commit the ranges of the next subarray tile
    fn produce(
        &mut self,
        schema: &ArraySchema,
        fragments: &[ReadState],
        subarray: &[T],
    ) -> Result<Option<Vec<PosRange>>> {
        let Some(tile) = self.current.clone() else {
            return Ok(None);
        };

        // Newest fragment covering this tile claims it whole (fragment
        // domains are tile-aligned)
        let mut claimed: Option<(usize, usize)> = None;
        for (fragment_id, state) in fragments.iter().enumerate().rev() {
            if let Some(tile_pos) = state.dense_tile_pos::<T>(&tile) {
                claimed = Some((fragment_id, tile_pos));
                break;
            }
        }

        let runs = tile_cell_runs(schema, &tile, subarray);
        let ranges = match claimed {
            Some((fragment, tile_pos)) => runs
                .into_iter()
                .map(|(lo, hi)| PosRange::Data {
                    fragment,
                    tile_pos,
                    lo,
                    hi,
                })
                .collect(),
            None => {
                let count: u64 = runs.iter().map(|(lo, hi)| hi - lo + 1).sum();
                vec![PosRange::Empty { count }]
            }
        };

        self.advance(schema.tile_order());
        Ok(Some(ranges))
    }
}

/// Contiguous cell-position runs of `subarray ∩ tile` inside the tile, in
/// the schema's cell order
fn tile_cell_runs<T: Coordinate>(
    schema: &ArraySchema,
    tile: &[u64],
    subarray: &[T],
) -> Vec<(u64, u64)> {
    let dim_num = schema.dim_num();
    let domain = schema.domain::<T>();
    let extents = schema.tile_extents::<T>().expect("dense tile grid");

    // Overlap rectangle in tile-local cell offsets
    let mut lo = vec![0u64; dim_num];
    let mut hi = vec![0u64; dim_num];
    let mut extent_cells = vec![0u64; dim_num];
    for d in 0..dim_num {
        extent_cells[d] = extents[d].cell_offset(T::default());
        let tile_first = tile[d] * extent_cells[d];
        let tile_last = tile_first + extent_cells[d] - 1;
        let sub_first = subarray[2 * d].cell_offset(domain[2 * d]);
        let sub_last = subarray[2 * d + 1].cell_offset(domain[2 * d]);
        lo[d] = sub_first.max(tile_first) - tile_first;
        hi[d] = sub_last.min(tile_last) - tile_first;
    }

    // Runs are contiguous along the fastest-varying dimension
    let fastest = match schema.cell_order() {
        Layout::ColMajor => 0,
        _ => dim_num - 1,
    };
    let run_len = hi[fastest] - lo[fastest] + 1;

    let slow_dims: Vec<usize> = match schema.cell_order() {
        Layout::ColMajor => (1..dim_num).rev().collect(),
        _ => (0..dim_num).filter(|&d| d != fastest).collect(),
    };

    let mut runs = Vec::new();
    let mut cell = lo.clone();
    loop {
        cell[fastest] = lo[fastest];
        let start = crate::schema::linearize(&cell, &extent_cells, schema.cell_order());
        runs.push((start, start + run_len - 1));

        // Odometer over the slower dimensions, fastest of them last
        let mut carried = true;
        for &d in slow_dims.iter().rev() {
            if cell[d] < hi[d] {
                cell[d] += 1;
                carried = false;
                break;
            }
            cell[d] = lo[d];
        }
        if carried {
            break;
        }
    }
    runs
}

/* -------------------------------- sparse -------------------------------- */

struct FragCursor<T: Coordinate> {
    overlap_tiles: Vec<usize>,
    /// Index into `overlap_tiles` of the tile the cursor is on
    tile_idx: usize,
    /// Qualifying cell positions of the current tile
    positions: Vec<u64>,
    pos_idx: usize,
    /// Coordinates of the current cell
    coords: Vec<T>,
    exhausted: bool,
}

struct SparseProducer<T: Coordinate> {
    subarray: Vec<T>,
    cursors: Vec<FragCursor<T>>,
}

impl<T: Coordinate> SparseProducer<T> {
    fn new() -> Self {
        Self {
            subarray: Vec::new(),
            cursors: Vec::new(),
        }
    }

    fn init(
        &mut self,
        _schema: &ArraySchema,
        fragments: &mut [ReadState],
        subarray: &[T],
    ) -> Result<()> {
        self.subarray = subarray.to_vec();
        for state in fragments.iter_mut() {
            let overlap_tiles = state.overlapping_tiles(subarray);
            let mut cursor = FragCursor {
                overlap_tiles,
                tile_idx: 0,
                positions: Vec::new(),
                pos_idx: 0,
                coords: Vec::new(),
                exhausted: false,
            };
            Self::load_tile(&mut cursor, state, subarray, true)?;
            self.cursors.push(cursor);
        }
        Ok(())
    }

    /// Position the cursor on the first qualifying cell at or after the
    /// current tile index
    fn load_tile(
        cursor: &mut FragCursor<T>,
        state: &mut ReadState,
        subarray: &[T],
        first: bool,
    ) -> Result<()> {
        if !first {
            cursor.tile_idx += 1;
        }
        loop {
            if cursor.tile_idx >= cursor.overlap_tiles.len() {
                cursor.exhausted = true;
                return Ok(());
            }
            let tile_pos = cursor.overlap_tiles[cursor.tile_idx];
            cursor.positions = state.qualifying_positions(tile_pos, subarray)?;
            cursor.pos_idx = 0;
            if !cursor.positions.is_empty() {
                cursor.coords = state.cell_coords(tile_pos, cursor.positions[0])?;
                return Ok(());
            }
            cursor.tile_idx += 1;
        }
    }

    fn advance(
        cursor: &mut FragCursor<T>,
        state: &mut ReadState,
        subarray: &[T],
    ) -> Result<()> {
        cursor.pos_idx += 1;
        if cursor.pos_idx < cursor.positions.len() {
            let tile_pos = cursor.overlap_tiles[cursor.tile_idx];
            cursor.coords = state.cell_coords(tile_pos, cursor.positions[cursor.pos_idx])?;
            return Ok(());
        }
        Self::load_tile(cursor, state, subarray, false)
    }

    /// Commit the next run of the merged sequence.
    ///
    /// The smallest current cell (ties to the newest fragment) starts the
    /// run; the run extends through consecutive positions of the same tile
    /// strictly before every other fragment's current cell. A coordinate
    /// tie emits a unary range from the newest fragment and silently drops
    /// the older duplicates.
    fn produce(
        &mut self,
        schema: &ArraySchema,
        fragments: &mut [ReadState],
    ) -> Result<Option<Vec<PosRange>>> {
        let winner = {
            let mut winner: Option<usize> = None;
            for (i, cursor) in self.cursors.iter().enumerate() {
                if cursor.exhausted {
                    continue;
                }
                winner = match winner {
                    None => Some(i),
                    Some(w) => {
                        match schema.cell_cmp::<T>(&cursor.coords, &self.cursors[w].coords) {
                            Ordering::Less => Some(i),
                            // Larger fragment id wins ties
                            Ordering::Equal if i > w => Some(i),
                            _ => Some(w),
                        }
                    }
                };
            }
            winner
        };
        let Some(winner) = winner else {
            return Ok(None);
        };

        // Smallest cell among the other fragments bounds the run
        let mut next_other: Option<Vec<T>> = None;
        for (i, cursor) in self.cursors.iter().enumerate() {
            if i == winner || cursor.exhausted {
                continue;
            }
            let better = match &next_other {
                None => true,
                Some(best) => schema.cell_cmp::<T>(&cursor.coords, best) == Ordering::Less,
            };
            if better {
                next_other = Some(cursor.coords.clone());
            }
        }

        let tie = next_other
            .as_ref()
            .map(|c| schema.cell_cmp::<T>(&self.cursors[winner].coords, c) == Ordering::Equal)
            .unwrap_or(false);

        let cursor = &self.cursors[winner];
        let tile_pos = cursor.overlap_tiles[cursor.tile_idx];
        let start_pos = cursor.positions[cursor.pos_idx];
        let mut end_idx = cursor.pos_idx;

        if !tie {
            // Extend through consecutive positions strictly below the bound
            while end_idx + 1 < cursor.positions.len()
                && cursor.positions[end_idx + 1] == cursor.positions[end_idx] + 1
            {
                let coords =
                    fragments[winner].cell_coords::<T>(tile_pos, cursor.positions[end_idx + 1])?;
                let below_bound = match &next_other {
                    None => true,
                    Some(bound) => schema.cell_cmp::<T>(&coords, bound) == Ordering::Less,
                };
                if !below_bound {
                    break;
                }
                end_idx += 1;
            }
        }
        let end_pos = self.cursors[winner].positions[end_idx];
        let emitted = PosRange::Data {
            fragment: winner,
            tile_pos,
            lo: start_pos,
            hi: end_pos,
        };
        let last_coords = fragments[winner].cell_coords::<T>(tile_pos, end_pos)?;

        // Advance the winner past the run
        self.cursors[winner].pos_idx = end_idx;
        let subarray = self.subarray.clone();
        Self::advance(&mut self.cursors[winner], &mut fragments[winner], &subarray)?;

        // Older fragments drop their duplicates of the emitted coordinates
        if tie {
            for i in 0..self.cursors.len() {
                if i == winner {
                    continue;
                }
                while !self.cursors[i].exhausted
                    && schema.cell_cmp::<T>(&self.cursors[i].coords, &last_coords)
                        == Ordering::Equal
                {
                    Self::advance(&mut self.cursors[i], &mut fragments[i], &subarray)?;
                }
            }
        }

        Ok(Some(vec![emitted]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::dense_4x4;

    #[test]
    fn test_tile_cell_runs_row_major() {
        let schema = dense_4x4();
        // Query [1,2]x[1,2] against tile (0,0): overlap is cell (1,1),
        // tile-local position 3
        let runs = tile_cell_runs(&schema, &[0, 0], &[1i32, 2, 1, 2]);
        assert_eq!(runs, vec![(3, 3)]);

        // Whole tile (1,1): positions 0..=3
        let runs = tile_cell_runs(&schema, &[1, 1], &[0i32, 3, 0, 3]);
        assert_eq!(runs, vec![(0, 1), (2, 3)]);
    }
}
