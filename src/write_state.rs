//! Per-fragment write path
//!
//! Cells stream through one in-memory tile buffer per attribute. Full tiles
//! are compressed and appended to the attribute file, and their on-disk
//! extents recorded in the bookkeeping; a trailing partial tile stays
//! buffered until finalize. Sparse writes additionally maintain the current
//! tile's MBR and bounding coordinates, cutting a tile whenever the
//! capacity is reached.
//!
//! Finalize is the commit point: it flushes the last tile, writes the
//! bookkeeping sidecar, and creates the fragment sentinel *last*, so a
//! crashed write leaves only an invisible directory behind.

use std::path::PathBuf;
use std::sync::Arc;

use log::debug;

use crate::array::Mode;
use crate::bookkeeping::{create_marker, Bookkeeping};
use crate::codec;
use crate::error::{Result, StoreError};
use crate::fragment::{attr_file_name, attr_var_file_name, FRAGMENT_SENTINEL};
use crate::fs::StorageBackend;
use crate::schema::{
    coords_from_bytes, ArraySchema, Coordinate, Datatype, Layout, VAR_OFFSET_SIZE,
};

/// Scratch buffer for re-ordering unsorted cells, fixed attributes
const SORTED_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Scratch buffer for re-ordering unsorted cells, variable values
const SORTED_BUFFER_VAR_SIZE: usize = 256 * 1024 * 1024;

pub struct WriteState {
    schema: Arc<ArraySchema>,
    fs: Arc<dyn StorageBackend>,
    fragment_dir: PathBuf,
    mode: Mode,
    /// Attributes being written, coordinates last for sparse fragments
    attribute_ids: Vec<usize>,
    book: Bookkeeping,
    /// One tile buffer per schema attribute plus coordinates
    tiles: Vec<Vec<u8>>,
    /// Variable-value tile buffers, schema attributes only
    tiles_var: Vec<Vec<u8>>,
    /// Cells buffered in the current coordinates tile
    coords_tile_cells: u64,
    /// Running raw size of each variable-value file, used to rewrite
    /// cell-local offsets into file-absolute ones
    buffer_var_offsets: Vec<u64>,
    /// MBR of the current sparse tile
    mbr: Vec<u8>,
    /// First and last coordinates of the current sparse tile
    bounding: Vec<u8>,
    cells_per_tile: u64,
}

impl WriteState {
    pub fn new(
        schema: Arc<ArraySchema>,
        fs: Arc<dyn StorageBackend>,
        fragment_dir: PathBuf,
        mode: Mode,
        attribute_ids: Vec<usize>,
        domain: Option<Vec<u8>>,
    ) -> Result<Self> {
        let attribute_num = schema.attribute_num();
        let coords_size = schema.coords_size();
        let book = Bookkeeping::new(&schema, domain.as_deref());
        fs.create_dir(&fragment_dir)?;
        debug!("opened fragment {} for writing", fragment_dir.display());
        Ok(Self {
            book,
            mode,
            attribute_ids,
            tiles: vec![Vec::new(); attribute_num + 1],
            tiles_var: vec![Vec::new(); attribute_num],
            coords_tile_cells: 0,
            buffer_var_offsets: vec![0; attribute_num],
            mbr: vec![0; 2 * coords_size],
            bounding: vec![0; 2 * coords_size],
            cells_per_tile: schema.cells_per_tile(),
            schema,
            fs,
            fragment_dir,
        })
    }

    pub fn fragment_dir(&self) -> &PathBuf {
        &self.fragment_dir
    }

    /// Number of caller buffers expected by `write`
    pub fn expected_buffer_num(&self) -> usize {
        self.attribute_ids
            .iter()
            .map(|&id| {
                if !self.schema.is_coords(id) && self.schema.var_size(id) {
                    2
                } else {
                    1
                }
            })
            .sum()
    }

    /// Write one batch of cells. Buffers follow the attribute order the
    /// fragment was opened with; a variable attribute takes two buffers
    /// (cell-local offsets, then values).
    pub fn write(&mut self, buffers: &[&[u8]]) -> Result<()> {
        if buffers.len() != self.expected_buffer_num() {
            return Err(StoreError::InvalidArg(format!(
                "write expects {} buffers, got {}",
                self.expected_buffer_num(),
                buffers.len()
            )));
        }
        match self.mode {
            Mode::Write => self.write_ordered(buffers),
            Mode::WriteSortedRow | Mode::WriteSortedCol => {
                if self.schema.dense() {
                    self.write_dense_sorted(buffers)
                } else {
                    // Pre-sorted sparse input is a trivial case of unsorted
                    self.write_sparse_unsorted(buffers)
                }
            }
            Mode::WriteUnsorted => {
                if self.schema.dense() {
                    Err(StoreError::InvalidArg(
                        "unsorted writes apply to sparse arrays only".to_string(),
                    ))
                } else {
                    self.write_sparse_unsorted(buffers)
                }
            }
            _ => Err(StoreError::InvalidArg(
                "array is not open for writing".to_string(),
            )),
        }
    }

    /// Input already in the schema's global cell order
    fn write_ordered(&mut self, buffers: &[&[u8]]) -> Result<()> {
        let mut buffer_i = 0;
        for i in 0..self.attribute_ids.len() {
            let id = self.attribute_ids[i];
            if !self.schema.is_coords(id) && self.schema.var_size(id) {
                self.write_attr_var(id, buffers[buffer_i], buffers[buffer_i + 1])?;
                buffer_i += 2;
            } else {
                self.write_attr(id, buffers[buffer_i])?;
                buffer_i += 1;
            }
        }
        Ok(())
    }

    /// Fixed-size attribute (or coordinates): slice the input into tile
    /// spans through the buffered tile.
    fn write_attr(&mut self, attribute_id: usize, buffer: &[u8]) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let cell_size = self.schema.cell_size(attribute_id);
        if buffer.len() % cell_size != 0 {
            return Err(StoreError::InvalidArg(format!(
                "buffer of attribute {} is not a whole number of cells",
                attribute_id
            )));
        }
        if self.schema.is_coords(attribute_id) {
            self.update_book_keeping(buffer)?;
        }

        let tile_size = self.cells_per_tile as usize * cell_size;
        let mut buffer_offset = 0;

        // Fill the partially buffered tile first
        let fill = self.tiles[attribute_id].len();
        if fill > 0 {
            let take = (tile_size - fill).min(buffer.len());
            self.tiles[attribute_id].extend_from_slice(&buffer[..take]);
            buffer_offset += take;
            if self.tiles[attribute_id].len() == tile_size {
                self.flush_tile(attribute_id)?;
            }
        }

        // Consume whole tiles
        while buffer_offset + tile_size <= buffer.len() {
            self.tiles[attribute_id]
                .extend_from_slice(&buffer[buffer_offset..buffer_offset + tile_size]);
            buffer_offset += tile_size;
            self.flush_tile(attribute_id)?;
        }

        // Buffer the remainder
        if buffer_offset < buffer.len() {
            self.tiles[attribute_id].extend_from_slice(&buffer[buffer_offset..]);
        }
        Ok(())
    }

    /// Variable-size attribute: offsets are rewritten file-absolute and the
    /// values accumulate in a parallel variable tile.
    fn write_attr_var(
        &mut self,
        attribute_id: usize,
        buffer: &[u8],
        buffer_var: &[u8],
    ) -> Result<()> {
        if buffer.len() % VAR_OFFSET_SIZE != 0 {
            return Err(StoreError::InvalidArg(format!(
                "offset buffer of attribute {} is not a whole number of entries",
                attribute_id
            )));
        }
        let cell_num = buffer.len() / VAR_OFFSET_SIZE;
        let base = self.buffer_var_offsets[attribute_id];
        let local_offset = |i: usize| {
            u64::from_le_bytes(
                buffer[i * VAR_OFFSET_SIZE..(i + 1) * VAR_OFFSET_SIZE]
                    .try_into()
                    .expect("offset entry"),
            )
        };
        if cell_num > 0 && local_offset(0) != 0 {
            return Err(StoreError::InvalidArg(format!(
                "offsets of attribute {} must start at zero within the batch",
                attribute_id
            )));
        }

        for i in 0..cell_num {
            let start = local_offset(i) as usize;
            let end = if i + 1 < cell_num {
                local_offset(i + 1) as usize
            } else {
                buffer_var.len()
            };
            if start > end || end > buffer_var.len() {
                return Err(StoreError::InvalidArg(format!(
                    "offsets of attribute {} are not sorted within the value buffer",
                    attribute_id
                )));
            }
            let absolute = base + start as u64;
            self.tiles[attribute_id].extend_from_slice(&absolute.to_le_bytes());
            self.tiles_var[attribute_id].extend_from_slice(&buffer_var[start..end]);

            if self.tiles[attribute_id].len() == self.cells_per_tile as usize * VAR_OFFSET_SIZE {
                self.flush_tile_var(attribute_id)?;
            }
        }
        self.buffer_var_offsets[attribute_id] += buffer_var.len() as u64;
        Ok(())
    }

    /// Compress and append the buffered tile, record its extent
    fn flush_tile(&mut self, attribute_id: usize) -> Result<()> {
        let raw = std::mem::take(&mut self.tiles[attribute_id]);
        let (codec, level) = self.schema.codec(attribute_id);
        let ctx = self.schema.codec_ctx(attribute_id);
        let compressed = codec::compress(codec, level, ctx, &raw)?;
        let path = self.fragment_dir.join(attr_file_name(&self.schema, attribute_id));
        self.fs.write(&path, &compressed)?;
        self.book.append_tile_offset(attribute_id, compressed.len() as u64);
        Ok(())
    }

    /// Flush both files of a variable attribute's tile
    fn flush_tile_var(&mut self, attribute_id: usize) -> Result<()> {
        self.flush_tile(attribute_id)?;
        let raw = std::mem::take(&mut self.tiles_var[attribute_id]);
        let (codec, level) = self.schema.codec(attribute_id);
        let ctx = self.schema.codec_ctx_var(attribute_id);
        let compressed = codec::compress(codec, level, ctx, &raw)?;
        let path = self
            .fragment_dir
            .join(attr_var_file_name(&self.schema, attribute_id));
        self.fs.write(&path, &compressed)?;
        self.book
            .append_tile_var_offset(attribute_id, compressed.len() as u64);
        self.book.append_tile_var_size(attribute_id, raw.len() as u64);
        Ok(())
    }

    /* --------------------------- sparse upkeep --------------------------- */

    fn update_book_keeping(&mut self, coords_buffer: &[u8]) -> Result<()> {
        match self.schema.coords_type() {
            Datatype::Int32 => self.update_book_keeping_typed::<i32>(coords_buffer),
            Datatype::Int64 => self.update_book_keeping_typed::<i64>(coords_buffer),
            Datatype::Float32 => self.update_book_keeping_typed::<f32>(coords_buffer),
            Datatype::Float64 => self.update_book_keeping_typed::<f64>(coords_buffer),
            _ => Err(StoreError::InvalidArg("bad coordinate type".to_string())),
        }
    }

    fn update_book_keeping_typed<T: Coordinate>(&mut self, coords_buffer: &[u8]) -> Result<()> {
        let dim_num = self.schema.dim_num();
        let coords_size = self.schema.coords_size();
        let cell_num = coords_buffer.len() / coords_size;

        for i in 0..cell_num {
            let cell = &coords_buffer[i * coords_size..(i + 1) * coords_size];
            let coords: Vec<T> = coords_from_bytes(cell);
            if self.coords_tile_cells == 0 {
                // New tile: MBR degenerates to the cell, which also is the
                // first bounding coordinate
                for d in 0..dim_num {
                    coords[d].write_le(&mut self.mbr[2 * d * T::SIZE..]);
                    coords[d].write_le(&mut self.mbr[(2 * d + 1) * T::SIZE..]);
                }
                self.bounding[..coords_size].copy_from_slice(cell);
            } else {
                for d in 0..dim_num {
                    let lo = T::read_le(&self.mbr[2 * d * T::SIZE..]);
                    let hi = T::read_le(&self.mbr[(2 * d + 1) * T::SIZE..]);
                    if coords[d].cmp_coord(lo) == std::cmp::Ordering::Less {
                        coords[d].write_le(&mut self.mbr[2 * d * T::SIZE..]);
                    }
                    if coords[d].cmp_coord(hi) == std::cmp::Ordering::Greater {
                        coords[d].write_le(&mut self.mbr[(2 * d + 1) * T::SIZE..]);
                    }
                }
            }
            self.bounding[coords_size..].copy_from_slice(cell);
            self.coords_tile_cells += 1;

            if self.coords_tile_cells == self.cells_per_tile {
                self.book.append_mbr(&self.mbr);
                self.book.append_bounding_coords(&self.bounding);
                self.coords_tile_cells = 0;
            }
        }
        Ok(())
    }

    /* --------------------------- unsorted sparse -------------------------- */

    fn write_sparse_unsorted(&mut self, buffers: &[&[u8]]) -> Result<()> {
        // Locate the coordinates buffer among the caller's buffers
        let mut coords_buffer_i = None;
        let mut buffer_i = 0;
        for &id in &self.attribute_ids {
            if self.schema.is_coords(id) {
                coords_buffer_i = Some(buffer_i);
                break;
            }
            buffer_i += if self.schema.var_size(id) { 2 } else { 1 };
        }
        let Some(coords_buffer_i) = coords_buffer_i else {
            return Err(StoreError::InvalidArg(
                "unsorted write requires a coordinates buffer".to_string(),
            ));
        };

        let cell_pos = self.sort_cell_pos(buffers[coords_buffer_i])?;

        let mut buffer_i = 0;
        for i in 0..self.attribute_ids.len() {
            let id = self.attribute_ids[i];
            if !self.schema.is_coords(id) && self.schema.var_size(id) {
                self.write_unsorted_attr_var(
                    id,
                    buffers[buffer_i],
                    buffers[buffer_i + 1],
                    &cell_pos,
                )?;
                buffer_i += 2;
            } else {
                self.write_unsorted_attr(id, buffers[buffer_i], &cell_pos)?;
                buffer_i += 1;
            }
        }
        Ok(())
    }

    fn sort_cell_pos(&self, coords_buffer: &[u8]) -> Result<Vec<usize>> {
        match self.schema.coords_type() {
            Datatype::Int32 => self.sort_cell_pos_typed::<i32>(coords_buffer),
            Datatype::Int64 => self.sort_cell_pos_typed::<i64>(coords_buffer),
            Datatype::Float32 => self.sort_cell_pos_typed::<f32>(coords_buffer),
            Datatype::Float64 => self.sort_cell_pos_typed::<f64>(coords_buffer),
            _ => Err(StoreError::InvalidArg("bad coordinate type".to_string())),
        }
    }

    /// Permutation of cell indices sorting the batch into the schema's cell
    /// order. Ties need not be stable.
    fn sort_cell_pos_typed<T: Coordinate>(&self, coords_buffer: &[u8]) -> Result<Vec<usize>> {
        let coords_size = self.schema.coords_size();
        if coords_size == 0 || coords_buffer.len() % coords_size != 0 {
            return Err(StoreError::InvalidArg(
                "coordinates buffer is not a whole number of cells".to_string(),
            ));
        }
        let cell_num = coords_buffer.len() / coords_size;
        let cells: Vec<Vec<T>> = (0..cell_num)
            .map(|i| coords_from_bytes(&coords_buffer[i * coords_size..(i + 1) * coords_size]))
            .collect();

        let mut cell_pos: Vec<usize> = (0..cell_num).collect();
        cell_pos.sort_unstable_by(|&a, &b| self.schema.cell_cmp::<T>(&cells[a], &cells[b]));
        Ok(cell_pos)
    }

    /// Stream a fixed attribute through the bounded scratch buffer in
    /// sorted order, emitting batches to the ordered path.
    fn write_unsorted_attr(
        &mut self,
        attribute_id: usize,
        buffer: &[u8],
        cell_pos: &[usize],
    ) -> Result<()> {
        let cell_size = self.schema.cell_size(attribute_id);
        if buffer.len() / cell_size != cell_pos.len() || buffer.len() % cell_size != 0 {
            return Err(StoreError::InvalidArg(format!(
                "attribute {} holds a different cell count than the coordinates",
                attribute_id
            )));
        }
        let mut sorted = Vec::with_capacity(SORTED_BUFFER_SIZE.min(buffer.len()));
        for &pos in cell_pos {
            if sorted.len() + cell_size > SORTED_BUFFER_SIZE {
                self.write_attr(attribute_id, &sorted)?;
                sorted.clear();
            }
            sorted.extend_from_slice(&buffer[pos * cell_size..(pos + 1) * cell_size]);
        }
        if !sorted.is_empty() {
            self.write_attr(attribute_id, &sorted)?;
        }
        Ok(())
    }

    /// Variable attributes re-derive cell-local offsets per sorted batch;
    /// the ordered path rewrites them file-absolute.
    fn write_unsorted_attr_var(
        &mut self,
        attribute_id: usize,
        buffer: &[u8],
        buffer_var: &[u8],
        cell_pos: &[usize],
    ) -> Result<()> {
        if buffer.len() / VAR_OFFSET_SIZE != cell_pos.len() || buffer.len() % VAR_OFFSET_SIZE != 0
        {
            return Err(StoreError::InvalidArg(format!(
                "attribute {} holds a different cell count than the coordinates",
                attribute_id
            )));
        }
        let cell_num = cell_pos.len();
        let local_offset = |i: usize| {
            u64::from_le_bytes(
                buffer[i * VAR_OFFSET_SIZE..(i + 1) * VAR_OFFSET_SIZE]
                    .try_into()
                    .expect("offset entry"),
            ) as usize
        };
        let value_range = |i: usize| -> Result<(usize, usize)> {
            let start = local_offset(i);
            let end = if i + 1 < cell_num {
                local_offset(i + 1)
            } else {
                buffer_var.len()
            };
            if start > end || end > buffer_var.len() {
                return Err(StoreError::InvalidArg(format!(
                    "offsets of attribute {} are not sorted within the value buffer",
                    attribute_id
                )));
            }
            Ok((start, end))
        };

        let mut sorted = Vec::new();
        let mut sorted_var = Vec::new();
        for &pos in cell_pos {
            let (start, end) = value_range(pos)?;
            let value_len = end - start;
            if !sorted.is_empty()
                && (sorted.len() + VAR_OFFSET_SIZE > SORTED_BUFFER_SIZE
                    || sorted_var.len() + value_len > SORTED_BUFFER_VAR_SIZE)
            {
                self.write_attr_var(attribute_id, &sorted, &sorted_var)?;
                sorted.clear();
                sorted_var.clear();
            }
            sorted.extend_from_slice(&(sorted_var.len() as u64).to_le_bytes());
            sorted_var.extend_from_slice(&buffer_var[start..end]);
        }
        if !sorted.is_empty() {
            self.write_attr_var(attribute_id, &sorted, &sorted_var)?;
        }
        Ok(())
    }

    /* ---------------------------- dense sorted ---------------------------- */

    /// Dense input in row- or column-major subarray order; permute into the
    /// schema's global (tile-by-tile) order and feed the ordered path. The
    /// whole fragment domain must arrive in one call.
    fn write_dense_sorted(&mut self, buffers: &[&[u8]]) -> Result<()> {
        let perm = match self.schema.coords_type() {
            Datatype::Int32 => self.dense_sorted_permutation::<i32>(),
            Datatype::Int64 => self.dense_sorted_permutation::<i64>(),
            _ => {
                return Err(StoreError::InvalidArg(
                    "dense arrays require integer dimensions".to_string(),
                ))
            }
        }?;

        let mut permuted: Vec<Vec<u8>> = Vec::with_capacity(buffers.len());
        let mut buffer_i = 0;
        for &id in &self.attribute_ids {
            if !self.schema.is_coords(id) && self.schema.var_size(id) {
                let buffer = buffers[buffer_i];
                let buffer_var = buffers[buffer_i + 1];
                if buffer.len() / VAR_OFFSET_SIZE != perm.len() {
                    return Err(StoreError::InvalidArg(
                        "sorted dense writes must cover the fragment domain in one call"
                            .to_string(),
                    ));
                }
                let (offsets, values) = permute_var_cells(buffer, buffer_var, &perm)?;
                permuted.push(offsets);
                permuted.push(values);
                buffer_i += 2;
            } else {
                let cell_size = self.schema.cell_size(id);
                let buffer = buffers[buffer_i];
                if buffer.len() / cell_size != perm.len() || buffer.len() % cell_size != 0 {
                    return Err(StoreError::InvalidArg(
                        "sorted dense writes must cover the fragment domain in one call"
                            .to_string(),
                    ));
                }
                let mut out = vec![0u8; buffer.len()];
                for (j, &src) in perm.iter().enumerate() {
                    out[j * cell_size..(j + 1) * cell_size]
                        .copy_from_slice(&buffer[src * cell_size..(src + 1) * cell_size]);
                }
                permuted.push(out);
                buffer_i += 1;
            }
        }
        let views: Vec<&[u8]> = permuted.iter().map(|b| b.as_slice()).collect();
        self.write_ordered(&views)
    }

    /// For each cell in global order, the index of that cell in the
    /// caller's row-/column-major layout of the fragment domain.
    fn dense_sorted_permutation<T: Coordinate>(&self) -> Result<Vec<usize>> {
        let dim_num = self.schema.dim_num();
        let domain: Vec<T> = coords_from_bytes(self.book.non_empty_domain());
        let extents = self
            .schema
            .tile_extents::<T>()
            .ok_or_else(|| StoreError::InvalidArg("dense arrays require tile extents".to_string()))?;

        let mut dims = vec![0u64; dim_num];
        let mut tiles_per_dim = vec![0u64; dim_num];
        let mut extent_cells = vec![0u64; dim_num];
        for d in 0..dim_num {
            dims[d] = domain[2 * d + 1].cell_offset(domain[2 * d]) + 1;
            extent_cells[d] = extents[d].cell_offset(T::default());
            tiles_per_dim[d] = dims[d] / extent_cells[d];
        }
        let total: u64 = dims.iter().product();

        let input_order = if self.mode == Mode::WriteSortedCol {
            Layout::ColMajor
        } else {
            Layout::RowMajor
        };

        let mut perm = Vec::with_capacity(total as usize);
        let mut tile_coords = vec![0u64; dim_num];
        let mut cell_in_tile = vec![0u64; dim_num];
        for tile_linear in 0..tiles_per_dim.iter().product::<u64>() {
            delinearize(tile_linear, &tiles_per_dim, self.schema.tile_order(), &mut tile_coords);
            for cell_linear in 0..extent_cells.iter().product::<u64>() {
                delinearize(
                    cell_linear,
                    &extent_cells,
                    self.schema.cell_order(),
                    &mut cell_in_tile,
                );
                let mut input_index = 0u64;
                match input_order {
                    Layout::ColMajor => {
                        for d in (0..dim_num).rev() {
                            let c = tile_coords[d] * extent_cells[d] + cell_in_tile[d];
                            input_index = input_index * dims[d] + c;
                        }
                    }
                    _ => {
                        for d in 0..dim_num {
                            let c = tile_coords[d] * extent_cells[d] + cell_in_tile[d];
                            input_index = input_index * dims[d] + c;
                        }
                    }
                }
                perm.push(input_index as usize);
            }
        }
        Ok(perm)
    }

    /* ------------------------------ finalize ------------------------------ */

    /// Flush buffered data without committing the fragment
    pub fn sync(&self) -> Result<()> {
        for &id in &self.attribute_ids {
            self.sync_attribute_id(id)?;
        }
        Ok(())
    }

    pub fn sync_attribute(&self, name: &str) -> Result<()> {
        self.sync_attribute_id(self.schema.attribute_id(name)?)
    }

    fn sync_attribute_id(&self, attribute_id: usize) -> Result<()> {
        let path = self.fragment_dir.join(attr_file_name(&self.schema, attribute_id));
        if self.fs.is_file(&path) {
            self.fs.sync(&path)?;
        }
        if !self.schema.is_coords(attribute_id) && self.schema.var_size(attribute_id) {
            let var_path = self
                .fragment_dir
                .join(attr_var_file_name(&self.schema, attribute_id));
            if self.fs.is_file(&var_path) {
                self.fs.sync(&var_path)?;
            }
        }
        Ok(())
    }

    /// Commit the fragment. The sentinel is created last; everything before
    /// it failing leaves an invisible, deletable directory.
    pub fn finalize(mut self) -> Result<()> {
        // Flush the last, possibly short, tile
        if !self.schema.dense() && self.coords_tile_cells != 0 {
            self.book.append_mbr(&self.mbr);
            self.book.append_bounding_coords(&self.bounding);
            self.book.set_last_tile_cell_num(self.coords_tile_cells as i64);
        } else if self.schema.dense() {
            let cell_size = self.schema.cell_size(self.attribute_ids[0]);
            let fill_cells = (self.tiles[self.attribute_ids[0]].len() / cell_size) as i64;
            if fill_cells > 0 {
                self.book.set_last_tile_cell_num(fill_cells);
            }
        }
        for id in 0..self.schema.attribute_num() + 1 {
            if !self.tiles[id].is_empty() {
                if !self.schema.is_coords(id) && self.schema.var_size(id) {
                    self.flush_tile_var(id)?;
                } else {
                    self.flush_tile(id)?;
                }
            }
        }

        // Make attribute data durable before the metadata that points at it
        for &id in &self.attribute_ids.clone() {
            let path = self.fragment_dir.join(attr_file_name(&self.schema, id));
            if self.fs.is_file(&path) {
                self.fs.close(&path)?;
            }
            if !self.schema.is_coords(id) && self.schema.var_size(id) {
                let var_path = self.fragment_dir.join(attr_var_file_name(&self.schema, id));
                if self.fs.is_file(&var_path) {
                    self.fs.close(&var_path)?;
                }
            }
        }

        self.book.save(self.fs.as_ref(), &self.fragment_dir, &self.schema)?;

        // Commit point
        create_marker(self.fs.as_ref(), &self.fragment_dir.join(FRAGMENT_SENTINEL))?;
        self.fs.sync(&self.fragment_dir)?;
        debug!("finalized fragment {}", self.fragment_dir.display());
        Ok(())
    }
}

/// Permute variable cells, rebuilding cell-local offsets
fn permute_var_cells(
    buffer: &[u8],
    buffer_var: &[u8],
    perm: &[usize],
) -> Result<(Vec<u8>, Vec<u8>)> {
    let cell_num = buffer.len() / VAR_OFFSET_SIZE;
    let local_offset = |i: usize| {
        u64::from_le_bytes(
            buffer[i * VAR_OFFSET_SIZE..(i + 1) * VAR_OFFSET_SIZE]
                .try_into()
                .expect("offset entry"),
        ) as usize
    };
    let mut offsets = Vec::with_capacity(buffer.len());
    let mut values = Vec::with_capacity(buffer_var.len());
    for &src in perm {
        let start = local_offset(src);
        let end = if src + 1 < cell_num {
            local_offset(src + 1)
        } else {
            buffer_var.len()
        };
        if start > end || end > buffer_var.len() {
            return Err(StoreError::InvalidArg(
                "offsets are not sorted within the value buffer".to_string(),
            ));
        }
        offsets.extend_from_slice(&(values.len() as u64).to_le_bytes());
        values.extend_from_slice(&buffer_var[start..end]);
    }
    Ok((offsets, values))
}

/// Inverse of `schema::linearize` over a grid
pub(crate) fn delinearize(mut index: u64, dims: &[u64], order: Layout, out: &mut [u64]) {
    match order {
        Layout::ColMajor => {
            for d in 0..dims.len() {
                out[d] = index % dims[d];
                index /= dims[d];
            }
        }
        _ => {
            for d in (0..dims.len()).rev() {
                out[d] = index % dims[d];
                index /= dims[d];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::linearize;

    #[test]
    fn test_delinearize_roundtrip() {
        let dims = [3u64, 4, 5];
        let mut coords = [0u64; 3];
        for order in [Layout::RowMajor, Layout::ColMajor] {
            for i in 0..60 {
                delinearize(i, &dims, order, &mut coords);
                assert_eq!(linearize(&coords, &dims, order), i);
            }
        }
    }

    #[test]
    fn test_permute_var_cells() {
        // Cells "a", "bcd", "" permuted to order [2, 0, 1]
        let mut offsets = Vec::new();
        for off in [0u64, 1, 4] {
            offsets.extend_from_slice(&off.to_le_bytes());
        }
        let (out_offsets, out_values) = permute_var_cells(&offsets, b"abcd", &[2, 0, 1]).unwrap();
        assert_eq!(out_values, b"abcd".to_vec());
        let decoded: Vec<u64> = out_offsets
            .chunks(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(decoded, vec![0, 0, 1]);
    }
}
