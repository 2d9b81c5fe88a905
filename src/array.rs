//! Array facade and storage context
//!
//! A [`Context`] owns the filesystem backend and hands out [`Array`]
//! handles. Opening an array in a write mode starts a new fragment; opening
//! it for reading captures a snapshot of the fragments committed at that
//! moment and merges them on demand.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use log::debug;

use crate::array_read_state::ArrayReadState;
use crate::config::StorageConfig;
use crate::error::{clear_last_error, record, Result, StoreError};
use crate::fragment::{list_fragments, new_fragment_name, unique_timestamp};
use crate::fs::{backend_for, StorageBackend, FILE_MODE};
use crate::read_state::ReadState;
use crate::schema::{
    cell_in_subarray, coords_from_bytes, coords_to_bytes, ArraySchema, Coordinate, Datatype,
    Layout, ARRAY_SCHEMA_FILE,
};
use crate::write_state::WriteState;

/// Marks a directory as an array
pub const ARRAY_SENTINEL: &str = "__array";

/// How an array is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Write cells in the schema's global (tile-by-tile) order
    Write,
    /// Write cells laid out column-major over the write subarray
    WriteSortedCol,
    /// Write cells laid out row-major over the write subarray
    WriteSortedRow,
    /// Write sparse cells in arbitrary order (engine sorts)
    WriteUnsorted,
    /// Read in the schema's global order
    Read,
    /// Read column-major (honored when it equals the global order)
    ReadSortedCol,
    /// Read row-major (honored when it equals the global order)
    ReadSortedRow,
}

impl Mode {
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Mode::Write | Mode::WriteSortedCol | Mode::WriteSortedRow | Mode::WriteUnsorted
        )
    }

    pub fn is_read(self) -> bool {
        !self.is_write()
    }
}

/// Storage context: configuration plus the backend it selected
pub struct Context {
    config: StorageConfig,
    fs: Arc<dyn StorageBackend>,
    timestamp_counter: Arc<AtomicU64>,
}

impl Context {
    /// Initialize a context. MPI-IO methods are recognized but this build
    /// carries no MPI runtime.
    pub fn init(config: StorageConfig) -> Result<Self> {
        clear_last_error();
        if config.needs_mpi() {
            return Err(record(StoreError::Unsupported(
                "this build does not link an MPI runtime".to_string(),
            )));
        }
        let fs: Arc<dyn StorageBackend> = Arc::from(backend_for(&config).map_err(record)?);
        Ok(Self {
            config,
            fs,
            timestamp_counter: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Release the context (open arrays keep their backend alive)
    pub fn close(self) {}

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Resolve a caller path against the configured home
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        let home = self.config.home.trim_start_matches("file://");
        if home.is_empty() {
            self.fs.canonicalize(path)
        } else {
            self.fs.canonicalize(&Path::new(home).join(path))
        }
    }

    /// Create a workspace directory
    pub fn workspace_create(&self, path: impl AsRef<Path>) -> Result<()> {
        clear_last_error();
        let path = self.resolve(path)?;
        crate::utils::workspace_create(self.fs.as_ref(), &path).map_err(record)
    }

    /// Create a group directory under a workspace or group
    pub fn group_create(&self, path: impl AsRef<Path>) -> Result<()> {
        clear_last_error();
        let path = self.resolve(path)?;
        crate::utils::group_create(self.fs.as_ref(), &path).map_err(record)
    }

    /// Create an array: its directory, serialized schema and sentinel
    pub fn array_create(&self, path: impl AsRef<Path>, schema: &ArraySchema) -> Result<()> {
        clear_last_error();
        self.array_create_inner(path.as_ref(), schema).map_err(record)
    }

    fn array_create_inner(&self, path: &Path, schema: &ArraySchema) -> Result<()> {
        let dir = self.resolve(path)?;
        if crate::utils::is_array(self.fs.as_ref(), &dir) {
            return Err(StoreError::AlreadyExists(dir.display().to_string()));
        }
        if !self.fs.is_dir(&dir) {
            self.fs.create_dir(&dir)?;
        }
        let schema_path = dir.join(ARRAY_SCHEMA_FILE);
        self.fs.write(&schema_path, &schema.to_bytes()?)?;
        self.fs.close(&schema_path)?;
        self.fs.create_file(&dir.join(ARRAY_SENTINEL), FILE_MODE)?;
        self.fs.sync(&dir)?;
        debug!("created array {}", dir.display());
        Ok(())
    }

    /// Load the schema of an existing array
    pub fn array_load_schema(&self, path: impl AsRef<Path>) -> Result<ArraySchema> {
        clear_last_error();
        self.array_load_schema_inner(path.as_ref()).map_err(record)
    }

    fn array_load_schema_inner(&self, path: &Path) -> Result<ArraySchema> {
        let dir = self.resolve(path)?;
        if !crate::utils::is_array(self.fs.as_ref(), &dir) {
            return Err(StoreError::NotFound(format!(
                "{} is not an array",
                dir.display()
            )));
        }
        let schema_path = dir.join(ARRAY_SCHEMA_FILE);
        let size = self.fs.file_size(&schema_path)?;
        let mut bytes = vec![0u8; size as usize];
        self.fs.read(&schema_path, 0, &mut bytes)?;
        ArraySchema::from_bytes(&bytes)
    }

    /// Open an array.
    ///
    /// `subarray` is the query window (`None` = whole domain) as
    /// little-endian coordinate pairs; `attributes` selects and orders the
    /// attributes (`None` = all, plus coordinates for sparse reads).
    pub fn array_init(
        &self,
        path: impl AsRef<Path>,
        mode: Mode,
        subarray: Option<&[u8]>,
        attributes: Option<&[&str]>,
    ) -> Result<Array> {
        clear_last_error();
        self.array_init_inner(path.as_ref(), mode, subarray, attributes)
            .map_err(record)
    }

    fn array_init_inner(
        &self,
        path: &Path,
        mode: Mode,
        subarray: Option<&[u8]>,
        attributes: Option<&[&str]>,
    ) -> Result<Array> {
        let dir = self.resolve(path)?;
        let schema = Arc::new(self.array_load_schema_inner(path)?);

        let subarray = match subarray {
            Some(bytes) => {
                if bytes.len() != schema.domain_bytes().len() {
                    return Err(StoreError::InvalidArg(
                        "subarray does not match the domain type".to_string(),
                    ));
                }
                bytes.to_vec()
            }
            None => schema.domain_bytes().to_vec(),
        };
        validate_subarray(&schema, &subarray)?;

        let attribute_ids = resolve_attributes(&schema, mode, attributes)?;

        if mode.is_write() {
            let fragment_domain = if schema.dense() {
                // Dense fragments cover whole tiles; the write window grows
                // to the enclosing tile boundaries and the caller supplies
                // cells for the expanded region.
                expand_dense_write_domain(&schema, &subarray)?
            } else {
                subarray.clone()
            };
            let timestamp = unique_timestamp(&self.timestamp_counter);
            let fragment_dir = dir.join(new_fragment_name(timestamp));
            let write_state = WriteState::new(
                schema.clone(),
                self.fs.clone(),
                fragment_dir,
                mode,
                attribute_ids.clone(),
                Some(fragment_domain),
            )?;
            Ok(Array {
                schema,
                fs: self.fs.clone(),
                dir,
                mode,
                attribute_ids,
                subarray,
                state: ArrayState::Write(Box::new(write_state)),
            })
        } else {
            validate_sorted_read(&schema, mode, &subarray)?;
            let fragments = self.open_fragments(&schema, &dir)?;
            let state = TypedReadState::new(
                schema.clone(),
                fragments,
                &subarray,
                attribute_ids.clone(),
            )?;
            Ok(Array {
                schema,
                fs: self.fs.clone(),
                dir,
                mode,
                attribute_ids,
                subarray,
                state: ArrayState::Read(state),
            })
        }
    }

    fn open_fragments(&self, schema: &Arc<ArraySchema>, dir: &Path) -> Result<Vec<ReadState>> {
        let mut fragments = Vec::new();
        for fragment_dir in list_fragments(self.fs.as_ref(), dir)? {
            fragments.push(ReadState::open(
                schema.clone(),
                self.fs.clone(),
                fragment_dir,
                self.config.tile_cache_bytes,
                self.config.tile_cache_var_bytes,
            )?);
        }
        Ok(fragments)
    }

    /// Merge every committed fragment into one and delete the originals.
    /// A no-op for readers: the new fragment subsumes the old ones.
    pub fn array_consolidate(&self, path: impl AsRef<Path>) -> Result<()> {
        clear_last_error();
        self.array_consolidate_inner(path.as_ref()).map_err(record)
    }

    fn array_consolidate_inner(&self, path: &Path) -> Result<()> {
        if !self.fs.supports_consolidation() {
            return Err(StoreError::Unsupported(
                "the configured backend does not support consolidation".to_string(),
            ));
        }
        let dir = self.resolve(path)?;
        let old_fragments = list_fragments(self.fs.as_ref(), &dir)?;
        if old_fragments.len() <= 1 {
            return Ok(());
        }
        debug!(
            "consolidating {} fragments of {}",
            old_fragments.len(),
            dir.display()
        );

        let mut reader = self.array_init_inner(path, Mode::Read, None, None)?;
        let mut writer = self.array_init_inner(path, Mode::Write, None, None)?;

        // Stream through bounded buffers; overflow drives the loop
        const BUFFER_BYTES: usize = 10 * 1024 * 1024;
        let buffer_num = reader.buffer_num();
        let mut buffers: Vec<Vec<u8>> = (0..buffer_num).map(|_| vec![0u8; BUFFER_BYTES]).collect();
        loop {
            let mut sizes: Vec<usize> = vec![BUFFER_BYTES; buffer_num];
            {
                let mut views: Vec<&mut [u8]> =
                    buffers.iter_mut().map(|b| b.as_mut_slice()).collect();
                reader.read(&mut views, &mut sizes)?;
            }
            if sizes.iter().all(|&s| s == 0) {
                break;
            }
            let views: Vec<&[u8]> = buffers
                .iter()
                .zip(sizes.iter())
                .map(|(b, &s)| &b[..s])
                .collect();
            writer.write(&views)?;
            if !reader.any_overflow() {
                break;
            }
        }
        writer.finalize()?;
        reader.finalize()?;

        for fragment_dir in old_fragments {
            self.fs.delete_dir(&fragment_dir)?;
        }
        self.fs.sync(&dir)?;
        Ok(())
    }

    /* -------------------------- directory helpers ------------------------- */

    pub fn ls(&self, path: impl AsRef<Path>) -> Result<Vec<(PathBuf, crate::utils::ObjectType)>> {
        clear_last_error();
        let dir = self.resolve(path)?;
        crate::utils::ls(self.fs.as_ref(), &dir).map_err(record)
    }

    pub fn ls_workspaces(&self, path: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        clear_last_error();
        let dir = self.resolve(path)?;
        crate::utils::ls_workspaces(self.fs.as_ref(), &dir).map_err(record)
    }

    /// Empty an object, keeping the object itself
    pub fn clear(&self, path: impl AsRef<Path>) -> Result<()> {
        clear_last_error();
        let dir = self.resolve(path)?;
        crate::utils::clear(self.fs.as_ref(), &dir).map_err(record)
    }

    /// Delete an object entirely
    pub fn delete(&self, path: impl AsRef<Path>) -> Result<()> {
        clear_last_error();
        let dir = self.resolve(path)?;
        crate::utils::delete(self.fs.as_ref(), &dir).map_err(record)
    }

    /// Rename an object
    pub fn move_path(&self, old_path: impl AsRef<Path>, new_path: impl AsRef<Path>) -> Result<()> {
        clear_last_error();
        let old_dir = self.resolve(old_path)?;
        let new_dir = self.resolve(new_path)?;
        crate::utils::move_object(self.fs.as_ref(), &old_dir, &new_dir).map_err(record)
    }
}

/// Per-coordinate-type read state, dispatched once at open
enum TypedReadState {
    I32(ArrayReadState<i32>),
    I64(ArrayReadState<i64>),
    F32(ArrayReadState<f32>),
    F64(ArrayReadState<f64>),
}

macro_rules! dispatch_read {
    ($self:expr, $state:ident => $body:expr) => {
        match $self {
            TypedReadState::I32($state) => $body,
            TypedReadState::I64($state) => $body,
            TypedReadState::F32($state) => $body,
            TypedReadState::F64($state) => $body,
        }
    };
}

impl TypedReadState {
    fn new(
        schema: Arc<ArraySchema>,
        fragments: Vec<ReadState>,
        subarray: &[u8],
        attribute_ids: Vec<usize>,
    ) -> Result<Self> {
        Ok(match schema.coords_type() {
            Datatype::Int32 => TypedReadState::I32(ArrayReadState::new(
                schema.clone(),
                fragments,
                coords_from_bytes(subarray),
                attribute_ids,
            )?),
            Datatype::Int64 => TypedReadState::I64(ArrayReadState::new(
                schema.clone(),
                fragments,
                coords_from_bytes(subarray),
                attribute_ids,
            )?),
            Datatype::Float32 => TypedReadState::F32(ArrayReadState::new(
                schema.clone(),
                fragments,
                coords_from_bytes(subarray),
                attribute_ids,
            )?),
            Datatype::Float64 => TypedReadState::F64(ArrayReadState::new(
                schema.clone(),
                fragments,
                coords_from_bytes(subarray),
                attribute_ids,
            )?),
            _ => return Err(StoreError::InvalidArg("bad coordinate type".to_string())),
        })
    }

    fn read(
        &mut self,
        buffers: &mut [&mut [u8]],
        buffer_sizes: &mut [usize],
        skip_counts: Option<&[u64]>,
    ) -> Result<()> {
        dispatch_read!(self, state => state.read(buffers, buffer_sizes, skip_counts))
    }

    fn overflow(&self, attribute_id: usize) -> bool {
        dispatch_read!(self, state => state.overflow(attribute_id))
    }

    fn any_overflow(&self) -> bool {
        dispatch_read!(self, state => state.any_overflow())
    }

    fn into_fragments(self) -> Vec<ReadState> {
        dispatch_read!(self, state => state.into_fragments())
    }
}

enum ArrayState {
    Write(Box<WriteState>),
    Read(TypedReadState),
    /// Transient placeholder while a read state is being rebuilt
    Resetting,
}

/// An open array handle
pub struct Array {
    schema: Arc<ArraySchema>,
    fs: Arc<dyn StorageBackend>,
    dir: PathBuf,
    mode: Mode,
    attribute_ids: Vec<usize>,
    subarray: Vec<u8>,
    state: ArrayState,
}

impl Array {
    pub fn schema(&self) -> &ArraySchema {
        &self.schema
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Number of caller buffers read/write expects
    pub fn buffer_num(&self) -> usize {
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

    /// Write one batch of cells (write modes only)
    pub fn write(&mut self, buffers: &[&[u8]]) -> Result<()> {
        clear_last_error();
        match &mut self.state {
            ArrayState::Write(ws) => ws.write(buffers).map_err(record),
            ArrayState::Read(_) => Err(record(StoreError::InvalidArg(
                "array is open for reading".to_string(),
            ))),
            ArrayState::Resetting => Err(record(defunct())),
        }
    }

    /// Read the next results into caller buffers (read modes only).
    /// `buffer_sizes` is in-out: capacities in, bytes produced out.
    pub fn read(&mut self, buffers: &mut [&mut [u8]], buffer_sizes: &mut [usize]) -> Result<()> {
        clear_last_error();
        match &mut self.state {
            ArrayState::Read(rs) => rs.read(buffers, buffer_sizes, None).map_err(record),
            ArrayState::Write(_) => Err(record(StoreError::InvalidArg(
                "array is open for writing".to_string(),
            ))),
            ArrayState::Resetting => Err(record(defunct())),
        }
    }

    /// Like `read`, skipping `skip_counts[i]` cells of each attribute first
    pub fn skip_and_read(
        &mut self,
        buffers: &mut [&mut [u8]],
        buffer_sizes: &mut [usize],
        skip_counts: &[u64],
    ) -> Result<()> {
        clear_last_error();
        if skip_counts.len() != self.attribute_ids.len() {
            return Err(record(StoreError::InvalidArg(format!(
                "expected {} skip counts, got {}",
                self.attribute_ids.len(),
                skip_counts.len()
            ))));
        }
        match &mut self.state {
            ArrayState::Read(rs) => rs
                .read(buffers, buffer_sizes, Some(skip_counts))
                .map_err(record),
            ArrayState::Write(_) => Err(record(StoreError::InvalidArg(
                "array is open for writing".to_string(),
            ))),
            ArrayState::Resetting => Err(record(defunct())),
        }
    }

    /// Whether the last read overflowed for an attribute
    pub fn overflow(&self, attribute: &str) -> Result<bool> {
        let id = self.schema.attribute_id(attribute)?;
        match &self.state {
            ArrayState::Read(rs) => Ok(rs.overflow(id)),
            _ => Ok(false),
        }
    }

    pub fn any_overflow(&self) -> bool {
        match &self.state {
            ArrayState::Read(rs) => rs.any_overflow(),
            _ => false,
        }
    }

    /// Re-target the open read at a new subarray, keeping tile caches warm
    pub fn reset_subarray(&mut self, subarray: Option<&[u8]>) -> Result<()> {
        clear_last_error();
        let subarray = match subarray {
            Some(bytes) => bytes.to_vec(),
            None => self.schema.domain_bytes().to_vec(),
        };
        validate_subarray(&self.schema, &subarray).map_err(record)?;
        match std::mem::replace(&mut self.state, ArrayState::Resetting) {
            ArrayState::Read(rs) => {
                let fragments = rs.into_fragments();
                self.state = ArrayState::Read(
                    TypedReadState::new(
                        self.schema.clone(),
                        fragments,
                        &subarray,
                        self.attribute_ids.clone(),
                    )
                    .map_err(record)?,
                );
                self.subarray = subarray;
                Ok(())
            }
            other => {
                self.state = other;
                Err(record(StoreError::InvalidArg(
                    "subarray reset applies to open reads".to_string(),
                )))
            }
        }
    }

    /// Re-target the open read at a new attribute selection
    pub fn reset_attributes(&mut self, attributes: Option<&[&str]>) -> Result<()> {
        clear_last_error();
        let attribute_ids =
            resolve_attributes(&self.schema, self.mode, attributes).map_err(record)?;
        match std::mem::replace(&mut self.state, ArrayState::Resetting) {
            ArrayState::Read(rs) => {
                let fragments = rs.into_fragments();
                self.state = ArrayState::Read(
                    TypedReadState::new(
                        self.schema.clone(),
                        fragments,
                        &self.subarray,
                        attribute_ids.clone(),
                    )
                    .map_err(record)?,
                );
                self.attribute_ids = attribute_ids;
                Ok(())
            }
            other => {
                self.state = other;
                Err(record(StoreError::InvalidArg(
                    "attribute reset applies to open reads".to_string(),
                )))
            }
        }
    }

    /// Flush written data to the medium without committing
    pub fn sync(&self) -> Result<()> {
        clear_last_error();
        match &self.state {
            ArrayState::Write(ws) => ws.sync().map_err(record),
            _ => Ok(()),
        }
    }

    pub fn sync_attribute(&self, attribute: &str) -> Result<()> {
        clear_last_error();
        match &self.state {
            ArrayState::Write(ws) => ws.sync_attribute(attribute).map_err(record),
            _ => Ok(()),
        }
    }

    /// Close the handle; commits the fragment for write modes
    pub fn finalize(self) -> Result<()> {
        clear_last_error();
        match self.state {
            ArrayState::Write(ws) => ws.finalize().map_err(record),
            _ => Ok(()),
        }
    }

    /// Abandon an open write, deleting its uncommitted fragment directory
    pub fn discard(self) -> Result<()> {
        clear_last_error();
        match self.state {
            ArrayState::Write(ws) => {
                let dir = ws.fragment_dir().clone();
                drop(ws);
                self.fs.delete_dir(&dir).map_err(record)
            }
            _ => Ok(()),
        }
    }
}

fn defunct() -> StoreError {
    StoreError::InvalidArg("array handle is defunct after a failed reset".to_string())
}

/// Requested attributes resolved to ids; `None` means all, with the
/// coordinates appended for sparse access.
fn resolve_attributes(
    schema: &ArraySchema,
    mode: Mode,
    attributes: Option<&[&str]>,
) -> Result<Vec<usize>> {
    let mut ids = match attributes {
        Some(names) => {
            let mut ids = Vec::with_capacity(names.len());
            for name in names {
                ids.push(schema.attribute_id(name)?);
            }
            ids
        }
        None => {
            let mut ids: Vec<usize> = (0..schema.attribute_num()).collect();
            if !schema.dense() {
                ids.push(schema.coords_id());
            }
            ids
        }
    };
    let mut seen = ids.clone();
    seen.sort_unstable();
    if seen.windows(2).any(|w| w[0] == w[1]) {
        return Err(StoreError::InvalidArg(
            "duplicate attribute in selection".to_string(),
        ));
    }
    // Sparse writes must carry coordinates to maintain the bookkeeping
    if !schema.dense() && mode.is_write() && !ids.contains(&schema.coords_id()) {
        ids.push(schema.coords_id());
    }
    if schema.dense() && ids.contains(&schema.coords_id()) {
        return Err(StoreError::InvalidArg(
            "dense arrays carry no coordinates attribute".to_string(),
        ));
    }
    Ok(ids)
}

fn validate_subarray(schema: &ArraySchema, subarray: &[u8]) -> Result<()> {
    match schema.coords_type() {
        Datatype::Int32 => validate_subarray_typed::<i32>(schema, subarray),
        Datatype::Int64 => validate_subarray_typed::<i64>(schema, subarray),
        Datatype::Float32 => validate_subarray_typed::<f32>(schema, subarray),
        Datatype::Float64 => validate_subarray_typed::<f64>(schema, subarray),
        _ => Err(StoreError::InvalidArg("bad coordinate type".to_string())),
    }
}

fn validate_subarray_typed<T: Coordinate>(schema: &ArraySchema, subarray: &[u8]) -> Result<()> {
    let sub: Vec<T> = coords_from_bytes(subarray);
    let domain: Vec<T> = schema.domain::<T>();
    let dim_num = schema.dim_num();
    for d in 0..dim_num {
        if sub[2 * d].cmp_coord(sub[2 * d + 1]) == std::cmp::Ordering::Greater {
            return Err(StoreError::InvalidArg(format!(
                "subarray is inverted in dimension {}",
                d
            )));
        }
    }
    let lo: Vec<T> = (0..dim_num).map(|d| sub[2 * d]).collect();
    let hi: Vec<T> = (0..dim_num).map(|d| sub[2 * d + 1]).collect();
    if !cell_in_subarray(&lo, &domain) || !cell_in_subarray(&hi, &domain) {
        return Err(StoreError::InvalidArg(
            "subarray exceeds the array domain".to_string(),
        ));
    }
    Ok(())
}

/// Dense fragments cover whole tiles: grow the write window to the
/// enclosing tile boundaries
fn expand_dense_write_domain(schema: &ArraySchema, subarray: &[u8]) -> Result<Vec<u8>> {
    match schema.coords_type() {
        Datatype::Int32 => {
            let mut sub: Vec<i32> = coords_from_bytes(subarray);
            schema.expand_domain(&mut sub);
            Ok(coords_to_bytes(&sub))
        }
        Datatype::Int64 => {
            let mut sub: Vec<i64> = coords_from_bytes(subarray);
            schema.expand_domain(&mut sub);
            Ok(coords_to_bytes(&sub))
        }
        _ => Err(StoreError::InvalidArg(
            "dense arrays require integer dimensions".to_string(),
        )),
    }
}

/// Sorted reads are honored when they coincide with the global order
fn validate_sorted_read(schema: &ArraySchema, mode: Mode, subarray: &[u8]) -> Result<()> {
    let requested = match mode {
        Mode::ReadSortedRow => Layout::RowMajor,
        Mode::ReadSortedCol => Layout::ColMajor,
        _ => return Ok(()),
    };
    if schema.cell_order() != requested {
        return Err(StoreError::Unsupported(
            "sorted read does not match the array cell order".to_string(),
        ));
    }
    if schema.has_tile_grid() && !subarray_within_one_tile(schema, subarray)? {
        return Err(StoreError::Unsupported(
            "sorted read across tile boundaries".to_string(),
        ));
    }
    Ok(())
}

fn subarray_within_one_tile(schema: &ArraySchema, subarray: &[u8]) -> Result<bool> {
    Ok(match schema.coords_type() {
        Datatype::Int32 => {
            let sub: Vec<i32> = coords_from_bytes(subarray);
            one_tile_typed(schema, &sub)
        }
        Datatype::Int64 => {
            let sub: Vec<i64> = coords_from_bytes(subarray);
            one_tile_typed(schema, &sub)
        }
        Datatype::Float32 => {
            let sub: Vec<f32> = coords_from_bytes(subarray);
            one_tile_typed(schema, &sub)
        }
        Datatype::Float64 => {
            let sub: Vec<f64> = coords_from_bytes(subarray);
            one_tile_typed(schema, &sub)
        }
        _ => false,
    })
}

fn one_tile_typed<T: Coordinate>(schema: &ArraySchema, sub: &[T]) -> bool {
    let domain = schema.domain::<T>();
    let Some(extents) = schema.tile_extents::<T>() else {
        return true;
    };
    (0..schema.dim_num()).all(|d| {
        sub[2 * d].tile_index(domain[2 * d], extents[d])
            == sub[2 * d + 1].tile_index(domain[2 * d], extents[d])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use crate::schema::{coords_to_bytes, Attribute};
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> Context {
        Context::init(StorageConfig::new(dir.path().display().to_string())).unwrap()
    }

    fn i32_bytes(values: &[i32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn i32_values(bytes: &[u8]) -> Vec<i32> {
        bytes
            .chunks(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    fn u64_values(bytes: &[u8]) -> Vec<u64> {
        bytes
            .chunks(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    fn dense_4x4_schema(codec: Codec) -> ArraySchema {
        ArraySchema::new(
            true,
            vec!["d0".to_string(), "d1".to_string()],
            Datatype::Int32,
            coords_to_bytes(&[0i32, 3, 0, 3]),
            Some(coords_to_bytes(&[2i32, 2])),
            Layout::RowMajor,
            Layout::RowMajor,
            0,
            vec![Attribute::new("a1", Datatype::Int32).with_codec(codec, -1)],
        )
        .unwrap()
    }

    fn read_all_i32(array: &mut Array, cells: usize) -> Vec<i32> {
        let mut buffer = vec![0u8; cells * 4];
        let mut sizes = vec![buffer.len()];
        {
            let mut views: Vec<&mut [u8]> = vec![buffer.as_mut_slice()];
            array.read(&mut views, &mut sizes).unwrap();
        }
        i32_values(&buffer[..sizes[0]])
    }

    #[test]
    fn test_dense_subarray_read() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.array_create("a", &dense_4x4_schema(Codec::None)).unwrap();

        let mut array = ctx
            .array_init("a", Mode::WriteSortedRow, None, None)
            .unwrap();
        let values = i32_bytes(&(0..16).collect::<Vec<i32>>());
        array.write(&[values.as_slice()]).unwrap();
        array.finalize().unwrap();

        let subarray = coords_to_bytes(&[1i32, 2, 1, 2]);
        let mut array = ctx
            .array_init("a", Mode::Read, Some(&subarray), None)
            .unwrap();
        assert_eq!(read_all_i32(&mut array, 4), vec![5, 6, 9, 10]);
        assert!(!array.overflow("a1").unwrap());
    }

    #[test]
    fn test_dense_gzip_tiles_match_bookkeeping() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let schema = dense_4x4_schema(Codec::Gzip);
        ctx.array_create("a", &schema).unwrap();

        let mut array = ctx
            .array_init("a", Mode::WriteSortedRow, None, None)
            .unwrap();
        let values = i32_bytes(&(0..16).collect::<Vec<i32>>());
        array.write(&[values.as_slice()]).unwrap();
        array.finalize().unwrap();

        let mut array = ctx.array_init("a", Mode::Read, None, None).unwrap();
        assert_eq!(read_all_i32(&mut array, 16), (0..16).collect::<Vec<i32>>());

        // Four independently decompressable tiles at the recorded offsets
        let fs = crate::fs::PosixFs::new(crate::config::ReadMethod::ReadIo);
        let fragment_dir = crate::fragment::list_fragments(&fs, &ctx.resolve("a").unwrap())
            .unwrap()
            .pop()
            .unwrap();
        let book =
            crate::bookkeeping::Bookkeeping::load(&fs, &fragment_dir, &schema, true).unwrap();
        assert_eq!(book.tile_count(0), 4);

        let data_path = fragment_dir.join("a1.tdb");
        let file_size = fs.file_size(&data_path).unwrap();
        let expected_tiles: [[i32; 4]; 4] =
            [[0, 1, 4, 5], [2, 3, 6, 7], [8, 9, 12, 13], [10, 11, 14, 15]];
        for (pos, expected) in expected_tiles.iter().enumerate() {
            let (start, end) = book.tile_byte_range(0, pos, file_size);
            let mut compressed = vec![0u8; (end - start) as usize];
            fs.read(&data_path, start, &mut compressed).unwrap();
            let mut raw = vec![0u8; 16];
            crate::codec::decompress(
                Codec::Gzip,
                schema.codec_ctx(0),
                &compressed,
                &mut raw,
            )
            .unwrap();
            assert_eq!(i32_values(&raw), expected.to_vec());
        }
    }

    #[test]
    fn test_sparse_unsorted_write() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let schema = ArraySchema::new(
            false,
            vec!["x".to_string(), "y".to_string()],
            Datatype::Int32,
            coords_to_bytes(&[0i32, 99, 0, 99]),
            None,
            Layout::RowMajor,
            Layout::RowMajor,
            4,
            vec![Attribute::new("v", Datatype::Int32)],
        )
        .unwrap();
        ctx.array_create("s", &schema).unwrap();

        let mut array = ctx
            .array_init("s", Mode::WriteUnsorted, None, None)
            .unwrap();
        let coords = coords_to_bytes(&[5i32, 5, 0, 0, 5, 4, 0, 1]);
        let values = i32_bytes(&[50, 0, 40, 1]);
        array.write(&[values.as_slice(), coords.as_slice()]).unwrap();
        array.finalize().unwrap();

        let mut array = ctx.array_init("s", Mode::Read, None, None).unwrap();
        let mut value_buf = vec![0u8; 64];
        let mut coords_buf = vec![0u8; 128];
        let mut sizes = vec![value_buf.len(), coords_buf.len()];
        {
            let mut views: Vec<&mut [u8]> =
                vec![value_buf.as_mut_slice(), coords_buf.as_mut_slice()];
            array.read(&mut views, &mut sizes).unwrap();
        }
        assert_eq!(i32_values(&value_buf[..sizes[0]]), vec![0, 1, 40, 50]);
        assert_eq!(
            i32_values(&coords_buf[..sizes[1]]),
            vec![0, 0, 0, 1, 5, 4, 5, 5]
        );

        let fs = crate::fs::PosixFs::new(crate::config::ReadMethod::ReadIo);
        let fragment_dir = crate::fragment::list_fragments(&fs, &ctx.resolve("s").unwrap())
            .unwrap()
            .pop()
            .unwrap();
        let book =
            crate::bookkeeping::Bookkeeping::load(&fs, &fragment_dir, &schema, false).unwrap();
        assert_eq!(book.sparse_tile_num(), 1);
        assert_eq!(book.last_tile_cell_num(), 4);
        assert_eq!(book.mbr(0), &coords_to_bytes(&[0i32, 5, 0, 5])[..]);
    }

    #[test]
    fn test_dense_overwrite_and_fragment_removal() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let schema = ArraySchema::new(
            true,
            vec!["d0".to_string(), "d1".to_string()],
            Datatype::Int32,
            coords_to_bytes(&[0i32, 1, 0, 1]),
            Some(coords_to_bytes(&[1i32, 2])),
            Layout::RowMajor,
            Layout::RowMajor,
            0,
            vec![Attribute::new("a1", Datatype::Int32)],
        )
        .unwrap();
        ctx.array_create("o", &schema).unwrap();

        for values in [[1, 2, 3, 4], [9, 9, 9, 9]] {
            let mut array = ctx
                .array_init("o", Mode::WriteSortedRow, None, None)
                .unwrap();
            let bytes = i32_bytes(&values);
            array.write(&[bytes.as_slice()]).unwrap();
            array.finalize().unwrap();
        }

        let mut array = ctx.array_init("o", Mode::Read, None, None).unwrap();
        assert_eq!(read_all_i32(&mut array, 4), vec![9, 9, 9, 9]);
        drop(array);

        // Removing the newest fragment out-of-band exposes the older one
        let fs = crate::fs::PosixFs::new(crate::config::ReadMethod::ReadIo);
        let newest = crate::fragment::list_fragments(&fs, &ctx.resolve("o").unwrap())
            .unwrap()
            .pop()
            .unwrap();
        fs.delete_dir(&newest).unwrap();

        let mut array = ctx.array_init("o", Mode::Read, None, None).unwrap();
        assert_eq!(read_all_i32(&mut array, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_overflow_resume() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let schema = ArraySchema::new(
            true,
            vec!["d0".to_string(), "d1".to_string()],
            Datatype::Int32,
            coords_to_bytes(&[0i32, 0, 0, 999]),
            Some(coords_to_bytes(&[1i32, 1000])),
            Layout::RowMajor,
            Layout::RowMajor,
            0,
            vec![Attribute::new("a1", Datatype::Int32)],
        )
        .unwrap();
        ctx.array_create("big", &schema).unwrap();

        let mut array = ctx
            .array_init("big", Mode::WriteSortedRow, None, None)
            .unwrap();
        let values = i32_bytes(&(0..1000).collect::<Vec<i32>>());
        array.write(&[values.as_slice()]).unwrap();
        array.finalize().unwrap();

        let mut array = ctx.array_init("big", Mode::Read, None, None).unwrap();
        let mut collected = Vec::new();
        for call in 0..10 {
            let mut buffer = vec![0u8; 400];
            let mut sizes = vec![400];
            {
                let mut views: Vec<&mut [u8]> = vec![buffer.as_mut_slice()];
                array.read(&mut views, &mut sizes).unwrap();
            }
            assert_eq!(sizes[0], 400);
            collected.extend(i32_values(&buffer));
            let overflowed = array.overflow("a1").unwrap();
            assert_eq!(overflowed, call != 9, "call {}", call);
        }
        assert_eq!(collected, (0..1000).collect::<Vec<i32>>());
    }

    #[test]
    fn test_var_length_roundtrip() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let schema = ArraySchema::new(
            false,
            vec!["x".to_string()],
            Datatype::Int64,
            coords_to_bytes(&[0i64, 9]),
            None,
            Layout::RowMajor,
            Layout::RowMajor,
            4,
            vec![Attribute::new("s", Datatype::Char).var_sized()],
        )
        .unwrap();
        ctx.array_create("v", &schema).unwrap();

        let mut array = ctx.array_init("v", Mode::Write, None, None).unwrap();
        let offsets: Vec<u8> = [0u64, 1, 4].iter().flat_map(|v| v.to_le_bytes()).collect();
        let values = b"abcd".to_vec();
        let coords = coords_to_bytes(&[0i64, 3, 7]);
        array
            .write(&[offsets.as_slice(), values.as_slice(), coords.as_slice()])
            .unwrap();
        array.finalize().unwrap();

        let mut array = ctx.array_init("v", Mode::Read, None, None).unwrap();
        let mut offsets_buf = vec![0u8; 64];
        let mut values_buf = vec![0u8; 64];
        let mut coords_buf = vec![0u8; 64];
        let mut sizes = vec![64, 64, 64];
        {
            let mut views: Vec<&mut [u8]> = vec![
                offsets_buf.as_mut_slice(),
                values_buf.as_mut_slice(),
                coords_buf.as_mut_slice(),
            ];
            array.read(&mut views, &mut sizes).unwrap();
        }
        assert_eq!(u64_values(&offsets_buf[..sizes[0]]), vec![0, 1, 4]);
        assert_eq!(&values_buf[..sizes[1]], b"abcd");

        // Files on disk: 4 raw value bytes, three absolute 8-byte offsets
        let fs = crate::fs::PosixFs::new(crate::config::ReadMethod::ReadIo);
        let fragment_dir = crate::fragment::list_fragments(&fs, &ctx.resolve("v").unwrap())
            .unwrap()
            .pop()
            .unwrap();
        assert_eq!(fs.file_size(&fragment_dir.join("s_var.tdb")).unwrap(), 4);
        let mut raw = vec![0u8; 24];
        fs.read(&fragment_dir.join("s.tdb"), 0, &mut raw).unwrap();
        assert_eq!(u64_values(&raw), vec![0, 1, 4]);

        // The last tile is shorter than the capacity and says so
        let book =
            crate::bookkeeping::Bookkeeping::load(&fs, &fragment_dir, &schema, false).unwrap();
        assert_eq!(book.last_tile_cell_num(), 3);
    }

    #[test]
    fn test_empty_dense_read_fills_sentinels() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.array_create("e", &dense_4x4_schema(Codec::None)).unwrap();

        let mut array = ctx.array_init("e", Mode::Read, None, None).unwrap();
        let cells = read_all_i32(&mut array, 16);
        assert_eq!(cells, vec![i32::MIN + 1; 16]);
    }

    #[test]
    fn test_zero_length_write_commits_empty_fragment() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let schema = ArraySchema::new(
            false,
            vec!["x".to_string()],
            Datatype::Int32,
            coords_to_bytes(&[0i32, 9]),
            None,
            Layout::RowMajor,
            Layout::RowMajor,
            4,
            vec![Attribute::new("v", Datatype::Int32)],
        )
        .unwrap();
        ctx.array_create("z", &schema).unwrap();

        let array = ctx.array_init("z", Mode::Write, None, None).unwrap();
        array.finalize().unwrap();

        let fs = crate::fs::PosixFs::new(crate::config::ReadMethod::ReadIo);
        let fragments =
            crate::fragment::list_fragments(&fs, &ctx.resolve("z").unwrap()).unwrap();
        assert_eq!(fragments.len(), 1);
        let book =
            crate::bookkeeping::Bookkeeping::load(&fs, &fragments[0], &schema, false).unwrap();
        assert_eq!(book.sparse_tile_num(), 0);

        let mut array = ctx.array_init("z", Mode::Read, None, None).unwrap();
        let mut buffer = vec![0u8; 64];
        let mut coords_buf = vec![0u8; 64];
        let mut sizes = vec![64, 64];
        {
            let mut views: Vec<&mut [u8]> =
                vec![buffer.as_mut_slice(), coords_buf.as_mut_slice()];
            array.read(&mut views, &mut sizes).unwrap();
        }
        assert_eq!(sizes, vec![0, 0]);
    }

    #[test]
    fn test_one_cell_subarray() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.array_create("one", &dense_4x4_schema(Codec::None)).unwrap();

        let mut array = ctx
            .array_init("one", Mode::WriteSortedRow, None, None)
            .unwrap();
        let values = i32_bytes(&(0..16).collect::<Vec<i32>>());
        array.write(&[values.as_slice()]).unwrap();
        array.finalize().unwrap();

        let subarray = coords_to_bytes(&[2i32, 2, 3, 3]);
        let mut array = ctx
            .array_init("one", Mode::Read, Some(&subarray), None)
            .unwrap();
        assert_eq!(read_all_i32(&mut array, 1), vec![11]);
    }

    #[test]
    fn test_sparse_overwrite_newest_wins() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let schema = ArraySchema::new(
            false,
            vec!["x".to_string(), "y".to_string()],
            Datatype::Int32,
            coords_to_bytes(&[0i32, 9, 0, 9]),
            None,
            Layout::RowMajor,
            Layout::RowMajor,
            2,
            vec![Attribute::new("v", Datatype::Int32)],
        )
        .unwrap();
        ctx.array_create("w", &schema).unwrap();

        // Fragment 1: (1,1)=10, (2,2)=20; fragment 2 overwrites (1,1)=77
        let mut array = ctx
            .array_init("w", Mode::WriteUnsorted, None, None)
            .unwrap();
        let values = i32_bytes(&[10, 20]);
        let coords = coords_to_bytes(&[1i32, 1, 2, 2]);
        array.write(&[values.as_slice(), coords.as_slice()]).unwrap();
        array.finalize().unwrap();

        let mut array = ctx
            .array_init("w", Mode::WriteUnsorted, None, None)
            .unwrap();
        let values = i32_bytes(&[77]);
        let coords = coords_to_bytes(&[1i32, 1]);
        array.write(&[values.as_slice(), coords.as_slice()]).unwrap();
        array.finalize().unwrap();

        let mut array = ctx.array_init("w", Mode::Read, None, None).unwrap();
        let mut value_buf = vec![0u8; 64];
        let mut coords_buf = vec![0u8; 64];
        let mut sizes = vec![64, 64];
        {
            let mut views: Vec<&mut [u8]> =
                vec![value_buf.as_mut_slice(), coords_buf.as_mut_slice()];
            array.read(&mut views, &mut sizes).unwrap();
        }
        assert_eq!(i32_values(&value_buf[..sizes[0]]), vec![77, 20]);
        assert_eq!(i32_values(&coords_buf[..sizes[1]]), vec![1, 1, 2, 2]);
    }

    #[test]
    fn test_consolidate_preserves_reads() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let schema = ArraySchema::new(
            false,
            vec!["x".to_string()],
            Datatype::Int32,
            coords_to_bytes(&[0i32, 99]),
            None,
            Layout::RowMajor,
            Layout::RowMajor,
            3,
            vec![Attribute::new("v", Datatype::Int32)],
        )
        .unwrap();
        ctx.array_create("c", &schema).unwrap();

        for (coords, values) in [
            (vec![1i32, 5, 9], vec![10, 50, 90]),
            (vec![5i32, 7], vec![55, 70]),
        ] {
            let mut array = ctx
                .array_init("c", Mode::WriteUnsorted, None, None)
                .unwrap();
            let value_bytes = i32_bytes(&values);
            let coord_bytes = coords_to_bytes(&coords);
            array
                .write(&[value_bytes.as_slice(), coord_bytes.as_slice()])
                .unwrap();
            array.finalize().unwrap();
        }

        let read_all = |ctx: &Context| {
            let mut array = ctx.array_init("c", Mode::Read, None, None).unwrap();
            let mut value_buf = vec![0u8; 256];
            let mut coords_buf = vec![0u8; 256];
            let mut sizes = vec![256, 256];
            {
                let mut views: Vec<&mut [u8]> =
                    vec![value_buf.as_mut_slice(), coords_buf.as_mut_slice()];
                array.read(&mut views, &mut sizes).unwrap();
            }
            (
                i32_values(&value_buf[..sizes[0]]),
                i32_values(&coords_buf[..sizes[1]]),
            )
        };

        let before = read_all(&ctx);
        assert_eq!(before.0, vec![10, 55, 70, 90]);
        ctx.array_consolidate("c").unwrap();
        let after = read_all(&ctx);
        assert_eq!(before, after);

        let fs = crate::fs::PosixFs::new(crate::config::ReadMethod::ReadIo);
        let fragments =
            crate::fragment::list_fragments(&fs, &ctx.resolve("c").unwrap()).unwrap();
        assert_eq!(fragments.len(), 1);
    }

    #[test]
    fn test_skip_and_read() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.array_create("sk", &dense_4x4_schema(Codec::None)).unwrap();

        let mut array = ctx
            .array_init("sk", Mode::WriteSortedRow, None, None)
            .unwrap();
        let values = i32_bytes(&(0..16).collect::<Vec<i32>>());
        array.write(&[values.as_slice()]).unwrap();
        array.finalize().unwrap();

        let mut array = ctx.array_init("sk", Mode::Read, None, None).unwrap();
        let mut buffer = vec![0u8; 64];
        let mut sizes = vec![64];
        {
            let mut views: Vec<&mut [u8]> = vec![buffer.as_mut_slice()];
            array.skip_and_read(&mut views, &mut sizes, &[14]).unwrap();
        }
        // Global order ends with tile (1,1): cells 10, 11, 14, 15
        assert_eq!(i32_values(&buffer[..sizes[0]]), vec![14, 15]);
    }

    #[test]
    fn test_reread_identical(){
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.array_create("rr", &dense_4x4_schema(Codec::Lz4)).unwrap();

        let mut array = ctx
            .array_init("rr", Mode::WriteSortedRow, None, None)
            .unwrap();
        let values = i32_bytes(&(100..116).collect::<Vec<i32>>());
        array.write(&[values.as_slice()]).unwrap();
        array.finalize().unwrap();

        let subarray = coords_to_bytes(&[0i32, 3, 1, 2]);
        let mut first = ctx
            .array_init("rr", Mode::Read, Some(&subarray), None)
            .unwrap();
        let mut second = ctx
            .array_init("rr", Mode::Read, Some(&subarray), None)
            .unwrap();
        assert_eq!(read_all_i32(&mut first, 8), read_all_i32(&mut second, 8));
    }

    #[test]
    fn test_var_all_empty_roundtrip() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let schema = ArraySchema::new(
            false,
            vec!["x".to_string()],
            Datatype::Int64,
            coords_to_bytes(&[0i64, 9]),
            None,
            Layout::RowMajor,
            Layout::RowMajor,
            4,
            vec![Attribute::new("s", Datatype::Char).var_sized()],
        )
        .unwrap();
        ctx.array_create("ve", &schema).unwrap();

        let mut array = ctx.array_init("ve", Mode::Write, None, None).unwrap();
        let offsets: Vec<u8> = [0u64, 0, 0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let coords = coords_to_bytes(&[1i64, 2, 3]);
        array
            .write(&[offsets.as_slice(), &[], coords.as_slice()])
            .unwrap();
        array.finalize().unwrap();

        let mut array = ctx.array_init("ve", Mode::Read, None, None).unwrap();
        let mut offsets_buf = vec![0u8; 64];
        let mut values_buf = vec![0u8; 64];
        let mut coords_buf = vec![0u8; 64];
        let mut sizes = vec![64, 64, 64];
        {
            let mut views: Vec<&mut [u8]> = vec![
                offsets_buf.as_mut_slice(),
                values_buf.as_mut_slice(),
                coords_buf.as_mut_slice(),
            ];
            array.read(&mut views, &mut sizes).unwrap();
        }
        assert_eq!(u64_values(&offsets_buf[..sizes[0]]), vec![0, 0, 0]);
        assert_eq!(sizes[1], 0);
    }

    #[test]
    fn test_hilbert_order_sorts_unsorted_writes() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let schema = ArraySchema::new(
            false,
            vec!["x".to_string(), "y".to_string()],
            Datatype::Int32,
            coords_to_bytes(&[0i32, 15, 0, 15]),
            None,
            Layout::Hilbert,
            Layout::RowMajor,
            100,
            vec![Attribute::new("v", Datatype::Int32)],
        )
        .unwrap();
        ctx.array_create("h", &schema).unwrap();

        let cells: Vec<(i32, i32)> = vec![(3, 7), (0, 0), (15, 15), (8, 2), (1, 14)];
        let mut coords = Vec::new();
        let mut values = Vec::new();
        for (i, (x, y)) in cells.iter().enumerate() {
            coords.extend_from_slice(&coords_to_bytes(&[*x, *y]));
            values.extend_from_slice(&(i as i32).to_le_bytes());
        }
        let mut array = ctx
            .array_init("h", Mode::WriteUnsorted, None, None)
            .unwrap();
        array.write(&[values.as_slice(), coords.as_slice()]).unwrap();
        array.finalize().unwrap();

        let mut array = ctx.array_init("h", Mode::Read, None, None).unwrap();
        let mut value_buf = vec![0u8; 256];
        let mut coords_buf = vec![0u8; 256];
        let mut sizes = vec![256, 256];
        {
            let mut views: Vec<&mut [u8]> =
                vec![value_buf.as_mut_slice(), coords_buf.as_mut_slice()];
            array.read(&mut views, &mut sizes).unwrap();
        }
        let out_coords = i32_values(&coords_buf[..sizes[1]]);
        let out_values = i32_values(&value_buf[..sizes[0]]);
        assert_eq!(out_coords.len(), 10);
        assert_eq!(out_values.len(), 5);

        // Every written cell comes back exactly once, in hilbert order
        for (i, (x, y)) in cells.iter().enumerate() {
            let pos = out_values.iter().position(|&v| v == i as i32).unwrap();
            assert_eq!(out_coords[2 * pos], *x);
            assert_eq!(out_coords[2 * pos + 1], *y);
        }
        for w in 0..4 {
            let a = [out_coords[2 * w], out_coords[2 * w + 1]];
            let b = [out_coords[2 * w + 2], out_coords[2 * w + 3]];
            assert_eq!(
                schema.cell_cmp::<i32>(&a, &b),
                std::cmp::Ordering::Less
            );
        }
    }

    #[test]
    fn test_write_to_read_mode_rejected() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.array_create("m", &dense_4x4_schema(Codec::None)).unwrap();
        let mut array = ctx.array_init("m", Mode::Read, None, None).unwrap();
        let err = array.write(&[&[][..]]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidArg(_)));
        assert!(!crate::error::last_error_message().is_empty());
    }
}
