//! Array schema: datatypes, dimensions, attributes, cell and tile order
//!
//! The schema is immutable after creation. Coordinates are one of four
//! types; the engine dispatches to monomorphic code once per open through
//! the [`Coordinate`] trait. Domains and tile extents are kept as
//! little-endian bytes (the on-disk form) with typed accessors.

use std::cmp::Ordering;

use crate::codec::Codec;
use crate::error::{Result, StoreError};

/// Serialized schema file inside an array directory
pub const ARRAY_SCHEMA_FILE: &str = "__array_schema.tdb";

/// Name of the internal coordinates pseudo-attribute
pub const COORDS_NAME: &str = "__coords";

/// Size of one variable-cell offset entry
pub const VAR_OFFSET_SIZE: usize = 8;

/// Cell value datatype
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datatype {
    Int32,
    Int64,
    Float32,
    Float64,
    Char,
    UInt8,
    UInt64,
}

impl Datatype {
    pub fn size(self) -> usize {
        match self {
            Datatype::Char | Datatype::UInt8 => 1,
            Datatype::Int32 | Datatype::Float32 => 4,
            Datatype::Int64 | Datatype::Float64 | Datatype::UInt64 => 8,
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, Datatype::Float32 | Datatype::Float64)
    }

    pub fn code(self) -> u8 {
        match self {
            Datatype::Int32 => 0,
            Datatype::Int64 => 1,
            Datatype::Float32 => 2,
            Datatype::Float64 => 3,
            Datatype::Char => 4,
            Datatype::UInt8 => 5,
            Datatype::UInt64 => 6,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => Datatype::Int32,
            1 => Datatype::Int64,
            2 => Datatype::Float32,
            3 => Datatype::Float64,
            4 => Datatype::Char,
            5 => Datatype::UInt8,
            6 => Datatype::UInt64,
            other => {
                return Err(StoreError::Decode(format!("unknown datatype code {}", other)))
            }
        })
    }

    /// Write one cell's empty sentinel into `out` (sized to `self.size()`)
    pub fn write_empty(self, out: &mut [u8]) {
        match self {
            Datatype::Int32 => out.copy_from_slice(&(i32::MIN + 1).to_le_bytes()),
            Datatype::Int64 => out.copy_from_slice(&(i64::MIN + 1).to_le_bytes()),
            Datatype::Float32 => out.copy_from_slice(&f32::NAN.to_bits().to_le_bytes()),
            Datatype::Float64 => out.copy_from_slice(&f64::NAN.to_bits().to_le_bytes()),
            Datatype::Char => out[0] = 0,
            Datatype::UInt8 => out[0] = u8::MAX,
            Datatype::UInt64 => out.copy_from_slice(&u64::MAX.to_le_bytes()),
        }
    }
}

/// Cell or tile ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    RowMajor,
    ColMajor,
    /// Hilbert curve order; sparse cell order only
    Hilbert,
}

impl Layout {
    fn code(self) -> u8 {
        match self {
            Layout::RowMajor => 0,
            Layout::ColMajor => 1,
            Layout::Hilbert => 2,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => Layout::RowMajor,
            1 => Layout::ColMajor,
            2 => Layout::Hilbert,
            other => return Err(StoreError::Decode(format!("unknown layout code {}", other))),
        })
    }
}

/// Number of values per cell of an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellValNum {
    Fixed(u32),
    Var,
}

/// A named attribute
#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub datatype: Datatype,
    pub cell_val_num: CellValNum,
    pub codec: Codec,
    pub level: i32,
}

impl Attribute {
    pub fn new(name: impl Into<String>, datatype: Datatype) -> Self {
        Self {
            name: name.into(),
            datatype,
            cell_val_num: CellValNum::Fixed(1),
            codec: Codec::None,
            level: -1,
        }
    }

    pub fn var_sized(mut self) -> Self {
        self.cell_val_num = CellValNum::Var;
        self
    }

    pub fn with_values_per_cell(mut self, num: u32) -> Self {
        self.cell_val_num = CellValNum::Fixed(num);
        self
    }

    pub fn with_codec(mut self, codec: Codec, level: i32) -> Self {
        self.codec = codec;
        self.level = level;
        self
    }

    pub fn is_var(&self) -> bool {
        matches!(self.cell_val_num, CellValNum::Var)
    }
}

/// Coordinate types the engine is monomorphic over
pub trait Coordinate: Copy + PartialEq + std::fmt::Debug + Default + Send + Sync + 'static {
    const DATATYPE: Datatype;
    const SIZE: usize;

    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, out: &mut [u8]);

    /// Deterministic total order (floats use IEEE total ordering)
    fn cmp_coord(self, other: Self) -> Ordering;

    /// Index of the tile containing `self` along one dimension
    fn tile_index(self, lo: Self, extent: Self) -> u64;

    /// Cell offset from `lo`, integer coordinate types only
    fn cell_offset(self, lo: Self) -> u64;

    /// `self` advanced by `n` cells, integer coordinate types only
    fn advance(self, n: u64) -> Self;
}

macro_rules! int_coordinate {
    ($t:ty, $dt:expr) => {
        impl Coordinate for $t {
            const DATATYPE: Datatype = $dt;
            const SIZE: usize = std::mem::size_of::<$t>();

            fn read_le(bytes: &[u8]) -> Self {
                <$t>::from_le_bytes(bytes[..Self::SIZE].try_into().expect("coordinate width"))
            }

            fn write_le(self, out: &mut [u8]) {
                out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
            }

            fn cmp_coord(self, other: Self) -> Ordering {
                self.cmp(&other)
            }

            fn tile_index(self, lo: Self, extent: Self) -> u64 {
                ((self - lo) / extent) as u64
            }

            fn cell_offset(self, lo: Self) -> u64 {
                (self - lo) as u64
            }

            fn advance(self, n: u64) -> Self {
                self + n as $t
            }
        }
    };
}

macro_rules! float_coordinate {
    ($t:ty, $dt:expr) => {
        impl Coordinate for $t {
            const DATATYPE: Datatype = $dt;
            const SIZE: usize = std::mem::size_of::<$t>();

            fn read_le(bytes: &[u8]) -> Self {
                <$t>::from_le_bytes(bytes[..Self::SIZE].try_into().expect("coordinate width"))
            }

            fn write_le(self, out: &mut [u8]) {
                out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
            }

            fn cmp_coord(self, other: Self) -> Ordering {
                self.total_cmp(&other)
            }

            fn tile_index(self, lo: Self, extent: Self) -> u64 {
                ((self - lo) / extent).floor() as u64
            }

            fn cell_offset(self, _lo: Self) -> u64 {
                unreachable!("cell arithmetic on real-valued dimensions")
            }

            fn advance(self, _n: u64) -> Self {
                unreachable!("cell arithmetic on real-valued dimensions")
            }
        }
    };
}

int_coordinate!(i32, Datatype::Int32);
int_coordinate!(i64, Datatype::Int64);
float_coordinate!(f32, Datatype::Float32);
float_coordinate!(f64, Datatype::Float64);

/// Decode a little-endian coordinate buffer
pub fn coords_from_bytes<T: Coordinate>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks(T::SIZE)
        .map(|chunk| T::read_le(chunk))
        .collect()
}

/// Encode coordinates little-endian
pub fn coords_to_bytes<T: Coordinate>(coords: &[T]) -> Vec<u8> {
    let mut out = vec![0u8; coords.len() * T::SIZE];
    for (i, c) in coords.iter().enumerate() {
        c.write_le(&mut out[i * T::SIZE..]);
    }
    out
}

/// Compare two cells in row-major order
pub fn cmp_row_order<T: Coordinate>(a: &[T], b: &[T]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match x.cmp_coord(*y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Compare two cells in column-major order
pub fn cmp_col_order<T: Coordinate>(a: &[T], b: &[T]) -> Ordering {
    for (x, y) in a.iter().rev().zip(b.iter().rev()) {
        match x.cmp_coord(*y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// True if `cell` lies inside the closed hyperrectangle `subarray`
pub fn cell_in_subarray<T: Coordinate>(cell: &[T], subarray: &[T]) -> bool {
    cell.iter().enumerate().all(|(d, c)| {
        c.cmp_coord(subarray[2 * d]) != Ordering::Less
            && c.cmp_coord(subarray[2 * d + 1]) != Ordering::Greater
    })
}

/// Number of cells in a subarray over integer dimensions
pub fn cell_num_in_subarray<T: Coordinate>(subarray: &[T]) -> u64 {
    let dim_num = subarray.len() / 2;
    let mut n = 1u64;
    for d in 0..dim_num {
        n *= subarray[2 * d + 1].cell_offset(subarray[2 * d]) + 1;
    }
    n
}

/// Immutable array schema
#[derive(Debug, Clone)]
pub struct ArraySchema {
    dense: bool,
    dim_names: Vec<String>,
    coords_type: Datatype,
    /// `[lo, hi]` per dimension, little-endian
    domain: Vec<u8>,
    /// One extent per dimension, little-endian; `None` means unchunked
    tile_extents: Option<Vec<u8>>,
    cell_order: Layout,
    tile_order: Layout,
    capacity: u64,
    attributes: Vec<Attribute>,
    coords_codec: Codec,
    coords_level: i32,
}

impl ArraySchema {
    /// Validate and build a schema.
    ///
    /// `domain` holds `[lo, hi]` per dimension and `tile_extents` one extent
    /// per dimension, both little-endian encodings of `coords_type`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dense: bool,
        dim_names: Vec<String>,
        coords_type: Datatype,
        domain: Vec<u8>,
        tile_extents: Option<Vec<u8>>,
        cell_order: Layout,
        tile_order: Layout,
        capacity: u64,
        attributes: Vec<Attribute>,
    ) -> Result<Self> {
        let schema = Self {
            dense,
            dim_names,
            coords_type,
            domain,
            tile_extents,
            cell_order,
            tile_order,
            capacity,
            attributes,
            coords_codec: Codec::None,
            coords_level: -1,
        };
        schema.validate()?;
        Ok(schema)
    }

    /// Select a codec for the coordinates pseudo-attribute
    pub fn with_coords_codec(mut self, codec: Codec, level: i32) -> Result<Self> {
        if codec == Codec::DoubleDelta && !self.coords_type.is_integer() {
            return Err(StoreError::InvalidArg(
                "double-delta on coordinates requires an integer type".to_string(),
            ));
        }
        self.coords_codec = codec;
        self.coords_level = level;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        let dim_num = self.dim_names.len();
        if dim_num == 0 {
            return Err(StoreError::InvalidArg("schema has no dimensions".to_string()));
        }
        if self.attributes.is_empty() {
            return Err(StoreError::InvalidArg("schema has no attributes".to_string()));
        }
        if !matches!(
            self.coords_type,
            Datatype::Int32 | Datatype::Int64 | Datatype::Float32 | Datatype::Float64
        ) {
            return Err(StoreError::InvalidArg(
                "coordinates must be int32, int64, float32 or float64".to_string(),
            ));
        }
        if self.domain.len() != 2 * dim_num * self.coords_type.size() {
            return Err(StoreError::InvalidArg(
                "domain does not match dimension count and type".to_string(),
            ));
        }
        if let Some(extents) = &self.tile_extents {
            if extents.len() != dim_num * self.coords_type.size() {
                return Err(StoreError::InvalidArg(
                    "tile extents do not match dimension count and type".to_string(),
                ));
            }
        }
        if self.dense {
            if self.tile_extents.is_none() {
                return Err(StoreError::InvalidArg(
                    "dense arrays require tile extents".to_string(),
                ));
            }
            if !self.coords_type.is_integer() {
                return Err(StoreError::InvalidArg(
                    "dense arrays require integer dimensions".to_string(),
                ));
            }
            if self.cell_order == Layout::Hilbert {
                return Err(StoreError::InvalidArg(
                    "hilbert cell order applies to sparse arrays only".to_string(),
                ));
            }
        } else if self.capacity == 0 {
            return Err(StoreError::InvalidArg(
                "sparse arrays require a positive capacity".to_string(),
            ));
        }
        if self.cell_order == Layout::Hilbert {
            if dim_num != 2 || !self.coords_type.is_integer() {
                return Err(StoreError::InvalidArg(
                    "hilbert cell order requires two integer dimensions".to_string(),
                ));
            }
            self.validate_hilbert_extent()?;
        }
        if self.tile_order == Layout::Hilbert {
            return Err(StoreError::InvalidArg(
                "tile order must be row or column major".to_string(),
            ));
        }
        let mut names: Vec<&str> = self.attributes.iter().map(|a| a.name.as_str()).collect();
        names.extend(self.dim_names.iter().map(|n| n.as_str()));
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(StoreError::InvalidArg(
                "attribute and dimension names must be unique".to_string(),
            ));
        }
        for attr in &self.attributes {
            if attr.name.starts_with("__") {
                return Err(StoreError::InvalidArg(format!(
                    "attribute name '{}' is reserved",
                    attr.name
                )));
            }
            if attr.is_var() && attr.codec.requires_fixed_cells() {
                return Err(StoreError::InvalidArg(format!(
                    "codec of attribute '{}' requires fixed-size cells",
                    attr.name
                )));
            }
            if attr.codec == Codec::DoubleDelta && !attr.datatype.is_integer() {
                return Err(StoreError::InvalidArg(format!(
                    "double-delta on attribute '{}' requires an integer type",
                    attr.name
                )));
            }
        }
        self.validate_typed()?;
        Ok(())
    }

    fn validate_hilbert_extent(&self) -> Result<()> {
        let span_ok = match self.coords_type {
            Datatype::Int32 => true,
            Datatype::Int64 => {
                let domain = self.domain::<i64>();
                (0..self.dim_num())
                    .all(|d| domain[2 * d + 1].cell_offset(domain[2 * d]) <= u64::from(u32::MAX))
            }
            _ => false,
        };
        if !span_ok {
            return Err(StoreError::InvalidArg(
                "hilbert cell order requires dimension spans within 32 bits".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_typed(&self) -> Result<()> {
        match self.coords_type {
            Datatype::Int32 => self.validate_domain::<i32>(),
            Datatype::Int64 => self.validate_domain::<i64>(),
            Datatype::Float32 => self.validate_domain::<f32>(),
            Datatype::Float64 => self.validate_domain::<f64>(),
            _ => Ok(()),
        }
    }

    fn validate_domain<T: Coordinate>(&self) -> Result<()> {
        let domain = self.domain::<T>();
        for d in 0..self.dim_num() {
            if domain[2 * d].cmp_coord(domain[2 * d + 1]) == Ordering::Greater {
                return Err(StoreError::InvalidArg(format!(
                    "domain of dimension '{}' is inverted",
                    self.dim_names[d]
                )));
            }
        }
        if self.dense {
            let extents = self.tile_extents::<T>().expect("validated above");
            for d in 0..self.dim_num() {
                let extent = Self::extent_as_u64(extents[d]);
                if extent == 0 {
                    return Err(StoreError::InvalidArg(format!(
                        "tile extent of dimension '{}' is zero",
                        self.dim_names[d]
                    )));
                }
                let span = domain[2 * d + 1].cell_offset(domain[2 * d]) + 1;
                if span % extent != 0 {
                    return Err(StoreError::InvalidArg(format!(
                        "tile extent does not evenly tile dimension '{}'",
                        self.dim_names[d]
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn dense(&self) -> bool {
        self.dense
    }

    pub fn dim_num(&self) -> usize {
        self.dim_names.len()
    }

    pub fn dim_names(&self) -> &[String] {
        &self.dim_names
    }

    pub fn coords_type(&self) -> Datatype {
        self.coords_type
    }

    pub fn coords_size(&self) -> usize {
        self.dim_num() * self.coords_type.size()
    }

    pub fn cell_order(&self) -> Layout {
        self.cell_order
    }

    pub fn tile_order(&self) -> Layout {
        self.tile_order
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn has_tile_grid(&self) -> bool {
        self.tile_extents.is_some()
    }

    /// Attributes declared by the caller (excludes coordinates)
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute_num(&self) -> usize {
        self.attributes.len()
    }

    /// Id of the coordinates pseudo-attribute
    pub fn coords_id(&self) -> usize {
        self.attributes.len()
    }

    /// Resolve an attribute name, allowing the coordinates pseudo-attribute
    pub fn attribute_id(&self, name: &str) -> Result<usize> {
        if name == COORDS_NAME {
            return Ok(self.coords_id());
        }
        self.attributes
            .iter()
            .position(|a| a.name == name)
            .ok_or_else(|| StoreError::InvalidArg(format!("unknown attribute '{}'", name)))
    }

    pub fn is_coords(&self, attribute_id: usize) -> bool {
        attribute_id == self.coords_id()
    }

    pub fn var_size(&self, attribute_id: usize) -> bool {
        self.attributes
            .get(attribute_id)
            .map(|a| a.is_var())
            .unwrap_or(false)
    }

    /// Bytes of one fixed-size cell of `attribute_id`; for variable
    /// attributes this is the offset entry size
    pub fn cell_size(&self, attribute_id: usize) -> usize {
        if self.is_coords(attribute_id) {
            return self.coords_size();
        }
        let attr = &self.attributes[attribute_id];
        match attr.cell_val_num {
            CellValNum::Fixed(n) => attr.datatype.size() * n as usize,
            CellValNum::Var => VAR_OFFSET_SIZE,
        }
    }

    pub fn codec(&self, attribute_id: usize) -> (Codec, i32) {
        if self.is_coords(attribute_id) {
            return (self.coords_codec, self.coords_level);
        }
        let attr = &self.attributes[attribute_id];
        (attr.codec, attr.level)
    }

    /// Datatype of an attribute (coordinates report the coordinate type)
    pub fn attribute_type(&self, attribute_id: usize) -> Datatype {
        if self.is_coords(attribute_id) {
            self.coords_type
        } else {
            self.attributes[attribute_id].datatype
        }
    }

    pub fn domain<T: Coordinate>(&self) -> Vec<T> {
        coords_from_bytes(&self.domain)
    }

    pub fn domain_bytes(&self) -> &[u8] {
        &self.domain
    }

    pub fn tile_extents<T: Coordinate>(&self) -> Option<Vec<T>> {
        self.tile_extents.as_ref().map(|e| coords_from_bytes(e))
    }

    /// Cells per dense tile (product of extents)
    pub fn cell_num_per_tile(&self) -> u64 {
        match self.coords_type {
            Datatype::Int32 => self.cell_num_per_tile_typed::<i32>(),
            Datatype::Int64 => self.cell_num_per_tile_typed::<i64>(),
            _ => 0,
        }
    }

    fn cell_num_per_tile_typed<T: Coordinate>(&self) -> u64 {
        match self.tile_extents::<T>() {
            Some(extents) => extents.iter().map(|e| Self::extent_as_u64(*e)).product(),
            None => 0,
        }
    }

    fn extent_as_u64<T: Coordinate>(extent: T) -> u64 {
        // Extents are positive integers for dense arrays.
        extent.cell_offset(T::default())
    }

    /// Cells per tile of a write: dense extent product or sparse capacity
    pub fn cells_per_tile(&self) -> u64 {
        if self.dense {
            self.cell_num_per_tile()
        } else {
            self.capacity
        }
    }

    /// Expand `domain` in place so every dimension spans whole tiles.
    pub fn expand_domain<T: Coordinate>(&self, domain: &mut [T]) {
        let Some(extents) = self.tile_extents::<T>() else {
            return;
        };
        let schema_domain = self.domain::<T>();
        for d in 0..self.dim_num() {
            let lo = schema_domain[2 * d];
            let extent = extents[d];
            let tiles_lo = domain[2 * d].tile_index(lo, extent);
            let tiles_hi = domain[2 * d + 1].tile_index(lo, extent);
            domain[2 * d] = lo.advance(tiles_lo * Self::extent_as_u64(extent));
            domain[2 * d + 1] = lo.advance((tiles_hi + 1) * Self::extent_as_u64(extent) - 1);
        }
    }

    /// Number of tiles a dense domain spans
    pub fn tile_num<T: Coordinate>(&self, domain: &[T]) -> u64 {
        let Some(extents) = self.tile_extents::<T>() else {
            return 0;
        };
        let mut n = 1u64;
        for d in 0..self.dim_num() {
            n *= domain[2 * d + 1].tile_index(domain[2 * d], extents[d]) + 1;
        }
        n
    }

    /// Tile grid coordinates of a cell
    pub fn tile_coords<T: Coordinate>(&self, coords: &[T], out: &mut [u64]) {
        let extents = self.tile_extents::<T>().expect("tile grid present");
        let domain = self.domain::<T>();
        for d in 0..self.dim_num() {
            out[d] = coords[d].tile_index(domain[2 * d], extents[d]);
        }
    }

    /// Linear tile id of a cell in tile order
    pub fn tile_id<T: Coordinate>(&self, coords: &[T]) -> u64 {
        let dim_num = self.dim_num();
        let mut tile_coords = vec![0u64; dim_num];
        self.tile_coords(coords, &mut tile_coords);
        let extents = self.tile_extents::<T>().expect("tile grid present");
        let domain = self.domain::<T>();
        let mut tiles_per_dim = vec![0u64; dim_num];
        for d in 0..dim_num {
            let lo = domain[2 * d];
            tiles_per_dim[d] = domain[2 * d + 1].tile_index(lo, extents[d]) + 1;
        }
        linearize(&tile_coords, &tiles_per_dim, self.tile_order)
    }

    /// Hilbert id of a cell (two integer dimensions)
    pub fn hilbert_id<T: Coordinate>(&self, coords: &[T]) -> u64 {
        let domain = self.domain::<T>();
        let x = coords[0].cell_offset(domain[0]);
        let y = coords[1].cell_offset(domain[2]);
        hilbert_2d::u64::xy2h_discrete(x, y, 32, hilbert_2d::Variant::Hilbert)
    }

    /// Compare two cells in the schema's cell order, honoring the tile
    /// grid (tile id first) when one exists.
    pub fn cell_cmp<T: Coordinate>(&self, a: &[T], b: &[T]) -> Ordering {
        if self.has_tile_grid() {
            match self.tile_id(a).cmp(&self.tile_id(b)) {
                Ordering::Equal => {}
                other => return other,
            }
        }
        match self.cell_order {
            Layout::RowMajor => cmp_row_order(a, b),
            Layout::ColMajor => cmp_col_order(a, b),
            Layout::Hilbert => match self.hilbert_id(a).cmp(&self.hilbert_id(b)) {
                Ordering::Equal => cmp_row_order(a, b),
                other => other,
            },
        }
    }

    /// Layout hints for the codec of an attribute's main file (cell values,
    /// or offset entries for variable attributes)
    pub fn codec_ctx(&self, attribute_id: usize) -> crate::codec::CodecCtx {
        let (codec, _) = self.codec(attribute_id);
        let value_size = match codec {
            Codec::Rle => self.cell_size(attribute_id),
            _ if !self.is_coords(attribute_id) && self.var_size(attribute_id) => VAR_OFFSET_SIZE,
            _ => self.attribute_type(attribute_id).size(),
        };
        let dim_num = if self.is_coords(attribute_id) {
            self.dim_num()
        } else {
            1
        };
        crate::codec::CodecCtx::new(value_size, dim_num)
    }

    /// Layout hints for the codec of a variable attribute's value file
    pub fn codec_ctx_var(&self, attribute_id: usize) -> crate::codec::CodecCtx {
        crate::codec::CodecCtx::new(self.attribute_type(attribute_id).size(), 1)
    }

    /* --------------------------- serialization --------------------------- */

    /// Serialize to the gzip-framed binary schema record
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.push(self.dense as u8);
        out.push(self.coords_type.code());
        out.push(self.cell_order.code());
        out.push(self.tile_order.code());
        out.extend_from_slice(&self.capacity.to_le_bytes());
        out.push(self.coords_codec.code());
        out.extend_from_slice(&self.coords_level.to_le_bytes());
        out.extend_from_slice(&(self.dim_num() as u32).to_le_bytes());
        for name in &self.dim_names {
            write_string(&mut out, name);
        }
        out.extend_from_slice(&self.domain);
        match &self.tile_extents {
            Some(extents) => {
                out.push(1);
                out.extend_from_slice(extents);
            }
            None => out.push(0),
        }
        out.extend_from_slice(&(self.attributes.len() as u32).to_le_bytes());
        for attr in &self.attributes {
            write_string(&mut out, &attr.name);
            out.push(attr.datatype.code());
            let cvn = match attr.cell_val_num {
                CellValNum::Fixed(n) => n,
                CellValNum::Var => u32::MAX,
            };
            out.extend_from_slice(&cvn.to_le_bytes());
            out.push(attr.codec.code());
            out.extend_from_slice(&attr.level.to_le_bytes());
        }
        crate::codec::gzip_frame(&out)
    }

    /// Deserialize a gzip-framed binary schema record
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw = crate::codec::gzip_unframe(bytes)?;
        let mut r = Reader::new(&raw);
        let dense = r.u8()? != 0;
        let coords_type = Datatype::from_code(r.u8()?)?;
        let cell_order = Layout::from_code(r.u8()?)?;
        let tile_order = Layout::from_code(r.u8()?)?;
        let capacity = r.u64()?;
        let coords_codec = Codec::from_code(r.u8()?)?;
        let coords_level = r.i32()?;
        let dim_num = r.u32()? as usize;
        let mut dim_names = Vec::with_capacity(dim_num);
        for _ in 0..dim_num {
            dim_names.push(r.string()?);
        }
        let domain = r.bytes(2 * dim_num * coords_type.size())?.to_vec();
        let tile_extents = if r.u8()? != 0 {
            Some(r.bytes(dim_num * coords_type.size())?.to_vec())
        } else {
            None
        };
        let attribute_num = r.u32()? as usize;
        let mut attributes = Vec::with_capacity(attribute_num);
        for _ in 0..attribute_num {
            let name = r.string()?;
            let datatype = Datatype::from_code(r.u8()?)?;
            let cvn = r.u32()?;
            let cell_val_num = if cvn == u32::MAX {
                CellValNum::Var
            } else {
                CellValNum::Fixed(cvn)
            };
            let codec = Codec::from_code(r.u8()?)?;
            let level = r.i32()?;
            attributes.push(Attribute {
                name,
                datatype,
                cell_val_num,
                codec,
                level,
            });
        }
        r.done()?;
        Self::new(
            dense,
            dim_names,
            coords_type,
            domain,
            tile_extents,
            cell_order,
            tile_order,
            capacity,
            attributes,
        )?
        .with_coords_codec(coords_codec, coords_level)
    }
}

/// Linearize grid coordinates in row- or column-major order
pub fn linearize(coords: &[u64], dims: &[u64], order: Layout) -> u64 {
    let mut id = 0u64;
    match order {
        Layout::ColMajor => {
            for d in (0..coords.len()).rev() {
                id = id * dims[d] + coords[d];
            }
        }
        _ => {
            for d in 0..coords.len() {
                id = id * dims[d] + coords[d];
            }
        }
    }
    id
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Cursor over a little-endian byte record
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(StoreError::Decode("record truncated".to_string()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().expect("4 bytes")))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.bytes(4)?.try_into().expect("4 bytes")))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().expect("8 bytes")))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.bytes(8)?.try_into().expect("8 bytes")))
    }

    pub fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| StoreError::Decode("record holds a non-utf8 name".to_string()))
    }

    pub fn done(&self) -> Result<()> {
        if self.pos != self.data.len() {
            return Err(StoreError::Decode("trailing bytes in record".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn dense_4x4() -> ArraySchema {
        ArraySchema::new(
            true,
            vec!["d0".to_string(), "d1".to_string()],
            Datatype::Int32,
            coords_to_bytes(&[0i32, 3, 0, 3]),
            Some(coords_to_bytes(&[2i32, 2])),
            Layout::RowMajor,
            Layout::RowMajor,
            0,
            vec![Attribute::new("a1", Datatype::Int32)],
        )
        .unwrap()
    }

    fn sparse_100x100() -> ArraySchema {
        ArraySchema::new(
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
        .unwrap()
    }

    #[test]
    fn test_dense_requires_extents() {
        let err = ArraySchema::new(
            true,
            vec!["d0".to_string()],
            Datatype::Int32,
            coords_to_bytes(&[0i32, 9]),
            None,
            Layout::RowMajor,
            Layout::RowMajor,
            0,
            vec![Attribute::new("a", Datatype::Int32)],
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArg(_)));
    }

    #[test]
    fn test_sparse_requires_capacity() {
        let err = ArraySchema::new(
            false,
            vec!["d0".to_string()],
            Datatype::Int32,
            coords_to_bytes(&[0i32, 9]),
            None,
            Layout::RowMajor,
            Layout::RowMajor,
            0,
            vec![Attribute::new("a", Datatype::Int32)],
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArg(_)));
    }

    #[test]
    fn test_cell_sizes() {
        let schema = dense_4x4();
        assert_eq!(schema.cell_size(0), 4);
        assert_eq!(schema.coords_size(), 8);
        assert_eq!(schema.cell_num_per_tile(), 4);
    }

    #[test]
    fn test_tile_ids_row_major() {
        let schema = dense_4x4();
        // 2x2 tile grid over 4x4 domain
        assert_eq!(schema.tile_id(&[0i32, 0]), 0);
        assert_eq!(schema.tile_id(&[0i32, 2]), 1);
        assert_eq!(schema.tile_id(&[2i32, 1]), 2);
        assert_eq!(schema.tile_id(&[3i32, 3]), 3);
    }

    #[test]
    fn test_cell_cmp_orders() {
        let schema = sparse_100x100();
        assert_eq!(schema.cell_cmp(&[0i32, 1], &[5, 4]), Ordering::Less);
        assert_eq!(schema.cell_cmp(&[5i32, 4], &[5, 5]), Ordering::Less);
        assert_eq!(schema.cell_cmp(&[5i32, 5], &[5, 5]), Ordering::Equal);

        assert_eq!(cmp_col_order(&[1i32, 0], &[0, 1]), Ordering::Less);
    }

    #[test]
    fn test_expand_domain() {
        let schema = ArraySchema::new(
            true,
            vec!["d0".to_string(), "d1".to_string()],
            Datatype::Int64,
            coords_to_bytes(&[0i64, 11, 0, 11]),
            Some(coords_to_bytes(&[3i64, 3])),
            Layout::RowMajor,
            Layout::RowMajor,
            0,
            vec![Attribute::new("a", Datatype::Int32)],
        )
        .unwrap();
        // A non-aligned write window grows to whole tiles
        let mut domain = [1i64, 9, 0, 4];
        schema.expand_domain(&mut domain);
        assert_eq!(domain, [0, 11, 0, 5]);
    }

    #[test]
    fn test_dense_domain_must_tile_evenly() {
        let err = ArraySchema::new(
            true,
            vec!["d0".to_string()],
            Datatype::Int32,
            coords_to_bytes(&[0i32, 9]),
            Some(coords_to_bytes(&[3i32])),
            Layout::RowMajor,
            Layout::RowMajor,
            0,
            vec![Attribute::new("a", Datatype::Int32)],
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArg(_)));
    }

    #[test]
    fn test_hilbert_requires_2d_int() {
        let err = ArraySchema::new(
            false,
            vec!["x".to_string()],
            Datatype::Int32,
            coords_to_bytes(&[0i32, 9]),
            None,
            Layout::Hilbert,
            Layout::RowMajor,
            4,
            vec![Attribute::new("a", Datatype::Int32)],
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArg(_)));
    }

    #[test]
    fn test_var_attr_rejects_rle() {
        let err = ArraySchema::new(
            false,
            vec!["x".to_string()],
            Datatype::Int64,
            coords_to_bytes(&[0i64, 9]),
            None,
            Layout::RowMajor,
            Layout::RowMajor,
            4,
            vec![Attribute::new("s", Datatype::Char)
                .var_sized()
                .with_codec(Codec::Rle, -1)],
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArg(_)));
    }

    #[test]
    fn test_schema_serialization_roundtrip() {
        let schema = ArraySchema::new(
            false,
            vec!["x".to_string(), "y".to_string()],
            Datatype::Float64,
            coords_to_bytes(&[0.0f64, 1.0, -5.0, 5.0]),
            None,
            Layout::ColMajor,
            Layout::RowMajor,
            1000,
            vec![
                Attribute::new("a", Datatype::Int64).with_codec(Codec::Gzip, 9),
                Attribute::new("s", Datatype::Char).var_sized(),
                Attribute::new("k", Datatype::Float32).with_values_per_cell(3),
            ],
        )
        .unwrap();
        let bytes = schema.to_bytes().unwrap();
        let loaded = ArraySchema::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.dense(), schema.dense());
        assert_eq!(loaded.dim_names(), schema.dim_names());
        assert_eq!(loaded.coords_type(), schema.coords_type());
        assert_eq!(loaded.capacity(), schema.capacity());
        assert_eq!(loaded.attribute_num(), 3);
        assert!(loaded.var_size(1));
        assert_eq!(loaded.cell_size(2), 12);
        assert_eq!(loaded.domain_bytes(), schema.domain_bytes());
    }

    #[test]
    fn test_empty_sentinels() {
        let mut buf = [0u8; 4];
        Datatype::Int32.write_empty(&mut buf);
        assert_eq!(i32::from_le_bytes(buf), i32::MIN + 1);
        let mut buf = [0u8; 8];
        Datatype::Float64.write_empty(&mut buf);
        assert!(f64::from_le_bytes(buf).is_nan());
    }

    #[test]
    fn test_attribute_lookup() {
        let schema = sparse_100x100();
        assert_eq!(schema.attribute_id("v").unwrap(), 0);
        assert_eq!(schema.attribute_id(COORDS_NAME).unwrap(), 1);
        assert!(schema.attribute_id("nope").is_err());
    }
}
