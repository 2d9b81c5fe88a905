//! # tilestore: Tiled Multi-Dimensional Array Storage Engine
//!
//! `tilestore` persists typed N-dimensional arrays, dense or sparse, on a
//! pluggable filesystem. Arrays are partitioned into tiles, each attribute
//! is stored columnar and optionally compressed, and every write produces
//! an immutable fragment so readers always see a consistent snapshot.
//!
//! ## Features
//!
//! - **Immutable fragments**: writers never disturb readers; a fragment
//!   becomes visible atomically when its sentinel is created
//! - **Columnar tiles**: each attribute compresses and reads independently
//! - **Codecs**: gzip, zstd, lz4, blosc-style shuffled variants, bzip2,
//!   double-delta and run-length coordinate encodings
//! - **Resumable reads**: fixed-size output buffers with per-attribute
//!   overflow flags; the next call continues at the exact cell
//! - **Consolidation**: merge all fragments into one without disturbing
//!   concurrent readers
//!
//! ## Quick Start
//!
//! ```no_run
//! use tilestore::{
//!     ArraySchema, Attribute, Context, Datatype, Layout, Mode, StorageConfig,
//!     coords_to_bytes,
//! };
//!
//! let context = Context::init(StorageConfig::new("/data"))?;
//!
//! let schema = ArraySchema::new(
//!     true,
//!     vec!["row".to_string(), "col".to_string()],
//!     Datatype::Int32,
//!     coords_to_bytes(&[0i32, 3, 0, 3]),
//!     Some(coords_to_bytes(&[2i32, 2])),
//!     Layout::RowMajor,
//!     Layout::RowMajor,
//!     0,
//!     vec![Attribute::new("a1", Datatype::Int32)],
//! )?;
//! context.array_create("dense_array", &schema)?;
//!
//! let mut array = context.array_init("dense_array", Mode::WriteSortedRow, None, None)?;
//! let values: Vec<i32> = (0..16).collect();
//! let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
//! array.write(&[bytes.as_slice()])?;
//! array.finalize()?;
//! # Ok::<(), tilestore::StoreError>(())
//! ```

pub mod array;
pub mod array_read_state;
pub mod bookkeeping;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod fragment;
pub mod fs;
pub mod read_state;
pub mod schema;
pub mod utils;
pub mod write_state;

pub use array::{Array, Context, Mode, ARRAY_SENTINEL};
pub use codec::{BloscSub, Codec};
pub use config::{ReadMethod, StorageConfig, WriteMethod};
pub use error::{last_error_message, Result, StoreError};
pub use schema::{
    coords_from_bytes, coords_to_bytes, ArraySchema, Attribute, CellValNum, Datatype, Layout,
};
pub use utils::ObjectType;
