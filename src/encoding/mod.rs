//! # Encoding Module
//!
//! Fixed binary encodings shared by every on-disk structure:
//!
//! - **Varint encoding**: big-endian base-128 integers for payload sizes and rowids
//! - **Cell encoding**: the four B-tree cell shapes and the local/overflow payload split

pub mod cell;
pub mod varint;

pub use cell::{
    calculate_local_payload_size, decode_cell, decode_index_interior_cell,
    decode_index_leaf_cell, decode_table_interior_cell, decode_table_leaf_cell,
    encode_index_interior_cell, encode_index_leaf_cell, encode_table_interior_cell,
    encode_table_leaf_cell, Cell, CellKind, IndexInteriorCell, IndexLeafCell, TableInteriorCell,
    TableLeafCell,
};
pub use varint::{get_varint, put_varint, read_varint, varint_len};
