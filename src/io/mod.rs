//! Table I/O: chunked reading, transparent decompression, and the append sink.

pub mod compression;
pub mod reader;
pub mod sink;

pub use reader::{ChunkedReader, IndexColumn, ReadOptions, RowFilter, RowView, read_table};
pub use sink::AppendSink;
