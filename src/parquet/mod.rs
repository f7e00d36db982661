//! Parquet reading and writing
//!
//! Reading goes through the Arrow record batch reader with the requested
//! chunk size as batch size. Writing streams every batch into an
//! `ArrowWriter`, so each chunk lands in the file as it arrives.
//!
//! # Example
//!
//! ```no_run
//! use tabconv::parquet::{ParquetReader, ParquetSink};
//! use tabconv::format::CompressionSpec;
//!
//! let reader = ParquetReader::open("data.parquet")?;
//! println!("{} rows, columns {:?}", reader.row_count(), reader.column_names());
//!
//! let spec = CompressionSpec::default();
//! let mut sink = ParquetSink::create("copy.parquet", reader.schema().clone(), &spec)?;
//! for batch in reader.batches(Some(10_000))? {
//!     sink.write(&batch?)?;
//! }
//! sink.close()?;
//! # Ok::<(), tabconv::error::ConvertError>(())
//! ```

pub mod reader;
pub mod writer;

pub use reader::{read_parquet, ParquetReader};
pub use writer::{open_parquet, ParquetSink};
