//! # tabconv
//!
//! Streaming conversion between tabular file formats.
//!
//! Every reader produces a [`BatchStream`] of Arrow record batches and every
//! writer consumes batches through a [`TableSink`], so any readable format can
//! be converted into any writable one, whole or in bounded chunks.
//!
//! | Format  | Extensions              | Read | Write |
//! |---------|-------------------------|------|-------|
//! | CSV     | `.csv`                  | yes  | yes   |
//! | TSV     | `.tsv`                  | yes  | yes   |
//! | PSV     | `.psv`                  | yes  | yes   |
//! | Parquet | `.parquet`, `.pq`       | yes  | yes   |
//! | Feather | `.feather`, `.arrow`, `.ipc` | yes  | yes   |
//! | Excel   | `.xlsx`, `.xlsm`        | yes  | yes   |
//! | Stata   | `.dta`                  | yes  | yes   |
//! | SPSS    | `.sav`                  | yes  | no    |
//! | HTML    | `.html`, `.htm`         | yes  | no    |
//! | ORC     | `.orc`                  | yes  | yes   |
//! | SAS     | `.sas7bdat`             | yes  | no    |
//!
//! ## Quick Start
//!
//! ```no_run
//! use tabconv::{Config, ConversionRequest, Converter};
//!
//! let converter = Converter::new(Config::from_env());
//! let request = ConversionRequest::new("sales.csv", "sales.parquet")
//!     .rows("0:1000".parse()?)
//!     .input_chunk_size(250);
//!
//! match converter.convert(&request) {
//!     Ok(report) => println!("{} rows written", report.rows_written),
//!     Err(failure) => {
//!         eprintln!("{}", failure);
//!         if let Some(preview) = &failure.preview {
//!             eprintln!("{}", preview);
//!         }
//!     }
//! }
//! # Ok::<(), tabconv::ConvertError>(())
//! ```
//!
//! ## Schema files
//!
//! A schema file is a JSON object mapping column names to type tags, in
//! column order:
//!
//! ```json
//! {
//!   "id": "int64",
//!   "name": "string"
//! }
//! ```
//!
//! [`Converter::export_schema`] writes one from a sample of the input;
//! [`ConversionRequest::schema_file`] applies one while converting.

pub mod codec;
pub mod config;
pub mod convert;
pub mod csv;
pub mod csv_reader;
pub mod csv_writer;
pub mod entities;
pub mod error;
pub mod fast_writer;
pub mod feather;
pub mod format;
pub mod html;
pub mod infer;
pub mod orc;
pub mod parquet;
pub mod preview;
pub mod request;
pub mod sas;
pub mod schema;
pub mod spss;
pub mod stata;
pub mod stream;
pub mod streaming_reader;
pub mod types;

pub use codec::{codec, Codec, TableSink};
pub use config::Config;
pub use convert::{ConversionReport, Converter, Failure, Stage};
pub use error::{ConvertError, Result};
pub use format::{resolve_format, Compression, CompressionSpec, Format};
pub use request::{ConversionRequest, ReadOptions, RowRange, SchemaRequest, WriteOptions};
pub use schema::{SchemaDescription, TypeTag};
pub use stream::{BatchStream, RowSelector};
