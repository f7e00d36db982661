//! Conversion orchestration
//!
//! One request converts one source file into one target file:
//!
//! ```text
//! Resolving -> Reading -> SchemaApply? -> RowSelecting -> Writing -> Done
//! ```
//!
//! Any stage may fail; the caller receives a [`Failure`] naming the stage,
//! the error and a short preview of the rows that were in flight.

use crate::codec::{codec, Codec, TableSink};
use crate::config::Config;
use crate::error::{ConvertError, Result};
use crate::format::{resolve_format, Format};
use crate::preview::render_preview;
use crate::request::{ConversionRequest, ReadOptions, SchemaRequest, WriteOptions};
use crate::schema::{coerce_batch, SchemaDescription};
use arrow::record_batch::RecordBatch;
use std::cell::Cell;
use std::fmt;
use std::path::Path;
use std::rc::Rc;

/// Pipeline step a conversion is in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolving,
    Reading,
    SchemaApply,
    SchemaExport,
    RowSelecting,
    Writing,
    Done,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Resolving => "resolving",
            Stage::Reading => "reading",
            Stage::SchemaApply => "schema apply",
            Stage::SchemaExport => "schema export",
            Stage::RowSelecting => "row selecting",
            Stage::Writing => "writing",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Terminal failure of a conversion
#[derive(Debug, thiserror::Error)]
#[error("{stage} failed: {error}")]
pub struct Failure {
    pub stage: Stage,
    #[source]
    pub error: ConvertError,
    /// Rows observed when the failure happened, rendered as a table
    pub preview: Option<String>,
}

impl Failure {
    pub fn exit_code(&self) -> i32 {
        self.error.exit_code()
    }
}

/// Summary of a finished conversion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionReport {
    pub input_format: Format,
    pub output_format: Format,
    /// Rows pulled from the source, including rows outside the selected range
    pub rows_read: usize,
    pub rows_written: usize,
    pub chunks_written: usize,
}

/// Runs conversions and schema exports with one configuration
///
/// # Examples
///
/// ```no_run
/// use tabconv::config::Config;
/// use tabconv::convert::Converter;
/// use tabconv::request::ConversionRequest;
///
/// let converter = Converter::new(Config::from_env());
/// let report = converter
///     .convert(&ConversionRequest::new("input.csv", "output.parquet"))
///     .map_err(|failure| failure.error)?;
/// println!("wrote {} rows", report.rows_written);
/// # Ok::<(), tabconv::error::ConvertError>(())
/// ```
pub struct Converter {
    config: Config,
}

impl Converter {
    pub fn new(config: Config) -> Self {
        Converter { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Convert `request.input` into `request.output`
    ///
    /// The output file is only created once the first batch has been read,
    /// so resolution and early read failures never leave a file behind.
    pub fn convert(
        &self,
        request: &ConversionRequest,
    ) -> std::result::Result<ConversionReport, Failure> {
        let (input_codec, output_codec, declared) = self
            .resolve(request)
            .map_err(|e| self.failure(Stage::Resolving, e, None))?;
        let input_format = input_codec.format;
        let output_format = output_codec.format;

        log::info!(
            "Converting {} ({}) -> {} ({})",
            request.input.display(),
            input_format,
            request.output.display(),
            output_format
        );
        if let Some(size) = request.output_chunk_size {
            log::debug!(
                "Output chunk size {} ignored; writes follow the input chunking",
                size
            );
        }

        let read_options = ReadOptions {
            chunk_size: request.input_chunk_size,
            sheet_name: request.sheet_name.clone(),
            table_number: request.table_number.unwrap_or(0),
            keep_bytes: request.keep_bytes,
            row_limit: request.rows.and_then(|range| range.end),
            declared_types: declared.clone(),
        };
        let stream = input_codec
            .open_reader(&request.input, &read_options)
            .map_err(|e| self.failure(Stage::Reading, e, None))?;

        let target = match &declared {
            Some(description) => description
                .apply_to_schema(&stream.schema())
                .map_err(|e| self.failure(Stage::SchemaApply, e, None))?,
            None => stream.schema(),
        };

        // Rows pulled from the source, before the row range is applied
        let rows_read = Rc::new(Cell::new(0));
        let counter = rows_read.clone();
        let stream = stream.inspect(move |batch| counter.set(counter.get() + batch.num_rows()));
        let batches = match request.rows {
            Some(range) => {
                log::debug!("{}: keeping rows {}", Stage::RowSelecting, range);
                stream.select(range)
            }
            None => stream,
        };

        let write_options = WriteOptions {
            compression: request.compression,
            sheet_name: request.sheet_name.clone(),
        };
        let mut sink: Option<Box<dyn TableSink>> = None;
        let mut report = ConversionReport {
            input_format,
            output_format,
            rows_read: 0,
            rows_written: 0,
            chunks_written: 0,
        };

        for next in batches {
            let selected = match next {
                Ok(batch) => batch,
                Err(e) => return Err(self.abort(output_codec, sink, Stage::Reading, e, None)),
            };

            let batch = match &declared {
                Some(_) => match coerce_batch(&selected, &target) {
                    Ok(coerced) => coerced,
                    Err(e) => {
                        let stage = Stage::SchemaApply;
                        return Err(self.abort(output_codec, sink, stage, e, Some(&selected)));
                    }
                },
                None => selected,
            };

            if sink.is_none() {
                match output_codec.open_writer(&request.output, target.clone(), &write_options) {
                    Ok(opened) => sink = Some(opened),
                    Err(e) => return Err(self.failure(Stage::Writing, e, Some(&batch))),
                }
            }
            if let Some(open) = sink.as_mut() {
                if let Err(e) = open.write_batch(&batch) {
                    return Err(self.abort(output_codec, sink, Stage::Writing, e, Some(&batch)));
                }
            }
            report.rows_written += batch.num_rows();
            report.chunks_written += 1;
            log::debug!(
                "Wrote chunk {} ({} rows)",
                report.chunks_written,
                batch.num_rows()
            );
        }
        report.rows_read = rows_read.get();

        // Nothing selected: still produce a file holding just the header
        let sink = match sink {
            Some(sink) => sink,
            None => output_codec
                .open_writer(&request.output, target.clone(), &write_options)
                .map_err(|e| self.failure(Stage::Writing, e, None))?,
        };
        sink.finish()
            .map_err(|e| self.failure(Stage::Writing, e, None))?;

        log::info!(
            "{}: {} of {} rows written in {} chunk(s)",
            Stage::Done,
            report.rows_written,
            report.rows_read,
            report.chunks_written
        );
        Ok(report)
    }

    /// Sample `request.input` and save its column types as JSON
    pub fn export_schema(
        &self,
        request: &SchemaRequest,
    ) -> std::result::Result<SchemaDescription, Failure> {
        let input_codec = self
            .resolve_input(&request.input, request.input_format.as_deref())
            .and_then(|codec| {
                if request.sample_rows == 0 {
                    return Err(ConvertError::InvalidArgument(
                        "schema sample must cover at least 1 row".to_string(),
                    ));
                }
                Ok(codec)
            })
            .map_err(|e| self.failure(Stage::Resolving, e, None))?;

        let read_options = ReadOptions {
            chunk_size: None,
            sheet_name: request.sheet_name.clone(),
            table_number: request.table_number.unwrap_or(0),
            keep_bytes: false,
            row_limit: Some(request.sample_rows),
            declared_types: None,
        };
        let stream = input_codec
            .open_reader(&request.input, &read_options)
            .map_err(|e| self.failure(Stage::Reading, e, None))?;

        let description = SchemaDescription::from_arrow(&stream.schema())
            .and_then(|description| {
                description.save(&request.output)?;
                Ok(description)
            })
            .map_err(|e| self.failure(Stage::SchemaExport, e, None))?;

        log::info!(
            "Exported {} column type(s) from {} to {}",
            description.len(),
            request.input.display(),
            request.output.display()
        );
        Ok(description)
    }

    fn resolve(
        &self,
        request: &ConversionRequest,
    ) -> Result<(&'static Codec, &'static Codec, Option<SchemaDescription>)> {
        request.validate()?;

        let output_format = resolve_format(&request.output, request.output_format.as_deref())?;
        let output_codec = codec(output_format);
        if output_codec.writer.is_none() {
            return Err(ConvertError::UnsupportedFormat(format!(
                "{} cannot be written",
                output_format
            )));
        }
        output_codec.check_compression(&request.compression)?;

        let input_codec = self.resolve_input(&request.input, request.input_format.as_deref())?;

        let declared = match &request.schema_file {
            Some(path) => {
                let description = SchemaDescription::load(path)?;
                log::debug!(
                    "Loaded {} declared column type(s) from {}",
                    description.len(),
                    path.display()
                );
                Some(description)
            }
            None => None,
        };
        Ok((input_codec, output_codec, declared))
    }

    fn resolve_input(&self, path: &Path, format: Option<&str>) -> Result<&'static Codec> {
        let input_format = resolve_format(path, format)?;
        let input_codec = codec(input_format);
        if input_codec.reader.is_none() {
            return Err(ConvertError::UnsupportedFormat(format!(
                "{} cannot be read",
                input_format
            )));
        }
        if !path.exists() {
            return Err(ConvertError::FileNotFound(path.to_path_buf()));
        }
        Ok(input_codec)
    }

    /// Finalise what was written so far, then report the failure
    ///
    /// Append-capable sinks are finished so the target holds every chunk
    /// written before the failure. Buffering sinks are dropped unwritten.
    fn abort(
        &self,
        output: &Codec,
        sink: Option<Box<dyn TableSink>>,
        stage: Stage,
        error: ConvertError,
        in_flight: Option<&RecordBatch>,
    ) -> Failure {
        if let Some(sink) = sink {
            if output.appends {
                if let Err(e) = sink.finish() {
                    log::warn!("Could not finalise partial {} output: {}", output.format, e);
                }
            } else {
                log::warn!("Discarding buffered {} output", output.format);
            }
        }
        self.failure(stage, error, in_flight)
    }

    fn failure(
        &self,
        stage: Stage,
        error: ConvertError,
        in_flight: Option<&RecordBatch>,
    ) -> Failure {
        let shown = error.partial_rows().or(in_flight);
        let preview = shown.and_then(|batch| render_preview(batch, self.config.preview_rows));
        log::debug!("Conversion failed while {}: {}", stage, error);
        Failure {
            stage,
            error,
            preview,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Compression, CompressionSpec};
    use crate::request::RowRange;
    use crate::schema::TypeTag;
    use std::fs;
    use tempfile::tempdir;

    fn converter() -> Converter {
        Converter::new(Config::default())
    }

    #[test]
    fn test_csv_rows_selection() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.csv");
        let output = dir.path().join("out.csv");
        fs::write(&input, "a,b\n1,x\n2,y\n3,z\n").unwrap();

        let request = ConversionRequest::new(&input, &output).rows("0:2".parse().unwrap());
        let report = converter().convert(&request).unwrap();

        assert_eq!(report.rows_written, 2);
        assert_eq!(fs::read_to_string(&output).unwrap(), "a,b\n1,x\n2,y\n");
    }

    #[test]
    fn test_start_past_end_writes_header_only() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.csv");
        let output = dir.path().join("out.csv");
        fs::write(&input, "a,b\n1,x\n2,y\n").unwrap();

        let request = ConversionRequest::new(&input, &output)
            .rows(RowRange::new(10, None).unwrap())
            .input_chunk_size(1);
        let report = converter().convert(&request).unwrap();

        assert_eq!(report.rows_written, 0);
        assert_eq!(report.chunks_written, 0);
        assert_eq!(fs::read_to_string(&output).unwrap(), "a,b\n");
    }

    #[test]
    fn test_unwritable_format_creates_nothing() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.csv");
        let output = dir.path().join("out.sav");
        fs::write(&input, "a\n1\n").unwrap();

        let failure = converter()
            .convert(&ConversionRequest::new(&input, &output))
            .unwrap_err();
        assert_eq!(failure.stage, Stage::Resolving);
        assert_eq!(failure.exit_code(), 4);
        assert!(!output.exists());
    }

    #[test]
    fn test_missing_input_is_not_found() {
        let dir = tempdir().unwrap();
        let failure = converter()
            .convert(&ConversionRequest::new(
                dir.path().join("absent.csv"),
                dir.path().join("out.csv"),
            ))
            .unwrap_err();
        assert_eq!(failure.exit_code(), 3);
    }

    #[test]
    fn test_bad_compression_fails_before_reading() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.csv");
        let output = dir.path().join("out.csv");
        fs::write(&input, "a\n1\n").unwrap();

        let request = ConversionRequest::new(&input, &output)
            .compression(CompressionSpec::new(Some(Compression::Snappy), None));
        let failure = converter().convert(&request).unwrap_err();
        assert_eq!(failure.exit_code(), 2);
        assert!(!output.exists());
    }

    #[test]
    fn test_coercion_failure_has_preview() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.csv");
        let output = dir.path().join("out.parquet");
        let schema = dir.path().join("schema.json");
        fs::write(&input, "id,name\n1,a\ntwo,b\n").unwrap();
        SchemaDescription::new()
            .column("id", TypeTag::Int64)
            .save(&schema)
            .unwrap();

        let request = ConversionRequest::new(&input, &output).schema_file(&schema);
        let failure = converter().convert(&request).unwrap_err();

        assert_eq!(failure.stage, Stage::SchemaApply);
        match &failure.error {
            ConvertError::TypeCoercion {
                column,
                failed,
                samples,
                ..
            } => {
                assert_eq!(column, "id");
                assert_eq!(*failed, 1);
                assert_eq!(samples, &vec!["two".to_string()]);
            }
            other => panic!("expected a type coercion error, got {:?}", other),
        }
        let preview = failure.preview.unwrap();
        assert!(preview.contains("two"));
        assert!(!output.exists());
    }

    #[test]
    fn test_coercion_failure_in_later_chunk_keeps_earlier_chunks() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.csv");
        let output = dir.path().join("out.csv");
        let schema = dir.path().join("schema.json");
        fs::write(&input, "id,name\n1,a\n2,b\nthree,c\n").unwrap();
        SchemaDescription::new()
            .column("id", TypeTag::Int64)
            .save(&schema)
            .unwrap();

        let request = ConversionRequest::new(&input, &output)
            .schema_file(&schema)
            .input_chunk_size(2);
        let failure = converter().convert(&request).unwrap_err();

        assert!(matches!(failure.error, ConvertError::TypeCoercion { .. }));
        assert!(failure.preview.unwrap().contains("three"));
        assert_eq!(fs::read_to_string(&output).unwrap(), "id,name\n1,a\n2,b\n");
    }

    #[test]
    fn test_rows_read_counts_rows_before_selection() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.csv");
        let output = dir.path().join("out.csv");
        fs::write(&input, "n\n0\n1\n2\n3\n4\n5\n6\n7\n").unwrap();

        let request = ConversionRequest::new(&input, &output)
            .rows("2:5".parse().unwrap())
            .input_chunk_size(2);
        let report = converter().convert(&request).unwrap();

        assert_eq!(report.rows_written, 3);
        assert_eq!(report.chunks_written, 2);
        assert_eq!(report.rows_read, 6);
        assert_eq!(fs::read_to_string(&output).unwrap(), "n\n2\n3\n4\n");
    }

    #[test]
    fn test_export_schema() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.csv");
        let output = dir.path().join("schema.json");
        fs::write(&input, "col1,col2\n1,x\n2,y\n").unwrap();

        let description = converter()
            .export_schema(&SchemaRequest::new(&input, &output))
            .unwrap();
        assert_eq!(description.get("col1"), Some(TypeTag::Int64));
        assert_eq!(description.get("col2"), Some(TypeTag::String));
        assert!(output.exists());
    }
}
