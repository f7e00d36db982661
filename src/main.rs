use clap::{Parser, Subcommand};
use log::LevelFilter;
use std::path::PathBuf;
use std::process::ExitCode;
use tabconv::{
    Compression, CompressionSpec, Config, ConversionRequest, Converter, Failure, RowRange,
    SchemaRequest,
};

/// Convert tabular data between CSV, Parquet, Feather, Excel, ORC, Stata, SPSS, SAS and HTML
#[derive(Parser)]
#[command(name = "tabconv")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only report errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert one file into another format
    Convert {
        /// Source file
        input: PathBuf,

        /// Target file
        output: PathBuf,

        /// Source format, instead of guessing from the extension
        #[arg(long, value_name = "FORMAT")]
        input_format: Option<String>,

        /// Target format, instead of guessing from the extension
        #[arg(long, value_name = "FORMAT")]
        output_format: Option<String>,

        /// Output compression: none, gzip, snappy, zstd or lz4
        #[arg(long)]
        compression: Option<Compression>,

        /// Compression level; ignored by formats without levels
        #[arg(long, value_name = "N")]
        compression_level: Option<u32>,

        /// Half-open range of data rows to keep, e.g. 0:100 or 500:
        #[arg(long, value_name = "START:END", allow_hyphen_values = true)]
        rows: Option<RowRange>,

        /// Read the input in chunks of N rows
        #[arg(long, value_name = "N")]
        input_chunk_size: Option<usize>,

        /// Accepted for compatibility; writes follow the input chunking
        #[arg(long, value_name = "N")]
        output_chunk_size: Option<usize>,

        /// Worksheet to read (Excel input) or name (Excel output)
        #[arg(long, value_name = "NAME")]
        sheet_name: Option<String>,

        /// 0-based index of the table to read from an HTML page
        #[arg(long, value_name = "N")]
        table_number: Option<usize>,

        /// Keep SAS, Stata and SPSS text columns as raw bytes
        #[arg(long)]
        sas_keep_bytes: bool,

        /// JSON schema file whose column types are applied before writing
        #[arg(long, value_name = "PATH")]
        schema_file: Option<PathBuf>,
    },

    /// Export the column types of a file as a JSON schema
    Schema {
        /// Accepted for compatibility; exporting is the only schema action
        #[arg(long)]
        export_schema: bool,

        /// Source file
        input: PathBuf,

        /// JSON file to write
        output: PathBuf,

        /// Source format, instead of guessing from the extension
        #[arg(long, value_name = "FORMAT")]
        input_format: Option<String>,

        /// Rows sampled to infer types
        #[arg(
            long,
            value_name = "N",
            default_value_t = tabconv::request::DEFAULT_SCHEMA_SAMPLE_ROWS
        )]
        nrows: usize,

        /// Worksheet to sample (Excel input)
        #[arg(long, value_name = "NAME")]
        sheet_name: Option<String>,

        /// 0-based index of the table to sample from an HTML page
        #[arg(long, value_name = "N")]
        table_number: Option<usize>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if cli.verbose {
        config = config.with_log_level(LevelFilter::Debug);
    } else if cli.quiet {
        config = config.with_log_level(LevelFilter::Error);
    }
    setup_logging(config.log_level);

    let converter = Converter::new(config);
    let outcome = match cli.command {
        Commands::Convert {
            input,
            output,
            input_format,
            output_format,
            compression,
            compression_level,
            rows,
            input_chunk_size,
            output_chunk_size,
            sheet_name,
            table_number,
            sas_keep_bytes,
            schema_file,
        } => {
            let request = ConversionRequest {
                input,
                output,
                input_format,
                output_format,
                rows,
                input_chunk_size,
                output_chunk_size,
                compression: CompressionSpec::new(compression, compression_level),
                sheet_name,
                table_number,
                keep_bytes: sas_keep_bytes,
                schema_file,
            };
            converter.convert(&request).map(|report| {
                if !cli.quiet {
                    println!(
                        "Converted {} ({}) to {} ({}): {} rows",
                        request.input.display(),
                        report.input_format,
                        request.output.display(),
                        report.output_format,
                        report.rows_written
                    );
                }
            })
        }
        Commands::Schema {
            export_schema: _,
            input,
            output,
            input_format,
            nrows,
            sheet_name,
            table_number,
        } => {
            let request = SchemaRequest {
                input,
                output,
                input_format,
                sample_rows: nrows,
                sheet_name,
                table_number,
            };
            converter.export_schema(&request).map(|description| {
                if !cli.quiet {
                    println!(
                        "Schema with {} column(s) written to {}",
                        description.len(),
                        request.output.display()
                    );
                }
            })
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            report_failure(&failure);
            ExitCode::from(failure.exit_code() as u8)
        }
    }
}

/// Log to stderr at the configured level, without timestamps or targets
fn setup_logging(level: LevelFilter) {
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn report_failure(failure: &Failure) {
    eprintln!("Error: {}", failure);
    if let Some(preview) = &failure.preview {
        eprintln!("Rows in flight:\n{}", preview);
    }
}
