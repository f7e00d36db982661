use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tabconv::{Config, ConversionRequest, Converter};
use tempfile::TempDir;

fn write_sample_csv(path: &Path, rows: usize) {
    let mut out = BufWriter::new(File::create(path).unwrap());
    writeln!(out, "id,name,value,flag").unwrap();
    for i in 0..rows {
        writeln!(out, "{},Name_{},{},{}", i, i, i as f64 * 1.5, i % 2 == 0).unwrap();
    }
    out.flush().unwrap();
}

fn quiet_converter() -> Converter {
    Converter::new(Config::default().with_log_level(log::LevelFilter::Off))
}

fn benchmark_csv_to_parquet(c: &mut Criterion) {
    let mut group = c.benchmark_group("csv_to_parquet");
    group.sample_size(10);

    for size in [1000, 10000, 100000].iter() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("input.csv");
        write_sample_csv(&input, *size);
        let output = dir.path().join("output.parquet");

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            let converter = quiet_converter();
            b.iter(|| {
                let report = converter
                    .convert(&ConversionRequest::new(&input, &output))
                    .unwrap();
                black_box(report);
            });
        });
    }

    group.finish();
}

fn benchmark_chunked(c: &mut Criterion) {
    let mut group = c.benchmark_group("csv_to_parquet_chunked");
    group.sample_size(10);

    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.csv");
    write_sample_csv(&input, 100_000);
    let output = dir.path().join("output.parquet");

    for chunk in [1000, 10000, 50000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(chunk), chunk, |b, &chunk| {
            let converter = quiet_converter();
            b.iter(|| {
                let request = ConversionRequest::new(&input, &output).input_chunk_size(chunk);
                black_box(converter.convert(&request).unwrap());
            });
        });
    }

    group.finish();
}

fn benchmark_csv_to_excel(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.csv");
    write_sample_csv(&input, 10_000);
    let output = dir.path().join("output.xlsx");

    c.bench_function("csv_to_excel_10000_rows", |b| {
        let converter = quiet_converter();
        b.iter(|| {
            let request = ConversionRequest::new(&input, &output).input_chunk_size(2000);
            black_box(converter.convert(&request).unwrap());
        });
    });
}

criterion_group!(benches, benchmark_csv_to_parquet, benchmark_chunked, benchmark_csv_to_excel);
criterion_main!(benches);
