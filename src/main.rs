use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use serde_json::json;

use spotload::bam::{BamLoadOptions, BamLoader, JsonLinesBamSink};
use spotload::collation::SpotNameCheck;
use spotload::digest::{self, DEFAULT_DIGEST_SPOTS};
use spotload::error::{print_error_codes, ErrorBudget, LoaderError};
use spotload::name_index::NameIndex;
use spotload::pipeline::{self, GroupOptions, DEFAULT_HOT_READS_THRESHOLD};
use spotload::read::Platform;
use spotload::reader::{cluster_files, ScoreValidator};
use spotload::telemetry::{peak_rss_kb, Telemetry};
use spotload::writer::{JsonLinesSink, NameColumn, RowSink, SpotWriter};
use spotload::{build_read_pair_batches, check_input_files, defline};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Loads FASTQ and BAM sequencing data into a columnar archive"
)]
struct Args {
    /// Input files (FASTQ, FASTQ.gz, FASTQ.bz2, BAM, or SAM); '-' reads
    /// plain FASTQ from stdin
    files: Vec<String>,

    /// Output archive stream path; stdout when not provided
    #[arg(long)]
    output: Option<PathBuf>,

    /// Read 1 files, comma separated
    #[arg(long = "read1PairFiles", value_delimiter = ',')]
    read1_pair_files: Vec<String>,

    /// Read 2 files, comma separated
    #[arg(long = "read2PairFiles", value_delimiter = ',')]
    read2_pair_files: Vec<String>,

    /// Read 3 files, comma separated
    #[arg(long = "read3PairFiles", value_delimiter = ',')]
    read3_pair_files: Vec<String>,

    /// Read 4 files, comma separated
    #[arg(long = "read4PairFiles", value_delimiter = ',')]
    read4_pair_files: Vec<String>,

    /// Read types, a string over {T,B,A}
    #[arg(long = "readTypes", default_value = "")]
    read_types: String,

    /// Optional platform name, recorded in the telemetry report
    #[arg(long)]
    platform: Option<String>,

    /// Assemble spots by read name across the whole run (two-pass mode)
    #[arg(long = "spot-assembly", visible_alias = "sa")]
    spot_assembly: bool,

    /// Complete the load when one of the files ends early
    #[arg(long = "allowEarlyFileEnd")]
    allow_early_file_end: bool,

    /// Discard spot names entirely (same as --name-column NONE)
    #[arg(long = "useAndDiscardNames")]
    use_and_discard_names: bool,

    /// NAME column handling
    #[arg(long = "name-column", default_value = "NAME", value_parser = ["NONE", "NAME", "RAW_NAME"])]
    name_column: String,

    /// Force the quality encoding (0, 33 or 64) instead of detecting it
    #[arg(long, short = 'q')]
    quality: Option<i32>,

    /// Maximum number of recoverable errors before the run aborts
    #[arg(long = "max-err-count", default_value_t = 100)]
    max_err_count: u32,

    /// Max number of threads to use (0 means 8; the floor is 3)
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Cache budget in MiB for the BAM key index, arena and fragment bank
    #[arg(long = "cache-size", default_value_t = 1024)]
    cache_size_mb: u64,

    /// Spots per output flush
    #[arg(long = "batch-size", default_value_t = 10000)]
    batch_size: usize,

    /// Spots whose reads sit closer than this stay in memory
    #[arg(long = "hot-reads-threshold", default_value_t = DEFAULT_HOT_READS_THRESHOLD)]
    hot_reads_threshold: u64,

    /// Directory for spill files (BAM key index, arena, fragment bank)
    #[arg(long)]
    tmpfs: Option<PathBuf>,

    /// Report a summary of the input data instead of loading; the optional
    /// value caps the number of spots analyzed
    #[arg(long, num_args = 0..=1, default_missing_value = "250000")]
    digest: Option<i64>,

    /// Telemetry report file
    #[arg(long, short = 't')]
    telemetry: Option<PathBuf>,

    /// Fail instead of switching modes when a BAM file is not
    /// coordinate-sorted
    #[arg(long = "require-sorted")]
    require_sorted: bool,

    /// Declare the BAM input unsorted up front
    #[arg(long)]
    unsorted: bool,

    /// Keep secondary alignments out of the archive
    #[arg(long = "no-secondary")]
    no_secondary: bool,

    /// Accept spots with inconsistent PCR duplicate flags
    #[arg(long = "accept-bad-dups")]
    accept_bad_dups: bool,

    /// Minimum mapping quality for a record to stay aligned
    #[arg(long = "min-mapq", default_value_t = 0)]
    min_mapq: u8,

    /// Print the registered defline patterns and exit
    #[arg(long = "print-deflines")]
    print_deflines: bool,

    /// Print the error code registry and exit
    #[arg(long = "help-errors", visible_alias = "help_errors")]
    help_errors: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum InputKind {
    Fastq,
    Bam,
}

fn input_kind(files: &[String]) -> Result<InputKind, LoaderError> {
    let mut kinds = files.iter().map(|f| {
        let lower = f.to_lowercase();
        if lower.ends_with(".bam") || lower.ends_with(".sam") {
            InputKind::Bam
        } else {
            InputKind::Fastq
        }
    });
    let first = kinds.next().unwrap_or(InputKind::Fastq);
    if kinds.any(|k| k != first) {
        return Err(LoaderError::runtime("FASTQ and BAM inputs cannot be mixed in one run"));
    }
    Ok(first)
}

fn open_row_sink(output: &Option<PathBuf>) -> Result<Box<dyn RowSink>> {
    Ok(match output {
        Some(path) => Box::new(JsonLinesSink::new(BufWriter::new(File::create(path)?))),
        None => Box::new(JsonLinesSink::new(std::io::stdout())),
    })
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.help_errors {
        print_error_codes(&mut std::io::stdout()).ok();
        std::process::exit(0);
    }
    if args.print_deflines {
        for (name, pattern) in defline::DeflineParser::catalog() {
            println!("{}\t{}", name, pattern);
        }
        std::process::exit(0);
    }

    let start = Instant::now();
    let mut report = json!({ "version": env!("CARGO_PKG_VERSION") });
    let code = match run(&args, &mut report) {
        Ok(()) => {
            log::info!("severity=total,status=success");
            0
        }
        Err(e) => {
            // keep the report clean of control characters
            let message: String = e.to_string().chars().filter(|c| !c.is_control()).collect();
            log::error!("{}", message);
            report["error"] = message.into();
            log::info!("severity=total,status=failure");
            1
        }
    };
    report["timing"]["exec"] = ((start.elapsed().as_secs_f64() * 100.0).ceil() / 100.0).into();
    if let Some(rss) = peak_rss_kb() {
        report["max_memory_kb"] = rss.into();
    }
    if let Some(path) = &args.telemetry {
        if let Err(e) = std::fs::write(path, format!("{:#}\n", report)) {
            log::error!("Failed to write telemetry report: {}", e);
        }
    }
    std::process::exit(code);
}

fn run(args: &Args, report: &mut serde_json::Value) -> Result<()> {
    let threads = match args.threads {
        0 => 8,
        n => n.max(3),
    };
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .map_err(|e| LoaderError::runtime(format!("Failed to build thread pool: {}", e)))?;

    if let Some(platform) = &args.platform {
        report["--platform"] = platform.clone().into();
    }
    if !args.read_types.is_empty() {
        report["--readTypes"] = args.read_types.clone().into();
    }
    if let Some(c) = args.read_types.chars().find(|c| !"TBA".contains(*c)) {
        return Err(LoaderError::new(150, format!("Invalid --readTypes values '{}'", c)).into());
    }
    if let Some(q) = args.quality {
        if !matches!(q, 0 | 33 | 64) {
            return Err(LoaderError::from_code(200).into());
        }
    }
    let mut read_types: Vec<char> = args.read_types.chars().collect();

    // assemble the input batches
    let pair_lists = [
        args.read1_pair_files.clone(),
        args.read2_pair_files.clone(),
        args.read3_pair_files.clone(),
        args.read4_pair_files.clone(),
    ];
    let has_read_pairs = pair_lists.iter().any(|l| !l.is_empty());
    let mut allow_early_end = args.allow_early_file_end;
    let input_batches: Vec<Vec<String>>;
    let files: Vec<String>;
    if has_read_pairs {
        if args.digest.is_none() && read_types.is_empty() {
            return Err(LoaderError::from_code(20).into());
        }
        let mut batches = build_read_pair_batches(&pair_lists)?;
        for batch in &mut batches {
            check_input_files(batch)?;
        }
        files = batches.iter().flatten().cloned().collect();
        input_batches = batches;
    } else if args.files.is_empty() {
        files = vec!["-".to_string()];
        input_batches = vec![vec!["-".to_string()]];
    } else {
        let mut sorted = args.files.clone();
        sorted.sort();
        check_input_files(&mut sorted)?;
        if input_kind(&sorted)? == InputKind::Bam {
            input_batches = vec![sorted.clone()];
        } else if args.spot_assembly {
            allow_early_end = true;
            input_batches = vec![sorted.clone()];
        } else {
            input_batches = cluster_files(&sorted)?;
        }
        files = sorted;
    }

    if input_kind(&files)? == InputKind::Bam {
        return run_bam(args, &files, report);
    }

    let budget = Arc::new(ErrorBudget::new(args.max_err_count));

    if let Some(digest_spots) = args.digest {
        return print_digest(&input_batches, &budget, digest_spots);
    }

    // fix the run layout
    let mut run_digest = digest::get_digest(&input_batches, &budget, DEFAULT_DIGEST_SPOTS)?;
    digest::process_digest(
        &mut run_digest,
        &mut read_types,
        args.spot_assembly,
        has_read_pairs,
        args.quality,
    )?;
    budget.reset();

    let first = &run_digest.groups[0].files[0];
    let platform = Platform::from_code(first.platform_code.first().copied().unwrap_or(0))?;
    let quality_encoding = first.quality_encoding;
    let name_column = if args.use_and_discard_names {
        NameColumn::None
    } else {
        NameColumn::parse(&args.name_column)
            .ok_or_else(|| LoaderError::runtime("Invalid --name-column"))?
    };

    let mut writer = SpotWriter::new(open_row_sink(&args.output)?, platform, name_column);
    writer.set_batch_size(args.batch_size);
    let mut telemetry = Telemetry::default();
    telemetry.platform_code = platform as u8;
    telemetry.quality_code = quality_encoding;

    let estimated_spots: u64 = run_digest.groups.iter().map(|g| g.estimated_spots).sum();
    let mut name_check = SpotNameCheck::new(estimated_spots.max(1));
    let mut spot_names = NameIndex::new();

    for group in &run_digest.groups {
        let validator = ScoreValidator::from_encoding(
            group.files.first().map(|f| f.quality_encoding).unwrap_or(quality_encoding),
        )?;
        let opts = GroupOptions {
            validator,
            allow_early_end,
            is_10x: group.is_10x,
            hot_reads_threshold: args.hot_reads_threshold,
        };
        telemetry.start_group();
        {
            let g = telemetry.group_mut();
            g.files = group.files.iter().map(|f| f.file_path.clone()).collect();
            g.is_10x = group.is_10x;
            g.reads_per_spot = group.total_reads;
            g.has_read_names = group.files.iter().any(|f| !f.read_nums.is_empty());
            g.is_interleaved = group.files.iter().any(|f| f.max_reads > 1);
        }

        let result = if args.spot_assembly {
            pipeline::run_group_with_assembly(
                group,
                &opts,
                &mut read_types,
                &mut writer,
                &mut telemetry,
                &budget,
            )
        } else {
            pipeline::run_group(
                group,
                &opts,
                &mut name_check,
                &mut spot_names,
                &mut writer,
                &mut telemetry,
                &budget,
            )
        };
        if let Err(e) = result {
            merge_report(report, &telemetry);
            return Err(e.into());
        }
    }

    writer.close()?;
    telemetry.conservation_check()?;
    log::info!("Parsing complete");
    merge_report(report, &telemetry);
    Ok(())
}

fn merge_report(report: &mut serde_json::Value, telemetry: &Telemetry) {
    if let serde_json::Value::Object(map) = telemetry.report() {
        for (k, v) in map {
            if k == "timing" {
                continue;
            }
            report[k.as_str()] = v;
        }
    }
    for (stage, secs) in &telemetry.timings {
        report["timing"][stage.as_str()] = ((*secs * 100.0).ceil() / 100.0).into();
    }
}

fn print_digest(
    input_batches: &[Vec<String>],
    budget: &Arc<ErrorBudget>,
    digest_spots: i64,
) -> Result<()> {
    let mut output = json!({});
    match digest::get_digest(input_batches, budget, digest_spots) {
        Ok(digest) => {
            output = serde_json::to_value(&digest)
                .map_err(|e| LoaderError::runtime(format!("digest serialization: {}", e)))?;
        }
        Err(e) => {
            let message: String = e.message().chars().filter(|c| !c.is_control()).collect();
            output["error"] = message.into();
        }
    }
    println!("{:#}", output);
    Ok(())
}

fn run_bam(args: &Args, files: &[String], report: &mut serde_json::Value) -> Result<()> {
    let tmp_dir = args.tmpfs.clone().unwrap_or_else(std::env::temp_dir);
    let opts = BamLoadOptions {
        tmp_dir,
        cache_size: args.cache_size_mb * 1024 * 1024,
        min_map_qual: args.min_mapq,
        accept_bad_dups: args.accept_bad_dups,
        require_sorted: args.require_sorted,
        expect_unsorted: args.unsorted,
        no_secondary: args.no_secondary,
        max_err_count: args.max_err_count,
        max_seq_len: 5000,
    };
    let legacy = spotload::bam::peek_read_group_count(Path::new(&files[0]))?
        > spotload::bam::keys::NUM_PARTITIONS;
    let sink = match &args.output {
        Some(path) => JsonLinesBamSink::new(
            Box::new(BufWriter::new(File::create(path)?)) as Box<dyn Write + Send>
        ),
        None => JsonLinesBamSink::new(Box::new(std::io::stdout()) as Box<dyn Write + Send>),
    };
    let mut loader = BamLoader::new(opts, sink, legacy)?;
    for file in files {
        loader.process_file(Path::new(file))?;
    }
    loader.finish()?;
    report["bam"] = json!({
        "records_read": loader.records_read(),
        "records_processed": loader.records_processed(),
        "spots": loader.spots_written(),
        "alignments": loader.alignments_written(),
        "unsorted": loader.ref_tracker().is_unsorted(),
    });
    Ok(())
}
