//! The staged loading pipeline.
//!
//! Both FASTQ paths run here. The plain path assembles spots with a
//! one-spot lookahead across readers and checks collation as it goes. The
//! spot-assembly path makes two passes: pass one collects every read name
//! and assigns spot ids, pass two streams reads through bounded stages
//! (read -> merge -> save-or-assemble -> write -> telemetry, with a
//! batched clear stage) while far-apart mates wait in the spot store.
//!
//! All queues are bounded; the slowest stage throttles upstream. A shared
//! cancel flag is polled at every 100 ms dequeue timeout, so a failure in
//! any stage drains the others promptly.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use crate::collation::{check_duplicate_spot_names, SearchTerm, SpotNameCheck, VERIFY_BATCH};
use crate::digest::GroupDigest;
use crate::error::{ErrorBudget, LoaderError, Result};
use crate::name_index::{assign_spot_ids, NameIndex, SpotAssignment};
use crate::read::{Platform, Read};
use crate::reader::{FastqReader, ScoreValidator};
use crate::spot_store::SpotStore;
use crate::telemetry::{InputMetrics, Telemetry};
use crate::writer::{Fingerprint, SpotWriter};

const READ_QUEUE_SIZE: usize = 5120;
const SAVE_SPOT_QUEUE_SIZE: usize = 1024;
const ASSEMBLE_QUEUE_SIZE: usize = 2048;
const TELEMETRY_QUEUE_SIZE: usize = 2048;
const CLEAR_QUEUE_SIZE: usize = 1024;

const POLL: Duration = Duration::from_millis(100);
const OPTIMIZE_EVERY_ROWS: u64 = 10_000_000;
pub const DEFAULT_HOT_READS_THRESHOLD: u64 = 10_000_000;

/// Send with back-pressure; gives up when the run is cancelled or the
/// consumer is gone.
fn send_guarded<T>(tx: &Sender<T>, mut item: T, cancelled: &AtomicBool) -> bool {
    loop {
        if cancelled.load(Ordering::Relaxed) {
            return false;
        }
        match tx.send_timeout(item, POLL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => item = back,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

/// Blocking receive with the cancellation poll; None when upstream is done
/// or the run is cancelled.
fn recv_guarded<T>(rx: &Receiver<T>, cancelled: &AtomicBool) -> Option<T> {
    loop {
        if cancelled.load(Ordering::Relaxed) {
            return None;
        }
        match rx.recv_timeout(POLL) {
            Ok(item) => return Some(item),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

/// What a reader thread hands back when its stream ends.
struct ReaderEnd {
    line_number: u64,
    metrics: InputMetrics,
    defline_types: Vec<String>,
    fingerprint: Fingerprint,
}

enum ReaderMsg {
    Read(Box<Read>),
    Eof(Box<ReaderEnd>),
}

struct SpotRead {
    read: Read,
    is_last: bool,
}

struct AssembledSpot {
    spot_name: String,
    spot_id: u32,
    reads: Vec<Read>,
}

/// Base and quality counts of duplicate reads removed during assembly; they
/// are backed out of the input metrics so conservation still balances.
#[derive(Default)]
struct DupAdjust {
    count: u64,
    len: u64,
    base_counts: Vec<(u8, u64)>,
    quality_counts: BTreeMap<i16, u64>,
}

impl DupAdjust {
    fn record(&mut self, read: &Read) {
        self.count += 1;
        self.len += read.sequence().len() as u64;
        for b in read.sequence().bytes() {
            match self.base_counts.iter_mut().find(|(base, _)| *base == b) {
                Some((_, n)) => *n += 1,
                None => self.base_counts.push((b, 1)),
            }
        }
        for score in read.qual_scores() {
            *self.quality_counts.entry(score).or_default() += 1;
        }
    }

    fn apply(&self, telemetry: &mut Telemetry) {
        telemetry.input.duplicate_reads_count += self.count;
        telemetry.input.duplicate_reads_len += self.len;
        for (base, n) in &self.base_counts {
            telemetry.input.base_counts[*base as usize] -= n;
        }
        for (score, n) in &self.quality_counts {
            if let Some(have) = telemetry.input.quality_counts.get_mut(score) {
                *have -= n;
            }
        }
    }
}

pub struct GroupOptions {
    pub validator: ScoreValidator,
    pub allow_early_end: bool,
    pub is_10x: bool,
    pub hot_reads_threshold: u64,
}

fn build_readers(
    group: &GroupDigest,
    validator: ScoreValidator,
    with_file_read_types: bool,
    budget: &Arc<ErrorBudget>,
) -> Result<Vec<FastqReader>> {
    let mut readers = Vec::with_capacity(group.files.len());
    for f in &group.files {
        let read_types = if with_file_read_types { f.read_types.clone() } else { Vec::new() };
        let platform = Platform::from_code(f.platform_code.first().copied().unwrap_or(0))?;
        let mut reader = FastqReader::open(&f.file_path, read_types, platform, false, validator)?;
        reader.set_error_budget(Arc::clone(budget));
        readers.push(reader);
    }
    Ok(readers)
}

fn sort_by_readnum(group: &GroupDigest) -> bool {
    group.files.len() == 2 && group.files.iter().all(|f| !f.read_nums.is_empty())
}

/// Sort spot reads into file order: reader index, then line number.
fn sort_file_order(reads: &mut [Read]) {
    reads.sort_by(|l, r| {
        l.reader_idx.cmp(&r.reader_idx).then(l.line_number.cmp(&r.line_number))
    });
}

/// Remove reads that duplicate another read of the same spot (same read
/// number, sequence and quality).
fn remove_duplicate_reads(reads: &mut Vec<Read>, dups: &mut DupAdjust) {
    reads.sort_by(|l, r| {
        l.read_num()
            .cmp(r.read_num())
            .then_with(|| l.sequence().cmp(r.sequence()))
            .then_with(|| l.qual_scores().cmp(&r.qual_scores()))
    });
    let mut i = 1;
    while i < reads.len() {
        let dup = {
            let (a, b) = (&reads[i - 1], &reads[i]);
            a.read_num() == b.read_num()
                && a.sequence() == b.sequence()
                && a.qual_scores() == b.qual_scores()
        };
        if dup {
            let removed = reads.remove(i);
            dups.record(&removed);
        } else {
            i += 1;
        }
    }
}

/// Dedup, order and type the reads of one assembled spot.
fn prepare_assembled_spot(
    reads: &mut Vec<Read>,
    read_types: &[char],
    by_readnum: bool,
    dups: &mut DupAdjust,
) -> Result<()> {
    if reads.len() > 1 {
        remove_duplicate_reads(reads, dups);
        if by_readnum {
            // dedup sorting left the reads in read-number order; types are
            // still applied in file order
            if !read_types.is_empty() {
                if read_types.len() < reads.len() {
                    return Err(LoaderError::new(
                        30,
                        format!(
                            "readTypes number should match the number of reads {} != {}",
                            read_types.len(),
                            reads.len()
                        ),
                    ));
                }
                let mut order: Vec<usize> = (0..reads.len()).collect();
                order.sort_by(|&a, &b| {
                    reads[a]
                        .reader_idx
                        .cmp(&reads[b].reader_idx)
                        .then(reads[a].line_number.cmp(&reads[b].line_number))
                });
                for (type_idx, read_idx) in order.into_iter().enumerate() {
                    reads[read_idx].set_type(read_types[type_idx])?;
                }
            }
        } else {
            sort_file_order(reads);
            if !read_types.is_empty() {
                if read_types.len() < reads.len() {
                    return Err(LoaderError::new(
                        30,
                        format!(
                            "readTypes number should match the number of reads {} != {}",
                            read_types.len(),
                            reads.len()
                        ),
                    ));
                }
                for (read, rt) in reads.iter_mut().zip(read_types.iter()) {
                    read.set_type(*rt)?;
                }
            }
        }
    } else if let (Some(read), Some(rt)) = (reads.first_mut(), read_types.first()) {
        read.set_type(*rt)?;
    }
    Ok(())
}

fn spawn_reader<'scope, 'env>(
    s: &'scope std::thread::Scope<'scope, 'env>,
    mut reader: FastqReader,
    reader_idx: u16,
    tx: Sender<ReaderMsg>,
    cancelled: &'env AtomicBool,
) -> std::thread::ScopedJoinHandle<'scope, Result<()>> {
    s.spawn(move || {
        let run = || -> Result<()> {
            let mut fingerprint = Fingerprint::default();
            let mut read = Read::default();
            while !cancelled.load(Ordering::Relaxed) {
                if !reader.get_read(&mut read)? {
                    break;
                }
                read.reader_idx = reader_idx;
                fingerprint.record(read.sequence());
                if !send_guarded(&tx, ReaderMsg::Read(Box::new(std::mem::take(&mut read))), cancelled) {
                    return Ok(());
                }
            }
            let end = ReaderEnd {
                line_number: reader.line_number(),
                metrics: std::mem::take(&mut reader.metrics),
                defline_types: reader.seen_defline_types(),
                fingerprint,
            };
            send_guarded(&tx, ReaderMsg::Eof(Box::new(end)), cancelled);
            Ok(())
        };
        let result = run();
        if result.is_err() {
            cancelled.store(true, Ordering::Relaxed);
        }
        result
    })
}

struct MergeOutcome {
    ends: Vec<Option<ReaderEnd>>,
    rows: u64,
    early_end: bool,
}

/// Round-robin merge of the reader streams, preserving the cross-file read
/// order of the first pass. `for_read` sees rows in that order.
fn merge_readers(
    rxs: &[Receiver<ReaderMsg>],
    file_names: &[String],
    allow_early_end: bool,
    cancelled: &AtomicBool,
    mut for_read: impl FnMut(u64, Read) -> Result<()>,
) -> Result<MergeOutcome> {
    let n = rxs.len();
    let mut ends: Vec<Option<ReaderEnd>> = (0..n).map(|_| None).collect();
    let mut eof = vec![false; n];
    let mut row_id = 0u64;
    let mut early_end = false;
    loop {
        let mut has_reads = false;
        for i in 0..n {
            if eof[i] {
                continue;
            }
            match recv_guarded(&rxs[i], cancelled) {
                Some(ReaderMsg::Read(read)) => {
                    has_reads = true;
                    for_read(row_id, *read)?;
                    row_id += 1;
                }
                Some(ReaderMsg::Eof(end)) => {
                    ends[i] = Some(*end);
                    eof[i] = true;
                }
                None => {
                    eof[i] = true;
                }
            }
        }
        let at_eof = eof.iter().filter(|e| **e).count();
        if at_eof == n {
            break;
        }
        if at_eof > 0 {
            if !allow_early_end {
                let i = eof.iter().position(|e| *e).unwrap();
                let line = ends[i].as_ref().map(|e| e.line_number).unwrap_or(0);
                return Err(LoaderError::new(
                    180,
                    format!(
                        "{} ended early at line {}. Use '--allowEarlyFileEnd' to allow load to finish.",
                        file_names[i], line
                    ),
                ));
            }
            early_end = true;
        }
        if !has_reads {
            break;
        }
        if cancelled.load(Ordering::Relaxed) {
            break;
        }
    }
    Ok(MergeOutcome { ends, rows: row_id, early_end })
}

fn fold_reader_ends(
    ends: Vec<Option<ReaderEnd>>,
    group: &GroupDigest,
    telemetry: &mut Telemetry,
    writer: &mut SpotWriter,
) {
    for (i, end) in ends.into_iter().enumerate() {
        if let Some(end) = end {
            telemetry.input.fold(&end.metrics);
            telemetry.group_mut().defline_types.extend(end.defline_types);
            let source = group
                .files
                .get(i)
                .map(|f| f.file_path.clone())
                .unwrap_or_else(|| format!("input_{}", i));
            writer.set_source_fingerprint(&source, end.fingerprint);
        }
    }
}

/// Pass one of the spot-assembly path: stream every read, collect names,
/// assign spot ids.
pub fn first_pass(
    group: &GroupDigest,
    opts: &GroupOptions,
    budget: &Arc<ErrorBudget>,
) -> Result<(NameIndex, SpotAssignment)> {
    let readers = build_readers(group, opts.validator, false, budget)?;
    let file_names: Vec<String> = group.files.iter().map(|f| f.file_path.clone()).collect();
    let cancelled = AtomicBool::new(false);
    let mut names = NameIndex::new();

    std::thread::scope(|s| -> Result<()> {
        let mut rxs = Vec::new();
        let mut handles = Vec::new();
        for (i, reader) in readers.into_iter().enumerate() {
            let (tx, rx) = bounded(READ_QUEUE_SIZE);
            handles.push(spawn_reader(s, reader, i as u16, tx, &cancelled));
            rxs.push(rx);
        }
        let merged = merge_readers(&rxs, &file_names, opts.allow_early_end, &cancelled, |_row, read| {
            names.push(read.spot());
            Ok(())
        });
        if merged.is_err() {
            cancelled.store(true, Ordering::Relaxed);
        }
        for handle in handles {
            handle.join().expect("reader thread panicked")?;
        }
        merged.map(|_| ())
    })?;

    log::info!("first pass collected {} reads", names.len());
    names.remap_and_freeze();
    let assignment = assign_spot_ids(&names, opts.hot_reads_threshold)?;
    log::info!(
        "{} spots assigned, name index memory: {}",
        assignment.total_spots,
        names.memory_used()
    );
    Ok((names, assignment))
}

/// Pass two of the spot-assembly path.
#[allow(clippy::too_many_arguments)]
pub fn second_pass(
    group: &GroupDigest,
    opts: &GroupOptions,
    assignment: &SpotAssignment,
    read_types: &[char],
    writer: &mut SpotWriter,
    telemetry: &mut Telemetry,
    budget: &Arc<ErrorBudget>,
) -> Result<()> {
    let readers = build_readers(group, opts.validator, false, budget)?;
    let file_names: Vec<String> = group.files.iter().map(|f| f.file_path.clone()).collect();
    let by_readnum = sort_by_readnum(group);
    let store = SpotStore::new(
        assignment.max_reads_per_spot().min(4) as usize,
        opts.validator.mid_score(),
    );
    let cancelled = AtomicBool::new(false);
    let writer_ref = &mut *writer;
    let telemetry_ref = &mut *telemetry;

    let mut merge_result: Option<MergeOutcome> = None;
    let scope_result: Result<(u64, DupAdjust)> = std::thread::scope(|s| {
        let (save_tx, save_rx) = bounded::<SpotRead>(SAVE_SPOT_QUEUE_SIZE);
        let (assemble_tx, assemble_rx) = bounded::<AssembledSpot>(ASSEMBLE_QUEUE_SIZE);
        let (clear_tx, clear_rx) = bounded::<u32>(CLEAR_QUEUE_SIZE);
        let (telemetry_tx, telemetry_rx) = bounded::<Vec<Read>>(TELEMETRY_QUEUE_SIZE);

        let mut reader_handles = Vec::new();
        let mut rxs = Vec::new();
        for (i, reader) in readers.into_iter().enumerate() {
            let (tx, rx) = bounded(READ_QUEUE_SIZE);
            reader_handles.push(spawn_reader(s, reader, i as u16, tx, &cancelled));
            rxs.push(rx);
        }

        let store_ref = &store;
        let cancelled_ref = &cancelled;

        // save-or-assemble stage
        let saver = s.spawn(move || {
            let run = || -> Result<(u64, DupAdjust)> {
                let mut dups = DupAdjust::default();
                let mut spots = 0u64;
                while let Some(spot_read) = recv_guarded(&save_rx, cancelled_ref) {
                    let read = spot_read.read;
                    let spot_id = read.spot_id;
                    debug_assert!(spot_id != 0);
                    let is_hot = assignment.is_hot(spot_id);
                    if spot_read.is_last {
                        let mut reads = store_ref.get_spot(spot_id, is_hot);
                        let spot_name = read.spot().to_string();
                        reads.push(read);
                        if reads.len() > 4 {
                            return Err(LoaderError::new(
                                210,
                                format!("Spot {} has more than 4 reads", spot_name),
                            ));
                        }
                        prepare_assembled_spot(&mut reads, read_types, by_readnum, &mut dups)?;
                        spots += 1;
                        if !send_guarded(
                            &assemble_tx,
                            AssembledSpot { spot_name, spot_id, reads },
                            cancelled_ref,
                        ) {
                            break;
                        }
                    } else {
                        store_ref.save_read(spot_id, read, is_hot)?;
                    }
                }
                Ok((spots, dups))
            };
            let result = run();
            if result.is_err() {
                cancelled_ref.store(true, Ordering::Relaxed);
            }
            result
        });

        // write stage
        let writer_handle = s.spawn(move || {
            let run = || -> Result<u64> {
                let mut spot_count = 0u64;
                let mut read_count = 0u64;
                while let Some(spot) = recv_guarded(&assemble_rx, cancelled_ref) {
                    writer_ref.write_spot(&spot.spot_name, &spot.reads)?;
                    spot_count += 1;
                    read_count += spot.reads.len() as u64;
                    if !send_guarded(&clear_tx, spot.spot_id, cancelled_ref) {
                        break;
                    }
                    if !send_guarded(&telemetry_tx, spot.reads, cancelled_ref) {
                        break;
                    }
                    if spot_count % 10_000_000 == 0 {
                        log::info!("spots: {}, reads: {}", spot_count, read_count);
                    }
                }
                log::info!("spots: {}, reads: {}", spot_count, read_count);
                Ok(spot_count)
            };
            let result = run();
            if result.is_err() {
                cancelled_ref.store(true, Ordering::Relaxed);
            }
            result
        });

        // clear stage
        let clearer = s.spawn(move || {
            while let Some(spot_id) = recv_guarded(&clear_rx, cancelled_ref) {
                store_ref.clear_spot(spot_id, assignment.is_hot(spot_id));
            }
        });

        // telemetry stage
        let telemetry_handle = s.spawn(move || {
            while let Some(reads) = recv_guarded(&telemetry_rx, cancelled_ref) {
                telemetry_ref.update_spot(&reads);
            }
        });

        // feed: round-robin merge with spot ids attached
        let expected_rows = assignment.read_index.len() as u64;
        let merged = merge_readers(&rxs, &file_names, opts.allow_early_end, &cancelled, |row_id, mut read| {
            if row_id >= expected_rows {
                return Err(LoaderError::runtime(format!(
                    "Invalid assembly: more reads than the first pass saw ({})",
                    expected_rows
                )));
            }
            read.spot_id = assignment.spot_id(row_id as u32);
            let is_last = assignment.is_last_in_spot(row_id as u32);
            if !send_guarded(&save_tx, SpotRead { read, is_last }, &cancelled) {
                return Err(LoaderError::runtime("pipeline cancelled"));
            }
            if (row_id + 1) % OPTIMIZE_EVERY_ROWS == 0 {
                store.optimize();
            }
            Ok(())
        });
        drop(save_tx);
        if merged.is_err() {
            cancelled.store(true, Ordering::Relaxed);
        }

        for handle in reader_handles {
            handle.join().expect("reader thread panicked")?;
        }
        let saved = saver.join().expect("save thread panicked");
        let written = writer_handle.join().expect("write thread panicked");
        clearer.join().expect("clear thread panicked");
        telemetry_handle.join().expect("telemetry thread panicked");

        let (spots, dups) = saved?;
        written?;
        merge_result = Some(merged?);
        Ok((spots, dups))
    });

    let (spots, dups) = scope_result?;
    let outcome = merge_result.expect("merge outcome set on success");

    if spots != assignment.total_spots {
        return Err(LoaderError::runtime(format!(
            "Invalid assembly: Spot counts do not match {} != {}",
            assignment.total_spots, spots
        )));
    }
    if outcome.rows != assignment.read_index.len() as u64 {
        return Err(LoaderError::runtime(format!(
            "Invalid assembly: Read counts do not match {} != {}",
            assignment.read_index.len(),
            outcome.rows
        )));
    }

    store.flush_pending_clears();
    if outcome.early_end {
        telemetry.group_mut().is_early_end = true;
    }
    fold_reader_ends(outcome.ends, group, telemetry, writer);
    dups.apply(telemetry);
    Ok(())
}

/// The spot-assembly path for one input group: two passes plus read-type
/// defaulting in between.
pub fn run_group_with_assembly(
    group: &GroupDigest,
    opts: &GroupOptions,
    read_types: &mut Vec<char>,
    writer: &mut SpotWriter,
    telemetry: &mut Telemetry,
    budget: &Arc<ErrorBudget>,
) -> Result<()> {
    budget.reset();
    let start = std::time::Instant::now();
    let (_names, assignment) = first_pass(group, opts, budget)?;
    telemetry.timings.insert("first_pass".to_string(), start.elapsed().as_secs_f64());

    telemetry.assembly.number_of_far_reads = assignment.far_reads;
    telemetry.assembly.reads_stats = assignment.reads_counts.clone();
    telemetry.is_spot_assembly = true;

    let max_reads = assignment.max_reads_per_spot();
    if read_types.is_empty() {
        if opts.is_10x {
            read_types.resize(max_reads.min(4) as usize, 'A');
        } else {
            read_types.resize(max_reads.min(2) as usize, 'B');
        }
    }

    budget.reset();
    let start = std::time::Instant::now();
    second_pass(group, opts, &assignment, read_types, writer, telemetry, budget)?;
    telemetry.timings.insert("second_pass".to_string(), start.elapsed().as_secs_f64());
    Ok(())
}

/// The plain path for one clustered group: assemble each spot across
/// readers by name lookahead, write in arrival order, check collation.
pub fn run_group(
    group: &GroupDigest,
    opts: &GroupOptions,
    name_check: &mut SpotNameCheck,
    spot_names: &mut NameIndex,
    writer: &mut SpotWriter,
    telemetry: &mut Telemetry,
    budget: &Arc<ErrorBudget>,
) -> Result<()> {
    let mut readers = build_readers(group, opts.validator, true, budget)?;
    let file_names: Vec<String> = group.files.iter().map(|f| f.file_path.clone()).collect();
    let by_readnum = sort_by_readnum(group);
    let num_readers = readers.len();
    let cancelled = AtomicBool::new(false);

    let mut fingerprints: Vec<Fingerprint> =
        (0..num_readers).map(|_| Fingerprint::default()).collect();
    let mut search_terms: Vec<SearchTerm> = Vec::with_capacity(VERIFY_BATCH);
    let mut rejected_spots = 0u64;
    let mut early_end = false;
    let writer_ref = &mut *writer;
    let telemetry_ref = &mut *telemetry;

    let scope_result: Result<()> = std::thread::scope(|s| {
        let (assemble_tx, assemble_rx) = bounded::<AssembledSpot>(ASSEMBLE_QUEUE_SIZE);
        let (telemetry_tx, telemetry_rx) = bounded::<Vec<Read>>(TELEMETRY_QUEUE_SIZE);
        let cancelled_ref = &cancelled;

        let writer_handle = s.spawn(move || {
            let run = || -> Result<()> {
                while let Some(mut spot) = recv_guarded(&assemble_rx, cancelled_ref) {
                    if by_readnum {
                        spot.reads.sort_by(|l, r| l.read_num().cmp(r.read_num()));
                    }
                    writer_ref.write_spot(&spot.spot_name, &spot.reads)?;
                    if !send_guarded(&telemetry_tx, spot.reads, cancelled_ref) {
                        break;
                    }
                }
                Ok(())
            };
            let result = run();
            if result.is_err() {
                cancelled_ref.store(true, Ordering::Relaxed);
            }
            result
        });

        let telemetry_handle = s.spawn(move || {
            while let Some(reads) = recv_guarded(&telemetry_rx, cancelled_ref) {
                telemetry_ref.update_spot(&reads);
            }
        });

        let feed = || -> Result<()> {
            let mut spot_reads: Vec<Vec<Read>> = vec![Vec::new(); num_readers];
            let mut assembled: Vec<Read> = Vec::new();
            loop {
                let mut has_spots = false;
                let mut eof_count = 0;
                for i in 0..num_readers {
                    let step = || -> Result<bool> {
                        match readers[i].get_next_spot(&mut spot_reads[i])? {
                            None => Ok(false),
                            Some(spot_name) => {
                                for j in 0..num_readers {
                                    if j != i {
                                        readers[j].get_spot(&spot_name, &mut spot_reads[j])?;
                                    }
                                }
                                assembled.clear();
                                for (idx, reads) in spot_reads.iter_mut().enumerate() {
                                    for mut read in reads.drain(..) {
                                        read.reader_idx = idx as u16;
                                        assembled.push(read);
                                    }
                                }
                                if assembled.len() > 4 {
                                    return Err(LoaderError::new(
                                        210,
                                        format!(
                                            "Spot {} has more than 4 reads",
                                            assembled[0].spot()
                                        ),
                                    ));
                                }
                                Ok(true)
                            }
                        }
                    };
                    match step() {
                        Ok(false) => {
                            if readers[i].eof() {
                                eof_count += 1;
                            } else {
                                has_spots = true;
                            }
                            continue;
                        }
                        Ok(true) => {}
                        Err(e) => {
                            budget.check(e)?;
                            rejected_spots += 1;
                            has_spots = true;
                            continue;
                        }
                    }
                    has_spots = true;

                    let spot_name = assembled[0].spot().to_string();
                    let line_no = assembled[0].line_number;
                    let reader_idx = assembled[0].reader_idx as usize;
                    for read in &assembled {
                        fingerprints[read.reader_idx as usize].record(read.sequence());
                    }
                    if !send_guarded(
                        &assemble_tx,
                        AssembledSpot {
                            spot_name: spot_name.clone(),
                            spot_id: 0,
                            reads: std::mem::take(&mut assembled),
                        },
                        cancelled_ref,
                    ) {
                        return Err(LoaderError::runtime("pipeline cancelled"));
                    }
                    spot_names.push(&spot_name);
                    if name_check.seen_before(&spot_name) {
                        search_terms.push(SearchTerm { spot_name, line_no, reader_idx });
                        if search_terms.len() >= VERIFY_BATCH {
                            check_duplicate_spot_names(spot_names, &search_terms, &file_names, budget)?;
                            search_terms.clear();
                        }
                    }
                }
                if eof_count == num_readers {
                    break;
                }
                if eof_count > 0 && !opts.allow_early_end {
                    for reader in readers.iter() {
                        if reader.eof() {
                            return Err(LoaderError::new(
                                180,
                                format!(
                                    "{} ended early at line {}. Use '--allowEarlyFileEnd' to allow load to finish.",
                                    reader.file_name(),
                                    reader.line_number()
                                ),
                            ));
                        }
                    }
                }
                if eof_count > 0 {
                    early_end = true;
                }
                if !has_spots {
                    break;
                }
                if cancelled_ref.load(Ordering::Relaxed) {
                    break;
                }
            }
            Ok(())
        };
        let fed = feed();
        drop(assemble_tx);
        if fed.is_err() {
            cancelled.store(true, Ordering::Relaxed);
        }
        writer_handle.join().expect("write thread panicked")?;
        telemetry_handle.join().expect("telemetry thread panicked");
        fed
    });
    scope_result?;

    if !search_terms.is_empty() {
        check_duplicate_spot_names(spot_names, &search_terms, &file_names, budget)?;
    }

    telemetry.group_mut().rejected_spots += rejected_spots;
    if early_end {
        telemetry.group_mut().is_early_end = true;
    }
    for (i, reader) in readers.iter().enumerate() {
        telemetry.input.fold(&reader.metrics);
        telemetry
            .group_mut()
            .defline_types
            .extend(reader.seen_defline_types());
        let fp = std::mem::take(&mut fingerprints[i]);
        writer.set_source_fingerprint(reader.file_name(), fp);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{get_digest, DEFAULT_DIGEST_SPOTS};
    use crate::writer::{MemoryRowSink, NameColumn, RowSink, SpotRow};
    use std::sync::Mutex;

    struct SharedSink(Arc<Mutex<MemoryRowSink>>);

    impl RowSink for SharedSink {
        fn write_row(&mut self, row: &SpotRow) -> Result<()> {
            self.0.lock().unwrap().write_row(row)
        }
        fn set_metadata(&mut self, key: &str, value: &str) -> Result<()> {
            self.0.lock().unwrap().set_metadata(key, value)
        }
        fn set_metadata_attr(&mut self, key: &str, attr: &str, value: &str) -> Result<()> {
            self.0.lock().unwrap().set_metadata_attr(key, attr, value)
        }
    }

    fn write_file(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path.to_str().unwrap().to_string()
    }

    fn opts(validator: ScoreValidator) -> GroupOptions {
        GroupOptions {
            validator,
            allow_early_end: false,
            is_10x: false,
            hot_reads_threshold: DEFAULT_HOT_READS_THRESHOLD,
        }
    }

    fn phred33() -> ScoreValidator {
        ScoreValidator::Phred { min: 33, max: 126 }
    }

    fn run_plain(
        batches: &[Vec<String>],
        read_types: &mut Vec<char>,
    ) -> Result<(Arc<Mutex<MemoryRowSink>>, Telemetry)> {
        let budget = Arc::new(ErrorBudget::new(100));
        let mut digest = get_digest(batches, &budget, DEFAULT_DIGEST_SPOTS)?;
        crate::digest::process_digest(&mut digest, read_types, false, false, None)?;
        let store = Arc::new(Mutex::new(MemoryRowSink::default()));
        let mut writer = SpotWriter::new(
            Box::new(SharedSink(store.clone())),
            Platform::Illumina,
            NameColumn::Name,
        );
        let mut telemetry = Telemetry::default();
        let mut name_check = SpotNameCheck::new(1000);
        let mut spot_names = NameIndex::new();
        for group in &digest.groups {
            let validator =
                ScoreValidator::from_encoding(group.files[0].quality_encoding)?;
            run_group(
                group,
                &opts(validator),
                &mut name_check,
                &mut spot_names,
                &mut writer,
                &mut telemetry,
                &budget,
            )?;
        }
        writer.close()?;
        telemetry.conservation_check()?;
        Ok((store, telemetry))
    }

    #[test]
    fn test_single_file_two_spots_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "reads.fastq", "@A 1:N:0:X\nGATT\n+\n!!!!\n@B 1:N:0:X\nACGT\n+\n!!!!\n");
        let (store, telemetry) = run_plain(&[vec![path]], &mut Vec::new()).unwrap();
        let sink = store.lock().unwrap();
        assert_eq!(sink.rows.len(), 2);
        assert_eq!(sink.rows[0].name.as_deref(), Some("A"));
        assert_eq!(sink.rows[0].read, "GATT");
        assert_eq!(sink.rows[0].quality, vec![33, 33, 33, 33]);
        assert_eq!(sink.rows[0].read_type, vec![crate::read::READ_TYPE_BIOLOGICAL]);
        assert_eq!(sink.rows[0].spot_group, "X");
        assert_eq!(sink.rows[1].name.as_deref(), Some("B"));
        assert_eq!(sink.rows[1].read, "ACGT");
        assert_eq!(telemetry.output.spot_count, 2);
    }

    #[test]
    fn test_paired_files_merge_one_spot() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = write_file(&dir, "r1.fastq", "@S 1:N:0:G\nGA\n+\n!!\n");
        let p2 = write_file(&dir, "r2.fastq", "@S 2:N:0:G\nTT\n+\n!!\n");
        let (store, _) = run_plain(&[vec![p1, p2]], &mut Vec::new()).unwrap();
        let sink = store.lock().unwrap();
        assert_eq!(sink.rows.len(), 1);
        assert_eq!(sink.rows[0].read, "GATT");
        assert_eq!(sink.rows[0].read_start, vec![0, 2]);
        assert_eq!(sink.rows[0].read_len, vec![2, 2]);
    }

    #[test]
    fn test_duplicate_spot_name_is_error_170() {
        let dir = tempfile::tempdir().unwrap();
        let body = "@X 1:N:0:G\nGA\n+\n!!\n@Y 1:N:0:G\nTT\n+\n!!\n@X 1:N:0:G\nCC\n+\n!!\n";
        let path = write_file(&dir, "reads.fastq", body);
        let e = run_plain(&[vec![path]], &mut Vec::new()).unwrap_err();
        assert_eq!(e.code(), 170);
    }

    #[test]
    fn test_early_end_without_flag_is_error_180() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = write_file(
            &dir,
            "r1.fastq",
            "@S 1:N:0:G\nGA\n+\n!!\n@T 1:N:0:G\nCA\n+\n!!\n",
        );
        let p2 = write_file(&dir, "r2.fastq", "@S 2:N:0:G\nTT\n+\n!!\n");
        let e = run_plain(&[vec![p1, p2]], &mut Vec::new()).unwrap_err();
        assert_eq!(e.code(), 180);
    }

    fn run_assembly(
        batches: &[Vec<String>],
        hot_threshold: u64,
    ) -> Result<(Arc<Mutex<MemoryRowSink>>, Telemetry)> {
        let budget = Arc::new(ErrorBudget::new(100));
        let mut digest = get_digest(batches, &budget, DEFAULT_DIGEST_SPOTS)?;
        let mut read_types = Vec::new();
        crate::digest::process_digest(&mut digest, &mut read_types, true, false, None)?;
        let store = Arc::new(Mutex::new(MemoryRowSink::default()));
        let mut writer = SpotWriter::new(
            Box::new(SharedSink(store.clone())),
            Platform::Illumina,
            NameColumn::Name,
        );
        let mut telemetry = Telemetry::default();
        for group in &digest.groups {
            let validator = ScoreValidator::from_encoding(group.files[0].quality_encoding)?;
            let opts = GroupOptions {
                validator,
                allow_early_end: true,
                is_10x: false,
                hot_reads_threshold: hot_threshold,
            };
            run_group_with_assembly(
                group,
                &opts,
                &mut read_types,
                &mut writer,
                &mut telemetry,
                &budget,
            )?;
        }
        writer.close()?;
        telemetry.conservation_check()?;
        Ok((store, telemetry))
    }

    #[test]
    fn test_assembly_merges_interleaved_mates() {
        let dir = tempfile::tempdir().unwrap();
        // mates of S are separated by spot T
        let body = "@S 1:N:0:G\nGA\n+\n!!\n@T 1:N:0:G\nCC\n+\n!!\n@S 2:N:0:G\nTT\n+\n!!\n";
        let path = write_file(&dir, "reads.fastq", body);
        let (store, telemetry) = run_assembly(&[vec![path]], DEFAULT_HOT_READS_THRESHOLD).unwrap();
        let sink = store.lock().unwrap();
        assert_eq!(sink.rows.len(), 2);
        let s_row = sink.rows.iter().find(|r| r.name.as_deref() == Some("S")).unwrap();
        assert_eq!(s_row.read, "GATT");
        assert_eq!(s_row.read_len, vec![2, 2]);
        let t_row = sink.rows.iter().find(|r| r.name.as_deref() == Some("T")).unwrap();
        assert_eq!(t_row.read, "CC");
        assert_eq!(telemetry.output.spot_count, 2);
    }

    #[test]
    fn test_assembly_cold_path_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        // hot threshold zero forces every spot through the cold store
        let body = "@S 1:N:0:G\nGATTAC\n+\nIIIIII\n@T 1:N:0:G\nCCGG\n+\nFFFF\n@S 2:N:0:G\nTTAA\n+\nIIII\n";
        let path = write_file(&dir, "reads.fastq", body);
        let (store, telemetry) = run_assembly(&[vec![path]], 0).unwrap();
        let sink = store.lock().unwrap();
        assert_eq!(sink.rows.len(), 2);
        let s_row = sink.rows.iter().find(|r| r.name.as_deref() == Some("S")).unwrap();
        assert_eq!(s_row.read, "GATTACTTAA");
        assert_eq!(s_row.quality, vec![73, 73, 73, 73, 73, 73, 73, 73, 73, 73]);
        // every read travelled through the cold store
        assert_eq!(telemetry.assembly.number_of_far_reads, 3);
    }

    #[test]
    fn test_assembly_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = write_file(&dir, "r1.fastq", "@S 1:N:0:G\nGA\n+\n!!\n@U 1:N:0:G\nAA\n+\n!!\n");
        let p2 = write_file(&dir, "r2.fastq", "@S 2:N:0:G\nTT\n+\n!!\n");
        let (store, _) = run_assembly(&[vec![p1, p2]], DEFAULT_HOT_READS_THRESHOLD).unwrap();
        let sink = store.lock().unwrap();
        assert_eq!(sink.rows.len(), 2);
        let s_row = sink.rows.iter().find(|r| r.name.as_deref() == Some("S")).unwrap();
        assert_eq!(s_row.read_len, vec![2, 2]);
    }

    #[test]
    fn test_assembly_removes_duplicate_reads() {
        let dir = tempfile::tempdir().unwrap();
        let body = "@S 1:N:0:G\nGA\n+\n!!\n@T 1:N:0:G\nCC\n+\n!!\n@S 1:N:0:G\nGA\n+\n!!\n";
        let path = write_file(&dir, "reads.fastq", body);
        let (store, telemetry) = run_assembly(&[vec![path]], DEFAULT_HOT_READS_THRESHOLD).unwrap();
        let sink = store.lock().unwrap();
        let s_row = sink.rows.iter().find(|r| r.name.as_deref() == Some("S")).unwrap();
        assert_eq!(s_row.read, "GA");
        assert_eq!(telemetry.input.duplicate_reads_count, 1);
    }

    #[test]
    fn test_prepare_orders_by_file_position() {
        let mut reads = Vec::new();
        for (reader_idx, line, seq) in [(1u16, 1u64, "CC"), (0u16, 5u64, "GA"), (0u16, 1u64, "TT")] {
            let mut read = Read::default();
            read.set_sequence(seq);
            read.set_qual_scores(vec![40; 2]);
            read.reader_idx = reader_idx;
            read.line_number = line;
            reads.push(read);
        }
        let mut dups = DupAdjust::default();
        prepare_assembled_spot(&mut reads, &['B', 'B', 'B'], false, &mut dups).unwrap();
        let seqs: Vec<&str> = reads.iter().map(|r| r.sequence()).collect();
        assert_eq!(seqs, vec!["TT", "GA", "CC"]);
    }
}
