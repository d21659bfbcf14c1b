//! FASTQ record reading.
//!
//! One reader owns one input stream and yields validated [`Read`]s, or whole
//! spots via a one-spot lookahead. Streams are plain, gzip or bzip2,
//! detected by magic bytes.

use std::fs::File;
use std::io::{BufRead, BufReader, Read as IoRead, Seek, SeekFrom};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::defline::DeflineParser;
use crate::error::{ErrorBudget, LoaderError, Result};
use crate::read::{Platform, Read};
use crate::telemetry::InputMetrics;

/// Quality score interpretation for the run, fixed by the digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreValidator {
    /// No validation; used during the digest pass.
    None,
    /// Whitespace-separated signed integers.
    Numeric { min: i16, max: i16 },
    /// One byte per score.
    Phred { min: i16, max: i16 },
}

impl ScoreValidator {
    pub fn from_encoding(encoding: i32) -> Result<ScoreValidator> {
        Ok(match encoding {
            0 => ScoreValidator::Numeric { min: -5, max: 40 },
            33 => ScoreValidator::Phred { min: 33, max: 126 },
            64 => ScoreValidator::Phred { min: 64, max: 126 },
            _ => return Err(LoaderError::from_code(200)),
        })
    }

    pub fn min_score(&self) -> i16 {
        match self {
            ScoreValidator::None => 0,
            ScoreValidator::Numeric { min, .. } | ScoreValidator::Phred { min, .. } => *min,
        }
    }

    /// Filler value for too-short quality strings and the zero point of the
    /// cold store's delta encoding.
    pub fn mid_score(&self) -> i16 {
        self.min_score() + 30
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ScoreValidator::Numeric { .. })
    }
}

struct CountingReader<R> {
    inner: R,
    pos: Arc<AtomicU64>,
}

impl<R: IoRead> IoRead for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.pos.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

pub struct InputStream {
    reader: Box<dyn BufRead + Send>,
    pos: Option<Arc<AtomicU64>>,
    compressed: bool,
}

/// Open a path (or `-` for stdin), sniffing gzip/bzip2 magic bytes.
pub fn open_stream(file_name: &str) -> Result<InputStream> {
    if file_name == "-" {
        return Ok(InputStream {
            reader: Box::new(BufReader::new(std::io::stdin())),
            pos: None,
            compressed: false,
        });
    }
    let mut file = File::open(file_name)
        .map_err(|_| LoaderError::new(40, format!("File '{}' does not exist", file_name)))?;
    let mut magic = [0u8; 3];
    let n = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;
    let pos = Arc::new(AtomicU64::new(0));
    let counting = CountingReader { inner: file, pos: Arc::clone(&pos) };
    let (reader, compressed): (Box<dyn BufRead + Send>, bool) = if n >= 2 && magic[..2] == [0x1f, 0x8b] {
        (
            Box::new(BufReader::new(flate2::read::MultiGzDecoder::new(counting))),
            true,
        )
    } else if n >= 3 && &magic == b"BZh" {
        (
            Box::new(BufReader::new(bzip2::read::MultiBzDecoder::new(counting))),
            true,
        )
    } else {
        (Box::new(BufReader::new(counting)), false)
    };
    Ok(InputStream { reader, pos: Some(pos), compressed })
}

pub struct FastqReader {
    file_name: String,
    stream: Box<dyn BufRead + Send>,
    compressed_pos: Option<Arc<AtomicU64>>,
    is_compressed: bool,
    defline_parser: DeflineParser,
    read_types: Vec<char>,
    expected_platform: Platform,
    platform_seen: Platform,
    validator: ScoreValidator,
    budget: Option<Arc<ErrorBudget>>,
    line_number: u64,
    at_eof: bool,
    line: String,
    buffered_defline: String,
    buffered_spot: Vec<Read>,
    pending_spot: Vec<Read>,
    next_reads: Vec<Read>,
    pub metrics: InputMetrics,
}

impl FastqReader {
    pub fn open(
        file_name: &str,
        read_types: Vec<char>,
        platform: Platform,
        match_all: bool,
        validator: ScoreValidator,
    ) -> Result<FastqReader> {
        let stream = open_stream(file_name)?;
        Ok(Self::from_stream(file_name, stream, read_types, platform, match_all, validator))
    }

    pub fn from_stream(
        file_name: &str,
        stream: InputStream,
        read_types: Vec<char>,
        platform: Platform,
        match_all: bool,
        validator: ScoreValidator,
    ) -> FastqReader {
        FastqReader {
            file_name: file_name.to_string(),
            stream: stream.reader,
            compressed_pos: stream.pos,
            is_compressed: stream.compressed,
            defline_parser: DeflineParser::new(match_all),
            read_types,
            expected_platform: platform,
            platform_seen: Platform::Undefined,
            validator,
            budget: None,
            line_number: 0,
            at_eof: false,
            line: String::new(),
            buffered_defline: String::new(),
            buffered_spot: Vec::new(),
            pending_spot: Vec::new(),
            next_reads: Vec::new(),
            metrics: InputMetrics::default(),
        }
    }

    pub fn set_error_budget(&mut self, budget: Arc<ErrorBudget>) {
        self.budget = Some(budget);
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    pub fn platform(&self) -> Platform {
        self.platform_seen
    }

    pub fn defline_type(&self) -> &'static str {
        self.defline_parser.defline_type()
    }

    pub fn seen_defline_types(&self) -> Vec<String> {
        self.defline_parser.seen_types().iter().map(|s| s.to_string()).collect()
    }

    pub fn is_compressed(&self) -> bool {
        self.is_compressed
    }

    /// Position in the (compressed) byte stream; drives the spot-count
    /// extrapolation.
    pub fn tellg(&self) -> u64 {
        self.compressed_pos.as_ref().map(|p| p.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub fn eof(&self) -> bool {
        self.at_eof
            && self.buffered_defline.is_empty()
            && self.buffered_spot.is_empty()
            && self.pending_spot.is_empty()
    }

    /// Read one raw line, trimmed; leaves `line` empty at end of stream.
    fn next_line(&mut self) -> Result<()> {
        self.line.clear();
        let mut raw = String::new();
        let n = self.stream.read_line(&mut raw)?;
        if n == 0 {
            self.at_eof = true;
            return Ok(());
        }
        self.line_number += 1;
        self.line.push_str(raw.trim());
        Ok(())
    }

    /// Read one record quartet. Ok(false) at end of stream.
    fn parse_read(&mut self, read: &mut Read) -> Result<bool> {
        if self.at_eof && self.buffered_defline.is_empty() {
            return Ok(false);
        }
        read.reset();
        if !self.buffered_defline.is_empty() {
            self.line.clear();
            std::mem::swap(&mut self.line, &mut self.buffered_defline);
        } else {
            self.next_line()?;
            while self.line.is_empty() {
                if self.at_eof {
                    return Ok(false);
                }
                self.next_line()?;
            }
        }

        read.line_number = self.line_number;
        self.metrics.defline_len += self.line.len() as u64;
        let defline = std::mem::take(&mut self.line);
        self.defline_parser.parse(&defline, read)?;

        // sequence lines until the '+' separator
        self.next_line()?;
        while !self.line.is_empty() && !self.line.starts_with('+') {
            if self.line.starts_with('@') || self.line.starts_with('>') {
                std::mem::swap(&mut self.buffered_defline, &mut self.line);
                break;
            }
            self.metrics.sequence_len += self.line.len() as u64;
            let seq_line = std::mem::take(&mut self.line);
            read.add_sequence_line(&seq_line);
            self.next_line()?;
        }

        if self.line.starts_with('+') {
            self.next_line()?;
            if !self.line.is_empty() {
                let mut expected = read.sequence().len();
                if self.validator.is_numeric() {
                    expected *= 4;
                }
                loop {
                    // a defline-shaped '@' line of the wrong length means
                    // the quality went missing
                    if self.line.starts_with('@')
                        && self.line.len() != expected
                        && self.defline_parser.matches_last(&self.line)
                    {
                        std::mem::swap(&mut self.buffered_defline, &mut self.line);
                        break;
                    }
                    self.metrics.quality_len += self.line.len() as u64;
                    let qual_line = std::mem::take(&mut self.line);
                    read.add_quality_line(&qual_line);
                    if read.quality().len() >= expected {
                        break;
                    }
                    self.next_line()?;
                    if self.line.is_empty() {
                        break;
                    }
                }
            }
        }
        Ok(true)
    }

    fn validate_read(&mut self, read: &mut Read) -> Result<()> {
        if read.sequence().is_empty() {
            return Err(LoaderError::new(110, format!("Read {}: no sequence data", read.spot())));
        }
        if read.quality().is_empty() && !self.at_eof {
            return Err(LoaderError::new(111, format!("Read {}: no quality scores", read.spot())));
        }
        if read.sequence().bytes().any(|b| !b.is_ascii_alphabetic()) {
            return Err(LoaderError::new(
                160,
                format!("Read {}: invalid sequence characters", read.spot()),
            ));
        }
        match self.validator {
            ScoreValidator::Numeric { min, max } => self.validate_numeric(read, min, max)?,
            ScoreValidator::Phred { min, max } => self.validate_phred(read, min, max)?,
            ScoreValidator::None => {}
        }
        for b in read.sequence().bytes() {
            self.metrics.base_counts[b as usize] += 1;
        }
        Ok(())
    }

    fn check_platform(&self) -> Result<()> {
        if self.expected_platform != self.defline_parser.platform() {
            return Err(LoaderError::new(
                70,
                format!(
                    "Input file has data from multiple platforms ({} != {})",
                    self.expected_platform as u8,
                    self.defline_parser.platform() as u8
                ),
            ));
        }
        Ok(())
    }

    fn validate_numeric(&mut self, read: &mut Read, min: i16, max: i16) -> Result<()> {
        let mut scores: Vec<i16> = Vec::with_capacity(read.sequence().len());
        for token in read.quality().split_ascii_whitespace() {
            let score: i16 = token.parse().map_err(|_| {
                LoaderError::new(120, format!("Read {}: invalid quality score value", read.spot()))
            })?;
            if score < min || score > max {
                return Err(LoaderError::new(
                    120,
                    format!(
                        "Read {}: unexpected quality score value '{}' ( valid range: [{}..{}] )",
                        read.spot(),
                        score,
                        min,
                        max
                    ),
                ));
            }
            scores.push(score);
        }
        let seq_len = read.sequence().len();
        if scores.len() > seq_len {
            log::warn!(
                "{}",
                LoaderError::new(
                    130,
                    format!("Read {}: quality score length exceeds sequence length", read.spot())
                )
                .message()
            );
            scores.truncate(seq_len);
        }
        let mid = min + 30;
        while scores.len() < seq_len {
            read.quality_mut().push(' ');
            read.quality_mut().push_str(&mid.to_string());
            scores.push(mid);
        }
        self.check_platform()?;
        for &score in &scores {
            *self.metrics.quality_counts.entry(score).or_default() += 1;
        }
        read.set_qual_scores(scores);
        Ok(())
    }

    fn validate_phred(&mut self, read: &mut Read, min: i16, max: i16) -> Result<()> {
        let seq_len = read.sequence().len();
        if read.quality().len() > seq_len {
            log::warn!(
                "{}",
                LoaderError::new(
                    130,
                    format!("Read {}: quality score length exceeds sequence length", read.spot())
                )
                .message()
            );
            read.quality_mut().truncate(seq_len);
        }
        for b in read.quality().bytes() {
            let score = b as i16;
            if score < min || score > max {
                return Err(LoaderError::new(
                    120,
                    format!(
                        "Read {}: unexpected quality score value '{}' ( valid range: [{}..{}] )",
                        read.spot(),
                        score,
                        min,
                        max
                    ),
                ));
            }
        }
        if read.quality().len() < seq_len {
            if read.quality().is_empty() && !self.at_eof {
                return Err(LoaderError::new(
                    111,
                    format!("Read {}: no quality scores", read.spot()),
                ));
            }
            let missing = seq_len - read.quality().len();
            let filler = (min + 30) as u8 as char;
            for _ in 0..missing {
                read.quality_mut().push(filler);
            }
        }
        self.check_platform()?;
        for b in read.quality().bytes() {
            *self.metrics.quality_counts.entry(b as i16).or_default() += 1;
        }
        Ok(())
    }

    /// Parse and validate one read. Recoverable failures are charged to the
    /// error budget and the read is skipped; without a budget they
    /// propagate.
    pub fn get_read(&mut self, read: &mut Read) -> Result<bool> {
        loop {
            let result = self.parse_read(read).and_then(|got| {
                if got {
                    self.validate_read(read)?;
                }
                Ok(got)
            });
            match result {
                Ok(got) => {
                    if got {
                        self.platform_seen = self.defline_parser.platform();
                    }
                    return Ok(got);
                }
                Err(mut e) => {
                    self.metrics.rejected_read_count += 1;
                    e.set_file(&self.file_name, read.line_number);
                    match &self.budget {
                        Some(budget) => budget.check(e)?,
                        None => return Err(e),
                    }
                }
            }
        }
    }

    /// Next whole spot: consecutive reads sharing a spot name, with this
    /// reader's read types applied. Ok(None) at end of stream.
    pub fn get_next_spot(&mut self, reads: &mut Vec<Read>) -> Result<Option<String>> {
        reads.clear();
        if !self.buffered_spot.is_empty() {
            std::mem::swap(reads, &mut self.buffered_spot);
            let name = reads[0].spot().to_string();
            self.apply_read_types(reads)?;
            return Ok(Some(name));
        }
        let mut read = Read::default();
        let spot_name;
        if self.pending_spot.is_empty() {
            if !self.get_read(&mut read)? {
                return Ok(None);
            }
            spot_name = read.spot().to_string();
            reads.push(std::mem::take(&mut read));
        } else {
            std::mem::swap(reads, &mut self.pending_spot);
            spot_name = reads[0].spot().to_string();
        }
        while self.get_read(&mut read)? {
            if read.spot() == spot_name {
                reads.push(std::mem::take(&mut read));
                continue;
            }
            self.pending_spot.push(std::mem::take(&mut read));
            break;
        }
        if reads.is_empty() {
            return Ok(None);
        }
        self.apply_read_types(reads)?;
        Ok(Some(spot_name))
    }

    fn apply_read_types(&self, reads: &mut [Read]) -> Result<()> {
        if self.read_types.is_empty() {
            return Ok(());
        }
        if self.read_types.len() < reads.len() {
            return Err(LoaderError::new(
                30,
                format!(
                    "readTypes number should match the number of reads {} != {}",
                    self.read_types.len(),
                    reads.len()
                ),
            ));
        }
        for (read, rt) in reads.iter_mut().zip(self.read_types.iter()) {
            read.set_type(*rt)?;
        }
        Ok(())
    }

    /// Search for `spot_name` within a one-spot lookahead; reads not
    /// belonging to it stay buffered for the next call.
    pub fn get_spot(&mut self, spot_name: &str, reads: &mut Vec<Read>) -> Result<bool> {
        let mut next_reads = std::mem::take(&mut self.next_reads);
        next_reads.clear();
        let found = match self.get_next_spot(&mut next_reads)? {
            None => false,
            Some(name) if name == spot_name => {
                *reads = std::mem::take(&mut next_reads);
                self.next_reads = next_reads;
                return Ok(true);
            }
            Some(_) => {
                if !self.pending_spot.is_empty() && self.pending_spot[0].spot() == spot_name {
                    self.get_next_spot(reads)?;
                    true
                } else {
                    false
                }
            }
        };
        self.buffered_spot = std::mem::take(&mut next_reads);
        self.next_reads = next_reads;
        Ok(found)
    }

    /// First spot name of the stream, used for clustering. Errors are
    /// swallowed for up to `attempts` reads.
    fn first_spot(&mut self, attempts: usize) -> Option<(String, Vec<Read>)> {
        let mut reads = Vec::new();
        for _ in 0..attempts {
            match self.get_next_spot(&mut reads) {
                Ok(Some(name)) => return Some((name, reads)),
                Ok(None) => return None,
                Err(_) => continue,
            }
        }
        None
    }
}

/// Cluster input files into batches sharing a common top spot, so paired
/// files land in one group. Group sizes must agree (error 11).
pub fn cluster_files(files: &[String]) -> Result<Vec<Vec<String>>> {
    let mut batches: Vec<Vec<String>> = Vec::new();
    if files.is_empty() {
        return Ok(batches);
    }
    if files.len() == 1 {
        batches.push(vec![files[0].clone()]);
        return Ok(batches);
    }
    let mut placed = vec![false; files.len()];
    for i in 0..files.len() {
        if placed[i] {
            continue;
        }
        placed[i] = true;
        let mut reader = FastqReader::open(
            &files[i],
            Vec::new(),
            Platform::Undefined,
            true,
            ScoreValidator::None,
        )?;
        let (spot, _reads) = reader
            .first_spot(100)
            .ok_or_else(|| LoaderError::new(50, format!("File '{}' has no reads", files[i])))?;
        let mut batch = vec![files[i].clone()];
        for j in 0..files.len() {
            if placed[j] {
                continue;
            }
            let mut other = FastqReader::open(
                &files[j],
                Vec::new(),
                Platform::Undefined,
                true,
                ScoreValidator::None,
            )?;
            let mut reads = Vec::new();
            for _ in 0..100 {
                match other.get_spot(&spot, &mut reads) {
                    Ok(true) => {
                        placed[j] = true;
                        batch.push(files[j].clone());
                        break;
                    }
                    Ok(false) => break,
                    Err(_) => continue,
                }
            }
        }
        if let Some(first) = batches.first() {
            if first.len() != batch.len() {
                return Err(LoaderError::new(
                    11,
                    format!(
                        "Inconsistent file sets: first group ({}), second group ({})",
                        first.join(","),
                        batch.join(",")
                    ),
                ));
            }
        }
        log::info!("File group: {}", batch.join(","));
        batches.push(batch);
    }
    Ok(batches)
}
