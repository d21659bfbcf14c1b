use crate::error::{LoaderError, Result};

/// INSDC platform codes as they appear in the PLATFORM column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Platform {
    Undefined = 0,
    Ls454 = 1,
    Illumina = 2,
    AbSolid = 3,
    CompleteGenomics = 4,
    Helicos = 5,
    PacBio = 6,
    IonTorrent = 7,
    Capillary = 8,
    OxfordNanopore = 9,
}

impl Platform {
    pub fn from_code(code: u8) -> Result<Platform> {
        Ok(match code {
            0 => Platform::Undefined,
            1 => Platform::Ls454,
            2 => Platform::Illumina,
            3 => Platform::AbSolid,
            4 => Platform::CompleteGenomics,
            5 => Platform::Helicos,
            6 => Platform::PacBio,
            7 => Platform::IonTorrent,
            8 => Platform::Capillary,
            9 => Platform::OxfordNanopore,
            other => {
                return Err(LoaderError::new(240, format!("Invalid platform code '{}'", other)))
            }
        })
    }
}

pub const READ_TYPE_TECHNICAL: u8 = 0;
pub const READ_TYPE_BIOLOGICAL: u8 = 1;

/// Sequence alphabet translation applied while accumulating sequence lines:
/// `u`/`U` -> `T`, `-`/`X`/`?`/`.` -> `N`, everything else uppercased.
#[inline]
fn translate(ch: u8) -> u8 {
    match ch {
        b'u' | b'U' => b'T',
        b'-' | b'X' | b'?' | b'.' => b'N',
        c => c.to_ascii_uppercase(),
    }
}

/// One FASTQ read, immutable after parsing and validation.
#[derive(Debug, Default, Clone)]
pub struct Read {
    spot: String,
    read_num: String,
    spot_group: String,
    suffix: String,
    read_filter: u8,
    sequence: String,
    quality: String,
    qual_scores: Vec<i16>,
    channel: String,
    nanopore_read_no: String,
    pub line_number: u64,
    pub spot_id: u32,
    pub reader_idx: u16,
    pub read_type: u8,
}

impl Read {
    pub fn reset(&mut self) {
        self.spot.clear();
        self.read_num.clear();
        self.spot_group.clear();
        self.suffix.clear();
        self.read_filter = 0;
        self.sequence.clear();
        self.quality.clear();
        self.qual_scores.clear();
        self.channel.clear();
        self.nanopore_read_no.clear();
        self.line_number = 0;
        self.spot_id = 0;
        self.reader_idx = 0;
        self.read_type = READ_TYPE_TECHNICAL;
    }

    pub fn is_empty(&self) -> bool {
        self.spot.is_empty()
    }

    pub fn spot(&self) -> &str {
        &self.spot
    }

    pub fn read_num(&self) -> &str {
        &self.read_num
    }

    pub fn spot_group(&self) -> &str {
        &self.spot_group
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn read_filter(&self) -> u8 {
        self.read_filter
    }

    pub fn sequence(&self) -> &str {
        &self.sequence
    }

    pub fn quality(&self) -> &str {
        &self.quality
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn nanopore_read_no(&self) -> &str {
        &self.nanopore_read_no
    }

    pub fn set_spot(&mut self, spot: impl Into<String>) {
        self.spot = spot.into();
    }

    pub fn set_read_num(&mut self, read_num: impl Into<String>) {
        self.read_num = read_num.into();
    }

    /// A spot group of "0" means "no barcode" and is dropped.
    pub fn set_spot_group(&mut self, spot_group: impl Into<String>) {
        let sg = spot_group.into();
        if sg == "0" {
            self.spot_group.clear();
        } else {
            self.spot_group = sg;
        }
    }

    pub fn set_suffix(&mut self, suffix: impl Into<String>) {
        self.suffix = suffix.into();
    }

    pub fn set_read_filter(&mut self, read_filter: u8) {
        self.read_filter = read_filter;
    }

    pub fn set_channel(&mut self, channel: impl Into<String>) {
        self.channel = channel.into();
    }

    pub fn set_nanopore_read_no(&mut self, read_no: impl Into<String>) {
        self.nanopore_read_no = read_no.into();
    }

    pub fn set_sequence(&mut self, sequence: impl Into<String>) {
        self.sequence = sequence.into();
    }

    pub fn set_quality(&mut self, quality: impl Into<String>) {
        self.quality = quality.into();
    }

    pub fn set_qual_scores(&mut self, scores: Vec<i16>) {
        self.qual_scores = scores;
    }

    pub fn add_sequence_line(&mut self, line: &str) {
        self.sequence.extend(line.bytes().map(|c| translate(c) as char));
    }

    pub fn add_quality_line(&mut self, line: &str) {
        self.quality.push_str(line);
    }

    pub fn quality_mut(&mut self) -> &mut String {
        &mut self.quality
    }

    /// Numeric quality scores: either the validated numeric values or the
    /// raw phred bytes when the run uses a character encoding.
    pub fn qual_scores(&self) -> Vec<i16> {
        if self.qual_scores.is_empty() {
            self.quality.bytes().map(|b| b as i16).collect()
        } else {
            self.qual_scores.clone()
        }
    }

    /// Assign the read type from a `--readTypes` letter. `A` resolves by
    /// length: biological at 40 bp and above, technical below.
    pub fn set_type(&mut self, read_type: char) -> Result<()> {
        self.read_type = match read_type {
            'T' => READ_TYPE_TECHNICAL,
            'B' => READ_TYPE_BIOLOGICAL,
            'A' => {
                if self.sequence.len() < 40 {
                    READ_TYPE_TECHNICAL
                } else {
                    READ_TYPE_BIOLOGICAL
                }
            }
            other => {
                return Err(LoaderError::new(
                    150,
                    format!("Read {}: invalid readType '{}'", self.spot, other),
                ))
            }
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_translation() {
        let mut read = Read::default();
        read.add_sequence_line("acgu");
        read.add_sequence_line("U-X?.n");
        assert_eq!(read.sequence(), "ACGTTNNNNN");
    }

    #[test]
    fn test_spot_group_zero_dropped() {
        let mut read = Read::default();
        read.set_spot_group("0");
        assert_eq!(read.spot_group(), "");
        read.set_spot_group("BC01");
        assert_eq!(read.spot_group(), "BC01");
    }

    #[test]
    fn test_read_type_assignment() {
        let mut read = Read::default();
        read.set_sequence("A".repeat(39));
        read.set_type('A').unwrap();
        assert_eq!(read.read_type, READ_TYPE_TECHNICAL);
        read.set_sequence("A".repeat(40));
        read.set_type('A').unwrap();
        assert_eq!(read.read_type, READ_TYPE_BIOLOGICAL);
        read.set_type('T').unwrap();
        assert_eq!(read.read_type, READ_TYPE_TECHNICAL);
        assert_eq!(read.set_type('X').unwrap_err().code(), 150);
    }

    #[test]
    fn test_qual_scores_fall_back_to_phred_bytes() {
        let mut read = Read::default();
        read.add_quality_line("!I");
        assert_eq!(read.qual_scores(), vec![33, 73]);
        read.set_qual_scores(vec![30, -5]);
        assert_eq!(read.qual_scores(), vec![30, -5]);
    }
}
