//! Defline classification.
//!
//! A defline is matched against an ordered chain of platform-specific
//! matchers; the first hit fills the [`Read`] header fields. The chain keeps
//! a last-successful-first cache since real runs almost always carry one
//! defline shape throughout.

use std::collections::BTreeSet;

use regex::{Captures, Regex};

use crate::error::{LoaderError, Result};
use crate::read::{Platform, Read};

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("invalid defline pattern")
}

/// Capture group as &str, empty when the group did not participate.
fn g<'t>(caps: &'t Captures, i: usize) -> &'t str {
    caps.get(i).map_or("", |m| m.as_str())
}

/// Append a separator character; `-` is normalized to `:`.
fn add_sep(spot: &mut String, sep: &str) {
    if let Some(c) = sep.chars().next() {
        spot.push(if c == '-' { ':' } else { c });
    }
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

enum MatcherKind {
    IlluminaNew,
    IlluminaNewWithSuffix { suffix_re: Regex },
    IlluminaNewDataGroup,
    IlluminaOld,
    BgiOld,
    BgiNew,
    Ls454,
    IonTorrent,
    IonTorrent2,
    PacBio,
    Nanopore(NanoporeForm),
    BarcodeAndOrReadNum,
    AllMatch,
}

enum NanoporeForm {
    Basic,
    Form3,
    Form3_1,
    Form4,
    Form5,
}

struct Matcher {
    name: &'static str,
    platform: Platform,
    re: Regex,
    kind: MatcherKind,
}

/// Shared sub-expressions for the IlluminaOld family.
struct IlluminaOldHelpers {
    tail1: Regex,
    tail2: Regex,
    tail3: Regex,
    suffix2: Regex,
    suffix: Regex,
}

/// Shared sub-expressions for the nanopore family.
struct NanoporeHelpers {
    pore_pass: Regex,
    pore_fail: Regex,
    pore_barcode: Regex,
    read_no: Regex,
    read_no_kv: Regex,
    channel_kv: Regex,
    barcode_kv: Regex,
}

pub struct DeflineParser {
    matchers: Vec<Matcher>,
    last: usize,
    all_match_index: Option<usize>,
    seen_types: BTreeSet<&'static str>,
    old: IlluminaOldHelpers,
    pore: NanoporeHelpers,
}

impl Default for DeflineParser {
    fn default() -> Self {
        Self::new(false)
    }
}

impl DeflineParser {
    pub fn new(match_all: bool) -> Self {
        let mut parser = DeflineParser {
            matchers: build_matchers(),
            last: 0,
            all_match_index: None,
            seen_types: BTreeSet::new(),
            old: IlluminaOldHelpers {
                tail1: re(r"([!-~]*?)(:)(\d+)$"),
                tail2: re(r"([!-~]*?)(:)(\d+)(:)(\d+)(\s+|$)"),
                tail3: re(r"(\d+)(:)(\d+)(\s+|$)"),
                suffix2: re(r"(-?\d+\.\d+|-?\d+)([^\d\s.][!-~]+)"),
                suffix: re(r"(/[12345])([^\d\s][!-~]+)"),
            },
            pore: NanoporeHelpers {
                pore_pass: re(r"pass[/\\]"),
                pore_fail: re(r"fail[/\\]"),
                pore_barcode: re(r"(NB\d{2}|BC\d{2}|barcode\d{2})([/\\])"),
                read_no: re(r"read_?(\d+)"),
                read_no_kv: re(r"read[=_]?(\d+)"),
                channel_kv: re(r"ch[=_]?(\d+)"),
                barcode_kv: re(r"barcode=(\S+)"),
            },
        };
        if match_all {
            parser.matchers.push(Matcher {
                name: "undefined",
                platform: Platform::Undefined,
                re: re(r"[@>+]([!-~]+)(\s+|$)"),
                kind: MatcherKind::AllMatch,
            });
            parser.all_match_index = Some(parser.matchers.len() - 1);
        }
        parser
    }

    /// Check whether any matcher recognizes the defline. In strict mode the
    /// match-everything pattern does not count.
    pub fn matches(&mut self, defline: &str, strict: bool) -> bool {
        if self.matchers[self.last].re.is_match(defline) {
            return true;
        }
        for i in 0..self.matchers.len() {
            if i == self.last || !self.matchers[i].re.is_match(defline) {
                continue;
            }
            if strict && Some(i) == self.all_match_index {
                return false;
            }
            self.last = i;
            self.seen_types.insert(self.matchers[i].name);
            return true;
        }
        false
    }

    /// Parse the defline into `read`; error 100 deliberately omits the
    /// defline text.
    pub fn parse(&mut self, defline: &str, read: &mut Read) -> Result<()> {
        if !self.matches(defline, false) {
            return Err(LoaderError::new(100, "Defline not recognized"));
        }
        let matcher = &self.matchers[self.last];
        let caps = matcher
            .re
            .captures(defline)
            .ok_or_else(|| LoaderError::new(100, "Defline not recognized"))?;
        self.seen_types.insert(matcher.name);
        match &matcher.kind {
            MatcherKind::IlluminaNew => illumina_new(&caps, read),
            MatcherKind::IlluminaNewWithSuffix { suffix_re } => {
                illumina_new(&caps, read);
                let sep = g(&caps, 10);
                if sep.len() > 2 {
                    if let Some(sub) = suffix_re.captures(sep) {
                        read.set_suffix(g(&sub, 3));
                    }
                }
            }
            MatcherKind::IlluminaNewDataGroup => {
                read.set_spot(g(&caps, 1));
                read.set_read_num(g(&caps, 3));
                read.set_read_filter(if g(&caps, 4) == "Y" { 1 } else { 0 });
                read.set_spot_group(g(&caps, 6));
            }
            MatcherKind::IlluminaOld => illumina_old(&self.old, &caps, read)?,
            MatcherKind::BgiOld => {
                let mut spot = String::new();
                for i in 1..=5 {
                    spot.push_str(g(&caps, i));
                }
                read.set_spot(spot);
                let read_num = g(&caps, 7);
                read.set_read_num(read_num.strip_prefix('/').unwrap_or(read_num));
                let sg = g(&caps, 6);
                read.set_spot_group(sg.strip_prefix('#').unwrap_or(sg));
            }
            MatcherKind::BgiNew => {
                let mut spot = String::new();
                for i in 1..=5 {
                    spot.push_str(g(&caps, i));
                }
                read.set_spot(spot);
                read.set_suffix(g(&caps, 6));
                read.set_read_num(g(&caps, 8));
                read.set_read_filter(if g(&caps, 9) == "Y" { 1 } else { 0 });
                read.set_spot_group(g(&caps, 11));
            }
            MatcherKind::Ls454 => {
                let mut spot = String::new();
                for i in 1..=4 {
                    spot.push_str(g(&caps, i));
                }
                read.set_spot(spot);
                let read_num = g(&caps, 5);
                if !read_num.is_empty() {
                    read.set_read_num(&read_num[1..]);
                }
            }
            MatcherKind::IonTorrent => ion_torrent(&caps, read),
            MatcherKind::IonTorrent2 => {
                let mut spot = String::new();
                for i in 1..=5 {
                    spot.push_str(g(&caps, i));
                }
                read.set_spot(spot);
                read.set_suffix(g(&caps, 6));
                read.set_read_num(g(&caps, 8));
                read.set_read_filter(if g(&caps, 9) == "Y" { 1 } else { 0 });
                read.set_spot_group(g(&caps, 11));
            }
            MatcherKind::PacBio => {
                read.set_spot(g(&caps, 1));
            }
            MatcherKind::Nanopore(form) => nanopore(&self.pore, form, &caps, defline, read),
            MatcherKind::BarcodeAndOrReadNum => {
                read.set_spot(g(&caps, 1));
                let group2 = g(&caps, 2);
                if let Some(sg) = group2.strip_prefix('#') {
                    read.set_spot_group(sg);
                    let read_num = g(&caps, 3);
                    if read_num.starts_with('/') || read_num.starts_with('\\') {
                        read.set_read_num(&read_num[1..]);
                    }
                } else if group2.starts_with('/') || group2.starts_with('\\') {
                    read.set_read_num(&group2[1..]);
                }
            }
            MatcherKind::AllMatch => {
                read.set_spot(g(&caps, 1));
            }
        }
        Ok(())
    }

    /// Check against the last successful matcher only; used by the reader
    /// to spot a defline standing where quality was expected.
    pub fn matches_last(&self, defline: &str) -> bool {
        self.matchers[self.last].re.is_match(defline)
    }

    /// Platform of the last successful matcher.
    pub fn platform(&self) -> Platform {
        self.matchers[self.last].platform
    }

    /// Name of the last successful matcher.
    pub fn defline_type(&self) -> &'static str {
        self.matchers[self.last].name
    }

    pub fn seen_types(&self) -> &BTreeSet<&'static str> {
        &self.seen_types
    }

    /// All registered matcher names and patterns, for `--print-deflines`.
    pub fn catalog() -> Vec<(&'static str, String)> {
        build_matchers()
            .into_iter()
            .map(|m| (m.name, m.re.as_str().to_string()))
            .collect()
    }
}

/// Common extraction for the IlluminaNew family.
/// Groups: prefix, sep, lane, sep, tile, sep, x, sep, y, sep, readNum,
/// filter, reserved, spotGroup, end.
fn illumina_new(caps: &Captures, read: &mut Read) {
    let mut spot = String::new();
    let prefix = g(caps, 1);
    if !prefix.is_empty() {
        spot.push_str(prefix);
        add_sep(&mut spot, g(caps, 2));
    }
    spot.push_str(g(caps, 3));
    add_sep(&mut spot, g(caps, 4));
    spot.push_str(g(caps, 5));
    add_sep(&mut spot, g(caps, 6));
    spot.push_str(g(caps, 7));
    add_sep(&mut spot, g(caps, 8));
    spot.push_str(g(caps, 9));
    read.set_spot(spot);
    read.set_read_num(g(caps, 11));
    read.set_read_filter(if g(caps, 12) == "Y" { 1 } else { 0 });
    read.set_spot_group(g(caps, 14));
}

/// How many trailing numeric tokens of the prefix were really coordinates
/// that the main pattern mis-attributed (seen when x/y carry fractional
/// parts). Capped at 2.
fn count_extra_numbers(prefix: &str, sep: &str, x: &str, y: &str) -> usize {
    if sep.is_empty() {
        return 0;
    }
    let sep_char = match sep.chars().next() {
        Some('-') => ':',
        Some(c) => c,
        None => return 0,
    };
    let tokens: Vec<&str> = prefix.split(sep_char).collect();
    let mut num_count = 0;
    if let Some(last) = tokens.last() {
        if is_number(last) {
            num_count += 1;
        }
    }
    if tokens.len() > 1 && is_number(tokens[tokens.len() - 2]) {
        num_count += 1;
    }
    let mut discard = 0;
    if num_count > 0 {
        let y_head: i64 = y.split('.').next().and_then(|t| t.parse().ok()).unwrap_or(i64::MAX);
        if y_head < 4 {
            discard += 1;
            if num_count == 2 {
                let x_head: i64 =
                    x.split('.').next().and_then(|t| t.parse().ok()).unwrap_or(i64::MAX);
                if x_head < 4 {
                    discard += 1;
                }
            }
        }
    }
    discard
}

/// Common extraction for the IlluminaOld family.
/// Groups: prefix, sep, lane, sep, tile, sep, x, sep, y, spotGroup, readNum,
/// end.
fn illumina_old(helpers: &IlluminaOldHelpers, caps: &Captures, read: &mut Read) -> Result<()> {
    let prefix = g(caps, 1);
    let lane = g(caps, 3);
    let tile = g(caps, 5);
    let mut x = g(caps, 7).to_string();
    let mut y = g(caps, 9).to_string();
    let mut read_num = g(caps, 11).to_string();

    let mut suffix = String::new();
    let y_in = y.clone();
    let read_num_in = read_num.clone();
    if let Some(sub) = helpers.suffix2.captures(&y_in) {
        y = g(&sub, 1).to_string();
        let mut s = g(&sub, 2);
        if s.len() >= 3 {
            if s.starts_with("/1") || s.starts_with("/2") {
                s = &s[2..];
            }
            suffix = s.to_string();
        }
    } else if !read_num.is_empty() {
        if let Some(sub) = helpers.suffix.captures(&read_num_in) {
            read_num = g(&sub, 1).to_string();
            if g(&sub, 2).len() >= 3 {
                suffix = g(&sub, 2).to_string();
            }
        }
    }
    if !suffix.is_empty() {
        read.set_suffix(suffix);
    }

    let mut num_discards = 0;
    if !prefix.is_empty() {
        num_discards = count_extra_numbers(prefix, g(caps, 2), &x, &y);
        if num_discards == 2 && x.contains('.') {
            let mut new_suffix = String::new();
            new_suffix.push_str(g(caps, 6));
            new_suffix.push_str(&x);
            new_suffix.push_str(g(caps, 8));
            new_suffix.push_str(&y);
            new_suffix.push_str(read.suffix());
            read.set_suffix(new_suffix);
        } else if num_discards == 1 && y.contains('.') {
            let mut new_suffix = String::new();
            new_suffix.push_str(g(caps, 8));
            new_suffix.push_str(&y);
            new_suffix.push_str(read.suffix());
            read.set_suffix(new_suffix);
        }
    }

    let mut spot = String::new();
    match num_discards {
        1 => {
            if let Some(sub) = helpers.tail1.captures(prefix) {
                spot.push_str(g(&sub, 1));
                spot.push_str(g(&sub, 2));
                spot.push_str(g(&sub, 3));
            } else {
                spot.push_str(prefix);
            }
            add_sep(&mut spot, g(caps, 2));
            spot.push_str(lane);
            add_sep(&mut spot, g(caps, 4));
            spot.push_str(tile);
            add_sep(&mut spot, g(caps, 6));
            spot.push_str(&x);
        }
        2 => {
            if let Some(sub) = helpers.tail2.captures(prefix) {
                for i in 1..=5 {
                    spot.push_str(g(&sub, i));
                }
            } else if let Some(sub) = helpers.tail3.captures(prefix) {
                for i in 1..=3 {
                    spot.push_str(g(&sub, i));
                }
            } else {
                return Err(LoaderError::new(101, "Illumina defline is not recognized"));
            }
            add_sep(&mut spot, g(caps, 2));
            spot.push_str(lane);
            add_sep(&mut spot, g(caps, 4));
            spot.push_str(tile);
        }
        _ => {
            if !prefix.is_empty() {
                spot.push_str(prefix);
                add_sep(&mut spot, g(caps, 2));
            }
            spot.push_str(lane);
            add_sep(&mut spot, g(caps, 4));
            spot.push_str(tile);
            add_sep(&mut spot, g(caps, 6));
            spot.push_str(&x);
            add_sep(&mut spot, g(caps, 8));
            spot.push_str(&y);
        }
    }
    read.set_spot(spot);

    if !read_num.is_empty() {
        read.set_read_num(&read_num[1..]);
    }
    let spot_group = g(caps, 10);
    if !spot_group.is_empty() {
        read.set_spot_group(&spot_group[1..]);
    }
    Ok(())
}

/// Groups: runId, sep, row, sep, column, suffix, spotGroup, readNum, end.
fn ion_torrent(caps: &Captures, read: &mut Read) {
    let mut spot = String::new();
    for i in 1..=5 {
        spot.push_str(g(caps, i));
    }
    read.set_spot(spot);

    let suffix = g(caps, 6);
    let spot_group = g(caps, 7);
    if !spot_group.is_empty() {
        read.set_spot_group(spot_group.strip_prefix('#').unwrap_or(spot_group));
    }
    let read_num = g(caps, 8);
    if read_num.is_empty() && (suffix == "L" || suffix == "R") {
        read.set_read_num(if suffix == "L" { "1" } else { "2" });
    } else {
        read.set_suffix(suffix);
        let rn = match read_num {
            "L" => "1",
            "R" => "2",
            rn if rn.starts_with('/') || rn.starts_with('\\') => &rn[1..],
            rn => rn,
        };
        read.set_read_num(rn);
    }
}

fn nanopore(
    helpers: &NanoporeHelpers,
    form: &NanoporeForm,
    caps: &Captures,
    defline: &str,
    read: &mut Read,
) {
    let mut pore_mid = "";
    let mut pore_file = String::new();
    match form {
        NanoporeForm::Basic => {
            // poreStart, channel, poreMid, readNo, poreEnd, poreRead, poreFile
            let mut spot = String::new();
            if !g(caps, 4).is_empty() {
                for i in 1..=5 {
                    spot.push_str(g(caps, i));
                }
                read.set_nanopore_read_no(g(caps, 4));
            } else {
                spot.push_str(g(caps, 1));
                spot.push_str(g(caps, 2));
                spot.push_str(g(caps, 5));
                if let Some(sub) = helpers.read_no.captures(defline) {
                    read.set_nanopore_read_no(g(&sub, 1));
                }
            }
            read.set_spot(spot);
            read.set_channel(g(caps, 2));
            pore_mid = g(caps, 3);
            pore_file.push_str(g(caps, 7));
        }
        NanoporeForm::Form3 => {
            // prefix, name, suffix, poreRead, discard, poreStart, channel,
            // poreMid, readNo, poreEnd
            read.set_spot(g(caps, 2));
            read.set_suffix(g(caps, 3));
            read.set_channel(g(caps, 7));
            read.set_nanopore_read_no(g(caps, 9));
            pore_mid = g(caps, 8);
            for i in 6..=10 {
                pore_file.push_str(g(caps, i));
            }
        }
        NanoporeForm::Form3_1 => {
            // prefix, name, suffix, poreRead, discard, poreStart, readNo,
            // poreMid, channel, poreEnd
            read.set_spot(g(caps, 2));
            read.set_suffix(g(caps, 3));
            read.set_nanopore_read_no(g(caps, 7));
            read.set_channel(g(caps, 9));
            pore_mid = g(caps, 8);
            for i in 6..=10 {
                pore_file.push_str(g(caps, i));
            }
        }
        NanoporeForm::Form4 => {
            read.set_spot(g(caps, 1));
            if let Some(sub) = helpers.read_no_kv.captures(defline) {
                read.set_nanopore_read_no(g(&sub, 1));
            }
            if let Some(sub) = helpers.channel_kv.captures(defline) {
                read.set_channel(g(&sub, 1));
            }
            if let Some(sub) = helpers.barcode_kv.captures(defline) {
                if g(&sub, 1) != "unclassified" {
                    read.set_spot_group(g(&sub, 1));
                }
            }
        }
        NanoporeForm::Form5 => {
            read.set_spot(g(caps, 1));
            read.set_suffix(g(caps, 2));
        }
    }

    // Common nanopore post-processing.
    if read.channel().is_empty() {
        read.set_channel("0");
    }
    if read.nanopore_read_no().is_empty() || pore_mid == "_file" {
        // a trailing file number is not a read number
        read.set_nanopore_read_no("0");
    }
    if !pore_file.is_empty() {
        if helpers.pore_pass.is_match(&pore_file) {
            read.set_read_filter(0);
        } else if helpers.pore_fail.is_match(&pore_file) {
            read.set_read_filter(1);
        }
        if let Some(sub) = helpers.pore_barcode.captures(&pore_file) {
            let barcode = g(&sub, 1);
            if let Some(digits) = barcode.strip_prefix("barcode") {
                read.set_spot_group(format!("BC{}", digits));
            } else {
                read.set_spot_group(barcode);
            }
        }
    }
}

fn build_matchers() -> Vec<Matcher> {
    let suffix_re = || re(r"(#[!-~]*?|)(/[12345]|\\[12345])?([!-~]*?)(#[!-~]*?|)(/[12345]|\\[12345])?([:_|]?)(\s+|$)");
    vec![
        Matcher {
            name: "BgiNew",
            platform: Platform::Undefined,
            re: re(r"^[@>+](\S{1,3}\d{9}\S{0,3})(L\d)(C\d{3})(R\d{3})([_]?\d{1,8})(\S*)(\s+|[_|-])([12345]|):([NY]):(\d+):?([!-~]*?)(\s+|$)"),
            kind: MatcherKind::BgiNew,
        },
        Matcher {
            name: "BgiOld",
            platform: Platform::Undefined,
            re: re(r"^[@>+](\S{1,3}\d{9}\S{0,3})(L\d)(C\d{3})(R\d{3})([_]?\d{1,8})(#[!-~]*?|)(/[1234]\S*|)(\s+|$)"),
            kind: MatcherKind::BgiOld,
        },
        Matcher {
            name: "illuminaNew",
            platform: Platform::Illumina,
            re: re(r"^[@>+]([!-~]+?)([:_])(\d+)([:_])(\d+)([:_])(-?\d+\.?\d*)([:_])(-?\d+\.\d+|\d+)(\s+|[:_|-])([12345]|):([NY]):(\d+|O):?([!-~]*?)(\s+|$)"),
            kind: MatcherKind::IlluminaNew,
        },
        Matcher {
            name: "illuminaNewNoPrefix",
            platform: Platform::Illumina,
            re: re(r"^[@>+]([!-~]*?)(:?)(\d+)([:_])(\d+)([:_])(\d+)([:_])(\d+)(\s+|_)([12345]|):([NY]):(\d+|O):?([!-~]*?)(\s+|$)"),
            kind: MatcherKind::IlluminaNew,
        },
        Matcher {
            name: "illuminaNewWithSuffix",
            platform: Platform::Illumina,
            re: re(r"^[@>+]([!-~]+)([:_])(\d+)([:_])(\d+)([:_])(-?\d+\.?\d*)([:_])(-?\d+\.\d+|\d+)([!-/:-~][!-~]*?\s+|[!-/:-~][!-~]*?[:_|-])([12345]|):([NY]):(\d+|O):?([!-~]*?)(\s+|$)"),
            kind: MatcherKind::IlluminaNewWithSuffix { suffix_re: suffix_re() },
        },
        Matcher {
            name: "illuminaNewWithPeriods",
            platform: Platform::Illumina,
            re: re(r"^[@>+]([!-~]+?)(\.)(\d+)(\.)(\d+)(\.)(\d+)(\.)(\d+)(\s+|_)([12345]|)\.([NY])\.(\d+|O)\.?([!-~]*?)(\s+|$)"),
            kind: MatcherKind::IlluminaNew,
        },
        Matcher {
            name: "illuminaNewWithUnderscores",
            platform: Platform::Illumina,
            re: re(r"^[@>+]([!-~]+?)(_)(\d+)(_)(\d+)(_)(\d+)(_)(\d+)(\s+|_)([12345]|)_([NY])_(\d+|O)_?([!-~]*?)(\s+|$)"),
            kind: MatcherKind::IlluminaNew,
        },
        Matcher {
            name: "illuminaOldWithSuffix",
            platform: Platform::Illumina,
            re: re(r"^[@>+]?([!-~]+?)(:)(\d+)(:)(\d+)(:)(-?\d+\.?\d*)(:)(-?\d+\.\d+|-?\d+)(#[!-~]*?|)(/[12345][!-~]+)(\s+|$)"),
            kind: MatcherKind::IlluminaOld,
        },
        Matcher {
            name: "illuminaOldColon",
            platform: Platform::Illumina,
            re: re(r"^[@>+]?([!-~]+?)(:)(\d+)(:)(\d+)(:)(-?\d+\.?\d*)([-:])(-?\d+\.\d+|-?\d+)_?[012]?(#[!-~]*?|)\s?(/[12345]|\\[12345])?(\s+|$)"),
            kind: MatcherKind::IlluminaOld,
        },
        Matcher {
            name: "illuminaOldUnderscore",
            platform: Platform::Illumina,
            re: re(r"^[@>+]?([!-~]+?)(_)(\d+)(_)(\d+)(_)(-?\d+\.?\d*)(_)(-?\d+\.\d+|-?\d+)(#[!-~]*?|)\s?(/[12345]|\\[12345])?(\s+|$)"),
            kind: MatcherKind::IlluminaOld,
        },
        Matcher {
            name: "illuminaOldWithSuffix2",
            platform: Platform::Illumina,
            re: re(r"^[@>+]?([!-~]+?)(:)(\d+)(:)(\d+)(:)(-?\d+\.?\d*)(:)(-?\d+\.?\d*[!-~]+?)(#[!-~]*?|)\s?(/[12345]|\\[12345])?(\s+|$)"),
            kind: MatcherKind::IlluminaOld,
        },
        Matcher {
            name: "illuminaOldNoPrefix",
            platform: Platform::Illumina,
            re: re(r"^[@>+]?([!-~]*?)(:?)(\d+)(:)(\d+)(:)(-?\d+\.?\d*)(:)(-?\d+\.\d+|-?\d+)(#[!-~]*?|)\s?(/[12345]|\\[12345])?(\s+|$)"),
            kind: MatcherKind::IlluminaOld,
        },
        Matcher {
            name: "LS454",
            platform: Platform::Ls454,
            re: re(r"^[@>+]([!-~]+_|)([A-Z0-9]{7})(\d{2})([A-Z0-9]{5})(/[12345])?(\s+|$)"),
            kind: MatcherKind::Ls454,
        },
        Matcher {
            name: "illuminaNewDataGroup",
            platform: Platform::Illumina,
            re: re(r"^[@>+]([!-~]+?)(\s+|[_|])([12345]|):([NY]):(\d+|O):?([!-~]*?)(\s+|$)"),
            kind: MatcherKind::IlluminaNewDataGroup,
        },
        Matcher {
            name: "IonTorrent2",
            platform: Platform::IonTorrent,
            re: re(r"^[@>+]([A-Z0-9]{5})(:)(\d{1,5})(:)(\d{1,5})([!-~]*)(\s+|[_|])([12345]|):([NY]):(\d+):?([!-~]*?)(\s+|$)"),
            kind: MatcherKind::IonTorrent2,
        },
        Matcher {
            name: "IonTorrent",
            platform: Platform::IonTorrent,
            re: re(r"^[@>+]([A-Z0-9]{5})(:)(\d{1,5})(:)(\d{1,5})([^#/\s]*)(#[!-~]*?|)(/[12345]|\\[12345]|[LR])?(\s+|$)"),
            kind: MatcherKind::IonTorrent,
        },
        Matcher {
            name: "Nanopore1",
            platform: Platform::OxfordNanopore,
            re: re(r"[@>+]+?(channel_)(\d+)(_read_)?(\d+)?([!-~]*?)(_twodirections|_2d|-2D|_template|-1D|_complement|-complement|\.1C|\.1T|\.2D)?(:[!-~ ]+?_ch\d+_file\d+_strand\.fast5)?(\s+|$)"),
            kind: MatcherKind::Nanopore(NanoporeForm::Basic),
        },
        Matcher {
            name: "Nanopore2",
            platform: Platform::OxfordNanopore,
            re: re(r"[@>+]([!-~]*?ch)(\d+)(_file)(\d+)([!-~]*?)(_twodirections|_2d|-2D|_template|-1D|_complement|-complement|\.1C|\.1T|\.2D)(:[!-~ ]+?_ch\d+_file\d+_strand\.fast5)?(\s+|$)"),
            kind: MatcherKind::Nanopore(NanoporeForm::Basic),
        },
        Matcher {
            name: "Nanopore3",
            platform: Platform::OxfordNanopore,
            re: re(r"[@>+]([!-~]*?)[: ]?([!-~]+?Basecall)(_[12]D[_0]*?|_Alignment[_0]*?|_Barcoding[_0]*?|)(_twodirections|_2d|-2D|_template|-1D|_complement|-complement|\.1C|\.1T|\.2D|)[: ]([!-~]*?)[: ]?([!-~ ]+?_ch)_?(\d+)(_read|_file)_?(\d+)(_strand\d*\.fast5|_strand\d*.*|)(\s+|$)"),
            kind: MatcherKind::Nanopore(NanoporeForm::Form3),
        },
        Matcher {
            name: "Nanopore3_1",
            platform: Platform::OxfordNanopore,
            re: re(r"[@>+]([!-~]+?)[: ]?([!-~]+?Basecall)(_[12]D[_0]*?|_Alignment[_0]*?|_Barcoding[_0]*?|)(_twodirections|_2d|-2D|_template|-1D|_complement|-complement|\.1C|\.1T|\.2D|)[: ]([!-~]*?)[: ]?([!-~ ]+?_read_)(\d+)(_ch_)(\d+)(_strand\d*\.fast5|_strand\d*.*)(\s+|$)"),
            kind: MatcherKind::Nanopore(NanoporeForm::Form3_1),
        },
        Matcher {
            name: "Nanopore5",
            platform: Platform::OxfordNanopore,
            re: re(r"[@>+]([!-~]*?[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}_Basecall)(_[12]D[_0]*?|_Alignment[_0]*?|_Barcoding[_0]*?)(_twodirections|_2d|-2D|_template|-1D|_complement|-complement|\.1C|\.1T|\.2D)\S*?$"),
            kind: MatcherKind::Nanopore(NanoporeForm::Form5),
        },
        Matcher {
            name: "Nanopore4",
            platform: Platform::OxfordNanopore,
            re: re(r"[@>+]([!-~]*?\S{8}-\S{4}-\S{4}-\S{4}-\S{12}\S*_?\d?)(\s|$)"),
            kind: MatcherKind::Nanopore(NanoporeForm::Form4),
        },
        Matcher {
            name: "PacBio",
            platform: Platform::PacBio,
            re: re(r"^[@>+](m\d{5,6}_\d{6}_[!-~]+?_c\d{33}_s\d+_[pX]\d/\d+/?\d*_?\d*|m\d{6}_\d{6}_[!-~]+?_c\d{33}_s\d+_[pX]\d[|/]\d+[|/]ccs[!-~]*?)(\s+|$)"),
            kind: MatcherKind::PacBio,
        },
        Matcher {
            name: "PacBio2",
            platform: Platform::PacBio,
            re: re(r"^[@>+]([!-~]*?m\d{5,6}\S{0,3}_\d{6}_\d{6}[/_]\d+[!-~]*?)(\s+|$)"),
            kind: MatcherKind::PacBio,
        },
        Matcher {
            name: "PacBio3",
            platform: Platform::PacBio,
            re: re(r"^[@>+]([!-~]*?m\d{5,6}\S{0,3}_\d{6}_\d{6}[/_]\d+/ccs[!-~]*?)(\s+|$)"),
            kind: MatcherKind::PacBio,
        },
        Matcher {
            name: "PacBio4",
            platform: Platform::PacBio,
            re: re(r"^[@>+]([!-~]*?m\d{5,6}\S{0,3}_\d{6}_\d{6}[/_]\d+/\d+_\d+[!-~]*?)(\s+|$)"),
            kind: MatcherKind::PacBio,
        },
        Matcher {
            name: "illuminaOldBcRnOnly",
            platform: Platform::Undefined,
            re: re(r"^[@>+]([!-~]+?)(#[!-~]+?)(/[1234]|\\[1234])(\s+|$)"),
            kind: MatcherKind::BarcodeAndOrReadNum,
        },
        Matcher {
            name: "illuminaOldBcOnly",
            platform: Platform::Undefined,
            re: re(r"^[@>+]([!-~]+?)(#[!-~]+)(\s+|$)(.?)"),
            kind: MatcherKind::BarcodeAndOrReadNum,
        },
        Matcher {
            name: "illuminaOldRnOnly",
            platform: Platform::Undefined,
            re: re(r"^[@>+]([!-~]+?)(/[1234]|\\[1234])(\s+|$)(.?)"),
            kind: MatcherKind::BarcodeAndOrReadNum,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(defline: &str) -> (Read, Platform, String) {
        let mut parser = DeflineParser::default();
        let mut read = Read::default();
        parser.parse(defline, &mut read).unwrap();
        (read, parser.platform(), parser.defline_type().to_string())
    }

    #[test]
    fn test_illumina_new() {
        let (read, platform, kind) =
            parse("@M00123:45:000000000-ABCDE:1:1101:19213:2154 1:N:0:TAAGGCGA");
        assert_eq!(kind, "illuminaNew");
        assert_eq!(platform, Platform::Illumina);
        assert_eq!(read.spot(), "M00123:45:000000000-ABCDE:1:1101:19213:2154");
        assert_eq!(read.read_num(), "1");
        assert_eq!(read.read_filter(), 0);
        assert_eq!(read.spot_group(), "TAAGGCGA");
    }

    #[test]
    fn test_illumina_new_filter_flag() {
        let (read, _, _) = parse("@EAS139:136:FC706VJ:2:2104:15343:197393 1:Y:18:ATCACG");
        assert_eq!(read.read_filter(), 1);
    }

    #[test]
    fn test_illumina_new_data_group() {
        let (read, _, kind) = parse("@A 1:N:0:X");
        assert_eq!(kind, "illuminaNewDataGroup");
        assert_eq!(read.spot(), "A");
        assert_eq!(read.read_num(), "1");
        assert_eq!(read.spot_group(), "X");
    }

    #[test]
    fn test_illumina_old() {
        let (read, platform, _) = parse("@HWUSI-EAS100R:6:73:941:1973#ATCACG/1");
        assert_eq!(platform, Platform::Illumina);
        assert_eq!(read.spot(), "HWUSI-EAS100R:6:73:941:1973");
        assert_eq!(read.read_num(), "1");
        assert_eq!(read.spot_group(), "ATCACG");
    }

    #[test]
    fn test_bgi_new() {
        let (read, _, kind) = parse("@V300014293L2C001R001000000 1:N:0:ACGT");
        assert_eq!(kind, "BgiNew");
        assert_eq!(read.spot(), "V300014293L2C001R001000000");
        assert_eq!(read.read_num(), "1");
        assert_eq!(read.spot_group(), "ACGT");
    }

    #[test]
    fn test_ls454() {
        let (read, platform, _) = parse("@EM7RLNS01DVXV3/1");
        assert_eq!(platform, Platform::Ls454);
        assert_eq!(read.spot(), "EM7RLNS01DVXV3");
        assert_eq!(read.read_num(), "1");
    }

    #[test]
    fn test_ion_torrent() {
        let (read, platform, _) = parse("@PGH93:1371:1392/2");
        assert_eq!(platform, Platform::IonTorrent);
        assert_eq!(read.spot(), "PGH93:1371:1392");
        assert_eq!(read.read_num(), "2");
    }

    #[test]
    fn test_pacbio() {
        let (read, platform, _) = parse("@m140415_143853_42175_c100635972550000001823121909121417_s1_p0/553/0_1495");
        assert_eq!(platform, Platform::PacBio);
        assert!(read.spot().starts_with("m140415_143853"));
    }

    #[test]
    fn test_nanopore_channel_defaults() {
        let (read, platform, kind) = parse("@channel_100_read_42_template pass/file.fast5");
        assert_eq!(platform, Platform::OxfordNanopore);
        assert_eq!(kind, "Nanopore1");
        assert_eq!(read.channel(), "100");
        assert_eq!(read.nanopore_read_no(), "42");
    }

    #[test]
    fn test_nanopore_uuid_with_metadata() {
        let (read, platform, _) = parse(
            "@12345678-abcd-ef01-2345-6789abcdef01 runid=7 read=1234 ch=361 barcode=barcode01",
        );
        assert_eq!(platform, Platform::OxfordNanopore);
        assert_eq!(read.nanopore_read_no(), "1234");
        assert_eq!(read.channel(), "361");
        assert_eq!(read.spot_group(), "BC01");
    }

    #[test]
    fn test_nanopore_unclassified_barcode_dropped() {
        let (read, _, _) =
            parse("@12345678-abcd-ef01-2345-6789abcdef01 read=1 ch=2 barcode=unclassified");
        assert_eq!(read.spot_group(), "");
    }

    #[test]
    fn test_readnum_only_catch_all() {
        let (read, _, kind) = parse("@some.odd.name/2");
        assert_eq!(kind, "illuminaOldRnOnly");
        assert_eq!(read.spot(), "some.odd.name");
        assert_eq!(read.read_num(), "2");
    }

    #[test]
    fn test_unrecognized_defline_never_quoted() {
        let mut parser = DeflineParser::default();
        let mut read = Read::default();
        let e = parser.parse("complete <garbage>&", &mut read).unwrap_err();
        assert_eq!(e.code(), 100);
        assert!(!e.message().contains("garbage"));
    }

    #[test]
    fn test_last_successful_cache() {
        let mut parser = DeflineParser::default();
        let mut read = Read::default();
        parser.parse("@A 1:N:0:X", &mut read).unwrap();
        let first = parser.defline_type();
        read.reset();
        parser.parse("@B 2:N:0:X", &mut read).unwrap();
        assert_eq!(parser.defline_type(), first);
    }

    #[test]
    fn test_match_all_only_when_enabled() {
        let mut strictp = DeflineParser::default();
        assert!(!strictp.matches("@just_a_name", false));
        let mut loosep = DeflineParser::new(true);
        assert!(loosep.matches("@just_a_name", false));
        assert!(!loosep.matches("@just_a_name", true));
        let mut read = Read::default();
        loosep.parse("@just_a_name", &mut read).unwrap();
        assert_eq!(read.spot(), "just_a_name");
    }
}
