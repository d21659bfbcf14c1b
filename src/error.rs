use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

/// A loader failure carrying its stable numeric code.
///
/// The message is fully formatted at construction time; `set_file` appends
/// the `[file:line]` location the same way for every error class. Raw
/// defline text must never be embedded in a message (it can carry
/// XML/log-breaking characters); callers report only file and line.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct LoaderError {
    code: u32,
    message: String,
}

pub type Result<T> = std::result::Result<T, LoaderError>;

impl LoaderError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        LoaderError {
            code,
            message: format!("[code:{}] {}", code, message.into()),
        }
    }

    /// Build an error from the registry's stock message.
    pub fn from_code(code: u32) -> Self {
        let msg = ERROR_REGISTRY
            .iter()
            .find(|e| e.code == code)
            .map(|e| e.message)
            .unwrap_or("Runtime error.");
        Self::new(code, msg)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(0, message.into())
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Append the source location; only the file name is kept, never the
    /// directory part.
    pub fn set_file(&mut self, file: &str, line_number: u64) {
        let fname = Path::new(file)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.to_string());
        if line_number > 0 {
            self.message.push_str(&format!(" [{}:{}]", fname, line_number));
        } else {
            self.message.push_str(&format!(" [{}]", fname));
        }
    }

    pub fn with_file(mut self, file: &str, line_number: u64) -> Self {
        self.set_file(file, line_number);
        self
    }
}

impl From<std::io::Error> for LoaderError {
    fn from(e: std::io::Error) -> Self {
        LoaderError::runtime(format!("Runtime error: {}", e))
    }
}

pub struct ErrorInfo {
    pub code: u32,
    pub message: &'static str,
    pub description: &'static str,
}

/// Stable error code registry. Codes, message templates and descriptions
/// are part of the tool's contract and must not be renumbered.
pub const ERROR_REGISTRY: &[ErrorInfo] = &[
    ErrorInfo { code: 0, message: "Runtime error.", description: "Runtime error." },
    ErrorInfo { code: 10, message: "Invalid command line parameters, inconsistent number of read pairs", description: "Number of comma-separated files in all readNPairFiles parameters is expected to be the same." },
    ErrorInfo { code: 11, message: "Inconsistent file sets", description: "Input files are clustered into groups. Number of files in each group is expected to be the same." },
    ErrorInfo { code: 20, message: "No readTypes provided", description: "'--readTypes' parameter is expected if readNPairFiles parameters are present." },
    ErrorInfo { code: 30, message: "readTypes number should match the number of reads", description: "'--readTypes' number should match the number of reads." },
    ErrorInfo { code: 40, message: "File does not exist", description: "Failure to find input file passed in the parameters." },
    ErrorInfo { code: 50, message: "File has no reads", description: "No reads found in the file." },
    ErrorInfo { code: 70, message: "Input files have deflines from different platforms", description: "Input files have deflines from different platforms." },
    ErrorInfo { code: 80, message: "10x input files are mixed with different types.", description: "10x input files are mixed with different types (check file names)." },
    ErrorInfo { code: 100, message: "Defline not recognized", description: "Failed to parse defline." },
    ErrorInfo { code: 101, message: "Illumina defline is not recognized", description: "Failed to parse defline." },
    ErrorInfo { code: 110, message: "Read has no sequence data", description: "FastQ read has no sequence data." },
    ErrorInfo { code: 111, message: "Read has no quality scores", description: "FastQ read has no quality scores." },
    ErrorInfo { code: 120, message: "Unexpected quality score value", description: "Quality score is out of expected range." },
    ErrorInfo { code: 130, message: "Quality score length exceeds sequence length", description: "Quality score length exceeds sequence length." },
    ErrorInfo { code: 140, message: "Quality score contains unexpected character", description: "Quality score contains unexpected characters." },
    ErrorInfo { code: 150, message: "Invalid readType", description: "Unexpected '--readTypes' parameter values." },
    ErrorInfo { code: 160, message: "Invalid sequence characters", description: "Sequence contains non-alphabetical character." },
    ErrorInfo { code: 170, message: "Collation check. Duplicate spot", description: "Collation check found duplicated spot name." },
    ErrorInfo { code: 180, message: "File ended early. Use '--allowEarlyFileEnd' to allow load to finish.", description: "One of the files is shorter than the other. Use '--allowEarlyFileEnd' to allow load to finish." },
    ErrorInfo { code: 190, message: "Unsupported interleaved file with orphans", description: "Unsupported interleaved file with orphans." },
    ErrorInfo { code: 200, message: "Invalid quality encoding", description: "Failure to calculate quality score encoding." },
    ErrorInfo { code: 210, message: "Spot has more than 4 reads", description: "Assembled spot has more than 4 reads." },
    ErrorInfo { code: 220, message: "Invalid experiment file", description: "Invalid experiment file." },
    ErrorInfo { code: 230, message: "Internal QC failure", description: "Internal QC failure." },
    ErrorInfo { code: 240, message: "Invalid platform code", description: "Invalid platform code." },
    ErrorInfo { code: 250, message: "Estimated number of spots exceeds the limit for this mode. Re-run with --spot-assembly parameter", description: "Estimated number of spots exceeds the limit for this mode. Re-run with --spot-assembly parameter." },
];

/// Print the registry as a table, for `--help-errors`.
pub fn print_error_codes(out: &mut impl std::io::Write) -> std::io::Result<()> {
    writeln!(out, "{:-^80}", " error codes ")?;
    writeln!(out, "{:<10}{:<70}", "Code", "Description")?;
    writeln!(out, "{:-^80}", "")?;
    for info in ERROR_REGISTRY {
        writeln!(out, "{:<10}{:<70}", info.code, info.description)?;
    }
    Ok(())
}

/// Error codes that warn-and-continue until the budget is spent. Everything
/// else is fatal on first occurrence.
const THROTTLED: &[u32] = &[100, 110, 111, 120, 130, 140, 160, 190];

/// Counts recoverable errors against `--max-err-count`.
///
/// `check` either swallows the error (logging it at warn) or returns it for
/// the caller to propagate. The counter is shared across reader threads.
pub struct ErrorBudget {
    max_count: u32,
    count: AtomicU32,
}

impl ErrorBudget {
    pub fn new(max_count: u32) -> Self {
        ErrorBudget { max_count, count: AtomicU32::new(0) }
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Reset between passes; the digest pass and each load pass get a fresh
    /// budget.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
    }

    pub fn check(&self, e: LoaderError) -> Result<()> {
        if self.max_count == 0 || !THROTTLED.contains(&e.code()) {
            return Err(e);
        }
        log::warn!("{}", e.message());
        let seen = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if seen >= self.max_count {
            return Err(LoaderError::new(
                e.code(),
                format!("Exceeded maximum number of errors {}", self.max_count),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_formatting() {
        let mut e = LoaderError::new(110, "Read r.1: no sequence data");
        assert_eq!(e.code(), 110);
        assert_eq!(e.message(), "[code:110] Read r.1: no sequence data");
        e.set_file("/data/run/reads_1.fastq.gz", 42);
        assert_eq!(
            e.message(),
            "[code:110] Read r.1: no sequence data [reads_1.fastq.gz:42]"
        );
    }

    #[test]
    fn test_budget_throttles_then_escalates() {
        let budget = ErrorBudget::new(3);
        assert!(budget.check(LoaderError::new(120, "bad score")).is_ok());
        assert!(budget.check(LoaderError::new(160, "bad base")).is_ok());
        // third throttled error exhausts the budget
        let e = budget.check(LoaderError::new(120, "bad score")).unwrap_err();
        assert_eq!(e.code(), 120);
        assert!(e.message().contains("Exceeded maximum number of errors"));
    }

    #[test]
    fn test_budget_structural_errors_are_fatal() {
        let budget = ErrorBudget::new(100);
        let e = budget.check(LoaderError::from_code(70)).unwrap_err();
        assert_eq!(e.code(), 70);
        assert_eq!(budget.count(), 0);
    }

    #[test]
    fn test_budget_disabled() {
        let budget = ErrorBudget::new(0);
        assert!(budget.check(LoaderError::new(120, "x")).is_err());
    }
}
