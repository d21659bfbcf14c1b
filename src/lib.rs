pub mod bam;
pub mod collation;
pub mod defline;
pub mod digest;
pub mod error;
pub mod name_index;
pub mod pipeline;
pub mod read;
pub mod reader;
pub mod sparse;
pub mod spot_store;
pub mod telemetry;
pub mod writer;

use error::{LoaderError, Result};

/// Heal a missing input path by trying the compressed/uncompressed
/// sibling: `reads.fastq` falls back to `reads.fastq.gz`/`.bz2` and a
/// compressed name falls back to its plain form. Anything else is error 40.
pub fn check_input_files(files: &mut [String]) -> Result<()> {
    for f in files.iter_mut() {
        if f == "-" || std::path::Path::new(f.as_str()).exists() {
            continue;
        }
        let mut healed = false;
        if !f.ends_with(".gz") && !f.ends_with(".bz2") {
            for ext in [".gz", ".bz2"] {
                let candidate = format!("{}{}", f, ext);
                if std::path::Path::new(&candidate).exists() {
                    log::debug!("File '{}': {} extension added", f, ext);
                    *f = candidate;
                    healed = true;
                    break;
                }
            }
        } else {
            let stripped = f.trim_end_matches(".gz").trim_end_matches(".bz2");
            if std::path::Path::new(stripped).exists() {
                log::debug!("File '{}': compressed extension ignored", f);
                *f = stripped.to_string();
                healed = true;
            }
        }
        if !healed {
            return Err(LoaderError::new(40, format!("File '{}' does not exist", f)));
        }
    }
    Ok(())
}

/// Transpose `--readNPairFiles` lists into per-spot batches; every list
/// must carry the same number of files (error 10).
pub fn build_read_pair_batches(pair_lists: &[Vec<String>]) -> Result<Vec<Vec<String>>> {
    let lists: Vec<&Vec<String>> = pair_lists.iter().filter(|l| !l.is_empty()).collect();
    let Some(first) = lists.first() else {
        return Ok(Vec::new());
    };
    if lists.iter().any(|l| l.len() != first.len()) {
        return Err(LoaderError::from_code(10));
    }
    let mut batches: Vec<Vec<String>> = (0..first.len()).map(|_| Vec::new()).collect();
    for list in lists {
        for (batch, file) in batches.iter_mut().zip(list.iter()) {
            batch.push(file.clone());
        }
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_input_files_heals_gz() {
        let dir = tempfile::tempdir().unwrap();
        let gz = dir.path().join("reads.fastq.gz");
        std::fs::write(&gz, b"x").unwrap();
        let plain = dir.path().join("reads.fastq");
        let mut files = vec![plain.to_str().unwrap().to_string()];
        check_input_files(&mut files).unwrap();
        assert_eq!(files[0], gz.to_str().unwrap());
    }

    #[test]
    fn test_check_input_files_missing_is_error_40() {
        let mut files = vec!["/definitely/not/here.fastq".to_string()];
        assert_eq!(check_input_files(&mut files).unwrap_err().code(), 40);
    }

    #[test]
    fn test_read_pair_batches_transpose() {
        let lists = vec![
            vec!["a1".to_string(), "b1".to_string()],
            vec!["a2".to_string(), "b2".to_string()],
            vec![],
            vec![],
        ];
        let batches = build_read_pair_batches(&lists).unwrap();
        assert_eq!(
            batches,
            vec![
                vec!["a1".to_string(), "a2".to_string()],
                vec!["b1".to_string(), "b2".to_string()],
            ]
        );
    }

    #[test]
    fn test_read_pair_batches_uneven_is_error_10() {
        let lists = vec![
            vec!["a1".to_string(), "b1".to_string()],
            vec!["a2".to_string()],
        ];
        assert_eq!(build_read_pair_batches(&lists).unwrap_err().code(), 10);
    }
}
