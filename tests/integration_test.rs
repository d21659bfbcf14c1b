use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

fn write_fastq(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, body).unwrap();
    path.to_str().unwrap().to_string()
}

fn output_rows(path: &Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .filter(|v: &serde_json::Value| v.get("meta").is_none())
        .collect()
}

#[test]
fn test_single_fastq_loads_two_spots() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_fastq(
        &dir,
        "reads.fastq",
        "@A 1:N:0:X\nGATT\n+\n!!!!\n@B 1:N:0:X\nACGT\n+\n!!!!\n",
    );
    let out = dir.path().join("archive.jsonl");

    Command::cargo_bin("spotload")
        .unwrap()
        .arg(&input)
        .arg("--output")
        .arg(&out)
        .assert()
        .success();

    let rows = output_rows(&out);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["name"], "A");
    assert_eq!(rows[0]["read"], "GATT");
    assert_eq!(rows[0]["quality"], serde_json::json!([33, 33, 33, 33]));
    assert_eq!(rows[0]["read_type"], serde_json::json!([1]));
    assert_eq!(rows[0]["spot_group"], "X");
    assert_eq!(rows[1]["name"], "B");
    assert_eq!(rows[1]["read"], "ACGT");
}

#[test]
fn test_paired_files_assemble_one_spot() {
    let dir = tempfile::tempdir().unwrap();
    let r1 = write_fastq(&dir, "r1.fastq", "@S 1:N:0:G\nGA\n+\n!!\n");
    let r2 = write_fastq(&dir, "r2.fastq", "@S 2:N:0:G\nTT\n+\n!!\n");
    let out = dir.path().join("archive.jsonl");

    Command::cargo_bin("spotload")
        .unwrap()
        .args([&r1, &r2])
        .arg("--output")
        .arg(&out)
        .assert()
        .success();

    let rows = output_rows(&out);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["read"], "GATT");
    assert_eq!(rows[0]["read_start"], serde_json::json!([0, 2]));
    assert_eq!(rows[0]["read_len"], serde_json::json!([2, 2]));
}

#[test]
fn test_uridine_is_translated_to_thymine() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_fastq(&dir, "reads.fastq", "@A 1:N:0:X\nU\n+\n!\n");
    let out = dir.path().join("archive.jsonl");

    Command::cargo_bin("spotload")
        .unwrap()
        .arg(&input)
        .arg("--output")
        .arg(&out)
        .assert()
        .success();

    let rows = output_rows(&out);
    assert_eq!(rows[0]["read"], "T");
}

#[test]
fn test_duplicate_spot_name_fails_with_code_170() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_fastq(
        &dir,
        "reads.fastq",
        "@X 1:N:0:G\nGA\n+\n!!\n@Y 1:N:0:G\nTT\n+\n!!\n@X 1:N:0:G\nCC\n+\n!!\n",
    );
    let out = dir.path().join("archive.jsonl");

    Command::cargo_bin("spotload")
        .unwrap()
        .arg(&input)
        .arg("--output")
        .arg(&out)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("[code:170]"));
}

#[test]
fn test_spot_assembly_merges_far_mates() {
    let dir = tempfile::tempdir().unwrap();
    // mates of S are separated by another spot; a tiny hot threshold pushes
    // them through the cold store
    let input = write_fastq(
        &dir,
        "reads.fastq",
        "@S 1:N:0:G\nGATTAC\n+\nIIIIII\n@T 1:N:0:G\nCCGG\n+\nFFFF\n@S 2:N:0:G\nTTAA\n+\nIIII\n",
    );
    let out = dir.path().join("archive.jsonl");
    let telemetry_path = dir.path().join("telemetry.json");

    Command::cargo_bin("spotload")
        .unwrap()
        .arg(&input)
        .arg("--spot-assembly")
        .arg("--hot-reads-threshold")
        .arg("1")
        .arg("--output")
        .arg(&out)
        .arg("--telemetry")
        .arg(&telemetry_path)
        .assert()
        .success();

    let rows = output_rows(&out);
    assert_eq!(rows.len(), 2);
    let s_row = rows.iter().find(|r| r["name"] == "S").unwrap();
    assert_eq!(s_row["read"], "GATTACTTAA");
    assert_eq!(s_row["read_len"], serde_json::json!([6, 4]));

    let telemetry: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&telemetry_path).unwrap()).unwrap();
    assert_eq!(telemetry["is_spot_assembly"], 1);
    assert!(telemetry["i"]["far_reads"].as_u64().unwrap() >= 1);
}

#[test]
fn test_early_file_end_is_fatal_without_flag() {
    let dir = tempfile::tempdir().unwrap();
    let r1 = write_fastq(
        &dir,
        "r1.fastq",
        "@S 1:N:0:G\nGA\n+\n!!\n@T 1:N:0:G\nCA\n+\n!!\n",
    );
    let r2 = write_fastq(&dir, "r2.fastq", "@S 2:N:0:G\nTT\n+\n!!\n");

    Command::cargo_bin("spotload")
        .unwrap()
        .args([&r1, &r2])
        .arg("--output")
        .arg(dir.path().join("archive.jsonl"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("[code:180]"));

    Command::cargo_bin("spotload")
        .unwrap()
        .args([&r1, &r2])
        .arg("--allowEarlyFileEnd")
        .arg("--output")
        .arg(dir.path().join("archive2.jsonl"))
        .assert()
        .success();
}

#[test]
fn test_digest_reports_layout() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_fastq(
        &dir,
        "reads.fastq",
        "@A 1:N:0:X\nGATT\n+\nIIII\n@B 1:N:0:X\nACGT\n+\nIIII\n",
    );

    Command::cargo_bin("spotload")
        .unwrap()
        .arg(&input)
        .arg("--digest")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"quality_encoding\": 33"))
        .stdout(predicate::str::contains("illuminaNewDataGroup"));
}

#[test]
fn test_help_errors_prints_registry() {
    Command::cargo_bin("spotload")
        .unwrap()
        .arg("--help-errors")
        .assert()
        .success()
        .stdout(predicate::str::contains("170"))
        .stdout(predicate::str::contains("Collation check"));
}

#[test]
fn test_print_deflines_lists_matchers() {
    Command::cargo_bin("spotload")
        .unwrap()
        .arg("--print-deflines")
        .assert()
        .success()
        .stdout(predicate::str::contains("illuminaNew"))
        .stdout(predicate::str::contains("Nanopore1"));
}

#[test]
fn test_missing_input_is_error_40() {
    Command::cargo_bin("spotload")
        .unwrap()
        .arg("/no/such/file.fastq")
        .assert()
        .failure()
        .stderr(predicate::str::contains("[code:40]"));
}

#[test]
fn test_invalid_read_types_is_error_150() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_fastq(&dir, "reads.fastq", "@A 1:N:0:X\nGATT\n+\n!!!!\n");
    Command::cargo_bin("spotload")
        .unwrap()
        .arg(&input)
        .arg("--readTypes")
        .arg("BX")
        .assert()
        .failure()
        .stderr(predicate::str::contains("[code:150]"));
}
