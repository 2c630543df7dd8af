use quickcheck::{Arbitrary, Gen};
use quickcheck_macros::quickcheck;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

use sector_rr::store::{SectorKey, SectorStore};

/// A storage directory's worth of records, unique by key
#[derive(Debug, Clone)]
struct Records(BTreeMap<SectorKey, Vec<u8>>);

impl Arbitrary for Records {
    fn arbitrary(g: &mut Gen) -> Self {
        let count = usize::arbitrary(g) % 20;
        let records = (0..count)
            .map(|_| {
                // Sector-aligned offsets like a real disk workload
                let offset = u64::from(u32::arbitrary(g)) * 512;
                let length = u32::arbitrary(g) % 8192;
                let data = arbitrary_vec_limited(g, length as usize + 1);
                (SectorKey::new(offset, length), data)
            })
            .collect();
        Records(records)
    }
}

/// Generate a limited-size vector to avoid overly large test cases
fn arbitrary_vec_limited<T: Arbitrary>(g: &mut Gen, max_size: usize) -> Vec<T> {
    let size = usize::arbitrary(g) % max_size.min(g.size()).max(1);
    (0..size).map(|_| T::arbitrary(g)).collect()
}

fn run(args: &[&str], datadir: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sector-rr"))
        .args(args)
        .arg("--datadir")
        .arg(datadir)
        .output()
        .expect("failed to run sector-rr")
}

fn run_ok(args: &[&str], datadir: &Path) -> Result<Output, String> {
    let output = run(args, datadir);
    if output.status.success() {
        Ok(output)
    } else {
        Err(format!(
            "sector-rr {:?} failed with {}: {}",
            args,
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ))
    }
}

fn roundtrip_through(records: &Records, archive_name: &str) -> Result<bool, String> {
    let temp_dir = TempDir::new().map_err(|e| format!("Failed to create temp dir: {}", e))?;
    let source = temp_dir.path().join("source");
    let target = temp_dir.path().join("target");
    fs::create_dir(&source).map_err(|e| format!("Failed to create source dir: {}", e))?;

    let store = SectorStore::new(&source);
    for (key, data) in &records.0 {
        store
            .capture(*key, data)
            .map_err(|e| format!("Failed to capture: {}", e))?;
    }

    let archive = temp_dir.path().join(archive_name);
    let archive_arg = archive.to_str().ok_or("non-UTF-8 temp path")?;
    run_ok(&["export", archive_arg], &source)?;
    run_ok(&["import", archive_arg], &target)?;

    let restored = SectorStore::new(&target);
    let keys = restored
        .keys()
        .map_err(|e| format!("Failed to list restored store: {}", e))?;
    if keys.len() != records.0.len() {
        return Ok(false);
    }
    for (key, data) in &records.0 {
        let payload = restored
            .retrieve(*key)
            .map_err(|e| format!("Failed to retrieve {}: {}", key, e))?;
        if &payload != data {
            return Ok(false);
        }
    }
    Ok(true)
}

#[quickcheck]
fn roundtrip_store_through_json(records: Records) -> Result<bool, String> {
    roundtrip_through(&records, "sectors.json")
}

#[quickcheck]
fn roundtrip_store_through_cbor(records: Records) -> Result<bool, String> {
    roundtrip_through(&records, "sectors.cbor")
}

#[test]
fn list_flags_short_reads() {
    let temp_dir = TempDir::new().expect("temp dir");
    let store = SectorStore::new(temp_dir.path());
    store.capture(SectorKey::new(0, 512), &[1; 512]).unwrap();
    store.capture(SectorKey::new(4096, 512), &[2; 100]).unwrap();

    let output = run_ok(&["list"], temp_dir.path()).unwrap();
    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines, vec!["0\t512\t512", "4096\t512\t100  (short read)"]);
}

#[test]
fn export_requires_existing_storage() {
    let temp_dir = TempDir::new().expect("temp dir");
    let archive = temp_dir.path().join("out.json");
    let output = run(
        &["export", archive.to_str().unwrap()],
        &temp_dir.path().join("missing"),
    );
    assert!(!output.status.success());
    assert!(!archive.exists());
}

#[test]
fn export_rejects_unknown_extension() {
    let temp_dir = TempDir::new().expect("temp dir");
    let archive = temp_dir.path().join("out.tar");
    let output = run(&["export", archive.to_str().unwrap()], temp_dir.path());
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unsupported file extension"));
}
