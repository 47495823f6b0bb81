use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{info, warn};

use crate::error::StoreError;
use crate::record::sanitize_name;

const ROW_FILE_EXT: &str = "csv";

static RUN_SEQ: AtomicU64 = AtomicU64::new(0);

/// One lock per bucket path. Commits hold it exclusively; listings share it.
static BUCKET_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn bucket_lock(dir: &Path) -> Arc<RwLock<()>> {
    let mut locks = BUCKET_LOCKS.lock().unwrap_or_else(PoisonError::into_inner);
    locks.entry(dir.to_path_buf()).or_default().clone()
}

// The guarded value is `()`, so a poisoned lock carries no broken state.
fn read_guard(lock: &RwLock<()>) -> RwLockReadGuard<'_, ()> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_guard(lock: &RwLock<()>) -> RwLockWriteGuard<'_, ()> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Lower-case, anything but letters, digits and `-` to underscores:
/// `"Multiple Myeloma"` -> `multiple_myeloma`, `"../etc"` -> `___etc`.
pub fn path_segment(label: &str) -> String {
    let segment = sanitize_name(&label.trim().to_lowercase());
    if segment.is_empty() {
        "_".to_string()
    } else {
        segment
    }
}

/// `<data_dir>/<country>/<cancer_type>`
pub fn bucket_dir(data_dir: &Path, country: &str, cancer_type: &str) -> PathBuf {
    data_dir
        .join(path_segment(country))
        .join(path_segment(cancer_type))
}

/// Unique per call, including concurrent calls within one process.
fn new_run_id() -> String {
    format!(
        "{}-{}-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%.6f"),
        std::process::id(),
        RUN_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// Write rows as comma-delimited records; rows may differ in width.
pub fn write_row_file(path: &Path, rows: &[Vec<String>]) -> Result<(), StoreError> {
    let csv_err = |source| StoreError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(csv_err)?;
    for row in rows {
        writer.write_record(row).map_err(csv_err)?;
    }
    writer.flush().map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

/// A bucket being assembled in a private staging directory. Nothing is
/// visible at the bucket path until `commit`.
pub struct BucketWriter {
    target: PathBuf,
    staging: PathBuf,
    run_id: String,
    written: Vec<PathBuf>,
}

impl BucketWriter {
    pub fn create(data_dir: &Path, country: &str, cancer_type: &str) -> Result<Self, StoreError> {
        let target = bucket_dir(data_dir, country, cancer_type);
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| data_dir.to_path_buf());
        let run_id = new_run_id();
        let staging = parent.join(format!(".staging-{}-{}", path_segment(cancer_type), run_id));
        fs::create_dir_all(&staging).map_err(|e| StoreError::io(&staging, e))?;
        Ok(BucketWriter {
            target,
            staging,
            run_id,
            written: Vec::new(),
        })
    }

    /// Stage one row file named `<file_stem>.csv`.
    pub fn write(&mut self, file_stem: &str, rows: &[Vec<String>]) -> Result<(), StoreError> {
        let path = self.staging.join(format!("{}.{}", file_stem, ROW_FILE_EXT));
        write_row_file(&path, rows)?;
        self.written.push(path);
        Ok(())
    }

    /// Swap the staged bucket into place, superseding any previous one.
    /// Commits to the same bucket run one at a time, and readers going
    /// through `list_row_files` or `with_bucket` never see the gap between
    /// the two renames. Returns the final paths of the written files.
    pub fn commit(self) -> Result<Vec<PathBuf>, StoreError> {
        let lock = bucket_lock(&self.target);
        let _guard = write_guard(&lock);

        let superseded = self
            .staging
            .with_file_name(format!(".superseded-{}", self.run_id));
        let had_previous = self.target.exists();
        if had_previous {
            fs::rename(&self.target, &superseded).map_err(|e| StoreError::io(&self.target, e))?;
        }
        fs::rename(&self.staging, &self.target).map_err(|e| StoreError::io(&self.staging, e))?;
        if had_previous {
            if let Err(e) = fs::remove_dir_all(&superseded) {
                warn!(path = %superseded.display(), "Could not remove superseded bucket: {}", e);
            }
        }

        info!(bucket = %self.target.display(), files = self.written.len(), "Bucket committed");
        Ok(self
            .written
            .iter()
            .filter_map(|p| p.file_name())
            .map(|name| self.target.join(name))
            .collect())
    }

    /// Drop the staged files without touching the live bucket.
    pub fn discard(self) -> Result<(), StoreError> {
        fs::remove_dir_all(&self.staging).map_err(|e| StoreError::io(&self.staging, e))
    }
}

/// Row files in a bucket, in rank order. A missing bucket is empty.
pub fn list_row_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    with_bucket(dir, |files| files.to_vec())
}

/// Run `f` over the bucket's row files while no commit can replace them.
pub fn with_bucket<R>(dir: &Path, f: impl FnOnce(&[PathBuf]) -> R) -> Result<R, StoreError> {
    let lock = bucket_lock(dir);
    let _guard = read_guard(&lock);
    let files = row_files_in(dir)?;
    Ok(f(&files))
}

/// Leading digits of a `<rank>_<key>` file name.
fn rank_prefix(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let digits: String = name.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

fn row_files_in(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| StoreError::io(dir, e))?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == ROW_FILE_EXT) {
            files.push(path);
        }
    }
    // numeric rank first so 1000_ follows 999_; unranked files go last
    files.sort_by_cached_key(|p| (rank_prefix(p).unwrap_or(u64::MAX), p.clone()));
    Ok(files)
}

pub fn read_row_file(path: &Path) -> Result<String, StoreError> {
    fs::read_to_string(path).map_err(|e| StoreError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(name: &str) -> Vec<Vec<String>> {
        vec![
            vec!["Name:".into(), name.into()],
            vec!["Eligibility Criteria:".into(), "line one, with comma\nline \"two\"".into()],
        ]
    }

    #[test]
    fn bucket_layout() {
        let p = bucket_dir(Path::new("trials_data"), "Ireland", "Multiple Myeloma");
        assert_eq!(p, Path::new("trials_data/ireland/multiple_myeloma"));
    }

    #[test]
    fn segments_cannot_leave_the_data_dir() {
        let p = bucket_dir(Path::new("trials_data"), "../..", "lung/../../etc");
        assert_eq!(p, Path::new("trials_data/_____/lung_______etc"));
        assert_eq!(path_segment("  "), "_");

        let dir = tempfile::tempdir().unwrap();
        let mut w = BucketWriter::create(dir.path(), "..", "a/b").unwrap();
        w.write("001_T", &rows("T")).unwrap();
        let paths = w.commit().unwrap();
        assert_eq!(paths, vec![dir.path().join("__/a_b/001_T.csv")]);
    }

    #[test]
    fn listing_follows_numeric_rank() {
        let dir = tempfile::tempdir().unwrap();
        for stem in ["1000_Last", "101_Mid", "999_Late", "002_First", "notes"] {
            write_row_file(&dir.path().join(format!("{}.csv", stem)), &rows(stem)).unwrap();
        }
        let names: Vec<_> = list_row_files(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["002_First.csv", "101_Mid.csv", "999_Late.csv", "1000_Last.csv", "notes.csv"]
        );
    }

    #[test]
    fn row_file_quotes_when_needed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        write_row_file(&path, &rows("Trial A")).unwrap();
        let text = read_row_file(&path).unwrap();
        assert!(text.starts_with("Name:,Trial A\n"));
        assert!(text.contains("Eligibility Criteria:,\"line one, with comma\nline \"\"two\"\"\""));
    }

    #[test]
    fn commit_supersedes_previous_bucket() {
        let dir = tempfile::tempdir().unwrap();

        let mut first = BucketWriter::create(dir.path(), "Ireland", "Breast").unwrap();
        first.write("000_Old", &rows("Old")).unwrap();
        first.write("001_Gone", &rows("Gone")).unwrap();
        first.commit().unwrap();

        let mut second = BucketWriter::create(dir.path(), "Ireland", "Breast").unwrap();
        second.write("000_New", &rows("New")).unwrap();
        let paths = second.commit().unwrap();

        let bucket = bucket_dir(dir.path(), "Ireland", "Breast");
        assert_eq!(paths, vec![bucket.join("000_New.csv")]);
        assert_eq!(list_row_files(&bucket).unwrap(), vec![bucket.join("000_New.csv")]);

        // no staging or superseded directories left behind
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("ireland"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec!["breast"]);
    }

    #[test]
    fn staged_files_invisible_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = BucketWriter::create(dir.path(), "Ireland", "Lung").unwrap();
        let mut b = BucketWriter::create(dir.path(), "Ireland", "Lung").unwrap();
        a.write("000_A", &rows("A")).unwrap();
        b.write("000_B", &rows("B")).unwrap();

        let bucket = bucket_dir(dir.path(), "Ireland", "Lung");
        assert!(list_row_files(&bucket).unwrap().is_empty());

        a.commit().unwrap();
        b.commit().unwrap();
        // last completed run wins, no interleaving
        assert_eq!(list_row_files(&bucket).unwrap(), vec![bucket.join("000_B.csv")]);
    }

    #[test]
    fn concurrent_commits_never_expose_a_partial_bucket() {
        use std::sync::atomic::AtomicBool;
        use std::thread;

        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_path_buf();
        let bucket = bucket_dir(&data_dir, "Ireland", "Breast");

        let mut seed = BucketWriter::create(&data_dir, "Ireland", "Breast").unwrap();
        seed.write("001_Seed", &rows("Seed")).unwrap();
        seed.write("002_Seed", &rows("Seed")).unwrap();
        seed.commit().unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let (bucket, done) = (bucket.clone(), Arc::clone(&done));
            thread::spawn(move || {
                let mut bad_reads = 0;
                while !done.load(Ordering::Relaxed) {
                    if list_row_files(&bucket).unwrap().len() != 2 {
                        bad_reads += 1;
                    }
                }
                bad_reads
            })
        };

        let writers: Vec<_> = (0..4)
            .map(|t| {
                let data_dir = data_dir.clone();
                thread::spawn(move || {
                    for round in 0..50 {
                        let mut w = BucketWriter::create(&data_dir, "Ireland", "Breast").unwrap();
                        w.write(&format!("001_T{}R{}", t, round), &rows("A")).unwrap();
                        w.write(&format!("002_T{}R{}", t, round), &rows("B")).unwrap();
                        w.commit().unwrap();
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        done.store(true, Ordering::Relaxed);
        assert_eq!(reader.join().unwrap(), 0);

        // both files of the surviving bucket come from the same run
        let files = list_row_files(&bucket).unwrap();
        let run = |p: &PathBuf| p.file_name().unwrap().to_string_lossy()[4..].to_string();
        assert_eq!(files.len(), 2);
        assert_eq!(run(&files[0]), run(&files[1]));

        let leftovers: Vec<_> = fs::read_dir(data_dir.join("ireland"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec!["breast"]);
    }

    #[test]
    fn discard_leaves_live_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let mut live = BucketWriter::create(dir.path(), "Ireland", "CLL").unwrap();
        live.write("000_Live", &rows("Live")).unwrap();
        live.commit().unwrap();

        let mut aborted = BucketWriter::create(dir.path(), "Ireland", "CLL").unwrap();
        aborted.write("000_Partial", &rows("Partial")).unwrap();
        aborted.discard().unwrap();

        let bucket = bucket_dir(dir.path(), "Ireland", "CLL");
        assert_eq!(list_row_files(&bucket).unwrap(), vec![bucket.join("000_Live.csv")]);
    }
}
