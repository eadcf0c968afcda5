//! Size/mtime watermarks over append-only source files
use crate::ingest::parser::RecordParser;
use crate::memory_db::{FileWatermark, WatermarkMap};
use anyhow::Context;
use std::fs::{self, File, Metadata};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

pub const DEFAULT_EXTENSION: &str = "jsonl";

#[derive(Debug)]
pub struct ScanOutcome<T> {
    /// New records, file by file in path order, line order within a file
    pub items: Vec<T>,
    /// Updated watermarks for the changed files only
    pub watermarks: WatermarkMap,
    pub changed_files: Vec<PathBuf>,
    /// Lines the parser rejected
    pub skipped_lines: usize,
}

impl<T> ScanOutcome<T> {
    pub fn has_changes(&self) -> bool {
        !self.changed_files.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct IncrementalTracker {
    extension: String,
}

impl Default for IncrementalTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl IncrementalTracker {
    pub fn new() -> Self {
        Self::with_extension(DEFAULT_EXTENSION)
    }

    pub fn with_extension(extension: impl Into<String>) -> Self {
        Self { extension: extension.into() }
    }

    /// The files under watch: `source` itself when it is a file, otherwise
    /// every file with the tracked extension directly inside it, by path.
    pub fn tracked_files(&self, source: &Path) -> anyhow::Result<Vec<PathBuf>> {
        let meta = fs::metadata(source)
            .with_context(|| format!("Cannot read source {}", source.display()))?;
        if meta.is_file() {
            return Ok(vec![source.to_path_buf()]);
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(source)
            .with_context(|| format!("Cannot list source directory {}", source.display()))?
        {
            let path = entry?.path();
            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == self.extension);
            if matches && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Current watermarks of every tracked file, without reading contents
    pub fn snapshot(&self, source: &Path) -> anyhow::Result<WatermarkMap> {
        let mut marks = WatermarkMap::new();
        for path in self.tracked_files(source)? {
            let meta = fs::metadata(&path)
                .with_context(|| format!("Cannot stat {}", path.display()))?;
            marks.insert(watermark_key(&path), file_watermark(&meta)?);
        }
        Ok(marks)
    }

    /// Read whatever was added to the tracked files since `previous`.
    ///
    /// Unchanged files are not opened. A file that grew is read from its old
    /// size; one that shrank, or kept its size under a new mtime, was
    /// rewritten and is read from the start.
    ///
    /// Only newline-terminated lines are consumed while a file is being
    /// written. An unterminated tail that is still there, under the same
    /// mtime, on the next scan is taken as the file's final record.
    pub fn scan<P: RecordParser>(
        &self,
        source: &Path,
        previous: &WatermarkMap,
        parser: &P,
    ) -> anyhow::Result<ScanOutcome<P::Item>> {
        let mut outcome = ScanOutcome {
            items: Vec::new(),
            watermarks: WatermarkMap::new(),
            changed_files: Vec::new(),
            skipped_lines: 0,
        };

        for path in self.tracked_files(source)? {
            let key = watermark_key(&path);
            let meta = fs::metadata(&path)
                .with_context(|| format!("Cannot stat {}", path.display()))?;
            let current = file_watermark(&meta)?;
            let last = previous.get(&key).copied();

            if last == Some(current) {
                continue;
            }

            let offset = match last {
                Some(last) if current.size > last.size => last.size,
                Some(_) => {
                    debug!("{} was rewritten, reading from the start", path.display());
                    0
                }
                None => 0,
            };

            // Nothing was written since the last scan, yet bytes remain past
            // the recorded size: a final line without its newline.
            let settled_tail = last.is_some_and(|last| last.mtime_ns == current.mtime_ns && current.size > last.size);
            if settled_tail {
                debug!("{}: taking unterminated final line", path.display());
            }

            let (consumed, lines) = read_lines(&path, offset, settled_tail)?;
            let mut parsed = 0;
            for (line_no, line) in lines.iter().enumerate() {
                match parser.parse_line(line) {
                    Ok(Some(item)) => {
                        outcome.items.push(item);
                        parsed += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        outcome.skipped_lines += 1;
                        warn!("Skipping malformed line {} after offset {} in {}: {}", line_no + 1, offset, path.display(), e);
                    }
                }
            }
            debug!("{}: {} new records from offset {}", path.display(), parsed, offset);

            outcome.watermarks.insert(
                key,
                FileWatermark { size: offset + consumed, mtime_ns: current.mtime_ns },
            );
            outcome.changed_files.push(path);
        }

        if outcome.has_changes() {
            info!(
                "Scan found {} changed files, {} new records, {} skipped lines",
                outcome.changed_files.len(),
                outcome.items.len(),
                outcome.skipped_lines
            );
        }
        Ok(outcome)
    }
}

pub fn watermark_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn file_watermark(meta: &Metadata) -> anyhow::Result<FileWatermark> {
    let modified = meta.modified().context("File modification time unavailable")?;
    let mtime_ns = match modified.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_nanos() as i64,
        Err(before) => -(before.duration().as_nanos() as i64),
    };
    Ok(FileWatermark { size: meta.len(), mtime_ns })
}

/// Lines after `offset` and how many bytes they span. Without `take_tail`
/// the read stops at the last `\n`.
fn read_lines(path: &Path, offset: u64, take_tail: bool) -> anyhow::Result<(u64, Vec<String>)> {
    let mut file = File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .with_context(|| format!("Cannot read {}", path.display()))?;

    let end = if take_tail {
        buf.len()
    } else {
        buf.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1)
    };
    let lines = buf[..end]
        .split_inclusive(|b| *b == b'\n')
        .map(|line| {
            String::from_utf8_lossy(line)
                .trim_end_matches('\n')
                .trim_end_matches('\r')
                .to_string()
        })
        .collect();
    Ok((end as u64, lines))
}
