//! Line splitting for byte-range text sources and shuffle streams.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// Lines of one byte range `[start, end)` of a file.
///
/// Range boundaries are rounded forward to the next newline: a reader whose
/// range starts mid-line skips that partial line (it belongs to the previous
/// range), and a line that starts before `end` is read to completion even if
/// it extends past it. Adjacent ranges are therefore disjoint and together
/// cover every line of the file exactly once.
pub struct RangeLines {
    reader: BufReader<File>,
    pos: u64,
    end: u64,
}

impl RangeLines {
    pub fn open(path: &Path, start: u64, end: u64) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let mut reader = BufReader::new(file);
        let mut pos = start;
        if start > 0 {
            reader.seek(SeekFrom::Start(start))?;
            let mut skipped = Vec::new();
            let n = reader.read_until(b'\n', &mut skipped)?;
            pos += n as u64;
        }
        Ok(Self { reader, pos, end })
    }
}

impl Iterator for RangeLines {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }
        let mut buf = Vec::new();
        match self.reader.read_until(b'\n', &mut buf) {
            Ok(0) => None,
            Ok(n) => {
                self.pos += n as u64;
                Some(Ok(trim_newline(buf)))
            }
            Err(e) => Some(Err(e.into())),
        }
    }
}

fn trim_newline(mut buf: Vec<u8>) -> String {
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Split an arbitrary byte stream into lines, skipping empty ones (a
/// trailing newline in a record file is permitted).
pub fn split_lines(r: Box<dyn Read + Send>) -> impl Iterator<Item = Result<String>> {
    BufReader::new(r)
        .lines()
        .map(|l| l.map_err(Into::into))
        .filter(|l| !matches!(l, Ok(s) if s.is_empty()))
}

/// Compute `n` contiguous byte ranges covering `len` bytes.
pub fn byte_ranges(len: u64, n: usize) -> Vec<(u64, u64)> {
    let n = n.max(1) as u64;
    let chunk = len.div_ceil(n).max(1);
    (0..n)
        .map(|i| ((i * chunk).min(len), ((i + 1) * chunk).min(len)))
        .collect()
}
