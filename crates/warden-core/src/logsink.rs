//! Per-component append-only log sinks (spec §4.7, §5 "Shared resources").
//!
//! Each component's stdout/stderr is redirected to one of these files.
//! Sinks are size-capped with discard-oldest rotation (spec §5 names both
//! "truncate-and-head or discard-oldest" as acceptable; §2 DESIGN_NOTES
//! decision in `DESIGN.md` picks discard-oldest since its invariant —
//! current contents are always a suffix of everything ever written — is
//! cheap to state and to test).

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Default cap: 4 MiB per component.
pub const DEFAULT_CAP_BYTES: u64 = 4 * 1024 * 1024;

pub struct LogSink {
    path: PathBuf,
    cap_bytes: u64,
    file: File,
    size: u64,
}

impl LogSink {
    pub fn open(dir: &Path, component_name: &str, cap_bytes: u64) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{component_name}.log"));
        let file = OpenOptions::new().create(true).append(true).read(true).open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self { path, cap_bytes, file, size })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The raw fd to dup2 onto the child's stdout/stderr at fork time.
    pub fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.file.as_raw_fd()
    }

    /// Appends `data`, then rotates (discard-oldest) if the cap was
    /// exceeded. Used by the reactor when draining a component's captured
    /// stdout/stderr into the sink, and directly by tests.
    pub fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.file.flush()?;
        self.size += data.len() as u64;
        if self.size > self.cap_bytes {
            self.rotate_discard_oldest()?;
        }
        Ok(())
    }

    fn rotate_discard_oldest(&mut self) -> io::Result<()> {
        let mut contents = Vec::new();
        {
            let mut reader = OpenOptions::new().read(true).open(&self.path)?;
            reader.read_to_end(&mut contents)?;
        }
        let keep_from = contents.len().saturating_sub(self.cap_bytes as usize);
        let trimmed = &contents[keep_from..];

        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(trimmed)?;
        self.file.flush()?;
        self.size = trimmed.len() as u64;
        Ok(())
    }

    /// Tail the last `n` lines, for the control surface's `log <component>
    /// [n]` operation (spec §4.9).
    pub fn tail(&self, n: usize) -> io::Result<String> {
        let mut contents = String::new();
        let mut reader = OpenOptions::new().read(true).open(&self.path)?;
        reader.read_to_string(&mut contents)?;
        let lines: Vec<&str> = contents.lines().collect();
        let start = lines.len().saturating_sub(n);
        Ok(lines[start..].join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appended_content_stays_under_cap_and_is_a_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = LogSink::open(dir.path(), "demo", 16).unwrap();
        sink.append(b"0123456789").unwrap();
        sink.append(b"abcdefghij").unwrap();
        let contents = std::fs::read(sink.path()).unwrap();
        assert!(contents.len() <= 16);
        assert!(b"0123456789abcdefghij".ends_with(&contents[..]));
    }

    #[test]
    fn tail_returns_last_n_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = LogSink::open(dir.path(), "demo", DEFAULT_CAP_BYTES).unwrap();
        sink.append(b"one\ntwo\nthree\nfour\n").unwrap();
        assert_eq!(sink.tail(2).unwrap(), "three\nfour");
    }
}
