//! Batch Jobs
//!
//! A batch job is a serializable description of work run against every
//! file of a replica. Replicas run it file by file and the monitor
//! concatenates their outputs.

use std::path::Path;
use serde::{Deserialize, Serialize};

use crate::checksum::file_checksum;
use crate::error::{Error, Result};

/// Separator between filename and checksum in checksum job output
pub const CHECKSUM_SEPARATOR: &str = "##";

/// What a batch job computes per file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchKind {
    /// `<filename>##<sha256>` per file
    Checksum,
    /// `<filename>` per file
    FileList,
}

impl std::fmt::Display for BatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchKind::Checksum => write!(f, "ChecksumJob"),
            BatchKind::FileList => write!(f, "FileListJob"),
        }
    }
}

/// Which files a batch job processes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileFilter {
    All,
    Named(Vec<String>),
}

/// A batch job description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchJob {
    pub kind: BatchKind,
    pub filter: FileFilter,
    /// Timeout hint in milliseconds; `None` or 0 means the configured default
    pub timeout_ms: Option<u64>,
}

impl BatchJob {
    /// Checksum job over all files
    pub fn checksum() -> Self {
        Self {
            kind: BatchKind::Checksum,
            filter: FileFilter::All,
            timeout_ms: None,
        }
    }

    /// File listing job over all files
    pub fn filelist() -> Self {
        Self {
            kind: BatchKind::FileList,
            filter: FileFilter::All,
            timeout_ms: None,
        }
    }

    /// Restrict the job to one named file
    pub fn only_file(mut self, filename: impl Into<String>) -> Self {
        self.filter = FileFilter::Named(vec![filename.into()]);
        self
    }

    /// Set the timeout hint
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Positive timeout hint, if any
    pub fn timeout_hint(&self) -> Option<u64> {
        self.timeout_ms.filter(|ms| *ms > 0)
    }

    /// Whether the job should process the named file
    pub fn accepts(&self, filename: &str) -> bool {
        match &self.filter {
            FileFilter::All => true,
            FileFilter::Named(names) => names.iter().any(|n| n == filename),
        }
    }

    /// Produce the output line for one file
    pub async fn process_file(&self, filename: &str, path: &Path) -> Result<String> {
        match self.kind {
            BatchKind::Checksum => {
                let checksum = file_checksum(path).await?;
                Ok(format!("{}\n", checksum_line(filename, &checksum)))
            }
            BatchKind::FileList => {
                if !tokio::fs::try_exists(path).await? {
                    return Err(Error::FileNotFound(filename.to_string()));
                }
                Ok(format!("{}\n", filename))
            }
        }
    }

    /// Post-process the concatenated output of all replicas.
    ///
    /// Lines are sorted so the result does not depend on the order in which
    /// replicas answered.
    pub fn post_process(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| Error::Validation(format!("{} output is not UTF-8: {}", self.kind, e)))?;
        let mut lines: Vec<&str> = text.lines().filter(|l| !l.is_empty()).collect();
        lines.sort_unstable();

        let mut out = Vec::with_capacity(raw.len());
        for line in lines {
            out.extend_from_slice(line.as_bytes());
            out.push(b'\n');
        }
        Ok(out)
    }
}

/// Format a checksum output line
pub fn checksum_line(filename: &str, checksum: &str) -> String {
    format!("{}{}{}", filename, CHECKSUM_SEPARATOR, checksum)
}

/// Parse a `<filename>##<checksum>` line
pub fn parse_checksum_line(line: &str) -> Result<(String, String)> {
    let (name, checksum) = line
        .trim_end()
        .split_once(CHECKSUM_SEPARATOR)
        .ok_or_else(|| Error::Validation(format!("malformed checksum line '{}'", line)))?;

    if name.is_empty() || checksum.is_empty() || checksum.contains(CHECKSUM_SEPARATOR) {
        return Err(Error::Validation(format!("malformed checksum line '{}'", line)));
    }
    Ok((name.to_string(), checksum.to_string()))
}

/// Split batch output into its non-empty lines
pub fn output_lines(output: &[u8]) -> Result<Vec<String>> {
    let text = std::str::from_utf8(output)
        .map_err(|e| Error::Validation(format!("batch output is not UTF-8: {}", e)))?;
    Ok(text
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::sha256_hex;
    use tempfile::tempdir;

    #[test]
    fn test_filter_and_timeout_hint() {
        let job = BatchJob::checksum().only_file("a.warc").with_timeout_ms(0);
        assert!(job.accepts("a.warc"));
        assert!(!job.accepts("b.warc"));
        assert_eq!(job.timeout_hint(), None);
        assert!(BatchJob::filelist().accepts("anything"));
    }

    #[tokio::test]
    async fn test_process_file_checksum_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.warc");
        tokio::fs::write(&path, b"content").await.unwrap();

        let line = BatchJob::checksum().process_file("a.warc", &path).await.unwrap();
        assert_eq!(line, format!("a.warc##{}\n", sha256_hex(b"content")));

        let line = BatchJob::filelist().process_file("a.warc", &path).await.unwrap();
        assert_eq!(line, "a.warc\n");
    }

    #[test]
    fn test_parse_checksum_line() {
        assert_eq!(
            parse_checksum_line("a.warc##abc\n").unwrap(),
            ("a.warc".to_string(), "abc".to_string())
        );
        assert!(parse_checksum_line("no-separator").is_err());
        assert!(parse_checksum_line("##abc").is_err());
        assert!(parse_checksum_line("a##b##c").is_err());
    }

    #[test]
    fn test_post_process_sorts() {
        let job = BatchJob::checksum();
        let out = job.post_process(b"b##2\na##1\n\nc##3").unwrap();
        assert_eq!(out, b"a##1\nb##2\nc##3\n");

        assert!(job.post_process(&[0xff, 0xfe]).is_err());
        assert_eq!(BatchJob::filelist().post_process(b"b\na\n").unwrap(), b"a\nb\n");
    }
}
