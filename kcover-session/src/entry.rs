use std::fmt;
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;

/// A single program counter recorded by kcov.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawLogEntry(pub u64);

impl RawLogEntry {
    pub fn pc(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RawLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogWriteMode {
    /// Replace whatever the file held before.
    Truncate,
    /// Add to the end of the file. Used when several processes share a log.
    Append,
}

/// Renders `entries` one per line and writes them with a single call so that
/// concurrent appenders don't interleave their lines.
pub fn write_log(path: &Path, entries: &[RawLogEntry], mode: LogWriteMode) -> io::Result<()> {
    let mut rendered = String::with_capacity(entries.len() * 20);
    for entry in entries {
        // Writing into a `String` can't fail.
        let _ = writeln!(rendered, "{entry}");
    }

    let mut options = OpenOptions::new();
    options.create(true);
    match mode {
        LogWriteMode::Truncate => options.write(true).truncate(true),
        LogWriteMode::Append => options.append(true),
    };

    let mut file = options.open(path)?;
    file.write_all(rendered.as_bytes())?;
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn is_well_formed(line: &str) -> bool {
        match line.strip_prefix("0x") {
            Some(digits) => {
                !digits.is_empty()
                    && digits
                        .chars()
                        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
            }
            None => false,
        }
    }

    #[rstest]
    #[case::zero(0, "0x0")]
    #[case::small(0x1f, "0x1f")]
    #[case::kernel_text(0xffffffff81000a2c, "0xffffffff81000a2c")]
    #[case::max(u64::MAX, "0xffffffffffffffff")]
    fn entry_rendering(#[case] pc: u64, #[case] expected: &str) {
        let rendered = RawLogEntry(pc).to_string();
        assert_eq!(rendered, expected);
        assert!(is_well_formed(&rendered));
    }

    #[test]
    fn truncate_replaces_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote_coverage.log");
        std::fs::write(&path, "stale\n").unwrap();

        write_log(
            &path,
            &[RawLogEntry(0xffffffff81000000), RawLogEntry(0xabc)],
            LogWriteMode::Truncate,
        )
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "0xffffffff81000000\n0xabc\n");
        assert!(content.lines().all(is_well_formed));
    }

    #[test]
    fn append_keeps_previous_writers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local_coverage.log");

        write_log(&path, &[RawLogEntry(1)], LogWriteMode::Append).unwrap();
        write_log(&path, &[RawLogEntry(2), RawLogEntry(3)], LogWriteMode::Append).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "0x1\n0x2\n0x3\n");
    }

    #[test]
    fn no_entries_still_creates_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote_coverage.log");

        write_log(&path, &[], LogWriteMode::Truncate).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}
