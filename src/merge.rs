use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, span, warn, Level};

use crate::util::remove_if_exists;

/// Where the merged entries came from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeSummary {
    pub local_lines: usize,
    pub remote_lines: usize,
}

impl MergeSummary {
    pub fn total(&self) -> usize {
        self.local_lines + self.remote_lines
    }
}

/// Contents of a partial log, or `None` when there's nothing to consume.
/// Unreadable logs are treated as absent and kept around for inspection.
fn read_partial(path: &Path) -> Option<Vec<u8>> {
    match fs::read(path) {
        Ok(contents) => Some(contents),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("{} does not exist", path.display());
            None
        }
        Err(e) => {
            warn!("ignoring unreadable {}: {}", path.display(), e);
            None
        }
    }
}

/// Number of lines in `contents`, counting an unterminated last one.
fn count_lines(contents: &[u8]) -> usize {
    let newlines = contents.iter().filter(|&&b| b == b'\n').count();
    match contents.last() {
        Some(b'\n') | None => newlines,
        Some(_) => newlines + 1,
    }
}

fn consume(path: &Path) {
    if let Err(e) = remove_if_exists(path) {
        warn!("failed to remove {}: {}", path.display(), e);
    }
}

/// Writes the local log followed by the remote one to `out` byte for byte,
/// and deletes both partial logs. `out` is created even when neither input
/// exists. A log missing its final newline gets one, so that its last entry
/// doesn't run into the next log's first.
pub fn merge_logs(local: &Path, remote: &Path, out: &Path) -> Result<MergeSummary> {
    let _span = span!(Level::DEBUG, "merge_logs").entered();

    let mut merged = Vec::new();
    let mut summary = MergeSummary::default();
    let mut consumed = Vec::new();

    for (path, lines) in [
        (local, &mut summary.local_lines),
        (remote, &mut summary.remote_lines),
    ] {
        let Some(contents) = read_partial(path) else {
            continue;
        };
        *lines = count_lines(&contents);
        merged.extend_from_slice(&contents);
        if !contents.is_empty() && !contents.ends_with(b"\n") {
            merged.push(b'\n');
        }
        consumed.push(path);
    }

    fs::write(out, merged).with_context(|| format!("failed to write {}", out.display()))?;
    for path in consumed {
        consume(path);
    }

    debug!(
        "merged {} local and {} remote entries into {}",
        summary.local_lines,
        summary.remote_lines,
        out.display()
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn partial(prefix: u64, lines: usize) -> String {
        (0..lines)
            .map(|i| format!("{:#x}\n", prefix + i as u64))
            .collect()
    }

    #[rstest]
    #[case::no_inputs(0, 0)]
    #[case::both(3, 5)]
    #[case::local_only(3, 0)]
    #[case::remote_only(0, 5)]
    fn merge_preserves_order(#[case] local_lines: usize, #[case] remote_lines: usize) {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local_coverage.log");
        let remote = dir.path().join("remote_coverage.log");
        let out = dir.path().join("coverage.log");

        if local_lines > 0 {
            fs::write(&local, partial(0xffffffff81000000, local_lines)).unwrap();
        }
        if remote_lines > 0 {
            fs::write(&remote, partial(0xffffffff82000000, remote_lines)).unwrap();
        }

        let summary = merge_logs(&local, &remote, &out).unwrap();
        assert_eq!(
            summary,
            MergeSummary {
                local_lines,
                remote_lines
            }
        );

        let expected = partial(0xffffffff81000000, local_lines)
            + &partial(0xffffffff82000000, remote_lines);
        assert_eq!(fs::read_to_string(&out).unwrap(), expected);
        assert_eq!(summary.total(), local_lines + remote_lines);
        assert!(!local.exists());
        assert!(!remote.exists());
    }

    #[test]
    fn bytes_are_copied_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local_coverage.log");
        let remote = dir.path().join("remote_coverage.log");
        let out = dir.path().join("coverage.log");
        fs::write(&local, b"0x1\n\xff\n\n").unwrap();
        fs::write(&remote, b"0x2\n0x3").unwrap();

        let summary = merge_logs(&local, &remote, &out).unwrap();
        assert_eq!(
            summary,
            MergeSummary {
                local_lines: 3,
                remote_lines: 2
            }
        );
        assert_eq!(fs::read(&out).unwrap(), b"0x1\n\xff\n\n0x2\n0x3\n");
        assert!(!local.exists());
        assert!(!remote.exists());
    }

    #[test]
    fn unterminated_local_log_keeps_entries_apart() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local_coverage.log");
        let remote = dir.path().join("remote_coverage.log");
        let out = dir.path().join("coverage.log");
        fs::write(&local, "0x1\n0x2").unwrap();
        fs::write(&remote, "0x3\n").unwrap();

        merge_logs(&local, &remote, &out).unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap(), "0x1\n0x2\n0x3\n");
    }

    #[rstest]
    #[case::empty(b"", 0)]
    #[case::terminated(b"0x1\n0x2\n", 2)]
    #[case::unterminated(b"0x1\n0x2", 2)]
    #[case::blank_line(b"\n", 1)]
    fn lines_are_counted(#[case] contents: &[u8], #[case] expected: usize) {
        assert_eq!(count_lines(contents), expected);
    }

    #[test]
    fn empty_inputs_are_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local_coverage.log");
        let remote = dir.path().join("remote_coverage.log");
        let out = dir.path().join("coverage.log");
        fs::write(&local, "").unwrap();
        fs::write(&remote, "").unwrap();

        let summary = merge_logs(&local, &remote, &out).unwrap();
        assert_eq!(summary.total(), 0);
        assert_eq!(fs::read_to_string(&out).unwrap(), "");
        assert!(!local.exists());
        assert!(!remote.exists());
    }

    #[test]
    fn output_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("coverage.log");
        fs::write(&out, "0xdead\n").unwrap();

        merge_logs(
            &dir.path().join("local_coverage.log"),
            &dir.path().join("remote_coverage.log"),
            &out,
        )
        .unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap(), "");
    }

    #[test]
    fn unreadable_input_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        // A directory can't be read as a file.
        let local = dir.path().join("local_coverage.log");
        fs::create_dir(&local).unwrap();
        let remote = dir.path().join("remote_coverage.log");
        fs::write(&remote, "0x1\n0x2\n").unwrap();
        let out = dir.path().join("coverage.log");

        let summary = merge_logs(&local, &remote, &out).unwrap();
        assert_eq!(
            summary,
            MergeSummary {
                local_lines: 0,
                remote_lines: 2
            }
        );
        assert_eq!(fs::read_to_string(&out).unwrap(), "0x1\n0x2\n");
        assert!(local.exists());
        assert!(!remote.exists());
    }

    #[test]
    fn unwritable_output_fails() {
        let dir = tempfile::tempdir().unwrap();
        let remote = dir.path().join("remote_coverage.log");
        fs::write(&remote, "0x1\n").unwrap();

        let result = merge_logs(
            &dir.path().join("local_coverage.log"),
            &remote,
            &dir.path().join("missing").join("coverage.log"),
        );
        assert!(result.is_err());
        // Nothing was merged, so nothing is consumed.
        assert!(remote.exists());
    }
}
