//! The agent's on-disk surface for the workflow tooling: a single-message
//! status file, an append-only annotation log and the post-step done marker.

use std::fs;
use std::io::Write as _;
use std::path::PathBuf;

use parking_lot::Mutex;

pub const STATUS_FILE_NAME: &str = "agent.status";
pub const ANNOTATION_FILE_NAME: &str = "annotation.log";
pub const DONE_FILE_NAME: &str = "done.json";

/// Writes the status and done-marker files in the state directory.
///
/// Both writes are deliberately infallible from the caller's point of view;
/// an unwritable state directory must not take the enforcement path down.
#[derive(Debug, Clone)]
pub struct StatusFiles {
    dir: PathBuf,
}

impl StatusFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Replaces the status file with `message`.
    pub fn write_status(&self, message: &str) {
        let path = self.dir.join(STATUS_FILE_NAME);
        if let Err(e) = fs::write(&path, message) {
            tracing::warn!(path = %path.display(), "Failed to write status: {e}");
        }
    }

    /// Creates the done marker; its existence signals post-step completion.
    pub fn write_done(&self) {
        let path = self.dir.join(DONE_FILE_NAME);
        if let Err(e) = fs::write(&path, "{}") {
            tracing::warn!(path = %path.display(), "Failed to write done marker: {e}");
        }
    }
}

/// Append-only writer for user-visible findings.
///
/// A mutex serialises appends so concurrent writers cannot interleave lines.
/// With `redact_domains`, destination names are withheld from the log (the
/// repository is private); the telemetry service applies its own controls.
pub struct AnnotationWriter {
    path: PathBuf,
    lock: Mutex<()>,
    redact_domains: bool,
}

impl AnnotationWriter {
    pub fn new(dir: impl Into<PathBuf>, redact_domains: bool) -> Self {
        Self {
            path: dir.into().join(ANNOTATION_FILE_NAME),
            lock: Mutex::new(()),
            redact_domains,
        }
    }

    pub fn write(&self, message: &str) {
        let _guard = self.lock.lock();

        let result = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{message}"));

        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), "Failed to write annotation: {e}");
        }
    }

    /// How a destination name may appear in annotations.
    pub fn printable_domain<'a>(&self, domain: &'a str) -> &'a str {
        if self.redact_domains {
            "(redacted)"
        } else {
            domain
        }
    }
}
