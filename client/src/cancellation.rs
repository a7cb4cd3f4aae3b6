//! Out-of-band request cancellation.
//!
//! The worker cannot read a cancel message while it is busy computing a
//! reply, so cancellation uses a side channel it polls instead: a directory
//! of marker files. Starting the worker with
//! `--cancellationPipeName <dir>/seq_*` makes it treat the existence of
//! `<dir>/seq_N` as "abandon request N".

use std::path::PathBuf;

use tsbridge_types::RequestSeq;

const MARKER_PREFIX: &str = "seq_";

/// Signals the worker that a request should be abandoned.
///
/// Best effort: the caller has already stopped waiting by the time this
/// runs, so the return value only reports whether a signal was sent.
pub trait RequestCanceller: Send + Sync {
    fn try_cancel(&self, seq: RequestSeq) -> bool;
}

/// Used when cancellation is disabled in the configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCanceller;

impl RequestCanceller for NoopCanceller {
    fn try_cancel(&self, _seq: RequestSeq) -> bool {
        false
    }
}

/// File-marker canceller for one worker instance.
///
/// Owns its temp directory; the directory and all markers are removed when
/// the canceller is dropped with the instance.
#[derive(Debug)]
pub struct PipeCanceller {
    dir: tempfile::TempDir,
}

impl PipeCanceller {
    pub fn new() -> std::io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("tscancellation-")
            .tempdir()?;
        Ok(Self { dir })
    }

    /// Value for the worker's `--cancellationPipeName` flag.
    pub fn pipe_name_arg(&self) -> String {
        format!("{}*", self.dir.path().join(MARKER_PREFIX).display())
    }

    fn marker_path(&self, seq: RequestSeq) -> PathBuf {
        self.dir.path().join(format!("{MARKER_PREFIX}{seq}"))
    }
}

impl RequestCanceller for PipeCanceller {
    fn try_cancel(&self, seq: RequestSeq) -> bool {
        let path = self.marker_path(seq);
        match std::fs::write(&path, b"") {
            Ok(()) => {
                tracing::trace!(%seq, path = %path.display(), "wrote cancellation marker");
                true
            }
            Err(e) => {
                tracing::debug!(%seq, "could not write cancellation marker: {e}");
                false
            }
        }
    }
}
