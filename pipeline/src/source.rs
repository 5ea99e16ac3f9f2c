use bytes::Bytes;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// A capture device that hands out encoded JPEG stills on demand.
///
/// `pull` blocks until the next frame is ready; it is only ever called from a
/// blocking worker, never from async code. `Ok(None)` means the stream is
/// exhausted and the pipeline should shut down.
pub trait FrameSource: Send + 'static {
    fn pull(&mut self) -> Result<Option<Bytes>, SourceError>;
}

const MAX_CONSECUTIVE_FAILURES: u32 = 10;
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Polls a camera snapshot endpoint at a fixed rate.
pub struct HttpSource {
    url: String,
    agent: ureq::Agent,
    interval: Duration,
    failures: u32,
}

impl HttpSource {
    pub fn new(url: &str, resolution: &str, fps: f64) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(10))
            .build();
        Self {
            url: format!("{url}?resolution={resolution}"),
            agent,
            interval: Duration::from_secs_f64(1.0 / fps.max(0.01)),
            failures: 0,
        }
    }
}

impl FrameSource for HttpSource {
    fn pull(&mut self) -> Result<Option<Bytes>, SourceError> {
        loop {
            // Paces the pull rate; on failure, backs off harder each retry.
            let backoff = (self.interval * (self.failures + 1)).min(MAX_BACKOFF);
            std::thread::sleep(backoff);

            match self.agent.get(&self.url).call() {
                Ok(response) => {
                    let mut data = Vec::new();
                    response
                        .into_reader()
                        .read_to_end(&mut data)
                        .map_err(SourceError::Body)?;
                    self.failures = 0;
                    return Ok(Some(Bytes::from(data)));
                }
                Err(e) => {
                    self.failures += 1;
                    warn!(
                        error = %e,
                        failures = self.failures,
                        "camera snapshot request failed"
                    );
                    if self.failures >= MAX_CONSECUTIVE_FAILURES {
                        return Err(SourceError::CameraUnreachable(self.failures));
                    }
                }
            }
        }
    }
}

/// Replays `*.jpg` files from a directory in sorted order, then ends the
/// stream. Canned input for demos and tests.
pub struct DirSource {
    frames: std::vec::IntoIter<PathBuf>,
    interval: Duration,
}

impl DirSource {
    pub fn new(dir: &str, fps: f64) -> Result<Self, SourceError> {
        let entries =
            std::fs::read_dir(dir).map_err(|e| SourceError::Scan(dir.to_string(), e))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("jpg"))
            .collect();
        paths.sort();
        info!(count = paths.len(), dir, "replaying frames from directory");
        Ok(Self {
            frames: paths.into_iter(),
            interval: Duration::from_secs_f64(1.0 / fps.max(0.01)),
        })
    }
}

impl FrameSource for DirSource {
    fn pull(&mut self) -> Result<Option<Bytes>, SourceError> {
        let Some(path) = self.frames.next() else {
            return Ok(None);
        };
        std::thread::sleep(self.interval);
        let data = std::fs::read(&path)
            .map_err(|e| SourceError::ReadFrame(path.display().to_string(), e))?;
        Ok(Some(Bytes::from(data)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("camera endpoint unreachable after {0} attempts")]
    CameraUnreachable(u32),
    #[error("failed to read frame body: {0}")]
    Body(std::io::Error),
    #[error("failed to scan frame directory {0}: {1}")]
    Scan(String, std::io::Error),
    #[error("failed to read frame file {0}: {1}")]
    ReadFrame(String, std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_source_replays_sorted_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.jpg"), b"second").unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"first").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mut source = DirSource::new(dir.path().to_str().unwrap(), 1000.0).unwrap();
        assert_eq!(source.pull().unwrap().unwrap().as_ref(), b"first");
        assert_eq!(source.pull().unwrap().unwrap().as_ref(), b"second");
        assert!(source.pull().unwrap().is_none());
    }

    #[test]
    fn dir_source_missing_directory_is_an_error() {
        let result = DirSource::new("/nonexistent/frames", 5.0);
        assert!(matches!(result, Err(SourceError::Scan(_, _))));
    }
}
