//! File tailing.

use std::io::SeekFrom;
use std::path::PathBuf;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Tracks read offsets over the build's output files and yields appended
/// bytes. The files may not exist yet when tailing starts.
pub struct Tailer {
    files: Vec<(PathBuf, u64)>,
}

impl Tailer {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Tailer {
            files: paths.into_iter().map(|p| (p, 0)).collect(),
        }
    }

    /// Read everything appended since the last call, in file order.
    pub async fn drain(&mut self) -> std::io::Result<Option<Bytes>> {
        let mut out = Vec::new();
        for (path, offset) in &mut self.files {
            let Ok(metadata) = tokio::fs::metadata(&path).await else {
                continue;
            };
            if metadata.len() <= *offset {
                continue;
            }

            let mut file = File::open(&path).await?;
            file.seek(SeekFrom::Start(*offset)).await?;
            let read = file.read_to_end(&mut out).await?;
            *offset += read as u64;
        }

        if out.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Bytes::from(out)))
        }
    }
}
