use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

use crate::error::AppError;

/// Prefix under which stored recordings are served.
pub const DOWNLOAD_PREFIX: &str = "/api/downloads/";

/// Directory of uploaded call recordings, one `<callId>.wav` per call.
#[derive(Debug, Clone)]
pub struct RecordingStore {
    dir: PathBuf,
    max_bytes: usize,
}

impl RecordingStore {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name a call's recording is stored under.
    pub fn file_name(call_id: &str) -> Result<String, AppError> {
        if call_id.is_empty() {
            return Err(AppError::ValidationError("Missing callId".to_string()));
        }
        let file_name = format!("{}.wav", call_id);
        check_file_name(&file_name)?;
        Ok(file_name)
    }

    pub fn download_url(file_name: &str) -> String {
        format!("{}{}", DOWNLOAD_PREFIX, file_name)
    }

    /// Path of a stored recording. Names that could leave the directory are refused.
    pub fn resolve(&self, file_name: &str) -> Result<PathBuf, AppError> {
        check_file_name(file_name)?;
        Ok(self.dir.join(file_name))
    }

    /// Open a fresh scratch file in the recording directory.
    pub async fn stage(&self) -> Result<StagedRecording, AppError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!(".upload-{}.part", Uuid::new_v4()));
        let file = fs::File::create(&path).await?;
        Ok(StagedRecording {
            path,
            file: Some(file),
            written: 0,
            limit: self.max_bytes,
            kept: false,
        })
    }
}

fn check_file_name(file_name: &str) -> Result<(), AppError> {
    if file_name.is_empty()
        || file_name.contains("..")
        || file_name.contains('/')
        || file_name.contains('\\')
        || file_name.starts_with('.')
    {
        return Err(AppError::ValidationError(format!("Invalid file name {:?}", file_name)));
    }
    Ok(())
}

/// Upload being written to a scratch file.
///
/// Removed on drop unless [`StagedRecording::persist`] moved it into place.
#[derive(Debug)]
pub struct StagedRecording {
    path: PathBuf,
    file: Option<fs::File>,
    written: usize,
    limit: usize,
    kept: bool,
}

impl StagedRecording {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), AppError> {
        if self.written + chunk.len() > self.limit {
            return Err(AppError::PayloadTooLarge(self.limit));
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| AppError::InternalError("Staged recording already closed".to_string()))?;
        file.write_all(chunk).await?;
        self.written += chunk.len();
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// Flush and move the upload to `dest`.
    pub async fn persist(mut self, dest: &Path) -> Result<usize, AppError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        fs::rename(&self.path, dest).await?;
        self.kept = true;
        Ok(self.written)
    }
}

impl Drop for StagedRecording {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        drop(self.file.take());
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "Failed to remove staged upload: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_from_call_id() {
        assert_eq!(RecordingStore::file_name("call-42").unwrap(), "call-42.wav");
        assert_eq!(
            RecordingStore::download_url("call-42.wav"),
            "/api/downloads/call-42.wav"
        );
    }

    #[test]
    fn test_unsafe_names_refused() {
        let store = RecordingStore::new("/srv/recordings", 1024);
        for name in ["", "../etc/passwd", "a/b.wav", "a\\b.wav", "..", ".upload-x.part"] {
            assert!(
                matches!(store.resolve(name), Err(AppError::ValidationError(_))),
                "{:?} must be refused",
                name
            );
        }
        assert!(matches!(RecordingStore::file_name(""), Err(AppError::ValidationError(_))));
        assert!(matches!(RecordingStore::file_name("../x"), Err(AppError::ValidationError(_))));
        assert_eq!(
            store.resolve("call-1.wav").unwrap(),
            PathBuf::from("/srv/recordings/call-1.wav")
        );
    }

    #[tokio::test]
    async fn test_staged_upload_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordingStore::new(dir.path().join("uploads"), 1024);

        let mut staged = store.stage().await.unwrap();
        staged.write_chunk(b"RIFF").await.unwrap();
        staged.write_chunk(b"WAVE").await.unwrap();
        assert!(!staged.is_empty());

        let dest = store.resolve("call-1.wav").unwrap();
        assert_eq!(staged.persist(&dest).await.unwrap(), 8);
        assert_eq!(std::fs::read(&dest).unwrap(), b"RIFFWAVE");

        let leftovers: Vec<_> = std::fs::read_dir(store.dir()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_upload_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordingStore::new(dir.path(), 1024);

        let mut staged = store.stage().await.unwrap();
        staged.write_chunk(b"partial").await.unwrap();
        drop(staged);

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_upload_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordingStore::new(dir.path(), 4);

        let mut staged = store.stage().await.unwrap();
        staged.write_chunk(b"1234").await.unwrap();
        let err = staged.write_chunk(b"5").await.unwrap_err();
        assert!(matches!(err, AppError::PayloadTooLarge(4)));
        assert!(!staged.is_empty());
    }
}
