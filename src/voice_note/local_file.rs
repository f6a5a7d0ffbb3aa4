use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// A recorded clip written to a temp file so it can be streamed locally.
/// The file is removed on `release` or drop, whichever comes first.
#[derive(Debug)]
pub struct LocalStream {
    path: PathBuf,
    released: AtomicBool,
}

impl LocalStream {
    pub fn create(dir: &Path, data: &[u8], extension: &str) -> Result<Self, String> {
        std::fs::create_dir_all(dir).map_err(|e| format!("Failed to create {}: {}", dir.display(), e))?;
        let name = format!(
            "voice-note-{}-{:016x}.{}",
            chrono::Utc::now().timestamp_millis(),
            rand::thread_rng().gen::<u64>(),
            extension
        );
        let path = dir.join(name);
        std::fs::write(&path, data).map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
        log::debug!("[voice-note] wrote local clip {}", path.display());
        Ok(Self {
            path,
            released: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the file. Returns whether this call did the removal.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("[voice-note] failed to remove {}: {}", self.path.display(), e);
        }
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Drop for LocalStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// File extension for a recorder mime type.
pub fn extension_for(mime: &str) -> &'static str {
    match mime.split(';').next().unwrap_or("").trim() {
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        "audio/mp4" | "audio/m4a" => "m4a",
        "audio/webm" => "webm",
        "audio/ogg" => "ogg",
        _ => "bin",
    }
}
