//! Temp-file sink for the streamed file part.
//!
//! Each in-flight upload owns at most one [`TempSink`]. The sink creates a
//! uniquely named file under the configured scratch directory and removes
//! it again when dropped, whatever the outcome of the request.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::warn;

/// Creates the scratch directory if it does not exist yet. Called once at
/// service build time.
pub fn init_temp_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o777))?;
    }
    Ok(())
}

/// An exclusively owned temp file receiving the file part's payload.
///
/// Dropping the sink closes the descriptor and unlinks the path; failures
/// during cleanup are logged, never propagated.
#[derive(Debug)]
pub struct TempSink {
    // `Some` until dropped; `Option` only so `Drop` can take the file out.
    file: Option<NamedTempFile>,
}

impl TempSink {
    /// Creates `<dir>/<prefix>XXXXXX` with a random suffix and mode 0600.
    pub fn open(dir: &Path, prefix: &str) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix).rand_bytes(6);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            builder.permissions(fs::Permissions::from_mode(0o600));
        }
        let file = builder.tempfile_in(dir)?;
        Ok(Self { file: Some(file) })
    }

    /// Writes every byte of `data`, looping over short writes.
    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.file_mut().write_all(data)
    }

    /// Absolute path of the temp file.
    pub fn path(&self) -> &Path {
        self.file().path()
    }

    /// Current on-disk size.
    pub fn size(&self) -> io::Result<u64> {
        self.file().as_file().metadata().map(|m| m.len())
    }

    fn file(&self) -> &NamedTempFile {
        // The option is only vacated by `drop`.
        self.file.as_ref().expect("temp sink already closed")
    }

    fn file_mut(&mut self) -> &mut NamedTempFile {
        self.file.as_mut().expect("temp sink already closed")
    }
}

impl Write for TempSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file_mut().flush()
    }
}

impl Drop for TempSink {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let path = file.path().to_owned();
            if let Err(err) = file.close() {
                warn!("failed to remove temp file {}: {err}", path.display());
            }
        }
    }
}
