//! The multipart receive state machine.
//!
//! One [`RecvFsm`] exists per in-flight upload request. Body chunks arrive
//! in arbitrary network-sized pieces; the machine appends them to its line
//! buffer and consumes as many complete CRLF lines as it can, separating
//! small form fields (kept in memory) from the file part (spooled to a
//! [`TempSink`]). The full body is never buffered.
//!
//! A line "contains the boundary" when the boundary string occurs anywhere
//! in it. That matches the `--boundary` delimiter, the terminal
//! `--boundary--`, and whitespace variants alike; the machine does not
//! distinguish the terminal delimiter, the transport's end-of-body does.
//!
//! The CRLF that precedes a boundary belongs to the delimiter, not to the
//! file payload. Writing of each payload line's trailing CRLF is therefore
//! deferred (`recved_crlf`) until the next line proves to be payload too;
//! the delimiter's CRLF is naturally dropped.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use memchr::memmem;
use tracing::{debug, warn};

use crate::error::RecvError;
use crate::http::line_buffer::LineBuffer;
use crate::http::multipart::{self, PartDisposition};
use crate::progress::{self, Progress};
use crate::repo::AccessInfo;
use crate::temp_sink::TempSink;

/// Upper bound on the length of a boundary line. When this many bytes
/// accumulate without a CRLF, the buffer is flushed to the sink as raw
/// payload; anything this long cannot be a delimiter.
pub(crate) const MAX_CONTENT_LINE: usize = 10240;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    Init,
    Headers,
    Content,
    Error,
}

/// Per-request receive state. Dropping the machine releases everything it
/// owns: the temp sink (closing and unlinking the file) and the progress
/// registry entry.
pub(crate) struct RecvFsm {
    state: RecvState,
    boundary: String,
    repo_id: String,
    user: String,
    temp_dir: PathBuf,
    line: LineBuffer,
    form_kvs: HashMap<String, String>,
    input_name: Option<String>,
    file_name: Option<String>,
    sink: Option<TempSink>,
    recved_crlf: bool,
    progress_id: String,
    progress: Arc<Progress>,
}

impl RecvFsm {
    /// Binds a new machine to a request. The caller has already inserted
    /// `progress` into the registry under `progress_id`; the entry is
    /// removed again when the machine drops.
    pub fn new(
        boundary: String,
        access: AccessInfo,
        temp_dir: PathBuf,
        progress_id: String,
        progress: Arc<Progress>,
    ) -> Self {
        Self {
            state: RecvState::Init,
            boundary,
            repo_id: access.repo_id,
            user: access.user,
            temp_dir,
            line: LineBuffer::new(),
            form_kvs: HashMap::new(),
            input_name: None,
            file_name: None,
            sink: None,
            recved_crlf: false,
            progress_id,
            progress,
        }
    }

    /// Consumes one body chunk. On error the machine enters its terminal
    /// state and ignores any further chunks.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), RecvError> {
        if self.state == RecvState::Error {
            return Ok(());
        }

        self.progress.add_uploaded(chunk.len() as i64);
        debug!(
            uploaded = self.progress.uploaded(),
            size = self.progress.size(),
            "upload progress"
        );

        self.line.append(chunk);
        let res = self.drive();
        if res.is_err() {
            self.state = RecvState::Error;
        }
        res
    }

    fn drive(&mut self) -> Result<(), RecvError> {
        loop {
            match self.state {
                RecvState::Init => {
                    let Some(line) = self.line.read_line() else {
                        return Ok(());
                    };
                    if !self.contains_boundary(&line) {
                        warn!("no boundary found in the first line");
                        return Err(RecvError::BadRequest("invalid multipart body"));
                    }
                    self.state = RecvState::Headers;
                }
                RecvState::Headers => {
                    let Some(line) = self.line.read_line() else {
                        return Ok(());
                    };
                    if line.is_empty() {
                        self.begin_content()?;
                    } else {
                        self.parse_header_line(&line)?;
                    }
                }
                RecvState::Content => {
                    let advanced = if self.input_name.as_deref() == Some("file") {
                        self.recv_file_data()?
                    } else {
                        self.recv_form_field()?
                    };
                    if !advanced {
                        return Ok(());
                    }
                }
                RecvState::Error => return Ok(()),
            }
        }
    }

    /// A part's header block ended; decide where its payload goes.
    fn begin_content(&mut self) -> Result<(), RecvError> {
        let Some(name) = self.input_name.as_deref() else {
            warn!("part headers carried no content disposition");
            return Err(RecvError::BadRequest("invalid multipart body"));
        };
        if name == "file" {
            let file_name = self.file_name.as_deref().unwrap_or_default();
            let sink = TempSink::open(&self.temp_dir, file_name).map_err(|err| {
                warn!("failed to open temp file: {err}");
                RecvError::Server(err)
            })?;
            // A repeated file part replaces the previous sink; dropping it
            // unlinks the earlier temp file. Last file wins.
            self.sink = Some(sink);
            self.recved_crlf = false;
        }
        debug!("start to recv part {name:?}");
        self.state = RecvState::Content;
        Ok(())
    }

    fn parse_header_line(&mut self, line: &Bytes) -> Result<(), RecvError> {
        let text = String::from_utf8_lossy(line);
        debug!("mime header line: {text}");
        match multipart::parse_part_header(&text) {
            Ok(Some(PartDisposition { name, filename })) => {
                if let Some(filename) = filename {
                    self.file_name = Some(filename);
                }
                self.input_name = Some(name);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                warn!("{err}");
                Err(RecvError::BadRequest("bad mime header"))
            }
        }
    }

    /// One line of a small form field. Returns false when no complete line
    /// is buffered yet.
    fn recv_form_field(&mut self) -> Result<bool, RecvError> {
        let Some(line) = self.line.read_line() else {
            return Ok(false);
        };
        if self.contains_boundary(&line) {
            debug!("form field ends");
            self.input_name = None;
            self.state = RecvState::Headers;
        } else if let Some(name) = self.input_name.clone() {
            let value = String::from_utf8_lossy(&line).into_owned();
            debug!("form field {name} = {value}");
            self.form_kvs.insert(name, value);
        }
        Ok(true)
    }

    /// One line attempt of the file part. Returns false when the machine
    /// needs more bytes.
    fn recv_file_data(&mut self) -> Result<bool, RecvError> {
        let Some(sink) = self.sink.as_mut() else {
            // Content state with input_name == "file" always has a sink;
            // reaching this is a framing violation.
            return Err(RecvError::BadRequest("file part without temp file"));
        };

        match self.line.read_line() {
            None => {
                // No complete line, but the buffer has grown past any
                // possible boundary line: flush it as raw payload. Long
                // CRLF-free runs (binary data) pass through here.
                if self.line.len() >= MAX_CONTENT_LINE {
                    debug!("flush {} bytes of file data", self.line.len());
                    if self.recved_crlf {
                        write_sink(sink, b"\r\n")?;
                    }
                    self.line.drain_to(sink).map_err(|err| {
                        warn!("failed to write temp file: {err}");
                        RecvError::Server(err)
                    })?;
                    self.recved_crlf = false;
                }
                Ok(false)
            }
            Some(line) if memmem::find(&line, self.boundary.as_bytes()).is_some() => {
                debug!("file part ends");
                self.input_name = None;
                self.state = RecvState::Headers;
                Ok(true)
            }
            Some(line) => {
                if self.recved_crlf {
                    write_sink(sink, b"\r\n")?;
                }
                write_sink(sink, &line)?;
                self.recved_crlf = true;
                Ok(true)
            }
        }
    }

    fn contains_boundary(&self, line: &[u8]) -> bool {
        memmem::find(line, self.boundary.as_bytes()).is_some()
    }

    pub fn repo_id(&self) -> &str {
        &self.repo_id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Value of a received form field. Repeated fields keep the last
    /// received value.
    pub fn form_value(&self, name: &str) -> Option<&str> {
        self.form_kvs.get(name).map(String::as_str)
    }

    /// The filename parameter of the file part, once its headers have been
    /// seen.
    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    /// The sink holding the file part's payload, if a file part began.
    pub fn sink(&self) -> Option<&TempSink> {
        self.sink.as_ref()
    }
}

impl Drop for RecvFsm {
    fn drop(&mut self) {
        progress::registry().remove(&self.progress_id);
    }
}

fn write_sink(sink: &mut TempSink, data: &[u8]) -> Result<(), RecvError> {
    sink.write_all(data).map_err(|err| {
        warn!("failed to write temp file: {err}");
        RecvError::Server(err)
    })
}
