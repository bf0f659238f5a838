//! Jobs that read a local file line by line.

use async_stream::try_stream;
use async_trait::async_trait;
use futures_core::Stream;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncSeekExt, BufReader};

use krusty_shared::gcode_utils::{self, AxisOffsets, PositioningMode};
use krusty_shared::{JobState, JobVariant, PrintJobError, Protocol};

use super::listener::JobEvent;
use super::{ContentStream, JobCore, PrintJob, ensure_can_process, lock};

const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Latin1,
}

impl TextEncoding {
    pub fn from_label(label: &str) -> Result<Self, PrintJobError> {
        match label.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(TextEncoding::Utf8),
            "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1" => Ok(TextEncoding::Latin1),
            _ => Err(PrintJobError::UnsupportedEncoding(label.to_string())),
        }
    }

    /// Undecodable bytes become U+FFFD instead of failing the read.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            TextEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }
}

/// Per-variant hook applied to every line read from the file. Returning
/// `None` or an empty string skips the line.
pub trait LineProcessor: Send + Sync + 'static {
    fn variant(&self) -> JobVariant;

    fn can_process(&self, protocol: &dyn Protocol) -> bool {
        protocol.supports_job(self.variant())
    }

    fn process_line(&self, line: String) -> Option<String>;
}

/// Lines are handed out exactly as read, terminator included.
#[derive(Debug, Default)]
pub struct PlainLines;

impl LineProcessor for PlainLines {
    fn variant(&self) -> JobVariant {
        JobVariant::LocalFile
    }

    fn process_line(&self, line: String) -> Option<String> {
        Some(line)
    }
}

/// G-code as the host sends it: comments and blank lines dropped, moves
/// shifted by the configured offsets while in absolute positioning.
#[derive(Debug, Default)]
pub struct GcodeLines {
    offsets: AxisOffsets,
    relative: AtomicBool,
}

impl GcodeLines {
    pub fn new(offsets: AxisOffsets) -> Self {
        Self {
            offsets,
            relative: AtomicBool::new(false),
        }
    }
}

impl LineProcessor for GcodeLines {
    fn variant(&self) -> JobVariant {
        JobVariant::LocalGcodeFile
    }

    fn process_line(&self, line: String) -> Option<String> {
        let stripped = gcode_utils::strip_comment(&line).trim();
        if stripped.is_empty() {
            return None;
        }
        if let Some(mode) = gcode_utils::positioning_mode_change(stripped) {
            self.relative.store(mode == PositioningMode::Relative, Ordering::Relaxed);
        }
        if !self.offsets.is_zero()
            && !self.relative.load(Ordering::Relaxed)
            && gcode_utils::is_move(stripped)
        {
            return Some(gcode_utils::apply_offsets(stripped, &self.offsets));
        }
        Some(stripped.to_string())
    }
}

/// Verbatim content for a protocol that writes the file onto the device.
#[derive(Debug, Default)]
pub struct RawLines;

impl LineProcessor for RawLines {
    fn variant(&self) -> JobVariant {
        JobVariant::LocalGcodeStream
    }

    fn can_process(&self, protocol: &dyn Protocol) -> bool {
        protocol.supports_job(self.variant()) && protocol.supports_streaming()
    }

    fn process_line(&self, line: String) -> Option<String> {
        Some(line)
    }
}

#[derive(Debug, Default)]
struct Cursor {
    open: bool,
    offset: u64,
}

pub struct LocalFileJob<K: LineProcessor> {
    core: JobCore,
    path: PathBuf,
    encoding: TextEncoding,
    // Captured once at construction, not re-read when processing starts.
    size: u64,
    kind: K,
    reader: tokio::sync::Mutex<Option<BufReader<File>>>,
    cursor: Mutex<Cursor>,
}

pub type LocalPlainFileJob = LocalFileJob<PlainLines>;
pub type LocalGcodeFileJob = LocalFileJob<GcodeLines>;
pub type LocalGcodeStreamJob = LocalFileJob<RawLines>;

impl<K: LineProcessor> std::fmt::Debug for LocalFileJob<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFileJob")
            .field("core", &self.core)
            .field("path", &self.path)
            .field("encoding", &self.encoding)
            .field("size", &self.size)
            .field("variant", &self.kind.variant())
            .finish()
    }
}

impl<K: LineProcessor> LocalFileJob<K> {
    pub async fn new(
        path: impl Into<PathBuf>,
        encoding: TextEncoding,
        kind: K,
    ) -> Result<Self, PrintJobError> {
        let path = path.into();
        let size = tokio::fs::metadata(&path).await?.len();
        tracing::debug!("Local file job for {} ({} bytes)", path.display(), size);
        Ok(Self {
            core: JobCore::new(),
            path,
            encoding,
            size,
            kind,
            reader: tokio::sync::Mutex::new(None),
            cursor: Mutex::new(Cursor::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    pub fn is_open(&self) -> bool {
        lock(&self.cursor).open
    }

    /// Release the file. Safe to call any number of times.
    pub async fn close(&self) {
        let mut slot = self.reader.lock().await;
        self.release(&mut slot);
    }

    fn release(&self, slot: &mut Option<BufReader<File>>) {
        if slot.take().is_some() {
            tracing::debug!("Closed {}", self.path.display());
        }
        *lock(&self.cursor) = Cursor::default();
    }

    async fn open_at(&self, position: u64) -> std::io::Result<(BufReader<File>, u64)> {
        let mut file = File::open(&self.path).await?;
        if position > 0 {
            file.seek(SeekFrom::Start(position)).await?;
            return Ok((BufReader::new(file), position));
        }
        let mut reader = BufReader::new(file);
        let offset = match self.encoding {
            TextEncoding::Utf8 => skip_bom(&mut reader).await?,
            TextEncoding::Latin1 => 0,
        };
        Ok((reader, offset))
    }
}

async fn skip_bom<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<u64> {
    let has_bom = reader.fill_buf().await?.starts_with(&UTF8_BOM);
    if has_bom {
        reader.consume(UTF8_BOM.len());
        Ok(UTF8_BOM.len() as u64)
    } else {
        Ok(0)
    }
}

fn read_lines(
    path: PathBuf,
    encoding: TextEncoding,
) -> impl Stream<Item = Result<String, PrintJobError>> + Send {
    try_stream! {
        let file = File::open(&path).await.map_err(PrintJobError::from)?;
        let mut reader = BufReader::new(file);
        if encoding == TextEncoding::Utf8 {
            skip_bom(&mut reader).await.map_err(PrintJobError::from)?;
        }
        loop {
            let mut buf = Vec::new();
            let read = reader.read_until(b'\n', &mut buf).await.map_err(PrintJobError::from)?;
            if read == 0 {
                break;
            }
            yield encoding.decode(&buf);
        }
    }
}

#[async_trait]
impl<K: LineProcessor> PrintJob for LocalFileJob<K> {
    fn core(&self) -> &JobCore {
        &self.core
    }

    fn variant(&self) -> Option<JobVariant> {
        Some(self.kind.variant())
    }

    fn can_process(&self, protocol: &dyn Protocol) -> bool {
        self.kind.can_process(protocol)
    }

    async fn process(
        &self,
        protocol: Arc<dyn Protocol>,
        position: u64,
    ) -> Result<(), PrintJobError> {
        ensure_can_process(self, protocol.as_ref())?;
        if position > self.size {
            return Err(PrintJobError::InvalidPosition { position, size: self.size });
        }
        self.core.begin(protocol)?;

        let mut slot = self.reader.lock().await;
        match self.open_at(position).await {
            // cancelled or failed while the file was opening; `close` already ran
            Ok(_) if !self.core.state().is_processing() => {
                tracing::debug!(
                    "Job {} stopped before {} was open",
                    self.core.id(),
                    self.path.display()
                );
                return Ok(());
            }
            Ok((reader, offset)) => {
                *slot = Some(reader);
                *lock(&self.cursor) = Cursor { open: true, offset };
            }
            Err(e) => {
                drop(slot);
                tracing::error!("Failed to open {}: {}", self.path.display(), e);
                self.core.conclude(self, JobState::Failed(e.to_string()));
                return Err(e.into());
            }
        }
        drop(slot);

        tracing::info!(
            "Reading {} from byte {} of {}",
            self.path.display(),
            position,
            self.size
        );
        if self.core.state().is_processing() {
            self.core.notify(JobEvent::Started, self);
        }
        Ok(())
    }

    async fn cancel(&self) {
        let cancelled = self.core.finish(JobState::Cancelled);
        self.close().await;
        if cancelled {
            self.core.notify(JobEvent::Cancelled, self);
        }
    }

    async fn fail(&self, reason: &str) {
        let failed = self.core.finish(JobState::Failed(reason.to_string()));
        self.close().await;
        if failed {
            self.core.notify(JobEvent::Failed, self);
        }
    }

    async fn get_next(&self) -> Result<Option<String>, PrintJobError> {
        let mut slot = self.reader.lock().await;
        loop {
            let state = self.core.state();
            let reader = match slot.as_mut() {
                Some(reader) if state.is_processing() => reader,
                _ if state == JobState::Done => return Ok(None),
                _ => {
                    return Err(PrintJobError::InvalidTransition(format!(
                        "file {} is not open for reading (job is {:?})",
                        self.path.display(),
                        state
                    )));
                }
            };

            let mut buf = Vec::new();
            let read = match reader.read_until(b'\n', &mut buf).await {
                Ok(read) => read,
                Err(e) => {
                    self.release(&mut slot);
                    drop(slot);
                    tracing::error!("Error while reading {}: {}", self.path.display(), e);
                    return Err(e.into());
                }
            };

            if read == 0 {
                self.release(&mut slot);
                drop(slot);
                tracing::debug!("Reached end of {}", self.path.display());
                self.core.conclude(self, JobState::Done);
                return Ok(None);
            }

            lock(&self.cursor).offset += read as u64;
            match self.kind.process_line(self.encoding.decode(&buf)) {
                Some(line) if !line.is_empty() => return Ok(Some(line)),
                _ => continue,
            }
        }
    }

    fn progress(&self) -> Option<f64> {
        let cursor = lock(&self.cursor);
        if !cursor.open || self.size == 0 {
            return Some(0.0);
        }
        Some((cursor.offset as f64 / self.size as f64).min(1.0))
    }

    fn can_get_content(&self) -> bool {
        true
    }

    fn content_stream(&self) -> Option<ContentStream> {
        Some(Box::pin(read_lines(self.path.clone(), self.encoding)))
    }
}
