//! On-disk archive format.
//!
//! ```text
//! u32 BE version (1)
//! gzip stream of records:
//!     u16 BE name length | name (decimal sequence number) | u64 BE payload length | payload
//! ```
//!
//! Each payload is one JSON-encoded [`Exchange`]. The writer flushes the compressor and syncs the
//! file after every record, so records written before a crash can still be read back even
//! though the gzip trailer is missing.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufReader, Read, Write},
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use flate2::{Compression, read::GzDecoder, write::GzEncoder};

use crate::{
    error::{DvrFailure, FailureKind},
    exchange::Exchange,
};

pub const ARCHIVE_VERSION: u32 = 1;

const MAX_RECORD_NAME_LEN: usize = 32;
// Bounds the up-front allocation for a payload whose length field may be corrupt.
const PAYLOAD_PREALLOCATION_LIMIT: u64 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRecord {
    pub sequence: u64,
    pub exchange: Exchange,
}

pub fn encode_exchange(exchange: &Exchange) -> Result<Vec<u8>, DvrFailure> {
    serde_json::to_vec(exchange)
        .context("encode exchange")
        .map_err(|err| DvrFailure::new(FailureKind::Codec, err))
}

pub fn decode_exchange(payload: &[u8]) -> Result<Exchange, DvrFailure> {
    serde_json::from_slice(payload)
        .context("decode exchange")
        .map_err(|err| DvrFailure::new(FailureKind::Codec, err))
}

/// Append-only archive writer.
///
/// Dropping the writer finalizes the compressed stream, the same as [`ArchiveWriter::finish`].
/// A failed append poisons the writer: the file is cut back to the last durable record and every
/// later call fails.
pub struct ArchiveWriter {
    path: PathBuf,
    encoder: Option<GzEncoder<ArchiveFile>>,
    next_sequence: u64,
    // File length after the last record that was flushed and synced.
    durable_len: u64,
    poisoned: Option<String>,
}

impl ArchiveWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, DvrFailure> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create archive dir {}", parent.display()))
                .map_err(|err| DvrFailure::new(FailureKind::Setup, err))?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("open archive {} for writing", path.display()))
            .map_err(|err| DvrFailure::new(FailureKind::Setup, err))?;
        let version = ARCHIVE_VERSION.to_be_bytes();
        file.write_all(&version)
            .with_context(|| format!("write archive version to {}", path.display()))
            .map_err(|err| DvrFailure::new(FailureKind::Setup, err))?;

        let sink = ArchiveFile::new(file, version.len() as u64);
        Ok(Self {
            path,
            durable_len: sink.written,
            encoder: Some(GzEncoder::new(sink, Compression::best())),
            next_sequence: 0,
            poisoned: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records_written(&self) -> u64 {
        self.next_sequence
    }

    pub fn append_exchange(&mut self, exchange: &Exchange) -> Result<u64, DvrFailure> {
        let payload = encode_exchange(exchange)?;
        self.append(&payload)
    }

    /// Appends one encoded exchange and makes it durable. Returns its sequence number.
    pub fn append(&mut self, payload: &[u8]) -> Result<u64, DvrFailure> {
        self.check_usable()?;
        let sequence = self.next_sequence;
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(DvrFailure::new(
                FailureKind::Io,
                anyhow::anyhow!("archive {} is already finished", self.path.display()),
            ));
        };

        let written = write_record(encoder, &sequence.to_string(), payload)
            .and_then(|()| encoder.flush())
            .and_then(|()| encoder.get_ref().file.sync_data());
        if let Err(err) = written {
            self.poison(&err);
            return Err(DvrFailure::new(
                FailureKind::Io,
                anyhow::Error::new(err)
                    .context(format!("append record {sequence} to {}", self.path.display())),
            ));
        }

        self.durable_len = encoder.get_ref().written;
        self.next_sequence += 1;
        Ok(sequence)
    }

    pub fn finish(&mut self) -> Result<(), DvrFailure> {
        self.check_usable()?;
        let Some(encoder) = self.encoder.take() else {
            return Ok(());
        };
        encoder
            .finish()
            .and_then(|sink| sink.file.sync_all())
            .with_context(|| format!("finalize archive {}", self.path.display()))
            .map_err(|err| DvrFailure::new(FailureKind::Io, err))?;

        tracing::info!(
            path = %self.path.display(),
            records = self.next_sequence,
            "archive finalized"
        );
        Ok(())
    }

    fn check_usable(&self) -> Result<(), DvrFailure> {
        match &self.poisoned {
            Some(reason) => Err(DvrFailure::new(
                FailureKind::Io,
                anyhow::anyhow!(
                    "archive {} is unusable after a failed append: {reason}",
                    self.path.display()
                ),
            )),
            None => Ok(()),
        }
    }

    // Partial compressed output of the failed record is cut off so the file ends on the last
    // durable record boundary. The encoder keeps whatever it buffered, so its sink refuses all
    // further writes, including the trailer its own drop would emit.
    fn poison(&mut self, err: &io::Error) {
        self.poisoned = Some(err.to_string());
        let Some(encoder) = self.encoder.as_mut() else {
            return;
        };
        let sink = encoder.get_mut();
        sink.poisoned = true;
        if let Err(truncate_err) = sink
            .file
            .set_len(self.durable_len)
            .and_then(|()| sink.file.sync_all())
        {
            tracing::warn!(
                path = %self.path.display(),
                "failed to cut archive back to its last record: {truncate_err}"
            );
        }
        tracing::error!(
            path = %self.path.display(),
            records = self.next_sequence,
            "archive append failed; writer disabled: {err}"
        );
    }
}

impl Drop for ArchiveWriter {
    fn drop(&mut self) {
        if self.poisoned.is_some() {
            return;
        }
        if let Err(err) = self.finish() {
            tracing::warn!("failed to finalize archive on drop: {err}");
        }
    }
}

impl std::fmt::Debug for ArchiveWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveWriter")
            .field("path", &self.path)
            .field("next_sequence", &self.next_sequence)
            .field("finished", &self.encoder.is_none())
            .field("poisoned", &self.poisoned.is_some())
            .finish()
    }
}

struct ArchiveFile {
    file: File,
    written: u64,
    poisoned: bool,
    #[cfg(test)]
    size_limit: Option<u64>,
}

impl ArchiveFile {
    fn new(file: File, written: u64) -> Self {
        Self {
            file,
            written,
            poisoned: false,
            #[cfg(test)]
            size_limit: None,
        }
    }
}

impl Write for ArchiveFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.poisoned {
            return Err(io::Error::other("archive writer is disabled"));
        }
        #[cfg(test)]
        let buf = match self.size_limit {
            Some(limit) if self.written >= limit => {
                return Err(io::Error::new(io::ErrorKind::StorageFull, "file size limit reached"));
            }
            Some(limit) => {
                let room = usize::try_from(limit - self.written).unwrap_or(usize::MAX);
                &buf[..buf.len().min(room)]
            }
            None => buf,
        };
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("archive writer is disabled"));
        }
        self.file.flush()
    }
}

pub fn write_archive<W: Write>(writer: W, exchanges: &[Exchange]) -> Result<(), DvrFailure> {
    let mut writer = writer;
    writer
        .write_all(&ARCHIVE_VERSION.to_be_bytes())
        .context("write archive version")
        .map_err(|err| DvrFailure::new(FailureKind::Io, err))?;

    let mut encoder = GzEncoder::new(writer, Compression::best());
    for (sequence, exchange) in exchanges.iter().enumerate() {
        let payload = encode_exchange(exchange)?;
        write_record(&mut encoder, &sequence.to_string(), &payload)
            .with_context(|| format!("write record {sequence}"))
            .map_err(|err| DvrFailure::new(FailureKind::Io, err))?;
    }
    encoder
        .finish()
        .and_then(|mut writer| writer.flush())
        .context("finish archive stream")
        .map_err(|err| DvrFailure::new(FailureKind::Io, err))?;
    Ok(())
}

pub fn read_archive(path: impl AsRef<Path>) -> Result<Vec<ArchiveRecord>, DvrFailure> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("open archive {}", path.display()))
        .map_err(|err| DvrFailure::new(FailureKind::Setup, err))?;
    decode_archive(BufReader::new(file)).map_err(|failure| {
        let kind = failure.kind();
        DvrFailure::new(
            kind,
            anyhow::Error::msg(failure.to_string()).context(format!("read archive {}", path.display())),
        )
    })
}

pub fn decode_archive<R: Read>(reader: R) -> Result<Vec<ArchiveRecord>, DvrFailure> {
    let mut reader = reader;
    let mut version = [0u8; 4];
    reader
        .read_exact(&mut version)
        .context("read archive version")
        .map_err(|err| DvrFailure::new(FailureKind::Codec, err))?;
    let version = u32::from_be_bytes(version);
    if version != ARCHIVE_VERSION {
        return Err(DvrFailure::new(
            FailureKind::UnsupportedVersion,
            anyhow::anyhow!(
                "unsupported archive version {version} (expected {ARCHIVE_VERSION})"
            ),
        ));
    }

    let mut decoder = GzDecoder::new(reader);
    let mut records = Vec::new();
    let mut previous: Option<u64> = None;

    loop {
        let name_len = match read_frame_start(&mut decoder)
            .with_context(|| format!("read header of record #{}", records.len()))
            .map_err(|err| DvrFailure::new(FailureKind::Codec, err))?
        {
            FrameStart::Record(len) => len,
            FrameStart::End => break,
            FrameStart::Unfinalized => {
                tracing::warn!(
                    records = records.len(),
                    "archive stream was not finalized; using the records written before it ended"
                );
                break;
            }
        };

        let record = read_record_body(&mut decoder, name_len)
            .with_context(|| format!("read record #{}", records.len()))
            .map_err(|err| DvrFailure::new(FailureKind::Codec, err))?;

        let sequence: u64 = record
            .name
            .parse()
            .with_context(|| format!("record name `{}` is not a sequence number", record.name))
            .map_err(|err| DvrFailure::new(FailureKind::Codec, err))?;
        if let Some(previous) = previous
            && sequence <= previous
        {
            return Err(DvrFailure::new(
                FailureKind::Codec,
                anyhow::anyhow!("record {sequence} follows record {previous}; sequence must increase"),
            ));
        }
        previous = Some(sequence);

        let exchange = decode_exchange(&record.payload).map_err(|failure| {
            DvrFailure::new(
                FailureKind::Codec,
                anyhow::Error::msg(failure.to_string()).context(format!("record {sequence}")),
            )
        })?;
        records.push(ArchiveRecord { sequence, exchange });
    }

    Ok(records)
}

fn write_record<W: Write>(writer: &mut W, name: &str, payload: &[u8]) -> io::Result<()> {
    let name_len = u16::try_from(name.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record name too long"))?;
    writer.write_all(&name_len.to_be_bytes())?;
    writer.write_all(name.as_bytes())?;
    writer.write_all(&(payload.len() as u64).to_be_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

enum FrameStart {
    Record(u16),
    End,
    Unfinalized,
}

fn read_frame_start<R: Read>(reader: &mut R) -> io::Result<FrameStart> {
    let mut buf = [0u8; 2];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(FrameStart::End),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof && filled == 0 => {
                return Ok(FrameStart::Unfinalized);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(FrameStart::Record(u16::from_be_bytes(buf)))
}

struct RawRecord {
    name: String,
    payload: Vec<u8>,
}

fn read_record_body<R: Read>(reader: &mut R, name_len: u16) -> anyhow::Result<RawRecord> {
    let name_len = usize::from(name_len);
    if name_len == 0 || name_len > MAX_RECORD_NAME_LEN {
        anyhow::bail!("record name length {name_len} out of range");
    }
    let mut name = vec![0u8; name_len];
    reader.read_exact(&mut name).context("read record name")?;
    let name = String::from_utf8(name).context("record name is not UTF-8")?;

    let mut payload_len = [0u8; 8];
    reader
        .read_exact(&mut payload_len)
        .context("read payload length")?;
    let payload_len = u64::from_be_bytes(payload_len);

    let capacity = usize::try_from(payload_len.min(PAYLOAD_PREALLOCATION_LIMIT)).unwrap_or(0);
    let mut payload = Vec::with_capacity(capacity);
    reader
        .by_ref()
        .take(payload_len)
        .read_to_end(&mut payload)
        .context("read payload")?;
    if payload.len() as u64 != payload_len {
        anyhow::bail!(
            "payload truncated: expected {payload_len} bytes, found {}",
            payload.len()
        );
    }

    Ok(RawRecord { name, payload })
}
