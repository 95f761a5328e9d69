use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

const MAGIC: &[u8; 8] = b"ROOSTWAL";
const VERSION: u32 = 1;
const HEADER_LEN: u64 = 12;
/// Anything larger is treated as a corrupt length prefix.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

fn write_header(writer: &mut impl Write) -> io::Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_all(&VERSION.to_le_bytes())
}

/// `[u32 len][bincode payload][u32 crc32(payload)]`
fn write_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Read one record. `Ok(None)` means clean end of log or a torn/corrupt
/// record; either way replay stops there.
fn read_record(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Some((event, (len + 8) as u64))),
        Err(_) => Ok(None),
    }
}

/// `read_exact` that reports EOF as `false` instead of an error.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Events recovered from disk plus the length of the valid prefix.
pub struct Replay {
    pub events: Vec<Event>,
    pub valid_len: u64,
}

/// Append-only event log for one tenant.
///
/// File layout: `ROOSTWAL` magic, `u32` version, then records. A crash can
/// leave a torn last record; replay stops at the first record that fails
/// its length or CRC check and `open` cuts the file back to that point.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Replay `path` and open it for appending, truncating any torn tail.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let Replay { events, valid_len } = Self::replay(path)?;
        let file = OpenOptions::new().create(true).read(true).write(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if valid_len == 0 {
            file.set_len(0)?;
        } else if on_disk > valid_len {
            file.set_len(valid_len)?;
        }
        let mut file = OpenOptions::new().append(true).open(path)?;
        if valid_len == 0 {
            write_header(&mut file)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: events.len() as u64,
        };
        Ok((wal, events))
    }

    /// Read every intact record. A missing file is an empty log; a file
    /// with a foreign header is an error.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Replay { events: Vec::new(), valid_len: 0 });
            }
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);

        let mut header = [0u8; HEADER_LEN as usize];
        if !read_full(&mut reader, &mut header)? {
            // Empty or a crash while writing the header.
            return Ok(Replay { events: Vec::new(), valid_len: 0 });
        }
        if &header[..8] != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a roost WAL", path.display()),
            ));
        }
        let version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if version != VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported WAL version {version}"),
            ));
        }

        let mut events = Vec::new();
        let mut valid_len = HEADER_LEN;
        while let Some((event, size)) = read_record(&mut reader)? {
            events.push(event);
            valid_len += size;
        }
        Ok(Replay { events, valid_len })
    }

    /// Append and fsync one event. Tests only; the writer task batches.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_record(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a full snapshot to the temp file next to the log and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        write_header(&mut writer)?;
        for event in events {
            write_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the log and continue appending to it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }
}
