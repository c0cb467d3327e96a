//! Firmware image sources and chunked reading.
//!
//! An image is an opaque byte stream. Each upload attempt reopens the
//! source, so a file that fails to open on one attempt can succeed on the
//! next.

use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

/// Where a firmware image comes from.
pub trait FirmwareSource {
    /// Human-readable name for logs.
    fn describe(&self) -> String;

    /// Open a fresh reader positioned at offset zero.
    fn open(&self) -> io::Result<Box<dyn Read + '_>>;
}

/// Image stored in a file.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FirmwareSource for FileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(BufReader::new(File::open(&self.path)?)))
    }
}

/// Image already in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    data: Vec<u8>,
}

impl MemorySource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl FirmwareSource for MemorySource {
    fn describe(&self) -> String {
        format!("<memory, {} bytes>", self.data.len())
    }

    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(self.data.as_slice()))
    }
}

/// Reads a stream in fixed-size chunks; only the final chunk may be short.
pub struct ChunkReader<R> {
    reader: R,
    chunk_size: usize,
    offset: usize,
    index: usize,
    done: bool,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size: chunk_size.max(1),
            offset: 0,
            index: 0,
            done: false,
        }
    }

    /// Byte offset of the next chunk.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Index of the next chunk (0-based).
    pub fn index(&self) -> usize {
        self.index
    }

    /// Next chunk, `Ok(None)` at end of stream.
    pub fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.done = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        self.offset += filled;
        self.index += 1;
        Ok(Some(buf))
    }
}
