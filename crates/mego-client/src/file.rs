//! Upload sources and the chunk reader.

use std::fmt;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;

/// Anything that can be read and rewound.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// A file to upload.
pub enum FileSource {
    /// A file on disk, named after its last path component.
    Path(PathBuf),
    /// In-memory content.
    Bytes { name: String, data: Bytes },
    /// Any seekable reader.
    Stream {
        name: String,
        reader: Box<dyn ReadSeek>,
    },
}

impl FileSource {
    /// In-memory content uploaded as `name`.
    pub fn bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::Bytes {
            name: name.into(),
            data: data.into(),
        }
    }

    /// A seekable reader uploaded as `name`.
    pub fn stream(name: impl Into<String>, reader: impl ReadSeek + 'static) -> Self {
        Self::Stream {
            name: name.into(),
            reader: Box::new(reader),
        }
    }

    /// Name sent with the file.
    pub fn name(&self) -> String {
        match self {
            Self::Path(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Self::Bytes { name, .. } | Self::Stream { name, .. } => name.clone(),
        }
    }

    /// Opens the source as a reader.
    pub fn open(self) -> io::Result<(String, Box<dyn ReadSeek>)> {
        let name = self.name();
        let reader: Box<dyn ReadSeek> = match self {
            Self::Path(path) => Box::new(std::fs::File::open(path)?),
            Self::Bytes { data, .. } => Box::new(Cursor::new(data)),
            Self::Stream { reader, .. } => reader,
        };
        Ok((name, reader))
    }

    /// Reads the whole content.
    pub fn read_all(self) -> io::Result<(String, Bytes)> {
        if let Self::Bytes { name, data } = self {
            return Ok((name, data));
        }
        let (name, mut reader) = self.open()?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok((name, Bytes::from(buf)))
    }
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Bytes { name, data } => f
                .debug_struct("Bytes")
                .field("name", name)
                .field("len", &data.len())
                .finish(),
            Self::Stream { name, .. } => f.debug_struct("Stream").field("name", name).finish(),
        }
    }
}

impl From<PathBuf> for FileSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for FileSource {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<&str> for FileSource {
    fn from(path: &str) -> Self {
        Self::Path(PathBuf::from(path))
    }
}

/// One part of a chunked upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Id of the file the part belongs to.
    pub file_id: u64,
    /// 1-based part index.
    pub part: u64,
    /// Number of parts of the file.
    pub total: u64,
    /// Bytes of this part.
    pub bin: Bytes,
}

impl Chunk {
    /// Returns true for the last part.
    pub fn is_final(&self) -> bool {
        self.part == self.total
    }
}

/// Splits a seekable reader into fixed-size parts.
///
/// The length is measured up front so every part knows the total. An empty
/// reader yields a single empty part.
pub struct ChunkReader<R> {
    reader: R,
    file_id: u64,
    chunk_size: usize,
    total: u64,
    next: u64,
}

impl<R: Read + Seek> ChunkReader<R> {
    /// Creates a reader yielding parts of at most `chunk_size` bytes.
    pub fn new(mut reader: R, file_id: u64, chunk_size: usize) -> io::Result<Self> {
        let chunk_size = chunk_size.max(1);
        let start = reader.stream_position()?;
        let len = reader.seek(SeekFrom::End(0))? - start;
        reader.seek(SeekFrom::Start(start))?;

        let total = len.div_ceil(chunk_size as u64).max(1);
        Ok(Self {
            reader,
            file_id,
            chunk_size,
            total,
            next: 1,
        })
    }

    /// Number of parts.
    pub fn total(&self) -> u64 {
        self.total
    }
}

impl<R: Read + Seek> Iterator for ChunkReader<R> {
    type Item = io::Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next > self.total {
            return None;
        }
        let mut buf = Vec::with_capacity(self.chunk_size);
        if let Err(e) = (&mut self.reader)
            .take(self.chunk_size as u64)
            .read_to_end(&mut buf)
        {
            self.next = self.total + 1;
            return Some(Err(e));
        }

        let chunk = Chunk {
            file_id: self.file_id,
            part: self.next,
            total: self.total,
            bin: Bytes::from(buf),
        };
        self.next += 1;
        Some(Ok(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_into_parts() {
        let reader = ChunkReader::new(Cursor::new(b"abcdefghij".to_vec()), 7, 4).unwrap();
        assert_eq!(reader.total(), 3);

        let chunks: Vec<Chunk> = reader.map(Result::unwrap).collect();
        let sizes: Vec<usize> = chunks.iter().map(|c| c.bin.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(chunks[0].part, 1);
        assert!(chunks[2].is_final());
        assert!(chunks.iter().all(|c| c.file_id == 7 && c.total == 3));
    }

    #[test]
    fn exact_multiple_has_no_trailing_part() {
        let reader = ChunkReader::new(Cursor::new(vec![0u8; 8]), 1, 4).unwrap();
        assert_eq!(reader.total(), 2);
        assert_eq!(reader.count(), 2);
    }

    #[test]
    fn empty_reader_yields_one_empty_part() {
        let mut reader = ChunkReader::new(Cursor::new(Vec::new()), 1, 4).unwrap();
        let chunk = reader.next().unwrap().unwrap();
        assert!(chunk.bin.is_empty());
        assert!(chunk.is_final());
        assert!(reader.next().is_none());
    }

    #[test]
    fn starts_from_current_position() {
        let mut cursor = Cursor::new(b"skip-data".to_vec());
        cursor.set_position(5);
        let chunks: Vec<Chunk> = ChunkReader::new(cursor, 1, 100)
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(chunks[0].bin.as_ref(), b"data");
    }

    #[test]
    fn path_source_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hello").unwrap();

        let source = FileSource::from(path.as_path());
        assert_eq!(source.name(), "notes.txt");
        let (name, data) = source.read_all().unwrap();
        assert_eq!(name, "notes.txt");
        assert_eq!(data.as_ref(), b"hello");
    }

    #[test]
    fn missing_path_fails_on_open() {
        let source = FileSource::from("/nonexistent/mego/file.bin");
        assert!(source.open().is_err());
    }

    #[test]
    fn stream_source_keeps_name() {
        let source = FileSource::stream("photo.png", Cursor::new(vec![1u8, 2, 3]));
        let (name, data) = source.read_all().unwrap();
        assert_eq!(name, "photo.png");
        assert_eq!(data.len(), 3);
    }
}
