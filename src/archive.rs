//! Archive reader for tar containers of log files.
//!
//! Opening an archive walks the tar headers once and records where every
//! regular-file member's data starts. Member data is only read when a member
//! is opened, through a fresh handle on the underlying file, so an archive of
//! any size is processed one member at a time without buffering it in memory.
//!
//! Gzip-compressed archives (`.tar.gz`) are detected from their magic bytes.
//! Their members cannot be seeked to, so opening one skips the decompressed
//! stream up to the member's data instead. A [`MemberCursor`] keeps one
//! decompressed stream open across members so that a forward pass over the
//! archive decompresses it only once.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use thiserror::Error;
use tracing::debug;

/// First two bytes of every gzip stream.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Errors raised while opening or reading an archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The archive path does not exist
    #[error("archive not found: {}", .0.display())]
    NotFound(PathBuf),

    /// An I/O error occurred while reading the archive
    #[error("failed to read archive {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file is not a readable tar container
    #[error("invalid archive {}: {}", .path.display(), .message)]
    Invalid { path: PathBuf, message: String },

    /// Reading a member's data failed
    #[error("failed to read member '{member}' of archive {}: {}", .archive.display(), .source)]
    MemberIo {
        archive: PathBuf,
        member: String,
        #[source]
        source: io::Error,
    },

    /// The requested member is not present in the archive
    #[error("member '{name}' not found in archive")]
    MissingMember { name: String },
}

impl ArchiveError {
    fn io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            ArchiveError::NotFound(path.to_path_buf())
        } else {
            ArchiveError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    fn invalid(path: &Path, message: impl Into<String>) -> Self {
        ArchiveError::Invalid {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }
}

/// How the tar stream is stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

/// Location of one member's data inside the (decompressed) tar stream.
#[derive(Debug, Clone)]
struct MemberEntry {
    name: String,
    offset: u64,
    size: u64,
}

/// A tar archive opened read-only, with its member index.
#[derive(Debug)]
pub struct Archive {
    path: PathBuf,
    compression: Compression,
    members: Vec<MemberEntry>,
}

impl Archive {
    /// Open the archive at `path` and index its members.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::NotFound` if the path does not exist and
    /// `ArchiveError::Invalid` if the file is empty or not a tar container.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let path = path.as_ref();
        let compression = detect_compression(path)?;
        let source = open_source(path, compression)?;

        let mut reader = tar::Archive::new(source);
        let mut members = Vec::new();

        let entries = reader
            .entries()
            .map_err(|e| ArchiveError::invalid(path, e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| ArchiveError::invalid(path, e.to_string()))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry
                .path()
                .map_err(|e| ArchiveError::invalid(path, e.to_string()))?
                .to_string_lossy()
                .into_owned();
            let size = entry
                .header()
                .entry_size()
                .map_err(|e| ArchiveError::invalid(path, e.to_string()))?;
            members.push(MemberEntry {
                name,
                offset: entry.raw_file_position(),
                size,
            });
        }

        debug!(
            archive = %path.display(),
            compression = ?compression,
            members = members.len(),
            "Archive opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            compression,
            members,
        })
    }

    /// Member names in the archive's own order.
    pub fn list_members(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.name.as_str()).collect()
    }

    /// Open a member's byte stream by name.
    ///
    /// If the archive holds several members with the same name, the first one
    /// is opened; use [`Archive::open_member_at`] to reach the others.
    pub fn open_member(&self, name: &str) -> Result<Member<'static>, ArchiveError> {
        let entry = self
            .members
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| ArchiveError::MissingMember {
                name: name.to_string(),
            })?;
        self.open_entry(entry)
    }

    /// Open the member at `index` in [`Archive::list_members`] order.
    pub fn open_member_at(&self, index: usize) -> Result<Member<'static>, ArchiveError> {
        self.open_entry(self.entry(index)?)
    }

    /// Cursor for opening members in archive order with a single pass over
    /// the decompressed stream.
    pub fn cursor(&self) -> MemberCursor<'_> {
        MemberCursor {
            archive: self,
            stream: None,
        }
    }

    fn entry(&self, index: usize) -> Result<&MemberEntry, ArchiveError> {
        self.members
            .get(index)
            .ok_or_else(|| ArchiveError::MissingMember {
                name: format!("#{}", index),
            })
    }

    fn member<'a>(&self, entry: &MemberEntry, reader: Box<dyn BufRead + Send + 'a>) -> Member<'a> {
        Member {
            name: entry.name.clone(),
            archive: self.path.clone(),
            reader,
        }
    }

    fn open_entry(&self, entry: &MemberEntry) -> Result<Member<'static>, ArchiveError> {
        let reader: Box<dyn BufRead + Send> = match self.compression {
            Compression::None => {
                let mut file = File::open(&self.path).map_err(|e| ArchiveError::io(&self.path, e))?;
                file.seek(SeekFrom::Start(entry.offset))
                    .map_err(|e| ArchiveError::io(&self.path, e))?;
                Box::new(BufReader::new(file.take(entry.size)))
            }
            Compression::Gzip => {
                let mut stream = Counted::new(open_source(&self.path, self.compression)?);
                stream.skip_to(&self.path, entry)?;
                Box::new(BufReader::new(stream.take(entry.size)))
            }
        };

        Ok(self.member(entry, reader))
    }

    /// Path the archive was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Storage format detected at open time.
    pub fn compression(&self) -> Compression {
        self.compression
    }
}

/// Opens members in archive order, sharing one stream between them.
///
/// Plain tar members are seeked to as with [`Archive::open_member_at`]. For a
/// gzip archive the cursor keeps the decompressed stream open and only skips
/// forward from where the previous member stopped, so members must be opened
/// in increasing index order to avoid decompressing the archive again. Going
/// backwards is allowed and restarts the stream.
pub struct MemberCursor<'a> {
    archive: &'a Archive,
    stream: Option<Counted>,
}

impl<'a> MemberCursor<'a> {
    /// Open the member at `index`. The returned member borrows the cursor and
    /// must be dropped before the next one is opened.
    pub fn open_at(&mut self, index: usize) -> Result<Member<'_>, ArchiveError> {
        let archive = self.archive;
        let entry = archive.entry(index)?;
        if archive.compression == Compression::None {
            return archive.open_entry(entry);
        }

        let stream = match self.stream.take() {
            Some(stream) if stream.position <= entry.offset => self.stream.insert(stream),
            previous => {
                if previous.is_some() {
                    debug!(member = %entry.name, "Restarting archive stream");
                }
                let source = open_source(&archive.path, archive.compression)?;
                self.stream.insert(Counted::new(source))
            }
        };
        stream.skip_to(&archive.path, entry)?;
        let reader = BufReader::new(Read::take(stream, entry.size));
        Ok(archive.member(entry, Box::new(reader)))
    }
}

/// Decompressed archive stream that knows how far it has been read.
struct Counted {
    inner: Box<dyn Read + Send>,
    position: u64,
}

impl Counted {
    fn new(inner: Box<dyn Read + Send>) -> Self {
        Self { inner, position: 0 }
    }

    /// Discard bytes up to the start of `entry`'s data.
    fn skip_to(&mut self, path: &Path, entry: &MemberEntry) -> Result<(), ArchiveError> {
        let gap = entry.offset - self.position;
        let skipped = io::copy(&mut self.by_ref().take(gap), &mut io::sink())
            .map_err(|e| ArchiveError::io(path, e))?;
        if skipped != gap {
            return Err(ArchiveError::invalid(
                path,
                format!("truncated before member '{}'", entry.name),
            ));
        }
        Ok(())
    }
}

impl Read for Counted {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

/// One named member of an archive, readable once from start to end.
pub struct Member<'a> {
    name: String,
    archive: PathBuf,
    reader: Box<dyn BufRead + Send + 'a>,
}

impl<'a> Member<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Split the member's bytes on `\n`, without the delimiter.
    pub fn lines(self) -> impl Iterator<Item = Result<Vec<u8>, ArchiveError>> + Send + 'a {
        let Member {
            name,
            archive,
            reader,
        } = self;
        reader.split(b'\n').map(move |line| {
            line.map_err(|source| ArchiveError::MemberIo {
                archive: archive.clone(),
                member: name.clone(),
                source,
            })
        })
    }
}

impl std::fmt::Debug for Member<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Member")
            .field("name", &self.name)
            .field("archive", &self.archive)
            .finish()
    }
}

fn detect_compression(path: &Path) -> Result<Compression, ArchiveError> {
    let mut file = File::open(path).map_err(|e| ArchiveError::io(path, e))?;
    let mut magic = [0u8; 2];
    let mut read = 0;
    while read < magic.len() {
        match file.read(&mut magic[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ArchiveError::io(path, e)),
        }
    }

    match read {
        0 => Err(ArchiveError::invalid(path, "empty file")),
        2 if magic == GZIP_MAGIC => Ok(Compression::Gzip),
        _ => Ok(Compression::None),
    }
}

fn open_source(path: &Path, compression: Compression) -> Result<Box<dyn Read + Send>, ArchiveError> {
    let file = File::open(path).map_err(|e| ArchiveError::io(path, e))?;
    let reader = BufReader::new(file);
    Ok(match compression {
        Compression::None => Box::new(reader),
        Compression::Gzip => Box::new(GzDecoder::new(reader)),
    })
}
