use std::fmt;
use std::fs::File;
use std::iter::FusedIterator;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, warn};

use crate::error::{DcdError, Result};
use crate::frame::Frame;
use crate::header::{Header, NewHeader};
use crate::reader::DcdReader;
use crate::selection::{AtomSelection, FrameSelection};
use crate::writer::DcdWriter;

/// Whether a [`DcdFile`] reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Read,
    Write,
}

impl FromStr for Mode {
    type Err = DcdError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" => Ok(Self::Read),
            "w" => Ok(Self::Write),
            _ => Err(DcdError::InvalidMode(s.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "r"),
            Self::Write => write!(f, "w"),
        }
    }
}

#[derive(Debug)]
enum Handle {
    Read(DcdReader<File>),
    Write(DcdWriter<File>),
}

/// A dcd file on disk, open for either reading or writing.
///
/// This ties a [`DcdReader`] or [`DcdWriter`] to a path, such that the file can be closed and
/// opened again, and iterated over from the start any number of times. Operations that do not fit
/// the current [`Mode`] fail with [`DcdError::WrongMode`], and any operation on a closed file fails
/// with [`DcdError::NotOpen`].
///
/// The file is closed when the `DcdFile` is dropped.
#[derive(Debug)]
pub struct DcdFile {
    path: PathBuf,
    handle: Option<Handle>,
}

impl DcdFile {
    /// Open the file at `path`.
    ///
    /// In [`Mode::Read`], the header is parsed and the first frame is read once, so a file that is
    /// inconsistent with its own header is rejected right away. In [`Mode::Write`], the file is
    /// created or truncated, and a header must be written before any frame.
    pub fn open<P: AsRef<Path>>(path: P, mode: Mode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let handle = Self::open_handle(&path, mode)?;
        Ok(Self {
            path,
            handle: Some(handle),
        })
    }

    /// Close the current file, if any, and open `path` in its place.
    ///
    /// If opening fails, the `DcdFile` stays closed.
    pub fn reopen<P: AsRef<Path>>(&mut self, path: P, mode: Mode) -> Result<()> {
        self.close()?;
        self.path = path.as_ref().to_path_buf();
        self.handle = Some(Self::open_handle(&self.path, mode)?);
        Ok(())
    }

    fn open_handle(path: &Path, mode: Mode) -> Result<Handle> {
        let handle = match mode {
            Mode::Read => Handle::Read(DcdReader::open(path)?),
            Mode::Write => Handle::Write(DcdWriter::create(path)?),
        };
        debug!(path = %path.display(), %mode, "opened dcd file");
        Ok(handle)
    }

    /// Close the file. Closing a file that is not open does nothing.
    ///
    /// Anything written is synced to disk first.
    pub fn close(&mut self) -> Result<()> {
        match self.handle.take() {
            None => return Ok(()),
            Some(Handle::Read(_)) => {}
            Some(Handle::Write(writer)) => writer.into_inner().sync_all()?,
        }
        debug!(path = %self.path.display(), "closed dcd file");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// The mode the file is open in, or [`None`] if it is closed.
    pub fn mode(&self) -> Option<Mode> {
        match self.handle {
            Some(Handle::Read(_)) => Some(Mode::Read),
            Some(Handle::Write(_)) => Some(Mode::Write),
            None => None,
        }
    }

    /// The path of the file that was opened most recently.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn reader(&mut self) -> Result<&mut DcdReader<File>> {
        match self.handle.as_mut() {
            Some(Handle::Read(reader)) => Ok(reader),
            Some(Handle::Write(_)) => Err(DcdError::WrongMode {
                expected: Mode::Read,
                found: Mode::Write,
            }),
            None => Err(DcdError::NotOpen),
        }
    }

    fn writer(&mut self) -> Result<&mut DcdWriter<File>> {
        match self.handle.as_mut() {
            Some(Handle::Write(writer)) => Ok(writer),
            Some(Handle::Read(_)) => Err(DcdError::WrongMode {
                expected: Mode::Write,
                found: Mode::Read,
            }),
            None => Err(DcdError::NotOpen),
        }
    }

    /// Position the file such that the next [`DcdFile::read`] returns the frame at `index`.
    pub fn seek(&mut self, index: u64) -> Result<()> {
        self.reader()?.seek(index)
    }

    /// Index of the next frame to be read or written.
    pub fn tell(&self) -> Result<u64> {
        match &self.handle {
            Some(Handle::Read(reader)) => Ok(reader.tell()),
            Some(Handle::Write(writer)) => Ok(writer.tell()),
            None => Err(DcdError::NotOpen),
        }
    }

    /// See [`DcdReader::read`].
    pub fn read(&mut self) -> Result<Option<Frame>> {
        self.reader()?.read()
    }

    pub fn read_n(&mut self, n: usize) -> Result<Box<[Frame]>> {
        self.reader()?.read_n(n)
    }

    pub fn read_frames(
        &mut self,
        frames: &mut impl Extend<Frame>,
        frame_selection: &FrameSelection,
        atom_selection: &AtomSelection,
    ) -> Result<usize> {
        self.reader()?
            .read_frames(frames, frame_selection, atom_selection)
    }

    pub fn write_header(&mut self, header: &NewHeader) -> Result<()> {
        self.writer()?.write_header(header)
    }

    /// See [`DcdWriter::write`].
    pub fn write(&mut self, positions: &[f32], unit_cell: &[f64]) -> Result<()> {
        self.writer()?.write(positions, unit_cell)
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.writer()?.write_frame(frame)
    }

    /// The header of the file. In write mode, this is only available once it has been written.
    pub fn header(&self) -> Result<&Header> {
        match &self.handle {
            Some(Handle::Read(reader)) => Ok(reader.header()),
            Some(Handle::Write(writer)) => writer.header().ok_or(DcdError::HeaderNotWritten),
            None => Err(DcdError::NotOpen),
        }
    }

    pub fn is_periodic(&self) -> Result<bool> {
        self.header().map(Header::is_periodic)
    }

    /// The number of frames in the file: as estimated from its size when reading, or as written
    /// so far when writing.
    pub fn nframes(&self) -> Result<u64> {
        match &self.handle {
            Some(Handle::Read(reader)) => Ok(reader.nframes()),
            Some(Handle::Write(writer)) => Ok(writer.tell()),
            None => Err(DcdError::NotOpen),
        }
    }

    /// Iterate over all frames from the start.
    ///
    /// The file is closed and opened again first, so any fixed atom state is rebuilt from scratch.
    /// Iteration stops at the end of the trajectory, and after the first error.
    pub fn frames(&mut self) -> Result<Frames<'_>> {
        self.reader()?;
        let path = self.path.clone();
        self.reopen(path, Mode::Read)?;
        Ok(Frames {
            file: self,
            done: false,
        })
    }
}

impl Drop for DcdFile {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(path = %self.path.display(), %err, "failed to close dcd file");
        }
    }
}

/// An iterator over the frames of a [`DcdFile`], created by [`DcdFile::frames`].
#[derive(Debug)]
pub struct Frames<'f> {
    file: &'f mut DcdFile,
    done: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.file.read() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) | Err(DcdError::EmptyTrajectory) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl FusedIterator for Frames<'_> {}
