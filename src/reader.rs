use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::{debug, trace};

use crate::error::{DcdError, Result};
use crate::frame::{read_frame, FixedAtoms, Frame};
use crate::geometry::Geometry;
use crate::header::{Endian, Header};
use crate::selection::{AtomSelection, FrameSelection};

macro_rules! read_primitives {
    ($($name:ident => $t:ty, $decode:ident;)*) => {
        $(
            #[inline]
            pub(crate) fn $name<R: Read>(file: &mut R, endian: Endian) -> io::Result<$t> {
                let mut buf = [0; std::mem::size_of::<$t>()];
                file.read_exact(&mut buf)?;
                Ok(endian.$decode(buf))
            }
        )*
    };
}

read_primitives! {
    read_i32 => i32, decode_i32;
    read_u32 => u32, decode_u32;
    read_u64 => u64, decode_u64;
    read_f64 => f64, decode_f64;
}

/// Reads a record marker, which holds the length of the record it brackets.
pub(crate) fn read_marker<R: Read>(file: &mut R, endian: Endian, wide: bool) -> io::Result<u64> {
    if wide {
        read_u64(file, endian)
    } else {
        read_u32(file, endian).map(u64::from)
    }
}

/// Fill `buf` with floats, reading all of their bytes into `scratch` in one go.
pub(crate) fn read_f32s<R: Read>(
    file: &mut R,
    endian: Endian,
    buf: &mut [f32],
    scratch: &mut Vec<u8>,
) -> Result<()> {
    let nbytes = buf.len() * 4;
    scratch.clear();
    scratch
        .try_reserve(nbytes)
        .map_err(|_| DcdError::AllocationFailure { bytes: nbytes })?;
    scratch.resize(nbytes, 0);
    file.read_exact(scratch)?;
    for (value, bytes) in buf.iter_mut().zip(scratch.chunks_exact(4)) {
        *value = endian.decode_f32([bytes[0], bytes[1], bytes[2], bytes[3]]);
    }
    Ok(())
}

pub(crate) fn read_f64s<R: Read>(file: &mut R, endian: Endian, buf: &mut [f64]) -> io::Result<()> {
    for value in buf {
        *value = read_f64(file, endian)?
    }
    Ok(())
}

/// A random-access reader for dcd trajectories.
///
/// Frames are located by computing their byte offsets from the header, so seeking to any frame
/// is a single seek, regardless of where it lies in the file.
#[derive(Debug)]
pub struct DcdReader<R> {
    file: R,
    header: Header,
    geometry: Geometry,
    fixed: Option<FixedAtoms>,
    /// Index of the frame that the next [`DcdReader::read`] returns.
    current: u64,
    reached_end: bool,
    scratch: Vec<u8>,
}

impl DcdReader<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::new(file)
    }
}

impl<R> DcdReader<R> {
    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// The number of frames in the trajectory, as estimated from the file size.
    pub fn nframes(&self) -> u64 {
        self.geometry.nframes
    }

    /// Index of the next frame to be read.
    pub fn tell(&self) -> u64 {
        self.current
    }

    pub fn is_periodic(&self) -> bool {
        self.header.is_periodic()
    }

    pub fn into_inner(self) -> R {
        self.file
    }
}

impl<R: Read + Seek> DcdReader<R> {
    /// Parses the header of `file` and prepares to read its first frame.
    ///
    /// The first frame is read once right away, such that the positions of fixed atoms are known
    /// before any other frame is sought.
    ///
    /// # Errors
    ///
    /// Fails with [`DcdError::CorruptTrajectory`] if the file size promises frames, but the first
    /// frame cannot be read. A file without any frames is fine.
    pub fn new(mut file: R) -> Result<Self> {
        file.seek(SeekFrom::Start(0))?;
        let header = Header::read(&mut file)?;
        let header_size = file.stream_position()?;
        let file_size = file.seek(SeekFrom::End(0))?;
        let geometry = Geometry::new(&header, header_size, file_size);
        let fixed = FixedAtoms::new(&header)?;

        let mut reader = Self {
            file,
            header,
            geometry,
            fixed,
            current: 0,
            reached_end: false,
            scratch: Vec::new(),
        };
        reader.home()?;
        Ok(reader)
    }

    /// Go back to the first frame.
    ///
    /// The first frame is read and the reader returns to its start again, which refreshes the
    /// reference positions of any fixed atoms.
    pub fn home(&mut self) -> Result<()> {
        let start = self.geometry.header_size;
        self.file.seek(SeekFrom::Start(start))?;
        self.current = 0;
        self.reached_end = false;
        if let Some(fixed) = self.fixed.as_mut() {
            fixed.forget();
        }

        let nframes = self.geometry.nframes;
        let check = read_frame(
            &mut self.file,
            &self.header,
            self.fixed.as_mut(),
            true,
            &mut self.scratch,
        );
        match check {
            Ok(Some(_)) => {}
            // An empty trajectory is valid. Complaints are left to whoever tries to read from it.
            _ if nframes == 0 => debug!("trajectory contains no frames"),
            Ok(None) => {
                return Err(DcdError::CorruptTrajectory(format!(
                    "expected {nframes} frames, but the first frame is incomplete"
                )))
            }
            Err(err) => {
                return Err(DcdError::CorruptTrajectory(format!(
                    "expected {nframes} frames, but the first frame cannot be read: {err}"
                )))
            }
        }

        self.file.seek(SeekFrom::Start(start))?;
        Ok(())
    }

    /// Position the reader such that the next [`DcdReader::read`] returns the frame at `index`.
    pub fn seek(&mut self, index: u64) -> Result<()> {
        let nframes = self.geometry.nframes;
        if index >= nframes {
            return Err(DcdError::OutOfRange { index, nframes });
        }
        let offset = self.geometry.offset(index);
        self.file.seek(SeekFrom::Start(offset))?;
        trace!(index, offset, "seek");
        self.current = index;
        self.reached_end = false;
        Ok(())
    }

    /// Reads the next [`Frame`] and advances one step.
    ///
    /// Returns [`None`] once the end of the trajectory is reached. Reading again after that fails
    /// with [`DcdError::EndOfTrajectory`] until the reader is moved with [`DcdReader::seek`] or
    /// [`DcdReader::home`].
    pub fn read(&mut self) -> Result<Option<Frame>> {
        if self.reached_end {
            return Err(DcdError::EndOfTrajectory);
        }
        if self.geometry.nframes == 0 {
            return Err(DcdError::EmptyTrajectory);
        }
        if self.current >= self.geometry.nframes {
            self.reached_end = true;
            return Ok(None);
        }

        let first = self.current == 0;
        let frame = read_frame(
            &mut self.file,
            &self.header,
            self.fixed.as_mut(),
            first,
            &mut self.scratch,
        )?;
        match frame {
            Some(frame) => {
                self.current += 1;
                Ok(Some(frame))
            }
            None => {
                self.reached_end = true;
                Ok(None)
            }
        }
    }

    /// Reads exactly `n` consecutive frames.
    ///
    /// # Errors
    ///
    /// Fails with [`DcdError::EndOfTrajectory`] if the trajectory ends before `n` frames are read.
    pub fn read_n(&mut self, n: usize) -> Result<Box<[Frame]>> {
        let left = self.geometry.nframes.saturating_sub(self.current);
        let mut frames = Vec::with_capacity(usize::try_from(left).map_or(n, |left| n.min(left)));
        for _ in 0..n {
            match self.read()? {
                Some(frame) => frames.push(frame),
                None => return Err(DcdError::EndOfTrajectory),
            }
        }
        Ok(frames.into_boxed_slice())
    }

    /// Append [`Frame`]s to the `frames` buffer according to a [`FrameSelection`], keeping only
    /// the atoms in the [`AtomSelection`].
    ///
    /// Only the selected frames are visited. Returns the number of frames that were read.
    pub fn read_frames(
        &mut self,
        frames: &mut impl Extend<Frame>,
        frame_selection: &FrameSelection,
        atom_selection: &AtomSelection,
    ) -> Result<usize> {
        let mut n = 0;
        for idx in 0..self.geometry.nframes {
            match frame_selection.is_included(idx as usize) {
                Some(true) => {}
                Some(false) => continue,
                None => break,
            }
            self.seek(idx)?;
            match self.read()? {
                Some(frame) => frames.extend(Some(frame.select(atom_selection))),
                None => break,
            }
            n += 1;
        }
        Ok(n)
    }
}
