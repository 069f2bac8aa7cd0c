use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::debug;

use crate::error::{DcdError, Result};
use crate::frame::{write_frame, Frame, UnitCell};
use crate::geometry::Geometry;
use crate::header::{Endian, Header, NewHeader, NSET_OFFSET, NSTEP_OFFSET};

macro_rules! write_primitives {
    ($($name:ident => $t:ty, $encode:ident;)*) => {
        $(
            #[inline]
            pub(crate) fn $name<W: Write>(file: &mut W, endian: Endian, value: $t) -> io::Result<()> {
                file.write_all(&endian.$encode(value))
            }
        )*
    };
}

write_primitives! {
    write_i32 => i32, encode_i32;
    write_u32 => u32, encode_u32;
    write_f64 => f64, encode_f64;
}

/// Writes a 4-byte record marker.
pub(crate) fn write_marker<W: Write>(file: &mut W, endian: Endian, len: u32) -> io::Result<()> {
    write_u32(file, endian, len)
}

pub(crate) fn write_f32s<W: Write>(
    file: &mut W,
    endian: Endian,
    values: &[f32],
    scratch: &mut Vec<u8>,
) -> io::Result<()> {
    scratch.clear();
    scratch.reserve(values.len() * 4);
    for &value in values {
        scratch.extend_from_slice(&endian.encode_f32(value));
    }
    file.write_all(scratch)
}

pub(crate) fn write_f64s<W: Write>(file: &mut W, endian: Endian, values: &[f64]) -> io::Result<()> {
    for &value in values {
        write_f64(file, endian, value)?;
    }
    Ok(())
}

/// Writes dcd trajectories, one frame at a time.
///
/// The header has to be written first, and only once. After every frame, the frame count and
/// last step in the header are brought up to date, so the file is complete at any point.
///
/// Every frame is written at its own offset, so a [`DcdWriter::write`] that failed can simply be
/// tried again.
#[derive(Debug)]
pub struct DcdWriter<W> {
    file: W,
    endian: Endian,
    header: Option<Header>,
    geometry: Option<Geometry>,
    /// Stream position of the start of the header.
    start: u64,
    /// The number of frames written so far.
    current: u64,
    scratch: Vec<u8>,
}

impl DcdWriter<File> {
    /// Creates a file at `path`, truncating it if it exists.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(file))
    }
}

impl<W> DcdWriter<W> {
    pub fn new(file: W) -> Self {
        Self::with_endian(file, Endian::NATIVE)
    }

    /// A writer that produces a file in the given byte order.
    pub fn with_endian(file: W, endian: Endian) -> Self {
        Self {
            file,
            endian,
            header: None,
            geometry: None,
            start: 0,
            current: 0,
            scratch: Vec::new(),
        }
    }

    /// The header as a reader will find it, once it is written.
    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    /// The number of frames written so far.
    pub fn tell(&self) -> u64 {
        self.current
    }

    pub fn into_inner(self) -> W {
        self.file
    }
}

impl<W: Write + Seek> DcdWriter<W> {
    pub fn write_header(&mut self, header: &NewHeader) -> Result<()> {
        if self.header.is_some() {
            return Err(DcdError::HeaderAlreadyWritten);
        }
        let start = self.file.stream_position()?;
        let header = match header.write(&mut self.file, self.endian) {
            Ok(header) => header,
            Err(err) => {
                self.file.seek(SeekFrom::Start(start))?;
                return Err(err);
            }
        };
        let header_size = self.file.stream_position()? - start;
        debug!(natoms = header.natoms, endian = ?self.endian, "wrote dcd header");
        self.geometry = Some(Geometry::new(&header, header_size, header_size));
        self.header = Some(header);
        self.start = start;
        Ok(())
    }

    /// Appends a frame.
    ///
    /// The `positions` are given in column-major order: the x values of all atoms, followed by
    /// the y values and the z values. The `unit_cell` holds six values in the on-disk order of
    /// [`UnitCell`]. It is dropped if the header is not a CHARMM header.
    pub fn write(&mut self, positions: &[f32], unit_cell: &[f64]) -> Result<()> {
        let (Some(header), Some(geometry)) = (&self.header, self.geometry) else {
            return Err(DcdError::HeaderNotWritten);
        };
        let natoms = header.natoms as usize;
        let unit_cell: [f64; 6] = unit_cell.try_into().map_err(|_| DcdError::ShapeMismatch {
            what: "unit cell",
            expected: 6,
            found: unit_cell.len(),
        })?;
        if positions.len() != natoms * 3 {
            return Err(DcdError::ShapeMismatch {
                what: "positions",
                expected: natoms * 3,
                found: positions.len(),
            });
        }

        let nframes = i32::try_from(self.current + 1).map_err(|_| DcdError::TooLarge {
            what: "frame count",
            value: self.current + 1,
        })?;

        // Whatever a failed write left behind, this frame goes at its own offset.
        let offset = self.start + geometry.offset(self.current);
        self.file.seek(SeekFrom::Start(offset))?;
        write_frame(
            &mut self.file,
            header,
            positions,
            &UnitCell(unit_cell),
            &mut self.scratch,
        )?;

        // Keep the frame count and the last step in the header current.
        let step = header
            .first_step
            .wrapping_add((nframes - 1).wrapping_mul(header.save_interval));
        self.file.seek(SeekFrom::Start(self.start + NSET_OFFSET))?;
        write_i32(&mut self.file, self.endian, nframes)?;
        self.file.seek(SeekFrom::Start(self.start + NSTEP_OFFSET))?;
        write_i32(&mut self.file, self.endian, step)?;
        let end = self.start + geometry.offset(self.current + 1);
        self.file.seek(SeekFrom::Start(end))?;

        self.current += 1;
        Ok(())
    }

    /// Appends the x, y and z coordinates and the unit cell of `frame`.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let positions = &frame.positions()[..frame.natoms() * 3];
        self.write(positions, &frame.unit_cell.0)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::header::Flags;
    use crate::reader::{read_i32, DcdReader};

    fn new_header(natoms: u32) -> NewHeader {
        NewHeader {
            first_step: 50,
            save_interval: 5,
            ..NewHeader::new(natoms)
        }
    }

    fn writer(natoms: u32) -> DcdWriter<Cursor<Vec<u8>>> {
        let mut writer = DcdWriter::new(Cursor::new(Vec::new()));
        writer.write_header(&new_header(natoms)).unwrap();
        writer
    }

    /// A file that fails a single write starting at byte `fail_at`, after letting `passes` writes
    /// at that byte through.
    struct Flaky {
        inner: Cursor<Vec<u8>>,
        fail_at: u64,
        passes: usize,
        failed: bool,
    }

    impl Flaky {
        fn writer(fail_at: u64, passes: usize) -> DcdWriter<Self> {
            let file = Self {
                inner: Cursor::new(Vec::new()),
                fail_at,
                passes,
                failed: false,
            };
            let mut writer = DcdWriter::new(file);
            writer.write_header(&new_header(2)).unwrap();
            writer
        }
    }

    impl Write for Flaky {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if !self.failed && self.inner.position() == self.fail_at {
                if self.passes == 0 {
                    self.failed = true;
                    return Err(io::Error::other("disk hiccup"));
                }
                self.passes -= 1;
            }
            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for Flaky {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    fn header_len() -> u64 {
        let mut bytes = Vec::new();
        new_header(2).write(&mut bytes, Endian::NATIVE).unwrap();
        bytes.len() as u64
    }

    #[test]
    fn header_only_once() {
        let mut writer = writer(2);
        assert!(matches!(
            writer.write_header(&NewHeader::new(2)),
            Err(DcdError::HeaderAlreadyWritten)
        ));
    }

    #[test]
    fn frames_need_a_header() {
        let mut writer = DcdWriter::new(Cursor::new(Vec::new()));
        assert!(matches!(
            writer.write(&[0.0; 3], &[0.0; 6]),
            Err(DcdError::HeaderNotWritten)
        ));
    }

    #[test]
    fn shapes_are_checked() {
        let mut writer = writer(2);
        assert!(matches!(
            writer.write(&[0.0; 5], &[0.0; 6]),
            Err(DcdError::ShapeMismatch {
                what: "positions",
                expected: 6,
                found: 5
            })
        ));
        assert!(matches!(
            writer.write(&[0.0; 6], &[0.0; 3]),
            Err(DcdError::ShapeMismatch {
                what: "unit cell",
                ..
            })
        ));
        assert_eq!(writer.tell(), 0);
    }

    #[test]
    fn header_counts_are_updated() {
        let mut writer = writer(2);
        for _ in 0..3 {
            writer.write(&[1.0; 6], &[1.0; 6]).unwrap();
        }
        let endian = writer.header().unwrap().endian;
        let mut file = writer.into_inner();

        file.seek(SeekFrom::Start(NSET_OFFSET)).unwrap();
        assert_eq!(read_i32(&mut file, endian).unwrap(), 3);
        file.seek(SeekFrom::Start(NSTEP_OFFSET)).unwrap();
        assert_eq!(read_i32(&mut file, endian).unwrap(), 50 + 2 * 5);

        let reader = DcdReader::new(file).unwrap();
        assert_eq!(reader.header().nsets, 3);
        assert_eq!(reader.nframes(), 3);
    }

    #[test]
    fn xplor_frames_have_no_unit_cell() {
        let mut writer = DcdWriter::with_endian(Cursor::new(Vec::new()), Endian::Big);
        let header = NewHeader {
            flags: Flags::NONE,
            ..NewHeader::new(1)
        };
        writer.write_header(&header).unwrap();
        writer.write(&[1.0, 2.0, 3.0], &[9.0; 6]).unwrap();

        let mut reader = DcdReader::new(writer.into_inner()).unwrap();
        assert_eq!(reader.geometry().first_frame_size, 3 * (4 + 8));
        let frame = reader.read().unwrap().unwrap();
        assert_eq!(frame.positions(), &[1.0, 2.0, 3.0]);
        assert_eq!(frame.unit_cell, UnitCell::default());
    }

    #[test]
    fn retry_after_failed_header_update() {
        // The header itself is written over byte 8 once, the update after the first frame fails.
        let mut writer = Flaky::writer(NSET_OFFSET, 1);
        let first = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert!(matches!(
            writer.write(&first, &[1.0; 6]),
            Err(DcdError::Io(_))
        ));
        assert_eq!(writer.tell(), 0);

        writer.write(&first, &[1.0; 6]).unwrap();
        writer.write(&[7.0; 6], &[2.0; 6]).unwrap();
        assert_eq!(writer.tell(), 2);

        let mut reader = DcdReader::new(writer.into_inner().inner).unwrap();
        assert_eq!(reader.header().nsets, 2);
        assert_eq!(reader.nframes(), 2);
        assert_eq!(reader.geometry().remainder, 0);
        assert_eq!(reader.read().unwrap().unwrap().positions(), &first);
        assert_eq!(reader.read().unwrap().unwrap().positions(), &[7.0; 6]);
    }

    #[test]
    fn retry_after_partial_frame() {
        // Fail on the y record of the first frame: 56 bytes of unit cell, 16 bytes of x record.
        let mut writer = Flaky::writer(header_len() + 56 + 16, 0);
        assert!(matches!(
            writer.write(&[1.0; 6], &[1.0; 6]),
            Err(DcdError::Io(_))
        ));
        assert_eq!(writer.tell(), 0);

        let positions = [0.5, 1.5, 2.5, 3.5, 4.5, 5.5];
        writer.write(&positions, &[3.0; 6]).unwrap();

        let mut reader = DcdReader::new(writer.into_inner().inner).unwrap();
        assert_eq!(reader.header().nsets, 1);
        assert_eq!(reader.nframes(), 1);
        assert_eq!(reader.geometry().remainder, 0);
        let frame = reader.read().unwrap().unwrap();
        assert_eq!(frame.positions(), &positions);
        assert_eq!(frame.unit_cell, UnitCell([3.0; 6]));
    }

    #[test]
    fn header_after_leading_bytes() {
        let mut file = Cursor::new(Vec::new());
        file.write_all(b"leading").unwrap();
        let mut writer = DcdWriter::new(file);
        writer.write_header(&new_header(2)).unwrap();
        writer.write(&[1.0; 6], &[1.0; 6]).unwrap();
        writer.write(&[2.0; 6], &[1.0; 6]).unwrap();
        let endian = writer.header().unwrap().endian;

        let bytes = writer.into_inner().into_inner();
        assert_eq!(&bytes[..7], b"leading");
        let mut file = Cursor::new(bytes[7..].to_vec());
        file.seek(SeekFrom::Start(NSET_OFFSET)).unwrap();
        assert_eq!(read_i32(&mut file, endian).unwrap(), 2);
        let reader = DcdReader::new(file).unwrap();
        assert_eq!(reader.nframes(), 2);
    }

    #[test]
    fn frame_count_must_fit() {
        let mut writer = writer(2);
        writer.current = i32::MAX as u64;
        assert!(matches!(
            writer.write(&[1.0; 6], &[1.0; 6]),
            Err(DcdError::TooLarge {
                what: "frame count",
                ..
            })
        ));
        assert_eq!(writer.tell(), i32::MAX as u64);
    }
}
