use std::io::{Read, Seek, SeekFrom, Write};

use glam::{DVec3, Vec3};
use tracing::{trace, warn};

use crate::error::{try_zeroed, DcdError, Result};
use crate::header::{Endian, Flags, Header};
use crate::reader::{read_f32s, read_f64s, read_marker};
use crate::selection::AtomSelection;
use crate::writer::{write_f32s, write_f64s, write_marker};

/// Length of a unit cell record: six doubles.
const UNIT_CELL_LEN: u64 = 48;

/// The six parameters of a periodic box, in the order they are stored on disk:
/// `[A, gamma, B, beta, alpha, C]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitCell(pub [f64; 6]);

impl Default for UnitCell {
    /// Zero lengths with orthogonal angles, used when a file carries no unit cell.
    fn default() -> Self {
        Self([0.0, 90.0, 0.0, 90.0, 90.0, 0.0])
    }
}

impl UnitCell {
    /// Angles are given in degrees, in the order alpha, beta, gamma.
    pub fn from_lengths_angles(lengths: DVec3, angles: DVec3) -> Self {
        Self([lengths.x, angles.z, lengths.y, angles.y, angles.x, lengths.z])
    }

    /// The box lengths A, B and C.
    pub fn lengths(&self) -> DVec3 {
        let [a, _, b, _, _, c] = self.0;
        DVec3::new(a, b, c)
    }

    /// The box angles alpha, beta and gamma, in degrees.
    ///
    /// Newer CHARMM versions store the cosines of the angles rather than the angles. If all three
    /// stored values lie within `[-1, 1]`, they are taken to be cosines and converted.
    pub fn angles(&self) -> DVec3 {
        let [_, gamma, _, beta, alpha, _] = self.0;
        let angles = DVec3::new(alpha, beta, gamma);
        if angles.abs().max_element() <= 1.0 {
            DVec3::new(
                alpha.acos().to_degrees(),
                beta.acos().to_degrees(),
                gamma.acos().to_degrees(),
            )
        } else {
            angles
        }
    }
}

/// A single frame of a trajectory.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Frame {
    natoms: usize,
    dims: usize,
    /// Column-major coordinates: all x values, then all y values, then all z values (and the
    /// fourth dimension, if present).
    positions: Vec<f32>,
    pub unit_cell: UnitCell,
}

impl Frame {
    /// A frame of `natoms` atoms with all coordinates set to zero.
    pub(crate) fn zeroed(natoms: usize, dims: usize) -> Result<Self> {
        Ok(Self {
            natoms,
            dims,
            positions: try_zeroed(natoms * dims)?,
            unit_cell: UnitCell::default(),
        })
    }

    /// Build a three-dimensional frame from per-atom positions.
    pub fn from_positions(positions: &[Vec3], unit_cell: UnitCell) -> Self {
        let natoms = positions.len();
        let mut columns = vec![0.0; natoms * 3];
        for (idx, pos) in positions.iter().enumerate() {
            columns[idx] = pos.x;
            columns[natoms + idx] = pos.y;
            columns[2 * natoms + idx] = pos.z;
        }
        Self {
            natoms,
            dims: 3,
            positions: columns,
            unit_cell,
        }
    }

    pub fn natoms(&self) -> usize {
        self.natoms
    }

    /// The number of values stored per atom, 3 or 4.
    pub fn dims(&self) -> usize {
        self.dims
    }

    /// All coordinates in column-major order.
    pub fn positions(&self) -> &[f32] {
        &self.positions
    }

    /// The values of every atom along one axis.
    ///
    /// # Panics
    ///
    /// Panics if `axis >= self.dims()`.
    pub fn axis(&self, axis: usize) -> &[f32] {
        &self.positions[axis * self.natoms..(axis + 1) * self.natoms]
    }

    pub(crate) fn axis_mut(&mut self, axis: usize) -> &mut [f32] {
        &mut self.positions[axis * self.natoms..(axis + 1) * self.natoms]
    }

    /// The xyz position of the atom at `idx`.
    pub fn position(&self, idx: usize) -> Vec3 {
        let n = self.natoms;
        Vec3::new(
            self.positions[idx],
            self.positions[n + idx],
            self.positions[2 * n + idx],
        )
    }

    pub fn coords(&self) -> impl Iterator<Item = Vec3> + '_ {
        (0..self.natoms).map(|idx| self.position(idx))
    }

    /// A copy of this frame holding only the atoms in `selection`.
    pub fn select(&self, selection: &AtomSelection) -> Frame {
        if let AtomSelection::All = selection {
            return self.clone();
        }

        let mut indices = Vec::new();
        for idx in 0..self.natoms {
            match selection.is_included(idx) {
                Some(true) => indices.push(idx),
                Some(false) => {}
                None => break,
            }
        }

        let mut positions = Vec::with_capacity(indices.len() * self.dims);
        for axis in 0..self.dims {
            let column = self.axis(axis);
            positions.extend(indices.iter().map(|&idx| column[idx]));
        }
        Frame {
            natoms: indices.len(),
            dims: self.dims,
            positions,
            unit_cell: self.unit_cell,
        }
    }
}

/// What is needed to expand frames that only store the free atoms.
///
/// The free atom indices and the reference coordinates always live and die together.
#[derive(Debug)]
pub(crate) struct FixedAtoms {
    /// The 0-based indices of the atoms that are stored in every frame.
    free: Box<[usize]>,
    /// Column-major coordinates of every atom as found in the first frame.
    reference: Box<[f32]>,
    natoms: usize,
    captured: bool,
}

impl FixedAtoms {
    /// Returns [`None`] if the header declares no fixed atoms.
    pub(crate) fn new(header: &Header) -> Result<Option<Self>> {
        if header.nfixed == 0 {
            return Ok(None);
        }
        let natoms = header.natoms as usize;
        let mut free: Vec<usize> = try_zeroed(header.free_indices.len())?;
        for (slot, &idx) in free.iter_mut().zip(&header.free_indices) {
            // Validated to lie within 1..=natoms when the header was parsed.
            *slot = idx as usize - 1;
        }
        let reference: Vec<f32> = try_zeroed(natoms * header.dims())?;
        Ok(Some(Self {
            free: free.into_boxed_slice(),
            reference: reference.into_boxed_slice(),
            natoms,
            captured: false,
        }))
    }

    fn capture(&mut self, positions: &[f32]) {
        self.reference.copy_from_slice(positions);
        self.captured = true;
    }

    /// Drop the captured reference coordinates, such that the next full frame provides new ones.
    pub(crate) fn forget(&mut self) {
        self.captured = false;
    }

    fn reference_axis(&self, axis: usize) -> &[f32] {
        &self.reference[axis * self.natoms..(axis + 1) * self.natoms]
    }
}

/// Reads the frame at the current position of `file`.
///
/// A full frame, holding every atom, is expected when `first` is set or when no atoms are fixed.
/// Otherwise the frame holds only the free atoms and the others are filled in from `fixed`.
///
/// Returns [`None`] if the stream ends before the frame is complete.
pub(crate) fn read_frame<R: Read + Seek>(
    file: &mut R,
    header: &Header,
    fixed: Option<&mut FixedAtoms>,
    first: bool,
    scratch: &mut Vec<u8>,
) -> Result<Option<Frame>> {
    match decode_frame(file, header, fixed, first, scratch) {
        Ok(frame) => Ok(Some(frame)),
        Err(DcdError::UnexpectedEof) => {
            trace!("stream ended while reading a frame");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

fn decode_frame<R: Read + Seek>(
    file: &mut R,
    header: &Header,
    fixed: Option<&mut FixedAtoms>,
    first: bool,
    scratch: &mut Vec<u8>,
) -> Result<Frame> {
    let endian = header.endian;
    let wide = header.flags.contains(Flags::HAS_64BIT_REC);
    let mut frame = Frame::zeroed(header.natoms as usize, header.dims())?;

    if header.has_unit_cell() {
        if let Some(cell) = read_unit_cell(file, endian, wide)? {
            frame.unit_cell = cell;
        }
    }

    match fixed {
        Some(fixed) if !first => {
            if !fixed.captured {
                return Err(DcdError::CorruptTrajectory(
                    "fixed atom positions are unknown because the first frame was never read"
                        .to_string(),
                ));
            }
            let mut free: Vec<f32> = try_zeroed(fixed.free.len())?;
            for axis in 0..frame.dims {
                read_coordinates(file, endian, wide, &mut free, scratch)?;
                let column = frame.axis_mut(axis);
                column.copy_from_slice(fixed.reference_axis(axis));
                for (&idx, &value) in fixed.free.iter().zip(&free) {
                    column[idx] = value;
                }
            }
        }
        fixed => {
            for axis in 0..frame.dims {
                read_coordinates(file, endian, wide, frame.axis_mut(axis), scratch)?;
            }
            if let Some(fixed) = fixed {
                fixed.capture(&frame.positions);
            }
        }
    }

    Ok(frame)
}

/// Reads the extra block. Returns [`None`] if it has an unfamiliar size, in which case it is
/// skipped.
fn read_unit_cell<R: Read + Seek>(
    file: &mut R,
    endian: Endian,
    wide: bool,
) -> Result<Option<UnitCell>> {
    let len = read_marker(file, endian, wide)?;
    let cell = if len == UNIT_CELL_LEN {
        let mut cell = [0.0; 6];
        read_f64s(file, endian, &mut cell)?;
        Some(UnitCell(cell))
    } else {
        warn!(len, "skipping extra block of unexpected length");
        let skip = i64::try_from(len)
            .map_err(|_| DcdError::CorruptFrame(format!("extra block length {len} is absurd")))?;
        file.seek(SeekFrom::Current(skip))?;
        None
    };
    expect_marker(file, endian, wide, len, "extra block")?;
    Ok(cell)
}

/// Reads one coordinate record into `buf`, which must have the length the record is expected to
/// have.
fn read_coordinates<R: Read>(
    file: &mut R,
    endian: Endian,
    wide: bool,
    buf: &mut [f32],
    scratch: &mut Vec<u8>,
) -> Result<()> {
    let len = 4 * buf.len() as u64;
    expect_marker(file, endian, wide, len, "coordinate")?;
    read_f32s(file, endian, buf, scratch)?;
    expect_marker(file, endian, wide, len, "coordinate")
}

fn expect_marker<R: Read>(
    file: &mut R,
    endian: Endian,
    wide: bool,
    expected: u64,
    record: &str,
) -> Result<()> {
    let found = read_marker(file, endian, wide)?;
    if found != expected {
        return Err(DcdError::CorruptFrame(format!(
            "{record} record marker is {found}, expected {expected}"
        )));
    }
    Ok(())
}

/// Writes one full frame. `positions` holds the x, y and z columns of `header.natoms` atoms.
pub(crate) fn write_frame<W: Write>(
    file: &mut W,
    header: &Header,
    positions: &[f32],
    unit_cell: &UnitCell,
    scratch: &mut Vec<u8>,
) -> Result<()> {
    let endian = header.endian;
    if header.has_unit_cell() {
        write_marker(file, endian, UNIT_CELL_LEN as u32)?;
        write_f64s(file, endian, &unit_cell.0)?;
        write_marker(file, endian, UNIT_CELL_LEN as u32)?;
    }

    let natoms = header.natoms as usize;
    let len = u32::try_from(4 * natoms as u64).map_err(|_| DcdError::TooLarge {
        what: "atom count",
        value: natoms as u64,
    })?;
    for axis in 0..3 {
        write_marker(file, endian, len)?;
        write_f32s(
            file,
            endian,
            &positions[axis * natoms..(axis + 1) * natoms],
            scratch,
        )?;
        write_marker(file, endian, len)?;
    }
    Ok(())
}
