//! The dcd header block.
//!
//! A dcd file opens with three (sometimes four) Fortran unformatted records:
//!
//! 1. 84 bytes: the `CORD` magic followed by twenty 32-bit words of counts and flags.
//! 2. The title record: a line count followed by that many 80-byte remark lines.
//! 3. A single 32-bit atom count.
//! 4. Only when some atoms are fixed: the 1-based indices of the atoms that are *free*.
//!
//! Every record is bracketed by a marker holding its length in bytes. Markers are 4 bytes wide,
//! except in files written by CHARMM builds with 8-byte integers, where they are 8 bytes wide.
use std::io::{Read, Write};
use std::ops::{BitOr, BitOrAssign};

use tracing::{debug, warn};

use crate::error::{try_zeroed, DcdError, Result};
use crate::reader::{read_i32, read_marker};
use crate::writer::{write_i32, write_marker, write_u32};

pub const MAGIC: &[u8; 4] = b"CORD";

/// Length of the first header record: the magic and twenty words.
const INFO_RECORD_LEN: u64 = 84;
/// Length of a single remark line.
pub const TITLE_LINE_LEN: usize = 80;
/// The number of remark bytes a header can be written with.
pub const MAX_REMARKS_LEN: usize = 240;
/// The largest number of atoms a header can be written with.
pub const MAX_ATOMS: u32 = u32::MAX / 4;
/// The CHARMM version we claim to be when writing.
const CHARMM_VERSION: i32 = 24;

/// Byte offset of the NSET word, the number of frames in the file.
pub(crate) const NSET_OFFSET: u64 = 8;
/// Byte offset of the NSTEP word, the step of the last frame written.
pub(crate) const NSTEP_OFFSET: u64 = 20;

// Indices into the twenty words following the magic.
const WORD_NSET: usize = 0;
const WORD_ISTART: usize = 1;
const WORD_NSAVC: usize = 2;
const WORD_NAMNF: usize = 8;
const WORD_DELTA: usize = 9;
const WORD_EXTRA_BLOCK: usize = 10;
const WORD_4DIMS: usize = 11;
const WORD_VERSION: usize = 19;

/// Byte order of the numbers in a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    Little,
    Big,
}

macro_rules! endian_conversions {
    ($($decode:ident, $encode:ident => $t:ty;)*) => {
        impl Endian {
            $(
                #[inline]
                pub(crate) fn $decode(self, bytes: [u8; std::mem::size_of::<$t>()]) -> $t {
                    match self {
                        Endian::Little => <$t>::from_le_bytes(bytes),
                        Endian::Big => <$t>::from_be_bytes(bytes),
                    }
                }

                #[inline]
                pub(crate) fn $encode(self, value: $t) -> [u8; std::mem::size_of::<$t>()] {
                    match self {
                        Endian::Little => value.to_le_bytes(),
                        Endian::Big => value.to_be_bytes(),
                    }
                }
            )*
        }
    };
}

endian_conversions! {
    decode_i32, encode_i32 => i32;
    decode_u32, encode_u32 => u32;
    decode_u64, encode_u64 => u64;
    decode_f32, encode_f32 => f32;
    decode_f64, encode_f64 => f64;
}

impl Endian {
    /// The byte order of the host.
    pub const NATIVE: Self = if cfg!(target_endian = "big") {
        Self::Big
    } else {
        Self::Little
    };
}

/// Layout flags of a dcd file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    /// A plain X-PLOR file.
    pub const NONE: Self = Self(0x00);
    /// Written by CHARMM or a program following its conventions (NAMD, OpenMM, ...).
    pub const IS_CHARMM: Self = Self(0x01);
    /// Every frame carries a fourth coordinate record.
    pub const HAS_4DIMS: Self = Self(0x02);
    /// Every frame is preceded by a unit cell record.
    pub const HAS_EXTRA_BLOCK: Self = Self(0x04);
    /// Record markers are 8 bytes wide.
    pub const HAS_64BIT_REC: Self = Self(0x08);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0
    }
}

/// The parsed header of a dcd file.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub natoms: u32,
    /// The number of frames the producer declared. Informational only, since many producers
    /// never update it.
    pub nsets: u32,
    /// Step of the first frame (ISTART).
    pub first_step: i32,
    /// Number of steps between saved frames (NSAVC).
    pub save_interval: i32,
    /// Integration time step (DELTA) in the producer's units.
    pub timestep: f64,
    /// Number of atoms stored only in the first frame (NAMNF).
    pub nfixed: u32,
    /// The 1-based indices of the atoms that are not fixed, `natoms - nfixed` of them.
    ///
    /// Empty if no atoms are fixed.
    pub free_indices: Vec<u32>,
    /// Title lines, with anything but printable ascii removed.
    pub remarks: String,
    pub flags: Flags,
    /// Byte order of the file.
    pub endian: Endian,
}

impl Header {
    /// Parses a header from the start of `file`.
    ///
    /// On success, `file` is positioned at the first byte of the first frame.
    pub fn read<R: Read>(file: &mut R) -> Result<Self> {
        let mut lead = [0; 8];
        file.read_exact(&mut lead)?;
        let (endian, wide) = detect_layout(lead)?;
        if wide {
            let mut magic = [0; 4];
            file.read_exact(&mut magic)?;
            if &magic != MAGIC {
                return Err(corrupt("missing CORD magic after 64-bit record marker"));
            }
        }

        let mut words = [0; 80];
        file.read_exact(&mut words)?;
        let word = |idx: usize| endian.decode_i32(word_bytes(&words, idx));

        let mut flags = Flags::NONE;
        // X-PLOR leaves the last word unused. CHARMM puts its version number there.
        let is_charmm = word(WORD_VERSION) != 0;
        if is_charmm {
            flags |= Flags::IS_CHARMM;
            if word(WORD_EXTRA_BLOCK) != 0 {
                flags |= Flags::HAS_EXTRA_BLOCK;
            }
            if word(WORD_4DIMS) == 1 {
                flags |= Flags::HAS_4DIMS;
            }
        }
        if wide {
            flags |= Flags::HAS_64BIT_REC;
        }

        let timestep = if is_charmm {
            endian.decode_f32(word_bytes(&words, WORD_DELTA)) as f64
        } else {
            // X-PLOR stores a double across two words.
            let start = WORD_DELTA * 4;
            let mut bytes = [0; 8];
            bytes.copy_from_slice(&words[start..start + 8]);
            endian.decode_f64(bytes)
        };

        let end = read_marker(file, endian, wide)?;
        if end != INFO_RECORD_LEN {
            return Err(corrupt(format!(
                "first record ends with marker {end}, expected {INFO_RECORD_LEN}"
            )));
        }

        let remarks = read_title(file, endian, wide)?;

        expect_marker(file, endian, wide, 4, "atom count")?;
        let natoms = read_i32(file, endian)?;
        expect_marker(file, endian, wide, 4, "atom count")?;
        let natoms: u32 = natoms
            .try_into()
            .map_err(|_| corrupt(format!("negative atom count {natoms}")))?;

        let nfixed = word(WORD_NAMNF);
        let nfixed: u32 = match nfixed.try_into() {
            Ok(n) if n <= natoms => n,
            _ => {
                return Err(corrupt(format!(
                    "invalid number of fixed atoms {nfixed} for {natoms} atoms"
                )))
            }
        };

        let free_indices = if nfixed > 0 {
            read_free_indices(file, endian, wide, natoms, nfixed)?
        } else {
            Vec::new()
        };

        let header = Self {
            natoms,
            nsets: u32::try_from(word(WORD_NSET)).unwrap_or_default(),
            first_step: word(WORD_ISTART),
            save_interval: word(WORD_NSAVC),
            timestep,
            nfixed,
            free_indices,
            remarks,
            flags,
            endian,
        };
        debug!(
            natoms = header.natoms,
            nfixed = header.nfixed,
            nsets = header.nsets,
            flags = header.flags.bits(),
            endian = ?header.endian,
            "parsed dcd header"
        );
        Ok(header)
    }

    /// The number of coordinate records per frame, 3 or 4.
    pub fn dims(&self) -> usize {
        if self.flags.contains(Flags::HAS_4DIMS) {
            4
        } else {
            3
        }
    }

    /// The number of atoms that are stored in every frame.
    pub fn nfree(&self) -> u32 {
        self.natoms - self.nfixed
    }

    /// Width of a record marker in bytes.
    pub fn marker_width(&self) -> u64 {
        if self.flags.contains(Flags::HAS_64BIT_REC) {
            8
        } else {
            4
        }
    }

    pub fn is_charmm(&self) -> bool {
        self.flags.contains(Flags::IS_CHARMM)
    }

    /// Whether the frames carry a unit cell record that is read.
    pub fn has_unit_cell(&self) -> bool {
        self.flags.contains(Flags::IS_CHARMM | Flags::HAS_EXTRA_BLOCK)
    }

    /// Periodic box information is only trustworthy for CHARMM files with an extra block.
    pub fn is_periodic(&self) -> bool {
        self.has_unit_cell()
    }

    /// Whether the file's byte order differs from the host's.
    pub fn byte_order_mismatch(&self) -> bool {
        self.endian != Endian::NATIVE
    }
}

/// The values a caller provides for a header that is about to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHeader {
    pub natoms: u32,
    pub first_step: i32,
    pub save_interval: i32,
    pub timestep: f64,
    /// Only [`Flags::IS_CHARMM`] is honoured. A CHARMM header always declares unit cells.
    pub flags: Flags,
    /// Raw remark bytes. Anything beyond [`MAX_REMARKS_LEN`] bytes is dropped.
    pub remarks: Vec<u8>,
}

impl NewHeader {
    /// A CHARMM header for `natoms` atoms, starting at step 0 and saving every step.
    pub fn new(natoms: u32) -> Self {
        Self {
            natoms,
            first_step: 0,
            save_interval: 1,
            timestep: 1.0,
            flags: Flags::IS_CHARMM,
            remarks: Vec::new(),
        }
    }

    pub fn with_remarks(mut self, remarks: impl Into<Vec<u8>>) -> Self {
        self.remarks = remarks.into();
        self
    }

    /// Serializes this header and returns the [`Header`] a reader would parse back from it.
    pub(crate) fn write<W: Write>(&self, file: &mut W, endian: Endian) -> Result<Header> {
        let is_charmm = self.flags.contains(Flags::IS_CHARMM);
        // A coordinate record holds 4 bytes per atom and its length must fit in a marker.
        if self.natoms > MAX_ATOMS {
            return Err(DcdError::TooLarge {
                what: "atom count",
                value: self.natoms as u64,
            });
        }
        if self.flags.contains(Flags::HAS_4DIMS) || self.flags.contains(Flags::HAS_64BIT_REC) {
            warn!(
                flags = self.flags.bits(),
                "4d records and 64-bit markers are not written, ignoring these flags"
            );
        }

        let mut remarks = self.remarks.as_slice();
        if remarks.len() > MAX_REMARKS_LEN {
            warn!(
                len = remarks.len(),
                "remarks are longer than {MAX_REMARKS_LEN} bytes and will be truncated"
            );
            remarks = &remarks[..MAX_REMARKS_LEN];
        }

        let mut words = [0; 80];
        set_word(&mut words, WORD_NSET, endian.encode_i32(0));
        set_word(&mut words, WORD_ISTART, endian.encode_i32(self.first_step));
        set_word(&mut words, WORD_NSAVC, endian.encode_i32(self.save_interval));
        if is_charmm {
            set_word(
                &mut words,
                WORD_DELTA,
                endian.encode_f32(self.timestep as f32),
            );
            set_word(&mut words, WORD_EXTRA_BLOCK, endian.encode_i32(1));
            set_word(&mut words, WORD_VERSION, endian.encode_i32(CHARMM_VERSION));
        } else {
            let start = WORD_DELTA * 4;
            words[start..start + 8].copy_from_slice(&endian.encode_f64(self.timestep));
        }

        write_marker(file, endian, INFO_RECORD_LEN as u32)?;
        file.write_all(MAGIC)?;
        file.write_all(&words)?;
        write_marker(file, endian, INFO_RECORD_LEN as u32)?;

        let nlines = usize::max(1, remarks.len().div_ceil(TITLE_LINE_LEN));
        let mut title = vec![b' '; nlines * TITLE_LINE_LEN];
        title[..remarks.len()].copy_from_slice(remarks);
        let title_len = (4 + title.len()) as u32;
        write_marker(file, endian, title_len)?;
        write_i32(file, endian, nlines as i32)?;
        file.write_all(&title)?;
        write_marker(file, endian, title_len)?;

        write_marker(file, endian, 4)?;
        write_u32(file, endian, self.natoms)?;
        write_marker(file, endian, 4)?;

        let flags = if is_charmm {
            Flags::IS_CHARMM | Flags::HAS_EXTRA_BLOCK
        } else {
            Flags::NONE
        };
        Ok(Header {
            natoms: self.natoms,
            nsets: 0,
            first_step: self.first_step,
            save_interval: self.save_interval,
            timestep: if is_charmm {
                self.timestep as f32 as f64
            } else {
                self.timestep
            },
            nfixed: 0,
            free_indices: Vec::new(),
            remarks: sanitize_remarks(remarks),
            flags,
            endian,
        })
    }
}

/// Determine the byte order and marker width from the first eight bytes of a file.
fn detect_layout(lead: [u8; 8]) -> Result<(Endian, bool)> {
    let [a, b, c, d, magic @ ..] = lead;
    for endian in [Endian::Little, Endian::Big] {
        if endian.decode_u32([a, b, c, d]) as u64 == INFO_RECORD_LEN && &magic == MAGIC {
            return Ok((endian, false));
        }
        if endian.decode_u64(lead) == INFO_RECORD_LEN {
            return Ok((endian, true));
        }
    }
    Err(corrupt(format!(
        "file does not start with a dcd header record (found {lead:02x?})"
    )))
}

fn read_title<R: Read>(file: &mut R, endian: Endian, wide: bool) -> Result<String> {
    let len = read_marker(file, endian, wide)?;
    if len < 4 || (len - 4) % TITLE_LINE_LEN as u64 != 0 {
        return Err(corrupt(format!("title record has invalid length {len}")));
    }
    let nlines = (len - 4) / TITLE_LINE_LEN as u64;
    let ntitle = read_i32(file, endian)?;
    if ntitle < 0 {
        return Err(corrupt(format!("negative number of title lines {ntitle}")));
    }
    if ntitle as u64 != nlines {
        warn!(
            ntitle,
            nlines, "title line count disagrees with the record length, trusting the record"
        );
    }

    let mut bytes: Vec<u8> = try_zeroed((len - 4) as usize)?;
    file.read_exact(&mut bytes)?;
    expect_marker(file, endian, wide, len, "title")?;
    Ok(sanitize_remarks(&bytes))
}

fn read_free_indices<R: Read>(
    file: &mut R,
    endian: Endian,
    wide: bool,
    natoms: u32,
    nfixed: u32,
) -> Result<Vec<u32>> {
    let nfree = (natoms - nfixed) as usize;
    let len = 4 * nfree as u64;
    expect_marker(file, endian, wide, len, "free atom index")?;
    let mut indices: Vec<u32> = try_zeroed(nfree)?;
    for index in indices.iter_mut() {
        let value = read_i32(file, endian)?;
        *index = match u32::try_from(value) {
            Ok(idx) if (1..=natoms).contains(&idx) => idx,
            _ => {
                return Err(corrupt(format!(
                    "free atom index {value} is outside 1..={natoms}"
                )))
            }
        };
    }
    expect_marker(file, endian, wide, len, "free atom index")?;
    Ok(indices)
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
        return Err(corrupt(format!(
            "{record} record marker is {found}, expected {expected}"
        )));
    }
    Ok(())
}

/// Keep only printable ascii and drop trailing padding.
pub(crate) fn sanitize_remarks(bytes: &[u8]) -> String {
    let printable: String = bytes
        .iter()
        .filter(|b| (0x20..=0x7e).contains(*b))
        .map(|&b| b as char)
        .collect();
    printable.trim_end().to_string()
}

fn word_bytes(words: &[u8; 80], idx: usize) -> [u8; 4] {
    let start = idx * 4;
    [
        words[start],
        words[start + 1],
        words[start + 2],
        words[start + 3],
    ]
}

fn set_word(words: &mut [u8; 80], idx: usize, bytes: [u8; 4]) {
    words[idx * 4..idx * 4 + 4].copy_from_slice(&bytes);
}

fn corrupt(msg: impl Into<String>) -> DcdError {
    DcdError::CorruptHeader(msg.into())
}
