use tracing::{debug, warn};

use crate::header::Header;

/// Size of the six doubles in a unit cell record.
const UNIT_CELL_LEN: u64 = 48;

/// The byte layout of a dcd file, derived from its [`Header`] and its total size.
///
/// Every frame after the first has the same size, so the offset of any frame follows from these
/// values without ever scanning the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Bytes up to the first frame.
    pub header_size: u64,
    /// Size of the first frame, which always holds every atom.
    pub first_frame_size: u64,
    /// Size of every subsequent frame, which only holds the free atoms.
    pub frame_size: u64,
    /// The number of frames the file size allows for.
    pub nframes: u64,
    /// Bytes left over after the last whole frame.
    pub remainder: u64,
}

impl Geometry {
    pub fn new(header: &Header, header_size: u64, file_size: u64) -> Self {
        let dims = header.dims() as u64;
        let marker = header.marker_width();
        let extra = if header.has_unit_cell() {
            UNIT_CELL_LEN + 2 * marker
        } else {
            0
        };
        // Each coordinate record is bracketed by two markers.
        let record = |natoms: u64| natoms * 4 + 2 * marker;
        let first_frame_size = dims * record(header.natoms as u64) + extra;
        let frame_size = dims * record(header.nfree() as u64) + extra;

        let (nframes, remainder) = match file_size.checked_sub(header_size + first_frame_size) {
            Some(rest) => (rest / frame_size + 1, rest % frame_size),
            None => (0, file_size.saturating_sub(header_size)),
        };
        if remainder != 0 {
            warn!(
                file_size,
                remainder,
                nframes,
                "file size is not a whole number of frames, ignoring the trailing bytes"
            );
        }

        let geometry = Self {
            header_size,
            first_frame_size,
            frame_size,
            nframes,
            remainder,
        };
        debug!(?geometry, "determined trajectory geometry");
        geometry
    }

    /// The byte offset at which the frame at `index` starts.
    pub fn offset(&self, index: u64) -> u64 {
        match index {
            0 => self.header_size,
            _ => self.header_size + self.first_frame_size + self.frame_size * (index - 1),
        }
    }
}
