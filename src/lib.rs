//! Random-access reading and writing of dcd trajectories.
//!
//! Dcd files are written by CHARMM, NAMD, X-PLOR, OpenMM and friends. Frames are never indexed
//! on disk, but every frame after the first has the same size, so any frame can be reached with a
//! single seek once the header is known.
//!
//! ```no_run
//! use dcdio::{DcdFile, Mode};
//!
//! let mut file = DcdFile::open("traj.dcd", Mode::Read)?;
//! file.seek(10)?;
//! if let Some(frame) = file.read()? {
//!     println!("{:?}", frame.position(0));
//! }
//! # Ok::<(), dcdio::DcdError>(())
//! ```
pub use crate::error::{DcdError, Result};
pub use crate::file::{DcdFile, Frames, Mode};
pub use crate::frame::{Frame, UnitCell};
pub use crate::geometry::Geometry;
pub use crate::header::{Endian, Flags, Header, NewHeader, MAX_REMARKS_LEN};
pub use crate::reader::DcdReader;
pub use crate::selection::{AtomSelection, FrameSelection, Range};
pub use crate::writer::DcdWriter;

mod error;
mod file;
mod frame;
mod geometry;
pub mod header;
pub mod reader;
pub mod selection;
pub mod writer;
