use std::num::NonZeroU64;

/// A selection of atoms.
///
/// Atoms that lie beyond the end of a selection are never part of it, so a selection may be
/// shorter than the frames it is applied to.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum AtomSelection {
    /// Include all atoms.
    #[default]
    All,
    /// A mask of the atoms to include in the selection.
    ///
    /// If the value of the mask at an index `n` is `true`, the atom at that same index `n` is
    /// included in the selection.
    Mask(Vec<bool>),
    /// Include the first `n` atoms.
    ///
    /// This is an exclusive stop value, such that a value of 8 will select atoms 0 through 7.
    Until(u32),
}

impl AtomSelection {
    /// Create a boolean mask from a list of 0-based indices.
    pub fn from_index_list(indices: &[u32]) -> Self {
        let max = match indices.iter().max() {
            Some(&max) => max as usize + 1,
            None => return Self::Mask(Vec::new()),
        };
        let mut mask = vec![false; max];
        for &idx in indices {
            mask[idx as usize] = true;
        }
        Self::Mask(mask)
    }

    /// Determine whether some index `idx` is included in this [`AtomSelection`].
    ///
    /// Will return [`None`] once the index is beyond the scope of this `AtomSelection`.
    pub fn is_included(&self, idx: usize) -> Option<bool> {
        match self {
            AtomSelection::All => Some(true),
            AtomSelection::Mask(mask) => mask.get(idx).copied(),
            AtomSelection::Until(until) => (idx < *until as usize).then_some(true),
        }
    }
}

/// A selection of [`Frame`](crate::Frame)s.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum FrameSelection {
    /// Include all frames that are in a trajectory.
    #[default]
    All,
    /// Include frames that lie within a certain [`Range`].
    Range(Range),
    /// Include frames that match the indices in this list.
    ///
    /// The indices are expected to be sorted in ascending order.
    FrameList(Vec<usize>),
}

impl FrameSelection {
    /// Determine whether some index `idx` is included in this [`FrameSelection`].
    ///
    /// Will return [`None`] once the index is beyond the scope of this `FrameSelection`.
    pub fn is_included(&self, idx: usize) -> Option<bool> {
        match self {
            FrameSelection::All => Some(true),
            FrameSelection::Range(range) => range.is_included(idx as u64),
            FrameSelection::FrameList(indices) => {
                if *indices.last()? < idx {
                    None
                } else {
                    Some(indices.binary_search(&idx).is_ok())
                }
            }
        }
    }
}

/// A strided range of frames to be read from a [`DcdReader`](crate::DcdReader).
///
/// The `start` is always bounded, and is zero by default. The `end` may be bounded or unbounded.
/// When it is unbounded ([`None`]), the range runs up to and including the last frame.
/// Every `step`-th frame counting from `start` is included, so `step - 1` frames are skipped
/// after each included one.
///
/// # Note
///
/// A range where `start` > `end` is valid, but it selects no frames at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: u64,
    /// Exclusive bound, if any.
    pub end: Option<u64>,
    pub step: NonZeroU64,
}

impl Range {
    pub fn new(start: Option<u64>, end: Option<u64>, step: Option<NonZeroU64>) -> Self {
        let mut sel = Self {
            end,
            ..Self::default()
        };
        if let Some(start) = start {
            sel.start = start;
        }
        if let Some(step) = step {
            sel.step = step;
        }
        sel
    }

    fn is_included(&self, idx: u64) -> Option<bool> {
        if let Some(end) = self.end {
            // Determine whether `idx` is already beyond the defined range.
            if end <= idx {
                return None;
            }
        }
        let in_range = self.start <= idx;
        let in_step = in_range && (idx - self.start) % self.step == 0;
        Some(in_step)
    }
}

impl Default for Range {
    fn default() -> Self {
        Self {
            start: 0,
            end: None,
            step: NonZeroU64::MIN,
        }
    }
}
