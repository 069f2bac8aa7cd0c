#![allow(dead_code)]
//! Hand-rolled dcd files, assembled byte by byte without going through `DcdWriter`.
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Serializes numbers and Fortran records in a chosen byte order and marker width.
struct Raw {
    buf: Vec<u8>,
    big: bool,
    wide: bool,
}

impl Raw {
    fn new(big: bool, wide: bool) -> Self {
        Self {
            buf: Vec::new(),
            big,
            wide,
        }
    }

    fn i32(&mut self, value: i32) {
        let bytes = if self.big {
            value.to_be_bytes()
        } else {
            value.to_le_bytes()
        };
        self.buf.extend_from_slice(&bytes);
    }

    fn f32(&mut self, value: f32) {
        self.i32(value.to_bits() as i32);
    }

    fn f64(&mut self, value: f64) {
        let bytes = if self.big {
            value.to_be_bytes()
        } else {
            value.to_le_bytes()
        };
        self.buf.extend_from_slice(&bytes);
    }

    fn marker(&mut self, len: usize) {
        if self.wide {
            let len = len as u64;
            let bytes = if self.big {
                len.to_be_bytes()
            } else {
                len.to_le_bytes()
            };
            self.buf.extend_from_slice(&bytes);
        } else {
            self.i32(len as i32);
        }
    }

    /// Brackets whatever `body` writes with record markers.
    fn record(&mut self, body: impl FnOnce(&mut Raw)) {
        let mut inner = Raw::new(self.big, self.wide);
        body(&mut inner);
        self.marker(inner.buf.len());
        self.buf.extend_from_slice(&inner.buf);
        self.marker(inner.buf.len());
    }
}

/// A description of a dcd file with predictable contents.
///
/// The coordinate of atom `a` along axis `x` in frame `f` is `f * 100000 + x * 10000 + a`, except
/// for fixed atoms, which keep their values from frame 0.
#[derive(Debug, Clone)]
pub struct Dcd {
    pub natoms: u32,
    pub nframes: usize,
    pub big_endian: bool,
    pub wide_markers: bool,
    pub charmm: bool,
    pub extra_block: bool,
    pub four_dims: bool,
    /// The 1-based indices of the free atoms. Every atom is free if this is [`None`].
    pub free: Option<Vec<u32>>,
    pub first_step: i32,
    pub save_interval: i32,
    pub timestep: f64,
    pub title: Vec<&'static str>,
    /// The value written to the NTITLE count, the number of title lines if [`None`].
    pub ntitle: Option<i32>,
    /// The value written to the NSET word.
    pub nsets: i32,
    /// Size of the extra block record. Anything other than 48 is filled with zeros.
    pub extra_block_len: usize,
}

impl Dcd {
    /// A CHARMM file with unit cells, as NAMD writes them.
    pub fn charmm(natoms: u32, nframes: usize) -> Self {
        Self {
            natoms,
            nframes,
            big_endian: cfg!(target_endian = "big"),
            wide_markers: false,
            charmm: true,
            extra_block: true,
            four_dims: false,
            free: None,
            first_step: 1000,
            save_interval: 50,
            timestep: 0.5,
            title: vec!["REMARKS FILENAME=test.dcd CREATED BY A TEST", "REMARKS DATE: never"],
            ntitle: None,
            nsets: nframes as i32,
            extra_block_len: 48,
        }
    }

    pub fn xplor(natoms: u32, nframes: usize) -> Self {
        Self {
            charmm: false,
            extra_block: false,
            timestep: 0.002,
            ..Self::charmm(natoms, nframes)
        }
    }

    /// Fix the last `nfixed` atoms in place.
    pub fn with_fixed(mut self, nfixed: u32) -> Self {
        self.free = Some((1..=self.natoms - nfixed).collect());
        self
    }

    pub fn dims(&self) -> usize {
        if self.charmm && self.four_dims {
            4
        } else {
            3
        }
    }

    pub fn is_periodic(&self) -> bool {
        self.charmm && self.extra_block
    }

    pub fn nfixed(&self) -> u32 {
        self.free
            .as_ref()
            .map_or(0, |free| self.natoms - free.len() as u32)
    }

    fn is_free(&self, atom: usize) -> bool {
        match &self.free {
            Some(free) => free.contains(&(atom as u32 + 1)),
            None => true,
        }
    }

    pub fn coordinate(&self, frame: usize, axis: usize, atom: usize) -> f32 {
        let frame = if self.is_free(atom) { frame } else { 0 };
        (frame * 100000 + axis * 10000 + atom) as f32
    }

    /// The column-major positions a reader should produce for `frame`.
    pub fn positions(&self, frame: usize) -> Vec<f32> {
        let natoms = self.natoms as usize;
        (0..self.dims())
            .flat_map(|axis| (0..natoms).map(move |atom| (axis, atom)))
            .map(|(axis, atom)| self.coordinate(frame, axis, atom))
            .collect()
    }

    /// The unit cell a reader should produce for `frame`, in on-disk order.
    pub fn unit_cell(&self, frame: usize) -> [f64; 6] {
        if self.is_periodic() {
            [10.0 + frame as f64, 90.0, 20.0, 80.0, 70.0, 30.0]
        } else {
            [0.0, 90.0, 0.0, 90.0, 90.0, 0.0]
        }
    }

    fn write_header(&self, raw: &mut Raw) {
        let mut words = Raw::new(self.big_endian, false);
        words.i32(self.nsets);
        words.i32(self.first_step);
        words.i32(self.save_interval);
        words.i32(self.first_step + self.save_interval * self.nframes.saturating_sub(1) as i32);
        for _ in 4..8 {
            words.i32(0);
        }
        words.i32(self.nfixed() as i32);
        if self.charmm {
            words.f32(self.timestep as f32);
            words.i32(self.extra_block as i32);
            words.i32(self.four_dims as i32);
            for _ in 12..19 {
                words.i32(0);
            }
            words.i32(24);
        } else {
            words.f64(self.timestep);
            words.i32(0);
            for _ in 12..20 {
                words.i32(0);
            }
        }
        assert_eq!(words.buf.len(), 80);

        raw.record(|r| {
            r.buf.extend_from_slice(b"CORD");
            r.buf.extend_from_slice(&words.buf);
        });
        raw.record(|r| {
            r.i32(self.ntitle.unwrap_or(self.title.len() as i32));
            for line in &self.title {
                let mut bytes = [b' '; 80];
                bytes[..line.len()].copy_from_slice(line.as_bytes());
                r.buf.extend_from_slice(&bytes);
            }
        });
        raw.record(|r| r.i32(self.natoms as i32));
        if let Some(free) = &self.free {
            raw.record(|r| {
                for &idx in free {
                    r.i32(idx as i32);
                }
            });
        }
    }

    fn write_frame(&self, raw: &mut Raw, frame: usize) {
        if self.charmm && self.extra_block {
            raw.record(|r| {
                if self.extra_block_len == 48 {
                    for value in self.unit_cell(frame) {
                        r.f64(value);
                    }
                } else {
                    r.buf.resize(self.extra_block_len, 0);
                }
            });
        }
        let atoms: Vec<usize> = match &self.free {
            Some(free) if frame > 0 => free.iter().map(|&idx| idx as usize - 1).collect(),
            _ => (0..self.natoms as usize).collect(),
        };
        for axis in 0..self.dims() {
            raw.record(|r| {
                for &atom in &atoms {
                    r.f32(self.coordinate(frame, axis, atom));
                }
            });
        }
    }

    pub fn header_bytes(&self) -> Vec<u8> {
        let mut raw = Raw::new(self.big_endian, self.wide_markers);
        self.write_header(&mut raw);
        raw.buf
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut raw = Raw::new(self.big_endian, self.wide_markers);
        self.write_header(&mut raw);
        for frame in 0..self.nframes {
            self.write_frame(&mut raw, frame);
        }
        raw.buf
    }

    /// Writes the file into a fresh temporary directory.
    pub fn write(&self) -> Fixture {
        Fixture::new(&self.bytes())
    }
}

/// A file in a temporary directory, which is removed when this is dropped.
pub struct Fixture {
    pub path: PathBuf,
    _dir: TempDir,
}

impl Fixture {
    pub fn new(bytes: &[u8]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trajectory.dcd");
        std::fs::write(&path, bytes).unwrap();
        Self { path, _dir: dir }
    }

    /// A path next to the fixture that does not exist yet.
    pub fn sibling(&self, name: &str) -> PathBuf {
        self.path.with_file_name(name)
    }
}

impl AsRef<Path> for Fixture {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// The kinds of files that every reading test is run against.
pub mod trajectories {
    use super::Dcd;

    /// Ten atoms, five frames.
    pub fn charmm() -> Dcd {
        Dcd::charmm(10, 5)
    }

    pub fn xplor() -> Dcd {
        Dcd::xplor(10, 5)
    }

    pub fn swapped() -> Dcd {
        Dcd {
            big_endian: !cfg!(target_endian = "big"),
            ..Dcd::charmm(7, 4)
        }
    }

    pub fn wide() -> Dcd {
        Dcd {
            wide_markers: true,
            ..Dcd::charmm(6, 3)
        }
    }

    pub fn four_dims() -> Dcd {
        Dcd {
            four_dims: true,
            ..Dcd::charmm(5, 3)
        }
    }

    /// One hundred atoms of which twenty are fixed.
    pub fn fixed() -> Dcd {
        Dcd::charmm(100, 4).with_fixed(20)
    }

    pub fn fixed_xplor() -> Dcd {
        Dcd::xplor(12, 6).with_fixed(5)
    }

    pub fn empty() -> Dcd {
        Dcd::charmm(10, 0)
    }

    pub fn all() -> Vec<(&'static str, Dcd)> {
        vec![
            ("charmm", charmm()),
            ("xplor", xplor()),
            ("swapped", swapped()),
            ("wide", wide()),
            ("four_dims", four_dims()),
            ("fixed", fixed()),
            ("fixed_xplor", fixed_xplor()),
        ]
    }
}
