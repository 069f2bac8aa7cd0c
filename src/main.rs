//! Inspect and filter dcd trajectories.
use std::fs::File;
use std::io::{BufWriter, Write};
use std::num::{NonZeroU64, ParseIntError};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::{ArgAction, Parser};
use dcdio::{
    AtomSelection, DcdReader, DcdWriter, Flags, FrameSelection, Header, NewHeader, Range, Result,
};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

fn frame_selection_parser(selection: &str) -> std::result::Result<FrameSelection, ParseIntError> {
    let mut components = selection.split(':');
    let start = components
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| s.parse())
        .transpose()?;
    let end = components
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| s.parse())
        .transpose()?;
    let step = components
        .next()
        .filter(|s| !s.is_empty())
        .map(NonZeroU64::from_str)
        .transpose()?;
    Ok(FrameSelection::Range(Range::new(start, end, step)))
}

fn atom_selection_parser(selection: &str) -> std::result::Result<AtomSelection, ParseIntError> {
    let until: u32 = selection.parse()?;
    Ok(AtomSelection::Until(until))
}

/// Summarize a dcd trajectory, or write a filtered copy of it.
///
/// Without an output path, a summary of the header is printed.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// Input path (dcd).
    input: PathBuf,

    /// Output path (dcd).
    output: Option<PathBuf>,

    /// Frame selection in the format `start:stop:step`. Each of these values is optional.
    ///
    /// - `:100` will select the first 100 frames.
    ///
    /// - `3:14` will select the 4th up to and including the 14th frames, 11 frames in total.
    ///
    /// - `:100:2` will select every second frame from the first 100 frames, 50 in total.
    #[arg(short, long, value_parser=frame_selection_parser)]
    frame_selection: Option<FrameSelection>,

    /// Atom selection single `stop` value.
    ///
    /// - `1312` selects the first 1312 atoms.
    #[arg(short, long, value_parser=atom_selection_parser)]
    atom_selection: Option<AtomSelection>,

    /// Write the trajectory in reverse.
    ///
    /// Selection functions the same regardless of whether this flag is set.
    #[arg(long)]
    reverse: bool,

    /// Print the step number for the selected frames to standard output.
    #[arg(long)]
    steps: bool,

    /// Log more. Can be repeated up to three times.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Log nothing at all.
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn setup_logging(verbosity: u8, quiet: bool) {
    let level_filter = if quiet {
        LevelFilter::OFF
    } else {
        match verbosity {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(level_filter)
        .with(stderr_layer)
        .init();
}

fn main() {
    let args = Args::parse();
    setup_logging(args.verbose, args.quiet);

    if let Err(err) = run(args) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut reader = DcdReader::open(&args.input)?;
    let frame_selection = args.frame_selection.unwrap_or_default();
    let atom_selection = args.atom_selection.unwrap_or_default();
    let indices = selected_frames(reader.nframes(), &frame_selection, args.reverse);

    if args.steps {
        let header = reader.header();
        let mut stdout = std::io::stdout().lock();
        for &idx in &indices {
            let step = i64::from(header.first_step) + idx as i64 * i64::from(header.save_interval);
            writeln!(stdout, "{step}")?;
        }
        return Ok(());
    }

    match args.output {
        Some(output) => {
            let header = output_header(
                reader.header(),
                &frame_selection,
                &atom_selection,
                args.reverse,
            );
            filter_frames(&mut reader, &output, &header, &indices, &atom_selection)
        }
        None => summarize(&args.input, &reader),
    }
}

/// The indices of the selected frames, in the order they are to be written.
fn selected_frames(nframes: u64, frame_selection: &FrameSelection, reversed: bool) -> Vec<u64> {
    let mut indices: Vec<u64> = (0..nframes)
        .map_while(|idx| frame_selection.is_included(idx as usize).map(|inc| (idx, inc)))
        .filter_map(|(idx, included)| included.then_some(idx))
        .collect();
    if reversed {
        indices.reverse();
    }
    indices
}

/// Describe the filtered trajectory. A forward range keeps the step numbers of the frames intact.
fn output_header(
    header: &Header,
    frame_selection: &FrameSelection,
    atom_selection: &AtomSelection,
    reversed: bool,
) -> NewHeader {
    let natoms = (0..header.natoms as usize)
        .map_while(|idx| atom_selection.is_included(idx))
        .filter(|&included| included)
        .count() as u32;

    let (first_step, save_interval) = match frame_selection {
        FrameSelection::Range(range) if !reversed => (
            header
                .first_step
                .wrapping_add((range.start as i32).wrapping_mul(header.save_interval)),
            header.save_interval.wrapping_mul(range.step.get() as i32),
        ),
        _ => (header.first_step, header.save_interval),
    };

    NewHeader {
        natoms,
        first_step,
        save_interval,
        timestep: header.timestep,
        flags: if header.is_charmm() {
            Flags::IS_CHARMM
        } else {
            Flags::NONE
        },
        remarks: header.remarks.clone().into_bytes(),
    }
}

fn filter_frames(
    reader: &mut DcdReader<File>,
    output: &Path,
    header: &NewHeader,
    indices: &[u64],
    atom_selection: &AtomSelection,
) -> Result<()> {
    let file = BufWriter::new(File::create(output)?);
    let mut writer = DcdWriter::with_endian(file, reader.header().endian);
    writer.write_header(header)?;

    for &idx in indices {
        reader.seek(idx)?;
        let Some(frame) = reader.read()? else {
            break;
        };
        writer.write_frame(&frame.select(atom_selection))?;
    }
    writer.flush()?;

    info!(
        nframes = writer.tell(),
        natoms = header.natoms,
        output = %output.display(),
        "wrote filtered trajectory"
    );
    Ok(())
}

fn summarize(path: &Path, reader: &DcdReader<File>) -> Result<()> {
    let header = reader.header();
    let geometry = reader.geometry();
    let mut stdout = std::io::stdout().lock();

    let format = if header.is_charmm() { "CHARMM" } else { "X-PLOR" };
    writeln!(stdout, "file:          {}", path.display())?;
    writeln!(stdout, "format:        {format}, {:?} endian", header.endian)?;
    writeln!(
        stdout,
        "atoms:         {} ({} fixed)",
        header.natoms, header.nfixed
    )?;
    writeln!(
        stdout,
        "frames:        {} ({} declared)",
        reader.nframes(),
        header.nsets
    )?;
    writeln!(stdout, "first step:    {}", header.first_step)?;
    writeln!(stdout, "save interval: {}", header.save_interval)?;
    writeln!(stdout, "timestep:      {}", header.timestep)?;
    writeln!(stdout, "dimensions:    {}", header.dims())?;
    writeln!(stdout, "periodic:      {}", reader.is_periodic())?;
    writeln!(
        stdout,
        "frame size:    {} bytes ({} bytes for the first frame)",
        geometry.frame_size, geometry.first_frame_size
    )?;
    if header.flags.contains(Flags::HAS_64BIT_REC) {
        writeln!(stdout, "markers:       64-bit")?;
    }
    if !header.remarks.is_empty() {
        writeln!(stdout, "remarks:       {}", header.remarks)?;
    }
    Ok(())
}
