mod error;
mod report;
mod wav;

use clap::{Args, Parser, Subcommand};
use crate::error::Result;
use report::RecordReport;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tapecodec_core::demod::measure_frequency;
use tapecodec_core::{
    BandPass, CancelToken, CodecError, DecodeOptions, Decoder, EncodeOptions, Encoder, Family,
    Record,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tapecodec")]
#[command(about = "Save and load calculator programs over the cassette interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct IoArgs {
    /// Input file (stdin when omitted)
    #[arg(short, long, value_name = "FILE")]
    input: Option<PathBuf>,

    /// Output file (stdout when omitted)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Read/write raw record bytes instead of the JSON report
    #[arg(short, long)]
    binary: bool,

    /// Gain in dB applied to the signal
    #[arg(long, value_name = "DB", allow_negative_numbers = true)]
    gain: Option<f32>,
}

#[derive(Subcommand)]
enum Commands {
    /// The calculator is saving: decode its audio into a record
    Save {
        /// Calculator family: kcs, fx502p, pc1211
        protocol: Family,

        #[command(flatten)]
        io: IoArgs,

        /// Band-pass the input before demodulation, e.g. 600:5000
        #[arg(long, value_name = "LOW:HIGH")]
        band_pass: Option<BandPass>,
    },

    /// The calculator is loading: encode a record into audio
    Load {
        /// Calculator family: kcs, fx502p, pc1211
        protocol: Family,

        #[command(flatten)]
        io: IoArgs,
    },

    /// Measure the base frequency of a recording
    Analyze {
        /// Input WAV file (raw PCM on stdin when omitted)
        #[arg(short, long, value_name = "FILE")]
        input: Option<PathBuf>,

        /// Gain in dB applied to the signal
        #[arg(long, value_name = "DB", allow_negative_numbers = true)]
        gain: Option<f32>,

        /// Seconds to skip before measuring
        #[arg(long, default_value = "0.0")]
        skip: f32,

        /// Seconds to measure
        #[arg(long, default_value = "0.5")]
        seconds: f32,
    },
}

/// How a successful run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Clean,
    Diagnostics,
    Interrupted,
}

impl Outcome {
    fn exit_code(self) -> ExitCode {
        match self {
            Outcome::Clean => ExitCode::SUCCESS,
            Outcome::Diagnostics => ExitCode::from(2),
            Outcome::Interrupted => ExitCode::from(130),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancelToken::new();
    let worker = cancel.clone();
    let mut task = tokio::task::spawn_blocking(move || run(cli.command, &worker));

    let finished = tokio::select! {
        joined = &mut task => Some(joined),
        _ = tokio::signal::ctrl_c() => None,
    };
    let joined = match finished {
        Some(joined) => joined,
        None => {
            warn!("Interrupted, finishing up");
            cancel.cancel();
            task.await
        }
    };

    match joined {
        Ok(Ok(outcome)) => outcome.exit_code(),
        Ok(Err(e)) if e.is_interrupted() => Outcome::Interrupted.exit_code(),
        Ok(Err(e)) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Worker failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands, cancel: &CancelToken) -> Result<Outcome> {
    match command {
        Commands::Save {
            protocol,
            io,
            band_pass,
        } => save_command(protocol, &io, band_pass, cancel),
        Commands::Load { protocol, io } => load_command(protocol, &io, cancel),
        Commands::Analyze {
            input,
            gain,
            skip,
            seconds,
        } => analyze_command(input.as_deref(), gain, skip, seconds),
    }
}

fn open_output(path: Option<&Path>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(io::stdout().lock()),
    })
}

fn save_command(
    family: Family,
    args: &IoArgs,
    band_pass: Option<BandPass>,
    cancel: &CancelToken,
) -> Result<Outcome> {
    let options = DecodeOptions {
        gain_db: args.gain,
        band_pass,
        ..Default::default()
    };
    let decoder = Decoder::with_options(family, options)?;
    let source = wav::open_source(args.input.as_deref())?;

    let report = decoder.decode_stream(source, cancel)?;
    info!(
        "Decoded {} {} byte(s), {} damaged",
        report.record.len(),
        report.record.kind.name(),
        report.record.damaged()
    );
    for issue in &report.issues {
        warn!("{}", issue);
    }

    let mut output = open_output(args.output.as_deref())?;
    if args.binary {
        output.write_all(&report::binary_bytes(&report.record))?;
    } else {
        RecordReport::from_decode(family, &report).write_to(&mut output)?;
        writeln!(output)?;
    }
    output.flush()?;

    Ok(if report.interrupted {
        Outcome::Interrupted
    } else if report.issues.is_empty() {
        Outcome::Clean
    } else {
        Outcome::Diagnostics
    })
}

fn read_record(family: Family, args: &IoArgs) -> Result<Record> {
    let mut input: Box<dyn Read> = match args.input.as_deref() {
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
        None => Box::new(io::stdin().lock()),
    };
    if args.binary {
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes)?;
        info!("Read {} byte(s)", bytes.len());
        Ok(Record::raw(&bytes))
    } else {
        RecordReport::read_from(input)?.to_record(family)
    }
}

fn load_command(family: Family, args: &IoArgs, cancel: &CancelToken) -> Result<Outcome> {
    let options = EncodeOptions {
        gain_db: args.gain,
        ..Default::default()
    };
    let encoder = Encoder::with_options(family, options)?;
    let record = read_record(family, args)?;

    let mut sink = wav::open_sink(args.output.as_deref())?;
    match encoder.encode_to(&record, sink.as_mut(), cancel) {
        Ok(()) => {
            info!("Encoded {} byte(s) for {}", record.len(), family);
            Ok(Outcome::Clean)
        }
        Err(CodecError::Interrupted) => Ok(Outcome::Interrupted),
        Err(e) => Err(e.into()),
    }
}

fn analyze_command(
    input: Option<&Path>,
    gain: Option<f32>,
    skip: f32,
    seconds: f32,
) -> Result<Outcome> {
    let options = DecodeOptions {
        gain_db: gain,
        ..Default::default()
    };
    options.validate()?;
    let source = wav::open_source(input)?;
    let frequency = measure_frequency(source, &options, skip, seconds)?;
    println!("{:.1} Hz", frequency);
    Ok(Outcome::Clean)
}
