//! Stream samples from a MiriSDR device to a file.
//!
//! The sample callback runs on the USB event thread, so it only copies data
//! into a channel; a writer thread drains it to the output.
//!
//! # Usage
//!
//! ```sh
//! # 10 MB of 504-format samples to a file
//! cargo run --example miri_rx -- -o samples.raw -n 10000000
//!
//! # 8-bit samples over isochronous transfers, to stdout
//! cargo run --example miri_rx -- --format 504_s8 --transfer iso -n 1000000 > samples.raw
//! ```
//!
//! # Output Format
//!
//! - Interleaved I/Q, signed, host byte order
//! - 16 bits per value, or 8 bits for the `504_s8` format

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::process;
use std::thread;
use std::time::Instant;

use clap::Parser;
use crossbeam::channel;
use rs_miri::{MiriSdr, SampleFormat, TransferKind, UsbTransport};

#[derive(Parser, Debug)]
#[command(author, version, about = "Record raw samples from a MiriSDR receiver", long_about = None)]
struct Args {
    /// Output file (default: stdout)
    #[arg(short, long)]
    output: Option<String>,

    /// Stop after this many bytes (default: stream until the process is killed,
    /// buffered output and the summary are then lost)
    #[arg(short = 'n', long)]
    bytes: Option<u64>,

    /// Sample format: 252, 336, 384, 504 or 504_s8
    #[arg(short, long, default_value = "504")]
    format: SampleFormat,

    /// USB transfer type: bulk or iso
    #[arg(short, long, default_value = "bulk")]
    transfer: TransferKind,

    /// Number of transfers kept in flight (0 for the default)
    #[arg(short, long, default_value_t = 0)]
    buffers: usize,

    /// Deliver fixed frames of this many bytes (0 for per-transfer delivery)
    #[arg(long, default_value_t = 0)]
    frame_size: usize,

    /// Device index
    #[arg(short, long, default_value_t = 0)]
    device_index: usize,

    /// List connected devices and exit
    #[arg(long, default_value_t = false)]
    list: bool,
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    if args.list {
        match UsbTransport::list_devices() {
            Ok(devices) if devices.is_empty() => eprintln!("No devices found"),
            Ok(devices) => {
                for (index, device) in devices.iter().enumerate() {
                    eprintln!("  {}: {}", index, device);
                }
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = run(&args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut sdr = MiriSdr::open(args.device_index)?;
    sdr.set_transfer_kind(args.transfer)?;
    let handle = sdr.handle();

    let output: Box<dyn Write + Send> = match &args.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout())),
    };

    let (tx, rx) = channel::bounded::<Vec<u8>>(64);

    let writer = thread::spawn(move || -> io::Result<u64> {
        let mut output = output;
        let mut written = 0u64;
        for chunk in rx {
            output.write_all(&chunk)?;
            written += chunk.len() as u64;
        }
        output.flush()?;
        Ok(written)
    });

    let limit = args.bytes;
    let mut received = 0u64;
    let start = Instant::now();

    sdr.start_session(args.format, args.buffers, args.frame_size, |data| {
        let remaining = limit.map_or(data.len() as u64, |l| l.saturating_sub(received));
        let take = remaining.min(data.len() as u64) as usize;
        received += take as u64;

        if tx.try_send(data[..take].to_vec()).is_err() {
            tracing::warn!("Writer is falling behind, dropped {} bytes", take);
        }

        if limit.is_some_and(|l| received >= l) {
            let _ = handle.cancel();
        }
    })?;

    drop(tx);
    let written = writer
        .join()
        .map_err(|_| "writer thread panicked")??;

    let elapsed = start.elapsed().as_secs_f64();
    let stats = sdr.stats();
    let samples = written / (2 * args.format.bytes_per_sample() as u64);
    eprintln!(
        "Wrote {} I/Q samples ({} bit, {} bytes) in {:.2}s ({:.2} MS/s), {} loss events, {} samples lost",
        samples,
        args.format.bits(),
        written,
        elapsed,
        samples as f64 / elapsed / 1e6,
        stats.loss_events,
        stats.lost_samples
    );

    sdr.close();
    Ok(())
}
