//! Command line options.

use pulsar_core::constants::DEFAULT_FRAMES_IN_FLIGHT;

const MIB: u64 = 1024 * 1024;

/// Options of a bench run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchArgs {
    /// Frames to submit.
    pub frames: u64,
    /// Frames in flight at start.
    pub frames_in_flight: usize,
    /// Frames in flight after the halfway point, if it should change.
    pub resize_to: Option<usize>,
    /// Device-memory page size in bytes.
    pub page_size: u64,
    /// Per-frame staging size in bytes.
    pub staging_size: u64,
}

impl Default for BenchArgs {
    fn default() -> Self {
        Self {
            frames: 240,
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            resize_to: None,
            page_size: 64 * MIB,
            staging_size: 4 * MIB,
        }
    }
}

impl BenchArgs {
    /// Parse options from the process arguments.
    pub fn from_args() -> Self {
        Self::parse(std::env::args().skip(1))
    }

    /// Parse options, keeping defaults for anything missing or malformed.
    pub fn parse(args: impl IntoIterator<Item = String>) -> Self {
        let mut parsed = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let value = match arg.as_str() {
                "--frames" | "--frames-in-flight" | "--resize-to" | "--page-mib" | "--staging-mib" => {
                    args.next()
                }
                _ => None,
            };
            let Some(value) = value else {
                continue;
            };
            match arg.as_str() {
                "--frames" => {
                    if let Ok(v) = value.parse() {
                        parsed.frames = v;
                    }
                }
                "--frames-in-flight" => {
                    if let Ok(v) = value.parse() {
                        parsed.frames_in_flight = v;
                    }
                }
                "--resize-to" => parsed.resize_to = value.parse().ok(),
                "--page-mib" => {
                    if let Ok(v) = value.parse::<u64>() {
                        parsed.page_size = v * MIB;
                    }
                }
                "--staging-mib" => {
                    if let Ok(v) = value.parse::<u64>() {
                        parsed.staging_size = v * MIB;
                    }
                }
                _ => {}
            }
        }
        parsed
    }
}

pub fn print_help() {
    eprintln!(
        "Pulsar frame pipeline bench

Runs a transfer -> draw -> post graph on the headless driver and reports
scheduler and allocator statistics.

USAGE:
    cargo run -p pulsar-bench -- [OPTIONS]

OPTIONS:
    --frames <N>            Frames to submit (default: 240)
    --frames-in-flight <N>  Frames in flight (default: {DEFAULT_FRAMES_IN_FLIGHT})
    --resize-to <N>         Change frames in flight halfway through
    --page-mib <N>          Device-memory page size in MiB (default: 64)
    --staging-mib <N>       Per-frame staging size in MiB (default: 4)
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}
