//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use folio_core::SourceProfile;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Download a paginated image set and assemble it into PDF chunks.
///
/// MANIFEST is a local `.json` manifest file or an http(s) URL serving one.
#[derive(Parser, Debug)]
#[command(name = "folio")]
#[command(author, version, about)]
pub struct Args {
    /// Manifest file or URL
    pub manifest: String,

    /// Directory for chunk PDFs and the resume ledger
    #[arg(short, long, default_value = ".")]
    pub output: PathBuf,

    /// JSON file of per-source profiles keyed by source name
    #[arg(long, value_name = "FILE")]
    pub profiles: Option<PathBuf>,

    /// Maximum concurrent requests (1-64); overrides the profile
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=64))]
    pub concurrency: Option<u8>,

    /// Attempts per request for transient failures (1-10); overrides the profile
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(1..=10))]
    pub retries: Option<u8>,

    /// Chunk size ceiling in MiB; overrides the profile
    #[arg(long = "chunk-mb", value_name = "MIB", value_parser = clap::value_parser!(u32).range(1..))]
    pub chunk_mb: Option<u32>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Args {
    /// Profile fields set on the command line.
    pub fn overrides(&self) -> SourceProfile {
        SourceProfile {
            concurrency: self.concurrency.map(usize::from),
            retry_limit: self.retries.map(u32::from),
            chunk_byte_ceiling: self.chunk_mb.map(|mb| f64::from(mb) * BYTES_PER_MIB),
            ..SourceProfile::default()
        }
    }

    /// Default log filter when `RUST_LOG` is unset.
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "error";
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_manifest_is_required() {
        let err = Args::try_parse_from(["folio"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_cli_defaults() {
        let args = Args::try_parse_from(["folio", "book.json"]).unwrap();
        assert_eq!(args.manifest, "book.json");
        assert_eq!(args.output, PathBuf::from("."));
        assert_eq!(args.log_level(), "info");
        assert_eq!(args.overrides(), SourceProfile::default());
    }

    #[test]
    fn test_cli_overrides_map_onto_profile() {
        let args = Args::try_parse_from([
            "folio", "book.json", "-c", "8", "-r", "5", "--chunk-mb", "10", "-o", "out",
        ])
        .unwrap();
        let overrides = args.overrides();
        assert_eq!(overrides.concurrency, Some(8));
        assert_eq!(overrides.retry_limit, Some(5));
        assert_eq!(overrides.chunk_byte_ceiling, Some(10.0 * BYTES_PER_MIB));
        assert_eq!(args.output, PathBuf::from("out"));
    }

    #[test]
    fn test_cli_verbosity_levels() {
        let args = Args::try_parse_from(["folio", "m.json", "-vv"]).unwrap();
        assert_eq!(args.log_level(), "trace");
        let args = Args::try_parse_from(["folio", "m.json", "-q"]).unwrap();
        assert_eq!(args.log_level(), "error");
    }

    #[test]
    fn test_cli_quiet_conflicts_with_verbose() {
        let err = Args::try_parse_from(["folio", "m.json", "-q", "-v"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_cli_concurrency_bounds() {
        let err = Args::try_parse_from(["folio", "m.json", "-c", "0"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
        let err = Args::try_parse_from(["folio", "m.json", "-c", "65"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_zero_chunk_size_rejected() {
        let err = Args::try_parse_from(["folio", "m.json", "--chunk-mb", "0"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }
}
