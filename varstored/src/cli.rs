//! Command-line surface (§6, §9's "Ambient stack" supplement): parsed with
//! `clap`'s builder-backed derive API, the way this codebase's other
//! host-side tools parse theirs.

use std::path::PathBuf;

use clap::Parser;
use sentinel::LogLevel;

/// UEFI non-volatile variable service for a single hardware-virtualized guest.
#[derive(Debug, Parser)]
#[command(name = "varstored", version)]
pub struct Cli {
    /// Domain identifier of the guest this process serves.
    #[arg(long)]
    pub domain: u32,

    /// Restore from a prior snapshot instead of initializing fresh.
    #[arg(long)]
    pub resume: bool,

    /// Hold the store in memory only; disable durable writes.
    #[arg(long)]
    pub nonpersistent: bool,

    /// Path to the exclusive-lock pidfile.
    #[arg(long)]
    pub pidfile: PathBuf,

    /// Durable storage backend to use (currently `xapidb`).
    #[arg(long)]
    pub backend: Option<String>,

    /// A `key:value` pair forwarded to the backend's `parse_arg`. May be
    /// repeated. Requires `--backend`.
    #[arg(long = "arg", value_parser = parse_key_value, requires = "backend")]
    pub args: Vec<(String, String)>,

    /// Raises the logging facade's minimum level: unset is Info, one flag
    /// is Debug, two or more is Trace.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn log_level(&self) -> LogLevel {
        match self.verbose {
            0 => LogLevel::Info,
            1 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once(':').map(|(k, v)| (k.to_string(), v.to_string())).ok_or_else(|| format!("expected key:value, got {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut full = vec!["varstored"];
        full.extend_from_slice(args);
        Cli::parse_from(full)
    }

    #[test]
    fn minimal_invocation_defaults_verbosity_to_info() {
        let cli = parse(&["--domain", "1", "--pidfile", "/tmp/v.pid"]);
        assert_eq!(cli.domain, 1);
        assert!(!cli.resume);
        assert_eq!(cli.log_level(), LogLevel::Info);
    }

    #[test]
    fn repeated_verbose_flags_escalate_to_trace() {
        let cli = parse(&["--domain", "1", "--pidfile", "/tmp/v.pid", "-vv"]);
        assert_eq!(cli.log_level(), LogLevel::Trace);
    }

    #[test]
    fn single_verbose_flag_raises_to_debug() {
        let cli = parse(&["--domain", "1", "--pidfile", "/tmp/v.pid", "-v"]);
        assert_eq!(cli.log_level(), LogLevel::Debug);
    }

    #[test]
    fn backend_args_are_collected_as_key_value_pairs() {
        let cli = parse(&["--domain", "1", "--pidfile", "/tmp/v.pid", "--backend", "xapidb", "--arg", "pk-path:/keys/pk.der"]);
        assert_eq!(cli.arg("pk-path"), Some("/keys/pk.der"));
        assert_eq!(cli.arg("missing"), None);
    }

    #[test]
    fn arg_without_backend_is_rejected() {
        let result = Cli::try_parse_from(["varstored", "--domain", "1", "--pidfile", "/tmp/v.pid", "--arg", "pk-path:/keys/pk.der"]);
        assert!(result.is_err());
    }
}
