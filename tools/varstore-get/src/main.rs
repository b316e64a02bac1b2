//! `varstore-get` (C13, §6): prints a single variable's data, or its
//! attribute flags, straight out of a guest's durable state file — useful
//! for inspecting a variable without the daemon running.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use uguid::Guid;

use varstore_core::backend::restore;
use varstore_core::{Backend, VariableAttributes};
use varstore_xapidb::XapidbBackend;

const NAMED_ATTRIBUTES: &[(VariableAttributes, &str)] = &[
    (VariableAttributes::NON_VOLATILE, "EFI_VARIABLE_NON_VOLATILE"),
    (VariableAttributes::BOOTSERVICE_ACCESS, "EFI_VARIABLE_BOOTSERVICE_ACCESS"),
    (VariableAttributes::RUNTIME_ACCESS, "EFI_VARIABLE_RUNTIME_ACCESS"),
    (VariableAttributes::HARDWARE_ERROR_RECORD, "EFI_VARIABLE_HARDWARE_ERROR_RECORD"),
    (VariableAttributes::AUTHENTICATED_WRITE_ACCESS, "EFI_VARIABLE_AUTHENTICATED_WRITE_ACCESS"),
    (VariableAttributes::TIME_BASED_AUTHENTICATED_WRITE_ACCESS, "EFI_VARIABLE_TIME_BASED_AUTHENTICATED_WRITE_ACCESS"),
    (VariableAttributes::APPEND_WRITE, "EFI_VARIABLE_APPEND_WRITE"),
    (VariableAttributes::ENHANCED_AUTHENTICATED_ACCESS, "EFI_VARIABLE_ENHANCED_AUTHENTICATED_ACCESS"),
];

/// Prints a UEFI variable's data to standard output, or with `-a`, its
/// attribute flags.
#[derive(Debug, Parser)]
#[command(name = "varstore-get")]
struct Args {
    /// Print attribute flags, one per line, instead of the variable's data.
    #[arg(short = 'a')]
    attributes: bool,

    vm_uuid: String,
    guid: String,
    name: String,
}

fn db_path(vm_uuid: &str) -> PathBuf {
    PathBuf::from(format!("/var/lib/varstored/{vm_uuid}.db"))
}

fn main() -> ExitCode {
    match run(&Args::parse()) {
        Ok(()) => ExitCode::from(0),
        Err(err) => {
            eprintln!("varstore-get: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let vendor = Guid::try_parse(&args.guid).map_err(|_| anyhow::anyhow!("invalid GUID {:?}", args.guid))?;
    let name: Vec<u16> = args.name.encode_utf16().collect();

    let path = db_path(&args.vm_uuid);
    let mut backend = XapidbBackend::new();
    backend.parse_arg("path", path.to_str().context("state path is not valid UTF-8")?);
    let (_, records) = backend.init().with_context(|| format!("failed to load durable state from {}", path.display()))?;
    let store = restore(records);

    let variable = store.lookup(&name, &vendor).with_context(|| format!("variable {:?} ({}) not found", args.name, args.guid))?;

    if args.attributes {
        print_attributes(variable.attributes);
    } else {
        std::io::stdout().write_all(&variable.data).context("failed to write variable data to stdout")?;
    }
    Ok(())
}

fn print_attributes(attrs: VariableAttributes) {
    println!("Attributes = {:#010x} ({})", attrs.bits(), attrs.bits());
    for (flag, label) in NAMED_ATTRIBUTES {
        if attrs.contains(*flag) {
            println!("{label}");
        }
    }
}
