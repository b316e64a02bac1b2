//! Process entry point (§6, §9): wires CLI parsing, the logging facade,
//! backend selection, and the lifecycle supervisor together, then drives
//! the dispatcher loop until a terminating signal arrives.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use sentinel::{log, set_logger, StderrLogger};
use thiserror::Error;

use varstore_core::backend::{snapshot, MemoryBackend};
use varstore_core::provisioning::VendorKeys;
use varstore_core::Backend;
use varstore_xapidb::XapidbBackend;
use xenctrl::{MockControlInterface, MockEventChannel, MockIoreqServerControl};
use xenstore::MemoryStore;

use varstored::cli::Cli;
use varstored::lifecycle::LifecycleSupervisor;
use varstored::signals::{SignalKind, SignalSource};
use varstored::{context, dispatcher};

/// How long the dispatcher blocks on the event channel between liveness
/// checks (§5 "Suspension points").
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
enum ExitError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Failure(#[from] anyhow::Error),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let logger = Box::leak(Box::new(StderrLogger { min_level: cli.log_level() }));
    set_logger(logger);

    match run(&cli) {
        Ok(()) => ExitCode::from(0),
        Err(ExitError::Usage(msg)) => {
            log!(Error, "{msg}");
            ExitCode::from(2)
        }
        Err(ExitError::Failure(err)) => {
            log!(Critical, "{err:#}");
            ExitCode::from(1)
        }
    }
}

fn select_backend(cli: &Cli) -> Result<Box<dyn Backend>, ExitError> {
    if cli.nonpersistent {
        return Ok(Box::new(MemoryBackend::new()));
    }
    match cli.backend.as_deref() {
        Some("xapidb") => Ok(Box::new(XapidbBackend::new())),
        Some(other) => Err(ExitError::Usage(format!("unrecognized backend {other:?}"))),
        None => Err(ExitError::Usage("--backend is required unless --nonpersistent is set".to_string())),
    }
}

fn vendor_keys(cli: &Cli) -> Result<VendorKeys, ExitError> {
    let load = |flag: &str| -> Result<Option<Vec<u8>>, ExitError> {
        match cli.arg(flag) {
            Some(path) => {
                let bytes = std::fs::read(path).with_context(|| format!("reading {flag} from {path}"))?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    };
    Ok(VendorKeys { pk: load("pk-path")?, kek: load("kek-path")?, db: load("db-path")?, dbx: load("dbx-path")? })
}

fn run(cli: &Cli) -> Result<(), ExitError> {
    let mut backend = select_backend(cli)?;
    for (key, value) in &cli.args {
        if !backend.parse_arg(key, value) {
            log!(Warning, "backend did not recognize --arg {key}");
        }
    }
    backend.check_args().map_err(|err| ExitError::Usage(err.to_string()))?;

    let vendor_keys = vendor_keys(cli)?;

    let control = MockControlInterface::new().with_domain(cli.domain, 1);
    let mut supervisor = LifecycleSupervisor::new(
        cli.domain,
        0x100,
        cli.pidfile.clone(),
        cli.resume,
        vendor_keys,
        Box::new(control),
        Box::new(MockIoreqServerControl::new()),
        Box::new(MockEventChannel::new()),
        Box::new(MemoryStore::new()),
    );

    let (mut ctx, mut dispatcher) = supervisor.initialize(backend).context("lifecycle acquisition failed")?;
    log!(Info, "domain {} initialized, entering service loop", cli.domain);

    // Once acquisition has succeeded, every exit path — clean signal,
    // dispatcher error, or a failure below — must still save and tear
    // down, so nothing between here and there uses `?` directly.
    let service_result = run_service(&mut supervisor, &mut ctx, &mut dispatcher);

    let save_result = ctx.backend.save(&snapshot(&ctx.store)).context("failed to save durable state on shutdown");
    supervisor.teardown();

    service_result?;
    save_result.map_err(ExitError::Failure)
}

fn run_service(supervisor: &mut LifecycleSupervisor, ctx: &mut context::RootContext, dispatcher: &mut dispatcher::Dispatcher) -> Result<(), ExitError> {
    let mut signals = SignalSource::install().context("failed to install signal handling")?;

    loop {
        match signals.poll() {
            Ok(Some(SignalKind::Terminate(sig))) => {
                log!(Info, "received {sig:?}, tearing down");
                return Ok(());
            }
            Ok(Some(SignalKind::Reserved)) => {
                log!(Debug, "received reserved signal, ignoring");
            }
            Ok(None) => {}
            Err(err) => return Err(anyhow::Error::new(err).context("failed to poll for pending signals").into()),
        }

        dispatcher.wait_and_poll(ctx, supervisor.evtchn_mut(), POLL_TIMEOUT);
    }
}
