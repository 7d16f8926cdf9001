use std::{
    fmt,
    fs::File,
    io::{self, stderr, Stderr},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgEnum, Parser, Subcommand};
use log::{debug, log_enabled, Level};
use serde::{Deserialize, Serialize};
use tokio::signal::ctrl_c;

use meterlib::{Meter, MeterDrawMode};
use partlib::{
    events::LogSink,
    host::HostVolume,
    monitor::Monitor,
    transfer::BeginError,
    DownloadClient, DownloadRequest, Transfer, TransferState, Transfers,
};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Name of the transfer index file, kept next to the destinations.
const INDEX_FILENAME: &str = concat!(".", env!("CARGO_PKG_NAME"), "-index");

#[derive(ArgEnum, Clone, Copy, Debug, Parser)]
enum LogLevel {
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => f.write_str("debug"),
            Self::Trace => f.write_str("trace"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct Config {
    token: Option<String>,
    headers: Option<Vec<String>>,
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|mut p| {
        p.push(format!("{}.conf", PKG_NAME));
        p
    })
}

fn load_config_file(user_path: Option<&Path>) -> Result<Option<Config>> {
    let default_path = default_config_path();
    let path = user_path.or_else(|| default_path.as_deref());

    match path {
        Some(p) => {
            let file = match File::open(p) {
                Ok(f) => f,
                Err(e) => {
                    return if e.kind() == io::ErrorKind::NotFound {
                        Ok(None)
                    } else {
                        Err(e).context(format!("Could not open file: {:?}", p))
                    };
                }
            };

            let config = serde_json::from_reader(file)
                .context(format!("Could not parse config file: {:?}", p))?;

            Ok(Some(config))
        }
        None => Ok(None),
    }
}

/// Assemble the request from command line arguments, environment and the
/// config file, in that order of precedence.
fn build_request(url: &str, opts: &RequestOpts, config: &Option<Config>) -> Result<DownloadRequest> {
    let mut request = DownloadRequest::new(url);

    let token = opts
        .token
        .as_ref()
        .or_else(|| config.as_ref().and_then(|c| c.token.as_ref()));
    if let Some(token) = token {
        request = request.header("Authorization", format!("Bearer {}", token));
    }

    let config_headers = config
        .as_ref()
        .and_then(|c| c.headers.as_deref())
        .unwrap_or(&[]);
    for header in opts.headers.iter().chain(config_headers) {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| anyhow!("Invalid header (expected 'Name: value'): {}", header))?;
        request = request.header(name.trim(), value.trim());
    }

    Ok(request)
}

#[derive(Debug, Parser)]
struct RequestOpts {
    /// Bearer token sent with every request
    ///
    /// If unspecified, the token is loaded from the `PARTDL_TOKEN`
    /// environment variable, followed by the `token` config file variable.
    #[clap(long, env = "PARTDL_TOKEN")]
    token: Option<String>,
    /// Extra request header ('Name: value'); may be given multiple times
    #[clap(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Ignore TLS validation for HTTPS connections
    ///
    /// By default, all HTTPS connections validate the TLS certificate
    /// against the system's CA trust store.
    #[clap(long)]
    ignore_tls_validation: bool,
    /// Config file path
    ///
    /// If unspecified, the default config file path is used. The config file
    /// can store the token and default headers to avoid passing them as
    /// command-line arguments.
    #[clap(long, parse(from_os_str))]
    config: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct FetchOpts {
    /// URL of the file to download
    url: String,
    /// Destination path on the target drive
    ///
    /// While the download runs, this path is a directory holding the growing
    /// partial file; it becomes an ordinary file once the transfer finishes.
    #[clap(parse(from_os_str))]
    destination: PathBuf,
    #[clap(flatten)]
    request: RequestOpts,
}

#[derive(Debug, Parser)]
struct ResumeOpts {
    /// Destination path of an interrupted transfer
    #[clap(parse(from_os_str))]
    destination: PathBuf,
    /// Ignore TLS validation for HTTPS connections
    #[clap(long)]
    ignore_tls_validation: bool,
}

#[derive(Debug, Parser)]
struct CleanupOpts {
    /// Directory whose transfers should be swept
    #[clap(parse(from_os_str))]
    directory: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a new transfer
    Fetch(FetchOpts),
    /// Resume an interrupted transfer from its backup
    Resume(ResumeOpts),
    /// Finalize finished transfers and remove failed ones
    Cleanup(CleanupOpts),
}

/// Download files onto removable drives, resumably.
///
/// Files are preallocated at their full size and filled sector by sector, so
/// they can be previewed while the download runs and every transfer can be
/// resumed after a network drop, an unplugged drive or a power cut.
#[derive(Debug, Parser)]
#[clap(author, version)]
struct Opts {
    /// Set logging verbosity
    ///
    /// By default, no log messages are printed out. This option overrides
    /// the RUST_LOG environment variable, which would otherwise be respected
    /// if this option was not passed.
    #[clap(arg_enum, long, global = true)]
    loglevel: Option<LogLevel>,
    #[clap(subcommand)]
    command: Command,
}

fn index_path_for(destination: &Path) -> Result<PathBuf> {
    let parent = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| anyhow!("Destination must have a parent directory"))?;
    Ok(parent.join(INDEX_FILENAME))
}

fn make_transfers(index_path: PathBuf, ignore_tls_validation: bool) -> Result<Transfers> {
    let client = DownloadClient::builder()
        .ignore_tls_validation(ignore_tls_validation)
        .build()
        .context("Could not initialize HTTP client")?;

    Ok(Transfers::new(
        HostVolume::new(),
        client,
        Monitor::new(),
        Arc::new(LogSink),
        index_path,
    ))
}

/// Create the meter for a transfer. The escape sequences of the interactive
/// meter would clobber log messages, so logging switches it to append mode.
fn create_meter(total: u64) -> Meter<Stderr> {
    let mut meter = Meter::new(stderr(), total);
    if log_enabled!(Level::Debug) {
        meter.set_mode(MeterDrawMode::Append);
    }
    meter
}

/// Step the transfer to a terminal state, rendering progress and catching
/// Ctrl-C. An interrupt leaves the transfer on disk, ready for `resume`.
async fn drive(transfers: &Transfers, mut transfer: Transfer) -> Result<()> {
    let total = transfer.file_state().map(|s| s.total_size).unwrap_or(0);
    let mut meter = create_meter(total);
    let mut last_generation = 0;

    loop {
        tokio::select! {
            c = ctrl_c() => {
                c?;
                transfer.interrupt().await;
                meter.finish()?;
                bail!("Transfer was interrupted. To resume, run: {} resume {:?}",
                      PKG_NAME, transfer.destination());
            }

            state = transfer.step(false) => {
                if let Some(file) = transfer.file_state() {
                    let head = file.valid_head.map_or(0, |p| p.end);
                    let tail = file.valid_tail.map_or(0, |p| file.total_size - p.start);
                    meter.set_total(file.total_size);
                    meter.update(head, tail, file.get_valid_size())?;
                }

                if let Some(status) = transfers.monitor().status().first() {
                    if status.generation != last_generation {
                        last_generation = status.generation;
                        meter.reset_speed();
                    }
                }

                match state {
                    TransferState::Finished => {
                        meter.finish()?;
                        break;
                    }
                    TransferState::Failed => {
                        meter.finish()?;
                        bail!("Transfer failed");
                    }
                    TransferState::Retrying => {
                        // don't spin through the retry cooldown
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    TransferState::Downloading => {}
                }
            }
        }
    }

    // a printable file stays in its transfer directory until a sweep; run
    // one right away so the caller gets a plain file
    transfers.cleanup();

    Ok(())
}

async fn fetch(opts: FetchOpts) -> Result<()> {
    let config = load_config_file(opts.request.config.as_deref())?;
    let request = build_request(&opts.url, &opts.request, &config)?;

    let transfers = make_transfers(
        index_path_for(&opts.destination)?,
        opts.request.ignore_tls_validation,
    )?;

    // deal with leftovers of previous sessions first
    transfers.cleanup();

    let transfer = match transfers.begin(&opts.destination, request).await {
        Ok(transfer) => transfer,
        Err(BeginError::AlreadyExists) => {
            bail!(
                "{:?} already exists. If it is an interrupted transfer, run: {} resume {:?}",
                opts.destination,
                PKG_NAME,
                opts.destination,
            );
        }
        Err(e) => return Err(e).context("Could not start transfer"),
    };

    drive(&transfers, transfer).await?;

    println!("Saved to {:?}", opts.destination);
    Ok(())
}

async fn resume(opts: ResumeOpts) -> Result<()> {
    let transfers = make_transfers(
        index_path_for(&opts.destination)?,
        opts.ignore_tls_validation,
    )?;

    let transfer = transfers
        .recover(&opts.destination)
        .await
        .context("Could not recover transfer")?;

    drive(&transfers, transfer).await?;

    println!("Saved to {:?}", opts.destination);
    Ok(())
}

fn cleanup(opts: CleanupOpts) -> Result<()> {
    let transfers = make_transfers(opts.directory.join(INDEX_FILENAME), false)?;

    if transfers.cleanup() {
        println!("All transfers cleaned up");
        Ok(())
    } else {
        bail!("Some transfers could not be cleaned up");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    if let Some(l) = opts.loglevel {
        std::env::set_var("RUST_LOG", format!("{}={},partlib={}", PKG_NAME, l, l));
    }

    env_logger::init();

    debug!("Arguments: {:#?}", opts);

    match opts.command {
        Command::Fetch(opts) => fetch(opts).await,
        Command::Resume(opts) => resume(opts).await,
        Command::Cleanup(opts) => cleanup(opts),
    }
}
