use anyhow::{bail, Context as _};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use rangesync::{
    download_to_file_with_properties, open_reader, upload_file, HttpTransport, OpContext,
    RangeTransport, ReaderOptions, RetryPolicy, RetryPolicyKind, TransferConfig, TransferReport,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "rangesync")]
#[command(about = "Parallel, resumable ranged transfers for HTTP file storage", long_about = None)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// JSON config file; flags override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Overall deadline for the operation (e.g. "10m", "90s")
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Print the transfer report as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download an object to a file, or to stdout with "-"
    Download {
        /// Object URL
        url: String,
        /// Destination path
        output: PathBuf,
        /// First byte to read (stdout only)
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Number of bytes to read; defaults to the rest of the object (stdout only)
        #[arg(long)]
        count: Option<u64>,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Upload a local file range by range
    Upload {
        /// Source file
        input: PathBuf,
        /// Object URL
        url: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Show an object's size and ETag
    Stat {
        /// Object URL
        url: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    Exponential,
    Fixed,
}

impl From<PolicyArg> for RetryPolicyKind {
    fn from(policy: PolicyArg) -> Self {
        match policy {
            PolicyArg::Exponential => RetryPolicyKind::Exponential,
            PolicyArg::Fixed => RetryPolicyKind::Fixed,
        }
    }
}

#[derive(ClapArgs, Debug, Default)]
struct TransferArgs {
    /// Bytes per ranged request
    #[arg(long)]
    range_size: Option<u64>,

    /// Number of ranges transferred concurrently
    #[arg(short, long)]
    parallelism: Option<usize>,

    /// Extra requests a download range may make to resume a broken body
    #[arg(long)]
    range_retries: Option<u32>,

    /// Size of the windows a file is paged in by during upload
    #[arg(long)]
    segment_size: Option<u64>,

    /// Backoff policy between tries
    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,

    /// Attempts per request, including the first
    #[arg(long)]
    max_tries: Option<u32>,

    /// Time limit for a single attempt
    #[arg(long, value_parser = humantime::parse_duration)]
    try_timeout: Option<Duration>,

    /// Base delay between attempts
    #[arg(long, value_parser = humantime::parse_duration)]
    retry_delay: Option<Duration>,

    /// Cap for the delay between attempts
    #[arg(long, value_parser = humantime::parse_duration)]
    max_retry_delay: Option<Duration>,
}

impl TransferArgs {
    fn apply(&self, config: &mut TransferConfig) {
        if let Some(v) = self.range_size {
            config.range_size = v;
        }
        if let Some(v) = self.parallelism {
            config.parallelism = v;
        }
        if let Some(v) = self.range_retries {
            config.max_retry_requests_per_range = v;
        }
        if let Some(v) = self.segment_size {
            config.segment_size = v;
        }
        if let Some(v) = self.policy {
            config.retry.policy = v.into();
        }
        if let Some(v) = self.max_tries {
            config.retry.max_tries = v;
        }
        if let Some(v) = self.try_timeout {
            config.retry.try_timeout = v;
        }
        if let Some(v) = self.retry_delay {
            config.retry.retry_delay = v;
        }
        if let Some(v) = self.max_retry_delay {
            config.retry.max_retry_delay = v;
        }
    }
}

fn byte_progress_bar(total: u64) -> anyhow::Result<indicatif::ProgressBar> {
    let pb = indicatif::ProgressBar::new(total);
    pb.set_style(
        indicatif::ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg} | {binary_bytes_per_sec}, ETA {eta_precise}")?
            .progress_chars("█▓▒░ "),
    );
    Ok(pb)
}

fn print_report(report: &TransferReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        info!(
            "Transferred {} bytes in {} ranges ({} ms)",
            report.bytes, report.chunks, report.elapsed_ms
        );
    }
    Ok(())
}

fn load_config(args: &Args, transfer: &TransferArgs) -> anyhow::Result<TransferConfig> {
    let mut config = match &args.config {
        Some(path) => TransferConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => TransferConfig::default(),
    };
    transfer.apply(&mut config);
    Ok(config)
}

fn transport_for(url: &str, config: &TransferConfig) -> anyhow::Result<Arc<HttpTransport>> {
    let retry = RetryPolicy::new(config.retry_options()?)?;
    Ok(Arc::new(HttpTransport::new(url, retry)))
}

async fn run(args: Args, ctx: OpContext) -> anyhow::Result<()> {
    match &args.command {
        Command::Download {
            url,
            output,
            offset,
            count,
            transfer,
        } => {
            let config = load_config(&args, transfer)?;
            let transport = transport_for(url, &config)?;

            if output.as_os_str() == "-" {
                let options = ReaderOptions {
                    max_retry_requests: config.max_retry_requests_per_range,
                };
                let mut reader =
                    open_reader(&ctx, transport, *offset, *count, None, options).await?;
                let copied = tokio::io::copy(&mut reader, &mut tokio::io::stdout()).await?;
                reader.close()?;
                info!("Wrote {} bytes to stdout", copied);
                return Ok(());
            }
            if *offset != 0 || count.is_some() {
                bail!("--offset and --count are only supported when writing to stdout");
            }

            let properties = transport.properties(&ctx).await?;
            let pb = byte_progress_bar(properties.content_length)?;
            pb.set_message(format!("⬇️  {}", output.display()));

            let mut options = config.transfer_options();
            let sink = pb.clone();
            options.progress = Some(Arc::new(move |total| sink.set_position(total)));

            let report =
                download_to_file_with_properties(&ctx, transport, output, &properties, &options)
                    .await;
            match report {
                Ok(report) => {
                    pb.finish_with_message("✅ Download complete");
                    print_report(&report, args.json)
                }
                Err(e) => {
                    pb.abandon_with_message("❌ Download failed");
                    Err(e.into())
                }
            }
        }
        Command::Upload {
            input,
            url,
            transfer,
        } => {
            let config = load_config(&args, transfer)?;
            let transport = transport_for(url, &config)?;

            let size = tokio::fs::metadata(input)
                .await
                .with_context(|| format!("cannot read {}", input.display()))?
                .len();
            let pb = byte_progress_bar(size)?;
            pb.set_message(format!("⬆️  {}", input.display()));

            let mut options = config.transfer_options();
            let sink = pb.clone();
            options.progress = Some(Arc::new(move |total| sink.set_position(total)));

            match upload_file(&ctx, transport, input, &options).await {
                Ok(report) => {
                    pb.finish_with_message("✅ Upload complete");
                    print_report(&report, args.json)
                }
                Err(e) => {
                    pb.abandon_with_message("❌ Upload failed");
                    Err(e.into())
                }
            }
        }
        Command::Stat { url, transfer } => {
            let config = load_config(&args, transfer)?;
            let transport = transport_for(url, &config)?;
            let properties = transport.properties(&ctx).await?;
            let etag = properties.etag.as_ref().map(|e| e.as_str().to_string());

            if args.json {
                let value = serde_json::json!({
                    "url": url,
                    "content_length": properties.content_length,
                    "etag": etag,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("size: {}", properties.content_length);
                println!("etag: {}", etag.as_deref().unwrap_or("-"));
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("rangesync={}", log_level))
        .with_writer(std::io::stderr)
        .init();

    let ctx = match args.timeout {
        Some(timeout) => OpContext::new().with_timeout(timeout),
        None => OpContext::new(),
    };

    let interrupted = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling transfer");
            interrupted.cancel();
        }
    });

    run(args, ctx).await
}
