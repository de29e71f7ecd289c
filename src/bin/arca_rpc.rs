//! ARCA RPC CLI binary.
//!
//! # Commands
//!
//! - `request` - Request the last invoice number from the configured broker
//!   (needs the `amqp` feature)
//! - `demo` - Run one last-invoice transaction against an in-process broker
//!   and a canned invoice service
//! - `config` - Print the effective configuration

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arca_rpc::{
    config::{Config, WaitMode},
    invoice::{LastInvoiceRequest, LastInvoiceService},
    MemoryBroker, Responder, RpcClient, RpcError, VERSION,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;

#[derive(Parser)]
#[command(name = "arca-rpc")]
#[command(version = VERSION)]
#[command(about = "ARCA RPC - last-invoice lookups over a message broker", long_about = None)]
struct Cli {
    /// Config file (TOML). Defaults to the user config dir if present.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum WaitArg {
    Event,
    Poll,
}

#[derive(Subcommand)]
enum Commands {
    /// Request the last invoice number through the configured broker
    Request {
        /// Taxpayer id
        #[arg(long, default_value = "23146234399")]
        cuit: String,

        /// Point of sale
        #[arg(long, default_value = "0001")]
        pto_vta: String,

        /// Voucher type
        #[arg(long, default_value = "001")]
        cbte_tipo: String,

        /// Reply timeout in seconds (default: rpc.timeout_secs)
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Request the last invoice number from an in-process demo service
    Demo {
        /// Taxpayer id
        #[arg(long, default_value = "23146234399")]
        cuit: String,

        /// Point of sale
        #[arg(long, default_value = "0001")]
        pto_vta: String,

        /// Voucher type
        #[arg(long, default_value = "001")]
        cbte_tipo: String,

        /// Reply timeout in seconds (default: rpc.timeout_secs)
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Seconds the demo service takes to answer
        #[arg(long, default_value_t = 2.0)]
        reply_after: f64,

        /// Invoice number the demo service reports
        #[arg(long, default_value_t = 42)]
        invoice_number: u64,

        /// Do not start the demo service (the request will time out)
        #[arg(long)]
        no_reply: bool,

        /// Wait strategy override
        #[arg(long, value_enum)]
        wait: Option<WaitArg>,
    },

    /// Print the effective configuration (password omitted)
    Config,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let result = load_config(cli.config.as_ref()).and_then(|config| match cli.command {
        Commands::Request {
            cuit,
            pto_vta,
            cbte_tipo,
            timeout,
        } => cmd_request(config, LastInvoiceRequest::new(cuit, pto_vta, cbte_tipo), timeout),
        Commands::Demo {
            cuit,
            pto_vta,
            cbte_tipo,
            timeout,
            reply_after,
            invoice_number,
            no_reply,
            wait,
        } => cmd_demo(
            config,
            LastInvoiceRequest::new(cuit, pto_vta, cbte_tipo),
            timeout,
            reply_after,
            invoice_number,
            no_reply,
            wait,
        ),
        Commands::Config => cmd_config(&config),
    });

    if let Err(e) = result {
        match e.downcast_ref::<RpcError>() {
            Some(RpcError::Timeout { .. }) => eprintln!("\nTimeout error: {e}"),
            Some(RpcError::Connection(_)) => eprintln!("\nFailed to connect to broker: {e}"),
            _ => eprintln!("\nError: {e}"),
        }
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => match Config::default_path().filter(|p| p.exists()) {
            Some(path) => {
                tracing::debug!("Loading config from {}", path.display());
                Config::from_file(path)?
            },
            None => Config::default(),
        },
    };
    let config = config.with_env_overrides();
    config.validate()?;
    Ok(config)
}

fn cmd_config(config: &Config) -> anyhow::Result<()> {
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

#[cfg(feature = "amqp")]
fn cmd_request(
    config: Config,
    request: LastInvoiceRequest,
    timeout: Option<u64>,
) -> anyhow::Result<()> {
    let timeout = timeout.map(Duration::from_secs);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        tracing::info!("Connecting to {}", config.broker.redacted_uri());
        let client = RpcClient::new(Arc::new(arca_rpc::AmqpBroker::new()), config);
        let response = client
            .request_last_invoice(&request.cuit, &request.pto_vta, &request.cbte_tipo, timeout)
            .await?;

        println!("\nResponse received:");
        println!("{}", serde_json::to_string_pretty(&response.into_value())?);
        Ok::<_, anyhow::Error>(())
    })
}

#[cfg(not(feature = "amqp"))]
fn cmd_request(
    _config: Config,
    _request: LastInvoiceRequest,
    _timeout: Option<u64>,
) -> anyhow::Result<()> {
    anyhow::bail!("arca-rpc was built without AMQP support; rebuild with `--features amqp`")
}

fn cmd_demo(
    mut config: Config,
    request: LastInvoiceRequest,
    timeout: Option<u64>,
    reply_after: f64,
    invoice_number: u64,
    no_reply: bool,
    wait: Option<WaitArg>,
) -> anyhow::Result<()> {
    if let Some(wait) = wait {
        config.rpc.wait = match wait {
            WaitArg::Event => WaitMode::Event,
            WaitArg::Poll => WaitMode::Poll,
        };
    }
    let timeout = timeout.map(Duration::from_secs);
    let delay = Duration::try_from_secs_f64(reply_after)
        .map_err(|e| anyhow::anyhow!("Invalid --reply-after {reply_after}: {e}"))?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let broker = MemoryBroker::new();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();

        let service = if no_reply {
            None
        } else {
            let lookup = LastInvoiceService::new(move |request: LastInvoiceRequest| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, String>(json!({
                    "cuit": request.cuit,
                    "pto_vta": request.pto_vta,
                    "cbte_tipo": request.cbte_tipo,
                    "invoice_number": invoice_number,
                }))
            });
            let responder = Responder::new(Arc::new(broker.clone()), config.clone(), lookup)
                .bind()
                .await?;
            Some(tokio::spawn(responder.run(async move {
                let _ = stopped.await;
            })))
        };

        let client = RpcClient::new(Arc::new(broker.clone()), config);
        tracing::info!("Requesting last invoice for CUIT {}", request.cuit);
        let outcome = client
            .request_last_invoice(&request.cuit, &request.pto_vta, &request.cbte_tipo, timeout)
            .await;

        let _ = stop.send(());
        if let Some(service) = service {
            service.await??;
        }

        let response = outcome?;
        println!("\nResponse received:");
        println!("{}", serde_json::to_string_pretty(&response.into_value())?);
        Ok::<_, anyhow::Error>(())
    })
}
