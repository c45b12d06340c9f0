use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fn_meter::{Capabilities, ExecutionTelemetry, MeterConfig};

#[derive(Parser, Debug)]
#[command(name = "fn-meter", about = "Inspect gas metering configuration")]
struct Args {
    /// Emit logs as JSON
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Export spans to this OTLP/HTTP endpoint
    #[cfg(feature = "otel")]
    #[arg(long, global = true)]
    otel_endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate a config file, then print it with defaults filled in
    CheckConfig { path: PathBuf },
    /// Price one run's telemetry with a config's gas table and gas price
    Price {
        /// Config file; built-in defaults when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        duration_ms: u64,
        #[arg(long, default_value_t = 0)]
        memory_bytes: u64,
        #[arg(long, default_value_t = false)]
        network: bool,
        #[arg(long, default_value_t = false)]
        file_io: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    #[cfg(feature = "otel")]
    let _otel_guard = match args.otel_endpoint.as_deref() {
        Some(endpoint) => Some(
            fn_meter::otel::init_tracing(
                fn_meter::otel::DEFAULT_SERVICE_NAME,
                Some(endpoint),
                args.json_logs,
            )
            .map_err(|err| err.to_string())?,
        ),
        None => {
            fn_meter::logging::init_logging(args.json_logs)?;
            None
        }
    };
    #[cfg(not(feature = "otel"))]
    fn_meter::logging::init_logging(args.json_logs)?;

    match args.command {
        Command::CheckConfig { path } => {
            let config = MeterConfig::load(&path)?;
            tracing::info!(path = %path.display(), "config is valid");
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Price {
            config,
            duration_ms,
            memory_bytes,
            network,
            file_io,
        } => {
            let config = match config {
                Some(path) => MeterConfig::load(path)?,
                None => MeterConfig::default(),
            };
            let gas = config.gas.calculate(
                ExecutionTelemetry {
                    duration_ms,
                    memory_bytes,
                },
                Capabilities { network, file_io },
            );
            let cost = u128::from(gas) * u128::from(config.billing.gas_price);
            println!(
                "{}",
                serde_json::json!({
                    "gasUsed": gas,
                    "gasPrice": config.billing.gas_price,
                    "cost": cost.to_string(),
                })
            );
        }
    }
    Ok(())
}
