//! Bioimage Engine - converter orchestration for bio-image files.
//!
//! This binary exposes the engine's operations as subcommands and prints
//! results as JSON.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bioimage_engine::{
    addressing::{pages_for_ranges, DimensionOrder, PlaneCounts, PlaneRange},
    config::{CheckConfig, Cli, Command, ConvertConfig, EngineConfig, GroupConfig, PageConfig},
    convert::{
        Capabilities, ConversionRequest, ConversionToken, Converter, ProcessBackend, SeriesMeta,
    },
    error::ConvertError,
    lock::LockRegistry,
};

/// Exit code for a busy resource (EX_TEMPFAIL), the caller should retry.
const EXIT_RETRY_LATER: u8 = 75;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Convert(config) => run_convert(config).await,
        Command::Group(config) => run_group(config).await,
        Command::Page(config) => run_page(config),
        Command::Check(config) => run_check(config).await,
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "bioimage_engine=debug"
    } else {
        "bioimage_engine=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Probe the converter and build the engine.
async fn build_converter(engine: &EngineConfig) -> Converter {
    let backend = Arc::new(ProcessBackend::new(&engine.converter));
    let capabilities = Capabilities::probe(backend.as_ref(), engine.converter.as_str()).await;
    Converter::new(
        backend,
        Arc::new(capabilities),
        LockRegistry::global(),
        engine.to_settings(),
    )
}

fn print_json<T: serde::Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Could not serialize result: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn report(e: &ConvertError) -> ExitCode {
    if e.is_retry_later() {
        info!("{}", e);
        eprintln!("{}", e);
        return ExitCode::from(EXIT_RETRY_LATER);
    }
    error!("{}", e);
    ExitCode::FAILURE
}

// =============================================================================
// Convert Command
// =============================================================================

async fn run_convert(config: ConvertConfig) -> ExitCode {
    init_logging(config.engine.verbose);

    if let Err(e) = config.engine.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let request = match ConversionRequest::from_params(
        &config.operation,
        &config.params,
        config.output.clone(),
    ) {
        Ok(request) => request,
        Err(e) => return report(&e),
    };

    let converter = build_converter(&config.engine).await;

    let token = match build_token(&converter, &config).await {
        Ok(token) => token,
        Err(e) => return report(&e),
    };

    match converter.execute(&token, &request).await {
        Ok(output) => print_json(&output),
        Err(e) => report(&e),
    }
}

/// Build the token for the inputs and fill in its dimensions.
async fn build_token(
    converter: &Converter,
    config: &ConvertConfig,
) -> Result<ConversionToken, ConvertError> {
    let mut token = match config.inputs.as_slice() {
        [single] => ConversionToken::single(single),
        _ if config.group => {
            let assembly = converter.group_files(config.inputs.clone()).await?;
            let group = assembly.groups.first().ok_or_else(|| ConvertError::UnsupportedInput {
                reason: "no image series found among the inputs".to_string(),
            })?;
            if assembly.groups.len() > 1 {
                info!(
                    groups = assembly.groups.len(),
                    "Inputs hold several series, using the first"
                );
            }
            ConversionToken::from(group)
        }
        inputs => ConversionToken::multifile(
            inputs.to_vec(),
            SeriesMeta::new(inputs.len() as u32, 1, 0),
        ),
    };

    if let Some(series) = &config.series {
        token = token.with_series_path(series.as_str());
    }

    let operation = config.operation.as_str();
    if !matches!(operation, "meta" | "info" | "supported") {
        let dims = converter.info(&token).await?;
        token = token.with_dims(dims);
    }
    Ok(token)
}

// =============================================================================
// Group Command
// =============================================================================

async fn run_group(config: GroupConfig) -> ExitCode {
    init_logging(config.engine.verbose);

    let converter = Converter::new(
        Arc::new(ProcessBackend::new(&config.engine.converter)),
        Arc::new(Capabilities::not_installed(config.engine.converter.as_str())),
        LockRegistry::global(),
        config.engine.to_settings(),
    );

    let files: Vec<PathBuf> = config.files;
    match converter.group_files(files).await {
        Ok(assembly) => print_json(&assembly),
        Err(e) => report(&e),
    }
}

// =============================================================================
// Page Command
// =============================================================================

fn run_page(config: PageConfig) -> ExitCode {
    let parsed = (|| {
        let order: DimensionOrder = config.order.parse()?;
        let z: PlaneRange = config.z.parse()?;
        let t: PlaneRange = config.t.parse()?;
        Ok::<_, ConvertError>((order, z, t))
    })();

    let (order, z, t) = match parsed {
        Ok(values) => values,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let counts = PlaneCounts::new(config.z_count, config.t_count);
    match pages_for_ranges(z, t, counts, &order) {
        Ok(pages) => print_json(&pages),
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// Check Command
// =============================================================================

async fn run_check(config: CheckConfig) -> ExitCode {
    if config.engine.verbose {
        init_logging(true);
    }

    println!("Bioimage Engine Configuration Check");
    println!("═══════════════════════════════════");
    println!();

    if let Err(e) = config.engine.validate() {
        println!("✗ Configuration: {}", e);
        return ExitCode::FAILURE;
    }
    println!("✓ Converter: {}", config.engine.converter);
    println!(
        "✓ Lock backoff: {}ms..{}ms, ceiling {}",
        config.engine.lock_initial_ms,
        config.engine.lock_max_ms,
        match config.engine.lock_max_wait_secs {
            0 => "none".to_string(),
            secs => format!("{}s", secs),
        }
    );
    println!();

    print!("Probing converter... ");
    let backend = ProcessBackend::new(&config.engine.converter);
    let capabilities = Capabilities::probe(&backend, config.engine.converter.as_str()).await;

    if let Err(e) = capabilities.require_installed() {
        println!("✗ failed");
        println!();
        println!("Error: {}", e);
        println!();
        println!("Please check:");
        println!("  - The converter is installed and on PATH");
        println!("  - --converter or BIOIMAGE_CONVERTER points at the right executable");
        return ExitCode::FAILURE;
    }
    println!("✓ success");

    if let Some(version) = capabilities.version {
        println!("  Version: {}", version);
    }
    println!("  Formats: {}", capabilities.formats.len());
    for (name, format) in &capabilities.formats {
        let mode = match (format.reading, format.writing) {
            (true, true) => "rw",
            (true, false) => "r-",
            (false, true) => "-w",
            (false, false) => "--",
        };
        println!("    {:<12} {} {}", name, mode, format.full_name);
    }

    println!();
    println!("═══════════════════════════════════");
    println!("✓ All checks passed!");

    ExitCode::SUCCESS
}
