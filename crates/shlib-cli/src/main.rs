//! shlib command line tool
//!
//! Inspects plugin verification records, checks plugin compatibility and
//! test-loads shared libraries.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use shlib_core::format::{host_parser, locate_metadata, MappedFile, SectionKind};
use shlib_core::loader::is_library_file_name;
use shlib_core::metadata::{check_compatibility, decode};
use shlib_core::{
    Library, LibraryRegistry, LoadHints, LoaderConfig, PluginLoader, PluginRecord, SystemLoader,
};

#[derive(Parser)]
#[command(name = "shlib")]
#[command(author, version, about = "Native library and plugin inspection tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Print machine readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Loader configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Show the verification record embedded in a file, without loading it
    Inspect {
        /// Path to the binary
        file: PathBuf,
    },

    /// Check whether a file is a plugin compatible with this runtime
    Check {
        /// Path to the plugin
        file: PathBuf,
    },

    /// Load a library and resolve symbols from it
    Load {
        /// Library name or path
        name: String,

        /// Symbol to resolve (repeatable)
        #[arg(short, long = "symbol")]
        symbols: Vec<String>,

        /// Make the library's symbols available to later loads
        #[arg(long)]
        global: bool,

        /// Library version used for the versioned file name
        #[arg(long = "lib-version")]
        lib_version: Option<String>,
    },

    /// Classify every library in a directory
    Scan {
        /// Directory to scan
        dir: PathBuf,
    },
}

#[derive(Serialize)]
struct InspectReport {
    file: String,
    format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<PluginRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    compatible: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct CheckReport {
    file: String,
    plugin: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<PluginRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct SymbolReport {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct LoadReport {
    library: String,
    symbols: Vec<SymbolReport>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn run(cli: Cli) -> Result<ExitCode> {
    let registry = registry(cli.config.as_deref())?;
    match cli.command {
        Command::Inspect { file } => inspect(&registry, &file, cli.json),
        Command::Check { file } => check(&registry, &file, cli.json),
        Command::Load {
            name,
            symbols,
            global,
            lib_version,
        } => load(&registry, &name, lib_version.as_deref(), &symbols, global, cli.json),
        Command::Scan { dir } => scan(&registry, &dir, cli.json),
    }
}

fn registry(config: Option<&Path>) -> Result<Arc<LibraryRegistry>> {
    match config {
        None => Ok(LibraryRegistry::global()),
        Some(path) => {
            let config = LoaderConfig::from_toml_file(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?
                .with_env();
            tracing::debug!(?config, "using loader configuration");
            Ok(LibraryRegistry::new(Arc::new(SystemLoader), config))
        }
    }
}

fn inspect(registry: &LibraryRegistry, file: &Path, json: bool) -> Result<ExitCode> {
    let image = MappedFile::open(file).with_context(|| format!("Cannot open {}", file.display()))?;
    let parser = host_parser();
    let mut report = InspectReport {
        file: file.display().to_string(),
        format: parser.name(),
        record: None,
        compatible: None,
        error: None,
    };

    match parser.parse(&image) {
        Ok(section) if section.kind == SectionKind::Metadata => {
            tracing::debug!(offset = section.offset, size = section.size, "metadata section found");
        }
        Ok(_) => tracing::debug!("no metadata section, searching read-only data"),
        Err(e) => tracing::debug!(error = %e, "section scan failed"),
    }

    match locate_metadata(parser, &image) {
        Ok(Some(raw)) => match decode(raw) {
            Ok(record) => {
                let config = registry.config();
                let verdict = check_compatibility(&record, &config.build, config.debug_policy());
                if let Err(e) = &verdict {
                    report.error = Some(e.to_string());
                }
                report.compatible = Some(verdict.is_ok());
                report.record = Some(record);
            }
            Err(e) => report.error = Some(format!("malformed verification record: {e}")),
        },
        Ok(None) => report.error = Some("no verification record".to_string()),
        Err(e) => report.error = Some(format!("file {e}")),
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("File:     {}", report.file);
        println!("Format:   {}", report.format);
        if let Some(record) = &report.record {
            print_record(record);
        }
        if let Some(compatible) = report.compatible {
            println!("Compatible: {}", if compatible { "yes" } else { "no" });
        }
        if let Some(error) = &report.error {
            println!("Error:    {error}");
        }
    }

    Ok(if report.record.is_some() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn classify(registry: &Arc<LibraryRegistry>, file: &Path) -> CheckReport {
    let loader = PluginLoader::in_registry(Arc::clone(registry), &file.display().to_string());
    let record = loader.metadata();
    CheckReport {
        file: file.display().to_string(),
        plugin: record.is_some(),
        error: record.is_none().then(|| loader.error_string()),
        record,
    }
}

fn check(registry: &Arc<LibraryRegistry>, file: &Path, json: bool) -> Result<ExitCode> {
    let report = classify(registry, file);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if let Some(record) = &report.record {
        println!("{}: compatible plugin", report.file);
        print_record(record);
    } else {
        println!(
            "{}: not a plugin: {}",
            report.file,
            report.error.as_deref().unwrap_or_default()
        );
    }
    Ok(if report.plugin {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn load(
    registry: &Arc<LibraryRegistry>,
    name: &str,
    version: Option<&str>,
    symbols: &[String],
    global: bool,
    json: bool,
) -> Result<ExitCode> {
    let mut library = Library::in_registry(Arc::clone(registry), name, version);
    if global {
        library.set_load_hints(LoadHints::EXPORT_EXTERNAL_SYMBOLS);
    }
    library.load().with_context(|| format!("Cannot load {name}"))?;

    let mut failed = false;
    let symbols = symbols
        .iter()
        .map(|symbol| match library.resolve(symbol) {
            Ok(address) => SymbolReport {
                name: symbol.clone(),
                address: Some(format!("{address:p}")),
                error: None,
            },
            Err(e) => {
                failed = true;
                SymbolReport {
                    name: symbol.clone(),
                    address: None,
                    error: Some(e.to_string()),
                }
            }
        })
        .collect();
    let report = LoadReport {
        library: library.file_name(),
        symbols,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Loaded {}", report.library);
        for symbol in &report.symbols {
            match (&symbol.address, &symbol.error) {
                (Some(address), _) => println!("  {} = {address}", symbol.name),
                (None, Some(error)) => println!("  {}: {error}", symbol.name),
                (None, None) => {}
            }
        }
    }

    library.unload()?;
    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn scan(registry: &Arc<LibraryRegistry>, dir: &Path, json: bool) -> Result<ExitCode> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Cannot read {}", dir.display()))? {
        let entry = entry?;
        let is_file = entry.file_type().map(|t| !t.is_dir()).unwrap_or(false);
        if is_file && entry.file_name().to_str().is_some_and(is_library_file_name) {
            files.push(entry.path());
        }
    }
    files.sort();
    tracing::debug!(count = files.len(), dir = %dir.display(), "scanning libraries");

    let reports: Vec<CheckReport> = files.iter().map(|f| classify(registry, f)).collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            match &report.record {
                Some(record) => println!("plugin  {} ({})", report.file, record.version),
                None => println!(
                    "-       {} ({})",
                    report.file,
                    report.error.as_deref().unwrap_or_default()
                ),
            }
        }
        let plugins = reports.iter().filter(|r| r.plugin).count();
        println!("{} libraries, {plugins} plugins", reports.len());
    }
    Ok(ExitCode::SUCCESS)
}

fn print_record(record: &PluginRecord) {
    println!("Version:  {}", record.version);
    println!("Debug:    {}", record.debug);
    println!("Build key: {}", record.build_key);
}
