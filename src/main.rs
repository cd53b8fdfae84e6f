use std::path::PathBuf;

use clap::Parser;
use colored::Colorize;
use easygadget::android::layout::Architecture;
use easygadget::inject::DEFAULT_LIBRARY_NAME;
use easygadget::pipeline::{PatchOptions, Patcher, Toolchain};

/// EasyGadget: patch APKs so an instrumentation gadget loads at startup
#[derive(Debug, Parser)]
#[command(name = "easygadget", version, about, long_about = None)]
struct Cli {
    /// Path to the APK file to patch
    #[arg(short, long, value_name = "APK")]
    apk: PathBuf,

    /// Target architecture: armeabi-v7a, arm64-v8a, x86 or x86_64
    #[arg(long)]
    arch: Architecture,

    /// Script bundled into the APK as libscript.so
    #[arg(long)]
    script: Option<PathBuf>,

    /// Show the output of apktool, keytool and apksigner
    #[arg(long)]
    logs: bool,

    /// Native library loaded by the injected stub
    #[arg(long, default_value = DEFAULT_LIBRARY_NAME)]
    lib_name: String,

    /// Directory holding <arch>/lib<name>.so and <arch>/lib<name>.config.so
    #[arg(long, default_value = "gadget")]
    gadget_dir: PathBuf,

    /// Keystore used for signing, created on first use
    #[arg(long, default_value = "debug.keystore")]
    keystore: PathBuf,

    /// Output APK, defaults to <apk>_mod.apk next to the input
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long)]
    verbose: bool,

    /// Print the patch report as JSON.
    #[arg(long)]
    json: bool,
}

fn banner() -> String {
    format!(
        "{}{}{} {}\n",
        "Easy".cyan().bold(),
        "Gad".green().bold(),
        "get".yellow().bold(),
        env!("CARGO_PKG_VERSION").white()
    )
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Tool output needs info level to show up with --logs; RUST_LOG overrides
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_module("easygadget", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    if !cli.json {
        println!("{}", banner());
    }

    if let Err(e) = Patcher::preflight() {
        eprintln!("{} {}", "ERROR:".red().bold(), e);
        eprintln!(
            "{} Please install these tools manually before running easygadget.",
            "ERROR:".red().bold()
        );
        std::process::exit(1);
    }

    let options = PatchOptions {
        script: cli.script,
        gadget_dir: cli.gadget_dir,
        library: cli.lib_name,
        output: cli.output,
        ..PatchOptions::new(cli.apk, cli.arch)
    };
    let patcher = Patcher::new(Toolchain::system(cli.keystore, cli.logs), options);

    match patcher.run() {
        Ok(report) => {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{} {}",
                    "Successfully patched APK:".green(),
                    report.output.display()
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {}", "ERROR:".red().bold(), e);
            std::process::exit(1);
        }
    }
}
