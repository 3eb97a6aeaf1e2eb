use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use extension_patcher::{
    integrity, load_from_path, open_source, DirectorySink, FailureKind, FailurePolicy, Package,
    PackageSink, PatchSession, ProcessError, SessionError,
};
use similar::{ChangeTag, TextDiff};
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "extension-patcher")]
#[command(about = "Integrity-checked patching of browser extensions", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify and patch an extension, writing the patched tree
    Apply {
        /// Patch catalogue (TOML)
        #[arg(short, long)]
        catalogue: PathBuf,

        /// Extension source: unpacked directory, .crx or .zip
        #[arg(short, long)]
        source: PathBuf,

        /// Output directory for the patched, loadable extension
        #[arg(short, long)]
        out: PathBuf,

        /// Write into a non-empty output directory
        #[arg(short, long)]
        force: bool,

        /// Show unified diff of changes
        #[arg(short, long)]
        diff: bool,

        /// Report every failing file instead of stopping at the first
        #[arg(long)]
        collect_all: bool,
    },

    /// Check a catalogue against an extension without writing anything
    Check {
        /// Patch catalogue (TOML)
        #[arg(short, long)]
        catalogue: PathBuf,

        /// Extension source: unpacked directory, .crx or .zip
        #[arg(short, long)]
        source: PathBuf,
    },

    /// Print the SHA-256 a catalogue should pin for an extension source
    Hash {
        /// Extension source: unpacked directory, .crx or .zip
        #[arg(short, long)]
        source: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    match cli.command {
        Commands::Apply {
            catalogue,
            source,
            out,
            force,
            diff,
            collect_all,
        } => cmd_apply(&catalogue, &source, &out, force, diff, collect_all),

        Commands::Check { catalogue, source } => cmd_check(&catalogue, &source),

        Commands::Hash { source } => cmd_hash(&source),
    }
}

/// Logs go to stderr; `RUST_LOG` overrides the `-v` level.
fn init_logging(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn cmd_apply(
    catalogue_path: &Path,
    source_path: &Path,
    out: &Path,
    force: bool,
    show_diff: bool,
    collect_all: bool,
) -> Result<()> {
    let catalogue = load_from_path(catalogue_path)?;
    let source = open_source(source_path);

    println!("Catalogue: {} ({})", catalogue.meta.name, catalogue_path.display());
    if let Some(version) = &catalogue.meta.version {
        println!("Pinned version: {}", version);
    }
    println!("Source: {}", source.describe());
    println!();

    let fetched = source
        .fetch()
        .with_context(|| format!("failed to read {}", source_path.display()))?;
    let original = show_diff.then(|| fetched.package.clone());

    let policy = if collect_all {
        FailurePolicy::CollectAll
    } else {
        FailurePolicy::FailFast
    };

    let outcome = match PatchSession::new(&catalogue)
        .policy(policy)
        .run_fetched(fetched)
    {
        Ok(outcome) => outcome,
        Err(e) => {
            report_failure(&e);
            std::process::exit(1);
        }
    };

    println!("{} sha256 {}", "✓".green(), outcome.digest);
    for file in &outcome.files {
        println!(
            "{} {}: {} -> {} bytes",
            "✓".green(),
            file.path,
            file.before_len,
            file.after_len
        );
        if let Some(original) = &original {
            display_diff(&file.path, original, &outcome.package);
        }
    }

    let written = DirectorySink::new(out)
        .overwrite(force)
        .emit(&outcome.package)?;

    println!();
    println!("{}", "Summary:".bold());
    println!("  {} files patched", format!("{}", outcome.files.len()).green());
    println!("  written to {}", written.display());

    Ok(())
}

fn cmd_check(catalogue_path: &Path, source_path: &Path) -> Result<()> {
    let catalogue = load_from_path(catalogue_path)?;
    let source = open_source(source_path);

    println!("{}", "Checking catalogue...".bold());
    println!("Catalogue: {} ({})", catalogue.meta.name, catalogue_path.display());
    println!("Source: {}", source.describe());
    println!();

    let result = PatchSession::new(&catalogue)
        .policy(FailurePolicy::CollectAll)
        .run(source.as_ref());

    match result {
        Ok(outcome) => {
            println!("{} sha256 {}", "✓".green(), outcome.digest);
            for file in &outcome.files {
                println!("{} {}: applies cleanly", "✓".green(), file.path);
            }
            println!();
            println!("{}", "Summary:".bold());
            println!("  {} files verified", format!("{}", outcome.files.len()).green());
            Ok(())
        }
        Err(e) => {
            report_failure(&e);
            std::process::exit(1);
        }
    }
}

fn cmd_hash(source_path: &Path) -> Result<()> {
    let source = open_source(source_path);
    let fetched = source
        .fetch()
        .with_context(|| format!("failed to read {}", source_path.display()))?;

    println!("{}", integrity::digest(&fetched.raw));
    if let Some(version) = &fetched.version {
        eprintln!("{}", format!("manifest version: {}", version).dimmed());
    }
    eprintln!(
        "{}",
        format!("{} files in package", fetched.package.len()).dimmed()
    );
    Ok(())
}

/// Print a session failure with drift diagnostics.
fn report_failure(err: &SessionError) {
    eprintln!("{} {}", "✗".red(), format!("{}", err.kind()).red().bold());

    match err {
        SessionError::Integrity { .. } => {
            eprintln!("  {}", "CONFLICT: upstream package changed".red());
            eprintln!("  Error: {}", err);
            eprintln!("  Action: review the catalogue against the new build, then pin its hash");
            eprintln!("          (extension-patcher hash --source <path>)");
        }
        SessionError::Process(_) | SessionError::Multiple(_) => {
            for process_err in err.process_errors() {
                report_process_error(process_err);
            }
        }
        other => eprintln!("  Error: {}", other),
    }

    eprintln!();
    eprintln!("{}", "No output was written.".yellow());
}

fn report_process_error(err: &ProcessError) {
    eprintln!("  {} {}", "-".red(), err);
    match err.kind() {
        FailureKind::FileNotFound => {
            eprintln!("    Possible causes:");
            eprintln!("      - File was renamed or moved upstream");
            eprintln!("      - Catalogue path has a typo");
        }
        FailureKind::ReplacementCountMismatch => {
            eprintln!("    Possible causes:");
            eprintln!("      - Upstream code changed around the pattern");
            eprintln!("      - Pattern now occurs a different number of times");
        }
        FailureKind::AnchorNotFound => {
            eprintln!("    Action: find the new location of the anchor upstream");
        }
        _ => {}
    }
}

/// Helper: Show unified diff between original and patched content
fn display_diff(path: &str, original: &Package, patched: &Package) {
    let (Some(before), Some(after)) = (original.get(path), patched.get(path)) else {
        return;
    };
    if before == after {
        return;
    }
    let before = String::from_utf8_lossy(before);
    let after = String::from_utf8_lossy(after);

    println!("\n{}", format!("--- {} (original)", path).dimmed());
    println!("{}", format!("+++ {} (patched)", path).dimmed());

    let diff = TextDiff::from_lines(before.as_ref(), after.as_ref());

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => format!("-{}", change).red(),
            ChangeTag::Insert => format!("+{}", change).green(),
            ChangeTag::Equal => continue,
        };
        print!("{}", sign);
        if change.missing_newline() {
            println!();
        }
    }
}
