use std::{
    io::{BufRead, BufReader, Write},
    path::PathBuf,
};

use clap::Parser;
use serde::Serialize;
use snapkeep::{
    config::{ConfigError, SnapkeepConfig},
    instant::TimestampParser,
    observability,
};

/// CLI arguments for snapkeep
#[derive(Parser, Debug)]
#[command(
    version,
    about = "Decide which backup snapshots a retention schedule keeps",
    long_about = None
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to config file (defaults to ./snapkeep.toml if it exists,
    /// otherwise the built-in default policy)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Partition a list of snapshots into kept and discarded
    ///
    /// Reads one snapshot name or timestamp per line and prints the
    /// selected list. Nothing is ever deleted.
    Prune {
        /// Reference instant (defaults to now)
        #[arg(short, long)]
        reference: Option<String>,
        /// Input file (defaults to stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Which list to print
        #[arg(long, value_enum, default_value_t = PrintSelection::Discarded)]
        print: PrintSelection,
        /// Print a JSON report instead of plain lines
        #[arg(long)]
        json: bool,
    },
    /// Validate the configuration and show the resolved rules
    Check {
        /// Reference instant used to resolve calendar rules (defaults to now)
        #[arg(short, long)]
        reference: Option<String>,
    },
    /// Initialize a new configuration file
    Init {
        /// Path to create the config file (defaults to ./snapkeep.toml)
        #[arg(short, long)]
        output: Option<String>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum PrintSelection {
    Kept,
    Discarded,
    Both,
}

#[derive(Debug, Serialize)]
struct PruneReport<'a> {
    reference: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    kept: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    discarded: Option<&'a [String]>,
}

const DEFAULT_CONFIG_FILE: &str = "snapkeep.toml";

/// Default configuration written by `snapkeep init`.
fn default_config_toml() -> &'static str {
    r#"# snapkeep retention policy
#
# Each rule keeps at most one snapshot per `every` interval, looking back
# `keep_for` from the reference instant. A snapshot kept by any rule is kept.

[policy]
# Search radius per window, as a fraction of the window length.
reach_factor = 0.5
# Follow the actual cadence of the snapshots instead of the ideal schedule.
auto_sync = false
# Offset applied to snapshot names without one, and to month arithmetic.
utc_offset = "+00:00"
# Regex locating the timestamp inside each snapshot name.
# extract_pattern = '(\d{8}T\d{6})'

[[policy.rules]]
every = "6h"
keep_for = "3mo"

[[policy.rules]]
every = "1d"
keep_for = "6mo"

[[policy.rules]]
every = "1w"
keep_for = "9mo"

[observability.logging]
level = "warn"
format = "compact"
"#
}

/// Resolve the config path.
/// Returns `None` when the built-in default policy should be used.
fn resolve_config_path(explicit_path: Option<&str>) -> Result<Option<PathBuf>, String> {
    // If explicit path is provided, use it
    if let Some(path) = explicit_path {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(format!("Config file not found: {}", path.display()));
        }
        return Ok(Some(path));
    }

    // Check for snapkeep.toml in current directory
    let cwd_config = PathBuf::from(DEFAULT_CONFIG_FILE);
    if cwd_config.exists() {
        return Ok(Some(cwd_config));
    }

    Ok(None)
}

fn load_config(explicit_path: Option<&str>) -> Result<SnapkeepConfig, String> {
    let path = resolve_config_path(explicit_path)?;
    let config = match &path {
        Some(path) => SnapkeepConfig::from_file(path),
        None => Ok(SnapkeepConfig::default()),
    }
    .map_err(|e: ConfigError| e.to_string())?;

    if let Err(e) = observability::init_tracing(&config.observability) {
        eprintln!("Warning: {e}");
    }

    match &path {
        Some(path) => tracing::info!(path = %path.display(), "Loaded configuration"),
        None => tracing::info!("No config file found, using the default policy"),
    }

    Ok(config)
}

/// Parse `--reference`, defaulting to the current time.
fn resolve_reference(config: &SnapkeepConfig, reference: Option<&str>) -> Result<i64, String> {
    match reference {
        Some(text) => {
            let offset = config.policy.offset().map_err(|e| e.to_string())?;
            TimestampParser::new(offset)
                .parse(text)
                .map_err(|e| format!("Invalid --reference: {e}"))
        }
        None => Ok(chrono::Utc::now().timestamp()),
    }
}

fn read_lines(input: Option<&PathBuf>) -> Result<Vec<String>, String> {
    let reader: Box<dyn BufRead> = match input {
        Some(path) => {
            let file = std::fs::File::open(path)
                .map_err(|e| format!("Failed to open {}: {e}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(std::io::stdin())),
    };

    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| format!("Failed to read input: {e}"))?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }
    Ok(lines)
}

fn main() {
    let args = Args::parse();

    let result = match args.command {
        Command::Prune {
            reference,
            input,
            print,
            json,
        } => run_prune(
            args.config.as_deref(),
            reference.as_deref(),
            input.as_ref(),
            print,
            json,
        ),
        Command::Check { reference } => run_check(args.config.as_deref(), reference.as_deref()),
        Command::Init { output, force } => run_init(output, force),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Partition snapshots read from `input` and print the selection.
fn run_prune(
    explicit_config_path: Option<&str>,
    reference: Option<&str>,
    input: Option<&PathBuf>,
    print: PrintSelection,
    json: bool,
) -> Result<(), String> {
    let config = load_config(explicit_config_path)?;
    let reference = resolve_reference(&config, reference)?;
    let parser = config.policy.parser()?;
    let engine = config
        .policy
        .engine(reference)
        .map_err(|e| e.to_string())?;

    let mut kept = read_lines(input)?;
    let total = kept.len();
    let discarded = engine
        .partition_by(&mut kept, |name| parser.parse(name))
        .map_err(|e| match e {
            snapkeep::retention::RetentionError::InvalidTimestamp { index, reason } => {
                format!("{reason} (snapshot {:?})", kept_name(&kept, index))
            }
            other => other.to_string(),
        })?;

    tracing::info!(
        total,
        kept = kept.len(),
        discarded = discarded.len(),
        reference,
        "Snapshots partitioned"
    );

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let written = if json {
        let report = PruneReport {
            reference,
            kept: (print != PrintSelection::Discarded).then_some(kept.as_slice()),
            discarded: (print != PrintSelection::Kept).then_some(discarded.as_slice()),
        };
        serde_json::to_writer_pretty(&mut out, &report)
            .map_err(|e| e.to_string())
            .and_then(|()| writeln!(out).map_err(|e| e.to_string()))
    } else {
        write_plain(&mut out, print, &kept, &discarded).map_err(|e| e.to_string())
    };

    written.map_err(|e| format!("Failed to write output: {e}"))
}

/// `items` is untouched when coercion fails, so the index still points at
/// the offending line.
fn kept_name(items: &[String], index: usize) -> &str {
    items.get(index).map(String::as_str).unwrap_or_default()
}

fn write_plain(
    out: &mut impl Write,
    print: PrintSelection,
    kept: &[String],
    discarded: &[String],
) -> std::io::Result<()> {
    match print {
        PrintSelection::Kept => {
            for name in kept {
                writeln!(out, "{name}")?;
            }
        }
        PrintSelection::Discarded => {
            for name in discarded {
                writeln!(out, "{name}")?;
            }
        }
        PrintSelection::Both => {
            for name in kept {
                writeln!(out, "keep\t{name}")?;
            }
            for name in discarded {
                writeln!(out, "discard\t{name}")?;
            }
        }
    }
    Ok(())
}

/// Validate the configuration and print the resolved rules.
fn run_check(explicit_config_path: Option<&str>, reference: Option<&str>) -> Result<(), String> {
    let config = load_config(explicit_config_path)?;
    let reference = resolve_reference(&config, reference)?;
    let engine = config
        .policy
        .engine(reference)
        .map_err(|e| e.to_string())?;

    println!("Configuration OK");
    println!("Reference: {reference}");
    println!(
        "Default reach factor: {}  auto_sync: {}  utc_offset: {}",
        config.policy.reach_factor, config.policy.auto_sync, config.policy.utc_offset
    );
    for (rule, resolved) in config.policy.rules.iter().zip(engine.rules()) {
        println!(
            "  every {:<6} keep_for {:<6} reach {:<5} windows {}",
            rule.every.to_string(),
            rule.keep_for.to_string(),
            resolved.effective_reach_factor(config.policy.reach_factor),
            resolved.window_count()
        );
    }
    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: Option<String>, force: bool) -> Result<(), String> {
    let output_path = output
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    if output_path.exists() && !force {
        return Err(format!(
            "Config file already exists: {}\nUse --force to overwrite.",
            output_path.display()
        ));
    }

    // Create parent directories if needed
    if let Some(parent) = output_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create directory {}: {e}", parent.display()))?;
    }

    std::fs::write(&output_path, default_config_toml())
        .map_err(|e| format!("Failed to write config file: {e}"))?;

    println!("Created config file: {}", output_path.display());
    println!();
    println!("To see which snapshots would be pruned, run:");
    println!("  ls /backups | snapkeep prune -c {}", output_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_toml_is_valid() {
        let config = SnapkeepConfig::from_str(default_config_toml()).unwrap();
        assert_eq!(config.policy.rules.len(), 3);
        assert_eq!(config.policy.rules[2].every.to_string(), "1w");
    }

    #[test]
    fn test_write_plain_both() {
        let mut out = Vec::new();
        write_plain(
            &mut out,
            PrintSelection::Both,
            &["a".to_string()],
            &["b".to_string()],
        )
        .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "keep\ta\ndiscard\tb\n");
    }

    #[test]
    fn test_read_lines_skips_blanks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "snap-1\n\n  snap-2  \n").unwrap();
        let lines = read_lines(Some(&file.path().to_path_buf())).unwrap();
        assert_eq!(lines, vec!["snap-1", "snap-2"]);
    }

    #[test]
    fn test_resolve_missing_explicit_config() {
        assert!(resolve_config_path(Some("/nonexistent/snapkeep.toml")).is_err());
    }

    #[test]
    fn test_args_parse_prune() {
        let args = Args::try_parse_from([
            "snapkeep",
            "prune",
            "--reference",
            "2018-01-01",
            "--print",
            "both",
            "--json",
        ])
        .unwrap();
        match args.command {
            Command::Prune { print, json, .. } => {
                assert_eq!(print, PrintSelection::Both);
                assert!(json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
