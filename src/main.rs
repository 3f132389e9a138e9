//! Terminal entry point: parses arguments, loads the hash dictionaries,
//! builds the matching manager and runs the selected action. On failure the
//! original error is printed followed by the collected trace, one indented
//! line per scope, and the process exits with status 1.

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::process;

use clap::Parser;

use quarry::app::{Action, App};
use quarry::cli::{parse_list, ActionArg, Cli};
use quarry::common::{QuarryError, QuarryResult};
use quarry::hashes::HashDict;
use quarry::provider;
use quarry::trace;

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(error) = run(&cli) {
        eprintln!("error: {}", error);
        for line in trace::drain() {
            eprintln!("    {}", line);
        }
        process::exit(1);
    }
}

fn run(cli: &Cli) -> QuarryResult<()> {
    let names_path = discover_dictionary(cli.hashes_names.clone(), "hashes.game.txt");
    let extensions_path = discover_dictionary(cli.hashes_exts.clone(), "hashes.game.ext.txt");
    let mut hashes = HashDict::new();
    hashes.read_names(&names_path)?;
    hashes.read_extensions(&extensions_path)?;

    let langs = cli.lang.as_deref().map(parse_list).unwrap_or_default();
    let extensions = cli.ext.as_deref().map(parse_list).unwrap_or_default();
    let mut names: HashSet<u64> = HashSet::new();
    for token in cli.path.as_deref().map(parse_list).unwrap_or_default() {
        if let Some(literal) = token.strip_prefix("0x") {
            let hash = u64::from_str_radix(literal, 16)
                .map_err(|_| QuarryError::HashParse(token.clone()))?;
            names.insert(hash);
        } else {
            names.insert(hashes.hash_by_name(&token));
        }
    }

    let manager = provider::make(
        &cli.manifest,
        cli.cdn.as_deref(),
        cli.remote.as_deref().unwrap_or(""),
        &langs,
    )?;

    let mut app = App {
        action: match cli.action {
            ActionArg::List => Action::List,
            ActionArg::Extract => Action::Extract,
            ActionArg::Index => Action::Index,
            ActionArg::Exever => Action::ExeVer,
            ActionArg::Checksum => Action::Checksum,
        },
        output: cli.output.clone(),
        extensions,
        names,
        max_depth: cli.max_depth,
        show_archives: cli.show_wads,
        skip_root: cli.skip_root,
        hashes,
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    app.run(manager.as_ref(), &mut out)?;
    out.flush()?;

    app.hashes.write_names(&names_path)?;
    app.hashes.write_extensions(&extensions_path)?;
    Ok(())
}

/// Dictionary discovery order: explicit flag, `hashes/` next to the binary,
/// then the working directory. Missing files load as empty.
fn discover_dictionary(explicit: Option<PathBuf>, file_name: &str) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    if let Ok(binary) = std::env::current_exe() {
        if let Some(directory) = binary.parent() {
            let candidate = directory.join("hashes").join(file_name);
            if candidate.exists() {
                return candidate;
            }
        }
    }
    PathBuf::from(file_name)
}
