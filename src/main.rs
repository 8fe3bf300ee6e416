use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use orgdoc::core::Document;
use orgdoc::history::Session;
use orgdoc::ops::Op;
use orgdoc::{parse_document, serialize_document};

#[derive(Debug, Parser)]
#[command(
    name = "orgdoc",
    about = "Org outline tooling built on the orgdoc crate",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse Org files and print their structure.
    Parse(ParseArgs),

    /// Reserialize Org files, normalizing edited regions.
    Format(FormatArgs),

    /// Advance the todo state of one header and print the result.
    CycleTodo(CycleTodoArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Org files or directories containing Org files to parse.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// Org files or directories to format.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct CycleTodoArgs {
    /// Org file holding the header.
    input: PathBuf,
    /// Position of the header in the file, counting from zero.
    #[arg(long)]
    header: usize,
    /// Skip the completion log when a repeater fires.
    #[arg(long)]
    no_log: bool,
    /// Write the result back instead of printing it.
    #[arg(long)]
    in_place: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = cli.verbose;
    match cli.command {
        Commands::Parse(args) => handle_parse(args, verbose),
        Commands::Format(args) => handle_format(args, verbose),
        Commands::CycleTodo(args) => handle_cycle_todo(args, verbose),
    }
}

fn load_document(path: &Path) -> Result<Document> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    parse_document(&text).with_context(|| format!("parsing {:?}", path))
}

fn handle_parse(args: ParseArgs, verbose: bool) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let expanded = expand_inputs(&inputs, verbose)?;
    if expanded.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }

    let mut parsed = Vec::new();
    for path in expanded {
        if verbose {
            eprintln!("Parsing {:?}", path);
        }
        let doc = load_document(&path)?;
        parsed.push((path, doc));
    }

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            document: &'a Document,
        }

        let payload: Vec<JsonOutput<'_>> = parsed
            .iter()
            .map(|(path, doc)| JsonOutput {
                path: path.display().to_string(),
                document: doc,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (path, doc)) in parsed.iter().enumerate() {
            print_banner(idx, parsed.len(), path);
            println!("{:#?}", doc);
        }
    }
    Ok(())
}

/// Separate multi-file output the way `ls` does: a blank line and a path
/// banner between entries, nothing for a single file.
fn print_banner(idx: usize, total: usize, path: &Path) {
    if total > 1 {
        if idx > 0 {
            println!();
        }
        println!("== {} ==", path.display());
    }
}

fn handle_format(args: FormatArgs, verbose: bool) -> Result<()> {
    let FormatArgs { inputs, in_place } = args;
    let expanded = expand_inputs(&inputs, verbose)?;
    if expanded.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }

    for (idx, path) in expanded.iter().enumerate() {
        if verbose {
            eprintln!("Formatting {:?}", path);
        }
        let doc = load_document(path)?;
        let formatted = serialize_document(&doc);

        if in_place {
            fs::write(path, formatted.as_bytes())
                .with_context(|| format!("writing {:?}", path))?;
        } else {
            print_banner(idx, expanded.len(), path);
            print!("{formatted}");
            if !formatted.ends_with('\n') {
                println!();
            }
        }
    }

    Ok(())
}

fn handle_cycle_todo(args: CycleTodoArgs, verbose: bool) -> Result<()> {
    let CycleTodoArgs {
        input,
        header,
        no_log,
        in_place,
    } = args;
    let doc = load_document(&input)?;
    let header_id = doc
        .headers
        .get(header)
        .map(|h| h.id)
        .with_context(|| format!("file has no header at position {}", header))?;
    if verbose {
        eprintln!("Advancing header {} in {:?}", header, input);
    }

    let mut session = Session::new(doc);
    session
        .apply(&Op::AdvanceTodoState {
            header: header_id,
            logging_disabled: no_log,
            now: Local::now().naive_local(),
        })
        .map_err(|err| anyhow::anyhow!("advancing todo state: {err}"))?;

    let text = serialize_document(session.document());
    if in_place {
        fs::write(&input, text.as_bytes()).with_context(|| format!("writing {:?}", input))?;
    } else {
        print!("{text}");
    }
    Ok(())
}

/// Resolve the command-line inputs to a deduplicated list of `.org` files.
/// Directories are scanned recursively; naming a non-org file directly is an
/// error, while non-org files inside a directory are simply skipped.
fn expand_inputs(paths: &[PathBuf], verbose: bool) -> Result<Vec<PathBuf>> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        if canonical.is_dir() {
            if verbose {
                eprintln!("Scanning directory {:?}", canonical);
            }
            let mut collected = Vec::new();
            walk_org_files(&canonical, &mut collected, verbose)?;
            collected.sort();
            for file in collected {
                if seen.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if is_org_file(&canonical) {
            if seen.insert(canonical.clone()) {
                out.push(canonical);
            }
        } else {
            anyhow::bail!("{:?} is not an .org file", canonical);
        }
    }
    Ok(out)
}

fn walk_org_files(dir: &Path, out: &mut Vec<PathBuf>, verbose: bool) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("reading directory {:?}", dir))? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            continue;
        }
        let path = entry.path();
        if file_type.is_dir() {
            walk_org_files(&path, out, verbose)?;
        } else if is_org_file(&path) {
            if verbose {
                eprintln!("Found org file {:?}", path);
            }
            out.push(path);
        }
    }
    Ok(())
}

fn is_org_file(path: &Path) -> bool {
    path.extension().map(|ext| ext == "org").unwrap_or(false)
}
