use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use hashtrace::core::callgraph::CallGraph;
use hashtrace::core::reconstruct::{DfsStats, Reconstructor};
use hashtrace::core::trace_set::TraceSet;
use hashtrace::ui::report::{self, Report};

/// Reconstructs recorded malloc stack traces from their call-stack hash
/// fingerprints, by searching the target program's reverse call graph.
#[derive(Parser, Debug)]
#[command(name = "hashtrace")]
#[command(about = "Reconstructs stack traces from call-stack hash fingerprints")]
#[command(version)]
struct Cli {
    /// Call-graph dump extracted from the instrumented binary
    call_graph: PathBuf,

    /// Recorded fingerprint set, one `<symbol> <pc> <pc> ...` record per line
    traces: PathBuf,

    /// Maximum stack depth to search
    depth_limit: usize,

    /// Index at which the prefix lane of the rolling hash freezes
    mid_index: usize,

    /// Non-zero dumps the stack traces that could not be resolved to stderr
    #[arg(default_value_t = 0)]
    print_unresolved: u64,

    /// Stop expanding a search once this many nodes were visited
    #[arg(long, value_name = "N")]
    node_limit: Option<u64>,

    /// Dump the parsed call-graph tables to stderr before reconstruction
    #[arg(long)]
    dump_call_graph: bool,

    /// Dump the reverse call graph to stderr, with symbol names where known
    #[arg(long)]
    dump_reverse: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    if cli.depth_limit == 0 {
        bail!("depth limit must be positive");
    }
    if cli.mid_index >= cli.depth_limit {
        bail!(
            "mid index {} must be smaller than the depth limit {}",
            cli.mid_index,
            cli.depth_limit
        );
    }

    let graph = {
        let file = File::open(&cli.call_graph)
            .with_context(|| format!("failed to open call graph {}", cli.call_graph.display()))?;
        CallGraph::parse(BufReader::new(file))
            .with_context(|| format!("failed to parse call graph {}", cli.call_graph.display()))?
    };
    if cli.dump_call_graph {
        graph.write_dump(&mut io::stderr().lock())?;
    }
    if cli.dump_reverse {
        graph.write_reverse(&mut io::stderr().lock(), true)?;
    }

    let mut set = {
        let file = File::open(&cli.traces)
            .with_context(|| format!("failed to open fingerprint input {}", cli.traces.display()))?;
        TraceSet::read(BufReader::new(file), cli.depth_limit, cli.mid_index)
            .with_context(|| format!("failed to read fingerprint input {}", cli.traces.display()))?
    };
    info!(
        "loaded {} fingerprints across {} functions",
        set.len(),
        set.groups.len()
    );

    let reconstructor = Reconstructor::new(&graph, cli.depth_limit, cli.mid_index, cli.node_limit);

    let mut names: Vec<String> = set.groups.keys().cloned().collect();
    names.sort_unstable();

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for name in names {
        let Some(group) = set.groups.get_mut(&name) else {
            continue;
        };
        writeln!(out, "=== FUNC: \"{name}\" ===")?;

        let stats = match graph.entry_by_name(&name) {
            Some(entry) => {
                info!("starting reconstruction for \"{name}\"");
                reconstructor.run(entry, group)
            }
            None => {
                warn!("no symbol named \"{name}\" in the call graph; its fingerprints stay unresolved");
                DfsStats::default()
            }
        };
        if stats.truncated {
            warn!("node limit reached while reconstructing \"{name}\"; results are partial");
        }

        Report::new(&graph, group, &stats).write(&mut out)?;
        writeln!(out)?;

        if cli.print_unresolved != 0 {
            report::write_unresolved(&name, group, &mut io::stderr().lock())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_positional_surface() {
        let cli = Cli::try_parse_from(["hashtrace", "cg.txt", "st.txt", "5", "2"]).unwrap();
        assert_eq!(cli.call_graph, PathBuf::from("cg.txt"));
        assert_eq!(cli.depth_limit, 5);
        assert_eq!(cli.mid_index, 2);
        assert_eq!(cli.print_unresolved, 0);
        assert_eq!(cli.node_limit, None);

        let cli = Cli::try_parse_from([
            "hashtrace", "cg.txt", "st.txt", "5", "2", "1", "--node-limit", "100",
        ])
        .unwrap();
        assert_eq!(cli.print_unresolved, 1);
        assert_eq!(cli.node_limit, Some(100));

        assert!(Cli::try_parse_from(["hashtrace", "cg.txt", "st.txt"]).is_err());
    }

    #[test]
    fn rejects_mid_index_at_or_past_the_depth_limit() {
        let cli = Cli::try_parse_from(["hashtrace", "cg.txt", "st.txt", "4", "4"]).unwrap();
        assert!(run(&cli).is_err());
        let cli = Cli::try_parse_from(["hashtrace", "cg.txt", "st.txt", "0", "0"]).unwrap();
        assert!(run(&cli).is_err());
    }

    #[test]
    fn end_to_end_over_files() {
        let dir = tempfile::tempdir().unwrap();
        let cg_path = dir.path().join("cg.txt");
        let st_path = dir.path().join("traces.txt");
        std::fs::write(
            &cg_path,
            "FUNCTION SYMBOLS\n100 main\n200 foo\n300 bar\n\n\
             DIRECT CALL SITES\n100 150 200\n200 250 300\n",
        )
        .unwrap();
        std::fs::write(&st_path, "bar 250 150\n").unwrap();

        let cli = Cli::try_parse_from([
            "hashtrace",
            cg_path.to_str().unwrap(),
            st_path.to_str().unwrap(),
            "5",
            "2",
        ])
        .unwrap();
        run(&cli).unwrap();
    }

    #[test]
    fn missing_input_file_is_an_error() {
        let cli =
            Cli::try_parse_from(["hashtrace", "/no/such/cg.txt", "/no/such/st.txt", "5", "2"])
                .unwrap();
        assert!(run(&cli).is_err());
    }
}
