//! Static call-graph model and its reverse-edge view.
//!
//! The graph is parsed from the text dump the instrumentation pass extracts
//! from a binary: per-type indirect targets and call sites, per-function
//! direct and indirect call sites, and the symbol table. After parsing, the
//! reverse adjacency (`target -> [(caller, site)]`) is derived by inverting
//! direct edges and fanning each indirect site out to every target that is
//! type-compatible with it. The fan-out over-approximates real dispatch, so
//! the reverse graph may hold spurious edges; downstream matching discards
//! spurious candidates by hash verification.

use std::io::{self, Read, Write};

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::core::types::{CallSite, Pc, TypeId};

const INDIRECT_TARGET_TYPES: &str = "INDIRECT TARGETS TYPES";
const INDIRECT_CALL_TYPES: &str = "INDIRECT CALLS TYPES";
const INDIRECT_CALL_SITES: &str = "INDIRECT CALL SITES";
const DIRECT_CALL_SITES: &str = "DIRECT CALL SITES";
const FUNCTION_SYMBOLS: &str = "FUNCTION SYMBOLS";

const SECTION_HEADERS: [&str; 5] = [
    INDIRECT_TARGET_TYPES,
    INDIRECT_CALL_TYPES,
    INDIRECT_CALL_SITES,
    DIRECT_CALL_SITES,
    FUNCTION_SYMBOLS,
];

/// Call-graph dump parse errors. Structural problems are fatal; a missing
/// type-id cross reference is not an error at all (instrumentation coverage
/// is allowed to be incomplete) and simply contributes no edges.
#[derive(Error, Debug)]
pub enum CallGraphError {
    #[error("duplicate \"{0}\" section")]
    DuplicateSection(&'static str),
    #[error("line {line}: invalid address \"{token}\"")]
    InvalidAddress { line: usize, token: String },
    #[error("line {line}: direct call site without a target")]
    UnpairedDirectSite { line: usize },
    #[error("line {line}: missing {what}")]
    MissingField { line: usize, what: &'static str },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A program's call graph: the five parsed tables plus the derived reverse
/// adjacency, which is rebuilt wholesale whenever the tables change.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CallGraph {
    /// Per type id, the entry addresses an indirect call of that type may
    /// reach.
    indirect_targets: FxHashMap<TypeId, Vec<Pc>>,
    /// Per type id, the indirect call sites of that type.
    indirect_site_types: FxHashMap<TypeId, Vec<Pc>>,
    /// Indirect call sites inside each function.
    caller_indirect_sites: FxHashMap<Pc, Vec<Pc>>,
    /// Resolved direct edges inside each function: `(site, target)`.
    caller_direct_sites: FxHashMap<Pc, Vec<(Pc, Pc)>>,
    direct_sites: FxHashSet<Pc>,
    indirect_sites: FxHashSet<Pc>,
    name_by_entry: FxHashMap<Pc, String>,
    entry_by_name: FxHashMap<String, Pc>,
    /// Derived: every `(caller, site)` pair that can transfer control to a
    /// target. Duplicates are preserved; multiplicity is meaningful to the
    /// walk statistics.
    reverse: FxHashMap<Pc, Vec<CallSite>>,
}

impl CallGraph {
    /// Reads a call-graph dump. Sections may appear in any order separated
    /// by blank lines; unknown section headers are ignored; a repeated
    /// header or an unparseable body line is fatal.
    pub fn parse<R: Read>(mut reader: R) -> Result<CallGraph, CallGraphError> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        Self::parse_str(&text)
    }

    fn parse_str(text: &str) -> Result<CallGraph, CallGraphError> {
        let mut graph = CallGraph::default();
        let mut seen: FxHashSet<&'static str> = FxHashSet::default();
        let mut lines = text.lines().enumerate();

        while let Some((_, line)) = lines.next() {
            let Some(header) = SECTION_HEADERS.iter().copied().find(|h| line.starts_with(h)) else {
                continue;
            };
            if !seen.insert(header) {
                return Err(CallGraphError::DuplicateSection(header));
            }
            for (idx, line) in lines.by_ref() {
                if line.is_empty() {
                    break;
                }
                graph.parse_body_line(header, line, idx + 1)?;
            }
        }

        for (&entry, name) in &graph.name_by_entry {
            graph.entry_by_name.insert(name.clone(), entry);
        }
        graph.rebuild_reverse();
        Ok(graph)
    }

    fn parse_body_line(
        &mut self,
        header: &'static str,
        line: &str,
        lineno: usize,
    ) -> Result<(), CallGraphError> {
        let mut tokens = line.split_whitespace();
        let missing = |what| CallGraphError::MissingField { line: lineno, what };

        match header {
            INDIRECT_TARGET_TYPES => {
                let typeid = parse_hex(tokens.next().ok_or(missing("type id"))?, lineno)?;
                let targets = parse_hex_all(tokens, lineno)?;
                self.indirect_targets.entry(typeid).or_default().extend(targets);
            }
            INDIRECT_CALL_TYPES => {
                let typeid = parse_hex(tokens.next().ok_or(missing("type id"))?, lineno)?;
                let sites = parse_hex_all(tokens, lineno)?;
                self.indirect_site_types.entry(typeid).or_default().extend(sites);
            }
            INDIRECT_CALL_SITES => {
                let caller = parse_hex(tokens.next().ok_or(missing("caller address"))?, lineno)?;
                let sites = parse_hex_all(tokens, lineno)?;
                self.indirect_sites.extend(sites.iter().copied());
                self.caller_indirect_sites.entry(caller).or_default().extend(sites);
            }
            DIRECT_CALL_SITES => {
                let caller = parse_hex(tokens.next().ok_or(missing("caller address"))?, lineno)?;
                let rest = parse_hex_all(tokens, lineno)?;
                if rest.len() % 2 != 0 {
                    return Err(CallGraphError::UnpairedDirectSite { line: lineno });
                }
                let edges = self.caller_direct_sites.entry(caller).or_default();
                for pair in rest.chunks(2) {
                    edges.push((pair[0], pair[1]));
                    self.direct_sites.insert(pair[0]);
                }
            }
            FUNCTION_SYMBOLS => {
                let entry = parse_hex(tokens.next().ok_or(missing("entry address"))?, lineno)?;
                let name = tokens.next().ok_or(missing("symbol name"))?;
                self.name_by_entry.insert(entry, name.to_string());
            }
            _ => unreachable!("unknown section header \"{header}\""),
        }
        Ok(())
    }

    /// Recomputes the reverse adjacency from the source tables: indirect
    /// fan-out first, then inverted direct edges. Caller tables are walked
    /// in sorted-key order so the per-target edge vectors, and with them the
    /// walk order and statistics, are identical across runs.
    fn rebuild_reverse(&mut self) {
        self.reverse.clear();

        let mut type_by_site: FxHashMap<Pc, TypeId> = FxHashMap::default();
        for (&typeid, sites) in &self.indirect_site_types {
            for &site in sites {
                type_by_site.insert(site, typeid);
            }
        }

        let mut callers: Vec<Pc> = self.caller_indirect_sites.keys().copied().collect();
        callers.sort_unstable();
        for caller in callers {
            for &site in &self.caller_indirect_sites[&caller] {
                // Sites without a recorded type, and types without recorded
                // targets, contribute no edges.
                let Some(typeid) = type_by_site.get(&site) else {
                    continue;
                };
                let Some(targets) = self.indirect_targets.get(typeid) else {
                    continue;
                };
                for &target in targets {
                    self.reverse.entry(target).or_default().push(CallSite { caller, site });
                }
            }
        }

        let mut callers: Vec<Pc> = self.caller_direct_sites.keys().copied().collect();
        callers.sort_unstable();
        for caller in callers {
            for &(site, target) in &self.caller_direct_sites[&caller] {
                self.reverse.entry(target).or_default().push(CallSite { caller, site });
            }
        }
    }

    /// Entry address of a symbol, if the symbol table knows it.
    pub fn entry_by_name(&self, name: &str) -> Option<Pc> {
        self.entry_by_name.get(name).copied()
    }

    pub fn name_by_entry(&self, entry: Pc) -> Option<&str> {
        self.name_by_entry.get(&entry).map(String::as_str)
    }

    /// Every `(caller, site)` edge that can reach `target`, in rebuild
    /// order. Empty for unknown targets.
    pub fn callers_of(&self, target: Pc) -> &[CallSite] {
        self.reverse.get(&target).map_or(&[], Vec::as_slice)
    }

    pub fn is_direct_site(&self, pc: Pc) -> bool {
        self.direct_sites.contains(&pc)
    }

    pub fn is_indirect_site(&self, pc: Pc) -> bool {
        self.indirect_sites.contains(&pc)
    }

    /// Writes the source tables back out in the dump format, sections in a
    /// fixed order and keys sorted. Reparsing the output reproduces the
    /// graph.
    pub fn write_dump(&self, out: &mut dyn Write) -> io::Result<()> {
        write_keyed_section(out, INDIRECT_TARGET_TYPES, &self.indirect_targets)?;
        write_keyed_section(out, INDIRECT_CALL_TYPES, &self.indirect_site_types)?;
        write_keyed_section(out, INDIRECT_CALL_SITES, &self.caller_indirect_sites)?;

        writeln!(out, "{DIRECT_CALL_SITES}")?;
        let mut callers: Vec<Pc> = self.caller_direct_sites.keys().copied().collect();
        callers.sort_unstable();
        for caller in callers {
            write!(out, "{caller:x}")?;
            for &(site, target) in &self.caller_direct_sites[&caller] {
                write!(out, " {site:x} {target:x}")?;
            }
            writeln!(out)?;
        }
        writeln!(out)?;

        writeln!(out, "{FUNCTION_SYMBOLS}")?;
        let mut entries: Vec<Pc> = self.name_by_entry.keys().copied().collect();
        entries.sort_unstable();
        for entry in entries {
            writeln!(out, "{entry:x} {}", self.name_by_entry[&entry])?;
        }
        writeln!(out)
    }

    /// Writes the reverse graph as `<caller> calls <target> at <site>`
    /// lines, substituting symbol names for entry addresses when `demangle`
    /// is set and the symbol is known.
    pub fn write_reverse(&self, out: &mut dyn Write, demangle: bool) -> io::Result<()> {
        let mut targets: Vec<Pc> = self.reverse.keys().copied().collect();
        targets.sort_unstable();
        for target in targets {
            for edge in &self.reverse[&target] {
                writeln!(
                    out,
                    "{} calls {} at 0x{:x}",
                    self.display_pc(edge.caller, demangle),
                    self.display_pc(target, demangle),
                    edge.site
                )?;
            }
        }
        Ok(())
    }

    fn display_pc(&self, pc: Pc, demangle: bool) -> String {
        if demangle {
            if let Some(name) = self.name_by_entry.get(&pc) {
                return name.clone();
            }
        }
        format!("0x{pc:x}")
    }
}

fn parse_hex(token: &str, lineno: usize) -> Result<u64, CallGraphError> {
    u64::from_str_radix(token, 16).map_err(|_| CallGraphError::InvalidAddress {
        line: lineno,
        token: token.to_string(),
    })
}

fn parse_hex_all<'a>(
    tokens: impl Iterator<Item = &'a str>,
    lineno: usize,
) -> Result<Vec<u64>, CallGraphError> {
    tokens.map(|token| parse_hex(token, lineno)).collect()
}

fn write_keyed_section(
    out: &mut dyn Write,
    header: &str,
    table: &FxHashMap<u64, Vec<Pc>>,
) -> io::Result<()> {
    writeln!(out, "{header}")?;
    let mut keys: Vec<u64> = table.keys().copied().collect();
    keys.sort_unstable();
    for key in keys {
        write!(out, "{key:x}")?;
        for &item in &table[&key] {
            write!(out, " {item:x}")?;
        }
        writeln!(out)?;
    }
    writeln!(out)
}
