//! Thread-indexed parameter compiler.
//!
//! Parameters arrive as flat `head value` pairs whose head follows
//! `-@<thread>:{<component>|F|S|<tag>:}*<name>`. Thread 0 holds the global
//! parameters; every other index describes one member of a solver portfolio.
//! The reserved names `solver`, `prefix` and `separator` set the thread's
//! solver binary and the way its arguments are rendered.

use log::{debug, warn};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};

pub mod flatten;
pub mod portfolio;

/// Tag marking the parameter that carries a solver's thread/iteration count.
pub const ITERATIVE_TAG: &str = "ITERATIVE";
pub const DEFAULT_PREFIX: &str = "--";
pub const DEFAULT_SEPARATOR: &str = "=";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("parameter head {0:?} has no value")]
    DanglingHead(String),
    #[error("thread {thread}: parameter {name:?} is used both with and without a component index")]
    MixedParameterKinds { thread: usize, name: String },
}

/// One `head value` pair of the input stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub head: String,
    pub value: String,
}

/// Pairs up a flat list of strings into tokens. Single quotes are stripped
/// from values.
pub fn read_tokens<S: AsRef<str>>(items: &[S]) -> Result<Vec<Token>, ConfigError> {
    if items.len() % 2 != 0 {
        let head = items.last().map(|s| s.as_ref().to_owned()).unwrap_or_default();
        return Err(ConfigError::DanglingHead(head));
    }
    Ok(items
        .chunks_exact(2)
        .map(|pair| Token {
            head: pair[0].as_ref().to_owned(),
            value: pair[1].as_ref().replace('\'', ""),
        })
        .collect())
}

// Configuration-space files cannot spell these characters directly.
const PCS_ESCAPES: [(&str, &str); 4] = [
    ("_AT_", "@"),
    ("_COLON_", ":"),
    ("_HYPHEN_", "-"),
    ("_PLUS_", "+"),
];

/// Decodes the `_AT_`, `_COLON_`, `_HYPHEN_` and `_PLUS_` escapes.
pub fn decode_escapes(s: &str) -> String {
    PCS_ESCAPES
        .iter()
        .fold(s.to_owned(), |acc, (from, to)| acc.replace(from, to))
}

/// Canonical text of a parameter value: an integer, else a float rounded to
/// four decimals (never in exponent notation), else the raw string.
pub fn normalize_value(raw: &str) -> String {
    if let Ok(i) = raw.parse::<i64>() {
        return i.to_string();
    }
    match raw.parse::<f64>() {
        Ok(f) if f.is_finite() => format_rounded(f),
        _ => raw.to_owned(),
    }
}

fn format_rounded(f: f64) -> String {
    // Beyond 1e15 an f64 has no fractional digits left to round.
    let rounded = if f.abs() < 1e15 {
        (f * 1e4).round() / 1e4
    } else {
        f
    };
    let s = rounded.to_string();
    if s.contains('.') { s } else { format!("{}.0", s) }
}

/// Value of one parameter inside a thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamValue {
    /// Plain value. The empty string renders as a bare flag.
    Scalar(String),
    /// Values keyed by component index, rendered comma-joined in index order.
    Components(BTreeMap<i64, String>),
}

pub type ThreadConfig = BTreeMap<String, ParamValue>;

/// Structured configuration of one thread before flattening.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadSpec {
    pub params: ThreadConfig,
    pub solver: Option<String>,
    pub prefix: String,
    pub separator: String,
}

impl ThreadSpec {
    fn new(prefix: &str, separator: &str) -> Self {
        Self {
            params: ThreadConfig::new(),
            solver: None,
            prefix: prefix.to_owned(),
            separator: separator.to_owned(),
        }
    }

    pub fn args(&self) -> Vec<String> {
        flatten::flatten(&self.params, &self.prefix, &self.separator)
    }
}

/// Tags seen for each parameter name, accumulated over all threads.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagIndex {
    tags: FxHashMap<String, BTreeSet<String>>,
}

impl TagIndex {
    fn add(&mut self, name: &str, tag: &str) {
        self.tags
            .entry(name.to_owned())
            .or_default()
            .insert(tag.to_owned());
    }

    pub fn tags(&self, name: &str) -> impl Iterator<Item = &str> {
        self.tags
            .get(name)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    pub fn has_tag(&self, name: &str, tag: &str) -> bool {
        self.tags.get(name).is_some_and(|set| set.contains(tag))
    }
}

/// Output of the thread passes, before portfolio merging.
#[derive(Clone, Debug, Default)]
pub struct ParsedParameters {
    pub threads: BTreeMap<usize, ThreadSpec>,
    pub tags: TagIndex,
}

#[derive(Debug)]
struct IndexedToken {
    thread: usize,
    key: String,
    value: String,
}

fn split_head(head: &str) -> Option<(usize, &str)> {
    let rest = head.strip_prefix("-@")?;
    let (index, key) = rest.split_once(':')?;
    Some((index.parse().ok()?, key))
}

#[derive(Debug, Default)]
struct Modifiers<'a> {
    flag: bool,
    skip: bool,
    component: Option<i64>,
    tags: Vec<&'a str>,
}

impl<'a> Modifiers<'a> {
    fn parse(segments: impl Iterator<Item = &'a str>) -> Self {
        let mut m = Modifiers::default();
        for segment in segments {
            match segment {
                "F" => m.flag = true,
                "S" => m.skip = true,
                _ => match segment.parse::<i64>() {
                    Ok(component) => m.component = Some(component),
                    Err(_) => m.tags.push(segment),
                },
            }
        }
        m
    }
}

/// Groups tokens by thread index and resolves every thread's parameters.
///
/// Each pass consumes the tokens of one thread index and defers the rest, so
/// thread indices may appear in any order and interleaved. Heads without a
/// `-@<thread>:` prefix are ignored with a warning.
pub fn parse_parameters(
    tokens: Vec<Token>,
    prefix: &str,
    separator: &str,
) -> Result<ParsedParameters, ConfigError> {
    let mut parsed = ParsedParameters::default();
    let mut pending = Vec::with_capacity(tokens.len());
    for token in tokens {
        match split_head(&token.head) {
            Some((thread, key)) => pending.push(IndexedToken {
                thread,
                key: key.to_owned(),
                value: token.value,
            }),
            None => warn!("ignoring parameter {:?}: no -@<thread>: prefix", token.head),
        }
    }

    let mut index = 0;
    loop {
        let mut spec = ThreadSpec::new(prefix, separator);
        let mut deferred = Vec::with_capacity(pending.len());
        for token in pending {
            if token.thread == index {
                consume(&mut spec, &mut parsed.tags, &token)?;
            } else {
                deferred.push(token);
            }
        }
        if index == 0 || !spec.params.is_empty() || spec.solver.is_some() {
            debug!(
                "thread {}: {} parameters, solver={:?}",
                index,
                spec.params.len(),
                spec.solver
            );
            parsed.threads.insert(index, spec);
        }
        pending = deferred;
        match pending.iter().map(|t| t.thread).min() {
            Some(next) => index = next,
            None => break,
        }
    }
    Ok(parsed)
}

fn consume(spec: &mut ThreadSpec, tags: &mut TagIndex, token: &IndexedToken) -> Result<(), ConfigError> {
    let (modifiers, name) = match token.key.rsplit_once(':') {
        Some((modifiers, name)) => (Some(modifiers), name),
        None => (None, token.key.as_str()),
    };
    if name == "solver" {
        spec.solver = Some(token.value.clone());
        return Ok(());
    }
    let value = normalize_value(&token.value.replace("__", ","));
    match name {
        "prefix" => {
            spec.prefix = value;
            return Ok(());
        }
        "separator" => {
            // "W" stands for a single space.
            spec.separator = if value == "W" { " ".to_owned() } else { value };
            return Ok(());
        }
        _ => {}
    }
    let Some(modifiers) = modifiers else {
        return set_scalar(spec, token.thread, name, value);
    };

    let m = Modifiers::parse(modifiers.split(':'));
    for tag in &m.tags {
        tags.add(name, tag);
    }
    if m.skip {
        return Ok(());
    }
    let value = match (m.flag, value.as_str()) {
        (true, "no") => return Ok(()),
        (true, "yes") => String::new(),
        _ => value,
    };
    match m.component {
        Some(component) => set_component(spec, token.thread, name, component, value),
        None => set_scalar(spec, token.thread, name, value),
    }
}

fn set_scalar(spec: &mut ThreadSpec, thread: usize, name: &str, value: String) -> Result<(), ConfigError> {
    if let Some(ParamValue::Components(_)) = spec.params.get(name) {
        return Err(ConfigError::MixedParameterKinds {
            thread,
            name: name.to_owned(),
        });
    }
    spec.params.insert(name.to_owned(), ParamValue::Scalar(value));
    Ok(())
}

fn set_component(
    spec: &mut ThreadSpec,
    thread: usize,
    name: &str,
    component: i64,
    value: String,
) -> Result<(), ConfigError> {
    let entry = spec
        .params
        .entry(name.to_owned())
        .or_insert_with(|| ParamValue::Components(BTreeMap::new()));
    match entry {
        ParamValue::Components(components) => {
            components.insert(component, value);
            Ok(())
        }
        ParamValue::Scalar(_) => Err(ConfigError::MixedParameterKinds {
            thread,
            name: name.to_owned(),
        }),
    }
}

/// One thread's final command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledThread {
    pub index: usize,
    pub args: Vec<String>,
    pub solver: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct CompiledConfig {
    pub threads: BTreeMap<usize, CompiledThread>,
    pub tags: TagIndex,
    /// Representative thread -> number of identical portfolio threads merged into it.
    pub merged: BTreeMap<usize, usize>,
}

impl CompiledConfig {
    pub fn global_args(&self) -> &[String] {
        self.threads.get(&0).map(|t| t.args.as_slice()).unwrap_or(&[])
    }

    /// Non-global threads in index order.
    pub fn members(&self) -> impl Iterator<Item = &CompiledThread> {
        self.threads.values().filter(|t| t.index > 0)
    }

    /// The solver binary: thread 0's if set, else the lowest thread naming one.
    pub fn solver(&self) -> Option<&str> {
        self.threads.values().find_map(|t| t.solver.as_deref())
    }
}

/// Compiles a flat token list into per-thread command lines, merging
/// identical parallel portfolio members.
pub fn compile<S: AsRef<str>>(items: &[S], prefix: &str, separator: &str) -> Result<CompiledConfig, ConfigError> {
    let tokens = read_tokens(items)?;
    let mut parsed = parse_parameters(tokens, prefix, separator)?;
    let merged = portfolio::join_parallel_threads(&mut parsed);
    let threads = parsed
        .threads
        .into_iter()
        .map(|(index, spec)| {
            let args = spec.args();
            (
                index,
                CompiledThread {
                    index,
                    args,
                    solver: spec.solver,
                },
            )
        })
        .collect();
    Ok(CompiledConfig {
        threads,
        tags: parsed.tags,
        merged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_default(items: &[&str]) -> CompiledConfig {
        compile(items, DEFAULT_PREFIX, DEFAULT_SEPARATOR).unwrap()
    }

    #[test]
    fn normalize_value_prefers_integers_then_rounded_floats() {
        assert_eq!(normalize_value("42"), "42");
        assert_eq!(normalize_value("+7"), "7");
        assert_eq!(normalize_value("0.123456"), "0.1235");
        assert_eq!(normalize_value("1.0"), "1.0");
        assert_eq!(normalize_value("6.37E8"), "637000000.0");
        assert_eq!(normalize_value("1e-9"), "0.0");
        assert_eq!(normalize_value("auto"), "auto");
        assert_eq!(normalize_value("nan"), "nan");
        assert_eq!(normalize_value("1,2"), "1,2");
    }

    #[test]
    fn bare_flag_on_yes_and_omitted_on_no() {
        let on = compile_default(&["-@0:F:verbose", "yes"]);
        assert_eq!(on.global_args(), ["--verbose"]);
        let off = compile_default(&["-@0:F:verbose", "no"]);
        assert!(off.global_args().is_empty());
    }

    #[test]
    fn components_join_in_index_order() {
        let c = compile_default(&["-@0:2:weight", "20", "-@0:1:weight", "10"]);
        assert_eq!(c.global_args(), ["--weight=10,20"]);
    }

    #[test]
    fn discovers_sparse_threads_in_any_order() {
        let c = compile_default(&[
            "-@5:a", "1", "-@0:g", "x", "-@2:b", "2", "-@0:h", "y", "-@5:c", "3",
        ]);
        assert_eq!(c.threads.keys().copied().collect::<Vec<_>>(), vec![0, 2, 5]);
        assert_eq!(c.global_args(), ["--g=x", "--h=y"]);
        assert_eq!(c.threads[&2].args, ["--b=2"]);
        assert_eq!(c.threads[&5].args, ["--a=1", "--c=3"]);
    }

    #[test]
    fn thread_zero_is_emitted_even_when_empty() {
        let c = compile_default(&["-@3:x", "1"]);
        assert!(c.threads[&0].args.is_empty());
        let empty = compile_default(&[]);
        assert_eq!(empty.threads.len(), 1);
    }

    #[test]
    fn solver_prefix_and_separator_are_meta_fields() {
        let c = compile_default(&[
            "-@1:solver", "/opt/my__solver",
            "-@1:prefix", "-",
            "-@1:separator", "W",
            "-@1:seed", "3",
            "-@0:seed", "4",
        ]);
        assert_eq!(c.threads[&1].solver.as_deref(), Some("/opt/my__solver"));
        assert_eq!(c.threads[&1].args, ["-seed", "3"]);
        // Overrides are local to the thread that sets them.
        assert_eq!(c.global_args(), ["--seed=4"]);
        assert_eq!(c.solver(), Some("/opt/my__solver"));
    }

    #[test]
    fn double_underscore_becomes_comma_and_quotes_are_stripped() {
        let c = compile_default(&["-@0:list", "'1__2__3'"]);
        assert_eq!(c.global_args(), ["--list=1,2,3"]);
    }

    #[test]
    fn skip_marker_discards_and_tags_accumulate_across_threads() {
        let c = compile_default(&[
            "-@0:S:heuristic", "vsids",
            "-@1:ITERATIVE:threads", "1",
            "-@2:SEARCH:threads", "1",
        ]);
        assert!(c.global_args().is_empty());
        let mut tags: Vec<_> = c.tags.tags("threads").collect();
        tags.sort();
        assert_eq!(tags, vec!["ITERATIVE", "SEARCH"]);
    }

    #[test]
    fn unknown_modifier_is_a_tag_and_last_scalar_wins() {
        let c = compile_default(&["-@0:X:eps", "0.5", "-@0:Y:eps", "0.25"]);
        assert_eq!(c.global_args(), ["--eps=0.25"]);
        assert!(c.tags.has_tag("eps", "X"));
        assert!(c.tags.has_tag("eps", "Y"));
    }

    #[test]
    fn stray_heads_are_ignored() {
        let c = compile_default(&["-algorithm", "clasp", "-@0:x", "1"]);
        assert_eq!(c.global_args(), ["--x=1"]);
    }

    #[test]
    fn odd_token_count_is_rejected() {
        let err = compile(&["-@0:x", "1", "-@0:y"], "--", "=").unwrap_err();
        assert!(matches!(err, ConfigError::DanglingHead(h) if h == "-@0:y"));
    }

    #[test]
    fn mixing_scalar_and_components_is_rejected() {
        let err = compile(&["-@0:w", "1", "-@0:1:w", "2"], "--", "=").unwrap_err();
        assert!(matches!(err, ConfigError::MixedParameterKinds { thread: 0, .. }));
        let err = compile(&["-@1:1:w", "2", "-@1:X:w", "1"], "--", "=").unwrap_err();
        assert!(matches!(err, ConfigError::MixedParameterKinds { thread: 1, .. }));
    }

    #[test]
    fn multi_digit_thread_indices() {
        let c = compile_default(&["-@12:x", "1", "-@1:y", "2"]);
        assert_eq!(c.threads[&12].args, ["--x=1"]);
        assert_eq!(c.threads[&1].args, ["--y=2"]);
    }

    #[test]
    fn decode_escapes_restores_reserved_characters() {
        assert_eq!(decode_escapes("_HYPHEN__AT_0_COLON_F_COLON_x"), "-@0:F:x");
        assert_eq!(decode_escapes("1e_PLUS_3"), "1e+3");
    }
}
