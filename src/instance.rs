//! CNF instance renumbering.
//!
//! Solvers handle sparse or very large variable identifiers badly, so every
//! instance is rewritten with variables numbered `1..=n` in order of first
//! appearance. The [`VariableMap`] keeps the way back.

use log::{debug, warn};
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("line {line}: invalid literal {token:?}")]
    InvalidLiteral { line: usize, token: String },
    #[error("line {line}: clause is not terminated by 0")]
    MissingTerminator { line: usize },
    #[error("line {line}: problem line defined twice")]
    DuplicateHeader { line: usize },
    #[error("line {line}: malformed problem line")]
    MalformedHeader { line: usize },
    #[error("variable {0} does not occur in the instance")]
    UnknownVariable(i64),
}

/// Bijection between original variable ids and dense ids `1..=n`.
#[derive(Clone, Debug, Default)]
pub struct VariableMap {
    to_dense: FxHashMap<i64, i64>,
    to_original: Vec<i64>,
}

impl VariableMap {
    fn dense_id(&mut self, original: i64) -> i64 {
        if let Some(&dense) = self.to_dense.get(&original) {
            return dense;
        }
        self.to_original.push(original);
        let dense = self.to_original.len() as i64;
        self.to_dense.insert(original, dense);
        dense
    }

    pub fn len(&self) -> usize {
        self.to_original.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_original.is_empty()
    }

    /// Renumbers an original literal, keeping its sign.
    pub fn encode(&self, literal: i64) -> Option<i64> {
        let dense = *self.to_dense.get(&literal.checked_abs()?)?;
        Some(dense * literal.signum())
    }

    /// Maps a dense literal back to the original variable, keeping its sign.
    pub fn decode(&self, literal: i64) -> Option<i64> {
        let index = usize::try_from(literal.unsigned_abs()).ok()?.checked_sub(1)?;
        let original = *self.to_original.get(index)?;
        Some(original * literal.signum())
    }

    pub fn decode_all(&self, literals: &[i64]) -> Result<Vec<i64>, InstanceError> {
        literals
            .iter()
            .map(|&l| self.decode(l).ok_or(InstanceError::UnknownVariable(l)))
            .collect()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InstanceStats {
    pub variables: usize,
    pub clauses: usize,
}

enum Line {
    Comment(String),
    Clause(Vec<i64>),
}

/// Renumbers a CNF stream from `reader` into `writer`.
///
/// Comments are kept in place and the problem line is regenerated in front of
/// the first clause. A line starting with `%` ends the formula.
pub fn normalize_stream<R: BufRead, W: Write>(
    reader: R,
    mut writer: W,
) -> Result<(VariableMap, InstanceStats), InstanceError> {
    let mut map = VariableMap::default();
    let mut lines = Vec::new();
    let mut clause = Vec::new();
    let mut declared = None;
    let mut line_no = 0;

    for line in reader.lines() {
        let line = line?;
        line_no += 1;
        let trimmed = line.trim_start();
        match trimmed.chars().next() {
            None => continue,
            Some('c') => {
                lines.push(Line::Comment(line.clone()));
                continue;
            }
            Some('%') => break,
            Some('p') => {
                if declared.is_some() {
                    return Err(InstanceError::DuplicateHeader { line: line_no });
                }
                declared = Some(parse_header(trimmed, line_no)?);
                continue;
            }
            _ => {}
        }
        for token in trimmed.split_whitespace() {
            let literal: i64 = token.parse().map_err(|_| InstanceError::InvalidLiteral {
                line: line_no,
                token: token.to_owned(),
            })?;
            if literal == 0 {
                lines.push(Line::Clause(std::mem::take(&mut clause)));
                continue;
            }
            let Some(variable) = literal.checked_abs() else {
                return Err(InstanceError::InvalidLiteral {
                    line: line_no,
                    token: token.to_owned(),
                });
            };
            clause.push(map.dense_id(variable) * literal.signum());
        }
    }
    if !clause.is_empty() {
        return Err(InstanceError::MissingTerminator { line: line_no });
    }

    let stats = InstanceStats {
        variables: map.len(),
        clauses: lines.iter().filter(|l| matches!(l, Line::Clause(_))).count(),
    };
    if let Some((variables, clauses)) = declared
        && clauses != stats.clauses
    {
        warn!(
            "problem line declares {} variables / {} clauses, found {} / {}",
            variables, clauses, stats.variables, stats.clauses
        );
    }

    let mut header_written = false;
    for line in &lines {
        match line {
            Line::Comment(text) => writeln!(writer, "{}", text)?,
            Line::Clause(lits) => {
                if !header_written {
                    writeln!(writer, "p cnf {} {}", stats.variables, stats.clauses)?;
                    header_written = true;
                }
                for lit in lits {
                    write!(writer, "{} ", lit)?;
                }
                writeln!(writer, "0")?;
            }
        }
    }
    if !header_written {
        writeln!(writer, "p cnf {} {}", stats.variables, stats.clauses)?;
    }
    writer.flush()?;
    Ok((map, stats))
}

fn parse_header(line: &str, line_no: usize) -> Result<(usize, usize), InstanceError> {
    let malformed = || InstanceError::MalformedHeader { line: line_no };
    let mut fields = line.split_whitespace().skip(2);
    let variables = fields.next().and_then(|s| s.parse().ok()).ok_or_else(malformed)?;
    let clauses = fields.next().and_then(|s| s.parse().ok()).ok_or_else(malformed)?;
    Ok((variables, clauses))
}

/// A renumbered copy of an instance. The file is deleted on drop.
pub struct NormalizedInstance {
    file: NamedTempFile,
    pub map: VariableMap,
    pub stats: InstanceStats,
}

impl NormalizedInstance {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Writes a renumbered copy of `instance` into `workdir`.
pub fn normalize(instance: &Path, workdir: &Path) -> Result<NormalizedInstance, InstanceError> {
    let reader = BufReader::new(File::open(instance)?);
    let file = tempfile::Builder::new()
        .prefix("instance_")
        .suffix(".cnf")
        .tempfile_in(workdir)?;
    let (map, stats) = normalize_stream(reader, BufWriter::new(file.as_file()))?;
    debug!(
        "normalized {:?} -> {:?}: {} variables, {} clauses",
        instance,
        file.path(),
        stats.variables,
        stats.clauses
    );
    Ok(NormalizedInstance { file, map, stats })
}
