// Portfolio assembly: identical parallel solver threads collapse into one
// multi-threaded thread, and the remaining members can be written out as a
// portfolio file for solvers that take one.

use super::{CompiledThread, ITERATIVE_TAG, ParamValue, ParsedParameters};
use itertools::Itertools;
use log::{debug, info};
use std::collections::BTreeMap;
use std::io::Write;

/// Threads holding a parameter tagged `ITERATIVE`, in index order.
pub fn parallel_threads(parsed: &ParsedParameters) -> Vec<usize> {
    parsed
        .threads
        .iter()
        .filter(|(_, spec)| {
            spec.params
                .keys()
                .any(|name| parsed.tags.has_tag(name, ITERATIVE_TAG))
        })
        .map(|(&index, _)| index)
        .collect()
}

/// Merges every parallel thread with all threads sharing its solver binary.
///
/// The merged threads are removed and the parallel thread is kept at its own
/// index, with each `ITERATIVE` parameter set to the number of threads merged.
/// Threads without a solver binary are left alone. Returns representative
/// index -> merged count.
pub fn join_parallel_threads(parsed: &mut ParsedParameters) -> BTreeMap<usize, usize> {
    let mut merged = BTreeMap::new();
    for thread in parallel_threads(parsed) {
        let Some(spec) = parsed.threads.get(&thread) else {
            continue;
        };
        let Some(solver) = spec.solver.clone() else {
            debug!("thread {}: no solver binary, not merging", thread);
            continue;
        };
        let duplicates = parsed
            .threads
            .iter()
            .filter(|(_, s)| s.solver.as_deref() == Some(solver.as_str()))
            .map(|(&index, _)| index)
            .collect_vec();
        let mut representative = None;
        for index in &duplicates {
            let removed = parsed.threads.remove(index);
            if *index == thread {
                representative = removed;
            }
        }
        let Some(mut representative) = representative else {
            continue;
        };
        let count = duplicates.len();
        for (name, value) in representative.params.iter_mut() {
            if parsed.tags.has_tag(name, ITERATIVE_TAG) {
                *value = ParamValue::Scalar(count.to_string());
            }
        }
        info!(
            "merged threads {:?} running {} into thread {}",
            duplicates, solver, thread
        );
        parsed.threads.insert(thread, representative);
        merged.insert(thread, count);
    }
    merged
}

/// Writes one `[<index>]: <args>` line per thread.
pub fn write_portfolio<'a, W: Write>(
    mut out: W,
    threads: impl IntoIterator<Item = &'a CompiledThread>,
) -> std::io::Result<()> {
    for thread in threads {
        writeln!(out, "[{}]: {}", thread.index, thread.args.iter().join(" "))?;
    }
    out.flush()
}
