//! Classification of solver output into a [`ResultRecord`].
//!
//! Structured (JSON) output wins over text patterns. Timeouts, unknown
//! answers and unparseable output all end in a classified record; nothing in
//! here returns an error.

use crate::executor::run::RunOutput;
use crate::instance::VariableMap;
use itertools::Itertools;
use log::{info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Sat,
    Unsat,
    Timeout,
    Crashed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Sat => "SAT",
            Status::Unsat => "UNSAT",
            Status::Timeout => "TIMEOUT",
            Status::Crashed => "CRASHED",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResultRecord {
    pub status: Status,
    /// Seconds.
    pub runtime: f64,
    pub seed: i64,
    /// Signed original variable ids, present only for `SAT`.
    pub assignment: Option<Vec<i64>>,
}

impl ResultRecord {
    pub fn new(status: Status, runtime: f64, seed: i64) -> Self {
        Self {
            status,
            runtime,
            seed,
            assignment: None,
        }
    }
}

/// `status, runtime, runlength, quality, seed[, assignment]`
impl fmt::Display for ResultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {:.6}, -1, -1, {}", self.status, self.runtime, self.seed)?;
        if let Some(assignment) = &self.assignment {
            write!(f, ", {}", assignment.iter().join(";"))?;
        }
        Ok(())
    }
}

static SUPERVISOR_TIMEOUT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Maximum (CPU|wall clock) time exceeded").unwrap());
static UNKNOWN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^s\s+UNKNOWN\b|\bINDETERMINATE\b").unwrap());
static UNSAT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bUNSATISFIABLE\b").unwrap());
static SAT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bSATISFIABLE\b").unwrap());
static SUPERVISOR_TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"CPU time \(s\): (\d+(?:\.\d*)?)").unwrap());
static TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\btime\b[^0-9\n]*([0-9]+(?:\.[0-9]+)?)").unwrap());
static VALUE_LINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^v((?:[ \t]+-?\d+)+)[ \t]*\r?$").unwrap());

// Conventional SAT-competition exit codes.
const EXIT_SAT: i32 = 10;
const EXIT_UNSAT: i32 = 20;

/// Outcome before the assignment is decoded.
#[derive(Debug, PartialEq)]
struct Verdict {
    status: Status,
    runtime: f64,
    literals: Option<Vec<i64>>,
}

impl Verdict {
    fn bare(status: Status, runtime: f64) -> Self {
        Self {
            status,
            runtime,
            literals: None,
        }
    }
}

/// Classifies one run. `cutoff` is the limit the caller asked for and is the
/// runtime reported for timeouts. Assignments are decoded through `map` when
/// the instance was renumbered.
pub fn classify(output: &RunOutput, cutoff: f64, seed: i64, map: Option<&VariableMap>) -> ResultRecord {
    let wall = output.elapsed.as_secs_f64();
    let verdict = if output.timed_out() {
        Verdict::bare(Status::Timeout, cutoff)
    } else if let Some(structured) = structured_output(&output.stdout) {
        match structured {
            Ok(json) => classify_json(&json, cutoff, wall),
            Err(e) => {
                warn!("error reading structured solver output: {}", e);
                Verdict::bare(Status::Timeout, cutoff)
            }
        }
    } else {
        classify_text(&output.stdout, output.exit_code(), cutoff, wall)
    };

    let mut record = ResultRecord::new(verdict.status, verdict.runtime, seed);
    if verdict.status == Status::Sat
        && let Some(literals) = verdict.literals
    {
        let decoded = match map {
            Some(map) => map.decode_all(&literals),
            None => Ok(literals),
        };
        match decoded {
            Ok(assignment) => record.assignment = Some(assignment),
            Err(e) => {
                warn!("assignment does not match the instance: {}", e);
                record = ResultRecord::new(Status::Crashed, wall, seed);
            }
        }
    }
    if record.status == Status::Crashed {
        warn!(
            "unrecognized solver output (exit code {:?})\nstdout: {}\nstderr: {}",
            output.exit_code(),
            output.stdout.trim_end(),
            output.stderr.trim_end()
        );
    }
    info!("classified as {} in {:.3}s", record.status, record.runtime);
    record
}

/// The JSON object starting on the first line that opens with `{` and ending
/// at the last `}`. Supervisor banners and comment lines may precede it.
/// `None` when no line opens an object.
fn structured_output(stdout: &str) -> Option<Result<JsonValue, serde_json::Error>> {
    let line_start = std::iter::once(0)
        .chain(stdout.match_indices('\n').map(|(i, _)| i + 1))
        .find(|&i| stdout[i..].trim_start_matches([' ', '\t']).starts_with('{'))?;
    let start = line_start + stdout[line_start..].find('{')?;
    let end = stdout
        .rfind('}')
        .filter(|&i| i > start)
        .map_or(stdout.len(), |i| i + 1);
    Some(serde_json::from_str(&stdout[start..end]))
}

fn classify_json(json: &JsonValue, cutoff: f64, wall: f64) -> Verdict {
    let result = json.get("Result").and_then(JsonValue::as_str);
    let time = json
        .pointer("/Stats/Time/Total")
        .or_else(|| json.pointer("/Time/Total"))
        .and_then(JsonValue::as_f64);
    let (Some(result), Some(time)) = (result, time) else {
        return Verdict::bare(Status::Timeout, cutoff);
    };
    match result {
        "SATISFIABLE" | "OPTIMUM FOUND" => Verdict {
            status: Status::Sat,
            runtime: time,
            literals: json_witness(json),
        },
        "UNSATISFIABLE" => Verdict::bare(Status::Unsat, time),
        "UNKNOWN" => Verdict::bare(Status::Timeout, cutoff),
        other => {
            warn!("unexpected structured result {:?}", other);
            Verdict::bare(Status::Crashed, wall)
        }
    }
}

/// Literals of the last witness of the last call.
fn json_witness(json: &JsonValue) -> Option<Vec<i64>> {
    let values = json
        .get("Call")?
        .as_array()?
        .iter()
        .rev()
        .find_map(|call| call.get("Witnesses")?.as_array()?.last()?.get("Value")?.as_array())?;
    Some(
        values
            .iter()
            .filter_map(|v| match v {
                JsonValue::Number(n) => n.as_i64(),
                JsonValue::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .filter(|&lit| lit != 0)
            .collect(),
    )
}

fn classify_text(stdout: &str, exit_code: Option<i32>, cutoff: f64, wall: f64) -> Verdict {
    if SUPERVISOR_TIMEOUT_RE.is_match(stdout) {
        return Verdict::bare(Status::Timeout, cutoff);
    }
    if UNKNOWN_RE.is_match(stdout) {
        return Verdict::bare(Status::Crashed, wall);
    }
    if UNSAT_RE.is_match(stdout) {
        return Verdict::bare(Status::Unsat, text_runtime(stdout).unwrap_or(wall));
    }
    if SAT_RE.is_match(stdout) {
        return Verdict {
            status: Status::Sat,
            runtime: text_runtime(stdout).unwrap_or(wall),
            literals: text_witness(stdout),
        };
    }
    match exit_code {
        Some(EXIT_SAT) => Verdict {
            status: Status::Sat,
            runtime: wall,
            literals: text_witness(stdout),
        },
        Some(EXIT_UNSAT) => Verdict::bare(Status::Unsat, wall),
        _ => Verdict::bare(Status::Crashed, wall),
    }
}

fn text_runtime(stdout: &str) -> Option<f64> {
    [&*SUPERVISOR_TIME_RE, &*TIME_RE]
        .iter()
        .find_map(|re| re.captures(stdout)?.get(1)?.as_str().parse().ok())
}

fn text_witness(stdout: &str) -> Option<Vec<i64>> {
    let literals = VALUE_LINE_RE
        .captures_iter(stdout)
        .flat_map(|c| {
            c.get(1)
                .map_or("", |m| m.as_str())
                .split_whitespace()
                .filter_map(|t| t.parse::<i64>().ok())
                .collect_vec()
        })
        .filter(|&lit| lit != 0)
        .collect_vec();
    (!literals.is_empty()).then_some(literals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::run::Termination;
    use crate::instance::normalize_stream;
    use std::time::Duration;

    fn completed(stdout: &str, exit_code: i32) -> RunOutput {
        RunOutput {
            termination: Termination::Completed {
                exit_code: Some(exit_code),
            },
            stdout: stdout.to_owned(),
            stderr: String::new(),
            elapsed: Duration::from_millis(1500),
        }
    }

    #[test]
    fn timeout_reports_the_requested_cutoff() {
        let out = RunOutput {
            termination: Termination::TimedOut,
            stdout: "s SATISFIABLE\n".into(),
            stderr: String::new(),
            elapsed: Duration::from_millis(12),
        };
        let r = classify(&out, 0.0001, 7, None);
        assert_eq!(r, ResultRecord::new(Status::Timeout, 0.0001, 7));
        assert_eq!(r.to_string(), "TIMEOUT, 0.000100, -1, -1, 7");
    }

    #[test]
    fn empty_or_unrecognized_output_is_a_crash() {
        for out in [completed("", 0), completed("Segmentation fault\n", 139), completed("", 1)] {
            let r = classify(&out, 10.0, 1, None);
            assert_eq!(r.status, Status::Crashed);
            assert_eq!(r.runtime, 1.5);
        }
    }

    #[test]
    fn unknown_answer_is_a_crash() {
        let r = classify(&completed("s UNKNOWN\n", 0), 10.0, 1, None);
        assert_eq!(r.status, Status::Crashed);
    }

    #[test]
    fn text_sat_with_assignment_is_decoded() {
        let mut sink = Vec::new();
        let (map, _) = normalize_stream("p cnf 50 2\n30 -41 0\n-30 50 0\n".as_bytes(), &mut sink).unwrap();
        let stdout = "c solving\ns SATISFIABLE\nv 1 -2\nv 3 0\nc CPU time : 0.25 s\n";
        let r = classify(&completed(stdout, 10), 10.0, 3, Some(&map));
        assert_eq!(r.status, Status::Sat);
        assert_eq!(r.runtime, 0.25);
        assert_eq!(r.assignment, Some(vec![30, -41, 50]));
        assert_eq!(r.to_string(), "SAT, 0.250000, -1, -1, 3, 30;-41;50");
    }

    #[test]
    fn supervisor_cpu_time_wins_over_other_times() {
        let stdout = "s UNSATISFIABLE\nc total time 9.5\nCPU time (s): 1.75\n";
        let r = classify(&completed(stdout, 20), 10.0, 0, None);
        assert_eq!((r.status, r.runtime), (Status::Unsat, 1.75));
        assert_eq!(r.assignment, None);
    }

    #[test]
    fn supervisor_timeout_message() {
        let r = classify(&completed("Maximum CPU time exceeded: sending SIGTERM\n", 0), 60.0, 0, None);
        assert_eq!((r.status, r.runtime), (Status::Timeout, 60.0));
    }

    #[test]
    fn exit_codes_classify_silent_solvers() {
        assert_eq!(classify(&completed("", 10), 5.0, 0, None).status, Status::Sat);
        let r = classify(&completed("", 20), 5.0, 0, None);
        assert_eq!((r.status, r.runtime), (Status::Unsat, 1.5));
    }

    #[test]
    fn structured_output_takes_precedence() {
        let stdout = r#"{
  "Solver": "clasp version 2.1.3",
  "Result": "UNSATISFIABLE",
  "Stats": { "Time": { "Total": 0.042, "CPU": 0.04 } },
  "Comment": "SATISFIABLE"
}"#;
        let r = classify(&completed(stdout, 20), 10.0, 0, None);
        assert_eq!((r.status, r.runtime), (Status::Unsat, 0.042));
    }

    #[test]
    fn structured_optimum_is_sat_with_witness() {
        let stdout = r#"{"Result": "OPTIMUM FOUND",
            "Call": [{"Witnesses": [{"Value": ["1", "-2"]}, {"Value": ["-1", "2"]}]}],
            "Time": {"Total": 1.25}}"#;
        let r = classify(&completed(stdout, 30), 10.0, 0, None);
        assert_eq!(r.status, Status::Sat);
        assert_eq!(r.runtime, 1.25);
        assert_eq!(r.assignment, Some(vec![-1, 2]));
    }

    #[test]
    fn structured_output_without_timing_or_truncated_is_a_timeout() {
        let no_time = r#"{"Result": "SATISFIABLE", "Stats": {}}"#;
        let r = classify(&completed(no_time, 10), 30.0, 0, None);
        assert_eq!((r.status, r.runtime), (Status::Timeout, 30.0));

        let unknown = r#"{"Result": "UNKNOWN", "Time": {"Total": 3.0}}"#;
        assert_eq!(classify(&completed(unknown, 0), 30.0, 0, None).status, Status::Timeout);

        let truncated = "{\n  \"Result\": \"SATISFIABLE\",\n  \"Stats\": {";
        let r = classify(&completed(truncated, 0), 30.0, 0, None);
        assert_eq!((r.status, r.runtime), (Status::Timeout, 30.0));
    }

    #[test]
    fn structured_output_after_a_preamble() {
        let stdout = "Enforcing wall clock limit (soft limit): 3 s\n\
            {\"Result\": \"UNKNOWN\", \"Stats\": {\"Time\": {\"Total\": 3.0}}}\n";
        let r = classify(&completed(stdout, 0), 30.0, 0, None);
        assert_eq!((r.status, r.runtime), (Status::Timeout, 30.0));

        let stdout = r#"c solving
{"Result": "SATISFIABLE",
 "Call": [{"Witnesses": [{"Value": ["1", "-2"]}]}],
 "Time": {"Total": 0.5}}
CPU time (s): 0.7
"#;
        let r = classify(&completed(stdout, 10), 30.0, 0, None);
        assert_eq!((r.status, r.runtime), (Status::Sat, 0.5));
        assert_eq!(r.assignment, Some(vec![1, -2]));
    }

    #[test]
    fn unexpected_structured_result_is_a_crash_at_wall_time() {
        let stdout = r#"{"Result": "INTERRUPTED", "Time": {"Total": 4.0}}"#;
        let r = classify(&completed(stdout, 0), 30.0, 0, None);
        assert_eq!((r.status, r.runtime), (Status::Crashed, 1.5));
    }

    #[test]
    fn undecodable_assignment_is_a_crash() {
        let mut sink = Vec::new();
        let (map, _) = normalize_stream("4 0\n".as_bytes(), &mut sink).unwrap();
        let r = classify(&completed("s SATISFIABLE\nv 1 2 0\n", 10), 10.0, 0, Some(&map));
        assert_eq!(r.status, Status::Crashed);
        assert_eq!(r.assignment, None);
    }

    #[test]
    fn record_serializes_with_uppercase_status() {
        let mut r = ResultRecord::new(Status::Sat, 0.5, 1);
        r.assignment = Some(vec![1, -2]);
        assert_eq!(
            serde_json::to_string(&r).unwrap(),
            r#"{"status":"SAT","runtime":0.5,"seed":1,"assignment":[1,-2]}"#
        );
    }
}
