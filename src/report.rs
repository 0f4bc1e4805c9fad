// SPDX-License-Identifier: MIT OR Apache-2.0

//! Human-facing summary formatting: elapsed time and the
//! per-namespace result table printed at the end of a run.

use std::time::Duration;

/// Formats a duration the way a short batch-job summary would: seconds
/// with millisecond precision below a minute, `MmSSs` at or above.
#[must_use]
pub fn format_elapsed(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    if total_secs < 60 {
        format!("{:.3}s", elapsed.as_secs_f64())
    } else {
        let minutes = total_secs / 60;
        let seconds = total_secs % 60;
        format!("{minutes}m{seconds:02}s")
    }
}

/// One row of the end-of-run summary table.
pub struct Row {
    pub namespace: String,
    pub outcome: String,
    pub bytes: u64,
    pub elapsed: Duration,
}

/// Renders a fixed-width text table, widest column first, matching the
/// plain stdout tables printed by command-line database tools rather
/// than a box-drawing pretty-printer.
#[must_use]
pub fn format_table(rows: &[Row]) -> String {
    let name_width = rows
        .iter()
        .map(|r| r.namespace.len())
        .max()
        .unwrap_or(0)
        .max("namespace".len());
    let outcome_width = rows
        .iter()
        .map(|r| r.outcome.len())
        .max()
        .unwrap_or(0)
        .max("result".len());

    let mut out = String::new();
    out.push_str(&format!(
        "{:name_width$}  {:outcome_width$}  {:>12}  {:>10}\n",
        "namespace", "result", "bytes", "elapsed"
    ));
    for row in rows {
        out.push_str(&format!(
            "{:name_width$}  {:outcome_width$}  {:>12}  {:>10}\n",
            row.namespace,
            row.outcome,
            row.bytes,
            format_elapsed(row.elapsed)
        ));
    }
    out
}
