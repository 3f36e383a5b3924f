//! Debug script to print percentile scores for a small synthetic group

use ejmetrics::config::Orientation;
use ejmetrics::percentile::{pct_rank, scale};
use std::fs::File;
use std::io::Write;

fn main() -> std::io::Result<()> {
    // Ties, a zero and a wide spread, as seen in the PM25 and SLR columns.
    let values = [0.0, 0.38, 0.38, 1.2, 4.75, 4.75, 4.75, 9.9, 12.0, 57.3];

    let mut file = File::create("percentile_debug.txt")?;
    writeln!(file, "=== PERCENTILE DEBUG ({} values) ===", values.len())?;
    writeln!(file)?;
    writeln!(file, "{:>8}  {:>8} {:>5}  {:>8} {:>5}", "value", "asc", "P", "desc", "P")?;

    let up = pct_rank(&values, Orientation::Ascending);
    let down = pct_rank(&values, Orientation::Descending);
    for ((value, a), d) in values.iter().zip(&up).zip(&down) {
        writeln!(
            file,
            "{:>8.2}  {:>8.4} {:>5}  {:>8.4} {:>5}",
            value,
            a,
            scale(*a),
            d,
            scale(*d)
        )?;
    }

    println!("Percentile debug written to percentile_debug.txt");
    Ok(())
}
