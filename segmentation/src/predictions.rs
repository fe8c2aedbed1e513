use std::{
    fs::File,
    io::{BufRead, BufReader, Write},
    path::Path,
};

use anyhow::{Context, Result};

use crate::config::write_atomically;

/// Writes one class label per line, in point order
pub fn write_predictions<P: AsRef<Path>>(path: P, labels: &[u8]) -> Result<()> {
    let path = path.as_ref();
    write_atomically(path, |writer| {
        for label in labels {
            writeln!(writer, "{}", label)
                .with_context(|| format!("Failed to write predictions to {}", path.display()))?;
        }
        Ok(())
    })
}

pub fn read_predictions<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("Could not open prediction file {}", path.display()))?;
    BufReader::new(file)
        .lines()
        .enumerate()
        .filter(|(_, line)| line.as_ref().map(|l| !l.trim().is_empty()).unwrap_or(true))
        .map(|(line_number, line)| {
            let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
            line.trim().parse::<u8>().with_context(|| {
                format!(
                    "Invalid label \"{}\" in line {} of {}",
                    line,
                    line_number + 1,
                    path.display()
                )
            })
        })
        .collect()
}
