//! The transfer index: an append-only text file, one in-progress destination
//! per line, consulted by the startup cleanup to find leftovers without
//! scanning the whole drive.

use std::{
    fs::OpenOptions,
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use log::debug;

/// Append a destination to the index.
pub fn store(index: &Path, destination: &Path) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(index)?;
    writeln!(file, "{}", destination.display())?;

    debug!("Stored {} in transfer index", destination.display());
    Ok(())
}

/// Read all destinations out of the index. Blank lines are skipped so a
/// partially flushed append does not take the whole index down.
pub fn entries(index: &Path) -> io::Result<Vec<PathBuf>> {
    let file = std::fs::File::open(index)?;

    let mut result = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if !line.is_empty() {
            result.push(PathBuf::from(line));
        }
    }

    Ok(result)
}
