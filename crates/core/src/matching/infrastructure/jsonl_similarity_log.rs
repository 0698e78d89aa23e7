use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use crate::matching::domain::similarity_log::{
    SimilarityLog, SimilarityLogError, SimilarityRecord,
};

/// Appends one JSON object per line to a file.
///
/// Records are encoded on the caller's thread and handed to a dedicated
/// writer thread over an unbounded channel, so file I/O never holds up a
/// match. Dropping the log drains the queue and flushes the file.
pub struct JsonlSimilarityLog {
    sender: Option<Sender<String>>,
    writer: Option<JoinHandle<()>>,
}

impl JsonlSimilarityLog {
    pub fn open(path: &Path) -> Result<Self, SimilarityLogError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (sender, receiver) = crossbeam_channel::unbounded::<String>();
        let path = path.to_path_buf();
        let writer = thread::Builder::new()
            .name("similarity-log".into())
            .spawn(move || write_lines(BufWriter::new(file), receiver, &path))?;
        Ok(Self {
            sender: Some(sender),
            writer: Some(writer),
        })
    }
}

fn write_lines(mut out: BufWriter<File>, lines: Receiver<String>, path: &Path) {
    let mut failed = false;
    for line in lines.iter() {
        if failed {
            continue;
        }
        let mut result = writeln!(out, "{line}");
        if result.is_ok() && lines.is_empty() {
            result = out.flush();
        }
        if let Err(e) = result {
            log::warn!("Similarity log {} stopped writing: {e}", path.display());
            failed = true;
        }
    }
    if !failed {
        if let Err(e) = out.flush() {
            log::warn!("Similarity log {} flush failed: {e}", path.display());
        }
    }
}

impl SimilarityLog for JsonlSimilarityLog {
    fn record(&self, record: &SimilarityRecord) -> Result<(), SimilarityLogError> {
        let line = serde_json::to_string(record)?;
        let sender = self.sender.as_ref().ok_or(SimilarityLogError::Closed)?;
        sender.send(line).map_err(|_| SimilarityLogError::Closed)
    }
}

impl Drop for JsonlSimilarityLog {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                log::warn!("Similarity log writer thread panicked");
            }
        }
    }
}
