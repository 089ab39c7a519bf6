//! JSONL trace file writer with hash-chaining.

use crate::trace::events::{TraceEvent, TraceRecord, TraceRecordKind};
use crate::trace::hasher::{sha256_hash, GENESIS_HASH};
use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum TraceStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid trace record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no session started")]
    NotStarted,
    #[error("hash chain broken at record {seq}")]
    BrokenChain { seq: u64 },
}

/// Writes one `<session-id>.jsonl` file per session.
pub struct TraceStore {
    trace_dir: PathBuf,
    session_id: String,
    current_file: Option<BufWriter<File>>,
    current_path: Option<PathBuf>,
    seq: u64,
    prev_hash: String,
}

impl TraceStore {
    pub fn new(trace_dir: &Path) -> Result<Self, TraceStoreError> {
        fs::create_dir_all(trace_dir)?;
        Ok(Self {
            trace_dir: trace_dir.to_path_buf(),
            session_id: String::new(),
            current_file: None,
            current_path: None,
            seq: 0,
            prev_hash: GENESIS_HASH.to_string(),
        })
    }

    pub fn start_session(&mut self, session_id: &str, program_hash: &str) -> Result<PathBuf, TraceStoreError> {
        let path = self.trace_dir.join(format!("{}.jsonl", session_id));
        self.open(path, session_id, program_hash, None)
    }

    /// Start the file of one run inside a session: `<session-id>.<run>.jsonl`.
    /// The header carries the run label.
    pub fn start_run(&mut self, session_id: &str, run: &str, program_hash: &str) -> Result<PathBuf, TraceStoreError> {
        let path = self.trace_dir.join(format!("{}.{}.jsonl", session_id, run));
        self.open(path, session_id, program_hash, Some(run))
    }

    fn open(
        &mut self,
        path: PathBuf,
        session_id: &str,
        program_hash: &str,
        run: Option<&str>,
    ) -> Result<PathBuf, TraceStoreError> {
        self.session_id = session_id.to_string();
        self.seq = 0;
        self.prev_hash = GENESIS_HASH.to_string();

        let file = OpenOptions::new().create(true).truncate(true).write(true).open(&path)?;
        self.current_file = Some(BufWriter::new(file));
        self.current_path = Some(path.clone());

        let mut record = self.make_record(TraceRecordKind::SessionStart);
        record.program_hash = Some(program_hash.to_string());
        record.message = run.map(str::to_string);
        self.write_record(record)?;
        Ok(path)
    }

    pub fn step(&mut self, event: &TraceEvent) -> Result<(), TraceStoreError> {
        let mut record = self.make_record(TraceRecordKind::Step);
        record.event = Some(event.clone());
        self.write_record(record)
    }

    /// Close the session with a one-line outcome summary.
    pub fn end_session(&mut self, outcome: &str) -> Result<PathBuf, TraceStoreError> {
        let mut record = self.make_record(TraceRecordKind::SessionEnd);
        record.message = Some(outcome.to_string());
        self.write_record(record)?;
        if let Some(mut file) = self.current_file.take() {
            file.flush()?;
        }
        self.current_path.take().ok_or(TraceStoreError::NotStarted)
    }

    /// Write a whole session in one go.
    pub fn export(
        &mut self,
        session_id: &str,
        program_hash: &str,
        events: &[TraceEvent],
        outcome: &str,
    ) -> Result<PathBuf, TraceStoreError> {
        self.start_session(session_id, program_hash)?;
        self.finish(events, outcome)
    }

    /// Write one run of a session to its own file.
    pub fn export_run(
        &mut self,
        session_id: &str,
        run: &str,
        program_hash: &str,
        events: &[TraceEvent],
        outcome: &str,
    ) -> Result<PathBuf, TraceStoreError> {
        self.start_run(session_id, run, program_hash)?;
        self.finish(events, outcome)
    }

    fn finish(&mut self, events: &[TraceEvent], outcome: &str) -> Result<PathBuf, TraceStoreError> {
        for event in events {
            self.step(event)?;
        }
        self.end_session(outcome)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn make_record(&mut self, kind: TraceRecordKind) -> TraceRecord {
        self.seq += 1;
        TraceRecord {
            seq: self.seq,
            kind,
            session_id: self.session_id.clone(),
            prev_hash: self.prev_hash.clone(),
            hash: String::new(),
            timestamp: Utc::now(),
            program_hash: None,
            event: None,
            message: None,
        }
    }

    fn write_record(&mut self, mut record: TraceRecord) -> Result<(), TraceStoreError> {
        let file = self.current_file.as_mut().ok_or(TraceStoreError::NotStarted)?;
        record.hash = sha256_hash(&record.digest_input());
        writeln!(file, "{}", serde_json::to_string(&record)?)?;
        self.prev_hash = record.hash;
        Ok(())
    }
}

/// Load every record of a trace file.
pub fn read_trace(path: &Path) -> Result<Vec<TraceRecord>, TraceStoreError> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

/// Check that every record links to its predecessor and hashes to its
/// recorded value.
pub fn verify_chain(records: &[TraceRecord]) -> Result<(), TraceStoreError> {
    let mut prev = GENESIS_HASH.to_string();
    for record in records {
        if record.prev_hash != prev || sha256_hash(&record.digest_input()) != record.hash {
            return Err(TraceStoreError::BrokenChain { seq: record.seq });
        }
        prev = record.hash.clone();
    }
    Ok(())
}
