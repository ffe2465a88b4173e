//! Append-only trial traces, stored as JSON Lines: one header line, one
//! line per turn record, and an end line once the trial terminates.
//!
//! Records carry no wall-clock data, so identical trials produce identical
//! bytes.

use std::{
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    budget::{BudgetConfig, BudgetSnapshot},
    error::FailureClass,
    functions::ToolCallResult,
    scenario::TerminationReason,
    types::ChatMessage,
};

pub const TRACE_SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("trace I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("trace serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("line {line}: {message}")]
    Corrupt { line: usize, message: String },
}

impl TraceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        TraceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceHeader {
    pub schema_version: String,
    pub run_id: String,
    pub scenario_id: String,
    pub seed: u64,
    pub model: String,
    pub budget: BudgetConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    /// Scenario setup messages.
    Setup,
    /// A user message from the prompter.
    Prompt,
    /// An assistant message without tool calls.
    Reply,
    /// An assistant message with tool calls, followed by their results.
    ToolRound,
    /// A failed adapter call; no messages were appended.
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Fatal,
    Malformed,
}

impl From<FailureClass> for FailureKind {
    fn from(class: FailureClass) -> Self {
        match class {
            FailureClass::Transient => FailureKind::Transient,
            FailureClass::Fatal => FailureKind::Fatal,
            FailureClass::Malformed => FailureKind::Malformed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnFailure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    /// Position in the trace, starting at 0.
    pub index: usize,
    /// Conversational turn the record belongs to (0 for setup).
    pub turn: usize,
    pub kind: TurnKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolCallResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TurnFailure>,
    /// Budget after the record was accepted.
    pub budget: BudgetSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceFooter {
    pub termination: TerminationReason,
    pub budget: BudgetSnapshot,
    pub records: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceLine {
    Header(TraceHeader),
    Turn(TurnRecord),
    End(TraceFooter),
}

/// In-memory form of one trial's trace. A missing footer means the trial
/// was interrupted before it could record its termination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub header: TraceHeader,
    pub records: Vec<TurnRecord>,
    pub footer: Option<TraceFooter>,
}

impl Trace {
    pub fn lines(&self) -> impl Iterator<Item = TraceLine> + '_ {
        std::iter::once(TraceLine::Header(self.header.clone()))
            .chain(self.records.iter().cloned().map(TraceLine::Turn))
            .chain(self.footer.iter().cloned().map(TraceLine::End))
    }

    pub fn to_jsonl(&self) -> Result<String, TraceError> {
        let mut out = String::new();
        for line in self.lines() {
            out.push_str(&serde_json::to_string(&line)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Parses a JSONL trace. Only structural problems are reported here;
    /// consistency checks belong to the replay engine.
    pub fn from_jsonl(input: &str) -> Result<Self, TraceError> {
        let mut header = None;
        let mut records = Vec::new();
        let mut footer = None;

        for (i, raw) in input.lines().enumerate() {
            let line_no = i + 1;
            if raw.trim().is_empty() {
                continue;
            }
            let line: TraceLine = serde_json::from_str(raw).map_err(|err| TraceError::Corrupt {
                line: line_no,
                message: err.to_string(),
            })?;
            match line {
                TraceLine::Header(h) if header.is_none() && records.is_empty() => header = Some(h),
                TraceLine::Header(_) => {
                    return Err(TraceError::Corrupt {
                        line: line_no,
                        message: "unexpected header".to_string(),
                    })
                }
                TraceLine::Turn(_) | TraceLine::End(_) if header.is_none() => {
                    return Err(TraceError::Corrupt {
                        line: line_no,
                        message: "record before header".to_string(),
                    })
                }
                TraceLine::Turn(_) | TraceLine::End(_) if footer.is_some() => {
                    return Err(TraceError::Corrupt {
                        line: line_no,
                        message: "record after end of trace".to_string(),
                    })
                }
                TraceLine::Turn(record) => records.push(record),
                TraceLine::End(f) => footer = Some(f),
            }
        }

        let header = header.ok_or(TraceError::Corrupt {
            line: 0,
            message: "empty trace".to_string(),
        })?;
        Ok(Self {
            header,
            records,
            footer,
        })
    }

    pub fn read(path: &Path) -> Result<Self, TraceError> {
        let file = File::open(path).map_err(|err| TraceError::io(path, err))?;
        let mut input = String::new();
        for line in BufReader::new(file).lines() {
            input.push_str(&line.map_err(|err| TraceError::io(path, err))?);
            input.push('\n');
        }
        Self::from_jsonl(&input)
    }
}

/// File name for a trial's trace inside a run's trace directory.
pub fn trace_file_name(scenario_id: &str, seed: u64) -> String {
    format!("{}__seed{seed}.jsonl", scenario_id.replace('/', "__"))
}

/// Line-oriented trace sink. Every line is flushed as soon as it is
/// written, so an interrupted trial leaves every completed record on disk.
pub struct TraceWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl TraceWriter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, TraceError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| TraceError::io(parent, err))?;
            }
        }
        // Never truncate an existing trace.
        let file = File::options()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| TraceError::io(&path, err))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, line: &TraceLine) -> Result<(), TraceError> {
        serde_json::to_writer(&mut self.writer, line)?;
        self.writer
            .write_all(b"\n")
            .and_then(|_| self.writer.flush())
            .map_err(|err| TraceError::io(&self.path, err))
    }
}

/// Builds a trace record by record, mirroring each record to an optional
/// writer as it is accepted.
pub struct TraceRecorder {
    trace: Trace,
    writer: Option<TraceWriter>,
}

impl TraceRecorder {
    pub fn new(header: TraceHeader, mut writer: Option<TraceWriter>) -> Result<Self, TraceError> {
        if let Some(writer) = writer.as_mut() {
            writer.append(&TraceLine::Header(header.clone()))?;
        }
        Ok(Self {
            trace: Trace {
                header,
                records: Vec::new(),
                footer: None,
            },
            writer,
        })
    }

    pub fn next_index(&self) -> usize {
        self.trace.records.len()
    }

    pub fn record(
        &mut self,
        turn: usize,
        kind: TurnKind,
        messages: Vec<ChatMessage>,
        tool_results: Vec<ToolCallResult>,
        failure: Option<TurnFailure>,
        budget: BudgetSnapshot,
    ) -> Result<(), TraceError> {
        let record = TurnRecord {
            index: self.next_index(),
            turn,
            kind,
            messages,
            tool_results,
            failure,
            budget,
        };
        if let Some(writer) = self.writer.as_mut() {
            writer.append(&TraceLine::Turn(record.clone()))?;
        }
        self.trace.records.push(record);
        Ok(())
    }

    pub fn finish(mut self, termination: TerminationReason, budget: BudgetSnapshot) -> Result<Trace, TraceError> {
        let footer = TraceFooter {
            termination,
            budget,
            records: self.trace.records.len(),
        };
        if let Some(writer) = self.writer.as_mut() {
            writer.append(&TraceLine::End(footer.clone()))?;
        }
        self.trace.footer = Some(footer);
        Ok(self.trace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> TraceHeader {
        TraceHeader {
            schema_version: TRACE_SCHEMA_VERSION.to_string(),
            run_id: "run".to_string(),
            scenario_id: "constraint/json_schema".to_string(),
            seed: 1,
            model: "mock".to_string(),
            budget: BudgetConfig::default(),
        }
    }

    #[test]
    fn writer_and_parser_agree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(trace_file_name("constraint/json_schema", 1));
        let writer = TraceWriter::create(&path).expect("writer");

        let mut recorder = TraceRecorder::new(header(), Some(writer)).expect("recorder");
        recorder
            .record(0, TurnKind::Setup, vec![ChatMessage::system("sys")], Vec::new(), None, BudgetSnapshot::default())
            .expect("record");
        let trace = recorder
            .finish(TerminationReason::PrompterDone, BudgetSnapshot::default())
            .expect("finish");

        let from_disk = Trace::read(&path).expect("read");
        assert_eq!(from_disk, trace);
        assert_eq!(fs::read_to_string(&path).expect("raw"), trace.to_jsonl().expect("jsonl"));
    }

    #[test]
    fn existing_trace_is_left_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(trace_file_name("constraint/json_schema", 1));
        fs::write(&path, "kept\n").expect("seed file");

        let err = TraceWriter::create(&path).err().expect("refused");
        assert!(matches!(err, TraceError::Io { ref source, .. } if source.kind() == std::io::ErrorKind::AlreadyExists));
        assert_eq!(fs::read_to_string(&path).expect("raw"), "kept\n");
    }

    #[test]
    fn interrupted_trace_has_no_footer() {
        let mut recorder = TraceRecorder::new(header(), None).expect("recorder");
        recorder
            .record(0, TurnKind::Setup, Vec::new(), Vec::new(), None, BudgetSnapshot::default())
            .expect("record");
        let mut trace = recorder
            .finish(TerminationReason::Success, BudgetSnapshot::default())
            .expect("finish");
        trace.footer = None;
        let parsed = Trace::from_jsonl(&trace.to_jsonl().expect("jsonl")).expect("parse");
        assert!(parsed.footer.is_none());
        assert_eq!(parsed.records.len(), 1);
    }

    #[test]
    fn garbage_lines_are_corrupt() {
        let mut jsonl = TraceRecorder::new(header(), None)
            .expect("recorder")
            .finish(TerminationReason::Success, BudgetSnapshot::default())
            .expect("finish")
            .to_jsonl()
            .expect("jsonl");
        jsonl.insert_str(0, "{not json}\n");
        assert!(matches!(Trace::from_jsonl(&jsonl), Err(TraceError::Corrupt { line: 1, .. })));
    }
}
