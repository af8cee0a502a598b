//! Fingering charts: which holes are open for each note.
//!
//! Text format, whitespace separated:
//!
//! ```text
//! label   D  E  Fs
//! hole1   x  x  o
//! hole2   x  o  o
//! ```
//!
//! `x`/`X` marks a closed hole, `o`/`O` an open one. Blank lines are ignored.

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FingeringError {
    #[error("cannot read fingering chart {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("fingering chart is empty")]
    Empty,
    #[error("fingering chart header must start with 'label', found '{0}'")]
    BadHeader(String),
    #[error("line {line}: row '{label}' has {found} marks, expected {expected}")]
    RowLength {
        line: usize,
        label: String,
        expected: usize,
        found: usize,
    },
    #[error("line {line}: unknown mark '{mark}' (expected x or o)")]
    BadMark { line: usize, mark: String },
    #[error("hole '{0}' appears twice in the fingering chart")]
    DuplicateLabel(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mark {
    Open,
    Closed,
}

impl Mark {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "o" | "O" => Some(Self::Open),
            "x" | "X" => Some(Self::Closed),
            _ => None,
        }
    }

    pub fn symbol(&self) -> char {
        match self {
            Self::Open => 'o',
            Self::Closed => 'x',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FingeringRow {
    pub label: String,
    pub marks: Vec<Mark>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FingeringChart {
    notes: Vec<String>,
    rows: Vec<FingeringRow>,
}

impl FingeringChart {
    pub fn parse(text: &str) -> Result<Self, FingeringError> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty());

        let (_, header) = lines.next().ok_or(FingeringError::Empty)?;
        let mut tokens = header.split_whitespace();
        match tokens.next() {
            Some("label") => {}
            Some(other) => return Err(FingeringError::BadHeader(other.to_string())),
            None => return Err(FingeringError::Empty),
        }
        let notes: Vec<String> = tokens.map(str::to_string).collect();

        let mut chart = Self {
            notes,
            rows: Vec::new(),
        };
        for (line, text) in lines {
            let mut tokens = text.split_whitespace();
            let Some(label) = tokens.next() else { continue };
            let marks = tokens
                .map(|t| {
                    Mark::parse(t).ok_or_else(|| FingeringError::BadMark {
                        line,
                        mark: t.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            if marks.len() != chart.notes.len() {
                return Err(FingeringError::RowLength {
                    line,
                    label: label.to_string(),
                    expected: chart.notes.len(),
                    found: marks.len(),
                });
            }
            if chart.row(label).is_some() {
                return Err(FingeringError::DuplicateLabel(label.to_string()));
            }
            chart.rows.push(FingeringRow {
                label: label.to_string(),
                marks,
            });
        }
        Ok(chart)
    }

    pub fn from_path(path: &Path) -> Result<Self, FingeringError> {
        let text = std::fs::read_to_string(path).map_err(|source| FingeringError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    pub fn rows(&self) -> &[FingeringRow] {
        &self.rows
    }

    pub fn row(&self, label: &str) -> Option<&FingeringRow> {
        self.rows.iter().find(|r| r.label == label)
    }

    pub fn has_note(&self, note: &str) -> bool {
        self.notes.iter().any(|n| n == note)
    }

    /// Mark for a hole in a note; `None` if either is not in the chart.
    pub fn mark(&self, label: &str, note: &str) -> Option<Mark> {
        let column = self.notes.iter().position(|n| n == note)?;
        self.row(label).map(|r| r.marks[column])
    }

    /// Holes without a row are open.
    pub fn is_open(&self, label: &str, note: &str) -> bool {
        self.mark(label, note) != Some(Mark::Closed)
    }

    /// Append an always-open row for every label the chart lacks.
    /// Returns the labels that were added.
    pub fn ensure_labels<'a>(&mut self, labels: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut added = Vec::new();
        for label in labels {
            if self.row(label).is_none() {
                self.rows.push(FingeringRow {
                    label: label.to_string(),
                    marks: vec![Mark::Open; self.notes.len()],
                });
                added.push(label.to_string());
            }
        }
        added
    }

    /// Header plus one row per hole, as plain strings.
    pub fn to_table(&self) -> Vec<Vec<String>> {
        let mut table = Vec::with_capacity(self.rows.len() + 1);
        table.push(
            std::iter::once("label".to_string())
                .chain(self.notes.iter().cloned())
                .collect(),
        );
        for row in &self.rows {
            table.push(
                std::iter::once(row.label.clone())
                    .chain(row.marks.iter().map(|m| m.symbol().to_string()))
                    .collect(),
            );
        }
        table
    }
}
