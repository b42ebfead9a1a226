use anyhow::{anyhow, Context, Result};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::snapshot::{Snapshot, SNAPSHOT_FIELDS};

/// Append-only CSV of snapshots that could not be delivered.
///
/// The header is written once when the file is created. Every append is one
/// `write_all` of a complete line followed by `sync_data`, so a crash can at
/// worst leave a torn final line; the next append terminates it before
/// writing, and readers skip it.
#[derive(Debug, Clone)]
pub struct FallbackLog {
    path: PathBuf,
}

impl FallbackLog {
    /// Open (without creating) the log, checking the header of an existing file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Ok(raw) = std::fs::read_to_string(&path) {
            if let Some(first) = raw.lines().next() {
                let found = split_csv_line(first);
                if found != SNAPSHOT_FIELDS {
                    return Err(anyhow!(
                        "fallback log {} has an incompatible header: {}",
                        path.display(),
                        first
                    ));
                }
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, snapshot: &Snapshot) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.path)
            .with_context(|| format!("open fallback log {}", self.path.display()))?;
        let len = file.metadata()?.len();

        let mut out = String::new();
        if len == 0 {
            out.push_str(&join_csv_line(SNAPSHOT_FIELDS.iter().copied()));
        } else {
            file.seek(SeekFrom::End(-1))?;
            let mut last = [0u8; 1];
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                log::warn!(
                    "fallback log {} ends with a partial line; terminating it",
                    self.path.display()
                );
                out.push('\n');
            }
        }
        let fields = snapshot.csv_fields();
        out.push_str(&join_csv_line(fields.iter().map(String::as_str)));

        file.write_all(out.as_bytes())
            .with_context(|| format!("append to fallback log {}", self.path.display()))?;
        file.sync_data()?;
        Ok(())
    }

    /// Parse every complete row back into snapshots, skipping torn lines.
    pub fn read_rows(&self) -> Result<Vec<Snapshot>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("read fallback log {}", self.path.display()))
            }
        };
        let mut rows = Vec::new();
        for (line_no, record) in split_csv_records(&raw).into_iter().skip(1) {
            if record.trim().is_empty() {
                continue;
            }
            match Snapshot::from_csv_fields(&split_csv_line(record)) {
                Ok(snapshot) => rows.push(snapshot),
                // A torn row with an open quote swallows the rows after it;
                // retry those line by line.
                Err(_) if record.contains('\n') => {
                    for (offset, line) in record.lines().enumerate() {
                        self.parse_line_into(&mut rows, line_no + offset, line);
                    }
                }
                Err(e) => self.warn_skipped(line_no, &e),
            }
        }
        Ok(rows)
    }

    fn parse_line_into(&self, rows: &mut Vec<Snapshot>, line_no: usize, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match Snapshot::from_csv_fields(&split_csv_line(line)) {
            Ok(snapshot) => rows.push(snapshot),
            Err(e) => self.warn_skipped(line_no, &e),
        }
    }

    fn warn_skipped(&self, line_no: usize, err: &anyhow::Error) {
        log::warn!(
            "fallback log {} line {} skipped: {:#}",
            self.path.display(),
            line_no,
            err
        );
    }
}

fn escape_csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn join_csv_line<'a>(fields: impl Iterator<Item = &'a str>) -> String {
    let mut line = fields.map(escape_csv_field).collect::<Vec<_>>().join(",");
    line.push('\n');
    line
}

/// Split file contents into records on newlines outside quoted fields.
/// Each record comes with the 1-based line it starts on.
fn split_csv_records(raw: &str) -> Vec<(usize, &str)> {
    let mut records = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    let mut line_no = 1;
    let mut start_line = 1;
    for (idx, c) in raw.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '\n' => {
                if !quoted {
                    records.push((start_line, raw[start..idx].trim_end_matches('\r')));
                    start = idx + 1;
                    start_line = line_no + 1;
                }
                line_no += 1;
            }
            _ => {}
        }
    }
    if start < raw.len() {
        records.push((start_line, raw[start..].trim_end_matches('\r')));
    }
    records
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}
