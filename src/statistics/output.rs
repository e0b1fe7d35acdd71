//! Statistic output formatters.
//!
//! Every formatter implements [`StatisticOutput`]: fields are declared once
//! at start of simulation, then each dump writes a sequence of entries, one
//! per statistic, bounded by `start_entries` / `stop_entries`. Values are
//! buffered per entry and emitted in field registration order.

use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{unknown_handle, FieldDef, FieldHandle, FieldValue};
use crate::error::{SimError, SimResult};
use crate::types::{Rank, RankInfo, SimTime};

/// Identity of one output entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryHeader {
    pub component: String,
    pub statistic: String,
    pub sub_id: String,
    pub kind: String,
    pub time: SimTime,
    pub rank: Rank,
}

/// A statistics formatter.
pub trait StatisticOutput {
    /// Short format name (`text`, `csv`, `json`).
    fn kind(&self) -> &'static str;

    /// Receives the final field list. Called once before any entry.
    fn start_of_simulation(&mut self, fields: &[FieldDef]) -> SimResult<()>;

    fn start_entries(&mut self, header: &EntryHeader) -> SimResult<()>;

    /// Writes one field of the open entry. Unknown handles are fatal.
    fn output_field(&mut self, handle: FieldHandle, value: FieldValue) -> SimResult<()>;

    fn stop_entries(&mut self) -> SimResult<()>;

    /// Flushes and closes the destination.
    fn end_of_simulation(&mut self) -> SimResult<()>;
}

/// In-memory sink shared with the caller.
#[derive(Clone, Debug, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded as UTF-8.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// Destination of a formatter.
pub enum OutputSink {
    File(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
    Stdout(io::Stdout),
    Memory(SharedBuffer),
}

impl OutputSink {
    /// Opens `path`, gzip-compressed if `compress` is set or the name ends
    /// in `.gz`.
    pub fn create(path: &Path, compress: bool) -> SimResult<Self> {
        let file = BufWriter::new(File::create(path)?);
        let gz = path.extension().map_or(false, |ext| ext == "gz");
        if compress || gz {
            Ok(OutputSink::Gzip(GzEncoder::new(file, Compression::default())))
        } else {
            Ok(OutputSink::File(file))
        }
    }

    pub fn stdout() -> Self {
        OutputSink::Stdout(io::stdout())
    }

    /// Flushes buffered data and writes the gzip trailer if any.
    pub fn finish(&mut self) -> SimResult<()> {
        match self {
            OutputSink::Gzip(enc) => {
                enc.try_finish()?;
                enc.get_mut().flush()?;
            }
            other => other.flush()?,
        }
        Ok(())
    }
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutputSink::File(w) => w.write(buf),
            OutputSink::Gzip(w) => w.write(buf),
            OutputSink::Stdout(w) => w.write(buf),
            OutputSink::Memory(b) => {
                b.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputSink::File(w) => w.flush(),
            OutputSink::Gzip(w) => w.flush(),
            OutputSink::Stdout(w) => w.flush(),
            OutputSink::Memory(_) => Ok(()),
        }
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            OutputSink::File(_) => "file",
            OutputSink::Gzip(_) => "gzip",
            OutputSink::Stdout(_) => "stdout",
            OutputSink::Memory(_) => "memory",
        };
        f.write_str(kind)
    }
}

/// Inserts `_rank{r}` before the extension(s) of `path` in multi-rank runs.
///
/// `stats.csv.gz` on rank 1 becomes `stats_rank1.csv.gz`.
pub fn rank_path(path: &Path, rank: RankInfo) -> PathBuf {
    if !rank.is_parallel() {
        return path.to_path_buf();
    }
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let (stem, ext) = match name.find('.') {
        Some(0) | None => (name.as_str(), ""),
        Some(i) => name.split_at(i),
    };
    path.with_file_name(format!("{}_rank{}{}", stem, rank.rank, ext))
}

/// Field list plus the entry being assembled.
#[derive(Debug, Default)]
struct EntryState {
    fields: Vec<FieldDef>,
    open: Option<EntryHeader>,
    values: Vec<(FieldHandle, FieldValue)>,
}

impl EntryState {
    fn start(&mut self, header: &EntryHeader) -> SimResult<()> {
        if let Some(open) = &self.open {
            return Err(SimError::statistic(format!(
                "entry for {}.{} started while {}.{} is still open",
                header.component, header.statistic, open.component, open.statistic
            )));
        }
        self.open = Some(header.clone());
        self.values.clear();
        Ok(())
    }

    fn push(&mut self, handle: FieldHandle, value: FieldValue) -> SimResult<()> {
        if self.open.is_none() {
            return Err(SimError::statistic(format!(
                "field {} written outside of an entry",
                handle.0
            )));
        }
        let def = self
            .fields
            .get(handle.0 as usize)
            .ok_or_else(|| unknown_handle(handle, self.fields.len()))?;
        if def.ty != value.field_type() {
            return Err(SimError::statistic(format!(
                "field {} is {}, got a {} value",
                def.name,
                def.ty,
                value.field_type()
            )));
        }
        self.values.push((handle, value));
        Ok(())
    }

    fn stop(&mut self) -> SimResult<(EntryHeader, Vec<(FieldHandle, FieldValue)>)> {
        let header = self
            .open
            .take()
            .ok_or_else(|| SimError::statistic("stop_entries without start_entries"))?;
        let mut values = std::mem::take(&mut self.values);
        values.sort_by_key(|(h, _)| *h);
        Ok((header, values))
    }
}

/// One human-readable line per entry.
#[derive(Debug)]
pub struct TextOutput {
    sink: OutputSink,
    state: EntryState,
}

impl TextOutput {
    pub fn new(sink: OutputSink) -> Self {
        Self {
            sink,
            state: EntryState::default(),
        }
    }
}

impl StatisticOutput for TextOutput {
    fn kind(&self) -> &'static str {
        "text"
    }

    fn start_of_simulation(&mut self, fields: &[FieldDef]) -> SimResult<()> {
        self.state.fields = fields.to_vec();
        Ok(())
    }

    fn start_entries(&mut self, header: &EntryHeader) -> SimResult<()> {
        self.state.start(header)
    }

    fn output_field(&mut self, handle: FieldHandle, value: FieldValue) -> SimResult<()> {
        self.state.push(handle, value)
    }

    fn stop_entries(&mut self) -> SimResult<()> {
        let (header, values) = self.state.stop()?;
        let mut line = format!(" {}.{}", header.component, header.statistic);
        if !header.sub_id.is_empty() {
            line.push('.');
            line.push_str(&header.sub_id);
        }
        line.push_str(&format!(
            " : {} : SimTime = {}; Rank = {};",
            header.kind, header.time, header.rank
        ));
        for (handle, value) in values {
            let def = &self.state.fields[handle.0 as usize];
            line.push_str(&format!(" {} = {};", def.column(), value));
        }
        writeln!(self.sink, "{}", line)?;
        Ok(())
    }

    fn end_of_simulation(&mut self) -> SimResult<()> {
        self.sink.finish()
    }
}

/// Delimited rows with one column per registered field.
#[derive(Debug)]
pub struct CsvOutput {
    sink: OutputSink,
    delimiter: String,
    state: EntryState,
}

const CSV_FIXED_COLUMNS: [&str; 6] = [
    "ComponentName",
    "StatisticName",
    "StatisticSubId",
    "StatisticType",
    "SimTime",
    "Rank",
];

impl CsvOutput {
    pub fn new(sink: OutputSink) -> Self {
        Self::with_delimiter(sink, ",")
    }

    pub fn with_delimiter(sink: OutputSink, delimiter: impl Into<String>) -> Self {
        Self {
            sink,
            delimiter: delimiter.into(),
            state: EntryState::default(),
        }
    }

    fn cell(&self, text: &str) -> String {
        if text.contains(self.delimiter.as_str()) || text.contains('"') {
            format!("\"{}\"", text.replace('"', "\"\""))
        } else {
            text.to_string()
        }
    }
}

impl StatisticOutput for CsvOutput {
    fn kind(&self) -> &'static str {
        "csv"
    }

    fn start_of_simulation(&mut self, fields: &[FieldDef]) -> SimResult<()> {
        self.state.fields = fields.to_vec();
        let columns: Vec<String> = CSV_FIXED_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(fields.iter().map(|f| self.cell(&f.column())))
            .collect();
        writeln!(self.sink, "{}", columns.join(&self.delimiter))?;
        Ok(())
    }

    fn start_entries(&mut self, header: &EntryHeader) -> SimResult<()> {
        self.state.start(header)
    }

    fn output_field(&mut self, handle: FieldHandle, value: FieldValue) -> SimResult<()> {
        self.state.push(handle, value)
    }

    fn stop_entries(&mut self) -> SimResult<()> {
        let (header, values) = self.state.stop()?;
        let mut row = vec![
            self.cell(&header.component),
            self.cell(&header.statistic),
            self.cell(&header.sub_id),
            self.cell(&header.kind),
            header.time.to_string(),
            header.rank.to_string(),
        ];
        let mut cells = vec![String::new(); self.state.fields.len()];
        for (handle, value) in values {
            cells[handle.0 as usize] = value.to_string();
        }
        row.extend(cells);
        writeln!(self.sink, "{}", row.join(&self.delimiter))?;
        Ok(())
    }

    fn end_of_simulation(&mut self) -> SimResult<()> {
        self.sink.finish()
    }
}

/// One JSON object per entry, one entry per line.
#[derive(Debug)]
pub struct JsonOutput {
    sink: OutputSink,
    state: EntryState,
}

impl JsonOutput {
    pub fn new(sink: OutputSink) -> Self {
        Self {
            sink,
            state: EntryState::default(),
        }
    }
}

impl StatisticOutput for JsonOutput {
    fn kind(&self) -> &'static str {
        "json"
    }

    fn start_of_simulation(&mut self, fields: &[FieldDef]) -> SimResult<()> {
        self.state.fields = fields.to_vec();
        Ok(())
    }

    fn start_entries(&mut self, header: &EntryHeader) -> SimResult<()> {
        self.state.start(header)
    }

    fn output_field(&mut self, handle: FieldHandle, value: FieldValue) -> SimResult<()> {
        self.state.push(handle, value)
    }

    fn stop_entries(&mut self) -> SimResult<()> {
        let (header, values) = self.state.stop()?;
        let fields: Vec<serde_json::Value> = values
            .iter()
            .map(|(handle, value)| {
                let def = &self.state.fields[handle.0 as usize];
                serde_json::json!({
                    "name": def.name,
                    "type": def.ty,
                    "value": value.to_json(),
                })
            })
            .collect();
        let entry = serde_json::json!({
            "component": header.component,
            "statistic": header.statistic,
            "sub_id": header.sub_id,
            "type": header.kind,
            "time": header.time,
            "rank": header.rank,
            "fields": fields,
        });
        serde_json::to_writer(&mut self.sink, &entry)?;
        self.sink.write_all(b"\n")?;
        Ok(())
    }

    fn end_of_simulation(&mut self) -> SimResult<()> {
        self.sink.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statistics::FieldType;

    fn fields() -> Vec<FieldDef> {
        vec![
            FieldDef {
                name: "Sum".into(),
                ty: FieldType::U64,
            },
            FieldDef {
                name: "Count".into(),
                ty: FieldType::U64,
            },
            FieldDef {
                name: "UniqueItems".into(),
                ty: FieldType::U64,
            },
        ]
    }

    fn header(stat: &str) -> EntryHeader {
        EntryHeader {
            component: "cpu".into(),
            statistic: stat.into(),
            sub_id: String::new(),
            kind: "accumulator".into(),
            time: 500,
            rank: 0,
        }
    }

    #[test]
    fn test_csv_rows_follow_registration_order() {
        let buf = SharedBuffer::new();
        let mut out = CsvOutput::new(OutputSink::Memory(buf.clone()));
        out.start_of_simulation(&fields()).unwrap();
        out.start_entries(&header("a")).unwrap();
        out.output_field(FieldHandle(1), FieldValue::U64(2)).unwrap();
        out.output_field(FieldHandle(0), FieldValue::U64(7)).unwrap();
        out.stop_entries().unwrap();
        out.end_of_simulation().unwrap();
        let text = buf.contents();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "ComponentName,StatisticName,StatisticSubId,StatisticType,SimTime,Rank,Sum.u64,Count.u64,UniqueItems.u64"
        );
        assert_eq!(lines[1], "cpu,a,,accumulator,500,0,7,2,");
    }

    #[test]
    fn test_unknown_handle_is_fatal() {
        let mut out = TextOutput::new(OutputSink::Memory(SharedBuffer::new()));
        out.start_of_simulation(&fields()).unwrap();
        out.start_entries(&header("a")).unwrap();
        let err = out.output_field(FieldHandle(9), FieldValue::U64(1)).unwrap_err();
        assert!(matches!(err, SimError::Statistic { .. }));
        let err = out.output_field(FieldHandle(0), FieldValue::F64(1.0)).unwrap_err();
        assert!(matches!(err, SimError::Statistic { .. }));
    }

    #[test]
    fn test_entries_must_be_bracketed() {
        let mut out = JsonOutput::new(OutputSink::Memory(SharedBuffer::new()));
        out.start_of_simulation(&fields()).unwrap();
        assert!(out.output_field(FieldHandle(0), FieldValue::U64(1)).is_err());
        assert!(out.stop_entries().is_err());
        out.start_entries(&header("a")).unwrap();
        assert!(out.start_entries(&header("b")).is_err());
    }

    #[test]
    fn test_text_and_json_lines() {
        let buf = SharedBuffer::new();
        let mut text = TextOutput::new(OutputSink::Memory(buf.clone()));
        text.start_of_simulation(&fields()).unwrap();
        text.start_entries(&header("hits")).unwrap();
        text.output_field(FieldHandle(0), FieldValue::U64(3)).unwrap();
        text.stop_entries().unwrap();
        assert_eq!(
            buf.contents().trim_end(),
            " cpu.hits : accumulator : SimTime = 500; Rank = 0; Sum.u64 = 3;"
        );

        let buf = SharedBuffer::new();
        let mut json = JsonOutput::new(OutputSink::Memory(buf.clone()));
        json.start_of_simulation(&fields()).unwrap();
        json.start_entries(&header("hits")).unwrap();
        json.output_field(FieldHandle(2), FieldValue::U64(4)).unwrap();
        json.stop_entries().unwrap();
        let value: serde_json::Value = serde_json::from_str(buf.contents().trim()).unwrap();
        assert_eq!(value["fields"][0]["name"], "UniqueItems");
        assert_eq!(value["fields"][0]["value"], 4);
    }

    #[test]
    fn test_rank_path() {
        let single = rank_path(Path::new("/tmp/stats.csv.gz"), RankInfo::single());
        assert_eq!(single, PathBuf::from("/tmp/stats.csv.gz"));
        let multi = rank_path(Path::new("/tmp/stats.csv.gz"), RankInfo::new(1, 2));
        assert_eq!(multi, PathBuf::from("/tmp/stats_rank1.csv.gz"));
        let bare = rank_path(Path::new("out"), RankInfo::new(0, 2));
        assert_eq!(bare, PathBuf::from("out_rank0"));
    }
}
