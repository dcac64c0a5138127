//! Reference engine: a JSON-persisted workbook of named worksheets holding
//! A1-addressed cell values.
//!
//! It stands in for the native automation application so the orchestration
//! layer can be driven end to end. Files are written atomically: the new
//! content goes to a temporary file in the same directory which is then
//! renamed over the original.

use super::{Engine, EngineFactory};
use crate::core::{HandleId, Result, SheetError};
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

pub const WORKBOOK_FORMAT_VERSION: u32 = 1;
pub const DEFAULT_SHEET_NAME: &str = "Sheet1";

/// Last addressable row and column (`ZZZ`).
pub const MAX_ROW: u32 = 9_999_999;
pub const MAX_COL: u32 = 18_278;

lazy_static! {
    static ref CELL_REF: Regex = Regex::new(r"^\$?([A-Za-z]{1,3})\$?([1-9][0-9]{0,6})$").unwrap();
}

// ============================================================================
// Cell addressing
// ============================================================================

/// One-based (row, column) cell coordinate, written in A1 notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CellRef {
    pub row: u32,
    pub col: u32,
}

impl CellRef {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    fn column_label(mut col: u32) -> String {
        let mut label = Vec::new();
        while col > 0 {
            let rem = (col - 1) % 26;
            label.push(b'A' + rem as u8);
            col = (col - 1) / 26;
        }
        label.reverse();
        String::from_utf8(label).unwrap_or_default()
    }

    fn column_number(label: &str) -> u32 {
        label
            .bytes()
            .fold(0, |acc, b| acc * 26 + u32::from(b.to_ascii_uppercase() - b'A' + 1))
    }

    /// Offset by (`rows`, `cols`) from this cell.
    ///
    /// Fails when the result falls outside the addressable grid (`ZZZ`,
    /// row 9,999,999), since such a cell could not be read back from file.
    pub fn offset(&self, rows: u32, cols: u32) -> Result<Self> {
        let row = self.row.checked_add(rows).filter(|r| *r <= MAX_ROW);
        let col = self.col.checked_add(cols).filter(|c| *c <= MAX_COL);
        match (row, col) {
            (Some(row), Some(col)) => Ok(Self::new(row, col)),
            _ => Err(SheetError::domain(format!(
                "Offset ({}, {}) from {} leaves the sheet",
                rows, cols, self
            ))),
        }
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::column_label(self.col), self.row)
    }
}

impl FromStr for CellRef {
    type Err = SheetError;

    fn from_str(s: &str) -> Result<Self> {
        let caps = CELL_REF
            .captures(s.trim())
            .ok_or_else(|| SheetError::domain(format!("Invalid cell address '{}'", s)))?;
        let col = Self::column_number(&caps[1]);
        let row = caps[2]
            .parse()
            .map_err(|_| SheetError::domain(format!("Invalid row in cell address '{}'", s)))?;
        Ok(Self::new(row, col))
    }
}

impl TryFrom<String> for CellRef {
    type Error = SheetError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<CellRef> for String {
    fn from(cell: CellRef) -> Self {
        cell.to_string()
    }
}

/// Rectangular range such as `A1:C4`; a single cell is a one-cell range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRef {
    pub start: CellRef,
    pub end: CellRef,
}

impl RangeRef {
    pub fn rows(&self) -> u32 {
        self.end.row - self.start.row + 1
    }

    pub fn cols(&self) -> u32 {
        self.end.col - self.start.col + 1
    }

    pub fn contains(&self, cell: &CellRef) -> bool {
        (self.start.row..=self.end.row).contains(&cell.row)
            && (self.start.col..=self.end.col).contains(&cell.col)
    }
}

impl FromStr for RangeRef {
    type Err = SheetError;

    fn from_str(s: &str) -> Result<Self> {
        let (a, b) = match s.split_once(':') {
            Some((a, b)) => (a.parse::<CellRef>()?, b.parse::<CellRef>()?),
            None => {
                let cell = s.parse::<CellRef>()?;
                (cell, cell)
            }
        };
        Ok(Self {
            start: CellRef::new(a.row.min(b.row), a.col.min(b.col)),
            end: CellRef::new(a.row.max(b.row), a.col.max(b.col)),
        })
    }
}

impl fmt::Display for RangeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}

// ============================================================================
// Workbook model
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            CellValue::Number(n) => write!(f, "{}", n),
            CellValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        CellValue::Bool(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worksheet {
    pub name: String,
    #[serde(default)]
    pub cells: BTreeMap<CellRef, CellValue>,
}

impl Worksheet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cells: BTreeMap::new(),
        }
    }

    pub fn get(&self, cell: &CellRef) -> Option<&CellValue> {
        self.cells.get(cell)
    }

    /// Store `value`, or clear the cell when `value` is `None`.
    pub fn set(&mut self, cell: CellRef, value: Option<CellValue>) {
        match value {
            Some(value) => {
                self.cells.insert(cell, value);
            }
            None => {
                self.cells.remove(&cell);
            }
        }
    }

    /// Smallest range covering every non-empty cell.
    pub fn used_range(&self) -> Option<RangeRef> {
        let mut cells = self.cells.keys();
        let first = *cells.next()?;
        let (mut start, mut end) = (first, first);
        for cell in cells {
            start = CellRef::new(start.row.min(cell.row), start.col.min(cell.col));
            end = CellRef::new(end.row.max(cell.row), end.col.max(cell.col));
        }
        Some(RangeRef { start, end })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workbook {
    pub format_version: u32,
    pub sheets: Vec<Worksheet>,
}

impl Default for Workbook {
    fn default() -> Self {
        Self::new()
    }
}

impl Workbook {
    pub fn new() -> Self {
        Self {
            format_version: WORKBOOK_FORMAT_VERSION,
            sheets: vec![Worksheet::new(DEFAULT_SHEET_NAME)],
        }
    }

    /// Write a fresh single-sheet workbook to `path`. Fails if the file exists.
    pub fn create_file(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if path.exists() {
            return Err(SheetError::domain(format!(
                "File '{}' already exists",
                path.display()
            )));
        }
        Self::new().write_atomic(path)
    }

    pub fn read_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|err| SheetError::OpenFailure {
            path: path.to_path_buf(),
            reason: match err.kind() {
                IoErrorKind::NotFound => "file not found".to_string(),
                IoErrorKind::PermissionDenied => "file is locked or not readable".to_string(),
                _ => err.to_string(),
            },
        })?;

        let workbook: Workbook =
            serde_json::from_slice(&bytes).map_err(|err| SheetError::OpenFailure {
                path: path.to_path_buf(),
                reason: format!("corrupt workbook: {}", err),
            })?;

        if workbook.format_version > WORKBOOK_FORMAT_VERSION {
            return Err(SheetError::OpenFailure {
                path: path.to_path_buf(),
                reason: format!(
                    "unsupported workbook format version {}",
                    workbook.format_version
                ),
            });
        }
        Ok(workbook)
    }

    pub fn write_atomic(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let serialized = serde_json::to_vec_pretty(self)?;
        let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
        temp.write_all(&serialized)?;
        temp.as_file().sync_all()?;
        temp.persist(path)
            .map_err(|err| SheetError::IoError(format!("Failed to replace '{}': {}", path.display(), err)))?;
        Ok(())
    }

    pub fn sheet_names(&self) -> Vec<String> {
        self.sheets.iter().map(|s| s.name.clone()).collect()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.sheets
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn sheet(&self, name: &str) -> Result<&Worksheet> {
        self.position(name)
            .map(|idx| &self.sheets[idx])
            .ok_or_else(|| SheetError::domain(format!("Sheet '{}' not found", name)))
    }

    pub fn sheet_mut(&mut self, name: &str) -> Result<&mut Worksheet> {
        match self.position(name) {
            Some(idx) => Ok(&mut self.sheets[idx]),
            None => Err(SheetError::domain(format!("Sheet '{}' not found", name))),
        }
    }

    fn check_sheet_name(name: &str) -> Result<&str> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > 31 {
            return Err(SheetError::domain(format!(
                "Sheet name '{}' must be 1-31 characters",
                name
            )));
        }
        Ok(name)
    }

    pub fn add_sheet(&mut self, name: &str) -> Result<()> {
        let name = Self::check_sheet_name(name)?;
        if self.position(name).is_some() {
            return Err(SheetError::domain(format!("Sheet '{}' already exists", name)));
        }
        self.sheets.push(Worksheet::new(name));
        Ok(())
    }

    pub fn delete_sheet(&mut self, name: &str) -> Result<()> {
        let idx = self
            .position(name)
            .ok_or_else(|| SheetError::domain(format!("Sheet '{}' not found", name)))?;
        if self.sheets.len() == 1 {
            return Err(SheetError::domain(
                "A workbook must contain at least one sheet",
            ));
        }
        self.sheets.remove(idx);
        Ok(())
    }

    pub fn rename_sheet(&mut self, from: &str, to: &str) -> Result<()> {
        let to = Self::check_sheet_name(to)?;
        if !from.trim().eq_ignore_ascii_case(to) && self.position(to).is_some() {
            return Err(SheetError::domain(format!("Sheet '{}' already exists", to)));
        }
        self.sheet_mut(from)?.name = to.to_string();
        Ok(())
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Workbook engine instance. Holds at most one open workbook in memory.
#[derive(Debug)]
pub struct WorkbookEngine {
    id: HandleId,
    path: Option<PathBuf>,
    workbook: Option<Workbook>,
}

impl WorkbookEngine {
    pub fn new(id: HandleId) -> Self {
        Self {
            id,
            path: None,
            workbook: None,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn workbook(&self) -> Result<&Workbook> {
        self.workbook
            .as_ref()
            .ok_or_else(|| SheetError::domain("No workbook is open"))
    }

    pub fn workbook_mut(&mut self) -> Result<&mut Workbook> {
        self.workbook
            .as_mut()
            .ok_or_else(|| SheetError::domain("No workbook is open"))
    }
}

impl Engine for WorkbookEngine {
    fn open(&mut self, path: &Path) -> Result<()> {
        if let Some(current) = &self.path {
            return Err(SheetError::OpenFailure {
                path: path.to_path_buf(),
                reason: format!("engine already has '{}' open", current.display()),
            });
        }
        let workbook = Workbook::read_file(path)?;
        debug!("{} opened '{}'", self.id, path.display());
        self.workbook = Some(workbook);
        self.path = Some(path.to_path_buf());
        Ok(())
    }

    fn save(&mut self) -> Result<()> {
        let (Some(path), Some(workbook)) = (&self.path, &self.workbook) else {
            return Err(SheetError::domain("No workbook is open"));
        };
        workbook.write_atomic(path)
    }

    fn close(&mut self) -> Result<()> {
        self.path = None;
        self.workbook = None;
        Ok(())
    }

    fn terminate(&mut self) {
        self.path = None;
        self.workbook = None;
    }
}

/// Spawns `WorkbookEngine` instances and counts them.
#[derive(Debug, Default)]
pub struct WorkbookFactory {
    spawned: AtomicU64,
}

impl WorkbookFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::SeqCst)
    }
}

impl EngineFactory for WorkbookFactory {
    type Engine = WorkbookEngine;

    fn spawn(&self, id: HandleId) -> Result<WorkbookEngine> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(WorkbookEngine::new(id))
    }
}
