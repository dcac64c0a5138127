use super::{worksheet, worksheet_mut};
use crate::core::{Result, SheetError};
use crate::engine::WorkbookEngine;
use crate::engine::workbook::{CellRef, CellValue, RangeRef};

/// Largest block a single values call may read or write.
pub const MAX_RANGE_CELLS: u64 = 1_000_000;

fn check_size(range: &RangeRef) -> Result<()> {
    let cells = u64::from(range.rows()) * u64::from(range.cols());
    if cells > MAX_RANGE_CELLS {
        return Err(SheetError::domain(format!(
            "Range {} has {} cells; at most {} are allowed per call",
            range, cells, MAX_RANGE_CELLS
        )));
    }
    Ok(())
}

pub fn get_cell(engine: &WorkbookEngine, sheet: &str, cell: &str) -> Result<Option<CellValue>> {
    let cell: CellRef = cell.parse()?;
    Ok(worksheet(engine, sheet)?.get(&cell).cloned())
}

/// Set one cell; `None` clears it.
pub fn set_cell(
    engine: &mut WorkbookEngine,
    sheet: &str,
    cell: &str,
    value: Option<CellValue>,
) -> Result<()> {
    let cell: CellRef = cell.parse()?;
    worksheet_mut(engine, sheet)?.set(cell, value);
    Ok(())
}

/// Read a rectangular block, row by row.
pub fn get_values(
    engine: &WorkbookEngine,
    sheet: &str,
    range: &str,
) -> Result<Vec<Vec<Option<CellValue>>>> {
    let range: RangeRef = range.parse()?;
    check_size(&range)?;
    let ws = worksheet(engine, sheet)?;

    (0..range.rows())
        .map(|r| {
            (0..range.cols())
                .map(|c| Ok(ws.get(&range.start.offset(r, c)?).cloned()))
                .collect::<Result<Vec<_>>>()
        })
        .collect()
}

/// Write a block of rows starting at `start`. Returns the range written.
///
/// Rows may differ in length; `None` entries clear their cell. Nothing is
/// written if the block would run past the last row or column.
pub fn set_values(
    engine: &mut WorkbookEngine,
    sheet: &str,
    start: &str,
    values: Vec<Vec<Option<CellValue>>>,
) -> Result<RangeRef> {
    let start: CellRef = start.parse::<RangeRef>()?.start;
    let rows = values.len() as u32;
    let cols = values.iter().map(|row| row.len()).max().unwrap_or(0) as u32;
    if rows == 0 || cols == 0 {
        return Err(SheetError::domain("No values to write"));
    }

    let written = RangeRef {
        start,
        end: start.offset(rows - 1, cols - 1)?,
    };
    check_size(&written)?;

    let ws = worksheet_mut(engine, sheet)?;
    for (r, row) in values.into_iter().enumerate() {
        for (c, value) in row.into_iter().enumerate() {
            ws.set(start.offset(r as u32, c as u32)?, value);
        }
    }
    Ok(written)
}

/// Clear every cell in `range`. Returns how many non-empty cells were cleared.
pub fn clear(engine: &mut WorkbookEngine, sheet: &str, range: &str) -> Result<usize> {
    let range: RangeRef = range.parse()?;
    let ws = worksheet_mut(engine, sheet)?;
    let before = ws.cells.len();
    ws.cells.retain(|cell, _| !range.contains(cell));
    Ok(before - ws.cells.len())
}

/// Smallest range covering every value on the sheet.
pub fn used_range(engine: &WorkbookEngine, sheet: &str) -> Result<Option<RangeRef>> {
    Ok(worksheet(engine, sheet)?.used_range())
}
