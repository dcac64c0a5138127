// ============================================================================
// Workbook Commands
// ============================================================================
//
// Domain operations over one open workbook. Each command is a plain function
// of the engine plus its parameters; it runs on the engine's worker thread
// and knows nothing about sessions, pooling or timeouts.
//
// ============================================================================

pub mod range;
pub mod sheet;

use crate::core::Result;
use crate::engine::WorkbookEngine;
use crate::engine::workbook::Worksheet;

fn worksheet<'a>(engine: &'a WorkbookEngine, sheet: &str) -> Result<&'a Worksheet> {
    engine.workbook()?.sheet(sheet)
}

fn worksheet_mut<'a>(engine: &'a mut WorkbookEngine, sheet: &str) -> Result<&'a mut Worksheet> {
    engine.workbook_mut()?.sheet_mut(sheet)
}
