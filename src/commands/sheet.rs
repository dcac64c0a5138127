use crate::core::Result;
use crate::engine::WorkbookEngine;

pub fn list(engine: &WorkbookEngine) -> Result<Vec<String>> {
    Ok(engine.workbook()?.sheet_names())
}

pub fn add(engine: &mut WorkbookEngine, name: &str) -> Result<()> {
    engine.workbook_mut()?.add_sheet(name)
}

pub fn delete(engine: &mut WorkbookEngine, name: &str) -> Result<()> {
    engine.workbook_mut()?.delete_sheet(name)
}

pub fn rename(engine: &mut WorkbookEngine, from: &str, to: &str) -> Result<()> {
    engine.workbook_mut()?.rename_sheet(from, to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{HandleId, SheetError};
    use crate::engine::Engine;
    use crate::engine::workbook::Workbook;
    use tempfile::tempdir;

    #[test]
    fn test_sheet_lifecycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sheets.json");
        Workbook::create_file(&path).unwrap();
        let mut engine = WorkbookEngine::new(HandleId(1));
        engine.open(&path).unwrap();

        add(&mut engine, "Q1").unwrap();
        rename(&mut engine, "Q1", "Quarter 1").unwrap();
        assert_eq!(list(&engine).unwrap(), vec!["Sheet1", "Quarter 1"]);

        delete(&mut engine, "Sheet1").unwrap();
        assert!(matches!(
            delete(&mut engine, "Quarter 1"),
            Err(SheetError::Domain(_))
        ));
    }

    #[test]
    fn test_rename_checks_new_name() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("names.json");
        Workbook::create_file(&path).unwrap();
        let mut engine = WorkbookEngine::new(HandleId(1));
        engine.open(&path).unwrap();

        match rename(&mut engine, "Sheet1", "  ") {
            Err(SheetError::Domain(message)) => assert!(message.contains("1-31 characters")),
            other => panic!("expected domain error, got {:?}", other),
        }
        assert!(rename(&mut engine, "Sheet1", &"x".repeat(32)).is_err());
        assert_eq!(list(&engine).unwrap(), vec!["Sheet1"]);

        rename(&mut engine, "Sheet1", " Summary ").unwrap();
        assert_eq!(list(&engine).unwrap(), vec!["Summary"]);
    }

    #[test]
    fn test_commands_need_an_open_workbook() {
        let engine = WorkbookEngine::new(HandleId(1));
        assert!(list(&engine).is_err());
    }
}
