// ============================================================================
// Action Dispatch
// ============================================================================
//
// Maps action identifiers such as `range.set` to handlers. A handler parses
// the JSON arguments up front and hands back the operation context plus a
// closure to run on the engine, so malformed calls fail before any file is
// opened.
//
// ============================================================================

use crate::commands::{range, sheet};
use crate::core::{Result, SheetError};
use crate::engine::WorkbookEngine;
use crate::engine::workbook::CellValue;
use crate::executor::{OperationCategory, OperationContext};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;

/// Engine closure produced by a handler.
pub type ActionFn = Box<dyn FnOnce(&mut WorkbookEngine) -> Result<Value> + Send>;

/// A parsed call, ready to hand to the coordinator.
pub struct PreparedAction {
    pub context: OperationContext,
    pub run: ActionFn,
}

pub trait ActionHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn category(&self) -> OperationCategory;

    fn description(&self) -> &'static str;

    /// Parse `args` and build the engine call.
    fn prepare(&self, args: &Value) -> Result<ActionFn>;
}

/// Actions every deployment must provide.
pub const REQUIRED_ACTIONS: &[&str] = &[
    "range.set",
    "range.get",
    "range.set_values",
    "range.get_values",
    "range.clear",
    "sheet.add",
    "sheet.delete",
    "sheet.rename",
    "sheet.list",
];

/// Listing entry for one registered action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionInfo {
    pub name: &'static str,
    pub category: OperationCategory,
    pub description: &'static str,
}

pub struct ActionRegistry {
    handlers: BTreeMap<&'static str, Box<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    /// Register a handler, replacing any handler with the same name.
    pub fn register(&mut self, handler: Box<dyn ActionHandler>) {
        log::debug!("Registered action: {}", handler.name());
        self.handlers.insert(handler.name(), handler);
    }

    /// Registry with every built-in workbook action.
    pub fn with_default_actions() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(RangeSet));
        registry.register(Box::new(RangeGet));
        registry.register(Box::new(RangeSetValues));
        registry.register(Box::new(RangeGetValues));
        registry.register(Box::new(RangeClear));
        registry.register(Box::new(SheetAdd));
        registry.register(Box::new(SheetDelete));
        registry.register(Box::new(SheetRename));
        registry.register(Box::new(SheetList));
        registry
    }

    /// Fail if any of `required` has no handler.
    pub fn validate(&self, required: &[&str]) -> Result<()> {
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|name| !self.handlers.contains_key(*name))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SheetError::Config(format!(
                "no handler registered for: {}",
                missing.join(", ")
            )))
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn ActionHandler> {
        self.handlers.get(name).map(|h| h.as_ref())
    }

    /// Parse a call to `name`. An optional `timeout_ms` argument overrides
    /// the category default timeout.
    pub fn prepare(&self, name: &str, args: &Value) -> Result<PreparedAction> {
        let handler = self
            .get(name)
            .ok_or_else(|| SheetError::domain(format!("Unknown action '{}'", name)))?;

        let mut context = OperationContext::new(handler.name(), handler.category());
        if let Some(ms) = optional::<u64>(args, "timeout_ms")? {
            if ms == 0 {
                return Err(SheetError::domain(
                    "Invalid argument 'timeout_ms': must be greater than zero",
                ));
            }
            context = context.with_timeout(Duration::from_millis(ms));
        }

        Ok(PreparedAction {
            context,
            run: handler.prepare(args)?,
        })
    }

    pub fn list(&self) -> Vec<ActionInfo> {
        self.handlers
            .values()
            .map(|h| ActionInfo {
                name: h.name(),
                category: h.category(),
                description: h.description(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::with_default_actions()
    }
}

// ============================================================================
// Argument helpers
// ============================================================================

fn optional<T: DeserializeOwned>(args: &Value, key: &str) -> Result<Option<T>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|err| SheetError::domain(format!("Invalid argument '{}': {}", key, err))),
    }
}

fn required<T: DeserializeOwned>(args: &Value, key: &str) -> Result<T> {
    optional(args, key)?
        .ok_or_else(|| SheetError::domain(format!("Missing required argument '{}'", key)))
}

fn sheet_arg(args: &Value) -> Result<String> {
    Ok(optional::<String>(args, "sheet")?
        .unwrap_or_else(|| crate::engine::workbook::DEFAULT_SHEET_NAME.to_string()))
}

fn to_json<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

// ============================================================================
// Built-in handlers
// ============================================================================

struct RangeSet;

impl ActionHandler for RangeSet {
    fn name(&self) -> &'static str {
        "range.set"
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Write
    }

    fn description(&self) -> &'static str {
        "Set one cell: {sheet?, cell, value}; a null value clears it"
    }

    fn prepare(&self, args: &Value) -> Result<ActionFn> {
        let sheet = sheet_arg(args)?;
        let cell: String = required(args, "cell")?;
        let value: Option<CellValue> = optional(args, "value")?;
        Ok(Box::new(move |engine: &mut WorkbookEngine| {
            range::set_cell(engine, &sheet, &cell, value)?;
            Ok(json!({ "cell": cell.to_uppercase() }))
        }))
    }
}

struct RangeGet;

impl ActionHandler for RangeGet {
    fn name(&self) -> &'static str {
        "range.get"
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Read
    }

    fn description(&self) -> &'static str {
        "Read one cell: {sheet?, cell}"
    }

    fn prepare(&self, args: &Value) -> Result<ActionFn> {
        let sheet = sheet_arg(args)?;
        let cell: String = required(args, "cell")?;
        Ok(Box::new(move |engine: &mut WorkbookEngine| {
            to_json(range::get_cell(engine, &sheet, &cell)?)
        }))
    }
}

struct RangeSetValues;

impl ActionHandler for RangeSetValues {
    fn name(&self) -> &'static str {
        "range.set_values"
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Write
    }

    fn description(&self) -> &'static str {
        "Write a block of rows: {sheet?, start, values: [[...]]}"
    }

    fn prepare(&self, args: &Value) -> Result<ActionFn> {
        let sheet = sheet_arg(args)?;
        let start: String = required(args, "start")?;
        let values: Vec<Vec<Option<CellValue>>> = required(args, "values")?;
        Ok(Box::new(move |engine: &mut WorkbookEngine| {
            let written = range::set_values(engine, &sheet, &start, values)?;
            Ok(json!({ "range": written.to_string() }))
        }))
    }
}

struct RangeGetValues;

impl ActionHandler for RangeGetValues {
    fn name(&self) -> &'static str {
        "range.get_values"
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Read
    }

    fn description(&self) -> &'static str {
        "Read a block of rows: {sheet?, range}"
    }

    fn prepare(&self, args: &Value) -> Result<ActionFn> {
        let sheet = sheet_arg(args)?;
        let target: String = required(args, "range")?;
        Ok(Box::new(move |engine: &mut WorkbookEngine| {
            to_json(range::get_values(engine, &sheet, &target)?)
        }))
    }
}

struct RangeClear;

impl ActionHandler for RangeClear {
    fn name(&self) -> &'static str {
        "range.clear"
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Write
    }

    fn description(&self) -> &'static str {
        "Clear a range: {sheet?, range}"
    }

    fn prepare(&self, args: &Value) -> Result<ActionFn> {
        let sheet = sheet_arg(args)?;
        let target: String = required(args, "range")?;
        Ok(Box::new(move |engine: &mut WorkbookEngine| {
            let cleared = range::clear(engine, &sheet, &target)?;
            Ok(json!({ "cleared": cleared }))
        }))
    }
}

struct SheetAdd;

impl ActionHandler for SheetAdd {
    fn name(&self) -> &'static str {
        "sheet.add"
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Write
    }

    fn description(&self) -> &'static str {
        "Add a worksheet: {name}"
    }

    fn prepare(&self, args: &Value) -> Result<ActionFn> {
        let name: String = required(args, "name")?;
        Ok(Box::new(move |engine: &mut WorkbookEngine| {
            sheet::add(engine, &name)?;
            Ok(json!({ "sheet": name }))
        }))
    }
}

struct SheetDelete;

impl ActionHandler for SheetDelete {
    fn name(&self) -> &'static str {
        "sheet.delete"
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Write
    }

    fn description(&self) -> &'static str {
        "Delete a worksheet: {name}"
    }

    fn prepare(&self, args: &Value) -> Result<ActionFn> {
        let name: String = required(args, "name")?;
        Ok(Box::new(move |engine: &mut WorkbookEngine| {
            sheet::delete(engine, &name)?;
            Ok(json!({ "deleted": name }))
        }))
    }
}

struct SheetRename;

impl ActionHandler for SheetRename {
    fn name(&self) -> &'static str {
        "sheet.rename"
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Write
    }

    fn description(&self) -> &'static str {
        "Rename a worksheet: {from, to}"
    }

    fn prepare(&self, args: &Value) -> Result<ActionFn> {
        let from: String = required(args, "from")?;
        let to: String = required(args, "to")?;
        Ok(Box::new(move |engine: &mut WorkbookEngine| {
            sheet::rename(engine, &from, &to)?;
            Ok(json!({ "sheet": to }))
        }))
    }
}

struct SheetList;

impl ActionHandler for SheetList {
    fn name(&self) -> &'static str {
        "sheet.list"
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Metadata
    }

    fn description(&self) -> &'static str {
        "List worksheet names"
    }

    fn prepare(&self, _args: &Value) -> Result<ActionFn> {
        Ok(Box::new(|engine: &mut WorkbookEngine| to_json(sheet::list(engine)?)))
    }
}
