//! CSV fee-data sheets: template export and import parsing.
//!
//! Layout: a row of human-readable labels, a header row of machine column
//! names (`student_code`, `student_name`, `<line>_<scheme>_<n>`..., `note`),
//! then one row per student.

use crate::models::{MilestoneAmounts, MilestoneKey, OrderStructure, OrderStudent};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashMap;
use std::str::FromStr;

pub const STUDENT_CODE_COLUMN: &str = "student_code";
pub const STUDENT_NAME_COLUMN: &str = "student_name";
pub const NOTE_COLUMN: &str = "note";

/// Column name for one fee line and milestone.
pub fn amount_column(line_number: &str, key: &MilestoneKey) -> String {
    format!("{line_number}_{key}")
}

/// `(column, label)` for every importable line and milestone: lines without a
/// formula that can carry amounts.
fn amount_columns(structure: &OrderStructure) -> Vec<(String, String)> {
    let mut columns = Vec::new();
    for line in &structure.fee_lines {
        if line.formula().is_some() || !line.parsed_type().accepts_amounts() {
            continue;
        }
        for milestone in &structure.milestones {
            columns.push((
                amount_column(&line.line_number, &milestone.key()),
                format!("{} - {}", line.title_en, milestone.title),
            ));
        }
    }
    columns
}

fn sheet_error(message: impl Into<String>) -> AppError {
    AppError::field("file", message)
}

/// Renders the import template for an order's enrolled students.
pub fn write_template(structure: &OrderStructure, students: &[OrderStudent]) -> Result<Vec<u8>, AppError> {
    let columns = amount_columns(structure);
    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut labels = vec!["Student Code".to_string(), "Student Name".to_string()];
    labels.extend(columns.iter().map(|(_, label)| label.clone()));
    labels.push("Note".to_string());

    let mut header = vec![STUDENT_CODE_COLUMN.to_string(), STUDENT_NAME_COLUMN.to_string()];
    header.extend(columns.iter().map(|(column, _)| column.clone()));
    header.push(NOTE_COLUMN.to_string());

    let write_err = |e: csv::Error| AppError::InternalError(anyhow::anyhow!("Failed to write template: {}", e));
    writer.write_record(&labels).map_err(write_err)?;
    writer.write_record(&header).map_err(write_err)?;

    for student in students {
        let mut record = vec![student.student_code.clone(), student.student_name.clone()];
        record.extend(std::iter::repeat(String::new()).take(columns.len()));
        record.push(String::new());
        writer.write_record(&record).map_err(write_err)?;
    }

    writer
        .into_inner()
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to flush template: {}", e)))
}

/// One student row of an imported sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct FeeSheetRow {
    /// 1-based row in the file, counting the label and header rows.
    pub row_number: usize,
    pub student_code: String,
    pub note: Option<String>,
    cells: HashMap<String, String>,
}

impl FeeSheetRow {
    /// Amounts for one line from its `<line>_<key>` columns. `None` when the
    /// sheet has no value for any of the line's milestones.
    pub fn line_amounts(&self, line_number: &str, keys: &[MilestoneKey]) -> Result<Option<MilestoneAmounts>, String> {
        let mut amounts = MilestoneAmounts::new();
        for key in keys {
            let column = amount_column(line_number, key);
            let Some(raw) = self.cells.get(&column) else {
                continue;
            };
            if let Some(amount) = parse_amount(raw).map_err(|_| format!("Invalid amount '{}' in column {}", raw.trim(), column))? {
                amounts.insert(*key, amount);
            }
        }
        Ok((!amounts.is_empty()).then_some(amounts))
    }
}

/// Blank cells are `None`; thousands separators and spaces are ignored.
pub fn parse_amount(raw: &str) -> Result<Option<Decimal>, rust_decimal::Error> {
    let cleaned: String = raw.chars().filter(|c| !c.is_whitespace() && *c != ',').collect();
    if cleaned.is_empty() {
        return Ok(None);
    }
    Decimal::from_str(&cleaned).map(Some)
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeeSheet {
    pub rows: Vec<FeeSheetRow>,
}

fn is_student_code_header(cell: &str) -> bool {
    cell.trim().eq_ignore_ascii_case(STUDENT_CODE_COLUMN)
}

/// Parses an uploaded sheet. The label row is optional: the header is the
/// first row holding a `student_code` cell among the first two rows.
pub fn parse_sheet(bytes: &[u8]) -> Result<FeeSheet, AppError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF".as_slice()).unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut records = Vec::new();
    for record in reader.records() {
        records.push(record.map_err(|e| sheet_error(format!("Unreadable CSV: {}", e)))?);
    }
    if records.is_empty() {
        return Err(sheet_error("The file is empty"));
    }

    let header_index = records
        .iter()
        .take(2)
        .position(|r| r.iter().any(is_student_code_header))
        .ok_or_else(|| sheet_error("Header row with a student_code column not found"))?;
    let header: Vec<String> = records[header_index].iter().map(|h| h.trim().to_string()).collect();

    let code_index = header
        .iter()
        .position(|h| is_student_code_header(h))
        .ok_or_else(|| sheet_error("Header row with a student_code column not found"))?;
    let note_index = header.iter().position(|h| h.eq_ignore_ascii_case(NOTE_COLUMN));

    let mut rows = Vec::new();
    for (offset, record) in records.iter().enumerate().skip(header_index + 1) {
        let student_code = record.get(code_index).map(str::trim).unwrap_or_default();
        if student_code.is_empty() {
            continue;
        }
        let cells = header
            .iter()
            .zip(record.iter())
            .filter(|(h, _)| !h.is_empty())
            .map(|(h, v)| (h.clone(), v.to_string()))
            .collect();
        let note = note_index
            .and_then(|i| record.get(i))
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);

        rows.push(FeeSheetRow {
            row_number: offset + 1,
            student_code: student_code.to_string(),
            note,
            cells,
        });
    }

    Ok(FeeSheet { rows })
}
