use std::collections::BTreeMap;

use csv::ReaderBuilder;
use tracing::{debug, info, error};
use crate::domain::error::ImportError;

const UTF8_BOM: &str = "\u{feff}";

/// One data row as read from the file, values untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    /// 1-based ordinal over data rows.
    pub row: usize,
    pub values: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCsv {
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
}

/// Reads the whole upload and checks its structure: UTF-8, a header row that
/// has every required column, and at least one data row. Rows are not
/// validated here.
pub fn parse_csv(bytes: &[u8], required_columns: &[&str]) -> Result<ParsedCsv, ImportError> {
    let content = std::str::from_utf8(bytes).map_err(|e| {
        error!("CSV upload is not valid UTF-8: {}", e);
        ImportError::InvalidEncoding
    })?;
    let content = content.strip_prefix(UTF8_BOM).unwrap_or(content);

    if content.trim().is_empty() {
        return Err(ImportError::EmptyCsv);
    }

    debug!("Creating CSV reader with headers enabled");
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader.headers()
        .map_err(|e| {
            error!("Failed to read CSV headers: {}", e);
            ImportError::MalformedCsv(e.to_string())
        })?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    if headers.iter().all(|h| h.is_empty()) {
        return Err(ImportError::EmptyCsv);
    }
    debug!("CSV headers: {:?}", headers);

    let missing: Vec<String> = required_columns
        .iter()
        .filter(|column| !headers.iter().any(|h| h == *column))
        .map(|column| column.to_string())
        .collect();
    if !missing.is_empty() {
        error!("CSV is missing required columns: {:?}", missing);
        return Err(ImportError::MissingColumns { missing });
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| {
            error!("Failed to read CSV record at row {}: {}", rows.len() + 1, e);
            ImportError::MalformedCsv(e.to_string())
        })?;

        let mut values = BTreeMap::new();
        for (i, header) in headers.iter().enumerate() {
            if header.is_empty() {
                continue;
            }
            values.insert(header.clone(), record.get(i).unwrap_or("").to_string());
        }

        rows.push(RawRow { row: rows.len() + 1, values });

        if rows.len() % 1000 == 0 {
            debug!("Read {} CSV rows", rows.len());
        }
    }

    if rows.is_empty() {
        return Err(ImportError::NoDataRows);
    }

    info!("Parsed {} rows from CSV", rows.len());
    Ok(ParsedCsv { headers, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::REQUIRED_COLUMNS;

    const HEADER: &str = "nombre,codigo_sku,categoria,precio_unitario,condiciones_almacenamiento,fecha_vencimiento,proveedor_id";

    #[test]
    fn reads_rows_with_one_based_ordinals() {
        let csv = format!("{HEADER}\nGasas,SKU-001,insumo,2.5,Seco,31/12/2026,4\nSuero,SKU-002,medicamento,8,Frio,2026-01-01,5\n");
        let parsed = parse_csv(csv.as_bytes(), &REQUIRED_COLUMNS).unwrap();
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0].row, 1);
        assert_eq!(parsed.rows[1].row, 2);
        assert_eq!(parsed.rows[1].values["codigo_sku"], "SKU-002");
    }

    #[test]
    fn header_only_has_no_data() {
        let csv = format!("{HEADER}\n");
        assert!(matches!(parse_csv(csv.as_bytes(), &REQUIRED_COLUMNS), Err(ImportError::NoDataRows)));
    }

    #[test]
    fn empty_file_is_rejected() {
        assert!(matches!(parse_csv(b"", &REQUIRED_COLUMNS), Err(ImportError::EmptyCsv)));
        assert!(matches!(parse_csv(b"  \n\n", &REQUIRED_COLUMNS), Err(ImportError::EmptyCsv)));
    }

    #[test]
    fn missing_columns_are_listed() {
        let csv = "nombre,codigo_sku,precio_unitario,condiciones_almacenamiento,fecha_vencimiento,proveedor_id\nA,SKU-1,1,x,31/12/2026,1\n";
        match parse_csv(csv.as_bytes(), &REQUIRED_COLUMNS) {
            Err(ImportError::MissingColumns { missing }) => assert_eq!(missing, vec!["categoria".to_string()]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let bytes = [0x6e, 0xff, 0xfe, 0x0a];
        assert!(matches!(parse_csv(&bytes, &REQUIRED_COLUMNS), Err(ImportError::InvalidEncoding)));
    }

    #[test]
    fn bom_and_short_rows_are_tolerated() {
        let csv = format!("\u{feff}{HEADER}\nSolo nombre\n");
        let parsed = parse_csv(csv.as_bytes(), &REQUIRED_COLUMNS).unwrap();
        assert_eq!(parsed.headers[0], "nombre");
        assert_eq!(parsed.rows[0].values["nombre"], "Solo nombre");
        assert_eq!(parsed.rows[0].values["proveedor_id"], "");
    }
}
