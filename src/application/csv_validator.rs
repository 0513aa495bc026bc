use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use tracing::{debug, info};

use crate::domain::{
    error::ImportError,
    models::{
        Category, Certification, ImportOutcome, ImportedRow, NewProduct, ProductState,
        RowErrorCode, RowIssue, RowValidationResult, REQUIRED_COLUMNS,
    },
};
use crate::infrastructure::parsers::csv_parser::{parse_csv, ParsedCsv, RawRow};

pub const DEFAULT_REGISTERED_BY: &str = "sistema_csv";
pub const DEFAULT_CERTIFICATION_TYPE: &str = "INVIMA";
pub const CERTIFICATION_TYPES: [&str; 3] = ["INVIMA", "FDA", "EMA"];

const SKU_MIN_LEN: usize = 3;
const SKU_MAX_LEN: usize = 50;

/// An uploaded file as received from the caller. Both parts are optional so
/// a request without a file can still be rejected with a structured error.
#[derive(Debug, Clone, Default)]
pub struct CsvUpload {
    pub file_name: Option<String>,
    pub content: Option<Vec<u8>>,
}

impl CsvUpload {
    pub fn new(file_name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: Some(file_name.into()),
            content: Some(content.into()),
        }
    }

    /// Rejects a missing file or a name without a `.csv` suffix, returning
    /// the name and bytes otherwise.
    pub fn checked(&self) -> Result<(&str, &[u8]), ImportError> {
        let (file_name, content) = match (self.file_name.as_deref(), self.content.as_deref()) {
            (Some(name), Some(content)) if !name.trim().is_empty() => (name.trim(), content),
            _ => return Err(ImportError::MissingFile),
        };
        if !file_name.to_ascii_lowercase().ends_with(".csv") {
            return Err(ImportError::InvalidFormat {
                file_name: file_name.to_string(),
            });
        }
        Ok((file_name, content))
    }
}

pub struct CsvValidator {
    required_columns: Vec<&'static str>,
    sku_pattern: Regex,
}

impl Default for CsvValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl CsvValidator {
    pub fn new() -> Self {
        Self::with_required_columns(&REQUIRED_COLUMNS)
    }

    pub fn with_required_columns(required_columns: &[&'static str]) -> Self {
        Self {
            required_columns: required_columns.to_vec(),
            sku_pattern: Regex::new(r"^[A-Za-z0-9\-_]{3,50}$").expect("SKU pattern is a valid regex"),
        }
    }

    /// Structural pass: file presence, extension, encoding, header and rows.
    pub fn parse(&self, upload: &CsvUpload) -> Result<ParsedCsv, ImportError> {
        let (file_name, content) = upload.checked()?;
        debug!("Parsing CSV upload {} ({} bytes)", file_name, content.len());
        self.parse_bytes(content)
    }

    pub fn parse_bytes(&self, content: &[u8]) -> Result<ParsedCsv, ImportError> {
        parse_csv(content, &self.required_columns)
    }

    /// Validates the whole upload without persisting anything.
    pub fn validate(&self, upload: &CsvUpload, registered_by: Option<&str>) -> Result<ImportOutcome, ImportError> {
        let parsed = self.parse(upload)?;
        let mut seen_skus = HashSet::new();
        let mut outcome = ImportOutcome::default();

        for raw in &parsed.rows {
            let result = self.validate_row(raw, &mut seen_skus, registered_by);
            match result.product {
                Some(ref product) if result.issues.is_empty() => {
                    outcome.record_success(ImportedRow::from_product(result.row, product, None));
                }
                _ => outcome.record_failure(result.into_error()),
            }
        }

        info!(
            "Validated {} rows: {} valid, {} invalid",
            outcome.total_rows, outcome.successful, outcome.failed
        );
        Ok(outcome)
    }

    /// Validates one row. Rows are independent except for SKU uniqueness,
    /// tracked in `seen_skus` across calls; the first occurrence of a SKU is
    /// never penalized.
    pub fn validate_row(
        &self,
        raw: &RawRow,
        seen_skus: &mut HashSet<String>,
        registered_by: Option<&str>,
    ) -> RowValidationResult {
        let values: BTreeMap<&str, &str> = raw
            .values
            .iter()
            .map(|(k, v)| (k.as_str(), v.trim()))
            .collect();
        let field = |name: &str| values.get(name).copied().filter(|v| !v.is_empty());

        let mut issues = Vec::new();

        for column in &self.required_columns {
            if field(column).is_none() {
                issues.push(RowIssue::new(
                    RowErrorCode::CamposFaltantes,
                    Some(column),
                    format!("Campo '{}' es obligatorio", column),
                ));
            }
        }

        let sku = field("codigo_sku");
        if let Some(sku) = sku {
            if let Some(issue) = self.check_sku(sku) {
                issues.push(issue);
            }
            if !seen_skus.insert(sku.to_string()) {
                issues.push(RowIssue::new(
                    RowErrorCode::SkuDuplicado,
                    Some("codigo_sku"),
                    format!("El SKU {} está repetido en el archivo", sku),
                ));
            }
        }

        let category = field("categoria").and_then(|value| {
            let parsed = Category::parse(value);
            if parsed.is_none() {
                issues.push(RowIssue::new(
                    RowErrorCode::CategoriaInvalida,
                    Some("categoria"),
                    format!(
                        "Categoría inválida: '{}' (válidas: {})",
                        value,
                        Category::ALL.map(Category::as_str).join(", ")
                    ),
                ));
            }
            parsed
        });

        let unit_price = field("precio_unitario").and_then(|value| {
            let parsed = value.parse::<f64>().ok().filter(|p| p.is_finite() && *p > 0.0);
            if parsed.is_none() {
                issues.push(RowIssue::new(
                    RowErrorCode::PrecioInvalido,
                    Some("precio_unitario"),
                    format!("Precio unitario inválido '{}' (debe ser un número positivo)", value),
                ));
            }
            parsed
        });

        let provider_id = field("proveedor_id").and_then(|value| {
            let parsed = value.parse::<i64>().ok().filter(|id| *id > 0);
            if parsed.is_none() {
                issues.push(RowIssue::new(
                    RowErrorCode::ProveedorIdInvalido,
                    Some("proveedor_id"),
                    format!("ID de proveedor inválido '{}' (debe ser un entero positivo)", value),
                ));
            }
            parsed
        });

        let expires_on = field("fecha_vencimiento")
            .and_then(|value| date_or_issue(value, "fecha_vencimiento", &mut issues));
        let cert_expires_on = field("fecha_vencimiento_cert")
            .and_then(|value| date_or_issue(value, "fecha_vencimiento_cert", &mut issues));

        let state = match field("estado") {
            None => Some(ProductState::Activo),
            Some(value) => {
                let parsed = ProductState::parse(value);
                if parsed.is_none() {
                    issues.push(RowIssue::new(
                        RowErrorCode::EstadoInvalido,
                        Some("estado"),
                        format!("Estado inválido '{}' (debe ser 'Activo' o 'Inactivo')", value),
                    ));
                }
                parsed
            }
        };

        let certification_kind = match field("tipo_certificacion") {
            None => Some(DEFAULT_CERTIFICATION_TYPE),
            Some(kind) if CERTIFICATION_TYPES.contains(&kind) => Some(kind),
            Some(kind) => {
                issues.push(RowIssue::new(
                    RowErrorCode::CertificacionInvalida,
                    Some("tipo_certificacion"),
                    format!(
                        "Tipo de certificación inválido '{}' (válidos: {})",
                        kind,
                        CERTIFICATION_TYPES.join(", ")
                    ),
                ));
                None
            }
        };

        let certification_url = field("url_certificacion").filter(|url| {
            let valid = url.starts_with("http://") || url.starts_with("https://");
            if !valid {
                issues.push(RowIssue::new(
                    RowErrorCode::UrlCertificacionInvalida,
                    Some("url_certificacion"),
                    "URL de certificación debe comenzar con http:// o https://",
                ));
            }
            valid
        });

        let product = if issues.is_empty() {
            match (sku, category, unit_price, provider_id, expires_on, state, certification_kind) {
                (Some(sku), Some(category), Some(unit_price), Some(provider_id), Some(expires_on), Some(state), Some(kind)) => {
                    let certification = certification_url.map(|url| Certification {
                        kind: kind.to_string(),
                        url: url.to_string(),
                        expires_on: cert_expires_on.unwrap_or(expires_on),
                    });
                    let registered_by = registered_by
                        .filter(|r| !r.trim().is_empty())
                        .map(|r| r.trim())
                        .or_else(|| field("usuario_registro"))
                        .unwrap_or(DEFAULT_REGISTERED_BY);

                    Some(NewProduct {
                        name: field("nombre").unwrap_or_default().to_string(),
                        sku: sku.to_string(),
                        category,
                        unit_price,
                        storage_conditions: field("condiciones_almacenamiento").unwrap_or_default().to_string(),
                        expires_on,
                        provider_id,
                        registered_by: registered_by.to_string(),
                        state,
                        certification,
                    })
                }
                _ => None,
            }
        } else {
            None
        };

        if !issues.is_empty() {
            debug!("Row {} rejected with {} issue(s)", raw.row, issues.len());
        }

        RowValidationResult {
            row: raw.row,
            raw: raw.values.clone(),
            issues,
            product,
        }
    }

    fn check_sku(&self, sku: &str) -> Option<RowIssue> {
        if self.sku_pattern.is_match(sku) {
            return None;
        }
        let len = sku.chars().count();
        if !(SKU_MIN_LEN..=SKU_MAX_LEN).contains(&len) {
            Some(RowIssue::new(
                RowErrorCode::SkuInvalido,
                Some("codigo_sku"),
                format!("El código SKU debe tener entre {} y {} caracteres", SKU_MIN_LEN, SKU_MAX_LEN),
            ))
        } else {
            Some(RowIssue::new(
                RowErrorCode::SkuFormatoInvalido,
                Some("codigo_sku"),
                "El código SKU solo puede contener letras, números, - y _",
            ))
        }
    }
}

fn date_or_issue(value: &str, field: &str, issues: &mut Vec<RowIssue>) -> Option<NaiveDate> {
    let parsed = parse_date(value);
    if parsed.is_none() {
        issues.push(RowIssue::new(
            RowErrorCode::FechaInvalida,
            Some(field),
            format!(
                "Fecha inválida en '{}': '{}' (formatos: AAAA-MM-DD, DD/MM/AAAA, DD-MM-AAAA)",
                field, value
            ),
        ));
    }
    parsed
}

/// Accepts ISO-8601 (date or date-time), `DD/MM/YYYY` and `DD-MM-YYYY`.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(value).ok().map(|dt| dt.date_naive()))
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|dt| dt.date())
        })
        .or_else(|| NaiveDate::parse_from_str(value, "%d/%m/%Y").ok())
        .or_else(|| NaiveDate::parse_from_str(value, "%d-%m-%Y").ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "nombre,codigo_sku,categoria,precio_unitario,condiciones_almacenamiento,fecha_vencimiento,proveedor_id";

    fn upload(body: &str) -> CsvUpload {
        CsvUpload::new("productos.csv", format!("{HEADER}\n{body}").into_bytes())
    }

    fn raw(pairs: &[(&str, &str)]) -> RawRow {
        RawRow {
            row: 1,
            values: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    fn valid_pairs() -> Vec<(&'static str, &'static str)> {
        vec![
            ("nombre", " Jeringa 5ml "),
            ("codigo_sku", "JER-005"),
            ("categoria", "insumo"),
            ("precio_unitario", "0.35"),
            ("condiciones_almacenamiento", "Ambiente"),
            ("fecha_vencimiento", "31/12/2027"),
            ("proveedor_id", "12"),
        ]
    }

    fn codes(result: &RowValidationResult) -> Vec<RowErrorCode> {
        result.issues.iter().map(|i| i.code).collect()
    }

    #[test]
    fn missing_file_and_wrong_extension() {
        assert!(matches!(CsvUpload::default().checked(), Err(ImportError::MissingFile)));
        let txt = CsvUpload::new("productos.txt", b"x".to_vec());
        assert!(matches!(txt.checked(), Err(ImportError::InvalidFormat { .. })));
        assert!(CsvUpload::new("PRODUCTOS.CSV", b"x".to_vec()).checked().is_ok());
    }

    #[test]
    fn valid_row_is_normalized_with_defaults() {
        let validator = CsvValidator::new();
        let result = validator.validate_row(&raw(&valid_pairs()), &mut HashSet::new(), None);
        assert!(result.is_valid(), "{:?}", result.issues);

        let product = result.product.unwrap();
        assert_eq!(product.name, "Jeringa 5ml");
        assert_eq!(product.unit_price, 0.35);
        assert_eq!(product.provider_id, 12);
        assert_eq!(product.expires_on, NaiveDate::from_ymd_opt(2027, 12, 31).unwrap());
        assert_eq!(product.state, ProductState::Activo);
        assert_eq!(product.registered_by, DEFAULT_REGISTERED_BY);
        assert!(product.certification.is_none());
    }

    #[test]
    fn importing_user_overrides_row_user() {
        let mut pairs = valid_pairs();
        pairs.push(("usuario_registro", "maria"));
        let validator = CsvValidator::new();

        let from_row = validator.validate_row(&raw(&pairs), &mut HashSet::new(), None);
        assert_eq!(from_row.product.unwrap().registered_by, "maria");

        let overridden = validator.validate_row(&raw(&pairs), &mut HashSet::new(), Some("admin"));
        assert_eq!(overridden.product.unwrap().registered_by, "admin");
    }

    #[test]
    fn certification_defaults_to_invima_and_product_expiry() {
        let mut pairs = valid_pairs();
        pairs.push(("url_certificacion", "https://cert.example.com/jer.pdf"));
        let result = CsvValidator::new().validate_row(&raw(&pairs), &mut HashSet::new(), None);
        let cert = result.product.unwrap().certification.unwrap();
        assert_eq!(cert.kind, "INVIMA");
        assert_eq!(cert.expires_on, NaiveDate::from_ymd_opt(2027, 12, 31).unwrap());
    }

    #[test]
    fn certification_url_must_be_http() {
        let mut pairs = valid_pairs();
        pairs.push(("url_certificacion", "ftp://cert"));
        let result = CsvValidator::new().validate_row(&raw(&pairs), &mut HashSet::new(), None);
        assert_eq!(codes(&result), vec![RowErrorCode::UrlCertificacionInvalida]);
    }

    #[test]
    fn one_row_can_carry_several_errors() {
        let mut seen = HashSet::new();
        seen.insert("JER-005".to_string());
        let mut pairs = valid_pairs();
        pairs[2] = ("categoria", "juguete");
        pairs[3] = ("precio_unitario", "abc");
        pairs[5] = ("fecha_vencimiento", "2027/31/12");
        let result = CsvValidator::new().validate_row(&raw(&pairs), &mut seen, None);

        let codes = codes(&result);
        assert!(codes.contains(&RowErrorCode::SkuDuplicado));
        assert!(codes.contains(&RowErrorCode::CategoriaInvalida));
        assert!(codes.contains(&RowErrorCode::PrecioInvalido));
        assert!(codes.contains(&RowErrorCode::FechaInvalida));
        assert!(result.product.is_none());
    }

    #[test]
    fn blank_required_fields_are_reported_per_field() {
        let mut pairs = valid_pairs();
        pairs[0] = ("nombre", "   ");
        pairs[6] = ("proveedor_id", "");
        let result = CsvValidator::new().validate_row(&raw(&pairs), &mut HashSet::new(), None);
        let missing: Vec<_> = result
            .issues
            .iter()
            .filter(|i| i.code == RowErrorCode::CamposFaltantes)
            .filter_map(|i| i.field.clone())
            .collect();
        assert_eq!(missing, vec!["nombre".to_string(), "proveedor_id".to_string()]);
    }

    #[test]
    fn sku_length_and_charset() {
        let validator = CsvValidator::new();
        let check = |sku: &str| {
            let mut pairs = valid_pairs();
            pairs[1] = ("codigo_sku", sku);
            codes(&validator.validate_row(&raw(&pairs), &mut HashSet::new(), None))
        };
        assert_eq!(check("AB"), vec![RowErrorCode::SkuInvalido]);
        assert_eq!(check(&"A".repeat(51)), vec![RowErrorCode::SkuInvalido]);
        assert_eq!(check("SKU 001"), vec![RowErrorCode::SkuFormatoInvalido]);
        assert!(check("sku_001-A").is_empty());
    }

    #[test]
    fn price_must_be_positive_number() {
        let validator = CsvValidator::new();
        for price in ["abc", "0", "-4", "NaN", "inf"] {
            let mut pairs = valid_pairs();
            pairs[3] = ("precio_unitario", price);
            let result = validator.validate_row(&raw(&pairs), &mut HashSet::new(), None);
            assert_eq!(codes(&result), vec![RowErrorCode::PrecioInvalido], "price {price}");
        }
    }

    #[test]
    fn optional_fields_are_checked_when_present() {
        let validator = CsvValidator::new();
        let mut pairs = valid_pairs();
        pairs.push(("estado", "Borrado"));
        pairs.push(("tipo_certificacion", "ISO"));
        pairs.push(("fecha_vencimiento_cert", "mañana"));
        let result = validator.validate_row(&raw(&pairs), &mut HashSet::new(), None);
        let codes = codes(&result);
        assert!(codes.contains(&RowErrorCode::EstadoInvalido));
        assert!(codes.contains(&RowErrorCode::CertificacionInvalida));
        assert!(codes.contains(&RowErrorCode::FechaInvalida));
    }

    #[test]
    fn accepted_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
        for value in ["2026-03-09", "09/03/2026", "09-03-2026", "2026-03-09T10:00:00Z", "2026-03-09T10:00:00"] {
            assert_eq!(parse_date(value), Some(expected), "{value}");
        }
        assert_eq!(parse_date("03/2026"), None);
        assert_eq!(parse_date("31/02/2026"), None);
    }

    #[test]
    fn duplicate_sku_penalizes_only_later_rows() {
        let body = "A,SKU-100,insumo,1,x,31/12/2026,1\n\
                    B,SKU-100,insumo,1,x,31/12/2026,1\n\
                    C,SKU-101,insumo,1,x,31/12/2026,1\n\
                    D,SKU-100,insumo,abc,x,31/12/2026,1\n";
        let outcome = CsvValidator::new().validate(&upload(body), None).unwrap();
        assert_eq!(outcome.total_rows, 4);
        assert_eq!(outcome.successful, 2);
        assert_eq!(outcome.failed, 2);
        assert_eq!(outcome.imported[0].row, 1);
        assert!(outcome.errors.iter().all(|e| e.has_code(RowErrorCode::SkuDuplicado)));
        assert_eq!(outcome.errors[1].row, 4);
        assert!(outcome.errors[1].has_code(RowErrorCode::PrecioInvalido));
    }

    #[test]
    fn bad_price_does_not_abort_batch() {
        let body = "A,SKU-200,insumo,abc,x,31/12/2026,1\nB,SKU-201,reactivo,3.5,x,2026-12-31,1\n";
        let outcome = CsvValidator::new().validate(&upload(body), None).unwrap();
        assert_eq!(outcome.successful, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.errors[0].sku.as_deref(), Some("SKU-200"));
        assert_eq!(outcome.errors[0].raw["precio_unitario"], "abc");
        assert!(outcome.errors[0].has_code(RowErrorCode::PrecioInvalido));
    }

    #[test]
    fn totals_always_add_up() {
        let mut body = String::new();
        for i in 0..40 {
            let price = if i % 3 == 0 { "x" } else { "2" };
            body.push_str(&format!("P{i},SKU-{:03},insumo,{price},x,31/12/2026,1\n", i % 25));
        }
        let outcome = CsvValidator::new().validate(&upload(&body), None).unwrap();
        assert_eq!(outcome.total_rows, 40);
        assert_eq!(outcome.successful + outcome.failed, outcome.total_rows);
        assert_eq!(outcome.imported.len() as u64, outcome.successful);
        assert_eq!(outcome.errors.len() as u64, outcome.failed);
    }
}
