use sluice_model::{Field, FieldType, Ingester, Value};

use crate::error::StoreError;

/// Double-quote an identifier, doubling embedded quotes. Both reference
/// back-ends accept standard SQL quoting. Control characters are rejected
/// outright rather than escaped.
pub fn quote_ident(name: &str) -> Result<String, StoreError> {
    if name.is_empty() || name.chars().any(|c| c.is_control()) {
        return Err(StoreError::BadIdentifier(name.to_string()));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Escape a string for a literal SQL context (DDL options, database
/// names). Data values always go through parameter binding.
pub fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// Persistent columns in declaration order. The synthetic `ts` / `uid`
/// field is already first by construction.
pub fn persistent_columns(ing: &Ingester) -> Vec<&Field> {
    ing.persistent_fields().collect()
}

/// Comma-joined quoted column list.
pub fn column_list(fields: &[&Field]) -> Result<String, StoreError> {
    let quoted: Result<Vec<String>, StoreError> =
        fields.iter().map(|f| quote_ident(&f.name)).collect();
    Ok(quoted?.join(", "))
}

/// Reject unsigned values an adapter would have to silently truncate.
/// Both reference back-ends store unsigned columns in signed storage.
pub fn check_unsigned_fit(field: &Field, value: &Value) -> Result<(), StoreError> {
    let overflow = |limit: i128| -> Result<(), StoreError> {
        let as_int: Option<i128> = match value {
            Value::Int(v) => Some(i128::from(*v)),
            Value::UInt(v) => Some(i128::from(*v)),
            _ => None,
        };
        match as_int {
            Some(v) if v > limit || v < 0 => Err(StoreError::Overflow {
                column: field.name.clone(),
                kind: field.kind.to_string(),
                value: value.to_string(),
            }),
            _ => Ok(()),
        }
    };
    match field.kind {
        FieldType::UInt8 => overflow(u8::MAX as i128),
        FieldType::UInt16 => overflow(u16::MAX as i128),
        FieldType::UInt32 => overflow(u32::MAX as i128),
        FieldType::UInt64 => overflow(i64::MAX as i128),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_doubles_embedded_quotes() {
        assert_eq!(quote_ident("price").unwrap(), "\"price\"");
        assert_eq!(quote_ident("we\"ird").unwrap(), "\"we\"\"ird\"");
        assert!(quote_ident("bad\nname").is_err());
        assert!(quote_ident("").is_err());
    }

    #[test]
    fn unsigned_overflow_is_rejected_not_truncated() {
        let mut field = Field::new("count", FieldType::UInt8);
        assert!(check_unsigned_fit(&field, &Value::Int(255)).is_ok());
        assert!(check_unsigned_fit(&field, &Value::Int(256)).is_err());
        assert!(check_unsigned_fit(&field, &Value::Int(-1)).is_err());

        field.kind = FieldType::UInt64;
        assert!(check_unsigned_fit(&field, &Value::UInt(i64::MAX as u64)).is_ok());
        assert!(check_unsigned_fit(&field, &Value::UInt(i64::MAX as u64 + 1)).is_err());
    }
}
