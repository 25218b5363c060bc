use crate::types::Value;

/// Convert bind parameters into the forms a driver accepts.
///
/// Applied by the handles when type conversion is enabled. MySQL has no
/// boolean type and takes temporal values as text; PostgreSQL takes
/// temporal values as ISO text. Other drivers receive values untouched.
pub fn convert_params(driver_name: &str, params: &[Value]) -> Vec<Value> {
    params
        .iter()
        .map(|value| convert_param(driver_name, value))
        .collect()
}

pub fn convert_param(driver_name: &str, value: &Value) -> Value {
    match (driver_name.to_ascii_lowercase().as_str(), value) {
        ("mysql", Value::Bool(b)) => Value::Int(i64::from(*b)),
        ("mysql" | "pg", Value::Date(_) | Value::Time(_) | Value::Timestamp(_)) => {
            Value::Text(value.to_string())
        }
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_mysql_conversions() {
        let date = NaiveDate::from_ymd_opt(2009, 9, 19).unwrap();
        let converted = convert_params("Mysql", &[Value::Bool(true), Value::from(date), 1.into()]);

        assert_eq!(
            converted,
            vec![Value::Int(1), Value::from("2009-09-19"), Value::Int(1)]
        );
    }

    #[test]
    fn test_unknown_driver_passes_through() {
        let params = [Value::Bool(false), Value::Null];
        assert_eq!(convert_params("Mock", &params), params.to_vec());
        assert_eq!(convert_param("Pg", &Value::Bool(false)), Value::Bool(false));
    }
}
