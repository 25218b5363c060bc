use crate::types::{Coercion, SqlType, TypeRegistry};

/// Normalized column metadata, the same shape for every backend.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub sql_type: SqlType,
    pub type_name: String,
    pub nullable: Option<bool>,
    pub indexed: Option<bool>,
    pub primary: Option<bool>,
    pub unique: Option<bool>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub default: Option<String>,
    /// Element type name when the column is an array.
    pub array_of_type: Option<String>,
    /// Coercion pinned by the driver, overriding the registry lookup.
    pub coercion: Option<Coercion>,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, sql_type: SqlType, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type,
            type_name: type_name.into(),
            nullable: None,
            indexed: None,
            primary: None,
            unique: None,
            precision: None,
            scale: None,
            default: None,
            array_of_type: None,
            coercion: None,
        }
    }

    /// Build from a native type descriptor such as `varchar(255)`.
    pub fn from_descriptor(
        name: impl Into<String>,
        descriptor: &str,
        registry: &TypeRegistry,
    ) -> Self {
        let parsed = registry.parse_descriptor(descriptor);
        let mut info = Self::new(name, parsed.sql_type, parsed.type_name);
        info.precision = parsed.precision;
        info.scale = parsed.scale;
        info
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = Some(nullable);
        self
    }

    pub fn precision(mut self, precision: Option<u32>) -> Self {
        self.precision = precision;
        self
    }

    pub fn coercion(mut self, coercion: Coercion) -> Self {
        self.coercion = Some(coercion);
        self
    }

    /// The coercion to apply when fetching this column.
    pub fn resolve_coercion(&self, registry: &TypeRegistry) -> Coercion {
        match &self.coercion {
            Some(coercion) => coercion.clone(),
            None => registry.coercion_for(&self.type_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[test]
    fn test_from_descriptor() {
        let registry = TypeRegistry::standard();
        let col = ColumnInfo::from_descriptor("price", "DECIMAL(10,2)", &registry);

        assert_eq!(col.name, "price");
        assert_eq!(col.type_name, "DECIMAL");
        assert_eq!(col.sql_type.code(), 3);
        assert_eq!(col.precision, Some(10));
        assert_eq!(col.scale, Some(2));
        assert!(col.nullable.is_none());
    }

    #[test]
    fn test_pinned_coercion_wins() {
        let registry = TypeRegistry::standard();
        let col = ColumnInfo::new("age", SqlType::Integer, "integer").coercion(Coercion::Varchar);

        assert_eq!(
            col.resolve_coercion(&registry).coerce(Some("19")),
            Value::Text("19".to_string())
        );
    }
}
