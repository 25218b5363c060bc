mod column;
mod convert;
mod registry;
mod row;
mod value;

pub use column::ColumnInfo;
pub use convert::{convert_param, convert_params};
pub(crate) use registry::{parse_bool, parse_timestamp};
pub use registry::{Coercion, SqlType, TypeDescriptor, TypeEntry, TypeRegistry};
pub use row::{ColumnIndex, RawRow, ResultSet, Row, RowShape, ScrollDirection};
pub use value::Value;
