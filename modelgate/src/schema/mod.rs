mod parser;
mod transform;
mod types;
mod validator;

pub use parser::{parse_field_schema, parse_field_schema_str};
pub use transform::{close_in_place, close_schema};
pub use types::{BsonType, BsonTypes, FieldSchema};
pub use validator::{ValidationAction, ValidationDescriptor, ValidationLevel, Validator};
