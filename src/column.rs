//! Derives canonical column metadata from raw field definitions
use crate::constants::{column_flag, type_};
use crate::driver::FieldPacket;

/// Precision and scale reported for DECIMAL columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecimalSize {
    /// Total number of significant digits
    pub precision: u32,
    /// Number of digits after the decimal point
    pub scale: u32,
}

/// Canonical description of one result set column
///
/// Derived once from the field packets of a query and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Column name as reported by the server
    pub name: String,
    /// Canonical sql type name, e.g. `VARCHAR` or `BIGINT`
    pub type_name: &'static str,
    /// True unless the column carries the NOT NULL flag
    pub nullable: bool,
    /// Declared length where the type has one. Reported in characters
    /// for text types (raw byte length divided by the utf8mb4 width)
    pub length: Option<u32>,
    /// Precision and scale for DECIMAL columns
    pub decimal_size: Option<DecimalSize>,
}

/// Byte width the server assumes per character for utf8mb4 columns
const BYTES_PER_CHAR: u32 = 4;

/// Size class boundaries of the blob/text family, in bytes
const TINY_MAX: u32 = 0xFF;
const PLAIN_MAX: u32 = 0xFFFF;
const MEDIUM_MAX: u32 = 0xFF_FFFF;

/// Pick the TINY/plain/MEDIUM/LONG variant of a blob or text family name
fn sized_name(byte_length: u32, binary: bool) -> &'static str {
    match (byte_length, binary) {
        (..=TINY_MAX, true) => "TINYBLOB",
        (..=TINY_MAX, false) => "TINYTEXT",
        (..=PLAIN_MAX, true) => "BLOB",
        (..=PLAIN_MAX, false) => "TEXT",
        (..=MEDIUM_MAX, true) => "MEDIUMBLOB",
        (..=MEDIUM_MAX, false) => "MEDIUMTEXT",
        (_, true) => "LONGBLOB",
        (_, false) => "LONGTEXT",
    }
}

impl ColumnInfo {
    /// Derive the canonical description from a raw field definition
    pub fn from_field(field: &FieldPacket) -> ColumnInfo {
        let binary = field.flags & column_flag::BINARY != 0;
        let mut length = None;
        let mut decimal_size = None;
        let type_name = match field.type_code {
            type_::DECIMAL | type_::NEW_DECIMAL => {
                // The server reports the column length with room for the
                // sign and the decimal point
                decimal_size = Some(DecimalSize {
                    precision: field.column_length.saturating_sub(2),
                    scale: field.decimals.into(),
                });
                "DECIMAL"
            }
            // TINYINT(1) is the storage mysql uses for booleans
            type_::TINY if field.column_length == 1 => "BOOL",
            type_::TINY => "TINYINT",
            type_::SHORT => "SMALLINT",
            type_::LONG | type_::INT24 => "INT",
            type_::LONG_LONG => "BIGINT",
            type_::FLOAT => "FLOAT",
            type_::DOUBLE => "DOUBLE",
            type_::NULL => "NULL",
            type_::TIMESTAMP => "TIMESTAMP",
            type_::DATE => "DATE",
            type_::TIME => "TIME",
            type_::DATETIME => "DATETIME",
            type_::YEAR => "YEAR",
            type_::VAR_CHAR | type_::VAR_STRING => {
                length = Some(field.column_length / BYTES_PER_CHAR);
                "VARCHAR"
            }
            type_::STRING if field.flags & column_flag::ENUM != 0 => "ENUM",
            type_::STRING if field.flags & column_flag::SET != 0 => "SET",
            type_::STRING => {
                length = Some(field.column_length / BYTES_PER_CHAR);
                "CHAR"
            }
            type_::BIT => {
                length = Some(field.column_length);
                "BIT"
            }
            type_::JSON => "JSON",
            type_::ENUM => "ENUM",
            type_::SET => "SET",
            type_::TINY_BLOB | type_::MEDIUM_BLOB | type_::LONG_BLOB | type_::BLOB => {
                length = Some(if binary {
                    field.column_length
                } else {
                    field.column_length / BYTES_PER_CHAR
                });
                sized_name(field.column_length, binary)
            }
            type_::GEOMETRY => "GEOMETRY",
            _ => "NULL",
        };
        ColumnInfo {
            name: field.name.clone(),
            type_name,
            nullable: field.flags & column_flag::NOT_NULL == 0,
            length,
            decimal_size,
        }
    }
}
