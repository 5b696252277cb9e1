//! Prepared statement and column descriptors.
use bytes::Bytes;
use std::sync::Arc;

use crate::{
    common::ByteStr,
    ext::BytesExt,
    postgres::{Oid, PgFormat, ProtocolError, backend::RowDescription},
};

/// Statement name for a session counter value, `s00001`, `s00002` and so on.
pub(crate) fn statement_name(id: u32) -> ByteStr {
    const WIDTH: usize = 5;

    let mut b = itoa::Buffer::new();
    let id = b.format(id);
    let mut name = String::with_capacity(1 + WIDTH.max(id.len()));
    name.push('s');
    name.extend(std::iter::repeat_n('0', WIDTH.saturating_sub(id.len())));
    name.push_str(id);
    ByteStr::from(name)
}

/// Server side prepared statement.
///
/// An empty name is the unnamed statement, which is replaced by the next unnamed Parse.
/// The statement is invalid once closed or once its connection is closed.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub(crate) name: ByteStr,
    pub(crate) param_types: Arc<[Oid]>,
    pub(crate) columns: Arc<[Column]>,
}

impl Statement {
    pub(crate) fn new(name: ByteStr, param_types: Vec<Oid>, columns: Vec<Column>) -> Statement {
        Statement {
            name,
            param_types: param_types.into(),
            columns: columns.into(),
        }
    }

    /// Statement name, empty for the unnamed statement.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_unnamed(&self) -> bool {
        self.name.is_empty()
    }

    /// Parameter types resolved by the server.
    pub fn param_types(&self) -> &[Oid] {
        &self.param_types
    }

    /// Result columns, empty for statements that return no rows.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }
}

/// Result column descriptor.
///
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html#PROTOCOL-MESSAGE-FORMATS-ROWDESCRIPTION>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    name: ByteStr,
    table_oid: Oid,
    column_id: i16,
    type_oid: Oid,
    type_size: i16,
    type_modifier: i32,
    format: PgFormat,
}

impl Column {
    /// Decode every field of `RowDescription`.
    pub(crate) fn decode_all(desc: RowDescription) -> Result<Vec<Column>, ProtocolError> {
        let RowDescription { field_len, mut body } = desc;
        let mut columns = Vec::with_capacity(field_len as usize);
        for _ in 0..field_len {
            columns.push(Column::decode(&mut body)?);
        }
        Ok(columns)
    }

    fn decode(body: &mut Bytes) -> Result<Column, ProtocolError> {
        Ok(Column {
            name: body.get_nul_bytestr()?,
            table_oid: body.try_i32()? as Oid,
            column_id: body.try_i16()?,
            type_oid: body.try_i32()? as Oid,
            type_size: body.try_i16()?,
            type_modifier: body.try_i32()?,
            format: PgFormat::from_code(body.try_i16()?),
        })
    }

    /// Column descriptor, mostly used to fabricate server responses in tests.
    pub fn new(name: impl Into<ByteStr>, type_oid: Oid) -> Column {
        Column {
            name: name.into(),
            table_oid: 0,
            column_id: 0,
            type_oid,
            type_size: -1,
            type_modifier: -1,
            format: PgFormat::Text,
        }
    }

    /// Same column with another transfer format.
    pub(crate) fn with_format(&self, format: PgFormat) -> Column {
        Column { format, ..self.clone() }
    }

    /// Returns column name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// If the field can be identified as a column of a specific table, the object ID of the table;
    /// otherwise zero.
    pub fn table_oid(&self) -> Oid {
        self.table_oid
    }

    /// If the field can be identified as a column of a specific table, the attribute number of the column;
    /// otherwise zero.
    pub fn column_id(&self) -> i16 {
        self.column_id
    }

    /// Returns column type [`Oid`].
    pub fn type_oid(&self) -> Oid {
        self.type_oid
    }

    /// The data type size (see `pg_type.typlen`). Note that negative values denote variable-width types.
    pub fn type_size(&self) -> i16 {
        self.type_size
    }

    /// The type modifier (see `pg_attribute.atttypmod`). The meaning of the modifier is type-specific.
    pub fn type_modifier(&self) -> i32 {
        self.type_modifier
    }

    /// Transfer format of the values, as described by the server.
    ///
    /// Statement descriptions always report text, the format actually used is chosen at Bind.
    pub fn format(&self) -> PgFormat {
        self.format
    }
}
