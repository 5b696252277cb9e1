
/// Postgres object identifier.
///
/// The oid type is implemented as an unsigned four-byte integer.
///
/// <https://www.postgresql.org/docs/current/datatype-oid.html>
pub type Oid = u32;

/// Well known type oids.
///
/// These are fixed in `pg_type.dat` and identical across servers. Types installed by
/// extensions (`hstore`, `citext`, ..) have per-database oids and are resolved at runtime,
/// see [`TypeRegistry`][crate::types::TypeRegistry].
pub mod oid {
    use super::Oid;

    macro_rules! oid {
        ($($name:ident = $oid:literal, $doc:literal;)*) => {
            $(
                #[doc = $doc]
                pub const $name: Oid = $oid;
            )*
        };
    }

    oid! {
        UNSPECIFIED = 0, "type left for the server to infer";
        BOOL = 16, "`bool` boolean, 'true'/'false'";
        BYTEA = 17, "`bytea` variable-length string, binary values escaped";
        CHAR = 18, "`char` single character";
        NAME = 19, "`name` 63-byte type for storing system identifiers";
        INT8 = 20, "`int8` ~18 digit integer, 8-byte storage";
        INT2 = 21, "`int2` -32 thousand to 32 thousand, 2-byte storage";
        INT4 = 23, "`int4` -2 billion to 2 billion integer, 4-byte storage";
        TEXT = 25, "`text` variable-length string, no limit specified";
        OID = 26, "`oid` object identifier(oid), maximum 4 billion";
        JSON = 114, "`json` JSON stored as text";
        FLOAT4 = 700, "`float4` single-precision floating point number, 4-byte storage";
        FLOAT8 = 701, "`float8` double-precision floating point number, 8-byte storage";
        UNKNOWN = 705, "`unknown` pseudo-type representing an undetermined type";
        BPCHAR = 1042, "`bpchar` char(length), blank-padded string, fixed storage length";
        VARCHAR = 1043, "`varchar` varchar(length), non-blank-padded string, variable storage length";
        TIMESTAMP = 1114, "`timestamp` date and time";
        TIMESTAMPTZ = 1184, "`timestamptz` date and time with time zone";
        JSONB = 3802, "`jsonb` Binary JSON";
    }
}
