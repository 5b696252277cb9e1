use bytes::{Buf, BufMut, Bytes};

use crate::{common::ByteStr, postgres::ProtocolError};

/// Integer signess in postgres docs is awful.
pub trait UsizeExt {
    /// Length is `usize` in rust, while sometime postgres want `u32`,
    /// this will panic when overflow instead of wrapping.
    fn to_u32(self) -> u32;
    /// Length is `usize` in rust, while sometime postgres want `u16`,
    /// this will panic when overflow instead of wrapping.
    fn to_u16(self) -> u16;
}

/// Nul string operation.
pub trait StrExt {
    /// String length plus nul (1).
    fn nul_string_len(&self) -> u32;
}

/// Nul string operation in [`BufMut`]
pub trait BufMutExt {
    /// Write string and nul termination.
    fn put_nul_string(&mut self, string: &str);
}

/// Checked reads on a received message body.
///
/// Message bodies come from the network, a short body is a [`ProtocolError`]
/// instead of a panic.
pub trait BytesExt {
    /// Try to read nul terminated string.
    ///
    /// Using [`ByteStr`] avoid allocating [`Vec`] as it required for [`String::from_utf8`]
    fn get_nul_bytestr(&mut self) -> Result<ByteStr, ProtocolError>;

    fn try_u8(&mut self) -> Result<u8, ProtocolError>;

    fn try_i16(&mut self) -> Result<i16, ProtocolError>;

    fn try_i32(&mut self) -> Result<i32, ProtocolError>;

    fn try_i64(&mut self) -> Result<i64, ProtocolError>;

    /// Split `len` bytes off the front.
    fn try_split_to(&mut self, len: usize) -> Result<Bytes, ProtocolError>;
}

impl UsizeExt for usize {
    fn to_u32(self) -> u32 {
        self.try_into().expect("message size too large for protocol")
    }

    fn to_u16(self) -> u16 {
        self.try_into().expect("message size too large for protocol")
    }
}

impl StrExt for str {
    fn nul_string_len(&self) -> u32 {
        self.len().to_u32() + 1/* nul */
    }
}

impl<B: BufMut> BufMutExt for B {
    fn put_nul_string(&mut self, string: &str) {
        self.put(string.as_bytes());
        self.put_u8(b'\0');
    }
}

macro_rules! try_get {
    ($me:ident, $get:ident, $ty:ty) => {{
        if $me.remaining() < size_of::<$ty>() {
            return Err(ProtocolError::malformed("message body too short"));
        }
        Ok($me.$get())
    }};
}

impl BytesExt for Bytes {
    fn get_nul_bytestr(&mut self) -> Result<ByteStr, ProtocolError> {
        let Some(end) = self.iter().position(|e| matches!(e, b'\0')) else {
            return Err(ProtocolError::malformed("string is not nul terminated"));
        };
        let me = self.split_to(end);
        Buf::advance(self, 1); // nul
        ByteStr::from_utf8(me).map_err(|_| ProtocolError::malformed("string is not utf8"))
    }

    fn try_u8(&mut self) -> Result<u8, ProtocolError> {
        try_get!(self, get_u8, u8)
    }

    fn try_i16(&mut self) -> Result<i16, ProtocolError> {
        try_get!(self, get_i16, i16)
    }

    fn try_i32(&mut self) -> Result<i32, ProtocolError> {
        try_get!(self, get_i32, i32)
    }

    fn try_i64(&mut self) -> Result<i64, ProtocolError> {
        try_get!(self, get_i64, i64)
    }

    fn try_split_to(&mut self, len: usize) -> Result<Bytes, ProtocolError> {
        if self.len() < len {
            return Err(ProtocolError::malformed("message body too short"));
        }
        Ok(self.split_to(len))
    }
}
