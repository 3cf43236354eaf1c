//! Binary chunk reader (spec §4.2): decodes the canonical Lua 5.3
//! precompiled-chunk format into [`Prototype`] trees.
//!
//! Grounded on `original_source/src/luago/binary/reader.go` for field order
//! and the string length-byte convention, and on the teacher's
//! `lua_value::chunk_serializer` for the overall "hand-rolled cursor over
//! a byte slice, no external binary-parsing crate" style (the teacher does
//! not pull in `byteorder`, so this reader doesn't either — every
//! multi-byte field is assembled with `from_le_bytes`/native reads
//! explicitly, matching spec §4.2's "all integers are little-endian").

use crate::error::{ErrorKind, LuaError, LuaResult};
use crate::opcode::Instruction;
use crate::value::{LocalVarInfo, Prototype, UpvalDesc};
use std::rc::Rc;

const SIGNATURE: &[u8; 4] = b"\x1bLua";
const LUAC_VERSION: u8 = 0x53;
const LUAC_FORMAT: u8 = 0;
const LUAC_DATA: &[u8; 6] = &[0x19, 0x93, 0x0d, 0x0a, 0x1a, 0x0a];
const TEST_INT: i64 = 0x5678;
const TEST_NUMBER: f64 = 370.5;

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

fn malformed(msg: impl Into<String>) -> LuaError {
    LuaError::new(ErrorKind::MalformedChunk, msg.into())
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> LuaResult<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(malformed("unexpected end of chunk"));
        }
        let data: &'a [u8] = self.data;
        let slice = &data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> LuaResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> LuaResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> LuaResult<i64> {
        let b = self.bytes(8)?;
        Ok(i64::from_le_bytes(b.try_into().unwrap()))
    }

    fn f64(&mut self) -> LuaResult<f64> {
        let b = self.bytes(8)?;
        Ok(f64::from_le_bytes(b.try_into().unwrap()))
    }

    fn check<T: std::fmt::Debug>(
        &self,
        got: impl PartialEq<T> + std::fmt::Debug,
        want: T,
        what: &str,
    ) -> LuaResult<()> {
        if got != want {
            return Err(malformed(format!(
                "invalid {what}: expected {want:?}, got {got:?}"
            )));
        }
        Ok(())
    }

    /// A length-prefixed string (spec §4.2 "String encoding"): one length
    /// byte; `0x00` is empty; `0xFF` means an 8-byte length follows;
    /// otherwise the byte `N` itself gives `N-1` payload bytes.
    fn lua_string(&mut self) -> LuaResult<Vec<u8>> {
        let first = self.u8()?;
        let len = if first == 0 {
            return Ok(Vec::new());
        } else if first == 0xFF {
            let b = self.bytes(8)?;
            u64::from_le_bytes(b.try_into().unwrap()) as usize - 1
        } else {
            first as usize - 1
        };
        Ok(self.bytes(len)?.to_vec())
    }

    fn lua_source_string(&mut self) -> LuaResult<String> {
        let bytes = self.lua_string()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn vec_u32_prefixed<T>(&mut self, mut f: impl FnMut(&mut Self) -> LuaResult<T>) -> LuaResult<Vec<T>> {
        let len = self.u32()? as usize;
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(f(self)?);
        }
        Ok(out)
    }

    fn header(&mut self) -> LuaResult<()> {
        let sig = self.bytes(4)?;
        self.check(sig, &SIGNATURE[..], "signature")?;
        self.check(self.u8()?, LUAC_VERSION, "version")?;
        self.check(self.u8()?, LUAC_FORMAT, "format")?;
        let data = self.bytes(6)?;
        self.check(data, &LUAC_DATA[..], "data-check sequence")?;
        self.check(self.u8()?, 4, "sizeof(int)")?;
        self.check(self.u8()?, 8, "sizeof(size_t)")?;
        self.check(self.u8()?, 4, "sizeof(Instruction)")?;
        self.check(self.u8()?, 8, "sizeof(lua_Integer)")?;
        self.check(self.u8()?, 8, "sizeof(lua_Number)")?;
        self.check(self.i64()?, TEST_INT, "test integer")?;
        self.check(self.f64()?, TEST_NUMBER, "test float")?;
        Ok(())
    }

    fn constant(&mut self) -> LuaResult<crate::value::LuaValue> {
        use crate::value::LuaValue;
        let tag = self.u8()?;
        Ok(match tag {
            0x00 => LuaValue::Nil,
            0x01 => LuaValue::Bool(self.u8()? != 0),
            0x03 => LuaValue::Float(self.f64()?),
            0x13 => LuaValue::Int(self.i64()?),
            0x04 | 0x14 => LuaValue::from_bytes(Rc::from(self.lua_string()?.into_boxed_slice())),
            other => return Err(malformed(format!("unknown constant tag 0x{other:02x}"))),
        })
    }

    fn upvalue_desc(&mut self) -> LuaResult<UpvalDesc> {
        let in_stack = self.u8()? != 0;
        let index = self.u8()?;
        Ok(UpvalDesc { in_stack, index })
    }

    fn local_var(&mut self) -> LuaResult<LocalVarInfo> {
        let name = self.lua_source_string()?;
        let start_pc = self.u32()?;
        let end_pc = self.u32()?;
        Ok(LocalVarInfo { name, start_pc, end_pc })
    }

    fn prototype(&mut self, parent_source: &str) -> LuaResult<Prototype> {
        let mut source = self.lua_source_string()?;
        if source.is_empty() {
            source = parent_source.to_string();
        }
        let line_defined = self.u32()?;
        let last_line_defined = self.u32()?;
        let num_params = self.u8()?;
        let is_vararg = self.u8()? != 0;
        let max_stack_size = self.u8()?;

        let code = self.vec_u32_prefixed(|r| Ok(Instruction(r.u32()?)))?;
        let constants = self.vec_u32_prefixed(|r| r.constant())?;
        let upvalues = self.vec_u32_prefixed(|r| r.upvalue_desc())?;
        let source_for_children = source.clone();
        let protos = self
            .vec_u32_prefixed(|r| r.prototype(&source_for_children).map(Rc::new))?;
        let line_info = self.vec_u32_prefixed(|r| r.u32())?;
        let local_vars = self.vec_u32_prefixed(|r| r.local_var())?;
        let upvalue_names = self.vec_u32_prefixed(|r| r.lua_source_string())?;

        Ok(Prototype {
            source,
            line_defined,
            last_line_defined,
            num_params,
            is_vararg,
            max_stack_size,
            code,
            constants,
            upvalues,
            protos,
            line_info,
            local_vars,
            upvalue_names,
        })
    }
}

/// Decodes a complete binary chunk (header + top-level prototype) per spec
/// §4.2.
pub fn read_chunk(data: &[u8]) -> LuaResult<Prototype> {
    let mut r = Reader::new(data);
    r.header()?;
    r.u8()?; // unused upvalue-count byte preceding the top-level prototype
    r.prototype("")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_header() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(SIGNATURE);
        buf.push(LUAC_VERSION);
        buf.push(LUAC_FORMAT);
        buf.extend_from_slice(LUAC_DATA);
        buf.extend_from_slice(&[4, 8, 4, 8, 8]);
        buf.extend_from_slice(&TEST_INT.to_le_bytes());
        buf.extend_from_slice(&TEST_NUMBER.to_le_bytes());
        buf
    }

    #[test]
    fn rejects_bad_signature() {
        let mut buf = valid_header();
        buf[0] = 0;
        let err = Reader::new(&buf).header().unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedChunk);
    }

    #[test]
    fn reads_a_minimal_empty_prototype() {
        let mut buf = valid_header();
        buf.push(0); // unused byte
        // source name: empty
        buf.push(0);
        buf.extend_from_slice(&0u32.to_le_bytes()); // line_defined
        buf.extend_from_slice(&0u32.to_le_bytes()); // last_line_defined
        buf.push(0); // num_params
        buf.push(0); // is_vararg
        buf.push(2); // max_stack_size
        buf.extend_from_slice(&1u32.to_le_bytes()); // 1 instruction
        buf.extend_from_slice(&0u32.to_le_bytes()); // RETURN A=0 B=1 (encoded 0 is fine for the test)
        buf.extend_from_slice(&0u32.to_le_bytes()); // 0 constants
        buf.extend_from_slice(&0u32.to_le_bytes()); // 0 upvalues
        buf.extend_from_slice(&0u32.to_le_bytes()); // 0 child protos
        buf.extend_from_slice(&0u32.to_le_bytes()); // 0 line info
        buf.extend_from_slice(&0u32.to_le_bytes()); // 0 local vars
        buf.extend_from_slice(&0u32.to_le_bytes()); // 0 upvalue names

        let proto = read_chunk(&buf).unwrap();
        assert_eq!(proto.code.len(), 1);
        assert_eq!(proto.max_stack_size, 2);
    }

    #[test]
    fn string_length_byte_escapes_to_8_byte_length() {
        let mut buf = Vec::new();
        buf.push(0xFF);
        buf.extend_from_slice(&(4u64 + 1).to_le_bytes());
        buf.extend_from_slice(b"abcd");
        let mut r = Reader::new(&buf);
        assert_eq!(r.lua_string().unwrap(), b"abcd");
    }
}
