//! Minimal reader for the flatbuffer-style tables inside a modern manifest
//! body: a root offset, vtable-indexed tables, and vectors of scalars or
//! tables. Absent fields resolve to defaults (zero scalars, empty strings
//! and vectors), matching how the format evolves by appending fields.

use crate::common::QuarryResult;
use crate::ensure;

fn read_u16(data: &[u8], pos: usize) -> QuarryResult<u16> {
    ensure!(pos + 2 <= data.len(), "table read past end at {}", pos);
    Ok(u16::from_le_bytes([data[pos], data[pos + 1]]))
}

fn read_u32(data: &[u8], pos: usize) -> QuarryResult<u32> {
    ensure!(pos + 4 <= data.len(), "table read past end at {}", pos);
    Ok(u32::from_le_bytes([
        data[pos],
        data[pos + 1],
        data[pos + 2],
        data[pos + 3],
    ]))
}

fn read_u64(data: &[u8], pos: usize) -> QuarryResult<u64> {
    ensure!(pos + 8 <= data.len(), "table read past end at {}", pos);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[pos..pos + 8]);
    Ok(u64::from_le_bytes(bytes))
}

/// One table inside the buffer, resolved through its vtable.
#[derive(Clone, Copy)]
pub struct Table<'a> {
    data: &'a [u8],
    pos: usize,
    vtable: usize,
    vtable_size: u16,
}

impl<'a> Table<'a> {
    /// Resolves the root table referenced by the leading u32.
    pub fn root(data: &'a [u8]) -> QuarryResult<Table<'a>> {
        let offset = read_u32(data, 0)? as usize;
        Table::at(data, offset)
    }

    fn at(data: &'a [u8], pos: usize) -> QuarryResult<Table<'a>> {
        ensure!(pos + 4 <= data.len(), "table position {} out of range", pos);
        let soffset = read_u32(data, pos)? as i32;
        let vtable = pos as i64 - soffset as i64;
        ensure!(
            vtable >= 0 && (vtable as usize) + 4 <= data.len(),
            "vtable of table at {} out of range",
            pos
        );
        let vtable = vtable as usize;
        let vtable_size = read_u16(data, vtable)?;
        ensure!(
            vtable_size >= 4 && vtable + vtable_size as usize <= data.len(),
            "vtable at {} truncated",
            vtable
        );
        Ok(Table {
            data,
            pos,
            vtable,
            vtable_size,
        })
    }

    fn field_pos(&self, index: usize) -> QuarryResult<Option<usize>> {
        let slot = self.vtable + 4 + index * 2;
        if slot + 2 > self.vtable + self.vtable_size as usize {
            return Ok(None);
        }
        let offset = read_u16(self.data, slot)?;
        if offset == 0 {
            return Ok(None);
        }
        Ok(Some(self.pos + offset as usize))
    }

    fn offset_target(&self, index: usize) -> QuarryResult<Option<usize>> {
        match self.field_pos(index)? {
            None => Ok(None),
            Some(pos) => {
                let relative = read_u32(self.data, pos)?;
                Ok(Some(pos + relative as usize))
            }
        }
    }

    pub fn u8_field(&self, index: usize) -> QuarryResult<u8> {
        match self.field_pos(index)? {
            None => Ok(0),
            Some(pos) => {
                ensure!(pos < self.data.len(), "scalar field read past end");
                Ok(self.data[pos])
            }
        }
    }

    pub fn u32_field(&self, index: usize) -> QuarryResult<u32> {
        match self.field_pos(index)? {
            None => Ok(0),
            Some(pos) => read_u32(self.data, pos),
        }
    }

    pub fn u64_field(&self, index: usize) -> QuarryResult<u64> {
        match self.field_pos(index)? {
            None => Ok(0),
            Some(pos) => read_u64(self.data, pos),
        }
    }

    pub fn string_field(&self, index: usize) -> QuarryResult<String> {
        match self.offset_target(index)? {
            None => Ok(String::new()),
            Some(target) => {
                let length = read_u32(self.data, target)? as usize;
                let start = target + 4;
                ensure!(
                    start + length <= self.data.len(),
                    "string field of {} bytes truncated",
                    length
                );
                String::from_utf8(self.data[start..start + length].to_vec())
                    .map_err(|e| format!("string field is not UTF-8: {:?}", e).into())
            }
        }
    }

    pub fn table_vector(&self, index: usize) -> QuarryResult<Vec<Table<'a>>> {
        match self.offset_target(index)? {
            None => Ok(Vec::new()),
            Some(target) => {
                let count = read_u32(self.data, target)? as usize;
                let mut result = Vec::with_capacity(count);
                for element in 0..count {
                    let slot = target + 4 + element * 4;
                    let relative = read_u32(self.data, slot)?;
                    result.push(Table::at(self.data, slot + relative as usize)?);
                }
                Ok(result)
            }
        }
    }

    pub fn u64_vector(&self, index: usize) -> QuarryResult<Vec<u64>> {
        match self.offset_target(index)? {
            None => Ok(Vec::new()),
            Some(target) => {
                let count = read_u32(self.data, target)? as usize;
                let mut result = Vec::with_capacity(count);
                for element in 0..count {
                    result.push(read_u64(self.data, target + 4 + element * 8)?);
                }
                Ok(result)
            }
        }
    }
}
