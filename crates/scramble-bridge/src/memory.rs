//! Typed access to the module's linear memory.

use std::ops::Range;

use rand::rngs::OsRng;
use rand::RngCore;
use wasmtime::{AsContext, AsContextMut, Memory};

use crate::error::{BridgeError, Result};

/// Accessor over a module's linear memory.
///
/// Holds only the memory handle. The backing buffer is resolved from the
/// store on every operation, so accesses stay valid across growth (growth
/// may relocate the buffer, invalidating anything cached earlier).
///
/// Multi-byte integers use little-endian byte order, matching the module
/// ABI.
#[derive(Debug, Clone, Copy)]
pub struct MemoryView {
    memory: Memory,
}

impl MemoryView {
    /// Wrap an instance's exported memory.
    pub fn new(memory: Memory) -> Self {
        Self { memory }
    }

    /// Current memory size in bytes.
    pub fn size(&self, ctx: impl AsContext) -> u64 {
        self.memory.data_size(&ctx) as u64
    }

    /// Read `len` bytes starting at `offset`.
    pub fn read_bytes(&self, ctx: impl AsContext, offset: u32, len: u32) -> Result<Vec<u8>> {
        let data = self.memory.data(&ctx);
        let span = Self::span(data.len(), offset, len)?;
        Ok(data[span].to_vec())
    }

    /// Read a little-endian u32 at `offset`.
    pub fn read_u32(&self, ctx: impl AsContext, offset: u32) -> Result<u32> {
        let bytes = self.read_bytes(ctx, offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a NUL-terminated string starting at `offset`.
    ///
    /// Scans forward until a zero byte and decodes the bytes before it as
    /// UTF-8, replacing invalid sequences. Fails with `OutOfBounds` when no
    /// terminator exists before the end of memory.
    pub fn read_c_string(&self, ctx: impl AsContext, offset: u32) -> Result<String> {
        let data = self.memory.data(&ctx);
        let start = offset as usize;
        if start as u64 > data.len() as u64 {
            return Err(BridgeError::OutOfBounds {
                offset: offset as u64,
                len: 1,
                size: data.len() as u64,
            });
        }
        match data[start..].iter().position(|&b| b == 0) {
            Some(nul) => Ok(String::from_utf8_lossy(&data[start..start + nul]).into_owned()),
            None => Err(BridgeError::OutOfBounds {
                offset: offset as u64,
                len: (data.len() - start) as u64 + 1,
                size: data.len() as u64,
            }),
        }
    }

    /// Write `data` at `offset`.
    pub fn write_bytes(&self, mut ctx: impl AsContextMut, offset: u32, data: &[u8]) -> Result<()> {
        let mem = self.memory.data_mut(&mut ctx);
        let span = Self::span(mem.len(), offset, data.len() as u32)?;
        mem[span].copy_from_slice(data);
        Ok(())
    }

    /// Write a little-endian u32 at `offset`.
    pub fn write_u32(&self, ctx: impl AsContextMut, offset: u32, value: u32) -> Result<()> {
        self.write_bytes(ctx, offset, &value.to_le_bytes())
    }

    /// Write a little-endian u64 at `offset`.
    pub fn write_u64(&self, ctx: impl AsContextMut, offset: u32, value: u64) -> Result<()> {
        self.write_bytes(ctx, offset, &value.to_le_bytes())
    }

    /// Fill `len` bytes at `offset` from the host's cryptographic random
    /// source. A source failure is fatal to the instance; there is no
    /// degraded fallback for randomness.
    pub fn fill_random(&self, mut ctx: impl AsContextMut, offset: u32, len: u32) -> Result<()> {
        let mem = self.memory.data_mut(&mut ctx);
        let span = Self::span(mem.len(), offset, len)?;
        OsRng
            .try_fill_bytes(&mut mem[span])
            .map_err(|e| BridgeError::RandomSource(e.to_string()))
    }

    fn span(mem_size: usize, offset: u32, len: u32) -> Result<Range<usize>> {
        let end = offset as u64 + len as u64;
        if end > mem_size as u64 {
            return Err(BridgeError::OutOfBounds {
                offset: offset as u64,
                len: len as u64,
                size: mem_size as u64,
            });
        }
        Ok(offset as usize..end as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::{Engine, MemoryType, Store};

    const PAGE: u32 = 65536;

    fn fresh_memory() -> (Store<()>, MemoryView) {
        let engine = Engine::default();
        let mut store = Store::new(&engine, ());
        let memory = Memory::new(&mut store, MemoryType::new(1, None)).expect("create memory");
        (store, MemoryView::new(memory))
    }

    #[test]
    fn write_read_round_trip() {
        let (mut store, view) = fresh_memory();
        let data = b"neither a borrower nor a lender be";
        view.write_bytes(&mut store, 1234, data).expect("write");
        let back = view
            .read_bytes(&store, 1234, data.len() as u32)
            .expect("read");
        assert_eq!(back, data);
    }

    #[test]
    fn integers_are_little_endian() {
        let (mut store, view) = fresh_memory();
        view.write_u32(&mut store, 0, 0x0102_0304).expect("write u32");
        assert_eq!(
            view.read_bytes(&store, 0, 4).expect("read"),
            vec![0x04, 0x03, 0x02, 0x01]
        );
        assert_eq!(view.read_u32(&store, 0).expect("read u32"), 0x0102_0304);

        view.write_u64(&mut store, 8, 0x0102_0304_0506_0708)
            .expect("write u64");
        assert_eq!(
            view.read_bytes(&store, 8, 8).expect("read"),
            vec![0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn read_past_end_is_out_of_bounds() {
        let (store, view) = fresh_memory();
        let err = view.read_bytes(&store, PAGE - 2, 4).unwrap_err();
        match err {
            BridgeError::OutOfBounds { offset, len, size } => {
                assert_eq!(offset, (PAGE - 2) as u64);
                assert_eq!(len, 4);
                assert_eq!(size, PAGE as u64);
            }
            other => panic!("expected OutOfBounds, got {other:?}"),
        }
    }

    #[test]
    fn write_past_end_is_out_of_bounds() {
        let (mut store, view) = fresh_memory();
        let err = view.write_bytes(&mut store, PAGE - 1, &[1, 2]).unwrap_err();
        assert!(matches!(err, BridgeError::OutOfBounds { .. }));
    }

    #[test]
    fn c_string_stops_at_nul() {
        let (mut store, view) = fresh_memory();
        view.write_bytes(&mut store, 100, b"hello\0world\0")
            .expect("write");
        assert_eq!(view.read_c_string(&store, 100).expect("read"), "hello");
        assert_eq!(view.read_c_string(&store, 106).expect("read"), "world");
    }

    #[test]
    fn c_string_at_nul_is_empty() {
        let (store, view) = fresh_memory();
        // fresh memory is zeroed
        assert_eq!(view.read_c_string(&store, 0).expect("read"), "");
    }

    #[test]
    fn c_string_without_terminator_is_out_of_bounds() {
        let (mut store, view) = fresh_memory();
        view.write_bytes(&mut store, PAGE - 8, &[0x41; 8]).expect("write");
        let err = view.read_c_string(&store, PAGE - 8).unwrap_err();
        assert!(matches!(err, BridgeError::OutOfBounds { .. }));
    }

    #[test]
    fn utf8_survives_round_trip() {
        let (mut store, view) = fresh_memory();
        let text = "变量名混淆 done\0";
        view.write_bytes(&mut store, 0, text.as_bytes()).expect("write");
        assert_eq!(
            view.read_c_string(&store, 0).expect("read"),
            text.trim_end_matches('\0')
        );
    }

    #[test]
    fn fill_random_writes_something() {
        let (mut store, view) = fresh_memory();
        view.fill_random(&mut store, 64, 32).expect("fill");
        let bytes = view.read_bytes(&store, 64, 32).expect("read");
        assert_ne!(bytes, vec![0u8; 32]);
    }

    #[test]
    fn fill_random_respects_bounds() {
        let (mut store, view) = fresh_memory();
        let err = view.fill_random(&mut store, PAGE - 4, 8).unwrap_err();
        assert!(matches!(err, BridgeError::OutOfBounds { .. }));
    }

    #[test]
    fn access_is_valid_after_growth() {
        let (mut store, view) = fresh_memory();
        assert!(view.write_bytes(&mut store, PAGE + 16, &[7; 4]).is_err());

        view.memory.grow(&mut store, 1).expect("grow");
        assert_eq!(view.size(&store), (PAGE as u64) * 2);
        view.write_bytes(&mut store, PAGE + 16, &[7; 4]).expect("write");
        assert_eq!(view.read_bytes(&store, PAGE + 16, 4).expect("read"), vec![7; 4]);
    }
}
