//! Binary format checks and incremental validation.
//!
//! `StreamingValidator` consumes the binary chunk by chunk as it arrives,
//! decoding and validating each section and function body as soon as its
//! bytes are complete. Malformed input is reported at the first offending
//! chunk instead of after the whole download. The assembled bytes are
//! handed to the engine for code generation once the stream ends.

use wasmparser::{Chunk, FuncValidatorAllocations, Parser, ValidPayload, Validator};

use crate::error::FormatError;

/// `\0asm`
pub const WASM_MAGIC: [u8; 4] = *b"\0asm";

/// Core module binary version.
pub const WASM_VERSION: u32 = 1;

/// Magic plus version.
pub const HEADER_LEN: usize = 8;

/// Check as much of the module header as `bytes` contains.
///
/// Returns `Ok(true)` once the full header has been verified, `Ok(false)`
/// if more bytes are needed, and an error as soon as a byte is wrong.
pub fn check_header_prefix(bytes: &[u8]) -> Result<bool, FormatError> {
    let magic_len = bytes.len().min(WASM_MAGIC.len());
    if bytes[..magic_len] != WASM_MAGIC[..magic_len] {
        return Err(FormatError::BadMagic(bytes[..magic_len].to_vec()));
    }
    if bytes.len() < HEADER_LEN {
        return Ok(false);
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != WASM_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }
    Ok(true)
}

/// Check the header of a complete binary.
pub fn check_header(bytes: &[u8]) -> Result<(), FormatError> {
    if check_header_prefix(bytes)? {
        Ok(())
    } else {
        Err(FormatError::Truncated(bytes.len()))
    }
}

/// Incremental decoder and validator for a module arriving in chunks.
pub struct StreamingValidator {
    buffer: Vec<u8>,
    /// Start of the bytes the parser has not consumed yet.
    offset: usize,
    parser: Parser,
    validator: Validator,
    header_ok: bool,
    finished: bool,
    functions: u32,
}

impl Default for StreamingValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingValidator {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Pre-size the buffer, typically from a `Content-Length`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            offset: 0,
            parser: Parser::new(0),
            validator: Validator::new(),
            header_ok: false,
            finished: false,
            functions: 0,
        }
    }

    /// Feed the next chunk and validate everything it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), FormatError> {
        self.buffer.extend_from_slice(chunk);
        if !self.header_ok {
            self.header_ok = check_header_prefix(&self.buffer)?;
            if !self.header_ok {
                return Ok(());
            }
        }
        self.advance(false)
    }

    /// Validate the remainder and return the complete binary.
    pub fn finish(mut self) -> Result<Vec<u8>, FormatError> {
        check_header(&self.buffer)?;
        self.advance(true)?;
        if !self.finished {
            return Err(FormatError::Truncated(self.buffer.len()));
        }
        Ok(self.buffer)
    }

    /// Function bodies validated so far.
    pub fn functions_validated(&self) -> u32 {
        self.functions
    }

    fn advance(&mut self, eof: bool) -> Result<(), FormatError> {
        while !self.finished {
            let data = &self.buffer[self.offset..];
            let (consumed, payload) = match self.parser.parse(data, eof)? {
                Chunk::NeedMoreData(_) => return Ok(()),
                Chunk::Parsed { consumed, payload } => (consumed, payload),
            };

            match self.validator.payload(&payload)? {
                ValidPayload::Func(func, body) => {
                    let mut func_validator = func.into_validator(FuncValidatorAllocations::default());
                    func_validator.validate(&body)?;
                    self.functions += 1;
                }
                ValidPayload::End(_) => self.finished = true,
                ValidPayload::Parser(_) => {
                    return Err(FormatError::Decode {
                        offset: self.offset,
                        message: "nested modules are not supported".into(),
                    });
                }
                _ => {}
            }

            self.offset += consumed;
        }
        Ok(())
    }
}
