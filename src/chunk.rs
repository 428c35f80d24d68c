//! Contains a [Chunk] of bytecode, annotated with source line numbers and backed by a constant
//! pool.

use crate::value::Value;
use crate::with_try_from_u8;

with_try_from_u8! {
    /// A one-byte operation code for Lox bytecode.
    #[repr(u8)]
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub enum OpCode {
        Constant,
        Nil,
        True,
        False,
        Pop,
        GetLocal,
        SetLocal,
        GetGlobal,
        DefineGlobal,
        SetGlobal,
        GetUpvalue,
        SetUpvalue,
        Equal,
        Greater,
        Less,
        Add,
        Subtract,
        Multiply,
        Divide,
        Not,
        Negate,
        Print,
        Jump,
        JumpIfFalse,
        Loop,
        Call,
        Closure,
        CloseUpvalue,
        Return,
    }
}

// `Chunk::write_opcode` pushes `opcode as u8` directly onto the byte stream, relying on `OpCode`
// staying a single-byte, fieldless `#[repr(u8)]` enum. Pin that here so a future variant gaining a
// payload (which would silently break the one-byte-per-instruction wire format) fails to compile.
static_assertions::const_assert_eq!(std::mem::size_of::<OpCode>(), 1);

/// A chunk of bytecode, with metadata.
///
/// Invariant: `code.len() == lines.len()` — every emitted byte, including operand bytes, has its
/// own line-number entry. (The book's C implementation run-length-encodes this table for
/// compactness; this crate keeps the literal parallel array the spec's invariant describes. See
/// DESIGN.md.)
#[derive(Default, Debug)]
pub struct Chunk {
    code: Vec<u8>,
    lines: Vec<usize>,
    pub constants: Vec<Value>,
}

/// A valid byte from a chunk. This byte can then be interpreted as required.
#[derive(Clone, Copy)]
pub struct BytecodeEntry<'a> {
    byte: u8,
    provenance: &'a Chunk,
}

/// An [OpCode] that has already been written to the bytestream.
///
/// This opcode can be augmented with one or more operand bytes.
pub struct WrittenOpcode<'a> {
    line: usize,
    provenance: &'a mut Chunk,
}

/// A forward-patchable jump target: the offset of a two-byte `0xFF 0xFF` placeholder emitted by
/// [WrittenOpcode::with_jump_placeholder] for `JUMP`/`JUMP_IF_FALSE`. Call [Label::patch] once the
/// jump target is known.
#[derive(Debug, Clone, Copy)]
pub struct Label {
    offset: usize,
}

impl Chunk {
    /// Return a new, empty [Chunk].
    pub fn new() -> Self {
        Chunk::default()
    }

    /// Get an entry from the bytecode stream.
    ///
    /// Returns `Some(entry)` when the offset is in `[0, self.len())`.
    pub fn get(&self, offset: usize) -> Option<BytecodeEntry<'_>> {
        self.code.get(offset).copied().map(|byte| BytecodeEntry {
            byte,
            provenance: self,
        })
    }

    /// Returns the raw bytecode, for tests that want to assert on exact byte sequences.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Append a single [OpCode] to the chunk.
    pub fn write_opcode(&mut self, opcode: OpCode, line: usize) -> WrittenOpcode<'_> {
        self.write(opcode as u8, line);

        WrittenOpcode {
            line,
            provenance: self,
        }
    }

    /// Appends a raw byte (an operand, not an opcode) to the chunk.
    pub fn write_byte(&mut self, byte: u8, line: usize) {
        self.write(byte, line);
    }

    /// Adds a constant to the constant pool, and returns its index.
    ///
    /// Returns `None` when adding the 257th constant or greater: only 256 indices (0-255) are
    /// representable as a `u8`. The caller (the compiler) is responsible for reporting
    /// `"Too many constants in one chunk."` and substituting a safe placeholder index.
    pub fn add_constant(&mut self, value: Value) -> Option<u8> {
        self.constants.push(value);
        u8::try_from(self.constants.len() - 1).ok()
    }

    /// Returns the line number recorded for the given offset.
    pub fn line_number_for(&self, offset: usize) -> Option<usize> {
        self.lines.get(offset).copied()
    }

    /// Returns the length of the byte stream.
    #[inline]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Returns true if nothing has been appended to the byte stream.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Actually writes to the byte stream, recording the line for this one byte.
    fn write(&mut self, payload: u8, line_number: usize) {
        self.code.push(payload);
        self.lines.push(line_number);
    }
}

impl<'a> BytecodeEntry<'a> {
    /// Returns the byte as an index into the constant pool.
    #[inline(always)]
    pub fn as_constant_index(self) -> usize {
        self.byte as usize
    }

    /// Returns the byte decoded as an [OpCode].
    /// Returns `None` if the byte is not a valid opcode.
    #[inline]
    pub fn as_opcode(self) -> Option<OpCode> {
        self.byte.try_into().ok()
    }

    /// Returns the raw byte.
    #[inline(always)]
    pub fn as_byte(self) -> u8 {
        self.byte
    }

    /// Yanks out a constant from the constant pool.
    #[inline]
    pub fn resolve_constant(self) -> Option<&'a Value> {
        self.provenance.constants.get(self.as_constant_index())
    }
}

impl<'a> WrittenOpcode<'a> {
    /// Consumes `self` and appends one operand byte to the byte stream for the last written
    /// instruction.
    #[inline]
    pub fn with_operand(self, index: u8) -> Self {
        self.provenance.write(index, self.line);
        self
    }

    /// Appends a big-endian 16-bit placeholder (`0xFF 0xFF`) and returns a [Label] over its
    /// offset, to be patched once the jump target is known.
    #[inline]
    pub fn with_jump_placeholder(self) -> Label {
        let offset = self.provenance.len();
        self.provenance.write(0xff, self.line);
        self.provenance.write(0xff, self.line);
        Label { offset }
    }

    /// Appends a big-endian 16-bit backward jump distance. Returns `Err` (with the compiler's
    /// `"Loop body too large."` message) if the distance overflows a `u16`.
    #[inline]
    pub fn with_loop_distance(self, loop_start: usize) -> Result<(), &'static str> {
        let distance = self.provenance.len() - loop_start + 2;
        let distance = u16::try_from(distance).map_err(|_| "Loop body too large.")?;
        let [hi, lo] = distance.to_be_bytes();
        self.provenance.write(hi, self.line);
        self.provenance.write(lo, self.line);
        Ok(())
    }
}

impl Label {
    /// Patches this jump's placeholder bytes with the distance from just after the placeholder to
    /// the chunk's current end. Returns `Err` (with the compiler's `"Too much code to jump
    /// over."` message) if the distance overflows a `u16`.
    pub fn patch(self, chunk: &mut Chunk) -> Result<(), &'static str> {
        let jump = chunk.len() - self.offset - 2;
        let jump = u16::try_from(jump).map_err(|_| "Too much code to jump over.")?;
        let [hi, lo] = jump.to_be_bytes();
        chunk.code[self.offset] = hi;
        chunk.code[self.offset + 1] = lo;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_opcode_and_operand() {
        let mut c = Chunk::new();
        let i = c.add_constant(1.0.into()).unwrap();
        c.write_opcode(OpCode::Constant, 123).with_operand(i);
        c.write_opcode(OpCode::Return, 123);

        assert_eq!(3, c.len());
        assert_eq!(Some(OpCode::Constant), c.get(0).unwrap().as_opcode());
        assert_eq!(Some(0), c.get(1).map(|b| b.as_constant_index()));
        assert_eq!(Some(&Value::Number(1.0)), c.get(1).and_then(|b| b.resolve_constant()));
        assert_eq!(Some(OpCode::Return), c.get(2).unwrap().as_opcode());
    }

    #[test]
    fn lines_are_parallel_to_code() {
        let mut c = Chunk::new();
        let idx = c.add_constant(1.2.into()).unwrap();

        c.write_opcode(OpCode::Constant, 1).with_operand(idx);
        c.write_opcode(OpCode::Constant, 2).with_operand(idx);
        c.write_opcode(OpCode::Return, 4);

        assert_eq!(c.len(), 5);
        assert_eq!(c.code().len(), c.len());
        assert_eq!(Some(1), c.line_number_for(0));
        assert_eq!(Some(1), c.line_number_for(1));
        assert_eq!(Some(2), c.line_number_for(2));
        assert_eq!(Some(2), c.line_number_for(3));
        assert_eq!(Some(4), c.line_number_for(4));
    }

    #[test]
    fn jump_label_patches_forward_distance() {
        let mut c = Chunk::new();
        let label = c.write_opcode(OpCode::JumpIfFalse, 1).with_jump_placeholder();
        c.write_opcode(OpCode::Pop, 1);
        c.write_opcode(OpCode::Pop, 1);
        label.patch(&mut c).unwrap();

        assert_eq!(0, c.get(1).unwrap().as_byte());
        assert_eq!(2, c.get(2).unwrap().as_byte());
    }

    #[test]
    fn loop_distance_points_backward() {
        let mut c = Chunk::new();
        let loop_start = c.len();
        c.write_opcode(OpCode::Pop, 1);
        c.write_opcode(OpCode::Loop, 1)
            .with_loop_distance(loop_start)
            .unwrap();

        assert_eq!(OpCode::Loop, c.get(1).unwrap().as_opcode().unwrap());
    }
}
