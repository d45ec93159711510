use std::fmt::Display;

use super::value::Value;

/// A single instruction, in a parsed/type-safe format.
///
/// The compiler builds these and serializes them into a `Chunk`'s bytes; the VM decodes them back out
/// one at a time as it executes. Decoding costs a little over dispatching on raw bytes, but keeps the
/// execution loop a plain exhaustive match.
///
/// `Closure` is the one variable-length instruction: its encoded form is followed by one
/// `(is_local, index)` byte pair per upvalue of the function it refers to. Those pairs are not part of
/// the `Instruction` itself, because their count lives on the function object, not in the bytecode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Return from the current function with the top value.
    Return,
    /// Load a constant by its index into the constant table.
    Constant(u8),
    /// Negate the top value on the stack
    Negate,
    /// If stack is TOP: b, a ..., pop two and push (a+b)
    Add,
    /// If stack is TOP: b, a ..., pop two and push (a-b)
    Subtract,
    /// If stack is TOP: b, a ..., pop two and push (a*b)
    Multiply,
    /// If stack is TOP: b, a ..., pop two and push (a/b)
    Divide,
    /// Put Nil on the stack
    Nil,
    /// Put false on the stack
    False,
    /// Put true on the stack
    True,
    /// Logical negation of the top stack item
    Not,
    /// Pop two and push a bool for if they are equal or not
    Equal,
    /// If stack is TOP: b, a, ..., push the bool a>b
    Greater,
    /// If stack is TOP: b, a, ..., push the bool a<b
    Less,
    /// Discard the top value
    Pop,
    /// Pop and print the top value
    Print,
    /// Pop the top value into the global named by the constant.
    DefineGlobal(u8),
    /// Push the global named by the constant.
    GetGlobal(u8),
    /// Store the top value (without popping) into an existing global.
    SetGlobal(u8),
    /// Push a copy of the local in the given slot of the current frame.
    GetLocal(u8),
    /// Store the top value (without popping) into the given local slot.
    SetLocal(u8),
    /// Push the value of the current closure's nth upvalue.
    GetUpvalue(u8),
    /// Store the top value (without popping) through the current closure's nth upvalue.
    SetUpvalue(u8),
    /// Skip forward unconditionally.
    Jump(u16),
    /// Skip forward if the top value is falsey. Does not pop.
    JumpIfFalse(u16),
    /// Jump backward.
    Loop(u16),
    /// Call the value sitting below the given number of arguments.
    Call(u8),
    /// Wrap the function constant in a new closure. Followed by the upvalue byte pairs.
    Closure(u8),
    /// Hoist the top local into the heap, then pop it.
    CloseUpvalue,
}

impl Instruction {
    const OP_CODE_RETURN: u8 = 0;
    const OP_CODE_CONSTANT: u8 = 1;
    const OP_CODE_NEGATE: u8 = 2;
    const OP_CODE_ADD: u8 = 3;
    const OP_CODE_SUBTRACT: u8 = 4;
    const OP_CODE_MULTIPLY: u8 = 5;
    const OP_CODE_DIVIDE: u8 = 6;
    const OP_CODE_NIL: u8 = 7;
    const OP_CODE_FALSE: u8 = 8;
    const OP_CODE_TRUE: u8 = 9;
    const OP_CODE_NOT: u8 = 10;
    const OP_CODE_EQUAL: u8 = 11;
    const OP_CODE_GREATER: u8 = 12;
    const OP_CODE_LESS: u8 = 13;
    const OP_CODE_POP: u8 = 14;
    const OP_CODE_PRINT: u8 = 15;
    const OP_CODE_DEFINE_GLOBAL: u8 = 16;
    const OP_CODE_GET_GLOBAL: u8 = 17;
    const OP_CODE_SET_GLOBAL: u8 = 18;
    const OP_CODE_GET_LOCAL: u8 = 19;
    const OP_CODE_SET_LOCAL: u8 = 20;
    const OP_CODE_GET_UPVALUE: u8 = 21;
    const OP_CODE_SET_UPVALUE: u8 = 22;
    const OP_CODE_JUMP: u8 = 23;
    const OP_CODE_JUMP_IF_FALSE: u8 = 24;
    const OP_CODE_LOOP: u8 = 25;
    const OP_CODE_CALL: u8 = 26;
    const OP_CODE_CLOSURE: u8 = 27;
    const OP_CODE_CLOSE_UPVALUE: u8 = 28;

    /// Try to parse an instruction from the beginning of some bytes, returning the number of bytes that
    /// the instruction consists of on success in addition.
    /// Unknown opcodes and truncated operands give None.
    pub fn from_bytes(bytes: &[u8]) -> Option<(Instruction, usize)> {
        let (&op, operands) = bytes.split_first()?;
        let byte = || operands.first().copied();
        let short = || Some(u16::from_be_bytes([*operands.first()?, *operands.get(1)?]));
        let instruction = match op {
            Instruction::OP_CODE_RETURN => Instruction::Return,
            Instruction::OP_CODE_CONSTANT => Instruction::Constant(byte()?),
            Instruction::OP_CODE_NEGATE => Instruction::Negate,
            Instruction::OP_CODE_ADD => Instruction::Add,
            Instruction::OP_CODE_SUBTRACT => Instruction::Subtract,
            Instruction::OP_CODE_MULTIPLY => Instruction::Multiply,
            Instruction::OP_CODE_DIVIDE => Instruction::Divide,
            Instruction::OP_CODE_NIL => Instruction::Nil,
            Instruction::OP_CODE_FALSE => Instruction::False,
            Instruction::OP_CODE_TRUE => Instruction::True,
            Instruction::OP_CODE_NOT => Instruction::Not,
            Instruction::OP_CODE_EQUAL => Instruction::Equal,
            Instruction::OP_CODE_GREATER => Instruction::Greater,
            Instruction::OP_CODE_LESS => Instruction::Less,
            Instruction::OP_CODE_POP => Instruction::Pop,
            Instruction::OP_CODE_PRINT => Instruction::Print,
            Instruction::OP_CODE_DEFINE_GLOBAL => Instruction::DefineGlobal(byte()?),
            Instruction::OP_CODE_GET_GLOBAL => Instruction::GetGlobal(byte()?),
            Instruction::OP_CODE_SET_GLOBAL => Instruction::SetGlobal(byte()?),
            Instruction::OP_CODE_GET_LOCAL => Instruction::GetLocal(byte()?),
            Instruction::OP_CODE_SET_LOCAL => Instruction::SetLocal(byte()?),
            Instruction::OP_CODE_GET_UPVALUE => Instruction::GetUpvalue(byte()?),
            Instruction::OP_CODE_SET_UPVALUE => Instruction::SetUpvalue(byte()?),
            Instruction::OP_CODE_JUMP => Instruction::Jump(short()?),
            Instruction::OP_CODE_JUMP_IF_FALSE => Instruction::JumpIfFalse(short()?),
            Instruction::OP_CODE_LOOP => Instruction::Loop(short()?),
            Instruction::OP_CODE_CALL => Instruction::Call(byte()?),
            Instruction::OP_CODE_CLOSURE => Instruction::Closure(byte()?),
            Instruction::OP_CODE_CLOSE_UPVALUE => Instruction::CloseUpvalue,
            _ => return None,
        };
        Some((instruction, instruction.num_bytes()))
    }

    /// The byte representation of this instruction: a buffer and how much of it is used.
    pub fn encode(&self) -> ([u8; 3], usize) {
        let op = |code: u8| ([code, 0, 0], 1);
        let with_byte = |code: u8, operand: u8| ([code, operand, 0], 2);
        let with_short = |code: u8, operand: u16| {
            let [hi, lo] = operand.to_be_bytes();
            ([code, hi, lo], 3)
        };
        match *self {
            Self::Return => op(Instruction::OP_CODE_RETURN),
            Self::Constant(u) => with_byte(Instruction::OP_CODE_CONSTANT, u),
            Self::Negate => op(Instruction::OP_CODE_NEGATE),
            Self::Add => op(Instruction::OP_CODE_ADD),
            Self::Subtract => op(Instruction::OP_CODE_SUBTRACT),
            Self::Multiply => op(Instruction::OP_CODE_MULTIPLY),
            Self::Divide => op(Instruction::OP_CODE_DIVIDE),
            Self::Nil => op(Instruction::OP_CODE_NIL),
            Self::False => op(Instruction::OP_CODE_FALSE),
            Self::True => op(Instruction::OP_CODE_TRUE),
            Self::Not => op(Instruction::OP_CODE_NOT),
            Self::Equal => op(Instruction::OP_CODE_EQUAL),
            Self::Greater => op(Instruction::OP_CODE_GREATER),
            Self::Less => op(Instruction::OP_CODE_LESS),
            Self::Pop => op(Instruction::OP_CODE_POP),
            Self::Print => op(Instruction::OP_CODE_PRINT),
            Self::DefineGlobal(u) => with_byte(Instruction::OP_CODE_DEFINE_GLOBAL, u),
            Self::GetGlobal(u) => with_byte(Instruction::OP_CODE_GET_GLOBAL, u),
            Self::SetGlobal(u) => with_byte(Instruction::OP_CODE_SET_GLOBAL, u),
            Self::GetLocal(u) => with_byte(Instruction::OP_CODE_GET_LOCAL, u),
            Self::SetLocal(u) => with_byte(Instruction::OP_CODE_SET_LOCAL, u),
            Self::GetUpvalue(u) => with_byte(Instruction::OP_CODE_GET_UPVALUE, u),
            Self::SetUpvalue(u) => with_byte(Instruction::OP_CODE_SET_UPVALUE, u),
            Self::Jump(s) => with_short(Instruction::OP_CODE_JUMP, s),
            Self::JumpIfFalse(s) => with_short(Instruction::OP_CODE_JUMP_IF_FALSE, s),
            Self::Loop(s) => with_short(Instruction::OP_CODE_LOOP, s),
            Self::Call(u) => with_byte(Instruction::OP_CODE_CALL, u),
            Self::Closure(u) => with_byte(Instruction::OP_CODE_CLOSURE, u),
            Self::CloseUpvalue => op(Instruction::OP_CODE_CLOSE_UPVALUE),
        }
    }

    /// Number of bytes in the byte represention of this instruction
    pub fn num_bytes(&self) -> usize {
        self.encode().1
    }
}

impl From<&Instruction> for Vec<u8> {
    fn from(val: &Instruction) -> Self {
        let (bytes, len) = val.encode();
        bytes[..len].to_vec()
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instruction::Return => write!(f, "OP_RETURN"),
            Instruction::Constant(u) => write!(f, "{:<16} {:4}", "OP_CONSTANT", u),
            Instruction::Negate => write!(f, "OP_NEGATE"),
            Instruction::Add => write!(f, "OP_ADD"),
            Instruction::Subtract => write!(f, "OP_SUBTRACT"),
            Instruction::Multiply => write!(f, "OP_MULTIPLY"),
            Instruction::Divide => write!(f, "OP_DIVIDE"),
            Instruction::Nil => write!(f, "OP_NIL"),
            Instruction::False => write!(f, "OP_FALSE"),
            Instruction::True => write!(f, "OP_TRUE"),
            Instruction::Not => write!(f, "OP_NOT"),
            Instruction::Equal => write!(f, "OP_EQUAL"),
            Instruction::Greater => write!(f, "OP_GREATER"),
            Instruction::Less => write!(f, "OP_LESS"),
            Instruction::Pop => write!(f, "OP_POP"),
            Instruction::Print => write!(f, "OP_PRINT"),
            Instruction::DefineGlobal(u) => write!(f, "{:<16} {:4}", "OP_DEFINE_GLOBAL", u),
            Instruction::GetGlobal(u) => write!(f, "{:<16} {:4}", "OP_GET_GLOBAL", u),
            Instruction::SetGlobal(u) => write!(f, "{:<16} {:4}", "OP_SET_GLOBAL", u),
            Instruction::GetLocal(u) => write!(f, "{:<16} {:4}", "OP_GET_LOCAL", u),
            Instruction::SetLocal(u) => write!(f, "{:<16} {:4}", "OP_SET_LOCAL", u),
            Instruction::GetUpvalue(u) => write!(f, "{:<16} {:4}", "OP_GET_UPVALUE", u),
            Instruction::SetUpvalue(u) => write!(f, "{:<16} {:4}", "OP_SET_UPVALUE", u),
            Instruction::Jump(s) => write!(f, "{:<16} {:4}", "OP_JUMP", s),
            Instruction::JumpIfFalse(s) => write!(f, "{:<16} {:4}", "OP_JUMP_IF_FALSE", s),
            Instruction::Loop(s) => write!(f, "{:<16} {:4}", "OP_LOOP", s),
            Instruction::Call(u) => write!(f, "{:<16} {:4}", "OP_CALL", u),
            Instruction::Closure(u) => write!(f, "{:<16} {:4}", "OP_CLOSURE", u),
            Instruction::CloseUpvalue => write!(f, "OP_CLOSE_UPVALUE"),
        }
    }
}

/// A chunk is the unit of execution for the VM: bytecode, the constants it refers to, and the source
/// line of every byte.
#[derive(Debug)]
pub struct Chunk {
    code: Vec<u8>,
    constants: Vec<Value>,
    lines: Vec<usize>,
}

impl Chunk {
    /// A new chunk is empty.
    pub fn new() -> Self {
        Chunk {
            code: Vec::new(),
            constants: Vec::new(),
            lines: Vec::new(),
        }
    }

    /// Append one byte, recording the line it came from.
    pub fn write_byte(&mut self, byte: u8, line: usize) {
        if self.code.len() == self.code.capacity() {
            let capacity = self.code.capacity();
            let new_capacity = if capacity < 8 { 8 } else { capacity * 2 };
            self.code.reserve_exact(new_capacity - self.code.len());
        }
        self.code.push(byte);
        self.lines.push(line);
    }

    /// Add an instruction to the chunk's code.
    pub fn write_instruction(&mut self, instruction: Instruction, line: usize) {
        let (bytes, len) = instruction.encode();
        for &byte in &bytes[..len] {
            self.write_byte(byte, line);
        }
    }

    /// Add a constant to the chunk's constants table, returning its index.
    /// Instructions can only address the first 256 constants; the caller decides what to do about
    /// indices past that.
    pub fn add_constant(&mut self, constant: Value) -> usize {
        self.constants.push(constant);
        self.constants.len() - 1
    }

    /// Overwrite the two bytes at `offset` with a big-endian u16. Used to backpatch jumps.
    pub fn patch_u16(&mut self, offset: usize, value: u16) {
        let [hi, lo] = value.to_be_bytes();
        self.code[offset] = hi;
        self.code[offset + 1] = lo;
    }

    /// The constant at the given index, if there is one.
    pub fn constant(&self, idx: u8) -> Option<Value> {
        self.constants.get(usize::from(idx)).copied()
    }

    /// All constants, in index order.
    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    /// The raw bytecode.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Number of bytes of code.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Whether there is any code at all.
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Current allocated size of the code buffer.
    pub fn capacity(&self) -> usize {
        self.code.capacity()
    }

    /// Source line that produced the byte at `offset`.
    pub fn line(&self, offset: usize) -> Option<usize> {
        self.lines.get(offset).copied()
    }

    /// Single raw byte, used for the operands trailing a `Closure`.
    pub fn byte(&self, offset: usize) -> Option<u8> {
        self.code.get(offset).copied()
    }

    /// Decode the instruction starting at `offset`.
    pub fn instruction_at(&self, offset: usize) -> Option<(Instruction, usize)> {
        Instruction::from_bytes(self.code.get(offset..)?)
    }

    /// Release everything the chunk holds.
    pub fn free(&mut self) {
        self.code = Vec::new();
        self.constants = Vec::new();
        self.lines = Vec::new();
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn capacity_doubles_from_eight() {
        let mut chunk = Chunk::new();
        assert_eq!(chunk.capacity(), 0);
        chunk.write_byte(0, 1);
        assert_eq!(chunk.capacity(), 8);
        for _ in 1..8 {
            chunk.write_byte(0, 1);
        }
        assert_eq!(chunk.capacity(), 8);
        chunk.write_byte(0, 2);
        assert_eq!(chunk.capacity(), 16);
        assert_eq!(chunk.len(), 9);
        assert_eq!(chunk.line(8), Some(2));
    }

    #[test]
    fn operand_widths_and_byte_order() {
        assert_eq!(Vec::<u8>::from(&Instruction::Add), vec![3]);
        assert_eq!(Vec::<u8>::from(&Instruction::Constant(7)), vec![1, 7]);
        assert_eq!(
            Vec::<u8>::from(&Instruction::Jump(0x1234)),
            vec![23, 0x12, 0x34]
        );
        assert_eq!(
            Instruction::from_bytes(&[25, 0x01, 0x02, 99]),
            Some((Instruction::Loop(0x0102), 3))
        );
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(Instruction::from_bytes(&[]), None);
        assert_eq!(Instruction::from_bytes(&[200]), None);
        // Truncated operands
        assert_eq!(Instruction::from_bytes(&[1]), None);
        assert_eq!(Instruction::from_bytes(&[23, 0]), None);
    }

    #[test]
    fn lines_track_every_byte() {
        let mut chunk = Chunk::new();
        chunk.write_instruction(Instruction::Constant(0), 3);
        chunk.write_instruction(Instruction::Return, 4);
        assert_eq!(chunk.code(), &[1, 0, 0]);
        assert_eq!(
            (0..3).map(|i| chunk.line(i)).collect::<Vec<_>>(),
            vec![Some(3), Some(3), Some(4)]
        );
    }

    #[test]
    fn patching_and_free() {
        let mut chunk = Chunk::new();
        chunk.write_instruction(Instruction::JumpIfFalse(u16::MAX), 1);
        chunk.patch_u16(1, 5);
        assert_eq!(chunk.instruction_at(0), Some((Instruction::JumpIfFalse(5), 3)));
        assert_eq!(chunk.add_constant(Value::Nil), 0);
        assert_eq!(chunk.add_constant(Value::Boolean(true)), 1);
        chunk.free();
        assert!(chunk.is_empty());
        assert!(chunk.constants().is_empty());
        assert_eq!(chunk.line(0), None);
    }
}
