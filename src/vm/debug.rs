//! Human-readable listings of bytecode. Nothing here affects execution.

use std::fmt::Write;

use super::chunk::{Chunk, Instruction};
use super::heap::Heap;

impl Chunk {
    /// Return a human-readable listing of the whole chunk.
    ///
    /// The heap is needed to print constants, and to know how many upvalue operands follow each
    /// `OP_CLOSURE`.
    pub fn disassemble(&self, title: &str, heap: &Heap) -> String {
        let mut ret = format!("== {} ==\n", title);
        let mut offset = 0;
        while offset < self.len() {
            let (text, next) = self.disassemble_instruction(offset, heap);
            ret.push_str(&text);
            ret.push('\n');
            offset = next;
        }
        ret
    }

    /// Describe the instruction at `offset`, returning the text and the offset of the next
    /// instruction.
    pub fn disassemble_instruction(&self, offset: usize, heap: &Heap) -> (String, usize) {
        let line = self.line(offset).unwrap_or(0);
        let mut ret = if offset > 0 && self.line(offset - 1) == Some(line) {
            format!("{:04}    | ", offset)
        } else {
            format!("{:04} {:4} ", offset, line)
        };

        let Some((instruction, len)) = self.instruction_at(offset) else {
            let byte = self.byte(offset).unwrap_or_default();
            write!(&mut ret, "Unknown opcode {}", byte).expect("writing to string");
            return (ret, offset + 1);
        };
        let mut next = offset + len;
        write!(&mut ret, "{}", instruction).expect("writing to string");

        match instruction {
            Instruction::Constant(idx)
            | Instruction::DefineGlobal(idx)
            | Instruction::GetGlobal(idx)
            | Instruction::SetGlobal(idx) => {
                write!(&mut ret, " '{}'", self.describe_constant(idx, heap))
                    .expect("writing to string");
            }
            Instruction::Jump(jump) | Instruction::JumpIfFalse(jump) => {
                write!(&mut ret, " -> {}", next + usize::from(jump)).expect("writing to string");
            }
            Instruction::Loop(jump) => {
                write!(&mut ret, " -> {}", next.saturating_sub(usize::from(jump)))
                    .expect("writing to string");
            }
            Instruction::Closure(idx) => {
                write!(&mut ret, " {}", self.describe_constant(idx, heap))
                    .expect("writing to string");
                let upvalue_count = self
                    .constant(idx)
                    .and_then(|c| c.as_object())
                    .and_then(|h| heap.function(h).ok())
                    .map_or(0, |f| f.upvalue_count);
                for _ in 0..upvalue_count {
                    let is_local = self.byte(next).unwrap_or_default();
                    let index = self.byte(next + 1).unwrap_or_default();
                    write!(
                        &mut ret,
                        "\n{:04}    |                     {} {}",
                        next,
                        if is_local == 1 { "local" } else { "upvalue" },
                        index
                    )
                    .expect("writing to string");
                    next += 2;
                }
            }
            _ => {}
        }
        (ret, next)
    }

    fn describe_constant(&self, idx: u8, heap: &Heap) -> String {
        match self.constant(idx) {
            Some(value) => heap
                .format_value(value)
                .unwrap_or_else(|e| format!("<{}>", e)),
            None => "<missing constant>".to_string(),
        }
    }
}
