use std::collections::HashMap;
use std::fmt::Display;
use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::compiler::{compile, CompileErrors};
use crate::scanner::Scanner;

/// Slot storage with checked handles.
pub mod arena;
/// Instructions and the chunks they're encoded into.
pub mod chunk;
/// Disassembly.
pub mod debug;
/// Where Lox objects live.
pub mod heap;
/// The kinds of heap object.
pub mod object;
/// Values as the VM stack holds them.
pub mod value;

pub use arena::{Handle, HeapError};
pub use chunk::{Chunk, Instruction};
pub use heap::{Heap, ObjectError};
pub use object::{NativeFunction, Object, Upvalue};
pub use value::Value;

macro_rules! binary_arithmetic {
    ($self:ident, $op:tt) => {{
        let b = $self.stack_pop()?;
        let a = $self.stack_pop()?;
        match (a.as_number(), b.as_number()) {
            // Lox is lax about comparing NaNs and stuff
            #[allow(clippy::float_cmp)]
            (Some(a), Some(b)) => $self.stack_push((a $op b).into()),
            _ => Err($self.runtime_error(RuntimeErrorKind::OperandsMustBeNumbers)),
        }
    }};
}

/// Maximum call depth.
pub const FRAMES_MAX: usize = 64;
/// Value stack slots available to each frame.
pub const SLOTS_PER_FRAME: usize = 256;
const STACK_SIZE: usize = FRAMES_MAX * SLOTS_PER_FRAME;

/// Errors that can be returned by running the intepreter.
#[derive(Debug, Error)]
pub enum LoxError {
    /// The source didn't compile. Nothing was run.
    #[error(transparent)]
    CompileError(#[from] CompileErrors),
    /// The program did something wrong at runtime, like mismatched types.
    #[error(transparent)]
    RuntimeError(#[from] RuntimeError),
    /// Internal Errors should not occur for code that compiled successfully, but just in case.
    #[error("lox internal error: {0}")]
    InternalError(#[from] InternalError),
}

impl LoxError {
    /// Whether the VM that returned this is unusable. Hosts should stop instead of trying more code.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LoxError::InternalError(_))
    }
}

impl From<ObjectError> for LoxError {
    fn from(e: ObjectError) -> Self {
        LoxError::InternalError(e.into())
    }
}

impl From<HeapError> for LoxError {
    fn from(e: HeapError) -> Self {
        LoxError::InternalError(ObjectError::from(e).into())
    }
}

#[derive(Debug, Error)]
/// VM errors that should never come up in code that compiled correctly. They mean the engine itself
/// is broken, and the host should treat them as fatal.
pub enum InternalError {
    /// A handle was dangling, or pointed at the wrong kind of object.
    #[error(transparent)]
    Object(#[from] ObjectError),
    /// Tried to get the top value from an empty stack
    #[error("popped from an empty stack")]
    EmptyStack,
    /// A stack slot outside the stack was addressed.
    #[error("stack slot {0} out of range")]
    BadSlot(usize),
    /// Execution needs a call frame, and there were none.
    #[error("no active call frame")]
    NoFrame,
    /// The bytes at the instruction pointer don't decode.
    #[error("invalid instruction at offset {0}")]
    InvalidInstruction(usize),
    /// An instruction referred to a constant the chunk doesn't have.
    #[error("missing constant {0}")]
    MissingConstant(u8),
    /// A closure referred to an upvalue it doesn't have.
    #[error("missing upvalue {0}")]
    MissingUpvalue(u8),
    /// The open upvalue list reached an upvalue that was already closed.
    #[error("closed upvalue {0} in the open list")]
    ClosedUpvalueListed(Handle),
    /// Writing program output failed.
    #[error("writing output: {0}")]
    Output(#[from] io::Error),
    /// An earlier internal error left this VM unusable.
    #[error("the VM halted after an earlier internal error")]
    Halted,
}

/// The different things a Lox program can do wrong at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeErrorKind {
    /// Unary minus on a non-number.
    #[error("Operand must be a number.")]
    OperandMustBeNumber,
    /// Arithmetic or comparison on non-numbers.
    #[error("Operands must be numbers.")]
    OperandsMustBeNumbers,
    /// `+` on anything but two numbers or two strings.
    #[error("Operands must be two numbers or two strings.")]
    InvalidAddOperands,
    /// Read or assignment of a global that was never defined.
    #[error("Undefined variable '{0}'.")]
    UndefinedVariable(String),
    /// Wrong number of arguments to a closure.
    #[error("Expected {expected} arguments but got {actual}.")]
    ArityMismatch {
        /// The function's arity.
        expected: usize,
        /// Arguments passed.
        actual: usize,
    },
    /// Call of something that isn't a function.
    #[error("Can only call functions and classes.")]
    NotCallable,
    /// Too many nested calls.
    #[error("Stack overflow.")]
    StackOverflow,
}

/// One line of a runtime error's backtrace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Line being executed in this frame.
    pub line: usize,
    /// None for the top-level script.
    pub function: Option<String>,
}

impl Display for TraceFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.function {
            Some(name) => write!(f, "[line {}] in {}()", self.line, name),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

/// A runtime error along with the call stack at the point it happened, innermost frame first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct RuntimeError {
    /// What went wrong.
    pub kind: RuntimeErrorKind,
    /// Active calls when it happened, innermost first.
    pub trace: Vec<TraceFrame>,
}

impl Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        for frame in &self.trace {
            write!(f, "\n{}", frame)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct CallFrame {
    closure: Handle,
    // The closure's function, cached since every instruction fetch needs it.
    function: Handle,
    ip: usize,
    // First stack slot of this call: the callee itself, then the arguments.
    base: usize,
}

#[derive(Debug)]
enum ControlFlow {
    Continue,
    Done,
}

// What a callee turned out to be, looked up before deciding how to call it.
enum Callee {
    Closure(Handle),
    Native,
    Other,
}

/// A Vm is a stateful executor of Lox source. Globals and heap objects persist between calls to
/// `interpret`, which is what a REPL wants.
#[derive(Debug)]
pub struct Vm<W = io::Stdout> {
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    globals: HashMap<Handle, Value>,
    // Head of the open upvalue list, sorted by descending stack slot.
    open_upvalues: Option<Handle>,
    heap: Heap,
    out: W,
    // Set by an internal error. Nothing runs afterwards.
    halted: bool,
}

impl Vm<io::Stdout> {
    /// A VM that prints to stdout.
    pub fn new() -> Self {
        Vm::with_output(io::stdout())
    }
}

impl Default for Vm<io::Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write> Vm<W> {
    /// A VM whose `print` statements write to `out`.
    pub fn with_output(out: W) -> Self {
        let mut vm = Vm {
            frames: Vec::with_capacity(FRAMES_MAX),
            stack: Vec::with_capacity(STACK_SIZE),
            globals: HashMap::new(),
            open_upvalues: None,
            heap: Heap::new(),
            out,
            halted: false,
        };
        vm.define_native("clock", Box::new(clock_native));
        vm
    }

    /// Make a host function available to Lox code as a global.
    pub fn define_native(&mut self, name: &str, func: object::NativeFn) {
        let name = self.heap.intern(name);
        let native = self.heap.new_native(NativeFunction::new(func));
        self.globals.insert(name, Value::Object(native));
    }

    /// The program's output sink.
    pub fn output(&self) -> &W {
        &self.out
    }

    /// The objects this VM has allocated.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Compile and run some source. After a compile or runtime error the VM is ready for the next
    /// call. After an internal error it is halted, and every later call fails with
    /// `InternalError::Halted`.
    pub fn interpret(&mut self, source: &str) -> Result<(), LoxError> {
        if self.halted {
            return Err(InternalError::Halted.into());
        }
        let function = compile(Scanner::new(source), &mut self.heap)?;
        self.run_script(function)
    }

    fn run_script(&mut self, function: Handle) -> Result<(), LoxError> {
        let closure = self.heap.new_closure(function, Vec::new());
        let result = self
            .stack_push(Value::Object(closure))
            .and_then(|()| self.call(closure, function, 0))
            .and_then(|()| self.run());
        match &result {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                tracing::error!(error = %e, "halting the VM");
                self.halted = true;
            }
            Err(e) => {
                tracing::debug!(error = %e, "aborting execution");
                self.reset_stack();
            }
        }
        result
    }

    /// Run the interpreter until code finishes executing or an error occurs.
    fn run(&mut self) -> Result<(), LoxError> {
        loop {
            let frame = self.current_frame()?;
            let (instruction, len) = self
                .current_chunk()?
                .instruction_at(frame.ip)
                .ok_or(InternalError::InvalidInstruction(frame.ip))?;
            #[cfg(feature = "trace")]
            self.trace_instruction(frame.ip);
            self.current_frame_mut()?.ip += len;
            if let ControlFlow::Done = self.execute(instruction)? {
                return Ok(());
            }
        }
    }

    #[cfg(feature = "trace")]
    fn trace_instruction(&self, ip: usize) {
        if !tracing::enabled!(tracing::Level::TRACE) {
            return;
        }
        let stack: Vec<String> = self
            .stack
            .iter()
            .map(|v| self.heap.format_value(*v).unwrap_or_else(|e| e.to_string()))
            .collect();
        if let Ok(chunk) = self.current_chunk() {
            let (text, _) = chunk.disassemble_instruction(ip, &self.heap);
            tracing::trace!("[ {} ]", stack.join(" | "));
            tracing::trace!("{}", text);
        }
    }

    fn execute(&mut self, instruction: Instruction) -> Result<ControlFlow, LoxError> {
        match instruction {
            Instruction::Return => return self.return_from_call(),
            Instruction::Constant(idx) => {
                let value = self.read_constant(idx)?;
                self.stack_push(value)?;
            }
            Instruction::Nil => self.stack_push(Value::Nil)?,
            Instruction::False => self.stack_push(Value::Boolean(false))?,
            Instruction::True => self.stack_push(Value::Boolean(true))?,
            Instruction::Pop => {
                self.stack_pop()?;
            }
            Instruction::Print => {
                let value = self.stack_pop()?;
                let text = self.heap.format_value(value)?;
                writeln!(self.out, "{}", text).map_err(InternalError::from)?;
            }
            Instruction::Negate => {
                let value = self.stack_pop()?;
                match value.as_number() {
                    Some(number) => self.stack_push(Value::Number(-number))?,
                    None => return Err(self.runtime_error(RuntimeErrorKind::OperandMustBeNumber)),
                }
            }
            Instruction::Not => {
                let value = self.stack_pop()?;
                self.stack_push(Value::Boolean(value.is_falsey()))?
            }
            Instruction::Add => self.add()?,
            Instruction::Subtract => binary_arithmetic!(self, -)?,
            Instruction::Multiply => binary_arithmetic!(self, *)?,
            Instruction::Divide => binary_arithmetic!(self, /)?,
            Instruction::Greater => binary_arithmetic!(self, >)?,
            Instruction::Less => binary_arithmetic!(self, <)?,
            Instruction::Equal => {
                let b = self.stack_pop()?;
                let a = self.stack_pop()?;
                self.stack_push(Value::Boolean(a == b))?
            }
            Instruction::DefineGlobal(idx) => {
                let name = self.read_name(idx)?;
                let value = self.stack_peek(0)?;
                self.globals.insert(name, value);
                self.stack_pop()?;
            }
            Instruction::GetGlobal(idx) => {
                let name = self.read_name(idx)?;
                match self.globals.get(&name) {
                    Some(&value) => self.stack_push(value)?,
                    None => return Err(self.undefined_variable(name)),
                }
            }
            Instruction::SetGlobal(idx) => {
                let name = self.read_name(idx)?;
                let value = self.stack_peek(0)?;
                match self.globals.get_mut(&name) {
                    Some(slot) => *slot = value,
                    None => return Err(self.undefined_variable(name)),
                }
            }
            Instruction::GetLocal(slot) => {
                let index = self.current_frame()?.base + usize::from(slot);
                let value = *self
                    .stack
                    .get(index)
                    .ok_or(InternalError::BadSlot(index))?;
                self.stack_push(value)?;
            }
            Instruction::SetLocal(slot) => {
                let index = self.current_frame()?.base + usize::from(slot);
                let value = self.stack_peek(0)?;
                *self
                    .stack
                    .get_mut(index)
                    .ok_or(InternalError::BadSlot(index))? = value;
            }
            Instruction::GetUpvalue(idx) => {
                let upvalue = self.current_upvalue(idx)?;
                let value = match *self.heap.upvalue(upvalue)? {
                    Upvalue::Open { slot, .. } => {
                        *self.stack.get(slot).ok_or(InternalError::BadSlot(slot))?
                    }
                    Upvalue::Closed(value) => value,
                };
                self.stack_push(value)?;
            }
            Instruction::SetUpvalue(idx) => {
                let upvalue = self.current_upvalue(idx)?;
                let value = self.stack_peek(0)?;
                match self.heap.upvalue_mut(upvalue)? {
                    Upvalue::Open { slot, .. } => {
                        let slot = *slot;
                        *self
                            .stack
                            .get_mut(slot)
                            .ok_or(InternalError::BadSlot(slot))? = value;
                    }
                    Upvalue::Closed(closed) => *closed = value,
                }
            }
            Instruction::Jump(offset) => {
                self.current_frame_mut()?.ip += usize::from(offset);
            }
            Instruction::JumpIfFalse(offset) => {
                if self.stack_peek(0)?.is_falsey() {
                    self.current_frame_mut()?.ip += usize::from(offset);
                }
            }
            Instruction::Loop(offset) => {
                self.current_frame_mut()?.ip -= usize::from(offset);
            }
            Instruction::Call(arg_count) => {
                let callee = self.stack_peek(usize::from(arg_count))?;
                self.call_value(callee, usize::from(arg_count))?;
            }
            Instruction::Closure(idx) => self.make_closure(idx)?,
            Instruction::CloseUpvalue => {
                let top = self.stack.len().checked_sub(1).ok_or(InternalError::EmptyStack)?;
                self.close_upvalues(top)?;
                self.stack_pop()?;
            }
        }
        Ok(ControlFlow::Continue)
    }

    fn add(&mut self) -> Result<(), LoxError> {
        let b = self.stack_pop()?;
        let a = self.stack_pop()?;
        match (a, b) {
            (Value::Number(a), Value::Number(b)) => self.stack_push(Value::Number(a + b)),
            (Value::Object(a), Value::Object(b)) => {
                let joined = match (self.heap.get(a)?, self.heap.get(b)?) {
                    (Object::String(a), Object::String(b)) => Some(format!("{}{}", a, b)),
                    _ => None,
                };
                match joined {
                    Some(s) => {
                        let handle = self.heap.take_string(s);
                        self.stack_push(Value::Object(handle))
                    }
                    None => Err(self.runtime_error(RuntimeErrorKind::InvalidAddOperands)),
                }
            }
            _ => Err(self.runtime_error(RuntimeErrorKind::InvalidAddOperands)),
        }
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), LoxError> {
        let kind = match callee {
            Value::Object(handle) => match self.heap.get(handle)? {
                Object::Closure(c) => Callee::Closure(c.function),
                Object::NativeFunction(_) => Callee::Native,
                _ => Callee::Other,
            },
            _ => Callee::Other,
        };
        match (kind, callee) {
            (Callee::Closure(function), Value::Object(closure)) => {
                self.call(closure, function, arg_count)
            }
            (Callee::Native, Value::Object(native)) => {
                let args_start = self.stack.len() - arg_count;
                let result = match self.heap.get(native)? {
                    Object::NativeFunction(n) => n.call(&self.stack[args_start..]),
                    _ => Value::Nil,
                };
                // Drop the arguments and the callee itself.
                self.stack.truncate(args_start - 1);
                self.stack_push(result)
            }
            _ => Err(self.runtime_error(RuntimeErrorKind::NotCallable)),
        }
    }

    fn call(&mut self, closure: Handle, function: Handle, arg_count: usize) -> Result<(), LoxError> {
        let arity = self.heap.function(function)?.arity;
        if arg_count != arity {
            return Err(self.runtime_error(RuntimeErrorKind::ArityMismatch {
                expected: arity,
                actual: arg_count,
            }));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error(RuntimeErrorKind::StackOverflow));
        }
        let base = self
            .stack
            .len()
            .checked_sub(arg_count + 1)
            .ok_or(InternalError::EmptyStack)?;
        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            base,
        });
        Ok(())
    }

    fn return_from_call(&mut self) -> Result<ControlFlow, LoxError> {
        let result = self.stack_pop()?;
        let frame = self.frames.pop().ok_or(InternalError::NoFrame)?;
        self.close_upvalues(frame.base)?;
        self.stack.truncate(frame.base);
        if self.frames.is_empty() {
            // That was the script itself; the truncate popped its closure too.
            return Ok(ControlFlow::Done);
        }
        self.stack_push(result)?;
        Ok(ControlFlow::Continue)
    }

    fn make_closure(&mut self, idx: u8) -> Result<(), LoxError> {
        let function = self
            .read_constant(idx)?
            .as_object()
            .ok_or(InternalError::MissingConstant(idx))?;
        let upvalue_count = self.heap.function(function)?.upvalue_count;
        let frame = self.current_frame()?;
        let mut upvalues = Vec::with_capacity(upvalue_count);
        for _ in 0..upvalue_count {
            let is_local = self.read_byte()?;
            let index = self.read_byte()?;
            let upvalue = if is_local == 1 {
                self.capture_upvalue(frame.base + usize::from(index))?
            } else {
                self.heap
                    .closure(frame.closure)?
                    .upvalues
                    .get(usize::from(index))
                    .copied()
                    .ok_or(InternalError::MissingUpvalue(index))?
            };
            upvalues.push(upvalue);
        }
        let closure = self.heap.new_closure(function, upvalues);
        self.stack_push(Value::Object(closure))
    }

    // Find or create the open upvalue for a stack slot, keeping the open list sorted.
    fn capture_upvalue(&mut self, slot: usize) -> Result<Handle, LoxError> {
        let mut prev = None;
        let mut current = self.open_upvalues;

        while let Some(handle) = current {
            let (current_slot, next) = self.open_upvalue_at(handle)?;
            if current_slot < slot {
                break;
            }
            if current_slot == slot {
                return Ok(handle);
            }
            prev = Some(handle);
            current = next;
        }

        let created = self.heap.new_upvalue(Upvalue::Open {
            slot,
            next: current,
        });
        match prev {
            Some(prev) => {
                if let Upvalue::Open { next, .. } = self.heap.upvalue_mut(prev)? {
                    *next = Some(created);
                }
            }
            None => self.open_upvalues = Some(created),
        }
        Ok(created)
    }

    // Close every open upvalue pointing at `last` or above.
    fn close_upvalues(&mut self, last: usize) -> Result<(), LoxError> {
        while let Some(handle) = self.open_upvalues {
            let (slot, next) = self.open_upvalue_at(handle)?;
            if slot < last {
                break;
            }
            let value = *self.stack.get(slot).ok_or(InternalError::BadSlot(slot))?;
            *self.heap.upvalue_mut(handle)? = Upvalue::Closed(value);
            self.open_upvalues = next;
        }
        Ok(())
    }

    fn open_upvalue_at(&self, handle: Handle) -> Result<(usize, Option<Handle>), LoxError> {
        match *self.heap.upvalue(handle)? {
            Upvalue::Open { slot, next } => Ok((slot, next)),
            Upvalue::Closed(_) => Err(InternalError::ClosedUpvalueListed(handle).into()),
        }
    }

    fn current_frame(&self) -> Result<CallFrame, InternalError> {
        self.frames.last().copied().ok_or(InternalError::NoFrame)
    }

    fn current_frame_mut(&mut self) -> Result<&mut CallFrame, InternalError> {
        self.frames.last_mut().ok_or(InternalError::NoFrame)
    }

    fn current_chunk(&self) -> Result<&Chunk, InternalError> {
        let frame = self.current_frame()?;
        Ok(&self.heap.function(frame.function)?.chunk)
    }

    fn current_upvalue(&self, idx: u8) -> Result<Handle, LoxError> {
        let frame = self.current_frame()?;
        Ok(self
            .heap
            .closure(frame.closure)?
            .upvalues
            .get(usize::from(idx))
            .copied()
            .ok_or(InternalError::MissingUpvalue(idx))?)
    }

    fn read_byte(&mut self) -> Result<u8, InternalError> {
        let ip = self.current_frame()?.ip;
        let byte = self
            .current_chunk()?
            .byte(ip)
            .ok_or(InternalError::InvalidInstruction(ip))?;
        self.current_frame_mut()?.ip += 1;
        Ok(byte)
    }

    fn read_constant(&self, idx: u8) -> Result<Value, InternalError> {
        self.current_chunk()?
            .constant(idx)
            .ok_or(InternalError::MissingConstant(idx))
    }

    fn read_name(&self, idx: u8) -> Result<Handle, InternalError> {
        self.read_constant(idx)?
            .as_object()
            .ok_or(InternalError::MissingConstant(idx))
    }

    fn stack_push(&mut self, value: Value) -> Result<(), LoxError> {
        if self.stack.len() >= STACK_SIZE {
            Err(self.runtime_error(RuntimeErrorKind::StackOverflow))
        } else {
            self.stack.push(value);
            Ok(())
        }
    }

    fn stack_pop(&mut self) -> Result<Value, InternalError> {
        self.stack.pop().ok_or(InternalError::EmptyStack)
    }

    fn stack_peek(&self, distance: usize) -> Result<Value, InternalError> {
        self.stack
            .len()
            .checked_sub(distance + 1)
            .and_then(|i| self.stack.get(i))
            .copied()
            .ok_or(InternalError::EmptyStack)
    }

    fn undefined_variable(&self, name: Handle) -> LoxError {
        let name = self
            .heap
            .string(name)
            .map(str::to_string)
            .unwrap_or_else(|e| e.to_string());
        self.runtime_error(RuntimeErrorKind::UndefinedVariable(name))
    }

    fn runtime_error(&self, kind: RuntimeErrorKind) -> LoxError {
        let trace = self
            .frames
            .iter()
            .rev()
            .map(|frame| {
                let function = self.heap.function(frame.function).ok();
                // ip has already moved past the failing instruction.
                let line = function
                    .and_then(|f| f.chunk.line(frame.ip.saturating_sub(1)))
                    .unwrap_or(0);
                let name = function
                    .and_then(|f| self.heap.function_name(f).ok().flatten())
                    .map(str::to_string);
                TraceFrame {
                    line,
                    function: name,
                }
            })
            .collect();
        LoxError::RuntimeError(RuntimeError { kind, trace })
    }

    fn reset_stack(&mut self) {
        // Close anything still open first, so closures that escaped into globals keep working.
        if let Err(e) = self.close_upvalues(0) {
            tracing::warn!(error = %e, "closing upvalues during reset");
            self.open_upvalues = None;
        }
        self.stack.clear();
        self.frames.clear();
    }
}

impl<W> Drop for Vm<W> {
    fn drop(&mut self) {
        if let Err(e) = self.heap.free_strings() {
            tracing::warn!(error = %e, "freeing interned strings");
        }
        let report = self.heap.sweep();
        tracing::debug!(objects = report.len(), "heap swept");
    }
}

fn clock_native(_args: &[Value]) -> Value {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Value::Number(now)
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run(source: &str) -> (Result<(), LoxError>, String) {
        let mut vm = Vm::with_output(Vec::new());
        let result = vm.interpret(source);
        let output = String::from_utf8(vm.output().clone()).unwrap();
        (result, output)
    }

    fn runtime_kind(result: Result<(), LoxError>) -> RuntimeErrorKind {
        match result {
            Err(LoxError::RuntimeError(e)) => e.kind,
            other => panic!("expected a runtime error, got {:?}", other),
        }
    }

    #[test]
    fn arithmetic_precedence() {
        let (result, out) = run("print 1 + 2 * 3; print 3 - 1 / 2; print -(2 + 2) * 2;");
        result.unwrap();
        assert_eq!(out, "7\n2.5\n-8\n");
    }

    #[test]
    fn comparison_and_equality() {
        let (result, out) = run(
            "print 1 < 2; print 2 <= 1; print 3 >= 3; print 1 == 1; print \"a\" != \"a\"; \
             print nil == false; print !nil; print !0;",
        );
        result.unwrap();
        assert_eq!(
            out,
            "true\nfalse\ntrue\ntrue\nfalse\nfalse\ntrue\nfalse\n"
        );
    }

    #[test]
    fn string_concatenation_is_interned() {
        let mut vm = Vm::with_output(Vec::new());
        vm.interpret("var s = \"a\" + \"b\"; print s; print s == \"ab\";")
            .unwrap();
        assert_eq!(String::from_utf8(vm.output().clone()).unwrap(), "ab\ntrue\n");
    }

    #[test]
    fn type_error_prints_nothing() {
        let (result, out) = run("print \"hi\" + 1;");
        assert_eq!(runtime_kind(result), RuntimeErrorKind::InvalidAddOperands);
        assert_eq!(out, "");
    }

    #[test]
    fn negate_and_compare_need_numbers() {
        assert_eq!(
            runtime_kind(run("-\"x\";").0),
            RuntimeErrorKind::OperandMustBeNumber
        );
        assert_eq!(
            runtime_kind(run("print 1 < nil;").0),
            RuntimeErrorKind::OperandsMustBeNumbers
        );
    }

    #[test]
    fn runtime_error_backtrace() {
        let source = "fun inner() {\n  return nil + 1;\n}\nfun outer() {\n  inner();\n}\nouter();\n";
        let err = match run(source).0 {
            Err(LoxError::RuntimeError(e)) => e,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(
            err.to_string(),
            "Operands must be two numbers or two strings.\n\
             [line 2] in inner()\n\
             [line 5] in outer()\n\
             [line 7] in script"
        );
    }

    #[test]
    fn vm_recovers_after_runtime_error() {
        let mut vm = Vm::with_output(Vec::new());
        vm.interpret("var a = 1;").unwrap();
        assert!(vm.interpret("a();").is_err());
        vm.interpret("print a;").unwrap();
        assert_eq!(String::from_utf8(vm.output().clone()).unwrap(), "1\n");
    }

    #[test]
    fn escaped_closure_survives_error_reset() {
        let mut vm = Vm::with_output(Vec::new());
        let source = "var get; { var x = \"kept\"; fun g() { return x; } get = g; nil(); }";
        assert!(vm.interpret(source).is_err());
        vm.interpret("print get();").unwrap();
        assert_eq!(String::from_utf8(vm.output().clone()).unwrap(), "kept\n");
    }

    #[test]
    fn returning_moves_captured_values_into_the_heap() {
        let mut vm = Vm::with_output(Vec::new());
        vm.interpret("var get; fun make() { var x = \"kept\"; fun g() { return x; } return g; } get = make();")
            .unwrap();
        let name = vm.heap.intern("get");
        let kept = vm.heap.intern("kept");
        let closure = vm.globals[&name].as_object().unwrap();
        let upvalue = vm.heap.closure(closure).unwrap().upvalues[0];

        assert_eq!(
            *vm.heap.upvalue(upvalue).unwrap(),
            Upvalue::Closed(Value::Object(kept))
        );
        assert!(vm.open_upvalues.is_none());
        assert!(vm.stack.is_empty());
    }

    #[test]
    fn natives() {
        let mut vm = Vm::with_output(Vec::new());
        vm.define_native(
            "sum",
            Box::new(|args: &[Value]| Value::Number(args.iter().filter_map(Value::as_number).sum())),
        );
        vm.interpret("print sum(1, 2, 3); print clock() > 0; print clock;")
            .unwrap();
        assert_eq!(
            String::from_utf8(vm.output().clone()).unwrap(),
            "6\ntrue\n<native fn>\n"
        );
    }

    #[test]
    fn stack_overflow() {
        let (result, _) = run("fun f() { f(); } f();");
        let err = match result {
            Err(LoxError::RuntimeError(e)) => e,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(err.kind, RuntimeErrorKind::StackOverflow);
        assert_eq!(err.trace.len(), FRAMES_MAX);
    }

    #[test]
    fn internal_error_halts_the_vm() {
        let mut vm = Vm::with_output(Vec::new());
        let mut chunk = Chunk::new();
        chunk.write_instruction(Instruction::Nil, 1);
        chunk.write_byte(250, 1);
        let function = vm.heap.new_function(object::Function {
            arity: 0,
            upvalue_count: 0,
            chunk,
            name: None,
        });

        let err = vm.run_script(function).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            LoxError::InternalError(InternalError::InvalidInstruction(1))
        ));

        let err = vm.interpret("print 1;").unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            LoxError::InternalError(InternalError::Halted)
        ));
        assert!(vm.output().is_empty());
    }

    #[test]
    fn user_errors_are_not_fatal() {
        let mut vm = Vm::with_output(Vec::new());
        assert!(!vm.interpret("print ;").unwrap_err().is_fatal());
        assert!(!vm.interpret("print nil + 1;").unwrap_err().is_fatal());
        vm.interpret("print 1;").unwrap();
    }

    #[test]
    fn stack_is_empty_after_success() {
        let mut vm = Vm::with_output(Vec::new());
        vm.interpret("fun f(a) { var b = a; return b; } print f(3);")
            .unwrap();
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
        assert!(vm.open_upvalues.is_none());
    }
}
