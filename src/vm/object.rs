use std::fmt::{Debug, Display};

use super::arena::Handle;
use super::chunk::Chunk;
use super::value::Value;

/// A compiled function body. The top-level script is one of these too, with no name.
#[derive(Debug)]
pub struct Function {
    /// Number of parameters.
    pub arity: usize,
    /// Number of `(is_local, index)` pairs after each `OP_CLOSURE` for this function.
    pub upvalue_count: usize,
    /// The body.
    pub chunk: Chunk,
    /// Handle of the name string. If it's the main script, it has no name.
    pub name: Option<Handle>,
}

/// Signature of host functions callable from Lox.
pub type NativeFn = Box<dyn Fn(&[Value]) -> Value>;

/// A function implemented by the host.
pub struct NativeFunction {
    func: NativeFn,
}

impl NativeFunction {
    /// Wrap a host function.
    pub fn new(func: NativeFn) -> NativeFunction {
        NativeFunction { func }
    }

    /// Run it on the argument slice.
    pub fn call(&self, values: &[Value]) -> Value {
        (self.func)(values)
    }
}

impl Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<native fn>")
    }
}

/// A function paired with the variables it captured.
#[derive(Debug)]
pub struct Closure {
    /// The `Object::Function` being closed over.
    pub function: Handle,
    /// One entry per upvalue of `function`, each pointing at an `Object::Upvalue`.
    pub upvalues: Vec<Handle>,
}

/// A captured variable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Upvalue {
    /// Still aliases a live stack slot. `next` links the VM's list of open upvalues, which is kept
    /// sorted by descending slot.
    Open {
        /// Absolute index into the VM stack.
        slot: usize,
        /// Next open upvalue, at a lower slot.
        next: Option<Handle>,
    },
    /// The slot's frame has returned, so the value now lives here.
    Closed(Value),
}

/// Everything that can live on the heap.
#[derive(Debug)]
pub enum Object {
    /// An interned string.
    String(String),
    /// A compiled function, not yet wrapped in a closure.
    Function(Function),
    /// A host function.
    NativeFunction(NativeFunction),
    /// A function plus its captured variables.
    Closure(Closure),
    /// One captured variable.
    Upvalue(Upvalue),
}

/// Which variant an `Object` is, for error messages.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    String,
    Function,
    NativeFunction,
    Closure,
    Upvalue,
}

impl Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ObjectKind::String => "string",
            ObjectKind::Function => "function",
            ObjectKind::NativeFunction => "native function",
            ObjectKind::Closure => "closure",
            ObjectKind::Upvalue => "upvalue",
        };
        write!(f, "{}", name)
    }
}

impl Object {
    /// Which kind of object this is.
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::String(_) => ObjectKind::String,
            Object::Function(_) => ObjectKind::Function,
            Object::NativeFunction(_) => ObjectKind::NativeFunction,
            Object::Closure(_) => ObjectKind::Closure,
            Object::Upvalue(_) => ObjectKind::Upvalue,
        }
    }

    /// The string, if this is one.
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Object::String(s) => Some(s),
            _ => None,
        }
    }

    /// The function, if this is one.
    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Object::Function(f) => Some(f),
            _ => None,
        }
    }

    /// The closure, if this is one.
    pub fn as_closure(&self) -> Option<&Closure> {
        match self {
            Object::Closure(c) => Some(c),
            _ => None,
        }
    }

    /// The upvalue, if this is one.
    pub fn as_upvalue(&self) -> Option<&Upvalue> {
        match self {
            Object::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    /// Mutable version of `as_upvalue`.
    pub fn as_upvalue_mut(&mut self) -> Option<&mut Upvalue> {
        match self {
            Object::Upvalue(u) => Some(u),
            _ => None,
        }
    }
}
