// heap is our internal interface for allocating Lox objects. It does not collect garbage: objects are
// created by the `new_*` methods and released by `free_object`, or all at once when the VM shuts down.
//
// The entry point is the `Heap` type. Its `new_*` methods return a `Handle`, and the object behind it is
// reached with `get`/`get_mut` or the typed accessors (`string`, `function`, ...). Handles are plain
// indices into an `Arena`, so using one after it was freed is a reported `HeapError`, not UB and not a
// silent success.
//
// ```rust
//    use loxbc::vm::heap::Heap;
//    let mut heap = Heap::new();
//    let a = heap.intern("my string");
//    let b = heap.intern("my string");
//    assert_eq!(a, b);
//    assert_eq!(heap.string(a).unwrap(), "my string");
// ```

use std::collections::HashMap;

use thiserror::Error;

use super::arena::{Arena, Handle, HeapError, SweepOutcome};
use super::object::{Closure, Function, NativeFunction, Object, ObjectKind, Upvalue};
use super::value::{format_number, Value};

/// Failure to get at an object of the expected kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ObjectError {
    /// The handle itself is bad.
    #[error(transparent)]
    Heap(#[from] HeapError),
    /// The handle is live, but holds a different kind of object.
    #[error("expected a {expected} at {handle}, found a {found}")]
    WrongKind {
        /// The handle that was looked up.
        handle: Handle,
        /// What the caller asked for.
        expected: ObjectKind,
        /// What was actually there.
        found: ObjectKind,
    },
}

#[derive(Debug)]
/// A type for allocating and tracking heap-allocated Lox objects.
pub struct Heap {
    objects: Arena<Object>,
    // Every live string object is in here, and nothing else is. That is what lets Value equality
    // compare strings by handle.
    strings: HashMap<String, Handle>,
}

impl Heap {
    /// A new, empty heap.
    pub fn new() -> Heap {
        Heap {
            objects: Arena::new(),
            strings: HashMap::new(),
        }
    }

    /// The canonical string object with this content, allocating it if it doesn't exist yet.
    pub fn intern(&mut self, value: &str) -> Handle {
        if let Some(&handle) = self.strings.get(value) {
            return handle;
        }
        self.insert_string(value.to_string())
    }

    /// Same as `intern`, but takes ownership, which saves a copy when the string is new.
    pub fn take_string(&mut self, value: String) -> Handle {
        if let Some(&handle) = self.strings.get(&value) {
            return handle;
        }
        self.insert_string(value)
    }

    fn insert_string(&mut self, value: String) -> Handle {
        let handle = self.objects.alloc(Object::String(value.clone()));
        self.strings.insert(value, handle);
        handle
    }

    /// Allocate a compiled function.
    pub fn new_function(&mut self, function: Function) -> Handle {
        self.objects.alloc(Object::Function(function))
    }

    /// Allocate a host function.
    pub fn new_native(&mut self, function: NativeFunction) -> Handle {
        self.objects.alloc(Object::NativeFunction(function))
    }

    /// Allocate a closure over `function`, one upvalue handle per captured variable.
    pub fn new_closure(&mut self, function: Handle, upvalues: Vec<Handle>) -> Handle {
        self.objects
            .alloc(Object::Closure(Closure { function, upvalues }))
    }

    /// Allocate an upvalue cell.
    pub fn new_upvalue(&mut self, upvalue: Upvalue) -> Handle {
        self.objects.alloc(Object::Upvalue(upvalue))
    }

    /// The object behind a handle, of whatever kind.
    pub fn get(&self, handle: Handle) -> Result<&Object, HeapError> {
        self.objects.deref(handle)
    }

    /// Mutable version of `get`.
    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut Object, HeapError> {
        self.objects.deref_mut(handle)
    }

    fn wrong_kind(handle: Handle, expected: ObjectKind, found: &Object) -> ObjectError {
        ObjectError::WrongKind {
            handle,
            expected,
            found: found.kind(),
        }
    }

    /// The contents of a string object.
    pub fn string(&self, handle: Handle) -> Result<&str, ObjectError> {
        let obj = self.get(handle)?;
        obj.as_string()
            .ok_or_else(|| Self::wrong_kind(handle, ObjectKind::String, obj))
    }

    /// A function object.
    pub fn function(&self, handle: Handle) -> Result<&Function, ObjectError> {
        let obj = self.get(handle)?;
        obj.as_function()
            .ok_or_else(|| Self::wrong_kind(handle, ObjectKind::Function, obj))
    }

    /// A closure object.
    pub fn closure(&self, handle: Handle) -> Result<&Closure, ObjectError> {
        let obj = self.get(handle)?;
        obj.as_closure()
            .ok_or_else(|| Self::wrong_kind(handle, ObjectKind::Closure, obj))
    }

    /// An upvalue object.
    pub fn upvalue(&self, handle: Handle) -> Result<&Upvalue, ObjectError> {
        let obj = self.get(handle)?;
        obj.as_upvalue()
            .ok_or_else(|| Self::wrong_kind(handle, ObjectKind::Upvalue, obj))
    }

    /// Mutable version of `upvalue`.
    pub fn upvalue_mut(&mut self, handle: Handle) -> Result<&mut Upvalue, ObjectError> {
        let obj = self.get_mut(handle)?;
        let found = obj.kind();
        obj.as_upvalue_mut().ok_or(ObjectError::WrongKind {
            handle,
            expected: ObjectKind::Upvalue,
            found,
        })
    }

    /// The name of a function, or None for the top-level script.
    pub fn function_name(&self, function: &Function) -> Result<Option<&str>, ObjectError> {
        function.name.map(|name| self.string(name)).transpose()
    }

    /// Release one object, along with what it owns: a function's chunk, a closure's upvalue list.
    /// Freeing a string also drops it from the intern table, so the content can be interned afresh.
    pub fn free_object(&mut self, handle: Handle) -> Result<(), HeapError> {
        let object = match self.objects.deref_mut(handle) {
            Err(HeapError::UseAfterFree(h)) => return Err(HeapError::DoubleFree(h)),
            other => other?,
        };
        match object {
            Object::String(s) => {
                let content = std::mem::take(s);
                self.strings.remove(&content);
            }
            Object::Function(f) => f.chunk.free(),
            Object::Closure(c) => c.upvalues = Vec::new(),
            Object::NativeFunction(_) | Object::Upvalue(_) => {}
        }
        self.objects.free(handle)
    }

    /// Free every interned string.
    pub fn free_strings(&mut self) -> Result<(), HeapError> {
        for (_, handle) in self.strings.drain() {
            self.objects.free(handle)?;
        }
        Ok(())
    }

    /// Tear the heap down, logging each object as either leaked-but-live or already freed.
    /// Every outstanding handle is invalid afterwards.
    pub fn sweep(&mut self) -> Vec<(Handle, SweepOutcome)> {
        self.strings.clear();
        self.objects.sweep()
    }

    /// Number of objects allocated and not yet freed.
    pub fn live_count(&self) -> usize {
        self.objects.live_count()
    }

    /// Render a value the way `print` shows it.
    pub fn format_value(&self, value: Value) -> Result<String, ObjectError> {
        Ok(match value {
            Value::Number(n) => format_number(n),
            Value::Boolean(b) => b.to_string(),
            Value::Nil => "nil".to_string(),
            Value::Object(handle) => match self.get(handle)? {
                Object::String(s) => s.clone(),
                Object::Function(f) => self.format_function(f)?,
                Object::Closure(c) => self.format_function(self.function(c.function)?)?,
                Object::NativeFunction(_) => "<native fn>".to_string(),
                Object::Upvalue(_) => "upvalue".to_string(),
            },
        })
    }

    fn format_function(&self, function: &Function) -> Result<String, ObjectError> {
        Ok(match self.function_name(function)? {
            Some(name) => format!("<fn {}>", name),
            None => "<script>".to_string(),
        })
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
