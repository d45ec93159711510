use super::arena::Handle;

/// VM-internal representation of a Lox value.
///
/// Values are small and `Copy`; anything bigger lives on the heap and is referred to by handle.
/// Equality is derived: numbers and booleans compare by value, objects by handle identity. That is the
/// right thing for strings too, since every distinct string content is interned to a single handle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// Lox has a single 'number' base type, backed by f64.
    /// Even though pos/neg infinity and NaN are allowed, we make no guarantees about how they work.
    Number(f64),
    /// Boolean backed by Rust bool,
    Boolean(bool),
    /// Nil is a type and a value in Lox.
    Nil,
    /// Object is a heap-allocated value
    Object(Handle),
}

impl Value {
    /// The number inside, if this is a number.
    pub fn as_number(&self) -> Option<f64> {
        if let Value::Number(f) = self {
            Some(*f)
        } else {
            None
        }
    }

    /// The handle inside, if this is an object.
    pub fn as_object(&self) -> Option<Handle> {
        if let Value::Object(h) = self {
            Some(*h)
        } else {
            None
        }
    }

    /// Only nil and false are falsey.
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil | Value::Boolean(false))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Number(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<Handle> for Value {
    fn from(h: Handle) -> Self {
        Value::Object(h)
    }
}

/// Render a number the way Lox prints it: the shortest decimal that round-trips, with no trailing
/// `.0` on integers. Magnitudes of 1e21 and up, or below 1e-6, switch to exponent form (`1e+21`,
/// `1.5e-7`).
pub fn format_number(n: f64) -> String {
    let magnitude = n.abs();
    if !n.is_finite() || n == 0.0 || (1e-6..1e21).contains(&magnitude) {
        // f64's Display already picks the shortest round-tripping form.
        return format!("{}", n);
    }
    // So does LowerExp, but it leaves the sign off positive exponents.
    let exp = format!("{:e}", n);
    match exp.split_once('e') {
        Some((mantissa, power)) if !power.starts_with('-') => format!("{}e+{}", mantissa, power),
        _ => exp,
    }
}
