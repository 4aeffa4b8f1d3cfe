use super::byte_string::ByteString;
use super::heap::Heap;
use super::number::{float_to_string, parse_number};
use super::value_stack::StackValue;
use super::{CoroutineRef, FromVarargs, FunctionRef, IntoArgs, LuaContext, StringRef, TableRef};
use crate::errors::{ErrorData, LuaError};

/// The Lua name of a value's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeName {
    Nil,
    Bool,
    Number,
    String,
    Table,
    Function,
    Thread,
}

impl TypeName {
    pub(crate) const COUNT: usize = 7;

    pub fn as_str(self) -> &'static str {
        match self {
            TypeName::Nil => "nil",
            TypeName::Bool => "boolean",
            TypeName::Number => "number",
            TypeName::String => "string",
            TypeName::Table => "table",
            TypeName::Function => "function",
            TypeName::Thread => "thread",
        }
    }
}

impl std::fmt::Display for TypeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A Lua value as the host sees it: scalars by copy, heap values through
/// counted references that keep the object alive across sweeps.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    String(StringRef),
    Table(TableRef),
    Function(FunctionRef),
    Coroutine(CoroutineRef),
}

impl Eq for Value {}

impl Default for Value {
    #[inline]
    fn default() -> Self {
        Self::Nil
    }
}

impl Value {
    #[inline]
    pub fn type_name(&self) -> TypeName {
        match self {
            Value::Nil => TypeName::Nil,
            Value::Bool(_) => TypeName::Bool,
            Value::Number(_) => TypeName::Number,
            Value::String(_) => TypeName::String,
            Value::Table(_) => TypeName::Table,
            Value::Function(_) => TypeName::Function,
            Value::Coroutine(_) => TypeName::Thread,
        }
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    #[inline]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    #[inline]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[inline]
    pub fn as_string_ref(&self) -> Option<&StringRef> {
        if let Value::String(string_ref) = self {
            Some(string_ref)
        } else {
            None
        }
    }

    #[inline]
    pub fn as_table_ref(&self) -> Option<&TableRef> {
        if let Value::Table(table_ref) = self {
            Some(table_ref)
        } else {
            None
        }
    }

    #[inline]
    pub fn as_function_ref(&self) -> Option<&FunctionRef> {
        if let Value::Function(function_ref) = self {
            Some(function_ref)
        } else {
            None
        }
    }

    #[inline]
    pub fn as_coroutine_ref(&self) -> Option<&CoroutineRef> {
        if let Value::Coroutine(coroutine_ref) = self {
            Some(coroutine_ref)
        } else {
            None
        }
    }

    /// Calls the value, honouring `__call` chains, suspending with the
    /// caller when the callee yields.
    pub fn call<A: IntoArgs, R: FromVarargs>(
        &self,
        args: A,
        ctx: &mut LuaContext,
    ) -> Result<R, LuaError> {
        ctx.call_stack_value(self.to_stack_value(), args)
    }

    pub(crate) fn to_stack_value(&self) -> StackValue {
        match self {
            Value::Nil => StackValue::Nil,
            Value::Bool(b) => StackValue::Bool(*b),
            Value::Number(n) => StackValue::Number(*n),
            Value::String(string_ref) => StackValue::Bytes(string_ref.0.key()),
            Value::Table(table_ref) => StackValue::Table(table_ref.0.key()),
            Value::Function(function_ref) => function_ref.0.key().into(),
            Value::Coroutine(coroutine_ref) => StackValue::Coroutine(coroutine_ref.0.key()),
        }
    }

    pub(crate) fn from_stack_value(heap: &mut Heap, value: StackValue) -> Value {
        let value = value.get_deref(heap);

        match value {
            StackValue::Nil => Value::Nil,
            StackValue::Bool(b) => Value::Bool(b),
            StackValue::Number(n) => Value::Number(n),
            StackValue::Bytes(key) => Value::String(StringRef(heap.create_ref(key))),
            StackValue::Table(key) => Value::Table(TableRef(heap.create_ref(key))),
            StackValue::NativeFunction(key) => {
                Value::Function(FunctionRef(heap.create_ref(key.into())))
            }
            StackValue::Function(key) => Value::Function(FunctionRef(heap.create_ref(key.into()))),
            StackValue::Coroutine(key) => Value::Coroutine(CoroutineRef(heap.create_ref(key))),
            StackValue::Pointer(_) => {
                crate::debug_unreachable!();
                #[cfg(not(debug_assertions))]
                Value::Nil
            }
        }
    }

    pub(crate) fn test_validity(&self, heap: &Heap) -> Result<(), ErrorData> {
        let valid = match self.to_stack_value() {
            StackValue::Nil
            | StackValue::Bool(_)
            | StackValue::Number(_) => true,
            StackValue::Bytes(key) => heap.get_bytes(key).is_some(),
            StackValue::Table(key) => heap.get_table(key).is_some(),
            StackValue::NativeFunction(key) => heap.get_host_fn(key).is_some(),
            StackValue::Function(key) => heap.get_closure(key).is_some(),
            StackValue::Coroutine(key) => heap.get_coroutine(key).is_some(),
            StackValue::Pointer(key) => heap.get_cell(key).is_some(),
        };

        if valid {
            Ok(())
        } else {
            Err(ErrorData::InvalidRef)
        }
    }
}

/// Conversion out of the runtime, used by typed argument unpacking.
pub trait FromValue: Sized {
    fn from_value(value: Value, ctx: &mut LuaContext) -> Result<Self, LuaError>;
}

/// Conversion into the runtime, used by typed packing.
pub trait IntoValue {
    fn into_value(self, ctx: &mut LuaContext) -> Result<Value, LuaError>;
}

impl FromValue for Value {
    #[inline]
    fn from_value(value: Value, _: &mut LuaContext) -> Result<Self, LuaError> {
        Ok(value)
    }
}

impl IntoValue for Value {
    #[inline]
    fn into_value(self, _: &mut LuaContext) -> Result<Value, LuaError> {
        Ok(self)
    }
}

impl FromValue for bool {
    #[inline]
    fn from_value(value: Value, _: &mut LuaContext) -> Result<Self, LuaError> {
        // any value tests, the way conditions do
        Ok(value.is_truthy())
    }
}

impl IntoValue for bool {
    #[inline]
    fn into_value(self, _: &mut LuaContext) -> Result<Value, LuaError> {
        Ok(Value::Bool(self))
    }
}

fn expected_number(value: &Value) -> LuaError {
    ErrorData::ExpectedType {
        expected: TypeName::Number,
        received: value.type_name(),
    }
    .into()
}

impl FromValue for f64 {
    fn from_value(value: Value, ctx: &mut LuaContext) -> Result<Self, LuaError> {
        match &value {
            Value::Number(n) => Ok(*n),
            Value::String(string_ref) => {
                // numeric strings convert, like the language level coercion
                let bytes = string_ref.fetch(ctx)?;
                parse_number(bytes.as_bytes()).ok_or_else(|| expected_number(&value))
            }
            _ => Err(expected_number(&value)),
        }
    }
}

impl IntoValue for f64 {
    #[inline]
    fn into_value(self, _: &mut LuaContext) -> Result<Value, LuaError> {
        Ok(Value::Number(self))
    }
}

macro_rules! impl_number_conversion {
    ($($ty:ty)+) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: Value, ctx: &mut LuaContext) -> Result<Self, LuaError> {
                    let n = f64::from_value(value, ctx)?;
                    Ok(n as $ty)
                }
            }

            impl IntoValue for $ty {
                #[inline]
                fn into_value(self, _: &mut LuaContext) -> Result<Value, LuaError> {
                    Ok(Value::Number(self as f64))
                }
            }
        )+
    };
}

impl_number_conversion! { f32 i8 i16 i32 i64 u8 u16 u32 u64 usize isize }

impl FromValue for ByteString {
    fn from_value(value: Value, ctx: &mut LuaContext) -> Result<Self, LuaError> {
        match &value {
            Value::String(string_ref) => Ok(string_ref.fetch(ctx)?.clone()),
            // numbers convert to strings wherever strings are expected
            Value::Number(n) => Ok(float_to_string(*n).as_str().into()),
            _ => Err(ErrorData::ExpectedType {
                expected: TypeName::String,
                received: value.type_name(),
            }
            .into()),
        }
    }
}

impl IntoValue for ByteString {
    fn into_value(self, ctx: &mut LuaContext) -> Result<Value, LuaError> {
        Ok(Value::String(ctx.intern_byte_string(self)?))
    }
}

impl FromValue for String {
    fn from_value(value: Value, ctx: &mut LuaContext) -> Result<Self, LuaError> {
        let bytes = ByteString::from_value(value, ctx)?;
        Ok(bytes.to_string_lossy().into_owned())
    }
}

impl IntoValue for String {
    fn into_value(self, ctx: &mut LuaContext) -> Result<Value, LuaError> {
        Ok(Value::String(ctx.intern_string(self.as_bytes())?))
    }
}

impl IntoValue for &str {
    fn into_value(self, ctx: &mut LuaContext) -> Result<Value, LuaError> {
        Ok(Value::String(ctx.intern_string(self.as_bytes())?))
    }
}

impl IntoValue for &[u8] {
    fn into_value(self, ctx: &mut LuaContext) -> Result<Value, LuaError> {
        Ok(Value::String(ctx.intern_string(self)?))
    }
}

macro_rules! impl_ref_conversion {
    ($ty:ident, $variant:ident, $expected:expr) => {
        impl FromValue for $ty {
            fn from_value(value: Value, _: &mut LuaContext) -> Result<Self, LuaError> {
                match value {
                    Value::$variant(inner) => Ok(inner),
                    _ => Err(ErrorData::ExpectedType {
                        expected: $expected,
                        received: value.type_name(),
                    }
                    .into()),
                }
            }
        }

        impl IntoValue for $ty {
            #[inline]
            fn into_value(self, _: &mut LuaContext) -> Result<Value, LuaError> {
                Ok(Value::$variant(self))
            }
        }
    };
}

impl_ref_conversion!(StringRef, String, TypeName::String);
impl_ref_conversion!(TableRef, Table, TypeName::Table);
impl_ref_conversion!(FunctionRef, Function, TypeName::Function);
impl_ref_conversion!(CoroutineRef, Coroutine, TypeName::Thread);

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value, ctx: &mut LuaContext) -> Result<Self, LuaError> {
        if value.is_nil() {
            Ok(None)
        } else {
            T::from_value(value, ctx).map(Some)
        }
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self, ctx: &mut LuaContext) -> Result<Value, LuaError> {
        match self {
            Some(value) => value.into_value(ctx),
            None => Ok(Value::Nil),
        }
    }
}
