use super::value::{FromValue, IntoValue, Value};
use super::LuaContext;
use crate::errors::{ErrorData, LuaError};
use std::rc::Rc;

/// Chains deeper than this flatten into the array form, keeping `arg`
/// lookups from degrading quadratically when values are prepended one by
/// one.
const MAX_CHAIN_DEPTH: u8 = 5;

/// An ordered, immutable tuple of values: call arguments, return values,
/// and the payload a yield carries to `resume`.
///
/// Lookup by position, the count, and suffix extraction are all cheap on
/// every internal form, so no caller needs to normalise first.
#[derive(Clone, Debug, Default)]
pub struct Varargs {
    repr: Repr,
}

#[derive(Clone, Debug, Default)]
enum Repr {
    #[default]
    None,
    Single(Value),
    Pair(Value, Value),
    /// `values[start..]`, in order.
    Array { values: Rc<[Value]>, start: usize },
    /// A value prepended to another tuple.
    Chain {
        first: Box<Value>,
        rest: Rc<Varargs>,
        depth: u8,
    },
}

impl Varargs {
    pub fn pack<T: IntoArgs>(value: T, ctx: &mut LuaContext) -> Result<Varargs, LuaError> {
        T::into_args(value, ctx)
    }

    pub fn unpack<T: FromVarargs>(self, ctx: &mut LuaContext) -> Result<T, LuaError> {
        T::from_varargs(self, ctx)
    }

    /// Unpacks with argument-style errors: a mismatch at the `n`th value
    /// reports `bad argument #n`.
    pub fn unpack_args<T: FromArgs>(self, ctx: &mut LuaContext) -> Result<T, LuaError> {
        T::from_args(self, 1, ctx)
    }

    /// `position` is the argument position of the first remaining value;
    /// it starts at 1 and should be advanced for every value already
    /// taken.
    pub fn unpack_modified_args<T: FromArgs>(
        self,
        position: usize,
        ctx: &mut LuaContext,
    ) -> Result<T, LuaError> {
        T::from_args(self, position, ctx)
    }

    pub fn count(&self) -> usize {
        match &self.repr {
            Repr::None => 0,
            Repr::Single(_) => 1,
            Repr::Pair(..) => 2,
            Repr::Array { values, start } => values.len() - start,
            Repr::Chain { rest, .. } => 1 + rest.count(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self.repr, Repr::None) || self.count() == 0
    }

    /// The first value, nil when empty.
    #[inline]
    pub fn first(&self) -> Value {
        self.arg(1)
    }

    /// The value at 1-based `index`; out of range yields nil.
    pub fn arg(&self, index: usize) -> Value {
        if index == 0 {
            return Value::Nil;
        }

        match &self.repr {
            Repr::None => Value::Nil,
            Repr::Single(value) => {
                if index == 1 {
                    value.clone()
                } else {
                    Value::Nil
                }
            }
            Repr::Pair(first, second) => match index {
                1 => first.clone(),
                2 => second.clone(),
                _ => Value::Nil,
            },
            Repr::Array { values, start } => values
                .get(start + index - 1)
                .cloned()
                .unwrap_or(Value::Nil),
            Repr::Chain { first, rest, .. } => {
                if index == 1 {
                    (**first).clone()
                } else {
                    rest.arg(index - 1)
                }
            }
        }
    }

    /// The tuple starting at 1-based `index`: `subargs(1)` is the whole
    /// tuple.
    pub fn subargs(&self, index: usize) -> Varargs {
        if index <= 1 {
            return self.clone();
        }

        match &self.repr {
            Repr::None | Repr::Single(_) => Varargs::default(),
            Repr::Pair(_, second) => {
                if index == 2 {
                    Varargs::from(second.clone())
                } else {
                    Varargs::default()
                }
            }
            Repr::Array { values, start } => {
                let start = start + index - 1;

                if start >= values.len() {
                    Varargs::default()
                } else {
                    Varargs {
                        repr: Repr::Array {
                            values: values.clone(),
                            start,
                        },
                    }
                }
            }
            Repr::Chain { rest, .. } => rest.subargs(index - 1),
        }
    }

    /// Prepends a value. Flattens once the chain grows past its depth
    /// bound.
    pub fn push_front(&mut self, value: Value) {
        let repr = std::mem::take(&mut self.repr);

        self.repr = match repr {
            Repr::None => Repr::Single(value),
            Repr::Single(second) => Repr::Pair(value, second),
            repr => {
                let rest = Varargs { repr };
                let depth = match &rest.repr {
                    Repr::Chain { depth, .. } => depth + 1,
                    _ => 1,
                };

                if depth > MAX_CHAIN_DEPTH {
                    let mut values = Vec::with_capacity(rest.count() + 1);
                    values.push(value);
                    values.extend(rest.iter());

                    Repr::Array {
                        values: values.into(),
                        start: 0,
                    }
                } else {
                    Repr::Chain {
                        first: value.into(),
                        rest: Rc::new(rest),
                        depth,
                    }
                }
            }
        };
    }

    /// Takes the first value off the tuple, or `None` when it is spent.
    pub fn pop_front(&mut self) -> Option<Value> {
        let repr = std::mem::take(&mut self.repr);

        let (value, rest) = match repr {
            Repr::None => return None,
            Repr::Single(value) => (value, Repr::None),
            Repr::Pair(first, second) => (first, Repr::Single(second)),
            Repr::Array { values, start } => {
                let value = values.get(start).cloned()?;
                let start = start + 1;

                let rest = if start >= values.len() {
                    Repr::None
                } else {
                    Repr::Array { values, start }
                };

                (value, rest)
            }
            Repr::Chain { first, rest, .. } => ((*first).clone(), rest.as_ref().clone().repr),
        };

        self.repr = rest;
        Some(value)
    }

    pub fn iter(&self) -> VarargsIter<'_> {
        VarargsIter {
            varargs: self,
            index: 1,
        }
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.iter().collect()
    }
}

impl From<Value> for Varargs {
    fn from(value: Value) -> Self {
        Self {
            repr: Repr::Single(value),
        }
    }
}

impl From<Vec<Value>> for Varargs {
    fn from(mut values: Vec<Value>) -> Self {
        let repr = match values.len() {
            0 => Repr::None,
            1 => Repr::Single(values.pop().unwrap()),
            2 => {
                let second = values.pop().unwrap();
                Repr::Pair(values.pop().unwrap(), second)
            }
            _ => Repr::Array {
                values: values.into(),
                start: 0,
            },
        };

        Self { repr }
    }
}

impl FromIterator<Value> for Varargs {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        iter.into_iter().collect::<Vec<_>>().into()
    }
}

impl PartialEq for Varargs {
    fn eq(&self, other: &Self) -> bool {
        // forms are representation, not identity
        self.count() == other.count() && self.iter().eq(other.iter())
    }
}

pub struct VarargsIter<'a> {
    varargs: &'a Varargs,
    index: usize,
}

impl Iterator for VarargsIter<'_> {
    type Item = Value;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index > self.varargs.count() {
            return None;
        }

        let value = self.varargs.arg(self.index);
        self.index += 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.varargs.count() + 1).saturating_sub(self.index);
        (remaining, Some(remaining))
    }
}

pub trait IntoArgs {
    fn into_args(self, ctx: &mut LuaContext) -> Result<Varargs, LuaError>;
}

impl IntoArgs for Varargs {
    #[inline]
    fn into_args(self, _: &mut LuaContext) -> Result<Varargs, LuaError> {
        Ok(self)
    }
}

impl IntoArgs for () {
    #[inline]
    fn into_args(self, _: &mut LuaContext) -> Result<Varargs, LuaError> {
        Ok(Varargs::default())
    }
}

impl<T: IntoValue> IntoArgs for T {
    #[inline]
    fn into_args(self, ctx: &mut LuaContext) -> Result<Varargs, LuaError> {
        Ok(Varargs::from(self.into_value(ctx)?))
    }
}

macro_rules! impl_into_args {
    ($($name:ident)+) => (
        impl<$($name: IntoValue),*> IntoArgs for ($($name,)*) {
            #[allow(non_snake_case)]
            #[inline]
            fn into_args(self, ctx: &mut LuaContext) -> Result<Varargs, LuaError> {
                let ($($name,)*) = self;
                let values = vec![$($name.into_value(ctx)?,)*];
                Ok(values.into())
            }
        }
    );
}

impl_into_args! { A }
impl_into_args! { A B }
impl_into_args! { A B C }
impl_into_args! { A B C D }
impl_into_args! { A B C D E }
impl_into_args! { A B C D E F }
impl_into_args! { A B C D E F G }
impl_into_args! { A B C D E F G H }
impl_into_args! { A B C D E F G H I }
impl_into_args! { A B C D E F G H I J }
impl_into_args! { A B C D E F G H I J K }
impl_into_args! { A B C D E F G H I J K L }

pub trait FromVarargs: Sized {
    fn from_varargs(args: Varargs, ctx: &mut LuaContext) -> Result<Self, LuaError>;
}

impl FromVarargs for Varargs {
    #[inline]
    fn from_varargs(args: Varargs, _: &mut LuaContext) -> Result<Self, LuaError> {
        Ok(args)
    }
}

impl FromVarargs for () {
    #[inline]
    fn from_varargs(_: Varargs, _: &mut LuaContext) -> Result<Self, LuaError> {
        Ok(())
    }
}

impl<T: FromValue> FromVarargs for T {
    #[inline]
    fn from_varargs(mut args: Varargs, ctx: &mut LuaContext) -> Result<Self, LuaError> {
        T::from_value(args.pop_front().unwrap_or(Value::Nil), ctx)
    }
}

macro_rules! impl_from_varargs {
    ($last:ident $($name:ident)+) => (
        impl<$($name: FromValue,)* $last: FromVarargs> FromVarargs for ($($name,)* $last,) {
            #[allow(non_snake_case)]
            #[inline]
            fn from_varargs(mut args: Varargs, ctx: &mut LuaContext) -> Result<Self, LuaError> {
                $(let $name = $name::from_value(args.pop_front().unwrap_or(Value::Nil), ctx)?;)*
                let $last = $last::from_varargs(args, ctx)?;
                Ok(($($name,)* $last,))
            }
        }
    );
}

impl_from_varargs! { A B }
impl_from_varargs! { A B C }
impl_from_varargs! { A B C D }
impl_from_varargs! { A B C D E }
impl_from_varargs! { A B C D E F }
impl_from_varargs! { A B C D E F G }
impl_from_varargs! { A B C D E F G H }
impl_from_varargs! { A B C D E F G H I }
impl_from_varargs! { A B C D E F G H I J }
impl_from_varargs! { A B C D E F G H I J K }
impl_from_varargs! { A B C D E F G H I J K L }

/// [`FromValue`] with argument-error reporting, including the `__name`
/// substitution for tables that carry one.
pub trait FromArg: Sized {
    /// `position` is the argument position, starting at 1.
    fn from_arg(value: Value, position: usize, ctx: &mut LuaContext) -> Result<Self, LuaError>;
}

impl<T: FromValue> FromArg for T {
    fn from_arg(value: Value, position: usize, ctx: &mut LuaContext) -> Result<Self, LuaError> {
        let named = match &value {
            Value::Table(table_ref) => table_ref.metamethod_name(ctx),
            _ => None,
        };

        Self::from_value(value, ctx).map_err(|mut err| {
            if let (ErrorData::ExpectedType { expected, .. }, Some(name)) = (&err.data, named) {
                err.data = ErrorData::ExpectedTypeNamed {
                    expected: *expected,
                    received: name,
                };
            }

            LuaError::new_bad_argument(position, err)
        })
    }
}

pub trait FromArgs: Sized {
    /// `position` is the argument position of the first value, starting
    /// at 1, advanced for every value already taken.
    fn from_args(args: Varargs, position: usize, ctx: &mut LuaContext) -> Result<Self, LuaError>;
}

impl FromArgs for Varargs {
    #[inline]
    fn from_args(args: Varargs, _: usize, _: &mut LuaContext) -> Result<Self, LuaError> {
        Ok(args)
    }
}

impl FromArgs for () {
    #[inline]
    fn from_args(_: Varargs, _: usize, _: &mut LuaContext) -> Result<Self, LuaError> {
        Ok(())
    }
}

impl<T: FromArg> FromArgs for T {
    #[inline]
    fn from_args(
        mut args: Varargs,
        position: usize,
        ctx: &mut LuaContext,
    ) -> Result<Self, LuaError> {
        T::from_arg(args.pop_front().unwrap_or(Value::Nil), position, ctx)
    }
}

macro_rules! impl_from_args {
    ($last:ident $($name:ident)+) => (
        impl<$($name: FromArg,)* $last: FromArgs> FromArgs for ($($name,)* $last,) {
            #[allow(non_snake_case)]
            #[inline]
            fn from_args(
                mut args: Varargs,
                mut position: usize,
                ctx: &mut LuaContext,
            ) -> Result<Self, LuaError> {
                $(let $name =
                    $name::from_arg(args.pop_front().unwrap_or(Value::Nil), position, ctx)?;
                position += 1;)*

                let $last = $last::from_args(args, position, ctx)?;

                Ok(($($name,)* $last,))
            }
        }
    );
}

impl_from_args! { A B }
impl_from_args! { A B C }
impl_from_args! { A B C D }
impl_from_args! { A B C D E }
impl_from_args! { A B C D E F }
impl_from_args! { A B C D E F G }
impl_from_args! { A B C D E F G H }
impl_from_args! { A B C D E F G H I }
impl_from_args! { A B C D E F G H I J }
impl_from_args! { A B C D E F G H I J K }
impl_from_args! { A B C D E F G H I J K L }
