//! Functions module: defines built-in and user-defined filter functions.
//!
//! This module provides the FilterFunction trait, the registry the parser
//! resolves function names against, and the built-in functions.

use crate::ftypes::{FValue, FieldType, StringRepr};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// What the checker knows about one argument of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionParam {
    pub ftype: FieldType,
    /// Written as a literal rather than a field, slice or call.
    pub literal: bool,
}

pub trait FilterFunction: Send + Sync {
    fn min_args(&self) -> usize;

    fn max_args(&self) -> usize;

    /// Validates the argument types and returns the type of the result.
    fn check(&self, params: &[FunctionParam]) -> Result<FieldType, String>;

    /// Runs the function over the values of each argument register.
    /// `None` means no result, which makes the enclosing test false.
    fn call(&self, args: &[&[FValue]]) -> Option<Vec<FValue>>;
}

/// A resolved function, as stored in syntax trees and instructions.
#[derive(Clone)]
pub struct FunctionRef {
    name: String,
    func: Arc<dyn FilterFunction>,
}

impl FunctionRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function(&self) -> &dyn FilterFunction {
        self.func.as_ref()
    }
}

impl PartialEq for FunctionRef {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl fmt::Debug for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FunctionRef({})", self.name)
    }
}

#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn FilterFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        register_builtins(&mut reg);
        reg
    }

    pub fn register<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: FilterFunction + 'static,
    {
        self.functions.insert(name.into(), Arc::new(func));
    }

    pub fn get(&self, name: &str) -> Option<FunctionRef> {
        self.functions.get(name).map(|func| FunctionRef {
            name: name.to_string(),
            func: Arc::clone(func),
        })
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

fn require_field(name: &str, params: &[FunctionParam]) -> Result<(), String> {
    if params.iter().any(|p| p.literal) {
        return Err(format!("Only fields can be used as parameter for {}()", name));
    }
    Ok(())
}

fn extreme(args: &[&[FValue]], wanted: Ordering) -> Option<Vec<FValue>> {
    let mut best: Option<&FValue> = None;
    for value in args.iter().flat_map(|values| values.iter()) {
        best = match best {
            Some(current) if value.compare(current) != Some(wanted) => Some(current),
            _ => Some(value),
        };
    }
    best.map(|v| vec![v.clone()])
}

fn check_extreme(name: &str, params: &[FunctionParam]) -> Result<FieldType, String> {
    let first = params
        .first()
        .ok_or_else(|| format!("Function {} needs at least 1 argument", name))?
        .ftype;
    for param in params {
        if !param.ftype.is_numeric() || !param.ftype.is_compatible(first) {
            return Err(format!(
                "Argument of type {} is not valid for {}()",
                param.ftype, name
            ));
        }
    }
    Ok(first)
}

macro_rules! builtin_functions {
    ($( $ty:ident: $name:expr, args($min:expr, $max:expr),
        check($params:ident) => $check:block,
        call($args:ident) => $body:block ),* $(,)?) => {
        $(
            pub struct $ty;
            impl FilterFunction for $ty {
                fn min_args(&self) -> usize { $min }
                fn max_args(&self) -> usize { $max }
                fn check(&self, $params: &[FunctionParam]) -> Result<FieldType, String> $check
                fn call(&self, $args: &[&[FValue]]) -> Option<Vec<FValue>> $body
            }
        )*
        pub fn register_builtins(reg: &mut FunctionRegistry) {
            $(reg.register($name, $ty);)*
        }
    };
}

builtin_functions! {
    UpperFunction: "upper", args(1, 1),
    check(params) => {
        require_field("upper", params)?;
        match params[0].ftype {
            FieldType::String => Ok(FieldType::String),
            _ => Err("Only string type fields can be used as parameter for upper()".to_string()),
        }
    },
    call(args) => {
        let values: Vec<FValue> = args.first()?
            .iter()
            .filter_map(|v| match v {
                FValue::String(s) => Some(FValue::String(s.to_uppercase())),
                _ => None,
            })
            .collect();
        (!values.is_empty()).then_some(values)
    },
    LowerFunction: "lower", args(1, 1),
    check(params) => {
        require_field("lower", params)?;
        match params[0].ftype {
            FieldType::String => Ok(FieldType::String),
            _ => Err("Only string type fields can be used as parameter for lower()".to_string()),
        }
    },
    call(args) => {
        let values: Vec<FValue> = args.first()?
            .iter()
            .filter_map(|v| match v {
                FValue::String(s) => Some(FValue::String(s.to_lowercase())),
                _ => None,
            })
            .collect();
        (!values.is_empty()).then_some(values)
    },
    LenFunction: "len", args(1, 1),
    check(params) => {
        require_field("len", params)?;
        Ok(FieldType::UInt32)
    },
    call(args) => {
        let values: Vec<FValue> = args.first()?
            .iter()
            .map(|v| FValue::Unsigned(FieldType::UInt32, v.byte_length() as u64))
            .collect();
        (!values.is_empty()).then_some(values)
    },
    CountFunction: "count", args(1, 1),
    check(params) => {
        require_field("count", params)?;
        Ok(FieldType::UInt32)
    },
    call(args) => {
        let count = args.first().map_or(0, |values| values.len());
        Some(vec![FValue::Unsigned(FieldType::UInt32, count as u64)])
    },
    StringFunction: "string", args(1, 1),
    check(params) => {
        require_field("string", params)?;
        match params[0].ftype {
            FieldType::Protocol | FieldType::Pcre => Err(format!(
                "Field of type {} cannot be converted to a string",
                params[0].ftype
            )),
            _ => Ok(FieldType::String),
        }
    },
    call(args) => {
        let values: Vec<FValue> = args.first()?
            .iter()
            .filter_map(|v| match v {
                FValue::String(_) => Some(v.clone()),
                other => other.to_string_repr(StringRepr::Display).map(FValue::String),
            })
            .collect();
        (!values.is_empty()).then_some(values)
    },
    MaxFunction: "max", args(1, usize::MAX),
    check(params) => { check_extreme("max", params) },
    call(args) => { extreme(args, Ordering::Greater) },
    MinFunction: "min", args(1, usize::MAX),
    check(params) => { check_extreme("min", params) },
    call(args) => { extreme(args, Ordering::Less) },
    AbsFunction: "abs", args(1, 1),
    check(params) => {
        let ftype = params[0].ftype;
        if ftype.is_numeric() {
            Ok(ftype)
        } else {
            Err(format!("Argument of type {} is not valid for abs()", ftype))
        }
    },
    call(args) => {
        let values: Vec<FValue> = args.first()?
            .iter()
            .filter_map(|v| match v {
                FValue::Signed(ft, n) => Some(FValue::Signed(*ft, n.saturating_abs())),
                FValue::Double(d) => Some(FValue::Double(d.abs())),
                FValue::Unsigned(..) => Some(v.clone()),
                _ => None,
            })
            .collect();
        (!values.is_empty()).then_some(values)
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(ftype: FieldType) -> FunctionParam {
        FunctionParam {
            ftype,
            literal: false,
        }
    }

    fn u16v(n: u64) -> FValue {
        FValue::Unsigned(FieldType::UInt16, n)
    }

    #[test]
    fn test_register_and_lookup() {
        let mut reg = FunctionRegistry::new();
        assert!(reg.get("len").is_none());
        reg.register("len", LenFunction);
        let len = reg.get("len").unwrap();
        assert_eq!(len.name(), "len");
        let values = [FValue::String("abc".into())];
        assert_eq!(
            len.function().call(&[&values]),
            Some(vec![FValue::Unsigned(FieldType::UInt32, 3)])
        );
    }

    #[test]
    fn test_builtins_registered() {
        let reg = FunctionRegistry::with_builtins();
        assert_eq!(
            reg.names(),
            vec!["abs", "count", "len", "lower", "max", "min", "string", "upper"]
        );
    }

    #[test]
    fn test_upper_function() {
        let values = [FValue::String("hello".into()), FValue::String("World".into())];
        assert_eq!(
            UpperFunction.call(&[&values]),
            Some(vec![FValue::String("HELLO".into()), FValue::String("WORLD".into())])
        );
        assert_eq!(UpperFunction.call(&[&[]]), None);
        assert!(UpperFunction.check(&[field(FieldType::String)]).is_ok());
        assert!(UpperFunction.check(&[field(FieldType::UInt8)]).is_err());
        let literal = FunctionParam {
            ftype: FieldType::String,
            literal: true,
        };
        assert_eq!(
            UpperFunction.check(&[literal]).unwrap_err(),
            "Only fields can be used as parameter for upper()"
        );
    }

    #[test]
    fn test_count_function() {
        assert_eq!(
            CountFunction.call(&[&[]]),
            Some(vec![FValue::Unsigned(FieldType::UInt32, 0)])
        );
        let values = [u16v(1), u16v(2)];
        assert_eq!(
            CountFunction.call(&[&values]),
            Some(vec![FValue::Unsigned(FieldType::UInt32, 2)])
        );
    }

    #[test]
    fn test_max_min_functions() {
        let a = [u16v(10), u16v(70)];
        let b = [u16v(30)];
        assert_eq!(MaxFunction.call(&[&a, &b]), Some(vec![u16v(70)]));
        assert_eq!(MinFunction.call(&[&a, &b]), Some(vec![u16v(10)]));
        assert_eq!(MaxFunction.call(&[&[], &[]]), None);
        assert_eq!(
            MaxFunction.check(&[field(FieldType::UInt16), field(FieldType::UInt32)]),
            Ok(FieldType::UInt16)
        );
        assert!(MaxFunction
            .check(&[field(FieldType::UInt16), field(FieldType::Int16)])
            .is_err());
        assert!(MinFunction.check(&[field(FieldType::String)]).is_err());
    }

    #[test]
    fn test_abs_and_string_functions() {
        let values = [FValue::Signed(FieldType::Int32, -5), FValue::Double(-1.5)];
        assert_eq!(
            AbsFunction.call(&[&values]),
            Some(vec![FValue::Signed(FieldType::Int32, 5), FValue::Double(1.5)])
        );
        let ports = [u16v(80)];
        assert_eq!(
            StringFunction.call(&[&ports]),
            Some(vec![FValue::String("80".into())])
        );
        assert!(StringFunction.check(&[field(FieldType::Protocol)]).is_err());
    }
}
