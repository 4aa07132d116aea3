//! IR-level types and symbol-table entries.
//!
//! The source language's type system (classes, multi-dimensional arrays,
//! strings) is erased by the front end; what reaches the core is `i32`,
//! `i1`, `ptr` and `void`, plus class layouts that give member offsets and
//! function signatures that give arities and effect information.

use std::fmt;

/// The four types the middle and back end distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrType {
    I32,
    I1,
    Ptr,
    Void,
}

impl IrType {
    pub fn from_str(s: &str) -> Option<IrType> {
        match s {
            "i32" => Some(IrType::I32),
            "i1" => Some(IrType::I1),
            "ptr" => Some(IrType::Ptr),
            "void" => Some(IrType::Void),
            _ => None,
        }
    }
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IrType::I32 => "i32",
            IrType::I1 => "i1",
            IrType::Ptr => "ptr",
            IrType::Void => "void",
        })
    }
}

/// Name of the internal two-word record used for multi-dimensional arrays:
/// an element pointer plus a size, accessed via `getelementptr` members.
pub const ARRAY_RECORD: &str = "%.arr";

/// A class lowered to a contiguous record of 4-byte fields.
///
/// Member names are erased; `getelementptr` addresses fields by index, and
/// the offset is always `index * 4`.
#[derive(Debug, Clone)]
pub struct ClassLayout {
    pub name: String,
    pub members: Vec<IrType>,
}

impl ClassLayout {
    pub fn size(&self) -> i32 {
        self.members.len() as i32 * 4
    }

    /// The internal `%.arr = {ptr, i32}` record.
    pub fn array_record() -> ClassLayout {
        ClassLayout { name: ARRAY_RECORD.to_string(), members: vec![IrType::Ptr, IrType::I32] }
    }
}

/// A function signature as the core sees it: name, arity, return type and
/// whether an unused result makes a call to it dead.
#[derive(Debug, Clone)]
pub struct FunctionSig {
    pub name: String,
    pub params: Vec<IrType>,
    pub ret: IrType,
    pub no_effect: bool,
}

impl FunctionSig {
    pub fn new(name: &str, params: Vec<IrType>, ret: IrType, no_effect: bool) -> FunctionSig {
        FunctionSig { name: name.to_string(), params, ret, no_effect }
    }
}

/// The runtime library's entry points. The blob in `runtime/builtin.s`
/// provides these symbols; the core only ever emits calls to them.
pub fn builtin_signatures() -> Vec<FunctionSig> {
    use IrType::*;
    vec![
        FunctionSig::new("@malloc", vec![I32], Ptr, true),
        FunctionSig::new("@string.add", vec![Ptr, Ptr], Ptr, true),
        FunctionSig::new("@string.eq", vec![Ptr, Ptr], I1, true),
        FunctionSig::new("@string.ne", vec![Ptr, Ptr], I1, true),
        FunctionSig::new("@string.lt", vec![Ptr, Ptr], I1, true),
        FunctionSig::new("@string.le", vec![Ptr, Ptr], I1, true),
        FunctionSig::new("@string.gt", vec![Ptr, Ptr], I1, true),
        FunctionSig::new("@string.ge", vec![Ptr, Ptr], I1, true),
        FunctionSig::new("@string.length", vec![Ptr], I32, true),
        FunctionSig::new("@string.substring", vec![Ptr, I32, I32], Ptr, true),
        FunctionSig::new("@string.parseInt", vec![Ptr], I32, true),
        FunctionSig::new("@string.ord", vec![Ptr, I32], I32, true),
        FunctionSig::new("@print", vec![Ptr], Void, false),
        FunctionSig::new("@println", vec![Ptr], Void, false),
        FunctionSig::new("@printInt", vec![I32], Void, false),
        FunctionSig::new("@printlnInt", vec![I32], Void, false),
        FunctionSig::new("@getString", vec![], Ptr, false),
        FunctionSig::new("@getInt", vec![], I32, false),
        FunctionSig::new("@toString", vec![I32], Ptr, true),
    ]
}

/// Resolve an array-constructor symbol of the form
/// `@__new_<elem>_<n>d_array__`, which takes one `i32` extent per dimension
/// and returns the outermost element pointer.
pub fn array_ctor_signature(name: &str) -> Option<FunctionSig> {
    let body = name.strip_prefix("@__new_")?.strip_suffix("_array__")?;
    let (elem, dims) = body.rsplit_once('_')?;
    if !matches!(elem, "int" | "bool" | "ptr") {
        return None;
    }
    let n: usize = dims.strip_suffix('d')?.parse().ok()?;
    if n == 0 || n > 8 {
        return None;
    }
    Some(FunctionSig::new(name, vec![IrType::I32; n], IrType::Ptr, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_ctor_names() {
        let sig = array_ctor_signature("@__new_int_1d_array__").unwrap();
        assert_eq!(sig.params.len(), 1);
        assert_eq!(sig.ret, IrType::Ptr);
        assert!(sig.no_effect);

        let sig = array_ctor_signature("@__new_ptr_3d_array__").unwrap();
        assert_eq!(sig.params.len(), 3);

        assert!(array_ctor_signature("@__new_str_1d_array__").is_none());
        assert!(array_ctor_signature("@__new_int_0d_array__").is_none());
        assert!(array_ctor_signature("@malloc").is_none());
    }

    #[test]
    fn test_class_layout_size() {
        let c = ClassLayout { name: "%class.P".to_string(), members: vec![IrType::I32, IrType::I32] };
        assert_eq!(c.size(), 8);
        assert_eq!(ClassLayout::array_record().size(), 8);
    }
}
