//! Code generator types.
//!
//! `CGType` is the semantic type attached to every declared entity and every
//! expression during lowering. It is a tagged sum over the closed set of
//! shapes the compiler understands: the integer basics, pointers, arrays,
//! functions, records, enums and `va_list`. Records and enums are interned
//! in the `Records` table and referenced by index, so two uses of the same
//! tag share one definition.
//!
//! The target is a Z80: `char` and `_Bool` are one byte, `short` and `int`
//! two, `long` four, `long long` eight, and every pointer is two bytes.

use crate::records::{EnumRef, RecordRef, Records};
use core::fmt;

/// Address width of the target in bytes.
pub const PTR_SIZE: u64 = 2;

/// The integer kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IntKind {
    /// `char` (one byte).
    Char,
    /// `short`.
    Short,
    /// `int`.
    Int,
    /// `long`.
    Long,
    /// `long long`.
    LongLong,
    /// `_Bool`.
    Logical,
}

impl IntKind {
    /// Size of the kind in bytes.
    pub fn size(self) -> u64 {
        match self {
            Self::Char | Self::Logical => 1,
            Self::Short | Self::Int => 2,
            Self::Long => 4,
            Self::LongLong => 8,
        }
    }

    /// Conversion rank order, smallest first.
    pub fn rank(self) -> u8 {
        match self {
            Self::Logical => 0,
            Self::Char => 1,
            Self::Short => 2,
            Self::Int => 3,
            Self::Long => 4,
            Self::LongLong => 5,
        }
    }
}

/// Signed or unsigned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Signedness {
    Signed,
    Unsigned,
}

impl Signedness {
    /// Is this the unsigned variant?
    pub fn is_unsigned(self) -> bool {
        self == Self::Unsigned
    }
}

/// Type qualifiers carried on pointer targets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Quals {
    /// `const`
    pub constant: bool,
    /// `volatile`
    pub volatile: bool,
    /// `restrict`
    pub restrict: bool,
    /// `_Atomic`
    pub atomic: bool,
}

/// A function type.
#[derive(Clone, Debug, PartialEq)]
pub struct FuncType {
    /// Return type; `CGType::Void` for `void`.
    pub ret: CGType,
    /// Argument types in order.
    pub args: Vec<CGType>,
    /// Does the function take variable arguments?
    pub variadic: bool,
}

/// A code generator type.
#[derive(Clone, Debug, PartialEq)]
pub enum CGType {
    /// `void`.
    Void,
    /// An integer type.
    Basic {
        /// The integer kind.
        kind: IntKind,
        /// Signed or unsigned.
        sign: Signedness,
    },
    /// A pointer.
    Pointer {
        /// The pointed-to type.
        pointee: Box<CGType>,
        /// Qualifiers of the pointed-to type.
        quals: Quals,
    },
    /// An array.
    Array {
        /// Element count; `None` for an incomplete array.
        size: Option<u64>,
        /// Element type.
        elem: Box<CGType>,
    },
    /// A function type.
    Function(Box<FuncType>),
    /// A struct or union, by reference into the records table.
    Record(RecordRef),
    /// An enum, by reference into the records table.
    Enum(EnumRef),
    /// The variable-argument list type.
    VaList,
}

impl CGType {
    /// Shorthand for a signed `int`.
    pub fn int() -> Self {
        Self::Basic {
            kind: IntKind::Int,
            sign: Signedness::Signed,
        }
    }

    /// Shorthand for a signed `char`.
    pub fn char() -> Self {
        Self::Basic {
            kind: IntKind::Char,
            sign: Signedness::Signed,
        }
    }

    /// Shorthand for a pointer to `pointee` with no qualifiers.
    pub fn ptr_to(pointee: CGType) -> Self {
        Self::Pointer {
            pointee: Box::new(pointee),
            quals: Quals::default(),
        }
    }

    /// Is this any integer type (enums included)?
    pub fn is_integer(&self) -> bool {
        matches!(self, Self::Basic { .. } | Self::Enum(_))
    }

    /// Is this a pointer type?
    pub fn is_pointer(&self) -> bool {
        matches!(self, Self::Pointer { .. })
    }

    /// Is this an arithmetic or pointer type usable in a condition?
    pub fn is_scalar(&self) -> bool {
        self.is_integer() || self.is_pointer()
    }

    /// Size of the type in bytes, or `None` for types without a size
    /// (functions, `void`, incomplete arrays and records).
    pub fn size(&self, records: &Records) -> Option<u64> {
        match self {
            Self::Void | Self::Function(_) => None,
            Self::Basic { kind, .. } => Some(kind.size()),
            Self::Pointer { .. } => Some(PTR_SIZE),
            Self::Array { size, elem } => {
                let n = (*size)?;
                Some(n * elem.size(records)?)
            }
            Self::Record(r) => records.record_size(*r),
            Self::Enum(_) => Some(IntKind::Int.size()),
            Self::VaList => Some(PTR_SIZE),
        }
    }

    /// Width of the type in bits, for integers, enums and pointers.
    pub fn width_bits(&self, records: &Records) -> Option<u32> {
        match self {
            Self::Basic { .. } | Self::Enum(_) | Self::Pointer { .. } | Self::VaList => {
                Some(self.size(records)? as u32 * 8)
            }
            _ => None,
        }
    }

    /// The signedness of an integer type. Pointers and enums count as
    /// unsigned and signed respectively.
    pub fn signedness(&self) -> Signedness {
        match self {
            Self::Basic { sign, .. } => *sign,
            Self::Enum(_) => Signedness::Signed,
            _ => Signedness::Unsigned,
        }
    }

    /// Integer promotion: types of rank below `int` promote to `int`, or to
    /// `unsigned int` when `int` cannot represent every value (on this
    /// target: `unsigned short`). Other types are unchanged.
    pub fn promoted(&self) -> CGType {
        match self {
            Self::Basic { kind, sign } if kind.rank() < IntKind::Int.rank() => {
                let sign = if sign.is_unsigned() && kind.size() == IntKind::Int.size() {
                    Signedness::Unsigned
                } else {
                    Signedness::Signed
                };
                Self::Basic {
                    kind: IntKind::Int,
                    sign,
                }
            }
            Self::Enum(_) => CGType::int(),
            other => other.clone(),
        }
    }

    /// The common type of the usual arithmetic conversions: promote both
    /// operands, then the wider wins; at equal width unsigned wins.
    pub fn usual_arith(&self, other: &CGType) -> CGType {
        let a = self.promoted();
        let b = other.promoted();
        let (ak, asign) = match a {
            Self::Basic { kind, sign } => (kind, sign),
            _ => return a,
        };
        let (bk, bsign) = match b {
            Self::Basic { kind, sign } => (kind, sign),
            _ => return b,
        };
        if ak.rank() > bk.rank() {
            return Self::Basic {
                kind: ak,
                sign: if ak.size() == bk.size() && bsign.is_unsigned() {
                    Signedness::Unsigned
                } else {
                    asign
                },
            };
        }
        if bk.rank() > ak.rank() {
            return Self::Basic {
                kind: bk,
                sign: if ak.size() == bk.size() && asign.is_unsigned() {
                    Signedness::Unsigned
                } else {
                    bsign
                },
            };
        }
        Self::Basic {
            kind: ak,
            sign: if asign.is_unsigned() || bsign.is_unsigned() {
                Signedness::Unsigned
            } else {
                Signedness::Signed
            },
        }
    }

    /// Are the two types compatible for assignment and argument passing?
    ///
    /// This is structural equality with qualifiers ignored, plus the usual
    /// array-to-pointer adjustment on the right-hand side.
    pub fn compatible(&self, other: &CGType) -> bool {
        match (self, other) {
            (Self::Pointer { pointee: a, .. }, Self::Pointer { pointee: b, .. }) => {
                // `void *` converts to and from any object pointer.
                matches!(a.as_ref(), Self::Void)
                    || matches!(b.as_ref(), Self::Void)
                    || a.compatible(b)
            }
            (Self::Pointer { pointee, .. }, Self::Array { elem, .. }) => pointee.compatible(elem),
            (Self::Array { size: s1, elem: a }, Self::Array { size: s2, elem: b }) => {
                (s1 == s2 || s1.is_none() || s2.is_none()) && a.compatible(b)
            }
            (Self::Function(a), Self::Function(b)) => {
                a.variadic == b.variadic
                    && a.args.len() == b.args.len()
                    && a.ret.compatible(&b.ret)
                    && a.args.iter().zip(&b.args).all(|(x, y)| x.compatible(y))
            }
            (Self::Enum(a), Self::Enum(b)) => a == b,
            // An enum is freely interchangeable with `int`.
            (Self::Enum(_), Self::Basic { .. }) | (Self::Basic { .. }, Self::Enum(_)) => true,
            (a, b) => a == b,
        }
    }

    /// The array-to-pointer and function-to-pointer decay of an rvalue use.
    pub fn decayed(&self) -> CGType {
        match self {
            Self::Array { elem, .. } => Self::ptr_to((**elem).clone()),
            Self::Function(_) => Self::ptr_to(self.clone()),
            other => other.clone(),
        }
    }
}

impl fmt::Display for CGType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Void => write!(f, "void"),
            Self::Basic { kind, sign } => {
                if sign.is_unsigned() {
                    write!(f, "unsigned ")?;
                }
                match kind {
                    IntKind::Char => write!(f, "char"),
                    IntKind::Short => write!(f, "short"),
                    IntKind::Int => write!(f, "int"),
                    IntKind::Long => write!(f, "long"),
                    IntKind::LongLong => write!(f, "long long"),
                    IntKind::Logical => write!(f, "_Bool"),
                }
            }
            Self::Pointer { pointee, .. } => write!(f, "{} *", pointee),
            Self::Array { size: Some(n), elem } => write!(f, "{}[{}]", elem, n),
            Self::Array { size: None, elem } => write!(f, "{}[]", elem),
            Self::Function(ft) => {
                write!(f, "{} (", ft.ret)?;
                for (i, a) in ft.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                if ft.variadic {
                    if !ft.args.is_empty() {
                        write!(f, ", ")?;
                    }
                    write!(f, "...")?;
                }
                write!(f, ")")
            }
            Self::Record(r) => write!(f, "{}", r),
            Self::Enum(e) => write!(f, "{}", e),
            Self::VaList => write!(f, "va_list"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        let records = Records::new();
        assert_eq!(CGType::char().size(&records), Some(1));
        assert_eq!(CGType::int().size(&records), Some(2));
        let long = CGType::Basic {
            kind: IntKind::Long,
            sign: Signedness::Signed,
        };
        assert_eq!(long.size(&records), Some(4));
        assert_eq!(CGType::ptr_to(long.clone()).size(&records), Some(2));
        let arr = CGType::Array {
            size: Some(10),
            elem: Box::new(CGType::int()),
        };
        assert_eq!(arr.size(&records), Some(20));
        assert_eq!(CGType::Void.size(&records), None);
    }

    #[test]
    fn promotion() {
        let uchar = CGType::Basic {
            kind: IntKind::Char,
            sign: Signedness::Unsigned,
        };
        // unsigned char fits in int, so it promotes signed.
        assert_eq!(uchar.promoted(), CGType::int());
        // unsigned short is as wide as int, so it stays unsigned.
        let ushort = CGType::Basic {
            kind: IntKind::Short,
            sign: Signedness::Unsigned,
        };
        assert_eq!(
            ushort.promoted(),
            CGType::Basic {
                kind: IntKind::Int,
                sign: Signedness::Unsigned,
            }
        );
        let long = CGType::Basic {
            kind: IntKind::Long,
            sign: Signedness::Signed,
        };
        assert_eq!(long.promoted(), long);
    }

    #[test]
    fn usual_arithmetic_conversions() {
        let int = CGType::int();
        let uint = CGType::Basic {
            kind: IntKind::Int,
            sign: Signedness::Unsigned,
        };
        let long = CGType::Basic {
            kind: IntKind::Long,
            sign: Signedness::Signed,
        };
        assert_eq!(int.usual_arith(&uint), uint);
        assert_eq!(int.usual_arith(&long), long);
        assert_eq!(long.usual_arith(&uint), long);
        let schar = CGType::char();
        assert_eq!(schar.usual_arith(&schar), int);
    }

    #[test]
    fn compatibility() {
        let records = Records::new();
        let _ = &records;
        let ip = CGType::ptr_to(CGType::int());
        let vp = CGType::ptr_to(CGType::Void);
        assert!(ip.compatible(&vp));
        assert!(vp.compatible(&ip));
        let cp = CGType::ptr_to(CGType::char());
        assert!(!ip.compatible(&cp));
        let arr = CGType::Array {
            size: Some(4),
            elem: Box::new(CGType::int()),
        };
        assert!(ip.compatible(&arr));
    }

    #[test]
    fn decay() {
        let arr = CGType::Array {
            size: Some(4),
            elem: Box::new(CGType::char()),
        };
        assert_eq!(arr.decayed(), CGType::ptr_to(CGType::char()));
        assert_eq!(CGType::int().decayed(), CGType::int());
    }
}
