//! Record and enum definitions.
//!
//! Records (structs and unions) are interned by tag: the first mention of
//! `struct S` creates a definition, later mentions share it, and a forward
//! declaration is a definition whose member list is filled in place when the
//! body is finally seen. Anonymous records get a synthesised, stable IR
//! identifier.
//!
//! A record is laid out as an ordered list of *elements* backed by an
//! ordered list of *storage units*. A plain field owns its storage unit
//! outright. Consecutive bit fields share a storage unit typed as their
//! declared underlying integer, each remembering its bit position inside the
//! unit. In a union every element starts a unit of its own and all units
//! begin at offset zero.

use crate::types::CGType;
use cranelift_entity::{entity_impl, PrimaryMap};

/// An opaque reference to an interned record definition.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordRef(u32);
entity_impl!(RecordRef, "record");

/// An opaque reference to an interned enum definition.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnumRef(u32);
entity_impl!(EnumRef, "enum");

/// Struct versus union.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum RecKind {
    Struct,
    Union,
}

/// One element (field) of a record.
#[derive(Clone, Debug)]
pub struct RecordElement {
    /// Field name.
    pub name: String,
    /// Bit width for a bit field, 0 for a plain field.
    pub bit_width: u32,
    /// Bit position within the storage unit (0 for plain fields).
    pub bit_pos: u32,
    /// The declared type of the element.
    pub ty: CGType,
    /// Index of the backing storage unit in `RecordDef::units`.
    pub unit: usize,
}

impl RecordElement {
    /// Is this a bit field?
    pub fn is_bitfield(&self) -> bool {
        self.bit_width != 0
    }
}

/// One storage unit backing record elements.
#[derive(Clone, Debug)]
pub struct StorageUnit {
    /// Stable IR identifier of the unit within its record.
    pub irident: String,
    /// The unit's type: the element type for a plain field, the declared
    /// underlying integer type for bit fields.
    pub ty: CGType,
}

/// A record definition.
#[derive(Clone, Debug)]
pub struct RecordDef {
    /// Struct or union.
    pub kind: RecKind,
    /// C tag, when the record is named.
    pub cident: Option<String>,
    /// Stable IR identifier (synthesised for anonymous records).
    pub irident: String,
    /// Elements in declaration order.
    pub elements: Vec<RecordElement>,
    /// Storage units in layout order.
    pub units: Vec<StorageUnit>,
    /// False while only forward-declared.
    pub complete: bool,
}

impl RecordDef {
    /// Find an element by name.
    pub fn element(&self, name: &str) -> Option<&RecordElement> {
        self.elements.iter().find(|e| e.name == name)
    }
}

/// An enum definition.
#[derive(Clone, Debug)]
pub struct EnumDef {
    /// C tag, when the enum is named.
    pub cident: Option<String>,
    /// Stable IR identifier.
    pub irident: String,
    /// Enumerators with their values, in declaration order.
    pub elems: Vec<(String, i64)>,
    /// False while only forward-declared.
    pub complete: bool,
}

/// The interning table for records and enums of one translation unit.
#[derive(Debug, Default)]
pub struct Records {
    /// All record definitions.
    pub recs: PrimaryMap<RecordRef, RecordDef>,
    /// All enum definitions.
    pub enums: PrimaryMap<EnumRef, EnumDef>,
    next_anon: u32,
}

impl Records {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn synth_ident(&mut self, prefix: &str, cident: Option<&str>) -> String {
        match cident {
            Some(name) => format!("{}.{}", prefix, name),
            None => {
                self.next_anon += 1;
                format!("{}.anon.{}", prefix, self.next_anon)
            }
        }
    }

    /// Create a new, initially incomplete record definition.
    pub fn declare_record(&mut self, kind: RecKind, cident: Option<&str>) -> RecordRef {
        let prefix = match kind {
            RecKind::Struct => "struct",
            RecKind::Union => "union",
        };
        let irident = self.synth_ident(prefix, cident);
        self.recs.push(RecordDef {
            kind,
            cident: cident.map(str::to_string),
            irident,
            elements: Vec::new(),
            units: Vec::new(),
            complete: false,
        })
    }

    /// Create a new, initially incomplete enum definition.
    pub fn declare_enum(&mut self, cident: Option<&str>) -> EnumRef {
        let irident = self.synth_ident("enum", cident);
        self.enums.push(EnumDef {
            cident: cident.map(str::to_string),
            irident,
            elems: Vec::new(),
            complete: false,
        })
    }

    /// Append a plain (non-bit-field) element. The element gets a storage
    /// unit of its own.
    pub fn append_plain(&mut self, rec: RecordRef, name: &str, ty: CGType) {
        let def = &mut self.recs[rec];
        let unit = def.units.len();
        def.units.push(StorageUnit {
            irident: format!("{}", unit),
            ty: ty.clone(),
        });
        def.elements.push(RecordElement {
            name: name.to_string(),
            bit_width: 0,
            bit_pos: 0,
            ty,
            unit,
        });
    }

    /// Append a bit-field element of `width` bits with the declared
    /// underlying type `ty`.
    ///
    /// In a struct the field joins the currently open storage unit when that
    /// unit was opened for bit fields of the same underlying width and has
    /// room left; otherwise a fresh unit is opened. In a union every element
    /// starts its own unit at bit position zero. A zero width closes the
    /// open unit without adding an element.
    pub fn append_bitfield(&mut self, rec: RecordRef, name: &str, ty: CGType, width: u32) {
        let unit_bits = |t: &CGType| -> u32 {
            match t {
                CGType::Basic { kind, .. } => kind.size() as u32 * 8,
                _ => 16,
            }
        };
        let def_kind = self.recs[rec].kind;
        if width == 0 {
            // Force the next bit field into a new unit.
            let def = &mut self.recs[rec];
            def.units.push(StorageUnit {
                irident: format!("{}", def.units.len()),
                ty,
            });
            return;
        }
        let (unit, bit_pos) = {
            let def = &self.recs[rec];
            let open = def
                .elements
                .last()
                .filter(|e| e.is_bitfield())
                .filter(|_| def_kind == RecKind::Struct)
                // A zero-width field may have closed the unit by opening a
                // fresh one; only the last unit is joinable.
                .filter(|e| e.unit + 1 == def.units.len())
                .map(|e| (e.unit, e.bit_pos + e.bit_width));
            match open {
                Some((unit, next_pos))
                    if next_pos + width <= unit_bits(&def.units[unit].ty)
                        && unit_bits(&def.units[unit].ty) == unit_bits(&ty) =>
                {
                    (unit, next_pos)
                }
                _ => {
                    let unit = def.units.len();
                    (unit, 0)
                }
            }
        };
        let def = &mut self.recs[rec];
        if unit == def.units.len() {
            def.units.push(StorageUnit {
                irident: format!("{}", unit),
                ty: ty.clone(),
            });
        }
        def.elements.push(RecordElement {
            name: name.to_string(),
            bit_width: width,
            bit_pos,
            ty,
            unit,
        });
    }

    /// Size of a record in bytes: sum of unit sizes for a struct, the
    /// largest unit for a union. `None` while incomplete.
    pub fn record_size(&self, rec: RecordRef) -> Option<u64> {
        let def = &self.recs[rec];
        if !def.complete {
            return None;
        }
        let sizes = def.units.iter().map(|u| u.ty.size(self).unwrap_or(0));
        match def.kind {
            RecKind::Struct => Some(sizes.sum()),
            RecKind::Union => Some(sizes.max().unwrap_or(0)),
        }
    }

    /// Byte offset of a storage unit within its record. Zero in a union.
    pub fn unit_offset(&self, rec: RecordRef, unit: usize) -> u64 {
        let def = &self.recs[rec];
        match def.kind {
            RecKind::Union => 0,
            RecKind::Struct => def.units[..unit]
                .iter()
                .map(|u| u.ty.size(self).unwrap_or(0))
                .sum(),
        }
    }

    /// Find a record by C tag.
    pub fn find_record(&self, kind: RecKind, cident: &str) -> Option<RecordRef> {
        self.recs
            .iter()
            .find(|(_, d)| d.kind == kind && d.cident.as_deref() == Some(cident))
            .map(|(r, _)| r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IntKind, Signedness};

    fn int() -> CGType {
        CGType::int()
    }

    #[test]
    fn plain_struct_layout() {
        let mut records = Records::new();
        let r = records.declare_record(RecKind::Struct, Some("point"));
        records.append_plain(r, "x", int());
        records.append_plain(r, "y", int());
        records.recs[r].complete = true;

        assert_eq!(records.record_size(r), Some(4));
        assert_eq!(records.recs[r].units.len(), 2);
        assert_eq!(records.unit_offset(r, 0), 0);
        assert_eq!(records.unit_offset(r, 1), 2);
        let y = records.recs[r].element("y").unwrap();
        assert_eq!(y.unit, 1);
        assert!(!y.is_bitfield());
    }

    #[test]
    fn bitfields_share_one_unit() {
        let mut records = Records::new();
        let r = records.declare_record(RecKind::Struct, Some("flags"));
        records.append_bitfield(r, "x", int(), 3);
        records.append_bitfield(r, "y", int(), 5);
        records.recs[r].complete = true;

        let def = &records.recs[r];
        assert_eq!(def.units.len(), 1);
        let x = def.element("x").unwrap();
        let y = def.element("y").unwrap();
        assert_eq!((x.bit_pos, x.bit_width), (0, 3));
        assert_eq!((y.bit_pos, y.bit_width), (3, 5));
        assert_eq!(x.unit, y.unit);
    }

    #[test]
    fn bitfield_overflow_opens_new_unit() {
        let mut records = Records::new();
        let r = records.declare_record(RecKind::Struct, Some("wide"));
        records.append_bitfield(r, "a", int(), 12);
        records.append_bitfield(r, "b", int(), 9);
        records.recs[r].complete = true;

        let def = &records.recs[r];
        assert_eq!(def.units.len(), 2);
        assert_eq!(def.element("b").unwrap().bit_pos, 0);
        assert_eq!(records.record_size(r), Some(4));
    }

    #[test]
    fn mixed_fields() {
        let mut records = Records::new();
        let r = records.declare_record(RecKind::Struct, Some("mix"));
        records.append_bitfield(r, "a", int(), 3);
        records.append_plain(r, "p", CGType::ptr_to(CGType::char()));
        records.append_bitfield(r, "b", int(), 3);
        records.recs[r].complete = true;

        let def = &records.recs[r];
        // A plain field between bit fields splits them into separate units.
        assert_eq!(def.units.len(), 3);
        assert_eq!(records.record_size(r), Some(6));
    }

    #[test]
    fn union_layout() {
        let mut records = Records::new();
        let r = records.declare_record(RecKind::Union, Some("u"));
        records.append_plain(r, "c", CGType::char());
        records.append_plain(
            r,
            "l",
            CGType::Basic {
                kind: IntKind::Long,
                sign: Signedness::Signed,
            },
        );
        records.recs[r].complete = true;

        assert_eq!(records.record_size(r), Some(4));
        assert_eq!(records.unit_offset(r, 1), 0);
    }

    #[test]
    fn incomplete_record_has_no_size() {
        let mut records = Records::new();
        let r = records.declare_record(RecKind::Struct, Some("fwd"));
        assert_eq!(records.record_size(r), None);
    }

    #[test]
    fn anonymous_records_get_unique_idents() {
        let mut records = Records::new();
        let a = records.declare_record(RecKind::Struct, None);
        let b = records.declare_record(RecKind::Struct, None);
        assert_ne!(records.recs[a].irident, records.recs[b].irident);
    }

    #[test]
    fn interning_by_tag() {
        let mut records = Records::new();
        let a = records.declare_record(RecKind::Struct, Some("s"));
        assert_eq!(records.find_record(RecKind::Struct, "s"), Some(a));
        assert_eq!(records.find_record(RecKind::Union, "s"), None);
    }
}
