//! Symbolic heap objects.
//!
//! A [`HeapObject`] is the abstract identity of a reference-typed value;
//! two lock operations on equal heap objects are treated as operations on
//! the same lock. Equality is per-variant: a `Generic` object is keyed by
//! its creation point and type, a `Parameter` by its formal slot, an
//! `Unaliased` object only ever equals itself (each carries a fresh mint
//! token), an `UnaliasedField` stands for every load of one field, and
//! `TypeOf` is the runtime type literal, shared program-wide per type.

use crate::program::{FieldId, MethodId, Program, ProgramPoint, TypeId};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum HeapObject {
    Generic {
        /// `None` for objects synthesized without a concrete allocation
        /// site (opaque call results, unbound parameters after renaming).
        point: Option<ProgramPoint>,
        ty: TypeId,
    },
    Parameter {
        method: MethodId,
        /// Slot index including the receiver: 0 is `this` for instance
        /// methods.
        index: u16,
        ty: TypeId,
    },
    Unaliased {
        token: u64,
        ty: TypeId,
    },
    UnaliasedField(FieldId),
    TypeOf(TypeId),
}

impl HeapObject {
    pub fn creation_point(&self) -> Option<ProgramPoint> {
        match self {
            HeapObject::Generic { point, .. } => *point,
            _ => None,
        }
    }

    pub fn ty(&self, program: &Program) -> TypeId {
        match self {
            HeapObject::Generic { ty, .. }
            | HeapObject::Parameter { ty, .. }
            | HeapObject::Unaliased { ty, .. } => *ty,
            HeapObject::UnaliasedField(field) => program.field(*field).ty,
            HeapObject::TypeOf(_) => program.well_known().type_type,
        }
    }

    pub fn describe(&self, program: &Program) -> String {
        match self {
            HeapObject::Generic {
                point: Some(point),
                ty,
            } => format!(
                "{} created at {}",
                program.type_def(*ty).name,
                point.describe(program)
            ),
            HeapObject::Generic { point: None, ty } => {
                format!("{} (unknown origin)", program.type_def(*ty).name)
            }
            HeapObject::Parameter { method, index, .. } => {
                format!("parameter {} of {}", index, program.describe_method(*method))
            }
            HeapObject::Unaliased { token, ty } => {
                format!("unaliased {} #{}", program.type_def(*ty).name, token)
            }
            HeapObject::UnaliasedField(field) => {
                let def = program.field(*field);
                format!(
                    "field {}::{}",
                    program.type_def(def.declaring_type).name,
                    def.name
                )
            }
            HeapObject::TypeOf(ty) => format!("typeof {}", program.type_def(*ty).name),
        }
    }
}

/// Mint for `Unaliased` tokens. One source per analysis run keeps tokens
/// unique, which is what makes two unaliased objects never compare equal.
#[derive(Debug, Default)]
pub struct TokenSource {
    next: u64,
}

impl TokenSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mint(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::builder::ProgramBuilder;

    #[test]
    fn unaliased_objects_never_coincide() {
        let program = ProgramBuilder::new().finish();
        let object = program.well_known().object;
        let mut tokens = TokenSource::new();
        let a = HeapObject::Unaliased {
            token: tokens.mint(),
            ty: object,
        };
        let b = HeapObject::Unaliased {
            token: tokens.mint(),
            ty: object,
        };
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn type_literals_coincide_per_type() {
        let mut pb = ProgramBuilder::new();
        let t = pb.add_class("App.Guard");
        let u = pb.add_class("App.Other");
        let _ = pb.finish();
        assert_eq!(HeapObject::TypeOf(t), HeapObject::TypeOf(t));
        assert_ne!(HeapObject::TypeOf(t), HeapObject::TypeOf(u));
    }

    #[test]
    fn generic_identity_is_point_and_type() {
        let mut pb = ProgramBuilder::new();
        let ty = pb.add_class("App.Resource");
        let holder = pb.add_class("App.Holder");
        let m = pb.declare_static_method(holder, "Make", vec![], Some(ty));
        let _ = pb.finish();
        let here = ProgramPoint::new(m, 3);
        let a = HeapObject::Generic {
            point: Some(here),
            ty,
        };
        let b = HeapObject::Generic {
            point: Some(here),
            ty,
        };
        let c = HeapObject::Generic {
            point: Some(ProgramPoint::new(m, 4)),
            ty,
        };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
