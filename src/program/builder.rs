//! Construction of [`Program`] values.
//!
//! Loaders translate a binary image into the program model through this
//! builder; tests use it to assemble small fixture programs. The builder
//! pre-seeds the runtime entities the analysis recognizes by name
//! (`System.Object`, `System.Threading.Monitor`, `System.Type`), so every
//! program has a consistent [`WellKnown`] table.

use rustc_hash::FxHashMap;

use super::{
    ExceptionHandler, FieldDef, FieldId, Instruction, MethodBody, MethodDef, MethodId, Opcode,
    Program, TypeDef, TypeId, WellKnown,
};

pub struct ProgramBuilder {
    types: Vec<TypeDef>,
    methods: Vec<MethodDef>,
    fields: Vec<FieldDef>,
    array_types: FxHashMap<TypeId, TypeId>,
    well_known: WellKnown,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        let mut builder = Self {
            types: Vec::new(),
            methods: Vec::new(),
            fields: Vec::new(),
            array_types: FxHashMap::default(),
            well_known: WellKnown {
                object: TypeId(0),
                string: TypeId(0),
                type_type: TypeId(0),
                get_type_from_handle: MethodId(0),
                monitor: TypeId(0),
                monitor_enter: MethodId(0),
                monitor_try_enter: MethodId(0),
                monitor_exit: MethodId(0),
                monitor_wait: MethodId(0),
            },
        };

        let object = builder.add_root_class("System.Object");
        builder.well_known.object = object;
        builder.well_known.string = builder.add_class("System.String");

        let type_type = builder.add_class("System.Type");
        builder.well_known.type_type = type_type;
        builder.well_known.get_type_from_handle =
            builder.declare_static_method(type_type, "GetTypeFromHandle", vec![object], Some(type_type));

        let monitor = builder.add_class("System.Threading.Monitor");
        builder.well_known.monitor = monitor;
        builder.well_known.monitor_enter =
            builder.declare_static_method(monitor, "Enter", vec![object], None);
        builder.well_known.monitor_try_enter =
            builder.declare_static_method(monitor, "TryEnter", vec![object, object], None);
        builder.well_known.monitor_exit =
            builder.declare_static_method(monitor, "Exit", vec![object], None);
        builder.well_known.monitor_wait =
            builder.declare_static_method(monitor, "Wait", vec![object], None);

        builder
    }

    fn add_root_class(&mut self, name: &str) -> TypeId {
        self.push_type(TypeDef {
            name: name.to_owned(),
            base: None,
            interfaces: Vec::new(),
            methods: Vec::new(),
            is_interface: false,
            is_delegate: false,
            element: None,
        })
    }

    /// Add a class deriving directly from `System.Object`.
    pub fn add_class(&mut self, name: &str) -> TypeId {
        let object = self.well_known.object;
        self.add_class_with_base(name, object)
    }

    pub fn add_class_with_base(&mut self, name: &str, base: TypeId) -> TypeId {
        self.push_type(TypeDef {
            name: name.to_owned(),
            base: Some(base),
            interfaces: Vec::new(),
            methods: Vec::new(),
            is_interface: false,
            is_delegate: false,
            element: None,
        })
    }

    pub fn add_interface(&mut self, name: &str) -> TypeId {
        self.push_type(TypeDef {
            name: name.to_owned(),
            base: None,
            interfaces: Vec::new(),
            methods: Vec::new(),
            is_interface: true,
            is_delegate: false,
            element: None,
        })
    }

    pub fn implement_interface(&mut self, ty: TypeId, interface: TypeId) {
        self.types[ty.0 as usize].interfaces.push(interface);
    }

    /// Declare a delegate type: a class with a `(target, fnptr)` constructor
    /// and an `Invoke` method, both bodyless (runtime-provided).
    pub fn add_delegate(&mut self, name: &str, params: Vec<TypeId>) -> TypeId {
        let object = self.well_known.object;
        let delegate = self.push_type(TypeDef {
            name: name.to_owned(),
            base: Some(object),
            interfaces: Vec::new(),
            methods: Vec::new(),
            is_interface: false,
            is_delegate: true,
            element: None,
        });
        self.push_method(MethodDef {
            name: ".ctor".to_owned(),
            declaring_type: delegate,
            params: vec![object, object],
            return_type: None,
            is_static: false,
            is_constructor: true,
            is_virtual: false,
            is_abstract: false,
            body: None,
        });
        self.push_method(MethodDef {
            name: "Invoke".to_owned(),
            declaring_type: delegate,
            params,
            return_type: None,
            is_static: false,
            is_constructor: false,
            is_virtual: true,
            is_abstract: false,
            body: None,
        });
        delegate
    }

    /// Array-of-`element` type, created once and cached.
    pub fn array_of(&mut self, element: TypeId) -> TypeId {
        if let Some(&existing) = self.array_types.get(&element) {
            return existing;
        }
        let name = format!("{}[]", self.types[element.0 as usize].name);
        let object = self.well_known.object;
        let array = self.push_type(TypeDef {
            name,
            base: Some(object),
            interfaces: Vec::new(),
            methods: Vec::new(),
            is_interface: false,
            is_delegate: false,
            element: Some(element),
        });
        self.array_types.insert(element, array);
        array
    }

    pub fn add_field(&mut self, ty: TypeId, name: &str, field_ty: TypeId, read_only: bool) -> FieldId {
        let id = FieldId(self.fields.len() as u32);
        self.fields.push(FieldDef {
            name: name.to_owned(),
            declaring_type: ty,
            ty: field_ty,
            is_read_only: read_only,
        });
        id
    }

    /// Declare a bodyless static method; attach a body later with
    /// [`ProgramBuilder::set_body`].
    pub fn declare_static_method(
        &mut self,
        ty: TypeId,
        name: &str,
        params: Vec<TypeId>,
        return_type: Option<TypeId>,
    ) -> MethodId {
        self.push_method(MethodDef {
            name: name.to_owned(),
            declaring_type: ty,
            params,
            return_type,
            is_static: true,
            is_constructor: false,
            is_virtual: false,
            is_abstract: false,
            body: None,
        })
    }

    pub fn declare_instance_method(
        &mut self,
        ty: TypeId,
        name: &str,
        params: Vec<TypeId>,
        return_type: Option<TypeId>,
    ) -> MethodId {
        self.push_method(MethodDef {
            name: name.to_owned(),
            declaring_type: ty,
            params,
            return_type,
            is_static: false,
            is_constructor: false,
            is_virtual: false,
            is_abstract: false,
            body: None,
        })
    }

    pub fn declare_virtual_method(
        &mut self,
        ty: TypeId,
        name: &str,
        params: Vec<TypeId>,
        return_type: Option<TypeId>,
    ) -> MethodId {
        self.push_method(MethodDef {
            name: name.to_owned(),
            declaring_type: ty,
            params,
            return_type,
            is_static: false,
            is_constructor: false,
            is_virtual: true,
            is_abstract: false,
            body: None,
        })
    }

    pub fn declare_abstract_method(
        &mut self,
        ty: TypeId,
        name: &str,
        params: Vec<TypeId>,
        return_type: Option<TypeId>,
    ) -> MethodId {
        self.push_method(MethodDef {
            name: name.to_owned(),
            declaring_type: ty,
            params,
            return_type,
            is_static: false,
            is_constructor: false,
            is_virtual: true,
            is_abstract: true,
            body: None,
        })
    }

    pub fn declare_constructor(&mut self, ty: TypeId, params: Vec<TypeId>) -> MethodId {
        self.push_method(MethodDef {
            name: ".ctor".to_owned(),
            declaring_type: ty,
            params,
            return_type: None,
            is_static: false,
            is_constructor: true,
            is_virtual: false,
            is_abstract: false,
            body: None,
        })
    }

    pub fn declare_static_constructor(&mut self, ty: TypeId) -> MethodId {
        self.push_method(MethodDef {
            name: ".cctor".to_owned(),
            declaring_type: ty,
            params: vec![],
            return_type: None,
            is_static: true,
            is_constructor: true,
            is_virtual: false,
            is_abstract: false,
            body: None,
        })
    }

    /// Attach a body. Instruction offsets are assigned from the position in
    /// `opcodes`, so branch targets are plain indices.
    pub fn set_body(
        &mut self,
        method: MethodId,
        locals: Vec<TypeId>,
        opcodes: Vec<Opcode>,
        handlers: Vec<ExceptionHandler>,
    ) {
        let instructions = opcodes
            .into_iter()
            .enumerate()
            .map(|(offset, opcode)| Instruction {
                offset: offset as u32,
                opcode,
            })
            .collect();
        self.methods[method.0 as usize].body = Some(MethodBody {
            locals,
            instructions,
            handlers,
        });
    }

    /// The well-known runtime entities seeded by [`ProgramBuilder::new`].
    pub fn well_known(&self) -> &WellKnown {
        &self.well_known
    }

    /// Look up a declared method of `ty` by name before `finish`.
    pub fn method_of(&self, ty: TypeId, name: &str) -> Option<MethodId> {
        self.types[ty.0 as usize]
            .methods
            .iter()
            .copied()
            .find(|&m| self.methods[m.0 as usize].name == name)
    }

    pub fn finish(self) -> Program {
        Program {
            types: self.types,
            methods: self.methods,
            fields: self.fields,
            well_known: self.well_known,
        }
    }

    fn push_type(&mut self, ty: TypeDef) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(ty);
        id
    }

    fn push_method(&mut self, method: MethodDef) -> MethodId {
        let id = MethodId(self.methods.len() as u32);
        let declaring = method.declaring_type;
        self.methods.push(method);
        self.types[declaring.0 as usize].methods.push(id);
        id
    }
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}
