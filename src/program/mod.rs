//! The program model consumed by the analysis.
//!
//! A [`Program`] is an immutable arena of types, methods and fields,
//! populated by an external loader (or by [`builder::ProgramBuilder`] in
//! tests and embedders). The analysis only ever reads it: methods expose
//! their instruction stream with a flow-control classification per opcode,
//! an exception-handler table, and enough of the type hierarchy to support
//! class-hierarchy call resolution.
//!
//! Program locations are identified by [`ProgramPoint`], a plain
//! `(method, offset)` pair. Instructions are re-resolved from the program
//! on demand rather than cached, so a point stays valid no matter which
//! transient per-method structures have been dropped.
pub mod builder;

use once_cell::sync::Lazy;
use rustc_hash::FxHashSet;
use std::fmt;

/// Index of a type in the program arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

/// Index of a method in the program arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

/// Index of a field in the program arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub u32);

/// A unique point in program code: a method and an instruction offset
/// within its body. Offsets are dense indices into the instruction list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramPoint {
    pub method: MethodId,
    pub offset: u32,
}

impl ProgramPoint {
    pub fn new(method: MethodId, offset: u32) -> Self {
        Self { method, offset }
    }

    /// Re-resolve the instruction at this point from the program model.
    pub fn instruction<'p>(&self, program: &'p Program) -> Option<&'p Instruction> {
        program
            .method(self.method)
            .body
            .as_ref()
            .and_then(|body| body.instructions.get(self.offset as usize))
    }

    /// Human-readable label, e.g. `method System.Foo::Bar+0x3`.
    pub fn describe(&self, program: &Program) -> String {
        format!(
            "method {}+0x{:x}",
            program.describe_method(self.method),
            self.offset
        )
    }
}

impl fmt::Display for ProgramPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method #{}+0x{:x}", self.method.0, self.offset)
    }
}

/// Flow-control classification of an opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowKind {
    /// Falls through to the next instruction.
    Next,
    /// A call; control returns to the next instruction.
    Call,
    /// Unconditional transfer to the branch target.
    Branch,
    /// Transfer to one of several targets or fall through.
    CondBranch,
    /// Leaves the method (or a finally/fault handler).
    Return,
    /// Raises an exception.
    Throw,
    /// Not classifiable; the enclosing method cannot be analyzed.
    Unknown,
}

/// The instruction shapes the analysis models. Anything a loader cannot
/// express maps to [`Opcode::Unknown`], which makes the enclosing method
/// opaque rather than failing the whole run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Opcode {
    Nop,
    /// Push a non-reference constant.
    LoadConst,
    /// Push a string literal object.
    LoadString,
    LoadArg(u16),
    LoadLocal(u16),
    StoreLocal(u16),
    /// Pop the receiver, push the field value.
    LoadField(FieldId),
    LoadStaticField(FieldId),
    /// Pop value and receiver.
    StoreField(FieldId),
    /// Pop value.
    StoreStaticField(FieldId),
    /// Pop index and array, push the element.
    LoadElement,
    /// Pop value, index and array.
    StoreElement,
    /// Push the runtime type literal for `T` (`typeof`).
    LoadToken(TypeId),
    /// Push a function pointer (delegate construction operand).
    LoadFunction(MethodId),
    /// Call the constructor, push the new instance.
    NewObject(MethodId),
    /// Pop the length, push a new array of the element type.
    NewArray(TypeId),
    Call(MethodId),
    CallVirtual(MethodId),
    /// Pop an object, push it retyped.
    CastClass(TypeId),
    IsInstance(TypeId),
    Dup,
    Pop,
    /// Pop one value, push one.
    UnaryOp,
    /// Pop two values, push one.
    BinaryOp,
    Branch(u32),
    /// Pop the condition; transfer or fall through.
    BranchIf(u32),
    /// Pop the selector; transfer to one of the targets or fall through.
    Switch(Vec<u32>),
    /// Exit a protected region toward the target offset.
    Leave(u32),
    /// Terminate a finally/fault handler.
    EndFinally,
    Return,
    /// Pop the exception object.
    Throw,
    /// An instruction the model cannot express.
    Unknown,
}

impl Opcode {
    pub fn flow(&self) -> FlowKind {
        match self {
            Opcode::Branch(_) | Opcode::Leave(_) => FlowKind::Branch,
            Opcode::BranchIf(_) | Opcode::Switch(_) => FlowKind::CondBranch,
            Opcode::Return | Opcode::EndFinally => FlowKind::Return,
            Opcode::Throw => FlowKind::Throw,
            Opcode::Call(_) | Opcode::CallVirtual(_) | Opcode::NewObject(_) => FlowKind::Call,
            Opcode::Unknown => FlowKind::Unknown,
            _ => FlowKind::Next,
        }
    }

    /// Explicit branch targets, excluding fallthrough.
    pub fn branch_targets(&self) -> Vec<u32> {
        match self {
            Opcode::Branch(t) | Opcode::BranchIf(t) | Opcode::Leave(t) => vec![*t],
            Opcode::Switch(targets) => targets.clone(),
            _ => Vec::new(),
        }
    }

    /// Is this a field load (`ldfld`/`ldsfld`), and of which field?
    pub fn loaded_field(&self) -> Option<FieldId> {
        match self {
            Opcode::LoadField(f) | Opcode::LoadStaticField(f) => Some(*f),
            _ => None,
        }
    }
}

/// Kind of an exception handler clause.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerKind {
    Catch(TypeId),
    Filter { filter_start: u32 },
    Finally,
    Fault,
}

/// One entry of a method's exception-handler table. Ranges are
/// `[start, end)` instruction offsets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub kind: HandlerKind,
    pub try_start: u32,
    pub try_end: u32,
    pub handler_start: u32,
    pub handler_end: u32,
}

/// The body of a method: declared locals, the instruction stream, and the
/// exception-handler table.
#[derive(Clone, Debug)]
pub struct MethodBody {
    pub locals: Vec<TypeId>,
    pub instructions: Vec<Instruction>,
    pub handlers: Vec<ExceptionHandler>,
}

#[derive(Clone, Debug)]
pub struct Instruction {
    pub offset: u32,
    pub opcode: Opcode,
}

#[derive(Clone, Debug)]
pub struct MethodDef {
    pub name: String,
    pub declaring_type: TypeId,
    /// Parameter types, excluding the implicit receiver.
    pub params: Vec<TypeId>,
    /// `None` means void.
    pub return_type: Option<TypeId>,
    pub is_static: bool,
    pub is_constructor: bool,
    pub is_virtual: bool,
    pub is_abstract: bool,
    pub body: Option<MethodBody>,
}

impl MethodDef {
    pub fn has_this(&self) -> bool {
        !self.is_static
    }

    /// Number of stack slots consumed by a call: declared parameters plus
    /// the receiver for instance methods.
    pub fn arity(&self) -> usize {
        self.params.len() + usize::from(self.has_this())
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct TypeDef {
    /// Full name including namespace, e.g. `System.Threading.Monitor`.
    pub name: String,
    pub base: Option<TypeId>,
    pub interfaces: Vec<TypeId>,
    pub methods: Vec<MethodId>,
    pub is_interface: bool,
    pub is_delegate: bool,
    /// `Some` marks an array type of the given element.
    pub element: Option<TypeId>,
}

#[derive(Clone, Debug)]
pub struct FieldDef {
    pub name: String,
    pub declaring_type: TypeId,
    pub ty: TypeId,
    pub is_read_only: bool,
}

/// Ids of the runtime entities the analysis treats specially.
#[derive(Clone, Copy, Debug)]
pub struct WellKnown {
    pub object: TypeId,
    pub string: TypeId,
    pub type_type: TypeId,
    pub get_type_from_handle: MethodId,
    pub monitor: TypeId,
    pub monitor_enter: MethodId,
    pub monitor_try_enter: MethodId,
    pub monitor_exit: MethodId,
    pub monitor_wait: MethodId,
}

static THREADING_DELEGATES: Lazy<FxHashSet<&'static str>> = Lazy::new(|| {
    [
        "System.Threading.ThreadStart",
        "System.Threading.ParameterizedThreadStart",
        "System.Threading.WaitCallback",
        "System.Threading.TimerCallback",
    ]
    .into_iter()
    .collect()
});

static MONITOR_ENTER_NAMES: Lazy<FxHashSet<&'static str>> =
    Lazy::new(|| ["Enter", "TryEnter", "ReliableEnter"].into_iter().collect());

/// An immutable program image: the unit the whole analysis runs over.
#[derive(Debug)]
pub struct Program {
    pub(crate) types: Vec<TypeDef>,
    pub(crate) methods: Vec<MethodDef>,
    pub(crate) fields: Vec<FieldDef>,
    pub(crate) well_known: WellKnown,
}

impl Program {
    pub fn type_def(&self, id: TypeId) -> &TypeDef {
        &self.types[id.0 as usize]
    }

    pub fn method(&self, id: MethodId) -> &MethodDef {
        &self.methods[id.0 as usize]
    }

    pub fn field(&self, id: FieldId) -> &FieldDef {
        &self.fields[id.0 as usize]
    }

    pub fn well_known(&self) -> &WellKnown {
        &self.well_known
    }

    pub fn type_ids(&self) -> impl Iterator<Item = TypeId> {
        (0..self.types.len() as u32).map(TypeId)
    }

    pub fn method_ids(&self) -> impl Iterator<Item = MethodId> {
        (0..self.methods.len() as u32).map(MethodId)
    }

    /// `Type::Method` label for a method.
    pub fn describe_method(&self, id: MethodId) -> String {
        let method = self.method(id);
        format!("{}::{}", self.type_def(method.declaring_type).name, method.name)
    }

    pub fn find_type(&self, name: &str) -> Option<TypeId> {
        self.types
            .iter()
            .position(|t| t.name == name)
            .map(|i| TypeId(i as u32))
    }

    pub fn find_method(&self, type_name: &str, method_name: &str) -> Option<MethodId> {
        let ty = self.find_type(type_name)?;
        self.type_def(ty)
            .methods
            .iter()
            .copied()
            .find(|&m| self.method(m).name == method_name)
    }

    /// Base-type chain starting at `ty` itself, ending at the hierarchy root.
    pub fn base_chain(&self, ty: TypeId) -> Vec<TypeId> {
        let mut chain = vec![ty];
        let mut current = ty;
        while let Some(base) = self.type_def(current).base {
            chain.push(base);
            current = base;
        }
        chain
    }

    /// Least common ancestor of two types along the base-type chains,
    /// falling back to the object root when the chains share nothing.
    pub fn least_common_ancestor(&self, a: TypeId, b: TypeId) -> TypeId {
        let mut chain_a = self.base_chain(a);
        let mut chain_b = self.base_chain(b);
        chain_a.reverse();
        chain_b.reverse();
        let mut lca = self.well_known.object;
        for (ta, tb) in chain_a.iter().zip(chain_b.iter()) {
            if ta != tb {
                break;
            }
            lca = *ta;
        }
        lca
    }

    pub fn is_monitor_enter(&self, id: MethodId) -> bool {
        let method = self.method(id);
        method.declaring_type == self.well_known.monitor
            && MONITOR_ENTER_NAMES.contains(method.name.as_str())
    }

    pub fn is_monitor_exit(&self, id: MethodId) -> bool {
        let method = self.method(id);
        method.declaring_type == self.well_known.monitor && method.name == "Exit"
    }

    pub fn is_monitor_wait(&self, id: MethodId) -> bool {
        let method = self.method(id);
        method.declaring_type == self.well_known.monitor && method.name == "Wait"
    }

    pub fn is_get_type_from_handle(&self, id: MethodId) -> bool {
        id == self.well_known.get_type_from_handle
    }

    /// Is this one of the threading delegate types whose `Invoke` targets
    /// run on their own thread?
    pub fn is_threading_delegate(&self, ty: TypeId) -> bool {
        THREADING_DELEGATES.contains(self.type_def(ty).name.as_str())
    }

    /// Does the type belong to the framework/runtime namespace?
    pub fn is_system_type(&self, ty: TypeId) -> bool {
        self.type_def(ty).name.starts_with("System")
    }
}
