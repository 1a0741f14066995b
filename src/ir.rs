#![allow(dead_code)]

use crate::classfile::ConstantPool;

/// Intermediate representation for parsed JVM classes and methods.
#[derive(Clone, Debug)]
pub(crate) struct Class {
    pub(crate) name: String,
    pub(crate) super_name: Option<String>,
    pub(crate) interfaces: Vec<String>,
    pub(crate) access: ClassAccess,
    pub(crate) source_file: Option<String>,
    pub(crate) referenced_classes: Vec<String>,
    pub(crate) annotations: Vec<String>,
    pub(crate) fields: Vec<Field>,
    pub(crate) methods: Vec<Method>,
    pub(crate) constant_pool: ConstantPool,
    pub(crate) artifact_index: i64,
}

impl Class {
    /// Whether the constant pool mentions `class_name` as a class reference.
    pub(crate) fn references_class(&self, class_name: &str) -> bool {
        self.referenced_classes.iter().any(|name| name == class_name)
    }

    /// Whether the constant pool contains a member reference with this name.
    pub(crate) fn references_member(&self, member_name: &str) -> bool {
        self.constant_pool.has_member_named(member_name)
    }

    pub(crate) fn has_annotation(&self, descriptor: &str) -> bool {
        self.annotations.iter().any(|annotation| annotation == descriptor)
    }
}

/// Class access flags used for interest predicates.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ClassAccess {
    pub(crate) is_public: bool,
    pub(crate) is_final: bool,
    pub(crate) is_interface: bool,
    pub(crate) is_abstract: bool,
    pub(crate) is_synthetic: bool,
}

/// Field declaration.
#[derive(Clone, Debug)]
pub(crate) struct Field {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) access: FieldAccess,
}

/// Field access flags.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct FieldAccess {
    pub(crate) is_public: bool,
    pub(crate) is_private: bool,
    pub(crate) is_protected: bool,
    pub(crate) is_static: bool,
    pub(crate) is_final: bool,
    pub(crate) is_synthetic: bool,
}

/// Intermediate representation for a method and its bytecode.
#[derive(Clone, Debug)]
pub(crate) struct Method {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) access: MethodAccess,
    pub(crate) code: Option<Code>,
}

impl Method {
    /// `Class.method(desc)` form used in diagnostics and SARIF logical locations.
    pub(crate) fn qualified_name(&self, class_name: &str) -> String {
        format!("{class_name}.{}{}", self.name, self.descriptor)
    }
}

/// Method access flags used for rule filtering.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct MethodAccess {
    pub(crate) is_public: bool,
    pub(crate) is_private: bool,
    pub(crate) is_protected: bool,
    pub(crate) is_static: bool,
    pub(crate) is_final: bool,
    pub(crate) is_abstract: bool,
    pub(crate) is_synthetic: bool,
    pub(crate) is_bridge: bool,
}

/// Code attribute of a concrete method.
#[derive(Clone, Debug, Default)]
pub(crate) struct Code {
    pub(crate) max_stack: u16,
    pub(crate) max_locals: u16,
    pub(crate) bytecode: Vec<u8>,
    pub(crate) exception_handlers: Vec<ExceptionHandler>,
    pub(crate) line_numbers: Vec<LineNumber>,
}

/// Exception handler metadata from the Code attribute.
#[derive(Clone, Debug)]
pub(crate) struct ExceptionHandler {
    pub(crate) start_pc: u32,
    pub(crate) end_pc: u32,
    pub(crate) handler_pc: u32,
    pub(crate) catch_type: Option<String>,
}

/// One LineNumberTable entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct LineNumber {
    pub(crate) start_pc: u32,
    pub(crate) line: u32,
}

/// Bytecode instruction captured for analysis.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Instruction {
    pub(crate) offset: u32,
    pub(crate) opcode: u8,
    pub(crate) length: u32,
    pub(crate) wide: bool,
    pub(crate) operand: Operand,
}

impl Instruction {
    pub(crate) fn next_offset(&self) -> u32 {
        self.offset + self.length
    }

    pub(crate) fn method_ref(&self) -> Option<&MethodRef> {
        match &self.operand {
            Operand::Method(method) => Some(method),
            _ => None,
        }
    }

    pub(crate) fn field_ref(&self) -> Option<&FieldRef> {
        match &self.operand {
            Operand::Field(field) => Some(field),
            _ => None,
        }
    }

    pub(crate) fn local_index(&self) -> Option<u16> {
        match &self.operand {
            Operand::Local(index) => Some(*index),
            Operand::Iinc { local, .. } => Some(*local),
            _ => None,
        }
    }

    pub(crate) fn class_operand(&self) -> Option<&str> {
        match &self.operand {
            Operand::Class(name) => Some(name),
            Operand::MultiArray { class, .. } => Some(class),
            _ => None,
        }
    }

    /// Whether this instruction is a call to `owner.name` (any descriptor).
    pub(crate) fn is_call_to(&self, owner: &str, name: &str) -> bool {
        self.method_ref()
            .is_some_and(|method| method.owner == owner && method.name == name)
    }
}

/// Decoded operand of an instruction.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Operand {
    None,
    /// Local-variable slot for loads, stores and `ret`.
    Local(u16),
    /// `bipush`, `sipush` and the `newarray` element type code.
    Immediate(i32),
    Iinc { local: u16, delta: i32 },
    /// Signed delta from the instruction's own offset.
    Branch(i32),
    Constant(Constant),
    Field(FieldRef),
    Method(MethodRef),
    Dynamic { name: String, descriptor: String },
    /// Internal class name for `new`, `anewarray`, `checkcast`, `instanceof`.
    Class(String),
    MultiArray { class: String, dimensions: u8 },
    Switch(SwitchTable),
}

/// Loadable constant resolved from the constant pool.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Constant {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Class(String),
    MethodType(String),
    MethodHandle,
    Dynamic(String),
}

impl Constant {
    /// Field descriptor of the value this constant pushes.
    pub(crate) fn signature(&self) -> String {
        match self {
            Constant::Int(_) => "I".to_string(),
            Constant::Long(_) => "J".to_string(),
            Constant::Float(_) => "F".to_string(),
            Constant::Double(_) => "D".to_string(),
            Constant::String(_) => "Ljava/lang/String;".to_string(),
            Constant::Class(_) => "Ljava/lang/Class;".to_string(),
            Constant::MethodType(_) => "Ljava/lang/invoke/MethodType;".to_string(),
            Constant::MethodHandle => "Ljava/lang/invoke/MethodHandle;".to_string(),
            Constant::Dynamic(descriptor) => descriptor.clone(),
        }
    }

    /// Numeric value widened to `i64`, for integral constants only.
    pub(crate) fn as_integral(&self) -> Option<i64> {
        match self {
            Constant::Int(value) => Some(i64::from(*value)),
            Constant::Long(value) => Some(*value),
            _ => None,
        }
    }

    pub(crate) fn is_zero(&self) -> bool {
        match self {
            Constant::Int(value) => *value == 0,
            Constant::Long(value) => *value == 0,
            Constant::Float(value) => *value == 0.0,
            Constant::Double(value) => *value == 0.0,
            _ => false,
        }
    }
}

/// Field reference resolved from the constant pool.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub(crate) struct FieldRef {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

/// Method reference resolved from the constant pool.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub(crate) struct MethodRef {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) kind: CallKind,
}

/// Call opcode classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub(crate) enum CallKind {
    Virtual,
    Interface,
    Special,
    Static,
}

/// Decoded `tableswitch` / `lookupswitch` operands; offsets are deltas.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SwitchTable {
    pub(crate) default: i32,
    pub(crate) cases: Vec<(i32, i32)>,
}
