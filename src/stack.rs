use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::cfg::{FlowFacts, falls_through};
use crate::descriptor::{self, parse_method_descriptor};
use crate::error::EngineError;
use crate::ir::{CallKind, Class, Constant, FieldRef, Instruction, Method, MethodRef, Operand};
use crate::opcodes;
use crate::stream::{InstructionStream, decode_instructions};

const OBJECT: &str = "Ljava/lang/Object;";
const THROWABLE: &str = "Ljava/lang/Throwable;";
const RETURN_ADDRESS: &str = "<returnAddress>";

/// Where a symbolic value came from.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Provenance {
    /// Declared parameter, numbered from 0 excluding `this`.
    Parameter(u16),
    NewlyAllocated,
    ReturnValueOf(MethodRef),
    FieldValueOf(FieldRef),
    Constant,
    Unknown,
}

/// Extra facts some detectors key on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SpecialKind {
    /// Array allocated with a length that must be zero.
    EmptyArray,
    /// The receiver of an instance method.
    This,
}

/// Symbolic value on the operand stack or in a local slot.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct StackItem {
    signature: String,
    constant: Option<Constant>,
    provenance: Provenance,
    register: Option<u16>,
    special: Option<SpecialKind>,
    is_null: bool,
    merged_with_zero: bool,
}

impl StackItem {
    pub(crate) fn new(signature: impl Into<String>, provenance: Provenance) -> Self {
        Self {
            signature: signature.into(),
            constant: None,
            provenance,
            register: None,
            special: None,
            is_null: false,
            merged_with_zero: false,
        }
    }

    pub(crate) fn unknown(signature: impl Into<String>) -> Self {
        Self::new(signature, Provenance::Unknown)
    }

    pub(crate) fn constant(value: Constant) -> Self {
        Self {
            signature: value.signature(),
            constant: Some(value),
            ..Self::new("", Provenance::Constant)
        }
    }

    pub(crate) fn null() -> Self {
        Self {
            is_null: true,
            ..Self::new(OBJECT, Provenance::Constant)
        }
    }

    pub(crate) fn signature(&self) -> &str {
        &self.signature
    }

    pub(crate) fn constant_value(&self) -> Option<&Constant> {
        self.constant.as_ref()
    }

    pub(crate) fn int_value(&self) -> Option<i64> {
        self.constant.as_ref().and_then(Constant::as_integral)
    }

    pub(crate) fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub(crate) fn register(&self) -> Option<u16> {
        self.register
    }

    pub(crate) fn special(&self) -> Option<SpecialKind> {
        self.special
    }

    pub(crate) fn is_null(&self) -> bool {
        self.is_null
    }

    pub(crate) fn is_wide(&self) -> bool {
        descriptor::is_wide(&self.signature)
    }

    /// The constant is statically known to be exactly zero.
    pub(crate) fn must_be_zero(&self) -> bool {
        self.constant.as_ref().is_some_and(Constant::is_zero)
    }

    /// Only a known nonzero constant rules zero out for a numeric value.
    pub(crate) fn could_be_zero(&self) -> bool {
        match &self.constant {
            Some(constant) => constant.is_zero(),
            None => self.merged_with_zero || self.is_numeric(),
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(
            self.signature.as_str(),
            "I" | "J" | "F" | "D" | "S" | "B" | "C" | "Z"
        )
    }

    fn with_register(mut self, register: u16) -> Self {
        self.register = Some(register);
        self
    }

    /// Same slot and type, but nothing else is trusted any more.
    fn invalidated(&self) -> Self {
        Self {
            register: self.register,
            special: None,
            merged_with_zero: self.could_be_zero(),
            ..Self::unknown(self.signature.clone())
        }
    }
}

/// Join two values reaching the same offset; facts survive only when both agree.
pub(crate) fn merge_items(left: &StackItem, right: &StackItem) -> StackItem {
    if left == right {
        return left.clone();
    }
    let signature = if left.signature == right.signature {
        left.signature.clone()
    } else if left.is_null {
        right.signature.clone()
    } else if right.is_null {
        left.signature.clone()
    } else {
        OBJECT.to_string()
    };
    let constant = if left.constant == right.constant {
        left.constant.clone()
    } else {
        None
    };
    let provenance = if left.provenance == right.provenance {
        left.provenance.clone()
    } else {
        Provenance::Unknown
    };
    StackItem {
        signature,
        constant,
        provenance,
        register: left.register.filter(|register| Some(*register) == right.register),
        special: left.special.filter(|special| Some(*special) == right.special),
        is_null: left.is_null && right.is_null,
        merged_with_zero: left.could_be_zero() || right.could_be_zero(),
    }
}

#[derive(Clone, Debug, Default)]
struct Frame {
    stack: Vec<StackItem>,
    locals: BTreeMap<u16, StackItem>,
}

impl Frame {
    fn merge(&self, other: &Frame) -> Frame {
        let stack = if self.stack.len() == other.stack.len() {
            self.stack
                .iter()
                .zip(&other.stack)
                .map(|(left, right)| merge_items(left, right))
                .collect()
        } else {
            other.stack.clone()
        };
        let locals = self
            .locals
            .iter()
            .filter_map(|(slot, left)| {
                other
                    .locals
                    .get(slot)
                    .map(|right| (*slot, merge_items(left, right)))
            })
            .collect();
        Frame { stack, locals }
    }
}

/// Static methods of the current class that just return a constant, keyed by
/// `name + descriptor`.
pub(crate) type ConstantReturns = HashMap<String, Constant>;

pub(crate) fn constant_returning_methods(class: &Class) -> ConstantReturns {
    class
        .methods
        .iter()
        .filter(|method| method.access.is_static && method.descriptor.starts_with("()"))
        .filter_map(|method| {
            let code = method.code.as_ref()?;
            let instructions = decode_instructions(&code.bytecode, &class.constant_pool).ok()?;
            match instructions.as_slice() {
                [push, ret] if is_value_return(ret.opcode) => constant_pushed(push)
                    .map(|constant| (format!("{}{}", method.name, method.descriptor), constant)),
                _ => None,
            }
        })
        .collect()
}

fn is_value_return(opcode: u8) -> bool {
    matches!(opcode, opcodes::IRETURN..=opcodes::ARETURN)
}

/// Constant pushed by a literal-push instruction.
pub(crate) fn constant_pushed(inst: &Instruction) -> Option<Constant> {
    match inst.opcode {
        opcodes::ICONST_M1..=opcodes::ICONST_5 => Some(Constant::Int(
            i32::from(inst.opcode) - i32::from(opcodes::ICONST_0),
        )),
        opcodes::LCONST_0 | opcodes::LCONST_1 => Some(Constant::Long(i64::from(
            inst.opcode - opcodes::LCONST_0,
        ))),
        opcodes::FCONST_0..=opcodes::FCONST_2 => {
            Some(Constant::Float(f32::from(inst.opcode - opcodes::FCONST_0)))
        }
        opcodes::DCONST_0 | opcodes::DCONST_1 => Some(Constant::Double(f64::from(
            inst.opcode - opcodes::DCONST_0,
        ))),
        opcodes::BIPUSH | opcodes::SIPUSH => match inst.operand {
            Operand::Immediate(value) => Some(Constant::Int(value)),
            _ => None,
        },
        opcodes::LDC | opcodes::LDC_W | opcodes::LDC2_W => match &inst.operand {
            Operand::Constant(constant) => Some(constant.clone()),
            _ => None,
        },
        _ => None,
    }
}

/// Symbolic operand stack and local-variable table for one method at a time.
///
/// Simulation follows program order only. Jumps save the post-branch state at
/// their target; reaching a target after an unconditional transfer adopts the
/// saved state, falling into one merges both. Loop heads forget the locals
/// the loop body rewrites.
pub(crate) struct OpcodeStack {
    stack: Vec<StackItem>,
    locals: BTreeMap<u16, StackItem>,
    jump_entries: HashMap<u32, Frame>,
    reachable: bool,
    history: VecDeque<u8>,
    lookback: usize,
    class_name: String,
    constant_returns: ConstantReturns,
}

impl OpcodeStack {
    /// `lookback` bounds how far [`OpcodeStack::prev_opcode`] can see.
    pub(crate) fn new(lookback: usize) -> Self {
        Self {
            stack: Vec::new(),
            locals: BTreeMap::new(),
            jump_entries: HashMap::new(),
            reachable: true,
            history: VecDeque::with_capacity(lookback),
            lookback,
            class_name: String::new(),
            constant_returns: ConstantReturns::new(),
        }
    }

    pub(crate) fn enter_class(&mut self, class: &Class) {
        self.class_name = class.name.clone();
        self.constant_returns = constant_returning_methods(class);
    }

    /// Reset to the method's entry state: empty stack, parameters in locals.
    pub(crate) fn enter_method(&mut self, method: &Method) -> Result<(), EngineError> {
        self.stack.clear();
        self.locals.clear();
        self.jump_entries.clear();
        self.history.clear();
        self.reachable = true;

        let parsed = parse_method_descriptor(&method.descriptor)
            .map_err(|error| EngineError::malformed(0, format!("{error:#}")))?;
        let mut slot = 0u16;
        if !method.access.is_static {
            let mut this = StackItem::unknown(descriptor::class_signature(&self.class_name));
            this.special = Some(SpecialKind::This);
            self.locals.insert(0, this.with_register(0));
            slot = 1;
        }
        for (index, parameter) in parsed.parameters.iter().enumerate() {
            let item = StackItem::new(parameter.clone(), Provenance::Parameter(index as u16));
            self.locals.insert(slot, item.with_register(slot));
            slot += descriptor::slot_size(parameter) as u16;
        }
        Ok(())
    }

    /// Operand stack entries; long and double count once.
    pub(crate) fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Operand stack size in JVM slots; long and double count twice.
    pub(crate) fn slot_depth(&self) -> usize {
        self.stack
            .iter()
            .map(|item| descriptor::slot_size(&item.signature))
            .sum()
    }

    /// `n`-th item from the top, `0` being the top.
    pub(crate) fn item(&self, n: usize) -> Option<&StackItem> {
        self.stack.iter().rev().nth(n)
    }

    pub(crate) fn local(&self, slot: u16) -> Option<&StackItem> {
        self.locals.get(&slot)
    }

    /// Opcode executed `n` steps before the current instruction, or `nop`
    /// when that is outside the retained window.
    pub(crate) fn prev_opcode(&self, n: usize) -> u8 {
        if n == 0 || n > self.history.len() {
            return opcodes::NOP;
        }
        self.history[self.history.len() - n]
    }

    /// Prepare the state for the instruction at `offset` before detectors see it.
    pub(crate) fn enter_offset(&mut self, offset: u32, flow: &FlowFacts) {
        match (self.jump_entries.remove(&offset), self.reachable) {
            (Some(saved), false) => {
                self.stack = saved.stack;
                self.locals = saved.locals;
            }
            (Some(saved), true) => {
                let current = Frame {
                    stack: std::mem::take(&mut self.stack),
                    locals: std::mem::take(&mut self.locals),
                };
                let merged = saved.merge(&current);
                self.stack = merged.stack;
                self.locals = merged.locals;
            }
            (None, false) => self.stack.clear(),
            (None, true) => {}
        }
        if let Some(catch_type) = flow.handler_at(offset) {
            let signature = catch_type
                .map(descriptor::class_signature)
                .unwrap_or_else(|| THROWABLE.to_string());
            self.stack = vec![StackItem::unknown(signature)];
        }
        for region in flow.loops_starting_at(offset) {
            for slot in &region.stored_locals {
                if let Some(item) = self.locals.get_mut(slot) {
                    *item = item.invalidated();
                }
            }
        }
        self.reachable = true;
    }

    /// Apply the effect of `inst` and record it in the look-behind window.
    pub(crate) fn apply(
        &mut self,
        inst: &Instruction,
        stream: &InstructionStream<'_>,
    ) -> Result<(), EngineError> {
        self.execute(inst)?;
        for target in stream.jump_targets(inst)? {
            self.save_jump_entry(target);
        }
        if matches!(inst.opcode, opcodes::JSR | opcodes::JSR_W) {
            self.pop();
        }
        if !falls_through(inst.opcode) {
            self.reachable = false;
        }
        if self.lookback > 0 {
            if self.history.len() == self.lookback {
                self.history.pop_front();
            }
            self.history.push_back(inst.opcode);
        }
        Ok(())
    }

    fn save_jump_entry(&mut self, target: u32) {
        let current = Frame {
            stack: self.stack.clone(),
            locals: self.locals.clone(),
        };
        let entry = match self.jump_entries.remove(&target) {
            Some(existing) => existing.merge(&current),
            None => current,
        };
        self.jump_entries.insert(target, entry);
    }

    fn push(&mut self, item: StackItem) {
        self.stack.push(item);
    }

    /// Underflow yields an unknown value instead of failing.
    fn pop(&mut self) -> StackItem {
        self.stack
            .pop()
            .unwrap_or_else(|| StackItem::unknown(OBJECT))
    }

    fn pop_n(&mut self, count: usize) {
        for _ in 0..count {
            self.pop();
        }
    }

    fn load(&mut self, slot: u16, default_signature: &str) {
        let item = self
            .locals
            .get(&slot)
            .cloned()
            .unwrap_or_else(|| StackItem::unknown(default_signature));
        self.push(item.with_register(slot));
    }

    fn store(&mut self, slot: u16) {
        let item = self.pop();
        if item.is_wide() {
            self.locals.remove(&(slot + 1));
        }
        if slot > 0
            && self
                .locals
                .get(&(slot - 1))
                .is_some_and(StackItem::is_wide)
        {
            self.locals.remove(&(slot - 1));
        }
        self.locals.insert(slot, item.with_register(slot));
    }

    fn execute(&mut self, inst: &Instruction) -> Result<(), EngineError> {
        let opcode = inst.opcode;
        if let Some(constant) = constant_pushed(inst) {
            self.push(StackItem::constant(constant));
            return Ok(());
        }
        match opcode {
            opcodes::NOP | opcodes::GOTO | opcodes::GOTO_W | opcodes::RET => {}
            opcodes::RETURN => self.stack.clear(),
            opcodes::ACONST_NULL => self.push(StackItem::null()),
            opcodes::ILOAD..=opcodes::ALOAD => {
                let slot = local_operand(inst)?;
                self.load(slot, kind_signature(opcode - opcodes::ILOAD));
            }
            opcodes::ILOAD_0..=opcodes::ALOAD_3 => {
                let slot = local_operand(inst)?;
                self.load(slot, kind_signature((opcode - opcodes::ILOAD_0) / 4));
            }
            opcodes::IALOAD..=opcodes::SALOAD => {
                self.pop();
                let array = self.pop();
                let signature = match opcode {
                    opcodes::AALOAD => array
                        .signature
                        .strip_prefix('[')
                        .unwrap_or(OBJECT)
                        .to_string(),
                    opcodes::BALOAD => "B".to_string(),
                    opcodes::CALOAD => "C".to_string(),
                    opcodes::SALOAD => "S".to_string(),
                    _ => kind_signature(opcode - opcodes::IALOAD).to_string(),
                };
                self.push(StackItem::unknown(signature));
            }
            opcodes::ISTORE..=opcodes::ASTORE | opcodes::ISTORE_0..=opcodes::ASTORE_3 => {
                let slot = local_operand(inst)?;
                self.store(slot);
            }
            opcodes::IASTORE..=opcodes::SASTORE => self.pop_n(3),
            opcodes::POP => {
                self.pop();
            }
            opcodes::POP2 => {
                if !self.pop().is_wide() {
                    self.pop();
                }
            }
            opcodes::DUP..=opcodes::SWAP => self.shuffle(opcode),
            opcodes::IADD..=opcodes::DREM | opcodes::ISHL..=opcodes::LXOR => {
                let right = self.pop();
                let left = self.pop();
                self.push(binary_result(opcode, &left, &right));
            }
            opcodes::INEG..=opcodes::DNEG => {
                let value = self.pop();
                let constant = match value.constant {
                    Some(Constant::Int(v)) => Some(Constant::Int(v.wrapping_neg())),
                    Some(Constant::Long(v)) => Some(Constant::Long(v.wrapping_neg())),
                    Some(Constant::Float(v)) => Some(Constant::Float(-v)),
                    Some(Constant::Double(v)) => Some(Constant::Double(-v)),
                    _ => None,
                };
                self.push(derived(value.signature, constant));
            }
            opcodes::IINC => {
                let Operand::Iinc { local, delta } = inst.operand else {
                    return Err(EngineError::malformed(inst.offset, "iinc without operands"));
                };
                let updated = match self.locals.get(&local) {
                    Some(item) => match item.constant {
                        Some(Constant::Int(value)) => StackItem::constant(Constant::Int(
                            value.wrapping_add(delta),
                        )),
                        _ => item.invalidated(),
                    },
                    None => StackItem::unknown("I"),
                };
                self.locals.insert(local, updated.with_register(local));
            }
            opcodes::I2L..=opcodes::I2S => {
                let value = self.pop();
                let (signature, constant) = convert(opcode, value.constant.as_ref());
                self.push(derived(signature.to_string(), constant));
            }
            opcodes::LCMP..=opcodes::DCMPG => {
                self.pop_n(2);
                self.push(StackItem::unknown("I"));
            }
            opcodes::IFEQ..=opcodes::IFLE
            | opcodes::IFNULL
            | opcodes::IFNONNULL
            | opcodes::TABLESWITCH
            | opcodes::LOOKUPSWITCH
            | opcodes::MONITORENTER
            | opcodes::MONITOREXIT
            | opcodes::PUTSTATIC => {
                self.pop();
            }
            opcodes::IF_ICMPEQ..=opcodes::IF_ACMPNE | opcodes::PUTFIELD => self.pop_n(2),
            opcodes::JSR | opcodes::JSR_W => self.push(StackItem::unknown(RETURN_ADDRESS)),
            opcodes::IRETURN..=opcodes::ARETURN | opcodes::ATHROW => {
                self.pop();
                self.stack.clear();
            }
            opcodes::GETSTATIC | opcodes::GETFIELD => {
                let Operand::Field(field) = &inst.operand else {
                    return Err(EngineError::malformed(inst.offset, "field access without field"));
                };
                if opcode == opcodes::GETFIELD {
                    self.pop();
                }
                self.push(StackItem::new(
                    field.descriptor.clone(),
                    Provenance::FieldValueOf(field.clone()),
                ));
            }
            opcodes::INVOKEVIRTUAL..=opcodes::INVOKEINTERFACE => {
                let Operand::Method(method) = &inst.operand else {
                    return Err(EngineError::malformed(inst.offset, "invoke without method"));
                };
                self.invoke(inst.offset, method)?;
            }
            opcodes::INVOKEDYNAMIC => {
                let Operand::Dynamic { descriptor, .. } = &inst.operand else {
                    return Err(EngineError::malformed(inst.offset, "invokedynamic without site"));
                };
                let parsed = parse_method_descriptor(descriptor)
                    .map_err(|error| EngineError::malformed(inst.offset, format!("{error:#}")))?;
                self.pop_n(parsed.parameters.len());
                if !parsed.returns_void() {
                    self.push(StackItem::unknown(parsed.return_type));
                }
            }
            opcodes::NEW => {
                let class = class_operand(inst)?;
                self.push(StackItem::new(
                    descriptor::class_signature(class),
                    Provenance::NewlyAllocated,
                ));
            }
            opcodes::NEWARRAY | opcodes::ANEWARRAY => {
                let length = self.pop();
                let signature = if opcode == opcodes::NEWARRAY {
                    let Operand::Immediate(code) = inst.operand else {
                        return Err(EngineError::malformed(inst.offset, "newarray without type"));
                    };
                    format!("[{}", primitive_array_element(code, inst.offset)?)
                } else {
                    format!("[{}", descriptor::class_signature(class_operand(inst)?))
                };
                let mut array = StackItem::new(signature, Provenance::NewlyAllocated);
                if length.must_be_zero() {
                    array.special = Some(SpecialKind::EmptyArray);
                }
                self.push(array);
            }
            opcodes::MULTIANEWARRAY => {
                let Operand::MultiArray { class, dimensions } = &inst.operand else {
                    return Err(EngineError::malformed(inst.offset, "multianewarray operands"));
                };
                self.pop_n(usize::from(*dimensions));
                self.push(StackItem::new(class.clone(), Provenance::NewlyAllocated));
            }
            opcodes::ARRAYLENGTH => {
                let array = self.pop();
                if array.special == Some(SpecialKind::EmptyArray) {
                    self.push(StackItem::constant(Constant::Int(0)));
                } else {
                    self.push(StackItem::unknown("I"));
                }
            }
            opcodes::CHECKCAST => {
                let class = class_operand(inst)?;
                let mut value = self.pop();
                if !value.is_null {
                    value.signature = descriptor::class_signature(class);
                }
                self.push(value);
            }
            opcodes::INSTANCEOF => {
                self.pop();
                self.push(StackItem::unknown("I"));
            }
            other => {
                return Err(EngineError::malformed(
                    inst.offset,
                    format!("no stack effect for {}", opcodes::name(other)),
                ));
            }
        }
        Ok(())
    }

    fn invoke(&mut self, offset: u32, method: &MethodRef) -> Result<(), EngineError> {
        let parsed = parse_method_descriptor(&method.descriptor)
            .map_err(|error| EngineError::malformed(offset, format!("{error:#}")))?;
        self.pop_n(parsed.parameters.len());
        if method.kind != CallKind::Static {
            self.pop();
        }
        if parsed.returns_void() {
            return Ok(());
        }
        let known = (method.kind == CallKind::Static
            && parsed.parameters.is_empty()
            && method.owner == self.class_name)
            .then(|| {
                self.constant_returns
                    .get(&format!("{}{}", method.name, method.descriptor))
            })
            .flatten();
        let item = match known {
            Some(constant) => StackItem::constant(constant.clone()),
            None => StackItem::new(
                parsed.return_type,
                Provenance::ReturnValueOf(method.clone()),
            ),
        };
        self.push(item);
        Ok(())
    }

    fn shuffle(&mut self, opcode: u8) {
        match opcode {
            opcodes::DUP => {
                let v1 = self.pop();
                self.push(v1.clone());
                self.push(v1);
            }
            opcodes::DUP_X1 => {
                let v1 = self.pop();
                let v2 = self.pop();
                self.push(v1.clone());
                self.push(v2);
                self.push(v1);
            }
            opcodes::DUP_X2 => {
                let v1 = self.pop();
                let v2 = self.pop();
                if v2.is_wide() {
                    self.push(v1.clone());
                    self.push(v2);
                } else {
                    let v3 = self.pop();
                    self.push(v1.clone());
                    self.push(v3);
                    self.push(v2);
                }
                self.push(v1);
            }
            opcodes::DUP2 => {
                let v1 = self.pop();
                if v1.is_wide() {
                    self.push(v1.clone());
                } else {
                    let v2 = self.pop();
                    self.push(v2.clone());
                    self.push(v1.clone());
                    self.push(v2);
                }
                self.push(v1);
            }
            opcodes::DUP2_X1 => {
                let v1 = self.pop();
                let v2 = self.pop();
                if v1.is_wide() {
                    self.push(v1.clone());
                    self.push(v2);
                } else {
                    let v3 = self.pop();
                    self.push(v2.clone());
                    self.push(v1.clone());
                    self.push(v3);
                    self.push(v2);
                }
                self.push(v1);
            }
            opcodes::DUP2_X2 => {
                let v1 = self.pop();
                let v2 = self.pop();
                if v1.is_wide() {
                    if v2.is_wide() {
                        self.push(v1.clone());
                        self.push(v2);
                    } else {
                        let v3 = self.pop();
                        self.push(v1.clone());
                        self.push(v3);
                        self.push(v2);
                    }
                } else {
                    let v3 = self.pop();
                    if v3.is_wide() {
                        self.push(v2.clone());
                        self.push(v1.clone());
                        self.push(v3);
                    } else {
                        let v4 = self.pop();
                        self.push(v2.clone());
                        self.push(v1.clone());
                        self.push(v4);
                        self.push(v3);
                    }
                    self.push(v2);
                }
                self.push(v1);
            }
            _ => {
                let v1 = self.pop();
                let v2 = self.pop();
                self.push(v1);
                self.push(v2);
            }
        }
    }
}

fn local_operand(inst: &Instruction) -> Result<u16, EngineError> {
    inst.local_index()
        .ok_or_else(|| EngineError::malformed(inst.offset, "missing local index"))
}

fn class_operand(inst: &Instruction) -> Result<&str, EngineError> {
    inst.class_operand()
        .ok_or_else(|| EngineError::malformed(inst.offset, "missing class operand"))
}

/// Computational type of the typed opcode families (`i`, `l`, `f`, `d`, `a`).
fn kind_signature(kind: u8) -> &'static str {
    match kind {
        0 => "I",
        1 => "J",
        2 => "F",
        3 => "D",
        _ => OBJECT,
    }
}

fn primitive_array_element(code: i32, offset: u32) -> Result<&'static str, EngineError> {
    let element = match code {
        4 => "Z",
        5 => "C",
        6 => "F",
        7 => "D",
        8 => "B",
        9 => "S",
        10 => "I",
        11 => "J",
        other => {
            return Err(EngineError::malformed(
                offset,
                format!("bad newarray type {other}"),
            ));
        }
    };
    Ok(element)
}

/// Result of arithmetic: a constant when folding is possible, otherwise unknown.
fn derived(signature: String, constant: Option<Constant>) -> StackItem {
    match constant {
        Some(constant) => StackItem::constant(constant),
        None => StackItem::unknown(signature),
    }
}

fn binary_result(opcode: u8, left: &StackItem, right: &StackItem) -> StackItem {
    let signature = match opcode {
        opcodes::IADD..=opcodes::DREM => kind_signature((opcode - opcodes::IADD) % 4),
        _ => kind_signature((opcode - opcodes::ISHL) % 2),
    };
    let constant = match (&left.constant, &right.constant) {
        (Some(Constant::Int(a)), Some(Constant::Int(b))) => {
            fold_int(opcode, *a, *b).map(Constant::Int)
        }
        (Some(Constant::Long(a)), Some(Constant::Long(b))) => {
            fold_long(opcode, *a, *b).map(Constant::Long)
        }
        (Some(Constant::Long(a)), Some(Constant::Int(b))) => {
            fold_long_shift(opcode, *a, *b).map(Constant::Long)
        }
        _ => None,
    };
    derived(signature.to_string(), constant)
}

fn fold_int(opcode: u8, a: i32, b: i32) -> Option<i32> {
    let value = match opcode {
        opcodes::IADD => a.wrapping_add(b),
        opcodes::ISUB => a.wrapping_sub(b),
        opcodes::IMUL => a.wrapping_mul(b),
        opcodes::IDIV if b != 0 => a.wrapping_div(b),
        opcodes::IREM if b != 0 => a.wrapping_rem(b),
        opcodes::ISHL => a.wrapping_shl(b as u32),
        opcodes::ISHR => a.wrapping_shr(b as u32),
        opcodes::IUSHR => ((a as u32).wrapping_shr(b as u32)) as i32,
        opcodes::IAND => a & b,
        opcodes::IOR => a | b,
        opcodes::IXOR => a ^ b,
        _ => return None,
    };
    Some(value)
}

fn fold_long(opcode: u8, a: i64, b: i64) -> Option<i64> {
    let value = match opcode {
        opcodes::LADD => a.wrapping_add(b),
        opcodes::LSUB => a.wrapping_sub(b),
        opcodes::LMUL => a.wrapping_mul(b),
        opcodes::LDIV if b != 0 => a.wrapping_div(b),
        opcodes::LREM if b != 0 => a.wrapping_rem(b),
        opcodes::LAND => a & b,
        opcodes::LOR => a | b,
        opcodes::LXOR => a ^ b,
        _ => return None,
    };
    Some(value)
}

fn fold_long_shift(opcode: u8, a: i64, b: i32) -> Option<i64> {
    let value = match opcode {
        opcodes::LSHL => a.wrapping_shl(b as u32),
        opcodes::LSHR => a.wrapping_shr(b as u32),
        opcodes::LUSHR => ((a as u64).wrapping_shr(b as u32)) as i64,
        _ => return None,
    };
    Some(value)
}

fn convert(opcode: u8, constant: Option<&Constant>) -> (&'static str, Option<Constant>) {
    let signature = match opcode {
        opcodes::I2L | opcodes::F2L | opcodes::D2L => "J",
        opcodes::I2F | opcodes::L2F | opcodes::D2F => "F",
        opcodes::I2D | opcodes::L2D | opcodes::F2D => "D",
        opcodes::I2B => "B",
        opcodes::I2C => "C",
        opcodes::I2S => "S",
        _ => "I",
    };
    let as_f64 = match constant {
        Some(Constant::Int(v)) => Some(f64::from(*v)),
        Some(Constant::Long(v)) => Some(*v as f64),
        Some(Constant::Float(v)) => Some(f64::from(*v)),
        Some(Constant::Double(v)) => Some(*v),
        _ => None,
    };
    let as_i64 = constant.and_then(Constant::as_integral);
    let converted = match signature {
        "J" => as_i64.or(as_f64.map(|v| v as i64)).map(Constant::Long),
        "F" => as_f64.map(|v| Constant::Float(v as f32)),
        "D" => as_f64.map(Constant::Double),
        "B" => as_i64.map(|v| Constant::Int(i32::from(v as i8))),
        "C" => as_i64.map(|v| Constant::Int(i32::from(v as u16))),
        "S" => as_i64.map(|v| Constant::Int(i32::from(v as i16))),
        _ => as_i64
            .map(|v| v as i32)
            .or(as_f64.map(|v| v as i32))
            .map(Constant::Int),
    };
    (signature, converted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::analyze_flow;
    use crate::classfile::ConstantPool;
    use crate::ir::{ClassAccess, Code, MethodAccess};
    use proptest::prelude::*;

    fn method(descriptor: &str, is_static: bool, bytecode: Vec<u8>) -> Method {
        Method {
            name: "sample".to_string(),
            descriptor: descriptor.to_string(),
            access: MethodAccess {
                is_static,
                is_public: true,
                ..MethodAccess::default()
            },
            code: Some(Code {
                max_stack: 8,
                max_locals: 8,
                bytecode,
                ..Code::default()
            }),
        }
    }

    fn class_with(methods: Vec<Method>) -> Class {
        Class {
            name: "com/example/Sample".to_string(),
            super_name: Some("java/lang/Object".to_string()),
            interfaces: Vec::new(),
            access: ClassAccess::default(),
            source_file: None,
            referenced_classes: Vec::new(),
            annotations: Vec::new(),
            fields: Vec::new(),
            methods,
            constant_pool: ConstantPool::default(),
            artifact_index: 0,
        }
    }

    fn entry_state(class: &Class, method: &Method) -> Result<OpcodeStack, EngineError> {
        let mut stack = OpcodeStack::new(0);
        stack.enter_class(class);
        stack.enter_method(method)?;
        Ok(stack)
    }

    /// Run the method and record `(offset, depth before, slot depth before)`.
    fn simulate(class: &Class, method: &Method) -> (OpcodeStack, Vec<(u32, usize, usize)>) {
        let code = method.code.as_ref().expect("code");
        let stream = InstructionStream::new(code, &class.constant_pool).expect("stream");
        let flow = analyze_flow(&stream, &code.exception_handlers).expect("flow");
        let mut stack = OpcodeStack::new(7);
        stack.enter_class(class);
        stack.enter_method(method).expect("enter");
        let mut depths = Vec::new();
        for inst in stream.iter() {
            stack.enter_offset(inst.offset, &flow);
            depths.push((inst.offset, stack.depth(), stack.slot_depth()));
            stack.apply(inst, &stream).expect("apply");
        }
        (stack, depths)
    }

    #[test]
    fn depth_counts_entries_and_slot_depth_counts_width() {
        let sample = method(
            "(I)I",
            true,
            vec![
                opcodes::ILOAD_0,
                opcodes::I2L,
                opcodes::LCONST_1,
                opcodes::LADD,
                opcodes::L2I,
                opcodes::IRETURN,
            ],
        );
        let class = class_with(vec![sample.clone()]);
        let (_, depths) = simulate(&class, &sample);

        assert_eq!(
            vec![(0, 0, 0), (1, 1, 1), (2, 1, 2), (3, 2, 4), (4, 1, 2), (5, 1, 1)],
            depths
        );
    }

    #[test]
    fn if_else_join_keeps_verifier_depth_and_drops_disagreeing_constant() {
        // 0: iload_0, 1: ifeq -> 8, 4: iconst_1, 5: goto -> 9, 8: iconst_0, 9: ireturn
        let sample = method(
            "(I)I",
            true,
            vec![
                opcodes::ILOAD_0,
                opcodes::IFEQ,
                0x00,
                0x07,
                opcodes::ICONST_1,
                opcodes::GOTO,
                0x00,
                0x04,
                opcodes::ICONST_0,
                opcodes::IRETURN,
            ],
        );
        let class = class_with(vec![sample.clone()]);
        let code = sample.code.as_ref().expect("code");
        let stream = InstructionStream::new(code, &class.constant_pool).expect("stream");
        let flow = analyze_flow(&stream, &[]).expect("flow");
        let mut stack = OpcodeStack::new(2);
        stack.enter_class(&class);
        stack.enter_method(&sample).expect("enter");
        let mut at_return = None;
        for inst in stream.iter() {
            stack.enter_offset(inst.offset, &flow);
            if inst.opcode == opcodes::ICONST_0 {
                assert_eq!(0, stack.depth());
            }
            if inst.opcode == opcodes::IRETURN {
                at_return = stack.item(0).cloned();
                assert_eq!(1, stack.depth());
            }
            stack.apply(inst, &stream).expect("apply");
        }
        let top = at_return.expect("value at join");
        assert_eq!(None, top.constant_value());
        assert!(!top.must_be_zero());
        assert!(top.could_be_zero());
        assert_eq!(&Provenance::Constant, top.provenance());
    }

    #[test]
    fn unknown_numbers_could_be_zero_until_a_constant_proves_otherwise() {
        assert!(StackItem::new("I", Provenance::Parameter(0)).could_be_zero());
        assert!(StackItem::unknown("J").could_be_zero());
        assert!(StackItem::constant(Constant::Int(0)).could_be_zero());
        assert!(!StackItem::constant(Constant::Int(3)).could_be_zero());
        assert!(!StackItem::unknown(OBJECT).could_be_zero());
    }

    #[test]
    fn disagreeing_provenance_degrades_to_unknown() {
        let parameter = StackItem::new("I", Provenance::Parameter(0));
        let allocated = StackItem::new("I", Provenance::NewlyAllocated);
        assert_eq!(
            &Provenance::Unknown,
            merge_items(&parameter, &allocated).provenance()
        );
        assert_eq!(
            &Provenance::Parameter(0),
            merge_items(&parameter, &parameter).provenance()
        );
    }

    #[test]
    fn parameters_are_tagged_by_declared_index() {
        let sample = method("(JLjava/lang/String;)V", false, vec![opcodes::RETURN]);
        let class = class_with(vec![sample.clone()]);
        let stack = entry_state(&class, &sample).expect("entry");

        assert_eq!(Some(SpecialKind::This), stack.local(0).and_then(StackItem::special));
        assert_eq!(
            Some(&Provenance::Parameter(0)),
            stack.local(1).map(StackItem::provenance)
        );
        assert_eq!(None, stack.local(2));
        assert_eq!(
            Some(&Provenance::Parameter(1)),
            stack.local(3).map(StackItem::provenance)
        );
        assert_eq!(Some(3), stack.local(3).and_then(StackItem::register));
    }

    #[test]
    fn underflow_pushes_unknown() {
        let sample = method("()V", true, vec![opcodes::POP, opcodes::IADD, opcodes::RETURN]);
        let class = class_with(vec![sample.clone()]);
        let (stack, depths) = simulate(&class, &sample);

        assert_eq!((2, 1, 1), depths[2]);
        assert_eq!(0, stack.depth());
    }

    #[test]
    fn zero_length_array_is_tagged_empty() {
        let sample = method(
            "()V",
            true,
            vec![
                opcodes::ICONST_0,
                opcodes::NEWARRAY,
                10,
                opcodes::DUP,
                opcodes::ARRAYLENGTH,
                opcodes::ICONST_1,
                opcodes::NEWARRAY,
                10,
                opcodes::RETURN,
            ],
        );
        let class = class_with(vec![sample.clone()]);
        let code = sample.code.as_ref().expect("code");
        let stream = InstructionStream::new(code, &class.constant_pool).expect("stream");
        let flow = analyze_flow(&stream, &[]).expect("flow");
        let mut stack = OpcodeStack::new(0);
        stack.enter_class(&class);
        stack.enter_method(&sample).expect("enter");
        for inst in stream.iter().take(6) {
            stack.enter_offset(inst.offset, &flow);
            stack.apply(inst, &stream).expect("apply");
        }

        let non_empty = stack.item(0).expect("second array");
        assert_eq!(None, non_empty.special());
        assert_eq!(&Provenance::NewlyAllocated, non_empty.provenance());
        assert!(stack.item(1).expect("length").must_be_zero());
        let empty = stack.item(2).expect("first array");
        assert_eq!(Some(SpecialKind::EmptyArray), empty.special());
        assert_eq!("[I", empty.signature());
    }

    #[test]
    fn loop_head_forgets_constants_stored_in_the_loop() {
        // 0: iconst_0, 1: istore_1, 2: iload_1, 3: pop, 4: iinc 1 1, 7: goto -> 2
        let sample = method(
            "()V",
            true,
            vec![
                opcodes::ICONST_0,
                opcodes::ISTORE_1,
                opcodes::ILOAD_1,
                opcodes::POP,
                opcodes::IINC,
                0x01,
                0x01,
                opcodes::GOTO,
                0xff,
                0xfb,
            ],
        );
        let class = class_with(vec![sample.clone()]);
        let code = sample.code.as_ref().expect("code");
        let stream = InstructionStream::new(code, &class.constant_pool).expect("stream");
        let flow = analyze_flow(&stream, &[]).expect("flow");
        let mut stack = OpcodeStack::new(0);
        stack.enter_class(&class);
        stack.enter_method(&sample).expect("enter");
        for inst in stream.iter() {
            stack.enter_offset(inst.offset, &flow);
            if inst.offset == 3 {
                let loaded = stack.item(0).expect("loaded local");
                assert!(!loaded.must_be_zero());
                assert!(loaded.could_be_zero());
                assert_eq!(Some(1), loaded.register());
            }
            stack.apply(inst, &stream).expect("apply");
        }
    }

    #[test]
    fn prev_opcode_window_is_bounded() {
        let sample = method(
            "()V",
            true,
            vec![
                opcodes::ICONST_1,
                opcodes::ICONST_2,
                opcodes::IADD,
                opcodes::POP,
                opcodes::RETURN,
            ],
        );
        let class = class_with(vec![sample.clone()]);
        let code = sample.code.as_ref().expect("code");
        let stream = InstructionStream::new(code, &class.constant_pool).expect("stream");
        let flow = analyze_flow(&stream, &[]).expect("flow");
        let mut stack = OpcodeStack::new(2);
        stack.enter_class(&class);
        stack.enter_method(&sample).expect("enter");
        for inst in stream.iter().take(4) {
            stack.enter_offset(inst.offset, &flow);
            stack.apply(inst, &stream).expect("apply");
        }

        assert_eq!(opcodes::POP, stack.prev_opcode(1));
        assert_eq!(opcodes::IADD, stack.prev_opcode(2));
        assert_eq!(opcodes::NOP, stack.prev_opcode(3));
    }

    #[test]
    fn constant_returning_static_call_pushes_constant() {
        let getter = Method {
            name: "limit".to_string(),
            ..method("()I", true, vec![opcodes::BIPUSH, 42, opcodes::IRETURN])
        };
        let mut class = class_with(vec![getter]);
        class.name = "com/example/Sample".to_string();
        let returns = constant_returning_methods(&class);
        assert_eq!(Some(&Constant::Int(42)), returns.get("limit()I"));

        let mut stack = OpcodeStack::new(0);
        stack.enter_class(&class);
        stack
            .invoke(
                0,
                &MethodRef {
                    owner: "com/example/Sample".to_string(),
                    name: "limit".to_string(),
                    descriptor: "()I".to_string(),
                    kind: CallKind::Static,
                },
            )
            .expect("invoke");
        assert_eq!(Some(42), stack.item(0).and_then(StackItem::int_value));
        assert_eq!(Some(&Provenance::Constant), stack.item(0).map(StackItem::provenance));
    }

    #[test]
    fn wide_dup2_duplicates_one_entry() {
        let sample = method(
            "()V",
            true,
            vec![opcodes::LCONST_0, opcodes::DUP2, opcodes::POP2, opcodes::POP2, opcodes::RETURN],
        );
        let class = class_with(vec![sample.clone()]);
        let (_, depths) = simulate(&class, &sample);
        assert_eq!(vec![(0, 0, 0), (1, 1, 2), (2, 2, 4), (3, 1, 2), (4, 0, 0)], depths);
    }

    fn small_int_op() -> impl Strategy<Value = u8> {
        prop::sample::select(vec![
            opcodes::ICONST_0,
            opcodes::ICONST_1,
            opcodes::ICONST_M1,
            opcodes::ILOAD_1,
            opcodes::ISTORE_1,
            opcodes::IADD,
            opcodes::ISUB,
            opcodes::IMUL,
            opcodes::IAND,
            opcodes::IOR,
            opcodes::INEG,
            opcodes::DUP,
            opcodes::SWAP,
            opcodes::POP,
        ])
    }

    fn item_strategy() -> impl Strategy<Value = StackItem> {
        prop_oneof![
            any::<i32>().prop_map(|value| StackItem::constant(Constant::Int(value))),
            Just(StackItem::constant(Constant::Int(0))),
            Just(StackItem::unknown("I")),
            (0u16..4).prop_map(|index| StackItem::new("I", Provenance::Parameter(index))),
        ]
    }

    proptest! {
        #[test]
        fn must_be_zero_implies_could_be_zero_after_simulation(
            ops in prop::collection::vec(small_int_op(), 0..40),
        ) {
            let mut bytecode = ops;
            bytecode.push(opcodes::RETURN);
            let sample = method("(I)V", true, bytecode);
            let class = class_with(vec![sample.clone()]);
            let code = sample.code.as_ref().expect("code");
            let stream = InstructionStream::new(code, &class.constant_pool).expect("stream");
            let flow = analyze_flow(&stream, &[]).expect("flow");
            let mut stack = OpcodeStack::new(0);
            stack.enter_class(&class);
            stack.enter_method(&sample).expect("enter");
            for inst in stream.iter() {
                stack.enter_offset(inst.offset, &flow);
                stack.apply(inst, &stream).expect("apply");
                for n in 0..stack.depth() {
                    let item = stack.item(n).expect("item");
                    prop_assert!(!item.must_be_zero() || item.could_be_zero());
                }
                if let Some(local) = stack.local(1) {
                    prop_assert!(!local.must_be_zero() || local.could_be_zero());
                }
            }
        }

        #[test]
        fn must_be_zero_implies_could_be_zero_across_merges(
            items in prop::collection::vec(item_strategy(), 1..8),
        ) {
            let mut merged = items[0].clone();
            for item in &items[1..] {
                merged = merge_items(&merged, item);
                prop_assert!(!merged.must_be_zero() || merged.could_be_zero());
                prop_assert!(!merged.invalidated().must_be_zero());
            }
            if items.iter().any(StackItem::must_be_zero) {
                prop_assert!(merged.could_be_zero());
            }
            match merged.int_value() {
                Some(value) => prop_assert_eq!(value == 0, merged.could_be_zero()),
                None => prop_assert!(merged.could_be_zero()),
            }
        }
    }
}
