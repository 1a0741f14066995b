use std::collections::HashMap;

use crate::classfile::ConstantPool;
use crate::error::EngineError;
use crate::ir::{CallKind, Code, Instruction, LineNumber, Operand, SwitchTable};
use crate::opcodes;

/// Decode a method body into instructions in program order.
///
/// A `wide` prefix is folded into the instruction it modifies: the record
/// carries the modified opcode with `wide` set and the full six or four byte
/// length.
pub(crate) fn decode_instructions(
    code: &[u8],
    pool: &ConstantPool,
) -> Result<Vec<Instruction>, EngineError> {
    let mut instructions = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        let instruction = decode_at(code, offset, pool)?;
        offset += instruction.length as usize;
        instructions.push(instruction);
    }
    Ok(instructions)
}

fn decode_at(code: &[u8], offset: usize, pool: &ConstantPool) -> Result<Instruction, EngineError> {
    let raw = code[offset];
    let at = offset as u32;
    let (opcode, length, wide, operand) = match raw {
        opcodes::WIDE => {
            let inner = read_u8(code, offset + 1)?;
            let local = read_u16(code, offset + 2)?;
            if inner == opcodes::IINC {
                let delta = i32::from(read_i16(code, offset + 4)?);
                (inner, 6, true, Operand::Iinc { local, delta })
            } else if is_local_access(inner) {
                (inner, 4, true, Operand::Local(local))
            } else {
                return Err(EngineError::malformed(
                    at,
                    format!("wide cannot modify {}", opcodes::name(inner)),
                ));
            }
        }
        opcodes::TABLESWITCH => {
            let base = offset + 1 + padding(offset);
            let default = read_i32(code, base)?;
            let low = read_i32(code, base + 4)?;
            let high = read_i32(code, base + 8)?;
            if high < low {
                return Err(EngineError::malformed(at, "tableswitch high < low"));
            }
            let count = (i64::from(high) - i64::from(low) + 1) as usize;
            let end = table_end(code, at, base + 12, count, 4)?;
            let mut cases = Vec::new();
            for index in 0..count {
                let delta = read_i32(code, base + 12 + index * 4)?;
                cases.push((low.wrapping_add(index as i32), delta));
            }
            (
                raw,
                end - offset,
                false,
                Operand::Switch(SwitchTable { default, cases }),
            )
        }
        opcodes::LOOKUPSWITCH => {
            let base = offset + 1 + padding(offset);
            let default = read_i32(code, base)?;
            let pairs = read_i32(code, base + 4)?;
            if pairs < 0 {
                return Err(EngineError::malformed(at, "negative lookupswitch pair count"));
            }
            let end = table_end(code, at, base + 8, pairs as usize, 8)?;
            let mut cases = Vec::new();
            for index in 0..pairs as usize {
                let key = read_i32(code, base + 8 + index * 8)?;
                let delta = read_i32(code, base + 12 + index * 8)?;
                cases.push((key, delta));
            }
            (
                raw,
                end - offset,
                false,
                Operand::Switch(SwitchTable { default, cases }),
            )
        }
        _ => {
            let operand_len = opcodes::operand_len(raw)
                .ok_or_else(|| EngineError::malformed(at, format!("unknown opcode {raw:#04x}")))?;
            if operand_len > 0 && offset + operand_len >= code.len() {
                return Err(EngineError::malformed(
                    at,
                    format!("truncated operands for {}", opcodes::name(raw)),
                ));
            }
            let operand = decode_operand(code, offset, raw, pool)?;
            (raw, 1 + operand_len, false, operand)
        }
    };
    Ok(Instruction {
        offset: at,
        opcode,
        length: length as u32,
        wide,
        operand,
    })
}

fn decode_operand(
    code: &[u8],
    offset: usize,
    opcode: u8,
    pool: &ConstantPool,
) -> Result<Operand, EngineError> {
    let operand = match opcode {
        opcodes::BIPUSH => Operand::Immediate(i32::from(read_u8(code, offset + 1)? as i8)),
        opcodes::SIPUSH => Operand::Immediate(i32::from(read_i16(code, offset + 1)?)),
        opcodes::NEWARRAY => Operand::Immediate(i32::from(read_u8(code, offset + 1)?)),
        opcodes::LDC => {
            let index = u16::from(read_u8(code, offset + 1)?);
            Operand::Constant(pool.loadable(index)?)
        }
        opcodes::LDC_W | opcodes::LDC2_W => {
            Operand::Constant(pool.loadable(read_u16(code, offset + 1)?)?)
        }
        opcodes::ILOAD..=opcodes::ALOAD
        | opcodes::ISTORE..=opcodes::ASTORE
        | opcodes::RET => Operand::Local(u16::from(read_u8(code, offset + 1)?)),
        opcodes::ILOAD_0..=opcodes::ALOAD_3 => {
            Operand::Local(u16::from((opcode - opcodes::ILOAD_0) % 4))
        }
        opcodes::ISTORE_0..=opcodes::ASTORE_3 => {
            Operand::Local(u16::from((opcode - opcodes::ISTORE_0) % 4))
        }
        opcodes::IINC => Operand::Iinc {
            local: u16::from(read_u8(code, offset + 1)?),
            delta: i32::from(read_u8(code, offset + 2)? as i8),
        },
        opcodes::IFEQ..=opcodes::JSR | opcodes::IFNULL | opcodes::IFNONNULL => {
            Operand::Branch(i32::from(read_i16(code, offset + 1)?))
        }
        opcodes::GOTO_W | opcodes::JSR_W => Operand::Branch(read_i32(code, offset + 1)?),
        opcodes::GETSTATIC..=opcodes::PUTFIELD => {
            Operand::Field(pool.field_ref(read_u16(code, offset + 1)?)?)
        }
        opcodes::INVOKEVIRTUAL => {
            Operand::Method(pool.method_ref(read_u16(code, offset + 1)?, CallKind::Virtual)?)
        }
        opcodes::INVOKESPECIAL => {
            Operand::Method(pool.method_ref(read_u16(code, offset + 1)?, CallKind::Special)?)
        }
        opcodes::INVOKESTATIC => {
            Operand::Method(pool.method_ref(read_u16(code, offset + 1)?, CallKind::Static)?)
        }
        opcodes::INVOKEINTERFACE => {
            Operand::Method(pool.method_ref(read_u16(code, offset + 1)?, CallKind::Interface)?)
        }
        opcodes::INVOKEDYNAMIC => {
            let (name, descriptor) = pool.invoke_dynamic(read_u16(code, offset + 1)?)?;
            Operand::Dynamic { name, descriptor }
        }
        opcodes::NEW | opcodes::ANEWARRAY | opcodes::CHECKCAST | opcodes::INSTANCEOF => {
            Operand::Class(pool.class_name(read_u16(code, offset + 1)?)?.to_string())
        }
        opcodes::MULTIANEWARRAY => Operand::MultiArray {
            class: pool.class_name(read_u16(code, offset + 1)?)?.to_string(),
            dimensions: read_u8(code, offset + 3)?,
        },
        _ => Operand::None,
    };
    Ok(operand)
}

fn is_local_access(opcode: u8) -> bool {
    matches!(
        opcode,
        opcodes::ILOAD..=opcodes::ALOAD | opcodes::ISTORE..=opcodes::ASTORE | opcodes::RET
    )
}

/// Switch operands are aligned to a four-byte boundary from the method start.
/// End of a switch table whose `entries` start at `start`; the table must fit in `code`.
fn table_end(
    code: &[u8],
    at: u32,
    start: usize,
    entries: usize,
    entry_len: usize,
) -> Result<usize, EngineError> {
    entries
        .checked_mul(entry_len)
        .and_then(|len| start.checked_add(len))
        .filter(|end| *end <= code.len())
        .ok_or_else(|| {
            EngineError::malformed(
                at,
                format!("switch table of {entries} entries overruns the method body"),
            )
        })
}

fn padding(offset: usize) -> usize {
    (4 - ((offset + 1) % 4)) % 4
}

fn read_u8(code: &[u8], offset: usize) -> Result<u8, EngineError> {
    code.get(offset).copied().ok_or(EngineError::OutOfRange {
        offset: offset as i64,
        code_length: code.len(),
    })
}

fn read_u16(code: &[u8], offset: usize) -> Result<u16, EngineError> {
    Ok(u16::from_be_bytes([read_u8(code, offset)?, read_u8(code, offset + 1)?]))
}

fn read_i16(code: &[u8], offset: usize) -> Result<i16, EngineError> {
    Ok(read_u16(code, offset)? as i16)
}

fn read_i32(code: &[u8], offset: usize) -> Result<i32, EngineError> {
    let high = u32::from(read_u16(code, offset)?);
    let low = u32::from(read_u16(code, offset + 2)?);
    Ok(((high << 16) | low) as i32)
}

/// Program-order view over one method body.
///
/// Iteration restarts with every call to [`InstructionStream::iter`]; branch
/// targets and look-behind use offset lookups instead of re-decoding.
pub(crate) struct InstructionStream<'a> {
    bytecode: &'a [u8],
    line_numbers: &'a [LineNumber],
    instructions: Vec<Instruction>,
    index_by_offset: HashMap<u32, usize>,
}

impl<'a> InstructionStream<'a> {
    pub(crate) fn new(code: &'a Code, pool: &ConstantPool) -> Result<Self, EngineError> {
        let instructions = decode_instructions(&code.bytecode, pool)?;
        Ok(Self::from_parts(&code.bytecode, &code.line_numbers, instructions))
    }

    pub(crate) fn from_parts(
        bytecode: &'a [u8],
        line_numbers: &'a [LineNumber],
        instructions: Vec<Instruction>,
    ) -> Self {
        let index_by_offset = instructions
            .iter()
            .enumerate()
            .map(|(index, inst)| (inst.offset, index))
            .collect();
        Self {
            bytecode,
            line_numbers,
            instructions,
            index_by_offset,
        }
    }

    pub(crate) fn iter(&self) -> std::slice::Iter<'_, Instruction> {
        self.instructions.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.instructions.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub(crate) fn code_length(&self) -> usize {
        self.bytecode.len()
    }

    pub(crate) fn index_of(&self, offset: u32) -> Option<usize> {
        self.index_by_offset.get(&offset).copied()
    }

    /// Instruction starting exactly at `offset`.
    pub(crate) fn at(&self, offset: u32) -> Result<&Instruction, EngineError> {
        self.check_bounds(i64::from(offset))?;
        self.index_of(offset)
            .map(|index| &self.instructions[index])
            .ok_or_else(|| EngineError::malformed(offset, "offset is not an instruction boundary"))
    }

    /// Instruction `n` positions before `inst` in program order.
    pub(crate) fn previous(&self, inst: &Instruction, n: usize) -> Option<&Instruction> {
        let index = self.index_of(inst.offset)?;
        index.checked_sub(n).map(|prior| &self.instructions[prior])
    }

    pub(crate) fn following(&self, inst: &Instruction) -> Option<&Instruction> {
        let index = self.index_of(inst.offset)?;
        self.instructions.get(index + 1)
    }

    /// Raw code byte at an absolute offset.
    pub(crate) fn peek_byte(&self, offset: i64) -> Result<u8, EngineError> {
        self.check_bounds(offset)?;
        Ok(self.bytecode[offset as usize])
    }

    /// Raw code byte `delta` bytes after the start of `inst`.
    pub(crate) fn next_code_byte(&self, inst: &Instruction, delta: i64) -> Result<u8, EngineError> {
        self.peek_byte(i64::from(inst.offset) + delta)
    }

    /// Absolute target of a conditional jump, `goto`/`goto_w` or `jsr`/`jsr_w`.
    pub(crate) fn branch_target(&self, inst: &Instruction) -> Result<u32, EngineError> {
        match inst.operand {
            Operand::Branch(delta) => self.resolve(inst, delta),
            _ => Err(EngineError::malformed(
                inst.offset,
                format!("{} has no branch target", opcodes::name(inst.opcode)),
            )),
        }
    }

    /// Default target first, then case targets in table order.
    pub(crate) fn switch_targets(&self, inst: &Instruction) -> Result<Vec<u32>, EngineError> {
        let Operand::Switch(table) = &inst.operand else {
            return Err(EngineError::malformed(inst.offset, "not a switch"));
        };
        let mut targets = Vec::with_capacity(table.cases.len() + 1);
        targets.push(self.resolve(inst, table.default)?);
        for (_, delta) in &table.cases {
            targets.push(self.resolve(inst, *delta)?);
        }
        Ok(targets)
    }

    /// Every explicit jump target of `inst` (empty for straight-line opcodes).
    pub(crate) fn jump_targets(&self, inst: &Instruction) -> Result<Vec<u32>, EngineError> {
        match inst.operand {
            Operand::Branch(_) => Ok(vec![self.branch_target(inst)?]),
            Operand::Switch(_) => self.switch_targets(inst),
            _ => Ok(Vec::new()),
        }
    }

    /// Source line of the LineNumberTable entry covering `offset`.
    pub(crate) fn line_for_offset(&self, offset: u32) -> Option<u32> {
        line_for_offset(self.line_numbers, offset)
    }

    fn resolve(&self, inst: &Instruction, delta: i32) -> Result<u32, EngineError> {
        let target = i64::from(inst.offset) + i64::from(delta);
        self.check_bounds(target)?;
        Ok(target as u32)
    }

    fn check_bounds(&self, offset: i64) -> Result<(), EngineError> {
        if offset < 0 || offset >= self.bytecode.len() as i64 {
            return Err(EngineError::OutOfRange {
                offset,
                code_length: self.bytecode.len(),
            });
        }
        Ok(())
    }
}

/// `line_numbers` must be sorted by `start_pc`.
pub(crate) fn line_for_offset(line_numbers: &[LineNumber], offset: u32) -> Option<u32> {
    line_numbers
        .iter()
        .take_while(|entry| entry.start_pc <= offset)
        .last()
        .map(|entry| entry.line)
}
