use std::collections::BTreeSet;

use anyhow::Result;

use crate::detector::{Detector, InstructionContext, Reporter, RuleMetadata};
use crate::findings::Priority;
use crate::ir::Instruction;
use crate::opcodes;

const QF_QUESTIONABLE_FOR_LOOP: &str = "QF_QUESTIONABLE_FOR_LOOP";

/// Instructions examined after the loop condition label.
const CONDITION_WINDOW: usize = 8;

static PATTERNS: &[RuleMetadata] = &[RuleMetadata {
    id: QF_QUESTIONABLE_FOR_LOOP,
    name: "For loop increments a variable its condition never tests",
    description: "The loop condition reads different locals than the update step increments",
    default_priority: Priority::Normal,
}];

/// `for` loops shaped `goto cond; body; iinc j; cond: ... i ...; if<cmp> body`
/// where `j` is not among the locals the condition loads.
pub(crate) struct QuestionableForLoopDetector;

impl Detector for QuestionableForLoopDetector {
    fn name(&self) -> &'static str {
        "QuestionableForLoop"
    }

    fn patterns(&self) -> &'static [RuleMetadata] {
        PATTERNS
    }

    fn on_instruction(
        &mut self,
        cx: &InstructionContext<'_>,
        reporter: &mut Reporter<'_>,
    ) -> Result<()> {
        if cx.opcode() != opcodes::GOTO {
            return Ok(());
        }
        let condition = cx.stream.branch_target(cx.instruction)?;
        if condition <= cx.instruction.offset || condition < 3 {
            return Ok(());
        }
        if cx.stream.peek_byte(i64::from(condition) - 3)? != opcodes::IINC {
            return Ok(());
        }
        let Some(update) = cx
            .stream
            .previous(cx.stream.at(condition)?, 1)
            .filter(|update| update.next_offset() == condition && update.opcode == opcodes::IINC)
        else {
            return Ok(());
        };
        let incremented = u16::from(cx.stream.next_code_byte(update, 1)?);
        let Some(tested) = condition_locals(cx, condition)? else {
            return Ok(());
        };
        if tested.is_empty() || tested.contains(&incremented) {
            return Ok(());
        }
        let tested = tested
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",");
        reporter.report(
            cx.finding(QF_QUESTIONABLE_FOR_LOOP, Priority::Normal)
                .with_message(format!(
                    "Loop increments local {incremented} but its condition tests local(s) {tested}"
                ))
                .annotate(format!("incremented={incremented}"))
                .annotate(format!("tested={tested}")),
        );
        Ok(())
    }
}

/// Integer locals loaded by the loop condition at `condition`, provided the
/// condition branches back to the instruction right after the `goto`.
fn condition_locals(
    cx: &InstructionContext<'_>,
    condition: u32,
) -> Result<Option<BTreeSet<u16>>> {
    let body = cx.instruction.next_offset();
    let mut loaded = BTreeSet::new();
    let mut current: Option<&Instruction> = Some(cx.stream.at(condition)?);
    for _ in 0..CONDITION_WINDOW {
        let Some(inst) = current else {
            break;
        };
        match inst.opcode {
            opcodes::ILOAD | opcodes::ILOAD_0..=opcodes::ILOAD_3 => {
                if let Some(local) = inst.local_index() {
                    loaded.insert(local);
                }
            }
            opcodes::IFEQ..=opcodes::IF_ACMPNE | opcodes::IFNULL | opcodes::IFNONNULL => {
                let loops_back = cx.stream.branch_target(inst)? == body;
                return Ok(loops_back.then_some(loaded));
            }
            opcodes::GOTO
            | opcodes::GOTO_W
            | opcodes::TABLESWITCH
            | opcodes::LOOKUPSWITCH
            | opcodes::IRETURN..=opcodes::RETURN
            | opcodes::ATHROW => break,
            _ => {}
        }
        current = cx.stream.following(inst);
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::tests::PoolBuilder;
    use crate::detector::DetectorRegistry;
    use crate::detector::tests::method_named;
    use crate::findings::Finding;
    use crate::rules::tests::{analyze, class_with};

    fn registry() -> DetectorRegistry {
        let mut registry = DetectorRegistry::new();
        registry.register(|| Box::new(QuestionableForLoopDetector));
        registry
    }

    /// `for (i = 0, j = 0; i < n; <local>++) {}` with `n` in local 0.
    fn counting_loop(incremented: u8) -> Vec<Finding> {
        // 0: iconst_0, 1: istore_1, 2: iconst_0, 3: istore_2, 4: goto +6 -> 10,
        // 7: iinc, 10: iload_1, 11: iload_0, 12: if_icmplt -5 -> 7, 15: return
        let mut method = method_named(
            "count",
            "(I)V",
            vec![
                opcodes::ICONST_0,
                opcodes::ISTORE_1,
                opcodes::ICONST_0,
                opcodes::ISTORE_2,
                opcodes::GOTO,
                0x00,
                0x06,
                opcodes::IINC,
                incremented,
                0x01,
                opcodes::ILOAD_1,
                opcodes::ILOAD_0,
                opcodes::IF_ICMPLT,
                0xff,
                0xfb,
                opcodes::RETURN,
            ],
        );
        method.access.is_static = true;
        let class = class_with("com/example/Loops", &PoolBuilder::new(), vec![method]);
        analyze(&registry(), &[class])
    }

    #[test]
    fn incrementing_an_untested_local_is_reported() {
        let findings = counting_loop(2);

        assert_eq!(1, findings.len());
        assert_eq!(QF_QUESTIONABLE_FOR_LOOP, findings[0].pattern_id);
        assert_eq!(Some(4), findings[0].offset);
        assert_eq!(
            vec!["incremented=2".to_string(), "tested=0,1".to_string()],
            findings[0].annotations
        );
    }

    #[test]
    fn incrementing_the_tested_local_is_fine() {
        assert!(counting_loop(1).is_empty());
    }

    #[test]
    fn forward_goto_without_update_step_is_ignored() {
        // 0: iload_0, 1: ifeq +7 -> 8, 4: iconst_1, 5: goto +4 -> 9, 8: iconst_0, 9: ireturn
        let mut method = method_named(
            "flag",
            "(I)I",
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
        method.access.is_static = true;
        let class = class_with("com/example/Loops", &PoolBuilder::new(), vec![method]);

        assert!(analyze(&registry(), &[class]).is_empty());
    }
}
