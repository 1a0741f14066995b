use anyhow::Result;

use crate::descriptor::parse_method_descriptor;
use crate::detector::{
    Detector, InstructionContext, MethodContext, Region, RegionStep, Reporter, RuleMetadata,
};
use crate::engine::AnalysisContext;
use crate::findings::Priority;
use crate::ir::{CallKind, Class};
use crate::opcodes;
use crate::stack::{Provenance, StackItem};

const ASSERTION_OF_ARGUMENTS: &str = "ASSERTION_OF_ARGUMENTS";
const ASSERTIONS_DISABLED: &str = "$assertionsDisabled";

static PATTERNS: &[RuleMetadata] = &[RuleMetadata {
    id: ASSERTION_OF_ARGUMENTS,
    name: "Assertion used to check an argument of a public method",
    description: "Assertions may be disabled, so they cannot validate public method arguments",
    default_priority: Priority::Low,
}];

/// Argument checks inside `assert` statements of public methods.
///
/// The region opens on the `$assertionsDisabled` guard and closes when the
/// `AssertionError` is constructed. Checks on parameters inside it are held
/// until the closer confirms this really was an assertion.
#[derive(Default)]
pub(crate) struct AssertionOfArgumentsDetector {
    assertion: Region,
    checks_public_method: bool,
}

impl Detector for AssertionOfArgumentsDetector {
    fn name(&self) -> &'static str {
        "AssertionOfArguments"
    }

    fn patterns(&self) -> &'static [RuleMetadata] {
        PATTERNS
    }

    fn interest(&self, class: &Class, _analysis: &AnalysisContext) -> bool {
        class.references_member(ASSERTIONS_DISABLED)
    }

    fn region(&mut self) -> Option<&mut Region> {
        Some(&mut self.assertion)
    }

    fn on_method_enter(&mut self, cx: &MethodContext<'_>) -> Result<()> {
        self.assertion.reset();
        self.checks_public_method = cx.method.access.is_public;
        Ok(())
    }

    fn on_instruction(
        &mut self,
        cx: &InstructionContext<'_>,
        reporter: &mut Reporter<'_>,
    ) -> Result<()> {
        if !self.checks_public_method {
            return Ok(());
        }
        let opens = cx.opcode() == opcodes::GETSTATIC
            && cx
                .instruction
                .field_ref()
                .is_some_and(|field| field.name == ASSERTIONS_DISABLED);
        let closes = cx.opcode() == opcodes::INVOKESPECIAL
            && cx
                .instruction
                .is_call_to("java/lang/AssertionError", "<init>");
        match self.assertion.step(cx.instruction.offset, opens, closes) {
            RegionStep::Inside => {
                if let Some(parameter) = checked_parameter(cx)? {
                    self.assertion.hold(
                        cx.finding(ASSERTION_OF_ARGUMENTS, Priority::Low)
                            .with_message(format!(
                                "Assertion checks argument {parameter} of public method {}",
                                cx.method.name
                            ))
                            .annotate(format!("parameter={parameter}")),
                    );
                }
            }
            RegionStep::Closed(confirmed) => {
                for finding in confirmed {
                    reporter.report(finding);
                }
            }
            RegionStep::Opened | RegionStep::Outside => {}
        }
        Ok(())
    }
}

/// Parameter index consumed by a condition or a call at this instruction.
fn checked_parameter(cx: &InstructionContext<'_>) -> Result<Option<u16>> {
    let operands = match cx.opcode() {
        opcodes::IFEQ..=opcodes::IFLE | opcodes::IFNULL | opcodes::IFNONNULL => 1,
        opcodes::IF_ICMPEQ..=opcodes::IF_ACMPNE => 2,
        opcodes::INVOKEVIRTUAL..=opcodes::INVOKEINTERFACE => match cx.instruction.method_ref() {
            Some(call) => {
                let receiver = usize::from(call.kind != CallKind::Static);
                parse_method_descriptor(&call.descriptor)?.parameters.len() + receiver
            }
            None => 0,
        },
        _ => 0,
    };
    Ok((0..operands)
        .filter_map(|n| cx.stack.item(n))
        .find_map(parameter_index))
}

fn parameter_index(item: &StackItem) -> Option<u16> {
    match item.provenance() {
        Provenance::Parameter(index) => Some(*index),
        _ => None,
    }
}
