use anyhow::Result;

use crate::detector::{
    Detector, InstructionContext, MethodContext, Region, RegionStep, Reporter, RuleMetadata,
};
use crate::engine::AnalysisContext;
use crate::findings::Priority;
use crate::ir::Class;
use crate::opcodes;

const ICAST_INT_CAST_TO_DOUBLE_PASSED_TO_CEIL: &str = "ICAST_INT_CAST_TO_DOUBLE_PASSED_TO_CEIL";

static PATTERNS: &[RuleMetadata] = &[RuleMetadata {
    id: ICAST_INT_CAST_TO_DOUBLE_PASSED_TO_CEIL,
    name: "Integral division result cast to double then passed to Math.ceil",
    description: "The division already truncated, so ceil has no effect",
    default_priority: Priority::High,
}];

/// `idiv`/`ldiv`, then `i2d`/`l2d`, then `Math.ceil`, back to back.
///
/// The cast opens a pending region that must be closed by the very next
/// instruction; anything else drops it.
#[derive(Default)]
pub(crate) struct CeilOfIntDivisionDetector {
    pending_cast: Region,
}

impl Detector for CeilOfIntDivisionDetector {
    fn name(&self) -> &'static str {
        "CeilOfIntDivision"
    }

    fn patterns(&self) -> &'static [RuleMetadata] {
        PATTERNS
    }

    fn interest(&self, class: &Class, _analysis: &AnalysisContext) -> bool {
        class.references_class("java/lang/Math") && class.references_member("ceil")
    }

    fn max_lookback(&self) -> usize {
        1
    }

    fn region(&mut self) -> Option<&mut Region> {
        Some(&mut self.pending_cast)
    }

    fn on_method_enter(&mut self, _cx: &MethodContext<'_>) -> Result<()> {
        self.pending_cast.reset();
        Ok(())
    }

    fn on_instruction(
        &mut self,
        cx: &InstructionContext<'_>,
        reporter: &mut Reporter<'_>,
    ) -> Result<()> {
        let opens = matches!(cx.opcode(), opcodes::I2D | opcodes::L2D)
            && matches!(cx.prev_opcode(1), opcodes::IDIV | opcodes::LDIV);
        let closes = cx.opcode() == opcodes::INVOKESTATIC
            && cx.instruction.is_call_to("java/lang/Math", "ceil");
        match self.pending_cast.step(cx.instruction.offset, opens, closes) {
            RegionStep::Closed(_) => {
                reporter.report(
                    cx.finding(ICAST_INT_CAST_TO_DOUBLE_PASSED_TO_CEIL, Priority::High)
                        .with_message(
                            "Integral division result cast to double and passed to Math.ceil",
                        ),
                );
            }
            RegionStep::Inside => self.pending_cast.reset(),
            RegionStep::Opened | RegionStep::Outside => {}
        }
        Ok(())
    }
}
