use anyhow::Result;

use crate::detector::{Detector, InstructionContext, Reporter, RuleMetadata};
use crate::findings::Priority;
use crate::opcodes;
use crate::stack::Provenance;

const RCN_REDUNDANT_NULLCHECK_OF_NEW: &str = "RCN_REDUNDANT_NULLCHECK_OF_NEW";

static PATTERNS: &[RuleMetadata] = &[RuleMetadata {
    id: RCN_REDUNDANT_NULLCHECK_OF_NEW,
    name: "Redundant null check of new object",
    description: "A freshly allocated object is compared against null",
    default_priority: Priority::Normal,
}];

/// Null checks on values that come straight from `new`.
pub(crate) struct RedundantNullCheckDetector;

impl Detector for RedundantNullCheckDetector {
    fn name(&self) -> &'static str {
        "RedundantNullCheck"
    }

    fn patterns(&self) -> &'static [RuleMetadata] {
        PATTERNS
    }

    fn on_instruction(
        &mut self,
        cx: &InstructionContext<'_>,
        reporter: &mut Reporter<'_>,
    ) -> Result<()> {
        if !matches!(cx.opcode(), opcodes::IFNULL | opcodes::IFNONNULL) {
            return Ok(());
        }
        let Some(tested) = cx.stack.item(0) else {
            return Ok(());
        };
        if *tested.provenance() != Provenance::NewlyAllocated || tested.is_null() {
            return Ok(());
        }
        let mut finding = cx
            .finding(RCN_REDUNDANT_NULLCHECK_OF_NEW, Priority::Normal)
            .with_message(format!(
                "Redundant null check of newly allocated {}",
                tested.signature()
            ));
        if let Some(register) = tested.register() {
            finding = finding.annotate(format!("local={register}"));
        }
        reporter.report(finding);
        Ok(())
    }
}
