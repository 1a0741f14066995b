use anyhow::Result;

use crate::descriptor::{object_class_name, parse_method_descriptor};
use crate::detector::{
    Detector, InstructionContext, MethodContext, Region, RegionStep, Reporter, RuleMetadata,
};
use crate::engine::AnalysisContext;
use crate::findings::Priority;
use crate::ir::{Class, MethodRef};
use crate::stack::Provenance;

const DMI_OPTIONAL_OR_ELSE_CALL: &str = "DMI_OPTIONAL_OR_ELSE_CALL";
const OPTIONAL: &str = "java/util/Optional";

static PATTERNS: &[RuleMetadata] = &[RuleMetadata {
    id: DMI_OPTIONAL_OR_ELSE_CALL,
    name: "Method call evaluated eagerly as Optional.orElse argument",
    description: "The fallback is computed even when the Optional has a value; use orElseGet",
    default_priority: Priority::Normal,
}];

/// `Optional` chains whose `orElse` fallback is the result of a call.
#[derive(Default)]
pub(crate) struct OptionalOrElseDetector {
    chain: Region,
}

impl Detector for OptionalOrElseDetector {
    fn name(&self) -> &'static str {
        "OptionalOrElse"
    }

    fn patterns(&self) -> &'static [RuleMetadata] {
        PATTERNS
    }

    fn interest(&self, class: &Class, _analysis: &AnalysisContext) -> bool {
        class.references_class(OPTIONAL) && class.references_member("orElse")
    }

    fn region(&mut self) -> Option<&mut Region> {
        Some(&mut self.chain)
    }

    fn on_method_enter(&mut self, _cx: &MethodContext<'_>) -> Result<()> {
        self.chain.reset();
        Ok(())
    }

    fn on_instruction(
        &mut self,
        cx: &InstructionContext<'_>,
        reporter: &mut Reporter<'_>,
    ) -> Result<()> {
        let Some(call) = cx.instruction.method_ref() else {
            return Ok(());
        };
        let opens = returns_optional(call);
        let closes = call.owner == OPTIONAL && call.name == "orElse";
        match self.chain.step(cx.instruction.offset, opens, closes) {
            RegionStep::Closed(_) => {
                let fallback = cx.stack.item(0).map(|item| item.provenance());
                if let Some(Provenance::ReturnValueOf(callee)) = fallback {
                    if !is_cheap(callee) {
                        reporter.report(
                            cx.finding(DMI_OPTIONAL_OR_ELSE_CALL, Priority::Normal)
                                .with_message(format!(
                                    "Result of {}.{} passed to Optional.orElse is always computed",
                                    callee.owner, callee.name
                                ))
                                .annotate(format!("callee={}.{}", callee.owner, callee.name)),
                        );
                    }
                }
            }
            RegionStep::Inside if call.owner == OPTIONAL && !opens => {
                // orElseGet, orElseThrow, get, ... end the chain without a fallback.
                self.chain.reset();
            }
            RegionStep::Inside | RegionStep::Opened | RegionStep::Outside => {}
        }
        Ok(())
    }
}

fn returns_optional(call: &MethodRef) -> bool {
    parse_method_descriptor(&call.descriptor)
        .is_ok_and(|parsed| object_class_name(&parsed.return_type) == Some(OPTIONAL))
}

/// Calls with no side effects worth deferring.
fn is_cheap(callee: &MethodRef) -> bool {
    callee.name == "valueOf"
        || callee.owner == "java/util/Collections"
        || (callee.owner == "java/util/List" && callee.name == "of")
        || (callee.owner == "java/util/Map" && callee.name == "of")
        || (callee.owner == "java/util/Set" && callee.name == "of")
}
