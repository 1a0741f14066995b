use anyhow::Result;

use crate::detector::{Detector, InstructionContext, Reporter, RuleMetadata};
use crate::engine::AnalysisContext;
use crate::findings::Priority;
use crate::ir::{Class, Constant};

const INSECURE_API: &str = "INSECURE_API";

static PATTERNS: &[RuleMetadata] = &[RuleMetadata {
    id: INSECURE_API,
    name: "Insecure API usage",
    description: "Calls to insecure process or reflection APIs",
    default_priority: Priority::Normal,
}];

const OWNERS: &[&str] = &[
    "java/lang/Runtime",
    "java/lang/ProcessBuilder",
    "java/lang/reflect/Method",
    "java/lang/reflect/Constructor",
    "java/lang/Class",
];

/// Detects process spawning and reflective invocation.
pub(crate) struct InsecureApiDetector;

impl Detector for InsecureApiDetector {
    fn name(&self) -> &'static str {
        "InsecureApi"
    }

    fn patterns(&self) -> &'static [RuleMetadata] {
        PATTERNS
    }

    fn interest(&self, class: &Class, _analysis: &AnalysisContext) -> bool {
        OWNERS.iter().any(|owner| class.references_class(owner))
    }

    fn on_instruction(
        &mut self,
        cx: &InstructionContext<'_>,
        reporter: &mut Reporter<'_>,
    ) -> Result<()> {
        let Some(call) = cx.instruction.method_ref() else {
            return Ok(());
        };
        if !is_insecure_call(&call.owner, &call.name) {
            return Ok(());
        }
        // A literal command or class name is fixed at compile time.
        let priority = if takes_literal_argument(cx) {
            Priority::Low
        } else {
            Priority::Normal
        };
        reporter.report(
            cx.finding(INSECURE_API, priority)
                .with_message(format!("Insecure API usage: {}.{}", call.owner, call.name)),
        );
        Ok(())
    }
}

fn is_insecure_call(owner: &str, name: &str) -> bool {
    matches!(
        (owner, name),
        ("java/lang/Runtime", "exec")
            | ("java/lang/ProcessBuilder", "<init>")
            | ("java/lang/ProcessBuilder", "start")
            | ("java/lang/reflect/Method", "invoke")
            | ("java/lang/reflect/Constructor", "newInstance")
            | ("java/lang/Class", "forName")
    )
}

fn takes_literal_argument(cx: &InstructionContext<'_>) -> bool {
    let Some(call) = cx.instruction.method_ref() else {
        return false;
    };
    call.descriptor.starts_with("(Ljava/lang/String;)")
        && cx
            .stack
            .item(0)
            .and_then(|item| item.constant_value())
            .is_some_and(|constant| matches!(constant, Constant::String(_)))
}
