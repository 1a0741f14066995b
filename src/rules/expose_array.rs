use std::collections::BTreeSet;

use anyhow::Result;

use crate::descriptor;
use crate::detector::{
    Capabilities, ClassContext, Detector, InstructionContext, MethodContext, Reporter,
    RuleMetadata,
};
use crate::engine::AnalysisContext;
use crate::findings::{Finding, Priority};
use crate::ir::Class;
use crate::opcodes;
use crate::stack::{Provenance, SpecialKind};

const MS_EXPOSE_ARRAY: &str = "MS_EXPOSE_ARRAY";
const GENERATED: [&str; 2] = [
    "Ljavax/annotation/processing/Generated;",
    "Ljavax/annotation/Generated;",
];

static PATTERNS: &[RuleMetadata] = &[RuleMetadata {
    id: MS_EXPOSE_ARRAY,
    name: "Public method returns internal array",
    description: "Callers can modify the array stored in a non-public field",
    default_priority: Priority::Normal,
}];

/// Public methods returning a non-public array field of their own class.
///
/// Fields that only ever hold zero-length arrays cannot be modified through
/// the returned reference. Since stores may sit in any method, exposures are
/// collected per class and judged at class exit. A method contributes only
/// once it has been simulated to the end.
#[derive(Default)]
pub(crate) struct ExposeArrayDetector {
    /// Non-public array fields declared by the class.
    hidden_arrays: BTreeSet<String>,
    class: ArrayFacts,
    method: ArrayFacts,
}

#[derive(Default)]
struct ArrayFacts {
    empty_stores: BTreeSet<String>,
    other_stores: BTreeSet<String>,
    exposures: Vec<(String, Finding)>,
}

impl ArrayFacts {
    fn absorb(&mut self, other: ArrayFacts) {
        self.empty_stores.extend(other.empty_stores);
        self.other_stores.extend(other.other_stores);
        self.exposures.extend(other.exposures);
    }

    fn is_empty_array_field(&self, field: &str) -> bool {
        self.empty_stores.contains(field) && !self.other_stores.contains(field)
    }
}

impl Detector for ExposeArrayDetector {
    fn name(&self) -> &'static str {
        "ExposeArray"
    }

    fn patterns(&self) -> &'static [RuleMetadata] {
        PATTERNS
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::INSTRUCTIONS
            .with_class_enter()
            .with_method_exit()
            .with_class_exit()
    }

    fn interest(&self, class: &Class, _analysis: &AnalysisContext) -> bool {
        !class.access.is_interface
            && !GENERATED
                .iter()
                .any(|annotation| class.has_annotation(annotation))
    }

    fn on_class_enter(
        &mut self,
        cx: &ClassContext<'_>,
        _reporter: &mut Reporter<'_>,
    ) -> Result<()> {
        self.hidden_arrays = cx
            .class
            .fields
            .iter()
            .filter(|field| !field.access.is_public && descriptor::is_array(&field.descriptor))
            .map(|field| field.name.clone())
            .collect();
        Ok(())
    }

    fn on_method_enter(&mut self, _cx: &MethodContext<'_>) -> Result<()> {
        self.method = ArrayFacts::default();
        Ok(())
    }

    fn on_instruction(
        &mut self,
        cx: &InstructionContext<'_>,
        _reporter: &mut Reporter<'_>,
    ) -> Result<()> {
        let Some(top) = cx.stack.item(0) else {
            return Ok(());
        };
        match cx.opcode() {
            opcodes::PUTSTATIC | opcodes::PUTFIELD => {
                let Some(field) = cx.instruction.field_ref() else {
                    return Ok(());
                };
                if field.owner != cx.class.name
                    || !descriptor::is_array(&field.descriptor)
                    || top.is_null()
                {
                    return Ok(());
                }
                if top.special() == Some(SpecialKind::EmptyArray) {
                    self.method.empty_stores.insert(field.name.clone());
                } else {
                    self.method.other_stores.insert(field.name.clone());
                }
            }
            opcodes::ARETURN if cx.method.access.is_public && !cx.method.access.is_synthetic => {
                let Provenance::FieldValueOf(field) = top.provenance() else {
                    return Ok(());
                };
                if field.owner == cx.class.name && self.hidden_arrays.contains(&field.name) {
                    let finding = cx
                        .finding(MS_EXPOSE_ARRAY, Priority::Normal)
                        .with_message(format!(
                            "{} returns internal array field {}",
                            cx.method.name, field.name
                        ))
                        .annotate(format!("field={}", field.name));
                    self.method.exposures.push((field.name.clone(), finding));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn on_method_abort(&mut self, _cx: &MethodContext<'_>) -> Result<()> {
        self.method = ArrayFacts::default();
        Ok(())
    }

    fn on_method_exit(
        &mut self,
        _cx: &MethodContext<'_>,
        _reporter: &mut Reporter<'_>,
    ) -> Result<()> {
        let method = std::mem::take(&mut self.method);
        self.class.absorb(method);
        Ok(())
    }

    fn on_class_exit(&mut self, _cx: &ClassContext<'_>, reporter: &mut Reporter<'_>) -> Result<()> {
        for (field, finding) in std::mem::take(&mut self.class.exposures) {
            if !self.class.is_empty_array_field(&field) {
                reporter.report(finding);
            }
        }
        Ok(())
    }
}
