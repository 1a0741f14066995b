use anyhow::Result;
use tracing::debug;

use crate::descriptor::parse_method_descriptor;
use crate::detector::{Detector, InstructionContext, Reporter, RuleMetadata};
use crate::engine::AnalysisContext;
use crate::error::EngineError;
use crate::findings::Priority;
use crate::ir::{Class, MethodRef};

const SQL_BAD_RESULTSET_ACCESS: &str = "SQL_BAD_RESULTSET_ACCESS";
const SQL_BAD_PREPARED_STATEMENT_ACCESS: &str = "SQL_BAD_PREPARED_STATEMENT_ACCESS";
const RESULT_SET: &str = "java/sql/ResultSet";
const PREPARED_STATEMENT: &str = "java/sql/PreparedStatement";

static PATTERNS: &[RuleMetadata] = &[
    RuleMetadata {
        id: SQL_BAD_RESULTSET_ACCESS,
        name: "ResultSet accessed with column index 0",
        description: "JDBC column indexes start at 1",
        default_priority: Priority::High,
    },
    RuleMetadata {
        id: SQL_BAD_PREPARED_STATEMENT_ACCESS,
        name: "PreparedStatement parameter set with index 0",
        description: "JDBC parameter indexes start at 1",
        default_priority: Priority::High,
    },
];

/// JDBC accessors called with an index that is, or may be, zero.
pub(crate) struct SqlBadIndexDetector;

impl Detector for SqlBadIndexDetector {
    fn name(&self) -> &'static str {
        "SqlBadIndex"
    }

    fn patterns(&self) -> &'static [RuleMetadata] {
        PATTERNS
    }

    fn interest(&self, class: &Class, analysis: &AnalysisContext) -> bool {
        class.referenced_classes.iter().any(|name| {
            [RESULT_SET, PREPARED_STATEMENT]
                .iter()
                .any(|jdbc| matches!(analysis.is_subtype(name, jdbc), Ok(true)))
        })
    }

    fn on_instruction(
        &mut self,
        cx: &InstructionContext<'_>,
        reporter: &mut Reporter<'_>,
    ) -> Result<()> {
        let Some(call) = cx.instruction.method_ref() else {
            return Ok(());
        };
        if !call.descriptor.starts_with("(I") {
            return Ok(());
        }
        let pattern = match jdbc_pattern(call, cx.analysis) {
            Ok(Some(pattern)) => pattern,
            Ok(None) => return Ok(()),
            Err(EngineError::MissingClass { name }) => {
                debug!(owner = %call.owner, missing = %name, "JDBC index check skipped");
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };
        let arguments = parse_method_descriptor(&call.descriptor)?.parameters.len();
        let Some(index) = cx.stack.item(arguments - 1) else {
            return Ok(());
        };
        let priority = if index.must_be_zero() {
            Priority::High
        } else if index.could_be_zero() {
            Priority::Normal
        } else {
            return Ok(());
        };
        let mut finding = cx
            .finding(pattern, priority)
            .with_message(format!(
                "{}.{} called with an index that {} zero",
                call.owner,
                call.name,
                if priority == Priority::High { "is" } else { "may be" }
            ))
            .annotate(format!("callee={}.{}", call.owner, call.name));
        if let Some(value) = index.int_value() {
            finding = finding.annotate(format!("index={value}"));
        }
        reporter.report(finding);
        Ok(())
    }
}

/// Pattern for an index-taking JDBC accessor, or `None` for other calls.
fn jdbc_pattern(
    call: &MethodRef,
    analysis: &AnalysisContext,
) -> Result<Option<&'static str>, EngineError> {
    let is_getter = call.name.starts_with("get") || call.name.starts_with("update");
    if is_getter && analysis.is_subtype(&call.owner, RESULT_SET)? {
        return Ok(Some(SQL_BAD_RESULTSET_ACCESS));
    }
    if call.name.starts_with("set") && analysis.is_subtype(&call.owner, PREPARED_STATEMENT)? {
        return Ok(Some(SQL_BAD_PREPARED_STATEMENT_ACCESS));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::tests::PoolBuilder;
    use crate::detector::DetectorRegistry;
    use crate::detector::tests::{class_named, method_named};
    use crate::findings::Finding;
    use crate::opcodes;
    use crate::rules::tests::{analyze, class_with, u16_bytes};

    fn registry() -> DetectorRegistry {
        let mut registry = DetectorRegistry::new();
        registry.register(|| Box::new(SqlBadIndexDetector));
        registry
    }

    fn get_string(owner: &str, index_code: &[u8]) -> (PoolBuilder, Vec<u8>) {
        let mut pool = PoolBuilder::new();
        pool.class(RESULT_SET);
        let getter = pool.interface_method_ref(owner, "getString", "(I)Ljava/lang/String;");
        let [hi, lo] = u16_bytes(getter);
        let mut code = vec![opcodes::ALOAD_0];
        code.extend_from_slice(index_code);
        code.extend_from_slice(&[opcodes::INVOKEINTERFACE, hi, lo, 0x02, 0x00, opcodes::ARETURN]);
        (pool, code)
    }

    fn run(owner: &str, descriptor: &str, index_code: &[u8], extra: Vec<Class>) -> Vec<Finding> {
        let (pool, code) = get_string(owner, index_code);
        let mut method = method_named("read", descriptor, code);
        method.access.is_static = true;
        let mut classes = vec![class_with("com/example/Dao", &pool, vec![method])];
        classes.extend(extra);
        analyze(&registry(), &classes)
    }

    #[test]
    fn literal_zero_column_is_high() {
        let findings = run(
            RESULT_SET,
            "(Ljava/sql/ResultSet;)Ljava/lang/String;",
            &[opcodes::ICONST_0],
            Vec::new(),
        );

        assert_eq!(1, findings.len());
        assert_eq!(SQL_BAD_RESULTSET_ACCESS, findings[0].pattern_id);
        assert_eq!(Priority::High, findings[0].priority);
        assert_eq!(
            vec![
                "callee=java/sql/ResultSet.getString".to_string(),
                "index=0".to_string()
            ],
            findings[0].annotations
        );
    }

    #[test]
    fn column_joined_with_zero_is_normal() {
        // 1: iload_1, 2: ifeq +7 -> 9, 5: iconst_1, 6: goto +4 -> 10, 9: iconst_0,
        // 10: invokeinterface
        let findings = run(
            RESULT_SET,
            "(Ljava/sql/ResultSet;Z)Ljava/lang/String;",
            &[
                opcodes::ILOAD_1,
                opcodes::IFEQ,
                0x00,
                0x07,
                opcodes::ICONST_1,
                opcodes::GOTO,
                0x00,
                0x04,
                opcodes::ICONST_0,
            ],
            Vec::new(),
        );

        assert_eq!(1, findings.len());
        assert_eq!(Priority::Normal, findings[0].priority);
        assert_eq!(Some(10), findings[0].offset);
    }

    #[test]
    fn column_from_parameter_is_normal() {
        let findings = run(
            RESULT_SET,
            "(Ljava/sql/ResultSet;I)Ljava/lang/String;",
            &[opcodes::ILOAD_1],
            Vec::new(),
        );

        assert_eq!(1, findings.len());
        assert_eq!(Priority::Normal, findings[0].priority);
        assert_eq!(
            vec!["callee=java/sql/ResultSet.getString".to_string()],
            findings[0].annotations
        );
    }

    #[test]
    fn first_column_is_fine() {
        let findings = run(
            RESULT_SET,
            "(Ljava/sql/ResultSet;)Ljava/lang/String;",
            &[opcodes::ICONST_1],
            Vec::new(),
        );

        assert!(findings.is_empty());
    }

    #[test]
    fn subtype_from_classpath_is_recognised() {
        let mut wrapper = class_named("com/example/LoggingResultSet");
        wrapper.interfaces.push(RESULT_SET.to_string());
        let findings = run(
            "com/example/LoggingResultSet",
            "(Lcom/example/LoggingResultSet;)Ljava/lang/String;",
            &[opcodes::ICONST_0],
            vec![wrapper],
        );

        assert_eq!(1, findings.len());
        assert_eq!("com/example/Dao", findings[0].class_name);
    }

    #[test]
    fn prepared_statement_setter_with_zero_is_reported() {
        let mut pool = PoolBuilder::new();
        let setter = pool.interface_method_ref(PREPARED_STATEMENT, "setInt", "(II)V");
        let [hi, lo] = u16_bytes(setter);
        let mut method = method_named(
            "bind",
            "(Ljava/sql/PreparedStatement;I)V",
            vec![
                opcodes::ALOAD_0,
                opcodes::ICONST_0,
                opcodes::ILOAD_1,
                opcodes::INVOKEINTERFACE,
                hi,
                lo,
                0x03,
                0x00,
                opcodes::RETURN,
            ],
        );
        method.access.is_static = true;
        let class = class_with("com/example/Dao", &pool, vec![method]);

        let findings = analyze(&registry(), &[class]);

        assert_eq!(1, findings.len());
        assert_eq!(SQL_BAD_PREPARED_STATEMENT_ACCESS, findings[0].pattern_id);
        assert_eq!(Priority::High, findings[0].priority);
    }

    #[test]
    fn unresolvable_owner_skips_only_the_check() {
        let findings = run(
            "com/example/Unknown",
            "(Lcom/example/Unknown;)Ljava/lang/String;",
            &[opcodes::ICONST_0],
            Vec::new(),
        );

        assert!(findings.is_empty());
    }
}
