use crate::detector::DetectorRegistry;

pub(crate) mod assertion_of_arguments;
pub(crate) mod ceil_of_int_division;
pub(crate) mod expose_array;
pub(crate) mod insecure_api;
pub(crate) mod optional_or_else;
pub(crate) mod questionable_for_loop;
pub(crate) mod redundant_null_check;
pub(crate) mod sql_bad_index;

/// Every built-in detector, in dispatch order.
pub(crate) fn default_registry() -> DetectorRegistry {
    let mut registry = DetectorRegistry::new();
    registry.register(|| Box::new(insecure_api::InsecureApiDetector));
    registry.register(|| Box::new(redundant_null_check::RedundantNullCheckDetector));
    registry.register(|| Box::new(ceil_of_int_division::CeilOfIntDivisionDetector::default()));
    registry.register(|| {
        Box::new(assertion_of_arguments::AssertionOfArgumentsDetector::default())
    });
    registry.register(|| Box::new(optional_or_else::OptionalOrElseDetector::default()));
    registry.register(|| Box::new(sql_bad_index::SqlBadIndexDetector));
    registry.register(|| Box::new(expose_array::ExposeArrayDetector::default()));
    registry.register(|| Box::new(questionable_for_loop::QuestionableForLoopDetector));
    registry
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::classfile::tests::PoolBuilder;
    use crate::config::RulePolicy;
    use crate::detector::tests::class_named;
    use crate::engine::{AnalysisContext, Engine, RunOptions};
    use crate::findings::{CollectingSink, Finding, Priority};
    use crate::ir::{Class, LineNumber, Method};

    /// Class whose constant pool is `pool`, so operands in `methods` resolve.
    pub(crate) fn class_with(name: &str, pool: &PoolBuilder, methods: Vec<Method>) -> Class {
        let constant_pool = pool.build();
        Class {
            referenced_classes: constant_pool.class_names(),
            constant_pool,
            methods,
            ..class_named(name)
        }
    }

    pub(crate) fn with_lines(mut method: Method, lines: &[(u32, u32)]) -> Method {
        if let Some(code) = method.code.as_mut() {
            code.line_numbers = lines
                .iter()
                .map(|&(start_pc, line)| LineNumber { start_pc, line })
                .collect();
        }
        method
    }

    pub(crate) fn analyze(registry: &DetectorRegistry, classes: &[Class]) -> Vec<Finding> {
        let context = AnalysisContext::new(classes);
        let policy = RulePolicy::default();
        let sink = CollectingSink::new(Priority::Low);
        Engine::new(registry, &context, &policy)
            .run(classes, &sink, RunOptions::default())
            .expect("run");
        sink.into_findings()
    }

    pub(crate) fn u16_bytes(index: u16) -> [u8; 2] {
        index.to_be_bytes()
    }

    #[test]
    fn pattern_ids_are_unique() {
        let registry = default_registry();
        let mut ids: Vec<&str> = registry.patterns().map(|pattern| pattern.id).collect();
        let count = ids.len();
        ids.sort_unstable();
        ids.dedup();

        assert_eq!(count, ids.len());
        assert_eq!(9, count);
        assert_eq!(8, registry.len());
    }
}
