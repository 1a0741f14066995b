use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Add;
use std::time::Instant;

use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::cfg::analyze_flow;
use crate::config::RulePolicy;
use crate::detector::{
    ClassContext, DetectorRegistry, Dispatcher, InstructionContext, MethodContext, Reporter,
};
use crate::error::EngineError;
use crate::findings::FindingSink;
use crate::ir::{Class, Code, Method};
use crate::stack::OpcodeStack;
use crate::stream::InstructionStream;

const OBJECT: &str = "java/lang/Object";

struct TypeEntry {
    super_name: Option<String>,
    interfaces: Vec<String>,
}

/// Whole-program facts shared read-only by every worker.
#[derive(Default)]
pub(crate) struct AnalysisContext {
    types: HashMap<String, TypeEntry>,
}

impl AnalysisContext {
    /// Index `classes`; the first definition of a name wins, so analysed
    /// classes should come before classpath ones.
    pub(crate) fn new<'a>(classes: impl IntoIterator<Item = &'a Class>) -> Self {
        let mut types = HashMap::new();
        for class in classes {
            types.entry(class.name.clone()).or_insert_with(|| TypeEntry {
                super_name: class.super_name.clone(),
                interfaces: class.interfaces.clone(),
            });
        }
        Self { types }
    }

    pub(crate) fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether `class_name` is `ancestor` or extends/implements it.
    ///
    /// A class missing from the index only matters when no other path proves
    /// the relation; then the first missing name is reported.
    pub(crate) fn is_subtype(&self, class_name: &str, ancestor: &str) -> Result<bool, EngineError> {
        if class_name == ancestor || ancestor == OBJECT {
            return Ok(true);
        }
        let mut missing = None;
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([class_name]);
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            let Some(entry) = self.types.get(current) else {
                missing.get_or_insert_with(|| current.to_string());
                continue;
            };
            let parents = entry.super_name.iter().chain(entry.interfaces.iter());
            for parent in parents {
                if parent == ancestor {
                    return Ok(true);
                }
                if parent != OBJECT {
                    queue.push_back(parent);
                }
            }
        }
        match missing {
            Some(name) => Err(EngineError::MissingClass { name }),
            None => Ok(false),
        }
    }
}

/// Counters reported after a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct RunStats {
    pub(crate) classes: usize,
    /// Classes no registered detector was interested in.
    pub(crate) skipped_classes: usize,
    /// Classes not visited because the deadline passed.
    pub(crate) cancelled_classes: usize,
    pub(crate) methods: usize,
    pub(crate) skipped_methods: usize,
    pub(crate) findings: usize,
}

impl Add for RunStats {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            classes: self.classes + other.classes,
            skipped_classes: self.skipped_classes + other.skipped_classes,
            cancelled_classes: self.cancelled_classes + other.cancelled_classes,
            methods: self.methods + other.methods,
            skipped_methods: self.skipped_methods + other.skipped_methods,
            findings: self.findings + other.findings,
        }
    }
}

/// Scheduler options from the command line.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RunOptions {
    /// Worker count; `None` lets rayon decide.
    pub(crate) jobs: Option<usize>,
    /// Classes not started by this instant are skipped.
    pub(crate) deadline: Option<Instant>,
}

/// Drives class → method → instruction traversal for every input class.
pub(crate) struct Engine<'a> {
    registry: &'a DetectorRegistry,
    context: &'a AnalysisContext,
    policy: &'a RulePolicy,
}

impl<'a> Engine<'a> {
    pub(crate) fn new(
        registry: &'a DetectorRegistry,
        context: &'a AnalysisContext,
        policy: &'a RulePolicy,
    ) -> Self {
        Self {
            registry,
            context,
            policy,
        }
    }

    /// Analyse `classes` in parallel; each class runs to completion on one worker.
    pub(crate) fn run(
        &self,
        classes: &[Class],
        sink: &dyn FindingSink,
        options: RunOptions,
    ) -> Result<RunStats> {
        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(jobs) = options.jobs {
            builder = builder.num_threads(jobs);
        }
        let pool = builder.build().context("failed to build worker pool")?;

        let stats = pool.install(|| {
            classes
                .par_iter()
                .map(|class| {
                    if options.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        debug!(class = %class.name, "deadline reached, class not analysed");
                        return RunStats {
                            cancelled_classes: 1,
                            ..RunStats::default()
                        };
                    }
                    self.analyze_class(class, sink)
                })
                .reduce(RunStats::default, |left, right| left + right)
        });

        info!(
            classes = stats.classes,
            skipped_classes = stats.skipped_classes,
            cancelled_classes = stats.cancelled_classes,
            methods = stats.methods,
            skipped_methods = stats.skipped_methods,
            findings = stats.findings,
            "analysis finished"
        );
        Ok(stats)
    }

    fn analyze_class(&self, class: &Class, sink: &dyn FindingSink) -> RunStats {
        let mut stats = RunStats::default();
        let mut dispatcher = Dispatcher::for_class(self.registry, class, self.context);
        if dispatcher.is_empty() {
            debug!(class = %class.name, "no interested detector, class skipped");
            stats.skipped_classes = 1;
            return stats;
        }
        stats.classes = 1;
        debug!(class = %class.name, detectors = ?dispatcher.names(), "analysing class");

        let mut stack = OpcodeStack::new(dispatcher.max_lookback());
        stack.enter_class(class);
        let mut reporter = Reporter::new(self.policy);
        let class_cx = ClassContext {
            class,
            analysis: self.context,
        };
        dispatcher.class_enter(&class_cx, &mut reporter);

        for method in &class.methods {
            let Some(code) = &method.code else {
                continue;
            };
            stats.methods += 1;
            let method_cx = MethodContext {
                class,
                method,
                analysis: self.context,
            };
            let mark = reporter.accumulator().mark();
            dispatcher.method_enter(&method_cx);
            let outcome = self.run_method(
                class,
                method,
                code,
                &mut stack,
                &mut dispatcher,
                &mut reporter,
            );
            if matches!(&outcome, Err(error) if error.is_method_fatal()) {
                dispatcher.method_abort(&method_cx);
            }
            dispatcher.method_exit(&method_cx, &mut reporter);
            match outcome {
                Err(error) if error.is_method_fatal() => {
                    reporter.accumulator().rollback(mark);
                    stats.skipped_methods += 1;
                    warn!(
                        method = %method.qualified_name(&class.name),
                        %error,
                        "method skipped"
                    );
                }
                Err(error) => {
                    debug!(
                        method = %method.qualified_name(&class.name),
                        %error,
                        "check skipped"
                    );
                }
                Ok(()) => {}
            }
        }

        dispatcher.class_exit(&class_cx, &mut reporter);
        let findings = reporter.flush();
        stats.findings = findings.len();
        if !findings.is_empty() {
            sink.accept(findings);
        }
        stats
    }

    fn run_method(
        &self,
        class: &Class,
        method: &Method,
        code: &Code,
        stack: &mut OpcodeStack,
        dispatcher: &mut Dispatcher,
        reporter: &mut Reporter<'_>,
    ) -> Result<(), EngineError> {
        let stream = InstructionStream::new(code, &class.constant_pool)?;
        let flow = analyze_flow(&stream, &code.exception_handlers)?;
        debug!(
            method = %method.qualified_name(&class.name),
            instructions = stream.len(),
            merge_points = stream
                .iter()
                .filter(|inst| flow.is_merge_point(inst.offset))
                .count(),
            loops = flow.loops().len(),
            "simulating method"
        );
        stack.enter_method(method)?;
        let max_stack = usize::from(code.max_stack);
        for instruction in stream.iter() {
            stack.enter_offset(instruction.offset, &flow);
            let cx = InstructionContext {
                class,
                method,
                analysis: self.context,
                stream: &stream,
                flow: &flow,
                instruction,
                stack: &*stack,
            };
            dispatcher.instruction(&cx, reporter);
            stack.apply(instruction, &stream)?;
            if stack.slot_depth() > max_stack {
                debug!(
                    offset = instruction.offset,
                    depth = stack.slot_depth(),
                    max_stack,
                    "simulated stack exceeds max_stack"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::tests::{class_named, method_named};
    use crate::detector::{Detector, RuleMetadata};
    use crate::findings::{CollectingSink, Priority};
    use crate::opcodes;
    use std::time::Duration;

    static DIV_PATTERNS: &[RuleMetadata] = &[RuleMetadata {
        id: "TEST_DIV",
        name: "Division",
        description: "Reports every idiv",
        default_priority: Priority::Normal,
    }];

    /// Reports every `idiv`; the failing variant panics on it instead.
    struct DivReporter {
        fail: bool,
    }

    impl Detector for DivReporter {
        fn name(&self) -> &'static str {
            if self.fail { "Failing" } else { "DivReporter" }
        }

        fn patterns(&self) -> &'static [RuleMetadata] {
            DIV_PATTERNS
        }

        fn on_instruction(
            &mut self,
            cx: &InstructionContext<'_>,
            reporter: &mut Reporter<'_>,
        ) -> Result<()> {
            if cx.opcode() == opcodes::IDIV {
                if self.fail {
                    panic!("cannot handle idiv");
                }
                reporter.report(cx.finding("TEST_DIV", Priority::Normal));
            }
            Ok(())
        }
    }

    fn registry(fail_first: bool) -> DetectorRegistry {
        let mut registry = DetectorRegistry::new();
        if fail_first {
            registry.register(|| Box::new(DivReporter { fail: true }));
        }
        registry.register(|| Box::new(DivReporter { fail: false }));
        registry
    }

    fn divide_method(name: &str) -> Method {
        method_named(
            name,
            "(II)I",
            vec![opcodes::ILOAD_0, opcodes::ILOAD_1, opcodes::IDIV, opcodes::IRETURN],
        )
    }

    fn run(
        registry: &DetectorRegistry,
        classes: &[Class],
        options: RunOptions,
    ) -> (RunStats, CollectingSink) {
        let context = AnalysisContext::new(classes);
        let policy = RulePolicy::default();
        let sink = CollectingSink::new(Priority::Low);
        let stats = Engine::new(registry, &context, &policy)
            .run(classes, &sink, options)
            .expect("run");
        (stats, sink)
    }

    #[test]
    fn failing_detector_does_not_hide_other_findings() {
        let mut class = class_named("com/example/Math");
        let mut method = divide_method("divide");
        method.access.is_static = true;
        class.methods.push(method);

        let (stats, sink) = run(&registry(true), &[class], RunOptions::default());

        let findings = sink.into_findings();
        assert_eq!(1, findings.len());
        assert_eq!("TEST_DIV", findings[0].pattern_id);
        assert_eq!(Some(2), findings[0].offset);
        assert_eq!(0, stats.skipped_methods);
    }

    #[test]
    fn malformed_method_is_skipped_and_siblings_continue() {
        let mut class = class_named("com/example/Math");
        let mut broken = method_named(
            "broken",
            "()V",
            vec![opcodes::ICONST_1, opcodes::GOTO, 0x00, 0x40],
        );
        broken.access.is_static = true;
        let mut divide = divide_method("divide");
        divide.access.is_static = true;
        class.methods.push(broken);
        class.methods.push(divide);

        let (stats, sink) = run(&registry(false), &[class], RunOptions::default());

        assert_eq!(2, stats.methods);
        assert_eq!(1, stats.skipped_methods);
        let findings = sink.into_findings();
        assert_eq!(1, findings.len());
        assert_eq!(
            Some("divide"),
            findings[0].method.as_ref().map(|method| method.name.as_str())
        );
    }

    #[test]
    fn passed_deadline_cancels_remaining_classes() {
        let mut class = class_named("com/example/Math");
        class.methods.push(divide_method("divide"));
        let deadline = Instant::now()
            .checked_sub(Duration::from_millis(1))
            .unwrap_or_else(Instant::now);
        let options = RunOptions {
            jobs: Some(1),
            deadline: Some(deadline),
        };

        let (stats, sink) = run(&registry(false), &[class], options);

        assert_eq!(1, stats.cancelled_classes);
        assert_eq!(0, stats.classes);
        assert!(sink.into_findings().is_empty());
    }

    #[test]
    fn classes_run_in_parallel_with_deterministic_output() {
        let classes: Vec<Class> = (0..16)
            .map(|index| {
                let mut class = class_named(&format!("com/example/C{index:02}"));
                class.methods.push(divide_method("divide"));
                class
            })
            .collect();
        let options = RunOptions {
            jobs: Some(4),
            deadline: None,
        };

        let (stats, sink) = run(&registry(false), &classes, options);

        assert_eq!(16, stats.classes);
        assert_eq!(16, stats.findings);
        let names: Vec<String> = sink
            .into_findings()
            .into_iter()
            .map(|finding| finding.class_name)
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(sorted, names);
    }

    #[test]
    fn subtype_queries_walk_supers_and_interfaces() {
        let mut base = class_named("com/example/Base");
        base.interfaces.push("java/sql/ResultSet".to_string());
        let mut child = class_named("com/example/Child");
        child.super_name = Some("com/example/Base".to_string());
        let context = AnalysisContext::new([&base, &child]);

        assert!(
            context
                .is_subtype("com/example/Child", "java/sql/ResultSet")
                .expect("resolved through Base")
        );
        assert!(context.is_subtype("com/example/Child", "java/lang/Object").expect("object"));
        assert!(matches!(
            context.is_subtype("com/example/Child", "java/util/List"),
            Err(EngineError::MissingClass { ref name }) if name == "java/sql/ResultSet"
        ));
        assert!(matches!(
            context.is_subtype("com/example/Other", "java/sql/ResultSet"),
            Err(EngineError::MissingClass { ref name }) if name == "com/example/Other"
        ));
        assert_eq!(2, context.len());
    }
}
