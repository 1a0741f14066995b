use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind};

use anyhow::Result;
use tracing::{debug, warn};

use crate::cfg::FlowFacts;
use crate::config::RulePolicy;
use crate::engine::AnalysisContext;
use crate::error::EngineError;
use crate::findings::{Finding, FindingAccumulator, MethodId, Priority};
use crate::ir::{Class, Instruction, Method};
use crate::stack::OpcodeStack;
use crate::stream::InstructionStream;

/// Metadata describing one bug pattern a detector can report.
#[derive(Clone, Debug)]
pub(crate) struct RuleMetadata {
    pub(crate) id: &'static str,
    pub(crate) name: &'static str,
    pub(crate) description: &'static str,
    pub(crate) default_priority: Priority,
}

/// Hooks a detector wants called. Dispatch skips the rest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Capabilities {
    pub(crate) class_enter: bool,
    pub(crate) method_enter: bool,
    pub(crate) instruction: bool,
    pub(crate) method_exit: bool,
    pub(crate) class_exit: bool,
}

impl Capabilities {
    /// Per-instruction checks with a per-method reset, the common shape.
    pub(crate) const INSTRUCTIONS: Self = Self {
        class_enter: false,
        method_enter: true,
        instruction: true,
        method_exit: false,
        class_exit: false,
    };

    pub(crate) const fn with_class_enter(mut self) -> Self {
        self.class_enter = true;
        self
    }

    pub(crate) const fn with_method_exit(mut self) -> Self {
        self.method_exit = true;
        self
    }

    pub(crate) const fn with_class_exit(mut self) -> Self {
        self.class_exit = true;
        self
    }
}

pub(crate) struct ClassContext<'a> {
    pub(crate) class: &'a Class,
    pub(crate) analysis: &'a AnalysisContext,
}

impl ClassContext<'_> {
    /// Class-level finding without a method or line.
    pub(crate) fn finding(&self, pattern_id: &'static str, priority: Priority) -> Finding {
        Finding {
            pattern_id,
            priority,
            class_name: self.class.name.clone(),
            method: None,
            line: None,
            offset: None,
            message: String::new(),
            annotations: Vec::new(),
            artifact_index: self.class.artifact_index,
        }
    }
}

pub(crate) struct MethodContext<'a> {
    pub(crate) class: &'a Class,
    pub(crate) method: &'a Method,
    pub(crate) analysis: &'a AnalysisContext,
}

impl MethodContext<'_> {
    pub(crate) fn finding(&self, pattern_id: &'static str, priority: Priority) -> Finding {
        method_finding(self.class, self.method, pattern_id, priority, None, None)
    }
}

/// Everything a detector may look at for one instruction. The stack shows the
/// state *before* the instruction executes.
pub(crate) struct InstructionContext<'a> {
    pub(crate) class: &'a Class,
    pub(crate) method: &'a Method,
    pub(crate) analysis: &'a AnalysisContext,
    pub(crate) stream: &'a InstructionStream<'a>,
    pub(crate) flow: &'a FlowFacts,
    pub(crate) instruction: &'a Instruction,
    pub(crate) stack: &'a OpcodeStack,
}

impl InstructionContext<'_> {
    pub(crate) fn opcode(&self) -> u8 {
        self.instruction.opcode
    }

    pub(crate) fn line(&self) -> Option<u32> {
        self.stream.line_for_offset(self.instruction.offset)
    }

    pub(crate) fn prev_opcode(&self, n: usize) -> u8 {
        self.stack.prev_opcode(n)
    }

    /// Finding located at the current instruction.
    pub(crate) fn finding(&self, pattern_id: &'static str, priority: Priority) -> Finding {
        method_finding(
            self.class,
            self.method,
            pattern_id,
            priority,
            self.line(),
            Some(self.instruction.offset),
        )
    }
}

fn method_finding(
    class: &Class,
    method: &Method,
    pattern_id: &'static str,
    priority: Priority,
    line: Option<u32>,
    offset: Option<u32>,
) -> Finding {
    Finding {
        pattern_id,
        priority,
        class_name: class.name.clone(),
        method: Some(MethodId {
            name: method.name.clone(),
            descriptor: method.descriptor.clone(),
        }),
        line,
        offset,
        message: String::new(),
        annotations: Vec::new(),
        artifact_index: class.artifact_index,
    }
}

/// Entry point for findings; applies the rule policy before buffering.
pub(crate) struct Reporter<'a> {
    accumulator: FindingAccumulator,
    policy: &'a RulePolicy,
}

impl<'a> Reporter<'a> {
    pub(crate) fn new(policy: &'a RulePolicy) -> Self {
        Self {
            accumulator: FindingAccumulator::default(),
            policy,
        }
    }

    pub(crate) fn report(&mut self, mut finding: Finding) {
        if !self.policy.is_enabled(finding.pattern_id) {
            return;
        }
        finding.priority = self.policy.priority_for(finding.pattern_id, finding.priority);
        self.accumulator.record(finding);
    }

    pub(crate) fn accumulator(&mut self) -> &mut FindingAccumulator {
        &mut self.accumulator
    }

    pub(crate) fn flush(&mut self) -> Vec<Finding> {
        self.accumulator.flush()
    }
}

/// A stateful bug-pattern detector.
///
/// Instances are created per class and never shared, so any field is class
/// scoped. Per-method state belongs in a struct reset by `on_method_enter`.
pub(crate) trait Detector {
    fn name(&self) -> &'static str;

    fn patterns(&self) -> &'static [RuleMetadata];

    fn capabilities(&self) -> Capabilities {
        Capabilities::INSTRUCTIONS
    }

    /// Cheap per-class test; `false` skips this detector for the whole class.
    fn interest(&self, _class: &Class, _analysis: &AnalysisContext) -> bool {
        true
    }

    /// Longest `prev_opcode` distance this detector asks for.
    fn max_lookback(&self) -> usize {
        0
    }

    /// Bracketed region owned by the detector; reset by dispatch at method exit.
    fn region(&mut self) -> Option<&mut Region> {
        None
    }

    fn on_class_enter(
        &mut self,
        _cx: &ClassContext<'_>,
        _reporter: &mut Reporter<'_>,
    ) -> Result<()> {
        Ok(())
    }

    fn on_method_enter(&mut self, _cx: &MethodContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_instruction(
        &mut self,
        _cx: &InstructionContext<'_>,
        _reporter: &mut Reporter<'_>,
    ) -> Result<()> {
        Ok(())
    }

    /// The method was skipped part way through; its findings are rolled back
    /// and any state gathered for it must go too. `on_method_exit` still follows.
    fn on_method_abort(&mut self, _cx: &MethodContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_method_exit(
        &mut self,
        _cx: &MethodContext<'_>,
        _reporter: &mut Reporter<'_>,
    ) -> Result<()> {
        Ok(())
    }

    fn on_class_exit(
        &mut self,
        _cx: &ClassContext<'_>,
        _reporter: &mut Reporter<'_>,
    ) -> Result<()> {
        Ok(())
    }
}

/// State of a [`Region`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum RegionState {
    #[default]
    Idle,
    Active {
        opened_at: u32,
    },
}

/// What happened to a region on one instruction.
#[derive(Debug, PartialEq)]
pub(crate) enum RegionStep {
    Outside,
    Opened,
    Inside,
    /// The closer matched; the held findings are now confirmed.
    Closed(Vec<Finding>),
}

/// Opener/closer bracket shared by region-based detectors.
///
/// Findings raised inside the region are held until the closer confirms them.
/// `reset` (also forced at method exit) drops them, so an unclosed region
/// never reports.
#[derive(Debug, Default)]
pub(crate) struct Region {
    state: RegionState,
    pending: Vec<Finding>,
}

impl Region {
    #[cfg(test)]
    pub(crate) fn state(&self) -> RegionState {
        self.state
    }

    pub(crate) fn is_active(&self) -> bool {
        matches!(self.state, RegionState::Active { .. })
    }

    /// Advance on the instruction at `offset`. An instruction that closes the
    /// region is not offered to the check.
    pub(crate) fn step(&mut self, offset: u32, opens: bool, closes: bool) -> RegionStep {
        match self.state {
            RegionState::Idle if opens => {
                self.state = RegionState::Active { opened_at: offset };
                RegionStep::Opened
            }
            RegionState::Idle => RegionStep::Outside,
            RegionState::Active { .. } if closes => {
                self.state = RegionState::Idle;
                RegionStep::Closed(mem::take(&mut self.pending))
            }
            RegionState::Active { .. } => RegionStep::Inside,
        }
    }

    /// Hold a speculative finding until the closer; ignored while idle.
    pub(crate) fn hold(&mut self, finding: Finding) {
        if self.is_active() {
            self.pending.push(finding);
        }
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn reset(&mut self) {
        self.state = RegionState::Idle;
        self.pending.clear();
    }
}

type DetectorFactory = Box<dyn Fn() -> Box<dyn Detector> + Send + Sync>;

struct RegisteredDetector {
    name: &'static str,
    patterns: &'static [RuleMetadata],
    max_lookback: usize,
    factory: DetectorFactory,
}

/// Detectors in registration order, instantiated fresh for every class.
#[derive(Default)]
pub(crate) struct DetectorRegistry {
    entries: Vec<RegisteredDetector>,
}

impl DetectorRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register<F>(&mut self, factory: F)
    where
        F: Fn() -> Box<dyn Detector> + Send + Sync + 'static,
    {
        let sample = factory();
        self.entries.push(RegisteredDetector {
            name: sample.name(),
            patterns: sample.patterns(),
            max_lookback: sample.max_lookback(),
            factory: Box::new(factory),
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|entry| entry.name)
    }

    /// Every pattern of every registered detector, in registration order.
    pub(crate) fn patterns(&self) -> impl Iterator<Item = &'static RuleMetadata> + '_ {
        self.entries.iter().flat_map(|entry| entry.patterns.iter())
    }

    pub(crate) fn pattern(&self, id: &str) -> Option<&'static RuleMetadata> {
        self.patterns().find(|pattern| pattern.id == id)
    }

    /// Look-behind window the stack model must retain for these detectors.
    pub(crate) fn max_lookback(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| entry.max_lookback)
            .max()
            .unwrap_or(0)
    }

    fn instantiate(&self) -> Vec<Box<dyn Detector>> {
        self.entries.iter().map(|entry| (entry.factory)()).collect()
    }
}

struct ActiveDetector {
    detector: Box<dyn Detector>,
    capabilities: Capabilities,
    disabled_for_method: bool,
}

/// Per-class dispatch over the detectors interested in that class.
pub(crate) struct Dispatcher {
    active: Vec<ActiveDetector>,
}

impl Dispatcher {
    pub(crate) fn for_class(
        registry: &DetectorRegistry,
        class: &Class,
        analysis: &AnalysisContext,
    ) -> Self {
        let active = registry
            .instantiate()
            .into_iter()
            .filter(|detector| {
                let interested = detector.interest(class, analysis);
                if !interested {
                    debug!(class = %class.name, detector = detector.name(), "not interested");
                }
                interested
            })
            .map(|detector| ActiveDetector {
                capabilities: detector.capabilities(),
                detector,
                disabled_for_method: false,
            })
            .collect();
        Self { active }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub(crate) fn names(&self) -> Vec<&'static str> {
        self.active
            .iter()
            .map(|active| active.detector.name())
            .collect()
    }

    pub(crate) fn max_lookback(&self) -> usize {
        self.active
            .iter()
            .map(|active| active.detector.max_lookback())
            .max()
            .unwrap_or(0)
    }

    pub(crate) fn class_enter(&mut self, cx: &ClassContext<'_>, reporter: &mut Reporter<'_>) {
        for active in &mut self.active {
            if active.capabilities.class_enter {
                let detector = &mut active.detector;
                let _ = guarded(detector.name(), "class enter", || {
                    detector.on_class_enter(cx, reporter)
                });
            }
        }
    }

    /// Re-enable every detector and let it reset its per-method state.
    pub(crate) fn method_enter(&mut self, cx: &MethodContext<'_>) {
        for active in &mut self.active {
            active.disabled_for_method = false;
            if let Some(region) = active.detector.region() {
                region.reset();
            }
            if active.capabilities.method_enter {
                let detector = &mut active.detector;
                active.disabled_for_method =
                    guarded(detector.name(), "method enter", || detector.on_method_enter(cx))
                        .is_err();
            }
        }
    }

    pub(crate) fn instruction(&mut self, cx: &InstructionContext<'_>, reporter: &mut Reporter<'_>) {
        for active in &mut self.active {
            if !active.capabilities.instruction || active.disabled_for_method {
                continue;
            }
            let detector = &mut active.detector;
            if guarded(detector.name(), "instruction", || detector.on_instruction(cx, reporter))
                .is_err()
            {
                active.disabled_for_method = true;
                if let Some(region) = active.detector.region() {
                    region.reset();
                }
            }
        }
    }

    /// Tell every detector the current method was abandoned.
    pub(crate) fn method_abort(&mut self, cx: &MethodContext<'_>) {
        for active in &mut self.active {
            if let Some(region) = active.detector.region() {
                region.reset();
            }
            let detector = &mut active.detector;
            let _ = guarded(detector.name(), "method abort", || detector.on_method_abort(cx));
        }
    }

    /// Method-exit hooks, then every region is reset unconditionally.
    pub(crate) fn method_exit(&mut self, cx: &MethodContext<'_>, reporter: &mut Reporter<'_>) {
        for active in &mut self.active {
            if active.capabilities.method_exit && !active.disabled_for_method {
                let detector = &mut active.detector;
                let _ = guarded(detector.name(), "method exit", || {
                    detector.on_method_exit(cx, reporter)
                });
            }
            if let Some(region) = active.detector.region() {
                region.reset();
            }
            active.disabled_for_method = false;
        }
    }

    pub(crate) fn class_exit(&mut self, cx: &ClassContext<'_>, reporter: &mut Reporter<'_>) {
        for active in &mut self.active {
            if active.capabilities.class_exit {
                let detector = &mut active.detector;
                let _ = guarded(detector.name(), "class exit", || {
                    detector.on_class_exit(cx, reporter)
                });
            }
        }
    }
}

/// Run one hook, turning an error or a panic into a logged `DetectorFailure`.
fn guarded(
    detector: &'static str,
    hook: &'static str,
    call: impl FnOnce() -> Result<()>,
) -> Result<(), EngineError> {
    let reason = match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(error)) => format!("{error:#}"),
        Err(payload) => panic_message(payload.as_ref()),
    };
    let failure = EngineError::DetectorFailure { detector, reason };
    warn!(hook, error = %failure, "detector disabled for the rest of the method");
    Err(failure)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}
