use serde_json::json;
use serde_sarif::sarif::{
    Artifact, ArtifactLocation, Invocation, Location, LogicalLocation, Message,
    MultiformatMessageString, PhysicalLocation, Region, ReportingDescriptor, Result as SarifResult,
    Run, SCHEMA_URL, Sarif, Tool, ToolComponent,
};

use crate::detector::RuleMetadata;
use crate::findings::Finding;

const TOOL_NAME: &str = "stackwise";

pub(crate) fn build_invocation() -> Invocation {
    let arguments: Vec<String> = std::env::args().collect();
    let command_line = arguments.join(" ");

    Invocation::builder()
        .execution_successful(true)
        .arguments(arguments)
        .command_line(command_line)
        .build()
}

/// One reporting descriptor per pattern id, in registration order.
pub(crate) fn build_rules<'a>(
    patterns: impl IntoIterator<Item = &'a RuleMetadata>,
) -> Vec<ReportingDescriptor> {
    patterns
        .into_iter()
        .map(|pattern| {
            ReportingDescriptor::builder()
                .id(pattern.id)
                .name(pattern.name)
                .short_description(
                    MultiformatMessageString::builder()
                        .text(pattern.description)
                        .build(),
                )
                .build()
        })
        .collect()
}

pub(crate) fn build_results(findings: &[Finding], artifacts: &[Artifact]) -> Vec<SarifResult> {
    findings
        .iter()
        .map(|finding| {
            let artifact_uri = usize::try_from(finding.artifact_index)
                .ok()
                .and_then(|index| artifacts.get(index))
                .and_then(|artifact| artifact.location.as_ref())
                .and_then(|location| location.uri.clone());
            let location = finding_location(finding, artifact_uri);
            SarifResult::builder()
                .rule_id(finding.pattern_id)
                .message(result_message(finding_text(finding)))
                .locations(vec![location])
                .build()
        })
        .collect()
}

fn finding_text(finding: &Finding) -> String {
    let mut text = format!("[{}] {}", finding.priority, finding.message);
    if !finding.annotations.is_empty() {
        text.push_str(&format!(" ({})", finding.annotations.join(", ")));
    }
    text
}

fn finding_location(finding: &Finding, artifact_uri: Option<String>) -> Location {
    let logical = match &finding.method {
        Some(method) => {
            method_logical_location(&finding.class_name, &method.name, &method.descriptor)
        }
        None => class_logical_location(&finding.class_name),
    };
    let Some(uri) = artifact_uri else {
        return Location::builder().logical_locations(vec![logical]).build();
    };
    let artifact_location = ArtifactLocation::builder()
        .uri(uri)
        .index(finding.artifact_index)
        .build();
    let physical = match finding.line {
        Some(line) => PhysicalLocation::builder()
            .artifact_location(artifact_location)
            .region(Region::builder().start_line(i64::from(line)).build())
            .build(),
        None => PhysicalLocation::builder()
            .artifact_location(artifact_location)
            .build(),
    };
    Location::builder()
        .logical_locations(vec![logical])
        .physical_location(physical)
        .build()
}

pub(crate) fn method_logical_location(
    class_name: &str,
    method_name: &str,
    descriptor: &str,
) -> LogicalLocation {
    LogicalLocation::builder()
        .name(format!("{class_name}.{method_name}{descriptor}"))
        .kind("function")
        .build()
}

pub(crate) fn class_logical_location(class_name: &str) -> LogicalLocation {
    LogicalLocation::builder()
        .name(class_name)
        .kind("type")
        .build()
}

pub(crate) fn result_message(text: impl Into<String>) -> Message {
    Message::builder().text(text.into()).build()
}

pub(crate) fn build_sarif(
    artifacts: Vec<Artifact>,
    invocation: Invocation,
    rules: Vec<ReportingDescriptor>,
    results: Vec<SarifResult>,
) -> Sarif {
    let driver = ToolComponent::builder()
        .name(TOOL_NAME)
        .version(env!("CARGO_PKG_VERSION"))
        .rules(rules)
        .build();
    let tool = Tool {
        driver,
        extensions: None,
        properties: None,
    };
    let run = if artifacts.is_empty() {
        Run::builder()
            .tool(tool)
            .invocations(vec![invocation])
            .results(results)
            .build()
    } else {
        Run::builder()
            .tool(tool)
            .invocations(vec![invocation])
            .results(results)
            .artifacts(artifacts)
            .build()
    };

    Sarif::builder()
        .schema(SCHEMA_URL)
        .runs(vec![run])
        .version(json!("2.1.0"))
        .build()
}
