use std::str::FromStr;

use anyhow::{Result, anyhow};
use jdescriptor::{MethodDescriptor as JavaMethodDescriptor, TypeDescriptor};

/// Parameter and return types of a method descriptor, as field descriptors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MethodDescriptor {
    pub(crate) parameters: Vec<String>,
    /// `"V"` for void methods.
    pub(crate) return_type: String,
}

impl MethodDescriptor {
    pub(crate) fn returns_void(&self) -> bool {
        self.return_type == "V"
    }
}

pub(crate) fn parse_method_descriptor(descriptor: &str) -> Result<MethodDescriptor> {
    let parsed = JavaMethodDescriptor::from_str(descriptor)
        .map_err(|error| anyhow!("invalid method descriptor {descriptor}: {error:?}"))?;
    Ok(MethodDescriptor {
        parameters: parsed.parameter_types().iter().map(signature).collect(),
        return_type: signature(parsed.return_type()),
    })
}

/// Field descriptor text of a parsed type, `"V"` for void.
fn signature(type_descriptor: &TypeDescriptor) -> String {
    match type_descriptor {
        TypeDescriptor::Byte => "B".to_string(),
        TypeDescriptor::Char => "C".to_string(),
        TypeDescriptor::Double => "D".to_string(),
        TypeDescriptor::Float => "F".to_string(),
        TypeDescriptor::Integer => "I".to_string(),
        TypeDescriptor::Long => "J".to_string(),
        TypeDescriptor::Short => "S".to_string(),
        TypeDescriptor::Boolean => "Z".to_string(),
        TypeDescriptor::Void => "V".to_string(),
        TypeDescriptor::Object(class_name) => class_signature(class_name),
        TypeDescriptor::Array(element, dimensions) => {
            format!("{}{}", "[".repeat(*dimensions as usize), signature(element))
        }
    }
}

/// Number of stack/local slots a value of this field descriptor occupies.
pub(crate) fn slot_size(signature: &str) -> usize {
    if is_wide(signature) { 2 } else { 1 }
}

pub(crate) fn is_wide(signature: &str) -> bool {
    signature == "J" || signature == "D"
}

pub(crate) fn is_array(signature: &str) -> bool {
    signature.starts_with('[')
}

/// `Ljava/lang/String;` -> `java/lang/String`; arrays and primitives yield `None`.
pub(crate) fn object_class_name(signature: &str) -> Option<&str> {
    signature
        .strip_prefix('L')
        .and_then(|rest| rest.strip_suffix(';'))
}

/// Descriptor of an internal class name as it appears on the operand stack.
pub(crate) fn class_signature(internal_name: &str) -> String {
    if internal_name.starts_with('[') {
        internal_name.to_string()
    } else {
        format!("L{internal_name};")
    }
}
