use anyhow::{Context, Result};
use jclassfile::attributes::Attribute;
use jclassfile::class_file;
use jclassfile::constant_pool::ConstantPool as RawEntry;

use crate::error::EngineError;
use crate::ir::{
    CallKind, Class, ClassAccess, Code, Constant, ExceptionHandler, Field, FieldAccess, FieldRef,
    LineNumber, Method, MethodAccess, MethodRef,
};

const ACC_PUBLIC: u16 = 0x0001;
const ACC_PRIVATE: u16 = 0x0002;
const ACC_PROTECTED: u16 = 0x0004;
const ACC_STATIC: u16 = 0x0008;
const ACC_FINAL: u16 = 0x0010;
const ACC_BRIDGE: u16 = 0x0040;
const ACC_INTERFACE: u16 = 0x0200;
const ACC_ABSTRACT: u16 = 0x0400;
const ACC_SYNTHETIC: u16 = 0x1000;

/// One constant pool slot. Index 0 and the slot after a long/double are `Unusable`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum PoolEntry {
    Unusable,
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class { name_index: u16 },
    String { utf8_index: u16 },
    FieldRef { class_index: u16, name_and_type_index: u16 },
    MethodRef { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodRef { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle,
    MethodType { descriptor_index: u16 },
    Dynamic { name_and_type_index: u16 },
    InvokeDynamic { name_and_type_index: u16 },
    Module,
    Package,
}

/// Constant pool with lookups used by instruction decoding.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ConstantPool {
    entries: Vec<PoolEntry>,
}

impl ConstantPool {
    /// Index 0 and the slot after a long/double are unusable, whether or not
    /// the parsed pool already carries placeholders for them.
    pub(crate) fn from_entries(raw: &[RawEntry]) -> Self {
        let mut entries = Vec::with_capacity(raw.len() + 1);
        entries.push(PoolEntry::Unusable);
        let mut pending_gap = false;
        for (position, entry) in raw.iter().enumerate() {
            let entry = pool_entry(entry);
            if entry == PoolEntry::Unusable {
                if position > 0 {
                    entries.push(entry);
                }
                pending_gap = false;
                continue;
            }
            if pending_gap {
                entries.push(PoolEntry::Unusable);
            }
            pending_gap = matches!(entry, PoolEntry::Long(_) | PoolEntry::Double(_));
            entries.push(entry);
        }
        if pending_gap {
            entries.push(PoolEntry::Unusable);
        }
        Self { entries }
    }

    fn entry(&self, index: u16) -> Result<&PoolEntry, EngineError> {
        match self.entries.get(index as usize) {
            Some(PoolEntry::Unusable) | None => Err(EngineError::UnresolvableConstant { index }),
            Some(entry) => Ok(entry),
        }
    }

    pub(crate) fn utf8(&self, index: u16) -> Result<&str, EngineError> {
        match self.entry(index)? {
            PoolEntry::Utf8(value) => Ok(value),
            _ => Err(EngineError::UnresolvableConstant { index }),
        }
    }

    pub(crate) fn class_name(&self, index: u16) -> Result<&str, EngineError> {
        match self.entry(index)? {
            PoolEntry::Class { name_index } => self.utf8(*name_index),
            _ => Err(EngineError::UnresolvableConstant { index }),
        }
    }

    fn name_and_type(&self, index: u16) -> Result<(&str, &str), EngineError> {
        match self.entry(index)? {
            PoolEntry::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            _ => Err(EngineError::UnresolvableConstant { index }),
        }
    }

    /// Resolve an `ldc`/`ldc_w`/`ldc2_w` operand.
    pub(crate) fn loadable(&self, index: u16) -> Result<Constant, EngineError> {
        match self.entry(index)? {
            PoolEntry::Integer(value) => Ok(Constant::Int(*value)),
            PoolEntry::Float(value) => Ok(Constant::Float(*value)),
            PoolEntry::Long(value) => Ok(Constant::Long(*value)),
            PoolEntry::Double(value) => Ok(Constant::Double(*value)),
            PoolEntry::String { utf8_index } => {
                Ok(Constant::String(self.utf8(*utf8_index)?.to_string()))
            }
            PoolEntry::Class { name_index } => {
                Ok(Constant::Class(self.utf8(*name_index)?.to_string()))
            }
            PoolEntry::MethodType { descriptor_index } => Ok(Constant::MethodType(
                self.utf8(*descriptor_index)?.to_string(),
            )),
            PoolEntry::MethodHandle => Ok(Constant::MethodHandle),
            PoolEntry::Dynamic {
                name_and_type_index,
                ..
            } => {
                let (_, descriptor) = self.name_and_type(*name_and_type_index)?;
                Ok(Constant::Dynamic(descriptor.to_string()))
            }
            _ => Err(EngineError::UnresolvableConstant { index }),
        }
    }

    pub(crate) fn field_ref(&self, index: u16) -> Result<FieldRef, EngineError> {
        match self.entry(index)? {
            PoolEntry::FieldRef {
                class_index,
                name_and_type_index,
            } => {
                let owner = self.class_name(*class_index)?;
                let (name, descriptor) = self.name_and_type(*name_and_type_index)?;
                Ok(FieldRef {
                    owner: owner.to_string(),
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                })
            }
            _ => Err(EngineError::UnresolvableConstant { index }),
        }
    }

    pub(crate) fn method_ref(&self, index: u16, kind: CallKind) -> Result<MethodRef, EngineError> {
        match self.entry(index)? {
            PoolEntry::MethodRef {
                class_index,
                name_and_type_index,
            }
            | PoolEntry::InterfaceMethodRef {
                class_index,
                name_and_type_index,
            } => {
                let owner = self.class_name(*class_index)?;
                let (name, descriptor) = self.name_and_type(*name_and_type_index)?;
                Ok(MethodRef {
                    owner: owner.to_string(),
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                    kind,
                })
            }
            _ => Err(EngineError::UnresolvableConstant { index }),
        }
    }

    /// Name and descriptor of an `invokedynamic` call site.
    pub(crate) fn invoke_dynamic(&self, index: u16) -> Result<(String, String), EngineError> {
        match self.entry(index)? {
            PoolEntry::InvokeDynamic {
                name_and_type_index,
                ..
            } => {
                let (name, descriptor) = self.name_and_type(*name_and_type_index)?;
                Ok((name.to_string(), descriptor.to_string()))
            }
            _ => Err(EngineError::UnresolvableConstant { index }),
        }
    }

    /// Class names referenced from `CONSTANT_Class` entries, sorted and unique.
    pub(crate) fn class_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter_map(|entry| match entry {
                PoolEntry::Class { name_index } => self.utf8(*name_index).ok(),
                _ => None,
            })
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Whether any field or method reference uses `member_name`.
    pub(crate) fn has_member_named(&self, member_name: &str) -> bool {
        self.entries.iter().any(|entry| match entry {
            PoolEntry::NameAndType { name_index, .. } => {
                self.utf8(*name_index).is_ok_and(|name| name == member_name)
            }
            _ => false,
        })
    }
}

fn pool_entry(entry: &RawEntry) -> PoolEntry {
    match entry {
        RawEntry::Utf8 { value } => PoolEntry::Utf8(value.clone()),
        RawEntry::Integer { value } => PoolEntry::Integer(*value),
        RawEntry::Float { value } => PoolEntry::Float(*value),
        RawEntry::Long { value } => PoolEntry::Long(*value),
        RawEntry::Double { value } => PoolEntry::Double(*value),
        RawEntry::Class { name_index } => PoolEntry::Class {
            name_index: *name_index,
        },
        RawEntry::String { string_index } => PoolEntry::String {
            utf8_index: *string_index,
        },
        RawEntry::Fieldref {
            class_index,
            name_and_type_index,
        } => PoolEntry::FieldRef {
            class_index: *class_index,
            name_and_type_index: *name_and_type_index,
        },
        RawEntry::Methodref {
            class_index,
            name_and_type_index,
        } => PoolEntry::MethodRef {
            class_index: *class_index,
            name_and_type_index: *name_and_type_index,
        },
        RawEntry::InterfaceMethodref {
            class_index,
            name_and_type_index,
        } => PoolEntry::InterfaceMethodRef {
            class_index: *class_index,
            name_and_type_index: *name_and_type_index,
        },
        RawEntry::NameAndType {
            name_index,
            descriptor_index,
        } => PoolEntry::NameAndType {
            name_index: *name_index,
            descriptor_index: *descriptor_index,
        },
        RawEntry::MethodHandle { .. } => PoolEntry::MethodHandle,
        RawEntry::MethodType { descriptor_index } => PoolEntry::MethodType {
            descriptor_index: *descriptor_index,
        },
        RawEntry::Dynamic {
            name_and_type_index,
            ..
        } => PoolEntry::Dynamic {
            name_and_type_index: *name_and_type_index,
        },
        RawEntry::InvokeDynamic {
            name_and_type_index,
            ..
        } => PoolEntry::InvokeDynamic {
            name_and_type_index: *name_and_type_index,
        },
        RawEntry::Module { .. } => PoolEntry::Module,
        RawEntry::Package { .. } => PoolEntry::Package,
        _ => PoolEntry::Unusable,
    }
}

/// Decode class bytes into the analysis model.
pub(crate) fn decode_class(data: &[u8], artifact_index: i64) -> Result<Class> {
    let class_file = class_file::parse(data).context("class file validation failed")?;
    let constant_pool = ConstantPool::from_entries(class_file.constant_pool());

    let name = constant_pool
        .class_name(class_file.this_class())
        .context("this_class")?
        .to_string();
    let super_name = match class_file.super_class() {
        0 => None,
        index => Some(
            constant_pool
                .class_name(index)
                .context("super_class")?
                .to_string(),
        ),
    };
    let interfaces = class_file
        .interfaces()
        .iter()
        .map(|index| constant_pool.class_name(*index).map(str::to_string))
        .collect::<Result<Vec<_>, _>>()?;

    let fields = class_file
        .fields()
        .iter()
        .map(|field| -> Result<Field> {
            let flags = field.access_flags().bits();
            Ok(Field {
                name: constant_pool.utf8(field.name_index())?.to_string(),
                descriptor: constant_pool.utf8(field.descriptor_index())?.to_string(),
                access: FieldAccess {
                    is_public: flags & ACC_PUBLIC != 0,
                    is_private: flags & ACC_PRIVATE != 0,
                    is_protected: flags & ACC_PROTECTED != 0,
                    is_static: flags & ACC_STATIC != 0,
                    is_final: flags & ACC_FINAL != 0,
                    is_synthetic: flags & ACC_SYNTHETIC != 0,
                },
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut methods = Vec::with_capacity(class_file.methods().len());
    for method in class_file.methods() {
        let flags = method.access_flags().bits();
        let name = constant_pool.utf8(method.name_index())?.to_string();
        let descriptor = constant_pool.utf8(method.descriptor_index())?.to_string();
        let code = method
            .attributes()
            .iter()
            .find_map(|attribute| code_of(attribute, &constant_pool).transpose())
            .transpose()
            .with_context(|| format!("failed to read Code of {name}{descriptor}"))?;
        methods.push(Method {
            name,
            descriptor,
            access: MethodAccess {
                is_public: flags & ACC_PUBLIC != 0,
                is_private: flags & ACC_PRIVATE != 0,
                is_protected: flags & ACC_PROTECTED != 0,
                is_static: flags & ACC_STATIC != 0,
                is_final: flags & ACC_FINAL != 0,
                is_abstract: flags & ACC_ABSTRACT != 0,
                is_synthetic: flags & ACC_SYNTHETIC != 0,
                is_bridge: flags & ACC_BRIDGE != 0,
            },
            code,
        });
    }

    let mut source_file = None;
    let mut annotations = Vec::new();
    for attribute in class_file.attributes() {
        match attribute {
            Attribute::SourceFile { sourcefile_index } => {
                source_file = Some(constant_pool.utf8(*sourcefile_index)?.to_string());
            }
            Attribute::RuntimeVisibleAnnotations {
                annotations: entries,
                ..
            }
            | Attribute::RuntimeInvisibleAnnotations {
                annotations: entries,
            } => {
                for annotation in entries {
                    annotations.push(constant_pool.utf8(annotation.type_index())?.to_string());
                }
            }
            _ => {}
        }
    }

    let flags = class_file.access_flags().bits();
    let referenced_classes = constant_pool.class_names();
    Ok(Class {
        name,
        super_name,
        interfaces,
        access: ClassAccess {
            is_public: flags & ACC_PUBLIC != 0,
            is_final: flags & ACC_FINAL != 0,
            is_interface: flags & ACC_INTERFACE != 0,
            is_abstract: flags & ACC_ABSTRACT != 0,
            is_synthetic: flags & ACC_SYNTHETIC != 0,
        },
        source_file,
        referenced_classes,
        annotations,
        fields,
        methods,
        constant_pool,
        artifact_index,
    })
}

/// The method body carried by a `Code` attribute; other attributes yield `None`.
fn code_of(attribute: &Attribute, pool: &ConstantPool) -> Result<Option<Code>> {
    let Attribute::Code {
        max_stack,
        max_locals,
        code,
        exception_table,
        attributes,
    } = attribute
    else {
        return Ok(None);
    };

    let mut exception_handlers = Vec::with_capacity(exception_table.len());
    for entry in exception_table {
        let catch_type = match entry.catch_type() {
            0 => None,
            index => Some(pool.class_name(index)?.to_string()),
        };
        exception_handlers.push(ExceptionHandler {
            start_pc: u32::from(entry.start_pc()),
            end_pc: u32::from(entry.end_pc()),
            handler_pc: u32::from(entry.handler_pc()),
            catch_type,
        });
    }

    let mut line_numbers: Vec<LineNumber> = attributes
        .iter()
        .filter_map(|attribute| match attribute {
            Attribute::LineNumberTable { line_number_table } => Some(line_number_table),
            _ => None,
        })
        .flatten()
        .map(|entry| LineNumber {
            start_pc: u32::from(entry.start_pc()),
            line: u32::from(entry.line_number()),
        })
        .collect();
    line_numbers.sort_by_key(|entry| entry.start_pc);

    Ok(Some(Code {
        max_stack: *max_stack,
        max_locals: *max_locals,
        bytecode: code.clone(),
        exception_handlers,
        line_numbers,
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const MAGIC: u32 = 0xCAFE_BABE;
    const ACC_SUPER: u16 = 0x0020;

    /// Minimal class-file writer for tests: a pool builder plus one method.
    pub(crate) struct PoolBuilder {
        pub(crate) bytes: Vec<u8>,
        pub(crate) count: u16,
    }

    impl PoolBuilder {
        pub(crate) fn new() -> Self {
            Self {
                bytes: Vec::new(),
                count: 1,
            }
        }

        fn push(&mut self, entry: &[u8]) -> u16 {
            self.bytes.extend_from_slice(entry);
            let index = self.count;
            self.count += 1;
            index
        }

        pub(crate) fn utf8(&mut self, value: &str) -> u16 {
            let mut entry = vec![1];
            entry.extend_from_slice(&(value.len() as u16).to_be_bytes());
            entry.extend_from_slice(value.as_bytes());
            self.push(&entry)
        }

        pub(crate) fn class(&mut self, name: &str) -> u16 {
            let name_index = self.utf8(name);
            let mut entry = vec![7];
            entry.extend_from_slice(&name_index.to_be_bytes());
            self.push(&entry)
        }

        pub(crate) fn long(&mut self, value: i64) -> u16 {
            let mut entry = vec![5];
            entry.extend_from_slice(&value.to_be_bytes());
            let index = self.push(&entry);
            self.count += 1;
            index
        }

        pub(crate) fn string(&mut self, value: &str) -> u16 {
            let utf8_index = self.utf8(value);
            let mut entry = vec![8];
            entry.extend_from_slice(&utf8_index.to_be_bytes());
            self.push(&entry)
        }

        fn member_ref(&mut self, tag: u8, owner: &str, name: &str, descriptor: &str) -> u16 {
            let class_index = self.class(owner);
            let name_index = self.utf8(name);
            let descriptor_index = self.utf8(descriptor);
            let mut nat = vec![12];
            nat.extend_from_slice(&name_index.to_be_bytes());
            nat.extend_from_slice(&descriptor_index.to_be_bytes());
            let nat_index = self.push(&nat);
            let mut entry = vec![tag];
            entry.extend_from_slice(&class_index.to_be_bytes());
            entry.extend_from_slice(&nat_index.to_be_bytes());
            self.push(&entry)
        }

        pub(crate) fn field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
            self.member_ref(9, owner, name, descriptor)
        }

        pub(crate) fn method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
            self.member_ref(10, owner, name, descriptor)
        }

        pub(crate) fn interface_method_ref(
            &mut self,
            owner: &str,
            name: &str,
            descriptor: &str,
        ) -> u16 {
            self.member_ref(11, owner, name, descriptor)
        }

        /// Decode the pool through a class file that declares no members.
        pub(crate) fn build(&self) -> ConstantPool {
            let mut pool = Self {
                bytes: self.bytes.clone(),
                count: self.count,
            };
            let this_class = pool.class("PoolHolder");
            let super_class = pool.class("java/lang/Object");
            let bytes = class_file_bytes(&pool, this_class, super_class, &[]);
            decode_class(&bytes, 0).expect("pool").constant_pool
        }
    }

    /// Class file around `pool` with the given serialized `method_info` entries.
    fn class_file_bytes(
        pool: &PoolBuilder,
        this_class: u16,
        super_class: u16,
        methods: &[Vec<u8>],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&52u16.to_be_bytes());
        out.extend_from_slice(&pool.count.to_be_bytes());
        out.extend_from_slice(&pool.bytes);
        out.extend_from_slice(&(ACC_PUBLIC | ACC_SUPER).to_be_bytes());
        out.extend_from_slice(&this_class.to_be_bytes());
        out.extend_from_slice(&super_class.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&(methods.len() as u16).to_be_bytes());
        for method in methods {
            out.extend_from_slice(method);
        }
        out.extend_from_slice(&0u16.to_be_bytes());
        out
    }

    /// Pool index of the `Math.ceil` method ref written by [`class_bytes`].
    pub(crate) const CEIL_REF: u16 = 14;

    /// Build a class with one public method whose Code is `bytecode`.
    pub(crate) fn class_bytes(class_name: &str, method_name: &str, bytecode: &[u8]) -> Vec<u8> {
        let mut pool = PoolBuilder::new();
        let this_class = pool.class(class_name);
        let super_class = pool.class("java/lang/Object");
        let method_name_index = pool.utf8(method_name);
        let descriptor_index = pool.utf8("()V");
        let code_index = pool.utf8("Code");
        let lines_index = pool.utf8("LineNumberTable");
        let ceil = pool.method_ref("java/lang/Math", "ceil", "(D)D");
        assert_eq!(CEIL_REF, ceil);

        let mut method = Vec::new();
        method.extend_from_slice(&ACC_PUBLIC.to_be_bytes());
        method.extend_from_slice(&method_name_index.to_be_bytes());
        method.extend_from_slice(&descriptor_index.to_be_bytes());
        method.extend_from_slice(&1u16.to_be_bytes());

        let mut code = Vec::new();
        code.extend_from_slice(&2u16.to_be_bytes());
        code.extend_from_slice(&1u16.to_be_bytes());
        code.extend_from_slice(&(bytecode.len() as u32).to_be_bytes());
        code.extend_from_slice(bytecode);
        code.extend_from_slice(&0u16.to_be_bytes());
        code.extend_from_slice(&1u16.to_be_bytes());
        code.extend_from_slice(&lines_index.to_be_bytes());
        code.extend_from_slice(&6u32.to_be_bytes());
        code.extend_from_slice(&1u16.to_be_bytes());
        code.extend_from_slice(&0u16.to_be_bytes());
        code.extend_from_slice(&7u16.to_be_bytes());

        method.extend_from_slice(&code_index.to_be_bytes());
        method.extend_from_slice(&(code.len() as u32).to_be_bytes());
        method.extend_from_slice(&code);
        class_file_bytes(&pool, this_class, super_class, &[method])
    }

    #[test]
    fn decode_class_reads_methods_and_lines() {
        let bytes = class_bytes("com/example/Sample", "run", &[0xb1]);
        let class = decode_class(&bytes, 3).expect("decode");

        assert_eq!("com/example/Sample", class.name);
        assert_eq!(Some("java/lang/Object".to_string()), class.super_name);
        assert_eq!(3, class.artifact_index);
        assert!(class.access.is_public);
        assert_eq!(1, class.methods.len());
        let code = class.methods[0].code.as_ref().expect("code");
        assert_eq!(vec![0xb1], code.bytecode);
        assert_eq!(
            vec![LineNumber {
                start_pc: 0,
                line: 7
            }],
            code.line_numbers
        );
        assert!(class.references_class("java/lang/Math"));
        assert!(class.references_member("ceil"));
    }

    #[test]
    fn decode_class_rejects_bad_magic() {
        assert!(decode_class(b"nope", 0).is_err());
        assert!(decode_class(&[0xca, 0xfe, 0xba, 0xbe, 0, 0], 0).is_err());
    }

    #[test]
    fn long_entries_take_two_slots() {
        let mut pool = PoolBuilder::new();
        let long_index = pool.long(42);
        let after = pool.utf8("after");
        let parsed = pool.build();

        assert_eq!(Constant::Long(42), parsed.loadable(long_index).expect("long"));
        assert!(parsed.loadable(long_index + 1).is_err());
        assert_eq!("after", parsed.utf8(after).expect("utf8"));
    }

    #[test]
    fn method_ref_resolves_owner_and_descriptor() {
        let mut pool = PoolBuilder::new();
        let index = pool.method_ref("java/lang/Math", "ceil", "(D)D");
        let parsed = pool.build();

        let method = parsed.method_ref(index, CallKind::Static).expect("method ref");
        assert_eq!("java/lang/Math", method.owner);
        assert_eq!("ceil", method.name);
        assert_eq!("(D)D", method.descriptor);
        assert!(matches!(
            parsed.field_ref(index),
            Err(EngineError::UnresolvableConstant { .. })
        ));
    }
}
