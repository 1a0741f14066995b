#![allow(dead_code)]

//! JVM opcode constants and per-opcode metadata.

pub(crate) const NOP: u8 = 0x00;
pub(crate) const ACONST_NULL: u8 = 0x01;
pub(crate) const ICONST_M1: u8 = 0x02;
pub(crate) const ICONST_0: u8 = 0x03;
pub(crate) const ICONST_1: u8 = 0x04;
pub(crate) const ICONST_2: u8 = 0x05;
pub(crate) const ICONST_3: u8 = 0x06;
pub(crate) const ICONST_4: u8 = 0x07;
pub(crate) const ICONST_5: u8 = 0x08;
pub(crate) const LCONST_0: u8 = 0x09;
pub(crate) const LCONST_1: u8 = 0x0a;
pub(crate) const FCONST_0: u8 = 0x0b;
pub(crate) const FCONST_1: u8 = 0x0c;
pub(crate) const FCONST_2: u8 = 0x0d;
pub(crate) const DCONST_0: u8 = 0x0e;
pub(crate) const DCONST_1: u8 = 0x0f;
pub(crate) const BIPUSH: u8 = 0x10;
pub(crate) const SIPUSH: u8 = 0x11;
pub(crate) const LDC: u8 = 0x12;
pub(crate) const LDC_W: u8 = 0x13;
pub(crate) const LDC2_W: u8 = 0x14;
pub(crate) const ILOAD: u8 = 0x15;
pub(crate) const LLOAD: u8 = 0x16;
pub(crate) const FLOAD: u8 = 0x17;
pub(crate) const DLOAD: u8 = 0x18;
pub(crate) const ALOAD: u8 = 0x19;
pub(crate) const ILOAD_0: u8 = 0x1a;
pub(crate) const ILOAD_1: u8 = 0x1b;
pub(crate) const ILOAD_2: u8 = 0x1c;
pub(crate) const ILOAD_3: u8 = 0x1d;
pub(crate) const LLOAD_0: u8 = 0x1e;
pub(crate) const LLOAD_1: u8 = 0x1f;
pub(crate) const LLOAD_2: u8 = 0x20;
pub(crate) const LLOAD_3: u8 = 0x21;
pub(crate) const FLOAD_0: u8 = 0x22;
pub(crate) const FLOAD_1: u8 = 0x23;
pub(crate) const FLOAD_2: u8 = 0x24;
pub(crate) const FLOAD_3: u8 = 0x25;
pub(crate) const DLOAD_0: u8 = 0x26;
pub(crate) const DLOAD_1: u8 = 0x27;
pub(crate) const DLOAD_2: u8 = 0x28;
pub(crate) const DLOAD_3: u8 = 0x29;
pub(crate) const ALOAD_0: u8 = 0x2a;
pub(crate) const ALOAD_1: u8 = 0x2b;
pub(crate) const ALOAD_2: u8 = 0x2c;
pub(crate) const ALOAD_3: u8 = 0x2d;
pub(crate) const IALOAD: u8 = 0x2e;
pub(crate) const LALOAD: u8 = 0x2f;
pub(crate) const FALOAD: u8 = 0x30;
pub(crate) const DALOAD: u8 = 0x31;
pub(crate) const AALOAD: u8 = 0x32;
pub(crate) const BALOAD: u8 = 0x33;
pub(crate) const CALOAD: u8 = 0x34;
pub(crate) const SALOAD: u8 = 0x35;
pub(crate) const ISTORE: u8 = 0x36;
pub(crate) const LSTORE: u8 = 0x37;
pub(crate) const FSTORE: u8 = 0x38;
pub(crate) const DSTORE: u8 = 0x39;
pub(crate) const ASTORE: u8 = 0x3a;
pub(crate) const ISTORE_0: u8 = 0x3b;
pub(crate) const ISTORE_1: u8 = 0x3c;
pub(crate) const ISTORE_2: u8 = 0x3d;
pub(crate) const ISTORE_3: u8 = 0x3e;
pub(crate) const LSTORE_0: u8 = 0x3f;
pub(crate) const LSTORE_1: u8 = 0x40;
pub(crate) const LSTORE_2: u8 = 0x41;
pub(crate) const LSTORE_3: u8 = 0x42;
pub(crate) const FSTORE_0: u8 = 0x43;
pub(crate) const FSTORE_1: u8 = 0x44;
pub(crate) const FSTORE_2: u8 = 0x45;
pub(crate) const FSTORE_3: u8 = 0x46;
pub(crate) const DSTORE_0: u8 = 0x47;
pub(crate) const DSTORE_1: u8 = 0x48;
pub(crate) const DSTORE_2: u8 = 0x49;
pub(crate) const DSTORE_3: u8 = 0x4a;
pub(crate) const ASTORE_0: u8 = 0x4b;
pub(crate) const ASTORE_1: u8 = 0x4c;
pub(crate) const ASTORE_2: u8 = 0x4d;
pub(crate) const ASTORE_3: u8 = 0x4e;
pub(crate) const IASTORE: u8 = 0x4f;
pub(crate) const LASTORE: u8 = 0x50;
pub(crate) const FASTORE: u8 = 0x51;
pub(crate) const DASTORE: u8 = 0x52;
pub(crate) const AASTORE: u8 = 0x53;
pub(crate) const BASTORE: u8 = 0x54;
pub(crate) const CASTORE: u8 = 0x55;
pub(crate) const SASTORE: u8 = 0x56;
pub(crate) const POP: u8 = 0x57;
pub(crate) const POP2: u8 = 0x58;
pub(crate) const DUP: u8 = 0x59;
pub(crate) const DUP_X1: u8 = 0x5a;
pub(crate) const DUP_X2: u8 = 0x5b;
pub(crate) const DUP2: u8 = 0x5c;
pub(crate) const DUP2_X1: u8 = 0x5d;
pub(crate) const DUP2_X2: u8 = 0x5e;
pub(crate) const SWAP: u8 = 0x5f;
pub(crate) const IADD: u8 = 0x60;
pub(crate) const LADD: u8 = 0x61;
pub(crate) const FADD: u8 = 0x62;
pub(crate) const DADD: u8 = 0x63;
pub(crate) const ISUB: u8 = 0x64;
pub(crate) const LSUB: u8 = 0x65;
pub(crate) const FSUB: u8 = 0x66;
pub(crate) const DSUB: u8 = 0x67;
pub(crate) const IMUL: u8 = 0x68;
pub(crate) const LMUL: u8 = 0x69;
pub(crate) const FMUL: u8 = 0x6a;
pub(crate) const DMUL: u8 = 0x6b;
pub(crate) const IDIV: u8 = 0x6c;
pub(crate) const LDIV: u8 = 0x6d;
pub(crate) const FDIV: u8 = 0x6e;
pub(crate) const DDIV: u8 = 0x6f;
pub(crate) const IREM: u8 = 0x70;
pub(crate) const LREM: u8 = 0x71;
pub(crate) const FREM: u8 = 0x72;
pub(crate) const DREM: u8 = 0x73;
pub(crate) const INEG: u8 = 0x74;
pub(crate) const LNEG: u8 = 0x75;
pub(crate) const FNEG: u8 = 0x76;
pub(crate) const DNEG: u8 = 0x77;
pub(crate) const ISHL: u8 = 0x78;
pub(crate) const LSHL: u8 = 0x79;
pub(crate) const ISHR: u8 = 0x7a;
pub(crate) const LSHR: u8 = 0x7b;
pub(crate) const IUSHR: u8 = 0x7c;
pub(crate) const LUSHR: u8 = 0x7d;
pub(crate) const IAND: u8 = 0x7e;
pub(crate) const LAND: u8 = 0x7f;
pub(crate) const IOR: u8 = 0x80;
pub(crate) const LOR: u8 = 0x81;
pub(crate) const IXOR: u8 = 0x82;
pub(crate) const LXOR: u8 = 0x83;
pub(crate) const IINC: u8 = 0x84;
pub(crate) const I2L: u8 = 0x85;
pub(crate) const I2F: u8 = 0x86;
pub(crate) const I2D: u8 = 0x87;
pub(crate) const L2I: u8 = 0x88;
pub(crate) const L2F: u8 = 0x89;
pub(crate) const L2D: u8 = 0x8a;
pub(crate) const F2I: u8 = 0x8b;
pub(crate) const F2L: u8 = 0x8c;
pub(crate) const F2D: u8 = 0x8d;
pub(crate) const D2I: u8 = 0x8e;
pub(crate) const D2L: u8 = 0x8f;
pub(crate) const D2F: u8 = 0x90;
pub(crate) const I2B: u8 = 0x91;
pub(crate) const I2C: u8 = 0x92;
pub(crate) const I2S: u8 = 0x93;
pub(crate) const LCMP: u8 = 0x94;
pub(crate) const FCMPL: u8 = 0x95;
pub(crate) const FCMPG: u8 = 0x96;
pub(crate) const DCMPL: u8 = 0x97;
pub(crate) const DCMPG: u8 = 0x98;
pub(crate) const IFEQ: u8 = 0x99;
pub(crate) const IFNE: u8 = 0x9a;
pub(crate) const IFLT: u8 = 0x9b;
pub(crate) const IFGE: u8 = 0x9c;
pub(crate) const IFGT: u8 = 0x9d;
pub(crate) const IFLE: u8 = 0x9e;
pub(crate) const IF_ICMPEQ: u8 = 0x9f;
pub(crate) const IF_ICMPNE: u8 = 0xa0;
pub(crate) const IF_ICMPLT: u8 = 0xa1;
pub(crate) const IF_ICMPGE: u8 = 0xa2;
pub(crate) const IF_ICMPGT: u8 = 0xa3;
pub(crate) const IF_ICMPLE: u8 = 0xa4;
pub(crate) const IF_ACMPEQ: u8 = 0xa5;
pub(crate) const IF_ACMPNE: u8 = 0xa6;
pub(crate) const GOTO: u8 = 0xa7;
pub(crate) const JSR: u8 = 0xa8;
pub(crate) const RET: u8 = 0xa9;
pub(crate) const TABLESWITCH: u8 = 0xaa;
pub(crate) const LOOKUPSWITCH: u8 = 0xab;
pub(crate) const IRETURN: u8 = 0xac;
pub(crate) const LRETURN: u8 = 0xad;
pub(crate) const FRETURN: u8 = 0xae;
pub(crate) const DRETURN: u8 = 0xaf;
pub(crate) const ARETURN: u8 = 0xb0;
pub(crate) const RETURN: u8 = 0xb1;
pub(crate) const GETSTATIC: u8 = 0xb2;
pub(crate) const PUTSTATIC: u8 = 0xb3;
pub(crate) const GETFIELD: u8 = 0xb4;
pub(crate) const PUTFIELD: u8 = 0xb5;
pub(crate) const INVOKEVIRTUAL: u8 = 0xb6;
pub(crate) const INVOKESPECIAL: u8 = 0xb7;
pub(crate) const INVOKESTATIC: u8 = 0xb8;
pub(crate) const INVOKEINTERFACE: u8 = 0xb9;
pub(crate) const INVOKEDYNAMIC: u8 = 0xba;
pub(crate) const NEW: u8 = 0xbb;
pub(crate) const NEWARRAY: u8 = 0xbc;
pub(crate) const ANEWARRAY: u8 = 0xbd;
pub(crate) const ARRAYLENGTH: u8 = 0xbe;
pub(crate) const ATHROW: u8 = 0xbf;
pub(crate) const CHECKCAST: u8 = 0xc0;
pub(crate) const INSTANCEOF: u8 = 0xc1;
pub(crate) const MONITORENTER: u8 = 0xc2;
pub(crate) const MONITOREXIT: u8 = 0xc3;
pub(crate) const WIDE: u8 = 0xc4;
pub(crate) const MULTIANEWARRAY: u8 = 0xc5;
pub(crate) const IFNULL: u8 = 0xc6;
pub(crate) const IFNONNULL: u8 = 0xc7;
pub(crate) const GOTO_W: u8 = 0xc8;
pub(crate) const JSR_W: u8 = 0xc9;

/// Mnemonic for an opcode, or `"<unknown>"` for unassigned values.
pub(crate) fn name(opcode: u8) -> &'static str {
    match opcode {
        NOP => "nop",
        ACONST_NULL => "aconst_null",
        ICONST_M1 => "iconst_m1",
        ICONST_0 => "iconst_0",
        ICONST_1 => "iconst_1",
        ICONST_2 => "iconst_2",
        ICONST_3 => "iconst_3",
        ICONST_4 => "iconst_4",
        ICONST_5 => "iconst_5",
        LCONST_0 => "lconst_0",
        LCONST_1 => "lconst_1",
        FCONST_0 => "fconst_0",
        FCONST_1 => "fconst_1",
        FCONST_2 => "fconst_2",
        DCONST_0 => "dconst_0",
        DCONST_1 => "dconst_1",
        BIPUSH => "bipush",
        SIPUSH => "sipush",
        LDC => "ldc",
        LDC_W => "ldc_w",
        LDC2_W => "ldc2_w",
        ILOAD => "iload",
        LLOAD => "lload",
        FLOAD => "fload",
        DLOAD => "dload",
        ALOAD => "aload",
        ILOAD_0 => "iload_0",
        ILOAD_1 => "iload_1",
        ILOAD_2 => "iload_2",
        ILOAD_3 => "iload_3",
        LLOAD_0 => "lload_0",
        LLOAD_1 => "lload_1",
        LLOAD_2 => "lload_2",
        LLOAD_3 => "lload_3",
        FLOAD_0 => "fload_0",
        FLOAD_1 => "fload_1",
        FLOAD_2 => "fload_2",
        FLOAD_3 => "fload_3",
        DLOAD_0 => "dload_0",
        DLOAD_1 => "dload_1",
        DLOAD_2 => "dload_2",
        DLOAD_3 => "dload_3",
        ALOAD_0 => "aload_0",
        ALOAD_1 => "aload_1",
        ALOAD_2 => "aload_2",
        ALOAD_3 => "aload_3",
        IALOAD => "iaload",
        LALOAD => "laload",
        FALOAD => "faload",
        DALOAD => "daload",
        AALOAD => "aaload",
        BALOAD => "baload",
        CALOAD => "caload",
        SALOAD => "saload",
        ISTORE => "istore",
        LSTORE => "lstore",
        FSTORE => "fstore",
        DSTORE => "dstore",
        ASTORE => "astore",
        ISTORE_0 => "istore_0",
        ISTORE_1 => "istore_1",
        ISTORE_2 => "istore_2",
        ISTORE_3 => "istore_3",
        LSTORE_0 => "lstore_0",
        LSTORE_1 => "lstore_1",
        LSTORE_2 => "lstore_2",
        LSTORE_3 => "lstore_3",
        FSTORE_0 => "fstore_0",
        FSTORE_1 => "fstore_1",
        FSTORE_2 => "fstore_2",
        FSTORE_3 => "fstore_3",
        DSTORE_0 => "dstore_0",
        DSTORE_1 => "dstore_1",
        DSTORE_2 => "dstore_2",
        DSTORE_3 => "dstore_3",
        ASTORE_0 => "astore_0",
        ASTORE_1 => "astore_1",
        ASTORE_2 => "astore_2",
        ASTORE_3 => "astore_3",
        IASTORE => "iastore",
        LASTORE => "lastore",
        FASTORE => "fastore",
        DASTORE => "dastore",
        AASTORE => "aastore",
        BASTORE => "bastore",
        CASTORE => "castore",
        SASTORE => "sastore",
        POP => "pop",
        POP2 => "pop2",
        DUP => "dup",
        DUP_X1 => "dup_x1",
        DUP_X2 => "dup_x2",
        DUP2 => "dup2",
        DUP2_X1 => "dup2_x1",
        DUP2_X2 => "dup2_x2",
        SWAP => "swap",
        IADD => "iadd",
        LADD => "ladd",
        FADD => "fadd",
        DADD => "dadd",
        ISUB => "isub",
        LSUB => "lsub",
        FSUB => "fsub",
        DSUB => "dsub",
        IMUL => "imul",
        LMUL => "lmul",
        FMUL => "fmul",
        DMUL => "dmul",
        IDIV => "idiv",
        LDIV => "ldiv",
        FDIV => "fdiv",
        DDIV => "ddiv",
        IREM => "irem",
        LREM => "lrem",
        FREM => "frem",
        DREM => "drem",
        INEG => "ineg",
        LNEG => "lneg",
        FNEG => "fneg",
        DNEG => "dneg",
        ISHL => "ishl",
        LSHL => "lshl",
        ISHR => "ishr",
        LSHR => "lshr",
        IUSHR => "iushr",
        LUSHR => "lushr",
        IAND => "iand",
        LAND => "land",
        IOR => "ior",
        LOR => "lor",
        IXOR => "ixor",
        LXOR => "lxor",
        IINC => "iinc",
        I2L => "i2l",
        I2F => "i2f",
        I2D => "i2d",
        L2I => "l2i",
        L2F => "l2f",
        L2D => "l2d",
        F2I => "f2i",
        F2L => "f2l",
        F2D => "f2d",
        D2I => "d2i",
        D2L => "d2l",
        D2F => "d2f",
        I2B => "i2b",
        I2C => "i2c",
        I2S => "i2s",
        LCMP => "lcmp",
        FCMPL => "fcmpl",
        FCMPG => "fcmpg",
        DCMPL => "dcmpl",
        DCMPG => "dcmpg",
        IFEQ => "ifeq",
        IFNE => "ifne",
        IFLT => "iflt",
        IFGE => "ifge",
        IFGT => "ifgt",
        IFLE => "ifle",
        IF_ICMPEQ => "if_icmpeq",
        IF_ICMPNE => "if_icmpne",
        IF_ICMPLT => "if_icmplt",
        IF_ICMPGE => "if_icmpge",
        IF_ICMPGT => "if_icmpgt",
        IF_ICMPLE => "if_icmple",
        IF_ACMPEQ => "if_acmpeq",
        IF_ACMPNE => "if_acmpne",
        GOTO => "goto",
        JSR => "jsr",
        RET => "ret",
        TABLESWITCH => "tableswitch",
        LOOKUPSWITCH => "lookupswitch",
        IRETURN => "ireturn",
        LRETURN => "lreturn",
        FRETURN => "freturn",
        DRETURN => "dreturn",
        ARETURN => "areturn",
        RETURN => "return",
        GETSTATIC => "getstatic",
        PUTSTATIC => "putstatic",
        GETFIELD => "getfield",
        PUTFIELD => "putfield",
        INVOKEVIRTUAL => "invokevirtual",
        INVOKESPECIAL => "invokespecial",
        INVOKESTATIC => "invokestatic",
        INVOKEINTERFACE => "invokeinterface",
        INVOKEDYNAMIC => "invokedynamic",
        NEW => "new",
        NEWARRAY => "newarray",
        ANEWARRAY => "anewarray",
        ARRAYLENGTH => "arraylength",
        ATHROW => "athrow",
        CHECKCAST => "checkcast",
        INSTANCEOF => "instanceof",
        MONITORENTER => "monitorenter",
        MONITOREXIT => "monitorexit",
        WIDE => "wide",
        MULTIANEWARRAY => "multianewarray",
        IFNULL => "ifnull",
        IFNONNULL => "ifnonnull",
        GOTO_W => "goto_w",
        JSR_W => "jsr_w",
        _ => "<unknown>",
    }
}

/// Number of operand bytes following a fixed-length opcode.
///
/// Returns `None` for variable-length forms (`tableswitch`, `lookupswitch`,
/// `wide`) and for unassigned opcodes.
pub(crate) fn operand_len(opcode: u8) -> Option<usize> {
    match opcode {
        NOP | ACONST_NULL | ICONST_M1 | ICONST_0 | ICONST_1 | ICONST_2 | ICONST_3
        | ICONST_4 | ICONST_5 | LCONST_0 | LCONST_1 | FCONST_0 | FCONST_1
        | FCONST_2 | DCONST_0 | DCONST_1 | ILOAD_0 | ILOAD_1 | ILOAD_2
        | ILOAD_3 | LLOAD_0 | LLOAD_1 | LLOAD_2 | LLOAD_3 | FLOAD_0
        | FLOAD_1 | FLOAD_2 | FLOAD_3 | DLOAD_0 | DLOAD_1 | DLOAD_2
        | DLOAD_3 | ALOAD_0 | ALOAD_1 | ALOAD_2 | ALOAD_3 | IALOAD | LALOAD
        | FALOAD | DALOAD | AALOAD | BALOAD | CALOAD | SALOAD | ISTORE_0
        | ISTORE_1 | ISTORE_2 | ISTORE_3 | LSTORE_0 | LSTORE_1 | LSTORE_2
        | LSTORE_3 | FSTORE_0 | FSTORE_1 | FSTORE_2 | FSTORE_3 | DSTORE_0
        | DSTORE_1 | DSTORE_2 | DSTORE_3 | ASTORE_0 | ASTORE_1 | ASTORE_2
        | ASTORE_3 | IASTORE | LASTORE | FASTORE | DASTORE | AASTORE
        | BASTORE | CASTORE | SASTORE | POP | POP2 | DUP | DUP_X1 | DUP_X2
        | DUP2 | DUP2_X1 | DUP2_X2 | SWAP | IADD | LADD | FADD | DADD | ISUB
        | LSUB | FSUB | DSUB | IMUL | LMUL | FMUL | DMUL | IDIV | LDIV
        | FDIV | DDIV | IREM | LREM | FREM | DREM | INEG | LNEG | FNEG
        | DNEG | ISHL | LSHL | ISHR | LSHR | IUSHR | LUSHR | IAND | LAND
        | IOR | LOR | IXOR | LXOR | I2L | I2F | I2D | L2I | L2F | L2D | F2I
        | F2L | F2D | D2I | D2L | D2F | I2B | I2C | I2S | LCMP | FCMPL
        | FCMPG | DCMPL | DCMPG | IRETURN | LRETURN | FRETURN | DRETURN
        | ARETURN | RETURN | ARRAYLENGTH | ATHROW | MONITORENTER
        | MONITOREXIT => Some(0),
        BIPUSH | LDC | ILOAD | LLOAD | FLOAD | DLOAD | ALOAD | ISTORE | LSTORE | FSTORE
        | DSTORE | ASTORE | RET | NEWARRAY => Some(1),
        SIPUSH | LDC_W | LDC2_W | IINC | IFEQ | IFNE | IFLT | IFGE | IFGT | IFLE
        | IF_ICMPEQ | IF_ICMPNE | IF_ICMPLT | IF_ICMPGE | IF_ICMPGT
        | IF_ICMPLE | IF_ACMPEQ | IF_ACMPNE | GOTO | JSR | GETSTATIC
        | PUTSTATIC | GETFIELD | PUTFIELD | INVOKEVIRTUAL | INVOKESPECIAL
        | INVOKESTATIC | NEW | ANEWARRAY | CHECKCAST | INSTANCEOF | IFNULL
        | IFNONNULL => Some(2),
        MULTIANEWARRAY => Some(3),
        INVOKEINTERFACE | INVOKEDYNAMIC | GOTO_W | JSR_W => Some(4),
        _ => None,
    }
}
