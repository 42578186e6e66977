//! Human-readable bytecode listings.

use crate::opcode::{Op, Operands};
use crate::proto::{Constant, FnProto};
use std::fmt::Write;

/// Render a compiled prototype (and, recursively, its nested functions) as
/// a disassembly listing.
pub fn dump_proto(proto: &FnProto) -> String {
    let mut out = String::new();
    dump_one(proto, &mut out);

    for constant in &proto.constants {
        if let Constant::Fn(inner) = constant {
            out.push('\n');
            out.push_str(&dump_proto(inner));
        }
    }
    out
}

fn dump_one(proto: &FnProto, out: &mut String) {
    let _ = writeln!(
        out,
        "== {} (arity {}, slots {}, upvalues {}) ==",
        if proto.debug.name.is_empty() { "<fn>" } else { &proto.debug.name },
        proto.arity,
        proto.max_slots,
        proto.num_upvalues
    );

    let mut offset = 0;
    let mut last_line = u32::MAX;
    while offset < proto.code.len() {
        let op = match Op::from_byte(proto.code[offset]) {
            Some(op) => op,
            None => {
                let _ = writeln!(out, "{offset:04}   <bad opcode {:#04x}>", proto.code[offset]);
                offset += 1;
                continue;
            }
        };

        let line = proto.line_at(offset);
        if line == last_line {
            let _ = write!(out, "{offset:04}    | ");
        } else {
            let _ = write!(out, "{offset:04} {line:4} ");
            last_line = line;
        }

        offset += 1;
        match op.operands() {
            Operands::None => {
                let _ = writeln!(out, "{op:?}");
            }
            Operands::Byte => {
                let arg = proto.code[offset];
                offset += 1;
                let _ = writeln!(out, "{op:?} {arg}");
            }
            Operands::Short => {
                let arg = proto.read_short(offset);
                offset += 2;
                if op == Op::Constant {
                    let _ = writeln!(out, "{op:?} {arg} ({})", constant_label(proto, arg));
                } else {
                    let _ = writeln!(out, "{op:?} {arg}");
                }
            }
            Operands::ShortShort => {
                let symbol = proto.read_short(offset);
                let superclass = proto.read_short(offset + 2);
                offset += 4;
                let _ = writeln!(out, "{op:?} sym {symbol} super {superclass}");
            }
            Operands::ClosureSpec => {
                let constant = proto.read_short(offset);
                offset += 2;
                let num_upvalues = match proto.constants.get(constant as usize) {
                    Some(Constant::Fn(inner)) => inner.num_upvalues,
                    _ => 0,
                };
                let _ = write!(out, "{op:?} {constant}");
                for _ in 0..num_upvalues {
                    let is_local = proto.code[offset];
                    let index = proto.code[offset + 1];
                    offset += 2;
                    let _ = write!(
                        out,
                        " [{} {index}]",
                        if is_local == 1 { "local" } else { "upvalue" }
                    );
                }
                out.push('\n');
            }
        }
    }
}

fn constant_label(proto: &FnProto, index: u16) -> String {
    match proto.constants.get(index as usize) {
        Some(Constant::Null) => "null".to_string(),
        Some(Constant::Bool(b)) => b.to_string(),
        Some(Constant::Num(n)) => n.to_string(),
        Some(Constant::Str(s)) => {
            let text: String = String::from_utf8_lossy(s).chars().take(24).collect();
            if s.len() > 24 {
                format!("{text:?}...")
            } else {
                format!("{text:?}")
            }
        }
        Some(Constant::Fn(inner)) => format!("fn {}", inner.debug.name),
        Some(Constant::Map(_)) => "<map>".to_string(),
        Some(Constant::List(_)) => "<list>".to_string(),
        None => "<bad constant>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_simple_sequence() {
        let mut proto = FnProto::new("main");
        proto.constants.push(Constant::Num(42.0));
        proto.code = vec![
            Op::Constant as u8,
            0,
            0,
            Op::Return as u8,
            Op::End as u8,
        ];
        proto.debug.source_lines = vec![1, 1, 1, 1, 1];

        let listing = dump_proto(&proto);
        assert!(listing.contains("Constant 0 (42)"));
        assert!(listing.contains("Return"));
        assert!(listing.contains("== main"));
    }
}
