//! Read-only dumps of a compiled program. Walks the code store with the
//! width function, never guesses offsets.

use mcbcore::bytecode::Instr;
use mcbcore::codestore::StoreError;
use mcbcore::system::System;
use std::io::{self, Write};

/// Every instruction in the store, in emission order.
pub fn disassemble(sys: &System) -> Result<Vec<(u16, Instr)>, StoreError> {
    let mut instructions = Vec::new();
    let mut offset = 0u16;
    let end = sys.code.next_index();
    while offset < end {
        let (instr, next) = sys.code.get(offset)?;
        instructions.push((offset, instr));
        offset = next;
    }
    Ok(instructions)
}

pub fn dump_code(sys: &System, out: &mut dyn Write) -> io::Result<()> {
    let instructions = match disassemble(sys) {
        Ok(instructions) => instructions,
        Err(err) => return writeln!(out, "<corrupt code store: {}>", err),
    };
    for (offset, instr) in instructions {
        match instr {
            Instr::Str { start, len } => {
                let text = sys
                    .strings
                    .get(start, len)
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                    .unwrap_or_else(|_| "<bad range>".to_string());
                writeln!(out, "{:04x}  {:?} {:?}", offset, instr, text)?;
            }
            _ => writeln!(out, "{:04x}  {:?}", offset, instr)?,
        }
    }
    Ok(())
}

pub fn dump_strings(sys: &System, out: &mut dyn Write) -> io::Result<()> {
    let bytes = sys.strings.as_bytes();
    writeln!(out, "string pool, {} bytes:", bytes.len())?;
    writeln!(out, "{:?}", String::from_utf8_lossy(bytes))
}
