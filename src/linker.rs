//! Resolves LNK_GOTO / LNK_GOSUB placeholders against the parse-time
//! symbol tables. Link placeholders and their command counterparts have
//! the same width, so the rewrite happens in place.

use crate::parser::{LinkTables, ParseError};
use bitvec::vec::BitVec;
use mcbcore::bytecode::Instr;
use mcbcore::system::System;

/// Walk the store once to learn every instruction boundary, then
/// rewrite the placeholders. A destination that is not a boundary means
/// a branch into the middle of some payload and is rejected.
pub fn link(sys: &mut System, tables: &LinkTables) -> Result<(), ParseError> {
    let end = sys.code.next_index();
    let mut bounds: BitVec = BitVec::repeat(false, end as usize);
    let mut fixups: Vec<(u16, Instr)> = Vec::new();

    let mut offset = 0u16;
    while offset < end {
        bounds.set(offset as usize, true);
        let (instr, next) = sys.code.get(offset).map_err(|_| ParseError::LabelInv)?;
        match instr {
            Instr::LnkGoto { .. } | Instr::LnkGosub { .. } => fixups.push((offset, instr)),
            _ => {}
        }
        offset = next;
    }

    for (offset, instr) in fixups {
        let target = match instr {
            Instr::LnkGoto { label } => {
                let entry = tables
                    .labels
                    .get(label as usize)
                    .ok_or(ParseError::LabelInv)?;
                entry.dst.ok_or(ParseError::LabelMissing)?
            }
            Instr::LnkGosub { sub } => {
                let entry = tables.subs.get(sub as usize).ok_or(ParseError::LabelInv)?;
                entry.entry.ok_or(ParseError::SubNotFound)?
            }
            _ => continue,
        };
        if target as usize >= bounds.len() || !bounds[target as usize] {
            return Err(ParseError::LabelInv);
        }
        let resolved = match instr {
            Instr::LnkGoto { .. } => Instr::Goto { target },
            _ => Instr::Gosub { target },
        };
        sys.code
            .set(offset, &resolved)
            .map_err(|_| ParseError::LabelInv)?;
    }
    Ok(())
}
