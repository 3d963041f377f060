//! Peephole pass over the linked code store. The only rewrite is GOTO
//! chaining: a GOTO whose destination is another GOTO is retargeted to
//! the end of the chain, bounded so constructed cycles terminate.

use mcbcore::bytecode::Instr;
use mcbcore::codestore::StoreError;
use mcbcore::config::GOTO_CHAIN_MAX;
use mcbcore::system::System;

pub fn optimize(sys: &mut System) -> Result<(), StoreError> {
    let end = sys.code.next_index();
    let mut offset = 0u16;
    while offset < end {
        let (instr, next) = sys.code.get(offset)?;
        if let Instr::Goto { target } = instr {
            let dst = chase(sys, target);
            if dst != target {
                sys.code.set(offset, &Instr::Goto { target: dst })?;
            }
        }
        offset = next;
    }
    Ok(())
}

fn chase(sys: &System, start: u16) -> u16 {
    let mut at = start;
    for _ in 0..GOTO_CHAIN_MAX {
        match sys.code.get(at) {
            Ok((Instr::Goto { target }, _)) if target != at => at = target,
            _ => break,
        }
    }
    at
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goto_chain_is_collapsed() -> Result<(), Box<dyn std::error::Error>> {
        let mut sys = System::new();
        // 0: GOTO 3, 3: GOTO 6, 6: END
        let first = sys.code.add(&Instr::Goto { target: 3 })?;
        sys.code.add(&Instr::Goto { target: 6 })?;
        let end = sys.code.add(&Instr::End)?;

        optimize(&mut sys)?;
        assert_eq!(sys.code.get(first)?.0, Instr::Goto { target: end });
        Ok(())
    }

    #[test]
    fn goto_cycle_stays_bounded() -> Result<(), Box<dyn std::error::Error>> {
        let mut sys = System::new();
        // Two GOTOs pointing at each other.
        sys.code.add(&Instr::Goto { target: 3 })?;
        sys.code.add(&Instr::Goto { target: 0 })?;
        sys.code.add(&Instr::End)?;

        optimize(&mut sys)?;
        // Still a GOTO into the cycle, just not an endless walk.
        assert!(matches!(sys.code.get(0)?.0, Instr::Goto { .. }));
        Ok(())
    }

    #[test]
    fn non_goto_targets_are_untouched() -> Result<(), Box<dyn std::error::Error>> {
        let mut sys = System::new();
        let branch = sys.code.add(&Instr::If { target: 4 })?;
        sys.code.add(&Instr::Zero)?;
        sys.code.add(&Instr::End)?;

        optimize(&mut sys)?;
        assert_eq!(sys.code.get(branch)?.0, Instr::If { target: 4 });
        Ok(())
    }
}
