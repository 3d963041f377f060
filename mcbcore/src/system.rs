//! Host capability bundle. The embedding owns the code store, the
//! string pool, the register and service tables, the source and output
//! channels; the core borrows them through this structure.

use crate::codestore::CodeStore;
use crate::config::{MAX_REG_NUM, MAX_SVC_NUM};
use crate::errors::RuntimeError;
use crate::strpool::StringPool;
use crate::value::Value;
use std::cell::Cell;
use std::io::Write;
use std::rc::Rc;

pub type SourceFn = Box<dyn FnMut() -> u8>;
pub type RegGetFn = Box<dyn FnMut() -> Result<Value, RuntimeError>>;
pub type RegSetFn = Box<dyn FnMut(Value) -> Result<(), RuntimeError>>;
pub type SvcFn = Box<dyn FnMut(&mut SvcCall<'_>) -> Result<Value, RuntimeError>>;

/// A named typed cell owned by the host, read and written from BASIC
/// through `$name`. A missing direction fails at run time.
pub struct Register {
    pub name: String,
    pub get: Option<RegGetFn>,
    pub set: Option<RegSetFn>,
}

/// A host-callable with exact arity, invoked from BASIC by name.
pub struct Service {
    pub name: String,
    pub argc: i16,
    pub func: SvcFn,
}

/// View handed to a service: the whole evaluation stack (for pointer
/// arguments) plus the argument window.
pub struct SvcCall<'a> {
    pub stack: &'a mut [Value],
    /// Index of the first argument cell.
    pub base: usize,
    pub argc: usize,
}

impl SvcCall<'_> {
    pub fn arg(&self, i: usize) -> Result<Value, RuntimeError> {
        if i >= self.argc {
            return Err(RuntimeError::InvalidService);
        }
        Ok(self.stack[self.base + i])
    }

    /// Read through a pointer argument with a bounds check against its
    /// declared dim.
    pub fn load(&self, ptr: Value, i: usize) -> Result<Value, RuntimeError> {
        let Value::Ptr { index, dim } = ptr else {
            return Err(RuntimeError::VarAddress);
        };
        if i >= dim as usize {
            return Err(RuntimeError::OutOfBounds);
        }
        self.stack
            .get(index as usize + i)
            .copied()
            .ok_or(RuntimeError::VarAddress)
    }

    /// Write through a pointer argument.
    pub fn store(&mut self, ptr: Value, i: usize, value: Value) -> Result<(), RuntimeError> {
        let Value::Ptr { index, dim } = ptr else {
            return Err(RuntimeError::VarAddress);
        };
        if i >= dim as usize {
            return Err(RuntimeError::OutOfBounds);
        }
        let slot = self
            .stack
            .get_mut(index as usize + i)
            .ok_or(RuntimeError::VarAddress)?;
        *slot = value;
        Ok(())
    }
}

pub struct System {
    pub code: CodeStore,
    pub strings: StringPool,
    /// Appended by PRINT without a trailing `;`. Embedding constant.
    pub eol: Vec<u8>,
    /// Remaining sleep in ms, written by a host sleep service and
    /// consumed by the task driver.
    pub sleep: Rc<Cell<u32>>,
    /// One byte of BASIC source per call, NUL at end of input.
    pub source: SourceFn,
    pub out: Box<dyn Write>,
    registers: Vec<Register>,
    services: Vec<Service>,
}

impl System {
    pub fn new() -> Self {
        System {
            code: CodeStore::new(),
            strings: StringPool::new(),
            eol: b"\r\n".to_vec(),
            sleep: Rc::new(Cell::new(0)),
            source: Box::new(|| 0),
            out: Box::new(std::io::sink()),
            registers: Vec::new(),
            services: Vec::new(),
        }
    }

    /// Feed the parser from an in-memory buffer.
    pub fn source_from(&mut self, text: impl Into<Vec<u8>>) {
        let bytes = text.into();
        let mut at = 0;
        self.source = Box::new(move || {
            let byte = bytes.get(at).copied().unwrap_or(0);
            at += 1;
            byte
        });
    }

    pub fn add_register(
        &mut self,
        name: &str,
        get: Option<RegGetFn>,
        set: Option<RegSetFn>,
    ) -> Result<i16, RuntimeError> {
        if self.registers.len() >= MAX_REG_NUM {
            return Err(RuntimeError::RegIndex);
        }
        self.registers.push(Register {
            name: name.to_string(),
            get,
            set,
        });
        Ok((self.registers.len() - 1) as i16)
    }

    pub fn add_service(&mut self, name: &str, argc: i16, func: SvcFn) -> Result<i16, RuntimeError> {
        if self.services.len() >= MAX_SVC_NUM {
            return Err(RuntimeError::InvalidService);
        }
        self.services.push(Service {
            name: name.to_string(),
            argc,
            func,
        });
        Ok((self.services.len() - 1) as i16)
    }

    /// Case-insensitive register lookup.
    pub fn find_register(&self, name: &str) -> Option<i16> {
        self.registers
            .iter()
            .position(|r| r.name.eq_ignore_ascii_case(name))
            .map(|i| i as i16)
    }

    /// Case-insensitive service lookup, returns (index, argc).
    pub fn find_service(&self, name: &str) -> Option<(i16, i16)> {
        self.services
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(name))
            .map(|i| (i as i16, self.services[i].argc))
    }

    pub fn register_mut(&mut self, index: i16) -> Option<&mut Register> {
        if index < 0 {
            return None;
        }
        self.registers.get_mut(index as usize)
    }

    pub fn service_mut(&mut self, index: i16) -> Option<&mut Service> {
        if index < 0 {
            return None;
        }
        self.services.get_mut(index as usize)
    }

    pub fn service_argc(&self, index: i16) -> Option<i16> {
        if index < 0 {
            return None;
        }
        self.services.get(index as usize).map(|s| s.argc)
    }
}

impl Default for System {
    fn default() -> Self {
        System::new()
    }
}
