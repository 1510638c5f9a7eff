//! Native function bridge.
//!
//! External functions declared by EXTERN markers resolve to closures the
//! host binds here. The registry owns the marshalling protocol: arguments
//! travel on the value stack in declaration order (last parameter on top),
//! the closure sees them as typed values left to right, and a declared
//! return value is pushed back for the bytecode side to consume.

use crate::error::Fault;
use crate::register::{Kind, Value};
use crate::stack::ValueStack;

/// Declared parameter and return kinds of a native function.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signature {
    pub params: Vec<Kind>,
    pub ret: Option<Kind>,
}

impl Signature {
    pub fn new(params: Vec<Kind>, ret: Option<Kind>) -> Self {
        Signature { params, ret }
    }

    /// Total bytes the parameters occupy on the value stack.
    pub fn arg_bytes(&self) -> usize {
        self.params.iter().map(|kind| kind.width()).sum()
    }
}

/// Host-side implementation of an external function. Errors surface to the
/// running program as a fault naming the function.
pub type NativeFn = Box<dyn FnMut(&[Value]) -> anyhow::Result<Option<Value>> + Send>;

struct NativeEntry {
    name: String,
    signature: Signature,
    func: NativeFn,
}

/// Slot-indexed table of bound native functions.
#[derive(Default)]
pub struct NativeRegistry {
    entries: Vec<NativeEntry>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure and return its slot for the function table.
    pub fn bind(&mut self, name: &str, signature: Signature, func: NativeFn) -> usize {
        let slot = self.entries.len();
        self.entries.push(NativeEntry {
            name: name.to_owned(),
            signature,
            func,
        });
        slot
    }

    pub fn name(&self, slot: usize) -> Option<&str> {
        self.entries.get(slot).map(|entry| entry.name.as_str())
    }

    pub fn signature(&self, slot: usize) -> Option<&Signature> {
        self.entries.get(slot).map(|entry| &entry.signature)
    }

    /// Pop arguments, run the closure, push the declared return value.
    ///
    /// The last declared parameter is on top of the stack, so pops run in
    /// reverse declaration order and the argument slice is flipped back
    /// before the call.
    pub fn invoke(&mut self, slot: usize, stack: &mut ValueStack) -> Result<(), Fault> {
        let entry = match self.entries.get_mut(slot) {
            Some(entry) => entry,
            None => {
                return Err(Fault::UnknownSymbol {
                    what: "native slot",
                    name: slot.to_string(),
                })
            }
        };

        let mut args = Vec::with_capacity(entry.signature.params.len());
        for kind in entry.signature.params.iter().rev() {
            let value = stack.pop_value(*kind).map_err(|fault| Fault::MarshalError {
                function: entry.name.clone(),
                msg: fault.to_string(),
            })?;
            args.push(value);
        }
        args.reverse();

        let result = (entry.func)(&args).map_err(|err| Fault::NativeFailed {
            function: entry.name.clone(),
            msg: format!("{err:#}"),
        })?;

        match (entry.signature.ret, result) {
            (None, None) => Ok(()),
            (Some(kind), Some(value)) if value.kind() == kind => stack.push_value(value),
            (Some(kind), Some(value)) => Err(Fault::MarshalError {
                function: entry.name.clone(),
                msg: format!("returned {} where {} was declared", value.kind(), kind),
            }),
            (Some(kind), None) => Err(Fault::MarshalError {
                function: entry.name.clone(),
                msg: format!("missing declared {kind} return value"),
            }),
            (None, Some(value)) => Err(Fault::MarshalError {
                function: entry.name.clone(),
                msg: format!("returned an undeclared {}", value.kind()),
            }),
        }
    }
}

impl std::fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.entries.iter().map(|e| e.name.as_str()).collect();
        f.debug_struct("NativeRegistry")
            .field("entries", &names)
            .finish()
    }
}
