//! Target call signatures.

use crate::metadata::SlotType;
use quill_bytecode::{CodeFlags, CodeObject};
use quill_types::TypeId;

/// The signature a function is translated against.
///
/// Parameter types seed the entry state; the return type decides whether
/// `RETURN_VALUE` needs a checked conversion.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallSignature {
    /// Types of the parameter slots in order, including `*args`/`**kwargs`.
    pub params: Vec<TypeId>,
    /// Declared return type.
    pub ret: TypeId,
    /// The first parameter is the receiver.
    pub is_method: bool,
}

impl CallSignature {
    /// A fully dynamic signature: every parameter and the result are `object`.
    pub fn dynamic() -> Self {
        CallSignature {
            params: Vec::new(),
            ret: TypeId::OBJECT,
            is_method: false,
        }
    }

    /// A signature with the given parameter and return types.
    pub fn new(params: &[TypeId], ret: TypeId) -> Self {
        CallSignature {
            params: params.to_vec(),
            ret,
            is_method: false,
        }
    }

    /// Mark the first parameter as the receiver of type `receiver`.
    pub fn method(mut self, receiver: TypeId) -> Self {
        if self.params.is_empty() {
            self.params.push(receiver);
        } else {
            self.params[0] = receiver;
        }
        self.is_method = true;
        self
    }

    /// Initial local types for `code` called with this signature.
    ///
    /// Parameters without a declared type are `object`, the `*args` and
    /// `**kwargs` slots are always a tuple and a dict, and every other local
    /// starts unassigned.
    pub fn entry_locals(&self, code: &CodeObject) -> Vec<Option<SlotType>> {
        let mut locals = vec![None; code.local_count()];
        let positional = code.arg_count as usize + code.kwonlyarg_count as usize;
        for (slot, local) in locals.iter_mut().enumerate().take(code.total_params()) {
            let declared = self.params.get(slot).copied().unwrap_or(TypeId::OBJECT);
            *local = Some(SlotType::Instance(declared));
        }

        let mut next = positional;
        if code.flags.contains(CodeFlags::VARARGS) {
            if let Some(local) = locals.get_mut(next) {
                *local = Some(SlotType::Instance(TypeId::TUPLE));
            }
            next += 1;
        }
        if code.flags.contains(CodeFlags::VARKEYWORDS) {
            if let Some(local) = locals.get_mut(next) {
                *local = Some(SlotType::Instance(TypeId::DICT));
            }
        }
        locals
    }
}

impl Default for CallSignature {
    fn default() -> Self {
        Self::dynamic()
    }
}
