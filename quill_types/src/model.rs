//! The type model: descriptors, method tables and lattice queries.
//!
//! # Query surface
//!
//! | Query | Purpose |
//! |-------|---------|
//! | [`TypeModel::lookup_method`] | All overloads of a method along the MRO |
//! | [`TypeModel::resolve_overload`] | Pick the single matching overload, if any |
//! | [`TypeModel::common_supertype`] | Lattice join used at control-flow merges |
//!
//! Resolution is best-effort. A miss (no match, or an ambiguous match) is not
//! an error: the caller falls back to dynamic dispatch.

use crate::mro::{Mro, compute_c3_mro};
use crate::{Signature, TypeId, TypeModelError};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;

// =============================================================================
// Type Descriptor
// =============================================================================

/// Everything the model knows about one type.
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    /// The type's id.
    pub id: TypeId,
    /// Type name (`int`, `ValueError`, ...).
    pub name: Arc<str>,
    /// Direct bases, in declaration order.
    pub bases: SmallVec<[TypeId; 2]>,
    /// Cached C3 linearisation, the type itself first.
    mro: Mro,
    /// Longest inheritance path to `object`.
    depth: u32,
    /// Methods declared directly on this type.
    methods: FxHashMap<Arc<str>, SmallVec<[Arc<Signature>; 2]>>,
    /// Attribute types declared directly on this type.
    attributes: FxHashMap<Arc<str>, TypeId>,
}

impl TypeDescriptor {
    /// The method resolution order.
    #[inline]
    pub fn mro(&self) -> &[TypeId] {
        &self.mro
    }

    /// Inheritance depth (`object` is 0).
    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Whether the method is declared directly on this type.
    #[inline]
    pub fn declares_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }
}

// =============================================================================
// Global Bindings
// =============================================================================

/// What a builtin global name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalBinding {
    /// A class object (calling it constructs an instance).
    Class(TypeId),
    /// A builtin function, declared as a method of [`TypeId::BUILTINS`].
    Function,
}

// =============================================================================
// Type Model
// =============================================================================

/// Registry of types and their method signatures.
#[derive(Debug, Clone, Default)]
pub struct TypeModel {
    types: Vec<TypeDescriptor>,
    by_name: FxHashMap<Arc<str>, TypeId>,
    global_classes: FxHashMap<Arc<str>, TypeId>,
    max_depth: u32,
}

impl TypeModel {
    /// Create an empty model containing only `object`.
    pub fn new() -> Self {
        let mut model = TypeModel::default();
        let object: Arc<str> = Arc::from("object");
        let mut mro = Mro::new();
        mro.push(TypeId::OBJECT);
        model.types.push(TypeDescriptor {
            id: TypeId::OBJECT,
            name: object.clone(),
            bases: SmallVec::new(),
            mro,
            depth: 0,
            methods: FxHashMap::default(),
            attributes: FxHashMap::default(),
        });
        model.by_name.insert(object, TypeId::OBJECT);
        model
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a new type with the given direct bases.
    ///
    /// An empty `bases` list means `object`.
    pub fn register(&mut self, name: &str, bases: &[TypeId]) -> Result<TypeId, TypeModelError> {
        if self.by_name.contains_key(name) {
            return Err(TypeModelError::DuplicateType(name.to_string()));
        }
        let bases: SmallVec<[TypeId; 2]> = if bases.is_empty() {
            SmallVec::from_slice(&[TypeId::OBJECT])
        } else {
            SmallVec::from_slice(bases)
        };
        for &base in &bases {
            if base.index() >= self.types.len() {
                return Err(TypeModelError::UnknownType(base));
            }
        }

        let id = TypeId::from_raw(self.types.len() as u32);
        let mro = compute_c3_mro(id, &bases, |b| self.types[b.index()].mro())
            .ok_or_else(|| TypeModelError::InconsistentMro(name.to_string()))?;
        let depth = 1 + bases
            .iter()
            .map(|b| self.types[b.index()].depth)
            .max()
            .unwrap_or(0);

        let name: Arc<str> = Arc::from(name);
        self.types.push(TypeDescriptor {
            id,
            name: name.clone(),
            bases,
            mro,
            depth,
            methods: FxHashMap::default(),
            attributes: FxHashMap::default(),
        });
        self.by_name.insert(name, id);
        self.max_depth = self.max_depth.max(depth);
        Ok(id)
    }

    /// Declare an overload of `name` on `owner`.
    pub fn add_method(
        &mut self,
        owner: TypeId,
        name: &str,
        mut signature: Signature,
    ) -> Result<(), TypeModelError> {
        let desc = self
            .types
            .get_mut(owner.index())
            .ok_or(TypeModelError::UnknownType(owner))?;
        signature.owner = owner;
        desc.methods
            .entry(Arc::from(name))
            .or_default()
            .push(Arc::new(signature));
        Ok(())
    }

    /// Declare the type of an attribute on `owner`.
    pub fn add_attribute(
        &mut self,
        owner: TypeId,
        name: &str,
        ty: TypeId,
    ) -> Result<(), TypeModelError> {
        let desc = self
            .types
            .get_mut(owner.index())
            .ok_or(TypeModelError::UnknownType(owner))?;
        desc.attributes.insert(Arc::from(name), ty);
        Ok(())
    }

    /// Bind a builtin global name to a class.
    pub fn add_global_class(&mut self, name: &str, ty: TypeId) -> Result<(), TypeModelError> {
        if ty.index() >= self.types.len() {
            return Err(TypeModelError::UnknownType(ty));
        }
        self.global_classes.insert(Arc::from(name), ty);
        Ok(())
    }

    // =========================================================================
    // Descriptor Queries
    // =========================================================================

    /// Number of registered types.
    #[inline]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether the model is empty (never true for a model built with `new`).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Descriptor for `ty`.
    #[inline]
    pub fn get(&self, ty: TypeId) -> Option<&TypeDescriptor> {
        self.types.get(ty.index())
    }

    /// Look a type up by name.
    #[inline]
    pub fn type_by_name(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    /// Name of a type, or `"?"` for an unknown id.
    pub fn name(&self, ty: TypeId) -> &str {
        self.get(ty).map_or("?", |d| &d.name)
    }

    /// Method resolution order of `ty` (just `object` for unknown ids).
    pub fn mro(&self, ty: TypeId) -> &[TypeId] {
        match self.get(ty) {
            Some(desc) => desc.mro(),
            None => self.types[0].mro(),
        }
    }

    /// Inheritance depth of `ty`.
    #[inline]
    pub fn depth(&self, ty: TypeId) -> u32 {
        self.get(ty).map_or(0, |d| d.depth)
    }

    /// Deepest inheritance chain in the model: the height of the type lattice.
    #[inline]
    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Whether `sub` is `sup` or inherits from it.
    pub fn is_subtype(&self, sub: TypeId, sup: TypeId) -> bool {
        sub == sup || sup == TypeId::OBJECT || self.mro(sub).contains(&sup)
    }

    /// Whether `ty` is an exception class.
    #[inline]
    pub fn is_exception(&self, ty: TypeId) -> bool {
        self.is_subtype(ty, TypeId::BASE_EXCEPTION)
    }

    // =========================================================================
    // Member Queries
    // =========================================================================

    /// All overloads of `name` visible on `ty`, most derived owner first.
    ///
    /// Inherited signatures are appended along the MRO.
    pub fn lookup_method(&self, ty: TypeId, name: &str) -> SmallVec<[Arc<Signature>; 4]> {
        let mut found = SmallVec::new();
        for &owner in self.mro(ty) {
            if let Some(sigs) = self.types[owner.index()].methods.get(name) {
                found.extend(sigs.iter().cloned());
            }
        }
        found
    }

    /// Whether any type along the MRO of `ty` declares `name`.
    pub fn has_method(&self, ty: TypeId, name: &str) -> bool {
        self.mro(ty)
            .iter()
            .any(|&owner| self.types[owner.index()].methods.contains_key(name))
    }

    /// Declared type of attribute `name` on `ty`, searched along the MRO.
    pub fn lookup_attribute(&self, ty: TypeId, name: &str) -> Option<TypeId> {
        self.mro(ty)
            .iter()
            .find_map(|&owner| self.types[owner.index()].attributes.get(name).copied())
    }

    /// What a builtin global name refers to.
    pub fn lookup_global(&self, name: &str) -> Option<GlobalBinding> {
        if let Some(&ty) = self.global_classes.get(name) {
            return Some(GlobalBinding::Class(ty));
        }
        if self.has_method(TypeId::BUILTINS, name) {
            return Some(GlobalBinding::Function);
        }
        None
    }

    // =========================================================================
    // Overload Resolution
    // =========================================================================

    /// Pick the overload matching `args`, if exactly one applies.
    ///
    /// The trailing `kw_names.len()` entries of `args` are keyword arguments.
    /// Candidates are grouped by declaring type in MRO order; the first group
    /// with any match decides. One match in that group resolves the call, more
    /// than one is ambiguous and yields `None`.
    pub fn resolve_overload(
        &self,
        signatures: &[Arc<Signature>],
        args: &[TypeId],
        kw_names: &[Arc<str>],
    ) -> Option<Arc<Signature>> {
        if kw_names.len() > args.len() {
            return None;
        }
        let mut winner: Option<&Arc<Signature>> = None;
        let mut ambiguous = false;

        for sig in signatures {
            if let Some(current) = winner {
                if current.owner != sig.owner {
                    break;
                }
            }
            if self.signature_accepts(sig, args, kw_names) {
                if winner.is_some() {
                    ambiguous = true;
                } else {
                    winner = Some(sig);
                }
            }
        }

        if ambiguous { None } else { winner.cloned() }
    }

    fn signature_accepts(&self, sig: &Signature, args: &[TypeId], kw_names: &[Arc<str>]) -> bool {
        if sig.arity() != args.len() {
            return false;
        }
        let positional = args.len() - kw_names.len();
        for (arg, param) in args[..positional].iter().zip(&sig.params[..positional]) {
            if !self.is_subtype(*arg, *param) {
                return false;
            }
        }
        let mut filled: SmallVec<[bool; 8]> = SmallVec::from_elem(false, sig.arity());
        for slot in filled.iter_mut().take(positional) {
            *slot = true;
        }
        for (name, arg) in kw_names.iter().zip(&args[positional..]) {
            let Some(index) = sig.param_index(name) else {
                return false;
            };
            if filled[index] || !self.is_subtype(*arg, sig.params[index]) {
                return false;
            }
            filled[index] = true;
        }
        filled.iter().all(|f| *f)
    }

    // =========================================================================
    // Lattice Join
    // =========================================================================

    /// Nearest common supertype of `a` and `b`.
    ///
    /// Symmetric: the deepest type present in both MROs, ties broken by the
    /// lowest id. Falls back to `object`.
    pub fn common_supertype(&self, a: TypeId, b: TypeId) -> TypeId {
        if a == b {
            return a;
        }
        if self.is_subtype(a, b) {
            return b;
        }
        if self.is_subtype(b, a) {
            return a;
        }
        let b_mro = self.mro(b);
        self.mro(a)
            .iter()
            .copied()
            .filter(|t| b_mro.contains(t))
            .max_by(|x, y| {
                self.depth(*x)
                    .cmp(&self.depth(*y))
                    .then_with(|| y.raw().cmp(&x.raw()))
            })
            .unwrap_or(TypeId::OBJECT)
    }
}

// =============================================================================
// Tests
// =============================================================================
