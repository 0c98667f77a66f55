//! Process-wide cache of translated functions.
//!
//! Keyed by [`FunctionId`], a stable hash of the code object. The cache is
//! append-only: the first artifact inserted for an id is the one every caller
//! sees, so two threads racing to translate the same function both get the
//! same result and the loser's work is simply dropped.

use crate::signature::CallSignature;
use dashmap::DashMap;
use quill_bytecode::{CodeObject, Constant};
use rustc_hash::FxHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, trace};

/// Stable identity of a code object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(u64);

impl FunctionId {
    /// Hash the parts of `code` that determine its translation.
    ///
    /// Every table an instruction can index into takes part, so two bodies
    /// with the same words but different constants or names differ.
    pub fn of(code: &CodeObject) -> Self {
        let mut hasher = FxHasher::default();
        hash_code(code, &mut hasher);
        FunctionId(hasher.finish())
    }

    /// Identity of `self` translated against `signature`.
    ///
    /// The dynamic signature keeps the plain identity.
    pub fn for_signature(self, signature: &CallSignature) -> Self {
        if *signature == CallSignature::dynamic() {
            return self;
        }
        let mut hasher = FxHasher::default();
        self.0.hash(&mut hasher);
        signature.hash(&mut hasher);
        FunctionId(hasher.finish())
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        FunctionId(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

fn hash_code(code: &CodeObject, state: &mut FxHasher) {
    code.name.hash(state);
    code.qualname.hash(state);
    code.filename.hash(state);
    code.first_lineno.hash(state);
    code.version.hash(state);
    code.code.hash(state);
    code.constants.len().hash(state);
    for constant in code.constants.iter() {
        hash_constant(constant, state);
    }
    code.names.hash(state);
    code.varnames.hash(state);
    code.cellvars.hash(state);
    code.freevars.hash(state);
    code.arg_count.hash(state);
    code.posonlyarg_count.hash(state);
    code.kwonlyarg_count.hash(state);
    code.flags.hash(state);
    code.line_table.hash(state);
}

fn hash_constant(constant: &Constant, state: &mut FxHasher) {
    std::mem::discriminant(constant).hash(state);
    match constant {
        Constant::None | Constant::Ellipsis => {}
        Constant::Bool(b) => b.hash(state),
        Constant::Int(i) => i.hash(state),
        Constant::Float(f) => f.to_bits().hash(state),
        Constant::Str(s) => s.hash(state),
        Constant::Bytes(b) => b.hash(state),
        Constant::Tuple(items) => {
            items.len().hash(state);
            for item in items.iter() {
                hash_constant(item, state);
            }
        }
        Constant::Code(nested) => hash_code(nested, state),
    }
}

impl fmt::Debug for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{:016x}", self.0)
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// An artifact that remembers the code object it was built from.
///
/// The cache uses it to tell a real hit from two code objects whose
/// identities collide.
pub trait Translated {
    fn source(&self) -> &Arc<CodeObject>;

    /// Whether this artifact was built from `code`.
    fn built_from(&self, code: &Arc<CodeObject>) -> bool {
        let source = self.source();
        Arc::ptr_eq(source, code) || **source == **code
    }
}

/// Concurrent map from function identity to translated artifact.
pub struct TranslationCache<T> {
    entries: DashMap<FunctionId, Arc<T>>,
}

impl<T> TranslationCache<T> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// The cached artifact for `id`.
    pub fn get(&self, id: FunctionId) -> Option<Arc<T>> {
        self.entries.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Insert unless present; returns whichever artifact is now cached.
    pub fn insert(&self, id: FunctionId, artifact: T) -> Arc<T> {
        let entry = self.entries.entry(id).or_insert_with(|| Arc::new(artifact));
        Arc::clone(entry.value())
    }

    /// Whether `id` has been translated.
    pub fn contains(&self, id: FunctionId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of cached artifacts.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Translated> TranslationCache<T> {
    /// The cached artifact for `code`, translating it with `build` on a miss.
    ///
    /// A cached artifact built from a different code object under the same
    /// id is never returned: `code` is translated again and the result is
    /// handed back without replacing the cached entry. `build` runs without
    /// any shard lock held, so it may itself consult the cache (nested
    /// functions are translated while translating their parent).
    pub fn get_or_try_insert_with<E>(
        &self,
        id: FunctionId,
        code: &Arc<CodeObject>,
        build: impl FnOnce() -> Result<T, E>,
    ) -> Result<Arc<T>, E> {
        if let Some(hit) = self.get(id) {
            if hit.built_from(code) {
                trace!(function = %id, "translation cache hit");
                return Ok(hit);
            }
            debug!(function = %id, name = %code.qualname, "translation cache collision");
            return build().map(Arc::new);
        }
        let built = Arc::new(build()?);
        let cached = Arc::clone(self.entries.entry(id).or_insert_with(|| Arc::clone(&built)).value());
        if cached.built_from(code) {
            Ok(cached)
        } else {
            Ok(built)
        }
    }
}

impl<T> Default for TranslationCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for TranslationCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslationCache").field("len", &self.len()).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn code(name: &str, words: &[u8]) -> CodeObject {
        let mut code = CodeObject::new(name, "m.py");
        code.code = words.into();
        code
    }

    #[test]
    fn test_function_id_is_stable() {
        let a = FunctionId::of(&code("f", &[100, 0, 83, 0]));
        assert_eq!(a, FunctionId::of(&code("f", &[100, 0, 83, 0])));
        assert_ne!(a, FunctionId::of(&code("g", &[100, 0, 83, 0])));
        assert_ne!(a, FunctionId::of(&code("f", &[100, 1, 83, 0])));
    }

    #[test]
    fn test_signature_specializes_identity() {
        let id = FunctionId::of(&code("f", &[100, 0, 83, 0]));
        assert_eq!(id.for_signature(&CallSignature::dynamic()), id);
        let int = id.for_signature(&CallSignature::new(&[quill_types::TypeId::INT], quill_types::TypeId::INT));
        assert_ne!(int, id);
        assert_eq!(
            int,
            id.for_signature(&CallSignature::new(&[quill_types::TypeId::INT], quill_types::TypeId::INT))
        );
    }

    #[test]
    fn test_first_insert_wins() {
        let cache = TranslationCache::new();
        let id = FunctionId::from_raw(7);
        let first = cache.insert(id, "first");
        let second = cache.insert(id, "second");
        assert_eq!(*first, "first");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    struct Built {
        code: Arc<CodeObject>,
        tag: u32,
    }

    impl Translated for Built {
        fn source(&self) -> &Arc<CodeObject> {
            &self.code
        }
    }

    fn build(code: &Arc<CodeObject>, tag: u32) -> Result<Built, ()> {
        Ok(Built {
            code: Arc::clone(code),
            tag,
        })
    }

    #[test]
    fn test_get_or_insert_skips_build_on_hit() {
        let cache: TranslationCache<Built> = TranslationCache::new();
        let f = Arc::new(code("f", &[100, 0, 83, 0]));
        let id = FunctionId::of(&f);
        let built = cache.get_or_try_insert_with(id, &f, || build(&f, 5)).unwrap();
        let again = cache
            .get_or_try_insert_with(id, &f, || -> Result<Built, ()> { panic!("rebuilt") })
            .unwrap();
        assert!(Arc::ptr_eq(&built, &again));

        // An equal code object in a different allocation is still a hit.
        let copy = Arc::new(code("f", &[100, 0, 83, 0]));
        let hit = cache.get_or_try_insert_with(id, &copy, || build(&copy, 6)).unwrap();
        assert_eq!(hit.tag, 5);

        let err = cache.get_or_try_insert_with(FunctionId::from_raw(2), &f, || Err::<Built, _>("bad"));
        assert!(matches!(err, Err("bad")));
        assert!(!cache.contains(FunctionId::from_raw(2)));
    }

    #[test]
    fn test_colliding_ids_never_share_an_artifact() {
        let cache: TranslationCache<Built> = TranslationCache::new();
        let f = Arc::new(code("f", &[100, 0, 83, 0]));
        let g = Arc::new(code("g", &[100, 0, 83, 0]));
        let id = FunctionId::from_raw(9);
        let first = cache.get_or_try_insert_with(id, &f, || build(&f, 1)).unwrap();
        let second = cache.get_or_try_insert_with(id, &g, || build(&g, 2)).unwrap();
        assert_eq!(first.tag, 1);
        assert_eq!(second.tag, 2);
        assert!(Arc::ptr_eq(&second.code, &g));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_function_id_covers_constants_and_names() {
        let with_const = |c: Constant| {
            let mut code = code("main", &[100, 0, 83, 0]);
            code.constants = vec![c].into();
            code
        };
        let one = FunctionId::of(&with_const(Constant::Int(1)));
        assert_ne!(one, FunctionId::of(&with_const(Constant::str("x"))));
        assert_ne!(one, FunctionId::of(&with_const(Constant::Int(2))));
        assert_ne!(
            FunctionId::of(&with_const(Constant::Float(0.0))),
            FunctionId::of(&with_const(Constant::Float(-0.0)))
        );
        assert_eq!(one, FunctionId::of(&with_const(Constant::Int(1))));

        let mut named = with_const(Constant::Int(1));
        named.names = vec![Arc::from("a")].into();
        assert_ne!(one, FunctionId::of(&named));
    }

    #[test]
    fn test_concurrent_inserts_agree() {
        let cache = Arc::new(TranslationCache::new());
        let id = FunctionId::from_raw(42);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.insert(id, i))
            })
            .collect();
        let results: Vec<Arc<i32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
        assert_eq!(cache.len(), 1);
    }
}
