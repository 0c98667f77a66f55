//! C3 linearisation.
//!
//! The method resolution order is the "parent precedence chain" along which
//! inherited signatures are appended. It is computed once per type when the
//! type is registered and cached on its descriptor.

use crate::TypeId;
use smallvec::SmallVec;

/// A cached method resolution order, most derived first.
pub type Mro = SmallVec<[TypeId; 8]>;

/// Compute the C3 linearisation of `class` with direct `bases`.
///
/// `mro_of` returns the already-computed MRO of a base. Returns `None` when no
/// consistent order exists (e.g. `class C(A, B)` where `B` precedes `A`
/// elsewhere).
pub fn compute_c3_mro<'a, F>(class: TypeId, bases: &[TypeId], mro_of: F) -> Option<Mro>
where
    F: Fn(TypeId) -> &'a [TypeId],
{
    let mut result = Mro::new();
    result.push(class);

    let mut seqs: Vec<Vec<TypeId>> = bases.iter().map(|&b| mro_of(b).to_vec()).collect();
    seqs.push(bases.to_vec());

    loop {
        seqs.retain(|s| !s.is_empty());
        if seqs.is_empty() {
            return Some(result);
        }

        let candidate = seqs
            .iter()
            .map(|s| s[0])
            .find(|head| !seqs.iter().any(|s| s[1..].contains(head)))?;

        result.push(candidate);
        for seq in &mut seqs {
            if seq[0] == candidate {
                seq.remove(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    fn t(n: u32) -> TypeId {
        TypeId::from_raw(100 + n)
    }

    #[test]
    fn test_single_inheritance() {
        let object: Mro = [TypeId::OBJECT].into_iter().collect();
        let a = compute_c3_mro(t(1), &[TypeId::OBJECT], |_| object.as_slice()).unwrap();
        assert_eq!(a.as_slice(), &[t(1), TypeId::OBJECT]);
    }

    #[test]
    fn test_diamond() {
        // class A; class B(A); class C(A); class D(B, C)
        let mut mros: FxHashMap<TypeId, Mro> = FxHashMap::default();
        mros.insert(TypeId::OBJECT, [TypeId::OBJECT].into_iter().collect());
        let a = compute_c3_mro(t(1), &[TypeId::OBJECT], |b| mros[&b].as_slice()).unwrap();
        mros.insert(t(1), a);
        let b = compute_c3_mro(t(2), &[t(1)], |b| mros[&b].as_slice()).unwrap();
        mros.insert(t(2), b);
        let c = compute_c3_mro(t(3), &[t(1)], |b| mros[&b].as_slice()).unwrap();
        mros.insert(t(3), c);
        let d = compute_c3_mro(t(4), &[t(2), t(3)], |b| mros[&b].as_slice()).unwrap();
        assert_eq!(d.as_slice(), &[t(4), t(2), t(3), t(1), TypeId::OBJECT]);
    }

    #[test]
    fn test_inconsistent_order() {
        // class A; class B(A); class C(A, B) is rejected by C3.
        let mut mros: FxHashMap<TypeId, Mro> = FxHashMap::default();
        mros.insert(TypeId::OBJECT, [TypeId::OBJECT].into_iter().collect());
        let a = compute_c3_mro(t(1), &[TypeId::OBJECT], |b| mros[&b].as_slice()).unwrap();
        mros.insert(t(1), a);
        let b = compute_c3_mro(t(2), &[t(1)], |b| mros[&b].as_slice()).unwrap();
        mros.insert(t(2), b);
        assert!(compute_c3_mro(t(3), &[t(1), t(2)], |b| mros[&b].as_slice()).is_none());
    }
}
