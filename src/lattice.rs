//! Module A — the type-promotion lattice. `promote` is pure, total, and
//! owns no I/O; it exists so schema inference can fold repeated field
//! observations into a single relational type (spec §4.A).

use crate::types::{DocType, RelationalType};

fn canonical(d: DocType) -> RelationalType {
    match d {
        DocType::Boolean => RelationalType::Boolean,
        DocType::Int32 => RelationalType::Integer,
        DocType::Int64 => RelationalType::Bigint,
        DocType::Decimal128 => RelationalType::Decimal,
        DocType::Double => RelationalType::Double,
        DocType::DateTime => RelationalType::Timestamp,
        DocType::Binary => RelationalType::Varbinary,
        DocType::String | DocType::ObjectId | DocType::MinKey | DocType::MaxKey => RelationalType::Varchar,
        DocType::Array => RelationalType::Array,
        DocType::Document => RelationalType::JavaObject,
        DocType::Null => RelationalType::Null,
    }
}

fn widen_numeric(a: RelationalType, b: RelationalType) -> RelationalType {
    use RelationalType::*;
    match (a, b) {
        (Decimal, _) | (_, Decimal) => Decimal,
        (Double, Double) => Double,
        (Double, Bigint) | (Bigint, Double) => Decimal,
        (Double, Integer) | (Integer, Double) => Double,
        (Bigint, Bigint) => Bigint,
        (Bigint, Integer) | (Integer, Bigint) => Bigint,
        (Integer, Integer) => Integer,
        _ => unreachable!("widen_numeric called with non-numeric operand: {a:?}, {b:?}"),
    }
}

fn is_numeric(t: RelationalType) -> bool {
    matches!(
        t,
        RelationalType::Integer | RelationalType::Bigint | RelationalType::Double | RelationalType::Decimal
    )
}

/// Join `prev` (a column's relational type so far) with `observed` (the
/// document type of the latest sampled value) into the next relational
/// type. Total over the full cross-product; unrecognized combinations fall
/// back to `VARCHAR`.
pub fn promote(prev: RelationalType, observed: DocType) -> RelationalType {
    use RelationalType::*;

    if prev == Null {
        return canonical(observed);
    }
    if observed == DocType::Null {
        // Null observations never erase a previously inferred type.
        return prev;
    }
    if prev == Varbinary {
        // VARBINARY is absorbing regardless of what is observed next.
        return Varbinary;
    }

    let prev_is_complex = matches!(prev, Array | JavaObject);
    let observed_is_complex = observed.is_complex();

    if prev_is_complex {
        return match (prev, observed) {
            (Array, DocType::Array) => Array,
            (JavaObject, DocType::Document) => JavaObject,
            _ => Varchar,
        };
    }

    // `prev` is a scalar relational type from here on.
    if observed == DocType::Binary {
        return Varbinary;
    }
    if observed_is_complex {
        return Varchar;
    }
    if prev == Varchar {
        return Varchar;
    }

    let observed_ty = canonical(observed);
    if is_numeric(prev) && is_numeric(observed_ty) {
        return widen_numeric(prev, observed_ty);
    }
    if prev == observed_ty {
        return prev;
    }
    // Two incompatible scalars (e.g. BOOLEAN vs INTEGER, TIMESTAMP vs
    // VARCHAR) fall back to the universal VARCHAR representation.
    Varchar
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DocType, RelationalType};

    const ALL_RELATIONAL: [RelationalType; 11] = [
        RelationalType::Null,
        RelationalType::Boolean,
        RelationalType::Integer,
        RelationalType::Bigint,
        RelationalType::Double,
        RelationalType::Decimal,
        RelationalType::Timestamp,
        RelationalType::Varbinary,
        RelationalType::Varchar,
        RelationalType::Array,
        RelationalType::JavaObject,
    ];

    const ALL_DOC: [DocType; 14] = [
        DocType::Boolean,
        DocType::Binary,
        DocType::DateTime,
        DocType::Decimal128,
        DocType::Double,
        DocType::Int32,
        DocType::Int64,
        DocType::MaxKey,
        DocType::MinKey,
        DocType::Null,
        DocType::ObjectId,
        DocType::String,
        DocType::Array,
        DocType::Document,
    ];

    #[test]
    fn totality_over_full_cross_product() {
        // Property 1: promote is defined for every (r, d) pair — this test
        // simply must not panic.
        for &r in &ALL_RELATIONAL {
            for &d in &ALL_DOC {
                let _ = promote(r, d);
            }
        }
    }

    #[test]
    fn varchar_absorbs_every_scalar_observation() {
        for &d in &[
            DocType::Boolean,
            DocType::DateTime,
            DocType::Decimal128,
            DocType::Double,
            DocType::Int32,
            DocType::Int64,
            DocType::MaxKey,
            DocType::MinKey,
            DocType::ObjectId,
            DocType::String,
        ] {
            assert_eq!(promote(RelationalType::Varchar, d), RelationalType::Varchar);
        }
    }

    #[test]
    fn varbinary_is_absorbing() {
        for &d in &ALL_DOC {
            assert_eq!(promote(RelationalType::Varbinary, d), RelationalType::Varbinary);
        }
    }

    #[test]
    fn numeric_widening_matches_examples() {
        assert_eq!(promote(RelationalType::Integer, DocType::Int64), RelationalType::Bigint);
        assert_eq!(promote(RelationalType::Integer, DocType::Double), RelationalType::Double);
        assert_eq!(
            promote(RelationalType::Integer, DocType::Decimal128),
            RelationalType::Decimal
        );
        assert_eq!(promote(RelationalType::Bigint, DocType::Double), RelationalType::Decimal);
        assert_eq!(promote(RelationalType::Double, DocType::Int64), RelationalType::Decimal);
        assert_eq!(
            promote(RelationalType::Decimal, DocType::Int32),
            RelationalType::Decimal
        );
    }

    #[test]
    fn s4_qty_scenario() {
        let mut qty = RelationalType::Null;
        qty = promote(qty, DocType::Int32);
        assert_eq!(qty, RelationalType::Integer);
        qty = promote(qty, DocType::Int64);
        assert_eq!(qty, RelationalType::Bigint);
        qty = promote(qty, DocType::Double);
        assert_eq!(qty, RelationalType::Decimal);
    }

    #[test]
    fn binary_dominates_non_binary_scalars() {
        assert_eq!(promote(RelationalType::Integer, DocType::Binary), RelationalType::Varbinary);
        assert_eq!(promote(RelationalType::Varchar, DocType::Binary), RelationalType::Varbinary);
        assert_eq!(promote(RelationalType::Boolean, DocType::Binary), RelationalType::Varbinary);
    }

    #[test]
    fn scalar_complex_conflict_falls_back_to_varchar() {
        assert_eq!(promote(RelationalType::Integer, DocType::Array), RelationalType::Varchar);
        assert_eq!(promote(RelationalType::Varchar, DocType::Document), RelationalType::Varchar);
    }

    #[test]
    fn complex_join_rules() {
        assert_eq!(promote(RelationalType::Array, DocType::Array), RelationalType::Array);
        assert_eq!(
            promote(RelationalType::JavaObject, DocType::Document),
            RelationalType::JavaObject
        );
        assert_eq!(promote(RelationalType::Array, DocType::Document), RelationalType::Varchar);
        assert_eq!(
            promote(RelationalType::JavaObject, DocType::Array),
            RelationalType::Varchar
        );
    }

    #[test]
    fn null_observation_preserves_prior_type() {
        assert_eq!(promote(RelationalType::Integer, DocType::Null), RelationalType::Integer);
        assert_eq!(promote(RelationalType::Array, DocType::Null), RelationalType::Array);
    }

    #[test]
    fn null_prior_maps_canonically() {
        assert_eq!(promote(RelationalType::Null, DocType::Boolean), RelationalType::Boolean);
        assert_eq!(promote(RelationalType::Null, DocType::Int32), RelationalType::Integer);
        assert_eq!(promote(RelationalType::Null, DocType::Int64), RelationalType::Bigint);
        assert_eq!(promote(RelationalType::Null, DocType::Decimal128), RelationalType::Decimal);
        assert_eq!(promote(RelationalType::Null, DocType::Double), RelationalType::Double);
        assert_eq!(promote(RelationalType::Null, DocType::DateTime), RelationalType::Timestamp);
        assert_eq!(promote(RelationalType::Null, DocType::Binary), RelationalType::Varbinary);
        assert_eq!(promote(RelationalType::Null, DocType::String), RelationalType::Varchar);
        assert_eq!(promote(RelationalType::Null, DocType::ObjectId), RelationalType::Varchar);
        assert_eq!(promote(RelationalType::Null, DocType::MinKey), RelationalType::Varchar);
        assert_eq!(promote(RelationalType::Null, DocType::MaxKey), RelationalType::Varchar);
        assert_eq!(promote(RelationalType::Null, DocType::Array), RelationalType::Array);
        assert_eq!(promote(RelationalType::Null, DocType::Document), RelationalType::JavaObject);
        assert_eq!(promote(RelationalType::Null, DocType::Null), RelationalType::Null);
    }
}
