use std::cmp::Ordering;

use thiserror::Error;

/// Errors resolving rank fields against a column set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RankError {
    #[error("rank field {0:?} is not a column")]
    UnknownField(String),
}

/// Two-tier comparator for report rows.
///
/// Ranked columns are compared first in declaration order, descending.
/// Ties fall through to the remaining columns in declaration order,
/// descending. Callers break final ties on the key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RankOrder {
    ranked: Vec<usize>,
    rest: Vec<usize>,
}

impl RankOrder {
    /// Build from column indices. Out-of-range indices are ignored.
    pub fn new(columns: usize, ranked: &[usize]) -> Self {
        let mut seen = vec![false; columns];
        let ranked: Vec<usize> = ranked
            .iter()
            .copied()
            .filter(|&i| i < columns && !std::mem::replace(&mut seen[i], true))
            .collect();
        let rest = (0..columns).filter(|i| !seen[*i]).collect();
        Self { ranked, rest }
    }

    /// Resolve rank field names against column names.
    pub fn from_names<A, B>(columns: &[A], rank_fields: &[B]) -> Result<Self, RankError>
    where
        A: AsRef<str>,
        B: AsRef<str>,
    {
        let ranked = rank_fields
            .iter()
            .map(|name| {
                columns
                    .iter()
                    .position(|c| c.as_ref() == name.as_ref())
                    .ok_or_else(|| RankError::UnknownField(name.as_ref().to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(columns.len(), &ranked))
    }

    pub fn ranked(&self) -> &[usize] {
        &self.ranked
    }

    pub fn is_ranked(&self, column: usize) -> bool {
        self.ranked.contains(&column)
    }

    /// Compare two rows given by column accessors.
    pub fn compare_with<A, B>(&self, a: A, b: B) -> Ordering
    where
        A: Fn(usize) -> u64,
        B: Fn(usize) -> u64,
    {
        self.ranked
            .iter()
            .chain(self.rest.iter())
            .map(|&i| b(i).cmp(&a(i)))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    pub fn compare(&self, a: &[u64], b: &[u64]) -> Ordering {
        self.compare_with(
            |i| a.get(i).copied().unwrap_or(0),
            |i| b.get(i).copied().unwrap_or(0),
        )
    }

    /// Full row order: columns, then ascending key.
    pub fn compare_keyed<K: Ord>(&self, ka: &K, a: &[u64], kb: &K, b: &[u64]) -> Ordering {
        self.compare(a, b).then_with(|| ka.cmp(kb))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranked_fields_compare_first() {
        let order = RankOrder::new(2, &[1]);
        let a = [100, 1];
        let b = [1, 2];
        assert_eq!(order.compare(&a, &b), Ordering::Greater);
        assert_eq!(order.compare(&b, &a), Ordering::Less);
    }

    #[test]
    fn test_ties_fall_through_to_rest_then_key() {
        let order = RankOrder::new(3, &[2]);
        let a = [5, 0, 9];
        let b = [7, 0, 9];
        assert_eq!(order.compare(&a, &b), Ordering::Greater);

        let c = [5, 0, 9];
        assert_eq!(order.compare_keyed(&"b", &a, &"a", &c), Ordering::Greater);
        assert_eq!(order.compare_keyed(&1u32, &a, &2u32, &c), Ordering::Less);
    }

    #[test]
    fn test_rank_is_deterministic_across_runs() {
        let order = RankOrder::new(1, &[0]);
        let mut rows = vec![(9u64, [3u64]), (2, [3]), (5, [7]), (1, [3])];
        let mut first = rows.clone();
        first.sort_by(|x, y| order.compare_keyed(&x.0, &x.1, &y.0, &y.1));
        rows.reverse();
        rows.sort_by(|x, y| order.compare_keyed(&x.0, &x.1, &y.0, &y.1));
        assert_eq!(first, rows);
        let keys: Vec<u64> = first.iter().map(|r| r.0).collect();
        assert_eq!(keys, vec![5, 1, 2, 9]);
    }

    #[test]
    fn test_from_names() {
        let columns = ["calls", "bytes", "errors"];
        let order = RankOrder::from_names(&columns, &["errors", "calls"]).expect("resolve");
        assert_eq!(order.ranked(), &[2, 0]);
        assert!(order.is_ranked(0));
        assert!(!order.is_ranked(1));

        let err = RankOrder::from_names(&columns, &["latency"]).unwrap_err();
        assert_eq!(err, RankError::UnknownField("latency".to_string()));
    }

    #[test]
    fn test_duplicate_rank_indices_collapse() {
        let order = RankOrder::new(2, &[1, 1, 7]);
        assert_eq!(order.ranked(), &[1]);
    }
}
