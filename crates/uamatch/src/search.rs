//! Comparator-driven binary search over indexed collections

use std::cmp::Ordering;

/// Binary search `0..count` with a fallible comparator
///
/// `compare(i)` orders element `i` against the key being searched for.
/// Returns `Ok(i)` for a match or `Err(insertion_point)` wrapped in the
/// outer `Ok`, mirroring [`slice::binary_search_by`]. Comparator errors
/// abort the search.
pub fn binary_search<F, E>(count: usize, mut compare: F) -> Result<std::result::Result<usize, usize>, E>
where
    F: FnMut(usize) -> Result<Ordering, E>,
{
    let mut lower = 0;
    let mut upper = count;
    while lower < upper {
        let middle = lower + (upper - lower) / 2;
        match compare(middle)? {
            Ordering::Equal => return Ok(Ok(middle)),
            Ordering::Less => lower = middle + 1,
            Ordering::Greater => upper = middle,
        }
    }
    Ok(Err(lower))
}

/// Compare two ascending offset sequences
///
/// The first unequal pair decides; when one sequence is a prefix of the
/// other the shorter one is less.
pub fn compare_offsets(candidate: &[u32], target: &[u32]) -> Ordering {
    candidate.cmp(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[test]
    fn test_finds_present_and_insertion_point() {
        let data = [1, 3, 5, 7];
        let find = |key: i32| {
            binary_search::<_, Infallible>(data.len(), |i| Ok(data[i].cmp(&key))).unwrap()
        };
        assert_eq!(find(5), Ok(2));
        assert_eq!(find(0), Err(0));
        assert_eq!(find(4), Err(2));
        assert_eq!(find(8), Err(4));
    }

    #[test]
    fn test_comparator_error_aborts() {
        let result = binary_search(10, |_| Err::<Ordering, _>("boom"));
        assert_eq!(result, Err("boom"));
    }

    #[test]
    fn test_offset_prefix_is_less() {
        assert_eq!(compare_offsets(&[1, 2], &[1, 2, 3]), Ordering::Less);
        assert_eq!(compare_offsets(&[1, 4], &[1, 2, 3]), Ordering::Greater);
        assert_eq!(compare_offsets(&[1, 2, 3], &[1, 2, 3]), Ordering::Equal);
    }
}
