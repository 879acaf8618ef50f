//! Directional manifest comparison.

use super::Manifest;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffResult {
    /// Paths the mirror must fetch: missing there, or with a different hash.
    pub changed: Vec<String>,
    /// Paths the mirror holds that the source no longer has.
    pub deleted: Vec<String>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// Compare `source` (the side being copied from) with `mirror` (the side
/// applying changes).
///
/// A path is changed iff it is in `source` and either absent from `mirror` or
/// hashed differently there; deleted iff it is in `mirror` but not `source`.
/// Both lists come out sorted.
pub fn diff(source: &Manifest, mirror: &Manifest) -> DiffResult {
    let changed = source
        .records()
        .filter(|record| {
            mirror
                .get(&record.path)
                .map_or(true, |theirs| theirs.checksum != record.checksum)
        })
        .map(|record| record.path.clone())
        .collect();

    let deleted = mirror
        .paths()
        .filter(|path| source.get(path).is_none())
        .map(str::to_string)
        .collect();

    DiffResult { changed, deleted }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FileRecord;
    use chrono::Utc;
    use std::path::PathBuf;

    fn manifest(entries: &[(&str, &str)]) -> Manifest {
        let records = entries.iter().map(|(path, checksum)| FileRecord {
            path: path.to_string(),
            size: 10,
            checksum: checksum.to_string(),
            mtime: 0,
        });
        Manifest::from_records(PathBuf::from("/root"), Utc::now(), records).unwrap()
    }

    #[test]
    fn test_diff_changed_and_deleted() {
        let source = manifest(&[("a.png", "1"), ("b.png", "2"), ("new.png", "3")]);
        let mirror = manifest(&[("a.png", "1"), ("b.png", "stale"), ("gone.png", "4")]);

        let result = diff(&source, &mirror);
        assert_eq!(result.changed, vec!["b.png", "new.png"]);
        assert_eq!(result.deleted, vec!["gone.png"]);
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let a = manifest(&[("a.png", "1"), ("dir/b.png", "2")]);
        assert!(diff(&a, &a.clone()).is_empty());
    }

    #[test]
    fn test_diff_against_empty_mirror() {
        let source = manifest(&[("a.png", "1"), ("b.png", "2")]);
        let empty = manifest(&[]);

        let result = diff(&source, &empty);
        assert_eq!(result.changed.len(), 2);
        assert!(result.deleted.is_empty());

        let reverse = diff(&empty, &source);
        assert!(reverse.changed.is_empty());
        assert_eq!(reverse.deleted.len(), 2);
    }

    #[test]
    fn test_diff_membership_rules_hold_for_mixed_sets() {
        let names = ["a", "b", "c", "d", "e", "f"];
        for mask_a in 0u32..64 {
            for mask_b in [0u32, 0b101010, 0b110011, 63] {
                let pick = |mask: u32, tag: &'static str| {
                    names
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| mask & (1 << i) != 0)
                        .map(|(i, n)| (*n, if i % 2 == 0 { "same" } else { tag }))
                        .collect::<Vec<_>>()
                };
                let a = manifest(&pick(mask_a, "x"));
                let b = manifest(&pick(mask_b, "y"));
                let result = diff(&a, &b);

                for name in names {
                    let in_a = a.get(name);
                    let in_b = b.get(name);
                    let expect_changed = match (in_a, in_b) {
                        (Some(_), None) => true,
                        (Some(x), Some(y)) => x.checksum != y.checksum,
                        _ => false,
                    };
                    let expect_deleted = in_a.is_none() && in_b.is_some();

                    assert_eq!(result.changed.iter().any(|p| p == name), expect_changed);
                    assert_eq!(result.deleted.iter().any(|p| p == name), expect_deleted);
                }
            }
        }
    }
}
