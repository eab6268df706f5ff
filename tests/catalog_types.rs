//! Affinity type file parsing and lookups.

use pinaffinity::catalog::{AffinityCatalog, DEFAULT_TYPE, FALLBACK_TYPE};
use test_case::test_case;

const TYPES: &str = "\
# name:mask
Normal:ffff
Pinball:fffe

Game:0x0a
Broken:zz
";

#[test_case("Pinball", 1; "exact name")]
#[test_case("game", 2; "case insensitive name")]
#[test_case("0", 0; "index")]
#[test_case("3", 3; "last index")]
fn resolves_arguments(argument: &str, expected: usize) {
    let catalog = AffinityCatalog::parse(TYPES);
    assert_eq!(catalog.resolve_argument(argument).unwrap(), expected);
}

#[test_case("4"; "index out of range")]
#[test_case("Turbo"; "unknown name")]
fn rejects_unknown_arguments(argument: &str) {
    let catalog = AffinityCatalog::parse(TYPES);
    assert!(catalog.resolve_argument(argument).is_err());
}

#[test_case(1, 0xfffe; "plain hex")]
#[test_case(2, 0x0a; "prefixed hex")]
#[test_case(3, u64::MAX; "unreadable mask means every cpu")]
fn masks(index: usize, mask: u64) {
    let catalog = AffinityCatalog::parse(TYPES);
    assert_eq!(catalog.mask_of(index), Some(mask));
}

#[test_case(""; "empty file")]
#[test_case("# only a comment\n"; "comments only")]
#[test_case("Solo:3\n"; "single type")]
fn always_has_default_and_fallback(text: &str) {
    let catalog = AffinityCatalog::parse(text);
    assert!(catalog.len() >= 2);
    assert!(catalog.lookup(DEFAULT_TYPE).is_some());
    assert!(catalog.lookup(FALLBACK_TYPE).is_some());
}

#[test]
fn missing_file_loads_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = AffinityCatalog::load(&dir.path().join("AffinityTypes.txt")).unwrap();
    assert_eq!(catalog.len(), 2);
    assert_eq!(catalog.name_of(DEFAULT_TYPE), "Normal");
    assert_eq!(catalog.resolve_saved_name("nope"), FALLBACK_TYPE);
}
