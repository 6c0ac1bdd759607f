//! Property tests for version parsing and precedence.

#![allow(clippy::expect_used)]

use std::cmp::Ordering;

use proptest::prelude::*;

use addonhost::Version;

fn identifier() -> impl Strategy<Value = String> {
    prop_oneof![
        (0u64..1000).prop_map(|n| n.to_string()),
        "[a-zA-Z][0-9a-zA-Z-]{0,6}",
    ]
}

fn version_text() -> impl Strategy<Value = String> {
    (
        0u64..20,
        0u64..20,
        0u64..20,
        prop::collection::vec(identifier(), 0..3),
        prop::option::of("[0-9a-z]{1,6}"),
    )
        .prop_map(|(major, minor, patch, pre, build)| {
            let mut text = format!("{}.{}.{}", major, minor, patch);
            if !pre.is_empty() {
                text.push('-');
                text.push_str(&pre.join("."));
            }
            if let Some(build) = build {
                text.push('+');
                text.push_str(&build);
            }
            text
        })
}

fn version() -> impl Strategy<Value = Version> {
    version_text().prop_map(|text| Version::parse(&text).expect("generated version parses"))
}

proptest! {
    #[test]
    fn display_reparses_to_equal_version(v in version()) {
        let reparsed = Version::parse(&v.to_string()).expect("display output parses");
        prop_assert_eq!(&reparsed, &v);
        prop_assert_eq!(reparsed.cmp(&v), Ordering::Equal);
    }

    #[test]
    fn ordering_is_antisymmetric(a in version(), b in version()) {
        prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
        prop_assert_eq!(a.cmp_precedence(&b), b.cmp_precedence(&a).reverse());
        prop_assert_eq!(a.cmp(&b) == Ordering::Equal, a == b);
    }

    #[test]
    fn ordering_is_transitive(a in version(), b in version(), c in version()) {
        let mut sorted = vec![a, b, c];
        sorted.sort();
        prop_assert!(sorted[0] <= sorted[1]);
        prop_assert!(sorted[1] <= sorted[2]);
        prop_assert!(sorted[0] <= sorted[2]);
    }

    #[test]
    fn total_order_refines_precedence(a in version(), b in version()) {
        let precedence = a.cmp_precedence(&b);
        if precedence != Ordering::Equal {
            prop_assert_eq!(a.cmp(&b), precedence);
        }
    }

    #[test]
    fn build_metadata_never_changes_precedence(v in version(), build in "[0-9a-z]{1,6}") {
        let mut tagged = v.clone();
        tagged.build = Some(build);
        prop_assert_eq!(tagged.cmp_precedence(&v), Ordering::Equal);
        prop_assert!(tagged.satisfies_min(&v));
        prop_assert!(v.satisfies_min(&tagged));
    }

    #[test]
    fn prerelease_ranks_below_its_release(v in version(), tag in identifier()) {
        let release = Version::new(v.major, v.minor, v.patch);
        let pre = Version::parse(&format!("{}-{}", release, tag)).expect("pre-release parses");
        prop_assert!(pre.is_prerelease());
        prop_assert_eq!(pre.cmp_precedence(&release), Ordering::Less);
        prop_assert!(!pre.satisfies_min(&release));
        prop_assert!(release.satisfies_min(&pre));
    }

    #[test]
    fn satisfies_min_matches_precedence(a in version(), b in version()) {
        prop_assert_eq!(a.satisfies_min(&b), a.cmp_precedence(&b) != Ordering::Less);
    }
}
