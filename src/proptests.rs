use std::collections::BTreeMap;

use proptest::prelude::*;
use proptest_derive::Arbitrary;

use crate::{MatchResult, PathTrie, TrieError};

/// Static-only template paths over a deliberately tiny alphabet, so inserts
/// collide, deletes hit live entries, and prefixes overlap.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StaticPath(String);

impl Arbitrary for StaticPath {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        prop_oneof![
            "/[ab]{1,3}".prop_map(StaticPath),
            "/[ab]{1,2}/[ab]{1,2}".prop_map(StaticPath),
            "/(a|b|c)/(a|b|c)/(a|b|c)".prop_map(StaticPath),
        ]
        .boxed()
    }
}

/// Actions to test against both implementations.
#[derive(Arbitrary, Debug, Clone)]
enum Action {
    Insert(StaticPath, u64),
    Delete(StaticPath),
    Search(StaticPath),
    Prefix(StaticPath),
}

/// Test harness executing actions on the trie and a BTreeMap model. With
/// static-only templates the engine degenerates to exact string matching,
/// which the map models completely.
#[derive(Default)]
struct Test {
    trie: PathTrie<u64>,
    model: BTreeMap<String, u64>,
    /// Every template ever inserted; static structure is append-only, so
    /// `is_prefix` answers against this set, tombstones included.
    ever: Vec<String>,
}

impl Test {
    fn execute(&mut self, action: Action) {
        match action {
            Action::Insert(p, v) => {
                let result = self.trie.insert(&p.0, v);
                if self.model.contains_key(&p.0) {
                    assert_eq!(
                        result,
                        Err(TrieError::Duplicate),
                        "re-insert of {:?} must be rejected",
                        p.0
                    );
                } else {
                    assert_eq!(result, Ok(()), "insert of {:?} failed", p.0);
                    self.model.insert(p.0.clone(), v);
                    self.ever.push(p.0);
                }
            }
            Action::Delete(p) => {
                let removed = self.trie.delete(&p.0).expect("intern map is live");
                assert_eq!(
                    removed,
                    self.model.remove(&p.0),
                    "delete mismatch for {:?}",
                    p.0
                );
            }
            Action::Search(p) => {
                let mut caps = vec![0u32; self.trie.required_caps()];
                let mut out = MatchResult::new();
                let found = self.trie.search(p.0.as_bytes(), &mut caps, &mut out);
                assert_eq!(
                    found,
                    self.model.contains_key(&p.0),
                    "search mismatch for {:?}",
                    p.0
                );
                if found {
                    assert_eq!(self.trie.value(out.node_index), self.model.get(&p.0));
                    assert_eq!(out.param_count, 0);
                }
            }
            Action::Prefix(p) => {
                let mut got: Vec<u64> = self
                    .trie
                    .prefix_search(p.0.as_bytes())
                    .into_iter()
                    .copied()
                    .collect();
                got.sort_unstable();
                let mut want: Vec<u64> = self
                    .model
                    .iter()
                    .filter(|(k, _)| k.starts_with(&p.0))
                    .map(|(_, v)| *v)
                    .collect();
                want.sort_unstable();
                assert_eq!(got, want, "prefix_search mismatch under {:?}", p.0);

                let want_prefix = self.ever.iter().any(|k| k.starts_with(&p.0));
                assert_eq!(
                    self.trie.is_prefix(p.0.as_bytes()),
                    want_prefix,
                    "is_prefix mismatch for {:?}",
                    p.0
                );
            }
        }
        assert_eq!(self.trie.len(), self.model.len());
        assert_eq!(self.trie.is_empty(), self.model.is_empty());
    }
}

/// One segment of a generated parameterized template, carrying the concrete
/// values substituted into the searched path.
#[derive(Debug, Clone)]
enum Seg {
    Lit(String),
    Param(String),
    ParamExt(String, String),
}

fn seg_strategy() -> impl Strategy<Value = Seg> {
    prop_oneof![
        "[a-z]{1,6}".prop_map(Seg::Lit),
        "[a-z0-9]{1,8}".prop_map(Seg::Param),
        ("[a-z0-9]{1,8}", "[a-z0-9]{1,4}").prop_map(|(stem, ext)| Seg::ParamExt(stem, ext)),
    ]
}

fn template_strategy() -> impl Strategy<Value = (Vec<Seg>, Option<String>)> {
    (
        prop::collection::vec(seg_strategy(), 1..4),
        prop::option::of("[a-z/]{0,10}"),
    )
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        failure_persistence: None,
        ..ProptestConfig::default()
    })]

    #[test]
    fn proptest_static_vs_btreemap(actions in prop::collection::vec(any::<Action>(), 1..64)) {
        let mut test = Test::default();
        for action in actions {
            test.execute(action);
        }
    }

    /// Round-trip: a path built by substituting values into a generated
    /// template must match, with every capture range reproducing its value
    /// and the wildcard covering exactly the appended tail.
    #[test]
    fn proptest_param_capture_roundtrip((segs, wild) in template_strategy()) {
        let mut template = String::new();
        let mut path = String::new();
        let mut expected: Vec<(String, String)> = Vec::new();

        for seg in &segs {
            template.push('/');
            path.push('/');
            match seg {
                Seg::Lit(s) => {
                    template.push_str(s);
                    path.push_str(s);
                }
                Seg::Param(v) => {
                    let name = format!("p{}", expected.len());
                    template.push('{');
                    template.push_str(&name);
                    template.push('}');
                    path.push_str(v);
                    expected.push((name, v.clone()));
                }
                Seg::ParamExt(stem, ext) => {
                    let n0 = format!("p{}", expected.len());
                    let n1 = format!("p{}", expected.len() + 1);
                    template.push('{');
                    template.push_str(&n0);
                    template.push_str("}.{");
                    template.push_str(&n1);
                    template.push('}');
                    path.push_str(stem);
                    path.push('.');
                    path.push_str(ext);
                    expected.push((n0, stem.clone()));
                    expected.push((n1, ext.clone()));
                }
            }
        }
        if let Some(tail) = &wild {
            template.push_str("/*");
            path.push('/');
            path.push_str(tail);
        }

        let mut trie: PathTrie<u32> = PathTrie::new();
        trie.insert(&template, 1).unwrap();

        let mut caps = vec![0u32; trie.required_caps()];
        let mut out = MatchResult::new();
        prop_assert!(
            trie.search(path.as_bytes(), &mut caps, &mut out),
            "template={} path={}", template, path
        );
        prop_assert_eq!(trie.value(out.node_index), Some(&1));
        prop_assert_eq!(out.param_count as usize, expected.len());

        let keys = trie.param_keys(out.node_index);
        for (i, (name, value)) in expected.iter().enumerate() {
            prop_assert_eq!(keys[i], name.as_str());
            let s = caps[2 * i] as usize;
            let e = caps[2 * i + 1] as usize;
            prop_assert_eq!(&path[s..e], value.as_str(), "capture {} of {}", name, template);
        }

        match (&wild, out.wildcard) {
            (Some(tail), Some((s, e))) => {
                prop_assert_eq!(&path[s as usize..e as usize], tail.as_str());
            }
            (None, None) => {}
            (want, got) => prop_assert!(false, "wildcard {:?} vs {:?}", want, got),
        }
    }
}
