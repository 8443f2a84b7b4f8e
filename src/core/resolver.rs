//! Maps free-text fund names to canonical fund codes.
//!
//! Matching tries four rules in order and returns the first hit:
//!
//! 1. exact equality with a directory name,
//! 2. equality after [`normalize`],
//! 3. containment either way after [`normalize`], guarded by [`same_prefix`],
//! 4. the best [`similarity`] over the whole directory, guarded by
//!    [`same_prefix`] and accepted at [`SIMILARITY_THRESHOLD`] or above.
//!
//! Short fund-name prefixes collide easily, which is why rules 3 and 4 only
//! consider candidates whose first two characters match the query.

use crate::core::cache::Cache;
use crate::core::fund::{FundCode, FundDirectory};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const SIMILARITY_THRESHOLD: f64 = 0.82;

/// Noisy substrings folded away before comparison, applied in order.
const REPLACEMENTS: &[(&str, &str)] = &[
    ("发起式联接", "联接"),
    ("发起联接", "联接"),
    ("发起式", ""),
    ("发起", ""),
    ("成份指数", "指数"),
    ("中证全指证券公司", "证券"),
    ("（", "("),
    ("）", ")"),
];

/// Canonical comparison form of a fund name. Idempotent.
pub fn normalize(name: &str) -> String {
    let mut current: String = name.chars().filter(|c| !c.is_whitespace()).collect();
    loop {
        let mut next = current.clone();
        for (from, to) in REPLACEMENTS {
            next = next.replace(from, to);
        }
        if next == current {
            return current;
        }
        current = next;
    }
}

/// True when both names are non-empty and share their first two characters.
pub fn same_prefix(a: &str, b: &str) -> bool {
    let head = |s: &str| s.chars().take(2).collect::<String>();
    !a.is_empty() && !b.is_empty() && head(a) == head(b)
}

/// Indel similarity in `[0, 1]`: `1 - d / (len(a) + len(b))` where `d` is the
/// insert/delete edit distance between the two character sequences.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 0.0;
    }
    2.0 * longest_common_subsequence(&a, &b) as f64 / total as f64
}

fn longest_common_subsequence(a: &[char], b: &[char]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut row = vec![0usize; b.len() + 1];
    for ca in a {
        for (j, cb) in b.iter().enumerate() {
            row[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                row[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[b.len()]
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchRule {
    Exact,
    Normalized,
    Contains,
    Similar(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub code: FundCode,
    pub name: String,
    pub rule: MatchRule,
}

struct IndexEntry {
    code: FundCode,
    name: String,
    normalized: String,
}

/// Directory snapshot with normalized names computed once.
pub struct NameIndex {
    entries: Vec<IndexEntry>,
}

impl NameIndex {
    pub fn new(funds: Vec<(FundCode, String)>) -> Self {
        let entries = funds
            .into_iter()
            .map(|(code, name)| IndexEntry {
                normalized: normalize(&name),
                code,
                name,
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, query: &str) -> Option<Match> {
        let query = query.trim();
        if query.is_empty() {
            return None;
        }
        let hit = |entry: &IndexEntry, rule| Match {
            code: entry.code.clone(),
            name: entry.name.clone(),
            rule,
        };

        if let Some(entry) = self.entries.iter().find(|e| e.name == query) {
            return Some(hit(entry, MatchRule::Exact));
        }

        let normalized = normalize(query);
        if normalized.is_empty() {
            return None;
        }
        if let Some(entry) = self.entries.iter().find(|e| e.normalized == normalized) {
            return Some(hit(entry, MatchRule::Normalized));
        }

        if let Some(entry) = self.entries.iter().find(|e| {
            !e.normalized.is_empty()
                && (e.normalized.contains(&normalized) || normalized.contains(&e.normalized))
                && same_prefix(&e.name, query)
        }) {
            return Some(hit(entry, MatchRule::Contains));
        }

        let mut best: Option<(&IndexEntry, f64)> = None;
        for entry in &self.entries {
            if !same_prefix(&entry.name, query) {
                continue;
            }
            let ratio = similarity(&normalized, &entry.normalized);
            if best.is_none_or(|(_, best_ratio)| ratio > best_ratio) {
                best = Some((entry, ratio));
            }
        }
        match best {
            Some((entry, ratio)) if ratio >= SIMILARITY_THRESHOLD => {
                Some(hit(entry, MatchRule::Similar(ratio)))
            }
            Some((entry, ratio)) => {
                debug!(
                    query,
                    candidate = %entry.name,
                    ratio,
                    "Best candidate below similarity threshold"
                );
                None
            }
            None => None,
        }
    }
}

/// Resolves fund names against a [`FundDirectory`], reusing a directory
/// snapshot until it is older than the configured staleness tolerance.
pub struct Resolver {
    directory: Arc<dyn FundDirectory>,
    index: Cache<(), Arc<NameIndex>>,
}

impl Resolver {
    pub fn new(directory: Arc<dyn FundDirectory>, max_staleness: Duration) -> Self {
        Self {
            directory,
            index: Cache::new(max_staleness),
        }
    }

    /// Returns the canonical code for `query`, or `None` when no rule matches.
    pub async fn resolve(&self, query: &str) -> Result<Option<FundCode>> {
        Ok(self.resolve_match(query).await?.map(|m| m.code))
    }

    pub async fn resolve_match(&self, query: &str) -> Result<Option<Match>> {
        let index = self.index().await?;
        let found = index.find(query);
        match &found {
            Some(m) => debug!(query, code = %m.code, rule = ?m.rule, "Resolved fund name"),
            None => debug!(query, candidates = index.len(), "Fund name not resolved"),
        }
        Ok(found)
    }

    /// Drops the cached snapshot so the next lookup rescans the directory.
    pub async fn refresh(&self) {
        self.index.invalidate(&()).await;
    }

    async fn index(&self) -> Result<Arc<NameIndex>> {
        if let Some(index) = self.index.get(&()).await {
            return Ok(index);
        }
        let index = Arc::new(NameIndex::new(self.directory.list_all().await?));
        self.index.put((), Arc::clone(&index)).await;
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fund::FundProfile;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn index(entries: &[(&str, &str)]) -> NameIndex {
        NameIndex::new(
            entries
                .iter()
                .map(|(code, name)| (FundCode::parse(code).unwrap(), name.to_string()))
                .collect(),
        )
    }

    fn code_of(found: Option<Match>) -> Option<String> {
        found.map(|m| m.code.as_str().to_string())
    }

    #[test]
    fn test_normalize_folds_noise() {
        assert_eq!(normalize("ABC发起式联接"), "ABC联接");
        assert_eq!(normalize("ABC发起联接 C"), "ABC联接C");
        assert_eq!(normalize("华夏中证全指证券公司ETF联接"), "华夏证券ETF联接");
        assert_eq!(normalize("某某成份指数（LOF）"), "某某指数(LOF)");
        assert_eq!(normalize(" 易方达\u{3000}蓝筹 "), "易方达蓝筹");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for s in [
            "ABC发起式联接",
            "发发起式起",
            "发起式发起式联接",
            "招商中证白酒指数(LOF)A",
            "（（嵌套））",
            "中证全指证券公司成份指数发起",
            "",
            "   ",
        ] {
            let once = normalize(s);
            assert_eq!(normalize(&once), once, "not idempotent for {s:?}");
        }
    }

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(similarity("abc", "abc"), 1.0);
        assert_eq!(similarity("abc", "xyz"), 0.0);
        assert_eq!(similarity("", ""), 0.0);
        assert!((similarity("abcd", "abce") - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_same_prefix_uses_characters_not_bytes() {
        assert!(same_prefix("易方达蓝筹", "易方达消费"));
        assert!(!same_prefix("易方达蓝筹", "华夏成长"));
        assert!(!same_prefix("", ""));
    }

    #[test]
    fn test_exact_match_takes_precedence() {
        let idx = index(&[
            ("000001", "华夏成长混合A"),
            ("000002", "华夏成长混合"),
        ]);
        let found = idx.find("华夏成长混合").unwrap();
        assert_eq!(found.code.as_str(), "000002");
        assert_eq!(found.rule, MatchRule::Exact);
    }

    #[test]
    fn test_promotional_suffix_is_stripped() {
        let idx = index(&[("000003", "ABC联接")]);
        let found = idx.find("ABC发起式联接").unwrap();
        assert_eq!(found.code.as_str(), "000003");
        assert_eq!(found.rule, MatchRule::Normalized);
    }

    #[test]
    fn test_containment_requires_same_prefix() {
        let idx = index(&[("000004", "沪深300"), ("000005", "天弘沪深300ETF联接A")]);
        let found = idx.find("天弘沪深300ETF联接").unwrap();
        assert_eq!(found.code.as_str(), "000005");
        assert_eq!(found.rule, MatchRule::Contains);

        // "沪深300" is contained in the query but its prefix differs.
        let idx = index(&[("000004", "沪深300")]);
        assert_eq!(code_of(idx.find("天弘沪深300ETF联接")), None);
    }

    #[test]
    fn test_similarity_fallback_picks_best_guarded_candidate() {
        let idx = index(&[
            ("000006", "易方达消费行业股票"),
            ("000007", "易方达蓝筹精选混合"),
            ("000008", "华夏蓝筹精选混合型"),
        ]);
        let found = idx.find("易方达蓝筹精选混合型").unwrap();
        assert_eq!(found.code.as_str(), "000007");
        assert!(matches!(found.rule, MatchRule::Contains | MatchRule::Similar(_)));

        let found = idx.find("易方达蓝筹精选混和").unwrap();
        assert_eq!(found.code.as_str(), "000007");
        match found.rule {
            MatchRule::Similar(ratio) => assert!(ratio >= SIMILARITY_THRESHOLD),
            other => panic!("expected similarity match, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_unrelated_short_names() {
        let idx = index(&[("000009", "华夏成长"), ("000010", "南方成长")]);
        // Same suffix, different prefix: guard fails.
        assert_eq!(code_of(idx.find("嘉实成长")), None);
        // Same prefix, too dissimilar.
        assert_eq!(code_of(idx.find("华夏回报债券")), None);
        assert_eq!(code_of(idx.find("")), None);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let idx = index(&[
            ("000011", "广发纳斯达克100指数A"),
            ("000012", "广发纳斯达克100指数C"),
        ]);
        let first = code_of(idx.find("广发纳斯达克100指数"));
        for _ in 0..5 {
            assert_eq!(code_of(idx.find("广发纳斯达克100指数")), first);
        }
    }

    struct CountingDirectory {
        funds: Vec<(FundCode, String)>,
        scans: AtomicUsize,
    }

    #[async_trait]
    impl FundDirectory for CountingDirectory {
        async fn get_profile(&self, _code: &FundCode) -> Result<Option<FundProfile>> {
            Ok(None)
        }

        async fn list_all(&self) -> Result<Vec<(FundCode, String)>> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            Ok(self.funds.clone())
        }
    }

    #[tokio::test]
    async fn test_resolver_caches_directory_snapshot() {
        let directory = Arc::new(CountingDirectory {
            funds: vec![(FundCode::parse("110022").unwrap(), "易方达消费行业股票".to_string())],
            scans: AtomicUsize::new(0),
        });
        let resolver = Resolver::new(directory.clone(), Duration::from_secs(300));

        let code = resolver.resolve("易方达消费行业股票").await.unwrap();
        assert_eq!(code.unwrap().as_str(), "110022");
        assert!(resolver.resolve("不存在的基金").await.unwrap().is_none());
        assert_eq!(directory.scans.load(Ordering::SeqCst), 1);

        resolver.refresh().await;
        resolver.resolve("易方达消费行业股票").await.unwrap();
        assert_eq!(directory.scans.load(Ordering::SeqCst), 2);
    }
}
