//! Ant-style include/exclude selection.
//!
//! Patterns are split into path segments on `/` or `\`. A segment equal to
//! `**` spans zero or more whole segments; any other segment is matched
//! against exactly one path segment with `glob::Pattern` (`*`, `?`,
//! `[...]`). A trailing separator selects everything below a directory:
//! `build/` behaves as `build/**`.
//!
//! The same rules drive both the remote and the local scanner, so a file
//! set selects identical relative paths on either side.

use crate::mirror::error::FtpResult;
use crate::mirror::types::FileSet;
use glob::{MatchOptions, Pattern};

const DEEP_TREE_MATCH: &str = "**";

#[derive(Debug, Clone)]
enum Segment {
    Deep,
    Literal(String),
    Wild(Pattern),
}

impl Segment {
    fn is_deep(&self) -> bool {
        matches!(self, Segment::Deep)
    }

    fn matches(&self, name: &str, case_sensitive: bool) -> bool {
        match self {
            Segment::Deep => true,
            Segment::Literal(lit) => {
                if case_sensitive {
                    lit == name
                } else {
                    lit.to_lowercase() == name.to_lowercase()
                }
            }
            Segment::Wild(p) => p.matches_with(
                name,
                MatchOptions {
                    case_sensitive,
                    require_literal_separator: true,
                    require_literal_leading_dot: false,
                },
            ),
        }
    }
}

#[derive(Debug, Clone)]
struct AntPattern {
    source: String,
    segments: Vec<Segment>,
}

impl AntPattern {
    fn compile(raw: &str) -> FtpResult<Self> {
        let mut normalized = raw.replace('\\', "/");
        if normalized.ends_with('/') {
            normalized.push_str(DEEP_TREE_MATCH);
        }
        let segments = normalized
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|tok| {
                if tok == DEEP_TREE_MATCH {
                    Ok(Segment::Deep)
                } else if has_wildcard(tok) {
                    Ok(Segment::Wild(Pattern::new(tok)?))
                } else {
                    Ok(Segment::Literal(tok.to_string()))
                }
            })
            .collect::<FtpResult<Vec<_>>>()?;
        Ok(Self {
            source: raw.to_string(),
            segments,
        })
    }

    /// Leading run of literal segments, joined with `/`.
    fn static_prefix(&self) -> String {
        self.segments
            .iter()
            .map_while(|s| match s {
                Segment::Literal(l) => Some(l.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

fn has_wildcard(tok: &str) -> bool {
    tok.contains(['*', '?', '['])
}

/// Split a relative path on either separator, dropping empty segments.
pub fn path_segments(path: &str) -> Vec<&str> {
    path.split(['/', '\\', std::path::MAIN_SEPARATOR])
        .filter(|s| !s.is_empty() && *s != ".")
        .collect()
}

/// Subtrees a scan must visit to satisfy every include pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anchors {
    /// Some pattern starts with a wildcard: scan from the root.
    FullTree,
    /// Distinct static prefixes (`/`-separated), sorted.
    Prefixes(Vec<String>),
}

/// Compiled include/exclude rules for one file set.
#[derive(Debug, Clone)]
pub struct SelectionRules {
    includes: Vec<AntPattern>,
    excludes: Vec<AntPattern>,
    case_sensitive: bool,
}

impl SelectionRules {
    /// Compile the rules; no includes means `**`.
    pub fn new(includes: &[String], excludes: &[String], case_sensitive: bool) -> FtpResult<Self> {
        let includes = if includes.is_empty() {
            vec![AntPattern::compile(DEEP_TREE_MATCH)?]
        } else {
            includes
                .iter()
                .map(|p| AntPattern::compile(p))
                .collect::<FtpResult<Vec<_>>>()?
        };
        let excludes = excludes
            .iter()
            .map(|p| AntPattern::compile(p))
            .collect::<FtpResult<Vec<_>>>()?;
        Ok(Self {
            includes,
            excludes,
            case_sensitive,
        })
    }

    pub fn from_file_set(set: &FileSet) -> FtpResult<Self> {
        Self::new(&set.includes, &set.excludes, set.case_sensitive)
    }

    pub fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    pub fn include_patterns(&self) -> Vec<&str> {
        self.includes.iter().map(|p| p.source.as_str()).collect()
    }

    pub fn is_included(&self, rel: &str) -> bool {
        let path = path_segments(rel);
        self.includes
            .iter()
            .any(|p| match_path(&p.segments, &path, self.case_sensitive))
    }

    pub fn is_excluded(&self, rel: &str) -> bool {
        let path = path_segments(rel);
        self.excludes
            .iter()
            .any(|p| match_path(&p.segments, &path, self.case_sensitive))
    }

    /// Whether something below directory `rel` could still be included.
    pub fn could_hold_included(&self, rel: &str) -> bool {
        let path = path_segments(rel);
        self.includes
            .iter()
            .any(|p| match_start(&p.segments, &path, self.case_sensitive))
            && !self.contents_excluded(rel)
    }

    /// Whether an exclude of the form `<dir>/**` swallows the whole of `rel`.
    pub fn contents_excluded(&self, rel: &str) -> bool {
        let path = path_segments(rel);
        self.excludes.iter().any(|p| match p.segments.split_last() {
            Some((last, head)) if last.is_deep() => match_path(head, &path, self.case_sensitive),
            _ => false,
        })
    }

    pub fn anchors(&self) -> Anchors {
        let mut prefixes: Vec<String> = Vec::new();
        for p in &self.includes {
            let prefix = p.static_prefix();
            if prefix.is_empty() {
                return Anchors::FullTree;
            }
            prefixes.push(prefix);
        }
        prefixes.sort();
        prefixes.dedup();
        Anchors::Prefixes(prefixes)
    }
}

fn all_deep(segments: &[Segment]) -> bool {
    segments.iter().all(Segment::is_deep)
}

/// Full-path match of a tokenized pattern against a tokenized path.
fn match_path(pat: &[Segment], path: &[&str], cs: bool) -> bool {
    let (mut ps, mut pe) = (0usize, pat.len());
    let (mut ss, mut se) = (0usize, path.len());

    // Up to the first `**`.
    while ps < pe && ss < se {
        if pat[ps].is_deep() {
            break;
        }
        if !pat[ps].matches(path[ss], cs) {
            return false;
        }
        ps += 1;
        ss += 1;
    }
    if ss >= se {
        return all_deep(&pat[ps..pe]);
    }
    if ps >= pe {
        return false;
    }

    // Back from the last `**`.
    while ps < pe && ss < se {
        if pat[pe - 1].is_deep() {
            break;
        }
        if !pat[pe - 1].matches(path[se - 1], cs) {
            return false;
        }
        pe -= 1;
        se -= 1;
    }
    if ss >= se {
        return all_deep(&pat[ps..pe]);
    }

    // pat[ps] and pat[pe - 1] are both `**`; place the literal runs between.
    while ps + 1 < pe && ss < se {
        let next_deep = match (ps + 1..pe).find(|&i| pat[i].is_deep()) {
            Some(i) => i,
            None => return false,
        };
        if next_deep == ps + 1 {
            ps += 1;
            continue;
        }
        let run = next_deep - ps - 1;
        let available = se - ss;
        if available < run {
            return false;
        }
        let found = (0..=available - run).find(|&offset| {
            (0..run).all(|j| pat[ps + 1 + j].matches(path[ss + offset + j], cs))
        });
        match found {
            Some(offset) => {
                ps = next_deep;
                ss += offset + run;
            }
            None => return false,
        }
    }

    all_deep(&pat[ps..pe])
}

/// Whether `path` is a directory prefix some completion of which matches.
fn match_start(pat: &[Segment], path: &[&str], cs: bool) -> bool {
    let (mut ps, mut ss) = (0usize, 0usize);
    while ps < pat.len() && ss < path.len() {
        if pat[ps].is_deep() {
            break;
        }
        if !pat[ps].matches(path[ss], cs) {
            return false;
        }
        ps += 1;
        ss += 1;
    }
    // Once the pattern is used up nothing below `path` can match.
    ps < pat.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(inc: &[&str], exc: &[&str], cs: bool) -> SelectionRules {
        let inc: Vec<String> = inc.iter().map(|s| s.to_string()).collect();
        let exc: Vec<String> = exc.iter().map(|s| s.to_string()).collect();
        SelectionRules::new(&inc, &exc, cs).unwrap()
    }

    #[test]
    fn single_star_stays_in_segment() {
        let r = rules(&["*.txt"], &[], true);
        assert!(r.is_included("notes.txt"));
        assert!(!r.is_included("docs/notes.txt"));
    }

    #[test]
    fn double_star_spans_segments() {
        let r = rules(&["**/*.txt"], &[], true);
        assert!(r.is_included("notes.txt"));
        assert!(r.is_included("a/b/c/notes.txt"));
        assert!(!r.is_included("a/b/notes.md"));
    }

    #[test]
    fn deep_match_in_the_middle() {
        let r = rules(&["src/**/test/*.rs"], &[], true);
        assert!(r.is_included("src/test/a.rs"));
        assert!(r.is_included("src/x/y/test/a.rs"));
        assert!(!r.is_included("src/x/y/a.rs"));
        assert!(!r.is_included("lib/test/a.rs"));
    }

    #[test]
    fn trailing_separator_selects_contents() {
        let r = rules(&["dir/"], &[], true);
        assert!(r.is_included("dir"));
        assert!(r.is_included("dir/a"));
        assert!(r.is_included("dir/a/b"));

        let bare = rules(&["dir"], &[], true);
        assert!(bare.is_included("dir"));
        assert!(!bare.is_included("dir/a"));
    }

    #[test]
    fn case_insensitive_matching() {
        let r = rules(&["**/SUBFILE"], &[], false);
        assert!(r.is_included("rootDir/subFile"));
        let strict = rules(&["**/SUBFILE"], &[], true);
        assert!(!strict.is_included("rootDir/subFile"));
    }

    #[test]
    fn could_hold_included_prunes() {
        let r = rules(&["src/main/**"], &[], true);
        assert!(r.could_hold_included("src"));
        assert!(r.could_hold_included("src/main"));
        assert!(r.could_hold_included("src/main/java"));
        assert!(!r.could_hold_included("docs"));
        assert!(!r.could_hold_included("src/test"));

        let literal = rules(&["src/main"], &[], true);
        assert!(literal.could_hold_included("src"));
        assert!(!literal.could_hold_included("src/main"));
    }

    #[test]
    fn excluded_contents_stop_descent() {
        let r = rules(&["**"], &["build/**"], true);
        assert!(r.contents_excluded("build"));
        assert!(!r.could_hold_included("build"));
        assert!(r.could_hold_included("src"));
        assert!(r.is_excluded("build/out.o"));
    }

    #[test]
    fn anchors_strip_wildcard_tails() {
        let r = rules(&["src/main/**", "docs/*.md", "src/main/java/"], &[], true);
        assert_eq!(
            r.anchors(),
            Anchors::Prefixes(vec!["docs".into(), "src/main".into(), "src/main/java".into()])
        );
        assert_eq!(rules(&["**/x"], &[], true).anchors(), Anchors::FullTree);
        assert_eq!(rules(&[], &[], true).anchors(), Anchors::FullTree);
    }

    #[test]
    fn backslash_patterns_are_normalized() {
        let r = rules(&["a\\b\\*.c"], &[], true);
        assert!(r.is_included("a/b/x.c"));
    }

    #[test]
    fn invalid_pattern_is_config_error() {
        let err = SelectionRules::new(&["a**b".to_string()], &[], true).unwrap_err();
        assert_eq!(err.kind, crate::mirror::error::FtpErrorKind::InvalidConfig);
    }
}
