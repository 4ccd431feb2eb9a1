//! `.gitignore` parsing and the chained per-directory ignore stack the diff
//! engine consults to classify untracked files.

use std::sync::Arc;

use bstr::ByteSlice;

use canopy_castore::RelativePathBuf;

/// How a path fared against one ignore file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    NoMatch,
    /// The path is ignored.
    Exclude,
    /// A negated pattern re-includes the path.
    Include,
}

struct Pattern {
    negated: bool,
    dir_only: bool,
    /// Anchored patterns match against the path relative to the ignore
    /// file's directory; unanchored ones match any basename below it.
    anchored: bool,
    glob: Vec<u8>,
}

/// The parsed rules of a single ignore file.
#[derive(Default)]
pub struct GitIgnore {
    patterns: Vec<Pattern>,
}

impl GitIgnore {
    /// Parses ignore-file contents. Unparseable lines are skipped, the way
    /// git skips them.
    pub fn parse(contents: &[u8]) -> Self {
        let mut patterns = Vec::new();
        for line in contents.lines() {
            let mut line = line;
            if line.is_empty() || line.starts_with(b"#") {
                continue;
            }
            // Trailing unescaped whitespace is not significant.
            while line.last() == Some(&b' ') && !line.ends_with(br"\ ") {
                line = &line[..line.len() - 1];
            }
            let negated = line.starts_with(b"!");
            if negated {
                line = &line[1..];
            }
            let dir_only = line.ends_with(b"/");
            if dir_only {
                line = &line[..line.len() - 1];
            }
            if line.is_empty() {
                continue;
            }
            // A slash anywhere but the end anchors the pattern; a leading
            // slash is only an anchor marker and is stripped.
            let anchored = line.contains(&b'/');
            if line.starts_with(b"/") {
                line = &line[1..];
            }
            patterns.push(Pattern {
                negated,
                dir_only,
                anchored,
                glob: line.to_vec(),
            });
        }
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Matches a path (relative to this ignore file's directory) against
    /// the rules. The last matching rule in file order wins.
    pub fn match_path(&self, path: &RelativePathBuf, is_dir: bool) -> MatchResult {
        let basename: &[u8] = path
            .components()
            .last()
            .unwrap_or_else(|| path.as_bytes());
        for pattern in self.patterns.iter().rev() {
            if pattern.dir_only && !is_dir {
                continue;
            }
            let text: &[u8] = if pattern.anchored {
                path.as_bytes()
            } else {
                basename
            };
            if glob_match(&pattern.glob, text) {
                return if pattern.negated {
                    MatchResult::Include
                } else {
                    MatchResult::Exclude
                };
            }
        }
        MatchResult::NoMatch
    }
}

/// Glob matching with git semantics: `*` and `?` never cross a `/`, `**`
/// crosses anything, `[...]` classes with ranges and `!` negation.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    if pattern.is_empty() {
        return text.is_empty();
    }
    match pattern[0] {
        b'*' => {
            if pattern.len() >= 2 && pattern[1] == b'*' {
                // `**` matches any sequence, including separators. A
                // following slash is optional in the remainder.
                let rest = if pattern.len() >= 3 && pattern[2] == b'/' {
                    &pattern[3..]
                } else {
                    &pattern[2..]
                };
                (0..=text.len()).any(|i| glob_match(rest, &text[i..]))
            } else {
                let rest = &pattern[1..];
                for i in 0..=text.len() {
                    if glob_match(rest, &text[i..]) {
                        return true;
                    }
                    if i < text.len() && text[i] == b'/' {
                        break;
                    }
                }
                false
            }
        }
        b'?' => {
            !text.is_empty() && text[0] != b'/' && glob_match(&pattern[1..], &text[1..])
        }
        b'[' => match parse_class(&pattern[1..]) {
            Some((matcher, rest)) => {
                !text.is_empty() && matcher.matches(text[0]) && glob_match(rest, &text[1..])
            }
            // An unterminated class matches a literal '['.
            None => !text.is_empty() && text[0] == b'[' && glob_match(&pattern[1..], &text[1..]),
        },
        b'\\' if pattern.len() >= 2 => {
            !text.is_empty() && text[0] == pattern[1] && glob_match(&pattern[2..], &text[1..])
        }
        c => !text.is_empty() && text[0] == c && glob_match(&pattern[1..], &text[1..]),
    }
}

struct CharClass<'a> {
    negated: bool,
    body: &'a [u8],
}

impl CharClass<'_> {
    fn matches(&self, c: u8) -> bool {
        let mut found = false;
        let mut i = 0;
        while i < self.body.len() {
            if i + 2 < self.body.len() && self.body[i + 1] == b'-' {
                if self.body[i] <= c && c <= self.body[i + 2] {
                    found = true;
                }
                i += 3;
            } else {
                if self.body[i] == c {
                    found = true;
                }
                i += 1;
            }
        }
        found != self.negated
    }
}

/// Splits `[class]...` (already past the `[`) into the class matcher and
/// the rest of the pattern.
fn parse_class(pattern: &[u8]) -> Option<(CharClass<'_>, &[u8])> {
    let negated = pattern.first() == Some(&b'!');
    let start = if negated { 1 } else { 0 };
    // A `]` in the first position is a literal member.
    let mut end = start;
    while end < pattern.len() {
        if pattern[end] == b']' && end > start {
            return Some((
                CharClass {
                    negated,
                    body: &pattern[start..end],
                },
                &pattern[end + 1..],
            ));
        }
        end += 1;
    }
    None
}

/// A chained stack of ignore files, one frame per directory that carries a
/// `.gitignore`. Innermost rules win over outer ones.
pub struct IgnoreStack {
    parent: Option<Arc<IgnoreStack>>,
    /// The directory owning this ignore file, relative to the mount root.
    dir: RelativePathBuf,
    ignore: GitIgnore,
}

impl IgnoreStack {
    /// The empty root stack: nothing is ignored.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            parent: None,
            dir: RelativePathBuf::root(),
            ignore: GitIgnore::default(),
        })
    }

    /// Pushes the ignore file of `dir` onto the stack.
    pub fn push(self: &Arc<Self>, dir: RelativePathBuf, ignore: GitIgnore) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(self.clone()),
            dir,
            ignore,
        })
    }

    /// Whether `path` is ignored, consulting ignore files from the
    /// innermost directory outward.
    pub fn is_ignored(&self, path: &RelativePathBuf, is_dir: bool) -> bool {
        let mut frame = Some(self);
        while let Some(stack) = frame {
            if let Some(relative) = path.strip_prefix(&stack.dir) {
                match stack.ignore.match_path(&relative, is_dir) {
                    MatchResult::Exclude => return true,
                    MatchResult::Include => return false,
                    MatchResult::NoMatch => {}
                }
            }
            frame = stack.parent.as_deref();
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn path(s: &str) -> RelativePathBuf {
        s.parse().unwrap()
    }

    #[rstest]
    #[case(b"*.log", "build.log", false, MatchResult::Exclude)]
    #[case(b"*.log", "deep/nested/build.log", false, MatchResult::Exclude)]
    #[case(b"*.log", "build.log.txt", false, MatchResult::NoMatch)]
    #[case(b"build/", "build", true, MatchResult::Exclude)]
    #[case(b"build/", "build", false, MatchResult::NoMatch)]
    #[case(b"/top", "top", false, MatchResult::Exclude)]
    #[case(b"/top", "sub/top", false, MatchResult::NoMatch)]
    #[case(b"doc/*.txt", "doc/a.txt", false, MatchResult::Exclude)]
    #[case(b"doc/*.txt", "doc/sub/a.txt", false, MatchResult::NoMatch)]
    #[case(b"doc/**/*.txt", "doc/sub/a.txt", false, MatchResult::Exclude)]
    #[case(b"file?.c", "file1.c", false, MatchResult::Exclude)]
    #[case(b"file[0-9].c", "file5.c", false, MatchResult::Exclude)]
    #[case(b"file[!0-9].c", "file5.c", false, MatchResult::NoMatch)]
    fn single_patterns(
        #[case] rules: &[u8],
        #[case] input: &str,
        #[case] is_dir: bool,
        #[case] expected: MatchResult,
    ) {
        let ignore = GitIgnore::parse(rules);
        assert_eq!(ignore.match_path(&path(input), is_dir), expected);
    }

    #[test]
    fn last_match_wins() {
        let ignore = GitIgnore::parse(b"*.log\n!keep.log\n");
        assert_eq!(
            ignore.match_path(&path("build.log"), false),
            MatchResult::Exclude
        );
        assert_eq!(
            ignore.match_path(&path("keep.log"), false),
            MatchResult::Include
        );
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let ignore = GitIgnore::parse(b"# comment\n\n*.o\n");
        assert_eq!(
            ignore.match_path(&path("a.o"), false),
            MatchResult::Exclude
        );
        assert_eq!(
            ignore.match_path(&path("# comment"), false),
            MatchResult::NoMatch
        );
    }

    #[test]
    fn inner_stack_overrides_outer() {
        let root = IgnoreStack::empty().push(
            RelativePathBuf::root(),
            GitIgnore::parse(b"*.log\n"),
        );
        let sub = root.push(path("sub"), GitIgnore::parse(b"!debug.log\n"));

        assert!(root.is_ignored(&path("a.log"), false));
        assert!(sub.is_ignored(&path("sub/a.log"), false));
        assert!(!sub.is_ignored(&path("sub/debug.log"), false));
    }

    #[test]
    fn stack_is_scoped_to_its_directory() {
        let root = IgnoreStack::empty();
        let sub = root.push(path("sub"), GitIgnore::parse(b"secret\n"));

        assert!(sub.is_ignored(&path("sub/secret"), false));
        // The rule belongs to sub/ and cannot see siblings.
        assert!(!sub.is_ignored(&path("other/secret"), false));
    }
}
