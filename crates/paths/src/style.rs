//! Platform path conventions applied to plain strings.
//!
//! Cache keys are strings that were written by whatever platform the library
//! lived on, so the rules for splitting, joining and comparing them cannot
//! depend on the host's [`std::path`] implementation. Every function here is
//! parameterised by a [`PathStyle`] instead.

use serde::{Deserialize, Serialize};

/// Path convention used when building and comparing cache keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathStyle {
    /// `/` separated, case-sensitive.
    Posix,
    /// `\` separated (`/` accepted on input), case-insensitive.
    Windows,
}

impl Default for PathStyle {
    fn default() -> Self {
        Self::host()
    }
}

/// A path split into its root prefix and normal segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Parsed<'a> {
    /// Root prefix: `""` (relative), `"/"`, `"C:"` or `"\\\\"` (UNC).
    pub(crate) prefix: &'a str,
    pub(crate) segments: Vec<&'a str>,
}

impl Parsed<'_> {
    pub(crate) fn is_absolute(&self) -> bool {
        !self.prefix.is_empty()
    }
}

impl PathStyle {
    /// The convention of the platform this binary was compiled for.
    pub const fn host() -> Self {
        if cfg!(windows) { Self::Windows } else { Self::Posix }
    }

    pub const fn separator(self) -> char {
        match self {
            Self::Posix => '/',
            Self::Windows => '\\',
        }
    }

    /// Whether two paths differing only in letter case name the same file.
    pub const fn folds_case(self) -> bool {
        matches!(self, Self::Windows)
    }

    fn is_separator(self, c: char) -> bool {
        match self {
            Self::Posix => c == '/',
            Self::Windows => c == '/' || c == '\\',
        }
    }

    pub(crate) fn parse(self, path: &str) -> Parsed<'_> {
        let (prefix, rest) = match self {
            Self::Posix => match path.strip_prefix('/') {
                Some(rest) => ("/", rest),
                None => ("", path),
            },
            Self::Windows => {
                let bytes = path.as_bytes();
                if bytes.len() >= 2 && self.is_separator(bytes[0] as char) && self.is_separator(bytes[1] as char) {
                    ("\\\\", &path[2..])
                } else if bytes.len() >= 3
                    && bytes[0].is_ascii_alphabetic()
                    && bytes[1] == b':'
                    && self.is_separator(bytes[2] as char)
                {
                    (&path[..2], &path[3..])
                } else if bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
                    (&path[..2], "")
                } else {
                    ("", path)
                }
            },
        };
        let mut segments: Vec<&str> = Vec::new();
        for segment in rest.split(|c| self.is_separator(c)) {
            match segment {
                "" | "." => {},
                ".." => match segments.last() {
                    Some(&last) if last != ".." => {
                        segments.pop();
                    },
                    // Can't climb above a root.
                    _ if !prefix.is_empty() => {},
                    _ => segments.push(".."),
                },
                normal => segments.push(normal),
            }
        }
        Parsed { prefix, segments }
    }

    pub(crate) fn render(self, prefix: &str, segments: &[&str]) -> String {
        let sep = self.separator();
        let mut out = String::with_capacity(prefix.len() + segments.iter().map(|s| s.len() + 1).sum::<usize>());
        match prefix {
            "" => {},
            "/" | "\\\\" => out.push_str(prefix),
            drive => {
                out.push_str(drive);
                out.push(sep);
            },
        }
        for (i, segment) in segments.iter().enumerate() {
            if i > 0 {
                out.push(sep);
            }
            out.push_str(segment);
        }
        out
    }

    pub(crate) fn fold(self, path: String) -> String {
        match self.folds_case() {
            true => path.to_lowercase(),
            false => path,
        }
    }

    /// Whether `path` is absolute under this convention.
    ///
    /// ```
    /// use frkb_paths::PathStyle;
    /// assert!(PathStyle::Posix.is_absolute("/music/library"));
    /// assert!(!PathStyle::Posix.is_absolute("C:\\music"));
    /// assert!(PathStyle::Windows.is_absolute("C:\\music"));
    /// assert!(PathStyle::Windows.is_absolute("\\\\nas\\share"));
    /// assert!(!PathStyle::Windows.is_absolute("library\\A"));
    /// ```
    pub fn is_absolute(self, path: &str) -> bool {
        self.parse(path).is_absolute()
    }

    /// Separator unification, `.`/`..` resolution and trailing-separator trim,
    /// without changing letter case.
    pub fn unify(self, path: &str) -> String {
        let parsed = self.parse(path.trim());
        self.render(parsed.prefix, &parsed.segments)
    }

    /// Canonical form of a path: [`unify`](Self::unify) plus lowercasing on
    /// case-insensitive platforms.
    ///
    /// ```
    /// use frkb_paths::PathStyle;
    /// assert_eq!(PathStyle::Windows.normalize("C:/Music//Library/A/"), "c:\\music\\library\\a");
    /// assert_eq!(PathStyle::Posix.normalize("/Music/./Library/A/"), "/Music/Library/A");
    /// ```
    pub fn normalize(self, path: &str) -> String {
        self.fold(self.unify(path))
    }

    /// Case- and separator-insensitive comparison form. Must agree with the
    /// SQL expression `lower(replace(col, '/', '\'))`, and SQLite's `lower()`
    /// only folds ASCII.
    pub fn loose(path: &str) -> String {
        path.to_ascii_lowercase().replace('/', "\\")
    }

    /// Join a relative path onto a base, normalizing separators but keeping case.
    pub fn join(self, base: &str, relative: &str) -> String {
        let base = self.parse(base);
        let relative = self.parse(relative);
        if relative.is_absolute() {
            return self.render(relative.prefix, &relative.segments);
        }
        let mut segments = base.segments.clone();
        for segment in relative.segments {
            match segment {
                ".." if segments.last().is_some_and(|last| *last != "..") => {
                    segments.pop();
                },
                ".." if base.is_absolute() => {},
                other => segments.push(other),
            }
        }
        self.render(base.prefix, &segments)
    }

    /// The remainder of `path` below `base`, in `path`'s original case, or
    /// `None` if `path` is not strictly inside `base`.
    ///
    /// ```
    /// use frkb_paths::PathStyle;
    /// assert_eq!(PathStyle::Windows.strip_base("C:\\DB", "c:/db/Library/A").as_deref(), Some("Library\\A"));
    /// assert_eq!(PathStyle::Posix.strip_base("/db", "/db"), None);
    /// assert_eq!(PathStyle::Posix.strip_base("/db", "/dbx/a"), None);
    /// ```
    pub fn strip_base(self, base: &str, path: &str) -> Option<String> {
        let base = self.parse(base.trim());
        let path = self.parse(path.trim());
        let same_prefix = match self.folds_case() {
            true => base.prefix.eq_ignore_ascii_case(path.prefix),
            false => base.prefix == path.prefix,
        };
        if !same_prefix || path.segments.len() <= base.segments.len() {
            return None;
        }
        let matches = base.segments.iter().zip(&path.segments).all(|(b, p)| match self.folds_case() {
            true => b.to_lowercase() == p.to_lowercase(),
            false => b == p,
        });
        match matches {
            true => Some(self.render("", &path.segments[base.segments.len()..])),
            false => None,
        }
    }
}
