//! Root and file key resolution.

use crate::style::PathStyle;

/// Name of the directory segment every library tree lives under. Used to
/// recover a relative key for roots belonging to a moved or orphaned install.
pub const LIBRARY_SEGMENT: &str = "library";

/// Every form of a root or file identity that a lookup might need.
///
/// `key` is the only form ever written. The others exist so that rows
/// written by older releases (before keys were relative, or before they were
/// normalized) can still be found and migrated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Canonical key.
    pub key: String,
    /// The key before case folding, only when it differs from `key`.
    pub key_raw: Option<String>,
    /// Absolute location (original case) if one could be determined,
    /// otherwise the unified input.
    pub abs: String,
    /// Normalized absolute form that older releases used as the key.
    pub legacy_abs: Option<String>,
    /// Whether `key` is relative (to the database root, or to the root for
    /// files).
    pub is_relative_key: bool,
}

impl ResolvedPath {
    /// Non-canonical exact keys worth probing, in lookup order, without
    /// duplicates and without `key` itself.
    pub fn fallback_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::with_capacity(2);
        for candidate in [self.key_raw.as_deref(), self.legacy_abs.as_deref()].into_iter().flatten() {
            if candidate != self.key && !keys.contains(&candidate) {
                keys.push(candidate);
            }
        }
        keys
    }

    /// Every form of this identity (plus the caller's `input`) in
    /// [loose](PathStyle::loose) comparison form, deduplicated.
    pub fn loose_candidates(&self, input: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(5);
        let forms = [Some(input), Some(self.abs.as_str()), Some(self.key.as_str()), self.key_raw.as_deref()];
        for form in forms.into_iter().chain([self.legacy_abs.as_deref()]).flatten() {
            let loose = PathStyle::loose(form.trim());
            if !loose.is_empty() && !out.contains(&loose) {
                out.push(loose);
            }
        }
        out
    }
}

/// Pure conversion of user-supplied roots and files into cache keys.
///
/// The resolver never touches the filesystem or the database. `base` is the
/// database root: roots located under it are keyed relative to it, so the
/// whole database directory can be moved without invalidating the cache.
///
/// ```
/// use frkb_paths::{PathResolver, PathStyle};
///
/// let resolver = PathResolver::new(Some("C:\\FRKB".into()), PathStyle::Windows);
/// let root = resolver.resolve_root("C:\\FRKB\\Library\\FilterLibrary\\House").unwrap();
/// assert_eq!(root.key, "library\\filterlibrary\\house");
/// assert_eq!(root.key_raw.as_deref(), Some("Library\\FilterLibrary\\House"));
/// assert_eq!(root.legacy_abs.as_deref(), Some("c:\\frkb\\library\\filterlibrary\\house"));
///
/// let file = resolver.resolve_file(&root.abs, "Artist - Title.mp3").unwrap();
/// assert_eq!(file.key, "artist - title.mp3");
/// assert_eq!(file.abs, "C:\\FRKB\\Library\\FilterLibrary\\House\\Artist - Title.mp3");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathResolver {
    base: Option<String>,
    style: PathStyle,
}

impl PathResolver {
    pub fn new(base: Option<String>, style: PathStyle) -> Self {
        let base = base.map(|b| style.unify(&b)).filter(|b| !b.is_empty());
        Self { base, style }
    }

    pub fn base(&self) -> Option<&str> {
        self.base.as_deref()
    }

    pub fn style(&self) -> PathStyle {
        self.style
    }

    /// Resolve a library root.
    ///
    /// 1. Absolute and under the database root: relative to the database root.
    /// 2. Absolute, elsewhere, but containing a [`LIBRARY_SEGMENT`]: relative
    ///    from that segment (the first one), as if it had been under the
    ///    database root.
    /// 3. Any other absolute path: the normalized absolute path.
    /// 4. Relative: used as-is, with the absolute location computed against the
    ///    database root when known.
    ///
    /// Returns `None` when the key would be empty.
    pub fn resolve_root(&self, input: &str) -> Option<ResolvedPath> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }
        let style = self.style;
        let parsed = style.parse(input);
        if !parsed.is_absolute() {
            return self.resolve_relative(self.base.as_deref(), input);
        }
        let relative = self
            .base
            .as_deref()
            .and_then(|base| style.strip_base(base, input))
            .or_else(|| Self::from_library_segment(style, &parsed.segments, input));
        let abs = style.render(parsed.prefix, &parsed.segments);
        match relative {
            Some(relative) => Some(Self::relative_key(style, relative, abs)),
            None => Some(Self::absolute_key(style, abs)),
        }
    }

    /// Resolve a file inside a root whose absolute location is `root_abs`.
    ///
    /// Absolute files under `root_abs` are keyed relative to it; absolute
    /// files elsewhere keep their normalized absolute path; relative files
    /// are used as-is. Returns `None` when the key would be empty.
    pub fn resolve_file(&self, root_abs: &str, input: &str) -> Option<ResolvedPath> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }
        let style = self.style;
        let parsed = style.parse(input);
        if !parsed.is_absolute() {
            return self.resolve_relative(Some(root_abs).filter(|r| !r.trim().is_empty()), input);
        }
        let abs = style.render(parsed.prefix, &parsed.segments);
        match style.strip_base(root_abs, input) {
            Some(relative) => Some(Self::relative_key(style, relative, abs)),
            None => Some(Self::absolute_key(style, abs)),
        }
    }

    fn from_library_segment(style: PathStyle, segments: &[&str], input: &str) -> Option<String> {
        let index = segments.iter().position(|s| match style.folds_case() {
            true => s.eq_ignore_ascii_case(LIBRARY_SEGMENT),
            false => *s == LIBRARY_SEGMENT,
        })?;
        tracing::trace!(path = input, "Root outside the database root; keying from its library segment");
        Some(style.render("", &segments[index..]))
    }

    fn relative_key(style: PathStyle, relative: String, abs: String) -> ResolvedPath {
        let key = style.fold(relative.clone());
        let legacy_abs = Some(style.fold(abs.clone()));
        ResolvedPath {
            key_raw: Some(relative).filter(|raw| *raw != key),
            key,
            abs,
            legacy_abs,
            is_relative_key: true,
        }
    }

    fn absolute_key(style: PathStyle, abs: String) -> ResolvedPath {
        ResolvedPath {
            key: style.fold(abs.clone()),
            key_raw: None,
            abs,
            legacy_abs: None,
            is_relative_key: false,
        }
    }

    fn resolve_relative(&self, base: Option<&str>, input: &str) -> Option<ResolvedPath> {
        let style = self.style;
        let key = style.normalize(input);
        if key.is_empty() {
            return None;
        }
        let raw = input.trim_end_matches(['/', '\\']);
        let abs = match base {
            Some(base) => style.join(base, input),
            None => style.unify(input),
        };
        let legacy_abs = Some(&abs).filter(|abs| style.is_absolute(abs)).map(|abs| style.fold(abs.clone()));
        Some(ResolvedPath {
            key_raw: Some(raw.to_string()).filter(|raw| *raw != key),
            key,
            abs,
            legacy_abs,
            is_relative_key: true,
        })
    }
}
