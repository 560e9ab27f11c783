//! A path module to represent paths within a deployed tree.
//! In fdeploy, fdeploy::path is used for tree-relative and share paths, where as
//! camino is used for the local file system.
//!
//! Paths are separator agnostic: both `/` and `\` split segments, and empty or
//! `.` segments are ignored. Equality, ordering and hashing are segment-wise,
//! so `assets\app.css`, `assets/app.css` and `/assets/app.css/` all name the
//! same entry.
use std::borrow;
use std::cmp;
use std::fmt;
use std::hash;
use std::iter::FusedIterator;
use std::ops;
use std::str;

pub use camino::{Utf8Path as FsPath, Utf8PathBuf as FsPathBuf};
use serde::{Deserialize, Serialize};

pub const SEPARATOR: char = '/';
pub const SEPARATOR_STR: &str = "/";

#[must_use]
pub fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

/// Iterator over the normalized segments of a [`Path`]
#[derive(Clone)]
pub struct Segments<'a> {
    inner: str::Split<'a, fn(char) -> bool>,
}

impl<'a> Iterator for Segments<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        self.inner.by_ref().find(|s| !s.is_empty() && *s != ".")
    }
}

impl<'a> DoubleEndedIterator for Segments<'a> {
    fn next_back(&mut self) -> Option<&'a str> {
        loop {
            match self.inner.next_back() {
                Some(s) if s.is_empty() || s == "." => continue,
                other => return other,
            }
        }
    }
}

impl FusedIterator for Segments<'_> {}

/// A slice of a tree path.
///
/// This is an *unsized* type, meaning that it must always be used behind a
/// pointer like `&` or [`Box`]. For an owned version of this type,
/// see [`PathBuf`].
///
/// # Examples
///
/// ```
/// use fdeploy::path::Path;
///
/// let path = Path::new("wwwroot\\css/site.css");
/// assert_eq!(path.file_name(), Some("site.css"));
/// assert_eq!(path.depth(), 3);
/// ```
#[repr(transparent)]
pub struct Path {
    inner: str,
}

impl Path {
    pub fn new<S: AsRef<str> + ?Sized>(path: &S) -> &Path {
        unsafe { &*(path.as_ref() as *const str as *const Path) }
    }

    /// The empty path, naming the root of a tree.
    pub fn root() -> &'static Path {
        Path::new("")
    }

    /// Yields the underlying [`str`] slice, as given at construction.
    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn segments(&self) -> Segments<'_> {
        Segments {
            inner: self.inner.split(is_separator as fn(char) -> bool),
        }
    }

    /// Number of segments in the path. The root has depth 0.
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    pub fn is_root(&self) -> bool {
        self.segments().next().is_none()
    }

    /// The last segment of the path, if any.
    pub fn file_name(&self) -> Option<&str> {
        self.segments().next_back()
    }

    /// The path without its last segment.
    /// Returns `None` for the root.
    ///
    /// ```
    /// use fdeploy::path::Path;
    ///
    /// assert_eq!(Path::new("a/b/c").parent(), Some(Path::new("a/b")));
    /// assert_eq!(Path::new("a").parent(), Some(Path::root()));
    /// assert_eq!(Path::root().parent(), None);
    /// ```
    pub fn parent(&self) -> Option<&Path> {
        let mut trimmed = self.inner.trim_end_matches(is_separator);
        while let Some(rest) = trimmed
            .strip_suffix('.')
            .filter(|r| r.is_empty() || r.ends_with(is_separator))
        {
            trimmed = rest.trim_end_matches(is_separator);
        }
        if Path::new(trimmed).is_root() {
            return None;
        }
        match trimmed.rfind(is_separator) {
            Some(idx) => Some(Path::new(&trimmed[..idx])),
            None => Some(Path::root()),
        }
    }

    /// Segment-aware prefix test: `a/b` starts with `a` but `ab` does not.
    /// Every path starts with the root.
    pub fn starts_with<P: AsRef<Path>>(&self, base: P) -> bool {
        let mut me = self.segments();
        base.as_ref()
            .segments()
            .all(|seg| me.next().map(|s| s == seg).unwrap_or(false))
    }

    /// Whether `self` is strictly below `ancestor`.
    pub fn is_descendant_of<P: AsRef<Path>>(&self, ancestor: P) -> bool {
        let ancestor = ancestor.as_ref();
        self.depth() > ancestor.depth() && self.starts_with(ancestor)
    }

    pub fn strip_prefix<P: AsRef<Path>>(&self, base: P) -> Option<PathBuf> {
        let base = base.as_ref();
        if !self.starts_with(base) {
            return None;
        }
        Some(self.segments().skip(base.depth()).collect())
    }

    pub fn join<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        let mut buf = self.to_path_buf();
        buf.push(path);
        buf
    }

    /// Normalized owned copy, with segments joined by `/`.
    pub fn to_path_buf(&self) -> PathBuf {
        self.segments().collect()
    }

    /// The path with `\` separators, as used on the wire by SMB.
    pub fn to_windows_string(&self) -> String {
        self.segments().collect::<Vec<_>>().join("\\")
    }

    /// Maps this path under a local file system directory.
    pub fn to_fs_path(&self, root: &FsPath) -> FsPathBuf {
        let mut fs_path = root.to_path_buf();
        for seg in self.segments() {
            fs_path.push(seg);
        }
        fs_path
    }
}

/// An owned, normalized tree path.
///
/// The inner string never has leading, trailing or repeated separators and
/// only uses `/`.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct PathBuf {
    inner: String,
}

impl PathBuf {
    pub fn new() -> PathBuf {
        PathBuf {
            inner: String::new(),
        }
    }

    pub fn root() -> PathBuf {
        PathBuf::new()
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.inner)
    }

    pub fn into_string(self) -> String {
        self.inner
    }

    pub fn push<P: AsRef<Path>>(&mut self, path: P) {
        for seg in path.as_ref().segments() {
            if !self.inner.is_empty() {
                self.inner.push(SEPARATOR);
            }
            self.inner.push_str(seg);
        }
    }

    pub fn pop(&mut self) -> bool {
        match self.inner.rfind(SEPARATOR) {
            Some(idx) => {
                self.inner.truncate(idx);
                true
            }
            None if !self.inner.is_empty() => {
                self.inner.clear();
                true
            }
            None => false,
        }
    }
}

impl AsRef<str> for Path {
    fn as_ref(&self) -> &str {
        &self.inner
    }
}

impl AsRef<str> for PathBuf {
    fn as_ref(&self) -> &str {
        &self.inner
    }
}

impl AsRef<Path> for Path {
    fn as_ref(&self) -> &Path {
        self
    }
}

impl AsRef<Path> for PathBuf {
    fn as_ref(&self) -> &Path {
        self.as_path()
    }
}

impl AsRef<Path> for str {
    fn as_ref(&self) -> &Path {
        Path::new(self)
    }
}

impl AsRef<Path> for String {
    fn as_ref(&self) -> &Path {
        Path::new(self)
    }
}

impl ops::Deref for PathBuf {
    type Target = Path;
    fn deref(&self) -> &Path {
        self.as_path()
    }
}

impl borrow::Borrow<Path> for PathBuf {
    fn borrow(&self) -> &Path {
        self.as_path()
    }
}

impl ToOwned for Path {
    type Owned = PathBuf;
    fn to_owned(&self) -> PathBuf {
        self.to_path_buf()
    }
}

impl From<String> for PathBuf {
    fn from(s: String) -> PathBuf {
        Path::new(&s).to_path_buf()
    }
}

impl<T: ?Sized + AsRef<str>> From<&T> for PathBuf {
    fn from(s: &T) -> PathBuf {
        Path::new(s.as_ref()).to_path_buf()
    }
}

impl From<PathBuf> for String {
    fn from(path: PathBuf) -> String {
        path.inner
    }
}

impl<'a> FromIterator<&'a str> for PathBuf {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> PathBuf {
        let mut buf = PathBuf::new();
        for seg in iter {
            buf.push(seg);
        }
        buf
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for seg in self.segments() {
            if !first {
                f.write_str(SEPARATOR_STR)?;
            }
            f.write_str(seg)?;
            first = false;
        }
        Ok(())
    }
}

impl fmt::Debug for PathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl fmt::Display for PathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

impl PartialEq for Path {
    #[inline]
    fn eq(&self, other: &Path) -> bool {
        self.segments().eq(other.segments())
    }
}

impl Eq for Path {}

impl hash::Hash for Path {
    fn hash<H: hash::Hasher>(&self, h: &mut H) {
        for seg in self.segments() {
            seg.hash(h);
        }
    }
}

impl PartialOrd for Path {
    #[inline]
    fn partial_cmp(&self, other: &Path) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Path {
    #[inline]
    fn cmp(&self, other: &Path) -> cmp::Ordering {
        self.segments().cmp(other.segments())
    }
}

impl PartialEq for PathBuf {
    #[inline]
    fn eq(&self, other: &PathBuf) -> bool {
        self.as_path() == other.as_path()
    }
}

impl Eq for PathBuf {}

impl hash::Hash for PathBuf {
    fn hash<H: hash::Hasher>(&self, h: &mut H) {
        self.as_path().hash(h)
    }
}

impl PartialOrd for PathBuf {
    #[inline]
    fn partial_cmp(&self, other: &PathBuf) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PathBuf {
    #[inline]
    fn cmp(&self, other: &PathBuf) -> cmp::Ordering {
        self.as_path().cmp(other.as_path())
    }
}

macro_rules! impl_cmp {
    (<$($life:lifetime),*> $lhs:ty, $rhs: ty) => {
        impl<$($life),*> PartialEq<$rhs> for $lhs {
            #[inline]
            fn eq(&self, other: &$rhs) -> bool {
                <Path as PartialEq>::eq(self, other)
            }
        }

        impl<$($life),*> PartialEq<$lhs> for $rhs {
            #[inline]
            fn eq(&self, other: &$lhs) -> bool {
                <Path as PartialEq>::eq(self, other)
            }
        }
    };
}

impl_cmp!(<> PathBuf, Path);
impl_cmp!(<'a> PathBuf, &'a Path);

impl PartialEq<str> for PathBuf {
    #[inline]
    fn eq(&self, other: &str) -> bool {
        self.as_path() == Path::new(other)
    }
}

impl PartialEq<&str> for PathBuf {
    #[inline]
    fn eq(&self, other: &&str) -> bool {
        self.as_path() == Path::new(*other)
    }
}
