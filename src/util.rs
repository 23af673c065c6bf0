use crate::{Path, PathBuf};
use anyhow::Context as _;
use std::fmt;

#[inline]
pub fn canonicalize(path: &Path) -> anyhow::Result<PathBuf> {
    PathBuf::from_path_buf(
        path.canonicalize()
            .with_context(|| format!("unable to canonicalize path '{path}'"))?,
    )
    .map_err(|pb| anyhow::anyhow!("canonicalized path {} is not utf-8", pb.display()))
}

#[derive(Copy, Clone)]
pub enum ProgressTarget {
    Stdout,
    Stderr,
    Hidden,
}

impl From<ProgressTarget> for indicatif::ProgressDrawTarget {
    fn from(pt: ProgressTarget) -> Self {
        match pt {
            ProgressTarget::Stdout => Self::stdout(),
            ProgressTarget::Stderr => Self::stderr(),
            ProgressTarget::Hidden => Self::hidden(),
        }
    }
}

/// Content hash used to address payloads and cache entries
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sha256(pub [u8; 32]);

impl Sha256 {
    pub fn digest(buffer: &[u8]) -> Self {
        use sha2::Digest;

        let mut hasher = sha2::Sha256::new();
        hasher.update(buffer);

        Self(hasher.finalize().into())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First byte in hex, used to shard cache object directories
    #[inline]
    pub fn shard(&self) -> String {
        format!("{:02x}", self.0[0])
    }
}

impl fmt::Debug for Sha256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Sha256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for x in self.0 {
            write!(f, "{x:02x}")?;
        }

        Ok(())
    }
}

#[inline]
fn unhex(c: u8) -> anyhow::Result<u8> {
    Ok(match c {
        b'A'..=b'F' => c - b'A' + 10,
        b'a'..=b'f' => c - b'a' + 10,
        b'0'..=b'9' => c - b'0',
        c => anyhow::bail!("invalid byte {c:#04x} in hex string"),
    })
}

impl std::str::FromStr for Sha256 {
    type Err = anyhow::Error;

    fn from_str(hex_str: &str) -> Result<Self, Self::Err> {
        anyhow::ensure!(
            hex_str.len() == 64,
            "sha256 string length is {} instead of 64",
            hex_str.len()
        );

        let mut digest = [0u8; 32];

        for (ind, chars) in hex_str.as_bytes().chunks(2).enumerate() {
            digest[ind] = unhex(chars[0])? << 4 | unhex(chars[1])?;
        }

        Ok(Self(digest))
    }
}

impl<'de> serde::Deserialize<'de> for Sha256 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        struct Visitor;

        impl serde::de::Visitor<'_> for Visitor {
            type Value = Sha256;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("sha256 string")
            }

            fn visit_str<E>(self, value: &str) -> Result<Sha256, E>
            where
                E: serde::de::Error,
            {
                value.parse().map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_str(Visitor)
    }
}

impl serde::Serialize for Sha256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// An archive or output tree relative path, stored as an ordered sequence of
/// components rather than a separator joined string.
///
/// Accepts both `/` and `\` separated input. Absolute paths, drive prefixes,
/// empty components and `.`/`..` are rejected, so an accepted path can never
/// escape the tree it is joined onto. Case is preserved, comparisons are case
/// sensitive, and [`Self::lower_hash`] provides the case folded key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RelPath {
    comps: Vec<String>,
}

impl RelPath {
    pub fn new() -> Self {
        Self { comps: Vec::new() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.comps.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.comps.is_empty()
    }

    #[inline]
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.comps.iter().map(String::as_str)
    }

    #[inline]
    pub fn get(&self, ind: usize) -> Option<&str> {
        self.comps.get(ind).map(String::as_str)
    }

    /// The trailing component, if any
    #[inline]
    pub fn file_name(&self) -> Option<&str> {
        self.comps.last().map(String::as_str)
    }

    pub fn set_file_name(&mut self, name: impl Into<String>) {
        self.comps.pop();
        self.comps.push(name.into());
    }

    /// The path with its trailing component replaced
    pub fn with_file_name(&self, name: impl Into<String>) -> Self {
        let mut p = self.clone();
        p.set_file_name(name);
        p
    }

    pub fn parent(&self) -> Self {
        let mut comps = self.comps.clone();
        comps.pop();
        Self { comps }
    }

    /// The subpath starting at component `from`
    pub fn tail(&self, from: usize) -> Self {
        Self {
            comps: self.comps[from.min(self.comps.len())..].to_vec(),
        }
    }

    pub fn push(&mut self, comp: impl Into<String>) {
        let comp = comp.into();
        debug_assert!(!comp.is_empty() && !comp.contains(['/', '\\']));
        self.comps.push(comp);
    }

    pub fn join(&self, comp: impl Into<String>) -> Self {
        let mut p = self.clone();
        p.push(comp);
        p
    }

    pub fn append(&mut self, other: &Self) {
        self.comps.extend(other.comps.iter().cloned());
    }

    /// Joins the components onto a real filesystem root, the only point at
    /// which a platform specific separator is introduced
    pub fn to_fs_path(&self, root: &Path) -> PathBuf {
        let mut pb = root.to_owned();
        for comp in &self.comps {
            pb.push(comp);
        }
        pb
    }

    /// xxh64 over the case folded components, used to key paths that must
    /// not collide on case insensitive filesystems
    pub fn lower_hash(&self) -> u64 {
        use std::hash::Hasher;

        let mut hasher = twox_hash::XxHash64::with_seed(0);
        for comp in &self.comps {
            for c in comp.chars().flat_map(char::to_lowercase) {
                let mut buf = [0; 4];
                hasher.write(c.encode_utf8(&mut buf).as_bytes());
            }
            hasher.write_u8(b'/');
        }
        hasher.finish()
    }
}

impl RelPath {
    fn validate(comp: &str) -> anyhow::Result<()> {
        anyhow::ensure!(!comp.is_empty(), "empty path component");
        anyhow::ensure!(
            comp != "." && comp != "..",
            "relative component '{comp}' is not allowed"
        );
        anyhow::ensure!(
            !comp.contains([':', '/', '\\']),
            "component '{comp}' contains a separator or drive prefix"
        );
        Ok(())
    }

    /// Builds a path from pre-split components, applying the same validation
    /// as parsing. An empty sequence is valid and means the tree root.
    pub fn from_components<I>(comps: I) -> anyhow::Result<Self>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut p = Self::new();
        for comp in comps {
            let comp = comp.into();
            Self::validate(&comp)?;
            p.comps.push(comp);
        }
        Ok(p)
    }

    /// [`Self::join`] for untrusted input, rejecting invalid components
    /// instead of asserting
    pub fn join_validated(&self, comp: impl Into<String>) -> anyhow::Result<Self> {
        let comp = comp.into();
        Self::validate(&comp)?;
        let mut p = self.clone();
        p.comps.push(comp);
        Ok(p)
    }
}

impl std::str::FromStr for RelPath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        anyhow::ensure!(!s.is_empty(), "empty path");
        anyhow::ensure!(
            !s.starts_with(['/', '\\']),
            "absolute path '{s}' is not allowed"
        );

        let mut comps = Vec::new();
        for comp in s.split(['/', '\\']) {
            anyhow::ensure!(!comp.is_empty(), "path '{s}' contains an empty component");
            anyhow::ensure!(
                comp != "." && comp != "..",
                "path '{s}' contains a relative component"
            );
            anyhow::ensure!(
                !comp.contains(':'),
                "path '{s}' contains a drive or stream prefix"
            );
            comps.push(comp.to_owned());
        }

        Ok(Self { comps })
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for comp in &self.comps {
            if !first {
                f.write_str("/")?;
            }
            first = false;
            f.write_str(comp)?;
        }

        Ok(())
    }
}

impl fmt::Debug for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl<'de> serde::Deserialize<'de> for RelPath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        struct Visitor;

        impl serde::de::Visitor<'_> for Visitor {
            type Value = RelPath;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("relative path string")
            }

            fn visit_str<E>(self, value: &str) -> Result<RelPath, E>
            where
                E: serde::de::Error,
            {
                value.parse().map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_str(Visitor)
    }
}

impl serde::Serialize for RelPath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sha256_roundtrip() {
        let buffer = [3u8; 11];
        let digest = Sha256::digest(&buffer);

        let hex = digest.to_string();

        assert_eq!(digest, hex.parse::<Sha256>().unwrap());
    }

    #[test]
    fn rejects_bad_hex() {
        assert!("abcd".parse::<Sha256>().is_err());
        assert!("zz".repeat(32).parse::<Sha256>().is_err());
    }

    #[test]
    fn parses_both_separators() {
        let fwd: RelPath = "a/b/c.h".parse().unwrap();
        let bwd: RelPath = "a\\b\\c.h".parse().unwrap();

        assert_eq!(fwd, bwd);
        assert_eq!(fwd.to_string(), "a/b/c.h");
        assert_eq!(fwd.file_name(), Some("c.h"));
        assert_eq!(fwd.len(), 3);
    }

    #[test]
    fn rejects_escapes() {
        assert!("".parse::<RelPath>().is_err());
        assert!("/abs/path".parse::<RelPath>().is_err());
        assert!("\\abs".parse::<RelPath>().is_err());
        assert!("a//b".parse::<RelPath>().is_err());
        assert!("a/../b".parse::<RelPath>().is_err());
        assert!("./a".parse::<RelPath>().is_err());
        assert!("C:\\windows".parse::<RelPath>().is_err());
    }

    #[test]
    fn lower_hash_folds_case() {
        let a: RelPath = "Include/UM/Windows.h".parse().unwrap();
        let b: RelPath = "include/um/windows.h".parse().unwrap();
        let c: RelPath = "include/um/winsock.h".parse().unwrap();

        assert_eq!(a.lower_hash(), b.lower_hash());
        assert_ne!(a.lower_hash(), c.lower_hash());
        assert_ne!(a, b);
    }

    #[test]
    fn fs_join_uses_components() {
        let p: RelPath = "crt/lib/x86_64".parse().unwrap();
        let joined = p.to_fs_path(crate::Path::new("/tmp/out"));
        assert_eq!(joined, crate::PathBuf::from("/tmp/out/crt/lib/x86_64"));
    }
}
