//! Merges extracted package trees into the final case correct output tree.
//!
//! Splatting is planned before a single byte is written: every extracted
//! entry maps to at most one destination, collisions are settled by
//! deterministic precedence, and only then does the plan execute. Name
//! aliases bridging case expectations are emitted as links, never as silent
//! copies.

use crate::{
    catalog::PayloadRecord,
    pipeline::Cancel,
    unpack::FileEntry,
    util::{RelPath, Sha256},
    Arch, Error, PackageKind, Path, PathBuf, PayloadKind,
};
use anyhow::Context as _;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::Write as _;

/// Extracted contents of one payload, ready to splat
pub struct ExtractedPayload {
    pub record: PayloadRecord,
    pub entries: Vec<FileEntry>,
}

/// Extracted contents of one package
pub struct ExtractedPackage {
    pub id: String,
    pub kind: PackageKind,
    pub payloads: Vec<ExtractedPayload>,
}

#[derive(Clone)]
pub struct SplatConfig {
    pub include_debug_libs: bool,
    pub include_debug_symbols: bool,
    /// When false, no links of any kind are attempted and aliases fall back
    /// to copies
    pub enable_symlinks: bool,
    /// Emit `x64` style directory names instead of `x86_64`
    pub preserve_ms_arch_notation: bool,
    pub output: PathBuf,
    /// Optional TOML rules file replacing the built in alias rule set
    pub map: Option<PathBuf>,
    /// Forced link strategy, bypassing filesystem detection
    pub link_strategy: Option<LinkStrategy>,
}

/// Alias table for one section of the tree: file name to the link names
/// emitted next to it
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AliasSection {
    #[serde(default)]
    pub aliases: BTreeMap<String, Vec<String>>,
}

/// SDK libraries additionally get blanket case policies, the static table
/// alone cannot enumerate every library a linker may ask for
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SdkLibRules {
    /// Every library containing uppercase also gets its all lowercase name
    pub lowercase: bool,
    /// Every library also gets its SCREAMING stem with a `.lib` extension
    pub screaming: bool,
    pub aliases: BTreeMap<String, Vec<String>>,
}

impl Default for SdkLibRules {
    fn default() -> Self {
        Self {
            lowercase: true,
            screaming: true,
            aliases: alias_table(&[
                ("kernel32.Lib", &["Kernel32.lib"]),
                ("iphlpapi.lib", &["Iphlpapi.lib"]),
            ]),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CrtRules {
    pub headers: AliasSection,
    pub libs: AliasSection,
}

impl Default for CrtRules {
    fn default() -> Self {
        Self {
            headers: AliasSection::default(),
            // Some crates link with SCREAMING names as if angry at the linker
            libs: AliasSection {
                aliases: alias_table(&[
                    ("libcmt.lib", &["LIBCMT.lib"]),
                    ("msvcrt.lib", &["MSVCRT.lib"]),
                    ("oldnames.lib", &["OLDNAMES.lib"]),
                ]),
            },
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SdkRules {
    pub headers: AliasSection,
    pub libs: SdkLibRules,
}

impl Default for SdkRules {
    fn default() -> Self {
        Self {
            headers: AliasSection {
                aliases: alias_table(&[
                    ("mstcpip.h", &["Mstcpip.h"]),
                    ("basetsd.h", &["BaseTsd.h"]),
                ]),
            },
            libs: SdkLibRules::default(),
        }
    }
}

/// The alias rule set, data rather than logic so deployments can extend or
/// replace it wholesale with `SplatConfig::map`
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SplatRules {
    pub crt: CrtRules,
    pub sdk: SdkRules,
}

fn alias_table(entries: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
    entries
        .iter()
        .map(|(name, aliases)| {
            (
                (*name).to_owned(),
                aliases.iter().map(|a| (*a).to_owned()).collect(),
            )
        })
        .collect()
}

impl SplatRules {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read rules file '{path}'"))?;
        toml::from_str(&contents).with_context(|| format!("unable to parse rules file '{path}'"))
    }
}

/// How links are materialized, detected once per run by probing the output
/// filesystem and degrading symlink, hard link, copy
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkStrategy {
    Symlink,
    HardLink,
    Copy,
}

impl LinkStrategy {
    pub fn detect(root: &Path) -> anyhow::Result<Self> {
        let target = root.join(".winsplat-probe-target");
        let link = root.join(".winsplat-probe-link");
        let _ = std::fs::remove_file(&link);
        let _ = std::fs::remove_file(&target);

        std::fs::write(&target, b"probe")
            .with_context(|| format!("unable to write to output directory '{root}'"))?;

        let strategy = if crate::symlink(".winsplat-probe-target", &link).is_ok() {
            Self::Symlink
        } else if std::fs::hard_link(&target, &link).is_ok() {
            Self::HardLink
        } else {
            Self::Copy
        };

        let _ = std::fs::remove_file(&link);
        let _ = std::fs::remove_file(&target);

        Ok(strategy)
    }

    /// Places `link` next to its target, skipping links that already exist
    /// and are correct. An existing regular file is left alone, it either
    /// already carries the target's bytes or it is not ours to clobber.
    fn emit(
        self,
        target_name: &str,
        target_digest: Sha256,
        target_abs: &Path,
        link_abs: &Path,
    ) -> Result<bool, Error> {
        if let Ok(meta) = std::fs::symlink_metadata(link_abs) {
            if meta.file_type().is_symlink() {
                if let Ok(existing) = std::fs::read_link(link_abs) {
                    if existing.to_str() == Some(target_name) {
                        return Ok(true);
                    }
                }
                std::fs::remove_file(link_abs)
                    .with_context(|| format!("unable to replace stale link '{link_abs}'"))?;
            } else {
                if let Ok(existing) = std::fs::read(link_abs) {
                    if Sha256::digest(&existing) == target_digest {
                        return Ok(true);
                    }
                }
                tracing::debug!(link = %link_abs, "alias collides with existing file, skipping");
                return Ok(false);
            }
        }

        match self {
            Self::Symlink => crate::symlink(target_name, link_abs)?,
            Self::HardLink => std::fs::hard_link(target_abs, link_abs)
                .with_context(|| format!("unable to hard link '{link_abs}'"))?,
            Self::Copy => {
                std::fs::copy(target_abs, link_abs)
                    .with_context(|| format!("unable to copy alias '{link_abs}'"))?;
            }
        }

        Ok(true)
    }
}

impl std::fmt::Display for LinkStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Symlink => "symlink",
            Self::HardLink => "hard-link",
            Self::Copy => "copy",
        })
    }
}

/// Which precedence rule settled a destination claimed by two origins
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictRule {
    IdenticalContent,
    CrtOverSdk,
    ArchSpecific,
}

#[derive(Debug, serde::Serialize)]
pub struct ConflictReport {
    pub destination: RelPath,
    pub winner: String,
    pub loser: String,
    pub rule: ConflictRule,
}

#[derive(Debug, serde::Serialize)]
pub struct LinkReport {
    pub link: RelPath,
    pub target: RelPath,
    /// True for name aliases, false for organizational links such as the
    /// versioned SDK directories
    pub is_alias: bool,
}

#[derive(Debug, serde::Serialize)]
pub struct SplatSummary {
    pub strategy: LinkStrategy,
    /// Aliases degraded to copies because links are unavailable
    pub copy_fallback: bool,
    pub written: usize,
    /// Destinations skipped because identical content was already on disk
    pub unchanged: usize,
    /// Extracted entries no rule mapped into the tree
    pub unmapped: usize,
    /// Debug artifacts dropped by the filters
    pub filtered: usize,
    /// Stale files removed from the output tree
    pub pruned: usize,
    pub conflicts: Vec<ConflictReport>,
    pub links: Vec<LinkReport>,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Section {
    CrtHeader,
    CrtLib,
    SdkHeader,
    SdkLib,
}

struct PlannedFile {
    dest: RelPath,
    contents: bytes::Bytes,
    digest: Sha256,
    executable: bool,
    section: Section,
    package: String,
    payload: String,
    kind: PackageKind,
    arch_specific: bool,
}

impl PlannedFile {
    fn origin(&self) -> String {
        format!("{} ({})", self.package, self.payload)
    }
}

/// Directories under `lib` that narrow the CRT flavor rather than the tree
/// shape, they collapse because a run only ever targets one flavor
const CRT_FLAVOR_DIRS: &[&str] = &["spectre", "onecore", "store", "uwp"];

fn is_version_component(comp: &str) -> bool {
    comp.starts_with(|c: char| c.is_ascii_digit()) && comp.contains('.')
}

fn arch_dir(arch: Arch, preserve_ms: bool) -> &'static str {
    if preserve_ms {
        arch.as_ms_str()
    } else {
        arch.as_str()
    }
}

/// Maps an extracted entry path to its destination in the output tree, or
/// `None` when the entry is packaging noise that has no place there.
///
/// The interesting subtree of every payload starts at an `include` or `lib`
/// anchor component, whatever installer specific prefix precedes it. SDK
/// payloads carry a version directory after the anchor which is dropped,
/// and all lib destinations are `<arch>/<subsystem>` shaped.
fn map_entry(
    kind: PayloadKind,
    arch: Arch,
    preserve_ms: bool,
    path: &RelPath,
) -> Option<(RelPath, Section)> {
    let anchor = path.components().position(|comp| {
        comp.eq_ignore_ascii_case("include") || comp.eq_ignore_ascii_case("lib")
    })?;

    let is_include = path.get(anchor)?.eq_ignore_ascii_case("include");
    let tail = path.tail(anchor + 1);
    if tail.is_empty() {
        return None;
    }

    match (kind.package(), is_include) {
        (PackageKind::Crt, true) => {
            let mut dest: RelPath = "crt/include".parse().ok()?;
            dest.append(&tail);
            Some((dest, Section::CrtHeader))
        }
        (PackageKind::Crt, false) => {
            // lib/{flavor dirs}/<ms arch>/<file>, flavor dirs collapse and
            // entries for other architectures are not ours to place
            let mut saw_arch = false;
            let mut rest = Vec::new();
            for (i, comp) in tail.components().enumerate() {
                let last = i + 1 == tail.len();
                if last {
                    rest.push(comp.to_owned());
                } else if comp.eq_ignore_ascii_case(arch.as_ms_str()) {
                    saw_arch = true;
                } else if !CRT_FLAVOR_DIRS.iter().any(|fd| comp.eq_ignore_ascii_case(fd)) {
                    return None;
                }
            }
            if !saw_arch {
                return None;
            }

            let mut dest: RelPath = "crt/lib".parse().ok()?;
            dest.push(arch_dir(arch, preserve_ms));
            for comp in rest {
                dest.push(comp);
            }
            Some((dest, Section::CrtLib))
        }
        (PackageKind::Sdk, true) => {
            let tail = if tail.get(0).map_or(false, is_version_component) {
                tail.tail(1)
            } else {
                tail
            };
            if tail.is_empty() {
                return None;
            }

            let mut dest: RelPath = "sdk/include".parse().ok()?;
            dest.append(&tail);
            Some((dest, Section::SdkHeader))
        }
        (PackageKind::Sdk, false) => {
            // Lib/<version>/<subsystem>/<ms arch>/<rest>
            let tail = if tail.get(0).map_or(false, is_version_component) {
                tail.tail(1)
            } else {
                tail
            };
            let subsystem = tail.get(0)?.to_owned();
            let arch_comp = tail.get(1)?;
            if !arch_comp.eq_ignore_ascii_case(arch.as_ms_str()) {
                return None;
            }
            let rest = tail.tail(2);
            if rest.is_empty() {
                return None;
            }

            let mut dest: RelPath = "sdk/lib".parse().ok()?;
            dest.push(arch_dir(arch, preserve_ms));
            dest.push(subsystem);
            dest.append(&rest);
            Some((dest, Section::SdkLib))
        }
    }
}

/// The debug lib filter from the days when every `d` suffixed lib doubled
/// the splat size
fn is_debug_lib(file_name: &str) -> bool {
    file_name.strip_suffix(".lib").map_or(false, |stem| {
        stem.ends_with('d')
            || stem.ends_with("d_netcore")
            || stem
                .strip_suffix(|c: char| c.is_ascii_digit())
                .map_or(false, |stem| stem.ends_with('d'))
    })
}

/// Link names the rules attach to a file, excluding the file's own name
fn alias_names(rules: &SplatRules, section: Section, file_name: &str) -> Vec<String> {
    let mut names = Vec::new();

    let table = match section {
        Section::CrtHeader => &rules.crt.headers.aliases,
        Section::CrtLib => &rules.crt.libs.aliases,
        Section::SdkHeader => &rules.sdk.headers.aliases,
        Section::SdkLib => &rules.sdk.libs.aliases,
    };
    if let Some(extra) = table.get(file_name) {
        names.extend(extra.iter().cloned());
    }

    if section == Section::SdkLib {
        let libs = &rules.sdk.libs;
        if libs.lowercase && file_name.contains(|c: char| c.is_ascii_uppercase()) {
            names.push(file_name.to_ascii_lowercase());
        }
        if libs.screaming {
            if let Some((stem, ext)) = file_name.rsplit_once('.') {
                if ext.eq_ignore_ascii_case("lib") {
                    names.push(format!("{}.lib", stem.to_ascii_uppercase()));
                }
            }
        }
    }

    names.sort();
    names.dedup();
    names.retain(|name| name != file_name);
    names
}

struct Plan {
    files: BTreeMap<u64, PlannedFile>,
    conflicts: Vec<ConflictReport>,
    unmapped: usize,
    filtered: usize,
}

fn build_plan(
    config: &SplatConfig,
    arch: Arch,
    mut packages: Vec<ExtractedPackage>,
) -> Result<Plan, Error> {
    // Canonical package order makes conflict resolution independent of the
    // order extraction tasks finished in
    packages.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.id.cmp(&b.id)));

    let mut plan = Plan {
        files: BTreeMap::new(),
        conflicts: Vec::new(),
        unmapped: 0,
        filtered: 0,
    };

    for pkg in packages {
        for pf in pkg.payloads {
            let arch_specific = pf.record.arch.is_some();
            let kind = pf.record.kind;

            for entry in pf.entries {
                let Some(file_name) = entry.path.file_name() else {
                    continue;
                };

                if !config.include_debug_symbols && file_name.ends_with(".pdb") {
                    tracing::debug!(entry = %entry.path, "skipping debug symbols");
                    plan.filtered += 1;
                    continue;
                }
                if !config.include_debug_libs
                    && matches!(kind, PayloadKind::CrtLibs | PayloadKind::UcrtHeadersLibs)
                    && is_debug_lib(file_name)
                {
                    tracing::debug!(entry = %entry.path, "skipping debug lib");
                    plan.filtered += 1;
                    continue;
                }

                let Some((dest, section)) =
                    map_entry(kind, arch, config.preserve_ms_arch_notation, &entry.path)
                else {
                    tracing::debug!(entry = %entry.path, "no destination for entry");
                    plan.unmapped += 1;
                    continue;
                };

                let planned = PlannedFile {
                    digest: entry.digest(),
                    dest,
                    contents: entry.contents,
                    executable: entry.attributes.executable,
                    section,
                    package: pkg.id.clone(),
                    payload: pf.record.file_name.clone(),
                    kind: pkg.kind,
                    arch_specific,
                };

                insert_planned(&mut plan, planned)?;
            }
        }
    }

    Ok(plan)
}

fn insert_planned(plan: &mut Plan, planned: PlannedFile) -> Result<(), Error> {
    use std::collections::btree_map::Entry;

    match plan.files.entry(planned.dest.lower_hash()) {
        Entry::Vacant(vacant) => {
            vacant.insert(planned);
        }
        Entry::Occupied(mut occupied) => {
            let existing = occupied.get();

            if existing.digest == planned.digest {
                // Byte identical means no conflict, the first writer keeps
                // the stored case
                if existing.package != planned.package {
                    plan.conflicts.push(ConflictReport {
                        destination: existing.dest.clone(),
                        winner: existing.origin(),
                        loser: planned.origin(),
                        rule: ConflictRule::IdenticalContent,
                    });
                }
                return Ok(());
            }

            let (planned_wins, rule) = if existing.kind != planned.kind {
                // The SDK never overrides the CRT
                (planned.kind == PackageKind::Crt, ConflictRule::CrtOverSdk)
            } else if existing.arch_specific != planned.arch_specific {
                (planned.arch_specific, ConflictRule::ArchSpecific)
            } else {
                return Err(Error::UnresolvedConflict {
                    destination: existing.dest.clone(),
                    first: existing.origin(),
                    second: planned.origin(),
                });
            };

            let report = if planned_wins {
                let loser = occupied.insert(planned);
                let winner = occupied.get();
                ConflictReport {
                    destination: winner.dest.clone(),
                    winner: winner.origin(),
                    loser: loser.origin(),
                    rule,
                }
            } else {
                ConflictReport {
                    destination: existing.dest.clone(),
                    winner: existing.origin(),
                    loser: planned.origin(),
                    rule,
                }
            };

            tracing::debug!(
                destination = %report.destination,
                winner = %report.winner,
                loser = %report.loser,
                "resolved splat conflict",
            );
            plan.conflicts.push(report);
        }
    }

    Ok(())
}

fn write_planned(root: &Path, pf: &PlannedFile) -> Result<bool, Error> {
    let dest = pf.dest.to_fs_path(root);

    if let Ok(existing) = std::fs::read(&dest) {
        if Sha256::digest(&existing) == pf.digest {
            tracing::debug!(dest = %dest, "content already present");
            return Ok(false);
        }
    }

    let dir = dest
        .parent()
        .with_context(|| format!("destination '{dest}' has no parent"))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("unable to create temp file in '{dir}'"))?;
    tmp.write_all(&pf.contents)
        .with_context(|| format!("unable to write '{dest}'"))?;
    tmp.persist(&dest)
        .with_context(|| format!("unable to publish '{dest}'"))?;

    #[cfg(unix)]
    if pf.executable {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("unable to mark '{dest}' executable"))?;
    }

    Ok(true)
}

/// The include scan key of a header: its path relative to the directory an
/// `#include` resolves against, crt/include for the CRT and the subsystem
/// root for the SDK
fn include_rel(pf: &PlannedFile) -> Option<RelPath> {
    match pf.section {
        Section::CrtHeader => Some(pf.dest.tail(2)),
        Section::SdkHeader => Some(pf.dest.tail(3)),
        _ => None,
    }
}

/// Scans splatted header contents for `#include` references and returns the
/// alias links that make case mismatched references resolve, the static
/// tables cannot enumerate what the SDK's own headers get wrong
fn include_scan_links(plan: &BTreeMap<u64, PlannedFile>) -> Vec<(u64, String)> {
    let regex = regex::bytes::Regex::new(r#"#include\s+(?:"|<)([^">]+)(?:"|>)?"#).unwrap();
    let finder = memchr::memmem::Finder::new(b"#include");

    // Case folded key of every SDK header, the scan only links into the SDK.
    // Subsystems can ship the same header name, the first in key order wins
    let mut sdk_headers = BTreeMap::new();
    for (key, pf) in plan {
        if pf.section != Section::SdkHeader {
            continue;
        }
        let Some(rel) = include_rel(pf) else {
            continue;
        };
        if let Some((kept_key, _)) = sdk_headers.get(&rel.lower_hash()) {
            if plan[kept_key].digest != pf.digest {
                tracing::warn!(
                    kept = %plan[kept_key].dest,
                    skipped = %pf.dest,
                    "2 headers with the same include path have differing contents",
                );
            }
        } else {
            sdk_headers.insert(rel.lower_hash(), (*key, rel));
        }
    }

    let headers: Vec<_> = plan
        .values()
        .filter(|pf| matches!(pf.section, Section::CrtHeader | Section::SdkHeader))
        .collect();

    let (tx, rx) = crossbeam_channel::unbounded::<RelPath>();
    headers.into_par_iter().for_each_with(tx, |tx, pf| {
        if finder.find(&pf.contents).is_none() {
            return;
        }

        for caps in regex.captures_iter(&pf.contents) {
            let Ok(reference) = std::str::from_utf8(&caps[1]) else {
                continue;
            };
            if let Ok(rel) = reference.parse::<RelPath>() {
                let _ = tx.send(rel);
            }
        }
    });

    let mut referenced: BTreeSet<RelPath> = rx.iter().collect();

    // Headers commonly included by their lowercase name from outside even
    // when nothing inside the SDK does, gl being the one lowercase island
    for (_, rel) in sdk_headers.values() {
        if rel.get(0) != Some("gl")
            && rel
                .components()
                .any(|c| c.contains(|ch: char| ch.is_ascii_uppercase()))
        {
            if let Ok(lower) = rel.to_string().to_ascii_lowercase().parse() {
                referenced.insert(lower);
            }
        }
    }

    let mut links = Vec::new();
    for reference in referenced {
        let Some((plan_key, rel)) = sdk_headers.get(&reference.lower_hash()) else {
            continue;
        };
        let (Some(actual_name), Some(ref_name)) = (rel.file_name(), reference.file_name()) else {
            continue;
        };
        if actual_name != ref_name {
            links.push((*plan_key, ref_name.to_owned()));
        }
    }

    links.sort();
    links.dedup();
    links
}

/// Splats every package into the output tree and reports what happened.
///
/// Repeated runs over the same inputs write nothing, existing identical
/// content is recognized by digest and left untouched while anything else
/// in the tree is pruned.
pub fn splat(
    config: &SplatConfig,
    arch: Arch,
    sdk_version: &str,
    packages: Vec<ExtractedPackage>,
    cancel: &Cancel,
    progress: &indicatif::ProgressBar,
) -> Result<SplatSummary, Error> {
    let rules = match &config.map {
        Some(path) => SplatRules::load(path)?,
        None => SplatRules::default(),
    };

    if !config.output.exists() {
        std::fs::create_dir_all(&config.output)
            .with_context(|| format!("unable to create output directory {}", config.output))?;
    }
    let root = crate::util::canonicalize(&config.output)?;

    let plan = build_plan(config, arch, packages)?;

    let strategy = match config.link_strategy {
        Some(strategy) => strategy,
        None if !config.enable_symlinks => LinkStrategy::Copy,
        None => LinkStrategy::detect(&root)?,
    };
    let copy_fallback = strategy == LinkStrategy::Copy && config.enable_symlinks;
    if copy_fallback {
        tracing::warn!(
            output = %root,
            "filesystem does not support links, aliases will be full copies",
        );
    }

    progress.reset();
    progress.set_length(plan.files.values().map(|pf| pf.contents.len() as u64).sum());

    // All destination directories exist before the parallel writes start
    let dirs: BTreeSet<_> = plan
        .files
        .values()
        .map(|pf| pf.dest.parent().to_fs_path(&root))
        .collect();
    for dir in dirs {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("unable to create directory {dir}"))?;
    }

    let outcomes: Vec<Result<bool, Error>> = plan
        .files
        .values()
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|pf| {
            cancel.check()?;
            let wrote = write_planned(&root, pf)?;
            progress.inc(pf.contents.len() as u64);
            Ok(wrote)
        })
        .collect();

    let mut written = 0;
    let mut unchanged = 0;
    for outcome in outcomes {
        if outcome? {
            written += 1;
        } else {
            unchanged += 1;
        }
    }

    // Aliases after content so every link target exists
    let mut links = Vec::new();
    let mut expected: HashSet<std::path::PathBuf> = plan
        .files
        .values()
        .map(|pf| pf.dest.to_fs_path(&root).into_std_path_buf())
        .collect();

    let mut emit_alias = |pf: &PlannedFile, alias: String| -> Result<(), Error> {
        let link_rel = pf.dest.with_file_name(alias);

        // An alias may not shadow a planned file
        if plan
            .files
            .get(&link_rel.lower_hash())
            .map_or(false, |other| other.dest == link_rel)
        {
            tracing::debug!(link = %link_rel, "alias name is a planned file, skipping");
            return Ok(());
        }

        let target_name = pf.dest.file_name().unwrap_or_default().to_owned();
        let link_abs = link_rel.to_fs_path(&root);
        let target_abs = pf.dest.to_fs_path(&root);

        if strategy.emit(&target_name, pf.digest, &target_abs, &link_abs)? {
            expected.insert(link_abs.into_std_path_buf());
            links.push(LinkReport {
                link: link_rel,
                target: pf.dest.clone(),
                is_alias: true,
            });
        }
        Ok(())
    };

    for pf in plan.files.values() {
        let Some(file_name) = pf.dest.file_name() else {
            continue;
        };
        for alias in alias_names(&rules, pf.section, file_name) {
            emit_alias(pf, alias)?;
        }
    }

    if config.enable_symlinks {
        for (plan_key, alias) in include_scan_links(&plan.files) {
            if let Some(pf) = plan.files.get(&plan_key) {
                emit_alias(pf, alias)?;
            }
        }
    }

    // Versioned and title case directory links let MSVC style tooling
    // resolve the tree without knowing the layout, symlinks only
    if strategy == LinkStrategy::Symlink {
        let dir_links = [
            ("sdk/include", sdk_version, "."),
            ("sdk/lib", sdk_version, "."),
            ("sdk", "Include", "include"),
            ("sdk", "Lib", "lib"),
            // The SDK ships um/gl, its consumers include <GL/gl.h>
            ("sdk/include/um", "GL", "gl"),
        ];

        for (parent, name, target) in dir_links {
            let parent_rel: RelPath = parent.parse().map_err(Error::Other)?;
            let link_rel = parent_rel.join(name);
            let link_abs = link_rel.to_fs_path(&root);

            let present = std::fs::symlink_metadata(&link_abs).is_ok()
                || crate::symlink(target, &link_abs).is_ok();
            if present {
                expected.insert(link_abs.into_std_path_buf());
                links.push(LinkReport {
                    link: link_rel,
                    target: parent_rel.join(target),
                    is_alias: false,
                });
            }
        }
    }

    let pruned = prune_stale(&root, &expected)?;

    links.sort_by(|a, b| a.link.cmp(&b.link));

    Ok(SplatSummary {
        strategy,
        copy_fallback,
        written,
        unchanged,
        unmapped: plan.unmapped,
        filtered: plan.filtered,
        pruned,
        conflicts: plan.conflicts,
        links,
    })
}

/// Removes files the current plan does not account for, so reruns converge
/// on exactly the planned tree. The pipeline's sentinel is not ours to
/// remove and directories turned empty are swept afterwards.
fn prune_stale(root: &Path, expected: &HashSet<std::path::PathBuf>) -> Result<usize, Error> {
    let mut pruned = 0;

    for entry in walkdir::WalkDir::new(root).contents_first(true) {
        let entry = entry.map_err(|e| Error::Other(anyhow::Error::new(e)))?;

        if entry.file_name().to_str() == Some(crate::pipeline::SENTINEL) {
            continue;
        }

        let ft = entry.file_type();
        if ft.is_dir() {
            if entry.path() != root.as_std_path()
                && std::fs::read_dir(entry.path()).map_or(false, |mut it| it.next().is_none())
            {
                std::fs::remove_dir(entry.path())
                    .with_context(|| format!("unable to remove empty directory {}", entry.path().display()))?;
            }
            continue;
        }

        if !expected.contains(entry.path()) {
            tracing::debug!(path = %entry.path().display(), "pruning stale file");
            std::fs::remove_file(entry.path())
                .with_context(|| format!("unable to prune {}", entry.path().display()))?;
            pruned += 1;
        }
    }

    Ok(pruned)
}
