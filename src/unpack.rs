//! Decodes payload containers into a lazy stream of file entries.
//!
//! Three container families cover every payload in the catalog: VSIX (zip)
//! for the CRT, MSI for the SDK, and CAB both standalone and referenced from
//! an MSI's media table. Content verification already happened at fetch
//! time, this module only cares about container structure, and any
//! structural violation surfaces as [`Error::CorruptArchive`].

use crate::{
    util::{RelPath, Sha256},
    Error,
};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::Read as _;

#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveFormat {
    /// VSIX package, a zip with a `Contents/` payload tree
    Vsix,
    /// MSI installer whose actual contents live in embedded or sibling cabinets
    Msi,
    /// Plain cabinet
    Cab,
}

impl ArchiveFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vsix => "vsix",
            Self::Msi => "msi",
            Self::Cab => "cab",
        }
    }
}

impl std::fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared attributes carried through to the output tree. Windows archives
/// rarely declare anything useful, zip entries may carry a unix mode.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct FileAttributes {
    pub executable: bool,
}

/// A single extracted file, transient between extraction and splatting
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: RelPath,
    pub contents: Bytes,
    pub attributes: FileAttributes,
}

impl FileEntry {
    #[inline]
    pub fn digest(&self) -> Sha256 {
        Sha256::digest(&self.contents)
    }
}

/// Verified bytes of the other payloads of the same package, keyed by
/// case folded base name. MSI media tables reference external cabinets this
/// way, and the per package fetch join guarantees they are all present
/// before extraction starts.
#[derive(Default)]
pub struct SiblingPayloads {
    inner: BTreeMap<String, Bytes>,
}

impl SiblingPayloads {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn normalize(file_name: &str) -> String {
        file_name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(file_name)
            .to_lowercase()
    }

    pub fn insert(&mut self, file_name: &str, contents: Bytes) {
        self.inner.insert(Self::normalize(file_name), contents);
    }

    pub fn get(&self, cabinet: &str) -> Option<Bytes> {
        self.inner.get(&Self::normalize(cabinet)).cloned()
    }
}

struct CabSource {
    /// Cabinet identity for diagnostics, either the payload name or the
    /// media table entry
    name: String,
    cabinet: cab::Cabinet<std::io::Cursor<Bytes>>,
    members: std::vec::IntoIter<String>,
}

enum Inner {
    Vsix {
        archive: zip::ZipArchive<std::io::Cursor<Bytes>>,
        index: usize,
    },
    Cabs {
        /// Cabinet member name to declared install path, empty for plain
        /// cabinets whose member names are the paths
        file_map: BTreeMap<String, RelPath>,
        sources: Vec<CabSource>,
        current: usize,
    },
}

/// Lazy iterator over a payload's files. Construction reads only container
/// metadata, entry contents are decompressed one at a time as the iterator
/// is driven.
pub struct Extracted {
    payload: String,
    inner: Inner,
}

fn corrupt(payload: &str, reason: impl std::fmt::Display) -> Error {
    Error::CorruptArchive {
        payload: payload.to_owned(),
        reason: reason.to_string(),
    }
}

fn open_cab(payload: &str, name: &str, contents: Bytes) -> Result<CabSource, Error> {
    let cabinet = cab::Cabinet::new(std::io::Cursor::new(contents))
        .map_err(|e| corrupt(payload, format_args!("cabinet '{name}': {e}")))?;

    let mut members = Vec::new();
    for folder in cabinet.folder_entries() {
        for file in folder.file_entries() {
            members.push(file.name().to_owned());
        }
    }

    Ok(CabSource {
        name: name.to_owned(),
        cabinet,
        members: members.into_iter(),
    })
}

/// Decodes one payload into its file entries.
///
/// `payload_name` is only used to identify the archive in errors, `siblings`
/// resolves external cabinets referenced by MSI media tables.
pub fn extract(
    payload_name: &str,
    format: ArchiveFormat,
    contents: Bytes,
    siblings: &SiblingPayloads,
) -> Result<Extracted, Error> {
    let inner = match format {
        ArchiveFormat::Vsix => {
            let archive = zip::ZipArchive::new(std::io::Cursor::new(contents))
                .map_err(|e| corrupt(payload_name, e))?;

            Inner::Vsix { archive, index: 0 }
        }
        ArchiveFormat::Cab => Inner::Cabs {
            file_map: BTreeMap::new(),
            sources: vec![open_cab(payload_name, payload_name, contents)?],
            current: 0,
        },
        ArchiveFormat::Msi => {
            let (file_map, sources) = index_msi(payload_name, contents, siblings)?;
            Inner::Cabs {
                file_map,
                sources,
                current: 0,
            }
        }
    };

    Ok(Extracted {
        payload: payload_name.to_owned(),
        inner,
    })
}

/// Reads the Directory, Component, File and Media tables of an MSI and
/// materializes its cabinets.
///
/// Cabinet members are named by File table key, the install path of a key
/// comes from walking the Directory parent chain of its component. A media
/// cabinet prefixed with `#` is an embedded stream of the MSI itself, any
/// other name refers to a sibling payload.
fn index_msi(
    payload: &str,
    contents: Bytes,
    siblings: &SiblingPayloads,
) -> Result<(BTreeMap<String, RelPath>, Vec<CabSource>), Error> {
    let mut pkg =
        msi::Package::open(std::io::Cursor::new(contents)).map_err(|e| corrupt(payload, e))?;

    for table in ["Directory", "Component", "File", "Media"] {
        if !pkg.has_table(table) {
            return Err(corrupt(payload, format_args!("missing {table} table")));
        }
    }

    // Directory key -> (parent key, long name)
    let mut dirs = BTreeMap::new();
    for row in pkg
        .select_rows(msi::Select::table("Directory"))
        .map_err(|e| corrupt(payload, e))?
    {
        if row.len() < 3 {
            return Err(corrupt(payload, "malformed Directory row"));
        }
        let Some(key) = row[0].as_str() else {
            return Err(corrupt(payload, "Directory row without a key"));
        };
        let parent = row[1].as_str().map(str::to_owned);
        // DefaultDir is a `short|long` pair, the long half is authoritative
        let name = row[2]
            .as_str()
            .and_then(|dd| dd.split('|').last())
            .unwrap_or(".")
            .to_owned();

        dirs.insert(key.to_owned(), (parent, name));
    }

    // Component key -> directory key
    let mut components = BTreeMap::new();
    for row in pkg
        .select_rows(msi::Select::table("Component"))
        .map_err(|e| corrupt(payload, e))?
    {
        if row.len() < 3 {
            return Err(corrupt(payload, "malformed Component row"));
        }
        if let (Some(key), Some(dir)) = (row[0].as_str(), row[2].as_str()) {
            components.insert(key.to_owned(), dir.to_owned());
        }
    }

    // File key -> full install path
    let mut file_map = BTreeMap::new();
    for row in pkg
        .select_rows(msi::Select::table("File"))
        .map_err(|e| corrupt(payload, e))?
    {
        if row.len() < 3 {
            return Err(corrupt(payload, "malformed File row"));
        }
        let (Some(key), Some(component), Some(file_name)) =
            (row[0].as_str(), row[1].as_str(), row[2].as_str())
        else {
            return Err(corrupt(payload, "File row with null identity"));
        };

        let dir_key = components.get(component).ok_or_else(|| {
            corrupt(
                payload,
                format_args!("file '{key}' references unknown component '{component}'"),
            )
        })?;

        let dir = directory_path(payload, &dirs, dir_key)?;
        let long_name = file_name.split('|').last().unwrap_or(file_name);
        let path = dir
            .join_validated(long_name)
            .map_err(|e| corrupt(payload, e))?;

        file_map.insert(key.to_owned(), path);
    }

    // Columns: [DiskId, LastSequence, DiskPrompt, Cabinet, VolumeLabel, Source]
    let mut cabinets = Vec::new();
    for row in pkg
        .select_rows(msi::Select::table("Media"))
        .map_err(|e| corrupt(payload, e))?
    {
        if row.len() < 4 {
            return Err(corrupt(payload, "malformed Media row"));
        }
        // A null cabinet marks media without files, which is fine
        let Some(cabinet) = row[3].as_str() else {
            continue;
        };
        let cabinet = cabinet.trim_matches('"');
        if !cabinet.is_empty() {
            cabinets.push(cabinet.to_owned());
        }
    }

    // read_stream needs the package again, so the Media rows are drained first
    let mut sources = Vec::new();
    for cabinet in &cabinets {
        let contents = if let Some(stream) = cabinet.strip_prefix('#') {
            let mut reader = pkg
                .read_stream(stream)
                .map_err(|e| corrupt(payload, format_args!("embedded cabinet '{stream}': {e}")))?;
            let mut buf = Vec::new();
            reader
                .read_to_end(&mut buf)
                .map_err(|e| corrupt(payload, format_args!("embedded cabinet '{stream}': {e}")))?;
            Bytes::from(buf)
        } else {
            siblings.get(cabinet).ok_or_else(|| {
                corrupt(
                    payload,
                    format_args!("external cabinet '{cabinet}' is not among the package payloads"),
                )
            })?
        };

        sources.push(open_cab(payload, cabinet, contents)?);
    }

    Ok((file_map, sources))
}

fn directory_path(
    payload: &str,
    dirs: &BTreeMap<String, (Option<String>, String)>,
    key: &str,
) -> Result<RelPath, Error> {
    let mut comps = Vec::new();
    let mut cursor = key;
    let mut depth = 0u32;

    while let Some((parent, name)) = dirs.get(cursor) {
        depth += 1;
        if depth > 64 {
            return Err(corrupt(payload, "Directory table parent cycle"));
        }

        if cursor != "TARGETDIR" && name != "." && name != "SourceDir" {
            comps.push(name.clone());
        }

        match parent {
            Some(p) if p != cursor => cursor = p,
            _ => break,
        }
    }

    comps.reverse();
    RelPath::from_components(comps).map_err(|e| corrupt(payload, e))
}

impl Iterator for Extracted {
    type Item = Result<FileEntry, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            Inner::Vsix { archive, index } => loop {
                if *index >= archive.len() {
                    return None;
                }

                let i = *index;
                *index += 1;

                let mut file = match archive.by_index(i) {
                    Ok(file) => file,
                    Err(e) => return Some(Err(corrupt(&self.payload, e))),
                };

                if file.is_dir() {
                    continue;
                }

                let path: RelPath = match file.name().parse() {
                    Ok(path) => path,
                    Err(e) => return Some(Err(corrupt(&self.payload, e))),
                };

                let mut contents = Vec::with_capacity(file.size() as usize);
                if let Err(e) = file.read_to_end(&mut contents) {
                    return Some(Err(corrupt(&self.payload, e)));
                }

                let attributes = FileAttributes {
                    executable: file.unix_mode().map_or(false, |mode| mode & 0o111 != 0),
                };

                return Some(Ok(FileEntry {
                    path,
                    contents: contents.into(),
                    attributes,
                }));
            },
            Inner::Cabs {
                file_map,
                sources,
                current,
            } => loop {
                let source = sources.get_mut(*current)?;

                let Some(member) = source.members.next() else {
                    *current += 1;
                    continue;
                };

                // Members of MSI cabinets are File table keys, loose members
                // keep their literal name
                let path = match file_map.get(&member) {
                    Some(path) => path.clone(),
                    None => match member.parse() {
                        Ok(path) => path,
                        Err(e) => return Some(Err(corrupt(&self.payload, e))),
                    },
                };

                let mut contents = Vec::new();
                let read = source
                    .cabinet
                    .read_file(&member)
                    .and_then(|mut reader| reader.read_to_end(&mut contents));
                if let Err(e) = read {
                    let name = &source.name;
                    return Some(Err(corrupt(
                        &self.payload,
                        format_args!("cabinet '{name}' member '{member}': {e}"),
                    )));
                }

                return Some(Ok(FileEntry {
                    path,
                    contents: contents.into(),
                    attributes: FileAttributes::default(),
                }));
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write as _;

    fn build_zip(entries: &[(&str, &[u8], Option<u32>)]) -> Bytes {
        let mut zw = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));

        for (name, contents, mode) in entries {
            let mut opts = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            if let Some(mode) = mode {
                opts = opts.unix_permissions(*mode);
            }
            zw.start_file(*name, opts).unwrap();
            zw.write_all(contents).unwrap();
        }

        zw.finish().unwrap().into_inner().into()
    }

    fn build_cab(entries: &[(&str, &[u8])]) -> Bytes {
        let mut builder = cab::CabinetBuilder::new();
        let folder = builder.add_folder(cab::CompressionType::MsZip);
        for (name, _) in entries {
            folder.add_file(name.to_string());
        }

        let mut writer = builder.build(std::io::Cursor::new(Vec::new())).unwrap();
        while let Some(mut file) = writer.next_file().unwrap() {
            let contents = entries
                .iter()
                .find(|(name, _)| *name == file.file_name())
                .map(|(_, contents)| *contents)
                .unwrap();
            file.write_all(contents).unwrap();
        }

        writer.finish().unwrap().into_inner().into()
    }

    fn drain(extracted: Extracted) -> Vec<FileEntry> {
        extracted.map(|entry| entry.unwrap()).collect()
    }

    #[test]
    fn vsix_entries() {
        let contents = build_zip(&[
            ("Contents/include/stdio.h", b"stdio", None),
            ("Contents/bin/tool", b"tool", Some(0o755)),
        ]);

        let entries = drain(
            extract(
                "crt.vsix",
                ArchiveFormat::Vsix,
                contents,
                &SiblingPayloads::new(),
            )
            .unwrap(),
        );

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path.to_string(), "Contents/include/stdio.h");
        assert_eq!(entries[0].contents.as_ref(), b"stdio");
        assert!(!entries[0].attributes.executable);
        assert!(entries[1].attributes.executable);
    }

    #[test]
    fn vsix_rejects_escaping_entries() {
        let contents = build_zip(&[("../evil.h", b"evil", None)]);

        let mut extracted = extract(
            "crt.vsix",
            ArchiveFormat::Vsix,
            contents,
            &SiblingPayloads::new(),
        )
        .unwrap();

        match extracted.next() {
            Some(Err(Error::CorruptArchive { payload, .. })) => assert_eq!(payload, "crt.vsix"),
            other => panic!("expected CorruptArchive, got {other:?}"),
        }
    }

    #[test]
    fn garbage_is_corrupt() {
        let garbage = Bytes::from_static(b"not an archive at all");

        for format in [ArchiveFormat::Vsix, ArchiveFormat::Msi, ArchiveFormat::Cab] {
            match extract("pl.bin", format, garbage.clone(), &SiblingPayloads::new()) {
                Err(Error::CorruptArchive { payload, .. }) => assert_eq!(payload, "pl.bin"),
                other => panic!("{format}: expected CorruptArchive, got ok={:?}", other.is_ok()),
            }
        }
    }

    #[test]
    fn cab_members_keep_their_paths() {
        let contents = build_cab(&[
            ("include\\um\\windows.h", b"windows"),
            ("readme.txt", b"readme"),
        ]);

        let entries = drain(
            extract(
                "sdk.cab",
                ArchiveFormat::Cab,
                contents,
                &SiblingPayloads::new(),
            )
            .unwrap(),
        );

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path.to_string(), "include/um/windows.h");
        assert_eq!(entries[1].path.to_string(), "readme.txt");
        assert_eq!(entries[0].contents.as_ref(), b"windows");
    }

    #[test]
    fn cab_folders_all_contribute_members() {
        let mut builder = cab::CabinetBuilder::new();
        builder
            .add_folder(cab::CompressionType::MsZip)
            .add_file("first.h".to_string());
        builder
            .add_folder(cab::CompressionType::MsZip)
            .add_file("second.h".to_string());

        let mut writer = builder.build(std::io::Cursor::new(Vec::new())).unwrap();
        while let Some(mut file) = writer.next_file().unwrap() {
            let contents: &[u8] = if file.file_name() == "first.h" {
                b"first"
            } else {
                b"second"
            };
            file.write_all(contents).unwrap();
        }
        let bytes: Bytes = writer.finish().unwrap().into_inner().into();

        let entries = drain(
            extract("sdk.cab", ArchiveFormat::Cab, bytes, &SiblingPayloads::new()).unwrap(),
        );

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path.to_string(), "first.h");
        assert_eq!(entries[1].path.to_string(), "second.h");
        assert_eq!(entries[1].contents.as_ref(), b"second");
    }

    fn msi_scaffold() -> msi::Package<std::io::Cursor<Vec<u8>>> {
        let cursor = std::io::Cursor::new(Vec::new());
        let mut pkg = msi::Package::create(msi::PackageType::Installer, cursor).unwrap();

        pkg.create_table(
            "Directory",
            vec![
                msi::Column::build("Directory").primary_key().id_string(72),
                msi::Column::build("Directory_Parent")
                    .nullable()
                    .id_string(72),
                msi::Column::build("DefaultDir").string(255),
            ],
        )
        .unwrap();
        pkg.insert_rows(
            msi::Insert::into("Directory")
                .row(vec![
                    msi::Value::from("TARGETDIR"),
                    msi::Value::Null,
                    msi::Value::from("SourceDir"),
                ])
                .row(vec![
                    msi::Value::from("IncludeDir"),
                    msi::Value::from("TARGETDIR"),
                    msi::Value::from("include"),
                ])
                .row(vec![
                    msi::Value::from("UmDir"),
                    msi::Value::from("IncludeDir"),
                    msi::Value::from("um|um"),
                ]),
        )
        .unwrap();

        pkg.create_table(
            "Component",
            vec![
                msi::Column::build("Component").primary_key().id_string(72),
                msi::Column::build("ComponentId").nullable().string(38),
                msi::Column::build("Directory_").id_string(72),
            ],
        )
        .unwrap();
        pkg.insert_rows(msi::Insert::into("Component").row(vec![
            msi::Value::from("UmComponent"),
            msi::Value::Null,
            msi::Value::from("UmDir"),
        ]))
        .unwrap();

        pkg.create_table(
            "File",
            vec![
                msi::Column::build("File").primary_key().id_string(72),
                msi::Column::build("Component_").id_string(72),
                msi::Column::build("FileName").string(255),
            ],
        )
        .unwrap();
        pkg.insert_rows(
            msi::Insert::into("File")
                .row(vec![
                    msi::Value::from("filWinsock"),
                    msi::Value::from("UmComponent"),
                    msi::Value::from("w1nsck|winsock2.h"),
                ])
                .row(vec![
                    msi::Value::from("filWindows"),
                    msi::Value::from("UmComponent"),
                    msi::Value::from("windows.h"),
                ]),
        )
        .unwrap();

        pkg.create_table(
            "Media",
            vec![
                msi::Column::build("DiskId").primary_key().int16(),
                msi::Column::build("LastSequence").int32(),
                msi::Column::build("DiskPrompt").nullable().string(64),
                msi::Column::build("Cabinet").nullable().string(255),
            ],
        )
        .unwrap();

        pkg
    }

    fn build_msi(embed: bool) -> (Bytes, SiblingPayloads) {
        let mut pkg = msi_scaffold();

        let cabinet_name = if embed { "#payload.cab" } else { "payload.cab" };
        pkg.insert_rows(
            msi::Insert::into("Media")
                .row(vec![
                    msi::Value::Int(0),
                    msi::Value::Int(0),
                    msi::Value::Null,
                    msi::Value::Null,
                ])
                .row(vec![
                    msi::Value::Int(1),
                    msi::Value::Int(2),
                    msi::Value::Null,
                    msi::Value::from(cabinet_name),
                ]),
        )
        .unwrap();

        let cab_bytes = build_cab(&[
            ("filWinsock", b"winsock contents"),
            ("filWindows", b"windows contents"),
        ]);

        let mut siblings = SiblingPayloads::new();
        if embed {
            let mut stream = pkg.write_stream("payload.cab").unwrap();
            stream.write_all(&cab_bytes).unwrap();
            drop(stream);
        } else {
            siblings.insert("Installers\\payload.cab", cab_bytes);
        }

        let bytes = pkg.into_inner().unwrap().into_inner().into();
        (bytes, siblings)
    }

    #[test]
    fn msi_maps_file_keys_through_directories() {
        for embed in [false, true] {
            let (bytes, siblings) = build_msi(embed);

            let mut entries =
                drain(extract("sdk.msi", ArchiveFormat::Msi, bytes, &siblings).unwrap());
            entries.sort_by(|a, b| a.path.cmp(&b.path));

            assert_eq!(entries.len(), 2, "embed={embed}");
            assert_eq!(entries[0].path.to_string(), "include/um/windows.h");
            assert_eq!(entries[1].path.to_string(), "include/um/winsock2.h");
            assert_eq!(entries[1].contents.as_ref(), b"winsock contents");
        }
    }

    #[test]
    fn msi_media_spanning_multiple_cabinets() {
        let mut pkg = msi_scaffold();
        pkg.insert_rows(
            msi::Insert::into("Media")
                .row(vec![
                    msi::Value::Int(1),
                    msi::Value::Int(1),
                    msi::Value::Null,
                    msi::Value::from("#disk1.cab"),
                ])
                .row(vec![
                    msi::Value::Int(2),
                    msi::Value::Int(2),
                    msi::Value::Null,
                    msi::Value::from("disk2.cab"),
                ]),
        )
        .unwrap();

        let disk1 = build_cab(&[("filWinsock", b"winsock contents")]);
        let mut stream = pkg.write_stream("disk1.cab").unwrap();
        stream.write_all(&disk1).unwrap();
        drop(stream);

        let mut siblings = SiblingPayloads::new();
        siblings.insert("disk2.cab", build_cab(&[("filWindows", b"windows contents")]));

        let bytes: Bytes = pkg.into_inner().unwrap().into_inner().into();
        let mut entries = drain(extract("sdk.msi", ArchiveFormat::Msi, bytes, &siblings).unwrap());
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path.to_string(), "include/um/windows.h");
        assert_eq!(entries[0].contents.as_ref(), b"windows contents");
        assert_eq!(entries[1].path.to_string(), "include/um/winsock2.h");
        assert_eq!(entries[1].contents.as_ref(), b"winsock contents");
    }

    #[test]
    fn msi_missing_sibling_cabinet_is_corrupt() {
        let (bytes, _) = build_msi(false);

        match extract("sdk.msi", ArchiveFormat::Msi, bytes, &SiblingPayloads::new()) {
            Err(Error::CorruptArchive { reason, .. }) => {
                assert!(reason.contains("payload.cab"), "{reason}");
            }
            other => panic!("expected CorruptArchive, got ok={:?}", other.is_ok()),
        }
    }
}
