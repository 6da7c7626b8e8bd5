//! The metadata registry stored in the container header.
//!
//! The header owns every record in flat maps keyed by integer id. All
//! relationships are id references: a file names its parent directory in
//! `path`, a note names its owning file in `owned_by_file`, and a file names
//! its note in `metadata.note_id`. Nothing is embedded, so the maps are the
//! single source of truth.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::allocator;
use capsule_common::{Error, IdKind, Result};

/// Parent id meaning "the root directory".
pub const ROOT_DIR: u64 = 0;

/// Sentinel for an absent icon range or note link.
pub const NONE: i64 = -1;

/// Vault-level statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultStats {
    pub vault_name: String,
    pub vault_extension: String,
    /// Byte length of the plaintext header JSON, this field included. The
    /// encrypted blob on disk is larger.
    pub header_size: u64,
    /// Total plaintext size of the stored files.
    pub file_size: u64,
    pub trusted_timestamp: DateTime<Utc>,
    /// Files and notes counted together.
    pub amount_of_files: u64,
    /// Whether new files are encrypted by default.
    pub is_vault_encrypted: bool,
}

/// Display metadata of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    /// Extension without the leading dot.
    #[serde(rename = "type")]
    pub extension: String,
    pub data_created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub icon_data_start: i64,
    pub icon_data_end: i64,
    pub note_id: i64,
}

/// A stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: u64,
    /// Plaintext size in bytes.
    pub size: u64,
    pub loc_start: i64,
    pub loc_end: i64,
    pub checksum: String,
    pub file_encrypted: bool,
    /// Parent directory id.
    pub path: u64,
    pub metadata: FileMetadata,
}

impl FileRecord {
    /// Stored byte range of the payload.
    pub fn range(&self) -> (u64, u64) {
        (self.loc_start.max(0) as u64, self.loc_end.max(0) as u64)
    }

    pub fn stored_len(&self) -> u64 {
        (self.loc_end - self.loc_start).max(0) as u64
    }

    /// Stored byte range of the icon, if there is one.
    pub fn icon_range(&self) -> Option<(u64, u64)> {
        let m = &self.metadata;
        if m.icon_data_start > 0 && m.icon_data_end > m.icon_data_start {
            Some((m.icon_data_start as u64, m.icon_data_end as u64))
        } else {
            None
        }
    }

    pub fn note(&self) -> Option<u64> {
        u64::try_from(self.metadata.note_id).ok()
    }

    /// `name.extension`, or just the name when there is no extension.
    pub fn display_name(&self) -> String {
        if self.metadata.extension.is_empty() {
            self.metadata.name.clone()
        } else {
            format!("{}.{}", self.metadata.name, self.metadata.extension)
        }
    }
}

/// Reject a file name or extension that could address anything but a single
/// entry inside the directory it is extracted into.
pub fn check_name_part(part: &str, what: &str) -> Result<()> {
    if part.is_empty() {
        return Err(Error::InvalidInput(format!("{what} cannot be empty")));
    }
    if part.contains(['/', '\\', '\0']) || part == "." || part == ".." {
        return Err(Error::InvalidInput(format!(
            "{what} {part:?} must not contain path separators"
        )));
    }
    Ok(())
}

/// Confirm a display name is exactly one normal path component.
pub fn check_display_name(name: &str) -> Result<()> {
    use std::path::{Component, Path};

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None)
            if part == name && !name.contains(['/', '\\']) =>
        {
            Ok(())
        }
        _ => Err(Error::InvalidInput(format!(
            "File name {name:?} is not a plain file name"
        ))),
    }
}

/// A directory. Subdirectories are found by scanning for records whose
/// `path` equals this id; only directly owned files are listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub id: u64,
    pub name: String,
    pub path: u64,
    pub data_created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub files: Vec<u64>,
}

/// A short attachment owned by exactly one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteRecord {
    pub id: u64,
    pub owned_by_file: u64,
    pub loc_start: i64,
    pub loc_end: i64,
    #[serde(rename = "type")]
    pub note_type: String,
    pub checksum: String,
}

impl NoteRecord {
    pub fn range(&self) -> (u64, u64) {
        (self.loc_start.max(0) as u64, self.loc_end.max(0) as u64)
    }
}

/// Identifier sets and id-keyed record tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultMap {
    pub file_ids: Vec<u64>,
    pub directory_ids: Vec<u64>,
    pub note_ids: Vec<u64>,
    pub directories: BTreeMap<u64, DirectoryRecord>,
    pub files: BTreeMap<u64, FileRecord>,
    pub notes: BTreeMap<u64, NoteRecord>,
}

/// Outcome of [`Header::safe_remove_folder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderRemoval {
    Removed,
    Refused(String),
}

impl FolderRemoval {
    pub fn removed(&self) -> bool {
        matches!(self, FolderRemoval::Removed)
    }

    /// Why the folder was kept; empty when it was removed.
    pub fn message(&self) -> &str {
        match self {
            FolderRemoval::Removed => "",
            FolderRemoval::Refused(msg) => msg,
        }
    }
}

/// Filter for [`VaultMap::get_files_with`].
#[derive(Debug, Clone, Default)]
pub struct FileQuery {
    /// Substring of the display name.
    pub name: Option<String>,
    /// Extension, with or without a leading dot.
    pub extension: Option<String>,
    /// Compare name and extension case-sensitively.
    pub match_case: bool,
    pub encrypted_only: bool,
    pub has_note_only: bool,
}

fn strip_dot(ext: &str) -> &str {
    ext.strip_prefix('.').unwrap_or(ext)
}

impl VaultMap {
    pub fn ids(&self, kind: IdKind) -> &[u64] {
        match kind {
            IdKind::File => &self.file_ids,
            IdKind::Directory => &self.directory_ids,
            IdKind::Note => &self.note_ids,
        }
    }

    fn ids_mut(&mut self, kind: IdKind) -> &mut Vec<u64> {
        match kind {
            IdKind::File => &mut self.file_ids,
            IdKind::Directory => &mut self.directory_ids,
            IdKind::Note => &mut self.note_ids,
        }
    }

    /// Slash-joined names from the root down to directory `id`.
    ///
    /// Stops at ids `<= 0` or ids that do not exist; yields `/` when nothing
    /// was collected.
    pub fn determine_directory_path(&self, id: u64) -> String {
        fn walk(map: &VaultMap, id: u64, depth: usize, out: &mut Vec<String>) {
            if id == ROOT_DIR || depth > map.directories.len() {
                return;
            }
            if let Some(dir) = map.directories.get(&id) {
                walk(map, dir.path, depth + 1, out);
                out.push(dir.name.clone());
            }
        }

        let mut names = Vec::new();
        walk(self, id, 0, &mut names);
        if names.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", names.join("/"))
        }
    }

    /// Match `segments` against the directory forest starting below `level`.
    ///
    /// Each segment must name a directory whose parent is the directory
    /// matched by the previous segment. Returns whether every segment matched
    /// and the id of the deepest directory that did (`level` if none did).
    pub fn determine_if_dir_path_is_valid(&self, segments: &[String], level: u64) -> (bool, u64) {
        let Some((first, rest)) = segments.split_first() else {
            return (true, level);
        };
        match self
            .directories
            .values()
            .find(|dir| dir.path == level && dir.name == *first)
        {
            Some(dir) => self.determine_if_dir_path_is_valid(rest, dir.id),
            None => (false, level),
        }
    }

    /// Directories whose parent is `id`.
    pub fn subdirectories(&self, id: u64) -> impl Iterator<Item = &DirectoryRecord> {
        self.directories.values().filter(move |dir| dir.path == id)
    }

    /// Files whose parent is `id`.
    pub fn files_in(&self, id: u64) -> impl Iterator<Item = &FileRecord> {
        self.files.values().filter(move |file| file.path == id)
    }

    /// Linear filter over every file record. All filters are AND-combined.
    pub fn get_files_with(&self, query: &FileQuery) -> Vec<&FileRecord> {
        let fold = |s: &str| {
            if query.match_case {
                s.to_string()
            } else {
                s.to_lowercase()
            }
        };
        let name = query.name.as_deref().map(|n| fold(n));
        let extension = query.extension.as_deref().map(|e| fold(strip_dot(e)));

        self.files
            .values()
            .filter(|file| {
                name.as_ref()
                    .map_or(true, |n| fold(&file.metadata.name).contains(n.as_str()))
            })
            .filter(|file| {
                extension
                    .as_ref()
                    .map_or(true, |e| fold(strip_dot(&file.metadata.extension)) == *e)
            })
            .filter(|file| !query.encrypted_only || file.file_encrypted)
            .filter(|file| !query.has_note_only || file.note().is_some())
            .collect()
    }
}

/// The complete header record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub vault: VaultStats,
    pub map: VaultMap,
}

impl Header {
    /// Create an empty header.
    pub fn new(name: impl Into<String>, extension: impl Into<String>, encrypted: bool) -> Self {
        Self {
            vault: VaultStats {
                vault_name: name.into(),
                vault_extension: extension.into(),
                header_size: 0,
                file_size: 0,
                trusted_timestamp: Utc::now(),
                amount_of_files: 0,
                is_vault_encrypted: encrypted,
            },
            map: VaultMap::default(),
        }
    }

    /// Serialize to compact JSON.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Allocate an identifier and reserve it in its namespace.
    pub fn reserve_id(&mut self, kind: IdKind) -> Result<u64> {
        let id = allocator::allocate(self.map.ids(kind))?;
        self.map.ids_mut(kind).push(id);
        debug!(%kind, id, "Identifier reserved");
        Ok(id)
    }

    /// Give back a reserved identifier that never received a record.
    pub fn release_id(&mut self, kind: IdKind, id: u64) {
        self.map.ids_mut(kind).retain(|&i| i != id);
    }

    fn require_reserved(&self, kind: IdKind, id: u64) -> Result<()> {
        if self.map.ids(kind).contains(&id) {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!("{} id {} was not reserved", kind, id)))
        }
    }

    fn require_directory(&self, id: u64) -> Result<()> {
        if id == ROOT_DIR || self.map.directories.contains_key(&id) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("Directory {}", id)))
        }
    }

    pub fn file(&self, id: u64) -> Result<&FileRecord> {
        self.map
            .files
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("File {}", id)))
    }

    pub fn file_mut(&mut self, id: u64) -> Result<&mut FileRecord> {
        self.map
            .files
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("File {}", id)))
    }

    pub fn note(&self, id: u64) -> Result<&NoteRecord> {
        self.map
            .notes
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("Note {}", id)))
    }

    pub fn note_mut(&mut self, id: u64) -> Result<&mut NoteRecord> {
        self.map
            .notes
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("Note {}", id)))
    }

    pub fn directory(&self, id: u64) -> Result<&DirectoryRecord> {
        self.map
            .directories
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("Directory {}", id)))
    }

    /// Add a file whose id is reserved and whose bytes are already on disk.
    ///
    /// # Errors
    /// - Id not reserved or already in use
    /// - Parent directory missing
    /// - Empty byte range
    pub fn insert_file(&mut self, record: FileRecord) -> Result<()> {
        self.require_reserved(IdKind::File, record.id)?;
        if self.map.files.contains_key(&record.id) {
            return Err(Error::InvalidInput(format!("File {} already exists", record.id)));
        }
        self.require_directory(record.path)?;
        if record.loc_start < 0 || record.loc_start >= record.loc_end {
            return Err(Error::InvalidInput(format!(
                "File {} has an empty byte range {}..{}",
                record.id, record.loc_start, record.loc_end
            )));
        }

        if let Some(dir) = self.map.directories.get_mut(&record.path) {
            dir.files.push(record.id);
            dir.last_modified = Utc::now();
        }
        self.vault.amount_of_files += 1;
        self.vault.file_size += record.size;
        debug!(id = record.id, size = record.size, "File inserted");
        self.map.files.insert(record.id, record);
        Ok(())
    }

    /// Remove a file record. Byte ranges are left to the caller.
    ///
    /// # Errors
    /// - File not found
    /// - File still owns a note
    pub fn remove_file(&mut self, id: u64) -> Result<FileRecord> {
        let record = self.file(id)?;
        if let Some(note_id) = record.note() {
            return Err(Error::InvalidInput(format!(
                "File {} still owns note {}; remove the note first",
                id, note_id
            )));
        }
        let parent = record.path;

        self.map.file_ids.retain(|&i| i != id);
        if parent != ROOT_DIR {
            if let Some(dir) = self.map.directories.get_mut(&parent) {
                dir.files.retain(|&i| i != id);
                dir.last_modified = Utc::now();
            }
        }
        let record = self
            .map
            .files
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("File {}", id)))?;
        self.vault.amount_of_files = self.vault.amount_of_files.saturating_sub(1);
        self.vault.file_size = self.vault.file_size.saturating_sub(record.size);
        debug!(id, "File removed");
        Ok(record)
    }

    /// Attach a note to its owning file.
    ///
    /// # Errors
    /// - Id not reserved or already in use
    /// - Owner missing or already owning a note
    pub fn insert_note(&mut self, record: NoteRecord) -> Result<()> {
        self.require_reserved(IdKind::Note, record.id)?;
        if self.map.notes.contains_key(&record.id) {
            return Err(Error::InvalidInput(format!("Note {} already exists", record.id)));
        }
        if record.loc_start < 0 || record.loc_start >= record.loc_end {
            return Err(Error::InvalidInput(format!(
                "Note {} has an empty byte range",
                record.id
            )));
        }
        let owner = self.file_mut(record.owned_by_file)?;
        if let Some(existing) = owner.note() {
            return Err(Error::InvalidInput(format!(
                "File {} already owns note {}",
                record.owned_by_file, existing
            )));
        }
        owner.metadata.note_id = record.id as i64;
        owner.metadata.last_modified = Utc::now();

        self.vault.amount_of_files += 1;
        debug!(id = record.id, owner = record.owned_by_file, "Note inserted");
        self.map.notes.insert(record.id, record);
        Ok(())
    }

    /// Detach and remove a note. Byte ranges are left to the caller.
    pub fn remove_note(&mut self, id: u64) -> Result<NoteRecord> {
        let record = self
            .map
            .notes
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("Note {}", id)))?;
        self.map.note_ids.retain(|&i| i != id);
        if let Some(owner) = self.map.files.get_mut(&record.owned_by_file) {
            owner.metadata.note_id = NONE;
            owner.metadata.last_modified = Utc::now();
        }
        self.vault.amount_of_files = self.vault.amount_of_files.saturating_sub(1);
        debug!(id, "Note removed");
        Ok(record)
    }

    /// Add a directory whose id is reserved.
    ///
    /// # Errors
    /// - Id not reserved or in use, parent missing, or a sibling has the same name
    pub fn insert_directory(&mut self, record: DirectoryRecord) -> Result<()> {
        self.require_reserved(IdKind::Directory, record.id)?;
        if record.id == ROOT_DIR || self.map.directories.contains_key(&record.id) {
            return Err(Error::InvalidInput(format!(
                "Directory {} already exists",
                record.id
            )));
        }
        self.require_directory(record.path)?;
        if self
            .map
            .subdirectories(record.path)
            .any(|dir| dir.name == record.name)
        {
            return Err(Error::InvalidInput(format!(
                "Directory '{}' already exists in {}",
                record.name,
                self.map.determine_directory_path(record.path)
            )));
        }
        debug!(id = record.id, parent = record.path, "Directory inserted");
        self.map.directories.insert(record.id, record);
        Ok(())
    }

    /// Remove a directory only if it is empty. The root is always a no-op.
    pub fn safe_remove_folder(&mut self, id: u64) -> FolderRemoval {
        if id == ROOT_DIR {
            return FolderRemoval::Removed;
        }
        let Some(dir) = self.map.directories.get(&id) else {
            return FolderRemoval::Refused(format!("Directory {} does not exist", id));
        };
        if !dir.files.is_empty() {
            return FolderRemoval::Refused(format!(
                "Directory '{}' still contains {} file(s)",
                dir.name,
                dir.files.len()
            ));
        }
        let subdirs = self.map.subdirectories(id).count();
        if subdirs > 0 {
            return FolderRemoval::Refused(format!(
                "Directory '{}' still contains {} subdirectory(ies)",
                dir.name, subdirs
            ));
        }

        self.map.directory_ids.retain(|&i| i != id);
        self.map.directories.remove(&id);
        debug!(id, "Directory removed");
        FolderRemoval::Removed
    }

    pub fn rename_file(&mut self, id: u64, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        check_name_part(&name, "File name")?;
        let file = self.file_mut(id)?;
        file.metadata.name = name;
        file.metadata.last_modified = Utc::now();
        Ok(())
    }

    /// Re-parent a file, keeping both directories' file lists in step.
    pub fn move_file(&mut self, id: u64, new_parent: u64) -> Result<()> {
        self.require_directory(new_parent)?;
        let old_parent = self.file(id)?.path;
        if old_parent == new_parent {
            return Ok(());
        }
        let now = Utc::now();
        if let Some(dir) = self.map.directories.get_mut(&old_parent) {
            dir.files.retain(|&i| i != id);
            dir.last_modified = now;
        }
        if let Some(dir) = self.map.directories.get_mut(&new_parent) {
            dir.files.push(id);
            dir.last_modified = now;
        }
        let file = self.file_mut(id)?;
        file.path = new_parent;
        file.metadata.last_modified = now;
        Ok(())
    }

    /// Check cross-record consistency.
    ///
    /// # Errors
    /// - `IdCollision` for duplicate ids in a namespace
    /// - `Integrity` naming the first broken link found
    pub fn check_integrity(&self) -> Result<()> {
        let map = &self.map;
        fn same_keys<V>(kind: IdKind, ids: &[u64], table: &BTreeMap<u64, V>) -> Result<()> {
            allocator::ensure_unique(ids)?;
            let listed: BTreeSet<u64> = ids.iter().copied().collect();
            let stored: BTreeSet<u64> = table.keys().copied().collect();
            if listed != stored {
                return Err(Error::Integrity(format!(
                    "{} id set {:?} does not match records {:?}",
                    kind, listed, stored
                )));
            }
            Ok(())
        }
        let broken = |msg: String| Err(Error::Integrity(msg));

        same_keys(IdKind::File, &map.file_ids, &map.files)?;
        same_keys(IdKind::Directory, &map.directory_ids, &map.directories)?;
        same_keys(IdKind::Note, &map.note_ids, &map.notes)?;

        for (&key, file) in &map.files {
            if file.id != key {
                return broken(format!("File keyed {} carries id {}", key, file.id));
            }
            if file.loc_start < 0 || file.loc_start >= file.loc_end {
                return broken(format!(
                    "File {} has invalid range {}..{}",
                    key, file.loc_start, file.loc_end
                ));
            }
            let m = &file.metadata;
            let no_icon = m.icon_data_start == NONE && m.icon_data_end == NONE;
            if !no_icon && file.icon_range().is_none() {
                return broken(format!(
                    "File {} has invalid icon range {}..{}",
                    key, m.icon_data_start, m.icon_data_end
                ));
            }
            if file.path != ROOT_DIR {
                match map.directories.get(&file.path) {
                    Some(dir) if dir.files.contains(&key) => {}
                    Some(_) => {
                        return broken(format!("Directory {} does not list file {}", file.path, key))
                    }
                    None => {
                        return broken(format!("File {} has missing parent {}", key, file.path))
                    }
                }
            }
            if let Some(note_id) = file.note() {
                match map.notes.get(&note_id) {
                    Some(note) if note.owned_by_file == key => {}
                    _ => return broken(format!("File {} links to foreign note {}", key, note_id)),
                }
            } else if m.note_id != NONE {
                return broken(format!("File {} has invalid note id {}", key, m.note_id));
            }
        }

        for (&key, note) in &map.notes {
            if note.id != key {
                return broken(format!("Note keyed {} carries id {}", key, note.id));
            }
            if note.loc_start < 0 || note.loc_start >= note.loc_end {
                return broken(format!("Note {} has invalid range", key));
            }
            match map.files.get(&note.owned_by_file) {
                Some(owner) if owner.note() == Some(key) => {}
                _ => {
                    return broken(format!(
                        "Note {} is not linked back from file {}",
                        key, note.owned_by_file
                    ))
                }
            }
        }

        for (&key, dir) in &map.directories {
            if dir.id != key || key == ROOT_DIR {
                return broken(format!("Directory keyed {} carries id {}", key, dir.id));
            }
            if dir.path != ROOT_DIR && !map.directories.contains_key(&dir.path) {
                return broken(format!("Directory {} has missing parent {}", key, dir.path));
            }
            let mut owned = HashSet::new();
            for file_id in &dir.files {
                if !owned.insert(*file_id) {
                    return broken(format!("Directory {} lists file {} twice", key, file_id));
                }
                match map.files.get(file_id) {
                    Some(file) if file.path == key => {}
                    _ => return broken(format!("Directory {} lists foreign file {}", key, file_id)),
                }
            }
            // Walking up must reach the root within as many steps as there are directories.
            let mut cursor = dir.path;
            let mut steps = 0;
            while cursor != ROOT_DIR {
                steps += 1;
                if steps > map.directories.len() {
                    return broken(format!("Directory {} is part of a cycle", key));
                }
                cursor = map.directories.get(&cursor).map_or(ROOT_DIR, |d| d.path);
            }
        }

        let expected = (map.files.len() + map.notes.len()) as u64;
        if self.vault.amount_of_files != expected {
            return broken(format!(
                "amount_of_files is {} but {} files and notes are stored",
                self.vault.amount_of_files, expected
            ));
        }
        Ok(())
    }
}
