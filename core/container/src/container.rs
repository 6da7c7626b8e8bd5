//! An open container and the operations collaborators run against it.
//!
//! While a container is open its footer is cut off, so new payloads are
//! appended at the very end of the store. [`Container::close`] persists the
//! header and appends a fresh footer built from the session log. Every other
//! mutation persists the header before returning.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::ContainerConfig;
use crate::footer::{Footer, SessionLog};
use crate::layout::{self, HeaderLayout, MARKER_LEN};
use crate::registry::{
    check_display_name, check_name_part, DirectoryRecord, FileMetadata, FileQuery, FileRecord,
    FolderRemoval, Header, NoteRecord, VaultMap, NONE, ROOT_DIR,
};
use crate::schema;
use crate::shifter;
use crate::store::{self, ContainerStore, Splice};
use crate::writer;
use capsule_common::{DirSegments, Error, IdKind, Result, SensitiveBytes, TaskContext};
use capsule_crypto::{verify_checksum, Codec, Sealed};

/// Description of a file about to be added.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub name: String,
    /// Extension without the leading dot.
    pub extension: String,
    pub parent: u64,
    /// `None` follows the vault default.
    pub encrypted: Option<bool>,
    /// Thumbnail bytes, always stored encrypted.
    pub icon: Option<Vec<u8>>,
}

impl NewFile {
    pub fn new(name: impl Into<String>, extension: impl Into<String>) -> Self {
        let extension = extension.into();
        Self {
            name: name.into(),
            extension: extension.trim_start_matches('.').to_string(),
            parent: ROOT_DIR,
            encrypted: None,
            icon: None,
        }
    }

    /// Split `file_name` at its last dot. Dot files keep their full name.
    pub fn from_file_name(file_name: &str) -> Self {
        match file_name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => Self::new(stem, ext),
            _ => Self::new(file_name, ""),
        }
    }

    pub fn in_directory(mut self, parent: u64) -> Self {
        self.parent = parent;
        self
    }

    pub fn encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = Some(encrypted);
        self
    }

    pub fn with_icon(mut self, icon: Vec<u8>) -> Self {
        self.icon = Some(icon);
        self
    }
}

/// A stored byte range owned by some record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Payload(u64),
    Icon(u64),
    Note(u64),
}

enum Transcode<'p> {
    Seal(&'p [u8]),
    Open(&'p [u8]),
    Reseal { from: &'p [u8], to: &'p [u8] },
}

fn slot_range(map: &VaultMap, slot: Slot) -> Result<(u64, u64)> {
    let missing = || Error::NotFound(format!("{:?}", slot));
    match slot {
        Slot::Payload(id) => map.files.get(&id).map(FileRecord::range).ok_or_else(missing),
        Slot::Icon(id) => map
            .files
            .get(&id)
            .and_then(FileRecord::icon_range)
            .ok_or_else(missing),
        Slot::Note(id) => map.notes.get(&id).map(NoteRecord::range).ok_or_else(missing),
    }
}

fn set_slot_range(map: &mut VaultMap, slot: Slot, (start, end): (u64, u64)) -> Result<()> {
    let missing = || Error::NotFound(format!("{:?}", slot));
    let (start, end) = (start as i64, end as i64);
    match slot {
        Slot::Payload(id) => {
            let file = map.files.get_mut(&id).ok_or_else(missing)?;
            file.loc_start = start;
            file.loc_end = end;
        }
        Slot::Icon(id) => {
            let meta = &mut map.files.get_mut(&id).ok_or_else(missing)?.metadata;
            meta.icon_data_start = start;
            meta.icon_data_end = end;
        }
        Slot::Note(id) => {
            let note = map.notes.get_mut(&id).ok_or_else(missing)?;
            note.loc_start = start;
            note.loc_end = end;
        }
    }
    Ok(())
}

fn slot_checksum(map: &VaultMap, slot: Slot) -> Option<String> {
    match slot {
        Slot::Payload(id) => map.files.get(&id).map(|f| f.checksum.clone()),
        Slot::Icon(_) => None,
        Slot::Note(id) => map.notes.get(&id).map(|n| n.checksum.clone()),
    }
}

fn verify(expected: &str, actual: &str) -> Result<()> {
    if verify_checksum(expected, actual) {
        Ok(())
    } else {
        Err(Error::ChecksumMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

/// Decrypt a header or footer blob. Bytes that are not a JSON document mean
/// the key was wrong even though the padding happened to check out.
fn decrypt_document(codec: &Codec, blob: &[u8], password: &[u8], what: &str) -> Result<Vec<u8>> {
    let plain = codec.decrypt(blob, password)?;
    if !schema::is_json_document(&plain) {
        return Err(Error::DecryptionFailure(format!(
            "{} did not decrypt to JSON; wrong password?",
            what
        )));
    }
    Ok(plain)
}

/// Fail unless the store grew by exactly `written` bytes from `at`.
fn check_append<S: ContainerStore + ?Sized>(store: &mut S, at: u64, written: u64) -> Result<()> {
    let actual = store.byte_len()?;
    if actual != at + written {
        return Err(Error::SizeMismatch {
            expected: at + written,
            actual,
        });
    }
    Ok(())
}

/// Every stored range must lie inside `[lo, hi)`.
fn check_ranges(map: &VaultMap, lo: u64, hi: u64) -> Result<()> {
    let inside = |what: String, (start, end): (u64, u64)| {
        if start < lo || end > hi || start >= end {
            Err(Error::Integrity(format!(
                "{} range {}..{} lies outside the payload region {}..{}",
                what, start, end, lo, hi
            )))
        } else {
            Ok(())
        }
    };
    for file in map.files.values() {
        inside(format!("File {}", file.id), file.range())?;
        if let Some(icon) = file.icon_range() {
            inside(format!("Icon of file {}", file.id), icon)?;
        }
    }
    for note in map.notes.values() {
        inside(format!("Note {}", note.id), note.range())?;
    }
    Ok(())
}

/// Transcode a slot to the end of the store, then drop its old bytes.
///
/// The new bytes are appended first and the old range removed afterwards,
/// so the slot's record is rebased by the removal like every other record
/// behind it. A failed append is rolled back and leaves the map untouched.
fn relocate<S: ContainerStore + ?Sized>(
    store: &mut S,
    map: &mut VaultMap,
    codec: &Codec,
    slot: Slot,
    transcode: Transcode<'_>,
    ctx: &TaskContext,
) -> Result<Sealed> {
    let (start, end) = slot_range(map, slot)?;
    let len = end - start;
    let expected = slot_checksum(map, slot);

    let (at, sealed) = writer::with_rollback(store, |store| {
        let at = store.byte_len()?;
        let sealed = {
            let splice = Splice::new(&mut *store);
            let reader = splice.range(start, len);
            let tail = splice.tail();
            match transcode {
                Transcode::Seal(pw) => codec.seal_stream(reader, len, tail, pw, true, ctx)?,
                Transcode::Open(pw) => codec.open_stream(reader, len, tail, pw, true, ctx)?,
                Transcode::Reseal { from, to } => {
                    codec.reseal_stream(reader, len, tail, from, to, ctx)?
                }
            }
        };
        check_append(store, at, sealed.written)?;
        if let Some(expected) = &expected {
            verify(expected, &sealed.checksum)?;
        }
        Ok((at, sealed))
    })?;

    set_slot_range(map, slot, (at, at + sealed.written))?;
    store::remove_range(store, start, len)?;
    shifter::shift_for_removal(map, start, len);
    debug!(?slot, from = start, to = at - len, "Slot relocated");
    Ok(sealed)
}

/// Stream a stored payload out to `writer` and verify its checksum.
fn open_payload<S: ContainerStore + ?Sized, W: Write>(
    store: &mut S,
    codec: &Codec,
    password: &[u8],
    record: &FileRecord,
    writer: W,
    ctx: &TaskContext,
) -> Result<Sealed> {
    let (start, end) = record.range();
    store.seek(SeekFrom::Start(start))?;
    let reader = Read::take(&mut *store, end - start);
    let opened = codec.open_stream(reader, end - start, writer, password, record.file_encrypted, ctx)?;
    verify(&record.checksum, &opened.checksum)?;
    Ok(opened)
}

/// An open container.
pub struct Container<S: ContainerStore> {
    store: S,
    header: Header,
    layout: HeaderLayout,
    config: ContainerConfig,
    codec: Codec,
    password: SensitiveBytes,
    log: SessionLog,
}

impl<S: ContainerStore> Container<S> {
    /// Initialize a new container in an empty store.
    ///
    /// # Preconditions
    /// - `store` must be empty
    /// - Password must not be empty
    ///
    /// # Postconditions
    /// - Store holds a header region with `min_padding` spare bytes
    /// - Container is open with an empty registry
    ///
    /// # Errors
    /// - Invalid configuration or non-empty store
    /// - Encryption or I/O failure
    pub fn create(
        mut store: S,
        name: impl Into<String>,
        extension: impl Into<String>,
        password: &[u8],
        config: ContainerConfig,
    ) -> Result<Self> {
        config.validate()?;
        if password.is_empty() {
            return Err(Error::InvalidInput("Password cannot be empty".to_string()));
        }
        let existing = store.byte_len()?;
        if existing != 0 {
            return Err(Error::InvalidInput(format!(
                "Refusing to create a container over {} existing bytes",
                existing
            )));
        }

        let codec = config.codec();
        let mut header = Header::new(name, extension, true);
        let plain = writer::settle_header_size(&mut header)?;
        let blob = codec.encrypt(&plain, password)?;
        let region_len = blob.len() as u64 + MARKER_LEN * 3 + config.min_padding;
        let layout = layout::write_header_region(&mut store, &blob, region_len)?;

        let mut log = SessionLog::new(Footer::default());
        log.info(format!("Container '{}' created", header.vault.vault_name));
        info!(name = %header.vault.vault_name, region_len, "Container created");

        Ok(Self {
            store,
            header,
            layout,
            config,
            codec,
            password: SensitiveBytes::new(password.to_vec()),
            log,
        })
    }

    /// Open an existing container.
    ///
    /// # Postconditions
    /// - The header is decrypted, schema-checked and integrity-checked
    /// - A committed footer is read into the session log and cut off
    ///
    /// # Errors
    /// - `DecryptionFailure` for a wrong password (recoverable)
    /// - `MarkerNotFound`, schema and integrity errors for a damaged container
    pub fn open(mut store: S, password: &[u8], config: ContainerConfig) -> Result<Self> {
        config.validate()?;
        let codec = config.codec();
        let layout = HeaderLayout::locate(&mut store)?;
        let blob = layout::read_header_blob(&mut store, &layout)?;
        let plain = decrypt_document(&codec, &blob, password, "Header")?;
        let header = schema::validate_header(&plain)?;

        let found = layout::locate_footer(&mut store, layout.region_len())?;
        let payload_end = match &found {
            Some(footer) => footer.start_marker,
            None => store.byte_len()?,
        };
        check_ranges(&header.map, layout.region_len(), payload_end)?;

        let footer = match &found {
            Some(found) => {
                let blob = layout::read_footer_blob(&mut store, found)?;
                let plain = decrypt_document(&codec, &blob, password, "Footer")?;
                let footer = schema::validate_footer(&plain)?;
                layout::remove_footer(&mut store, found)?;
                Some(footer)
            }
            None => None,
        };
        let committed = footer.is_some();
        let mut log = SessionLog::new(footer.unwrap_or_default());
        if !committed {
            log.warn("No footer found; the previous session did not close cleanly");
        }
        if header.vault.header_size != plain.len() as u64 {
            log.warn(format!(
                "Declared header size {} differs from stored {} bytes",
                header.vault.header_size,
                plain.len()
            ));
        }

        info!(
            name = %header.vault.vault_name,
            files = header.map.files.len(),
            notes = header.map.notes.len(),
            "Container opened"
        );
        Ok(Self {
            store,
            header,
            layout,
            config,
            codec,
            password: SensitiveBytes::new(password.to_vec()),
            log,
        })
    }

    /// Persist the header, append the footer and hand back the store.
    pub fn close(mut self) -> Result<S> {
        self.persist()?;
        self.log.info("Session closed");
        let footer = self.log.export().to_bytes()?;
        let blob = self.codec.encrypt(&footer, self.password.as_bytes())?;
        writer::with_rollback(&mut self.store, |store| {
            let written = layout::append_footer(store, &blob)?;
            check_append(store, written.start_marker, blob.len() as u64 + MARKER_LEN * 2)
        })?;
        self.store.flush()?;
        info!(name = %self.header.vault.vault_name, "Container closed");
        let Self { store, .. } = self;
        Ok(store)
    }

    /// Write the header back, growing the header region if needed.
    pub fn persist(&mut self) -> Result<()> {
        let persisted = writer::persist_header(
            &mut self.store,
            &mut self.header,
            &self.codec,
            self.password.as_bytes(),
            self.config.min_padding,
        )?;
        if persisted.grown > 0 {
            self.log
                .info(format!("Header region grown by {} bytes", persisted.grown));
        }
        self.layout = persisted.layout;
        Ok(())
    }

    /// Persist a freshly inserted record. If the header cannot be written the
    /// record is dropped and the store trimmed back to `start`, where its
    /// bytes began.
    fn persist_appended(&mut self, kind: IdKind, id: u64, start: u64) -> Result<()> {
        let cause = match self.persist() {
            Ok(()) => return Ok(()),
            Err(cause) => cause,
        };
        let dropped = match kind {
            IdKind::Note => self.header.remove_note(id).map(drop),
            _ => self.header.remove_file(id).map(drop),
        };
        self.header.release_id(kind, id);
        let rollback = match (dropped, self.store.truncate_to(start)) {
            (Ok(()), Ok(())) => {
                format!("{} {} dropped and container trimmed back to {} bytes", kind, id, start)
            }
            (Err(e), _) | (_, Err(e)) => format!("dropping {} {} failed: {}", kind, id, e),
        };
        warn!(%kind, id, error = %cause, "Header write failed after append");
        self.log
            .error(format!("Saving {} {} failed: {}; rollback: {}", kind, id, cause, rollback));
        Err(Error::rolled_back(cause, rollback))
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn layout(&self) -> &HeaderLayout {
        &self.layout
    }

    pub fn session_log(&self) -> &SessionLog {
        &self.log
    }

    pub(crate) fn log_mut(&mut self) -> &mut SessionLog {
        &mut self.log
    }

    #[cfg(test)]
    pub(crate) fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// First byte of the payload region.
    pub fn payload_start(&self) -> u64 {
        self.layout.region_len()
    }

    // ----- Files -----

    /// Stream `len` bytes from `reader` into the container as a new file.
    ///
    /// # Postconditions
    /// - Payload (and icon) appended at the end of the payload region
    /// - Record inserted and header persisted
    ///
    /// # Errors
    /// - Parent directory missing, or a name that is empty or holds a path
    ///   separator
    /// - `RolledBack` if the append, or the header write after it, failed or
    ///   was cancelled
    pub fn add_file<R: Read>(
        &mut self,
        reader: R,
        len: u64,
        new: NewFile,
        ctx: &TaskContext,
    ) -> Result<u64> {
        check_name_part(&new.name, "File name")?;
        if !new.extension.is_empty() {
            check_name_part(&new.extension, "Extension")?;
        }
        if new.parent != ROOT_DIR {
            self.header.directory(new.parent)?;
        }
        let encrypted = new.encrypted.unwrap_or(self.header.vault.is_vault_encrypted);
        if len == 0 && !encrypted {
            return Err(Error::InvalidInput(
                "An empty file can only be stored encrypted".to_string(),
            ));
        }

        let id = self.header.reserve_id(IdKind::File)?;
        let codec = &self.codec;
        let password = self.password.as_bytes();
        let icon = new.icon.as_deref().filter(|icon| !icon.is_empty());
        let appended = writer::with_rollback(&mut self.store, |store| {
            let start = store.seek(SeekFrom::End(0))?;
            let sealed = codec.seal_stream(reader, len, &mut *store, password, encrypted, ctx)?;
            check_append(store, start, sealed.written)?;
            let icon_range = match icon {
                Some(bytes) => {
                    let blob = codec.encrypt(bytes, password)?;
                    let at = store::append(store, &blob)?;
                    check_append(store, at, blob.len() as u64)?;
                    Some((at as i64, (at + blob.len() as u64) as i64))
                }
                None => None,
            };
            Ok((start, sealed, icon_range))
        });
        let (start, sealed, icon_range) = match appended {
            Ok(appended) => appended,
            Err(e) => {
                self.header.release_id(IdKind::File, id);
                self.log.error(format!("Adding '{}' failed: {}", new.name, e));
                return Err(e);
            }
        };

        let now = Utc::now();
        let (icon_data_start, icon_data_end) = icon_range.unwrap_or((NONE, NONE));
        let record = FileRecord {
            id,
            size: len,
            loc_start: start as i64,
            loc_end: (start + sealed.written) as i64,
            checksum: sealed.checksum,
            file_encrypted: encrypted,
            path: new.parent,
            metadata: FileMetadata {
                name: new.name,
                extension: new.extension,
                data_created: now,
                last_modified: now,
                icon_data_start,
                icon_data_end,
                note_id: NONE,
            },
        };
        let display = record.display_name();
        if let Err(e) = self.header.insert_file(record) {
            self.header.release_id(IdKind::File, id);
            self.store.truncate_to(start)?;
            return Err(e);
        }
        self.persist_appended(IdKind::File, id, start)?;
        self.log
            .info(format!("Added file {} '{}' ({} bytes)", id, display, len));
        Ok(id)
    }

    /// Import a file from the local filesystem.
    pub fn import_file(&mut self, path: &Path, parent: u64, ctx: &TaskContext) -> Result<u64> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| Error::InvalidInput(format!("Invalid file name: {}", path.display())))?;
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let new = NewFile::from_file_name(file_name).in_directory(parent);
        self.add_file(BufReader::new(file), len, new, ctx)
    }

    /// Read a whole file into memory, verifying its checksum.
    pub fn read_file(&mut self, id: u64) -> Result<Vec<u8>> {
        let record = self.header.file(id)?;
        let (start, end) = record.range();
        let stored = store::read_range(&mut self.store, start, end - start)?;
        let plain = if record.file_encrypted {
            self.codec.decrypt(&stored, self.password.as_bytes())?
        } else {
            stored
        };
        verify(&record.checksum, &self.codec.checksum(&plain))?;
        Ok(plain)
    }

    /// Stream a file out to `dest`, or into `dest` under its display name
    /// when `dest` is a directory. A partial output is removed on failure.
    pub fn extract_file(&mut self, id: u64, dest: &Path, ctx: &TaskContext) -> Result<PathBuf> {
        let record = self.header.file(id)?.clone();
        let target = if dest.is_dir() {
            let name = record.display_name();
            check_display_name(&name)?;
            dest.join(name)
        } else {
            dest.to_path_buf()
        };

        let out = BufWriter::new(File::create(&target)?);
        let result = open_payload(
            &mut self.store,
            &self.codec,
            self.password.as_bytes(),
            &record,
            out,
            ctx,
        );
        if let Err(e) = result {
            let _ = std::fs::remove_file(&target);
            return Err(e);
        }
        debug!(id, target = %target.display(), "File extracted");
        Ok(target)
    }

    /// Delete a file together with its icon and note bytes.
    pub fn delete_file(&mut self, id: u64) -> Result<()> {
        if let Some(note_id) = self.header.file(id)?.note() {
            self.discard_note(note_id)?;
        }
        let record = self.header.remove_file(id)?;

        let mut ranges = vec![record.range()];
        ranges.extend(record.icon_range());
        // Highest first, so removing one range never moves another.
        ranges.sort_by(|a, b| b.0.cmp(&a.0));
        for (start, end) in ranges {
            self.cut(start, end)?;
        }

        self.persist()?;
        self.log
            .info(format!("Deleted file {} '{}'", id, record.display_name()));
        Ok(())
    }

    pub fn rename_file(&mut self, id: u64, name: impl Into<String>) -> Result<()> {
        self.header.rename_file(id, name)?;
        self.persist()?;
        self.log.info(format!("Renamed file {}", id));
        Ok(())
    }

    pub fn move_file(&mut self, id: u64, new_parent: u64) -> Result<()> {
        self.header.move_file(id, new_parent)?;
        self.persist()?;
        self.log.info(format!(
            "Moved file {} to {}",
            id,
            self.header.map.determine_directory_path(new_parent)
        ));
        Ok(())
    }

    /// Encrypt or decrypt a stored payload in place.
    ///
    /// The transcoded payload is written at the end of the payload region
    /// and the old bytes are removed, so at most one chunk is held in memory.
    pub fn set_file_encryption(&mut self, id: u64, encrypted: bool, ctx: &TaskContext) -> Result<()> {
        let record = self.header.file(id)?;
        if record.file_encrypted == encrypted {
            return Ok(());
        }
        if !encrypted && record.size == 0 {
            return Err(Error::InvalidInput(
                "An empty file can only be stored encrypted".to_string(),
            ));
        }

        let password = self.password.as_bytes();
        let transcode = if encrypted {
            Transcode::Seal(password)
        } else {
            Transcode::Open(password)
        };
        if let Err(e) = relocate(
            &mut self.store,
            &mut self.header.map,
            &self.codec,
            Slot::Payload(id),
            transcode,
            ctx,
        ) {
            self.log
                .error(format!("Changing encryption of file {} failed: {}", id, e));
            return Err(e);
        }

        let file = self.header.file_mut(id)?;
        file.file_encrypted = encrypted;
        file.metadata.last_modified = Utc::now();
        self.persist()?;
        self.log.info(format!(
            "File {} is now {}",
            id,
            if encrypted { "encrypted" } else { "unencrypted" }
        ));
        Ok(())
    }

    /// Decrypted icon bytes, if the file has an icon.
    pub fn read_icon(&mut self, id: u64) -> Result<Option<Vec<u8>>> {
        let Some((start, end)) = self.header.file(id)?.icon_range() else {
            return Ok(None);
        };
        let blob = store::read_range(&mut self.store, start, end - start)?;
        self.codec.decrypt(&blob, self.password.as_bytes()).map(Some)
    }

    pub fn find_files(&self, query: &FileQuery) -> Vec<&FileRecord> {
        self.header.map.get_files_with(query)
    }

    // ----- Notes -----

    /// Attach an encrypted note to a file.
    ///
    /// # Errors
    /// - Note larger than `max_note_size`
    /// - File missing or already owning a note
    pub fn add_note(&mut self, file_id: u64, note_type: impl Into<String>, bytes: &[u8]) -> Result<u64> {
        if bytes.len() as u64 > self.config.max_note_size {
            return Err(Error::InvalidInput(format!(
                "Note of {} bytes exceeds the {}-byte limit",
                bytes.len(),
                self.config.max_note_size
            )));
        }
        if let Some(existing) = self.header.file(file_id)?.note() {
            return Err(Error::InvalidInput(format!(
                "File {} already owns note {}",
                file_id, existing
            )));
        }

        let blob = self.codec.encrypt(bytes, self.password.as_bytes())?;
        let id = self.header.reserve_id(IdKind::Note)?;
        let appended = writer::with_rollback(&mut self.store, |store| {
            let at = store::append(store, &blob)?;
            check_append(store, at, blob.len() as u64)?;
            Ok(at)
        });
        let at = match appended {
            Ok(at) => at,
            Err(e) => {
                self.header.release_id(IdKind::Note, id);
                self.log
                    .error(format!("Adding a note to file {} failed: {}", file_id, e));
                return Err(e);
            }
        };

        let record = NoteRecord {
            id,
            owned_by_file: file_id,
            loc_start: at as i64,
            loc_end: (at + blob.len() as u64) as i64,
            note_type: note_type.into(),
            checksum: self.codec.checksum(bytes),
        };
        if let Err(e) = self.header.insert_note(record) {
            self.header.release_id(IdKind::Note, id);
            self.store.truncate_to(at)?;
            return Err(e);
        }
        self.persist_appended(IdKind::Note, id, at)?;
        self.log
            .info(format!("Added note {} to file {}", id, file_id));
        Ok(id)
    }

    pub fn read_note(&mut self, id: u64) -> Result<Vec<u8>> {
        let note = self.header.note(id)?;
        let (start, end) = note.range();
        let blob = store::read_range(&mut self.store, start, end - start)?;
        let plain = self.codec.decrypt(&blob, self.password.as_bytes())?;
        verify(&note.checksum, &self.codec.checksum(&plain))?;
        Ok(plain)
    }

    pub fn delete_note(&mut self, id: u64) -> Result<()> {
        self.discard_note(id)?;
        self.persist()?;
        self.log.info(format!("Deleted note {}", id));
        Ok(())
    }

    fn discard_note(&mut self, id: u64) -> Result<()> {
        let note = self.header.remove_note(id)?;
        let (start, end) = note.range();
        self.cut(start, end)
    }

    /// Remove `[start, end)` from the store and rebase everything behind it.
    fn cut(&mut self, start: u64, end: u64) -> Result<()> {
        store::remove_range(&mut self.store, start, end - start)?;
        shifter::shift_for_removal(&mut self.header.map, start, end - start);
        Ok(())
    }

    // ----- Directories -----

    pub fn create_directory(&mut self, name: &str, parent: u64) -> Result<u64> {
        let name = name.trim();
        if name.is_empty() || name.contains('/') {
            return Err(Error::InvalidInput(format!("Invalid directory name '{}'", name)));
        }
        let id = self.header.reserve_id(IdKind::Directory)?;
        let now = Utc::now();
        let record = DirectoryRecord {
            id,
            name: name.to_string(),
            path: parent,
            data_created: now,
            last_modified: now,
            files: Vec::new(),
        };
        if let Err(e) = self.header.insert_directory(record) {
            self.header.release_id(IdKind::Directory, id);
            return Err(e);
        }
        self.persist()?;
        self.log.info(format!(
            "Created directory {}",
            self.header.map.determine_directory_path(id)
        ));
        Ok(id)
    }

    /// Remove an empty directory. A refusal is reported, not raised.
    pub fn remove_directory(&mut self, id: u64) -> Result<FolderRemoval> {
        let path = self.header.map.determine_directory_path(id);
        let outcome = self.header.safe_remove_folder(id);
        match &outcome {
            FolderRemoval::Removed if id != ROOT_DIR => {
                self.persist()?;
                self.log.info(format!("Removed directory {}", path));
            }
            FolderRemoval::Removed => {}
            FolderRemoval::Refused(reason) => self.log.warn(reason),
        }
        Ok(outcome)
    }

    pub fn directory_path(&self, id: u64) -> String {
        self.header.map.determine_directory_path(id)
    }

    /// Resolve `/a/b/c` to a directory id.
    pub fn resolve_dir_path(&self, path: &str) -> Result<u64> {
        let segments = DirSegments::parse(path)?;
        let (valid, level) = self
            .header
            .map
            .determine_if_dir_path_is_valid(segments.segments(), ROOT_DIR);
        if valid {
            Ok(level)
        } else {
            Err(Error::NotFound(format!(
                "Directory {} does not exist; deepest match is {}",
                segments,
                self.header.map.determine_directory_path(level)
            )))
        }
    }

    /// Subdirectories and files directly inside `id`.
    pub fn list_directory(&self, id: u64) -> Result<(Vec<&DirectoryRecord>, Vec<&FileRecord>)> {
        if id != ROOT_DIR {
            self.header.directory(id)?;
        }
        let dirs = self.header.map.subdirectories(id).collect();
        let files = self.header.map.files_in(id).collect();
        Ok((dirs, files))
    }

    // ----- Password -----

    /// Re-key the container.
    ///
    /// Every encrypted payload, icon and note is resealed under the new
    /// password. If any item fails or the context is cancelled, the items
    /// already resealed are turned back to the old password before the
    /// error is returned.
    ///
    /// # Errors
    /// - Empty password
    /// - `RolledBack` naming the failure and the outcome of the revert
    pub fn change_password(&mut self, new_password: &[u8], ctx: &TaskContext) -> Result<()> {
        if new_password.is_empty() {
            return Err(Error::InvalidInput("Password cannot be empty".to_string()));
        }
        let old = SensitiveBytes::new(self.password.as_bytes().to_vec());
        let new = SensitiveBytes::new(new_password.to_vec());

        let mut slots: Vec<Slot> = Vec::new();
        for file in self.header.map.files.values() {
            if file.file_encrypted {
                slots.push(Slot::Payload(file.id));
            }
        }
        for file in self.header.map.files.values() {
            if file.icon_range().is_some() {
                slots.push(Slot::Icon(file.id));
            }
        }
        slots.extend(self.header.map.notes.keys().map(|&id| Slot::Note(id)));

        let mut done = Vec::with_capacity(slots.len());
        for slot in slots {
            let rekeyed = relocate(
                &mut self.store,
                &mut self.header.map,
                &self.codec,
                slot,
                Transcode::Reseal {
                    from: old.as_bytes(),
                    to: new.as_bytes(),
                },
                ctx,
            );
            if let Err(cause) = rekeyed {
                let rollback = self.revert_rekey(&done, &old, &new);
                self.persist()?;
                self.log.error(format!(
                    "Password change failed: {}; rollback: {}",
                    cause, rollback
                ));
                return Err(Error::rolled_back(cause, rollback));
            }
            done.push(slot);
        }

        self.password = new;
        self.persist()?;
        self.log
            .info(format!("Password changed; {} item(s) re-keyed", done.len()));
        Ok(())
    }

    /// Reseal `done` back to the old password, newest first.
    fn revert_rekey(&mut self, done: &[Slot], old: &SensitiveBytes, new: &SensitiveBytes) -> String {
        let detached = TaskContext::detached();
        let mut failed = Vec::new();
        for &slot in done.iter().rev() {
            let reverted = relocate(
                &mut self.store,
                &mut self.header.map,
                &self.codec,
                slot,
                Transcode::Reseal {
                    from: new.as_bytes(),
                    to: old.as_bytes(),
                },
                &detached,
            );
            if let Err(e) = reverted {
                failed.push(format!("{:?}: {}", slot, e));
            }
        }
        if failed.is_empty() {
            format!("{} item(s) reverted to the old password", done.len())
        } else {
            format!("reverting failed for {}", failed.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::store::MemoryStore;
    use tokio_util::sync::CancellationToken;

    const PW: &[u8] = b"hunter2";

    fn new_container() -> Container<MemoryStore> {
        Container::create(MemoryStore::new(), "vault", "cap", PW, test_config()).unwrap()
    }

    fn data(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn add(c: &mut Container<MemoryStore>, name: &str, bytes: &[u8], encrypted: bool) -> u64 {
        c.add_file(
            bytes,
            bytes.len() as u64,
            NewFile::from_file_name(name).encrypted(encrypted),
            &TaskContext::detached(),
        )
        .unwrap()
    }

    fn reopen(c: Container<MemoryStore>, password: &[u8]) -> Result<Container<MemoryStore>> {
        let store = c.close().unwrap();
        Container::open(store, password, test_config())
    }

    #[test]
    fn test_create_close_open() {
        let mut c = new_container();
        let dir = c.create_directory("docs", ROOT_DIR).unwrap();
        let payload = data(1000, 1);
        let id = c
            .add_file(
                &payload[..],
                1000,
                NewFile::new("report", "pdf").in_directory(dir).with_icon(vec![9u8; 40]),
                &TaskContext::detached(),
            )
            .unwrap();
        let note = c.add_note(id, "txt", b"remember this").unwrap();
        let session = c.session_log().session_id().to_string();

        let mut c = reopen(c, PW).unwrap();
        assert_eq!(c.read_file(id).unwrap(), payload);
        assert_eq!(c.read_icon(id).unwrap(), Some(vec![9u8; 40]));
        assert_eq!(c.read_note(note).unwrap(), b"remember this");
        assert_eq!(c.directory_path(dir), "/docs");
        assert_eq!(c.header().vault.amount_of_files, 2);
        assert!(c.session_log().session_log().contains(&session));
        assert_eq!(
            c.header().to_bytes().unwrap().len() as u64,
            c.header().vault.header_size
        );
    }

    #[test]
    fn test_wrong_password_is_recoverable() {
        let c = new_container();
        let err = reopen(c, b"not it").err().unwrap();
        assert!(matches!(err, Error::DecryptionFailure(_)), "{:?}", err);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_header_decrypting_to_junk_is_a_decryption_failure() {
        // What a wrong key produces when the padding happens to check out.
        let codec = test_config().codec();
        let blob = codec.encrypt(b"\xff\xfe\x00 not json", PW).unwrap();
        let mut store = MemoryStore::new();
        let region_len = blob.len() as u64 + MARKER_LEN * 3 + 64;
        layout::write_header_region(&mut store, &blob, region_len).unwrap();

        let err = Container::open(store, PW, test_config()).err().unwrap();
        assert!(matches!(err, Error::DecryptionFailure(_)), "{:?}", err);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_create_refuses_non_empty_store() {
        let store = MemoryStore::from_bytes(vec![1, 2, 3]);
        assert!(Container::create(store, "v", "cap", PW, test_config()).is_err());
    }

    #[test]
    fn test_unencrypted_payload_is_stored_verbatim() {
        let mut c = new_container();
        let id = add(&mut c, "plain.txt", b"visible text", false);
        let (s, e) = c.header().file(id).unwrap().range();
        assert_eq!(&c.store().as_bytes()[s as usize..e as usize], b"visible text");
        assert_eq!(c.read_file(id).unwrap(), b"visible text");
    }

    #[test]
    fn test_delete_middle_file_rebases_later_records() {
        let mut c = new_container();
        let a = add(&mut c, "a.bin", &data(300, 1), true);
        let b = add(&mut c, "b.bin", &data(500, 2), true);
        let d = add(&mut c, "d.bin", &data(200, 3), false);
        let note = c.add_note(d, "txt", b"note on d").unwrap();
        let before = c.store().as_bytes().len() as u64;
        let b_len = c.header().file(b).unwrap().stored_len();

        c.delete_file(b).unwrap();
        assert_eq!(c.store().as_bytes().len() as u64, before - b_len);
        assert!(c.header().file(b).is_err());
        assert_eq!(c.read_file(a).unwrap(), data(300, 1));
        assert_eq!(c.read_file(d).unwrap(), data(200, 3));
        assert_eq!(c.read_note(note).unwrap(), b"note on d");
        c.header().check_integrity().unwrap();

        // The released id is reused.
        assert_eq!(add(&mut c, "e.bin", b"e", true), b);
    }

    #[test]
    fn test_delete_file_drops_note_and_icon() {
        let mut c = new_container();
        let id = c
            .add_file(
                &b"body"[..],
                4,
                NewFile::new("x", "").with_icon(vec![1u8; 20]),
                &TaskContext::detached(),
            )
            .unwrap();
        c.add_note(id, "txt", b"n").unwrap();
        let start = c.payload_start();

        c.delete_file(id).unwrap();
        assert_eq!(c.store().as_bytes().len() as u64, start);
        assert_eq!(c.header().vault.amount_of_files, 0);
        assert!(c.header().map.note_ids.is_empty());
    }

    #[test]
    fn test_toggle_encryption() {
        let mut c = new_container();
        let first = add(&mut c, "first.txt", &data(130, 5), true);
        let other = add(&mut c, "other.txt", &data(70, 6), true);
        let ctx = TaskContext::detached();

        c.set_file_encryption(first, false, &ctx).unwrap();
        let rec = c.header().file(first).unwrap();
        assert!(!rec.file_encrypted);
        assert_eq!(rec.stored_len(), 130);
        assert_eq!(c.read_file(first).unwrap(), data(130, 5));
        assert_eq!(c.read_file(other).unwrap(), data(70, 6));

        c.set_file_encryption(first, true, &ctx).unwrap();
        assert!(c.header().file(first).unwrap().file_encrypted);
        assert_eq!(c.read_file(first).unwrap(), data(130, 5));
        c.header().check_integrity().unwrap();
    }

    #[test]
    fn test_change_password() {
        let mut c = new_container();
        let id = c
            .add_file(
                &data(400, 7)[..],
                400,
                NewFile::new("secret", "bin").with_icon(vec![4u8; 30]),
                &TaskContext::detached(),
            )
            .unwrap();
        let plain = add(&mut c, "open.txt", b"not encrypted", false);
        let note = c.add_note(plain, "txt", b"note").unwrap();

        c.change_password(b"new password", &TaskContext::detached())
            .unwrap();
        assert_eq!(c.read_file(id).unwrap(), data(400, 7));
        assert_eq!(c.read_note(note).unwrap(), b"note");

        let store = c.close().unwrap();
        assert!(Container::open(store.clone(), PW, test_config()).is_err());
        let mut c = Container::open(store, b"new password", test_config()).unwrap();
        assert_eq!(c.read_icon(id).unwrap(), Some(vec![4u8; 30]));
        assert_eq!(c.read_file(plain).unwrap(), b"not encrypted");
    }

    #[test]
    fn test_change_password_cancelled_keeps_old_password() {
        let mut c = new_container();
        let id = add(&mut c, "a.bin", &data(200, 8), true);
        let token = CancellationToken::new();
        token.cancel();

        let err = c
            .change_password(b"other", &TaskContext::new(token))
            .unwrap_err();
        assert!(
            matches!(err, Error::RolledBack { ref cause, .. } if matches!(**cause, Error::Cancelled)),
            "{:?}",
            err
        );
        assert_eq!(c.read_file(id).unwrap(), data(200, 8));
        assert!(reopen(c, PW).is_ok());
    }

    #[test]
    fn test_change_password_failure_reverts_done_items() {
        let mut c = new_container();
        let a = add(&mut c, "a.bin", &data(200, 1), true);
        let b = add(&mut c, "b.bin", &data(200, 2), true);

        // Garble one byte in the first ciphertext block of `b`: padding stays
        // valid but the plaintext checksum no longer matches.
        let (s, _) = c.header().file(b).unwrap().range();
        store::write_at(&mut c.store, s + 40, &[0xFF]).unwrap();

        let err = c
            .change_password(b"other", &TaskContext::detached())
            .unwrap_err();
        assert!(err.to_string().contains("1 item(s) reverted"), "{}", err);
        assert_eq!(c.read_file(a).unwrap(), data(200, 1));
        c.header().check_integrity().unwrap();
    }

    #[test]
    fn test_short_reader_rolls_back() {
        let mut c = new_container();
        let before = c.store().as_bytes().len();
        let err = c
            .add_file(&b"short"[..], 50, NewFile::new("x", ""), &TaskContext::detached())
            .unwrap_err();
        match err {
            Error::RolledBack { cause, rollback } => {
                assert!(matches!(*cause, Error::SizeMismatch { .. }), "{}", cause);
                assert!(rollback.contains("trimmed back"), "{}", rollback);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(c.store().as_bytes().len(), before);
        assert!(c.header().map.file_ids.is_empty());
        assert!(!c.session_log().error_log().is_empty());
    }

    fn failing_container() -> Container<store::FailingStore> {
        let store = store::FailingStore::wrap(MemoryStore::new());
        Container::create(store, "vault", "cap", PW, test_config()).unwrap()
    }

    fn reopen_failing(c: Container<store::FailingStore>) -> Container<MemoryStore> {
        let store = c.close().unwrap().into_inner();
        Container::open(store, PW, test_config()).unwrap()
    }

    #[test]
    fn test_header_write_failure_drops_added_file() {
        let mut c = failing_container();
        let before = c.store().as_bytes().to_vec();
        c.store.fail_writes_at(Some(0));

        let err = c
            .add_file(&b"payload"[..], 7, NewFile::new("lost", "txt"), &TaskContext::detached())
            .unwrap_err();
        match &err {
            Error::RolledBack { cause, rollback } => {
                assert!(matches!(**cause, Error::Io(_)), "{}", cause);
                assert!(rollback.contains("trimmed back"), "{}", rollback);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(c.header().map.files.is_empty());
        assert!(c.header().map.file_ids.is_empty());
        assert_eq!(c.store().as_bytes().to_vec(), before);

        c.store.fail_writes_at(None);
        let c = reopen_failing(c);
        assert!(c.header().map.files.is_empty());
        assert_eq!(c.header().vault.amount_of_files, 0);
    }

    #[test]
    fn test_header_write_failure_drops_added_note() {
        let mut c = failing_container();
        let id = c
            .add_file(&b"owner"[..], 5, NewFile::new("owner", "txt"), &TaskContext::detached())
            .unwrap();
        let before = c.store().as_bytes().to_vec();
        c.store.fail_writes_at(Some(0));

        let err = c.add_note(id, "txt", b"never saved").unwrap_err();
        assert!(matches!(err, Error::RolledBack { .. }), "{:?}", err);
        assert!(c.header().map.notes.is_empty());
        assert_eq!(c.header().file(id).unwrap().note(), None);
        assert_eq!(c.store().as_bytes().to_vec(), before);

        c.store.fail_writes_at(None);
        let mut c = reopen_failing(c);
        assert!(c.header().map.notes.is_empty());
        assert_eq!(c.read_file(id).unwrap(), b"owner");
    }

    #[test]
    fn test_path_names_refused_on_add_and_rename() {
        let mut c = new_container();
        for (name, ext) in [("../escaped", "txt"), ("/abs", "txt"), ("a\\b", ""), ("x", "t/xt")] {
            let err = c
                .add_file(&b"z"[..], 1, NewFile::new(name, ext), &TaskContext::detached())
                .unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)), "{:?}", err);
        }
        assert!(c.header().map.file_ids.is_empty());

        let id = add(&mut c, "fine.txt", b"ok", true);
        assert!(matches!(c.rename_file(id, "a/b"), Err(Error::InvalidInput(_))));
        assert_eq!(c.header().file(id).unwrap().display_name(), "fine.txt");
    }

    #[test]
    fn test_extract_refuses_stored_path_name() {
        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("out");
        std::fs::create_dir(&dest).unwrap();
        let mut c = new_container();
        let id = add(&mut c, "inside.txt", b"secret", true);
        c.header.file_mut(id).unwrap().metadata.name = "../escaped".to_string();

        let err = c.extract_file(id, &dest, &TaskContext::detached()).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)), "{:?}", err);
        assert!(!root.path().join("escaped.txt").exists());
        assert_eq!(std::fs::read_dir(&dest).unwrap().count(), 0);

        c.header.file_mut(id).unwrap().metadata.name = "/tmp/escaped".to_string();
        assert!(c.extract_file(id, &dest, &TaskContext::detached()).is_err());
        assert_eq!(std::fs::read_dir(&dest).unwrap().count(), 0);
    }

    #[test]
    fn test_header_growth_keeps_payloads_readable() {
        let mut c = new_container();
        let id = add(&mut c, "early.bin", &data(100, 9), true);
        let start_before = c.header().file(id).unwrap().loc_start;
        for i in 0..40 {
            c.create_directory(&format!("directory-number-{}", i), ROOT_DIR)
                .unwrap();
        }
        assert!(c.header().file(id).unwrap().loc_start > start_before);
        assert_eq!(c.read_file(id).unwrap(), data(100, 9));
        assert!(c
            .session_log()
            .session_log()
            .contains("Header region grown"));

        let mut c = reopen(c, PW).unwrap();
        assert_eq!(c.read_file(id).unwrap(), data(100, 9));
    }

    #[test]
    fn test_notes() {
        let mut c = new_container();
        let id = add(&mut c, "f.txt", b"file", true);
        let too_big = vec![0u8; (c.config().max_note_size + 1) as usize];
        assert!(c.add_note(id, "txt", &too_big).is_err());
        assert!(c.add_note(99, "txt", b"x").is_err());

        let note = c.add_note(id, "txt", b"first").unwrap();
        assert!(c.add_note(id, "txt", b"second").is_err());
        assert!(c.header().map.note_ids == vec![note]);

        c.delete_note(note).unwrap();
        assert_eq!(c.header().file(id).unwrap().note(), None);
        assert_eq!(c.read_file(id).unwrap(), b"file");
    }

    #[test]
    fn test_directories() {
        let mut c = new_container();
        let a = c.create_directory("splendid", ROOT_DIR).unwrap();
        let b = c.create_directory("to", a).unwrap();
        let d = c.create_directory("somewhere", b).unwrap();
        assert!(c.create_directory("to", a).is_err());
        assert!(c.create_directory("bad/name", a).is_err());

        assert_eq!(c.resolve_dir_path("/splendid/to/somewhere").unwrap(), d);
        assert_eq!(c.resolve_dir_path("/").unwrap(), ROOT_DIR);
        assert!(matches!(
            c.resolve_dir_path("/splendid/nope"),
            Err(Error::NotFound(_))
        ));

        let id = c
            .add_file(&b"x"[..], 1, NewFile::new("x", "").in_directory(d), &TaskContext::detached())
            .unwrap();
        assert!(!c.remove_directory(d).unwrap().removed());
        let (dirs, files) = c.list_directory(d).unwrap();
        assert!(dirs.is_empty());
        assert_eq!(files.len(), 1);

        c.move_file(id, ROOT_DIR).unwrap();
        assert!(c.remove_directory(d).unwrap().removed());
        assert!(c.remove_directory(ROOT_DIR).unwrap().removed());
    }

    #[test]
    fn test_open_without_footer() {
        let mut c = new_container();
        let id = add(&mut c, "a.txt", b"abc", true);
        c.persist().unwrap();
        let crashed = c.store().clone();

        let mut c = Container::open(crashed, PW, test_config()).unwrap();
        assert!(c.session_log().session_log().contains("No footer found"));
        assert_eq!(c.read_file(id).unwrap(), b"abc");
    }

    #[test]
    fn test_open_rejects_out_of_range_offsets() {
        let mut c = new_container();
        let id = add(&mut c, "a.txt", b"abc", true);
        c.header.file_mut(id).unwrap().loc_end += 10_000;
        c.persist().unwrap();
        let store = c.store().clone();
        assert!(matches!(
            Container::open(store, PW, test_config()),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn test_file_backed_extract() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("photo.jpg");
        let payload = data(5000, 4);
        std::fs::write(&source, &payload).unwrap();

        let file = tempfile::tempfile().unwrap();
        let mut c = Container::create(file, "disk", "cap", PW, test_config()).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = TaskContext::detached().with_progress(tx);
        let id = c.import_file(&source, ROOT_DIR, &ctx).unwrap();
        assert_eq!(c.header().file(id).unwrap().display_name(), "photo.jpg");
        let mut reported = 0;
        while let Ok(n) = rx.try_recv() {
            reported += n;
        }
        assert_eq!(reported, 5000);

        let file = c.close().unwrap();
        let mut c = Container::open(file, PW, test_config()).unwrap();
        let out_dir = dir.path().join("out");
        std::fs::create_dir(&out_dir).unwrap();
        let written = c.extract_file(id, &out_dir, &TaskContext::detached()).unwrap();
        assert_eq!(written, out_dir.join("photo.jpg"));
        assert_eq!(std::fs::read(&written).unwrap(), payload);
    }

    #[test]
    fn test_extract_failure_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = new_container();
        let id = add(&mut c, "big.bin", &data(1000, 2), true);
        let token = CancellationToken::new();
        token.cancel();
        let target = dir.path().join("big.out");
        assert!(c.extract_file(id, &target, &TaskContext::new(token)).is_err());
        assert!(!target.exists());
    }

    #[test]
    fn test_new_file_name_splitting() {
        let f = NewFile::from_file_name("archive.tar.gz");
        assert_eq!((f.name.as_str(), f.extension.as_str()), ("archive.tar", "gz"));
        let f = NewFile::from_file_name(".bashrc");
        assert_eq!((f.name.as_str(), f.extension.as_str()), (".bashrc", ""));
        assert_eq!(NewFile::new("a", ".txt").extension, "txt");
    }
}
